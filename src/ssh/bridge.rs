//! Process bridge between an SSH channel and a git subprocess.
//!
//! Each accepted channel gets one bridge task. The task waits out the
//! configured latency, spawns `git upload-pack|receive-pack <repo>`, and
//! shuttles bytes until the process exits:
//!
//! - client data arrives through the channel's [`InputReceiver`] and is
//!   written to the child's stdin in order; dropping the sender closes stdin
//! - stdout goes to the channel's data stream, stderr to its extended data
//!   stream, both in 32KB chunks as they are produced
//!
//! Cancellation, input overflow and the per-channel deadline are raced against
//! the work with a biased `select!`. Each one kills the child's whole process
//! group and waits for the child, so neither git nor the helpers it forks
//! (`pack-objects`, `index-pack`) outlive the channel.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::GitCommand;
use super::error::{Error, Result};
use super::input::InputReceiver;

/// Read buffer size for the child's output streams (32KB)
const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Extended data type code for stderr (RFC 4254 section 5.2)
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Destination for a bridged process's output.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Deliver a chunk of standard output.
    async fn stdout(&self, data: &[u8]) -> Result<()>;

    /// Deliver a chunk of standard error.
    async fn stderr(&self, data: &[u8]) -> Result<()>;

    /// Report the exit status and close the channel.
    async fn finish(&self, exit_status: u32) -> Result<()>;
}

/// [`ChannelSink`] writing to one channel of a live SSH connection.
pub struct SshChannelSink {
    handle: Handle,
    channel: ChannelId,
}

impl SshChannelSink {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait]
impl ChannelSink for SshChannelSink {
    async fn stdout(&self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    async fn stderr(&self, data: &[u8]) -> Result<()> {
        self.handle
            .extended_data(
                self.channel,
                SSH_EXTENDED_DATA_STDERR,
                CryptoVec::from_slice(data),
            )
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    async fn finish(&self, exit_status: u32) -> Result<()> {
        // RFC 4254: exit-status, then EOF, then close.
        let status = self
            .handle
            .exit_status_request(self.channel, exit_status)
            .await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
        status.map_err(|_| Error::ChannelClosed)
    }
}

/// How a bridged channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The process exited on its own with this status.
    Exited(u32),
    /// The channel deadline passed; the process (if any) was killed.
    TimedOut,
    /// The server is shutting down; the process (if any) was killed.
    Cancelled,
    /// The client queued more input than the process consumed; the process
    /// (if any) was killed.
    InputOverflow,
    /// The process could not be started.
    SpawnFailed(String),
}

impl BridgeOutcome {
    /// Exit status reported to the client.
    pub fn exit_status(&self) -> u32 {
        match self {
            BridgeOutcome::Exited(code) => *code,
            _ => 1,
        }
    }

    /// One-line diagnostic for the channel's stderr stream, if any.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            BridgeOutcome::Exited(_) => None,
            BridgeOutcome::TimedOut => Some("ERROR: operation timed out\n".to_string()),
            BridgeOutcome::Cancelled => Some("ERROR: server is shutting down\n".to_string()),
            BridgeOutcome::InputOverflow => {
                Some("ERROR: too much input queued, process stopped reading\n".to_string())
            }
            BridgeOutcome::SpawnFailed(message) => Some(format!("ERROR: {}\n", message)),
        }
    }
}

/// Everything needed to run one validated git command.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub git_binary: PathBuf,
    pub command: GitCommand,
    /// Canonical repository path, already checked against the root.
    pub repo_path: PathBuf,
    /// Value of the client's `GIT_PROTOCOL` env request.
    pub git_protocol: Option<String>,
    pub latency: Option<Duration>,
    /// Hard deadline measured from channel open.
    pub deadline: Option<Instant>,
}

impl BridgeRequest {
    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.git_binary);
        cmd.arg(self.command.subcommand()).arg(&self.repo_path);
        if let Some(ref protocol) = self.git_protocol {
            cmd.env("GIT_PROTOCOL", protocol);
        }
        cmd
    }
}

/// Run a channel's git command to completion and report the result on the
/// sink: a diagnostic line on stderr when it did not exit normally, then the
/// exit status.
pub async fn serve_channel(
    request: BridgeRequest,
    input: InputReceiver,
    sink: &dyn ChannelSink,
    cancel: CancellationToken,
) -> BridgeOutcome {
    let outcome = execute(&request, input, sink, &cancel).await;

    match &outcome {
        BridgeOutcome::Exited(code) => debug!(
            "{} {} exited with status {}",
            request.command,
            request.repo_path.display(),
            code
        ),
        other => info!(
            "{} {} did not complete: {:?}",
            request.command,
            request.repo_path.display(),
            other
        ),
    }

    if let Some(message) = outcome.diagnostic() {
        let _ = sink.stderr(message.as_bytes()).await;
    }
    if let Err(e) = sink.finish(outcome.exit_status()).await {
        debug!("Failed to report exit status: {}", e);
    }
    outcome
}

/// Apply latency, spawn the process and bridge it until it ends.
pub async fn execute(
    request: &BridgeRequest,
    input: InputReceiver,
    sink: &dyn ChannelSink,
    cancel: &CancellationToken,
) -> BridgeOutcome {
    let overflow = input.overflow_signal();
    if let Some(latency) = request.latency {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return BridgeOutcome::Cancelled,
            _ = overflow.cancelled() => return BridgeOutcome::InputOverflow,
            _ = sleep_until_deadline(request.deadline) => return BridgeOutcome::TimedOut,
            _ = tokio::time::sleep(latency) => {}
        }
    }

    if request.deadline.is_some_and(|d| Instant::now() >= d) {
        return BridgeOutcome::TimedOut;
    }
    if cancel.is_cancelled() {
        return BridgeOutcome::Cancelled;
    }
    if overflow.is_cancelled() {
        return BridgeOutcome::InputOverflow;
    }

    let bridge = match ProcessBridge::spawn(request.to_command()) {
        Ok(bridge) => bridge,
        Err(e) => {
            warn!("{}", e);
            return BridgeOutcome::SpawnFailed(e.to_string());
        }
    };

    bridge.run(input, sink, request.deadline, cancel).await
}

/// A spawned child with its standard streams captured.
pub struct ProcessBridge {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl ProcessBridge {
    /// Spawn `cmd` with piped standard streams. The child is killed if the
    /// bridge is dropped before it exits.
    ///
    /// On unix the child leads a new process group, so that terminating it
    /// also reaches every process it forked.
    pub fn spawn(mut cmd: Command) -> Result<Self> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        lead_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: program.clone(),
            source,
        })?;

        let missing = |stream: &str| Error::Spawn {
            program: program.clone(),
            source: std::io::Error::other(format!("{} was not captured", stream)),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        debug!("Spawned {} (pid {:?})", program, child.id());

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Bridge the process until it exits, the deadline passes, `cancel` fires
    /// or the input queue overflows. In all but the first case the process
    /// group is killed and the child reaped before returning.
    pub async fn run(
        self,
        input: InputReceiver,
        sink: &dyn ChannelSink,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> BridgeOutcome {
        let ProcessBridge {
            mut child,
            stdin,
            stdout,
            stderr,
        } = self;
        let overflow = input.overflow_signal();

        let stopped = {
            let work = async {
                let feed = feed_stdin(stdin, input);
                let drain = async {
                    futures::future::join(
                        pump(stdout, sink, OutputStream::Stdout),
                        pump(stderr, sink, OutputStream::Stderr),
                    )
                    .await;
                    child.wait().await
                };
                tokio::pin!(feed);
                tokio::pin!(drain);

                // Stdin may finish early (client EOF) or never (client keeps
                // the channel open); only the output side decides completion.
                let mut feeding = true;
                loop {
                    tokio::select! {
                        _ = &mut feed, if feeding => feeding = false,
                        status = &mut drain => break status,
                    }
                }
            };

            tokio::select! {
                biased;

                _ = cancel.cancelled() => Stopped::Cancelled,
                _ = overflow.cancelled() => Stopped::InputOverflow,
                _ = sleep_until_deadline(deadline) => Stopped::TimedOut,
                status = work => Stopped::Exited(status),
            }
        };

        match stopped {
            Stopped::Exited(Ok(status)) => BridgeOutcome::Exited(exit_code(status)),
            Stopped::Exited(Err(e)) => {
                warn!("Failed to wait for child process: {}", e);
                terminate(&mut child).await;
                BridgeOutcome::Exited(1)
            }
            Stopped::TimedOut => {
                warn!("Deadline passed, killing pid {:?}", child.id());
                terminate(&mut child).await;
                BridgeOutcome::TimedOut
            }
            Stopped::Cancelled => {
                debug!("Cancelled, killing pid {:?}", child.id());
                terminate(&mut child).await;
                BridgeOutcome::Cancelled
            }
            Stopped::InputOverflow => {
                warn!("Input overflow, killing pid {:?}", child.id());
                terminate(&mut child).await;
                BridgeOutcome::InputOverflow
            }
        }
    }
}

enum Stopped {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
    InputOverflow,
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

async fn feed_stdin(mut stdin: ChildStdin, mut input: InputReceiver) {
    while let Some(chunk) = input.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            debug!("Child stdin closed: {}", e);
            return;
        }
    }
    // Dropping stdin delivers EOF to the child.
}

/// Copy one output stream to the sink. After the first sink failure the
/// stream is still drained so the child never blocks on a full pipe.
async fn pump<R>(mut reader: R, sink: &dyn ChannelSink, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut sink_open = true;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Error reading child {:?}: {}", stream, e);
                break;
            }
        };

        if !sink_open {
            continue;
        }

        let delivered = match stream {
            OutputStream::Stdout => sink.stdout(&buf[..n]).await,
            OutputStream::Stderr => sink.stderr(&buf[..n]).await,
        };
        if let Err(e) = delivered {
            debug!("Discarding remaining child {:?}: {}", stream, e);
            sink_open = false;
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Kill the child's process group, then the child itself, and reap it.
async fn terminate(child: &mut Child) {
    kill_process_group(child);
    if let Err(e) = child.kill().await {
        warn!("Failed to kill child process: {}", e);
    }
}

#[cfg(unix)]
fn lead_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn lead_process_group(_cmd: &mut Command) {}

/// SIGKILL every process in the group the child leads.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("Failed to kill process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn exit_code(status: ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code as u32;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as u32;
        }
    }
    1
}
