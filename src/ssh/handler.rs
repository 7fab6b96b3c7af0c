//! Per-connection SSH handler.
//!
//! One [`GitSessionHandler`] exists per accepted connection. It authenticates
//! offered keys through the configured lookup, then turns every exec request
//! into a bridged git process:
//!
//! 1. `channel_open_session` starts the channel clock and a cancel token
//!    derived from the connection's token
//! 2. `env_request` captures `GIT_PROTOCOL`
//! 3. `exec_request` parses and resolves the command, then spawns the bridge
//!    task on the server's task tracker
//! 4. `data` / `channel_eof` feed the child's stdin through a non-blocking
//!    queue; a channel that queues more than its budget is aborted rather
//!    than stalling the other channels of the connection
//! 5. `channel_close` cancels whatever is still running on the channel
//!
//! Rejected commands never reach a process: the channel gets an `ERROR:` line
//! on stderr, exit status 1, and is closed. The connection stays usable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use super::auth::{encode_public_key, fingerprint};
use super::bridge::{BridgeRequest, SshChannelSink, serve_channel};
use super::command::{ExecRequest, parse_exec_command, resolve_repo_path};
use super::config::Config;
use super::error::{Error, Result};
use super::input::{InputSender, input_queue};
use super::registry::SessionRegistry;
use super::types::Identity;

/// Environment variable git uses to negotiate protocol v2
const GIT_PROTOCOL_ENV: &str = "GIT_PROTOCOL";

/// State shared by every connection of one server instance.
pub(crate) struct ServerContext {
    pub config: Config,
    /// Canonical form of `config.dir`.
    pub root: PathBuf,
    pub registry: Arc<SessionRegistry>,
    pub tracker: TaskTracker,
}

struct ChannelState {
    opened_at: Instant,
    cancel: CancellationToken,
    git_protocol: Option<String>,
    stdin: Option<InputSender>,
    started: bool,
}

/// russh handler for one git-over-SSH connection.
pub struct GitSessionHandler {
    ctx: Arc<ServerContext>,
    session_id: String,
    peer: Option<SocketAddr>,
    cancel: CancellationToken,
    identity: Option<Identity>,
    /// Lookup verdicts by key fingerprint, so each key is looked up once.
    verdicts: HashMap<String, Option<Identity>>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl GitSessionHandler {
    pub(crate) fn new(
        ctx: Arc<ServerContext>,
        peer: Option<SocketAddr>,
        shutdown: &CancellationToken,
    ) -> Self {
        let session_id = ctx.registry.register(peer.map(|p| p.to_string()));
        debug!("Registered session {} for {:?}", session_id, peer);
        Self {
            ctx,
            session_id,
            peer,
            cancel: shutdown.child_token(),
            identity: None,
            verdicts: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Identity bound to the connection, once authenticated.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Run the configured lookup for `key`, caching the verdict.
    async fn verdict(&mut self, key: &PublicKey) -> Option<Identity> {
        let fp = fingerprint(key);
        if let Some(cached) = self.verdicts.get(&fp) {
            return cached.clone();
        }

        let encoded = encode_public_key(key);
        let lookup = Arc::clone(&self.ctx.config.public_key_lookup);

        let result = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                debug!("Lookup abandoned, server is shutting down");
                return None;
            }
            result = lookup.lookup(&encoded) => result,
        };

        let verdict = match result {
            Ok(mut identity) => {
                if identity.fingerprint.is_none() {
                    identity.fingerprint = Some(fp.clone());
                }
                Some(identity)
            }
            Err(e) => {
                info!(
                    "Public key {} rejected by {} lookup: {}",
                    fp,
                    lookup.name(),
                    e
                );
                None
            }
        };
        self.verdicts.insert(fp, verdict.clone());
        verdict
    }

    fn reject_channel(&mut self, channel: ChannelId, error: &Error, session: &mut Session) {
        warn!(
            "Rejecting request on channel {:?} of session {}: {}",
            channel, self.session_id, error
        );
        if let Some(state) = self.channels.get_mut(&channel) {
            state.started = true;
        }
        let _ = session.extended_data(
            channel,
            1,
            CryptoVec::from_slice(error.channel_message().as_bytes()),
        );
        let _ = session.exit_status_request(channel, 1);
        let _ = session.eof(channel);
        let _ = session.close(channel);
    }

    fn refuse_interactive(&mut self, channel: ChannelId, what: &str, session: &mut Session) {
        let _ = session.channel_success(channel);
        let error = Error::InvalidCommand(format!("{} is not supported", what));
        self.reject_channel(channel, &error, session);
    }
}

impl russh::server::Handler for GitSessionHandler {
    type Error = Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(
            "Public key {} offered by user '{}' from {:?}",
            fingerprint(public_key),
            user,
            self.peer
        );

        Ok(match self.verdict(public_key).await {
            Some(_) => Auth::Accept,
            None => reject(),
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Some(identity) = self.verdict(public_key).await else {
            return Ok(reject());
        };

        info!(
            "Session {} authenticated as '{}' (user '{}', key {})",
            self.session_id,
            identity.id,
            user,
            identity.fingerprint.as_deref().unwrap_or_default()
        );
        self.ctx.registry.set_identity(&self.session_id, &identity.id);
        self.identity = Some(identity);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        // The `Channel` is dropped here: russh would otherwise wait on its
        // bounded buffer inside the connection loop. Data arrives through
        // `Handler::data` instead.
        self.channels.insert(
            channel.id(),
            ChannelState {
                opened_at: Instant::now(),
                cancel: self.cancel.child_token(),
                git_protocol: None,
                stdin: None,
                started: false,
            },
        );
        self.ctx.registry.channel_opened(&self.session_id);
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name != GIT_PROTOCOL_ENV {
            debug!("Ignoring env request {} on {:?}", variable_name, channel);
            return Ok(());
        }
        if let Some(state) = self.channels.get_mut(&channel) {
            state.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);

        let prepared = prepare(&self.ctx.root, self.channels.get(&channel), data);
        let (request, repo_path) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.reject_channel(channel, &e, session);
                return Ok(());
            }
        };

        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };

        info!(
            "Session {} running {} on {}",
            self.session_id,
            request.command,
            repo_path.display()
        );

        let config = &self.ctx.config;
        let bridge_request = BridgeRequest {
            git_binary: config.git_binary.clone(),
            command: request.command,
            repo_path,
            git_protocol: state.git_protocol.clone(),
            latency: config.latency,
            deadline: config.timeout.map(|timeout| state.opened_at + timeout),
        };

        let (tx, rx) = input_queue(config.max_pending_input);
        state.stdin = Some(tx);
        state.started = true;

        let sink = SshChannelSink::new(session.handle(), channel);
        let cancel = state.cancel.clone();
        let span = info_span!("channel", session = %self.session_id, channel = ?channel);

        self.ctx.tracker.spawn(
            async move {
                serve_channel(bridge_request, rx, &sink, cancel).await;
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_interactive(channel, "interactive shell", session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse_interactive(channel, &format!("subsystem {}", name), session);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        let Some(tx) = state.stdin.as_ref() else {
            return Ok(());
        };

        // Never wait here: every channel of the connection shares this loop.
        match tx.push(data) {
            Ok(()) => {}
            Err(e @ Error::InputOverflow { .. }) => {
                warn!(
                    "Aborting channel {:?} of session {}: {}",
                    channel, self.session_id, e
                );
                state.stdin = None;
            }
            Err(e) => {
                debug!("Process on {:?} no longer reads stdin: {}", channel, e);
                state.stdin = None;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel);
        // Dropping the sender closes the child's stdin.
        if let Some(state) = self.channels.get_mut(&channel) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel);
        if let Some(state) = self.channels.remove(&channel) {
            state.cancel.cancel();
            self.ctx.registry.channel_closed(&self.session_id);
        }
        Ok(())
    }
}

impl Drop for GitSessionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.ctx.registry.remove(&self.session_id);
        debug!("Session {} ended", self.session_id);
    }
}

/// Parse and resolve an exec request for a channel that has not run anything
/// yet.
fn prepare(
    root: &Path,
    state: Option<&ChannelState>,
    data: &[u8],
) -> Result<(ExecRequest, PathBuf)> {
    match state {
        Some(state) if state.started => {
            return Err(Error::InvalidCommand(
                "channel already ran a command".to_string(),
            ));
        }
        Some(_) => {}
        None => return Err(Error::InvalidCommand("unknown channel".to_string())),
    }

    let request = parse_exec_command(data)?;
    let repo_path = resolve_repo_path(root, &request.path)?;
    Ok((request, repo_path))
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}
