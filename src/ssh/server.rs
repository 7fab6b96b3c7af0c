//! Connection listener and server lifecycle.
//!
//! ## Lifecycle
//!
//! 1. **Construction**: [`GitSshServer::new`] validates the repository root
//!    and loads (or creates) the host key. Either failure is fatal.
//! 2. **Serving**: [`GitSshServer::listen_and_serve`] binds, then accepts in
//!    a loop. Every connection runs on its own task; accepts never wait for a
//!    handshake.
//! 3. **Stopping**: [`GitSshServer::stop`] cancels the root token. The accept
//!    loop notices, every session gets a disconnect, every bridge kills its
//!    child, and `listen_and_serve` returns [`Error::ServerClosed`] once all
//!    tasks are done.
//!
//! A stopped server is never restarted; build a new instance instead.
//!
//! ## Cancellation tree
//!
//! ```text
//! server token
//! └── session token (one per connection, cancelled when the handler drops)
//!     └── channel token (one per channel, cancelled on channel close)
//! ```

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use russh::server::{self, run_stream};
use russh::{Disconnect, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::config::Config;
use super::error::{Error, Result};
use super::handler::{GitSessionHandler, ServerContext};
use super::host_key::HostKey;
use super::registry::SessionRegistry;
use super::types::{ServerState, SessionInfo};

/// How long a session may take to close after a shutdown disconnect (5 seconds)
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Delay before a rejected authentication attempt is answered (1 second)
const AUTH_REJECTION_TIME: Duration = Duration::from_secs(1);

/// Build the russh server configuration.
///
/// Only public-key authentication is offered. The first rejection is
/// answered immediately, later ones after [`AUTH_REJECTION_TIME`].
pub(crate) fn build_server_config(config: &Config, host_key: &HostKey) -> server::Config {
    server::Config {
        keys: vec![host_key.private_key().clone()],
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        auth_rejection_time: AUTH_REJECTION_TIME,
        auth_rejection_time_initial: Some(Duration::ZERO),
        max_auth_attempts: config.max_auth_attempts,
        inactivity_timeout: config.inactivity_timeout,
        ..Default::default()
    }
}

/// An embeddable git-over-SSH server.
///
/// # Example
///
/// ```ignore
/// let config = Config::new("/srv/git", "/srv/keys", |_: &str| {
///     Ok::<_, String>(Identity::new("12345"))
/// });
/// let server = Arc::new(GitSshServer::new(config)?);
///
/// let serving = Arc::clone(&server);
/// tokio::spawn(async move { serving.listen_and_serve("0.0.0.0:2222").await });
///
/// // later
/// server.shutdown().await;
/// ```
pub struct GitSshServer {
    ctx: Arc<ServerContext>,
    ssh_config: Arc<server::Config>,
    host_key: HostKey,
    state: AtomicU8,
    shutdown: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl GitSshServer {
    /// Create a server from `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRepoRoot`] if `config.dir` is not an existing directory
    /// - [`Error::HostKey`] if the host key cannot be loaded or created
    pub fn new(config: Config) -> Result<Self> {
        let root = config.canonical_dir()?;
        let host_key = HostKey::load_or_create(&config.key_dir)?;
        let ssh_config = Arc::new(build_server_config(&config, &host_key));

        info!(
            "Git SSH server configured for {} (host key {})",
            root.display(),
            host_key.fingerprint()
        );

        Ok(Self {
            ctx: Arc::new(ServerContext {
                config,
                root,
                registry: Arc::new(SessionRegistry::new()),
                tracker: TaskTracker::new(),
            }),
            ssh_config,
            host_key,
            state: AtomicU8::new(ServerState::Idle.as_u8()),
            shutdown: CancellationToken::new(),
            local_addr: OnceLock::new(),
        })
    }

    /// Bind `address` and serve until [`stop`](Self::stop) is called or the
    /// listener fails.
    ///
    /// # Returns
    ///
    /// * `Err(Error::ServerClosed)` - after `stop`, once every session and
    ///   subprocess has finished
    /// * `Err(Error::Bind)` - the address could not be bound
    /// * `Err(Error::Accept)` - the listener failed unexpectedly
    /// * `Err(Error::AlreadyServing)` - another call is already serving
    pub async fn listen_and_serve(&self, address: &str) -> Result<()> {
        self.begin_serving()?;

        let listener = match TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(source) => {
                error!("Failed to bind {}: {}", address, source);
                self.stop_serving();
                return Err(Error::Bind {
                    address: address.to_string(),
                    source,
                });
            }
        };

        self.accept_loop(listener).await
    }

    /// Serve on an already bound listener. Same contract as
    /// [`listen_and_serve`](Self::listen_and_serve).
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.begin_serving()?;
        self.accept_loop(listener).await
    }

    /// Stop accepting connections and terminate every session.
    ///
    /// Idempotent and safe to call from any thread, before, during or after
    /// serving. Returns immediately; use [`shutdown`](Self::shutdown) to wait
    /// for sessions and subprocesses to finish.
    pub fn stop(&self) -> Result<()> {
        let previous = self.state.swap(ServerState::Stopped.as_u8(), Ordering::SeqCst);
        if ServerState::from_u8(previous) != ServerState::Stopped {
            info!("Stopping git SSH server");
        }
        self.stop_serving();
        Ok(())
    }

    /// Stop and wait until every session task and bridge has finished.
    pub async fn shutdown(&self) {
        let _ = self.stop();
        self.ctx.tracker.wait().await;
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// SHA-256 fingerprint of the host key presented to clients.
    pub fn host_key_fingerprint(&self) -> &str {
        self.host_key.fingerprint()
    }

    /// Snapshot of in-flight connections.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.ctx.registry.list()
    }

    fn begin_serving(&self) -> Result<()> {
        match self.state.compare_exchange(
            ServerState::Idle.as_u8(),
            ServerState::Serving.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(current) if ServerState::from_u8(current) == ServerState::Serving => {
                Err(Error::AlreadyServing)
            }
            Err(_) => Err(Error::ServerClosed),
        }
    }

    fn stop_serving(&self) {
        self.state.store(ServerState::Stopped.as_u8(), Ordering::SeqCst);
        self.shutdown.cancel();
        self.ctx.tracker.close();
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
            info!("Git SSH server listening on {}", addr);
        }

        let result = loop {
            let accepted = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break Err(Error::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(e) if is_transient_accept_error(&e) => {
                    warn!("Transient accept error: {}", e);
                }
                Err(e) => {
                    error!("Listener failed: {}", e);
                    break Err(Error::Accept(e));
                }
            }
        };

        drop(listener);
        self.stop_serving();
        self.ctx.tracker.wait().await;
        info!("Git SSH server stopped");
        result
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let ctx = Arc::clone(&self.ctx);
        let ssh_config = Arc::clone(&self.ssh_config);
        let shutdown = self.shutdown.clone();
        let span = info_span!("connection", %peer);

        self.ctx.tracker.spawn(
            async move {
                debug!("Accepted connection");
                let handler = GitSessionHandler::new(ctx, Some(peer), &shutdown);

                let started = tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => return,
                    started = run_stream(ssh_config, stream, handler) => started,
                };
                let session = match started {
                    Ok(session) => session,
                    Err(e) => {
                        debug!("SSH session setup failed: {}", e);
                        return;
                    }
                };

                let handle = session.handle();
                tokio::pin!(session);

                tokio::select! {
                    result = &mut session => match result {
                        Ok(()) => debug!("Connection closed"),
                        Err(e) => debug!("Connection ended with error: {}", e),
                    },
                    _ = shutdown.cancelled() => {
                        let _ = handle
                            .disconnect(
                                Disconnect::ByApplication,
                                "server shutting down".to_string(),
                                "en".to_string(),
                            )
                            .await;
                        if tokio::time::timeout(SHUTDOWN_GRACE, &mut session).await.is_err() {
                            warn!("Session did not close within {:?}, dropping it", SHUTDOWN_GRACE);
                        }
                    }
                }
            }
            .instrument(span),
        );
    }
}

impl Drop for GitSshServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Accept errors that concern a single connection rather than the listener.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}
