//! Error taxonomy for the git SSH server.
//!
//! Errors fall into the classes the server treats differently:
//!
//! 1. **Configuration errors** (`InvalidRepoRoot`, `HostKey`): fatal at
//!    construction, the server never starts half-configured.
//! 2. **Listener errors** (`Bind`, `Accept`, `ServerClosed`, `AlreadyServing`):
//!    returned from `listen_and_serve`, never retried internally.
//! 3. **Channel errors** (`InvalidCommand`, `PathEscapesRoot`,
//!    `RepositoryNotFound`, `Spawn`, `InputOverflow`): local to one channel.
//!    They are written to the channel's stderr stream and the channel exits
//!    with a failure status. The connection stays up.
//!
//! Authentication failures never surface as an [`Error`]: a rejected key is an
//! ordinary `Auth::Reject` answer to the client, and the lookup's
//! [`LookupError`](super::auth::LookupError) only reaches the log.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the git SSH server.
#[derive(Debug, Error)]
pub enum Error {
    #[error("repository root {path:?} is not an existing directory")]
    InvalidRepoRoot { path: PathBuf },

    #[error("host key {path:?}: {message}")]
    HostKey { path: PathBuf, message: String },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("server closed")]
    ServerClosed,

    #[error("server is already serving")]
    AlreadyServing,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("repository path {0:?} escapes the repository root")]
    PathEscapesRoot(String),

    #[error("repository {0:?} not found")]
    RepositoryNotFound(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("client input exceeded {limit} bytes waiting for the process")]
    InputOverflow { limit: usize },

    #[error("channel closed by peer")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the error is confined to a single channel.
    ///
    /// Channel-local errors are reported to the client on the channel's stderr
    /// stream; everything else is a server-side fault.
    pub fn is_channel_local(&self) -> bool {
        matches!(
            self,
            Error::InvalidCommand(_)
                | Error::PathEscapesRoot(_)
                | Error::RepositoryNotFound(_)
                | Error::Spawn { .. }
                | Error::InputOverflow { .. }
        )
    }

    /// Line written to the channel's stderr stream when a request is refused.
    ///
    /// Server-side faults are not described to the client beyond a generic
    /// message, so filesystem details never leak over the wire.
    pub(crate) fn channel_message(&self) -> String {
        if self.is_channel_local() {
            format!("ERROR: {}\n", self)
        } else {
            "ERROR: internal server error\n".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classification {
        use super::*;

        #[test]
        fn test_grammar_errors_are_channel_local() {
            assert!(Error::InvalidCommand("ls".to_string()).is_channel_local());
            assert!(Error::PathEscapesRoot("../etc".to_string()).is_channel_local());
            assert!(Error::RepositoryNotFound("missing".to_string()).is_channel_local());
        }

        #[test]
        fn test_input_overflow_is_channel_local() {
            assert!(Error::InputOverflow { limit: 1024 }.is_channel_local());
        }

        #[test]
        fn test_spawn_failure_is_channel_local() {
            let err = Error::Spawn {
                program: "git".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            };
            assert!(err.is_channel_local());
        }

        #[test]
        fn test_listener_errors_are_not_channel_local() {
            assert!(!Error::ServerClosed.is_channel_local());
            assert!(!Error::AlreadyServing.is_channel_local());
            assert!(
                !Error::Accept(std::io::Error::from(std::io::ErrorKind::Other)).is_channel_local()
            );
        }

        #[test]
        fn test_configuration_errors_are_not_channel_local() {
            let err = Error::InvalidRepoRoot {
                path: PathBuf::from("/nope"),
            };
            assert!(!err.is_channel_local());
        }
    }

    mod channel_message {
        use super::*;

        #[test]
        fn test_channel_local_message_names_the_problem() {
            let msg = Error::PathEscapesRoot("../secret".to_string()).channel_message();
            assert!(msg.starts_with("ERROR: "));
            assert!(msg.contains("../secret"));
            assert!(msg.ends_with('\n'));
        }

        #[test]
        fn test_server_fault_message_is_generic() {
            let err = Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "/srv/private/thing",
            ));
            let msg = err.channel_message();
            assert_eq!(msg, "ERROR: internal server error\n");
            assert!(!msg.contains("/srv/private"));
        }
    }

    mod display {
        use super::*;

        #[test]
        fn test_bind_error_includes_address() {
            let err = Error::Bind {
                address: "127.0.0.1:2222".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            };
            assert!(err.to_string().contains("127.0.0.1:2222"));
        }

        #[test]
        fn test_server_closed() {
            assert_eq!(Error::ServerClosed.to_string(), "server closed");
        }
    }
}
