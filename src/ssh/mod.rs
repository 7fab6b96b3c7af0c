//! Git over SSH.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Server configuration with environment variable helpers
//! - `error`: Error taxonomy
//! - `types`: Identity, session snapshot and lifecycle types
//! - `auth`: Pluggable public-key lookups
//! - `host_key`: Host key persistence
//! - `command`: Exec command grammar and repository path resolution
//! - `input`: Non-blocking client-to-stdin queue with a byte budget
//! - `bridge`: Streams a channel to and from a git subprocess
//! - `handler`: Per-connection russh handler
//! - `registry`: In-flight session registry
//! - `server`: Listener and lifecycle

pub mod auth;
pub mod bridge;
pub mod command;
pub mod config;
pub mod error;
pub mod handler;
pub mod host_key;
pub mod input;
pub mod registry;
pub mod server;
pub mod types;

pub use auth::{AuthorizedKeys, LookupChain, LookupError, PublicKeyLookup};
pub use bridge::BridgeOutcome;
pub use command::GitCommand;
pub use config::Config;
pub use error::{Error, Result};
pub use host_key::HostKey;
pub use server::GitSshServer;
pub use types::{Identity, ServerState, SessionInfo};
