//! Value types shared by the authentication callback, the session handler and
//! the server's session registry.

use serde::{Deserialize, Serialize};

/// Identity bound to a connection after a successful public-key lookup.
///
/// Produced by the caller's [`PublicKeyLookup`](super::auth::PublicKeyLookup)
/// and consumed read-only by the session handler for logging and auditing.
#[doc(alias = "PublicKey")]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// SHA-256 fingerprint of the authenticated key. Filled in by the server
    /// when the lookup leaves it empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Snapshot of one in-flight SSH connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    /// Identity id once the connection has authenticated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Connection time (RFC3339 format)
    pub connected_at: String,
    /// Number of channels currently open on the connection
    pub active_channels: usize,
}

/// Lifecycle state of a server instance.
///
/// `Idle -> Serving -> Stopped`, or `Idle -> Stopped`. A stopped server never
/// serves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Idle,
    Serving,
    Stopped,
}

impl ServerState {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            ServerState::Idle => 0,
            ServerState::Serving => 1,
            ServerState::Stopped => 2,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Idle,
            1 => ServerState::Serving,
            _ => ServerState::Stopped,
        }
    }
}
