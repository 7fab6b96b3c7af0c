//! In-flight session registry.
//!
//! Owned by one server instance (never global) so several servers in the same
//! process stay independent. Backed by `DashMap`, so handlers on different
//! connections update it without a shared lock.

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::types::SessionInfo;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection and return its session id.
    pub fn register(&self, peer: Option<String>) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            SessionInfo {
                session_id: session_id.clone(),
                peer,
                identity: None,
                connected_at: Utc::now().to_rfc3339(),
                active_channels: 0,
            },
        );
        session_id
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.remove(session_id).map(|(_, info)| info)
    }

    pub fn set_identity(&self, session_id: &str, identity: &str) {
        if let Some(mut info) = self.sessions.get_mut(session_id) {
            info.identity = Some(identity.to_string());
        }
    }

    pub fn channel_opened(&self, session_id: &str) {
        if let Some(mut info) = self.sessions.get_mut(session_id) {
            info.active_channels += 1;
        }
    }

    pub fn channel_closed(&self, session_id: &str) {
        if let Some(mut info) = self.sessions.get_mut(session_id) {
            info.active_channels = info.active_channels.saturating_sub(1);
        }
    }

    /// Snapshot of every registered session, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        sessions
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
