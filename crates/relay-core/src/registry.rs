//! Concurrent store of active sessions.
//!
//! The registry is the only structure shared between consumer workers, peer
//! event tasks and the broadcaster. Entries are `Arc<PeerSession>`; callers
//! clone the handle out and never hold a shard lock across an await.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::session::PeerSession;

/// `session_id -> PeerSession`
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<PeerSession>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session`, replacing and closing any session with the same id.
    ///
    /// Returns the replaced session.
    pub async fn put(&self, session: Arc<PeerSession>) -> Option<Arc<PeerSession>> {
        let previous = self
            .sessions
            .insert(session.session_id().to_string(), session.clone());

        if let Some(previous) = &previous {
            if !Arc::ptr_eq(previous, &session) {
                debug!(session = %session.session_id(), "Replacing existing session");
                previous.close().await;
            }
        }
        previous
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Remove the session with `session_id`, whatever it is.
    pub fn delete(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.remove(session_id).map(|(_, session)| session)
    }

    /// Remove `session` only if it is still the registered one for its id.
    pub fn delete_if_current(&self, session: &Arc<PeerSession>) -> bool {
        self.sessions
            .remove_if(session.session_id(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Snapshot of the sessions matching `predicate`.
    #[must_use]
    pub fn select(&self, predicate: impl Fn(&PeerSession) -> bool) -> Vec<Arc<PeerSession>> {
        self.sessions
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Call `f` for every session matching `predicate`.
    ///
    /// Runs over a snapshot, so `f` may touch the registry.
    pub fn for_each(
        &self,
        predicate: impl Fn(&PeerSession) -> bool,
        mut f: impl FnMut(&Arc<PeerSession>),
    ) {
        for session in self.select(predicate) {
            f(&session);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Distinct game ids with at least one session, sorted.
    #[must_use]
    pub fn game_ids(&self) -> Vec<String> {
        self.sessions
            .iter()
            .map(|entry| entry.value().game_id().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<PeerSession>> {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.delete(id)).collect()
    }
}
