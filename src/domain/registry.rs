//! Session registry
//!
//! The authoritative set of remote participants currently in-call, at most
//! one [`PeerSession`] per [`ParticipantId`].

use super::session::PeerSession;
use super::shared::ParticipantId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ParticipantId, PeerSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning the one it replaced. The caller must
    /// close the returned session.
    pub fn insert(&mut self, session: PeerSession) -> Option<PeerSession> {
        self.sessions.insert(session.remote().clone(), session)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&PeerSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(id)
    }

    /// Session for `id` only if it belongs to `generation`
    pub fn get_generation_mut(
        &mut self,
        id: &ParticipantId,
        generation: u64,
    ) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(id)
            .filter(|s| s.generation() == generation)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<PeerSession> {
        self.sessions.remove(id)
    }

    /// Remove every session
    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    /// Participant ids, sorted for stable reporting
    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions still holding the local media bundle
    pub fn attached_media_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.attached_media().is_some())
            .count()
    }
}
