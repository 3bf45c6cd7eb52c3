//! Session store: the single owner of mutable session state
//!
//! The store is a plain struct owned by the coordinator task, not a
//! module-level singleton, so tests can construct as many as they like
//! without cross-test leakage. All mutation goes through [`apply`].
//!
//! The generation counter tags in-flight playback attempts: a new PLAY
//! bumps it, and results that come back carrying an older generation are
//! discarded instead of applied (supersession).

use encore_common::model::Session;
use encore_common::protocol::TransportAction;

use super::reducer::reduce;

/// Exclusive owner of the authoritative [`Session`].
#[derive(Debug)]
pub struct SessionStore {
    session: Session,
    generation: u64,
}

impl SessionStore {
    pub fn new(initial: Session) -> Self {
        Self {
            session: initial,
            generation: 0,
        }
    }

    /// Current session (read projection).
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run one action through the reducer, synchronously and to completion.
    pub fn apply(&mut self, action: &TransportAction) -> &Session {
        self.session = reduce(self.session.clone(), action);
        &self.session
    }

    /// Start a new playback attempt: bump and return the generation that
    /// the attempt's eventual result must match to be applied.
    pub fn begin_play(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Generation of the most recent playback attempt.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Session::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_common::model::Track;

    #[test]
    fn apply_runs_reducer() {
        let mut store = SessionStore::default();
        store.apply(&TransportAction::Play(Track::new("a", "A")));
        assert!(store.session().is_playing);
    }

    #[test]
    fn generations_are_monotonic() {
        let mut store = SessionStore::default();
        let g1 = store.begin_play();
        let g2 = store.begin_play();
        assert!(g2 > g1);
        assert_eq!(store.generation(), g2);
        // A stale attempt's generation no longer matches
        assert_ne!(g1, store.generation());
    }
}
