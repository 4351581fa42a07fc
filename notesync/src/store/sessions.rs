//! In-memory session list for one notebook.

use std::collections::HashSet;

use crate::models::{Session, Source, Timestamp};

/// Outcome of offering a snapshot to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Inserted,
    Replaced,
    /// The held copy is newer; the offered snapshot was dropped.
    Stale,
}

/// Result of merging a remote session list into the store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Sessions taken from the remote list.
    pub adopted: Vec<String>,
    /// Sessions whose local copy won and should be pushed back.
    pub kept_local: Vec<String>,
}

/// Session snapshots of the open notebook.
#[derive(Debug, Default, Clone)]
pub struct SessionStore {
    sessions: Vec<Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list, keeping the newest copy of any duplicated id.
    pub fn from_sessions(sessions: Vec<Session>) -> Self {
        let mut store = Self::new();
        for session in sessions {
            store.accept(session);
        }
        store
    }

    pub fn list(&self) -> &[Session] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.get(session_id).is_some()
    }

    fn position(&self, session_id: &str) -> Option<usize> {
        self.sessions.iter().position(|s| s.session_id == session_id)
    }

    /// Insert or replace a session by id. Other sessions are untouched.
    pub fn upsert(&mut self, session: Session) -> Accept {
        match self.position(&session.session_id) {
            Some(idx) => {
                self.sessions[idx] = session;
                Accept::Replaced
            }
            None => {
                self.sessions.push(session);
                self.sort();
                Accept::Inserted
            }
        }
    }

    /// Like [`upsert`](Self::upsert) but never replaces a newer held copy.
    pub fn accept(&mut self, session: Session) -> Accept {
        if let Some(held) = self.get(&session.session_id) {
            if held.updated_at > session.updated_at {
                return Accept::Stale;
            }
        }
        self.upsert(session)
    }

    /// Mutate one session and bump its `updated_at`.
    pub fn update<R>(
        &mut self,
        session_id: &str,
        now: Timestamp,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let idx = self.position(session_id)?;
        let session = &mut self.sessions[idx];
        let out = f(session);
        session.touch(now);
        Some(out)
    }

    /// The session with the greatest `updated_at`.
    pub fn latest(&self) -> Option<&Session> {
        self.sessions.iter().max_by_key(|s| s.updated_at)
    }

    /// Flip one source's selection inside its owning session.
    pub fn toggle_source(
        &mut self,
        session_id: &str,
        source_id: &str,
        now: Timestamp,
    ) -> Option<bool> {
        let idx = self.position(session_id)?;
        let session = &mut self.sessions[idx];
        let selected = session.toggle_source(source_id)?;
        session.touch(now);
        Some(selected)
    }

    /// Read-only view of every session's sources, deduplicated by id.
    pub fn all_sources(&self) -> Vec<&Source> {
        let mut seen = HashSet::new();
        self.sessions
            .iter()
            .flat_map(|s| s.sources.iter())
            .filter(|src| seen.insert(src.id.as_str()))
            .collect()
    }

    /// Merge a freshly fetched remote list.
    ///
    /// A strictly newer local copy wins, ties go to the remote copy, and the
    /// `live` session (the one being edited) always keeps its local state.
    /// Sessions only known locally are kept and reported for pushing.
    pub fn merge_remote(&mut self, remote: Vec<Session>, live: Option<&str>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut remote_ids = HashSet::new();

        for incoming in remote {
            if !remote_ids.insert(incoming.session_id.clone()) {
                continue;
            }
            let id = incoming.session_id.clone();
            match self.position(&id) {
                Some(idx) => {
                    let local = &self.sessions[idx];
                    let protect = live == Some(id.as_str());
                    if protect || local.updated_at > incoming.updated_at {
                        if local != &incoming {
                            outcome.kept_local.push(id);
                        }
                    } else {
                        self.sessions[idx] = incoming;
                        outcome.adopted.push(id);
                    }
                }
                None => {
                    self.sessions.push(incoming);
                    outcome.adopted.push(id);
                }
            }
        }

        for local in &self.sessions {
            if !remote_ids.contains(&local.session_id) {
                outcome.kept_local.push(local.session_id.clone());
            }
        }

        self.sort();
        outcome
    }

    fn sort(&mut self) {
        self.sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, SourceKind};

    fn session(id: &str, created: i64, updated: i64) -> Session {
        let mut s = Session::new(id, Timestamp::from_millis(created));
        s.updated_at = Timestamp::from_millis(updated);
        s
    }

    #[test]
    fn accept_is_monotonic() {
        let mut store = SessionStore::new();
        let mut v1 = session("a", 1, 10);
        v1.messages.push(ChatMessage::user("one"));
        let mut v2 = session("a", 1, 20);
        v2.messages.push(ChatMessage::user("two"));

        assert_eq!(store.accept(v1.clone()), Accept::Inserted);
        assert_eq!(store.accept(v2.clone()), Accept::Replaced);
        assert_eq!(store.accept(v1), Accept::Stale);
        assert_eq!(store.get("a"), Some(&v2));
    }

    #[test]
    fn increasing_persists_never_regress() {
        let mut store = SessionStore::new();
        let versions: Vec<_> = (1..=5).map(|i| session("a", 1, i * 100)).collect();
        // Echoes can arrive out of order.
        for idx in [0, 2, 1, 4, 3] {
            store.accept(versions[idx].clone());
            let held = store.get("a").unwrap().updated_at;
            assert!(held >= versions[idx].updated_at);
        }
        assert_eq!(store.get("a").unwrap().updated_at.as_millis(), 500);
    }

    #[test]
    fn latest_by_updated_at() {
        let store = SessionStore::from_sessions(vec![
            session("a", 1, 50),
            session("b", 2, 90),
            session("c", 3, 70),
        ]);
        assert_eq!(store.latest().unwrap().session_id, "b");
        let ids: Vec<_> = store.list().iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn toggling_is_isolated_per_session() {
        let mut a = session("a", 1, 1);
        a.sources.push(Source::new("shared-id", SourceKind::Web, "A"));
        let mut b = session("b", 2, 2);
        b.sources.push(Source::new("shared-id", SourceKind::Web, "B"));
        let mut store = SessionStore::from_sessions(vec![a, b]);

        let now = Timestamp::from_millis(1_000);
        assert_eq!(store.toggle_source("a", "shared-id", now), Some(false));
        assert!(!store.get("a").unwrap().sources[0].selected);
        assert!(store.get("b").unwrap().sources[0].selected);
        assert_eq!(store.get("b").unwrap().updated_at.as_millis(), 2);
    }

    #[test]
    fn merge_prefers_newer_and_ties_go_remote() {
        let mut store = SessionStore::from_sessions(vec![
            session("newer-local", 1, 200),
            session("tie", 2, 100),
            session("older-local", 3, 50),
            session("local-only", 4, 10),
        ]);
        let mut tie_remote = session("tie", 2, 100);
        tie_remote.title = Some("remote".into());

        let outcome = store.merge_remote(
            vec![
                session("newer-local", 1, 150),
                tie_remote,
                session("older-local", 3, 80),
                session("remote-only", 5, 5),
            ],
            None,
        );

        assert_eq!(store.get("newer-local").unwrap().updated_at.as_millis(), 200);
        assert_eq!(store.get("tie").unwrap().title.as_deref(), Some("remote"));
        assert_eq!(store.get("older-local").unwrap().updated_at.as_millis(), 80);
        assert!(store.contains("remote-only"));
        assert!(store.contains("local-only"));
        assert_eq!(outcome.kept_local, ["newer-local", "local-only"]);
        assert_eq!(outcome.adopted, ["tie", "older-local", "remote-only"]);
    }

    #[test]
    fn live_session_keeps_local_state() {
        let mut live = session("live", 1, 10);
        live.messages.push(ChatMessage::user("typing"));
        let mut store = SessionStore::from_sessions(vec![live.clone()]);

        store.merge_remote(vec![session("live", 1, 999)], Some("live"));
        assert_eq!(store.get("live"), Some(&live));
    }

    #[test]
    fn all_sources_dedups_by_id() {
        let mut a = session("a", 1, 1);
        a.sources.push(Source::new("x", SourceKind::Web, "X"));
        let mut b = session("b", 2, 2);
        b.sources.push(Source::new("x", SourceKind::Web, "X"));
        b.sources.push(Source::new("y", SourceKind::File, "Y"));
        let store = SessionStore::from_sessions(vec![a, b]);
        let ids: Vec<_> = store.all_sources().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["x", "y"]);
    }
}
