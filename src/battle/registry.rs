//! Battle registry
//!
//! Owns every active [`BattleSession`] behind a single lock. Every mutation
//! holds the write lock for its full duration, so no caller ever sees a
//! half-applied update. Nothing here performs I/O.
//!
//! Transitions are computed on a snapshot and stored with
//! [`BattleRegistry::commit`], which refuses if the session moved on.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::session::{BattleSession, SessionOptions};
use crate::combat::Combatant;

/// Partial session update; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub current_turn: Option<Option<String>>,
    pub turn_order: Option<Vec<String>>,
    pub gm_id: Option<String>,
    pub round: Option<u32>,
}

impl SessionPatch {
    fn apply(self, session: &mut BattleSession) {
        if let Some(current_turn) = self.current_turn {
            session.current_turn = current_turn;
        }
        if let Some(turn_order) = self.turn_order {
            session.turn_order = turn_order;
        }
        if let Some(gm_id) = self.gm_id {
            session.gm_id = gm_id;
        }
        if let Some(round) = self.round {
            session.round = round;
        }
    }
}

/// Store of active battles
#[derive(Debug, Default)]
pub struct BattleRegistry {
    sessions: RwLock<HashMap<String, BattleSession>>,
}

impl BattleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared instance
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new battle and return its id.
    ///
    /// Callers check [`find_by_participant`](Self::find_by_participant)
    /// beforehand; membership in another session is not re-validated here.
    pub async fn create(
        &self,
        thread_id: &str,
        roster: Vec<Combatant>,
        turn_order: Vec<String>,
        options: SessionOptions,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let session = BattleSession::new(id.clone(), thread_id, roster, turn_order, options);
        info!(session_id = %id, thread = %thread_id, participants = ?session.participants, "Battle created");
        self.sessions.write().await.insert(id.clone(), session);
        id
    }

    /// Snapshot of a session
    pub async fn get(&self, session_id: &str) -> Option<BattleSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Session running in a chat thread
    pub async fn find_by_thread(&self, thread_id: &str) -> Option<BattleSession> {
        let sessions = self.sessions.read().await;
        sessions.values().find(|s| s.thread_id == thread_id).cloned()
    }

    /// Session a user is fighting in
    pub async fn find_by_participant(&self, user_id: &str) -> Option<BattleSession> {
        let sessions = self.sessions.read().await;
        sessions.values().find(|s| s.is_participant(user_id)).cloned()
    }

    /// Session a user administers
    pub async fn find_by_gm(&self, user_id: &str) -> Option<BattleSession> {
        let sessions = self.sessions.read().await;
        sessions.values().find(|s| s.gm_id == user_id).cloned()
    }

    /// Merge fields into a session. Returns false if it does not exist.
    pub async fn update(&self, session_id: &str, patch: SessionPatch) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                patch.apply(session);
                touch(session);
                true
            }
            None => false,
        }
    }

    /// Store a session computed from a snapshot at `expected_revision`.
    ///
    /// Fails (returns false) if the session is gone or anything was committed
    /// since the snapshot was taken. A resolved session is removed instead of
    /// stored.
    pub async fn commit(&self, mut session: BattleSession, expected_revision: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.id) {
            Some(current) if current.revision == expected_revision => {}
            _ => return false,
        }
        if session.is_resolved() {
            info!(session_id = %session.id, resolution = ?session.resolution, "Battle resolved");
            sessions.remove(&session.id);
        } else {
            session.revision = expected_revision;
            touch(&mut session);
            sessions.insert(session.id.clone(), session);
        }
        true
    }

    /// Remove a session
    pub async fn delete(&self, session_id: &str) -> Option<BattleSession> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            info!(session_id = %session_id, "Battle deleted");
        }
        removed
    }

    /// Remove sessions idle longer than `timeout`. Returns how many went.
    pub async fn sweep_stale(&self, timeout: Duration) -> usize {
        self.sweep_stale_at(Utc::now(), timeout).await
    }

    /// [`sweep_stale`](Self::sweep_stale) against an explicit clock
    pub async fn sweep_stale_at(&self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, s| {
            let keep = now - s.last_action <= timeout;
            if !keep {
                debug!(session_id = %id, "Sweeping stale battle");
            }
            keep
        });
        before - sessions.len()
    }

    /// Snapshots of all sessions
    pub async fn list(&self) -> Vec<BattleSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Number of active sessions
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn touch(session: &mut BattleSession) {
    session.last_action = Utc::now();
    session.revision += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::TurnModel;
    use crate::combat::BattleMode;

    fn roster(ids: &[&str]) -> (Vec<Combatant>, Vec<String>) {
        let roster = ids.iter().map(|id| Combatant::new(id, 10, 10, 5, 0, 100)).collect();
        (roster, ids.iter().map(|s| s.to_string()).collect())
    }

    fn options(gm: &str) -> SessionOptions {
        SessionOptions {
            gm_id: gm.to_string(),
            team_mode: false,
            turn_model: TurnModel::Sequential,
            mode: BattleMode::Pvp,
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = BattleRegistry::new();
        let (r, order) = roster(&["a", "b"]);
        let id = registry.create("t1", r, order, options("a")).await;

        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.find_by_thread("t1").await.unwrap().id, id);
        assert_eq!(registry.find_by_participant("b").await.unwrap().id, id);
        assert_eq!(registry.find_by_gm("a").await.unwrap().id, id);
        assert!(registry.find_by_participant("z").await.is_none());

        let s = registry.get(&id).await.unwrap();
        assert_eq!(s.flags.len(), 2);
        assert_eq!(s.revision, 0);
    }

    #[tokio::test]
    async fn test_get_is_idempotent() {
        let registry = BattleRegistry::new();
        let (r, order) = roster(&["a", "b"]);
        let id = registry.create("t1", r, order, options("a")).await;

        let first = registry.get(&id).await.unwrap();
        let second = registry.get(&id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_update_merges_and_refreshes() {
        let registry = BattleRegistry::new();
        let (r, order) = roster(&["a", "b"]);
        let id = registry.create("t1", r, order, options("a")).await;
        let before = registry.get(&id).await.unwrap();

        let patch = SessionPatch {
            current_turn: Some(Some("b".to_string())),
            ..SessionPatch::default()
        };
        assert!(registry.update(&id, patch).await);

        let after = registry.get(&id).await.unwrap();
        assert_eq!(after.current_turn.as_deref(), Some("b"));
        assert_eq!(after.turn_order, before.turn_order);
        assert!(after.last_action >= before.last_action);
        assert_eq!(after.revision, 1);

        assert!(!registry.update("missing", SessionPatch::default()).await);
    }

    #[tokio::test]
    async fn test_commit_checks_revision() {
        let registry = BattleRegistry::new();
        let (r, order) = roster(&["a", "b"]);
        let id = registry.create("t1", r, order, options("a")).await;

        let mut next = registry.get(&id).await.unwrap();
        next.round = 2;
        let stale = next.clone();
        assert!(registry.commit(next, 0).await);

        let stored = registry.get(&id).await.unwrap();
        assert_eq!(stored.round, 2);
        assert_eq!(stored.revision, 1);

        // Taken before the first commit
        assert!(!registry.commit(stale, 0).await);
        assert_eq!(registry.get(&id).await.unwrap().revision, 1);

        registry.delete(&id).await;
        assert!(!registry.commit(stored, 1).await);
    }

    #[tokio::test]
    async fn test_commit_removes_resolved() {
        let registry = BattleRegistry::new();
        let (r, order) = roster(&["a", "b"]);
        let id = registry.create("t1", r, order, options("a")).await;

        let mut next = registry.get(&id).await.unwrap();
        next.resolve(None, crate::battle::EndReason::Stopped { gm: "a".into() });
        assert!(registry.commit(next, 0).await);
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_and_sweep() {
        let registry = BattleRegistry::new();
        let (r, order) = roster(&["a", "b"]);
        let id = registry.create("t1", r, order, options("a")).await;
        let (r, order) = roster(&["c", "d"]);
        registry.create("t2", r, order, options("c")).await;

        assert!(registry.delete(&id).await.is_some());
        assert!(registry.delete(&id).await.is_none());

        // Nothing is stale yet
        assert_eq!(registry.sweep_stale(Duration::hours(1)).await, 0);

        let later = Utc::now() + Duration::hours(3);
        assert_eq!(registry.sweep_stale_at(later, Duration::hours(2)).await, 1);
        assert_eq!(registry.count().await, 0);
    }
}
