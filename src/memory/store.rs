//! Conversation turn storage
//!
//! Per-session, append-only history of answered questions. Sessions never see
//! each other's turns.

use crate::classifier::Intent;
use crate::interpret::QueryFrame;
use crate::models::DriverSet;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// One answered question in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: Uuid,
    pub session_id: String,
    pub question: String,
    pub intent: Intent,
    /// Frame after follow-up merging; what was actually answered.
    pub frame: QueryFrame,
    /// Ids of the resolved results the answer was built from.
    pub resolved_result_ref: Vec<Uuid>,
    /// Most recent driver set the answer referenced, if any.
    pub driver_set: Option<DriverSet>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(session_id: &str, question: &str, intent: Intent, frame: QueryFrame) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            question: question.to_string(),
            intent,
            frame,
            resolved_result_ref: Vec::new(),
            driver_set: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_results(mut self, result_ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.resolved_result_ref.extend(result_ids);
        self
    }

    pub fn with_driver_set(mut self, driver_set: Option<DriverSet>) -> Self {
        self.driver_set = driver_set;
        self
    }
}

/// Turns of a single session, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHistory {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    turns: VecDeque<ConversationTurn>,
}

impl SessionHistory {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            turns: VecDeque::new(),
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        self.updated_at = Utc::now();
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// Most recent first.
    pub fn recent_turns(&self, count: usize) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter().rev().take(count)
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    fn expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.updated_at > ttl
    }
}

/// Guard on a session's exclusive turn slot. Dropping it releases the slot.
pub type TurnSlot = OwnedMutexGuard<()>;

/// In-memory conversation store shared across requests.
#[derive(Clone)]
pub struct ConversationStore {
    sessions: Arc<RwLock<HashMap<String, SessionHistory>>>,
    slots: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // ================= TURN SLOT =================

    /// Wait for the session's exclusive slot. Held from context lookup to append.
    pub async fn begin_turn(&self, session_id: &str) -> TurnSlot {
        let slot = {
            let mut slots = self.slots.write().await;
            slots
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    // ================= TURNS =================

    pub async fn append(&self, turn: ConversationTurn) {
        let mut sessions = self.sessions.write().await;
        let history = sessions
            .entry(turn.session_id.clone())
            .or_insert_with(|| SessionHistory::new(&turn.session_id));

        info!(
            session_id = %turn.session_id,
            turn_id = %turn.turn_id,
            intent = turn.intent.as_str(),
            results = turn.resolved_result_ref.len(),
            "Turn appended"
        );
        history.push(turn);
    }

    pub async fn last_turn(&self, session_id: &str) -> Option<ConversationTurn> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).and_then(|h| h.last().cloned())
    }

    /// Up to `count` turns, most recent first.
    pub async fn recent_turns(&self, session_id: &str, count: usize) -> Vec<ConversationTurn> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|h| h.recent_turns(count).cloned().collect())
            .unwrap_or_default()
    }

    /// All turns, oldest first.
    pub async fn turns(&self, session_id: &str) -> Vec<ConversationTurn> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|h| h.turns().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a session's history. Returns whether it existed.
    pub async fn clear(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        {
            let mut slots = self.slots.write().await;
            if slots.get(session_id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                slots.remove(session_id);
            }
        }
        debug!(session_id = %session_id, removed = removed, "Session cleared");
        removed
    }

    /// Remove sessions idle for longer than `ttl`, and every idle turn slot
    /// without a session. Returns how many sessions went.
    pub async fn purge_expired(&self, ttl: Duration) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, h| !h.expired(now, ttl));
        let purged = before - sessions.len();

        let mut slots = self.slots.write().await;
        // A slot still held elsewhere keeps its Arc alive; only idle ones go.
        slots.retain(|id, slot| sessions.contains_key(id) || Arc::strong_count(slot) > 1);

        if purged > 0 {
            info!(purged = purged, remaining = sessions.len(), "Expired sessions purged");
        }

        purged
    }

    pub async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpret::interpret;

    fn turn(session_id: &str, question: &str) -> ConversationTurn {
        ConversationTurn::new(session_id, question, Intent::Descriptive, interpret(question))
    }

    #[tokio::test]
    async fn test_append_and_last_turn() {
        let store = ConversationStore::new();

        for i in 0..5 {
            store.append(turn("s1", &format!("What is revenue for FY202{}?", i))).await;
        }

        let last = store.last_turn("s1").await.unwrap();
        assert_eq!(last.question, "What is revenue for FY2024?");
        assert_eq!(store.turns("s1").await.len(), 5);

        let recent = store.recent_turns("s1", 2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].question, "What is revenue for FY2024?");
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = ConversationStore::new();
        store.append(turn("a", "What is gross margin?")).await;

        assert!(store.last_turn("b").await.is_none());
        assert!(store.turns("b").await.is_empty());
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = ConversationStore::new();
        store.append(turn("a", "What is EBITDA?")).await;

        assert!(store.clear("a").await);
        assert!(!store.clear("a").await);
        assert!(store.last_turn("a").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = ConversationStore::new();
        store.append(turn("old", "What is revenue?")).await;
        store.append(turn("fresh", "What is revenue?")).await;

        {
            let mut sessions = store.sessions.write().await;
            if let Some(h) = sessions.get_mut("old") {
                h.updated_at = Utc::now() - Duration::minutes(90);
            }
        }

        let purged = store.purge_expired(Duration::minutes(30)).await;
        assert_eq!(purged, 1);
        assert!(store.last_turn("old").await.is_none());
        assert!(store.last_turn("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_idle_slots_are_released() {
        let store = ConversationStore::new();

        // Turns that never reached append still leave a slot behind.
        for i in 0..100 {
            let slot = store.begin_turn(&format!("failed-{}", i)).await;
            drop(slot);
        }
        store.append(turn("kept", "What is revenue?")).await;
        drop(store.begin_turn("kept").await);
        assert_eq!(store.slot_count().await, 101);

        assert!(store.clear("kept").await);
        assert_eq!(store.slot_count().await, 100);

        assert_eq!(store.purge_expired(Duration::minutes(30)).await, 0);
        assert_eq!(store.slot_count().await, 0);

        // A held slot survives both.
        let held = store.begin_turn("busy").await;
        store.clear("busy").await;
        store.purge_expired(Duration::minutes(30)).await;
        assert_eq!(store.slot_count().await, 1);
        drop(held);
        store.purge_expired(Duration::minutes(30)).await;
        assert_eq!(store.slot_count().await, 0);
    }

    #[tokio::test]
    async fn test_turn_slot_is_exclusive_per_session() {
        let store = ConversationStore::new();

        let held = store.begin_turn("a").await;
        // Another session is not blocked.
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.begin_turn("b"),
        )
        .await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.begin_turn("a"),
        )
        .await;
        assert!(same.is_err());

        drop(held);
        let again = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.begin_turn("a"),
        )
        .await;
        assert!(again.is_ok());
    }

    #[test]
    fn test_turn_builders() {
        let id = Uuid::new_v4();
        let t = turn("s", "Why did gross margin miss budget?")
            .with_results([id])
            .with_driver_set(None);
        assert_eq!(t.resolved_result_ref, vec![id]);
        assert_eq!(t.frame.metric.as_deref(), Some("gross_margin"));
    }
}
