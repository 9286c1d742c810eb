use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use kopi_core::{SessionSnapshot, Turn};

struct SessionState {
    turns: VecDeque<Turn>,
    metadata: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl SessionState {
    fn new(now: DateTime<Utc>) -> Self {
        Self { turns: VecDeque::new(), metadata: BTreeMap::new(), created_at: now, last_active: now }
    }
}

/// Process-local conversation memory. The outer map lock is held only for
/// lookup/insert; each session carries its own mutex, so operations on one
/// session serialize while different sessions proceed independently.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionState>>>>,
    window: usize,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(window: usize, ttl_minutes: u64, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            window,
            ttl: Duration::minutes(ttl_minutes.min(i64::MAX as u64) as i64),
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session map lock should not be poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Immutable view for the planner; creates the session on first
    /// reference.
    pub fn snapshot(&self, session_id: &str) -> SessionSnapshot {
        let entry = self.get_or_create(session_id);
        let state = entry.lock().expect("session lock should not be poisoned");
        SessionSnapshot {
            session_id: session_id.to_string(),
            turns: state.turns.iter().cloned().collect(),
            metadata: state.metadata.clone(),
            created_at: Some(state.created_at),
            last_active: Some(state.last_active),
        }
    }

    /// Appends a turn, dropping from the head until the window bound holds.
    pub fn append_turn(&self, session_id: &str, turn: Turn) {
        let entry = self.get_or_create(session_id);
        let mut state = entry.lock().expect("session lock should not be poisoned");
        state.turns.push_back(turn);
        while state.turns.len() > self.window {
            state.turns.pop_front();
        }
        state.last_active = Utc::now();
    }

    /// Atomically overwrites one metadata key.
    pub fn update_metadata(&self, session_id: &str, key: &str, value: String) {
        let entry = self.get_or_create(session_id);
        let mut state = entry.lock().expect("session lock should not be poisoned");
        state.metadata.insert(key.to_string(), value);
        state.last_active = Utc::now();
    }

    /// Drops sessions idle past the TTL, then trims the oldest sessions
    /// until the soft cap holds.
    pub fn evict_expired(&self, now: DateTime<Utc>) {
        let mut sessions =
            self.sessions.lock().expect("session map lock should not be poisoned");

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| {
                let state = entry.lock().expect("session lock should not be poisoned");
                now - state.last_active > self.ttl
            })
            .map(|(id, _)| id.clone())
            .collect();
        let expired_count = expired.len();
        for id in expired {
            sessions.remove(&id);
        }

        if sessions.len() > self.max_sessions {
            let mut by_age: Vec<(String, DateTime<Utc>)> = sessions
                .iter()
                .map(|(id, entry)| {
                    let state = entry.lock().expect("session lock should not be poisoned");
                    (id.clone(), state.last_active)
                })
                .collect();
            by_age.sort_by_key(|(_, last_active)| *last_active);

            let to_remove = sessions.len() - self.max_sessions;
            for (id, _) in by_age.into_iter().take(to_remove) {
                sessions.remove(&id);
            }
        }

        if expired_count > 0 {
            debug!(expired = expired_count, remaining = sessions.len(), "evicted idle sessions");
        }
    }

    fn get_or_create(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        self.evict_expired(Utc::now());
        let mut sessions =
            self.sessions.lock().expect("session map lock should not be poisoned");
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(Utc::now()))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use kopi_core::{metadata_keys, Action, Decision, EntityFlags, Turn};

    use super::SessionStore;

    fn turn(user: &str) -> Turn {
        Turn {
            user: user.to_string(),
            assistant: format!("reply to {user}"),
            decision: Decision {
                primary_action: Action::AnswerDirectly,
                confidence: 0.5,
                reasoning: "test".to_string(),
                entities: EntityFlags::default(),
                missing_info: Vec::new(),
                execution_plan: Vec::new(),
                clarification_prompt: None,
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn window_bound_drops_oldest_turns_first() {
        let store = SessionStore::new(3, 60, 100);
        for index in 0..5 {
            store.append_turn("s-1", turn(&format!("question {index}")));
        }

        let snapshot = store.snapshot("s-1");
        assert_eq!(snapshot.turns.len(), 3);
        assert_eq!(snapshot.turns[0].user, "question 2");
        assert_eq!(snapshot.turns[2].user, "question 4");
    }

    #[test]
    fn window_zero_degenerates_to_stateless_sessions() {
        let store = SessionStore::new(0, 60, 100);
        store.append_turn("s-1", turn("anything"));

        let snapshot = store.snapshot("s-1");
        assert!(snapshot.turns.is_empty());
        assert_eq!(store.len(), 1, "session still exists, it just carries no turns");
    }

    #[test]
    fn snapshot_creates_the_session_on_first_reference() {
        let store = SessionStore::new(3, 60, 100);
        let snapshot = store.snapshot("fresh");
        assert_eq!(snapshot.session_id, "fresh");
        assert!(snapshot.created_at.is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn metadata_updates_overwrite_atomically() {
        let store = SessionStore::new(3, 60, 100);
        store.update_metadata("s-1", metadata_keys::LAST_PRIMARY_ACTION, "calculate".to_string());
        store.update_metadata(
            "s-1",
            metadata_keys::LAST_PRIMARY_ACTION,
            "search_products".to_string(),
        );

        let snapshot = store.snapshot("s-1");
        assert_eq!(
            snapshot.metadata_value(metadata_keys::LAST_PRIMARY_ACTION),
            Some("search_products")
        );
    }

    #[test]
    fn ttl_eviction_removes_idle_sessions() {
        let store = SessionStore::new(3, 1, 100);
        store.append_turn("old", turn("hello"));
        assert_eq!(store.len(), 1);

        store.evict_expired(Utc::now() + Duration::minutes(5));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn soft_cap_evicts_least_recently_used() {
        let store = SessionStore::new(3, 60, 2);
        store.append_turn("a", turn("first"));
        store.append_turn("b", turn("second"));
        store.append_turn("c", turn("third"));

        store.evict_expired(Utc::now());
        assert_eq!(store.len(), 2);
        let remaining = store.snapshot("c");
        assert_eq!(remaining.turns.len(), 1, "most recent session should survive");
    }

    #[test]
    fn snapshot_is_isolated_from_later_appends() {
        let store = SessionStore::new(3, 60, 100);
        store.append_turn("s-1", turn("first"));

        let snapshot = store.snapshot("s-1");
        store.append_turn("s-1", turn("second"));

        assert_eq!(snapshot.turns.len(), 1, "snapshot must not observe later appends");
        assert_eq!(store.snapshot("s-1").turns.len(), 2);
    }
}
