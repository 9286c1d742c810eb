use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::Decision;

/// Session metadata keys the planner consults. Anything else stored under a
/// session is carried but ignored.
pub mod metadata_keys {
    pub const LAST_PRIMARY_ACTION: &str = "last_primary_action";
    pub const LAST_PRODUCT_QUERY: &str = "last_product_query";
    pub const LAST_OUTLET_QUERY: &str = "last_outlet_query";
    pub const PREFERRED_SORT: &str = "preferred_sort";
}

/// One user/assistant exchange plus the decision that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
    pub decision: Decision,
    pub timestamp: DateTime<Utc>,
}

/// Immutable view of a session handed to the planner. The planner never
/// sees the live session, so planning cannot race a concurrent append.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub turns: Vec<Turn>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn has_history(&self) -> bool {
        !self.turns.is_empty()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Recent turns rendered for the language-model prompt.
    pub fn format_history(&self) -> String {
        if self.turns.is_empty() {
            return "No previous conversation.".to_string();
        }
        let mut lines = Vec::with_capacity(self.turns.len() * 2);
        for turn in &self.turns {
            lines.push(format!("User: {}", turn.user));
            lines.push(format!("Assistant: {}", turn.assistant));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::decision::{Action, Decision, EntityFlags};

    use super::{metadata_keys, SessionSnapshot, Turn};

    fn turn(user: &str, assistant: &str) -> Turn {
        Turn {
            user: user.to_string(),
            assistant: assistant.to_string(),
            decision: Decision {
                primary_action: Action::AnswerDirectly,
                confidence: 0.5,
                reasoning: "default".to_string(),
                entities: EntityFlags::default(),
                missing_info: Vec::new(),
                execution_plan: Vec::new(),
                clarification_prompt: None,
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn empty_snapshot_formats_placeholder_history() {
        let snapshot = SessionSnapshot::default();
        assert!(!snapshot.has_history());
        assert_eq!(snapshot.format_history(), "No previous conversation.");
    }

    #[test]
    fn history_interleaves_user_and_assistant_lines() {
        let snapshot = SessionSnapshot {
            session_id: "s-1".to_string(),
            turns: vec![turn("show me tumblers", "We have 3 tumblers.")],
            ..SessionSnapshot::default()
        };
        assert_eq!(
            snapshot.format_history(),
            "User: show me tumblers\nAssistant: We have 3 tumblers."
        );
    }

    #[test]
    fn metadata_lookup_uses_recognized_keys() {
        let mut snapshot = SessionSnapshot::default();
        snapshot
            .metadata
            .insert(metadata_keys::LAST_PRODUCT_QUERY.to_string(), "tumblers".to_string());
        assert_eq!(snapshot.metadata_value(metadata_keys::LAST_PRODUCT_QUERY), Some("tumblers"));
        assert_eq!(snapshot.metadata_value(metadata_keys::LAST_OUTLET_QUERY), None);
    }
}
