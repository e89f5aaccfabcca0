//! Type definitions for conversation memory

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rag::care_stage::{CareStage, STAGE_HISTORY};
use crate::types::{Role, Turn};

/// Recent conversation state as the pipeline sees it. Derived on load,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub conversation_id: Uuid,
    /// Chronological.
    pub messages: Vec<Turn>,
    pub key_facts: KeyFacts,
    pub context_markers: Vec<String>,
    pub flow: Vec<FlowStep>,
    pub summary: Option<String>,
    pub checkpoint_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyFacts {
    /// Things the user said about themselves ("我叫…", "我是…").
    pub user_mentions: Vec<String>,
    pub topics: Vec<String>,
    pub emotional_states: Vec<EmotionMention>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionMention {
    pub emotion: String,
    pub message: String,
}

/// One user/assistant exchange in the conversation flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    pub turn: usize,
    pub user_intent: String,
    pub assistant_action: String,
    /// Whether this exchange shares a topic with the previous one.
    pub continuity: bool,
}

impl MemorySnapshot {
    pub fn empty(conversation_id: Uuid) -> Self {
        let mut snapshot = Self {
            conversation_id,
            messages: Vec::new(),
            key_facts: KeyFacts::default(),
            context_markers: Vec::new(),
            flow: Vec::new(),
            summary: None,
            checkpoint_hash: String::new(),
        };
        snapshot.checkpoint_hash = super::snapshot_hash(&snapshot);
        snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The last `n` turns.
    pub fn recent(&self, n: usize) -> &[Turn] {
        &self.messages[self.messages.len().saturating_sub(n)..]
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.last_with_role(Role::User)
    }

    pub fn last_assistant_message(&self) -> Option<&str> {
        self.last_with_role(Role::Assistant)
    }

    /// Stages recorded on the most recent assistant turns, oldest first.
    pub fn prior_stages(&self) -> Vec<CareStage> {
        let mut stages: Vec<CareStage> = self
            .messages
            .iter()
            .rev()
            .filter(|t| t.role == Role::Assistant)
            .take(STAGE_HISTORY)
            .filter_map(|t| t.care_stage().and_then(CareStage::from_number))
            .collect();
        stages.reverse();
        stages
    }

    fn last_with_role(&self, role: Role) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|t| t.role == role)
            .map(|t| t.content.as_str())
    }
}
