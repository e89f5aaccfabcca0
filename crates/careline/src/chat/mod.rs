pub mod engine;
pub mod generation;

use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use crate::memory::MemorySnapshot;
use crate::rag::{Intent, IntentAnalysis, ParseConfidence, RagOutcome, RiskLevel};

/// Safe reply when generation fails on a high-risk turn.
pub const CRISIS_FALLBACK_REPLY: &str = "聽起來很辛苦，要不要打1995聊聊？24小時都有人。";
/// Safe reply for everything else.
pub const GENERIC_FALLBACK_REPLY: &str = "不好意思，我沒聽清楚，能再說一次嗎？";
/// Factual question with nothing retrieved.
pub const NO_INFO_REPLY: &str = "資訊尚未收錄，建議撥打毒防局諮詢專線";
/// Appended to high-risk replies that lost the crisis line.
pub const CRISIS_LINE_SENTENCE: &str = "如果撐不住，隨時可以打1995，24小時都有人陪你。";

pub fn fallback_reply(risk: RiskLevel) -> &'static str {
    if risk == RiskLevel::High {
        CRISIS_FALLBACK_REPLY
    } else {
        GENERIC_FALLBACK_REPLY
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub conversation_id: Uuid,
    pub reply: String,
    pub risk_level: RiskLevel,
    pub intent: Intent,
    pub care_stage_used: u8,
}

/// Everything one turn accumulates on its way through the pipeline.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: Uuid,
    pub user_id: String,
    pub input: String,
    pub memory: MemorySnapshot,
    pub analysis: IntentAnalysis,
    pub parse_confidence: ParseConfidence,
    /// `None` when retrieval was skipped.
    pub rag: Option<RagOutcome>,
    pub primary: String,
    pub reply: String,
    pub started: Instant,
}

impl TurnContext {
    pub fn new(conversation_id: Uuid, user_id: &str, input: &str, memory: MemorySnapshot) -> Self {
        Self {
            conversation_id,
            user_id: user_id.to_string(),
            input: input.to_string(),
            memory,
            analysis: IntentAnalysis::default(),
            parse_confidence: ParseConfidence::Fallback,
            rag: None,
            primary: String::new(),
            reply: String::new(),
            started: Instant::now(),
        }
    }

    pub fn snippet(&self) -> &str {
        self.rag.as_ref().map(|r| r.snippet.as_str()).unwrap_or("")
    }

    pub fn risk(&self) -> RiskLevel {
        self.analysis.risk_level
    }
}
