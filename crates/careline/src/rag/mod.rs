//! RAG module - query cleaning, intent analysis, care-stage decisions and
//! retrieval of grounding snippets.

pub mod care_stage;
pub mod intent_analyzer;
pub mod query_rewriter;
pub mod retriever;
pub mod smart_rag;
pub mod structured_output;

// Re-export commonly used types
pub use care_stage::{decide_stage, CareStage, Effectiveness, EmotionTrend, StageDecision, TreatmentProgress};
pub use intent_analyzer::{AnalysisOutcome, Intent, IntentAnalysis, IntentAnalyzer, RiskLevel, Urgency};
pub use query_rewriter::{QueryRewriter, RewrittenQuery};
pub use retriever::VectorRetriever;
pub use smart_rag::{RagOutcome, SmartRag};
pub use structured_output::{parse_layered, ParseConfidence};
