pub mod cache;
pub mod chat;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod indexing;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod processing;
pub mod rag;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export primary types for convenience
pub use chat::engine::{ChatEngine, ChatFailure};
pub use chat::{ChatReply, ChatRequest};
pub use config::AppConfig;
pub use error::{Error, Result};
pub use indexing::UploadPipeline;
pub use knowledge::authority_sync::AuthoritySync;
pub use knowledge::contacts::ContactService;
pub use knowledge::drug::DrugService;
pub use knowledge::KnowledgeManager;
pub use memory::MemoryService;
pub use storage::Store;

pub use uuid::Uuid;
