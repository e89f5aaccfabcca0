//! Deterministic stand-ins for the model providers, shared by unit tests.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use crate::embeddings::EmbeddingModel;
use crate::llm::{ChatMessage, GenerationConfig, LLMProvider, ProviderInfo};
use crate::memory::{build_snapshot, MemorySnapshot};
use crate::processing::TextChunker;
use crate::storage::Store;
use crate::types::{KnowledgeChunk, KnowledgeDocument, Meta, NewDocument, Turn};

enum Reply {
    Text(String),
    Fail,
}

/// Answers by the first rule whose needle occurs anywhere in the prompt.
pub struct ScriptedLLM {
    rules: Vec<(String, Reply)>,
    default: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLLM {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, needle: &str, response: &str) -> Self {
        self.rules.push((needle.to_string(), Reply::Text(response.to_string())));
        self
    }

    pub fn fail_on(mut self, needle: &str) -> Self {
        self.rules.push((needle.to_string(), Reply::Fail));
        self
    }

    pub fn with_default(mut self, response: &str) -> Self {
        self.default = Some(response.to_string());
        self
    }

    /// Every prompt seen so far, messages joined by newlines.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LLMProvider for ScriptedLLM {
    async fn chat(&self, messages: &[ChatMessage], _config: &GenerationConfig) -> anyhow::Result<String> {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().push(prompt.clone());

        for (needle, reply) in &self.rules {
            if prompt.contains(needle.as_str()) {
                return match reply {
                    Reply::Text(text) => Ok(text.clone()),
                    Reply::Fail => Err(anyhow!("scripted failure for {}", needle)),
                };
            }
        }
        self.default
            .clone()
            .ok_or_else(|| anyhow!("no scripted response"))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "scripted".into(),
            model: "scripted".into(),
            is_local: true,
        }
    }
}

pub struct FailingLLM;

#[async_trait]
impl LLMProvider for FailingLLM {
    async fn chat(&self, _messages: &[ChatMessage], _config: &GenerationConfig) -> anyhow::Result<String> {
        Err(anyhow!("provider unavailable"))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "failing".into(),
            model: "none".into(),
            is_local: true,
        }
    }
}

const CONCEPTS: &[&[&str]] = &[
    &["戒毒", "戒癮"],
    &["治療", "門診", "醫療"],
    &["毒防局", "毒品危害防制"],
    &["醫院", "中心", "機構", "基金會"],
    &["凱旋"],
    &["電話", "聯絡", "專線"],
    &["地址", "在哪", "哪裡", "地點", "路"],
    &["自殺", "輕生", "解脫", "想死"],
    &["心理", "諮商", "情緒"],
    &["緊急", "求助", "1995"],
    &["天氣", "晴天", "下雨"],
    &["家人", "家屬"],
    &["圖片", "媒體", "海報"],
];

/// Bag-of-concepts embedder: one dimension per synonym group, 1.0 when any
/// term of the group occurs. Text with no known concept embeds to zeros and
/// so never matches anything.
pub struct ConceptEmbedder;

impl ConceptEmbedder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EmbeddingModel for ConceptEmbedder {
    async fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        Ok(CONCEPTS
            .iter()
            .map(|terms| if terms.iter().any(|t| text.contains(t)) { 1.0 } else { 0.0 })
            .collect())
    }

    fn dimension(&self) -> usize {
        CONCEPTS.len()
    }
}

/// Build a snapshot from `(role, content, care_stage)` triples, one second apart.
pub fn memory_with(turns: &[(&str, &str, Option<u8>)]) -> MemorySnapshot {
    let base = Utc::now() - Duration::minutes(10);
    let turns: Vec<Turn> = turns
        .iter()
        .enumerate()
        .map(|(i, (role, content, stage))| {
            let at = base + Duration::seconds(i as i64);
            if *role == "user" {
                Turn::user(*content, at)
            } else {
                let mut meta = Meta::new();
                if let Some(stage) = stage {
                    meta.insert("care_stage".into(), json!(stage));
                }
                Turn::assistant(*content, at, meta)
            }
        })
        .collect();
    build_snapshot(Uuid::new_v4(), turns, true)
}

/// Index a document straight into the store.
pub async fn seed_document(
    store: &Store,
    embedder: &dyn EmbeddingModel,
    title: &str,
    content: &str,
    category: &str,
) -> Uuid {
    let new = NewDocument {
        title: title.to_string(),
        content: content.to_string(),
        source: "test".to_string(),
        category: category.to_string(),
        lang: "zh-TW".to_string(),
        published_date: None,
    };
    let now = Utc::now();
    let doc = KnowledgeDocument {
        id: Uuid::new_v4(),
        title: new.title.clone(),
        content: new.content.clone(),
        source: new.source.clone(),
        category: new.category.clone(),
        lang: new.lang.clone(),
        published_date: None,
        created_at: now,
        updated_at: now,
    };
    let mut chunks = Vec::new();
    for piece in TextChunker::default().chunk_document(&new) {
        chunks.push(KnowledgeChunk {
            document_id: doc.id,
            chunk_index: piece.index,
            embedding: embedder.embed(&piece.content).await.unwrap(),
            content: piece.content,
            metadata: piece.metadata,
        });
    }
    let id = doc.id;
    store.insert_document(doc, chunks).await.unwrap();
    id
}
