use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use super::generation::{MasterRewriter, PrimaryGenerator};
use super::{fallback_reply, ChatReply, ChatRequest, TurnContext};
use crate::cache::TtlCache;
use crate::config::AppConfig;
use crate::embeddings::EmbeddingModel;
use crate::error::Error;
use crate::llm::LLMManager;
use crate::memory::MemoryService;
use crate::rag::{Intent, IntentAnalyzer, QueryRewriter, RiskLevel, SmartRag, VectorRetriever};
use crate::storage::Store;
use crate::types::Meta;

const SLOW_TURN: Duration = Duration::from_secs(2);
const CACHE_KEY_CHARS: usize = 50;

/// A turn that could not complete. Still carries a safe reply for the user.
#[derive(Debug, Error)]
#[error("chat turn failed for {conversation_id}: {error}")]
pub struct ChatFailure {
    pub conversation_id: Uuid,
    pub reply: String,
    #[source]
    pub error: Error,
}

#[derive(Debug, Clone)]
struct CachedReply {
    reply: String,
    risk_level: RiskLevel,
    intent: Intent,
    care_stage: u8,
}

pub struct ChatEngine {
    store: Store,
    memory: Arc<MemoryService>,
    analyzer: IntentAnalyzer,
    smart_rag: SmartRag,
    primary: PrimaryGenerator,
    rewriter: MasterRewriter,
    response_cache: TtlCache<(String, String), CachedReply>,
}

impl ChatEngine {
    pub fn new(
        store: Store,
        memory: Arc<MemoryService>,
        llm: LLMManager,
        embedder: Arc<dyn EmbeddingModel>,
        config: &AppConfig,
    ) -> Self {
        let retriever = VectorRetriever::new(store.clone(), embedder);
        let smart_rag = SmartRag::new(
            retriever,
            QueryRewriter::new(llm.clone(), &config.llm),
            &config.retrieval,
            &config.caches,
        );
        Self {
            store,
            memory,
            analyzer: IntentAnalyzer::new(llm.clone(), &config.llm),
            smart_rag,
            primary: PrimaryGenerator::new(llm.clone(), &config.llm),
            rewriter: MasterRewriter::new(llm, &config.llm),
            response_cache: TtlCache::new(
                config.caches.response_capacity,
                Duration::from_secs(config.caches.response_ttl_secs),
            ),
        }
    }

    /// Run one conversational turn end to end.
    ///
    /// Provider problems degrade inside the pipeline and still produce a
    /// reply. Only storage failures surface as [`ChatFailure`], which carries
    /// the static fallback so the caller can still answer.
    pub async fn process_message(&self, request: ChatRequest) -> Result<ChatReply, ChatFailure> {
        let started = Instant::now();
        let conversation_id = request.conversation_id.unwrap_or_else(Uuid::new_v4);
        let input = request.message.trim();

        let fail = |error: Error, risk: RiskLevel| ChatFailure {
            conversation_id,
            reply: fallback_reply(risk).to_string(),
            error,
        };

        if input.is_empty() {
            return Err(fail(Error::Validation("message is empty".into()), RiskLevel::None));
        }

        self.store
            .ensure_conversation(conversation_id, &request.user_id)
            .await
            .map_err(|e| fail(e, RiskLevel::None))?;

        let cache_key = (
            request.user_id.clone(),
            input.chars().take(CACHE_KEY_CHARS).collect::<String>(),
        );
        if let Some(cached) = self.response_cache.get(&cache_key) {
            tracing::debug!(conversation_id = %conversation_id, "Response cache hit");
            let meta = json!({
                "care_stage": cached.care_stage,
                "intent": cached.intent.as_str(),
                "risk_level": cached.risk_level.as_str(),
                "cached": true,
            });
            self.memory
                .save_turns(conversation_id, input, &cached.reply, as_meta(meta))
                .await
                .map_err(|e| fail(e, cached.risk_level))?;
            return Ok(ChatReply {
                conversation_id,
                reply: cached.reply,
                risk_level: cached.risk_level,
                intent: cached.intent,
                care_stage_used: cached.care_stage,
            });
        }

        let memory = self.memory.load_memory(conversation_id, true).await;
        let mut ctx = TurnContext::new(conversation_id, &request.user_id, input, memory);

        let outcome = self.analyzer.analyze(input, &ctx.memory).await;
        ctx.analysis = outcome.analysis;
        ctx.parse_confidence = outcome.confidence;

        if ctx.analysis.intent != Intent::Greeting {
            ctx.rag = Some(
                self.smart_rag
                    .retrieve_for_intent(input, &ctx.analysis, &ctx.memory)
                    .await,
            );
        }

        ctx.primary = match self.primary.generate(input, &ctx.memory, ctx.snippet()).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Primary generation failed");
                String::new()
            }
        };
        ctx.reply = self.rewriter.rewrite(&ctx).await;

        let meta = turn_meta(&ctx);
        self.memory
            .save_turns(conversation_id, input, &ctx.reply, meta)
            .await
            .map_err(|e| fail(e, ctx.risk()))?;

        let care_stage = ctx.analysis.care_stage_needed.number();
        self.response_cache.insert(
            cache_key,
            CachedReply {
                reply: ctx.reply.clone(),
                risk_level: ctx.analysis.risk_level,
                intent: ctx.analysis.intent,
                care_stage,
            },
        );

        let elapsed = started.elapsed();
        if elapsed > SLOW_TURN {
            tracing::warn!(
                conversation_id = %conversation_id,
                duration_ms = elapsed.as_millis() as u64,
                "Slow chat turn"
            );
        } else {
            tracing::info!(
                conversation_id = %conversation_id,
                duration_ms = elapsed.as_millis() as u64,
                risk = ctx.analysis.risk_level.as_str(),
                intent = ctx.analysis.intent.as_str(),
                care_stage,
                "Chat turn complete"
            );
        }

        Ok(ChatReply {
            conversation_id,
            reply: ctx.reply,
            risk_level: ctx.analysis.risk_level,
            intent: ctx.analysis.intent,
            care_stage_used: care_stage,
        })
    }

    /// Drop every cached reply, e.g. after the knowledge base changed.
    pub fn clear_response_cache(&self) {
        self.response_cache.clear();
    }
}

fn turn_meta(ctx: &TurnContext) -> Meta {
    let analysis = &ctx.analysis;
    let (rag_query, sources) = match &ctx.rag {
        Some(rag) => (json!(rag.query), json!(rag.sources)),
        None => (json!(null), json!([])),
    };
    as_meta(json!({
        "care_stage": analysis.care_stage_needed.number(),
        "intent": analysis.intent.as_str(),
        "risk_level": analysis.risk_level.as_str(),
        "emotional_state": analysis.emotional_state,
        "is_upgrade": analysis.is_upgrade,
        "upgrade_reason": analysis.upgrade_reason,
        "parse_confidence": ctx.parse_confidence,
        "rag_query": rag_query,
        "sources": sources,
        "cached": false,
    }))
}

fn as_meta(value: serde_json::Value) -> Meta {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Meta::new(),
    }
}
