//! Intent-aware retrieval that boils hits down to a short factual snippet.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::sync::LazyLock;
use std::time::Duration;

use super::intent_analyzer::{Intent, IntentAnalysis};
use super::query_rewriter::QueryRewriter;
use super::retriever::VectorRetriever;
use crate::cache::TtlCache;
use crate::config::{CacheConfig, RetrievalConfig};
use crate::memory::MemorySnapshot;
use crate::types::{DocumentFilter, RetrievalHit};

pub const SNIPPET_SEPARATOR: &str = "；";
const MAX_FACTS: usize = 3;
/// Hit text used when no structured fact could be extracted.
const FALLBACK_SNIPPET_CHARS: usize = 150;

pub static INSTITUTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Han}A-Za-z]{2,20}(?:醫院|中心|機構|基金會)").expect("institution regex is valid")
});
pub static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"0800-\d{6}|\(0?\d{1,2}\)\s?\d{3,4}-\d{4}|0\d{1,2}-\d{3,4}-\d{4}|0\d-\d{4}-\d{4}|0\d{9}",
    )
    .expect("phone regex is valid")
});
pub static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:高雄市)?\w+[區市]\w+[路街]\w+號").expect("address regex is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagOutcome {
    /// The query actually sent to the retriever, prefix included.
    pub query: String,
    pub snippet: String,
    /// Titles of the documents the snippet was drawn from.
    pub sources: Vec<String>,
    pub cached: bool,
}

pub struct SmartRag {
    retriever: VectorRetriever,
    rewriter: QueryRewriter,
    cache: TtlCache<String, RagOutcome>,
    k: usize,
    threshold: f32,
}

impl SmartRag {
    pub fn new(
        retriever: VectorRetriever,
        rewriter: QueryRewriter,
        retrieval: &RetrievalConfig,
        caches: &CacheConfig,
    ) -> Self {
        Self {
            retriever,
            rewriter,
            cache: TtlCache::new(caches.rag_capacity, Duration::from_secs(caches.rag_ttl_secs)),
            k: retrieval.chat_k,
            threshold: retrieval.chat_threshold,
        }
    }

    /// Never fails; retrieval problems produce an empty snippet.
    pub async fn retrieve_for_intent(
        &self,
        user_turn: &str,
        analysis: &IntentAnalysis,
        memory: &MemorySnapshot,
    ) -> RagOutcome {
        let rewritten = self.rewriter.contextualise(user_turn, memory).await;
        let prefix = intent_prefix(analysis.intent);
        let query = if prefix.is_empty() {
            rewritten.rewritten_query.clone()
        } else {
            format!("{} {}", prefix, rewritten.rewritten_query)
        };

        let key = cache_key(prefix, &rewritten.rewritten_query);
        if let Some(mut hit) = self.cache.get(&key) {
            tracing::debug!(query = %query, "RAG cache hit");
            hit.cached = true;
            return hit;
        }

        let filter = DocumentFilter::default();
        let hits = match self.retriever.retrieve(&query, self.k, self.threshold, &filter).await {
            Ok(hits) => hits,
            Err(e) if !analysis.search_keywords.is_empty() => {
                tracing::warn!(error = %e, "Vector retrieval failed, trying keywords");
                match self
                    .retriever
                    .retrieve_by_keywords(&analysis.search_keywords, self.k, &filter)
                    .await
                {
                    Ok(hits) => hits,
                    Err(e) => {
                        tracing::warn!(error = %e, "Keyword retrieval failed");
                        return RagOutcome { query, ..RagOutcome::default() };
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Retrieval failed, continuing without snippet");
                return RagOutcome { query, ..RagOutcome::default() };
            }
        };

        let outcome = RagOutcome {
            snippet: build_snippet(&hits),
            sources: dedup(hits.iter().map(|h| h.title.clone())),
            query,
            cached: false,
        };
        tracing::info!(
            hits = hits.len(),
            snippet_chars = outcome.snippet.chars().count(),
            used_context = rewritten.used_context,
            "Smart RAG"
        );
        self.cache.insert(key, outcome.clone());
        outcome
    }
}

pub fn intent_prefix(intent: Intent) -> &'static str {
    match intent {
        Intent::Crisis => "自殺防治 心理諮商 緊急求助",
        Intent::Help => "戒毒 戒癮 治療",
        _ => "",
    }
}

fn cache_key(prefix: &str, query: &str) -> String {
    let digest = Sha1::digest(format!("{}{}", prefix, query).as_bytes());
    let hex = format!("{:x}", digest);
    hex.chars().take(50).collect()
}

/// Up to three distinct facts (institution, phone, address per hit) joined
/// by `；`. Falls back to the start of the best hit when nothing matches.
pub fn build_snippet(hits: &[RetrievalHit]) -> String {
    let mut facts: Vec<String> = Vec::new();
    for hit in hits {
        let text = hit.content.as_str();
        let candidates = [
            INSTITUTION_RE.find(text),
            PHONE_RE.find(text),
            ADDRESS_RE.find(text),
        ];
        for found in candidates.into_iter().flatten() {
            let fact = found.as_str().trim().to_string();
            if !facts.contains(&fact) {
                facts.push(fact);
            }
        }
        if facts.len() >= MAX_FACTS {
            break;
        }
    }
    facts.truncate(MAX_FACTS);

    if facts.is_empty() {
        return hits
            .first()
            .map(|h| h.content.chars().take(FALLBACK_SNIPPET_CHARS).collect())
            .unwrap_or_default();
    }
    facts.join(SNIPPET_SEPARATOR)
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
