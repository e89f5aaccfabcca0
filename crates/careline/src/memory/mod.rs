//! Conversation memory
//!
//! Loads the recent turns of a conversation into a [`MemorySnapshot`],
//! derives key facts and flow from them, and formats the result for
//! prompts. Loading never fails; saving writes both turns of an exchange
//! in one transaction.

pub mod types;

use chrono::Utc;
use dashmap::DashMap;
use md5::{Digest, Md5};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::storage::Store;
use crate::types::{Meta, Role, Turn};

pub use types::*;

const TOPIC_WORDS: &[&str] = &["戒毒", "治療", "家人", "工作", "健康", "心情", "困擾"];
const EMOTION_MARKERS: &[&str] = &["難過", "痛苦", "焦慮", "害怕", "擔心"];
const CRISIS_MARKERS: &[&str] = &["自殺", "想死", "活不下去", "解脫", "不想活", "傷害自己"];
/// Turns shown under 【最近對話】.
const PROMPT_TURNS: usize = 6;
const PROMPT_TURN_CHARS: usize = 100;
const PROMPT_MARKERS: usize = 3;
const CHECKPOINT_PREVIEW_CHARS: usize = 50;

static SELF_INTRO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"我(?:叫|是)[\p{Han}A-Za-z0-9]{1,10}").expect("self intro regex is valid")
});

pub struct MemoryService {
    store: Store,
    cache: TtlCache<(Uuid, bool), MemorySnapshot>,
    /// Bumped on every save; a load only caches what it read if no save
    /// landed in between.
    generations: DashMap<Uuid, u64>,
    max_turns: usize,
}

impl MemoryService {
    pub fn new(store: Store, config: &MemoryConfig) -> Self {
        Self {
            store,
            cache: TtlCache::new(config.cache_capacity, Duration::from_secs(config.cache_ttl_secs)),
            generations: DashMap::new(),
            max_turns: config.max_turns,
        }
    }

    /// The last `2 * max_turns` turns, chronological. Storage errors yield an
    /// empty snapshot.
    pub async fn load_memory(&self, conversation_id: Uuid, include_summary: bool) -> MemorySnapshot {
        let key = (conversation_id, include_summary);
        if let Some(snapshot) = self.cache.get(&key) {
            return snapshot;
        }

        let generation = self.generation(conversation_id);
        match self.store.recent_turns(conversation_id, self.max_turns * 2).await {
            Ok(turns) => {
                let snapshot = build_snapshot(conversation_id, turns, include_summary);
                self.cache_if_current(key, generation, snapshot.clone());
                snapshot
            }
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Memory load failed, continuing without memory");
                MemorySnapshot::empty(conversation_id)
            }
        }
    }

    /// Write the exchange atomically, the assistant turn one microsecond
    /// after the user turn, and drop the cached snapshot.
    pub async fn save_turns(
        &self,
        conversation_id: Uuid,
        user_text: &str,
        assistant_text: &str,
        assistant_meta: Meta,
    ) -> Result<(Turn, Turn)> {
        let now = Utc::now();
        let user = Turn::user(user_text, now);
        let assistant = Turn::assistant(
            assistant_text,
            now + chrono::Duration::microseconds(1),
            assistant_meta,
        );
        let saved = self.store.save_turn_pair(conversation_id, user, assistant).await;
        self.invalidate(conversation_id);
        saved
    }

    /// Drop cached snapshots and retire any load still in flight.
    pub fn invalidate(&self, conversation_id: Uuid) {
        let mut generation = self.generations.entry(conversation_id).or_insert(0);
        *generation += 1;
        self.cache.invalidate(&(conversation_id, true));
        self.cache.invalidate(&(conversation_id, false));
    }

    fn generation(&self, conversation_id: Uuid) -> u64 {
        self.generations.get(&conversation_id).map(|g| *g).unwrap_or(0)
    }

    /// The entry guard is held across the insert so a concurrent
    /// invalidate either sees the new entry or bumps first.
    fn cache_if_current(&self, key: (Uuid, bool), generation: u64, snapshot: MemorySnapshot) {
        let current = self.generations.entry(key.0).or_insert(0);
        if *current == generation {
            self.cache.insert(key, snapshot);
        } else {
            tracing::debug!(conversation_id = %key.0, "Memory changed during load, snapshot not cached");
        }
    }
}

/// Derive a snapshot from chronological turns.
pub fn build_snapshot(conversation_id: Uuid, messages: Vec<Turn>, include_summary: bool) -> MemorySnapshot {
    let key_facts = extract_key_facts(&messages);
    let flow = build_flow(&messages);
    let context_markers = context_markers(&messages, &key_facts);
    let summary = if include_summary {
        summarise(&messages, &key_facts)
    } else {
        None
    };

    let mut snapshot = MemorySnapshot {
        conversation_id,
        messages,
        key_facts,
        context_markers,
        flow,
        summary,
        checkpoint_hash: String::new(),
    };
    snapshot.checkpoint_hash = snapshot_hash(&snapshot);
    snapshot
}

pub(crate) fn snapshot_hash(snapshot: &MemorySnapshot) -> String {
    checkpoint_hash(&checkpoint_fields(snapshot))
}

/// Labelled sections for the rewriter prompt. Empty sections are omitted.
pub fn format_for_prompt(snapshot: &MemorySnapshot) -> String {
    let mut sections = Vec::new();

    if let Some(summary) = snapshot.summary.as_deref().filter(|s| !s.is_empty()) {
        sections.push(format!("【對話摘要】\n{}", summary));
    }
    if !snapshot.key_facts.user_mentions.is_empty() {
        sections.push(format!("【使用者資訊】\n{}", snapshot.key_facts.user_mentions.join("、")));
    }
    if !snapshot.key_facts.topics.is_empty() {
        sections.push(format!("【討論話題】\n{}", snapshot.key_facts.topics.join("、")));
    }
    if !snapshot.context_markers.is_empty() {
        let markers: Vec<&str> = snapshot
            .context_markers
            .iter()
            .take(PROMPT_MARKERS)
            .map(String::as_str)
            .collect();
        sections.push(format!("【對話脈絡】\n{}", markers.join("\n")));
    }
    if !snapshot.messages.is_empty() {
        let lines: Vec<String> = snapshot
            .recent(PROMPT_TURNS)
            .iter()
            .map(|t| {
                let speaker = match t.role {
                    Role::User => "使用者",
                    Role::Assistant => "助理",
                };
                format!("{}：{}", speaker, truncate_chars(&t.content, PROMPT_TURN_CHARS))
            })
            .collect();
        sections.push(format!("【最近對話】\n{}", lines.join("\n")));
    }

    sections.join("\n\n")
}

/// Compact verification record; `hash` is stable across runs.
pub fn checkpoint(snapshot: &MemorySnapshot) -> Value {
    let mut fields = checkpoint_fields(snapshot);
    let hash = checkpoint_hash(&fields);
    if let Value::Object(map) = &mut fields {
        map.insert("hash".into(), Value::String(hash));
    }
    fields
}

fn checkpoint_fields(snapshot: &MemorySnapshot) -> Value {
    let preview = |text: Option<&str>| truncate_chars(text.unwrap_or(""), CHECKPOINT_PREVIEW_CHARS);
    json!({
        "conversation_id": snapshot.conversation_id.to_string(),
        "message_count": snapshot.messages.len(),
        "key_topics": snapshot.key_facts.topics,
        "last_user_message": preview(snapshot.last_user_message()),
        "last_assistant_response": preview(snapshot.last_assistant_message()),
    })
}

/// Lower 32 bits of the MD5 of the serialised fields, as 8 hex digits.
/// `serde_json` keeps object keys sorted, so the input is canonical.
fn checkpoint_hash(fields: &Value) -> String {
    let digest = Md5::digest(fields.to_string().as_bytes());
    let low = u32::from_be_bytes([digest[12], digest[13], digest[14], digest[15]]);
    format!("{:08x}", low)
}

fn extract_key_facts(messages: &[Turn]) -> KeyFacts {
    let mut facts = KeyFacts::default();
    for turn in messages.iter().filter(|t| t.role == Role::User) {
        for m in SELF_INTRO_RE.find_iter(&turn.content) {
            let mention = m.as_str().to_string();
            if !facts.user_mentions.contains(&mention) {
                facts.user_mentions.push(mention);
            }
        }
        for topic in TOPIC_WORDS.iter().filter(|w| turn.content.contains(*w)) {
            if !facts.topics.iter().any(|t| t == topic) {
                facts.topics.push(topic.to_string());
            }
        }
        for emotion in EMOTION_MARKERS.iter().filter(|w| turn.content.contains(*w)) {
            facts.emotional_states.push(EmotionMention {
                emotion: emotion.to_string(),
                message: truncate_chars(&turn.content, CHECKPOINT_PREVIEW_CHARS),
            });
        }
    }
    facts
}

fn build_flow(messages: &[Turn]) -> Vec<FlowStep> {
    let mut flow: Vec<FlowStep> = Vec::new();
    let mut previous_topics: Vec<&str> = Vec::new();
    let mut iter = messages.iter().peekable();

    while let Some(turn) = iter.next() {
        if turn.role != Role::User {
            continue;
        }
        let reply = iter.next_if(|t| t.role == Role::Assistant);
        let meta = reply.and_then(|r| r.meta.as_ref());
        let user_intent = meta
            .and_then(|m| m.get("intent"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let assistant_action = match reply {
            Some(r) => r
                .care_stage()
                .map(|s| format!("S{}", s))
                .unwrap_or_else(|| "reply".to_string()),
            None => "none".to_string(),
        };
        let topics: Vec<&str> = TOPIC_WORDS
            .iter()
            .copied()
            .filter(|w| turn.content.contains(w))
            .collect();
        let continuity = !flow.is_empty() && topics.iter().any(|t| previous_topics.contains(t));
        flow.push(FlowStep {
            turn: flow.len() + 1,
            user_intent,
            assistant_action,
            continuity,
        });
        previous_topics = topics;
    }
    flow
}

fn context_markers(messages: &[Turn], facts: &KeyFacts) -> Vec<String> {
    let mut markers = Vec::new();
    if messages
        .iter()
        .any(|t| t.role == Role::User && CRISIS_MARKERS.iter().any(|m| t.content.contains(m)))
    {
        markers.push("曾出現危機訊號".to_string());
    }
    if let Some(stage) = messages.iter().rev().find_map(Turn::care_stage) {
        markers.push(format!("上次關懷階段：S{}", stage));
    }
    if let Some(emotion) = facts.emotional_states.last() {
        markers.push(format!("近期情緒：{}", emotion.emotion));
    }
    if let Some(topic) = facts.topics.last() {
        markers.push(format!("持續討論：{}", topic));
    }
    markers
}

fn summarise(messages: &[Turn], facts: &KeyFacts) -> Option<String> {
    if messages.len() < 4 {
        return None;
    }
    let exchanges = messages.iter().filter(|t| t.role == Role::User).count();
    let mut parts = vec![format!("已對話{}輪", exchanges)];
    if !facts.topics.is_empty() {
        parts.push(format!("話題：{}", facts.topics.join("、")));
    }
    let mut emotions: Vec<&str> = Vec::new();
    for e in &facts.emotional_states {
        if !emotions.contains(&e.emotion.as_str()) {
            emotions.push(&e.emotion);
        }
    }
    if !emotions.is_empty() {
        parts.push(format!("情緒：{}", emotions.join("、")));
    }
    Some(parts.join("；"))
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_with;

    fn service(store: &Store) -> MemoryService {
        MemoryService::new(store.clone(), &MemoryConfig::default())
    }

    #[tokio::test]
    async fn missing_conversation_gives_empty_snapshot() {
        let store = Store::open_in_memory().unwrap();
        let snapshot = service(&store).load_memory(Uuid::new_v4(), true).await;
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.checkpoint_hash.len(), 8);
        assert_eq!(format_for_prompt(&snapshot), "");
    }

    #[test]
    fn empty_snapshot_carries_a_checkpoint_hash() {
        let id = Uuid::new_v4();
        let snapshot = MemorySnapshot::empty(id);
        assert_eq!(snapshot.checkpoint_hash.len(), 8);
        assert!(snapshot.checkpoint_hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(checkpoint(&snapshot)["hash"], snapshot.checkpoint_hash.as_str());
        assert_eq!(snapshot.checkpoint_hash, build_snapshot(id, Vec::new(), false).checkpoint_hash);
    }

    #[tokio::test]
    async fn load_overtaken_by_save_does_not_cache_stale_snapshot() {
        let store = Store::open_in_memory().unwrap();
        let memory = service(&store);
        let id = Uuid::new_v4();
        store.ensure_conversation(id, "u1").await.unwrap();

        // A load that read the empty history, then lost the race to a save.
        let generation = memory.generation(id);
        let stale = build_snapshot(id, Vec::new(), true);
        memory.save_turns(id, "我叫小明", "你好小明", Meta::new()).await.unwrap();
        memory.cache_if_current((id, true), generation, stale);

        let loaded = memory.load_memory(id, true).await;
        assert_eq!(loaded.messages.len(), 2);
    }

    #[tokio::test]
    async fn save_then_load_sees_new_turns() {
        let store = Store::open_in_memory().unwrap();
        let memory = service(&store);
        let id = Uuid::new_v4();
        store.ensure_conversation(id, "u1").await.unwrap();

        assert!(memory.load_memory(id, true).await.is_empty());
        let mut meta = Meta::new();
        meta.insert("care_stage".into(), json!(1));
        let (user, assistant) = memory.save_turns(id, "我好難過", "我在這裡陪你。", meta).await.unwrap();
        assert_eq!(assistant.created_at - user.created_at, chrono::Duration::microseconds(1));

        // Cached empty snapshot was invalidated by the save.
        let snapshot = memory.load_memory(id, true).await;
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].role, Role::User);
        assert_eq!(snapshot.prior_stages().len(), 1);
    }

    #[tokio::test]
    async fn load_is_bounded_by_max_turns() {
        let store = Store::open_in_memory().unwrap();
        let memory = MemoryService::new(
            store.clone(),
            &MemoryConfig {
                max_turns: 2,
                ..MemoryConfig::default()
            },
        );
        let id = Uuid::new_v4();
        store.ensure_conversation(id, "u1").await.unwrap();
        for i in 0..4 {
            memory
                .save_turns(id, &format!("q{}", i), &format!("a{}", i), Meta::new())
                .await
                .unwrap();
        }
        let snapshot = memory.load_memory(id, false).await;
        let contents: Vec<_> = snapshot.messages.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["q2", "a2", "q3", "a3"]);
        assert!(snapshot.summary.is_none());
    }

    #[test]
    fn key_facts_and_prompt_sections() {
        let snapshot = memory_with(&[
            ("user", "我叫小明，最近想戒毒", None),
            ("assistant", "謝謝你願意說。", Some(1)),
            ("user", "家人很擔心我，我也很難過", None),
            ("assistant", "我在這裡陪你。", Some(2)),
        ]);
        assert_eq!(snapshot.key_facts.user_mentions, vec!["我叫小明"]);
        assert_eq!(snapshot.key_facts.topics, vec!["戒毒", "家人"]);
        let emotions: Vec<_> = snapshot.key_facts.emotional_states.iter().map(|e| e.emotion.as_str()).collect();
        assert_eq!(emotions, vec!["難過", "擔心"]);

        let prompt = format_for_prompt(&snapshot);
        for label in ["【對話摘要】", "【使用者資訊】", "【討論話題】", "【對話脈絡】", "【最近對話】"] {
            assert!(prompt.contains(label), "missing {}", label);
        }
        assert!(prompt.contains("使用者：我叫小明，最近想戒毒"));
        assert!(prompt.contains("上次關懷階段：S2"));
        assert_eq!(snapshot.flow.len(), 2);
        assert_eq!(snapshot.flow[1].assistant_action, "S2");
    }

    #[test]
    fn recent_turns_are_truncated() {
        let long = "很".repeat(150);
        let snapshot = memory_with(&[("user", long.as_str(), None)]);
        let prompt = format_for_prompt(&snapshot);
        let line = prompt.lines().find(|l| l.starts_with("使用者：")).unwrap();
        assert_eq!(line.chars().count(), "使用者：".chars().count() + 100);
    }

    #[test]
    fn checkpoint_is_deterministic() {
        let snapshot = memory_with(&[("user", "我想戒毒", None), ("assistant", "好的", Some(3))]);
        let a = checkpoint(&snapshot);
        let b = checkpoint(&snapshot.clone());
        assert_eq!(a, b);
        let hash = a["hash"].as_str().unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, snapshot.checkpoint_hash);
        assert_eq!(a["message_count"], 2);
        assert_eq!(a["last_user_message"], "我想戒毒");
    }
}
