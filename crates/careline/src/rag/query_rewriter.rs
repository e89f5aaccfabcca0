//! Query Rewriting Module
//!
//! Cleans colloquial input and resolves pronouns against recent memory so
//! that retrieval sees a self-contained query. The model is tried first;
//! the rule-based path is the fallback and never fails.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::config::LLMSettings;
use crate::llm::{ChatMessage, GenerationConfig, LLMManager};
use crate::memory::MemorySnapshot;
use crate::types::Role;

const FILLERS: &[char] = &['嗯', '啊', '欸', '呃', '唉', '喔', '哦'];
const PRONOUNS: &[&str] = &["他們", "她們", "它們", "那個", "這個", "那裡", "這裡", "他", "她", "它"];
/// Characters that turn a following 他/她/它 into an ordinary word (其他, 吉他).
const NON_PRONOUN_PREFIXES: &[char] = &['其', '吉'];
const SHORT_ASKS: &[&str] = &["的電話", "的地址", "在哪", "怎麼去", "什麼時間", "要多少錢", "有什麼服務"];
/// Memory entries consulted for pronoun resolution.
const CONTEXT_WINDOW: usize = 6;

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Han}A-Za-z]{0,20}?(?:醫院|中心|機構|基金會|毒防局)").expect("entity regex is valid")
});
static LEAD_IN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:你知道|妳知道|請問|我想問|想問|知道|關於|有沒有|我要去|我想去|去|在)+")
        .expect("lead-in regex is valid")
});
static TRAILING_PARTICLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[啦耶齁捏咧]+([？?！!。]*)$").expect("particle regex is valid")
});
static ELLIPSIS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\.{3,}|…+|。{2,})").expect("ellipsis regex is valid"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewrittenQuery {
    pub original_query: String,
    pub rewritten_query: String,
    pub used_context: bool,
    pub explanation: String,
}

#[derive(Clone)]
pub struct QueryRewriter {
    llm: Option<LLMManager>,
    model: String,
    timeout_ms: u64,
}

impl QueryRewriter {
    pub fn new(llm: LLMManager, settings: &LLMSettings) -> Self {
        Self {
            llm: Some(llm),
            model: settings.model_analysis.clone(),
            timeout_ms: settings.timeout_secs * 1000,
        }
    }

    /// Rules only, no model calls.
    pub fn rule_based() -> Self {
        Self {
            llm: None,
            model: String::new(),
            timeout_ms: 0,
        }
    }

    /// Strip fillers and collapse repetition. Short or already clean input
    /// is returned unchanged.
    pub async fn clean(&self, input: &str) -> String {
        if is_already_clean(input) {
            return input.to_string();
        }
        let messages = vec![ChatMessage::system(CLEAN_SYSTEM_PROMPT), ChatMessage::user(input)];
        match self.ask(&messages).await {
            Some(cleaned) if plausible_rewrite(input, &cleaned) => cleaned,
            _ => clean_rule_based(input),
        }
    }

    /// Make the turn self-contained using the last few memory entries.
    pub async fn contextualise(&self, input: &str, memory: &MemorySnapshot) -> RewrittenQuery {
        let cleaned = self.clean(input).await;
        let unchanged = |explanation: &str| RewrittenQuery {
            original_query: input.to_string(),
            rewritten_query: cleaned.clone(),
            used_context: false,
            explanation: explanation.to_string(),
        };

        if memory.is_empty() {
            return unchanged("no memory");
        }
        if !needs_context(&cleaned) {
            return unchanged("self-contained");
        }

        let recent = memory.recent(CONTEXT_WINDOW);
        let mut history = String::new();
        for turn in recent {
            let speaker = match turn.role {
                Role::User => "使用者",
                Role::Assistant => "助理",
            };
            history.push_str(&format!("{}：{}\n", speaker, turn.content));
        }
        let messages = vec![
            ChatMessage::system(CONTEXTUALISE_SYSTEM_PROMPT),
            ChatMessage::user(format!("【對話紀錄】\n{}\n【目前問題】{}", history, cleaned)),
        ];

        if let Some(rewritten) = self.ask(&messages).await {
            if plausible_rewrite(&cleaned, &rewritten) {
                return RewrittenQuery {
                    original_query: input.to_string(),
                    rewritten_query: rewritten,
                    used_context: true,
                    explanation: "model rewrite".to_string(),
                };
            }
        }

        let rewritten = resolve_rule_based(&cleaned, recent.iter().map(|t| t.content.as_str()));
        let used_context = rewritten != cleaned;
        RewrittenQuery {
            original_query: input.to_string(),
            rewritten_query: rewritten,
            used_context,
            explanation: if used_context {
                "pronoun resolved from memory".to_string()
            } else {
                "no entity in memory".to_string()
            },
        }
    }

    async fn ask(&self, messages: &[ChatMessage]) -> Option<String> {
        let llm = self.llm.as_ref()?;
        let config = GenerationConfig {
            model: Some(self.model.clone()),
            max_tokens: 120,
            temperature: 0.0,
            timeout_ms: self.timeout_ms,
            ..GenerationConfig::default()
        };
        match llm.generate(messages, &config).await {
            Ok(text) => {
                let line = text
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())?
                    .trim_matches(|c| c == '"' || c == '「' || c == '」')
                    .to_string();
                (!line.is_empty()).then_some(line)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Query rewrite failed, using rules");
                None
            }
        }
    }
}

pub fn is_already_clean(input: &str) -> bool {
    let text = input.trim();
    if text.chars().count() < 5 {
        return true;
    }
    let has_filler = text.chars().any(|c| FILLERS.contains(&c));
    let ellipses = ELLIPSIS_RE.find_iter(text).count();
    let questions = text.chars().filter(|c| *c == '?' || *c == '？').count();
    !has_filler && ellipses <= 1 && questions <= 2 && !has_triple_repeat(text)
}

pub fn clean_rule_based(input: &str) -> String {
    let text = input.trim();
    if is_already_clean(text) {
        return text.to_string();
    }

    let without_fillers: String = text.chars().filter(|c| !FILLERS.contains(c)).collect();
    let collapsed = collapse_repeats(&without_fillers);
    let ellipsis_normalised = ELLIPSIS_RE.replace_all(&collapsed, "…");
    let particles_stripped = TRAILING_PARTICLE_RE.replace(&ellipsis_normalised, "$1");
    let result = particles_stripped
        .trim_start_matches(['，', ',', ' ', '…'])
        .trim()
        .to_string();

    if result.is_empty() {
        text.to_string()
    } else {
        result
    }
}

fn needs_context(text: &str) -> bool {
    if find_pronoun(text).is_some() {
        return true;
    }
    SHORT_ASKS.iter().any(|a| text.contains(a)) && ENTITY_RE.find(text).is_none()
}

/// Replace the first pronoun with the most recent entity in `history`, or
/// prefix the entity when the subject was dropped.
fn resolve_rule_based<'a>(text: &str, history: impl DoubleEndedIterator<Item = &'a str>) -> String {
    let Some(entity) = history.rev().find_map(last_entity) else {
        return text.to_string();
    };
    if let Some((at, pronoun)) = find_pronoun(text) {
        let mut resolved = text.to_string();
        resolved.replace_range(at..at + pronoun.len(), &entity);
        return resolved;
    }
    format!("{}{}", entity, text)
}

/// First pronoun occurrence in `PRONOUNS` order, as a byte offset.
fn find_pronoun(text: &str) -> Option<(usize, &'static str)> {
    PRONOUNS.iter().find_map(|&pronoun| {
        text.match_indices(pronoun)
            .map(|(at, _)| at)
            .find(|&at| {
                pronoun.chars().count() > 1
                    || !text[..at]
                        .chars()
                        .next_back()
                        .is_some_and(|c| NON_PRONOUN_PREFIXES.contains(&c))
            })
            .map(|at| (at, pronoun))
    })
}

/// Last institution-like name mentioned in `text`.
pub fn last_entity(text: &str) -> Option<String> {
    ENTITY_RE
        .find_iter(text)
        .last()
        .map(|m| LEAD_IN_RE.replace(m.as_str(), "").to_string())
        .filter(|e| e.chars().count() >= 3)
}

fn has_triple_repeat(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    chars
        .windows(3)
        .any(|w| w[0] == w[1] && w[1] == w[2] && !w[0].is_ascii_digit() && w[0] != '.')
}

/// Runs of three or more identical characters shrink to two. Digits are
/// left alone so phone numbers survive.
fn collapse_repeats(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    let mut run = 0;
    for c in text.chars() {
        if Some(c) == prev {
            run += 1;
        } else {
            prev = Some(c);
            run = 1;
        }
        if run <= 2 || c.is_ascii_digit() || c == '.' {
            out.push(c);
        }
    }
    out
}

fn plausible_rewrite(original: &str, rewritten: &str) -> bool {
    let n = rewritten.chars().count();
    n > 0 && n <= original.chars().count() * 3 + 40
}

const CLEAN_SYSTEM_PROMPT: &str = "請整理口語輸入：去掉語助詞（嗯、啊、欸、呃）、把重複的字縮短、保留原意與所有數字。只輸出整理後的一句話。";

const CONTEXTUALISE_SYSTEM_PROMPT: &str = "根據對話紀錄，把目前問題改寫成完整獨立的查詢：把代名詞（他、她、它、他們、那個、這個、那裡、這裡）換成實際指的機構或對象，補上省略的主詞。只輸出改寫後的一句話。";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_with, ScriptedLLM};
    use std::sync::Arc;

    #[test]
    fn short_or_clean_input_is_untouched() {
        assert_eq!(clean_rule_based("嗯好"), "嗯好");
        assert_eq!(clean_rule_based("凱旋醫院的門診時間？"), "凱旋醫院的門診時間？");
        assert!(is_already_clean("請問毒防局的電話是07-713-4000嗎"));
    }

    #[test]
    fn fillers_and_repeats_are_removed() {
        assert_eq!(clean_rule_based("嗯...我頭痛痛痛痛的啦"), "我頭痛痛的");
        assert_eq!(clean_rule_based("呃，那個戒毒要去哪裡啊"), "那個戒毒要去哪裡");
    }

    #[test]
    fn entity_lead_ins_are_trimmed() {
        assert_eq!(last_entity("你知道凱旋醫院嗎？").as_deref(), Some("凱旋醫院"));
        assert_eq!(
            last_entity("高雄市毒品危害防制中心 凱旋二路").as_deref(),
            Some("高雄市毒品危害防制中心")
        );
        assert_eq!(last_entity("知道。"), None);
    }

    #[test]
    fn words_containing_pronoun_chars_are_not_pronouns() {
        assert!(!needs_context("其他機構有哪些"));
        assert!(!needs_context("我想學吉他"));
        assert!(needs_context("其他人說他很好"));
        assert_eq!(
            resolve_rule_based("其他醫院跟他比呢", ["你知道凱旋醫院嗎？"].into_iter()),
            "其他醫院跟凱旋醫院比呢"
        );
    }

    #[tokio::test]
    async fn other_institutions_query_stays_unchanged() {
        let memory = memory_with(&[("user", "你知道凱旋醫院嗎？", None)]);
        let q = QueryRewriter::rule_based().contextualise("其他機構有哪些", &memory).await;
        assert!(!q.used_context);
        assert_eq!(q.rewritten_query, "其他機構有哪些");
    }

    #[tokio::test]
    async fn pronoun_resolved_by_rules_when_model_fails() {
        let memory = memory_with(&[("user", "你知道凱旋醫院嗎？", None), ("assistant", "知道。", Some(1))]);
        let llm = ScriptedLLM::new().fail_on("改寫成完整獨立的查詢");
        let rewriter = QueryRewriter::new(LLMManager::new(Arc::new(llm)), &LLMSettings::default());
        let q = rewriter.contextualise("他們的電話是多少？", &memory).await;
        assert!(q.used_context);
        assert_eq!(q.rewritten_query, "凱旋醫院的電話是多少？");
    }

    #[tokio::test]
    async fn model_rewrite_is_preferred() {
        let memory = memory_with(&[("user", "你知道凱旋醫院嗎？", None), ("assistant", "知道。", Some(1))]);
        let llm = ScriptedLLM::new().on("改寫成完整獨立的查詢", "凱旋醫院的聯絡電話");
        let rewriter = QueryRewriter::new(LLMManager::new(Arc::new(llm)), &LLMSettings::default());
        let q = rewriter.contextualise("他們的電話是多少？", &memory).await;
        assert_eq!(q.rewritten_query, "凱旋醫院的聯絡電話");
        assert_eq!(q.explanation, "model rewrite");
    }

    #[tokio::test]
    async fn dropped_subject_gets_entity_prefix() {
        let memory = memory_with(&[("user", "基督教晨曦會基金會很有名", None)]);
        let q = QueryRewriter::rule_based().contextualise("在哪", &memory).await;
        assert_eq!(q.rewritten_query, "基督教晨曦會基金會在哪");
    }

    #[tokio::test]
    async fn self_contained_query_skips_model() {
        let memory = memory_with(&[("user", "你好", None)]);
        let llm = Arc::new(ScriptedLLM::new());
        let rewriter = QueryRewriter::new(LLMManager::new(llm.clone()), &LLMSettings::default());
        let q = rewriter.contextualise("毒防局在哪裡", &memory).await;
        assert_eq!(q.rewritten_query, "毒防局在哪裡");
        assert!(!q.used_context);
        assert!(llm.prompts().is_empty());
    }
}
