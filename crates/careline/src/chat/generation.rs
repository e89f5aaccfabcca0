//! Two-pass reply generation.
//!
//! [`PrimaryGenerator`] drafts a friendly answer from memory and the
//! retrieved snippet. [`MasterRewriter`] rewrites the draft under the care
//! stage directive and enforces the reply invariants afterwards, whatever
//! the model produced.

use chrono::{FixedOffset, Utc};

use super::{fallback_reply, TurnContext, CRISIS_LINE_SENTENCE, NO_INFO_REPLY};
use crate::config::LLMSettings;
use crate::error::Result;
use crate::llm::{ChatMessage, GenerationConfig, LLMManager};
use crate::memory::{format_for_prompt, MemorySnapshot};
use crate::rag::smart_rag::{ADDRESS_RE, PHONE_RE};
use crate::rag::{Intent, IntentAnalysis, RiskLevel};
use crate::types::Role;

pub const MAX_REPLY_CHARS: usize = 200;
pub const MAX_GREETING_CHARS: usize = 30;
const PRIMARY_MEMORY_TURNS: usize = 6;
const TAIPEI_OFFSET_SECS: i32 = 8 * 3600;

const PRIMARY_SYSTEM_PROMPT: &str = "你是高雄市毒品危害防制中心的線上陪伴者，說話像好朋友一樣自然、溫暖。\
請用繁體中文回答，句子簡短。若提供了參考資料，只能根據參考資料回答機構、電話、地址等事實，不可自行編造。";

const REWRITER_PERSONA: &str = "你是「小舒」，一位溫柔、穩定、不評價的陪伴者，負責把草稿潤飾成最後要說出口的話。";

const REWRITER_RULES: &str = "【避免】\n\
- 不說教、不批判、不使用「你應該」\n\
- 不提供任何取得或使用毒品的方法\n\
- 不編造機構、電話或地址，參考資料中的電話與地址必須原樣保留\n\
【語氣】\n\
- 口語、溫暖、像朋友傳訊息\n\
- 一次只問一個問題\n\
- 全文不超過200字，打招呼時不超過30字";

#[derive(Clone)]
pub struct PrimaryGenerator {
    llm: LLMManager,
    config: GenerationConfig,
}

impl PrimaryGenerator {
    pub fn new(llm: LLMManager, settings: &LLMSettings) -> Self {
        Self {
            llm,
            config: GenerationConfig {
                model: Some(settings.model_chat.clone()),
                max_tokens: settings.max_tokens,
                temperature: settings.temperature,
                timeout_ms: settings.timeout_secs * 1000,
                ..GenerationConfig::default()
            },
        }
    }

    pub async fn generate(&self, input: &str, memory: &MemorySnapshot, snippet: &str) -> Result<String> {
        let mut messages = vec![ChatMessage::system(PRIMARY_SYSTEM_PROMPT)];
        for turn in memory.recent(PRIMARY_MEMORY_TURNS) {
            messages.push(match turn.role {
                Role::User => ChatMessage::user(turn.content.clone()),
                Role::Assistant => ChatMessage::assistant(turn.content.clone()),
            });
        }

        let prompt = if snippet.is_empty() {
            input.to_string()
        } else {
            format!("{}\n\n【參考資料】{}", input, snippet)
        };
        messages.push(ChatMessage::user(prompt));

        let text = self.llm.generate(&messages, &self.config).await?;
        Ok(text.trim().to_string())
    }
}

#[derive(Clone)]
pub struct MasterRewriter {
    llm: LLMManager,
    config: GenerationConfig,
}

impl MasterRewriter {
    pub fn new(llm: LLMManager, settings: &LLMSettings) -> Self {
        Self {
            llm,
            config: GenerationConfig {
                model: Some(settings.model_chat.clone()),
                max_tokens: 400,
                temperature: settings.temperature,
                timeout_ms: settings.timeout_secs * 1000,
                ..GenerationConfig::default()
            },
        }
    }

    /// Final reply for the turn. Never fails: a provider error yields the
    /// static fallback, and every result passes through [`finalize_reply`].
    pub async fn rewrite(&self, ctx: &TurnContext) -> String {
        let analysis = &ctx.analysis;
        let snippet = ctx.snippet();

        if is_unanswerable(analysis, snippet) {
            tracing::info!(conversation_id = %ctx.conversation_id, "No retrieved facts for consultation");
            return finalize_reply(NO_INFO_REPLY, analysis, snippet);
        }

        let messages = [
            ChatMessage::system(self.system_prompt(analysis)),
            ChatMessage::user(rewrite_request(ctx)),
        ];

        let draft = match self.llm.generate(&messages, &self.config).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                tracing::warn!(conversation_id = %ctx.conversation_id, "Rewriter returned empty text");
                fallback_reply(analysis.risk_level).to_string()
            }
            Err(e) => {
                tracing::warn!(conversation_id = %ctx.conversation_id, error = %e, "Rewriter failed, using fallback");
                fallback_reply(analysis.risk_level).to_string()
            }
        };

        finalize_reply(&draft, analysis, snippet)
    }

    fn system_prompt(&self, analysis: &IntentAnalysis) -> String {
        format!(
            "{}\n\n【本輪關懷階段】{}\n{}\n\n{}\n\n現在時間：{}",
            REWRITER_PERSONA,
            analysis.care_stage_needed.label(),
            analysis.care_stage_needed.directive(),
            REWRITER_RULES,
            local_time(),
        )
    }
}

fn rewrite_request(ctx: &TurnContext) -> String {
    let analysis = &ctx.analysis;
    let memory = format_for_prompt(&ctx.memory);
    let snippet = ctx.snippet();
    let mut out = String::new();

    out.push_str(&format!("使用者剛說：{}\n", ctx.input));
    out.push_str(&format!(
        "分析：風險={} 意圖={} 情緒={} 策略成效={:?}\n",
        analysis.risk_level.as_str(),
        analysis.intent.as_str(),
        if analysis.emotional_state.is_empty() { "未知" } else { &analysis.emotional_state },
        analysis.strategy_effectiveness,
    ));
    if !analysis.care_stage_reason.is_empty() {
        out.push_str(&format!("階段理由：{}\n", analysis.care_stage_reason));
    }
    if !snippet.is_empty() {
        out.push_str(&format!("參考資料：{}\n", snippet));
    }
    if !memory.is_empty() {
        out.push_str(&format!("\n{}\n", memory));
    }
    out.push_str(&format!("\n草稿：{}\n\n請直接輸出潤飾後的回覆。", ctx.primary));
    out
}

fn local_time() -> String {
    match FixedOffset::east_opt(TAIPEI_OFFSET_SECS) {
        Some(offset) => Utc::now().with_timezone(&offset).format("%Y-%m-%d %H:%M").to_string(),
        None => Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
    }
}

/// A factual question we have nothing on.
fn is_unanswerable(analysis: &IntentAnalysis, snippet: &str) -> bool {
    analysis.intent == Intent::Consultation
        && analysis.risk_level != RiskLevel::High
        && snippet.trim().is_empty()
}

/// Enforce the reply invariants:
/// phones and addresses present in the snippet survive verbatim, high risk
/// replies mention 1995, greetings stay within 30 characters and every reply
/// within 200.
pub fn finalize_reply(draft: &str, analysis: &IntentAnalysis, snippet: &str) -> String {
    let body = draft
        .trim()
        .trim_matches(|c| matches!(c, '"' | '「' | '」'))
        .trim();

    let missing: Vec<&str> = PHONE_RE
        .find_iter(snippet)
        .chain(ADDRESS_RE.find_iter(snippet))
        .map(|m| m.as_str())
        .filter(|fact| !body.contains(fact))
        .fold(Vec::new(), |mut acc, fact| {
            if !acc.contains(&fact) {
                acc.push(fact);
            }
            acc
        });
    let crisis = if analysis.risk_level == RiskLevel::High && !body.contains("1995") {
        CRISIS_LINE_SENTENCE
    } else {
        ""
    };

    let limit = if analysis.intent == Intent::Greeting {
        MAX_GREETING_CHARS
    } else {
        MAX_REPLY_CHARS
    };

    // The crisis sentence is reserved first, then up to half the limit for
    // the draft. Facts that no longer fit are dropped whole rather than cut.
    let body_reserve = body.chars().count().min(limit / 2);
    let mut budget = limit
        .saturating_sub(crisis.chars().count())
        .saturating_sub(body_reserve);
    let mut kept: Vec<&str> = Vec::new();
    for fact in missing {
        let separator = if kept.is_empty() { 2 } else { 1 };
        let cost = fact.chars().count() + separator;
        if cost <= budget {
            budget -= cost;
            kept.push(fact);
        }
    }

    let mut appendix = String::new();
    if !kept.is_empty() {
        appendix.push_str(&format!("（{}）", kept.join("，")));
    }
    appendix.push_str(crisis);

    let room = limit.saturating_sub(appendix.chars().count());
    let mut reply = truncate_at_sentence(body, room);
    reply.push_str(&appendix);
    reply
}

/// Cut to `max` chars, preferring the last sentence end inside the window.
fn truncate_at_sentence(text: &str, max: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max {
        return text.to_string();
    }
    let window = &chars[..max];
    match window
        .iter()
        .rposition(|c| matches!(c, '。' | '！' | '？' | '!' | '?' | '～'))
    {
        Some(pos) if pos > 0 => window[..=pos].iter().collect(),
        _ => window.iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{TurnContext, CRISIS_FALLBACK_REPLY, GENERIC_FALLBACK_REPLY};
    use crate::memory::MemorySnapshot;
    use crate::rag::smart_rag::RagOutcome;
    use crate::test_support::{memory_with, FailingLLM, ScriptedLLM};
    use std::sync::Arc;
    use uuid::Uuid;

    fn analysis(risk: RiskLevel, intent: Intent) -> IntentAnalysis {
        IntentAnalysis {
            risk_level: risk,
            intent,
            ..IntentAnalysis::default()
        }
    }

    fn context(input: &str, analysis: IntentAnalysis, snippet: &str) -> TurnContext {
        let id = Uuid::new_v4();
        let mut ctx = TurnContext::new(id, "u1", input, MemorySnapshot::empty(id));
        ctx.analysis = analysis;
        if !snippet.is_empty() {
            ctx.rag = Some(RagOutcome {
                snippet: snippet.to_string(),
                ..RagOutcome::default()
            });
        }
        ctx.primary = "草稿".to_string();
        ctx
    }

    #[test]
    fn high_risk_reply_always_mentions_crisis_line() {
        let reply = finalize_reply("我在這裡陪你。", &analysis(RiskLevel::High, Intent::Crisis), "");
        assert!(reply.contains("1995"));
        assert!(reply.starts_with("我在這裡陪你。"));
    }

    #[test]
    fn lost_phone_and_address_are_appended() {
        let snippet = "高雄市毒品危害防制中心；07-713-4000；高雄市苓雅區凱旋二路130號";
        let reply = finalize_reply(
            "可以去毒防局看看喔。",
            &analysis(RiskLevel::Low, Intent::Consultation),
            snippet,
        );
        assert!(reply.contains("07-713-4000"));
        assert!(reply.contains("高雄市苓雅區凱旋二路130號"));
    }

    #[test]
    fn facts_already_present_are_not_repeated() {
        let snippet = "電話07-713-4000";
        let reply = finalize_reply("打07-713-4000就可以。", &analysis(RiskLevel::Low, Intent::Consultation), snippet);
        assert_eq!(reply.matches("07-713-4000").count(), 1);
    }

    #[test]
    fn greeting_is_capped_at_thirty_chars() {
        let long = "嗨嗨！很高興見到你。今天過得怎麼樣呢？有什麼想聊的都可以跟我說，我會一直在這裡陪著你，不管多晚都可以。";
        let reply = finalize_reply(long, &analysis(RiskLevel::None, Intent::Greeting), "");
        assert!(reply.chars().count() <= MAX_GREETING_CHARS);
        assert!(reply.ends_with('。') || reply.ends_with('？') || reply.ends_with('！'));
    }

    #[test]
    fn every_reply_is_capped_at_two_hundred_chars() {
        let long = "好".repeat(500);
        let reply = finalize_reply(&long, &analysis(RiskLevel::High, Intent::Crisis), "07-713-4000");
        assert!(reply.chars().count() <= MAX_REPLY_CHARS);
        assert!(reply.contains("1995"));
        assert!(reply.contains("07-713-4000"));
    }

    #[test]
    fn long_draft_keeps_appended_facts_whole() {
        let long = "我們一起想辦法。".repeat(40);
        let snippet = "專線07-713-4000，地址高雄市苓雅區凱旋二路130號";
        let reply = finalize_reply(&long, &analysis(RiskLevel::High, Intent::Crisis), snippet);
        assert!(reply.chars().count() <= MAX_REPLY_CHARS);
        assert!(reply.contains("07-713-4000"));
        assert!(reply.ends_with(CRISIS_LINE_SENTENCE));
    }

    #[test]
    fn greeting_with_facts_stays_within_greeting_cap() {
        let snippet = "專線07-713-4000，地址高雄市苓雅區凱旋二路130號";
        let reply = finalize_reply(
            "你好呀！很高興認識你。",
            &analysis(RiskLevel::None, Intent::Greeting),
            snippet,
        );
        assert!(reply.chars().count() <= MAX_GREETING_CHARS);
        assert!(reply.starts_with("你好呀！很高興認識你。"));
        assert!(reply.contains("（07-713-4000）"));
    }

    #[tokio::test]
    async fn provider_failure_yields_static_fallbacks() {
        let rewriter = MasterRewriter::new(LLMManager::new(Arc::new(FailingLLM)), &LLMSettings::default());

        let high = rewriter
            .rewrite(&context("活著好累", analysis(RiskLevel::High, Intent::Crisis), ""))
            .await;
        assert_eq!(high, CRISIS_FALLBACK_REPLY);

        let low = rewriter
            .rewrite(&context("嗯", analysis(RiskLevel::Low, Intent::Chat), ""))
            .await;
        assert_eq!(low, GENERIC_FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn consultation_without_snippet_says_not_recorded() {
        let llm = Arc::new(ScriptedLLM::new().with_default("某某醫院電話是02-0000-0000"));
        let rewriter = MasterRewriter::new(LLMManager::new(llm.clone()), &LLMSettings::default());
        let reply = rewriter
            .rewrite(&context("哪裡可以戒毒", analysis(RiskLevel::Low, Intent::Consultation), ""))
            .await;
        assert_eq!(reply, NO_INFO_REPLY);
        assert!(llm.prompts().is_empty());
    }

    #[tokio::test]
    async fn rewriter_prompt_carries_stage_directive_and_snippet() {
        let llm = Arc::new(ScriptedLLM::new().with_default("好的，我們一起想辦法。"));
        let rewriter = MasterRewriter::new(LLMManager::new(llm.clone()), &LLMSettings::default());
        let mut a = analysis(RiskLevel::Medium, Intent::EmotionalSupport);
        a.care_stage_needed = crate::rag::CareStage::S2;
        let reply = rewriter.rewrite(&context("好煩", a, "凱旋醫院")).await;

        assert_eq!(reply, "好的，我們一起想辦法。");
        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("S2"));
        assert!(prompt.contains(crate::rag::CareStage::S2.directive()));
        assert!(prompt.contains("參考資料：凱旋醫院"));
        assert!(prompt.contains("草稿：草稿"));
    }

    #[tokio::test]
    async fn primary_includes_recent_memory_and_snippet() {
        let llm = Arc::new(ScriptedLLM::new().with_default("  可以打電話問問看。 "));
        let generator = PrimaryGenerator::new(LLMManager::new(llm.clone()), &LLMSettings::default());
        let memory = memory_with(&[("user", "我想戒毒", None), ("assistant", "很棒的決定", Some(1))]);

        let text = generator.generate("要去哪裡", &memory, "凱旋醫院；07-751-3171").await.unwrap();
        assert_eq!(text, "可以打電話問問看。");
        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("我想戒毒"));
        assert!(prompt.contains("很棒的決定"));
        assert!(prompt.contains("【參考資料】凱旋醫院；07-751-3171"));
    }
}
