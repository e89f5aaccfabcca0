//! Per-turn intent and risk analysis.
//!
//! One JSON-mode generation call classifies the turn. Its output goes
//! through [`parse_layered`]; if nothing usable comes back, or the call
//! fails, a keyword scan of the user input stands in. Either way the care
//! stage is then decided deterministically from memory.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::LazyLock;

use super::care_stage::{
    self, CareStage, Effectiveness, EmotionTrend, StageSignals, TreatmentProgress,
};
use super::structured_output::{parse_layered, ParseConfidence};
use crate::config::LLMSettings;
use crate::llm::{ChatMessage, GenerationConfig, LLMManager};
use crate::memory::MemorySnapshot;
use crate::types::Role;

const HIGH_RISK_KEYWORDS: &[&str] = &[
    "自殺", "想死", "死了", "活不下去", "解脫", "結束", "不想活", "沒有明天", "傷害自己", "頂樓",
    "跳下", "割腕", "吃藥", "沒意義", "了結", "一了百了", "消失", "不在了", "撐不下去", "生不如死",
    "永遠睡", "不要醒", "最後一", "不用擔心我", "想好要怎麼做", "今晚過後", "跟家人說", "對不起",
];
const MEDIUM_RISK_KEYWORDS: &[&str] = &["痛苦", "絕望", "崩潰", "受不了", "好累", "好苦", "遺言", "交代"];
const HELP_KEYWORDS: &[&str] = &["戒毒", "戒癮", "治療", "機構", "哪裡", "電話", "地址", "毒防局"];
const GREETING_KEYWORDS: &[&str] = &["你好", "您好", "哈囉", "嗨", "早安", "午安", "晚安", "hello", "hi"];
static ASCII_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z]+").expect("word regex is valid"));

const SUBSTANCE_KEYWORDS: &[&str] = &[
    "安非他命", "海洛因", "K他命", "愷他命", "大麻", "搖頭丸", "古柯鹼", "冰毒", "喵喵", "咖啡包",
];
const EMOTION_KEYWORDS: &[(&str, &str)] = &[
    ("絕望", "despair"),
    ("生氣", "anger"),
    ("憤怒", "anger"),
    ("火大", "anger"),
    ("痛苦", "sad"),
    ("難過", "sad"),
    ("好累", "tired"),
    ("焦慮", "anxious"),
    ("害怕", "anxious"),
    ("擔心", "anxious"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    Help,
    Consultation,
    Crisis,
    EmotionalSupport,
    #[default]
    Chat,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::Help => "help",
            Intent::Consultation => "consultation",
            Intent::Crisis => "crisis",
            Intent::EmotionalSupport => "emotional_support",
            Intent::Chat => "chat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Immediate,
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub substances: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub symptoms: Vec<String>,
}

/// Fully populated classification of one user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub risk_level: RiskLevel,
    pub intent: Intent,
    pub need_rag: bool,
    pub search_keywords: Vec<String>,
    pub entities: Entities,
    pub emotional_state: String,
    pub urgency: Urgency,
    pub care_stage_needed: CareStage,
    pub care_stage_reason: String,
    pub previous_stages_tried: Vec<u8>,
    pub strategy_effectiveness: Effectiveness,
    pub emotion_trend: EmotionTrend,
    pub treatment_progress: TreatmentProgress,
    pub upgrade_reason: String,
    pub is_upgrade: bool,
    pub confidence_level: f32,
}

impl Default for IntentAnalysis {
    fn default() -> Self {
        Self {
            risk_level: RiskLevel::None,
            intent: Intent::Chat,
            need_rag: false,
            search_keywords: Vec::new(),
            entities: Entities::default(),
            emotional_state: "unknown".to_string(),
            urgency: Urgency::Normal,
            care_stage_needed: CareStage::S1,
            care_stage_reason: String::new(),
            previous_stages_tried: Vec::new(),
            strategy_effectiveness: Effectiveness::Unknown,
            emotion_trend: EmotionTrend::Unknown,
            treatment_progress: TreatmentProgress::Initial,
            upgrade_reason: String::new(),
            is_upgrade: false,
            confidence_level: 0.5,
        }
    }
}

impl IntentAnalysis {
    /// Field-by-field conversion; anything missing or malformed keeps its
    /// default.
    pub fn from_json(object: &Map<String, Value>) -> Self {
        let mut analysis = Self::default();
        if let Some(v) = enum_field(object, "risk_level") {
            analysis.risk_level = v;
        }
        if let Some(v) = enum_field(object, "intent") {
            analysis.intent = v;
        }
        if let Some(v) = object.get("need_rag").and_then(as_bool) {
            analysis.need_rag = v;
        }
        if let Some(v) = object.get("search_keywords").map(string_list) {
            analysis.search_keywords = v;
        }
        if let Some(Value::Object(e)) = object.get("entities") {
            analysis.entities = Entities {
                substances: e.get("substances").map(string_list).unwrap_or_default(),
                locations: e.get("locations").map(string_list).unwrap_or_default(),
                symptoms: e.get("symptoms").map(string_list).unwrap_or_default(),
            };
        }
        if let Some(Value::String(s)) = object.get("emotional_state") {
            if !s.trim().is_empty() {
                analysis.emotional_state = s.trim().to_string();
            }
        }
        if let Some(v) = enum_field(object, "urgency") {
            analysis.urgency = v;
        }
        if let Some(stage) = object
            .get("care_stage_needed")
            .and_then(|v| v.as_u64().or_else(|| v.as_str()?.trim().parse().ok()))
            .and_then(|n| u8::try_from(n).ok())
            .and_then(CareStage::from_number)
        {
            analysis.care_stage_needed = stage;
        }
        if let Some(Value::String(s)) = object.get("care_stage_reason") {
            analysis.care_stage_reason = s.clone();
        }
        if let Some(v) = enum_field(object, "strategy_effectiveness") {
            analysis.strategy_effectiveness = v;
        }
        if let Some(v) = object.get("confidence_level").and_then(Value::as_f64) {
            analysis.confidence_level = (v as f32).clamp(0.0, 1.0);
        }
        analysis
    }
}

/// An analysis and how much of it came from the model.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub analysis: IntentAnalysis,
    pub confidence: ParseConfidence,
}

#[derive(Clone)]
pub struct IntentAnalyzer {
    llm: LLMManager,
    model: String,
    timeout_ms: u64,
}

impl IntentAnalyzer {
    pub fn new(llm: LLMManager, settings: &LLMSettings) -> Self {
        Self {
            llm,
            model: settings.model_analysis.clone(),
            timeout_ms: settings.timeout_secs * 1000,
        }
    }

    /// Never fails: provider errors and unparseable output fall back to the
    /// keyword scan.
    pub async fn analyze(&self, input: &str, memory: &MemorySnapshot) -> AnalysisOutcome {
        let history = memory.prior_stages();
        let messages = vec![
            ChatMessage::system(ANALYSIS_SYSTEM_PROMPT),
            ChatMessage::user(build_analysis_prompt(input, memory, &history)),
        ];
        let config = GenerationConfig {
            model: Some(self.model.clone()),
            max_tokens: 600,
            temperature: 0.1,
            force_json: true,
            timeout_ms: self.timeout_ms,
            ..GenerationConfig::default()
        };

        let parsed = match self.llm.generate(&messages, &config).await {
            Ok(raw) => parse_layered(&raw, &required_defaults(), backfill_from_text),
            Err(e) => {
                tracing::warn!(error = %e, "Intent analysis failed, using keyword fallback");
                None
            }
        };

        let (mut analysis, confidence) = match parsed {
            Some(p) => (IntentAnalysis::from_json(&p.object), p.confidence),
            None => (keyword_analysis(input), ParseConfidence::Fallback),
        };
        apply_care_stage(&mut analysis, input, memory, &history);

        tracing::info!(
            risk = analysis.risk_level.as_str(),
            intent = analysis.intent.as_str(),
            need_rag = analysis.need_rag,
            care_stage = analysis.care_stage_needed.number(),
            is_upgrade = analysis.is_upgrade,
            confidence = ?confidence,
            "Intent analysed"
        );
        AnalysisOutcome {
            analysis,
            confidence,
        }
    }
}

/// Deterministic classification from the user input alone.
pub fn keyword_analysis(input: &str) -> IntentAnalysis {
    let text = input.trim();
    let lowered = text.to_lowercase();
    let mut analysis = IntentAnalysis {
        confidence_level: 0.3,
        ..IntentAnalysis::default()
    };

    let high: Vec<&str> = matching(text, HIGH_RISK_KEYWORDS);
    let medium: Vec<&str> = matching(text, MEDIUM_RISK_KEYWORDS);
    let help: Vec<&str> = matching(text, HELP_KEYWORDS);

    if !high.is_empty() {
        analysis.risk_level = RiskLevel::High;
        analysis.intent = Intent::Crisis;
        analysis.urgency = Urgency::Immediate;
        analysis.confidence_level = 0.7;
    } else if !medium.is_empty() {
        analysis.risk_level = RiskLevel::Medium;
        analysis.intent = Intent::Crisis;
        analysis.urgency = Urgency::High;
        analysis.confidence_level = 0.6;
    } else if !help.is_empty() {
        analysis.intent = Intent::Consultation;
        analysis.need_rag = true;
        analysis.search_keywords = help.iter().map(|s| s.to_string()).collect();
        analysis.confidence_level = 0.6;
    } else if text.chars().count() <= 8 && GREETING_KEYWORDS.iter().any(|g| lowered.contains(g)) {
        analysis.intent = Intent::Greeting;
        analysis.confidence_level = 0.6;
    }

    analysis.entities.substances = matching(text, SUBSTANCE_KEYWORDS)
        .into_iter()
        .map(String::from)
        .collect();
    if let Some((_, state)) = EMOTION_KEYWORDS.iter().find(|(k, _)| text.contains(k)) {
        analysis.emotional_state = state.to_string();
    }
    analysis
}

/// Overwrite the stage fields with the deterministic decision.
fn apply_care_stage(
    analysis: &mut IntentAnalysis,
    input: &str,
    memory: &MemorySnapshot,
    history: &[CareStage],
) {
    let heuristic = care_stage::estimate_effectiveness(input, memory.last_user_message());
    if heuristic != Effectiveness::Unknown {
        analysis.strategy_effectiveness = heuristic;
    }
    let effectiveness = analysis.strategy_effectiveness;
    analysis.treatment_progress = care_stage::treatment_progress(history, effectiveness);
    analysis.emotion_trend = care_stage::emotion_trend(history, effectiveness);

    let decision = care_stage::decide_stage(
        history,
        &StageSignals {
            risk_level: analysis.risk_level,
            intent: analysis.intent,
            effectiveness,
            treatment_progress: analysis.treatment_progress,
            emotional_state: &analysis.emotional_state,
        },
    );
    analysis.care_stage_needed = decision.stage;
    analysis.is_upgrade = decision.is_upgrade;
    analysis.upgrade_reason = decision.upgrade_reason;
    analysis.care_stage_reason = decision.reason;
    analysis.previous_stages_tried = history.iter().map(|s| s.number()).collect();
}

fn required_defaults() -> Map<String, Value> {
    let mut defaults = Map::new();
    defaults.insert("risk_level".into(), json!("none"));
    defaults.insert("intent".into(), json!("chat"));
    defaults.insert("need_rag".into(), json!(false));
    defaults.insert("search_keywords".into(), json!([]));
    defaults.insert("entities".into(), json!({}));
    defaults.insert("emotional_state".into(), json!("unknown"));
    defaults.insert("urgency".into(), json!("normal"));
    defaults
}

/// Recover labels from prose such as "risk: high, this is a crisis".
fn backfill_from_text(raw: &str) -> Option<Map<String, Value>> {
    let lowered = raw.to_lowercase();
    // Whole words only: "follow" is not "low", "helpful" is not "help".
    let words: HashSet<&str> = ASCII_WORD_RE.find_iter(&lowered).map(|m| m.as_str()).collect();
    let mut object = Map::new();

    if words.contains("high") || words.contains("crisis") {
        object.insert("risk_level".into(), json!("high"));
        object.insert("intent".into(), json!("crisis"));
    } else if words.contains("medium") {
        object.insert("risk_level".into(), json!("medium"));
    } else if words.contains("low") {
        object.insert("risk_level".into(), json!("low"));
    }

    if !object.contains_key("intent") {
        let intent = ["consultation", "help", "emotional", "greeting"]
            .into_iter()
            .find(|k| words.contains(k));
        match intent {
            Some("consultation") => {
                object.insert("intent".into(), json!("consultation"));
                object.insert("need_rag".into(), json!(true));
            }
            Some("help") => {
                object.insert("intent".into(), json!("help"));
                object.insert("need_rag".into(), json!(true));
            }
            Some("emotional") => {
                object.insert("intent".into(), json!("emotional_support"));
            }
            Some("greeting") => {
                object.insert("intent".into(), json!("greeting"));
            }
            _ => {}
        }
    }

    (!object.is_empty()).then_some(object)
}

fn build_analysis_prompt(input: &str, memory: &MemorySnapshot, history: &[CareStage]) -> String {
    let mut prompt = String::new();
    if !memory.is_empty() {
        prompt.push_str("【最近對話】\n");
        for turn in memory.recent(6) {
            let speaker = match turn.role {
                Role::User => "使用者",
                Role::Assistant => "助理",
            };
            let content: String = turn.content.chars().take(100).collect();
            prompt.push_str(&format!("{}：{}\n", speaker, content));
        }
        prompt.push('\n');
    }
    if !history.is_empty() {
        let stages: Vec<&str> = history.iter().map(|s| s.label()).collect();
        prompt.push_str(&format!("【先前使用的關懷階段】{}\n\n", stages.join(" → ")));
    }
    prompt.push_str(&format!("【使用者當前訊息】{}\n\n請輸出JSON。", input));
    prompt
}

fn matching<'a>(text: &str, keywords: &[&'a str]) -> Vec<&'a str> {
    keywords.iter().copied().filter(|k| text.contains(k)).collect()
}

fn enum_field<T: serde::de::DeserializeOwned>(object: &Map<String, Value>, key: &str) -> Option<T> {
    let raw = object.get(key)?.as_str()?.trim().to_lowercase();
    serde_json::from_value(Value::String(raw)).ok()
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split([',', '，', '、'])
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

const ANALYSIS_SYSTEM_PROMPT: &str = r#"你是藥物危害防制關懷服務的分析員。閱讀使用者訊息與最近對話，只輸出一個JSON物件，不要加任何說明。

意圖類別（intent）：
- greeting：打招呼、寒暄
- help：想戒毒、想求助但沒有問具體資訊
- consultation：詢問機構、電話、地址、時間、費用等具體資訊
- crisis：有自傷或輕生的訊號，或極度痛苦
- emotional_support：抒發情緒、需要陪伴
- chat：其他閒聊

need_rag：只有在使用者詢問服務、聯絡方式、地點、時間、費用，或需要提供具體資源時才為true。

風險等級（risk_level）：
- high：明示或隱喻的自傷意圖、提到地點或方法、極度絕望
- medium：有自傷念頭但沒有計畫、極度痛苦
- low：一般情緒困擾
- none：其他

關懷階段（care_stage_needed）：1＝同理承接，2＝陪伴支持，3＝具體資源。
- 高風險時優先回到1，除非上一次就是1且無效
- 詢問具體資訊直接用3
- 上一階段無效、連續兩次同一階段、進展停滯或情緒惡化時往上升一級（最高3）

輸出格式：
{"risk_level":"none|low|medium|high","intent":"greeting|help|consultation|crisis|emotional_support|chat","need_rag":false,"search_keywords":[],"entities":{"substances":[],"locations":[],"symptoms":[]},"emotional_state":"","urgency":"immediate|high|normal|low","care_stage_needed":1,"care_stage_reason":"","strategy_effectiveness":"effective|ineffective|improving|unknown","confidence_level":0.8}"#;
