//! Care-stage escalation.
//!
//! S1 is empathic acknowledgement, S2 companionship, S3 concrete resources.
//! The stage for a turn is a pure function of the stages used in the last
//! few assistant turns and the signals of the current analysis.

use serde::{Deserialize, Serialize};

use super::intent_analyzer::{Intent, RiskLevel};

/// Number of prior assistant turns the machine looks at.
pub const STAGE_HISTORY: usize = 5;

const POSITIVE_MARKERS: &[&str] = &["謝謝", "感謝", "好一點", "幫助", "理解", "支持"];
const NEGATIVE_MARKERS: &[&str] = &["沒用", "不行", "更糟", "無效", "失望", "放棄"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CareStage {
    S1 = 1,
    S2 = 2,
    S3 = 3,
}

impl CareStage {
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::S1),
            2 => Some(Self::S2),
            3 => Some(Self::S3),
            _ => None,
        }
    }

    /// One step up, saturating at S3.
    pub fn next(self) -> Self {
        match self {
            Self::S1 => Self::S2,
            Self::S2 | Self::S3 => Self::S3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::S1 => "S1",
            Self::S2 => "S2",
            Self::S3 => "S3",
        }
    }

    /// Directive handed to the rewriter.
    pub fn directive(self) -> &'static str {
        match self {
            Self::S1 => "第一階段（同理承接）：先接住對方的情緒，用自己的話複述感受，不急著給建議或資源。",
            Self::S2 => "第二階段（陪伴支持）：具體表達會陪著對方，例如「我在這裡陪你」，可以溫和地問一個關心的問題。",
            Self::S3 => "第三階段（具體資源）：自然地帶入可以求助的單位、電話或地址，資訊要完整準確。",
        }
    }
}

impl From<CareStage> for u8 {
    fn from(stage: CareStage) -> u8 {
        stage.number()
    }
}

impl TryFrom<u8> for CareStage {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Self::from_number(n).ok_or_else(|| format!("care stage must be 1..=3, got {}", n))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Effectiveness {
    Effective,
    Ineffective,
    Improving,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmotionTrend {
    Improving,
    Stable,
    Worsening,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TreatmentProgress {
    #[default]
    Initial,
    Ongoing,
    Stagnant,
    Breakthrough,
}

/// What the current turn tells the machine.
#[derive(Debug, Clone)]
pub struct StageSignals<'a> {
    pub risk_level: RiskLevel,
    pub intent: Intent,
    pub effectiveness: Effectiveness,
    pub treatment_progress: TreatmentProgress,
    pub emotional_state: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDecision {
    pub stage: CareStage,
    pub is_upgrade: bool,
    pub reason: String,
    pub upgrade_reason: String,
}

/// Pick the stage for this turn. `history` holds prior assistant stages in
/// chronological order; only the last [`STAGE_HISTORY`] are considered.
pub fn decide_stage(history: &[CareStage], signals: &StageSignals<'_>) -> StageDecision {
    let recent = tail(history);
    let last = recent.last().copied();

    let (stage, reason) = match last {
        _ if signals.risk_level == RiskLevel::High => match last {
            Some(CareStage::S1) if signals.effectiveness == Effectiveness::Ineffective => {
                (CareStage::S2, "高風險且同理承接無效".to_string())
            }
            _ => (CareStage::S1, "高風險，先穩定情緒".to_string()),
        },
        _ if signals.intent == Intent::Consultation => {
            (CareStage::S3, "使用者詢問具體資源".to_string())
        }
        None => (CareStage::S1, "初次接觸".to_string()),
        Some(prev) if signals.effectiveness == Effectiveness::Ineffective => {
            (prev.next(), format!("{}策略無效", prev.label()))
        }
        Some(prev) if recent.len() >= 2 && recent[recent.len() - 2] == prev => {
            (prev.next(), format!("連續兩次使用{}", prev.label()))
        }
        Some(_) if signals.treatment_progress == TreatmentProgress::Stagnant => {
            let dominant = mode(recent).unwrap_or(CareStage::S1);
            (dominant.next(), format!("{}反覆出現，進展停滯", dominant.label()))
        }
        Some(prev) if prev < CareStage::S3 && is_deteriorating(signals.emotional_state) => {
            (prev.next(), "情緒惡化".to_string())
        }
        Some(_) => (CareStage::S2, "持續陪伴".to_string()),
    };

    let is_upgrade = matches!(last, Some(prev) if stage > prev);
    let upgrade_reason = match last {
        Some(prev) if is_upgrade => format!("{}→{}：{}", prev.label(), stage.label(), reason),
        _ => String::new(),
    };

    StageDecision {
        stage,
        is_upgrade,
        reason,
        upgrade_reason,
    }
}

/// Judge how the user reacted, from the current input and the user turn
/// before it.
pub fn estimate_effectiveness(current: &str, previous_user: Option<&str>) -> Effectiveness {
    let texts = [Some(current), previous_user];
    let mentions = |markers: &[&str]| {
        texts
            .iter()
            .flatten()
            .any(|t| markers.iter().any(|m| t.contains(m)))
    };

    if mentions(POSITIVE_MARKERS) {
        return Effectiveness::Improving;
    }
    let repeated = previous_user.is_some_and(|p| !p.trim().is_empty() && p.trim() == current.trim());
    if repeated || mentions(NEGATIVE_MARKERS) {
        return Effectiveness::Ineffective;
    }
    Effectiveness::Unknown
}

pub fn treatment_progress(history: &[CareStage], effectiveness: Effectiveness) -> TreatmentProgress {
    let recent = tail(history);
    if recent.is_empty() {
        return TreatmentProgress::Initial;
    }
    if effectiveness == Effectiveness::Improving {
        return TreatmentProgress::Breakthrough;
    }
    if recent.len() >= 3 {
        if let Some(dominant) = mode(recent) {
            if recent.iter().filter(|s| **s == dominant).count() >= 3 {
                return TreatmentProgress::Stagnant;
            }
        }
    }
    TreatmentProgress::Ongoing
}

pub fn emotion_trend(history: &[CareStage], effectiveness: Effectiveness) -> EmotionTrend {
    match effectiveness {
        Effectiveness::Improving | Effectiveness::Effective => EmotionTrend::Improving,
        Effectiveness::Ineffective => EmotionTrend::Worsening,
        Effectiveness::Unknown if history.is_empty() => EmotionTrend::Unknown,
        Effectiveness::Unknown => EmotionTrend::Stable,
    }
}

fn tail(history: &[CareStage]) -> &[CareStage] {
    &history[history.len().saturating_sub(STAGE_HISTORY)..]
}

/// Most frequent stage; ties go to the most recent.
fn mode(stages: &[CareStage]) -> Option<CareStage> {
    let mut best: Option<(CareStage, usize)> = None;
    for stage in stages.iter().rev() {
        let count = stages.iter().filter(|s| *s == stage).count();
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((*stage, count));
        }
    }
    best.map(|(s, _)| s)
}

fn is_deteriorating(emotional_state: &str) -> bool {
    let state = emotional_state.trim().to_lowercase();
    ["despair", "anger", "絕望", "憤怒", "生氣"]
        .iter()
        .any(|s| state.contains(s))
}
