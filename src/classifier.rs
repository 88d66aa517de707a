//! Query intent classification with ship-parameter extraction.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Question intent, chosen by bilingual trigger lexicons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Does a requirement apply to this ship.
    Applicability,
    /// A numeric or dimensional lookup.
    Specification,
    /// How to carry something out.
    Procedure,
    /// Contrast between provisions.
    Comparison,
    /// What a term means.
    Definition,
    /// No lexicon matched.
    General,
}

/// Model preference attached to an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelHint {
    /// Higher-capacity model.
    Primary,
    /// Low-latency model.
    Fast,
}

/// Ship parameters extracted from the utterance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipInfo {
    /// Normalised ship type from the closed enumeration.
    pub ship_type: Option<String>,
    /// Length in metres.
    pub length_m: Option<u32>,
    /// Gross tonnage.
    pub tonnage: Option<u32>,
}

impl ShipInfo {
    /// True when a numeric ship parameter was found.
    pub fn has_dimensions(&self) -> bool {
        self.length_m.is_some() || self.tonnage.is_some()
    }
}

/// Classifier output driving retrieval depth and model routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Chosen intent.
    pub intent: Intent,
    /// Extracted ship parameters.
    pub ship_info: ShipInfo,
    /// Candidate count handed to the retriever.
    pub top_k: usize,
    /// Model preference; `None` for the general fallback.
    pub model_hint: Option<ModelHint>,
}

/// Intent precedence with bilingual triggers. First match in this order wins.
const INTENT_TABLE: &[(Intent, &[&str], &[&str], usize, Option<ModelHint>)] = &[
    (
        Intent::Applicability,
        &[
            "是否需要", "需不需要", "是否适用", "适用于", "要不要", "必须", "强制", "需要配备",
            "是否要求",
        ],
        &[
            "do i need",
            "is it required",
            "does it apply",
            "must i",
            "is it mandatory",
            "applicable to",
        ],
        12,
        Some(ModelHint::Primary),
    ),
    (
        Intent::Comparison,
        &["区别", "不同", "比较", "对比"],
        &["difference", "compare", "versus", " vs "],
        10,
        Some(ModelHint::Primary),
    ),
    (
        Intent::Specification,
        &[
            "最小", "最大", "多少", "尺寸", "数量", "间距", "高度", "宽度", "面积", "速度", "时间",
        ],
        &[
            "minimum", "maximum", "how many", "dimension", "size", "spacing", "height", "width",
        ],
        5,
        Some(ModelHint::Fast),
    ),
    (
        Intent::Procedure,
        &["怎么", "如何", "步骤", "流程", "程序", "操作"],
        &["how to", "procedure", "steps", "process"],
        8,
        Some(ModelHint::Primary),
    ),
    (
        Intent::Definition,
        &["什么是", "定义", "解释", "含义", "是什么意思"],
        &["what is", "define", "meaning of", "explanation"],
        5,
        Some(ModelHint::Fast),
    ),
];

const GENERAL_TOP_K: usize = 8;

/// Bilingual ship-type phrases mapped onto the closed enumeration used by
/// applicability filtering. First match wins.
const SHIP_TYPE_MAP: &[(&str, &str)] = &[
    ("散货船", "bulk carrier"),
    ("集装箱船", "container ship"),
    ("化学品船", "chemical tanker"),
    ("气体船", "gas carrier"),
    ("滚装船", "ro-ro ship"),
    ("油轮", "oil tanker"),
    ("客船", "passenger ship"),
    ("货船", "cargo ship"),
    // SOLAS Ch I Reg 2(h): ships carrying flammable liquids in bulk are tankers.
    ("可燃液体", "tanker"),
    ("flammable liquid", "tanker"),
    ("bulk carrier", "bulk carrier"),
    ("container", "container ship"),
    ("chemical tanker", "chemical tanker"),
    ("gas carrier", "gas carrier"),
    ("ro-ro", "ro-ro ship"),
    ("tanker", "oil tanker"),
    ("passenger", "passenger ship"),
    ("cargo", "cargo ship"),
];

/// Requirement wording that, combined with a ship dimension, forces the
/// applicability intent.
const REQUIREMENT_TERMS_ZH: &[&str] = &["是否", "需不需要", "需要", "要不要", "必须"];
const REQUIREMENT_TERMS_EN: &[&str] = &["need", "require", "must", "mandatory"];

// No trailing boundary: CJK characters count as word characters, so `\b`
// would reject "100米货船".
static LENGTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(米|metres|m)").expect("valid regex"));
static TONNAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(总吨|吨|gross tonnage|GT)").expect("valid regex"));

/// Classifies an utterance. Pure and deterministic.
pub fn classify(query: &str) -> Classification {
    let query_lower = query.to_lowercase();

    let mut chosen: Option<(Intent, usize, Option<ModelHint>)> = None;
    for (intent, zh, en, top_k, hint) in INTENT_TABLE {
        let hit = zh.iter().any(|t| query.contains(t))
            || en.iter().any(|t| query_lower.contains(t));
        if hit {
            chosen = Some((*intent, *top_k, *hint));
            break;
        }
    }

    let ship_info = extract_ship_info(query, &query_lower);

    // A ship dimension plus requirement wording is an applicability question
    // even when another lexicon matched first.
    let has_requirement = REQUIREMENT_TERMS_ZH.iter().any(|t| query.contains(t))
        || REQUIREMENT_TERMS_EN.iter().any(|t| query_lower.contains(t));
    if ship_info.has_dimensions() && has_requirement {
        chosen = Some((Intent::Applicability, 12, Some(ModelHint::Primary)));
    }

    let (intent, top_k, model_hint) =
        chosen.unwrap_or((Intent::General, GENERAL_TOP_K, None));
    let classification = Classification {
        intent,
        ship_info,
        top_k,
        model_hint,
    };
    debug!(?classification.intent, ?classification.ship_info, "classified query");
    classification
}

/// True when the normalised type falls in the tanker branch of SOLAS.
pub fn is_tanker(ship_type: &str) -> bool {
    matches!(ship_type, "oil tanker" | "chemical tanker" | "tanker")
}

fn extract_ship_info(query: &str, query_lower: &str) -> ShipInfo {
    let mut info = ShipInfo::default();

    for (phrase, normalised) in SHIP_TYPE_MAP {
        if query_lower.contains(phrase) {
            info.ship_type = Some((*normalised).to_string());
            break;
        }
    }

    // International voyage with no explicit type defaults to a cargo ship.
    if info.ship_type.is_none()
        && (query.contains("国际航行") || query_lower.contains("international voyage"))
    {
        info.ship_type = Some("cargo ship".to_string());
    }

    if let Some(caps) = LENGTH_RE.captures(query) {
        info.length_m = caps[1].parse().ok();
    }
    if let Some(caps) = TONNAGE_RE.captures(query) {
        info.tonnage = caps[1].parse().ok();
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tanker_branch_detected_from_flammable_liquid_wording() {
        let c = classify("根据SOLAS，对于运输可燃液体货物的轮船,走廊和消防控制站之间的舱壁应该是什么防火等级？");
        assert_eq!(c.ship_info.ship_type.as_deref(), Some("tanker"));
        assert!(is_tanker(c.ship_info.ship_type.as_deref().unwrap()));
    }

    #[test]
    fn bulk_carrier_stays_outside_the_tanker_branch() {
        let c = classify("散货船走廊和控制站之间的舱壁防火等级是什么");
        assert_eq!(c.ship_info.ship_type.as_deref(), Some("bulk carrier"));
        assert!(!is_tanker("bulk carrier"));
    }

    #[test]
    fn specification_intent_routes_to_fast_model() {
        let c = classify("SOLAS II-1/3-6 的开口最小尺寸是多少");
        assert_eq!(c.intent, Intent::Specification);
        assert_eq!(c.model_hint, Some(ModelHint::Fast));
        assert_eq!(c.top_k, 5);
    }

    #[test]
    fn dimension_plus_requirement_forces_applicability() {
        let c = classify("100 米货船两边救生筏都需要起降落设备吗");
        assert_eq!(c.intent, Intent::Applicability);
        assert_eq!(c.ship_info.length_m, Some(100));
        assert_eq!(c.ship_info.ship_type.as_deref(), Some("cargo ship"));
        assert_eq!(c.model_hint, Some(ModelHint::Primary));
        assert_eq!(c.top_k, 12);
    }

    #[test]
    fn applicability_precedes_specification_when_both_match() {
        // "是否需要" (applicability) and "多少" (specification) both present.
        let c = classify("客船是否需要配备多少个救生圈");
        assert_eq!(c.intent, Intent::Applicability);
    }

    #[test]
    fn international_voyage_defaults_to_cargo_ship() {
        let c = classify("国际航行船舶的无线电设备要求");
        assert_eq!(c.ship_info.ship_type.as_deref(), Some("cargo ship"));
    }

    #[test]
    fn tonnage_is_extracted() {
        let c = classify("500总吨的货船需要配备应急消防泵吗");
        assert_eq!(c.ship_info.tonnage, Some(500));
        assert_eq!(c.intent, Intent::Applicability);
    }

    #[test]
    fn classification_is_idempotent() {
        let query = "100 米货船两边救生筏都需要起降落设备吗";
        assert_eq!(classify(query), classify(query));
    }

    #[test]
    fn unmatched_query_falls_back_to_general() {
        let c = classify("liferaft servicing intervals");
        assert_eq!(c.intent, Intent::General);
        assert_eq!(c.top_k, 8);
        assert_eq!(c.model_hint, None);
    }
}
