//! Bilingual query enhancement: terminology expansion and regulation hints.
//!
//! Bridges the gap between colloquial (mostly Chinese) surveyor queries and
//! the English-language IMO regulation text stored in the indexes. The
//! enhanced query keeps the original intact and appends expansion terms and
//! regulation identifiers after pipe separators so both the dense and the
//! lexical retriever benefit.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Enhancer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enhancement {
    /// `original | terms… | regulation-hints…`; equals the original when
    /// nothing matched.
    pub enhanced_query: String,
    /// English regulatory terms injected, sorted.
    pub matched_terms: Vec<String>,
    /// Regulation identifiers injected, sorted.
    pub regulation_hints: Vec<String>,
}

/// Colloquial/Chinese term groups mapped onto English IMO terminology.
/// Bilaterally indexed: a query matching either the Chinese key or one of
/// the English terms pulls in the whole group.
const TERMINOLOGY_MAP: &[(&str, &[&str])] = &[
    // Life-saving appliances
    ("救生筏", &["liferaft", "life-raft", "inflatable liferaft"]),
    ("救生艇", &["lifeboat", "survival craft"]),
    ("释放设备", &["launching appliance", "release mechanism", "davit"]),
    ("吊车", &["davit", "crane", "launching appliance"]),
    ("降落设备", &["davit", "launching appliance", "launching device"]),
    ("起降落", &["launching appliance", "davit", "launching device"]),
    ("抛投式", &["throw-overboard", "inflatable liferaft"]),
    ("自由降落", &["free-fall", "free fall lifeboat"]),
    ("登乘梯", &["embarkation ladder", "boarding ladder"]),
    ("救生圈", &["lifebuoy", "life buoy"]),
    ("救生衣", &["lifejacket", "life-jacket"]),
    ("救助艇", &["rescue boat"]),
    ("救生信号", &["distress signal", "pyrotechnic"]),
    ("浸水服", &["immersion suit", "thermal protective aid"]),
    // Fire safety
    ("灭火器", &["fire extinguisher", "portable extinguisher"]),
    ("消防泵", &["fire pump", "fire main"]),
    ("应急消防泵", &["emergency fire pump"]),
    ("喷淋系统", &["sprinkler system", "water spraying system", "fixed fire-extinguishing"]),
    ("防火门", &["fire door", "fire-resistant division", "A-class division"]),
    ("防火分隔", &["fire division", "fire integrity", "A-class division"]),
    ("烟雾探测", &["smoke detector", "fire detection", "smoke detection system"]),
    ("探火系统", &["fire detection system", "fire alarm"]),
    ("灭火系统", &["fire-extinguishing system", "fire fighting"]),
    ("惰气系统", &["inert gas system", "IGS"]),
    ("消防员装备", &["fire-fighter's outfit", "breathing apparatus"]),
    ("国际通岸接头", &["international shore connection"]),
    // Structure / access
    ("通道", &["access", "means of access", "passage", "gangway"]),
    ("开口", &["opening", "clear opening", "hatchway"]),
    ("双壳", &["double hull", "double skin", "double bottom"]),
    ("水密门", &["watertight door", "watertight"]),
    ("舱壁", &["bulkhead", "watertight bulkhead"]),
    ("干舷", &["freeboard"]),
    ("载重线", &["load line", "load lines"]),
    ("透气管", &["air pipe", "tank vent", "vent pipe"]),
    ("舷梯", &["accommodation ladder"]),
    ("引航员梯", &["pilot ladder", "pilot transfer"]),
    ("逃生通道", &["means of escape", "escape route"]),
    // Machinery / electrical
    ("主机", &["main engine", "propulsion machinery"]),
    ("舵机", &["steering gear"]),
    ("锅炉", &["boiler", "oil-fired boiler"]),
    ("应急电源", &["emergency source of electrical power", "emergency generator"]),
    ("舱底水", &["bilge water", "bilge pumping"]),
    ("油水分离器", &["oily water separator", "15 ppm equipment"]),
    // Pollution prevention
    ("排油", &["oil discharge", "ODME", "oil discharge monitoring"]),
    ("压载水", &["ballast water", "ballast water management"]),
    ("洗舱", &["crude oil washing", "tank washing", "COW"]),
    ("垃圾", &["garbage", "garbage management"]),
    ("污水", &["sewage"]),
    // Stability
    ("破损稳性", &["damage stability", "subdivision"]),
    ("完整稳性", &["intact stability"]),
    // Ship types
    ("散货船", &["bulk carrier", "bulker"]),
    ("油轮", &["oil tanker", "tanker"]),
    ("客船", &["passenger ship", "passenger vessel"]),
    ("货船", &["cargo ship", "cargo vessel"]),
    ("集装箱船", &["container ship", "container vessel"]),
    ("化学品船", &["chemical tanker", "chemical carrier"]),
    ("气体船", &["gas carrier", "LNG carrier", "LPG carrier"]),
    ("滚装船", &["ro-ro ship", "roll-on roll-off"]),
    // Dimensions
    ("船长", &["length", "length overall", "LOA"]),
    ("总吨", &["gross tonnage", "GT"]),
    ("载重吨", &["deadweight", "DWT"]),
    // Navigation / radio
    ("导航", &["navigation", "navigational"]),
    ("雷达", &["radar", "ARPA"]),
    ("无线电", &["radio", "GMDSS"]),
    ("号灯", &["navigation lights", "sidelights"]),
    ("磁罗经", &["magnetic compass", "gyro compass"]),
];

/// Detected topic keywords mapped onto the chapters that govern them.
const TOPIC_TO_REGULATIONS: &[(&str, &[&str])] = &[
    ("liferaft", &["SOLAS III", "LSA Code"]),
    ("lifeboat", &["SOLAS III", "LSA Code"]),
    ("davit-launched liferaft", &["SOLAS III/31", "SOLAS III/16", "LSA Code Chapter 6"]),
    ("davit", &["SOLAS III", "LSA Code Chapter 6"]),
    ("launching appliance", &["SOLAS III", "LSA Code Chapter 6"]),
    ("free-fall", &["SOLAS III/31", "LSA Code Chapter 6"]),
    ("fire", &["SOLAS II-2", "FSS Code"]),
    ("inert gas", &["SOLAS II-2/4.5.5"]),
    ("stability", &["SOLAS II-1"]),
    ("oil discharge", &["MARPOL Annex I/34"]),
    ("bilge", &["MARPOL Annex I/15"]),
    ("ballast water", &["BWM Convention"]),
    ("garbage", &["MARPOL Annex V"]),
    ("sewage", &["MARPOL Annex IV"]),
    ("access", &["SOLAS II-1/3-6"]),
    ("air pipe", &["Load Lines Regulation 20"]),
    ("load line", &["Load Lines Convention"]),
    ("navigation", &["SOLAS V", "COLREG"]),
    ("radio", &["SOLAS IV", "GMDSS"]),
    ("cargo ship", &["SOLAS III/31", "SOLAS III/32"]),
    ("passenger ship", &["SOLAS III/21", "SOLAS III/22"]),
];

/// Wording that marks a life-saving-appliance question.
const LSA_KEYWORDS: &[&str] = &[
    "救生筏", "救生艇", "liferaft", "lifeboat", "起降", "davit", "释放", "降落", "launching",
];

/// Wording that marks a per-side configuration question.
const SIDE_KEYWORDS: &[&str] = &["两舷", "两边", "两侧", "both sides", "each side"];

static LENGTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(米|metres|m)").expect("valid regex"));

/// Runs the five enhancement stages. Pure function of the query and the
/// static tables.
pub fn enhance(query: &str) -> Enhancement {
    let query_lower = query.to_lowercase();
    let mut terms: BTreeSet<String> = BTreeSet::new();
    let mut regs: BTreeSet<String> = BTreeSet::new();

    // Stage 1: terminology expansion, matched on either side of the map.
    for (zh_term, en_terms) in TERMINOLOGY_MAP {
        let zh_hit = query.contains(zh_term);
        let en_hit = en_terms.iter().any(|t| contains_term(&query_lower, t));
        if zh_hit || en_hit {
            terms.extend(en_terms.iter().map(|t| (*t).to_string()));
        }
    }

    // Stage 2: topic → regulation hints.
    for (topic, topic_regs) in TOPIC_TO_REGULATIONS {
        let in_terms = terms.iter().any(|t| t.to_lowercase().contains(topic));
        if in_terms || contains_term(&query_lower, topic) {
            regs.extend(topic_regs.iter().map(|r| (*r).to_string()));
        }
    }

    // Stage 3: ship-type specific subsections.
    let has_lsa = LSA_KEYWORDS.iter().any(|kw| query_lower.contains(kw));
    if query.contains("货船") || query_lower.contains("cargo") {
        regs.insert("SOLAS III/31".to_string());
        regs.insert("SOLAS III/32".to_string());
        if has_lsa {
            regs.insert("SOLAS III/16".to_string());
            regs.insert("LSA Code Chapter 6".to_string());
            terms.insert("davit-launched liferaft".to_string());
            terms.insert("free-fall lifeboat".to_string());
        }
    }
    if query.contains("客船") || query_lower.contains("passenger") {
        regs.insert("SOLAS III/21".to_string());
        regs.insert("SOLAS III/22".to_string());
        regs.insert("SOLAS III/16".to_string());
    }

    // Stage 4: length thresholds.
    if let Some(caps) = LENGTH_RE.captures(query) {
        let length: u32 = caps[1].parse().unwrap_or(0);
        if has_lsa {
            if length >= 85 {
                regs.insert("SOLAS III/31".to_string());
                terms.insert("davit-launched liferaft".to_string());
                terms.insert("85 metres".to_string());
                terms.insert("free-fall lifeboat".to_string());
            }
            if length >= 80 {
                regs.insert("SOLAS III/16".to_string());
            }
            regs.insert("LSA Code Chapter 6".to_string());
        }
        if query.contains("国际航行") || query_lower.contains("international") {
            regs.insert("SOLAS III/31".to_string());
        }
    }

    // Stage 5: per-side configuration questions.
    let has_side = SIDE_KEYWORDS.iter().any(|kw| query_lower.contains(kw));
    if has_side && has_lsa {
        regs.insert("SOLAS III/31.1.4".to_string());
        terms.insert("each side".to_string());
        terms.insert("davit-launched".to_string());
    }

    let matched_terms: Vec<String> = terms.into_iter().collect();
    let regulation_hints: Vec<String> = regs.into_iter().collect();

    let mut parts = vec![query.to_string()];
    if !matched_terms.is_empty() {
        parts.push(matched_terms.join(" "));
    }
    if !regulation_hints.is_empty() {
        parts.push(regulation_hints.join(" "));
    }
    let enhanced_query = if parts.len() > 1 {
        parts.join(" | ")
    } else {
        query.to_string()
    };

    debug!(
        terms = matched_terms.len(),
        hints = regulation_hints.len(),
        "query enhanced"
    );
    Enhancement {
        enhanced_query,
        matched_terms,
        regulation_hints,
    }
}

/// Word-boundary-aware containment for short English terms; plain substring
/// containment for longer ones.
fn contains_term(haystack: &str, needle: &str) -> bool {
    if needle.len() >= 5 {
        return haystack.contains(needle);
    }
    haystack
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .any(|word| word.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unmatched_query_passes_through() {
        let result = enhance("today weather report");
        assert_eq!(result.enhanced_query, "today weather report");
        assert!(result.matched_terms.is_empty());
        assert!(result.regulation_hints.is_empty());
    }

    #[test]
    fn liferaft_wording_adds_lsa_chapters() {
        let result = enhance("救生筏检验要求");
        assert!(result.matched_terms.iter().any(|t| t == "liferaft"));
        assert!(result.regulation_hints.iter().any(|r| r == "SOLAS III"));
        assert!(result.regulation_hints.iter().any(|r| r == "LSA Code"));
    }

    #[test]
    fn english_queries_expand_through_the_bilateral_index() {
        let result = enhance("liferaft stowage on deck");
        assert!(result.matched_terms.iter().any(|t| t == "inflatable liferaft"));
        assert!(result.regulation_hints.iter().any(|r| r == "SOLAS III"));
    }

    #[test]
    fn hundred_metre_cargo_side_question_hits_the_davit_rule() {
        let result = enhance("100 米货船两边救生筏都需要起降落设备吗");
        assert!(result.matched_terms.iter().any(|t| t == "85 metres"));
        assert!(result.matched_terms.iter().any(|t| t == "davit-launched"));
        assert!(result.matched_terms.iter().any(|t| t == "each side"));
        assert!(result
            .regulation_hints
            .iter()
            .any(|r| r == "SOLAS III/31.1.4"));
        assert!(result.regulation_hints.iter().any(|r| r == "SOLAS III/31"));
        assert!(result.enhanced_query.starts_with("100 米货船"));
        assert!(result.enhanced_query.contains(" | "));
    }

    #[test]
    fn length_below_threshold_skips_the_davit_terms() {
        let result = enhance("60米货船救生筏配置");
        assert!(!result.matched_terms.iter().any(|t| t == "85 metres"));
        assert!(result
            .regulation_hints
            .iter()
            .any(|r| r == "LSA Code Chapter 6"));
    }

    #[test]
    fn short_terms_require_word_boundaries() {
        // "gt" must not match inside "lighting".
        assert!(!contains_term("emergency lighting", "gt"));
        assert!(contains_term("500 gt cargo ship", "gt"));
    }

    #[test]
    fn terminology_map_covers_at_least_fifty_groups() {
        assert!(TERMINOLOGY_MAP.len() >= 50, "{}", TERMINOLOGY_MAP.len());
    }

    #[test]
    fn enhancement_is_deterministic() {
        let a = enhance("油轮排油限制是多少");
        let b = enhance("油轮排油限制是多少");
        assert_eq!(a, b);
        assert!(a.regulation_hints.iter().any(|r| r == "MARPOL Annex I/34"));
    }
}
