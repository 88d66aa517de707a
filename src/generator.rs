//! Answer generation: model routing, context packing, prompt assembly,
//! citation extraction and confidence labelling.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::{self, Classification, Intent, ModelHint};
use crate::error::{RagError, RagResult};
use crate::llm::{AnthropicChat, ChatMessage, ChatRequest};
use crate::records::{Applicability, Candidate, Confidence};

/// Citation format accepted in answers, restricted to the enumerated
/// document set.
static CITATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(SOLAS|MARPOL|MSC|MEPC|ISM|ISPS|Resolution|LSA|FSS|FTP|STCW|COLREG)[^\]]*\]")
        .expect("valid regex")
});

/// Loose regulation reference inside titles and breadcrumbs.
static REG_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(SOLAS|MARPOL|STCW|COLREG|ISM|ISPS|LSA|FSS|FTP|IBC|IGC|MSC|MEPC)\s*(?:Regulation\s*)?[\w\-/\.]+",
    )
    .expect("valid regex")
});

/// Precise regulation identifier in a query: document name followed by a
/// reference that carries at least one digit.
static PRECISE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(SOLAS|MARPOL|STCW|COLREG|ISM|ISPS|LSA|FSS|FTP|IBC|IGC)\s*(?:Regulation\s*)?[IVXLC\d\-/\.]*\d[\w\-/\.]*",
    )
    .expect("valid regex")
});

/// Ship parameter: number plus a length/tonnage unit.
static SHIP_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\d+\s*(米|总吨|载重|吨|m|GT|DWT)").expect("valid regex")
});

const COMPARISON_KEYWORDS: &[&str] = &[
    "compare", "比较", "区别", "difference", " vs ", "versus", "对比", "不同",
];

const APPLICABILITY_KEYWORDS: &[&str] = &[
    "是否", "需不需要", "是否需要", "必须", "要不要", "do i need", "is it required", "must",
    "applicable",
];

const SHIP_TYPE_KEYWORDS: &[&str] = &[
    "货船", "客船", "油轮", "散货", "集装箱", "滚装", "化学品船", "气体船", "国际航行", "可燃液体",
    "cargo ship", "passenger", "tanker", "bulk carrier", "flammable liquid",
];

const RELATION_KEYWORDS: &[&str] = &[
    "所有", "哪些", "all", "which", "compare", "区别", "关系", "relationship",
];

const REFUSAL_MARKERS: &[&str] = &[
    "无法回答",
    "无法在检索到",
    "未检索到",
    "没有找到相关",
    "unable to answer",
    "cannot answer",
    "insufficient evidence",
    "evidence is insufficient",
];

/// Surveyor persona and the non-negotiable answering rules.
const SYSTEM_PROMPT: &str = "你是 BV-RAG，一个专业的海事法规 AI 助手。你的回答风格像一位有20年经验的资深验船师——直接、实用、给出明确判断。

## 回答纪律（不可违反）

1. **结论先行**。第一句话给出明确结论；绝不以\"取决于\"开头。如果有条件分支，先说最常见情况，再说例外。
2. **引用规范**。每一个事实性论断都必须附带方括号引用，格式 [Document Reg/N.n.m]，例如 [SOLAS III/31.1.4]。只引用检索内容中出现的条款编号，绝不编造。
3. **禁止编造数值**。数值与查表结果只能来自检索到的法规原文。如果检索内容中没有所需的表格或数值，必须明确说明\"检索结果中未找到相关原文\"，不得凭推测给出数值（典型错误：因为\"控制站听起来重要\"而猜测 A-60，而表格实际为 A-0）。
4. **船型分支纪律**。先确定船型分支，再查表引用：客船>36人 → Tables 9.1/9.2；客船≤36人 → Tables 9.3/9.4；货船(非tanker) → Tables 9.5/9.6；tanker（运输可燃液体货物，SOLAS I/2(h)） → Tables 9.7/9.8。如果检索到的条文分支与用户声明的船型不一致，必须拒绝回答或明确指出不匹配，不得照常作答。
5. **区分 shall 与 should**。强制要求（shall）与建议（should）必须明确区分，不得混同。
6. **语言**。用用户的语言回答；法规编号与技术术语保持英文原文（如 SOLAS III/31.1.4、davit-launched liferaft）。

## 分档回答

用户信息不全时不反问，先给最可能场景的答案（加粗），再简列其他船型/条件的分档结果，末尾注明哪些补充信息可细化答案。适用性问题缺少船型时，必须在开头用加粗文字声明所做假设，不允许无条件的单一答案。

## 上下文与实务参考

查询中的 [Context: ...] 前缀是系统注入的上下文，回答必须紧扣该上下文提到的法规。系统提供的\"验船实务参考\"段落来自资深验船师，优先级高于模型自身推测；与条文字面冲突时以实务参考为准并说明原因。";

/// Which configured model a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelChoice {
    /// Higher-capacity model.
    Primary,
    /// Low-latency model.
    Fast,
}

impl ModelChoice {
    /// The other model, used for the single cross-model retry.
    pub fn alternate(self) -> ModelChoice {
        match self {
            ModelChoice::Primary => ModelChoice::Fast,
            ModelChoice::Fast => ModelChoice::Primary,
        }
    }
}

/// An extracted citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Bracketed citation text as it appears in the answer.
    pub citation: String,
    /// Whether the citation matched the accepted format.
    pub verified: bool,
}

/// A deduplicated evidence source behind an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// Chunk identifier.
    pub chunk_id: String,
    /// Source URL.
    pub url: String,
    /// Breadcrumb path.
    pub breadcrumb: String,
    /// Combined ranking score.
    pub score: f64,
}

/// Output of one generation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedAnswer {
    /// Answer text.
    pub answer: String,
    /// Citations extracted from the answer.
    pub citations: Vec<Citation>,
    /// Confidence label.
    pub confidence: Confidence,
    /// Model identifier that produced the answer.
    pub model_used: String,
    /// Evidence sources, deduplicated by chunk.
    pub sources: Vec<SourceRef>,
}

/// Answer generator over the two configured chat models.
#[derive(Clone)]
pub struct AnswerGenerator {
    chat: Arc<AnthropicChat>,
    primary_model: String,
    fast_model: String,
}

impl AnswerGenerator {
    /// Builds a generator for the configured model pair.
    pub fn new(chat: Arc<AnthropicChat>, primary_model: String, fast_model: String) -> Self {
        Self {
            chat,
            primary_model,
            fast_model,
        }
    }

    /// Generates a grounded answer from the retrieved evidence.
    ///
    /// `query` is the coreference-resolved user question; `enhanced_query`
    /// is the retrieval form carrying expansion terms. `force_model`
    /// bypasses routing for the cross-model retry.
    #[allow(clippy::too_many_arguments)]
    pub async fn generate(
        &self,
        query: &str,
        enhanced_query: &str,
        candidates: &[Candidate],
        history: &[ChatMessage],
        user_context: Option<&str>,
        practical_context: Option<&str>,
        classification: &Classification,
        force_model: Option<ModelChoice>,
    ) -> RagResult<GeneratedAnswer> {
        let choice = force_model
            .unwrap_or_else(|| route_model(classification.model_hint, query, enhanced_query, candidates));
        let (model, max_tokens, max_context_tokens) = match choice {
            ModelChoice::Primary => (self.primary_model.as_str(), 2048, 5000),
            ModelChoice::Fast => (self.fast_model.as_str(), 1024, 3000),
        };
        debug!(model, candidates = candidates.len(), "routing answer generation");

        let mut system = SYSTEM_PROMPT.to_string();
        if let Some(context) = user_context.filter(|c| !c.is_empty()) {
            system.push_str("\n\n## 用户偏好\n");
            system.push_str(context);
        }
        if let Some(block) = ship_parameter_block(classification) {
            system.push_str(&block);
        }

        let context_text = build_context(candidates, max_context_tokens);
        let mut user_parts = vec![format!("## 检索到的法规内容\n\n{context_text}")];
        if let Some(mismatch) = branch_mismatch_notice(classification, candidates) {
            user_parts.push(mismatch);
        }
        if let Some(practical) = practical_context.filter(|p| !p.is_empty()) {
            user_parts.push(practical.to_string());
        }
        user_parts.push(format!("## 用户问题\n\n{query}"));

        let mut messages: Vec<ChatMessage> = history.to_vec();
        messages.push(ChatMessage::user(user_parts.join("\n\n")));

        let request = ChatRequest {
            model,
            system: Some(&system),
            messages: &messages,
            max_tokens,
            temperature: 0.2,
        };
        let outcome = self
            .chat
            .complete(&request)
            .await
            .map_err(|err| RagError::GenerationUnavailable(err.to_string()))?;

        let citations = extract_citations(&outcome.text);
        let confidence = assess_confidence(candidates, &outcome.text);
        let sources = build_sources(candidates);
        info!(
            model,
            citations = citations.len(),
            confidence = confidence.as_str(),
            "answer generated"
        );
        Ok(GeneratedAnswer {
            answer: outcome.text,
            citations,
            confidence,
            model_used: model.to_string(),
            sources,
        })
    }

    /// Resolves a routing choice to the configured model identifier.
    pub fn model_id(&self, choice: ModelChoice) -> &str {
        match choice {
            ModelChoice::Primary => &self.primary_model,
            ModelChoice::Fast => &self.fast_model,
        }
    }
}

/// Model routing. Promotion to the primary model takes precedence over
/// demotion to the fast one.
pub fn route_model(
    hint: Option<ModelHint>,
    query: &str,
    enhanced_query: &str,
    candidates: &[Candidate],
) -> ModelChoice {
    let query_lower = query.to_lowercase();

    let promote = COMPARISON_KEYWORDS.iter().any(|kw| query_lower.contains(kw))
        || SHIP_PARAM_RE.is_match(query)
        || SHIP_TYPE_KEYWORDS.iter().any(|kw| query_lower.contains(kw))
        || APPLICABILITY_KEYWORDS.iter().any(|kw| query_lower.contains(kw))
        || enhanced_query.chars().count() > 60;
    if promote {
        return ModelChoice::Primary;
    }

    let top_score = candidates
        .iter()
        .map(|c| c.final_score)
        .fold(0.0_f64, f64::max);
    let word_count = query.split_whitespace().count();
    let has_relation = RELATION_KEYWORDS.iter().any(|kw| query_lower.contains(kw));
    let demote = PRECISE_REF_RE.is_match(query)
        || (!candidates.is_empty() && top_score > 0.75)
        || (word_count < 15 && !has_relation);
    if demote {
        return ModelChoice::Fast;
    }

    match hint {
        Some(ModelHint::Fast) => ModelChoice::Fast,
        Some(ModelHint::Primary) | None => ModelChoice::Primary,
    }
}

/// Packs candidates into per-chunk evidence blocks under a token budget.
///
/// Blocks are `**[breadcrumb]** (Source: URL)` headers over the chunk text,
/// truncated at 1600 characters each; the cumulative budget uses the rough
/// `len/4` token estimate. Interpretation hints from the graph context are
/// appended as one-liners.
pub fn build_context(candidates: &[Candidate], max_context_tokens: usize) -> String {
    let mut parts = Vec::new();
    let mut total_tokens = 0usize;

    for candidate in candidates {
        let mut text: String = candidate.text.chars().take(1600).collect();
        if text.len() < candidate.text.len() {
            text.push_str("...");
        }
        let chunk_tokens = text.len() / 4;
        if total_tokens + chunk_tokens > max_context_tokens {
            break;
        }
        parts.push(format!(
            "**[{}]** (Source: {})\n{}",
            candidate.metadata.breadcrumb, candidate.metadata.url, text
        ));
        total_tokens += chunk_tokens;

        if let Some(graph) = &candidate.graph_context {
            if graph.has_interpretations() {
                parts.push(format!(
                    "*Note: {} unified interpretation(s) available for this regulation.*",
                    graph.interpretation_count
                ));
            }
        }
    }

    parts.join("\n\n---\n\n")
}

/// Extracts bracketed citations, deduplicated in order of appearance.
pub fn extract_citations(answer: &str) -> Vec<Citation> {
    let mut seen = std::collections::HashSet::new();
    let mut citations = Vec::new();
    for m in CITATION_RE.find_iter(answer) {
        let text = m.as_str().to_string();
        if seen.insert(text.clone()) {
            citations.push(Citation {
                citation: text,
                verified: true,
            });
        }
    }
    citations
}

/// Citation strings only; used by conversation memory when scanning answers.
pub fn extract_citation_strings(answer: &str) -> Vec<String> {
    extract_citations(answer)
        .into_iter()
        .map(|c| c.citation)
        .collect()
}

/// Extracts a meaningful regulation reference from a candidate's title or
/// breadcrumb; falls back to document plus condensed title.
pub fn extract_regulation_ref(title: &str, document: &str, regulation_number: &str) -> String {
    if let Some(m) = REG_REF_RE.find(title) {
        return m.as_str().trim().to_string();
    }
    if !regulation_number.is_empty() && regulation_number != document && regulation_number.len() > 3
    {
        return regulation_number.to_string();
    }
    if !document.is_empty() && !title.is_empty() {
        let condensed: String = title.trim().chars().take(60).collect();
        return format!("{document}: {}", condensed.trim());
    }
    String::new()
}

/// True when the answer declines to answer.
pub fn is_refusal(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    REFUSAL_MARKERS.iter().any(|m| lower.contains(m))
}

/// Confidence from the top candidate's combined score, downgraded from high
/// to medium when the answer contains a refusal phrase.
pub fn assess_confidence(candidates: &[Candidate], answer: &str) -> Confidence {
    let top_score = candidates
        .iter()
        .map(|c| c.final_score)
        .fold(0.0_f64, f64::max);
    let base = if candidates.is_empty() {
        Confidence::Low
    } else if top_score > 0.85 {
        Confidence::High
    } else if top_score > 0.60 {
        Confidence::Medium
    } else {
        Confidence::Low
    };
    if base == Confidence::High && is_refusal(answer) {
        Confidence::Medium
    } else {
        base
    }
}

/// Deduplicated source list for the response envelope.
pub fn build_sources(candidates: &[Candidate]) -> Vec<SourceRef> {
    let mut seen = std::collections::HashSet::new();
    let mut sources = Vec::new();
    for candidate in candidates {
        if !seen.insert(candidate.chunk_id.clone()) {
            continue;
        }
        sources.push(SourceRef {
            chunk_id: candidate.chunk_id.clone(),
            url: candidate.metadata.url.clone(),
            breadcrumb: candidate.metadata.breadcrumb.clone(),
            score: candidate.final_score,
        });
    }
    sources
}

/// SOLAS branch a ship type falls into for table routing.
fn branch_of(ship_type: &str) -> &'static str {
    if classifier::is_tanker(ship_type) {
        "tanker"
    } else if ship_type.contains("passenger") || ship_type.contains("客船") {
        "passenger"
    } else {
        "cargo"
    }
}

/// True when the chunk's applicability constraints exclude the declared
/// ship type. Comparison happens at the SOLAS branch level, so a bulk
/// carrier matches chunks tagged `cargo ship` but not those tagged `tanker`.
pub fn applicability_excludes(applicability: &Applicability, ship_type: &str) -> bool {
    let covers = |entry: &String| {
        let entry_lower = entry.to_lowercase();
        entry_lower == ship_type
            || entry_lower.contains(ship_type)
            || ship_type.contains(entry_lower.as_str())
            || branch_of(&entry_lower) == branch_of(ship_type)
    };
    if applicability.excluded_ship_types.iter().any(covers) {
        return true;
    }
    if !applicability.ship_types.is_empty() && !applicability.ship_types.iter().any(covers) {
        return true;
    }
    false
}

fn branch_mismatch_notice(
    classification: &Classification,
    candidates: &[Candidate],
) -> Option<String> {
    let ship_type = classification.ship_info.ship_type.as_deref()?;
    let top = candidates.first()?;
    let applicability = top.metadata.applicability.as_ref()?;
    if applicability_excludes(applicability, ship_type) {
        Some(format!(
            "## 分支不匹配警告\n\n检索到的最高评分条文的适用范围与用户声明的船型（{ship_type}）不一致。\
             你必须拒绝直接回答，或明确指出该不匹配并说明正确的法规分支。"
        ))
    } else {
        None
    }
}

fn ship_parameter_block(classification: &Classification) -> Option<String> {
    if classification.intent != Intent::Applicability {
        return None;
    }
    let info = &classification.ship_info;
    if info.ship_type.is_none() && !info.has_dimensions() {
        return None;
    }
    let mut block = String::from("\n\n## 用户船舶信息");
    if let Some(ship_type) = &info.ship_type {
        block.push_str(&format!("\n- 船型: {ship_type}"));
    }
    if let Some(length) = info.length_m {
        block.push_str(&format!("\n- 船长: {length}米"));
    }
    if let Some(tonnage) = info.tonnage {
        block.push_str(&format!("\n- 总吨: {tonnage}GT"));
    }
    block.push_str("\n请根据这些参数给出明确的适用性判断。");
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ChunkMetadata;
    use pretty_assertions::assert_eq;

    fn candidate(chunk_id: &str, final_score: f64) -> Candidate {
        let mut c = Candidate::new(
            chunk_id.to_string(),
            format!("text of {chunk_id}"),
            ChunkMetadata {
                breadcrumb: format!("SOLAS > {chunk_id}"),
                url: format!("https://www.imorules.com/{chunk_id}"),
                ..ChunkMetadata::default()
            },
        );
        c.final_score = final_score;
        c
    }

    #[test]
    fn citations_are_deduplicated_in_order() {
        let answer = "根据 [SOLAS III/31.1.4]，至少一舷需配备降落设备。\
                      参见 [LSA Code Chapter 6] 与 [SOLAS III/31.1.4]。";
        let citations = extract_citations(answer);
        assert_eq!(
            citations.iter().map(|c| c.citation.as_str()).collect::<Vec<_>>(),
            vec!["[SOLAS III/31.1.4]", "[LSA Code Chapter 6]"]
        );
        assert!(citations.iter().all(|c| c.verified));
    }

    #[test]
    fn citations_outside_the_document_set_are_ignored(){
        let citations = extract_citations("see [NR467 Part C] and [SOLAS II-2/9]");
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].citation, "[SOLAS II-2/9]");
    }

    #[test]
    fn confidence_thresholds() {
        assert_eq!(assess_confidence(&[], "answer"), Confidence::Low);
        assert_eq!(
            assess_confidence(&[candidate("a", 0.9)], "answer"),
            Confidence::High
        );
        assert_eq!(
            assess_confidence(&[candidate("a", 0.7)], "answer"),
            Confidence::Medium
        );
        assert_eq!(
            assess_confidence(&[candidate("a", 0.5)], "answer"),
            Confidence::Low
        );
    }

    #[test]
    fn refusal_downgrades_high_confidence() {
        let refusal = "检索结果中未检索到相关原文，无法回答该问题。";
        assert_eq!(
            assess_confidence(&[candidate("a", 0.9)], refusal),
            Confidence::Medium
        );
        // Medium stays medium.
        assert_eq!(
            assess_confidence(&[candidate("a", 0.7)], refusal),
            Confidence::Medium
        );
    }

    #[test]
    fn routing_promotes_ship_parameters_over_demotion_signals() {
        // Short query with a precise reference would demote, but the ship
        // parameter promotes and promotion wins.
        let choice = route_model(
            Some(ModelHint::Fast),
            "100米货船需要配备SOLAS III/31的davit吗",
            "enhanced",
            &[],
        );
        assert_eq!(choice, ModelChoice::Primary);
    }

    #[test]
    fn routing_demotes_precise_lookup() {
        let choice = route_model(
            None,
            "SOLAS II-1/3-6 opening size",
            "SOLAS II-1/3-6 opening size",
            &[candidate("a", 0.3)],
        );
        assert_eq!(choice, ModelChoice::Fast);
    }

    #[test]
    fn routing_falls_back_to_the_hint() {
        let long_query = "what are the general principles of port state control inspection regimes and how do memoranda of understanding coordinate them";
        let choice = route_model(Some(ModelHint::Primary), long_query, "short", &[]);
        assert_eq!(choice, ModelChoice::Primary);
    }

    #[test]
    fn context_respects_block_and_total_budgets() {
        let mut big = candidate("big", 0.9);
        big.text = "x".repeat(4000);
        let packed = build_context(&[big], 5000);
        // 1600 chars + ellipsis inside one block.
        assert!(packed.contains(&"x".repeat(1600)));
        assert!(!packed.contains(&"x".repeat(1601)));
        assert!(packed.contains("..."));

        let many: Vec<Candidate> = (0..100)
            .map(|i| {
                let mut c = candidate(&format!("c{i}"), 0.5);
                c.text = "y".repeat(1600);
                c
            })
            .collect();
        let packed = build_context(&many, 3000);
        // 1600/4 = 400 tokens per block: only 7 blocks fit under 3000.
        assert_eq!(packed.matches("**[").count(), 7);
    }

    #[test]
    fn interpretation_hint_is_appended() {
        let mut c = candidate("a", 0.9);
        c.graph_context = Some(crate::records::GraphContext {
            breadcrumb_path: "SOLAS > II-1".to_string(),
            interpretation_count: 2,
            has_amendments: false,
        });
        let packed = build_context(&[c], 5000);
        assert!(packed.contains("2 unified interpretation(s)"));
    }

    #[test]
    fn regulation_ref_prefers_the_title_reference() {
        let reference = extract_regulation_ref(
            "1 SOLAS Regulation II-1/3-6 – Access to and within spaces",
            "SOLAS",
            "",
        );
        assert_eq!(reference, "SOLAS Regulation II-1/3-6");
        let fallback = extract_regulation_ref("Access arrangements", "SOLAS", "");
        assert_eq!(fallback, "SOLAS: Access arrangements");
    }

    #[test]
    fn tanker_chunks_mismatch_bulk_carrier_questions() {
        let applicability = Applicability {
            ship_types: vec!["tanker".to_string()],
            ..Applicability::default()
        };
        assert!(applicability_excludes(&applicability, "bulk carrier"));
        assert!(!applicability_excludes(&applicability, "oil tanker"));
        assert!(!applicability_excludes(&applicability, "tanker"));

        let excluding = Applicability {
            excluded_ship_types: vec!["tanker".to_string()],
            ..Applicability::default()
        };
        assert!(applicability_excludes(&excluding, "oil tanker"));
        assert!(!applicability_excludes(&excluding, "bulk carrier"));
    }

    #[test]
    fn cargo_branch_covers_bulk_carriers() {
        let applicability = Applicability {
            ship_types: vec!["cargo ship".to_string()],
            excluded_ship_types: vec!["tanker".to_string()],
            ..Applicability::default()
        };
        assert!(!applicability_excludes(&applicability, "bulk carrier"));
        assert!(applicability_excludes(&applicability, "oil tanker"));
    }

    #[test]
    fn sources_deduplicate_by_chunk() {
        let sources = build_sources(&[candidate("a", 0.9), candidate("a", 0.8), candidate("b", 0.7)]);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].chunk_id, "a");
        assert_eq!(sources[0].score, 0.9);
    }
}
