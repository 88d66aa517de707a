//! Hybrid retrieval: vector + lexical + graph legs fanned out concurrently,
//! fused with Reciprocal Rank Fusion, authority-weighted, utility-reranked
//! and expanded one hop along cross-references.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{RagError, RagResult};
use crate::graph::GraphIndex;
use crate::lexical::{LexicalHit, LexicalIndex};
use crate::records::{Candidate, ChunkMetadata, GraphContext, RetrievalLeg};
use crate::utility::{self, UtilityStore};
use crate::vector::{SearchFilters, VectorHit, VectorIndex};

/// RRF smoothing constant.
const RRF_K: f64 = 60.0;

/// Fixed fused score assigned to candidates appended by graph expansion.
const GRAPH_EXPANSION_SCORE: f64 = 0.005;

/// Candidates handed to the reranker: `min(2·top_k, RERANK_CAP)`.
const RERANK_CAP: usize = 20;

/// Final candidates whose outbound references seed expansion.
const EXPANSION_SEEDS: usize = 5;

/// Maximum candidates appended by one expansion pass.
const EXPANSION_CAP: usize = 5;

/// Retrieval strategy. `Auto` picks keyword when the query names an exact
/// regulation, hybrid otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Route on query shape.
    Auto,
    /// Lexical leg only.
    Keyword,
    /// Vector leg only.
    Semantic,
    /// All three legs.
    Hybrid,
}

/// Entities the router pulls out of the query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteResult {
    /// Resolved strategy for `Strategy::Auto`.
    pub strategy: Strategy,
    /// Document filter when a convention/code is named.
    pub document_filter: Option<String>,
    /// Controlled-vocabulary concept when one is named.
    pub concept: Option<String>,
    /// Exact regulation reference when the query names one.
    pub regulation_ref: Option<String>,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Hybrid
    }
}

const CONVENTIONS: &[&str] = &[
    "SOLAS", "MARPOL", "STCW", "COLREG", "Load Lines", "Tonnage", "CLC", "OPRC", "AFS", "BWM",
    "SAR", "SUA",
];

const CODES: &[&str] = &[
    "ISM", "ISPS", "LSA", "FSS", "FTP", "IBC", "IGC", "IGF", "IMDG", "CSS", "CTU", "HSC", "MODU",
    "ESP", "Grain", "NOx", "OSV", "Polar", "SPS", "IMSBC",
];

const CONCEPTS: &[&str] = &[
    "fire safety",
    "pollution prevention",
    "navigation safety",
    "life saving",
    "stability",
    "machinery",
    "electrical installations",
    "maritime security",
    "ISM audit",
    "port state control",
    "oil tanker",
    "bulk carrier",
    "passenger ship",
    "cargo ship",
    "chemical tanker",
    "gas carrier",
    "container ship",
    "ro-ro ship",
    "fishing vessel",
    "high-speed craft",
    "MODU",
    "FPSO",
    "offshore supply vessel",
];

static EXACT_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(SOLAS|MARPOL|STCW|COLREG|ISM|ISPS|LSA|FSS|FTP|IBC|IGC)\s*(regulation|chapter|annex|rule|part|section)?\s*([IVXLC\d][IVXLC\d\-/\.]*)",
    )
    .expect("valid regex")
});

static REG_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SOLAS|LSA|MARPOL|FSS|MSC|STCW|COLREG").expect("valid regex"));

static SHIP_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(米|总吨|载重|吨|m|GT|DWT)").expect("valid regex"));

const COMPARISON_TERMS: &[&str] = &["比较", "区别", "对比", "compare", "difference", " vs ", "versus"];

const APPLICABILITY_TERMS: &[&str] = &["是否", "需不需要", "是否需要", "要不要", "do i need"];

/// Routes a query onto a strategy and its extracted entities.
pub fn route(query: &str) -> RouteResult {
    let mut result = RouteResult {
        strategy: Strategy::Hybrid,
        ..RouteResult::default()
    };

    if let Some(caps) = EXACT_REF_RE.captures(query) {
        // A bare roman-numeral fragment ("SOLAS i...") is not a reference:
        // require a digit or an explicit regulation/chapter keyword.
        let has_digit = caps[3].chars().any(|c| c.is_ascii_digit());
        if has_digit || caps.get(2).is_some() {
            result.strategy = Strategy::Keyword;
            result.regulation_ref = Some(caps[0].trim().to_string());
        }
    }

    let query_lower = query.to_lowercase();
    for convention in CONVENTIONS {
        if query_lower.contains(&convention.to_lowercase()) {
            result.document_filter = Some((*convention).to_string());
            break;
        }
    }
    if result.document_filter.is_none() {
        for code in CODES {
            if query_lower.contains(&code.to_lowercase()) {
                result.document_filter = Some((*code).to_string());
                break;
            }
        }
    }

    for concept in CONCEPTS {
        if query_lower.contains(&concept.to_lowercase()) {
            result.concept = Some((*concept).to_string());
            break;
        }
    }

    // Relation wording needs the graph leg even with an exact reference.
    const RELATION_TERMS: &[&str] = &[
        "哪些", "所有", "all related", "which", "修改", "amend", "解释", "interpret", "引用",
        "reference", "适用于", "apply to", "相关", "related", "涉及",
    ];
    if RELATION_TERMS.iter().any(|t| query_lower.contains(t)) {
        result.strategy = Strategy::Hybrid;
    }

    result
}

/// Dynamic top-k: multi-regulation and comparison queries are widened, with
/// a hard ceiling of 15.
pub fn effective_top_k(top_k: usize, query: &str, enhanced_query: &str) -> usize {
    let reg_count = REG_NAME_RE.find_iter(enhanced_query).count();
    let widened = if reg_count >= 3 {
        (top_k + 5).min(15)
    } else if reg_count >= 2 {
        (top_k + 3).min(12)
    } else {
        let query_lower = query.to_lowercase();
        let complex = SHIP_PARAM_RE.is_match(query)
            || COMPARISON_TERMS.iter().any(|t| query_lower.contains(t))
            || APPLICABILITY_TERMS.iter().any(|t| query_lower.contains(t));
        if complex {
            (top_k * 2).min(15)
        } else {
            top_k
        }
    };
    widened.max(1)
}

/// Per-leg and total wall-clock times, surfaced for observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LegLatencies {
    /// Dense leg, when attempted.
    pub vector_ms: Option<u64>,
    /// Lexical leg, when attempted.
    pub lexical_ms: Option<u64>,
    /// Graph leg, when attempted.
    pub graph_ms: Option<u64>,
    /// Whole retrieval call.
    pub total_ms: u64,
}

/// Result batch of one retrieval call.
#[derive(Debug, Clone)]
pub struct RetrievalBatch {
    /// Final candidates, sorted by combined score, non-increasing.
    pub candidates: Vec<Candidate>,
    /// True when at least one attempted leg failed or timed out.
    pub partial_retrieval: bool,
    /// Leg timings.
    pub latencies: LegLatencies,
}

/// Fans out the three retrieval legs, fuses and reranks.
#[derive(Clone)]
pub struct HybridRetriever {
    vector: VectorIndex,
    lexical: LexicalIndex,
    graph: GraphIndex,
    utility: UtilityStore,
    leg_timeout: Duration,
}

impl HybridRetriever {
    /// Builds the retriever over the three index clients.
    pub fn new(
        vector: VectorIndex,
        lexical: LexicalIndex,
        graph: GraphIndex,
        utility: UtilityStore,
        leg_timeout: Duration,
    ) -> Self {
        Self {
            vector,
            lexical,
            graph,
            utility,
            leg_timeout,
        }
    }

    /// Retrieves candidates for an enhanced query.
    ///
    /// `query` is the raw (coreference-resolved) user question used for
    /// routing heuristics; `enhanced_query` drives the index legs.
    pub async fn retrieve(
        &self,
        query: &str,
        enhanced_query: &str,
        top_k: usize,
        strategy: Strategy,
        filters: &SearchFilters,
    ) -> RagResult<RetrievalBatch> {
        let start = Instant::now();
        let routed = route(query);
        let strategy = match strategy {
            Strategy::Auto => routed.strategy,
            explicit => explicit,
        };
        let k = effective_top_k(top_k, query, enhanced_query);
        let oversample = k * 2;
        debug!(?strategy, top_k = k, oversample, "retrieval starting");

        let mut filters = filters.clone();
        if filters.document.is_none() {
            filters.document = routed.document_filter.clone();
        }
        let document_filter = filters.document.clone();

        let run_vector = matches!(strategy, Strategy::Hybrid | Strategy::Semantic);
        let run_lexical = matches!(strategy, Strategy::Hybrid | Strategy::Keyword);
        let run_graph = matches!(strategy, Strategy::Hybrid);

        let vector_fut = async {
            if !run_vector {
                return None;
            }
            let leg_start = Instant::now();
            let outcome = tokio::time::timeout(
                self.leg_timeout,
                self.vector.search(enhanced_query, oversample, &filters),
            )
            .await;
            Some((flatten_leg(outcome, "vector"), leg_start.elapsed()))
        };
        let lexical_fut = async {
            if !run_lexical {
                return None;
            }
            let leg_start = Instant::now();
            let outcome = tokio::time::timeout(
                self.leg_timeout,
                self.lexical_leg(enhanced_query, oversample, document_filter.as_deref(), &routed),
            )
            .await;
            Some((flatten_leg(outcome, "lexical"), leg_start.elapsed()))
        };
        let graph_fut = async {
            if !run_graph {
                return None;
            }
            let leg_start = Instant::now();
            let outcome =
                tokio::time::timeout(self.leg_timeout, self.graph_leg(&routed, oversample)).await;
            Some((flatten_leg(outcome, "graph"), leg_start.elapsed()))
        };

        let (vector_out, lexical_out, graph_out) =
            tokio::join!(vector_fut, lexical_fut, graph_fut);

        let mut latencies = LegLatencies::default();
        let mut partial = false;
        let mut attempted = 0usize;
        let mut failed = 0usize;

        let vector_hits = unpack_leg(vector_out, &mut latencies.vector_ms, &mut attempted, &mut failed);
        let lexical_hits =
            unpack_leg(lexical_out, &mut latencies.lexical_ms, &mut attempted, &mut failed);
        let graph_hits = unpack_leg(graph_out, &mut latencies.graph_ms, &mut attempted, &mut failed);
        if failed > 0 {
            partial = true;
        }
        if attempted > 0 && failed == attempted {
            return Err(RagError::RetrievalUnavailable);
        }

        // RRF fusion with authority weighting, then utility reranking.
        let fused = fuse(
            vector_hits.unwrap_or_default(),
            lexical_hits.unwrap_or_default(),
            graph_hits.unwrap_or_default(),
        );
        let rerank_pool: Vec<Candidate> = fused.into_iter().take((2 * k).min(RERANK_CAP)).collect();
        let category = utility::categorize(enhanced_query);
        let mut candidates = self.utility.rerank(rerank_pool, category).await;
        candidates.truncate(k);

        self.expand_via_cross_references(&mut candidates).await;
        self.attach_graph_context(&mut candidates).await;

        candidates.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        latencies.total_ms = start.elapsed().as_millis() as u64;
        info!(
            candidates = candidates.len(),
            partial,
            total_ms = latencies.total_ms,
            "retrieval complete"
        );
        Ok(RetrievalBatch {
            candidates,
            partial_retrieval: partial,
            latencies,
        })
    }

    /// Lexical leg: exact regulation-number hits first (when the query names
    /// one), then ranked full-text hits, deduplicated by document.
    async fn lexical_leg(
        &self,
        enhanced_query: &str,
        limit: usize,
        document_filter: Option<&str>,
        routed: &RouteResult,
    ) -> RagResult<Vec<LexicalHit>> {
        let mut hits = Vec::new();
        if let Some(reference) = &routed.regulation_ref {
            hits = self
                .lexical
                .search_by_regulation_number(reference, limit.min(5))
                .await?;
        }
        let ranked = self
            .lexical
            .search(enhanced_query, limit, document_filter)
            .await?;
        let mut seen: HashSet<String> = hits.iter().map(|h| h.doc_id.clone()).collect();
        for hit in ranked {
            if seen.insert(hit.doc_id.clone()) {
                hits.push(hit);
            }
        }
        hits.truncate(limit);
        Ok(hits)
    }

    /// Graph leg: concept lookup when the query names a concept, otherwise
    /// interpretations and amendments seeded from an exact identifier. Each
    /// surfaced document is resolved back to its text via the lexical store.
    async fn graph_leg(&self, routed: &RouteResult, limit: usize) -> RagResult<Vec<LexicalHit>> {
        let mut doc_ids: Vec<String> = Vec::new();

        if let Some(concept) = &routed.concept {
            doc_ids = self
                .graph
                .related_by_concept(concept)
                .await?
                .into_iter()
                .map(|hit| hit.doc_id)
                .collect();
        } else if let Some(reference) = &routed.regulation_ref {
            let targets = self
                .lexical
                .search_by_regulation_number(reference, 1)
                .await?;
            if let Some(target) = targets.first() {
                let interps = self.graph.interpretations(&target.doc_id).await?;
                let amends = self.graph.amendments(&target.doc_id).await?;
                doc_ids = interps
                    .into_iter()
                    .chain(amends)
                    .map(|edge| edge.source_doc_id)
                    .collect();
            }
        }

        let mut seen = HashSet::new();
        doc_ids.retain(|id| seen.insert(id.clone()));
        doc_ids.truncate(limit);

        let lookups = doc_ids.iter().map(|id| self.lexical.get_by_doc_id(id));
        let resolved = join_all(lookups).await;
        Ok(resolved.into_iter().flatten().flatten().collect())
    }

    /// Depth-1 expansion: outbound cross-references of the top candidates,
    /// each unresolved target appended as one low-scored candidate.
    async fn expand_via_cross_references(&self, candidates: &mut Vec<Candidate>) {
        let existing: HashSet<String> = candidates
            .iter()
            .filter_map(|c| c.metadata.doc_id.clone())
            .collect();
        let seeds: Vec<String> = candidates
            .iter()
            .take(EXPANSION_SEEDS)
            .filter_map(|c| c.metadata.doc_id.clone())
            .collect();

        let mut targets: Vec<String> = Vec::new();
        let edge_sets = join_all(seeds.iter().map(|id| self.graph.cross_references(id))).await;
        for edges in edge_sets {
            let Ok(edges) = edges else { continue };
            for edge in edges.outbound {
                if edge.target_doc_id.is_empty()
                    || existing.contains(&edge.target_doc_id)
                    || targets.contains(&edge.target_doc_id)
                {
                    continue;
                }
                targets.push(edge.target_doc_id);
            }
        }
        targets.truncate(EXPANSION_CAP);
        if targets.is_empty() {
            return;
        }

        let resolved = join_all(targets.iter().map(|id| self.lexical.get_by_doc_id(id))).await;
        for hit in resolved.into_iter().flatten().flatten() {
            let mut candidate = candidate_from_lexical(&hit);
            candidate.fused_score = GRAPH_EXPANSION_SCORE;
            candidate.final_score = self.utility.blend(GRAPH_EXPANSION_SCORE, 0.5);
            candidate.graph_expanded = true;
            candidate.sources = vec![RetrievalLeg::Graph];
            candidates.push(candidate);
        }
        debug!(appended = targets.len(), "graph expansion complete");
    }

    /// Attaches the graph neighbourhood summary to every candidate with a
    /// resolvable document. Never affects ranking.
    async fn attach_graph_context(&self, candidates: &mut [Candidate]) {
        let contexts = join_all(candidates.iter().map(|candidate| async {
            let doc_id = candidate.metadata.doc_id.clone()?;
            let chain = self.graph.parent_chain(&doc_id).await.ok()?;
            let interps = self.graph.interpretations(&doc_id).await.ok()?;
            let amends = self.graph.amendments(&doc_id).await.ok()?;
            Some(GraphContext {
                breadcrumb_path: chain
                    .iter()
                    .map(|node| node.title.as_str())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join(" > "),
                interpretation_count: interps.len(),
                has_amendments: !amends.is_empty(),
            })
        }))
        .await;
        for (candidate, context) in candidates.iter_mut().zip(contexts) {
            candidate.graph_context = context;
        }
    }
}

type LegOutcome<T> = Option<(Option<T>, Duration)>;

fn flatten_leg<T>(
    outcome: Result<RagResult<T>, tokio::time::error::Elapsed>,
    leg: &'static str,
) -> Option<T> {
    match outcome {
        Ok(Ok(hits)) => Some(hits),
        Ok(Err(err)) => {
            warn!(leg, %err, "retrieval leg failed");
            None
        }
        Err(_) => {
            warn!(leg, "retrieval leg timed out");
            None
        }
    }
}

fn unpack_leg<T>(
    outcome: LegOutcome<T>,
    latency_slot: &mut Option<u64>,
    attempted: &mut usize,
    failed: &mut usize,
) -> Option<T> {
    let (hits, elapsed) = outcome?;
    *latency_slot = Some(elapsed.as_millis() as u64);
    *attempted += 1;
    if hits.is_none() {
        *failed += 1;
    }
    hits
}

/// Reciprocal Rank Fusion over the three legs: for each candidate,
/// `fused = Σ 1/(k + rank)` with `k = 60`, then multiplied by the authority
/// weight. Missing legs contribute nothing. Deduplication is by chunk id,
/// with doc-level hits sharing a `doc::` pseudo id across legs.
pub fn fuse(
    vector_hits: Vec<VectorHit>,
    lexical_hits: Vec<LexicalHit>,
    graph_hits: Vec<LexicalHit>,
) -> Vec<Candidate> {
    fn add(
        by_id: &mut HashMap<String, Candidate>,
        order: &mut Vec<String>,
        id: String,
        rank: usize,
        leg: RetrievalLeg,
        raw_score: f64,
        make: &dyn Fn() -> Candidate,
    ) {
        let entry = by_id.entry(id.clone()).or_insert_with(|| {
            order.push(id);
            make()
        });
        entry.fused_score += 1.0 / (RRF_K + rank as f64);
        entry.score = entry.score.max(raw_score);
        if !entry.sources.contains(&leg) {
            entry.sources.push(leg);
        }
    }

    let mut by_id: HashMap<String, Candidate> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for (idx, hit) in vector_hits.into_iter().enumerate() {
        let id = hit.chunk_id.clone();
        add(&mut by_id, &mut order, id, idx + 1, RetrievalLeg::Vector, hit.score, &|| {
            Candidate::new(hit.chunk_id.clone(), hit.text.clone(), hit.metadata.clone())
        });
    }
    for (idx, hit) in lexical_hits.into_iter().enumerate() {
        let id = format!("doc::{}", hit.doc_id);
        add(&mut by_id, &mut order, id, idx + 1, RetrievalLeg::Lexical, hit.score, &|| {
            candidate_from_lexical(&hit)
        });
    }
    for (idx, hit) in graph_hits.into_iter().enumerate() {
        let id = format!("doc::{}", hit.doc_id);
        add(&mut by_id, &mut order, id, idx + 1, RetrievalLeg::Graph, hit.score, &|| {
            candidate_from_lexical(&hit)
        });
    }

    let mut candidates: Vec<Candidate> = order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .map(|mut candidate| {
            candidate.fused_score *= candidate.authority_weight();
            candidate
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

fn candidate_from_lexical(hit: &LexicalHit) -> Candidate {
    let text: String = hit.body_text.chars().take(2000).collect();
    Candidate::new(
        format!("doc::{}", hit.doc_id),
        text,
        ChunkMetadata {
            doc_id: Some(hit.doc_id.clone()),
            document: hit.document.clone(),
            regulation_number: hit.regulation.clone().unwrap_or_default(),
            breadcrumb: hit.breadcrumb.clone(),
            url: hit.url.clone(),
            title: hit.title.clone(),
            authority_level: hit.authority_level,
            ..ChunkMetadata::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::AuthorityLevel;
    use pretty_assertions::assert_eq;

    fn vector_hit(chunk_id: &str, score: f64) -> VectorHit {
        VectorHit {
            chunk_id: chunk_id.to_string(),
            text: format!("text {chunk_id}"),
            score,
            metadata: ChunkMetadata {
                doc_id: Some(format!("doc-{chunk_id}")),
                authority_level: Some(AuthorityLevel::Convention),
                ..ChunkMetadata::default()
            },
        }
    }

    fn lexical_hit(doc_id: &str, score: f64) -> LexicalHit {
        LexicalHit {
            doc_id: doc_id.to_string(),
            title: format!("title {doc_id}"),
            breadcrumb: format!("SOLAS > {doc_id}"),
            url: String::new(),
            document: "SOLAS".to_string(),
            regulation: None,
            body_text: format!("body {doc_id}"),
            score,
            authority_level: Some(AuthorityLevel::Convention),
        }
    }

    #[test]
    fn auto_routes_exact_references_to_keyword() {
        let routed = route("SOLAS Regulation II-1/3-6 的要求");
        assert_eq!(routed.strategy, Strategy::Keyword);
        assert_eq!(
            routed.regulation_ref.as_deref(),
            Some("SOLAS Regulation II-1/3-6")
        );
        assert_eq!(routed.document_filter.as_deref(), Some("SOLAS"));
    }

    #[test]
    fn relation_wording_keeps_the_hybrid_strategy() {
        let routed = route("哪些决议修改了 SOLAS chapter II-1");
        assert_eq!(routed.strategy, Strategy::Hybrid);
    }

    #[test]
    fn plain_queries_route_to_hybrid() {
        let routed = route("救生筏配置要求");
        assert_eq!(routed.strategy, Strategy::Hybrid);
        assert!(routed.regulation_ref.is_none());
    }

    #[test]
    fn concept_detection_feeds_the_graph_leg() {
        let routed = route("fire safety requirements for bulk carrier");
        assert_eq!(routed.concept.as_deref(), Some("fire safety"));
    }

    #[test]
    fn dynamic_top_k_caps_at_fifteen() {
        // Three regulation names widen by five, capped at 15.
        let enhanced = "q | SOLAS III LSA Code MARPOL";
        assert_eq!(effective_top_k(12, "q", enhanced), 15);
        assert_eq!(effective_top_k(8, "q", enhanced), 13);
        // Two names widen by three, capped at 12.
        assert_eq!(effective_top_k(10, "q", "q | SOLAS III LSA Code"), 12);
        // A ship parameter doubles, capped at 15.
        assert_eq!(effective_top_k(10, "100米货船的要求", "plain"), 15);
        assert_eq!(effective_top_k(5, "100米货船的要求", "plain"), 10);
        // Plain queries pass through.
        assert_eq!(effective_top_k(8, "plain", "plain"), 8);
    }

    #[test]
    fn rrf_scores_are_never_negative_and_sorted() {
        let fused = fuse(
            vec![vector_hit("a", 0.9), vector_hit("b", 0.8)],
            vec![lexical_hit("x", 0.5)],
            Vec::new(),
        );
        assert!(fused.iter().all(|c| c.fused_score >= 0.0));
        for pair in fused.windows(2) {
            assert!(pair[0].fused_score >= pair[1].fused_score);
        }
    }

    #[test]
    fn candidates_in_multiple_legs_accumulate_rank_mass() {
        // The same document surfaces via lexical and graph legs.
        let fused = fuse(
            Vec::new(),
            vec![lexical_hit("shared", 0.5), lexical_hit("solo", 0.4)],
            vec![lexical_hit("shared", 0.0)],
        );
        assert_eq!(fused.len(), 2);
        let shared = &fused[0];
        assert_eq!(shared.chunk_id, "doc::shared");
        assert_eq!(
            shared.sources,
            vec![RetrievalLeg::Lexical, RetrievalLeg::Graph]
        );
        let expected = 2.0 / (RRF_K + 1.0);
        assert!((shared.fused_score - expected).abs() < 1e-12);
    }

    #[test]
    fn authority_weight_reorders_equal_ranks() {
        let mut guidance = lexical_hit("low", 0.5);
        guidance.authority_level = Some(AuthorityLevel::GuidanceNote);
        // Same rank-1 contribution in their respective legs.
        let fused = fuse(vec![vector_hit("conv", 0.5)], vec![guidance], Vec::new());
        assert_eq!(fused[0].chunk_id, "conv");
        let base = 1.0 / (RRF_K + 1.0);
        assert!((fused[0].fused_score - base).abs() < 1e-12);
        assert!((fused[1].fused_score - base * 0.5).abs() < 1e-12);
    }

    #[test]
    fn unknown_authority_defaults_to_the_middle_weight() {
        let mut unknown = lexical_hit("unknown", 0.5);
        unknown.authority_level = None;
        let fused = fuse(Vec::new(), vec![unknown], Vec::new());
        let base = 1.0 / (RRF_K + 1.0);
        assert!((fused[0].fused_score - base * 0.6).abs() < 1e-12);
    }
}
