//! Core records for the regulation corpus and retrieval candidates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default ranking weight for sources whose authority level is unknown.
pub const DEFAULT_AUTHORITY_WEIGHT: f64 = 0.6;

/// Page role of a crawled regulation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    /// Table-of-contents style page.
    Index,
    /// Leaf page carrying regulation body text.
    Content,
    /// Footnote page attached to a content page.
    Footnote,
    /// Collection landing page.
    Collection,
}

/// Document family a regulation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// IMO conventions (SOLAS, MARPOL, ...).
    Convention,
    /// Mandatory codes (LSA, FSS, IBC, ...).
    Code,
    /// Assembly/committee resolutions.
    Resolution,
    /// Circulars.
    Circular,
    /// Guidelines.
    Guideline,
    /// Technical specifications.
    Specification,
    /// Conference records.
    Conference,
}

/// Origin corpus of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// imorules.com IMO instruments.
    ImoRules,
    /// Bureau Veritas classification rules.
    BvRules,
    /// IACS Unified Requirements.
    IacsUr,
    /// IACS Unified Interpretations.
    IacsUi,
    /// Any other corpus the ingest pipeline tags.
    #[serde(other)]
    Other,
}

/// Regulatory authority tier, used as a fixed ranking multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityLevel {
    /// Convention text.
    Convention,
    /// IMO resolution amending a convention.
    Resolution,
    /// IACS Unified Requirement.
    IacsUr,
    /// IACS Unified Interpretation.
    IacsUi,
    /// Classification-society rule.
    ClassificationRule,
    /// Guidance note.
    GuidanceNote,
}

impl AuthorityLevel {
    /// Multiplier applied to fused scores (convention > IACS > class rule > guidance).
    pub fn weight(self) -> f64 {
        match self {
            AuthorityLevel::Convention | AuthorityLevel::Resolution => 1.0,
            AuthorityLevel::IacsUr | AuthorityLevel::IacsUi => 0.85,
            AuthorityLevel::ClassificationRule => 0.7,
            AuthorityLevel::GuidanceNote => 0.5,
        }
    }

    /// Weight for an optional authority, defaulting unknown sources to 0.6.
    pub fn weight_or_default(level: Option<AuthorityLevel>) -> f64 {
        level.map(AuthorityLevel::weight).unwrap_or(DEFAULT_AUTHORITY_WEIGHT)
    }
}

/// A leaf node of a regulatory document, as written by the ingest pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulationRecord {
    /// Stable unique identifier.
    pub doc_id: String,
    /// Source URL of the page.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Hierarchical path, e.g. `SOLAS > Chapter II-1 > Regulation 3-6`.
    pub breadcrumb: String,
    /// Document family.
    pub collection: Collection,
    /// Document name, e.g. `SOLAS`.
    pub document: String,
    /// Chapter identifier, when present.
    pub chapter: Option<String>,
    /// Part identifier, when present.
    pub part: Option<String>,
    /// Regulation identifier, when present.
    pub regulation: Option<String>,
    /// Paragraph identifier, when present.
    pub paragraph: Option<String>,
    /// Body text.
    pub body_text: String,
    /// Page role.
    pub page_type: PageType,
    /// Parent node; `None` for forest roots.
    pub parent_doc_id: Option<String>,
    /// Origin corpus.
    pub source_type: SourceType,
    /// Authority tier; `None` when the ingest could not determine one.
    pub authority_level: Option<AuthorityLevel>,
}

/// Fragment granularity of an embeddable chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// Plain regulation text.
    Regulation,
    /// A whole table rendered as text.
    Table,
    /// A single table cell with its row/column context.
    TableCell,
    /// A structured-table row produced by the offline table ingest.
    StructuredTable,
}

/// Ship-type applicability constraints carried on type-tagged chunks.
///
/// Used by the generator to detect branch mismatches (e.g. a tanker question
/// answered from the non-tanker bulkhead table).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Applicability {
    /// Ship types the chunk applies to; empty means unrestricted.
    #[serde(default)]
    pub ship_types: Vec<String>,
    /// Ship types explicitly excluded.
    #[serde(default)]
    pub excluded_ship_types: Vec<String>,
    /// Construction-date condition, verbatim from the source.
    #[serde(default)]
    pub construction_date: Option<String>,
    /// Referenced table identifiers (e.g. `Table 9.5`).
    #[serde(default)]
    pub table_refs: Vec<String>,
}

/// Payload metadata stored alongside each chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Owning regulation identifier.
    #[serde(default)]
    pub doc_id: Option<String>,
    /// Document name, e.g. `SOLAS`.
    #[serde(default)]
    pub document: String,
    /// Regulation number, e.g. `II-1/3-6`.
    #[serde(default)]
    pub regulation_number: String,
    /// Breadcrumb path of the owning record.
    #[serde(default)]
    pub breadcrumb: String,
    /// Source URL.
    #[serde(default)]
    pub url: String,
    /// Title of the owning record.
    #[serde(default)]
    pub title: String,
    /// Document family of the owning record.
    #[serde(default)]
    pub collection: Option<Collection>,
    /// Fragment granularity.
    #[serde(default)]
    pub chunk_type: Option<ChunkType>,
    /// Origin corpus, when tagged by ingest.
    #[serde(default)]
    pub source_type: Option<SourceType>,
    /// Authority tier, when tagged by ingest.
    #[serde(default)]
    pub authority_level: Option<AuthorityLevel>,
    /// Optional applicability constraints.
    #[serde(default)]
    pub applicability: Option<Applicability>,
}

/// An embeddable fragment of a regulation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique chunk identifier.
    pub chunk_id: String,
    /// Owning regulation identifier.
    pub doc_id: String,
    /// Raw text.
    pub text: String,
    /// Text sent to the embedding service: breadcrumb + title prefix, then raw text.
    pub embedding_text: String,
    /// Payload metadata.
    pub metadata: ChunkMetadata,
    /// Token count of the raw text.
    pub token_count: usize,
}

/// Relation kind of a directed cross-reference edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationKind {
    /// Plain reference.
    References,
    /// Unified interpretation of the target.
    Interprets,
    /// Amendment of the target.
    Amends,
}

impl RelationKind {
    /// Database representation of the relation.
    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::References => "REFERENCES",
            RelationKind::Interprets => "INTERPRETS",
            RelationKind::Amends => "AMENDS",
        }
    }

    /// Parse the database representation; unknown kinds fall back to `References`.
    pub fn parse(raw: &str) -> RelationKind {
        match raw {
            "INTERPRETS" => RelationKind::Interprets,
            "AMENDS" => RelationKind::Amends,
            _ => RelationKind::References,
        }
    }
}

/// Directed edge `source_doc → target_doc`. Targets may be outside the
/// corpus; such dangling edges are kept but never expanded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossReference {
    /// Referencing regulation.
    pub source_doc_id: String,
    /// Referenced regulation (possibly dangling).
    pub target_doc_id: String,
    /// Anchor text of the reference.
    pub anchor_text: String,
    /// Surrounding context, when captured.
    pub context: Option<String>,
    /// Relation kind.
    pub relation: RelationKind,
}

/// Closed confidence label set attached to every answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Top evidence scored above the high threshold.
    High,
    /// Top evidence scored above the medium threshold.
    Medium,
    /// Weak or missing evidence.
    Low,
}

impl Confidence {
    /// Label string as it appears in response envelopes.
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

/// Which retrieval legs produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalLeg {
    /// Dense vector search.
    Vector,
    /// Lexical full-text search.
    Lexical,
    /// Reference-graph expansion.
    Graph,
}

/// Graph neighbourhood summary attached to a final candidate.
///
/// Metadata for the generator only; never affects ranking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphContext {
    /// Parent-chain titles joined root-to-leaf.
    pub breadcrumb_path: String,
    /// Count of inbound INTERPRETS edges.
    pub interpretation_count: usize,
    /// Whether any inbound AMENDS edge exists.
    pub has_amendments: bool,
}

impl GraphContext {
    /// True when at least one unified interpretation targets the candidate.
    pub fn has_interpretations(&self) -> bool {
        self.interpretation_count > 0
    }
}

/// A fused retrieval candidate flowing from the retriever to the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Chunk identifier (or a `doc::`-prefixed pseudo id for doc-level hits).
    pub chunk_id: String,
    /// Candidate text handed to the generator.
    pub text: String,
    /// Raw per-leg score of the best contributing leg.
    pub score: f64,
    /// Reciprocal-rank-fusion score, authority-weighted.
    pub fused_score: f64,
    /// Combined score after utility blending; the final ranking key.
    pub final_score: f64,
    /// Utility score used in the blend (0.5 for never-observed chunks).
    pub utility_score: f64,
    /// Payload metadata.
    pub metadata: ChunkMetadata,
    /// Legs that surfaced this candidate.
    pub sources: Vec<RetrievalLeg>,
    /// Graph neighbourhood summary, when resolvable.
    pub graph_context: Option<GraphContext>,
    /// True when appended by depth-1 cross-reference expansion.
    pub graph_expanded: bool,
}

impl Candidate {
    /// Builds a candidate with zeroed scores from a leg hit.
    pub fn new(chunk_id: String, text: String, metadata: ChunkMetadata) -> Self {
        Self {
            chunk_id,
            text,
            score: 0.0,
            fused_score: 0.0,
            final_score: 0.0,
            utility_score: 0.5,
            metadata,
            sources: Vec::new(),
            graph_context: None,
            graph_expanded: false,
        }
    }

    /// Ranking multiplier derived from the tagged authority level.
    pub fn authority_weight(&self) -> f64 {
        AuthorityLevel::weight_or_default(self.metadata.authority_level)
    }
}

/// Per-user aggregate used for the one-line preferences context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// Total user queries observed.
    pub total_queries: u64,
    /// Query counts per cited regulation reference.
    pub regulation_counts: BTreeMap<String, u64>,
    /// Query counts per declared ship type.
    pub ship_types: BTreeMap<String, u64>,
}

impl UserProfile {
    /// One-line summary of the most-queried regulations, empty when unknown.
    pub fn context_line(&self) -> String {
        if self.regulation_counts.is_empty() {
            return String::new();
        }
        let mut counts: Vec<(&String, &u64)> = self.regulation_counts.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let parts: Vec<String> = counts
            .iter()
            .take(5)
            .map(|(reg, count)| format!("{reg}({count})"))
            .collect();
        format!("用户常查法规 / frequently queried: {}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_weights_are_ordered() {
        assert_eq!(AuthorityLevel::Convention.weight(), 1.0);
        assert_eq!(AuthorityLevel::IacsUr.weight(), 0.85);
        assert_eq!(AuthorityLevel::ClassificationRule.weight(), 0.7);
        assert_eq!(AuthorityLevel::GuidanceNote.weight(), 0.5);
        assert_eq!(AuthorityLevel::weight_or_default(None), 0.6);
    }

    #[test]
    fn relation_kind_roundtrips_through_db_strings() {
        for kind in [
            RelationKind::References,
            RelationKind::Interprets,
            RelationKind::Amends,
        ] {
            assert_eq!(RelationKind::parse(kind.as_str()), kind);
        }
        assert_eq!(RelationKind::parse("UNKNOWN"), RelationKind::References);
    }

    #[test]
    fn profile_context_line_ranks_by_count() {
        let mut profile = UserProfile::default();
        profile.regulation_counts.insert("SOLAS II-1/3-6".into(), 4);
        profile.regulation_counts.insert("MARPOL Annex I/34".into(), 9);
        let line = profile.context_line();
        let marpol = line.find("MARPOL").expect("marpol listed");
        let solas = line.find("SOLAS").expect("solas listed");
        assert!(marpol < solas, "higher count listed first: {line}");
    }

    #[test]
    fn chunk_metadata_tolerates_sparse_payloads() {
        let meta: ChunkMetadata = serde_json::from_str(r#"{"document":"SOLAS"}"#).unwrap();
        assert_eq!(meta.document, "SOLAS");
        assert!(meta.authority_level.is_none());
        assert!(meta.applicability.is_none());
    }
}
