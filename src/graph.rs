//! Reference-graph leg: parent chains, cross-references and concept links,
//! answered with recursive CTEs over the relational store.

use std::sync::Arc;

use tokio_postgres::Client;

use crate::error::{RagError, RagResult};
use crate::records::{RegulationRecord, RelationKind};

/// A regulation node as seen from graph traversals.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GraphNode {
    /// Regulation identifier.
    pub doc_id: String,
    /// Title.
    pub title: String,
    /// Breadcrumb path.
    pub breadcrumb: String,
    /// Source URL, when present on the row.
    pub url: Option<String>,
}

/// A cross-reference edge enriched with the counterpart's title and URL.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CrossRefEdge {
    /// Referencing regulation.
    pub source_doc_id: String,
    /// Referenced regulation (possibly outside the corpus).
    pub target_doc_id: String,
    /// Anchor text of the reference.
    pub anchor_text: String,
    /// Relation kind.
    pub relation: RelationKind,
    /// Title of the counterpart regulation, when resolvable.
    pub title: Option<String>,
    /// URL of the counterpart regulation, when resolvable.
    pub url: Option<String>,
}

/// Outbound and inbound edges of one regulation.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CrossReferences {
    /// Edges where the regulation is the source.
    pub outbound: Vec<CrossRefEdge>,
    /// Edges where the regulation is the target.
    pub inbound: Vec<CrossRefEdge>,
}

/// A regulation linked to a named concept.
#[derive(Debug, Clone)]
pub struct ConceptHit {
    /// Regulation identifier.
    pub doc_id: String,
    /// Title.
    pub title: String,
    /// Breadcrumb path.
    pub breadcrumb: String,
    /// Source URL.
    pub url: String,
    /// Document name.
    pub document: String,
    /// Regulation number, when present.
    pub regulation: Option<String>,
}

/// Read-only graph client. All operations are idempotent.
#[derive(Clone)]
pub struct GraphIndex {
    db: Arc<Client>,
}

const PARENT_CHAIN_SQL: &str = "WITH RECURSIVE ancestors AS ( \
        SELECT doc_id, parent_doc_id, title, breadcrumb, url, 0 AS depth \
        FROM regulations WHERE doc_id = $1 \
        UNION ALL \
        SELECT r.doc_id, r.parent_doc_id, r.title, r.breadcrumb, r.url, a.depth + 1 \
        FROM regulations r JOIN ancestors a ON r.doc_id = a.parent_doc_id \
        WHERE a.depth < 20 \
    ) \
    SELECT doc_id, title, breadcrumb, url FROM ancestors ORDER BY depth DESC";

const CHILDREN_SQL: &str = "SELECT doc_id, title, breadcrumb, url \
    FROM regulations WHERE parent_doc_id = $1 ORDER BY doc_id";

const OUTBOUND_SQL: &str = "SELECT cr.source_doc_id, cr.target_doc_id, cr.anchor_text, cr.relation_type, \
        r.title, r.url \
    FROM cross_references cr \
    LEFT JOIN regulations r ON cr.target_doc_id = r.doc_id \
    WHERE cr.source_doc_id = $1 \
    LIMIT 20";

const INBOUND_SQL: &str = "SELECT cr.source_doc_id, cr.target_doc_id, cr.anchor_text, cr.relation_type, \
        r.title, r.url \
    FROM cross_references cr \
    LEFT JOIN regulations r ON cr.source_doc_id = r.doc_id \
    WHERE cr.target_doc_id = $1 \
    LIMIT 20";

const INBOUND_BY_KIND_SQL: &str = "SELECT cr.source_doc_id, cr.target_doc_id, cr.anchor_text, cr.relation_type, \
        r.title, r.url \
    FROM cross_references cr \
    LEFT JOIN regulations r ON cr.source_doc_id = r.doc_id \
    WHERE cr.target_doc_id = $1 AND cr.relation_type = $2";

const CONCEPT_SQL: &str = "SELECT r.doc_id, r.title, r.breadcrumb, r.url, r.document, r.regulation \
    FROM regulations r \
    JOIN regulation_concepts rc ON r.doc_id = rc.doc_id \
    JOIN concepts c ON rc.concept_id = c.concept_id \
    WHERE LOWER(c.name) = LOWER($1) \
    ORDER BY r.document, r.regulation \
    LIMIT 20";

const REGULATION_SQL: &str = "SELECT doc_id, url, title, breadcrumb, collection, document, \
        chapter, part, regulation, paragraph, body_text, page_type, parent_doc_id, \
        source_type, authority_level \
    FROM regulations WHERE doc_id = $1";

impl GraphIndex {
    /// Builds a new graph client.
    pub fn new(db: Arc<Client>) -> Self {
        Self { db }
    }

    /// Ancestors of `doc_id` ordered root-to-leaf. Recursion bounded at 20.
    pub async fn parent_chain(&self, doc_id: &str) -> RagResult<Vec<GraphNode>> {
        let rows = self
            .db
            .query(PARENT_CHAIN_SQL, &[&doc_id])
            .await
            .map_err(graph_unavailable)?;
        Ok(rows.iter().map(node_from_row).collect())
    }

    /// Direct children of `doc_id`, ordered by identifier.
    pub async fn children(&self, doc_id: &str) -> RagResult<Vec<GraphNode>> {
        let rows = self
            .db
            .query(CHILDREN_SQL, &[&doc_id])
            .await
            .map_err(graph_unavailable)?;
        Ok(rows.iter().map(node_from_row).collect())
    }

    /// Outbound and inbound cross-reference edges of `doc_id`.
    pub async fn cross_references(&self, doc_id: &str) -> RagResult<CrossReferences> {
        let outbound = self
            .db
            .query(OUTBOUND_SQL, &[&doc_id])
            .await
            .map_err(graph_unavailable)?;
        let inbound = self
            .db
            .query(INBOUND_SQL, &[&doc_id])
            .await
            .map_err(graph_unavailable)?;
        Ok(CrossReferences {
            outbound: outbound.iter().map(edge_from_row).collect(),
            inbound: inbound.iter().map(edge_from_row).collect(),
        })
    }

    /// Inbound INTERPRETS edges: unified interpretations targeting `doc_id`.
    pub async fn interpretations(&self, doc_id: &str) -> RagResult<Vec<CrossRefEdge>> {
        self.inbound_by_kind(doc_id, RelationKind::Interprets).await
    }

    /// Inbound AMENDS edges: amendments targeting `doc_id`.
    pub async fn amendments(&self, doc_id: &str) -> RagResult<Vec<CrossRefEdge>> {
        self.inbound_by_kind(doc_id, RelationKind::Amends).await
    }

    /// Regulations linked to a named concept, ordered by document then
    /// regulation identifier.
    pub async fn related_by_concept(&self, name: &str) -> RagResult<Vec<ConceptHit>> {
        let rows = self
            .db
            .query(CONCEPT_SQL, &[&name])
            .await
            .map_err(graph_unavailable)?;
        Ok(rows
            .iter()
            .map(|row| ConceptHit {
                doc_id: row.get("doc_id"),
                title: row.get("title"),
                breadcrumb: row.get("breadcrumb"),
                url: row.get("url"),
                document: row.get("document"),
                regulation: row.get("regulation"),
            })
            .collect())
    }

    /// Fetches the full regulation record behind `doc_id`.
    pub async fn get_regulation(&self, doc_id: &str) -> RagResult<Option<RegulationRecord>> {
        let rows = self
            .db
            .query(REGULATION_SQL, &[&doc_id])
            .await
            .map_err(graph_unavailable)?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let collection: String = row.get("collection");
        let page_type: String = row.get("page_type");
        let source_type: String = row.get("source_type");
        let authority: Option<String> = row.get("authority_level");
        let record = RegulationRecord {
            doc_id: row.get("doc_id"),
            url: row.get("url"),
            title: row.get("title"),
            breadcrumb: row.get("breadcrumb"),
            collection: serde_json::from_value(serde_json::Value::String(collection))
                .map_err(|err| graph_decode(err, "collection"))?,
            document: row.get("document"),
            chapter: row.get("chapter"),
            part: row.get("part"),
            regulation: row.get("regulation"),
            paragraph: row.get("paragraph"),
            body_text: row.get("body_text"),
            page_type: serde_json::from_value(serde_json::Value::String(page_type))
                .map_err(|err| graph_decode(err, "page_type"))?,
            parent_doc_id: row.get("parent_doc_id"),
            source_type: serde_json::from_value(serde_json::Value::String(source_type))
                .map_err(|err| graph_decode(err, "source_type"))?,
            authority_level: authority
                .map(|raw| serde_json::from_value(serde_json::Value::String(raw)))
                .transpose()
                .map_err(|err| graph_decode(err, "authority_level"))?,
        };
        Ok(Some(record))
    }

    async fn inbound_by_kind(
        &self,
        doc_id: &str,
        kind: RelationKind,
    ) -> RagResult<Vec<CrossRefEdge>> {
        let rows = self
            .db
            .query(INBOUND_BY_KIND_SQL, &[&doc_id, &kind.as_str()])
            .await
            .map_err(graph_unavailable)?;
        Ok(rows.iter().map(edge_from_row).collect())
    }
}

fn graph_unavailable(err: tokio_postgres::Error) -> RagError {
    RagError::IndexUnavailable {
        backend: "graph",
        reason: err.to_string(),
    }
}

fn graph_decode(err: serde_json::Error, field: &str) -> RagError {
    RagError::IndexUnavailable {
        backend: "graph",
        reason: format!("bad {field} value: {err}"),
    }
}

fn node_from_row(row: &tokio_postgres::Row) -> GraphNode {
    GraphNode {
        doc_id: row.get("doc_id"),
        title: row.get("title"),
        breadcrumb: row.get("breadcrumb"),
        url: row.get("url"),
    }
}

fn edge_from_row(row: &tokio_postgres::Row) -> CrossRefEdge {
    let relation_raw: String = row.get("relation_type");
    CrossRefEdge {
        source_doc_id: row.get("source_doc_id"),
        target_doc_id: row.get("target_doc_id"),
        anchor_text: row.get("anchor_text"),
        relation: RelationKind::parse(&relation_raw),
        title: row.get("title"),
        url: row.get("url"),
    }
}
