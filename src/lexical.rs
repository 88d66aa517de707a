//! Lexical retrieval leg: ranked full-text search over the regulation table.

use std::sync::Arc;

use tokio_postgres::Client;
use tracing::debug;

use crate::error::{RagError, RagResult};
use crate::records::AuthorityLevel;

/// One ranked lexical hit at regulation granularity.
#[derive(Debug, Clone)]
pub struct LexicalHit {
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
    /// Body text.
    pub body_text: String,
    /// `ts_rank_cd` score; 0 for exact-reference lookups.
    pub score: f64,
    /// Authority tier of the record.
    pub authority_level: Option<AuthorityLevel>,
}

/// Client for ranked and exact-reference search over `regulations`.
///
/// Ranking runs against a stored weighted tsvector: title and regulation
/// identifier carry weight A, breadcrumb B, body D. `index_setup` creates
/// the column and its GIN index.
#[derive(Clone)]
pub struct LexicalIndex {
    db: Arc<Client>,
}

const SEARCH_SQL: &str = "SELECT \
        doc_id, title, breadcrumb, url, document, regulation, body_text, authority_level, \
        ts_rank_cd(search_vector, plainto_tsquery('english', $1), 32) AS score \
    FROM regulations \
    WHERE search_vector @@ plainto_tsquery('english', $1) \
      AND ($3::text IS NULL OR document = $3) \
    ORDER BY score DESC \
    LIMIT $2";

const REGULATION_NUMBER_SQL: &str = "SELECT \
        doc_id, title, breadcrumb, url, document, regulation, body_text, authority_level \
    FROM regulations \
    WHERE regulation ILIKE $1 OR breadcrumb ILIKE $1 \
    ORDER BY doc_id \
    LIMIT $2";

const DOC_ID_SQL: &str = "SELECT \
        doc_id, title, breadcrumb, url, document, regulation, body_text, authority_level \
    FROM regulations \
    WHERE doc_id = $1";

impl LexicalIndex {
    /// Builds a new lexical index client.
    pub fn new(db: Arc<Client>) -> Self {
        Self { db }
    }

    /// Ranked full-text search; query stop-words are general English.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        document_filter: Option<&str>,
    ) -> RagResult<Vec<LexicalHit>> {
        let trimmed = query.trim();
        if trimmed.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let limit = top_k as i64;
        let rows = self
            .db
            .query(SEARCH_SQL, &[&trimmed, &limit, &document_filter])
            .await
            .map_err(lexical_unavailable)?;
        let hits: Vec<LexicalHit> = rows
            .iter()
            .map(|row| {
                let score: f32 = row.get("score");
                hit_from_row(row, score as f64)
            })
            .collect();
        debug!(hits = hits.len(), top_k, "lexical leg complete");
        Ok(hits)
    }

    /// Exact/near-exact match on the regulation and breadcrumb fields, used
    /// when the query clearly names a regulation.
    pub async fn search_by_regulation_number(
        &self,
        reference: &str,
        top_k: usize,
    ) -> RagResult<Vec<LexicalHit>> {
        let trimmed = reference.trim();
        if trimmed.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let pattern = format!("%{trimmed}%");
        let limit = top_k as i64;
        let rows = self
            .db
            .query(REGULATION_NUMBER_SQL, &[&pattern, &limit])
            .await
            .map_err(lexical_unavailable)?;
        Ok(rows.iter().map(|row| hit_from_row(row, 0.0)).collect())
    }

    /// Fetches a single regulation row by identifier.
    pub async fn get_by_doc_id(&self, doc_id: &str) -> RagResult<Option<LexicalHit>> {
        let rows = self
            .db
            .query(DOC_ID_SQL, &[&doc_id])
            .await
            .map_err(lexical_unavailable)?;
        Ok(rows.first().map(|row| hit_from_row(row, 0.0)))
    }
}

fn lexical_unavailable(err: tokio_postgres::Error) -> RagError {
    RagError::IndexUnavailable {
        backend: "lexical",
        reason: err.to_string(),
    }
}

fn hit_from_row(row: &tokio_postgres::Row, score: f64) -> LexicalHit {
    let authority_raw: Option<String> = row.get("authority_level");
    LexicalHit {
        doc_id: row.get("doc_id"),
        title: row.get("title"),
        breadcrumb: row.get("breadcrumb"),
        url: row.get("url"),
        document: row.get("document"),
        regulation: row.get("regulation"),
        body_text: row.get("body_text"),
        score,
        authority_level: authority_raw.and_then(|raw| parse_authority(&raw)),
    }
}

fn parse_authority(raw: &str) -> Option<AuthorityLevel> {
    match raw {
        "convention" => Some(AuthorityLevel::Convention),
        "resolution" => Some(AuthorityLevel::Resolution),
        "iacs_ur" => Some(AuthorityLevel::IacsUr),
        "iacs_ui" => Some(AuthorityLevel::IacsUi),
        "classification_rule" => Some(AuthorityLevel::ClassificationRule),
        "guidance_note" => Some(AuthorityLevel::GuidanceNote),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_parsing_covers_known_tiers() {
        assert_eq!(parse_authority("convention"), Some(AuthorityLevel::Convention));
        assert_eq!(parse_authority("iacs_ur"), Some(AuthorityLevel::IacsUr));
        assert_eq!(
            parse_authority("guidance_note"),
            Some(AuthorityLevel::GuidanceNote)
        );
        assert_eq!(parse_authority("mystery"), None);
    }
}
