//! Error taxonomy shared across the retrieval and generation pipeline.

/// Failure categories surfaced by pipeline stages.
///
/// Leg-level backend failures (`EmbeddingUnavailable`, `IndexUnavailable`)
/// are caught inside the hybrid retriever and downgraded to an empty leg
/// plus a partial-retrieval marker; the remaining variants propagate to the
/// HTTP surface where they map onto status codes via [`RagError::http_status`].
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// The external embedding service could not produce a query vector.
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A single index backend failed or timed out.
    #[error("{backend} index unavailable: {reason}")]
    IndexUnavailable {
        /// Which backend failed (`vector`, `lexical`, `graph`).
        backend: &'static str,
        /// Underlying failure description.
        reason: String,
    },

    /// Every retrieval leg failed; generation is skipped.
    #[error("retrieval unavailable: all legs failed")]
    RetrievalUnavailable,

    /// The chat model call failed on both the routed and the alternate model.
    #[error("answer generation unavailable: {0}")]
    GenerationUnavailable(String),

    /// The session key-value store could not be reached.
    #[error("session store unavailable: {0}")]
    SessionStoreUnavailable(String),

    /// The utility table could not be read or written. Always swallowed.
    #[error("utility store unavailable: {0}")]
    UtilityStoreUnavailable(String),

    /// The caller supplied an unusable request.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A stage exceeded its timeout budget.
    #[error("{stage} timed out after {budget_ms} ms")]
    Timeout {
        /// The stage that ran out of budget.
        stage: &'static str,
        /// The configured budget in milliseconds.
        budget_ms: u64,
    },

    /// The request was cancelled before completion.
    #[error("request cancelled")]
    Cancelled,
}

impl RagError {
    /// HTTP status code for the structured error envelope.
    pub fn http_status(&self) -> u16 {
        match self {
            RagError::InvalidInput(_) => 400,
            RagError::Timeout { .. } => 408,
            RagError::EmbeddingUnavailable(_)
            | RagError::IndexUnavailable { .. }
            | RagError::RetrievalUnavailable
            | RagError::GenerationUnavailable(_)
            | RagError::SessionStoreUnavailable(_)
            | RagError::UtilityStoreUnavailable(_) => 503,
            RagError::Cancelled => 500,
        }
    }

    /// Bilingual user-facing text describing the failure domain.
    pub fn user_message(&self) -> &'static str {
        match self {
            RagError::EmbeddingUnavailable(_)
            | RagError::IndexUnavailable { .. }
            | RagError::RetrievalUnavailable => "检索暂时不可用 / retrieval unavailable",
            RagError::GenerationUnavailable(_) => "回答生成暂时不可用 / answer generation unavailable",
            RagError::SessionStoreUnavailable(_) => "会话存储暂时不可用 / session store unavailable",
            RagError::UtilityStoreUnavailable(_) => "排序反馈暂时不可用 / ranking feedback unavailable",
            RagError::InvalidInput(_) => "请求无效 / invalid request",
            RagError::Timeout { .. } => "请求超时 / request timed out",
            RagError::Cancelled => "请求已取消 / request cancelled",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type RagResult<T> = Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_category() {
        assert_eq!(RagError::InvalidInput("x".into()).http_status(), 400);
        assert_eq!(
            RagError::Timeout {
                stage: "llm",
                budget_ms: 20_000
            }
            .http_status(),
            408
        );
        assert_eq!(RagError::RetrievalUnavailable.http_status(), 503);
        assert_eq!(RagError::Cancelled.http_status(), 500);
    }

    #[test]
    fn retrieval_outage_message_is_bilingual() {
        let msg = RagError::RetrievalUnavailable.user_message();
        assert!(msg.contains("检索"));
        assert!(msg.contains("retrieval"));
    }
}
