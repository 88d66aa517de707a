//! Conversation memory: session persistence, turn tracking and coreference
//! resolution against conversation history.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::types::Json as PgJson;
use tokio_postgres::Client;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RagError, RagResult};
use crate::generator;
use crate::llm::{AnthropicChat, ChatMessage, ChatRequest};
use crate::records::{Confidence, UserProfile};
use crate::{classifier, utility};

/// Cap on the rolling set of regulations a session tracks.
const MAX_ACTIVE_REGULATIONS: usize = 20;

/// Bilingual anaphor lexicon for coreference layer L1.
const PRONOUN_INDICATORS: &[&str] = &[
    "这个", "那个", "该", "它", "上面", "之前", "前面", "其", "此", "this", "that", " it ",
    "the above", "same", "these", "those", "aforementioned",
];

const SUMMARIZE_PROMPT: &str = "Summarize this maritime regulation Q&A in 2-3 sentences, \
    preserving regulation references and topics.";

const SUMMARY_FALLBACK: &str = "Previous maritime regulation discussion.";

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The surveyor asking.
    User,
    /// The service answering.
    Assistant,
}

impl Role {
    /// Chat-API role string.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// How the turn entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Transcribed audio.
    Voice,
    /// Typed text.
    Text,
}

/// Metadata recorded on a turn. Assistant turns carry the retrieval and
/// generation outcome used by later coreference resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    /// Query after coreference resolution and enhancement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_query: Option<String>,
    /// Regulation references behind the retrieved candidates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrieved_regulations: Vec<String>,
    /// Citation strings extracted from the answer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,
    /// Confidence label of the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    /// Anything else a caller wants to record.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Turn identifier.
    pub turn_id: String,
    /// Speaker.
    pub role: Role,
    /// Turn text.
    pub content: String,
    /// Submission time.
    pub timestamp: DateTime<Utc>,
    /// Input channel.
    pub input_mode: InputMode,
    /// Attached metadata.
    #[serde(default)]
    pub metadata: TurnMetadata,
}

/// A session with its rolling working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// Session identifier.
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Turns in submission order.
    #[serde(default)]
    pub turns: Vec<ConversationTurn>,
    /// Recently cited/retrieved regulations, oldest first, capped at 20.
    #[serde(default)]
    pub active_regulations: Vec<String>,
    /// Topics touched so far.
    #[serde(default)]
    pub active_topics: Vec<String>,
    /// Most recently declared ship type.
    #[serde(default)]
    pub active_ship_type: Option<String>,
}

impl SessionContext {
    /// A fresh session. When `session_id` is `None` a UUID is generated.
    pub fn new(user_id: &str, session_id: Option<String>) -> Self {
        Self {
            session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: user_id.to_string(),
            turns: Vec::new(),
            active_regulations: Vec::new(),
            active_topics: Vec::new(),
            active_ship_type: None,
        }
    }

    fn last_assistant_turn(&self) -> Option<&ConversationTurn> {
        self.turns.iter().rev().find(|t| t.role == Role::Assistant)
    }
}

/// Key-value session persistence over Postgres, one JSONB blob per session
/// with a TTL column. Last writer wins; no transactional semantics assumed
/// beyond single-key get/set.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Client>,
    ttl: Duration,
}

const SESSION_GET_SQL: &str =
    "SELECT data FROM sessions WHERE session_id = $1 AND expires_at > NOW()";
const SESSION_PUT_SQL: &str = "INSERT INTO sessions (session_id, data, expires_at) \
    VALUES ($1, $2, NOW() + make_interval(secs => $3)) \
    ON CONFLICT (session_id) DO UPDATE SET \
        data = EXCLUDED.data, expires_at = EXCLUDED.expires_at";
const SESSION_COUNT_SQL: &str = "SELECT COUNT(*) FROM sessions WHERE expires_at > NOW()";
const PROFILE_GET_SQL: &str = "SELECT data FROM user_profiles WHERE user_id = $1";
const PROFILE_PUT_SQL: &str = "INSERT INTO user_profiles (user_id, data) VALUES ($1, $2) \
    ON CONFLICT (user_id) DO UPDATE SET data = EXCLUDED.data";

impl SessionStore {
    /// Builds a new store with the configured inactivity TTL.
    pub fn new(db: Arc<Client>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Loads a session; expired or unknown sessions return `None`.
    pub async fn get(&self, session_id: &str) -> RagResult<Option<SessionContext>> {
        let rows = self
            .db
            .query(SESSION_GET_SQL, &[&session_id])
            .await
            .map_err(store_unavailable)?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let PgJson(session): PgJson<SessionContext> = row.get("data");
        Ok(Some(session))
    }

    /// Upserts a session and refreshes its expiry.
    pub async fn put(&self, session: &SessionContext) -> RagResult<()> {
        let ttl_secs = self.ttl.as_secs_f64();
        self.db
            .execute(
                SESSION_PUT_SQL,
                &[&session.session_id, &PgJson(session), &ttl_secs],
            )
            .await
            .map_err(store_unavailable)?;
        Ok(())
    }

    /// Live (unexpired) session count for the admin endpoint.
    pub async fn count(&self) -> RagResult<i64> {
        let row = self
            .db
            .query_one(SESSION_COUNT_SQL, &[])
            .await
            .map_err(store_unavailable)?;
        Ok(row.get(0))
    }

    /// Loads a user profile, defaulting to empty.
    pub async fn get_profile(&self, user_id: &str) -> RagResult<UserProfile> {
        let rows = self
            .db
            .query(PROFILE_GET_SQL, &[&user_id])
            .await
            .map_err(store_unavailable)?;
        Ok(rows
            .first()
            .map(|row| {
                let PgJson(profile): PgJson<UserProfile> = row.get("data");
                profile
            })
            .unwrap_or_default())
    }

    /// Upserts a user profile.
    pub async fn put_profile(&self, user_id: &str, profile: &UserProfile) -> RagResult<()> {
        self.db
            .execute(PROFILE_PUT_SQL, &[&user_id, &PgJson(profile)])
            .await
            .map_err(store_unavailable)?;
        Ok(())
    }
}

fn store_unavailable(err: tokio_postgres::Error) -> RagError {
    RagError::SessionStoreUnavailable(err.to_string())
}

/// Conversation memory: session lifecycle, turn appends and the three-layer
/// coreference resolver.
#[derive(Clone)]
pub struct ConversationMemory {
    store: SessionStore,
    chat: Arc<AnthropicChat>,
    fast_model: String,
    max_turns: usize,
    coref_timeout: Duration,
}

impl ConversationMemory {
    /// Builds conversation memory on top of the session store.
    pub fn new(
        store: SessionStore,
        chat: Arc<AnthropicChat>,
        fast_model: String,
        max_turns: usize,
        coref_timeout: Duration,
    ) -> Self {
        Self {
            store,
            chat,
            fast_model,
            max_turns: max_turns.max(1),
            coref_timeout,
        }
    }

    /// Access to the underlying store (admin endpoints).
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Loads the session, creating one (with the supplied id, if any) when
    /// absent. A store read failure degrades into a fresh session.
    pub async fn load_or_create(
        &self,
        session_id: Option<&str>,
        user_id: &str,
    ) -> SessionContext {
        if let Some(id) = session_id {
            match self.store.get(id).await {
                Ok(Some(session)) => return session,
                Ok(None) => {}
                Err(err) => {
                    warn!(%err, session_id = id, "session read failed, starting fresh");
                }
            }
        }
        let session = SessionContext::new(user_id, session_id.map(str::to_string));
        if let Err(err) = self.store.put(&session).await {
            warn!(%err, "failed to persist fresh session");
        }
        session
    }

    /// Appends a user turn: updates the declared ship type and topic set,
    /// then persists. Store failure is logged, never fatal.
    pub async fn add_user_turn(
        &self,
        session: &mut SessionContext,
        content: &str,
        input_mode: InputMode,
        metadata: TurnMetadata,
    ) {
        let info = classifier::classify(content).ship_info;
        if info.ship_type.is_some() {
            session.active_ship_type = info.ship_type;
        }
        let topic = utility::categorize(content);
        if topic != "general" && !session.active_topics.iter().any(|t| t == topic) {
            session.active_topics.push(topic.to_string());
        }
        session.turns.push(ConversationTurn {
            turn_id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.to_string(),
            timestamp: Utc::now(),
            input_mode,
            metadata,
        });
        self.persist(session).await;
    }

    /// Appends an assistant turn: pushes the retrieved regulations and any
    /// citations found in the answer text onto the working set (LRU, 20).
    pub async fn add_assistant_turn(
        &self,
        session: &mut SessionContext,
        content: &str,
        metadata: TurnMetadata,
    ) {
        for reference in &metadata.retrieved_regulations {
            push_regulation(&mut session.active_regulations, reference);
        }
        for citation in generator::extract_citation_strings(content) {
            push_regulation(&mut session.active_regulations, &citation);
        }
        session.turns.push(ConversationTurn {
            turn_id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: content.to_string(),
            timestamp: Utc::now(),
            input_mode: InputMode::Text,
            metadata,
        });
        self.persist(session).await;
    }

    /// Builds the LLM message history and the coreference-resolved query.
    ///
    /// The most recent `2 · max_turns` messages are passed verbatim; any
    /// older overflow is pre-summarised with a single fast-model call.
    pub async fn build_llm_context(
        &self,
        session: &SessionContext,
        current_query: &str,
    ) -> (Vec<ChatMessage>, String) {
        let keep = self.max_turns * 2;
        let mut messages = Vec::new();

        if session.turns.len() > keep {
            let early = &session.turns[..session.turns.len() - keep];
            let summary = self.summarize(early).await;
            messages.push(ChatMessage::user(format!(
                "[Earlier conversation summary: {summary}]"
            )));
            messages.push(ChatMessage::assistant(
                "I understand the context from our earlier discussion.",
            ));
        }
        for turn in session.turns.iter().skip(session.turns.len().saturating_sub(keep)) {
            messages.push(ChatMessage {
                role: turn.role.as_str().to_string(),
                content: turn.content.clone(),
            });
        }

        let enhanced_query = self.resolve_coreferences(session, current_query).await;
        (messages, enhanced_query)
    }

    /// Records the finished session into the per-user profile aggregate.
    pub async fn update_user_profile(&self, session: &SessionContext) {
        let mut profile = match self.store.get_profile(&session.user_id).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(%err, "profile read failed, skipping update");
                return;
            }
        };
        profile.total_queries += 1;
        for reference in &session.active_regulations {
            *profile.regulation_counts.entry(reference.clone()).or_default() += 1;
        }
        if let Some(ship_type) = &session.active_ship_type {
            *profile.ship_types.entry(ship_type.clone()).or_default() += 1;
        }
        if let Err(err) = self.store.put_profile(&session.user_id, &profile).await {
            warn!(%err, "profile write failed");
        }
    }

    /// One-line most-queried-regulations summary for prompt injection.
    pub async fn user_context(&self, user_id: &str) -> String {
        match self.store.get_profile(user_id).await {
            Ok(profile) => profile.context_line(),
            Err(_) => String::new(),
        }
    }

    async fn persist(&self, session: &SessionContext) {
        if let Err(err) = self.store.put(session).await {
            warn!(%err, session_id = %session.session_id, "session write failed");
        }
    }

    /// Three-layer coreference resolution, short-circuiting at L1.
    async fn resolve_coreferences(&self, session: &SessionContext, query: &str) -> String {
        // L1: anaphor detection. Nothing to resolve without a pronoun and
        // an active working set.
        if !detect_anaphor(query) || session.active_regulations.is_empty() {
            return query.to_string();
        }

        // L2: context prefix from the last assistant turn, falling back to
        // the session-level working set.
        let recent_regs: Vec<String> = session
            .last_assistant_turn()
            .filter(|turn| !turn.metadata.retrieved_regulations.is_empty())
            .map(|turn| turn.metadata.retrieved_regulations.clone())
            .unwrap_or_else(|| {
                session
                    .active_regulations
                    .iter()
                    .rev()
                    .take(5)
                    .rev()
                    .cloned()
                    .collect()
            });
        let prefixed = context_prefix(&recent_regs, query);

        // L3: single fast-model rewrite attempt with a strict acceptance
        // window; the prefixed query survives a rejected rewrite.
        let exchanges: Vec<String> = session
            .turns
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|t| format!("{}: {}", t.role.as_str(), truncate_chars(&t.content, 200)))
            .collect();
        let prompt = format!(
            "Given context: active regulations = {}\nRecent exchanges:\n{}\n\
             Rewrite the query '{}' to be self-contained, in the user's language.\n\
             Return ONLY the rewritten query.",
            recent_regs.join(", "),
            exchanges.join("\n"),
            query
        );
        let message = [ChatMessage::user(prompt)];
        let request = ChatRequest {
            model: &self.fast_model,
            system: None,
            messages: &message,
            max_tokens: 200,
            temperature: 0.0,
        };
        let rewrite = tokio::time::timeout(self.coref_timeout, self.chat.complete(&request)).await;
        match rewrite {
            Ok(Ok(outcome)) => {
                let candidate = outcome.text.trim().to_string();
                if accept_rewrite(query, &candidate) {
                    info!(original = query, rewritten = %candidate, "coreference resolved");
                    return candidate;
                }
                debug!("coreference rewrite rejected by length gate");
                prefixed
            }
            Ok(Err(err)) => {
                warn!(%err, "coreference rewrite failed");
                prefixed
            }
            Err(_) => {
                warn!("coreference rewrite timed out");
                prefixed
            }
        }
    }

    async fn summarize(&self, turns: &[ConversationTurn]) -> String {
        let conversation: Vec<String> = turns
            .iter()
            .map(|t| format!("{}: {}", t.role.as_str(), truncate_chars(&t.content, 300)))
            .collect();
        let message = [ChatMessage::user(format!(
            "{SUMMARIZE_PROMPT}\n\n{}",
            conversation.join("\n")
        ))];
        let request = ChatRequest {
            model: &self.fast_model,
            system: None,
            messages: &message,
            max_tokens: 200,
            temperature: 0.0,
        };
        match tokio::time::timeout(self.coref_timeout, self.chat.complete(&request)).await {
            Ok(Ok(outcome)) => outcome.text.trim().to_string(),
            Ok(Err(err)) => {
                warn!(%err, "history summarisation failed");
                SUMMARY_FALLBACK.to_string()
            }
            Err(_) => {
                warn!("history summarisation timed out");
                SUMMARY_FALLBACK.to_string()
            }
        }
    }
}

/// L1: true when the query contains a bilingual anaphor.
pub fn detect_anaphor(query: &str) -> bool {
    let query_lower = query.to_lowercase();
    PRONOUN_INDICATORS.iter().any(|p| query_lower.contains(p))
        || query_lower.starts_with("it ")
        || query_lower.ends_with(" it")
}

/// L2: prepends the context prefix naming the previous regulations.
pub fn context_prefix(regulations: &[String], query: &str) -> String {
    format!(
        "[Context: the previous question was about {}] {}",
        regulations.join(", "),
        query
    )
}

/// L3 acceptance gate: the rewrite must be at least 5 characters and within
/// 0.3×–3× of the original length.
pub fn accept_rewrite(original: &str, rewrite: &str) -> bool {
    let original_len = original.chars().count();
    let rewrite_len = rewrite.chars().count();
    if rewrite_len < 5 {
        return false;
    }
    let lower = (original_len as f64 * 0.3).floor() as usize;
    let upper = original_len * 3;
    rewrite_len >= lower && rewrite_len <= upper
}

fn push_regulation(list: &mut Vec<String>, reference: &str) {
    if reference.is_empty() {
        return;
    }
    if let Some(pos) = list.iter().position(|r| r == reference) {
        list.remove(pos);
    }
    list.push(reference.to_string());
    if list.len() > MAX_ACTIVE_REGULATIONS {
        let excess = list.len() - MAX_ACTIVE_REGULATIONS;
        list.drain(..excess);
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn turn(role: Role, content: &str, metadata: TurnMetadata) -> ConversationTurn {
        ConversationTurn {
            turn_id: "t".to_string(),
            role,
            content: content.to_string(),
            timestamp: DateTime::parse_from_rfc3339("2026-08-02T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            input_mode: InputMode::Text,
            metadata,
        }
    }

    #[test]
    fn anaphor_detection_is_bilingual() {
        assert!(detect_anaphor("这个适用于FPSO吗"));
        assert!(detect_anaphor("Does this apply to FPSO?"));
        assert!(detect_anaphor("该要求的豁免条件"));
        assert!(!detect_anaphor("SOLAS II-1/3-6 的开口最小尺寸是多少"));
        assert!(!detect_anaphor("liferaft requirements for cargo ships"));
    }

    #[test]
    fn context_prefix_names_previous_regulations() {
        let regs = vec!["SOLAS II-1/3-6".to_string()];
        let prefixed = context_prefix(&regs, "Does this apply to FPSO?");
        assert_eq!(
            prefixed,
            "[Context: the previous question was about SOLAS II-1/3-6] Does this apply to FPSO?"
        );
    }

    #[test]
    fn rewrite_acceptance_window() {
        let original = "Does this apply to FPSO?";
        assert!(accept_rewrite(
            original,
            "Does SOLAS Regulation II-1/3-6 apply to FPSO units?"
        ));
        // Too short.
        assert!(!accept_rewrite(original, "yes"));
        // Over three times the original length.
        let bloated = "x".repeat(original.chars().count() * 3 + 1);
        assert!(!accept_rewrite(original, &bloated));
        // Exactly at the upper bound is accepted.
        let at_limit = "x".repeat(original.chars().count() * 3);
        assert!(accept_rewrite(original, &at_limit));
    }

    #[test]
    fn active_regulations_trim_least_recent() {
        let mut list = Vec::new();
        for i in 0..25 {
            push_regulation(&mut list, &format!("SOLAS III/{i}"));
        }
        assert_eq!(list.len(), MAX_ACTIVE_REGULATIONS);
        assert_eq!(list.first().unwrap(), "SOLAS III/5");
        assert_eq!(list.last().unwrap(), "SOLAS III/24");
        // Re-pushing an existing reference moves it to the back.
        push_regulation(&mut list, "SOLAS III/5");
        assert_eq!(list.last().unwrap(), "SOLAS III/5");
        assert_eq!(list.len(), MAX_ACTIVE_REGULATIONS);
    }

    #[test]
    fn session_json_roundtrip_is_stable() {
        let mut session = SessionContext::new("surveyor-1", Some("s-1".to_string()));
        session.active_ship_type = Some("cargo ship".to_string());
        session.active_regulations.push("SOLAS III/31".to_string());
        session.turns.push(turn(
            Role::User,
            "100米货船救生筏配置",
            TurnMetadata::default(),
        ));
        session.turns.push(turn(
            Role::Assistant,
            "需要配备davit-launched救生筏 [SOLAS III/31.1.4]",
            TurnMetadata {
                retrieved_regulations: vec!["SOLAS III/31".to_string()],
                citations: vec!["[SOLAS III/31.1.4]".to_string()],
                confidence: Some(Confidence::High),
                ..TurnMetadata::default()
            },
        ));

        let first = serde_json::to_string(&session).unwrap();
        let reparsed: SessionContext = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn turn_metadata_preserves_unknown_fields() {
        let raw = r#"{"enhanced_query":"q","retrieved_regulations":["SOLAS III/31"],"custom_flag":true}"#;
        let parsed: TurnMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.enhanced_query.as_deref(), Some("q"));
        assert_eq!(
            parsed.extra.get("custom_flag"),
            Some(&serde_json::Value::Bool(true))
        );
    }
}
