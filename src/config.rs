//! Process configuration, loaded from the environment at boot.

use std::time::Duration;

use clap::Parser;

/// Command-line interface shared by the service binaries.
///
/// Every flag is backed by an environment variable so deployments can run
/// the binaries bare.
#[derive(Parser, Debug, Clone)]
#[command(name = "bvrag", about = "Maritime regulation QA service configuration")]
pub struct Cli {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, env = "BVRAG_BIND", default_value = "127.0.0.1:8000")]
    pub bind: String,

    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Anthropic API key for answer generation and coreference rewrites
    #[arg(long, env = "ANTHROPIC_API_KEY")]
    pub anthropic_api_key: String,

    /// OpenAI API key for embeddings and speech services
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: String,

    /// Base URL for OpenAI-compatible endpoints
    #[arg(long, env = "BVRAG_OPENAI_BASE", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Embedding model identifier
    #[arg(long, env = "BVRAG_EMBEDDING_MODEL", default_value = "text-embedding-3-large")]
    pub embedding_model: String,

    /// Embedding dimensionality; must match the indexed vectors
    #[arg(long, env = "BVRAG_EMBEDDING_DIMENSIONS", default_value_t = 1024)]
    pub embedding_dimensions: usize,

    /// Higher-capacity chat model for complex queries
    #[arg(long, env = "BVRAG_MODEL_PRIMARY", default_value = "claude-sonnet-4-20250514")]
    pub primary_model: String,

    /// Low-latency chat model for lookups and rewrites
    #[arg(long, env = "BVRAG_MODEL_FAST", default_value = "claude-haiku-4-5-20251001")]
    pub fast_model: String,

    /// Speech-to-text model identifier
    #[arg(long, env = "BVRAG_STT_MODEL", default_value = "gpt-4o-mini-transcribe")]
    pub stt_model: String,

    /// Text-to-speech model identifier
    #[arg(long, env = "BVRAG_TTS_MODEL", default_value = "gpt-4o-mini-tts")]
    pub tts_model: String,

    /// Text-to-speech voice
    #[arg(long, env = "BVRAG_TTS_VOICE", default_value = "ash")]
    pub tts_voice: String,

    /// Directory of practical-knowledge YAML files
    #[arg(long, env = "BVRAG_KNOWLEDGE_DIR", default_value = "knowledge/practical")]
    pub knowledge_dir: String,

    /// Hours of inactivity before a session expires
    #[arg(long, env = "BVRAG_SESSION_TTL_HOURS", default_value_t = 24)]
    pub session_ttl_hours: u64,

    /// Conversation turns kept verbatim in the LLM context
    #[arg(long, env = "BVRAG_MAX_CONVERSATION_TURNS", default_value_t = 10)]
    pub max_conversation_turns: usize,

    /// Utility blend weight in [0, 0.5]
    #[arg(long, env = "BVRAG_UTILITY_ALPHA", default_value_t = 0.3)]
    pub utility_alpha: f64,

    /// Ceiling used to normalise raw fused scores onto [0, 1]
    #[arg(long, env = "BVRAG_UTILITY_NORM_CEILING", default_value_t = 0.1)]
    pub utility_norm_ceiling: f64,

    /// Seconds before an embedding request times out
    #[arg(long, env = "BVRAG_EMBED_TIMEOUT_SECS", default_value_t = 2)]
    pub embed_timeout_secs: u64,

    /// Seconds granted to each retrieval leg
    #[arg(long, env = "BVRAG_LEG_TIMEOUT_SECS", default_value_t = 3)]
    pub leg_timeout_secs: u64,

    /// Seconds before a chat-model call times out
    #[arg(long, env = "BVRAG_LLM_TIMEOUT_SECS", default_value_t = 20)]
    pub llm_timeout_secs: u64,

    /// Seconds granted to the coreference rewrite call
    #[arg(long, env = "BVRAG_COREF_TIMEOUT_SECS", default_value_t = 4)]
    pub coref_timeout_secs: u64,

    /// Seconds granted to the fire-and-forget utility update
    #[arg(long, env = "BVRAG_UTILITY_TIMEOUT_SECS", default_value_t = 2)]
    pub utility_timeout_secs: u64,

    /// Retry attempts for transient embedding/chat errors
    #[arg(long, env = "BVRAG_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: usize,

    /// Max cached query embeddings kept in-memory (0 disables caching)
    #[arg(long, default_value_t = 1024)]
    pub embedding_cache_size: usize,

    /// Max requests per minute allowed (0 disables rate limiting)
    #[arg(long, default_value_t = 120)]
    pub max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly)
    #[arg(long, default_value_t = 12)]
    pub rate_limit_burst: u32,
}

/// Immutable runtime settings derived from the CLI. Fixed after boot.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Utility blend weight in [0, 0.5].
    pub utility_alpha: f64,
    /// Fused-score normalisation ceiling.
    pub utility_norm_ceiling: f64,
    /// Session inactivity TTL.
    pub session_ttl: Duration,
    /// Conversation turns kept verbatim.
    pub max_conversation_turns: usize,
    /// Embedding request budget.
    pub embed_timeout: Duration,
    /// Per-leg retrieval budget.
    pub leg_timeout: Duration,
    /// Chat-model call budget.
    pub llm_timeout: Duration,
    /// Coreference rewrite budget.
    pub coref_timeout: Duration,
    /// Fire-and-forget utility update budget.
    pub utility_timeout: Duration,
}

impl Cli {
    /// Converts the parsed CLI into validated runtime settings.
    pub fn build_settings(&self) -> anyhow::Result<Settings> {
        anyhow::ensure!(
            (0.0..=0.5).contains(&self.utility_alpha),
            "utility alpha {} outside [0, 0.5]",
            self.utility_alpha
        );
        anyhow::ensure!(
            self.utility_norm_ceiling > 0.0,
            "utility normalisation ceiling must be positive"
        );
        anyhow::ensure!(
            self.embedding_dimensions > 0,
            "embedding dimensionality must be positive"
        );
        Ok(Settings {
            utility_alpha: self.utility_alpha,
            utility_norm_ceiling: self.utility_norm_ceiling,
            session_ttl: Duration::from_secs(self.session_ttl_hours.max(1) * 3600),
            max_conversation_turns: self.max_conversation_turns.max(1),
            embed_timeout: Duration::from_secs(self.embed_timeout_secs.max(1)),
            leg_timeout: Duration::from_secs(self.leg_timeout_secs.max(1)),
            llm_timeout: Duration::from_secs(self.llm_timeout_secs.max(1)),
            coref_timeout: Duration::from_secs(self.coref_timeout_secs.max(1)),
            utility_timeout: Duration::from_secs(self.utility_timeout_secs.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_with(args: &[&str]) -> Cli {
        let mut full = vec![
            "bvrag",
            "--database-url",
            "postgres://localhost/bvrag",
            "--anthropic-api-key",
            "test-key",
            "--openai-api-key",
            "test-key",
        ];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn defaults_match_suggested_budgets() {
        let settings = cli_with(&[]).build_settings().unwrap();
        assert_eq!(settings.embed_timeout, Duration::from_secs(2));
        assert_eq!(settings.leg_timeout, Duration::from_secs(3));
        assert_eq!(settings.llm_timeout, Duration::from_secs(20));
        assert_eq!(settings.coref_timeout, Duration::from_secs(4));
        assert_eq!(settings.session_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(settings.utility_alpha, 0.3);
    }

    #[test]
    fn rejects_out_of_range_alpha() {
        let err = cli_with(&["--utility-alpha", "0.9"])
            .build_settings()
            .unwrap_err();
        assert!(err.to_string().contains("alpha"));
    }
}
