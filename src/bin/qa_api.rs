use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::Engine;
use bvrag::config::Cli;
use bvrag::embedder::OpenAiEmbedder;
use bvrag::generator::AnswerGenerator;
use bvrag::graph::GraphIndex;
use bvrag::knowledge::KnowledgeBase;
use bvrag::lexical::LexicalIndex;
use bvrag::llm::AnthropicChat;
use bvrag::memory::{ConversationMemory, InputMode, SessionStore};
use bvrag::pipeline::QaPipeline;
use bvrag::retriever::{HybridRetriever, Strategy};
use bvrag::utility::UtilityStore;
use bvrag::vector::{SearchFilters, VectorIndex};
use bvrag::voice::{SttClient, TtsClient};
use bvrag::{enhance, RagError};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<QaPipeline>,
    retriever: HybridRetriever,
    graph: GraphIndex,
    vector: VectorIndex,
    utility: UtilityStore,
    sessions: SessionStore,
    db: Arc<Client>,
    rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Deserialize)]
struct TextQueryForm {
    text: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    generate_audio: Option<bool>,
    #[serde(default)]
    input_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TtsForm {
    text: String,
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    document_filter: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();
    let settings = cli.build_settings()?;

    let (client, connection) = tokio_postgres::connect(&cli.database_url, NoTls)
        .await
        .with_context(|| format!("failed to connect to Postgres at {}", cli.database_url))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(%err, "postgres connection error");
        }
    });
    let db = Arc::new(client);

    let embedder = Arc::new(OpenAiEmbedder::new(
        cli.openai_api_key.clone(),
        cli.openai_base_url.clone(),
        cli.embedding_model.clone(),
        cli.embedding_dimensions,
        settings.embed_timeout,
        cli.max_retries.max(1),
        32,
    )?);
    let chat = Arc::new(AnthropicChat::new(
        cli.anthropic_api_key.clone(),
        settings.llm_timeout,
        cli.max_retries.max(1),
    )?);
    let stt = SttClient::new(
        cli.openai_api_key.clone(),
        &cli.openai_base_url,
        cli.stt_model.clone(),
        Duration::from_secs(30),
    )?;
    let tts = TtsClient::new(
        cli.openai_api_key.clone(),
        &cli.openai_base_url,
        cli.tts_model.clone(),
        cli.tts_voice.clone(),
        Duration::from_secs(30),
    )?;

    let vector = VectorIndex::new(db.clone(), embedder, cli.embedding_cache_size);
    let lexical = LexicalIndex::new(db.clone());
    let graph = GraphIndex::new(db.clone());
    let utility = UtilityStore::new(db.clone(), settings.utility_alpha, settings.utility_norm_ceiling);
    let retriever = HybridRetriever::new(
        vector.clone(),
        lexical,
        graph.clone(),
        utility.clone(),
        settings.leg_timeout,
    );
    let sessions = SessionStore::new(db.clone(), settings.session_ttl);
    let memory = ConversationMemory::new(
        sessions.clone(),
        chat.clone(),
        cli.fast_model.clone(),
        settings.max_conversation_turns,
        settings.coref_timeout,
    );
    let knowledge = Arc::new(KnowledgeBase::load(FsPath::new(&cli.knowledge_dir))?);
    let generator = AnswerGenerator::new(chat, cli.primary_model.clone(), cli.fast_model.clone());
    let pipeline = Arc::new(QaPipeline::new(
        memory,
        retriever.clone(),
        knowledge,
        generator,
        utility.clone(),
        stt,
        tts,
        settings.utility_timeout,
    ));

    let state = AppState {
        pipeline,
        retriever,
        graph,
        vector,
        utility,
        sessions,
        db,
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/voice/text-query", post(text_query))
        .route("/api/v1/voice/query", post(voice_query))
        .route("/api/v1/voice/tts", post(tts_endpoint))
        .route("/api/v1/voice/ws/{session_id}", get(ws_upgrade))
        .route("/api/v1/search", post(search))
        .route("/api/v1/regulation/{doc_id}", get(regulation))
        .route("/api/v1/admin/stats", get(admin_stats))
        .route("/api/v1/admin/session/{session_id}", get(admin_session))
        .route("/api/v1/admin/utility-stats", get(admin_utility_stats))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    info!(%addr, "bvrag qa-api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server shutdown")?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn text_query(
    State(state): State<AppState>,
    Form(form): Form<TextQueryForm>,
) -> Result<Json<bvrag::QueryOutcome>, (StatusCode, Json<serde_json::Value>)> {
    acquire_slot(&state).await?;
    let input_mode = parse_input_mode(form.input_mode.as_deref());
    let outcome = state
        .pipeline
        .process_text_query(
            &form.text,
            form.session_id.as_deref(),
            "anonymous",
            form.generate_audio.unwrap_or(false),
            input_mode,
        )
        .await
        .map_err(|err| error_envelope(&err, form.session_id.as_deref()))?;
    Ok(Json(outcome))
}

async fn voice_query(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<bvrag::QueryOutcome>, (StatusCode, Json<serde_json::Value>)> {
    acquire_slot(&state).await?;
    let mut audio: Option<Vec<u8>> = None;
    let mut audio_format = "webm".to_string();
    let mut session_id: Option<String> = None;
    let mut language: Option<String> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "audio" => {
                if let Some(ext) = field.file_name().and_then(|f| f.rsplit('.').next()) {
                    audio_format = ext.to_string();
                }
                audio = field.bytes().await.ok().map(|b| b.to_vec());
            }
            "session_id" => session_id = field.text().await.ok().filter(|s| !s.is_empty()),
            "language" => language = field.text().await.ok().filter(|s| !s.is_empty()),
            _ => {}
        }
    }
    let Some(audio) = audio else {
        let err = RagError::InvalidInput("missing audio field".into());
        return Err(error_envelope(&err, session_id.as_deref()));
    };

    let outcome = state
        .pipeline
        .process_voice_query(
            audio,
            &audio_format,
            session_id.as_deref(),
            language.as_deref(),
            "anonymous",
        )
        .await
        .map_err(|err| error_envelope(&err, session_id.as_deref()))?;
    Ok(Json(outcome))
}

async fn tts_endpoint(
    State(state): State<AppState>,
    Form(form): Form<TtsForm>,
) -> Json<serde_json::Value> {
    let tts_text = bvrag::voice::prepare_tts_text(&form.text, 1500);
    if tts_text.is_empty() {
        return Json(serde_json::json!({"answer_audio_base64": null, "audio_format": "mp3"}));
    }
    match state.pipeline.tts().synthesize(&tts_text).await {
        Ok(audio) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
            Json(serde_json::json!({"answer_audio_base64": encoded, "audio_format": "mp3"}))
        }
        Err(err) => {
            error!(%err, "tts synthesis failed");
            Json(serde_json::json!({"answer_audio_base64": null, "error": err.to_string()}))
        }
    }
}

async fn ws_upgrade(
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, session_id: String) {
    info!(%session_id, "websocket connected");
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let parsed: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                send_ws_error(&mut socket, &format!("invalid JSON: {err}")).await;
                continue;
            }
        };

        let result = match parsed["type"].as_str().unwrap_or("text") {
            "audio" => {
                let encoded = parsed["audio"].as_str().unwrap_or("");
                match base64::engine::general_purpose::STANDARD.decode(encoded) {
                    Ok(audio) => {
                        state
                            .pipeline
                            .process_voice_query(audio, "webm", Some(&session_id), None, "anonymous")
                            .await
                    }
                    Err(err) => {
                        send_ws_error(&mut socket, &format!("invalid audio payload: {err}")).await;
                        continue;
                    }
                }
            }
            _ => {
                let query = parsed["text"].as_str().unwrap_or("");
                state
                    .pipeline
                    .process_text_query(query, Some(&session_id), "anonymous", false, InputMode::Text)
                    .await
            }
        };

        match result {
            Ok(outcome) => {
                let mut envelope = serde_json::to_value(&outcome).unwrap_or_default();
                if let Some(map) = envelope.as_object_mut() {
                    map.insert("type".into(), serde_json::Value::String("response".into()));
                }
                if socket.send(Message::Text(envelope.to_string().into())).await.is_err() {
                    break;
                }
            }
            Err(err) => send_ws_error(&mut socket, &err.to_string()).await,
        }
    }
    info!(%session_id, "websocket disconnected");
}

async fn send_ws_error(socket: &mut WebSocket, message: &str) {
    let body = serde_json::json!({"type": "error", "message": message});
    let _ = socket.send(Message::Text(body.to_string().into())).await;
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    acquire_slot(&state).await?;
    if request.query.trim().is_empty() {
        let err = RagError::InvalidInput("query text must not be empty".into());
        return Err(error_envelope(&err, None));
    }
    let top_k = request.top_k.unwrap_or(10).clamp(1, 15);
    let enhancement = enhance(&request.query);
    let filters = SearchFilters {
        document: request.document_filter.clone(),
        ..SearchFilters::default()
    };
    let batch = state
        .retriever
        .retrieve(
            &request.query,
            &enhancement.enhanced_query,
            top_k,
            Strategy::Auto,
            &filters,
        )
        .await
        .map_err(|err| error_envelope(&err, None))?;
    let results: Vec<serde_json::Value> = batch
        .candidates
        .iter()
        .map(|c| {
            serde_json::json!({
                "chunk_id": c.chunk_id,
                "text": c.text.chars().take(500).collect::<String>(),
                "score": c.final_score,
                "metadata": c.metadata,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({
        "query": request.query,
        "enhanced_query": enhancement.enhanced_query,
        "partial_retrieval": batch.partial_retrieval,
        "results": results,
    })))
}

async fn regulation(
    Path(doc_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let record = state
        .graph
        .get_regulation(&doc_id)
        .await
        .map_err(internal_error)?;
    let Some(record) = record else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                message: format!("regulation {doc_id} not found"),
            }),
        ));
    };
    let cross_references = state
        .graph
        .cross_references(&doc_id)
        .await
        .map_err(internal_error)?;
    let children = state.graph.children(&doc_id).await.map_err(internal_error)?;
    Ok(Json(serde_json::json!({
        "regulation": record,
        "cross_references": cross_references,
        "children": children,
    })))
}

async fn admin_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let regulations: i64 = state
        .db
        .query_one("SELECT COUNT(*) FROM regulations", &[])
        .await
        .map_err(|err| internal_error(RagError::IndexUnavailable {
            backend: "lexical",
            reason: err.to_string(),
        }))?
        .get(0);
    let chunks: i64 = state
        .db
        .query_one("SELECT COUNT(*) FROM chunks", &[])
        .await
        .map_err(|err| internal_error(RagError::IndexUnavailable {
            backend: "vector",
            reason: err.to_string(),
        }))?
        .get(0);
    let vector_points = state.vector.point_count().await.map_err(internal_error)?;
    let sessions = state.sessions.count().await.unwrap_or(-1);
    Ok(Json(serde_json::json!({
        "total_regulations": regulations,
        "total_chunks": chunks,
        "vector_points": vector_points,
        "sessions": sessions,
    })))
}

async fn admin_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let session = state.sessions.get(&session_id).await.map_err(internal_error)?;
    let Some(session) = session else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                message: format!("session {session_id} not found"),
            }),
        ));
    };
    let recent_turns: Vec<serde_json::Value> = session
        .turns
        .iter()
        .rev()
        .take(4)
        .rev()
        .map(|turn| {
            serde_json::json!({
                "role": turn.role,
                "content": turn.content.chars().take(100).collect::<String>(),
                "metadata": turn.metadata,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({
        "session_id": session.session_id,
        "user_id": session.user_id,
        "turns_count": session.turns.len(),
        "active_regulations": session.active_regulations,
        "active_topics": session.active_topics,
        "active_ship_type": session.active_ship_type,
        "turns": recent_turns,
    })))
}

async fn admin_utility_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let stats = state.utility.stats().await.map_err(internal_error)?;
    Ok(Json(serde_json::json!({"status": "ok", "utility_stats": stats})))
}

fn parse_input_mode(raw: Option<&str>) -> InputMode {
    match raw {
        Some("voice") => InputMode::Voice,
        _ => InputMode::Text,
    }
}

async fn acquire_slot(state: &AppState) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.acquire().await {
            let body = serde_json::json!({"message": "rate limit exceeded"});
            return Err((StatusCode::TOO_MANY_REQUESTS, Json(body)));
        }
    }
    Ok(())
}

/// Structured error envelope: the failure domain as answer text, low
/// confidence, empty citations and sources.
fn error_envelope(
    err: &RagError,
    session_id: Option<&str>,
) -> (StatusCode, Json<serde_json::Value>) {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "session_id": session_id,
        "enhanced_query": "",
        "answer_text": err.user_message(),
        "answer_audio_base64": null,
        "citations": [],
        "confidence": "low",
        "model_used": "none",
        "sources": [],
        "timing": {},
        "error": err.to_string(),
    });
    (status, Json(body))
}

fn internal_error(err: RagError) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
}

#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        let capacity = burst as f64;
        let refill_per_sec = max_per_minute as f64 / 60.0;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec,
        })
    }

    async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
