//! Tiered Memory Server
//!
//! HTTP API for the memory engine, plus the periodic offload job.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiered_memory::{
    config::Config,
    context::{ContextMatch, RecentTurn},
    conversation::{TurnHandler, FAILURE_REPLY},
    embedding::FastEmbedProvider,
    error::Error,
    long_term::FactMatch,
    memory::MemoryStore,
    message::{ContextEntry, LongTermFact, Role},
    pipeline::{OffloadPipeline, OffloadReport, PruneReport, RunReport},
    provider::{ChatMessage, CompletionClient, LlmCompressor, LlmGenerator},
    retrieval::RetrievalComposer,
    scoring::{Jitter, LlmImportanceScorer},
};

/// Application state shared across handlers
struct AppState {
    store: Arc<MemoryStore>,
    retrieval: RetrievalComposer,
    turns: TurnHandler,
    pipeline: Arc<OffloadPipeline>,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting Tiered Memory Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);
    if config.api_key.is_none() {
        tracing::warn!("MEMORY_API_KEY is not set, completion calls are sent without a key");
    }

    // Initialize components
    let embedder = Arc::new(FastEmbedProvider::new(&config)?);
    let store = Arc::new(MemoryStore::open(config.clone(), embedder).await?);
    let client = Arc::new(CompletionClient::new(&config)?);

    let generator = Arc::new(LlmGenerator::new(client.clone(), config.chat_model.clone()));
    let compressor = Arc::new(LlmCompressor::new(client.clone(), config.summary_model.clone()));
    let scorer = Arc::new(LlmImportanceScorer::new(
        client,
        config.rating_model.clone(),
        Jitter::from_entropy(),
        config.importance_threshold,
    ));

    let pipeline = Arc::new(OffloadPipeline::new(store.clone(), scorer, compressor.clone()));
    tokio::spawn(pipeline.clone().run_periodic(config.offload_interval));
    tracing::info!("Offload scheduled every {:?}", config.offload_interval);

    let state = Arc::new(AppState {
        retrieval: RetrievalComposer::for_store(&store),
        turns: TurnHandler::new(store.clone(), generator, compressor),
        store,
        pipeline,
    });

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health))
        // Live turns
        .route("/turn", post(handle_turn))
        // Context tier
        .route("/context", post(append_context))
        .route("/context/:user_id/recent", get(recent_context))
        // Retrieval
        .route("/retrieve", post(retrieve_context))
        // Long-term tier
        .route("/long-term/:user_id", get(list_facts))
        // Offload/prune
        .route("/pipeline/run", post(run_pipeline))
        .route("/pipeline/:user_id/run", post(run_pipeline_for_user))
        .layer(TraceLayer::new_for_http())
        // Add CORS
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let port = config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Map an engine error onto a response status
fn status_for(error: Error) -> StatusCode {
    match error {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::Collaborator(_) | Error::MalformedResponse(_) | Error::Embedding(_) => {
            tracing::warn!(%error, "Collaborator failure");
            StatusCode::BAD_GATEWAY
        }
        other => {
            tracing::error!(error = %other, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

// --- Turn handlers ---

#[derive(Debug, Deserialize)]
struct TurnRequest {
    user_id: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct TurnResponse {
    reply: String,
    memories_used: usize,
    ok: bool,
}

async fn handle_turn(
    State(state): State<SharedState>,
    Json(req): Json<TurnRequest>,
) -> Json<TurnResponse> {
    match state.turns.respond(&req.user_id, &req.text).await {
        Ok(turn) => Json(TurnResponse {
            reply: turn.reply,
            memories_used: turn.memories_used,
            ok: true,
        }),
        Err(e) => {
            tracing::error!(user_id = %req.user_id, error = %e, "Turn failed");
            Json(TurnResponse {
                reply: FAILURE_REPLY.to_string(),
                memories_used: 0,
                ok: false,
            })
        }
    }
}

// --- Context handlers ---

#[derive(Debug, Deserialize)]
struct AppendContextRequest {
    user_id: String,
    role: String,
    content: String,
    summary: Option<String>,
}

async fn append_context(
    State(state): State<SharedState>,
    Json(req): Json<AppendContextRequest>,
) -> Result<Json<ContextEntry>, StatusCode> {
    let role: Role = req.role.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let summary = req.summary.as_deref().unwrap_or(&req.content);

    let entry = state
        .store
        .context()
        .append(&req.user_id, role, &req.content, summary)
        .await
        .map_err(status_for)?;

    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_context(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<RecentTurn>>, StatusCode> {
    let limit = query.limit.unwrap_or(state.store.config().recent_window);
    let window = state
        .store
        .context()
        .recent_window(&user_id, limit)
        .map_err(status_for)?;
    Ok(Json(window))
}

// --- Retrieval handlers ---

#[derive(Debug, Deserialize)]
struct RetrieveRequest {
    user_id: String,
    query: String,
}

#[derive(Debug, Serialize)]
struct RetrieveResponse {
    facts: Vec<FactMatch>,
    turns: Vec<ContextMatch>,
    total_tokens: u32,
    prior_turns: Vec<ChatMessage>,
}

async fn retrieve_context(
    State(state): State<SharedState>,
    Json(req): Json<RetrieveRequest>,
) -> Result<Json<RetrieveResponse>, StatusCode> {
    let context = state
        .retrieval
        .compose(&req.user_id, &req.query)
        .await
        .map_err(status_for)?;

    let prior_turns = context.prior_turns();
    Ok(Json(RetrieveResponse {
        facts: context.facts,
        turns: context.turns,
        total_tokens: context.total_tokens,
        prior_turns,
    }))
}

// --- Long-term handlers ---

async fn list_facts(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<LongTermFact>>, StatusCode> {
    let facts = state
        .store
        .long_term()
        .facts(&user_id)
        .map_err(status_for)?;
    Ok(Json(facts))
}

// --- Pipeline handlers ---

async fn run_pipeline(
    State(state): State<SharedState>,
) -> Result<Json<RunReport>, StatusCode> {
    state
        .pipeline
        .run_all()
        .await
        .map_err(status_for)?
        .map(Json)
        .ok_or(StatusCode::CONFLICT)
}

#[derive(Debug, Serialize)]
struct UserRunResponse {
    offload: OffloadReport,
    prune: PruneReport,
}

async fn run_pipeline_for_user(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserRunResponse>, StatusCode> {
    let (offload, prune) = state
        .pipeline
        .run_user(&user_id)
        .await
        .map_err(status_for)?
        .ok_or(StatusCode::CONFLICT)?;
    Ok(Json(UserRunResponse { offload, prune }))
}
