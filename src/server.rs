use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ai::token_tracker::TokenTracker;
use crate::chat::{ChatError, ChatService, QuoteRequest};
use crate::config::ServerConfig;
use crate::db::{CreateLead, Database, UpdateLead};
use crate::keyword_store::KeywordStore;
use crate::lead_scoring::score_lead;
use crate::models::{
    ChatMessage, ChatRequest, ChatResponse, ChatSearchRequest, ChatSearchResponse, Lead,
    LeadCreate, LeadListQuery, LeadUpdate, NoteRequest, Product, ProductSearchRequest,
    RetrievalOutcome,
};
use crate::retrieval::HybridRetriever;

const DEFAULT_PRODUCT_LIMIT: usize = 50;
const MAX_PRODUCT_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    db: Database,
    chat: ChatService,
    retriever: HybridRetriever,
    keyword: KeywordStore,
    tracker: Arc<TokenTracker>,
}

impl AppState {
    pub fn new(
        db: Database,
        chat: ChatService,
        retriever: HybridRetriever,
        keyword: KeywordStore,
        tracker: Arc<TokenTracker>,
    ) -> Self {
        Self {
            db,
            chat,
            retriever,
            keyword,
            tracker,
        }
    }
}

pub fn router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/leads", get(list_leads).post(create_lead))
        .route(
            "/api/leads/:lead_id",
            get(get_lead).put(update_lead).delete(delete_lead),
        )
        .route("/api/leads/:lead_id/score", get(lead_score))
        .route("/api/leads/:lead_id/messages", get(lead_messages))
        .route("/api/leads/:lead_id/conversations", post(add_note))
        .route("/api/chat", post(chat_handler))
        .route("/api/quotes", post(create_quote))
        .route("/api/chat/search", post(search_messages))
        .route("/api/products", get(list_products))
        .route("/api/products/search", post(search_products))
        .route("/api/usage", get(usage))
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: ServerConfig, state: AppState) -> Result<()> {
    let app = router(state, &config);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "B2B Sales Agent API is running!",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.chat.providers();
    let (status, database) = match state.db.ping().await {
        Ok(()) => (StatusCode::OK, "connected"),
        Err(err) => {
            tracing::warn!(error = %err, "health check could not reach the database");
            (StatusCode::SERVICE_UNAVAILABLE, "unreachable")
        }
    };

    let body = json!({
        "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
        "database": database,
        "keyword_index": state.keyword.exists(),
        "default_provider": providers.default_name(),
        "available_providers": providers.available(),
        "configured_providers": providers.configured(),
        "timestamp": Utc::now(),
    });
    (status, Json(body))
}

async fn create_lead(
    State(state): State<AppState>,
    Json(request): Json<LeadCreate>,
) -> Result<(StatusCode, Json<Lead>), ApiError> {
    request.validate().map_err(ApiError::bad_request)?;

    match state.db.create_lead(&request).await? {
        CreateLead::Created(lead) => {
            tracing::info!(lead_id = %lead.id, company = %lead.company_name, "lead created");
            Ok((StatusCode::CREATED, Json(lead)))
        }
        CreateLead::DuplicateEmail => Err(ApiError::conflict(format!(
            "a lead with email {} already exists",
            request.email
        ))),
    }
}

async fn list_leads(
    State(state): State<AppState>,
    Query(query): Query<LeadListQuery>,
) -> Result<Json<Vec<Lead>>, ApiError> {
    if query.skip < 0 {
        return Err(ApiError::bad_request("skip must not be negative"));
    }
    if !(1..=1_000).contains(&query.limit) {
        return Err(ApiError::bad_request("limit must be between 1 and 1000"));
    }

    let leads = state
        .db
        .list_leads(query.status, query.skip, query.limit)
        .await?;
    Ok(Json(leads))
}

async fn get_lead(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
) -> Result<Json<Lead>, ApiError> {
    let lead = state.db.get_lead(&lead_id).await?;
    lead.map(Json).ok_or_else(|| lead_not_found(&lead_id))
}

async fn update_lead(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
    Json(update): Json<LeadUpdate>,
) -> Result<Json<Lead>, ApiError> {
    update.validate().map_err(ApiError::bad_request)?;

    match state.db.update_lead(&lead_id, &update).await? {
        UpdateLead::Updated(lead) => {
            tracing::info!(lead_id = %lead.id, "lead updated");
            Ok(Json(lead))
        }
        UpdateLead::NotFound => Err(lead_not_found(&lead_id)),
        UpdateLead::DuplicateEmail => Err(ApiError::conflict(format!(
            "a lead with email {} already exists",
            update.email.as_deref().unwrap_or_default()
        ))),
    }
}

async fn delete_lead(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.db.delete_lead(&lead_id).await? {
        return Err(lead_not_found(&lead_id));
    }
    tracing::info!(lead_id = %lead_id, "lead deleted");
    Ok(Json(json!({ "message": "Lead deleted successfully" })))
}

async fn lead_score(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let lead = state
        .db
        .get_lead(&lead_id)
        .await?
        .ok_or_else(|| lead_not_found(&lead_id))?;

    let scored = score_lead(&lead, Utc::now());
    state.db.set_lead_score(&lead_id, scored.lead_score).await?;

    Ok(Json(json!({
        "lead_id": lead_id,
        "lead_score": scored.lead_score,
        "factors": scored.factors,
    })))
}

async fn lead_messages(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    if !state.db.lead_exists(&lead_id).await? {
        return Err(lead_not_found(&lead_id));
    }
    Ok(Json(state.db.messages_for_lead(&lead_id).await?))
}

async fn add_note(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
    Json(note): Json<NoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let note = state.chat.add_note(&lead_id, note).await?;
    Ok(Json(json!({
        "message": "Conversation added successfully",
        "note": note,
    })))
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let response = state.chat.respond(request).await?;
    Ok(Json(response))
}

async fn create_quote(
    State(state): State<AppState>,
    Json(request): Json<QuoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let quote = state.chat.generate_quote(request).await?;
    Ok(Json(json!({ "quote": quote })))
}

async fn search_messages(
    State(state): State<AppState>,
    Json(request): Json<ChatSearchRequest>,
) -> Result<Json<ChatSearchResponse>, ApiError> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }

    let lead_id = request.lead_id.as_deref();
    let (mode, results) = if request.use_fuzzy {
        let hits = state
            .db
            .search_messages_fuzzy(query, lead_id, request.similarity_threshold, request.limit)
            .await?;
        ("fuzzy", hits)
    } else {
        let hits = state
            .db
            .search_messages_exact(query, lead_id, request.limit)
            .await?;
        ("exact", hits)
    };

    Ok(Json(ChatSearchResponse {
        query: query.to_string(),
        mode: mode.to_string(),
        results,
    }))
}

#[derive(Debug, Deserialize)]
struct ProductListQuery {
    limit: Option<usize>,
}

async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductListQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PRODUCT_LIMIT)
        .clamp(1, MAX_PRODUCT_LIMIT);
    let keyword = state.keyword.clone();
    let products: Vec<Product> = tokio::task::spawn_blocking(move || keyword.list(limit))
        .await
        .context("product listing task failed")??;

    Ok(Json(json!({
        "total": products.len(),
        "products": products,
    })))
}

async fn search_products(
    State(state): State<AppState>,
    Json(request): Json<ProductSearchRequest>,
) -> Result<Json<RetrievalOutcome>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }

    let outcome = state
        .retriever
        .search_catalog(request.query.trim(), request.categories, request.industry)
        .await;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    days: Option<i64>,
}

/// The whole usage file, or with `?days=N` only the last N days.
async fn usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Value>, ApiError> {
    let summary = state.tracker.summary().await;
    let Some(days) = query.days else {
        return Ok(Json(
            serde_json::to_value(summary).context("failed to encode token usage")?,
        ));
    };
    if days < 1 {
        return Err(ApiError::bad_request("days must be at least 1"));
    }

    let daily = summary.daily_since(Utc::now().date_naive(), days);
    let tokens: u64 = daily.values().map(|d| d.tokens).sum();
    Ok(Json(json!({
        "days": days,
        "total_tokens": tokens,
        "daily_usage": daily,
    })))
}

fn lead_not_found(lead_id: &str) -> ApiError {
    ApiError::not_found(format!("lead not found: {lead_id}"))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn conflict(message: String) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message,
        }
    }

    fn unprocessable(message: String) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{value:#}"), "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(value: ChatError) -> Self {
        match value {
            ChatError::EmptyMessage | ChatError::UnknownProvider(_) => {
                Self::bad_request(value.to_string())
            }
            ChatError::LeadNotFound(_) => Self::not_found(value.to_string()),
            ChatError::NothingToQuote => Self::unprocessable(value.to_string()),
            ChatError::Internal(err) => err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
