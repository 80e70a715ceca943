//! PromptPal HTTP API
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! taking plain arguments, so the business logic is testable without going
//! through axum dispatch.
//!
//! Endpoints:
//! - GET  /health, GET /version
//! - POST /api/v1/auth/login
//! - /api/v1/admin/*  (session token) project and prompt administration
//! - /api/v1/public/* (API token) public prompt listing and execution

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{from_fn_with_state, map_response};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use promptpal_core::models::{
    ListResponse, MessageRow, NewProject, NewPrompt, Pagination, ProjectConfig, ProjectPatch,
    PromptPatch, PromptTemplate, TopPrompt, User, VariableDeclaration,
};
use promptpal_core::session::SessionError;
use promptpal_core::store::{top_prompts, ProjectStore, PromptStore, UserStore};
use promptpal_core::{
    Clock, ConfigCache, ExecutionDispatcher, ExecutionResult, LlmProvider, PromptPalConfig,
    RunRequest, SignatureVerifier, SessionIssuer, Store, DEFAULT_PROJECT_TTL,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::auth::{require_api_token, require_session, CurrentUser};
use crate::error::ApiError;

/// Value of the `X-PP-VER` response header.
pub const BUILD_VERSION: &str = match option_env!("PROMPTPAL_BUILD_SHA") {
    Some(sha) => sha,
    None => env!("CARGO_PKG_VERSION"),
};

pub const VERSION_HEADER: &str = "x-pp-ver";

/// Shared state for all HTTP handlers
pub struct AppState {
    pub config: PromptPalConfig,
    pub store: Arc<dyn Store>,
    /// `None` when running on the in-memory store.
    pub pool: Option<PgPool>,
    pub dispatcher: ExecutionDispatcher,
    pub sessions: SessionIssuer,
    pub verifier: SignatureVerifier,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        config: PromptPalConfig,
        store: Arc<dyn Store>,
        pool: Option<PgPool>,
        provider: Arc<dyn LlmProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        let sessions = SessionIssuer::new(&config.auth.jwt_secret, clock.clone())?;
        let project_ttl = config.cache.project_ttl().unwrap_or_else(|| {
            tracing::warn!(
                project_ttl_seconds = config.cache.project_ttl_seconds,
                "cache.project_ttl_seconds out of range, using default"
            );
            DEFAULT_PROJECT_TTL
        });
        let cache = Arc::new(ConfigCache::new(project_ttl, clock.clone()));
        let dispatcher = ExecutionDispatcher::new(
            store.clone(),
            cache,
            provider,
            clock.clone(),
            Duration::from_secs(config.provider.timeout_seconds),
        );

        Ok(Self {
            config,
            store,
            pool,
            dispatcher,
            sessions,
            verifier: SignatureVerifier::new(),
            clock,
        })
    }

    pub fn cache(&self) -> &ConfigCache {
        self.dispatcher.cache()
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/projects", get(list_projects_handler).post(create_project_handler))
        .route("/projects/:id", get(get_project_handler).put(update_project_handler))
        .route("/projects/:id/prompts", get(list_project_prompts_handler))
        .route("/projects/:id/top-prompts", get(top_prompts_handler))
        .route("/prompts", get(list_prompts_handler).post(create_prompt_handler))
        .route("/prompts/test", post(test_prompt_handler))
        .route("/prompts/:id", get(get_prompt_handler).put(update_prompt_handler))
        .route_layer(from_fn_with_state(state.clone(), require_session));

    let public = Router::new()
        .route("/prompts", get(list_public_prompts_handler))
        .route("/prompts/run/:id", post(run_prompt_handler))
        .route_layer(from_fn_with_state(state.clone(), require_api_token));

    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/api/v1/auth/login", post(login_handler))
        .nest("/api/v1/admin", admin)
        .nest("/api/v1/public", public)
        .fallback(not_found_handler)
        .layer(map_response(stamp_version))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("PromptPal HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

async fn stamp_version(mut res: Response) -> Response {
    res.headers_mut()
        .insert(VERSION_HEADER, HeaderValue::from_static(BUILD_VERSION));
    res
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub address: String,
    pub message: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub user: User,
}

/// Body of `POST /api/v1/admin/prompts/test`: an unsaved template plus the
/// values to render it with.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPromptRequest {
    pub project_id: i64,
    pub prompts: Vec<MessageRow>,
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    #[serde(default)]
    pub values: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(v)| v).map_err(ApiError::from)
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check; returns (status_code, json_body).
pub async fn health_inner(
    pool: Option<&PgPool>,
    cache: &ConfigCache,
) -> (StatusCode, serde_json::Value) {
    let storage = match pool {
        None => "memory".to_string(),
        Some(pool) => match promptpal_core::db::health_check(pool).await {
            Ok(v) => v,
            Err(e) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({
                        "status": "unhealthy",
                        "error": e.to_string(),
                    }),
                );
            }
        },
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "storage": storage,
            "cache": {
                "entries": cache.len(),
                "stats": cache.stats(),
            },
        }),
    )
}

/// Inner version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "build": BUILD_VERSION,
    })
}

/// Verify the wallet signature, look the user up and issue a session.
pub async fn login_inner(state: &AppState, req: LoginRequest) -> Result<LoginResponse, ApiError> {
    let verified = state
        .verifier
        .verify(&req.address, &req.message, &req.signature)?;
    if !verified {
        tracing::info!(address = %req.address, "login rejected: signature does not match address");
        return Err(ApiError::unauthorized("invalid signature"));
    }

    let user = state
        .store
        .find_user_by_addr(&req.address)
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;

    let ttl = state.config.auth.session_ttl().ok_or_else(|| {
        tracing::error!(
            session_ttl_days = state.config.auth.session_ttl_days,
            "auth.session_ttl_days out of range"
        );
        ApiError::internal("failed to issue session")
    })?;
    let session = state.sessions.issue(user.id, ttl)?;
    tracing::info!(user_id = user.id, "session issued");

    Ok(LoginResponse {
        token: session.token,
        expires_at: session.expires_at,
        user,
    })
}

pub async fn create_project_inner(
    state: &AppState,
    user: CurrentUser,
    req: NewProject,
) -> Result<ProjectConfig, ApiError> {
    req.validate()?;
    let project = state.store.create_project(req, user.0).await?;
    tracing::info!(project_id = project.id, user_id = user.0, "project created");
    Ok(project)
}

/// Commit the patch, then refresh the cached copy so executions see it.
pub async fn update_project_inner(
    state: &AppState,
    id: i64,
    patch: ProjectPatch,
) -> Result<ProjectConfig, ApiError> {
    if patch.is_empty() {
        return Err(ApiError::bad_request("no fields to update"));
    }
    patch.validate()?;

    let project = state.store.update_project(id, &patch).await?;
    state.cache().refresh(project.clone());
    tracing::info!(project_id = id, "project updated");
    Ok(project)
}

pub async fn create_prompt_inner(
    state: &AppState,
    user: CurrentUser,
    req: NewPrompt,
) -> Result<PromptTemplate, ApiError> {
    req.validate()?;
    if state.store.get_project(req.project_id).await?.is_none() {
        return Err(ApiError::not_found("project not found"));
    }
    let prompt = state.store.create_prompt(req, user.0).await?;
    tracing::info!(prompt_id = prompt.id, project_id = prompt.project_id, "prompt created");
    Ok(prompt)
}

pub async fn top_prompts_inner(
    state: &AppState,
    project_id: i64,
) -> Result<ListResponse<TopPrompt>, ApiError> {
    if state.store.get_project(project_id).await?.is_none() {
        return Err(ApiError::not_found("project not found"));
    }
    let data = top_prompts(state.store.as_ref(), project_id, state.clock.now()).await?;
    Ok(ListResponse {
        count: data.len() as i64,
        data,
    })
}

pub async fn test_prompt_inner(
    state: &AppState,
    req: TestPromptRequest,
    cancel: &CancellationToken,
) -> Result<ExecutionResult, ApiError> {
    if req.prompts.is_empty() {
        return Err(ApiError::bad_request("at least one message row is required"));
    }
    let result = state
        .dispatcher
        .run_unsaved(
            req.project_id,
            &req.prompts,
            &req.variables,
            &req.values,
            req.timeout_ms.map(Duration::from_millis),
            cancel,
        )
        .await?;
    Ok(result)
}

pub async fn run_prompt_inner(
    state: &AppState,
    prompt_id: i64,
    req: RunRequest,
    cancel: &CancellationToken,
) -> Result<ExecutionResult, ApiError> {
    let result = state.dispatcher.run(prompt_id, &req, cancel).await?;
    Ok(result)
}

// ============================================================================
// Axum handlers (thin wrappers around inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_inner(state.pool.as_ref(), state.cache()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    Json(version_inner())
}

pub async fn not_found_handler() -> ApiError {
    ApiError::not_found("page not found")
}

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    login_inner(&state, body(payload)?).await.map(Json)
}

pub async fn list_projects_handler(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> Result<Json<ListResponse<ProjectConfig>>, ApiError> {
    Ok(Json(state.store.list_projects(page).await?))
}

pub async fn get_project_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ProjectConfig>, ApiError> {
    state
        .store
        .get_project(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("project not found"))
}

pub async fn create_project_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    payload: Result<Json<NewProject>, JsonRejection>,
) -> Result<Json<ProjectConfig>, ApiError> {
    create_project_inner(&state, user, body(payload)?).await.map(Json)
}

pub async fn update_project_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<ProjectPatch>, JsonRejection>,
) -> Result<Json<ProjectConfig>, ApiError> {
    update_project_inner(&state, id, body(payload)?).await.map(Json)
}

pub async fn list_project_prompts_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(page): Query<Pagination>,
) -> Result<Json<ListResponse<PromptTemplate>>, ApiError> {
    Ok(Json(state.store.list_project_prompts(id, page).await?))
}

pub async fn top_prompts_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ListResponse<TopPrompt>>, ApiError> {
    top_prompts_inner(&state, id).await.map(Json)
}

pub async fn list_prompts_handler(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> Result<Json<ListResponse<PromptTemplate>>, ApiError> {
    Ok(Json(state.store.list_prompts(page).await?))
}

pub async fn get_prompt_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<PromptTemplate>, ApiError> {
    state
        .store
        .get_prompt(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("prompt not found"))
}

pub async fn create_prompt_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    payload: Result<Json<NewPrompt>, JsonRejection>,
) -> Result<Json<PromptTemplate>, ApiError> {
    create_prompt_inner(&state, user, body(payload)?).await.map(Json)
}

pub async fn update_prompt_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<PromptPatch>, JsonRejection>,
) -> Result<Json<PromptTemplate>, ApiError> {
    let patch = body(payload)?;
    Ok(Json(state.store.update_prompt(id, &patch).await?))
}

pub async fn test_prompt_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TestPromptRequest>, JsonRejection>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let req = body(payload)?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    test_prompt_inner(&state, req, &cancel).await.map(Json)
}

pub async fn list_public_prompts_handler(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> Result<Json<ListResponse<PromptTemplate>>, ApiError> {
    Ok(Json(state.store.list_public_prompts(page).await?))
}

/// The drop guard cancels the in-flight provider call if the client goes
/// away and axum drops this future.
pub async fn run_prompt_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let req = body(payload)?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    run_prompt_inner(&state, id, req, &cancel).await.map(Json)
}
