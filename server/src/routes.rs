//! HTTP route handlers for the Askbox server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /ask` - Submit a question (rate limited per client)
//! - `POST /answer` - Answer a question (admin only)
//! - `GET /questions` - List questions and answer stats
//! - `GET /questions/{id}` - Fetch one question
//! - `GET /config` - UI settings for the frontend
//! - `GET /ws` - WebSocket endpoint for live updates
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - The rate limiter consulted before a question is stored
//! - The broadcast hub notified after a question is stored or answered
//! - The auth gate guarding admin-only actions and data
//! - The question store and the reloadable UI settings
//!
//! The three components never call each other; handlers invoke them in
//! turn and never hold one component's lock while calling another.
//!
//! # Example
//!
//! ```rust,no_run
//! use askbox_server::config::Config;
//! use askbox_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::load().expect("failed to load config");
//!     let state = AppState::new(&config).expect("failed to initialize");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind(config.bind_address()).await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, Request},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, error, info, warn, Span};

use crate::auth::{AuthError, AuthGate, AuthOutcome, Credentials};
use crate::broadcast::{BroadcastHub, Event};
use crate::config::{Config, LimitsConfig, SharedUiConfig, UiConfig};
use crate::error::ServerError;
use crate::identity::ClientIdentity;
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::store::QuestionStore;
use crate::types::{Question, QuestionEvent, Stats, NEW_ANSWER, NEW_QUESTION};

// ============================================================================
// Constants
// ============================================================================

/// Response header carrying a token issued after a password login.
pub const HEADER_ADMIN_TOKEN: &str = "x-admin-token";

/// Maximum request body size (64 KiB).
const MAX_BODY_SIZE: usize = 64 * 1024;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Cloning is cheap; every component is reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Rate limiting settings, fixed at startup.
    pub limits: LimitsConfig,

    /// UI settings, replaced on configuration reload.
    pub ui: SharedUiConfig,

    /// Per-client question rate limiter.
    pub rate_limiter: RateLimiter,

    /// Fan-out hub for live updates.
    pub hub: BroadcastHub,

    /// Admin authentication.
    pub auth: Arc<AuthGate>,

    /// Question storage.
    pub store: Arc<QuestionStore>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state from configuration.
    ///
    /// Generates the token signing key and spawns the hub's dispatcher, so
    /// this must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if no secure randomness is available or the
    /// admin password cannot be hashed.
    pub fn new(config: &Config) -> Result<Self, AuthError> {
        let auth = AuthGate::new(&config.admin.password, &config.admin.token_duration)?;
        let rate_limiter = RateLimiter::with_retention(
            config.limits.refill_rate(),
            config.limits.questions_burst,
            config.limits.retention(),
        );
        let hub = BroadcastHub::new(config.hub_config());

        Ok(Self::with_components(config, rate_limiter, hub, Arc::new(auth)))
    }

    /// Creates application state with custom components.
    ///
    /// Useful for testing or when custom limits are needed.
    #[must_use]
    pub fn with_components(
        config: &Config,
        rate_limiter: RateLimiter,
        hub: BroadcastHub,
        auth: Arc<AuthGate>,
    ) -> Self {
        Self {
            limits: config.limits.clone(),
            ui: Arc::new(RwLock::new(config.ui.clone())),
            rate_limiter,
            hub,
            auth,
            store: Arc::new(QuestionStore::new()),
            start_time: Instant::now(),
        }
    }

    fn ui_snapshot(&self) -> UiConfig {
        self.ui.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("limits", &self.limits)
            .field("hub", &self.hub)
            .field("rate_limiter", &self.rate_limiter)
            .field("auth", &self.auth)
            .field("questions", &self.store.len())
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ask", post(post_ask))
        .route("/answer", post(post_answer))
        .route("/questions", get(get_questions))
        .route("/questions/{id}", get(get_question))
        .route("/config", get(get_config))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Request span without the query string, which may carry a password.
fn request_span(request: &Request<Body>) -> Span {
    debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    )
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Runs the auth gate, moving the slow password check off the async runtime.
///
/// A failed blocking task counts as "not admin".
async fn authenticate(auth: &Arc<AuthGate>, credentials: Credentials) -> AuthOutcome {
    if !credentials.has_password() {
        return auth.authenticate(&credentials);
    }

    let gate = Arc::clone(auth);
    match tokio::task::spawn_blocking(move || gate.authenticate(&credentials)).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %err, "Authentication task failed");
            AuthOutcome::default()
        }
    }
}

/// Adds `X-Admin-Token` when a password login produced a fresh token.
fn with_admin_token(mut response: Response, outcome: &AuthOutcome) -> Response {
    if let Some(token) = &outcome.fresh_token {
        if let Ok(value) = HeaderValue::from_str(token) {
            response.headers_mut().insert(HEADER_ADMIN_TOKEN, value);
        }
    }
    response
}

/// Publishes a question change to connected viewers.
async fn publish_change(hub: &BroadcastHub, event_type: &str, question: &Question) {
    let payload = QuestionEvent::new(question.id.clone(), Utc::now());
    match Event::from_payload(event_type, &payload) {
        Ok(event) => hub.publish(event).await,
        Err(err) => error!(error = %err, event_type, "Failed to build event payload"),
    }
}

// ============================================================================
// POST /ask - Question Submission
// ============================================================================

/// Form body of `POST /ask`.
#[derive(Debug, Default, Deserialize)]
pub struct AskForm {
    #[serde(default)]
    pub question: String,
}

/// Response body of `POST /ask`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AskResponse {
    pub id: String,
}

/// POST /ask - Submit a question.
///
/// # Responses
///
/// - `200 OK` - `{"id": "..."}`
/// - `400 Bad Request` - Empty question
/// - `429 Too Many Requests` - Client is rate limited (includes `Retry-After`)
async fn post_ask(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    Form(form): Form<AskForm>,
) -> Result<Json<AskResponse>, ServerError> {
    if form.question.trim().is_empty() {
        return Err(ServerError::validation("Question cannot be empty"));
    }

    if let RateLimitResult::Limited { retry_after_secs } = state.rate_limiter.check(&identity) {
        info!(
            identity = %identity,
            retry_after = retry_after_secs,
            "Question rate limited"
        );
        return Err(ServerError::rate_limit(
            identity,
            retry_after_secs,
            state.limits.questions_per_hour,
        ));
    }

    let question = state.store.create(&form.question, Utc::now());
    info!(question_id = %question.id, "Question submitted");
    publish_change(&state.hub, NEW_QUESTION, &question).await;

    Ok(Json(AskResponse { id: question.id }))
}

// ============================================================================
// POST /answer - Answer Submission
// ============================================================================

/// Form body of `POST /answer`.
#[derive(Debug, Default, Deserialize)]
pub struct AnswerForm {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub answer: String,
    /// Admin password, if no bearer token is sent.
    pub password: Option<String>,
}

/// POST /answer - Answer a question.
///
/// # Authentication
///
/// `Authorization: Bearer <token>`, or a `password` form field. A password
/// login returns a fresh token in `X-Admin-Token`.
///
/// # Responses
///
/// - `200 OK` - The answered question
/// - `400 Bad Request` - Missing `id` or `answer`
/// - `401 Unauthorized` - Not an admin
/// - `404 Not Found` - Unknown question id
async fn post_answer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<AnswerForm>,
) -> Result<Response, ServerError> {
    let credentials = Credentials::from_headers(&headers).with_optional_password(form.password);
    let outcome = authenticate(&state.auth, credentials).await;
    if !outcome.is_admin {
        debug!("Answer rejected, not authenticated");
        return Err(ServerError::Unauthorized);
    }

    if form.id.is_empty() || form.answer.is_empty() {
        return Err(ServerError::validation("Missing required fields"));
    }

    let question = state
        .store
        .answer(&form.id, &form.answer)
        .ok_or_else(|| ServerError::not_found("question"))?;

    info!(question_id = %question.id, "Question answered");
    publish_change(&state.hub, NEW_ANSWER, &question).await;

    Ok(with_admin_token(Json(question).into_response(), &outcome))
}

// ============================================================================
// GET /questions - Question Listing
// ============================================================================

/// Query parameters of `GET /questions`.
#[derive(Debug, Default, Deserialize)]
pub struct QuestionsQuery {
    /// `"true"` to include unanswered questions (admins only).
    pub all: Option<String>,
    pub password: Option<String>,
}

/// Response body of `GET /questions`.
#[derive(Debug, Serialize, Deserialize)]
pub struct QuestionsResponse {
    pub questions: Vec<Question>,
    pub stats: Stats,
}

/// GET /questions - List questions, newest first.
///
/// Everyone sees answered questions. Admins passing `all=true` also see
/// unanswered ones. Stats always cover every question.
async fn get_questions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<QuestionsQuery>,
) -> Response {
    let show_all = query.all.as_deref() == Some("true");
    let credentials = Credentials::from_headers(&headers).with_optional_password(query.password);
    let outcome = authenticate(&state.auth, credentials).await;

    let body = QuestionsResponse {
        questions: state.store.list(show_all && outcome.is_admin),
        stats: state.store.stats(),
    };

    with_admin_token(Json(body).into_response(), &outcome)
}

// ============================================================================
// GET /questions/{id} - Single Question
// ============================================================================

/// GET /questions/{id} - Fetch one question.
async fn get_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Question>, ServerError> {
    state
        .store
        .get(&id)
        .map(Json)
        .ok_or_else(|| ServerError::not_found("question"))
}

// ============================================================================
// GET /config - UI Settings
// ============================================================================

/// GET /config - UI-safe settings only; never credentials.
async fn get_config(State(state): State<AppState>) -> Json<UiConfig> {
    Json(state.ui_snapshot())
}

// ============================================================================
// GET /ws - Live Updates
// ============================================================================

/// Refuses new viewers once the hub is full.
fn ensure_viewer_capacity(hub: &BroadcastHub) -> Result<(), ServerError> {
    let max_viewers = hub.config().max_viewers;
    if hub.viewer_count() >= max_viewers {
        warn!(max_viewers, "Refusing WebSocket upgrade, viewer limit reached");
        return Err(ServerError::unavailable("viewer limit reached"));
    }
    Ok(())
}

/// GET /ws - WebSocket endpoint for live updates.
///
/// # WebSocket Protocol
///
/// The server sends `{"type": ..., "payload": {"id": ..., "timestamp": ...}}`
/// text frames for `new_question` and `new_answer`. Frames sent by the
/// client are ignored. Slow clients are disconnected.
///
/// # Responses
///
/// - `101 Switching Protocols` - WebSocket upgrade successful
/// - `503 Service Unavailable` - Viewer limit reached
async fn get_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    ensure_viewer_capacity(&state.hub)?;

    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        // The limit may have been reached while upgrading.
        if let Err(err) = state.hub.connect(sink, stream) {
            warn!(error = %err, "WebSocket viewer rejected after upgrade");
        }
    }))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of connected WebSocket viewers.
    pub viewers: usize,

    /// Number of client identities with rate limiter state.
    pub tracked_identities: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "viewers": 42,
///   "tracked_identities": 17,
///   "uptime_seconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        viewers: state.hub.viewer_count(),
        tracked_identities: state.rate_limiter.tracked_identities(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
