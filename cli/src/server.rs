use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use menuplan_core::db::Database;
use menuplan_core::models::{StoredWeekMenu, WeekMenuRecord, validate_weekmenu_record};

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) db: Arc<Mutex<Database>>,
    pub(crate) api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct SubscriptionQuery {
    subscription_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

fn validated(record: &WeekMenuRecord) -> Result<(), ApiError> {
    validate_weekmenu_record(record).map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn latest_weekmenu(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
) -> Result<Json<StoredWeekMenu>, ApiError> {
    let db = state.db.lock().unwrap_or_else(PoisonError::into_inner);
    let row = db
        .find_latest_weekmenu(&query.subscription_id)
        .context("database error")?;
    row.map(Json).ok_or_else(|| {
        ApiError::NotFound(format!(
            "No week menu for subscription '{}'",
            query.subscription_id
        ))
    })
}

async fn list_weekmenus(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
) -> Result<Json<Vec<StoredWeekMenu>>, ApiError> {
    let db = state.db.lock().unwrap_or_else(PoisonError::into_inner);
    let rows = db
        .list_weekmenus(&query.subscription_id)
        .context("database error")?;
    Ok(Json(rows))
}

async fn create_weekmenu(
    State(state): State<AppState>,
    Json(record): Json<WeekMenuRecord>,
) -> Result<(StatusCode, Json<StoredWeekMenu>), ApiError> {
    validated(&record)?;
    let db = state.db.lock().unwrap_or_else(PoisonError::into_inner);
    let row = db.insert_weekmenu(&record).context("database error")?;
    info!(id = row.id, subscription = %row.subscription_id, "week menu created");
    Ok((StatusCode::CREATED, Json(row)))
}

async fn update_weekmenu(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(record): Json<WeekMenuRecord>,
) -> Result<Json<StoredWeekMenu>, ApiError> {
    validated(&record)?;
    let db = state.db.lock().unwrap_or_else(PoisonError::into_inner);
    let row = db
        .update_weekmenu(id, &record)
        .context("database error")?
        .ok_or_else(|| ApiError::NotFound(format!("Week menu {id} not found")))?;
    Ok(Json(row))
}

pub(crate) fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/weekmenus", post(create_weekmenu).get(list_weekmenus))
        .route("/api/weekmenus/latest", get(latest_weekmenu))
        .route("/api/weekmenus/{id}", put(update_weekmenu))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/health", get(health))
        .merge(api)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// First and last four characters of `key`; keys too short to show any
/// part of are masked entirely.
fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 12 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

pub async fn start_server(
    db: Database,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        api_key: api_key.clone(),
    };

    let app = build_router(state);

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {} (see api_key file in data directory)",
            mask_key(key)
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
