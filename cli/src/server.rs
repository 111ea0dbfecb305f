use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use tally_core::daykey::parse_day;
use tally_core::db::{Database, ProgressQuery};
use tally_core::models::{ConflictKey, Entity, ProgressRecord, TrackedItem, validate_item};

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    api_key: Option<String>,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

#[derive(Deserialize)]
struct ProgressFilterQuery {
    user_id: String,
    item_id: Option<Uuid>,
    from: Option<String>,
    to: Option<String>,
}

#[derive(Deserialize)]
struct UpsertQuery {
    on_conflict: Option<String>,
}

impl UpsertQuery {
    /// Reject a conflict target other than the one the table is keyed on.
    fn check<E: Entity>(&self) -> Result<(), ApiError> {
        let expected = E::CONFLICT_KEY.columns();
        match self.on_conflict.as_deref() {
            None => Ok(()),
            Some(cols) if cols == expected => Ok(()),
            Some(cols) => Err(ApiError::BadRequest(format!(
                "Unsupported on_conflict '{cols}' for {}; expected '{expected}'",
                E::KIND
            ))),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
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

fn parse_day_param(name: &str, value: Option<&str>) -> Result<Option<chrono::NaiveDate>, ApiError> {
    value
        .map(|s| {
            parse_day(s).map_err(|_| {
                ApiError::BadRequest(format!("Invalid {name} '{s}'. Use YYYY-MM-DD"))
            })
        })
        .transpose()
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

// --- Item handlers ---

async fn list_items(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<TrackedItem>>, ApiError> {
    let items = state
        .db()
        .list_items(Some(&q.user_id))
        .context("database error")?;
    Ok(Json(items))
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrackedItem>, ApiError> {
    let item = state.db().get_item(id).context("database error")?;
    item.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Item {id} not found")))
}

async fn upsert_item(
    State(state): State<AppState>,
    Query(q): Query<UpsertQuery>,
    Json(item): Json<TrackedItem>,
) -> Result<Json<TrackedItem>, ApiError> {
    q.check::<TrackedItem>()?;
    validate_item(&item).map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    state.db().upsert_item(&item).context("failed to upsert item")?;
    Ok(Json(item))
}

async fn delete_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let db = state.db();
    let records = db
        .delete_progress_for_item(id)
        .context("failed to delete progress")?;
    let deleted = db.delete_item(id).context("failed to delete item")?;
    info!(%id, deleted, records, "item deleted");
    Ok(StatusCode::NO_CONTENT)
}

// --- Progress handlers ---

async fn list_progress(
    State(state): State<AppState>,
    Query(q): Query<ProgressFilterQuery>,
) -> Result<Json<Vec<ProgressRecord>>, ApiError> {
    let query = ProgressQuery {
        user_id: Some(&q.user_id),
        item_id: q.item_id,
        from: parse_day_param("from", q.from.as_deref())?,
        to: parse_day_param("to", q.to.as_deref())?,
    };
    let records = state.db().list_progress(&query).context("database error")?;
    Ok(Json(records))
}

async fn upsert_progress(
    State(state): State<AppState>,
    Query(q): Query<UpsertQuery>,
    Json(record): Json<ProgressRecord>,
) -> Result<Json<ProgressRecord>, ApiError> {
    q.check::<ProgressRecord>()?;
    if record.goal == 0 {
        return Err(ApiError::BadRequest("goal must be at least 1".to_string()));
    }
    state
        .db()
        .upsert_progress(&record)
        .context("failed to upsert progress")?;
    Ok(Json(record))
}

async fn delete_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .db()
        .delete_progress(id)
        .context("failed to delete progress")?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Router builder ---

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/items", get(list_items).put(upsert_item))
        .route("/api/items/{id}", get(get_item).delete(delete_item))
        .route("/api/progress", get(list_progress).put(upsert_progress))
        .route("/api/progress/{id}", delete(delete_progress))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

/// First and last four bytes of the key, or `****` when the key is too short
/// or those bytes split a character.
fn mask_key(key: &str) -> String {
    if key.len() < 8 {
        return "****".to_string();
    }
    match (key.get(..4), key.get(key.len() - 4..)) {
        (Some(head), Some(tail)) => format!("{head}...{tail}"),
        _ => "****".to_string(),
    }
}

pub async fn start_server(
    db: Database,
    port: u16,
    bind: &str,
    api_key: Option<String>,
    new_api_key: bool,
) -> anyhow::Result<()> {
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        api_key: api_key.clone(),
    };

    let app = build_router(state);

    if let Some(ref key) = api_key {
        if new_api_key {
            eprintln!("Generated new API key: {key}");
            eprintln!("Include in requests: Authorization: Bearer {key}");
        } else {
            eprintln!(
                "API key: {} (see api_key file in data directory)",
                mask_key(key)
            );
        }
    } else {
        warn!("authentication disabled (--no-auth); the API is open to anyone");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        warn!("listening on {bind} with no authentication");
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}
