//! Thin HTTP front for the engine.
//!
//! | Route | Description |
//! |-------|-------------|
//! | `GET /stream/:track_id?quality=` | Audio bytes, cached or progressively streamed |
//! | `GET /status/:track_id?quality=` | JSON status for one (track, tier) |
//! | `POST /reset/:track_id?quality=` | Clears unavailability marks (`all` or one tier) |
//! | `POST /cache/clear` | Cancels every live job |
//! | `GET /jobs` | Snapshots of registered jobs |

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::engine::Engine;
use crate::error::{EngineError, FailureClass};
use crate::quality::{content_type, QualityTier};
use crate::unavailability::ResetScope;

const DEFAULT_TIER: QualityTier = QualityTier::Kbps320;
const RETRY_AFTER_SECS: &str = "5";

const X_REQUESTED_QUALITY: &str = "x-requested-quality";
const X_SERVED_QUALITY: &str = "x-served-quality";
const X_QUALITY_FALLBACK: &str = "x-quality-fallback";
const X_UNAVAILABLE: &str = "x-unavailable";

#[derive(Debug, Default, Deserialize)]
pub struct QualityQuery {
    pub quality: Option<String>,
}

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/stream/:track_id", get(stream_track))
        .route("/status/:track_id", get(track_status))
        .route("/reset/:track_id", post(reset_track))
        .route("/cache/clear", post(clear_cache))
        .route("/jobs", get(list_jobs))
        .with_state(engine)
}

/// Binds `listen` and serves until the process ends.
pub async fn serve(engine: Engine, listen: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    tracing::info!("[http] Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(engine))
        .await
        .context("HTTP server terminated unexpectedly")
}

fn parse_tier(raw: Option<&str>) -> Result<QualityTier, Response> {
    match raw {
        None => Ok(DEFAULT_TIER),
        Some(raw) => raw
            .parse()
            .map_err(|e: String| (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response()),
    }
}

async fn stream_track(
    State(engine): State<Engine>,
    Path(track_id): Path<String>,
    Query(query): Query<QualityQuery>,
) -> Response {
    let tier = match parse_tier(query.quality.as_deref()) {
        Ok(tier) => tier,
        Err(response) => return response,
    };
    let mut handle = match engine.request_stream(&track_id, tier).await {
        Ok(handle) => handle,
        Err(err) => return error_response(&err),
    };
    // Headers go out before the body, so the served tier must be settled first.
    let served = match handle.wait_ready().await {
        Ok(served) => served,
        Err(err) => return error_response(&err),
    };
    let fallback = handle.is_fallback();
    let mime = content_type(handle.extension().as_deref(), served);

    let mut response = Body::from_stream(handle.into_stream()).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    headers.insert(HeaderName::from_static(X_REQUESTED_QUALITY), HeaderValue::from_static(tier.as_str()));
    headers.insert(HeaderName::from_static(X_SERVED_QUALITY), HeaderValue::from_static(served.as_str()));
    if fallback {
        headers.insert(HeaderName::from_static(X_QUALITY_FALLBACK), HeaderValue::from_static("true"));
    }
    response
}

async fn track_status(
    State(engine): State<Engine>,
    Path(track_id): Path<String>,
    Query(query): Query<QualityQuery>,
) -> Response {
    let tier = match parse_tier(query.quality.as_deref()) {
        Ok(tier) => tier,
        Err(response) => return response,
    };
    match engine.get_status(&track_id, tier).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn reset_track(
    State(engine): State<Engine>,
    Path(track_id): Path<String>,
    Query(query): Query<QualityQuery>,
) -> Response {
    let scope = match query.quality.as_deref().unwrap_or("all").parse::<ResetScope>() {
        Ok(scope) => scope,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response(),
    };
    match engine.reset_unavailability(&track_id, scope).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn clear_cache(State(engine): State<Engine>) -> Response {
    let cancelled = engine.clear_cache();
    Json(json!({ "cancelled": cancelled })).into_response()
}

async fn list_jobs(State(engine): State<Engine>) -> Response {
    Json(engine.active_jobs()).into_response()
}

/// Maps an engine error onto a status code that separates "retry shortly"
/// from "unavailable at this quality" from "unavailable at all".
pub fn error_response(err: &EngineError) -> Response {
    let class = err.class();
    let status = match err {
        EngineError::NotFoundInCatalog(_) | EngineError::QualityUnavailable { .. } => {
            StatusCode::NOT_FOUND
        }
        EngineError::BackendLaunch(_) => StatusCode::BAD_GATEWAY,
        EngineError::BackendTransient(_)
        | EngineError::DownloadJoinTimeout { .. }
        | EngineError::Aborted(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::ScratchIo(_) | EngineError::Catalog(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = (
        status,
        Json(json!({ "error": err.to_string(), "class": class })),
    )
        .into_response();
    let headers = response.headers_mut();
    match class {
        FailureClass::UnavailableAtQuality => {
            headers.insert(HeaderName::from_static(X_UNAVAILABLE), HeaderValue::from_static("quality"));
        }
        FailureClass::UnavailableEverywhere => {
            headers.insert(HeaderName::from_static(X_UNAVAILABLE), HeaderValue::from_static("all"));
        }
        FailureClass::Pending if status == StatusCode::SERVICE_UNAVAILABLE => {
            headers.insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        FailureClass::Pending => {}
    }
    response
}
