//! HTTP surface: event ingress and the operator API.
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /events` | CloudEvent ingress, structured or binary mode |
//! | `GET /healthz` | Liveness |
//! | `GET /v1/builds` | List builds |
//! | `GET /v1/builds/:id` | Build detail with log tail |
//! | `POST /v1/builds/:id/cancel` | Cancel a build |
//! | `GET /v1/stats` | Worker pool statistics |
//! | `DELETE /v1/services/:name` | Deprovision a deployment |

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::dispatch::{JobFilter, JobId, JobStatus};
use crate::engine::{Engine, ProcessOutcome};
use crate::event::Event;
use crate::provision::{DeprovisionError, ResourceName};
use crate::registry::{ListQuery, RegistryError};

/// Seconds a sender should wait before redelivering a rejected event.
const RETRY_AFTER_SECS: u64 = 5;

const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

#[derive(Clone)]
pub struct AppState {
  engine: Arc<Engine>,
}

/// An error response with body `{"code": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
  pub status: StatusCode,
  pub code: &'static str,
  pub message: String,
  pub retry_after: Option<u64>,
}

impl ApiError {
  pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
    Self {
      status,
      code,
      message: message.into(),
      retry_after: None,
    }
  }

  pub fn bad_request(message: impl Into<String>) -> Self {
    Self::new(StatusCode::BAD_REQUEST, "invalid_argument", message)
  }

  pub fn unavailable(message: impl Into<String>) -> Self {
    Self {
      retry_after: Some(RETRY_AFTER_SECS),
      ..Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
    }
  }

  pub fn code(&self) -> &'static str {
    self.code
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }
}

impl From<RegistryError> for ApiError {
  fn from(err: RegistryError) -> Self {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let api = Self::new(status, err.code(), err.to_string());
    match err {
      RegistryError::Unavailable(_) => Self {
        retry_after: Some(RETRY_AFTER_SECS),
        ..api
      },
      _ => api,
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let body = Json(json!({ "code": self.code, "message": self.message }));
    let mut response = (self.status, body).into_response();
    if let Some(secs) = self.retry_after
      && let Ok(value) = HeaderValue::from_str(&secs.to_string())
    {
      response.headers_mut().insert(RETRY_AFTER, value);
    }
    response
  }
}

pub fn router(engine: Arc<Engine>) -> Router {
  Router::new()
    .route("/healthz", get(healthz))
    .route("/events", post(receive_event))
    .route("/v1/builds", get(list_builds))
    .route("/v1/builds/:id", get(get_build))
    .route("/v1/builds/:id/cancel", post(cancel_build))
    .route("/v1/stats", get(stats))
    .route("/v1/services/:name", delete(delete_service))
    .layer(TraceLayer::new_for_http())
    .with_state(AppState { engine })
}

/// Serve the API until `shutdown` resolves.
pub async fn serve<F>(listener: tokio::net::TcpListener, engine: Arc<Engine>, shutdown: F) -> std::io::Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  if let Ok(addr) = listener.local_addr() {
    info!(addr = %addr, "listening");
  }
  axum::serve(listener, router(engine))
    .with_graceful_shutdown(shutdown)
    .await
}

async fn healthz() -> Json<serde_json::Value> {
  Json(json!({ "status": "ok" }))
}

/// Decode a CloudEvent from either content mode.
///
/// Binary mode carries attributes in `ce-*` headers and the payload as the
/// body. Anything without a `ce-id` header is read as structured JSON.
pub fn decode_event(headers: &HeaderMap, body: &[u8]) -> Result<Event, ApiError> {
  let structured = headers
    .get(CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.starts_with(STRUCTURED_CONTENT_TYPE));

  if structured || !headers.contains_key("ce-id") {
    return serde_json::from_slice(body).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "invalid_event", e.to_string()));
  }

  let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
  let required = |name: &'static str| {
    header(name).ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "invalid_event", format!("missing {} header", name)))
  };

  let data = if body.is_empty() {
    serde_json::Value::Null
  } else {
    serde_json::from_slice(body).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "invalid_event", e.to_string()))?
  };
  let time = match header("ce-time") {
    Some(raw) => Some(
      raw
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid_event", format!("invalid ce-time: {}", raw)))?,
    ),
    None => None,
  };

  Ok(Event {
    specversion: header("ce-specversion").unwrap_or_else(|| "1.0".to_string()),
    id: required("ce-id")?,
    event_type: required("ce-type")?,
    source: required("ce-source")?,
    subject: header("ce-subject"),
    time,
    data,
  })
}

async fn receive_event(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, ApiError> {
  let event = decode_event(&headers, &body)?;
  let outcome = state.engine.process(&event).await;

  match outcome {
    ProcessOutcome::Accepted(accepted) => Ok(
      (
        StatusCode::ACCEPTED,
        Json(json!({ "outcome": "accepted", "event_id": event.id, "result": accepted })),
      )
        .into_response(),
    ),
    ProcessOutcome::SkippedDuplicate => Ok(
      (
        StatusCode::OK,
        Json(json!({ "outcome": "skipped-duplicate", "event_id": event.id })),
      )
        .into_response(),
    ),
    ProcessOutcome::RejectedInvalid(message) => Err(ApiError::new(StatusCode::BAD_REQUEST, "invalid_event", message)),
    ProcessOutcome::RejectedError(message) => Err(ApiError::unavailable(message)),
  }
}

#[derive(Debug, Default, Deserialize)]
struct BuildsQuery {
  tenant: Option<String>,
  parser: Option<String>,
  status: Option<String>,
  page_size: Option<usize>,
  page_token: Option<String>,
}

async fn list_builds(State(state): State<AppState>, Query(query): Query<BuildsQuery>) -> Result<Response, ApiError> {
  let status = match query.status.as_deref() {
    Some(raw) => Some(raw.parse::<JobStatus>().map_err(ApiError::bad_request)?),
    None => None,
  };
  let list = ListQuery {
    filter: JobFilter {
      tenant: query.tenant,
      parser: query.parser,
      status,
    },
    page_size: query.page_size,
    page_token: query.page_token,
  };
  let page = state.engine.registry().list(&list)?;
  Ok(Json(page).into_response())
}

async fn get_build(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
  let detail = state.engine.registry().get(&JobId(id))?;
  Ok(Json(detail).into_response())
}

async fn cancel_build(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
  let job = state.engine.registry().cancel(&JobId(id))?;
  Ok(Json(job).into_response())
}

async fn stats(State(state): State<AppState>) -> Response {
  Json(state.engine.registry().stats()).into_response()
}

async fn delete_service(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response, ApiError> {
  let name = ResourceName::parse(&name).map_err(|e| ApiError::bad_request(e.to_string()))?;
  match state.engine.deprovision(&name).await {
    Ok(report) => Ok(Json(report).into_response()),
    Err(e @ DeprovisionError::NotFound(_)) => Err(ApiError::new(StatusCode::NOT_FOUND, "not_found", e.to_string())),
    Err(e @ DeprovisionError::PartialFailure { .. }) => Err(ApiError::unavailable(e.to_string())),
  }
}
