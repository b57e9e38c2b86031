//! HTTP front of the gateway.
//!
//! `/__posw/*` is the control surface; every other request is intercepted.

use axum::body::{to_bytes, Body};
use axum::extract::{Request as HttpRequest, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

use crate::error::InterceptError;
use crate::event::{Signal, SignalSender};
use crate::interceptor::Interceptor;
use crate::lifecycle::Controller;
use crate::net::{is_hop_by_hop, Request, ResponseSnapshot};

/// Largest request body buffered for interception
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Tells the client which layer produced the response
const SOURCE_HEADER: &str = "x-posw-source";

#[derive(Clone)]
pub struct AppState {
  pub interceptor: Arc<Interceptor>,
  pub controller: Arc<Controller>,
  pub signals: SignalSender,
  /// Origin-form request targets resolve against this
  pub upstream: Url,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/__posw/status", get(status))
    .route("/__posw/online", post(online))
    .route("/__posw/sync", post(sync))
    .fallback(intercept)
    .with_state(state)
}

pub async fn serve<F>(listen: SocketAddr, state: AppState, shutdown: F) -> Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!("Listening on {}", listen);

  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn status(State(state): State<AppState>) -> Response {
  let status = state.controller.status();
  match state.controller.drainer().outbox().counts() {
    Ok(outbox) => Json(json!({
      "generation": status.generation,
      "state": status.state,
      "online": status.online,
      "outbox": outbox,
      "last_drain": status.last_drain,
      "last_drain_at": status.last_drain_at,
    }))
    .into_response(),
    Err(e) => {
      error!("Failed to read outbox counts: {}", e);
      (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": e.to_string() })),
      )
        .into_response()
    }
  }
}

/// Host-delivered "connectivity restored" signal.
async fn online(State(state): State<AppState>) -> StatusCode {
  match state.signals.send(Signal::ConnectivityRestored) {
    Ok(()) => StatusCode::ACCEPTED,
    Err(_) => StatusCode::SERVICE_UNAVAILABLE,
  }
}

/// Background-sync trigger; drains right away and reports the result.
async fn sync(State(state): State<AppState>) -> Response {
  match state.controller.drain_now().await {
    Ok(report) => Json(report).into_response(),
    Err(e) => {
      error!("Drain failed: {}", e);
      (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": e.to_string() })),
      )
        .into_response()
    }
  }
}

async fn intercept(State(state): State<AppState>, request: HttpRequest) -> Response {
  let (parts, body) = request.into_parts();

  let url = match resolve_url(&state.upstream, &parts.uri) {
    Ok(url) => url,
    Err(e) => return error_body(StatusCode::BAD_REQUEST, false, &e.to_string()),
  };

  let body = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => return error_body(StatusCode::PAYLOAD_TOO_LARGE, false, &e.to_string()),
  };

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let request = Request {
    method: parts.method,
    url,
    headers,
    body: body.to_vec(),
  };

  match state.interceptor.handle(request).await {
    Ok(outcome) => {
      let mut response = into_response(outcome.response);
      response.headers_mut().insert(
        HeaderName::from_static(SOURCE_HEADER),
        HeaderValue::from_static(outcome.source.as_str()),
      );
      response
    }
    Err(e) => intercept_error(&e),
  }
}

/// Absolute-form targets are used as-is; origin-form targets go to the upstream.
fn resolve_url(upstream: &Url, uri: &Uri) -> Result<Url> {
  if uri.scheme().is_some() && uri.authority().is_some() {
    return Url::parse(&uri.to_string()).map_err(|e| eyre!("Invalid request target {}: {}", uri, e));
  }

  let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
  upstream
    .join(target)
    .map_err(|e| eyre!("Invalid request target {}: {}", target, e))
}

fn into_response(snapshot: ResponseSnapshot) -> Response {
  let status = StatusCode::from_u16(snapshot.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut response = Response::new(Body::from(snapshot.body));
  *response.status_mut() = status;

  let headers = response.headers_mut();
  for (name, value) in &snapshot.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  response
}

fn intercept_error(err: &InterceptError) -> Response {
  let status = match err {
    InterceptError::Fetch(_) | InterceptError::MalformedPayload { .. } => StatusCode::BAD_GATEWAY,
    InterceptError::OutboxWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
  };
  error_body(status, err.is_offline(), &err.to_string())
}

fn error_body(status: StatusCode, offline: bool, message: &str) -> Response {
  (
    status,
    Json(json!({ "success": false, "offline": offline, "error": message })),
  )
    .into_response()
}
