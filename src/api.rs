//! JSON-over-HTTP front-end.
//!
//! A thin translator from requests to core operations: every action is
//! `POST /api/<version>/<action>` with a JSON body, resolved through an
//! explicit registry keyed by (version, action). Unknown actions produce a
//! typed error payload, and every error response carries
//! `{kind, message, jobid?, hostname?}` with secrets never included.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::dispatcher::{Dispatcher, JobFilters};
use crate::error::{PogoError, Result};
use crate::job::HaltCause;

/// `ping` answer, a little sanity beacon.
const PING_PAYLOAD: u32 = 0xDEAD_BEEF;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jobid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
}

fn error_response(err: PogoError) -> Response {
    let status = match &err {
        PogoError::InvalidSpec(_) | PogoError::UnknownNamespace(_) | PogoError::UnknownTag(_) => {
            StatusCode::BAD_REQUEST
        }
        PogoError::JobNotFound(_) => StatusCode::NOT_FOUND,
        PogoError::DispatchRejected(_) => StatusCode::CONFLICT,
        PogoError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        PogoError::CoordinationStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let (jobid, hostname) = match &err {
        PogoError::JobNotFound(jobid) => (Some(jobid.clone()), None),
        PogoError::DeadlockDetected { hostname } => (None, Some(hostname.clone())),
        _ => (None, None),
    };
    let body = ErrorBody {
        kind: err.kind(),
        message: err.to_string(),
        jobid,
        hostname,
    };
    (status, Json(body)).into_response()
}

fn ok_response<T: Serialize>(payload: T) -> Response {
    Json(payload).into_response()
}

#[derive(Debug, Deserialize)]
struct JobRef {
    jobid: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusParams {
    jobid: String,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct HaltParams {
    jobid: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetryParams {
    jobid: String,
    hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LoadConfParams {
    namespace: String,
    config: String,
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    // A missing body reads as an empty parameter object.
    let body = if body.is_null() { json!({}) } else { body };
    serde_json::from_value(body).map_err(|e| PogoError::InvalidSpec(e.to_string()))
}

/// The action registry: (version, action) to handler. The match arms are
/// the registry; anything else is a typed unknown-action error.
async fn dispatch_action(
    dispatcher: &Dispatcher,
    version: &str,
    action: &str,
    body: Value,
) -> Result<Response> {
    if version != "v1" {
        return Err(PogoError::InvalidSpec(format!(
            "unknown API version: {version}"
        )));
    }
    match action {
        "ping" => Ok(ok_response(json!([PING_PAYLOAD]))),
        "run" => {
            let spec = parse(body)?;
            let jobid = dispatcher.run_job(spec).await?;
            Ok(ok_response(json!({ "jobid": jobid })))
        }
        "jobinfo" => {
            let params: JobRef = parse(body)?;
            let jobid = dispatcher.to_jobid(&params.jobid)?;
            Ok(ok_response(dispatcher.jobinfo(&jobid).await?))
        }
        "jobstatus" => {
            let params: JobStatusParams = parse(body)?;
            let jobid = dispatcher.to_jobid(&params.jobid)?;
            let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
            let (state, hosts, total) =
                dispatcher.jobstatus(&jobid, params.offset, limit).await?;
            let next_offset = params.offset + hosts.len();
            Ok(ok_response(json!({
                "state": state,
                "hosts": hosts,
                "total": total,
                "next_offset": if next_offset < total { Some(next_offset) } else { None },
            })))
        }
        "listjobs" => {
            let filters: JobFilters = parse(body)?;
            Ok(ok_response(dispatcher.listjobs(&filters).await?))
        }
        "halt" => {
            let params: HaltParams = parse(body)?;
            let jobid = dispatcher.to_jobid(&params.jobid)?;
            tracing::info!(jobid = %jobid, reason = ?params.reason, "Halt requested");
            dispatcher.halt(&jobid, HaltCause::UserHalt).await?;
            Ok(ok_response(json!({ "ok": true })))
        }
        "retry" => {
            let params: RetryParams = parse(body)?;
            let jobid = dispatcher.to_jobid(&params.jobid)?;
            dispatcher.retry(&jobid, params.hosts).await?;
            Ok(ok_response(json!({ "ok": true })))
        }
        "loadconf" => {
            let params: LoadConfParams = parse(body)?;
            dispatcher.loadconf(&params.namespace, &params.config).await?;
            Ok(ok_response(json!({ "ok": true })))
        }
        "stats" => Ok(ok_response(dispatcher.stats().await?)),
        other => Err(PogoError::InvalidSpec(format!("unknown action: {other}"))),
    }
}

async fn action_handler(
    State(dispatcher): State<Dispatcher>,
    Path((version, action)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Response {
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    match dispatch_action(&dispatcher, &version, &action, body).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn ping_handler() -> Response {
    ok_response(json!([PING_PAYLOAD]))
}

pub fn router(dispatcher: Dispatcher) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ping", get(ping_handler))
        .route("/api/:version/:action", post(action_handler))
        .layer(cors)
        .with_state(dispatcher)
}

/// Serve the front-end until the shutdown token fires.
pub async fn serve(
    addr: SocketAddr,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(dispatcher);
    tracing::info!(addr = %addr, "Starting API server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| PogoError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| PogoError::Internal(format!("API server: {}", e)))
}
