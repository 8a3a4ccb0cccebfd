//! HTTP surface: static routes, dynamic dispatch, response formatting.
//!
//! Most printer endpoints are not compiled in; the fallback handler
//! resolves each request path against the endpoint registry and proxies
//! plain endpoints to the host. Statically bound routes cover what never
//! involves the host: key and token management, machine power actions,
//! the temperature store, subscriptions, and the gateway's own log.

pub mod files;

use crate::auth::AuthLevel;
use crate::domain::error::{ApiError, ApiResult};
use crate::domain::registry::{ArgParser, HandlerKind};
use crate::router::{self, InvokeContext};
use crate::service::GatewayState;
use axum::body::Bytes;
use axum::extract::{Extension, RawQuery, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Wrap a successful result the way every endpoint replies: `{"result": …}`.
pub fn result_body(result: Value) -> Response {
    Json(json!({ "result": result })).into_response()
}

/// Convert an error to its HTTP form: status code, message as body.
pub fn error_body(error: &ApiError) -> Response {
    (error.http_status(), error.to_string()).into_response()
}

fn api_response(result: ApiResult<Value>) -> Response {
    match result {
        Ok(value) => result_body(value),
        Err(error) => error_body(&error),
    }
}

/// `GET /access/api_key`
pub async fn get_api_key(State(state): State<Arc<GatewayState>>) -> Response {
    result_body(json!(state.auth.current_key()))
}

/// `POST /access/api_key` - rotate and persist a fresh key.
pub async fn post_api_key(State(state): State<Arc<GatewayState>>) -> Response {
    let auth = Arc::clone(&state.auth);
    match tokio::task::spawn_blocking(move || auth.rotate_key()).await {
        Ok(Ok(key)) => result_body(json!(key)),
        Ok(Err(e)) => error_body(&ApiError::Internal(e.to_string())),
        Err(e) => error_body(&ApiError::Internal(e.to_string())),
    }
}

/// `GET /access/oneshot_token` - trusted clients only, so an API key
/// cannot be used to farm tokens.
pub async fn get_oneshot_token(
    State(state): State<Arc<GatewayState>>,
    Extension(level): Extension<AuthLevel>,
) -> Response {
    if level != AuthLevel::Trusted {
        return error_body(&ApiError::Unauthorized);
    }
    result_body(json!(state.auth.issue_token()))
}

/// `GET /server/temperature_store`
pub async fn get_temperature_store(State(state): State<Arc<GatewayState>>) -> Response {
    api_response(
        router::invoke(
            &state,
            "GET",
            "/server/temperature_store",
            json!({}),
            InvokeContext::Http,
        )
        .await,
    )
}

/// `GET /printer/subscriptions`
pub async fn get_subscriptions(State(state): State<Arc<GatewayState>>) -> Response {
    api_response(
        router::invoke(
            &state,
            "GET",
            "/printer/subscriptions",
            json!({}),
            InvokeContext::Http,
        )
        .await,
    )
}

/// `POST /printer/subscriptions` - accepts either a query string in the
/// status format or a JSON object body.
pub async fn post_subscriptions(
    State(state): State<Arc<GatewayState>>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let args = match query.as_deref().filter(|q| !q.is_empty()) {
        Some(query) => match status_query_args(query) {
            Ok(args) => args,
            Err(e) => return error_body(&e),
        },
        None if body.is_empty() => json!({}),
        None => match serde_json::from_slice::<Value>(&body) {
            Ok(args) => args,
            Err(e) => return error_body(&ApiError::BadRequest(format!("invalid body: {e}"))),
        },
    };
    api_response(
        router::invoke(
            &state,
            "POST",
            "/printer/subscriptions",
            args,
            InvokeContext::Http,
        )
        .await,
    )
}

/// `POST /machine/shutdown`
pub async fn machine_shutdown(State(state): State<Arc<GatewayState>>) -> Response {
    api_response(
        router::invoke(&state, "POST", "/machine/shutdown", json!({}), InvokeContext::Http).await,
    )
}

/// `POST /machine/reboot`
pub async fn machine_reboot(State(state): State<Arc<GatewayState>>) -> Response {
    api_response(
        router::invoke(&state, "POST", "/machine/reboot", json!({}), InvokeContext::Http).await,
    )
}

/// `GET /api/version` - enough of the OctoPrint API for slicers that only
/// know how to upload to OctoPrint.
pub async fn octoprint_version() -> Response {
    Json(json!({
        "server": "1.1.1",
        "api": "0.1",
        "text": "OctoPrint Upload Emulator",
    }))
    .into_response()
}

/// Fallback handler: resolve the path against the endpoint registry.
pub async fn dispatch_dynamic(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    let verb = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    let Some(resolved) = state.registry.resolve(&path) else {
        return error_body(&ApiError::NotFound(path));
    };
    let entry = resolved.entry;
    if !entry.allows(&verb) {
        return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
    }

    match entry.handler {
        HandlerKind::Plain => {
            let args = match req.uri().query() {
                None => json!({}),
                Some(query) => {
                    let parsed = match entry.arg_parser {
                        ArgParser::Default => default_query_args(query),
                        ArgParser::Status => status_query_args(query),
                    };
                    match parsed {
                        Ok(args) => args,
                        Err(e) => return error_body(&e),
                    }
                }
            };
            api_response(router::invoke(&state, &verb, &path, args, InvokeContext::Http).await)
        }
        HandlerKind::FileRequest => match verb.as_str() {
            "GET" => files::serve(&entry, resolved.subpath.as_deref()).await,
            "DELETE" => files::delete(&state, &entry, resolved.subpath.as_deref()).await,
            _ => (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response(),
        },
        HandlerKind::FileUpload => files::upload(&state, &entry, req).await,
    }
}

/// Built-in query parser: exactly one value per key.
pub fn default_query_args(query: &str) -> ApiResult<Value> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)
        .map_err(|_| ApiError::BadRequest("invalid query string".to_string()))?;
    let mut args = Map::new();
    for (key, value) in pairs {
        if args.insert(key.clone(), Value::String(value)).is_some() {
            return Err(ApiError::BadRequest(format!(
                "duplicate query argument: {key}"
            )));
        }
    }
    Ok(Value::Object(args))
}

/// Status-object query parser: values are comma-separated lists and a bare
/// key selects every attribute (`?toolhead=position,status&extruder`).
pub fn status_query_args(query: &str) -> ApiResult<Value> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)
        .map_err(|_| ApiError::BadRequest("invalid query string".to_string()))?;
    let mut args = Map::new();
    for (key, value) in pairs {
        let entry = args.entry(key).or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = entry {
            for part in value.split(',') {
                if !part.is_empty() {
                    list.push(json!(part));
                }
            }
        }
    }
    Ok(Value::Object(args))
}
