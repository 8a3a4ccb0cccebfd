//! Request multiplexer: converts client requests into host round-trips.
//!
//! A submission only proceeds when the host is ready and the endpoint is
//! registered. The deadline is resolved per endpoint (and, for gcode, per
//! script command); a request whose deadline elapses completes with a
//! timeout error and the eventual host reply is dropped.

use crate::domain::config::ServerConfig;
use crate::domain::error::{ApiError, ApiResult};
use crate::domain::registry::{EndpointEntry, HandlerKind};
use crate::service::GatewayState;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

/// The one endpoint whose timeout depends on its arguments.
pub const GCODE_ENDPOINT: &str = "/printer/gcode";

/// Submit a request to the host and await its reply.
pub async fn submit(state: &GatewayState, endpoint: &str, args: Value) -> ApiResult<Value> {
    if !state.klippy.is_ready() {
        return Err(ApiError::HostDisconnected);
    }
    let entry = state
        .registry
        .get(endpoint)
        .ok_or_else(|| ApiError::NotFound(endpoint.to_string()))?;
    if entry.handler != HandlerKind::Plain {
        return Err(ApiError::BadRequest(format!(
            "endpoint {endpoint} is not host-routable"
        )));
    }

    let deadline = {
        let config = state.config.read();
        resolve_timeout(&config, &entry, endpoint, &args)
    };

    let (id, rx) = state.pending.register(endpoint);
    let frame = json!({
        "id": id,
        "method": entry.remote_method,
        "params": args,
    });
    if let Err(e) = state.writer.send(frame) {
        state.pending.cancel(&id);
        return Err(e);
    }

    let reply = match deadline {
        Some(duration) => match tokio::time::timeout(duration, rx).await {
            Ok(received) => received,
            Err(_) => {
                state.pending.cancel(&id);
                warn!(endpoint, id = %id, "request timed out");
                return Err(ApiError::Timeout);
            }
        },
        // Gcode scripts with no configured override run as long as they run.
        None => rx.await,
    };

    match reply {
        Ok(result) => result,
        Err(_) => Err(ApiError::Internal("reply channel closed".to_string())),
    }
}

/// Resolve the deadline for one submission. `None` means no deadline.
pub fn resolve_timeout(
    config: &ServerConfig,
    entry: &EndpointEntry,
    endpoint: &str,
    args: &Value,
) -> Option<Duration> {
    if endpoint == GCODE_ENDPOINT {
        let script = args.get("script").and_then(Value::as_str).unwrap_or("");
        let command = script.split_whitespace().next().unwrap_or("");
        return config
            .long_running_gcodes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(command))
            .map(|(_, secs)| Duration::from_secs_f64(*secs));
    }

    let seconds = config
        .long_running_requests
        .get(endpoint)
        .copied()
        .or(entry.request_timeout)
        .unwrap_or(config.request_timeout);
    Some(Duration::from_secs_f64(seconds))
}
