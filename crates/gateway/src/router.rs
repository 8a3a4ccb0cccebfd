//! Endpoint invocation - the single primitive behind both surfaces.
//!
//! The HTTP adapter and the WebSocket JSON-RPC adapter both normalize a
//! request to `(verb, path, args)` and call `invoke`; only the response
//! formatting differs. Local endpoints are serviced in-process, everything
//! else goes to the host through the multiplexer.

use crate::domain::error::{ApiError, ApiResult};
use crate::events::ConnId;
use crate::host::mux;
use crate::service::GatewayState;
use crate::status::engine::{InterestMap, Subscriber};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::info;

/// Which kind of client is invoking; subscriptions bind to it.
#[derive(Debug, Clone, Copy)]
pub enum InvokeContext {
    Http,
    Ws(ConnId),
}

impl InvokeContext {
    fn subscriber(self) -> Subscriber {
        match self {
            InvokeContext::Http => Subscriber::Http,
            InvokeContext::Ws(conn_id) => Subscriber::Ws(conn_id),
        }
    }
}

/// Invoke an endpoint on behalf of a client.
pub async fn invoke(
    state: &GatewayState,
    verb: &str,
    path: &str,
    args: Value,
    context: InvokeContext,
) -> ApiResult<Value> {
    match (verb, path) {
        ("GET", "/server/temperature_store") => Ok(state.temperatures.snapshot()),
        ("GET", "/printer/subscriptions") => {
            let current = {
                let config = state.config.read();
                state.engine.current(&config)
            };
            Ok(current)
        }
        ("POST", "/printer/subscriptions") => {
            let requests = parse_subscription_args(&args)?;
            state.engine.subscribe(context.subscriber(), requests);
            Ok(json!("ok"))
        }
        ("POST", "/machine/shutdown") => machine_command("shutdown").await,
        ("POST", "/machine/reboot") => machine_command("reboot").await,
        _ => mux::submit(state, path, args).await,
    }
}

/// Subscription arguments: object name to attribute list. A null value or
/// empty list requests every attribute.
fn parse_subscription_args(args: &Value) -> ApiResult<InterestMap> {
    let Value::Object(entries) = args else {
        return Err(ApiError::BadRequest(
            "subscription args must be an object".to_string(),
        ));
    };
    let mut requests = InterestMap::new();
    for (object, attrs) in entries {
        let attrs: HashSet<String> = match attrs {
            Value::Null => HashSet::new(),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| {
                            ApiError::BadRequest(format!(
                                "attributes for {object} must be strings"
                            ))
                        })
                })
                .collect::<ApiResult<_>>()?,
            _ => {
                return Err(ApiError::BadRequest(format!(
                    "attributes for {object} must be a list"
                )));
            }
        };
        requests.insert(object.clone(), attrs);
    }
    Ok(requests)
}

/// Shell out for machine power actions. These never touch the host.
async fn machine_command(action: &str) -> ApiResult<Value> {
    info!(action, "executing machine command");
    let status = tokio::process::Command::new("sudo")
        .arg(action)
        .arg("now")
        .status()
        .await
        .map_err(|e| ApiError::Internal(format!("failed to run {action}: {e}")))?;
    if status.success() {
        Ok(json!("ok"))
    } else {
        Err(ApiError::Internal(format!("{action} exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscription_args_shapes() {
        let requests = parse_subscription_args(&json!({
            "toolhead": ["position", "status"],
            "extruder": [],
            "heater_bed": null,
        }))
        .unwrap();
        assert_eq!(requests["toolhead"].len(), 2);
        assert!(requests["extruder"].is_empty());
        assert!(requests["heater_bed"].is_empty());
    }

    #[test]
    fn test_parse_subscription_args_rejects_non_lists() {
        assert!(parse_subscription_args(&json!({"toolhead": 5})).is_err());
        assert!(parse_subscription_args(&json!(["toolhead"])).is_err());
    }

    #[tokio::test]
    async fn test_remote_invoke_requires_host() {
        let state = GatewayState::new_for_tests();
        let err = invoke(
            &state,
            "POST",
            "/printer/gcode",
            json!({"script": "G28"}),
            InvokeContext::Http,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::HostDisconnected));
    }

    #[tokio::test]
    async fn test_local_invoke_works_without_host() {
        let state = GatewayState::new_for_tests();
        let result = invoke(
            &state,
            "GET",
            "/server/temperature_store",
            json!({}),
            InvokeContext::Http,
        )
        .await
        .unwrap();
        assert!(result.is_object());
    }
}
