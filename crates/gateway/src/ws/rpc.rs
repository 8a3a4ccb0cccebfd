//! JSON-RPC 2.0 dispatcher for WebSocket clients.
//!
//! Method names are generated when an endpoint is registered, by joining
//! the verb with the path: `POST /printer/gcode` becomes
//! `post_printer_gcode`. Dispatch is a plain lookup against that table, so
//! an endpoint is callable over the socket exactly while it is routable
//! over HTTP.

use crate::domain::error::rpc_codes;
use crate::router::{self, InvokeContext};
use crate::service::GatewayState;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tracing::debug;

/// Resolved dispatch target for one method name.
#[derive(Debug, Clone)]
pub struct RpcTarget {
    pub verb: String,
    pub path: String,
}

/// Registered method table.
#[derive(Debug, Default)]
pub struct JsonRpc {
    methods: DashMap<String, RpcTarget>,
}

impl JsonRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Method name for a verb/path pair.
    pub fn method_name(verb: &str, path: &str) -> String {
        format!("{}{}", verb.to_ascii_lowercase(), path.replace('/', "_"))
    }

    /// Make an endpoint callable under its generated method name.
    pub fn register(&self, verb: &str, path: &str) {
        self.methods.insert(
            Self::method_name(verb, path),
            RpcTarget {
                verb: verb.to_ascii_uppercase(),
                path: path.to_string(),
            },
        );
    }

    /// Remove every method bound to a path. Used when the host unregisters
    /// or the link drops.
    pub fn remove_path(&self, path: &str) {
        self.methods.retain(|_, target| target.path != path);
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Dispatch one inbound frame. Returns the serialized response, or
    /// `None` when no response is owed (notification batch, etc.).
    pub async fn dispatch(
        &self,
        state: &GatewayState,
        conn_id: u64,
        data: &str,
    ) -> Option<String> {
        let parsed: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "websocket frame is not json");
                return Some(
                    error_response(None, rpc_codes::PARSE_ERROR, "Parse error").to_string(),
                );
            }
        };

        match parsed {
            Value::Array(requests) => {
                let mut responses = Vec::new();
                for request in requests {
                    if let Some(response) = self.process_request(state, conn_id, request).await {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    None
                } else {
                    Some(Value::Array(responses).to_string())
                }
            }
            request => self
                .process_request(state, conn_id, request)
                .await
                .map(|response| response.to_string()),
        }
    }

    async fn process_request(
        &self,
        state: &GatewayState,
        conn_id: u64,
        request: Value,
    ) -> Option<Value> {
        let id = request.get("id").cloned();
        let version = request.get("jsonrpc").and_then(Value::as_str);
        let method = request.get("method").and_then(Value::as_str);
        let (Some("2.0"), Some(method)) = (version, method) else {
            return Some(error_response(
                id,
                rpc_codes::INVALID_REQUEST,
                "Invalid Request",
            ));
        };

        let Some(target) = self.methods.get(method).map(|t| t.value().clone()) else {
            return Some(error_response(
                id,
                rpc_codes::METHOD_NOT_FOUND,
                "Method not found",
            ));
        };

        let args = match request.get("params") {
            None => Value::Object(Map::new()),
            Some(Value::Object(params)) => Value::Object(params.clone()),
            Some(Value::Array(_)) => {
                return Some(error_response(
                    id,
                    rpc_codes::INVALID_PARAMS,
                    "Invalid params: positional params not supported",
                ));
            }
            Some(_) => {
                return Some(error_response(
                    id,
                    rpc_codes::INVALID_REQUEST,
                    "Invalid Request",
                ));
            }
        };

        match router::invoke(
            state,
            &target.verb,
            &target.path,
            args,
            InvokeContext::Ws(conn_id),
        )
        .await
        {
            Ok(result) => id.map(|id| result_response(id, result)),
            Err(e) => Some(error_response(id, e.rpc_code(), &e.to_string())),
        }
    }
}

/// JSON-RPC 2.0 result envelope
pub fn result_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

/// JSON-RPC 2.0 error envelope; a missing id is reported as null
pub fn error_response(id: Option<Value>, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message},
        "id": id.unwrap_or(Value::Null),
    })
}
