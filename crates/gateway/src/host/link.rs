//! Klippy host link: socket lifecycle, inbound dispatch, write serializer.
//!
//! The gateway owns the listening side of the Unix socket; the host connects
//! to it. One peer is serviced at a time. All writes funnel through a single
//! queue so frames reach the socket in submission order, and any read error
//! tears the whole session down - the host is expected to reconnect and
//! re-register its endpoints.

use crate::domain::correlation::RequestId;
use crate::domain::error::ApiError;
use crate::domain::registry::{ArgParser, EndpointEntry, HandlerKind};
use crate::domain::state::KlippyState;
use crate::events;
use crate::host::codec::FrameCodec;
use crate::service::GatewayState;
use crate::status::temperature;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

/// Sole writer to the host socket.
///
/// A sender is attached for the lifetime of one connection; frames queued
/// while no host is attached fail immediately.
#[derive(Debug, Default)]
pub struct HostWriter {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl HostWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, tx: mpsc::UnboundedSender<Value>) {
        *self.tx.lock() = Some(tx);
    }

    fn detach(&self) {
        *self.tx.lock() = None;
    }

    /// Queue a frame for the current connection.
    pub fn send(&self, frame: Value) -> Result<(), ApiError> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ApiError::HostDisconnected),
            None => Err(ApiError::HostDisconnected),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.tx.lock().is_some()
    }
}

/// Accept loop. Runs for the lifetime of the process.
pub async fn run(state: Arc<GatewayState>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                info!("Klippy connection established");
                handle_session(&state, stream).await;
            }
            Err(e) => {
                error!(error = %e, "error accepting host connection");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// Service one host connection until it drops, then tear down.
async fn handle_session(state: &Arc<GatewayState>, stream: UnixStream) {
    transition(state, KlippyState::Connecting);

    let framed = Framed::new(stream, FrameCodec::new());
    let (mut sink, mut frames) = framed.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    state.writer.attach(tx);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!(error = %e, "host socket write failed");
                break;
            }
        }
    });

    while let Some(item) = frames.next().await {
        match item {
            Ok(msg) => dispatch(state, msg).await,
            Err(e) => {
                warn!(error = %e, "host link error, tearing down");
                break;
            }
        }
    }
    info!("Klippy connection closed");

    state.writer.detach();
    writer_task.abort();
    teardown(state);
}

/// Flush host-owned state and fail whatever was in flight.
fn teardown(state: &Arc<GatewayState>) {
    state.engine.stop();
    for path in state.registry.clear_remote() {
        state.rpc.remove_path(&path);
    }
    let failed = state.pending.fail_all(ApiError::HostDisconnected);
    if failed > 0 {
        info!(count = failed, "failed outstanding requests after host disconnect");
    }
    transition(state, KlippyState::Disconnected);
}

/// Apply a state transition and announce it to WebSocket clients.
fn transition(state: &Arc<GatewayState>, new_state: KlippyState) {
    if state.klippy.set(new_state) {
        if let Some(name) = new_state.notification() {
            state
                .websockets
                .notify("klippy_state_changed", json!(name));
        }
    }
}

/// Route one inbound host message.
async fn dispatch(state: &Arc<GatewayState>, msg: Value) {
    let Value::Object(obj) = msg else {
        warn!("non-object host message ignored");
        return;
    };

    if obj
        .get("is_response")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        handle_reply(state, &obj);
        return;
    }

    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        warn!("host message without method ignored");
        return;
    };
    let params = obj
        .get("params")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));

    match method {
        "register_remote_method" => handle_register(state, params),
        "load_config" => handle_load_config(state, params),
        "set_klippy_ready" => handle_ready(state),
        "set_klippy_shutdown" => {
            info!("Klippy has shutdown");
            state.engine.stop();
            for path in state.registry.clear_remote() {
                state.rpc.remove_path(&path);
            }
            transition(state, KlippyState::Shutdown);
        }
        "set_klippy_disconnect" => {
            info!("Klippy disconnecting");
            state.engine.stop();
            for path in state.registry.clear_remote() {
                state.rpc.remove_path(&path);
            }
            state.pending.fail_all(ApiError::HostDisconnected);
            transition(state, KlippyState::Disconnected);
        }
        "process_gcode_response" => {
            state
                .websockets
                .notify("gcode_response", first_param(params));
        }
        "process_filelist_change" => {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                let filename = params
                    .get("filename")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let action = params
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or("changed")
                    .to_string();
                events::broadcast_filelist_changed(&state, filename, &action).await;
            });
        }
        "process_status_update" => {
            if let Value::Object(payload) = params {
                state.engine.handle_status(state, &payload);
            }
        }
        _ => info!(method, "unknown host method"),
    }
}

/// Route a reply to its pending entry.
fn handle_reply(state: &Arc<GatewayState>, obj: &Map<String, Value>) {
    let Some(id) = obj.get("id").and_then(Value::as_u64) else {
        warn!("host reply without integer id ignored");
        return;
    };
    let id = RequestId::from_raw(id);
    let result = match obj.get("error") {
        Some(err) => {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("host error")
                .to_string();
            Err(ApiError::Host(message))
        }
        None => Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
    };
    state.pending.complete(id, result);
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    endpoint: String,
    #[serde(default)]
    http_methods: Vec<String>,
    #[serde(default)]
    remote_method: Option<String>,
    #[serde(default)]
    request_timeout_seconds: Option<f64>,
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    arg_parser: Option<String>,
}

/// Register one endpoint announced by the host.
fn handle_register(state: &Arc<GatewayState>, params: Value) {
    if state.klippy.current() == KlippyState::Connecting {
        transition(state, KlippyState::Initializing);
    }

    let params: RegisterParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "invalid register_remote_method params");
            return;
        }
    };

    let handler = match params.handler.as_deref() {
        None => HandlerKind::Plain,
        Some(name) => match HandlerKind::from_name(name) {
            Some(kind) => kind,
            None => {
                warn!(handler = name, endpoint = %params.endpoint, "unknown handler kind");
                return;
            }
        },
    };

    let remote_method = match (handler, params.remote_method) {
        (HandlerKind::Plain, Some(method)) => method,
        (HandlerKind::Plain, None) => {
            warn!(endpoint = %params.endpoint, "plain endpoint without remote_method");
            return;
        }
        (_, method) => method.unwrap_or_default(),
    };

    let http_methods: Vec<String> = if params.http_methods.is_empty() {
        vec!["GET".to_string()]
    } else {
        params
            .http_methods
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .collect()
    };

    let arg_parser = match params.arg_parser.as_deref() {
        Some("status_parser") => ArgParser::Status,
        _ => ArgParser::Default,
    };

    info!(
        endpoint = %params.endpoint,
        methods = %http_methods.join(" "),
        "registering endpoint"
    );

    if handler == HandlerKind::Plain {
        for verb in &http_methods {
            state.rpc.register(verb, &params.endpoint);
        }
    }

    state.registry.insert(EndpointEntry {
        endpoint: params.endpoint,
        http_methods,
        remote_method,
        request_timeout: params.request_timeout_seconds,
        handler,
        root: params.path,
        arg_parser,
        local: false,
    });
}

/// Apply a configuration snapshot pushed by the host.
fn handle_load_config(state: &Arc<GatewayState>, params: Value) {
    if state.klippy.current() == KlippyState::Connecting {
        transition(state, KlippyState::Initializing);
    }

    let config_value = match params {
        Value::Object(ref obj) if obj.contains_key("config") => obj["config"].clone(),
        other => other,
    };
    match serde_json::from_value(config_value) {
        Ok(config) => {
            if let Err(e) = state.apply_config(config) {
                error!(error = %e, "rejected host configuration");
            }
        }
        Err(e) => error!(error = %e, "malformed host configuration"),
    }
}

/// Host declared itself ready: start polling and discover sensors.
fn handle_ready(state: &Arc<GatewayState>) {
    info!("Klippy ready");
    transition(state, KlippyState::Ready);
    state.engine.start(Arc::clone(state));
    let state = Arc::clone(state);
    tokio::spawn(async move {
        temperature::discover_sensors(&state).await;
    });
}

/// Notification payloads arrive either bare, wrapped in a single-element
/// array, or as `{"response": value}`.
fn first_param(params: Value) -> Value {
    match params {
        Value::Array(mut items) if !items.is_empty() => items.remove(0),
        Value::Object(mut obj) if obj.len() == 1 && obj.contains_key("response") => {
            obj.remove("response").unwrap_or(Value::Null)
        }
        other => other,
    }
}
