//! Gateway service: shared state, router construction, process lifecycle.

use crate::auth::{self, Authorization};
use crate::domain::config::{ConfigError, ServerConfig};
use crate::domain::error::GatewayError;
use crate::domain::pending::{self, PendingStore};
use crate::domain::registry::{ArgParser, EndpointEntry, EndpointRegistry, HandlerKind};
use crate::domain::state::StateTracker;
use crate::events::WebsocketManager;
use crate::host::link::{self, HostWriter};
use crate::middleware::{cors_layer, AuthLayer};
use crate::status::engine::SubscriptionEngine;
use crate::status::temperature::{self, TemperatureStore};
use crate::ws::JsonRpc;
use crate::{http, ws};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tracing::{info, warn};

/// Endpoints the gateway itself answers, announced over the WebSocket
/// method table alongside host endpoints.
const LOCAL_HOOKS: &[(&str, &str)] = &[
    ("GET", "/server/temperature_store"),
    ("GET", "/printer/subscriptions"),
    ("POST", "/printer/subscriptions"),
    ("POST", "/machine/shutdown"),
    ("POST", "/machine/reboot"),
];

/// Startup parameters (CLI flags).
#[derive(Debug, Clone)]
pub struct ServerArgs {
    pub address: String,
    pub port: u16,
    pub socketfile: PathBuf,
    pub logfile: PathBuf,
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 7125,
            socketfile: PathBuf::from("/tmp/moonraker"),
            logfile: PathBuf::from("/tmp/moonraker.log"),
        }
    }
}

/// Everything the request paths share.
pub struct GatewayState {
    pub config: parking_lot::RwLock<ServerConfig>,
    pub cors_enabled: Arc<AtomicBool>,
    pub klippy: StateTracker,
    pub registry: EndpointRegistry,
    pub pending: Arc<PendingStore>,
    pub writer: HostWriter,
    pub auth: Arc<Authorization>,
    pub websockets: WebsocketManager,
    pub rpc: JsonRpc,
    pub engine: SubscriptionEngine,
    pub temperatures: Arc<TemperatureStore>,
    pub logfile: PathBuf,
}

impl GatewayState {
    pub fn new(args: &ServerArgs) -> Arc<Self> {
        let state = Arc::new(Self {
            config: parking_lot::RwLock::new(ServerConfig::default()),
            cors_enabled: Arc::new(AtomicBool::new(false)),
            klippy: StateTracker::new(),
            registry: EndpointRegistry::new(),
            pending: Arc::new(PendingStore::new()),
            writer: HostWriter::new(),
            auth: Arc::new(Authorization::new()),
            websockets: WebsocketManager::new(),
            rpc: JsonRpc::new(),
            engine: SubscriptionEngine::new(),
            temperatures: Arc::new(TemperatureStore::new()),
            logfile: args.logfile.clone(),
        });

        // The gateway's own log is served like any other registered file.
        state.registry.insert(EndpointEntry {
            endpoint: "/server/moonraker.log".to_string(),
            http_methods: vec!["GET".to_string()],
            remote_method: String::new(),
            request_timeout: None,
            handler: HandlerKind::FileRequest,
            root: Some(args.logfile.clone()),
            arg_parser: ArgParser::Default,
            local: true,
        });
        for (verb, path) in LOCAL_HOOKS {
            state.rpc.register(verb, path);
        }
        state
    }

    /// State for unit tests: no sockets, no key file.
    pub fn new_for_tests() -> Arc<Self> {
        Self::new(&ServerArgs::default())
    }

    /// Apply a validated host configuration snapshot.
    pub fn apply_config(self: &Arc<Self>, config: ServerConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.auth.apply_config(&config)?;
        self.cors_enabled
            .store(config.enable_cors, Ordering::Relaxed);
        *self.config.write() = config;
        info!("server configuration loaded");
        // Tier periods may have changed; polling restarts against the new
        // table if it was running.
        if self.klippy.is_ready() {
            self.engine.start(Arc::clone(self));
        }
        Ok(())
    }
}

/// The bound, not-yet-running server.
pub struct MoonrakerServer {
    state: Arc<GatewayState>,
    tcp: TcpListener,
    unix: UnixListener,
}

impl MoonrakerServer {
    /// Bind the web listener and the host socket. Failures here are fatal
    /// for the process.
    pub async fn bind(args: ServerArgs) -> Result<Self, GatewayError> {
        let state = GatewayState::new(&args);

        // First start creates the key; the directory moves if the host
        // config says so.
        let key_dir = auth::expand_home("~");
        if let Err(e) = state.auth.load_key(&key_dir) {
            warn!(error = %e, "could not load API key, continuing with in-memory key");
        }

        if args.socketfile.exists() {
            std::fs::remove_file(&args.socketfile)?;
        }
        let unix = UnixListener::bind(&args.socketfile).map_err(|e| {
            GatewayError::Bind(format!("unix socket {}: {e}", args.socketfile.display()))
        })?;
        let tcp = TcpListener::bind((args.address.as_str(), args.port))
            .await
            .map_err(|e| GatewayError::Bind(format!("{}:{}: {e}", args.address, args.port)))?;

        info!(
            address = %args.address,
            port = args.port,
            socket = %args.socketfile.display(),
            "moonraker listening"
        );
        Ok(Self { state, tcp, unix })
    }

    /// Address the HTTP listener actually bound (useful with port 0).
    pub fn http_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.tcp.local_addr()?)
    }

    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    /// Run until the HTTP server stops.
    pub async fn run(self) -> Result<(), GatewayError> {
        let state = self.state;

        tokio::spawn(link::run(Arc::clone(&state), self.unix));
        tokio::spawn(pending::reaper_task(
            Arc::clone(&state.pending),
            Duration::from_secs(10),
        ));
        tokio::spawn(temperature::sampler_task(Arc::clone(&state.temperatures)));
        tokio::spawn(auth::prune_task(Arc::clone(&state.auth)));

        let app = build_router(Arc::clone(&state));
        axum::serve(
            self.tcp,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

/// Static routes plus the registry-backed fallback, wrapped in the auth
/// gate and the CORS layer.
fn build_router(state: Arc<GatewayState>) -> Router {
    let auth_layer = AuthLayer::new(Arc::clone(&state.auth));
    let cors = cors_layer(Arc::clone(&state.cors_enabled));

    Router::new()
        .route("/websocket", get(ws::handler::websocket_upgrade))
        .route(
            "/access/api_key",
            get(http::get_api_key).post(http::post_api_key),
        )
        .route("/access/oneshot_token", get(http::get_oneshot_token))
        .route("/machine/shutdown", post(http::machine_shutdown))
        .route("/machine/reboot", post(http::machine_reboot))
        .route(
            "/server/temperature_store",
            get(http::get_temperature_store),
        )
        .route(
            "/printer/subscriptions",
            get(http::get_subscriptions).post(http::post_subscriptions),
        )
        .route("/api/version", get(http::octoprint_version))
        .fallback(http::dispatch_dynamic)
        .layer(auth_layer)
        .layer(cors)
        .with_state(state)
}
