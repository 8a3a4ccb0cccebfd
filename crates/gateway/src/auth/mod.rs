//! API-key, trusted-subnet, and one-shot-token admission.
//!
//! Untrusted clients present the persisted API key in `X-Api-Key` or, for
//! contexts where headers cannot be set (WebSocket upgrades), a short-lived
//! single-use token in the `token` query parameter. Clients inside a
//! configured `x.x.x.0/24` subnet are trusted outright.

use crate::domain::config::{ConfigError, ServerConfig};
use crate::domain::error::GatewayError;
use dashmap::DashMap;
use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use std::collections::HashMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

/// Name of the persisted key file inside `api_key_path`
pub const API_KEY_FILE: &str = ".klippy_api_key";

/// Lifetime of a one-shot token
pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle lifetime of a cached trusted connection
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Interval for the trusted-connection prune task
pub const PRUNE_CHECK_TIME: Duration = Duration::from_secs(300);

/// How a client was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    /// Auth disabled, subnet match, or cached trusted connection
    Trusted,
    /// Valid API key or one-shot token
    Key,
}

/// Admission decisions plus key/token custody.
pub struct Authorization {
    api_key: parking_lot::RwLock<String>,
    key_path: parking_lot::Mutex<PathBuf>,
    require_auth: AtomicBool,
    trusted_subnets: parking_lot::RwLock<Vec<[u8; 3]>>,
    trusted_connections: DashMap<IpAddr, Instant>,
    tokens: parking_lot::Mutex<HashMap<String, Instant>>,
}

impl Authorization {
    pub fn new() -> Self {
        Self {
            api_key: parking_lot::RwLock::new(String::new()),
            key_path: parking_lot::Mutex::new(expand_home("~")),
            require_auth: AtomicBool::new(true),
            trusted_subnets: parking_lot::RwLock::new(Vec::new()),
            trusted_connections: DashMap::new(),
            tokens: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Load the persisted key, creating one on first start.
    pub fn load_key(&self, directory: &Path) -> Result<String, GatewayError> {
        let path = directory.join(API_KEY_FILE);
        let key = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let key = contents.trim().to_string();
                if key.is_empty() {
                    write_key_file(&path, &generate_key())?
                } else {
                    key
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "creating new API key file");
                write_key_file(&path, &generate_key())?
            }
            Err(e) => return Err(e.into()),
        };
        *self.key_path.lock() = path;
        *self.api_key.write() = key.clone();
        Ok(key)
    }

    /// Generate a fresh key and atomically replace the persisted file.
    /// The new key is effective for the very next request.
    pub fn rotate_key(&self) -> Result<String, GatewayError> {
        let path = self.key_path.lock().clone();
        let key = write_key_file(&path, &generate_key())?;
        *self.api_key.write() = key.clone();
        info!("API key rotated");
        Ok(key)
    }

    pub fn current_key(&self) -> String {
        self.api_key.read().clone()
    }

    /// Apply host-pushed auth options. The config must already be validated.
    pub fn apply_config(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        self.require_auth
            .store(config.require_auth, Ordering::Relaxed);
        *self.trusted_subnets.write() = config.trusted_subnets();
        let key_dir = expand_home(&config.api_key_path);
        self.load_key(&key_dir)
            .map_err(|e| ConfigError::Invalid(format!("api_key_path: {e}")))?;
        info!(
            require_auth = config.require_auth,
            trusted_clients = %config.trusted_clients.join(", "),
            "authorization configuration loaded"
        );
        Ok(())
    }

    /// Mint a one-shot token. Expired tokens are pruned lazily here and on
    /// consumption rather than with a timer per token.
    pub fn issue_token(&self) -> String {
        let token = generate_key();
        let mut tokens = self.tokens.lock();
        prune_tokens(&mut tokens);
        tokens.insert(token.clone(), Instant::now() + TOKEN_TIMEOUT);
        token
    }

    /// Consume a token. A second presentation of the same token fails.
    pub fn consume_token(&self, token: &str) -> bool {
        let mut tokens = self.tokens.lock();
        prune_tokens(&mut tokens);
        tokens.remove(token).is_some()
    }

    /// Classify an incoming request. `None` means reject.
    pub fn check(
        &self,
        remote: IpAddr,
        api_key: Option<&str>,
        token: Option<&str>,
    ) -> Option<AuthLevel> {
        if !self.require_auth.load(Ordering::Relaxed) {
            return Some(AuthLevel::Trusted);
        }
        if self.is_trusted_ip(remote) {
            return Some(AuthLevel::Trusted);
        }
        if let Some(key) = api_key {
            let current = self.api_key.read();
            if !current.is_empty() && constant_time_eq(key, &current) {
                return Some(AuthLevel::Key);
            }
        }
        if let Some(token) = token {
            if self.consume_token(token) {
                return Some(AuthLevel::Key);
            }
        }
        None
    }

    fn is_trusted_ip(&self, remote: IpAddr) -> bool {
        if let Some(mut cached) = self.trusted_connections.get_mut(&remote) {
            *cached = Instant::now();
            return true;
        }
        let IpAddr::V4(v4) = remote else {
            return false;
        };
        let octets = v4.octets();
        let matched = self
            .trusted_subnets
            .read()
            .iter()
            .any(|net| net[..] == octets[..3]);
        if matched {
            debug!(remote = %remote, "trusted connection detected");
            self.trusted_connections.insert(remote, Instant::now());
        }
        matched
    }

    /// Drop trusted-connection cache entries idle past their lifetime.
    pub fn prune_connections(&self) {
        let now = Instant::now();
        self.trusted_connections
            .retain(|_, last_seen| now.duration_since(*last_seen) < CONNECTION_TIMEOUT);
    }
}

impl Default for Authorization {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic trusted-connection prune.
pub async fn prune_task(auth: std::sync::Arc<Authorization>) {
    let mut ticker = tokio::time::interval(PRUNE_CHECK_TIME);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        auth.prune_connections();
    }
}

fn prune_tokens(tokens: &mut HashMap<String, Instant>) {
    let now = Instant::now();
    tokens.retain(|_, deadline| *deadline > now);
}

/// 32-character base32 string from 20 random bytes.
fn generate_key() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes)
}

/// Write the key with owner-only permissions via temp file + rename, so a
/// concurrent reader never observes a truncated key.
fn write_key_file(path: &Path, key: &str) -> Result<String, GatewayError> {
    use std::os::unix::fs::OpenOptionsExt;

    let tmp_path = path.with_extension("tmp");
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp_path)?;
    file.write_all(key.as_bytes())?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)?;
    Ok(key.to_string())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(path.replacen('~', &home, 1));
        }
    }
    PathBuf::from(path)
}
