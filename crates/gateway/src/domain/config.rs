//! Server configuration pushed by the host after it connects.
//!
//! The gateway boots with defaults and replaces them wholesale whenever the
//! host sends a `load_config` message.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Number of polling tiers
pub const TIER_COUNT: usize = 6;

/// Tier assigned to status objects not named by any `status_tier_*` option
pub const DEFAULT_TIER: usize = 4;

/// Host-configurable server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding the persisted API key file
    pub api_key_path: String,
    /// Require API key / token auth for untrusted clients
    pub require_auth: bool,
    /// Answer CORS preflights and echo Origin
    pub enable_cors: bool,
    /// Trusted subnets, each of the form `x.x.x.0/24`
    pub trusted_clients: Vec<String>,
    /// Base timeout applied to host requests, in seconds
    pub request_timeout: f64,
    /// Gcode command name (first token of the script) to timeout override
    pub long_running_gcodes: HashMap<String, f64>,
    /// Endpoint path to timeout override
    pub long_running_requests: HashMap<String, f64>,
    /// Base poll period, in seconds
    pub tick_time: f64,
    pub status_tier_1: Vec<String>,
    pub status_tier_2: Vec<String>,
    pub status_tier_3: Vec<String>,
    pub status_tier_4: Vec<String>,
    pub status_tier_5: Vec<String>,
    pub status_tier_6: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_key_path: "~".to_string(),
            require_auth: true,
            enable_cors: false,
            trusted_clients: Vec::new(),
            request_timeout: 5.0,
            long_running_gcodes: HashMap::new(),
            long_running_requests: HashMap::new(),
            tick_time: 0.25,
            status_tier_1: Vec::new(),
            status_tier_2: Vec::new(),
            status_tier_3: Vec::new(),
            status_tier_4: Vec::new(),
            status_tier_5: Vec::new(),
            status_tier_6: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Validate option values. Called before a pushed config is applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout <= 0.0 {
            return Err(ConfigError::Invalid(
                "request_timeout must be positive".into(),
            ));
        }
        if self.tick_time <= 0.0 {
            return Err(ConfigError::Invalid("tick_time must be positive".into()));
        }
        for client in &self.trusted_clients {
            parse_trusted_subnet(client)?;
        }
        Ok(())
    }

    /// Parsed trusted subnets. `validate` must have succeeded.
    pub fn trusted_subnets(&self) -> Vec<[u8; 3]> {
        self.trusted_clients
            .iter()
            .filter_map(|c| parse_trusted_subnet(c).ok())
            .collect()
    }

    /// Poll period for a tier (1-based)
    pub fn tier_period(&self, tier: usize) -> Duration {
        let factor = 1u32 << (tier.clamp(1, TIER_COUNT) - 1);
        Duration::from_secs_f64(self.tick_time * f64::from(factor))
    }

    /// Objects explicitly assigned to a tier (1-based)
    pub fn tier_objects(&self, tier: usize) -> &[String] {
        match tier {
            1 => &self.status_tier_1,
            2 => &self.status_tier_2,
            3 => &self.status_tier_3,
            4 => &self.status_tier_4,
            5 => &self.status_tier_5,
            6 => &self.status_tier_6,
            _ => &[],
        }
    }

    /// Effective tier for an object: the fastest tier naming it, or the
    /// default tier when no option does.
    pub fn object_tier(&self, object: &str) -> usize {
        for tier in 1..=TIER_COUNT {
            if self.tier_objects(tier).iter().any(|o| o == object) {
                return tier;
            }
        }
        DEFAULT_TIER
    }
}

/// Parse a trusted client entry. Only full `x.x.x.0/24` subnets are valid.
pub fn parse_trusted_subnet(entry: &str) -> Result<[u8; 3], ConfigError> {
    let network = entry
        .strip_suffix("/24")
        .ok_or_else(|| ConfigError::InvalidSubnet(entry.to_string()))?;
    let addr: IpAddr = network
        .parse()
        .map_err(|_| ConfigError::InvalidSubnet(entry.to_string()))?;
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            if octets[3] != 0 {
                return Err(ConfigError::InvalidSubnet(entry.to_string()));
            }
            Ok([octets[0], octets[1], octets[2]])
        }
        IpAddr::V6(_) => Err(ConfigError::InvalidSubnet(entry.to_string())),
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Trusted client entry is not an `x.x.x.0/24` subnet
    #[error("invalid trusted client subnet: {0}")]
    InvalidSubnet(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
