//! Configuration for the communication layer, loaded from TOML with defaults.

use crate::server::ServerRole;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Default delay (seconds) before each retry attempt, indexed by attempt
/// number. Attempts beyond the table reuse the last entry.
const DEFAULT_BACKOFF_SECS: [u64; 5] = [1, 5, 15, 30, 60];

/// Default attempt ceiling per message.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delivery drain interval (seconds).
const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 1;

/// Default heartbeat interval (seconds). Client role only.
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default sync scheduler interval (seconds).
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

/// Default scoped-token lifetime (seconds).
const DEFAULT_TOKEN_TTL_SECS: u64 = 300;

/// Delivery queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Retry backoff table (seconds). Attempt N waits `backoff_secs[N-1]`,
    /// clamped to the last entry.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    /// Maximum delivery attempts per message.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How often the drain loop wakes up (seconds).
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
}

fn default_backoff_secs() -> Vec<u64> {
    DEFAULT_BACKOFF_SECS.to_vec()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_drain_interval() -> u64 {
    DEFAULT_DRAIN_INTERVAL_SECS
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            backoff_secs: default_backoff_secs(),
            max_attempts: default_max_attempts(),
            drain_interval_secs: default_drain_interval(),
        }
    }
}

impl DeliveryConfig {
    /// Delay before the given attempt number (1-based), from the backoff
    /// table. Attempts past the end of the table reuse the last entry.
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.backoff_secs.len().saturating_sub(1));
        let secs = self.backoff_secs.get(idx).copied().unwrap_or(60);
        std::time::Duration::from_secs(secs)
    }
}

/// Top-level communication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommConfig {
    /// Deployment role of this instance.
    #[serde(default = "default_role")]
    pub role: ServerRole,
    /// Fixed server id (UUID string). A random id is generated when unset.
    #[serde(default)]
    pub server_id: Option<String>,
    /// Human-readable instance name.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Shared HMAC secret for signing and tokens.
    #[serde(default)]
    pub shared_secret: String,
    /// Address the receiver API binds to.
    #[serde(default = "default_api_listen")]
    pub api_listen: String,
    /// SQLite database path for jobs and the audit trail.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Discovery source URLs polled on refresh.
    #[serde(default)]
    pub discovery_sources: Vec<String>,
    /// Heartbeat interval (seconds). Client role only.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Sync scheduler interval (seconds).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Scoped-token lifetime (seconds).
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Delivery queue tuning.
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

fn default_role() -> ServerRole {
    ServerRole::Client
}

fn default_server_name() -> String {
    "ledgerlink".to_string()
}

fn default_api_listen() -> String {
    "127.0.0.1:8430".to_string()
}

fn default_db_path() -> String {
    "ledgerlink.db".to_string()
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_sync_interval() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_token_ttl() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            server_id: None,
            server_name: default_server_name(),
            shared_secret: String::new(),
            api_listen: default_api_listen(),
            db_path: default_db_path(),
            discovery_sources: Vec::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            sync_interval_secs: default_sync_interval(),
            token_ttl_secs: default_token_ttl(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl CommConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Missing or malformed files log a warning and yield the default
    /// configuration so a bare deployment still starts.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str::<CommConfig>(&contents) {
                    Ok(config) => {
                        info!(path = %path.display(), "Loaded configuration");
                        return config;
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            path = %path.display(),
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %path.display(),
                        "Failed to read config file, using defaults"
                    );
                }
            }
        } else {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
        }

        CommConfig::default()
    }
}
