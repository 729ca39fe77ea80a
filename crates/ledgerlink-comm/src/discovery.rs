//! Server discovery cache.
//!
//! Known servers are learned two ways: polling configured discovery sources
//! and direct registration messages. The cache merges refreshes with
//! last-write-wins on `discovered_at`; lookups never touch the network.

use chrono::{DateTime, Utc};
use ledgerlink_types::server::{KnownServerRecord, ServerId};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Timeout for a single discovery source poll (seconds).
const SOURCE_POLL_TIMEOUT_SECS: u64 = 10;

/// Record shape returned by a discovery source.
///
/// `discovered_at` is optional on the wire; records without one are stamped
/// at fetch time.
#[derive(Debug, Deserialize)]
struct SourceRecord {
    server_id: ServerId,
    api_url: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(default)]
    discovered_at: Option<DateTime<Utc>>,
}

/// Cache of known remote servers.
pub struct ServerDiscovery {
    servers: RwLock<HashMap<ServerId, KnownServerRecord>>,
    sources: RwLock<Vec<String>>,
    client: reqwest::Client,
}

impl ServerDiscovery {
    /// Create a cache polling the given source URLs.
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            sources: RwLock::new(sources),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(SOURCE_POLL_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Add a discovery source URL. Idempotent.
    pub fn register_source(&self, url: impl Into<String>) {
        let url = url.into();
        let mut sources = self
            .sources
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if !sources.contains(&url) {
            info!(source = %url, "Registered discovery source");
            sources.push(url);
        }
    }

    /// Poll all sources and merge results into the cache.
    ///
    /// A failing source is logged and skipped; it never aborts the refresh
    /// or disturbs records learned elsewhere. Returns the number of records
    /// merged.
    pub async fn refresh(&self) -> usize {
        let sources: Vec<String> = {
            let guard = self.sources.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        let mut merged = 0;
        for source in sources {
            match self.poll_source(&source).await {
                Ok(records) => {
                    debug!(source = %source, count = records.len(), "Discovery source polled");
                    for record in records {
                        if self.insert(record) {
                            merged += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Discovery source poll failed");
                }
            }
        }
        merged
    }

    async fn poll_source(&self, url: &str) -> Result<Vec<KnownServerRecord>, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("source returned {}", response.status()));
        }
        let raw: Vec<SourceRecord> = response.json().await.map_err(|e| e.to_string())?;
        Ok(raw
            .into_iter()
            .map(|r| KnownServerRecord {
                server_id: r.server_id,
                api_url: r.api_url,
                capabilities: r.capabilities,
                metadata: r.metadata,
                discovered_at: r.discovered_at.unwrap_or_else(Utc::now),
            })
            .collect())
    }

    /// Merge one record into the cache, last write wins on `discovered_at`.
    ///
    /// Returns true when the record was inserted or replaced an older one.
    pub fn insert(&self, record: KnownServerRecord) -> bool {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        match servers.get(&record.server_id) {
            Some(existing) if existing.discovered_at > record.discovered_at => false,
            _ => {
                servers.insert(record.server_id, record);
                true
            }
        }
    }

    /// Look up a server by id. Pure cache read, never a network call.
    pub fn lookup(&self, id: ServerId) -> Option<KnownServerRecord> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.get(&id).cloned()
    }

    /// Snapshot of all known servers.
    pub fn known_servers(&self) -> Vec<KnownServerRecord> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.values().cloned().collect()
    }

    /// Number of known servers.
    pub fn len(&self) -> usize {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
