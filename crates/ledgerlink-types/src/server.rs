//! Server identity, deployment roles, and discovery records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    /// Generate a new random ServerId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ServerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Deployment role of a server instance.
///
/// A client hosts customer-facing features; a supplier issues licenses and
/// collects revenue share. The role is fixed for the lifetime of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Client,
    Supplier,
}

impl ServerRole {
    /// The role this server talks to.
    pub fn counterpart(&self) -> ServerRole {
        match self {
            ServerRole::Client => ServerRole::Supplier,
            ServerRole::Supplier => ServerRole::Client,
        }
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Client => write!(f, "client"),
            ServerRole::Supplier => write!(f, "supplier"),
        }
    }
}

/// Immutable identity of the local server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Unique id of this instance.
    pub id: ServerId,
    /// Deployment role.
    pub role: ServerRole,
    /// Human-readable instance name.
    pub name: String,
}

/// A remote server known to the discovery cache.
///
/// Records are replaced wholesale on refresh, never partially updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownServerRecord {
    /// The remote server's id.
    pub server_id: ServerId,
    /// Base URL for API calls to this server.
    pub api_url: String,
    /// Advertised capabilities (e.g. "supplier", "sync").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-form metadata from the discovery source.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When this record was last refreshed.
    pub discovered_at: DateTime<Utc>,
}

impl KnownServerRecord {
    /// Whether this server advertises the given role as a capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_roundtrip() {
        let id = ServerId::new();
        let parsed: ServerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_server_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<ServerId>().is_err());
    }

    #[test]
    fn test_role_counterpart() {
        assert_eq!(ServerRole::Client.counterpart(), ServerRole::Supplier);
        assert_eq!(ServerRole::Supplier.counterpart(), ServerRole::Client);
    }

    #[test]
    fn test_role_serde_snake_case() {
        let json = serde_json::to_string(&ServerRole::Supplier).unwrap();
        assert_eq!(json, "\"supplier\"");
        let back: ServerRole = serde_json::from_str("\"client\"").unwrap();
        assert_eq!(back, ServerRole::Client);
    }

    #[test]
    fn test_known_server_capability() {
        let record = KnownServerRecord {
            server_id: ServerId::new(),
            api_url: "https://supplier.example.com".to_string(),
            capabilities: vec!["supplier".to_string(), "sync".to_string()],
            metadata: serde_json::Value::Null,
            discovered_at: Utc::now(),
        };
        assert!(record.has_capability("supplier"));
        assert!(!record.has_capability("client"));
    }
}
