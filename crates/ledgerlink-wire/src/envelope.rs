//! HTTP envelopes and endpoint descriptors for server-to-server calls.

use chrono::{DateTime, Utc};
use ledgerlink_types::message::{MessageId, MessageType, SyncJobId};
use ledgerlink_types::server::ServerId;
use serde::{Deserialize, Serialize};

/// Header carrying the sender's server id.
pub const HEADER_SERVER_ID: &str = "x-server-id";
/// Header carrying the message id, used for receiver-side idempotency.
pub const HEADER_MESSAGE_ID: &str = "x-message-id";
/// Header carrying the hex HMAC signature of the body bytes.
pub const HEADER_SIGNATURE: &str = "x-message-signature";

/// A remote endpoint a message type is delivered to.
///
/// The transport drives every request off the descriptor: HTTP method,
/// content type, whether a bearer token is attached, and the per-call
/// timeout. `max_retries` caps how many delivery attempts the queue may
/// spend on messages bound for this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub name: &'static str,
    /// Path appended to the target's base URL.
    pub path: &'static str,
    pub method: &'static str,
    /// Whether requests carry a scoped bearer token.
    pub auth_required: bool,
    /// Per-request timeout (seconds).
    pub timeout_secs: u64,
    /// Attempt ceiling for messages delivered to this endpoint.
    pub max_retries: u32,
    /// Header the bearer token is sent in.
    pub auth_header: &'static str,
    pub content_type: &'static str,
}

impl EndpointDescriptor {
    /// The general message receive endpoint.
    pub const fn communication_receive() -> Self {
        Self {
            name: "communication_receive",
            path: "/api/communication/receive",
            method: "POST",
            auth_required: true,
            timeout_secs: 10,
            max_retries: 5,
            auth_header: "authorization",
            content_type: "application/json",
        }
    }

    /// The sync snapshot endpoint. Larger bodies, longer timeout.
    pub const fn sync_receive() -> Self {
        Self {
            name: "sync_receive",
            path: "/api/sync/receive",
            method: "POST",
            auth_required: true,
            timeout_secs: 30,
            max_retries: 5,
            auth_header: "authorization",
            content_type: "application/json",
        }
    }

    /// The endpoint for a given message type.
    pub fn for_message_type(message_type: MessageType) -> Self {
        match message_type {
            MessageType::SyncRequest | MessageType::SyncResponse => Self::sync_receive(),
            _ => Self::communication_receive(),
        }
    }
}

/// The signed JSON body of a queued message delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    pub message_type: MessageType,
    #[serde(rename = "source_server_id")]
    pub source: ServerId,
    #[serde(rename = "target_server_id")]
    pub target: ServerId,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// The signed JSON body of a sync snapshot delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub job_id: SyncJobId,
    #[serde(rename = "source_server_id")]
    pub source: ServerId,
    #[serde(rename = "target_server_id")]
    pub target: ServerId,
    /// Tag describing what data this snapshot carries.
    pub sync_type: String,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// Receiver acknowledgement returned for an accepted envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveAck {
    /// Echo of the received message/job id.
    pub id: String,
    pub accepted: bool,
    /// Handler output, when the message type produces one (license checks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}
