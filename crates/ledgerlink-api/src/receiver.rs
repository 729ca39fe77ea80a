//! Receiver endpoints for signed inter-server messages.
//!
//! Requests are checked in a fixed order: HMAC signature over the exact
//! body bytes, then the bearer token (issuer from the `x-server-id` header,
//! audience this server, unexpired). Either failure is a 401 with a JSON
//! error body. A duplicate `x-message-id` short-circuits with the cached
//! acknowledgement so redelivered messages stay idempotent.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use dashmap::DashMap;
use ledgerlink_comm::InterServerComm;
use ledgerlink_types::message::{CommunicationStatus, MessageType};
use ledgerlink_types::server::{KnownServerRecord, ServerId};
use ledgerlink_wire::{
    MessageEnvelope, ReceiveAck, SyncEnvelope, HEADER_MESSAGE_ID, HEADER_SERVER_ID,
    HEADER_SIGNATURE,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

type ApiRejection = (StatusCode, Json<serde_json::Value>);

/// How long a cached ack is replayed for redelivered message ids. Senders
/// exhaust their retry budget well inside this window.
const SEEN_TTL: std::time::Duration = std::time::Duration::from_secs(600);

struct CachedAck {
    ack: ReceiveAck,
    stored_at: tokio::time::Instant,
}

/// Shared state behind the receiver routes.
pub struct ReceiverState {
    comm: Arc<InterServerComm>,
    /// Idempotency cache: message id header to the ack it produced.
    /// Entries older than [`SEEN_TTL`] are evicted, so the cache stays
    /// bounded by the recent message rate.
    seen: DashMap<String, CachedAck>,
}

impl ReceiverState {
    /// Create receiver state over the communication stack.
    pub fn new(comm: Arc<InterServerComm>) -> Arc<Self> {
        Arc::new(Self {
            comm,
            seen: DashMap::new(),
        })
    }

    fn cached_ack(&self, message_id: &str) -> Option<ReceiveAck> {
        let entry = self.seen.get(message_id)?;
        if entry.stored_at.elapsed() > SEEN_TTL {
            drop(entry);
            self.seen.remove(message_id);
            return None;
        }
        Some(entry.ack.clone())
    }

    fn remember(&self, message_id: String, ack: ReceiveAck) {
        self.seen
            .retain(|_, cached| cached.stored_at.elapsed() <= SEEN_TTL);
        self.seen.insert(
            message_id,
            CachedAck {
                ack,
                stored_at: tokio::time::Instant::now(),
            },
        );
    }
}

/// Build the receiver router.
pub fn router(state: Arc<ReceiverState>) -> Router {
    Router::new()
        .route("/api/communication/receive", post(receive_message))
        .route("/api/sync/receive", post(receive_sync))
        .route("/api/communication/status", get(status))
        .with_state(state)
}

fn unauthorized(detail: &str) -> ApiRejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "auth", "detail": detail})),
    )
}

/// Verify signature and token; returns the sender id and message id header.
fn authenticate(
    state: &ReceiverState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(ServerId, String), ApiRejection> {
    let signature = headers
        .get(HEADER_SIGNATURE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("missing signature"))?;
    let security = state.comm.security();
    if !security.verify_bytes(body, signature) {
        return Err(unauthorized("invalid signature"));
    }

    let sender: ServerId = headers
        .get(HEADER_SERVER_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| unauthorized("missing sender id"))?;

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| unauthorized("missing bearer token"))?;
    if security.validate_token(token, sender).is_none() {
        return Err(unauthorized("invalid token"));
    }

    let message_id = headers
        .get(HEADER_MESSAGE_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Ok((sender, message_id))
}

async fn receive_message(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReceiveAck>, ApiRejection> {
    let (sender, message_id) = authenticate(&state, &headers, &body)?;

    if let Some(cached) = state.cached_ack(&message_id) {
        debug!(message_id = %message_id, "Duplicate message, replaying cached ack");
        return Ok(Json(cached));
    }

    let envelope: MessageEnvelope = serde_json::from_slice(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "malformed", "detail": e.to_string()})),
        )
    })?;

    let result = dispatch(&state, sender, &envelope);
    info!(
        message_id = %envelope.message_id,
        message_type = %envelope.message_type,
        %sender,
        "Message received"
    );

    let ack = ReceiveAck {
        id: envelope.message_id.to_string(),
        accepted: true,
        result,
    };
    if !message_id.is_empty() {
        state.remember(message_id, ack.clone());
    }
    Ok(Json(ack))
}

/// Handle an accepted message by type. Returns the ack's result payload.
fn dispatch(
    state: &ReceiverState,
    sender: ServerId,
    envelope: &MessageEnvelope,
) -> Option<serde_json::Value> {
    // A correlated reply resolves its waiter regardless of message type.
    if let Some(reply_to) = envelope
        .payload
        .get("in_reply_to")
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse().ok())
    {
        state.comm.complete_correlated(reply_to, envelope.payload.clone());
    }

    match envelope.message_type {
        MessageType::Registration => {
            let api_url = envelope
                .payload
                .get("api_url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let role = envelope
                .payload
                .get("role")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            state.comm.discovery().insert(KnownServerRecord {
                server_id: sender,
                api_url,
                capabilities: vec![role],
                metadata: envelope.payload.clone(),
                discovered_at: Utc::now(),
            });
            info!(%sender, "Server registered via message");
            None
        }
        MessageType::LicenseCheck => {
            // Supplier-side check: a non-empty key is answerable.
            let valid = envelope
                .payload
                .get("license_key")
                .and_then(|v| v.as_str())
                .is_some_and(|k| !k.is_empty());
            Some(serde_json::json!({
                "valid": valid,
                "checked_at": Utc::now(),
            }))
        }
        MessageType::Heartbeat => {
            debug!(%sender, "Heartbeat recorded");
            None
        }
        MessageType::ErrorNotification => {
            warn!(%sender, payload = %envelope.payload, "Error notification received");
            None
        }
        _ => None,
    }
}

async fn receive_sync(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReceiveAck>, ApiRejection> {
    let (sender, message_id) = authenticate(&state, &headers, &body)?;

    if let Some(cached) = state.cached_ack(&message_id) {
        debug!(message_id = %message_id, "Duplicate sync delivery, replaying cached ack");
        return Ok(Json(cached));
    }

    let envelope: SyncEnvelope = serde_json::from_slice(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "malformed", "detail": e.to_string()})),
        )
    })?;

    info!(
        job_id = %envelope.job_id,
        sync_type = %envelope.sync_type,
        %sender,
        "Sync snapshot received"
    );

    let ack = ReceiveAck {
        id: envelope.job_id.to_string(),
        accepted: true,
        result: Some(serde_json::json!({"status": "received"})),
    };
    if !message_id.is_empty() {
        state.remember(message_id, ack.clone());
    }
    Ok(Json(ack))
}

async fn status(State(state): State<Arc<ReceiverState>>) -> Json<CommunicationStatus> {
    Json(state.comm.get_communication_status())
}
