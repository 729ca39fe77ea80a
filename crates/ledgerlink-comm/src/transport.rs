//! Signed HTTP transport between servers.
//!
//! Every outgoing request carries a bearer token scoped to the target, the
//! sender's id, and an HMAC signature over the exact body bytes. The body is
//! serialized once via [`SecurityManager::canonical_bytes`]; the same bytes
//! are signed and sent so the receiver can verify without re-serializing.

use async_trait::async_trait;
use chrono::Utc;
use ledgerlink_types::error::{LinkError, LinkResult};
use ledgerlink_types::message::CommunicationMessage;
use ledgerlink_types::server::ServerId;
use ledgerlink_wire::{
    EndpointDescriptor, MessageEnvelope, ReceiveAck, SecurityManager, SyncEnvelope,
    HEADER_MESSAGE_ID, HEADER_SERVER_ID, HEADER_SIGNATURE,
};
use std::sync::Arc;
use tracing::debug;

/// Delivers signed envelopes to a remote server.
///
/// Implementations classify failures: any failed request (timeout, refused
/// connection, non-2xx — including a receiver's 401/403) comes back as
/// [`LinkError::Transport`] and is retryable, so a transiently rejecting
/// receiver consumes the message's full attempt budget before FAILED.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver a queued message. Returns the receiver's acknowledgement.
    async fn deliver(
        &self,
        base_url: &str,
        message: &CommunicationMessage,
    ) -> LinkResult<ReceiveAck>;

    /// Deliver a sync snapshot. Returns the receiver's acknowledgement.
    async fn deliver_sync(&self, base_url: &str, envelope: &SyncEnvelope) -> LinkResult<ReceiveAck>;
}

/// HTTP implementation of [`MessageTransport`] over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    security: Arc<SecurityManager>,
}

impl HttpTransport {
    /// Create a transport signing as the given security manager's server.
    ///
    /// No global client timeout; each request uses its endpoint's timeout.
    pub fn new(security: Arc<SecurityManager>) -> Self {
        Self {
            client: reqwest::Client::builder().build().unwrap_or_default(),
            security,
        }
    }

    async fn post_signed(
        &self,
        base_url: &str,
        endpoint: EndpointDescriptor,
        message_id: &str,
        target: ServerId,
        body: Vec<u8>,
    ) -> LinkResult<ReceiveAck> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), endpoint.path);
        let signature = self.security.sign_bytes(&body);
        let method = reqwest::Method::from_bytes(endpoint.method.as_bytes())
            .map_err(|e| LinkError::Internal(format!("bad endpoint method: {e}")))?;

        debug!(
            url = %url,
            endpoint = endpoint.name,
            message_id = %message_id,
            "Delivering signed envelope"
        );

        let mut request = self
            .client
            .request(method, &url)
            .timeout(std::time::Duration::from_secs(endpoint.timeout_secs))
            .header("content-type", endpoint.content_type)
            .header(HEADER_SERVER_ID, self.security.server_id().to_string())
            .header(HEADER_MESSAGE_ID, message_id)
            .header(HEADER_SIGNATURE, signature);
        if endpoint.auth_required {
            let token = self.security.issue_token(target)?;
            request = request.header(endpoint.auth_header, format!("Bearer {token}"));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LinkError::Transport(format!(
                "receiver returned {status}: {detail}"
            )));
        }

        response
            .json::<ReceiveAck>()
            .await
            .map_err(|e| LinkError::Transport(format!("invalid acknowledgement: {e}")))
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn deliver(
        &self,
        base_url: &str,
        message: &CommunicationMessage,
    ) -> LinkResult<ReceiveAck> {
        let envelope = MessageEnvelope {
            message_id: message.id,
            message_type: message.message_type,
            source: message.source,
            target: message.target,
            payload: message.payload.clone(),
            sent_at: Utc::now(),
        };
        let body = SecurityManager::canonical_bytes(&envelope)
            .map_err(|e| LinkError::Serialization(e.to_string()))?;
        let endpoint = EndpointDescriptor::for_message_type(message.message_type);

        self.post_signed(
            base_url,
            endpoint,
            &message.id.to_string(),
            message.target,
            body,
        )
        .await
    }

    async fn deliver_sync(&self, base_url: &str, envelope: &SyncEnvelope) -> LinkResult<ReceiveAck> {
        let body = SecurityManager::canonical_bytes(envelope)
            .map_err(|e| LinkError::Serialization(e.to_string()))?;

        self.post_signed(
            base_url,
            EndpointDescriptor::sync_receive(),
            &envelope.job_id.to_string(),
            envelope.target,
            body,
        )
        .await
    }
}
