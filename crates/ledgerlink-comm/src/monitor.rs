//! At-least-once delivery queue with bounded retries.
//!
//! Messages are enqueued in memory and drained by the orchestrator's
//! delivery loop. A failed attempt re-enqueues the message with a backoff
//! deadline from the configured table; a message whose target is unknown
//! fails immediately without consuming an attempt. Every attempt is written
//! to the audit trail best-effort: a failing store is logged and never
//! blocks delivery.

use crate::discovery::ServerDiscovery;
use crate::transport::MessageTransport;
use chrono::{Duration as ChronoDuration, Utc};
use ledgerlink_store::LinkStore;
use ledgerlink_types::config::DeliveryConfig;
use ledgerlink_types::message::{
    AuditRecord, CommunicationMessage, MessageId, MessageStatus, MessageType,
};
use ledgerlink_types::server::ServerId;
use ledgerlink_wire::EndpointDescriptor;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A message waiting in the queue with its delivery deadline.
struct QueuedMessage {
    message: CommunicationMessage,
    /// Earliest instant the next attempt may run.
    due: Instant,
}

/// Result of one drain pass.
#[derive(Debug, Default)]
pub struct DrainSummary {
    /// Messages attempted this pass.
    pub attempted: usize,
    /// Messages delivered successfully, with the receiver's result payload.
    pub delivered: Vec<(MessageId, Option<serde_json::Value>)>,
    /// Messages re-enqueued for a later retry.
    pub retried: usize,
    /// Messages that reached a terminal failure.
    pub failed: Vec<MessageId>,
}

/// In-memory delivery queue with bounded retries.
pub struct DeliveryQueue {
    queue: Mutex<VecDeque<QueuedMessage>>,
    config: DeliveryConfig,
    discovery: Arc<ServerDiscovery>,
    transport: Arc<dyn MessageTransport>,
    store: LinkStore,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryQueue {
    /// Create a queue delivering through the given transport.
    pub fn new(
        config: DeliveryConfig,
        discovery: Arc<ServerDiscovery>,
        transport: Arc<dyn MessageTransport>,
        store: LinkStore,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            config,
            discovery,
            transport,
            store,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Enqueue a message for delivery. Returns its id.
    ///
    /// The attempt ceiling is the configured maximum, capped by the target
    /// endpoint's retry budget.
    pub fn enqueue(
        &self,
        message_type: MessageType,
        source: ServerId,
        target: ServerId,
        payload: serde_json::Value,
    ) -> MessageId {
        let ceiling = self
            .config
            .max_attempts
            .min(EndpointDescriptor::for_message_type(message_type).max_retries);
        let message = CommunicationMessage::new(message_type, source, target, payload, ceiling);
        let id = message.id;
        debug!(message_id = %id, %message_type, %target, "Enqueued message");
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(QueuedMessage {
            message,
            due: Instant::now(),
        });
        id
    }

    /// Messages currently waiting, split by status.
    pub fn pending_counts(&self) -> (usize, usize) {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let pending = queue
            .iter()
            .filter(|q| q.message.status == MessageStatus::Pending)
            .count();
        let retry = queue.len() - pending;
        (pending, retry)
    }

    /// Messages delivered successfully since startup.
    pub fn succeeded_count(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// Messages that reached terminal failure since startup.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Attempt delivery of every due message.
    ///
    /// Due messages are moved out of the queue before any attempt, so a
    /// concurrent drain never double-sends the same message. Retries go back
    /// into the queue with their backoff deadline; terminal messages are
    /// dropped after their audit write.
    pub async fn drain(&self) -> DrainSummary {
        let now = Instant::now();
        let due: Vec<QueuedMessage> = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let mut due = Vec::new();
            let mut keep = VecDeque::with_capacity(queue.len());
            while let Some(item) = queue.pop_front() {
                if item.due <= now {
                    due.push(item);
                } else {
                    keep.push_back(item);
                }
            }
            *queue = keep;
            due
        };

        let mut summary = DrainSummary {
            attempted: due.len(),
            ..DrainSummary::default()
        };

        for item in due {
            self.attempt(item.message, &mut summary).await;
        }
        summary
    }

    async fn attempt(&self, mut message: CommunicationMessage, summary: &mut DrainSummary) {
        let target = match self.discovery.lookup(message.target) {
            Some(record) => record,
            None => {
                // Unknown target: terminal failure, no attempt consumed.
                warn!(
                    message_id = %message.id,
                    target = %message.target,
                    "Target server not in discovery cache, failing message"
                );
                message.status = MessageStatus::Failed;
                message.error = Some(format!("target server not found: {}", message.target));
                self.failed.fetch_add(1, Ordering::Relaxed);
                summary.failed.push(message.id);
                self.audit(&message);
                return;
            }
        };

        message.attempts += 1;
        match self.transport.deliver(&target.api_url, &message).await {
            Ok(ack) => {
                message.status = MessageStatus::Success;
                message.response = ack.result.clone();
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message_id = %message.id,
                    attempts = message.attempts,
                    "Message delivered"
                );
                summary.delivered.push((message.id, ack.result));
                self.audit(&message);
            }
            Err(e) if e.is_retryable() && message.attempts < message.max_attempts => {
                let backoff = self.config.backoff_for_attempt(message.attempts);
                message.status = MessageStatus::Retry;
                message.error = Some(e.to_string());
                message.not_before =
                    Utc::now() + ChronoDuration::from_std(backoff).unwrap_or_default();
                info!(
                    message_id = %message.id,
                    attempts = message.attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %e,
                    "Delivery failed, scheduling retry"
                );
                summary.retried += 1;
                self.audit(&message);
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.push_back(QueuedMessage {
                    message,
                    due: Instant::now() + backoff,
                });
            }
            Err(e) => {
                message.status = MessageStatus::Failed;
                message.error = Some(e.to_string());
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_id = %message.id,
                    attempts = message.attempts,
                    error = %e,
                    "Message delivery failed terminally"
                );
                summary.failed.push(message.id);
                self.audit(&message);
            }
        }
    }

    fn audit(&self, message: &CommunicationMessage) {
        let record = AuditRecord {
            source: message.source,
            target: message.target,
            message_type: message.message_type,
            status: message.status,
            attempts: message.attempts,
            error: message.error.clone(),
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.store.append_audit(&record) {
            warn!(message_id = %message.id, error = %e, "Audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpTransport;
    use async_trait::async_trait;
    use chrono::Utc;
    use ledgerlink_types::error::{LinkError, LinkResult};
    use ledgerlink_types::server::KnownServerRecord;
    use ledgerlink_wire::{ReceiveAck, SecurityManager, SyncEnvelope};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Transport that fails the first `failures` calls, then succeeds.
    struct FlakyTransport {
        failures: Mutex<u32>,
        calls: AtomicU64,
    }

    impl FlakyTransport {
        fn failing(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: AtomicU64::new(0),
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl MessageTransport for FlakyTransport {
        async fn deliver(
            &self,
            _base_url: &str,
            message: &CommunicationMessage,
        ) -> LinkResult<ReceiveAck> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(LinkError::Transport("connection refused".to_string()));
            }
            Ok(ReceiveAck {
                id: message.id.to_string(),
                accepted: true,
                result: None,
            })
        }

        async fn deliver_sync(
            &self,
            _base_url: &str,
            envelope: &SyncEnvelope,
        ) -> LinkResult<ReceiveAck> {
            Ok(ReceiveAck {
                id: envelope.job_id.to_string(),
                accepted: true,
                result: None,
            })
        }
    }

    fn queue_with(
        transport: Arc<dyn MessageTransport>,
        target: ServerId,
    ) -> (DeliveryQueue, LinkStore) {
        let discovery = Arc::new(ServerDiscovery::new(vec![]));
        discovery.insert(KnownServerRecord {
            server_id: target,
            api_url: "http://supplier.test".to_string(),
            capabilities: vec!["supplier".to_string()],
            metadata: serde_json::Value::Null,
            discovered_at: Utc::now(),
        });
        let store = LinkStore::open_in_memory().unwrap();
        let queue = DeliveryQueue::new(
            DeliveryConfig::default(),
            discovery,
            transport,
            store.clone(),
        );
        (queue, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_delivery_first_attempt() {
        let target = ServerId::new();
        let transport = Arc::new(FlakyTransport::failing(0));
        let (queue, store) = queue_with(transport.clone(), target);

        let id = queue.enqueue(
            MessageType::Heartbeat,
            ServerId::new(),
            target,
            serde_json::json!({"status": "ok"}),
        );

        let summary = queue.drain().await;
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.delivered.len(), 1);
        assert_eq!(summary.delivered[0].0, id);
        assert_eq!(queue.succeeded_count(), 1);
        assert_eq!(transport.calls(), 1);

        let audit = store.recent_audit(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, MessageStatus::Success);
        assert_eq!(audit[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_respects_backoff_schedule() {
        let target = ServerId::new();
        let transport = Arc::new(FlakyTransport::failing(2));
        let (queue, _store) = queue_with(transport.clone(), target);

        queue.enqueue(
            MessageType::Heartbeat,
            ServerId::new(),
            target,
            serde_json::Value::Null,
        );

        // Attempt 1 fails; retry scheduled 1s out.
        let summary = queue.drain().await;
        assert_eq!(summary.retried, 1);
        assert_eq!(queue.pending_counts(), (0, 1));

        // Not due yet: a drain half a second later attempts nothing.
        tokio::time::advance(std::time::Duration::from_millis(500)).await;
        assert_eq!(queue.drain().await.attempted, 0);

        // Attempt 2 fails; next backoff is 5s.
        tokio::time::advance(std::time::Duration::from_millis(600)).await;
        assert_eq!(queue.drain().await.retried, 1);

        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        assert_eq!(queue.drain().await.attempted, 0);

        // Attempt 3 succeeds.
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        let summary = queue.drain().await;
        assert_eq!(summary.delivered.len(), 1);
        assert_eq!(transport.calls(), 3);
        assert_eq!(queue.succeeded_count(), 1);
        assert_eq!(queue.failed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_fail_terminally() {
        let target = ServerId::new();
        let transport = Arc::new(FlakyTransport::failing(u32::MAX));
        let (queue, store) = queue_with(transport.clone(), target);

        queue.enqueue(
            MessageType::Registration,
            ServerId::new(),
            target,
            serde_json::Value::Null,
        );

        // Walk through the full backoff table: 1s, 5s, 15s, 30s.
        for advance_secs in [0, 1, 5, 15, 30] {
            tokio::time::advance(std::time::Duration::from_secs(advance_secs)).await;
            queue.drain().await;
        }

        assert_eq!(transport.calls(), 5);
        assert_eq!(queue.failed_count(), 1);
        assert_eq!(queue.pending_counts(), (0, 0));

        let audit = store.recent_audit(10).unwrap();
        assert_eq!(audit.len(), 5);
        assert_eq!(audit[0].status, MessageStatus::Failed);
        assert_eq!(audit[0].attempts, 5);
    }

    #[tokio::test]
    async fn test_unauthorized_receiver_consumes_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(5)
            .mount(&server)
            .await;

        let source = ServerId::new();
        let target = ServerId::new();
        let discovery = Arc::new(ServerDiscovery::new(vec![]));
        discovery.insert(KnownServerRecord {
            server_id: target,
            api_url: server.uri(),
            capabilities: vec!["supplier".to_string()],
            metadata: serde_json::Value::Null,
            discovered_at: Utc::now(),
        });
        let store = LinkStore::open_in_memory().unwrap();
        let transport = Arc::new(HttpTransport::new(Arc::new(SecurityManager::new(
            "secret", source, 300,
        ))));
        // Zero backoff keeps the test on real time.
        let queue = DeliveryQueue::new(
            DeliveryConfig {
                backoff_secs: vec![0],
                ..DeliveryConfig::default()
            },
            discovery,
            transport,
            store.clone(),
        );

        queue.enqueue(
            MessageType::Heartbeat,
            source,
            target,
            serde_json::Value::Null,
        );
        // A rejecting receiver consumes the full attempt budget, not one.
        for _ in 0..5 {
            queue.drain().await;
        }

        assert_eq!(queue.failed_count(), 1);
        assert_eq!(queue.pending_counts(), (0, 0));
        let audit = store.recent_audit(10).unwrap();
        assert_eq!(audit.len(), 5);
        assert_eq!(audit[0].status, MessageStatus::Failed);
        assert_eq!(audit[0].attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_max_attempts_caps_retries() {
        let target = ServerId::new();
        let transport = Arc::new(FlakyTransport::failing(u32::MAX));
        let discovery = Arc::new(ServerDiscovery::new(vec![]));
        discovery.insert(KnownServerRecord {
            server_id: target,
            api_url: "http://supplier.test".to_string(),
            capabilities: vec!["supplier".to_string()],
            metadata: serde_json::Value::Null,
            discovered_at: Utc::now(),
        });
        let store = LinkStore::open_in_memory().unwrap();
        let queue = DeliveryQueue::new(
            DeliveryConfig {
                max_attempts: 3,
                ..DeliveryConfig::default()
            },
            discovery,
            transport.clone(),
            store.clone(),
        );

        queue.enqueue(
            MessageType::MetricsReport,
            ServerId::new(),
            target,
            serde_json::Value::Null,
        );

        for advance_secs in [0, 1, 5] {
            tokio::time::advance(std::time::Duration::from_secs(advance_secs)).await;
            queue.drain().await;
        }

        assert_eq!(transport.calls(), 3);
        assert_eq!(queue.failed_count(), 1);

        let audit = store.recent_audit(10).unwrap();
        assert_eq!(audit.len(), 3);
        assert_eq!(audit[0].status, MessageStatus::Failed);
        assert_eq!(audit[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_target_fails_without_attempt() {
        let transport = Arc::new(FlakyTransport::failing(0));
        let discovery = Arc::new(ServerDiscovery::new(vec![]));
        let store = LinkStore::open_in_memory().unwrap();
        let queue = DeliveryQueue::new(
            DeliveryConfig::default(),
            discovery,
            transport.clone(),
            store.clone(),
        );

        queue.enqueue(
            MessageType::Heartbeat,
            ServerId::new(),
            ServerId::new(),
            serde_json::Value::Null,
        );

        let summary = queue.drain().await;
        assert_eq!(summary.failed.len(), 1);
        // The transport was never called and no attempt was consumed.
        assert_eq!(transport.calls(), 0);
        let audit = store.recent_audit(10).unwrap();
        assert_eq!(audit[0].attempts, 0);
        assert_eq!(audit[0].status, MessageStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_moves_ownership_no_double_send() {
        let target = ServerId::new();
        let transport = Arc::new(FlakyTransport::failing(0));
        let (queue, _store) = queue_with(transport.clone(), target);
        let queue = Arc::new(queue);

        for _ in 0..10 {
            queue.enqueue(
                MessageType::Heartbeat,
                ServerId::new(),
                target,
                serde_json::Value::Null,
            );
        }

        // Two concurrent drains split the work; no message is sent twice.
        let (a, b) = tokio::join!(queue.drain(), queue.drain());
        assert_eq!(a.attempted + b.attempted, 10);
        assert_eq!(transport.calls(), 10);
        assert_eq!(queue.succeeded_count(), 10);
    }
}
