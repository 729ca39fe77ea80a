//! Communication orchestrator.
//!
//! [`InterServerComm`] owns the delivery queue, discovery cache, sync
//! engine, and security manager, and runs the background loops:
//!
//! - **delivery** — drains the queue on a short interval.
//! - **heartbeat** — client role only; enqueues a heartbeat for the
//!   supplier.
//! - **sync scheduler** — refreshes discovery and creates periodic sync
//!   jobs when a payload provider is registered.
//!
//! Each loop is spawned supervised: a watcher task reports its exit to the
//! [`Supervisor`], which treats exits outside shutdown as failures.

use crate::discovery::ServerDiscovery;
use crate::monitor::DeliveryQueue;
use crate::supervisor::Supervisor;
use crate::syncjob::SyncEngine;
use crate::transport::{HttpTransport, MessageTransport};
use dashmap::DashMap;
use ledgerlink_store::LinkStore;
use ledgerlink_types::config::CommConfig;
use ledgerlink_types::error::{LinkError, LinkResult};
use ledgerlink_types::message::{CommunicationStatus, MessageId, MessageType, SyncJobId};
use ledgerlink_types::server::{KnownServerRecord, ServerId, ServerIdentity, ServerRole};
use ledgerlink_wire::SecurityManager;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Produces the payload for a periodic sync job.
pub type SyncPayloadProvider = Box<dyn Fn() -> serde_json::Value + Send + Sync>;

/// A correlated request awaiting the receiver's reply.
pub struct PendingReply {
    /// Id of the message carrying the request.
    pub message_id: MessageId,
    receiver: oneshot::Receiver<serde_json::Value>,
}

impl PendingReply {
    /// Wait for the reply, up to the given timeout.
    pub async fn wait(self, timeout: std::time::Duration) -> LinkResult<serde_json::Value> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(LinkError::Transport(
                "request failed before a reply arrived".to_string(),
            )),
            Err(_) => Err(LinkError::Transport("reply timed out".to_string())),
        }
    }
}

/// Top-level inter-server communication component.
pub struct InterServerComm {
    identity: ServerIdentity,
    config: CommConfig,
    security: Arc<SecurityManager>,
    discovery: Arc<ServerDiscovery>,
    queue: Arc<DeliveryQueue>,
    sync: Arc<SyncEngine>,
    supervisor: Arc<Supervisor>,
    /// Correlation map: request message id to reply channel.
    pending: DashMap<MessageId, oneshot::Sender<serde_json::Value>>,
    sync_provider: Mutex<Option<SyncPayloadProvider>>,
    started_at: std::time::Instant,
}

impl InterServerComm {
    /// Build the communication stack over HTTP.
    pub fn new(config: CommConfig, store: LinkStore) -> LinkResult<Arc<Self>> {
        let identity = Self::identity_from(&config)?;
        let security = Arc::new(SecurityManager::new(
            config.shared_secret.clone(),
            identity.id,
            config.token_ttl_secs,
        ));
        let transport: Arc<dyn MessageTransport> =
            Arc::new(HttpTransport::new(Arc::clone(&security)));
        Ok(Self::assemble(config, store, identity, security, transport))
    }

    /// Build the stack with an injected transport. Test seam.
    pub fn with_transport(
        config: CommConfig,
        store: LinkStore,
        transport: Arc<dyn MessageTransport>,
    ) -> LinkResult<Arc<Self>> {
        let identity = Self::identity_from(&config)?;
        let security = Arc::new(SecurityManager::new(
            config.shared_secret.clone(),
            identity.id,
            config.token_ttl_secs,
        ));
        Ok(Self::assemble(config, store, identity, security, transport))
    }

    fn identity_from(config: &CommConfig) -> LinkResult<ServerIdentity> {
        let id = match &config.server_id {
            Some(raw) => raw
                .parse()
                .map_err(|e| LinkError::Config(format!("bad server_id: {e}")))?,
            None => ServerId::new(),
        };
        Ok(ServerIdentity {
            id,
            role: config.role,
            name: config.server_name.clone(),
        })
    }

    fn assemble(
        config: CommConfig,
        store: LinkStore,
        identity: ServerIdentity,
        security: Arc<SecurityManager>,
        transport: Arc<dyn MessageTransport>,
    ) -> Arc<Self> {
        let discovery = Arc::new(ServerDiscovery::new(config.discovery_sources.clone()));
        let queue = Arc::new(DeliveryQueue::new(
            config.delivery.clone(),
            Arc::clone(&discovery),
            Arc::clone(&transport),
            store.clone(),
        ));
        let sync = Arc::new(SyncEngine::new(
            identity.id,
            store,
            Arc::clone(&discovery),
            transport,
        ));

        info!(
            server_id = %identity.id,
            role = %identity.role,
            name = %identity.name,
            "Communication stack assembled"
        );

        Arc::new(Self {
            identity,
            config,
            security,
            discovery,
            queue,
            sync,
            supervisor: Arc::new(Supervisor::new()),
            pending: DashMap::new(),
            sync_provider: Mutex::new(None),
            started_at: std::time::Instant::now(),
        })
    }

    /// This server's identity.
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// The security manager requests are signed with.
    pub fn security(&self) -> Arc<SecurityManager> {
        Arc::clone(&self.security)
    }

    /// The discovery cache.
    pub fn discovery(&self) -> Arc<ServerDiscovery> {
        Arc::clone(&self.discovery)
    }

    /// The delivery queue.
    pub fn queue(&self) -> Arc<DeliveryQueue> {
        Arc::clone(&self.queue)
    }

    /// The sync engine.
    pub fn sync_engine(&self) -> Arc<SyncEngine> {
        Arc::clone(&self.sync)
    }

    /// The supervisor owning the shutdown signal.
    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Register the provider that builds periodic sync payloads.
    ///
    /// Without one, the sync scheduler only refreshes discovery.
    pub fn set_sync_provider(&self, provider: SyncPayloadProvider) {
        let mut guard = self
            .sync_provider
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(provider);
    }

    /// Start the background loops and resume persisted sync jobs.
    pub fn start(self: &Arc<Self>) -> LinkResult<()> {
        if let Err(e) = self.sync.resume() {
            warn!(error = %e, "Sync job resume failed");
        }

        let comm = Arc::clone(self);
        let drain_interval = std::time::Duration::from_secs(self.config.delivery.drain_interval_secs);
        self.spawn_supervised("delivery", async move {
            let mut shutdown = comm.supervisor.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(drain_interval) => {}
                    _ = shutdown.changed() => break,
                }
                let summary = comm.queue.drain().await;
                for (id, result) in summary.delivered {
                    comm.complete_correlated(id, result.unwrap_or(serde_json::Value::Null));
                }
                for id in summary.failed {
                    // Dropping the sender wakes the waiter with an error.
                    comm.pending.remove(&id);
                }
            }
        });

        if self.identity.role == ServerRole::Client {
            let comm = Arc::clone(self);
            let interval = std::time::Duration::from_secs(self.config.heartbeat_interval_secs);
            self.spawn_supervised("heartbeat", async move {
                let mut shutdown = comm.supervisor.subscribe();
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => break,
                    }
                    if comm.send_heartbeat().is_none() {
                        debug!("Heartbeat skipped, no supplier known");
                    }
                }
            });
        }

        let comm = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.config.sync_interval_secs);
        self.spawn_supervised("sync_scheduler", async move {
            let mut shutdown = comm.supervisor.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                comm.discovery.refresh().await;
                comm.run_periodic_sync();
            }
        });

        Ok(())
    }

    /// Spawn a loop plus a watcher task reporting its exit.
    fn spawn_supervised<F>(self: &Arc<Self>, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.supervisor.register_loop(name);
        let handle = tokio::spawn(fut);
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            let _ = handle.await;
            supervisor.record_loop_exit(name);
        });
    }

    /// Stop the loops and abort running sync tasks.
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
        self.sync.shutdown();
    }

    /// The counterpart server this instance talks to.
    ///
    /// Prefers a server advertising the counterpart role as a capability,
    /// then falls back to any known server that isn't this one.
    pub fn counterpart(&self) -> Option<KnownServerRecord> {
        let wanted = self.identity.role.counterpart().to_string();
        let known = self.discovery.known_servers();
        known
            .iter()
            .find(|r| r.has_capability(&wanted))
            .or_else(|| known.iter().find(|r| r.server_id != self.identity.id))
            .cloned()
    }

    /// Announce this server to its supplier.
    ///
    /// Registers `supplier_url` as a discovery source when given, refreshes
    /// discovery, then enqueues a registration message carrying this
    /// server's callable address. Client role only.
    pub async fn register_with_supplier(
        &self,
        supplier_url: Option<&str>,
    ) -> LinkResult<Option<MessageId>> {
        if self.identity.role != ServerRole::Client {
            return Ok(None);
        }
        if let Some(url) = supplier_url {
            self.discovery.register_source(url);
        }
        self.discovery.refresh().await;
        let supplier = self
            .counterpart()
            .ok_or_else(|| LinkError::TargetNotFound("no supplier known".to_string()))?;

        let payload = serde_json::json!({
            "server_id": self.identity.id,
            "name": self.identity.name,
            "role": self.identity.role,
            "api_url": format!("http://{}", self.config.api_listen),
        });
        let id = self.queue.enqueue(
            MessageType::Registration,
            self.identity.id,
            supplier.server_id,
            payload,
        );
        info!(message_id = %id, supplier = %supplier.server_id, "Registration enqueued");
        Ok(Some(id))
    }

    /// Enqueue a heartbeat for the supplier.
    ///
    /// Returns None on the supplier role or when no supplier is known.
    pub fn send_heartbeat(&self) -> Option<MessageId> {
        if self.identity.role != ServerRole::Client {
            return None;
        }
        let supplier = self.counterpart()?;
        let (pending, retry) = self.queue.pending_counts();
        let payload = serde_json::json!({
            "status": "alive",
            "pending_messages": pending,
            "retry_messages": retry,
            "succeeded_messages": self.queue.succeeded_count(),
            "failed_messages": self.queue.failed_count(),
            "active_jobs": self.sync.active_jobs(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
        });
        Some(self.queue.enqueue(
            MessageType::Heartbeat,
            self.identity.id,
            supplier.server_id,
            payload,
        ))
    }

    /// Ask the supplier to validate a license.
    ///
    /// The request goes through the delivery queue like any other message;
    /// the returned [`PendingReply`] resolves when the supplier's answer
    /// comes back, or errors when delivery fails terminally.
    pub fn request_license_check(&self, payload: serde_json::Value) -> LinkResult<PendingReply> {
        let supplier = self
            .counterpart()
            .ok_or_else(|| LinkError::TargetNotFound("no supplier known".to_string()))?;
        let id = self.queue.enqueue(
            MessageType::LicenseCheck,
            self.identity.id,
            supplier.server_id,
            payload,
        );
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        Ok(PendingReply {
            message_id: id,
            receiver: rx,
        })
    }

    /// Resolve a correlated request with its reply.
    ///
    /// Returns true when a waiter existed for the id.
    pub fn complete_correlated(&self, id: MessageId, value: serde_json::Value) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Create a sync job towards the counterpart with the given payload.
    pub fn schedule_sync(
        &self,
        sync_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> LinkResult<SyncJobId> {
        let target = self
            .counterpart()
            .ok_or_else(|| LinkError::TargetNotFound("no counterpart known".to_string()))?;
        Ok(self.sync.create_job(target.server_id, sync_type, payload))
    }

    fn run_periodic_sync(&self) {
        let payload = {
            let guard = self
                .sync_provider
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(provider) => provider(),
                None => return,
            }
        };
        // Client instances push customer/usage summaries; suppliers push
        // license/revenue summaries.
        let sync_type = match self.identity.role {
            ServerRole::Client => "customer_usage",
            ServerRole::Supplier => "license_revenue",
        };
        match self.schedule_sync(sync_type, payload) {
            Ok(id) => debug!(job_id = %id, "Periodic sync scheduled"),
            Err(e) => debug!(error = %e, "Periodic sync skipped"),
        }
    }

    /// Aggregate snapshot for dashboards and the status endpoint.
    pub fn get_communication_status(&self) -> CommunicationStatus {
        let (pending, retry) = self.queue.pending_counts();
        CommunicationStatus {
            server_id: self.identity.id,
            role: self.identity.role,
            pending_messages: pending,
            retry_messages: retry,
            succeeded_messages: self.queue.succeeded_count(),
            failed_messages: self.queue.failed_count(),
            active_jobs: self.sync.active_jobs(),
            known_servers: self.discovery.len(),
            loops_alive: self.supervisor.loops_alive(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageTransport;
    use async_trait::async_trait;
    use chrono::Utc;
    use ledgerlink_types::message::CommunicationMessage;
    use ledgerlink_wire::{ReceiveAck, SyncEnvelope};

    /// Transport that acks everything; license checks get an answer.
    struct AnsweringTransport;

    #[async_trait]
    impl MessageTransport for AnsweringTransport {
        async fn deliver(
            &self,
            _base_url: &str,
            message: &CommunicationMessage,
        ) -> LinkResult<ReceiveAck> {
            let result = match message.message_type {
                MessageType::LicenseCheck => Some(serde_json::json!({"valid": true})),
                _ => None,
            };
            Ok(ReceiveAck {
                id: message.id.to_string(),
                accepted: true,
                result,
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

    fn client_config() -> CommConfig {
        CommConfig {
            role: ServerRole::Client,
            shared_secret: "secret".to_string(),
            ..CommConfig::default()
        }
    }

    fn build(config: CommConfig) -> Arc<InterServerComm> {
        InterServerComm::with_transport(
            config,
            LinkStore::open_in_memory().unwrap(),
            Arc::new(AnsweringTransport),
        )
        .unwrap()
    }

    fn known_supplier(comm: &InterServerComm) -> ServerId {
        let id = ServerId::new();
        comm.discovery.insert(KnownServerRecord {
            server_id: id,
            api_url: "http://supplier.test".to_string(),
            capabilities: vec!["supplier".to_string()],
            metadata: serde_json::Value::Null,
            discovered_at: Utc::now(),
        });
        id
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_client_only() {
        let client = build(client_config());
        known_supplier(&client);
        assert!(client.send_heartbeat().is_some());
        assert_eq!(client.queue.pending_counts().0, 1);

        let supplier = build(CommConfig {
            role: ServerRole::Supplier,
            ..client_config()
        });
        known_supplier(&supplier);
        assert!(supplier.send_heartbeat().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_without_supplier_is_none() {
        let client = build(client_config());
        assert!(client.send_heartbeat().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_license_check_resolves_on_delivery() {
        let client = build(client_config());
        known_supplier(&client);

        let reply = client
            .request_license_check(serde_json::json!({"license_key": "ABC-123"}))
            .unwrap();

        // Drive one drain pass by hand.
        let summary = client.queue.drain().await;
        for (id, result) in summary.delivered {
            client.complete_correlated(id, result.unwrap_or(serde_json::Value::Null));
        }

        let answer = reply.wait(std::time::Duration::from_secs(5)).await.unwrap();
        assert_eq!(answer, serde_json::json!({"valid": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_license_check_fails_without_supplier() {
        let client = build(client_config());
        assert!(client
            .request_license_check(serde_json::Value::Null)
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_wakes_waiter_with_error() {
        let client = build(client_config());
        known_supplier(&client);

        let reply = client
            .request_license_check(serde_json::json!({"license_key": "X"}))
            .unwrap();
        // No drain ever delivers; dropping the pending entry simulates
        // terminal failure reported by the delivery loop.
        client.pending.remove(&reply.message_id);

        let err = reply
            .wait(std::time::Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("before a reply"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_start_and_stop() {
        let client = build(client_config());
        known_supplier(&client);
        client.start().unwrap();

        // Client runs delivery, heartbeat, and sync scheduler.
        tokio::task::yield_now().await;
        assert_eq!(client.supervisor.loops_alive(), 3);

        client.shutdown();
        // Give the loops a tick to observe the signal.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(client.supervisor.loops_alive(), 0);
        assert_eq!(client.supervisor.unexpected_exit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supplier_has_no_heartbeat_loop() {
        let supplier = build(CommConfig {
            role: ServerRole::Supplier,
            ..client_config()
        });
        supplier.start().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(supplier.supervisor.loops_alive(), 2);
        supplier.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_with_supplier_enqueues_registration() {
        let client = build(client_config());
        known_supplier(&client);
        let id = client.register_with_supplier(None).await.unwrap();
        assert!(id.is_some());
        assert_eq!(client.queue.pending_counts().0, 1);

        let supplier = build(CommConfig {
            role: ServerRole::Supplier,
            ..client_config()
        });
        assert!(supplier
            .register_with_supplier(None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_snapshot() {
        let client = build(client_config());
        known_supplier(&client);
        client.send_heartbeat();

        let status = client.get_communication_status();
        assert_eq!(status.role, ServerRole::Client);
        assert_eq!(status.pending_messages, 1);
        assert_eq!(status.known_servers, 1);
        assert_eq!(status.active_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_sync_targets_counterpart() {
        let client = build(client_config());
        let supplier_id = known_supplier(&client);

        let id = client
            .schedule_sync("customer_usage", serde_json::json!({"rows": 1}))
            .unwrap();
        let engine = client.sync_engine();
        engine.wait_for(id).await;
        let job = engine.get_job(id).unwrap().unwrap();
        assert_eq!(job.target, supplier_id);
    }
}
