//! Async sync-job engine.
//!
//! A sync job transmits a data snapshot to a counterpart server. Jobs move
//! strictly forward (scheduled, in progress, then completed, failed, or
//! cancelled) and every transition is written to the store, so a restarted
//! process can pick up where it left off. At most one job runs against a
//! given target at a time; later jobs for the same target wait on a
//! per-target gate.

use crate::discovery::ServerDiscovery;
use crate::transport::MessageTransport;
use chrono::Utc;
use dashmap::DashMap;
use ledgerlink_store::LinkStore;
use ledgerlink_types::error::{LinkError, LinkResult};
use ledgerlink_types::message::{SyncJob, SyncJobId, SyncJobStatus};
use ledgerlink_types::server::ServerId;
use ledgerlink_wire::SyncEnvelope;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runs sync jobs against counterpart servers.
pub struct SyncEngine {
    server_id: ServerId,
    store: LinkStore,
    discovery: Arc<ServerDiscovery>,
    transport: Arc<dyn MessageTransport>,
    /// Jobs not yet terminal. Terminal jobs live only in the store.
    jobs: DashMap<SyncJobId, SyncJob>,
    /// Per-target single-flight gates.
    gates: DashMap<ServerId, Arc<tokio::sync::Mutex<()>>>,
    /// Handles of spawned execution tasks.
    tasks: DashMap<SyncJobId, JoinHandle<()>>,
}

impl SyncEngine {
    /// Create an engine sending as the given server.
    pub fn new(
        server_id: ServerId,
        store: LinkStore,
        discovery: Arc<ServerDiscovery>,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        Self {
            server_id,
            store,
            discovery,
            transport,
            jobs: DashMap::new(),
            gates: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    /// Schedule a job without starting it. Persists the scheduled state.
    pub fn schedule(
        &self,
        target: ServerId,
        sync_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> SyncJobId {
        let job = SyncJob::new(self.server_id, target, sync_type, payload);
        let id = job.id;
        self.persist(&job);
        info!(job_id = %id, %target, sync_type = %job.sync_type, "Scheduled sync job");
        self.jobs.insert(id, job);
        id
    }

    /// Start executing a scheduled job on a background task.
    pub fn start(self: &Arc<Self>, id: SyncJobId) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.execute(id).await;
            engine.tasks.remove(&id);
        });
        self.tasks.insert(id, handle);
    }

    /// Schedule and immediately start a job. Returns its id.
    pub fn create_job(
        self: &Arc<Self>,
        target: ServerId,
        sync_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> SyncJobId {
        let id = self.schedule(target, sync_type, payload);
        self.start(id);
        id
    }

    /// Cancel a job that has not started executing.
    ///
    /// Returns true when the job was cancelled, false when it had already
    /// left the scheduled state.
    pub fn cancel(&self, id: SyncJobId) -> LinkResult<bool> {
        // The map entry lock makes this atomic with the execute-side
        // scheduled check.
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            if entry.status != SyncJobStatus::Scheduled {
                return Ok(false);
            }
            entry.status = SyncJobStatus::Cancelled;
            entry.completed_at = Some(Utc::now());
            let job = entry.clone();
            drop(entry);
            self.persist(&job);
            self.jobs.remove(&id);
            info!(job_id = %id, "Cancelled sync job");
            return Ok(true);
        }
        // Not in memory: either unknown or already terminal in the store.
        match self.store.load_job(id)? {
            Some(job) if job.status == SyncJobStatus::Scheduled => {
                let mut job = job;
                job.status = SyncJobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                self.persist(&job);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(LinkError::TargetNotFound(format!("unknown job: {id}"))),
        }
    }

    /// Look up a job, memory first, then the store.
    pub fn get_job(&self, id: SyncJobId) -> LinkResult<Option<SyncJob>> {
        if let Some(job) = self.jobs.get(&id) {
            return Ok(Some(job.clone()));
        }
        self.store.load_job(id)
    }

    /// List jobs, optionally filtered by status. In-memory state overlays
    /// what the store has.
    pub fn list_jobs(&self, status: Option<SyncJobStatus>) -> LinkResult<Vec<SyncJob>> {
        let mut jobs = self.store.list_jobs(status)?;
        for job in jobs.iter_mut() {
            if let Some(live) = self.jobs.get(&job.id) {
                *job = live.clone();
            }
        }
        if let Some(filter) = status {
            jobs.retain(|j| j.status == filter);
        }
        Ok(jobs)
    }

    /// Number of jobs not yet terminal.
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Wait for a job's execution task to finish. No-op if none is running.
    pub async fn wait_for(&self, id: SyncJobId) {
        if let Some((_, handle)) = self.tasks.remove(&id) {
            let _ = handle.await;
        }
    }

    /// Resume after a restart.
    ///
    /// Jobs the previous process left in progress are failed (their
    /// delivery state is unknowable); scheduled jobs are reloaded and
    /// started again.
    pub fn resume(self: &Arc<Self>) -> LinkResult<usize> {
        for mut job in self.store.list_jobs(Some(SyncJobStatus::InProgress))? {
            warn!(job_id = %job.id, "Failing sync job interrupted by restart");
            job.status = SyncJobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some("interrupted by restart".to_string());
            self.persist(&job);
        }

        let scheduled = self.store.list_jobs(Some(SyncJobStatus::Scheduled))?;
        let count = scheduled.len();
        for job in scheduled {
            let id = job.id;
            self.jobs.insert(id, job);
            self.start(id);
        }
        if count > 0 {
            info!(count, "Resumed scheduled sync jobs");
        }
        Ok(count)
    }

    /// Abort all running execution tasks.
    pub fn shutdown(&self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
    }

    async fn execute(&self, id: SyncJobId) {
        let gate = self
            .gates
            .entry(self.target_of(id).unwrap_or(self.server_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _permit = gate.lock().await;

        // Re-check under the entry lock: the job may have been cancelled
        // while we waited on the gate.
        let mut job = match self.jobs.get_mut(&id) {
            Some(mut entry) if entry.status == SyncJobStatus::Scheduled => {
                entry.status = SyncJobStatus::InProgress;
                entry.started_at = Some(Utc::now());
                entry.clone()
            }
            _ => {
                debug!(job_id = %id, "Sync job no longer scheduled, skipping");
                return;
            }
        };
        self.persist(&job);

        let outcome = self.transmit(&job).await;
        match outcome {
            Ok(result) => {
                job.status = SyncJobStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.result = result;
                info!(job_id = %id, "Sync job completed");
            }
            Err(e) => {
                job.status = SyncJobStatus::Failed;
                job.completed_at = Some(Utc::now());
                job.error = Some(e.to_string());
                warn!(job_id = %id, error = %e, "Sync job failed");
            }
        }
        self.persist(&job);
        self.jobs.remove(&id);
    }

    async fn transmit(&self, job: &SyncJob) -> LinkResult<Option<serde_json::Value>> {
        let target = self
            .discovery
            .lookup(job.target)
            .ok_or_else(|| LinkError::TargetNotFound(job.target.to_string()))?;
        let envelope = SyncEnvelope {
            job_id: job.id,
            source: job.source,
            target: job.target,
            sync_type: job.sync_type.clone(),
            payload: job.payload.clone(),
            sent_at: Utc::now(),
        };
        let ack = self.transport.deliver_sync(&target.api_url, &envelope).await?;
        Ok(ack.result)
    }

    fn target_of(&self, id: SyncJobId) -> Option<ServerId> {
        self.jobs.get(&id).map(|j| j.target)
    }

    fn persist(&self, job: &SyncJob) {
        // Store failures are logged, never surfaced into job logic.
        if let Err(e) = self.store.save_job(job) {
            warn!(job_id = %job.id, error = %e, "Sync job persist failed");
        }
    }
}
