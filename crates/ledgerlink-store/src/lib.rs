//! SQLite persistence for sync jobs and the delivery audit trail.
//!
//! A single [`LinkStore`] wraps one connection behind a mutex. All methods
//! are synchronous; callers on async tasks keep operations short and never
//! hold the lock across an await.

use chrono::{DateTime, Utc};
use ledgerlink_types::error::{LinkError, LinkResult};
use ledgerlink_types::message::{AuditRecord, SyncJob, SyncJobId, SyncJobStatus};
use ledgerlink_types::server::ServerId;
use rusqlite::Connection;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Persistent store for sync jobs and delivery audit records.
#[derive(Clone)]
pub struct LinkStore {
    conn: Arc<Mutex<Connection>>,
}

impl LinkStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> LinkResult<Self> {
        let conn =
            Connection::open(path).map_err(|e| LinkError::Persistence(e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!(path = %path.display(), "Opened link store");
        Ok(store)
    }

    /// Open an in-memory store. Test use only; contents vanish on drop.
    pub fn open_in_memory() -> LinkResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| LinkError::Persistence(e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> LinkResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LinkError::Internal(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_jobs (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                sync_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                result TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_jobs_status ON sync_jobs(status);

            CREATE TABLE IF NOT EXISTS delivery_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                message_type TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                error TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_delivery_audit_recorded
                ON delivery_audit(recorded_at);",
        )
        .map_err(|e| LinkError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Insert or update a sync job. Called on every status transition.
    pub fn save_job(&self, job: &SyncJob) -> LinkResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LinkError::Internal(e.to_string()))?;
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| LinkError::Serialization(e.to_string()))?;
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| LinkError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO sync_jobs (id, source, target, sync_type, payload, status,
                created_at, started_at, completed_at, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET status = ?6, started_at = ?8,
                completed_at = ?9, result = ?10, error = ?11",
            rusqlite::params![
                job.id.to_string(),
                job.source.to_string(),
                job.target.to_string(),
                job.sync_type,
                payload,
                job.status.to_string(),
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                result,
                job.error,
            ],
        )
        .map_err(|e| LinkError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Load a sync job by id.
    pub fn load_job(&self, id: SyncJobId) -> LinkResult<Option<SyncJob>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LinkError::Internal(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, source, target, sync_type, payload, status,
                    created_at, started_at, completed_at, result, error
                 FROM sync_jobs WHERE id = ?1",
            )
            .map_err(|e| LinkError::Persistence(e.to_string()))?;
        let result = stmt.query_row(rusqlite::params![id.to_string()], row_to_job);
        match result {
            Ok(job) => Ok(Some(job?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(LinkError::Persistence(e.to_string())),
        }
    }

    /// List jobs, optionally filtered by status, newest first.
    pub fn list_jobs(&self, status: Option<SyncJobStatus>) -> LinkResult<Vec<SyncJob>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LinkError::Internal(e.to_string()))?;
        let base = "SELECT id, source, target, sync_type, payload, status,
                created_at, started_at, completed_at, result, error
             FROM sync_jobs";
        let mut jobs = Vec::new();
        match status {
            Some(st) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "{base} WHERE status = ?1 ORDER BY created_at DESC"
                    ))
                    .map_err(|e| LinkError::Persistence(e.to_string()))?;
                let rows = stmt
                    .query_map(rusqlite::params![st.to_string()], row_to_job)
                    .map_err(|e| LinkError::Persistence(e.to_string()))?;
                for row in rows {
                    jobs.push(row.map_err(|e| LinkError::Persistence(e.to_string()))??);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("{base} ORDER BY created_at DESC"))
                    .map_err(|e| LinkError::Persistence(e.to_string()))?;
                let rows = stmt
                    .query_map([], row_to_job)
                    .map_err(|e| LinkError::Persistence(e.to_string()))?;
                for row in rows {
                    jobs.push(row.map_err(|e| LinkError::Persistence(e.to_string()))??);
                }
            }
        }
        Ok(jobs)
    }

    /// Append a delivery audit record.
    pub fn append_audit(&self, record: &AuditRecord) -> LinkResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LinkError::Internal(e.to_string()))?;
        conn.execute(
            "INSERT INTO delivery_audit (source, target, message_type, status,
                attempts, error, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.source.to_string(),
                record.target.to_string(),
                record.message_type.to_string(),
                record.status.to_string(),
                record.attempts,
                record.error,
                record.recorded_at.to_rfc3339(),
            ],
        )
        .map_err(|e| LinkError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// The most recent audit records, newest first.
    pub fn recent_audit(&self, limit: usize) -> LinkResult<Vec<AuditRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LinkError::Internal(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT source, target, message_type, status, attempts, error, recorded_at
                 FROM delivery_audit ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| LinkError::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                let source: String = row.get(0)?;
                let target: String = row.get(1)?;
                let message_type: String = row.get(2)?;
                let status: String = row.get(3)?;
                let attempts: u32 = row.get(4)?;
                let error: Option<String> = row.get(5)?;
                let recorded_at: String = row.get(6)?;
                Ok((
                    source,
                    target,
                    message_type,
                    status,
                    attempts,
                    error,
                    recorded_at,
                ))
            })
            .map_err(|e| LinkError::Persistence(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let (source, target, message_type, status, attempts, error, recorded_at) =
                row.map_err(|e| LinkError::Persistence(e.to_string()))?;
            records.push(AuditRecord {
                source: parse_field(&source, "source")?,
                target: parse_field(&target, "target")?,
                message_type: message_type
                    .parse()
                    .map_err(LinkError::Persistence)?,
                status: status.parse().map_err(LinkError::Persistence)?,
                attempts,
                error,
                recorded_at: parse_timestamp(&recorded_at)?,
            });
        }
        Ok(records)
    }

    /// Total number of audit records.
    pub fn audit_count(&self) -> LinkResult<u64> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LinkError::Internal(e.to_string()))?;
        conn.query_row("SELECT COUNT(*) FROM delivery_audit", [], |row| row.get(0))
            .map_err(|e| LinkError::Persistence(e.to_string()))
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<LinkResult<SyncJob>> {
    let id: String = row.get(0)?;
    let source: String = row.get(1)?;
    let target: String = row.get(2)?;
    let sync_type: String = row.get(3)?;
    let payload: String = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let started_at: Option<String> = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;
    let result: Option<String> = row.get(9)?;
    let error: Option<String> = row.get(10)?;

    Ok(build_job(
        id,
        source,
        target,
        sync_type,
        payload,
        status,
        created_at,
        started_at,
        completed_at,
        result,
        error,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_job(
    id: String,
    source: String,
    target: String,
    sync_type: String,
    payload: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result: Option<String>,
    error: Option<String>,
) -> LinkResult<SyncJob> {
    Ok(SyncJob {
        id: SyncJobId::from_str(&id).map_err(|e| LinkError::Persistence(e.to_string()))?,
        source: parse_field(&source, "source")?,
        target: parse_field(&target, "target")?,
        sync_type,
        payload: serde_json::from_str(&payload)
            .map_err(|e| LinkError::Serialization(e.to_string()))?,
        status: status.parse().map_err(LinkError::Persistence)?,
        created_at: parse_timestamp(&created_at)?,
        started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        result: result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| LinkError::Serialization(e.to_string()))?,
        error,
    })
}

fn parse_field(s: &str, field: &str) -> LinkResult<ServerId> {
    s.parse()
        .map_err(|e| LinkError::Persistence(format!("bad {field} column: {e}")))
}

fn parse_timestamp(s: &str) -> LinkResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LinkError::Persistence(format!("bad timestamp column: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerlink_types::message::MessageStatus;
    use ledgerlink_types::message::MessageType;

    fn sample_job() -> SyncJob {
        SyncJob::new(
            ServerId::new(),
            ServerId::new(),
            "customer_usage",
            serde_json::json!({"rows": 3}),
        )
    }

    #[test]
    fn test_save_and_load_job() {
        let store = LinkStore::open_in_memory().unwrap();
        let job = sample_job();
        store.save_job(&job).unwrap();

        let loaded = store.load_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, SyncJobStatus::Scheduled);
        assert_eq!(loaded.sync_type, "customer_usage");
        assert_eq!(loaded.payload, job.payload);
    }

    #[test]
    fn test_load_missing_job() {
        let store = LinkStore::open_in_memory().unwrap();
        assert!(store.load_job(SyncJobId::new()).unwrap().is_none());
    }

    #[test]
    fn test_save_job_upserts_transitions() {
        let store = LinkStore::open_in_memory().unwrap();
        let mut job = sample_job();
        store.save_job(&job).unwrap();

        job.status = SyncJobStatus::InProgress;
        job.started_at = Some(Utc::now());
        store.save_job(&job).unwrap();

        job.status = SyncJobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result = Some(serde_json::json!({"accepted": true}));
        store.save_job(&job).unwrap();

        let loaded = store.load_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, SyncJobStatus::Completed);
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.result, Some(serde_json::json!({"accepted": true})));
    }

    #[test]
    fn test_list_jobs_filters_by_status() {
        let store = LinkStore::open_in_memory().unwrap();
        let scheduled = sample_job();
        store.save_job(&scheduled).unwrap();

        let mut failed = sample_job();
        failed.status = SyncJobStatus::Failed;
        failed.error = Some("timeout".to_string());
        store.save_job(&failed).unwrap();

        assert_eq!(store.list_jobs(None).unwrap().len(), 2);
        let only_failed = store.list_jobs(Some(SyncJobStatus::Failed)).unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].id, failed.id);
    }

    #[test]
    fn test_audit_append_and_query() {
        let store = LinkStore::open_in_memory().unwrap();
        let source = ServerId::new();
        let target = ServerId::new();

        for i in 0..3 {
            store
                .append_audit(&AuditRecord {
                    source,
                    target,
                    message_type: MessageType::Heartbeat,
                    status: if i == 2 {
                        MessageStatus::Failed
                    } else {
                        MessageStatus::Success
                    },
                    attempts: i + 1,
                    error: None,
                    recorded_at: Utc::now(),
                })
                .unwrap();
        }

        assert_eq!(store.audit_count().unwrap(), 3);
        let recent = store.recent_audit(2).unwrap();
        assert_eq!(recent.len(), 2);
        // Newest first.
        assert_eq!(recent[0].status, MessageStatus::Failed);
        assert_eq!(recent[0].attempts, 3);
    }

    #[test]
    fn test_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.db");
        let job = sample_job();

        {
            let store = LinkStore::open(&path).unwrap();
            let mut in_progress = job.clone();
            in_progress.status = SyncJobStatus::InProgress;
            in_progress.started_at = Some(Utc::now());
            store.save_job(&in_progress).unwrap();
        }

        // Fresh process over the same file sees the persisted state.
        let store = LinkStore::open(&path).unwrap();
        let loaded = store.load_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, SyncJobStatus::InProgress);
    }
}
