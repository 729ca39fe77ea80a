//! Message and sync-job types for inter-server delivery.

use crate::server::{ServerId, ServerRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a new random MessageId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Heartbeat,
    Registration,
    SyncRequest,
    SyncResponse,
    LicenseCheck,
    MetricsReport,
    ErrorNotification,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Registration => "registration",
            MessageType::SyncRequest => "sync_request",
            MessageType::SyncResponse => "sync_response",
            MessageType::LicenseCheck => "license_check",
            MessageType::MetricsReport => "metrics_report",
            MessageType::ErrorNotification => "error_notification",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heartbeat" => Ok(MessageType::Heartbeat),
            "registration" => Ok(MessageType::Registration),
            "sync_request" => Ok(MessageType::SyncRequest),
            "sync_response" => Ok(MessageType::SyncResponse),
            "license_check" => Ok(MessageType::LicenseCheck),
            "metrics_report" => Ok(MessageType::MetricsReport),
            "error_notification" => Ok(MessageType::ErrorNotification),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Delivery state of a queued message.
///
/// `Pending` messages are eligible for the next drain. A failed attempt moves
/// the message to `Retry` until its backoff deadline passes. `Success` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Retry,
    Success,
    Failed,
}

impl MessageStatus {
    /// Whether no further delivery attempts will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Success | MessageStatus::Failed)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Retry => "retry",
            MessageStatus::Success => "success",
            MessageStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "retry" => Ok(MessageStatus::Retry),
            "success" => Ok(MessageStatus::Success),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// A message owned by the delivery queue.
///
/// Once the message reaches a terminal state it is written to the audit sink
/// and dropped from memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationMessage {
    pub id: MessageId,
    pub message_type: MessageType,
    pub source: ServerId,
    pub target: ServerId,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    /// Delivery attempts made so far. Never exceeds `max_attempts`.
    pub attempts: u32,
    /// Attempt ceiling for this message.
    pub max_attempts: u32,
    /// Earliest time the next delivery attempt may run.
    pub not_before: DateTime<Utc>,
    /// Response body from the successful delivery, if any.
    pub response: Option<serde_json::Value>,
    /// Error string from the last failed attempt, if any.
    pub error: Option<String>,
}

impl CommunicationMessage {
    /// Build a new pending message.
    pub fn new(
        message_type: MessageType,
        source: ServerId,
        target: ServerId,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            message_type,
            source,
            target,
            payload,
            created_at: now,
            status: MessageStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            not_before: now,
            response: None,
            error: None,
        }
    }
}

/// Unique identifier for a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncJobId(pub Uuid);

impl SyncJobId {
    /// Generate a new random SyncJobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SyncJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SyncJobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a sync job.
///
/// Transitions only move forward: SCHEDULED → IN_PROGRESS → {COMPLETED |
/// FAILED}, or SCHEDULED → CANCELLED before execution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SyncJobStatus {
    /// Whether the job has finished (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncJobStatus::Completed | SyncJobStatus::Failed | SyncJobStatus::Cancelled
        )
    }

    /// Whether moving to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: SyncJobStatus) -> bool {
        match (self, next) {
            (SyncJobStatus::Scheduled, SyncJobStatus::InProgress) => true,
            (SyncJobStatus::Scheduled, SyncJobStatus::Cancelled) => true,
            (SyncJobStatus::InProgress, SyncJobStatus::Completed) => true,
            (SyncJobStatus::InProgress, SyncJobStatus::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SyncJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncJobStatus::Scheduled => "scheduled",
            SyncJobStatus::InProgress => "in_progress",
            SyncJobStatus::Completed => "completed",
            SyncJobStatus::Failed => "failed",
            SyncJobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SyncJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SyncJobStatus::Scheduled),
            "in_progress" => Ok(SyncJobStatus::InProgress),
            "completed" => Ok(SyncJobStatus::Completed),
            "failed" => Ok(SyncJobStatus::Failed),
            "cancelled" => Ok(SyncJobStatus::Cancelled),
            other => Err(format!("unknown sync job status: {other}")),
        }
    }
}

/// An async unit transmitting a data snapshot to a counterpart server.
///
/// Persisted on every transition so state survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: SyncJobId,
    pub source: ServerId,
    pub target: ServerId,
    /// Tag describing what data this job carries (e.g. "customer_usage").
    pub sync_type: String,
    pub payload: serde_json::Value,
    pub status: SyncJobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Receiver response recorded on completion.
    pub result: Option<serde_json::Value>,
    /// Error message recorded on failure.
    pub error: Option<String>,
}

impl SyncJob {
    /// Build a new scheduled job.
    pub fn new(
        source: ServerId,
        target: ServerId,
        sync_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: SyncJobId::new(),
            source,
            target,
            sync_type: sync_type.into(),
            payload,
            status: SyncJobStatus::Scheduled,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// One row in the append-only delivery audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub source: ServerId,
    pub target: ServerId,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate communication snapshot for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationStatus {
    pub server_id: ServerId,
    pub role: ServerRole,
    pub pending_messages: usize,
    pub retry_messages: usize,
    pub succeeded_messages: u64,
    pub failed_messages: u64,
    pub active_jobs: usize,
    pub known_servers: usize,
    pub loops_alive: usize,
    pub uptime_secs: u64,
}
