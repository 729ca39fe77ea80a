//! Inter-server communication core.
//!
//! Ties together the signed transport, the at-least-once delivery queue, the
//! server discovery cache, and the sync-job engine under a single
//! [`InterServerComm`] orchestrator that owns the background loops.

pub mod discovery;
pub mod monitor;
pub mod orchestrator;
pub mod supervisor;
pub mod syncjob;
pub mod transport;

pub use discovery::ServerDiscovery;
pub use monitor::{DeliveryQueue, DrainSummary};
pub use orchestrator::{InterServerComm, PendingReply};
pub use supervisor::Supervisor;
pub use syncjob::SyncEngine;
pub use transport::{HttpTransport, MessageTransport};
