//! Process supervision — graceful shutdown and background-loop health.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{error, info};

/// Shutdown signal manager with loop health tracking.
pub struct Supervisor {
    /// Send side of the shutdown signal.
    shutdown_tx: watch::Sender<bool>,
    /// Receive side of the shutdown signal (clonable).
    shutdown_rx: watch::Receiver<bool>,
    /// Liveness of each registered background loop, by name.
    loops: DashMap<String, bool>,
    /// Loops that exited without a shutdown request.
    unexpected_exits: AtomicU64,
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
            loops: DashMap::new(),
            unexpected_exits: AtomicU64::new(0),
        }
    }

    /// Get a receiver that will be notified on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger a graceful shutdown.
    pub fn shutdown(&self) {
        info!("Supervisor: initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Register a background loop as alive.
    pub fn register_loop(&self, name: impl Into<String>) {
        let name = name.into();
        info!(name = %name, "Registered background loop");
        self.loops.insert(name, true);
    }

    /// Record that a loop exited.
    ///
    /// An exit while shutdown is in progress is expected; any other exit is
    /// counted and logged at error level.
    pub fn record_loop_exit(&self, name: &str) {
        if let Some(mut alive) = self.loops.get_mut(name) {
            *alive = false;
        }
        if !self.is_shutting_down() {
            self.unexpected_exits.fetch_add(1, Ordering::Relaxed);
            error!(name = %name, "Background loop exited unexpectedly");
        } else {
            info!(name = %name, "Background loop stopped");
        }
    }

    /// Number of registered loops still alive.
    pub fn loops_alive(&self) -> usize {
        self.loops.iter().filter(|entry| *entry.value()).count()
    }

    /// Total loops that exited without a shutdown request.
    pub fn unexpected_exit_count(&self) -> u64 {
        self.unexpected_exits.load(Ordering::Relaxed)
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown() {
        let supervisor = Supervisor::new();
        assert!(!supervisor.is_shutting_down());
        supervisor.shutdown();
        assert!(supervisor.is_shutting_down());
    }

    #[test]
    fn test_subscribe() {
        let supervisor = Supervisor::new();
        let rx = supervisor.subscribe();
        assert!(!*rx.borrow());
        supervisor.shutdown();
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_loop_health() {
        let supervisor = Supervisor::new();
        supervisor.register_loop("delivery");
        supervisor.register_loop("heartbeat");
        assert_eq!(supervisor.loops_alive(), 2);

        // Exit before shutdown counts as unexpected.
        supervisor.record_loop_exit("delivery");
        assert_eq!(supervisor.loops_alive(), 1);
        assert_eq!(supervisor.unexpected_exit_count(), 1);

        // Exit during shutdown does not.
        supervisor.shutdown();
        supervisor.record_loop_exit("heartbeat");
        assert_eq!(supervisor.loops_alive(), 0);
        assert_eq!(supervisor.unexpected_exit_count(), 1);
    }
}
