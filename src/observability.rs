//! Tracing setup and process-wide counters

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    commands_dispatched: AtomicU64,
    state_changes: AtomicU64,
    files_transferred: AtomicU64,
    harvest_runs: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "commands_dispatched", "Metric incremented");
    }

    pub fn state_changed(&self) {
        self.state_changes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "state_changes", "Metric incremented");
    }

    pub fn file_transferred(&self) {
        self.files_transferred.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "files_transferred", "Metric incremented");
    }

    pub fn harvest_started(&self) {
        self.harvest_runs.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "harvest_runs", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            files_transferred: self.files_transferred.load(Ordering::Relaxed),
            harvest_runs: self.harvest_runs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub commands_dispatched: u64,
    pub state_changes: u64,
    pub files_transferred: u64,
    pub harvest_runs: u64,
}
