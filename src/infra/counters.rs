//! Lock-free per-port counters and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention; the
//! port engine logs a summary line on a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Lock-free counter set, one per port engine.
#[derive(Default)]
pub struct PortCounters {
    /// Valid packets emitted by the framer (monotonic)
    packets_framed: AtomicU64,
    /// Bytes discarded during resync (monotonic)
    bytes_dropped: AtomicU64,
    /// Retained state publishes (monotonic)
    state_publishes: AtomicU64,
    /// Commands written to the transport (monotonic)
    commands_sent: AtomicU64,
    /// Commands that exhausted their ACK retries (monotonic)
    ack_failures: AtomicU64,
    /// Automation runs started (monotonic)
    automation_runs: AtomicU64,
}

impl PortCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_packet(&self) {
        self.packets_framed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_bytes(&self, n: u64) {
        self.bytes_dropped.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_state_publish(&self) {
        self.state_publishes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_automation_run(&self) {
        self.automation_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_framed(&self) -> u64 {
        self.packets_framed.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> CountersSummary {
        CountersSummary {
            packets_framed: self.packets_framed.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            state_publishes: self.state_publishes.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            automation_runs: self.automation_runs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSummary {
    pub packets_framed: u64,
    pub bytes_dropped: u64,
    pub state_publishes: u64,
    pub commands_sent: u64,
    pub ack_failures: u64,
    pub automation_runs: u64,
}

impl CountersSummary {
    pub fn log(&self, port_id: &str) {
        info!(
            port_id = %port_id,
            packets = %self.packets_framed,
            dropped_bytes = %self.bytes_dropped,
            publishes = %self.state_publishes,
            commands = %self.commands_sent,
            ack_failures = %self.ack_failures,
            automation_runs = %self.automation_runs,
            "port_counters"
        );
    }
}
