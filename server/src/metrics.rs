use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the core pipeline, served as a JSON snapshot.
#[derive(Default)]
pub struct ArenaMetrics {
    payments_confirmed: AtomicU64,
    outcomes_recorded: AtomicU64,
    ascensions: AtomicU64,
    payouts_sent: AtomicU64,
    payouts_failed: AtomicU64,
    records_dropped: AtomicU64,
    bridge_connects: AtomicU64,
    bridge_idle_timeouts: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub payments_confirmed: u64,
    pub outcomes_recorded: u64,
    pub ascensions: u64,
    pub payouts_sent: u64,
    pub payouts_failed: u64,
    pub records_dropped: u64,
    pub bridge_connects: u64,
    pub bridge_idle_timeouts: u64,
}

impl ArenaMetrics {
    pub fn inc_payments_confirmed(&self) {
        self.payments_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_outcomes_recorded(&self) {
        self.outcomes_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ascensions(&self) {
        self.ascensions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_payouts_sent(&self) {
        self.payouts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_payouts_failed(&self) {
        self.payouts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_records_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bridge_connects(&self) {
        self.bridge_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bridge_idle_timeouts(&self) {
        self.bridge_idle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            payments_confirmed: self.payments_confirmed.load(Ordering::Relaxed),
            outcomes_recorded: self.outcomes_recorded.load(Ordering::Relaxed),
            ascensions: self.ascensions.load(Ordering::Relaxed),
            payouts_sent: self.payouts_sent.load(Ordering::Relaxed),
            payouts_failed: self.payouts_failed.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            bridge_connects: self.bridge_connects.load(Ordering::Relaxed),
            bridge_idle_timeouts: self.bridge_idle_timeouts.load(Ordering::Relaxed),
        }
    }
}
