//! Global atomic counters for pipeline observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when the daemon drains its input).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    runs_started: AtomicU64,
    runs_deployed: AtomicU64,
    runs_failed: AtomicU64,
    runs_rejected: AtomicU64,
    stage_retries: AtomicU64,
    lock_waits: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_deployed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_rejected: AtomicU64::new(0),
            stage_retries: AtomicU64::new(0),
            lock_waits: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_started", "counter incremented");
    }

    pub fn inc_runs_deployed(&self) {
        self.runs_deployed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_deployed", "counter incremented");
    }

    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_failed", "counter incremented");
    }

    pub fn inc_runs_rejected(&self) {
        self.runs_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_rejected", "counter incremented");
    }

    pub fn inc_stage_retries(&self) {
        self.stage_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stage_retries", "counter incremented");
    }

    /// A run had to queue behind another for the infra lock.
    pub fn inc_lock_waits(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "lock_waits", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_started = self.runs_started(),
            runs_deployed = self.runs_deployed(),
            runs_failed = self.runs_failed(),
            runs_rejected = self.runs_rejected(),
            stage_retries = self.stage_retries(),
            lock_waits = self.lock_waits(),
        );
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_deployed(&self) -> u64 {
        self.runs_deployed.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn runs_rejected(&self) -> u64 {
        self.runs_rejected.load(Ordering::Relaxed)
    }

    pub fn stage_retries(&self) -> u64 {
        self.stage_retries.load(Ordering::Relaxed)
    }

    pub fn lock_waits(&self) -> u64 {
        self.lock_waits.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.runs_started,
            &self.runs_deployed,
            &self.runs_failed,
            &self.runs_rejected,
            &self.stage_retries,
            &self.lock_waits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
