//! Shared metrics — atomic counters for observability.
//!
//! Wrapped in `Arc<Metrics>` and passed to the host registry, scheduler,
//! client, and connection handler. No external crate needed — we format
//! Prometheus exposition text manually, matching the teacher's `metrics.rs`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared metrics counters, all lock-free via AtomicU64.
pub struct Metrics {
    // ─── Connections ─────────────────────────────────────────────────────
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,

    // ─── Host pool ───────────────────────────────────────────────────────
    pub host_checkouts: AtomicU64,
    pub host_reuses: AtomicU64,
    pub host_dials: AtomicU64,
    pub host_dial_failures: AtomicU64,
    pub host_throttled: AtomicU64,
    pub host_timeouts: AtomicU64,

    // ─── Scheduler / routing ─────────────────────────────────────────────
    /// Feedback messages dropped because the serializer's channel was full.
    pub feedback_dropped: AtomicU64,
    /// Recovery-probe successes (a downed main host responded again).
    pub recovery_repromotions: AtomicU64,

    // ─── Async tail replication ──────────────────────────────────────────
    /// Tail writes dropped because the background worker's channel was full.
    pub async_tail_dropped: AtomicU64,

    // ─── Client quorum executor ──────────────────────────────────────────
    pub reads_quorum_met: AtomicU64,
    pub reads_quorum_failed: AtomicU64,
    pub writes_quorum_met: AtomicU64,
    pub writes_quorum_failed: AtomicU64,
    pub access_denied: AtomicU64,
}

impl Metrics {
    /// Create a new Metrics instance with zeroed counters.
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            host_checkouts: AtomicU64::new(0),
            host_reuses: AtomicU64::new(0),
            host_dials: AtomicU64::new(0),
            host_dial_failures: AtomicU64::new(0),
            host_throttled: AtomicU64::new(0),
            host_timeouts: AtomicU64::new(0),
            feedback_dropped: AtomicU64::new(0),
            recovery_repromotions: AtomicU64::new(0),
            async_tail_dropped: AtomicU64::new(0),
            reads_quorum_met: AtomicU64::new(0),
            reads_quorum_failed: AtomicU64::new(0),
            writes_quorum_met: AtomicU64::new(0),
            writes_quorum_failed: AtomicU64::new(0),
            access_denied: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1 and return the previous value.
    #[inline]
    pub fn inc(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Decrement a counter by 1 (saturating).
    #[inline]
    pub fn dec(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    /// Renders every counter as Prometheus exposition text, matching the
    /// teacher's hand-written `/metrics` body.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let line = |out: &mut String, name: &str, value: u64| {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        };
        line(&mut out, "cachequorum_connections_total", self.connections_total.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_connections_active", self.connections_active.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_host_checkouts_total", self.host_checkouts.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_host_reuses_total", self.host_reuses.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_host_dials_total", self.host_dials.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_host_dial_failures_total", self.host_dial_failures.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_host_throttled_total", self.host_throttled.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_host_timeouts_total", self.host_timeouts.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_feedback_dropped_total", self.feedback_dropped.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_recovery_repromotions_total", self.recovery_repromotions.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_async_tail_dropped_total", self.async_tail_dropped.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_reads_quorum_met_total", self.reads_quorum_met.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_reads_quorum_failed_total", self.reads_quorum_failed.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_writes_quorum_met_total", self.writes_quorum_met.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_writes_quorum_failed_total", self.writes_quorum_failed.load(Ordering::Relaxed));
        line(&mut out, "cachequorum_access_denied_total", self.access_denied.load(Ordering::Relaxed));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
