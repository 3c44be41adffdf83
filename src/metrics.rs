//! Process-wide server counters, compiled in with the `metrics` feature.
//!
//! Without the feature every call is an empty inline function and `snapshot` is all
//! zeros, so call sites never need their own `cfg`.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub timeouts: u64,
    pub requests: u64,
    pub responses_2xx: u64,
    pub responses_4xx: u64,
    pub bytes_sent: u64,
    pub open_conns: usize,
    pub max_open_conns: usize,
}

#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    use tracing::info;

    use super::MetricsSnapshot;

    // Admission
    static ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static REJECTED: AtomicU64 = AtomicU64::new(0);
    static CLOSED: AtomicU64 = AtomicU64::new(0);
    static TIMEOUTS: AtomicU64 = AtomicU64::new(0);
    // Throughput
    static REQUESTS: AtomicU64 = AtomicU64::new(0);
    static RESPONSES_2XX: AtomicU64 = AtomicU64::new(0);
    static RESPONSES_4XX: AtomicU64 = AtomicU64::new(0);
    static BYTES_SENT: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static OPEN_CONNS: AtomicUsize = AtomicUsize::new(0);
    static MAX_OPEN_CONNS: AtomicUsize = AtomicUsize::new(0);

    fn update_max(target: &AtomicUsize, value: usize) {
        let mut prev = target.load(Ordering::Relaxed);
        while value > prev {
            match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn inc_accepted() {
        ACCEPTED.fetch_add(1, Ordering::Relaxed);
        let open = OPEN_CONNS.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&MAX_OPEN_CONNS, open);
    }

    pub fn inc_closed() {
        CLOSED.fetch_add(1, Ordering::Relaxed);
        OPEN_CONNS.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_rejected() {
        REJECTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts() {
        TIMEOUTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests() {
        REQUESTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses(code: u16) {
        if code < 300 {
            RESPONSES_2XX.fetch_add(1, Ordering::Relaxed);
        } else {
            RESPONSES_4XX.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_bytes_sent(n: usize) {
        BYTES_SENT.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: ACCEPTED.load(Ordering::Relaxed),
            rejected: REJECTED.load(Ordering::Relaxed),
            closed: CLOSED.load(Ordering::Relaxed),
            timeouts: TIMEOUTS.load(Ordering::Relaxed),
            requests: REQUESTS.load(Ordering::Relaxed),
            responses_2xx: RESPONSES_2XX.load(Ordering::Relaxed),
            responses_4xx: RESPONSES_4XX.load(Ordering::Relaxed),
            bytes_sent: BYTES_SENT.load(Ordering::Relaxed),
            open_conns: OPEN_CONNS.load(Ordering::Relaxed),
            max_open_conns: MAX_OPEN_CONNS.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter(interval: Duration) {
        let spawned = std::thread::Builder::new()
            .name("metrics".into())
            .spawn(move || {
                let mut last = snapshot();
                loop {
                    std::thread::sleep(interval);
                    let snap = snapshot();
                    info!(
                        secs = interval.as_secs(),
                        accepted = snap.accepted.saturating_sub(last.accepted),
                        rejected = snap.rejected.saturating_sub(last.rejected),
                        closed = snap.closed.saturating_sub(last.closed),
                        timeouts = snap.timeouts.saturating_sub(last.timeouts),
                        requests = snap.requests.saturating_sub(last.requests),
                        ok = snap.responses_2xx.saturating_sub(last.responses_2xx),
                        errors = snap.responses_4xx.saturating_sub(last.responses_4xx),
                        bytes = snap.bytes_sent.saturating_sub(last.bytes_sent),
                        open = snap.open_conns,
                        max_open = snap.max_open_conns,
                        "metrics delta"
                    );
                    last = snap;
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("metrics reporter not started: {e}");
        }
    }
}

#[cfg(not(feature = "metrics"))]
mod imp {
    use std::time::Duration;

    use super::MetricsSnapshot;

    pub fn inc_accepted() {}
    pub fn inc_closed() {}
    pub fn inc_rejected() {}
    pub fn inc_timeouts() {}
    pub fn inc_requests() {}
    pub fn inc_responses(_: u16) {}
    pub fn add_bytes_sent(_: usize) {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
    pub fn spawn_reporter(_: Duration) {}
}

pub use imp::*;
