//! Monotonic and wall-clock time access behind a single seam.
//!
//! IdleMgr's threshold math and LTO's per-unit deadlines both need "now", and
//! both need to be driven by a fake clock in tests (spec §9 notes IdleMgr's
//! invariants are quantified purely in terms of `now - last_activity_ts`).
//! Everything that would otherwise call `Instant::now()`/`Utc::now()` takes an
//! `Arc<dyn Clock>` instead.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_monotonic(&self) -> Instant;
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Production clock backed by the real OS clocks.
#[derive(Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }

    pub fn into_arc(self) -> Arc<dyn Clock> {
        Arc::new(self)
    }
}

impl Clock for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests: starts pinned at construction time and only
/// advances when `advance`/`set_millis_since_start` is called.
#[derive(Debug)]
pub struct ManualClock {
    origin_instant: Instant,
    origin_utc: DateTime<Utc>,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin_instant: Instant::now(),
            origin_utc: Utc::now(),
            offset_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.offset_ms
            .fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set_millis_since_start(&self, millis: i64) {
        self.offset_ms.store(millis, Ordering::SeqCst);
    }

    pub fn into_arc(self) -> Arc<dyn Clock> {
        Arc::new(self)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_monotonic(&self) -> Instant {
        let offset = self.offset_ms.load(Ordering::SeqCst);
        self.origin_instant + Duration::from_millis(offset.max(0) as u64)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.origin_utc + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}
