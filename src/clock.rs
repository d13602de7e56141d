//! Injectable clock so the state machine, recovery sweep, and idle reaper
//! can be driven deterministically in tests (design note: no process-wide
//! global state).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// A source of "now". Production code uses [`SystemClock`]; tests use
/// [`FixedClock`] or [`SteppedClock`] to control time without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time via `chrono::Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to one instant, movable with [`FixedClock::advance`].
pub struct FixedClock {
    inner: parking_lot::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(at),
        })
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        *self.inner.lock() += delta;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.inner.lock() = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
