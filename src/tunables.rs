//! Process-wide alignment tunables.
//!
//! Settable at startup (from config) or at runtime; readers take one
//! [`Tunables::snapshot`] per aligner iteration. These are hints, not
//! invariants: a racing update simply takes effect next iteration.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Bound on potentially-complete slices tracked per dequeue pass, per second.
static EVENT_RATE_BITS: AtomicU64 = AtomicU64::new(f64::to_bits(20.0));
/// Age in seconds after which a partial slice is force-flushed.
static EVENT_AGE_BITS: AtomicU64 = AtomicU64::new(f64::to_bits(2.5));
/// Holdoff in seconds after delivering a non-empty batch downstream.
static FLUSH_PERIOD_BITS: AtomicU64 = AtomicU64::new(f64::to_bits(2.0));
/// Ingress queue depth for scalar signals.
static SCALAR_DEPTH: AtomicUsize = AtomicUsize::new(130);
/// Ingress queue depth for array signals (element count > 16).
static ARRAY_DEPTH: AtomicUsize = AtomicUsize::new(15);

pub fn set_event_rate(v: f64) {
    EVENT_RATE_BITS.store(v.to_bits(), Ordering::Relaxed);
}

pub fn set_event_age(v: f64) {
    EVENT_AGE_BITS.store(v.to_bits(), Ordering::Relaxed);
}

pub fn set_flush_period(v: f64) {
    FLUSH_PERIOD_BITS.store(v.to_bits(), Ordering::Relaxed);
}

pub fn set_scalar_depth(v: usize) {
    SCALAR_DEPTH.store(v, Ordering::Relaxed);
}

pub fn set_array_depth(v: usize) {
    ARRAY_DEPTH.store(v, Ordering::Relaxed);
}

/// Point-in-time view of all tunables.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    pub event_rate: f64,
    pub event_age: f64,
    pub flush_period: f64,
    pub scalar_depth: usize,
    pub array_depth: usize,
}

impl Tunables {
    pub fn snapshot() -> Self {
        Self {
            event_rate: f64::from_bits(EVENT_RATE_BITS.load(Ordering::Relaxed)),
            event_age: f64::from_bits(EVENT_AGE_BITS.load(Ordering::Relaxed)),
            flush_period: f64::from_bits(FLUSH_PERIOD_BITS.load(Ordering::Relaxed)),
            scalar_depth: SCALAR_DEPTH.load(Ordering::Relaxed),
            array_depth: ARRAY_DEPTH.load(Ordering::Relaxed),
        }
    }

    /// Dequeue-pass bound on tracked slices: `event_rate * flush_period`
    /// clamped to [10, 1000].
    pub fn max_events(&self) -> usize {
        let raw = self.event_rate * self.flush_period;
        raw.clamp(10.0, 1000.0) as usize
    }

    /// `event_age` rendered into the composite key domain, matching the
    /// `(sec << 32) | nsec` layout of alignment keys.
    pub fn event_age_key(&self) -> u64 {
        let age = self.event_age.max(0.0);
        let sec = age.trunc() as u64;
        let nsec = (age.fract() * 1e9) as u64;
        (sec << 32) | nsec
    }

    /// Throttle between downstream deliveries.
    pub fn flush_period_duration(&self) -> Duration {
        Duration::from_secs_f64(self.flush_period.max(0.0))
    }

    /// Ingress queue depth for an update of `count` elements.
    pub fn queue_limit(&self, count: usize) -> usize {
        let depth = if count > 16 {
            self.array_depth
        } else {
            self.scalar_depth
        };
        depth.max(4)
    }
}
