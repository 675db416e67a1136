//! Injectable wall + monotonic time source (spec §2, §9).
//!
//! Every age/ordering computation in the core goes through a `Clock` instead
//! of calling `Instant::now()`/`SystemTime::now()` directly, so tests can
//! drive time deterministically with `ManualClock`.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync + 'static {
    /// Nanoseconds on a monotonic source. Only differences between two calls
    /// are meaningful.
    fn mono_ns(&self) -> u64;

    /// ISO-8601 wall-clock timestamp, display only (§3).
    fn wall_iso8601(&self) -> String;
}

/// Real clock backed by `std::time`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn mono_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn wall_iso8601(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        iso8601(now.as_secs(), now.subsec_millis())
    }
}

fn iso8601(secs: u64, millis: u32) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(secs as i64, millis * 1_000_000)
        .single()
        .unwrap_or_else(Utc::now);
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Test double: an `AtomicU64` nanosecond counter advanced explicitly by
/// tests, mirroring the teacher's mock transport doubles but applied to
/// time instead of sockets.
#[derive(Debug, Clone)]
pub struct ManualClock {
    mono: Arc<AtomicU64>,
    wall_secs: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            mono: Arc::new(AtomicU64::new(0)),
            wall_secs: Arc::new(AtomicU64::new(1_800_000_000)),
        }
    }

    pub fn advance_ns(&self, delta: u64) {
        self.mono.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance(&self, duration: std::time::Duration) {
        self.advance_ns(duration.as_nanos() as u64);
    }

    pub fn set_mono_ns(&self, value: u64) {
        self.mono.store(value, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn mono_ns(&self) -> u64 {
        self.mono.load(Ordering::SeqCst)
    }

    fn wall_iso8601(&self) -> String {
        let secs = self.wall_secs.load(Ordering::SeqCst) + self.mono_ns() / 1_000_000_000;
        iso8601(secs, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_deterministically() {
        let clock = ManualClock::new();
        assert_eq!(clock.mono_ns(), 0);
        clock.advance(std::time::Duration::from_millis(5));
        assert_eq!(clock.mono_ns(), 5_000_000);
    }

    #[test]
    fn wall_iso8601_has_expected_shape() {
        let clock = ManualClock::new();
        let s = clock.wall_iso8601();
        assert_eq!(s.len(), 24);
        assert!(s.ends_with('Z'));
    }
}
