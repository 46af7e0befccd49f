use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Point on the host clock, in nanoseconds since the clock's origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostTime(pub u64);

impl HostTime {
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn saturating_duration_since(&self, earlier: HostTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for HostTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Source of the timestamps stamped onto outgoing frames.
///
/// Frames carry the time they were actually sent, never a nominal schedule.
pub trait HostClock: Send + Sync {
    fn now(&self) -> HostTime;
}

/// Monotonic clock anchored at its construction.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::start()
    }
}

impl HostClock for MonotonicClock {
    fn now(&self) -> HostTime {
        HostTime(self.origin.elapsed().as_nanos() as u64)
    }
}

/// Clock that only moves when told to. Used by tests and offline tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start: HostTime) -> Self {
        Self {
            nanos: AtomicU64::new(start.0),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.nanos.fetch_add(delta.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> HostTime {
        HostTime(self.nanos.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::start();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn manual_clock_advances_on_request() {
        let clock = ManualClock::new(HostTime::from_nanos(10));
        clock.advance(Duration::from_micros(1));
        assert_eq!(clock.now(), HostTime(1_010));
        assert_eq!(
            clock.now().saturating_duration_since(HostTime(10)),
            Duration::from_micros(1)
        );
    }
}
