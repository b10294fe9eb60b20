use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::model::UnixTimeMs;

/// Wall-clock source. Countdown math uses wall-clock differences so it
/// survives the process being suspended.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.0, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

/// Wall clock anchored at `epoch` and advanced by tokio's monotonic clock,
/// so it follows paused time in tests.
#[derive(Debug)]
pub struct InstantClock {
    epoch: UnixTimeMs,
    origin: tokio::time::Instant,
}

impl InstantClock {
    pub fn new(epoch: UnixTimeMs) -> Self {
        Self {
            epoch,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for InstantClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(
            self.epoch
                .0
                .saturating_add(self.origin.elapsed().as_millis() as u64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(UnixTimeMs(1_000));
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now(), UnixTimeMs(3_000));
        clock.set(UnixTimeMs(10));
        assert_eq!(clock.now(), UnixTimeMs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn instant_clock_follows_paused_time() {
        let clock = InstantClock::new(UnixTimeMs(5_000));
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), UnixTimeMs(95_000));
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now().0 > 1_577_836_800_000);
    }
}
