//! Time source abstraction.
//!
//! Every component that reads the time or sleeps goes through [`Clock`], so
//! window rollovers, circuit timeouts and backoff waits can be driven by a
//! [`ManualClock`] in tests.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `Utc::now` and tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when told to.
///
/// `sleep` advances the clock by the requested duration and yields once, so
/// code waiting on a backoff completes immediately with time moved forward.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    fn lock_now(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(|poisoned| {
            warn!("Manual clock lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn advance(&self, duration: Duration) {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let mut now = self.lock_now();
        *now = saturating_add(*now, delta);
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.lock_now() = instant;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock_now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// `at + delta`, pinned to the representable range instead of overflowing.
pub fn saturating_add(at: DateTime<Utc>, delta: chrono::Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(if delta < chrono::Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Milliseconds from `earlier` to `later`, zero if `later` is not after it.
pub fn millis_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    (later - earlier).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(61));
        assert_eq!(millis_between(start, clock.now()), 61_000);
    }

    #[tokio::test]
    async fn test_manual_sleep_moves_time_forward() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.sleep(Duration::from_millis(1500)).await;
        assert_eq!(millis_between(start, clock.now()), 1500);
    }

    #[test]
    fn test_saturating_add_pins_to_range() {
        let now = Utc::now();
        assert_eq!(saturating_add(now, chrono::Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(saturating_add(now, chrono::Duration::MIN), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            saturating_add(now, chrono::Duration::seconds(1)),
            now + chrono::Duration::seconds(1)
        );
    }

    #[test]
    fn test_manual_clock_advance_saturates() {
        let clock = ManualClock::new(Utc::now());
        clock.advance(Duration::from_secs(u64::MAX));
        assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_manual_clock_survives_poisoned_lock() {
        let start = Utc::now();
        let clock = std::sync::Arc::new(ManualClock::new(start));
        let poisoner = clock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.now.lock().unwrap();
            panic!("poison the clock");
        })
        .join();

        clock.advance(Duration::from_secs(1));
        assert_eq!(millis_between(start, clock.now()), 1000);
    }

    #[test]
    fn test_millis_between_never_negative() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(5);
        assert_eq!(millis_between(now, earlier), 0);
    }
}
