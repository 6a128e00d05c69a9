//! Injected time source.
//!
//! Everything that reads "now" or waits (retry backoff, rate-limit delays)
//! goes through [`Clock`], so tests can observe backoff timing without
//! actually sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `chrono::Utc` and `tokio::time::sleep`
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

#[derive(Debug)]
struct ManualClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

/// Deterministic clock: `sleep` returns immediately, advances `now` and
/// records the requested duration.
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use erp_sync_core::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
/// let clock = ManualClock::new(start);
/// clock.sleep(Duration::from_secs(60)).await;
/// assert_eq!(clock.now(), start + chrono::Duration::minutes(1));
/// assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
/// # });
/// ```
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualClockState>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualClockState {
                now: start,
                sleeps: Vec::new(),
            }),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.now += to_chrono(duration);
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.state.lock().now = now;
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.state.lock().sleeps.iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.state.lock();
            state.now += to_chrono(duration);
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
