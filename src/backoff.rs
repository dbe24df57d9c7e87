use std::time::{Duration, Instant};

use rand::TryRngCore;
use rand::rngs::OsRng;

use crate::config::RetryPolicy;

pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Exponential backoff with jitter.
/// Based on https://www.awsarchitectureblog.com/2015/03/backoff.html.
pub(crate) struct RetryBackoff {
    attempt: u32,
    base_ms: u64,
    cap_ms: u64,
}

impl RetryBackoff {
    pub(crate) fn new(cap: Duration) -> Self {
        let cap_ms = cap.as_millis() as u64;
        Self {
            attempt: 0,
            base_ms: cap_ms.min(10),
            cap_ms,
        }
    }

    fn next_wait(&mut self) -> Duration {
        let shift = self.attempt.min(63);
        let max_wait = self.cap_ms.min(self.base_ms.saturating_mul(1u64 << shift));
        let wait_ms = if max_wait > 0 {
            OsRng.try_next_u64().unwrap_or(0) % max_wait
        } else {
            0
        };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(wait_ms)
    }

    pub(crate) fn wait(&mut self, clock: &dyn Clock) {
        let wait = self.next_wait();
        clock.sleep(wait);
    }
}

/// Bounds a retry loop by wall-clock time as seen through a `Clock`.
pub(crate) struct Deadline<'a> {
    clock: &'a dyn Clock,
    end: Instant,
    backoff: RetryBackoff,
}

impl<'a> Deadline<'a> {
    pub(crate) fn new(clock: &'a dyn Clock, policy: &RetryPolicy) -> Self {
        Self {
            clock,
            end: clock.now() + policy.max_duration(),
            backoff: RetryBackoff::new(policy.cap()),
        }
    }

    pub(crate) fn expired(&self) -> bool {
        self.clock.now() >= self.end
    }

    // Sleep before the next try. The sleep always advances the clock by at
    // least one millisecond so a loop over a zero-cap policy still ends.
    pub(crate) fn wait(&mut self) {
        let wait = self.backoff.next_wait().max(Duration::from_millis(1));
        self.clock.sleep(wait);
    }
}
