//! Rate gate in front of the registry.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::state::NotKeyed;
use governor::{Quota, RateLimiter};

use crate::error::ResolutionError;

type DirectLimiter =
    RateLimiter<NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Admits at most one request per interval, with no burst.
///
/// One pacer belongs to one coordinator; every attempt, retries included,
/// must pass through [`RequestPacer::acquire`].
pub struct RequestPacer {
    limiter: DirectLimiter,
    interval: Duration,
    poll_step: Duration,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Result<Self, ResolutionError> {
        let quota = Quota::with_period(interval)
            .ok_or_else(|| {
                ResolutionError::Pacing(format!("request interval must be non-zero: {interval:?}"))
            })?
            .allow_burst(NonZeroU32::MIN);
        let poll_step = (interval / 20).clamp(Duration::from_millis(1), Duration::from_millis(50));
        Ok(Self {
            limiter: RateLimiter::direct(quota),
            interval,
            poll_step,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Blocks until a request slot is free.
    ///
    /// Returns `false` without consuming a slot when `deadline` passes first.
    pub fn acquire(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.limiter.check().is_ok() {
                return true;
            }
            let now = Instant::now();
            let step = match deadline {
                Some(deadline) if now >= deadline => return false,
                Some(deadline) => self.poll_step.min(deadline - now),
                None => self.poll_step,
            };
            std::thread::sleep(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RequestPacer;
    use std::time::{Duration, Instant};

    #[test]
    fn test_zero_interval_is_rejected() {
        assert!(RequestPacer::new(Duration::ZERO).is_err());
    }

    #[test]
    fn test_consecutive_acquisitions_are_spaced_by_interval() {
        let interval = Duration::from_millis(40);
        let pacer = RequestPacer::new(interval).expect("pacer should build");

        let mut admitted = Vec::new();
        for _ in 0..4 {
            assert!(pacer.acquire(None));
            admitted.push(Instant::now());
        }
        for pair in admitted.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap + Duration::from_millis(2) >= interval,
                "gap {gap:?} shorter than interval {interval:?}"
            );
        }
    }

    #[test]
    fn test_acquire_gives_up_at_deadline() {
        let pacer = RequestPacer::new(Duration::from_secs(60)).expect("pacer should build");
        assert!(pacer.acquire(None));

        let started = Instant::now();
        let deadline = started + Duration::from_millis(30);
        assert!(!pacer.acquire(Some(deadline)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
