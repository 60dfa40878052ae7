//! Exponential backoff with jitter, tracked per key.

use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// `min(cap, 2^failures) + jitter` seconds, with `jitter` in `[0, 1)`.
pub fn backoff_delay(failures: u32, cap_secs: u64, jitter: f64) -> Duration {
    let exp = 2u64.checked_pow(failures).unwrap_or(u64::MAX);
    Duration::from_secs(exp.min(cap_secs)) + Duration::from_secs_f64(jitter.clamp(0.0, 0.999_999))
}

pub fn jittered_delay(failures: u32, cap_secs: u64) -> Duration {
    backoff_delay(failures, cap_secs, rand::thread_rng().gen::<f64>())
}

#[derive(Debug, Clone, Copy)]
struct FailureState {
    failures: u32,
    until: Instant,
}

/// What a recorded failure did to a key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureOutcome {
    pub failures: u32,
    pub delay: Duration,
    pub circuit_open: bool,
}

/// Consecutive-failure counters and backoff deadlines.
#[derive(Debug)]
pub struct BackoffTracker {
    cap_secs: u64,
    threshold: u32,
    states: HashMap<String, FailureState>,
}

impl BackoffTracker {
    pub fn new(cap_secs: u64, threshold: u32) -> Self {
        Self { cap_secs, threshold, states: HashMap::new() }
    }

    pub fn is_backing_off(&self, key: &str, now: Instant) -> bool {
        self.states.get(key).is_some_and(|s| now < s.until)
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.states.get(key).map_or(0, |s| s.failures)
    }

    pub fn record_success(&mut self, key: &str) {
        self.states.remove(key);
    }

    pub fn record_failure(&mut self, key: &str, now: Instant) -> FailureOutcome {
        let failures = self.failures(key).saturating_add(1);
        let delay = jittered_delay(failures, self.cap_secs);
        self.states.insert(key.to_string(), FailureState { failures, until: now + delay });
        FailureOutcome { failures, delay, circuit_open: failures >= self.threshold }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_then_caps() {
        let delays: Vec<u64> = (1..=10).map(|n| backoff_delay(n, 300, 0.0).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(backoff_delay(200, 300, 0.0).as_secs(), 300);
        let jittered = backoff_delay(1, 300, 0.5);
        assert_eq!(jittered, Duration::from_millis(2_500));
    }

    #[test]
    fn failure_sets_deadline_and_success_resets() {
        let mut tracker = BackoffTracker::new(300, 3);
        let now = Instant::now();
        assert!(!tracker.is_backing_off("m1", now));

        let first = tracker.record_failure("m1", now);
        assert_eq!(first.failures, 1);
        assert!(first.delay >= Duration::from_secs(2) && first.delay < Duration::from_secs(3));
        assert!(tracker.is_backing_off("m1", now));
        assert!(!tracker.is_backing_off("m1", now + Duration::from_secs(3)));

        tracker.record_failure("m1", now);
        let third = tracker.record_failure("m1", now);
        assert!(third.circuit_open);

        tracker.record_success("m1");
        assert_eq!(tracker.failures("m1"), 0);
        assert!(!tracker.is_backing_off("m1", now));
    }
}
