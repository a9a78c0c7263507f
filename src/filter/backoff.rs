//! Pause between retry attempts.

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How long to wait before replaying a conflicted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Yield the thread and retry immediately.
    Yield,
    /// `base * 2^(attempt - 1)`, capped at `max`. With `jitter` the actual
    /// pause is drawn uniformly from the upper half of that window.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        jitter: bool,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 2,
            max_ms: 100,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the pause after the given failed attempt (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Yield => Duration::ZERO,
            BackoffPolicy::Exponential { base_ms, max_ms, .. } => {
                let shift = attempt.saturating_sub(1).min(32);
                let ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }

    /// The pause after the given failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        match *self {
            BackoffPolicy::Exponential { jitter: true, .. } if !ceiling.is_zero() => {
                let half = ceiling / 2;
                let spread = (ceiling - half).as_micros() as u64;
                half + Duration::from_micros(rand::thread_rng().gen_range(0..=spread))
            }
            _ => ceiling,
        }
    }

    /// Block the current thread before the next attempt.
    pub fn pause(&self, attempt: u32) {
        match self {
            BackoffPolicy::Yield => thread::yield_now(),
            _ => {
                let delay = self.delay(attempt);
                if delay.is_zero() {
                    thread::yield_now();
                } else {
                    thread::sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = BackoffPolicy::Exponential {
            base_ms: 5,
            max_ms: 30,
            jitter: false,
        };
        let delays: Vec<u64> = (1..=5).map(|a| policy.delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
        assert_eq!(policy.delay(200), Duration::from_millis(30));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let policy = BackoffPolicy::Exponential {
            base_ms: 8,
            max_ms: 64,
            jitter: true,
        };
        for attempt in 1..=8 {
            let ceiling = policy.ceiling(attempt);
            for _ in 0..20 {
                let delay = policy.delay(attempt);
                assert!(delay >= ceiling / 2 && delay <= ceiling, "{:?}", delay);
            }
        }
    }

    #[test]
    fn test_yield_has_no_delay() {
        assert_eq!(BackoffPolicy::Yield.delay(3), Duration::ZERO);
        BackoffPolicy::Yield.pause(1);
    }

    #[test]
    fn test_serde_shape() {
        let policy: BackoffPolicy = serde_json::from_str(r#"{"kind":"yield"}"#).unwrap();
        assert_eq!(policy, BackoffPolicy::Yield);

        let json = serde_json::to_value(BackoffPolicy::default()).unwrap();
        assert_eq!(json["kind"], "exponential");
        assert_eq!(json["max_ms"], 100);
    }
}
