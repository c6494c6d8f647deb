//! Adaptive command timeouts
//!
//! Round-trip estimation in the style of TCP's retransmission timer:
//! a smoothed RTT and its mean deviation per key, combined into a timeout
//! clamped to configured bounds.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Smoothed round-trip state for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttState {
    pub srtt: Duration,
    pub rttvar: Duration,
    pub samples: u64,
}

/// Per-key round-trip estimator (Jacobson/Karels, alpha 1/8, beta 1/4)
#[derive(Debug)]
pub struct RttEstimator<K> {
    entries: HashMap<K, RttState>,
    min_timeout: Duration,
    max_timeout: Duration,
    initial_timeout: Duration,
}

impl<K: Hash + Eq> RttEstimator<K> {
    pub fn new(min_timeout: Duration, max_timeout: Duration, initial_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            min_timeout,
            max_timeout,
            initial_timeout,
        }
    }

    /// Feed one measured round-trip time for a key
    pub fn on_sample(&mut self, key: K, measured: Duration) {
        self.entries
            .entry(key)
            .and_modify(|state| {
                let deviation = if state.srtt > measured {
                    state.srtt - measured
                } else {
                    measured - state.srtt
                };
                state.rttvar = state.rttvar * 3 / 4 + deviation / 4;
                state.srtt = state.srtt * 7 / 8 + measured / 8;
                state.samples += 1;
            })
            .or_insert(RttState {
                srtt: measured,
                rttvar: measured / 2,
                samples: 1,
            });
    }

    /// Timeout for the next exchange on a key, `SRTT + 4 * RTTVAR` clamped
    /// to the configured bounds
    pub fn timeout_for(&self, key: &K) -> Duration {
        let raw = match self.entries.get(key) {
            Some(state) => state.srtt.saturating_add(state.rttvar.saturating_mul(4)),
            None => self.initial_timeout,
        };
        raw.clamp(self.min_timeout, self.max_timeout)
    }

    pub fn state(&self, key: &K) -> Option<RttState> {
        self.entries.get(key).copied()
    }
}

/// Double `base` once per consecutive timeout, never exceeding `cap`
pub fn backoff(base: Duration, consecutive_timeouts: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(consecutive_timeouts).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn estimator() -> RttEstimator<&'static str> {
        RttEstimator::new(ms(100), ms(3000), ms(1000))
    }

    #[test]
    fn test_default_before_any_sample() {
        let est = estimator();
        assert_eq!(est.timeout_for(&"cmd"), ms(1000));
        assert!(est.state(&"cmd").is_none());
    }

    #[test]
    fn test_first_sample_sets_srtt_and_half_variance() {
        let mut est = estimator();
        est.on_sample("cmd", ms(200));
        let state = est.state(&"cmd").unwrap();
        assert_eq!(state.srtt, ms(200));
        assert_eq!(state.rttvar, ms(100));
        // 200 + 4 * 100
        assert_eq!(est.timeout_for(&"cmd"), ms(600));
    }

    #[test]
    fn test_smoothing_constants() {
        let mut est = estimator();
        est.on_sample("cmd", ms(200));
        est.on_sample("cmd", ms(400));
        let state = est.state(&"cmd").unwrap();
        // rttvar = 3/4 * 100 + 1/4 * 200 = 125
        assert_eq!(state.rttvar, ms(125));
        // srtt = 7/8 * 200 + 1/8 * 400 = 225
        assert_eq!(state.srtt, ms(225));
        assert_eq!(state.samples, 2);
    }

    #[test]
    fn test_timeout_clamped_to_bounds() {
        let mut est = estimator();
        est.on_sample("fast", ms(1));
        assert_eq!(est.timeout_for(&"fast"), ms(100));

        est.on_sample("slow", ms(5000));
        assert_eq!(est.timeout_for(&"slow"), ms(3000));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut est = estimator();
        est.on_sample("cmd", ms(50));
        assert_eq!(est.timeout_for(&"param"), ms(1000));
    }

    #[test]
    fn test_stable_samples_converge() {
        let mut est = estimator();
        for _ in 0..100 {
            est.on_sample("cmd", ms(300));
        }
        let timeout = est.timeout_for(&"cmd");
        assert!(timeout >= ms(300));
        assert!(timeout < ms(310));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        assert_eq!(backoff(ms(100), 0, ms(3000)), ms(100));
        assert_eq!(backoff(ms(100), 1, ms(3000)), ms(200));
        assert_eq!(backoff(ms(100), 3, ms(3000)), ms(800));
        assert_eq!(backoff(ms(100), 10, ms(3000)), ms(3000));
        assert_eq!(backoff(ms(100), 64, ms(3000)), ms(3000));
    }
}
