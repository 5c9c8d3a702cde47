//! Local sampling decisions.
//!
//! Mirrors the default centralized rule: a small per-second reservoir is
//! always recorded, and a fixed fraction of everything beyond it.

use std::sync::{Mutex, PoisonError};

use chrono::Utc;

use crate::config::SamplingConfig;

#[derive(Debug, Default)]
struct Reservoir {
    second: i64,
    taken: u32,
}

/// Decides whether a new trace is recorded.
#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    reservoir: Mutex<Reservoir>,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        Self {
            config,
            reservoir: Mutex::new(Reservoir::default()),
        }
    }

    /// Make a sampling decision for a trace starting now.
    pub fn should_trace(&self) -> bool {
        self.should_trace_at(Utc::now().timestamp())
    }

    fn should_trace_at(&self, second: i64) -> bool {
        if self.take_from_reservoir(second) {
            return true;
        }
        match self.config.fixed_rate {
            rate if rate >= 1.0 => true,
            rate if rate <= 0.0 => false,
            rate => rand::random::<f64>() < rate,
        }
    }

    fn take_from_reservoir(&self, second: i64) -> bool {
        let mut reservoir = self
            .reservoir
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reservoir.second != second {
            reservoir.second = second;
            reservoir.taken = 0;
        }
        if reservoir.taken < self.config.reservoir_per_second {
            reservoir.taken += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_and_never() {
        let always = Sampler::new(SamplingConfig::always());
        let never = Sampler::new(SamplingConfig::never());
        for _ in 0..100 {
            assert!(always.should_trace());
            assert!(!never.should_trace());
        }
    }

    #[test]
    fn test_reservoir_refills_each_second() {
        let sampler = Sampler::new(SamplingConfig {
            reservoir_per_second: 2,
            fixed_rate: 0.0,
        });
        assert!(sampler.should_trace_at(100));
        assert!(sampler.should_trace_at(100));
        assert!(!sampler.should_trace_at(100));
        assert!(sampler.should_trace_at(101));
    }
}
