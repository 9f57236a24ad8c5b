// ABOUTME: Success-biased ranking policy for tool lookups
// ABOUTME: Turns success/failure history into a multiplicative bias on similarity

use neuroforge_config::constants::{
    MEMORY_EXCLUDE_FAILING, MEMORY_FAILURE_THRESHOLD, MEMORY_TRACE_THRESHOLD,
};
use neuroforge_config::{flag, parse_in_range, EnvSource, ProcessEnv};

/// Tunables for [`RankingPolicy::bias`]
#[derive(Debug, Clone, PartialEq)]
pub struct RankingPolicy {
    /// Failures tolerated before the penalty kicks in
    pub failure_threshold: i64,
    /// Repeats of a single error signature tolerated before the penalty kicks in
    pub trace_threshold: i64,
    /// Drop candidates over a threshold instead of penalizing them
    pub exclude_over_threshold: bool,
    /// Multiplier applied once per failure over the threshold
    pub penalty: f64,
    /// Minimum bias for a candidate that has never succeeded
    pub floor: f64,
}

impl Default for RankingPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            trace_threshold: 3,
            exclude_over_threshold: false,
            penalty: 0.25,
            floor: 0.1,
        }
    }
}

impl RankingPolicy {
    pub fn from_env() -> Self {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(env: &dyn EnvSource) -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: parse_in_range(
                env,
                MEMORY_FAILURE_THRESHOLD,
                defaults.failure_threshold,
                0..=1_000_000,
            ),
            trace_threshold: parse_in_range(
                env,
                MEMORY_TRACE_THRESHOLD,
                defaults.trace_threshold,
                0..=1_000_000,
            ),
            exclude_over_threshold: flag(
                env,
                MEMORY_EXCLUDE_FAILING,
                defaults.exclude_over_threshold,
            ),
            ..defaults
        }
    }

    /// Fraction of recorded outcomes that succeeded, 0.5 when nothing is known
    pub fn success_ratio(success_count: i64, failure_count: i64) -> f64 {
        let total = success_count + failure_count;
        if total <= 0 {
            0.5
        } else {
            success_count as f64 / total as f64
        }
    }

    /// Bias multiplier for a candidate, or `None` if it must be excluded.
    ///
    /// Monotonic non-decreasing in the success ratio for fixed failure
    /// counts, and always within `(0, 1]`.
    pub fn bias(&self, success_count: i64, failure_count: i64, worst_trace_count: i64) -> Option<f64> {
        let ratio = Self::success_ratio(success_count, failure_count);
        let base = self.floor + (1.0 - self.floor) * ratio;

        let over_failures = (failure_count - self.failure_threshold).max(0);
        let over_traces = (worst_trace_count - self.trace_threshold).max(0);
        let over = over_failures.max(over_traces);

        if over == 0 {
            return Some(base);
        }
        if self.exclude_over_threshold {
            return None;
        }
        let exponent = i32::try_from(over).unwrap_or(i32::MAX);
        Some((base * self.penalty.powi(exponent)).max(f64::MIN_POSITIVE))
    }
}
