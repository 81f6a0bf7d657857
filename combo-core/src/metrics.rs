//! Throughput metrics and per-trial records

use serde::Serialize;
use std::fmt;

use crate::admission::GridPoint;

/// Measured result of one repeat of one grid point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialResult {
    pub grid_point: GridPoint,
    pub repeat_index: usize,
    pub required_slots: usize,
    pub prefill_seconds: f64,
    pub decode_seconds: f64,
    pub prefill_tokens_per_sec: f64,
    pub decode_tokens_per_sec: f64,
    pub combined_tokens_per_sec: f64,
}

impl TrialResult {
    /// Derive throughput figures from the two phase timings
    pub fn from_timings(
        grid_point: GridPoint,
        repeat_index: usize,
        shared_prefill: bool,
        prefill_seconds: f64,
        decode_seconds: f64,
    ) -> Self {
        let GridPoint {
            prompt_len,
            gen_len,
            parallelism,
        } = grid_point;
        let required_slots = grid_point.required_slots(shared_prefill);

        let prefill_tokens = if shared_prefill {
            prompt_len
        } else {
            parallelism * prompt_len
        };
        let decode_tokens = parallelism * gen_len;

        Self {
            grid_point,
            repeat_index,
            required_slots,
            prefill_seconds,
            decode_seconds,
            prefill_tokens_per_sec: tokens_per_sec(prefill_tokens, prefill_seconds),
            decode_tokens_per_sec: tokens_per_sec(decode_tokens, decode_seconds),
            combined_tokens_per_sec: tokens_per_sec(
                required_slots,
                prefill_seconds + decode_seconds,
            ),
        }
    }
}

/// Rate of `tokens` over `seconds`; no work is reported as 0 rather than NaN
pub fn tokens_per_sec(tokens: usize, seconds: f64) -> f64 {
    if tokens == 0 {
        0.0
    } else {
        tokens as f64 / seconds
    }
}

/// Why a grid point produced no measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    CacheBudgetExceeded,
    DecodeFailed { chunk_index: usize, status: i32 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::CacheBudgetExceeded => write!(f, "kv cache not enough"),
            SkipReason::DecodeFailed { status, .. } => write!(f, "decode failed ({})", status),
        }
    }
}

/// A grid point that was not measured
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTrial {
    pub grid_point: GridPoint,
    pub required_slots: usize,
    pub reason: SkipReason,
}

/// One line of sweep output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SweepRecord {
    Trial(TrialResult),
    Skipped(SkippedTrial),
}

impl SweepRecord {
    pub fn as_trial(&self) -> Option<&TrialResult> {
        match self {
            SweepRecord::Trial(t) => Some(t),
            SweepRecord::Skipped(_) => None,
        }
    }

    pub fn as_skipped(&self) -> Option<&SkippedTrial> {
        match self {
            SweepRecord::Trial(_) => None,
            SweepRecord::Skipped(s) => Some(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_unshared() {
        let point = GridPoint::new(100, 50, 4);
        let result = TrialResult::from_timings(point, 0, false, 2.0, 1.0);

        assert_eq!(result.prefill_tokens_per_sec, 200.0);
        assert_eq!(result.decode_tokens_per_sec, 200.0);
        assert_eq!(result.required_slots, 600);
        assert_eq!(result.combined_tokens_per_sec, 200.0);
    }

    #[test]
    fn test_throughput_shared() {
        let point = GridPoint::new(100, 50, 4);
        let result = TrialResult::from_timings(point, 1, true, 0.5, 2.0);

        assert_eq!(result.prefill_tokens_per_sec, 200.0);
        assert_eq!(result.decode_tokens_per_sec, 100.0);
        assert_eq!(result.required_slots, 300);
        assert_eq!(result.combined_tokens_per_sec, 120.0);
        assert_eq!(result.repeat_index, 1);
    }

    #[test]
    fn test_zero_work_is_zero_rate() {
        assert_eq!(tokens_per_sec(0, 0.0), 0.0);
        assert!(tokens_per_sec(10, 0.0).is_infinite());

        let result = TrialResult::from_timings(GridPoint::new(0, 8, 2), 0, false, 0.0, 1.0);
        assert_eq!(result.prefill_tokens_per_sec, 0.0);
        assert_eq!(result.decode_tokens_per_sec, 16.0);
    }

    #[test]
    fn test_skip_reason_text() {
        assert_eq!(SkipReason::CacheBudgetExceeded.to_string(), "kv cache not enough");
        let reason = SkipReason::DecodeFailed {
            chunk_index: 0,
            status: 1,
        };
        assert_eq!(reason.to_string(), "decode failed (1)");
    }

    #[test]
    fn test_record_json_shape() {
        let record = SweepRecord::Skipped(SkippedTrial {
            grid_point: GridPoint::new(128, 32, 2),
            required_slots: 320,
            reason: SkipReason::CacheBudgetExceeded,
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["record"], "skipped");
        assert_eq!(json["required_slots"], 320);
        assert_eq!(json["reason"]["kind"], "cache_budget_exceeded");
        assert_eq!(json["grid_point"]["parallelism"], 2);
    }
}
