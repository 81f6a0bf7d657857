//! Sweep over prompt length x generation length x parallelism
//!
//! Grid points are visited with prompt length outermost and parallelism
//! innermost. Each admitted point runs `repeat_count` independent trials and
//! emits one record per repeat; rejected points emit a single skip record.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::admission::{admit, Admission, GridPoint};
use crate::batch::LogicalBatch;
use crate::batcher::decode_chunked;
use crate::engine::{DecodeEngine, MAX_SEQUENCES};
use crate::error::{BenchError, Result};
use crate::metrics::{SkipReason, SkippedTrial, SweepRecord, TrialResult};
use crate::trial::{Clock, TrialOptions, TrialRunner};

/// What to do when a decode call fails mid-sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the whole sweep and surface the error
    #[default]
    AbortSweep,
    /// Record the grid point as skipped and move on to the next one
    SkipGridPoint,
}

/// Configuration for a full sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub prompt_lens: Vec<usize>,
    pub gen_lens: Vec<usize>,
    pub parallelism: Vec<usize>,
    pub repeat_count: usize,
    /// KV cache slots available to a trial
    pub cache_budget: usize,
    pub shared_prefill: bool,
    /// Engine-imposed maximum tokens per decode call
    pub max_chunk_size: usize,
    /// Tokens decoded once on sequence 0 before the sweep; 0 disables
    pub warmup_tokens: usize,
    /// Sequence ids the engine context can track
    pub n_seq_max: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            prompt_lens: vec![128, 256, 512, 1024, 2048, 3584, 7680],
            gen_lens: vec![128, 256],
            parallelism: vec![1, 2, 4, 8, 16, 32],
            repeat_count: 3,
            cache_budget: 8192,
            shared_prefill: false,
            max_chunk_size: 4096,
            warmup_tokens: 32,
            n_seq_max: MAX_SEQUENCES,
            failure_policy: FailurePolicy::AbortSweep,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(BenchError::InvalidConfig(msg));

        if self.prompt_lens.is_empty() || self.gen_lens.is_empty() || self.parallelism.is_empty() {
            return invalid("prompt, generation and parallelism lists must not be empty".into());
        }
        if self.parallelism.contains(&0) {
            return invalid("parallelism must be at least 1".into());
        }
        if let Some(&pl) = self.parallelism.iter().find(|&&pl| pl > self.n_seq_max) {
            return invalid(format!(
                "parallelism {} exceeds the engine's {} sequences",
                pl, self.n_seq_max
            ));
        }
        if self.repeat_count == 0 {
            return invalid("repeat count must be at least 1".into());
        }
        if self.cache_budget == 0 {
            return invalid("cache budget must be at least 1".into());
        }
        if self.max_chunk_size == 0 {
            return invalid("max chunk size must be at least 1".into());
        }
        Ok(())
    }

    /// Grid points in sweep order
    pub fn grid_points(&self) -> impl Iterator<Item = GridPoint> + '_ {
        self.prompt_lens.iter().flat_map(move |&pp| {
            self.gen_lens.iter().flat_map(move |&tg| {
                self.parallelism
                    .iter()
                    .map(move |&pl| GridPoint::new(pp, tg, pl))
            })
        })
    }

    fn trial_options(&self) -> TrialOptions {
        TrialOptions {
            shared_prefill: self.shared_prefill,
            max_chunk_size: self.max_chunk_size,
            ..Default::default()
        }
    }
}

/// All records produced by a sweep, in emission order
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub records: Vec<SweepRecord>,
}

impl SweepOutcome {
    pub fn trials(&self) -> impl Iterator<Item = &TrialResult> {
        self.records.iter().filter_map(SweepRecord::as_trial)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &SkippedTrial> {
        self.records.iter().filter_map(SweepRecord::as_skipped)
    }
}

/// Decode a throwaway batch on sequence 0 so one-time engine setup is not
/// billed to the first trial.
pub fn warm_up<E: DecodeEngine + ?Sized>(
    engine: &mut E,
    batch: &mut LogicalBatch,
    n_tokens: usize,
    max_chunk_size: usize,
) -> Result<()> {
    batch.clear();
    for i in 0..n_tokens {
        batch.add(0, i, &[0], false)?;
    }
    decode_chunked(engine, &batch.as_view(), max_chunk_size)?;
    batch.clear();
    Ok(())
}

/// Run the whole sweep, handing each record to `sink` as soon as it exists
pub fn run_sweep<E, C, F>(
    engine: &mut E,
    clock: &C,
    config: &SweepConfig,
    mut sink: F,
) -> Result<SweepOutcome>
where
    E: DecodeEngine + ?Sized,
    C: Clock + ?Sized,
    F: FnMut(&SweepRecord),
{
    config.validate()?;

    // Every trial fits in the cache budget, so neither phase can outgrow it
    let mut batch = LogicalBatch::new(config.cache_budget.max(config.warmup_tokens), 1);

    if config.warmup_tokens > 0 {
        let n_warmup = config.warmup_tokens.min(config.cache_budget);
        debug!("Warming up with {} tokens", n_warmup);
        warm_up(engine, &mut batch, n_warmup, config.max_chunk_size)?;
    }

    let options = config.trial_options();
    let mut outcome = SweepOutcome::default();
    let mut emit = |record: SweepRecord, outcome: &mut SweepOutcome| {
        sink(&record);
        outcome.records.push(record);
    };

    info!(
        "Sweeping {} grid points x {} repeats (n_kv_max = {}, shared prefill = {})",
        config.grid_points().count(),
        config.repeat_count,
        config.cache_budget,
        config.shared_prefill
    );

    for point in config.grid_points() {
        let required_slots = match admit(&point, config.shared_prefill, config.cache_budget) {
            Admission::Admitted { required_slots } => required_slots,
            Admission::Rejected { required_slots } => {
                debug!(
                    "Skipping pp={} tg={} pl={}: needs {} slots, budget {}",
                    point.prompt_len,
                    point.gen_len,
                    point.parallelism,
                    required_slots,
                    config.cache_budget
                );
                let skipped = SkippedTrial {
                    grid_point: point,
                    required_slots,
                    reason: SkipReason::CacheBudgetExceeded,
                };
                emit(SweepRecord::Skipped(skipped), &mut outcome);
                continue;
            }
        };

        for repeat in 0..config.repeat_count {
            let mut runner = TrialRunner::new(&mut *engine, &mut batch, clock, &options);
            match runner.run(point, repeat) {
                Ok(result) => emit(SweepRecord::Trial(result), &mut outcome),
                Err(BenchError::DecodeFailed {
                    chunk_index,
                    status,
                }) if config.failure_policy == FailurePolicy::SkipGridPoint => {
                    warn!(
                        "Decode failed for pp={} tg={} pl={}, skipping remaining repeats",
                        point.prompt_len, point.gen_len, point.parallelism
                    );
                    let skipped = SkippedTrial {
                        grid_point: point,
                        required_slots,
                        reason: SkipReason::DecodeFailed {
                            chunk_index,
                            status,
                        },
                    };
                    emit(SweepRecord::Skipped(skipped), &mut outcome);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(outcome)
}
