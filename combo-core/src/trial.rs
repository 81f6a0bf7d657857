//! Single-trial runner: cold cache, prefill, optional cache branch, decode
//!
//! A trial walks `Init -> PrefillBuild -> PrefillSubmit -> CacheBranch ->
//! DecodeStep(0..gen_len) -> Done`. Any decode failure aborts the trial with
//! no partial result.

use std::time::{Duration, Instant};
use tracing::{debug, debug_span, warn};

use crate::admission::GridPoint;
use crate::batch::{LogicalBatch, TokenId};
use crate::batcher::decode_chunked;
use crate::engine::DecodeEngine;
use crate::error::Result;
use crate::metrics::TrialResult;

/// Source of monotonic timestamps
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Per-trial knobs shared by every grid point of a sweep
#[derive(Debug, Clone)]
pub struct TrialOptions {
    /// Compute the prompt once on sequence 0 and copy its cache to the others
    pub shared_prefill: bool,
    /// Engine-imposed maximum tokens per decode call
    pub max_chunk_size: usize,
    /// Token id used for every request
    pub filler_token: TokenId,
}

impl Default for TrialOptions {
    fn default() -> Self {
        Self {
            shared_prefill: false,
            max_chunk_size: 4096,
            filler_token: 0,
        }
    }
}

/// Where a trial currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    Init,
    PrefillBuild,
    PrefillSubmit,
    CacheBranch,
    DecodeStep(usize),
    Done,
    Aborted,
}

/// Drives one repeat of one grid point against an engine
pub struct TrialRunner<'a, E: ?Sized, C: ?Sized> {
    engine: &'a mut E,
    batch: &'a mut LogicalBatch,
    clock: &'a C,
    options: &'a TrialOptions,
    phase: TrialPhase,
}

impl<'a, E, C> TrialRunner<'a, E, C>
where
    E: DecodeEngine + ?Sized,
    C: Clock + ?Sized,
{
    pub fn new(
        engine: &'a mut E,
        batch: &'a mut LogicalBatch,
        clock: &'a C,
        options: &'a TrialOptions,
    ) -> Self {
        Self {
            engine,
            batch,
            clock,
            options,
            phase: TrialPhase::Init,
        }
    }

    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    /// Run the full state machine for `point`
    pub fn run(&mut self, point: GridPoint, repeat_index: usize) -> Result<TrialResult> {
        let _span = debug_span!(
            "trial",
            pp = point.prompt_len,
            tg = point.gen_len,
            pl = point.parallelism,
            repeat = repeat_index
        )
        .entered();

        match self.run_phases(point, repeat_index) {
            Ok(result) => {
                self.phase = TrialPhase::Done;
                Ok(result)
            }
            Err(e) => {
                warn!("Trial aborted during {:?}: {}", self.phase, e);
                self.phase = TrialPhase::Aborted;
                Err(e)
            }
        }
    }

    fn run_phases(&mut self, point: GridPoint, repeat_index: usize) -> Result<TrialResult> {
        let shared = self.options.shared_prefill;

        self.phase = TrialPhase::Init;
        self.engine.kv_cache_clear();
        self.batch.clear();

        // ===== PREFILL =====
        self.phase = TrialPhase::PrefillBuild;
        self.build_prefill(&point)?;
        debug!("Prefill batch holds {} tokens", self.batch.len());

        self.phase = TrialPhase::PrefillSubmit;
        let t_pp_start = self.clock.now();
        decode_chunked(
            &mut *self.engine,
            &self.batch.as_view(),
            self.options.max_chunk_size,
        )?;

        if shared {
            self.phase = TrialPhase::CacheBranch;
            self.branch_cache(&point);
        }
        let t_pp_end = self.clock.now();

        // ===== DECODE =====
        self.batch.clear();
        let t_tg_start = self.clock.now();
        for i in 0..point.gen_len {
            self.phase = TrialPhase::DecodeStep(i);
            self.batch.clear();
            for j in 0..point.parallelism {
                self.batch
                    .add(self.options.filler_token, point.prompt_len + i, &[j], true)?;
            }
            decode_chunked(
                &mut *self.engine,
                &self.batch.as_view(),
                self.options.max_chunk_size,
            )?;
        }
        let t_tg_end = self.clock.now();

        let t_pp = t_pp_end.saturating_sub(t_pp_start).as_secs_f64();
        let t_tg = t_tg_end.saturating_sub(t_tg_start).as_secs_f64();

        Ok(TrialResult::from_timings(point, repeat_index, shared, t_pp, t_tg))
    }

    /// One request per independent prompt copy and position; only the last
    /// request asks for logits.
    fn build_prefill(&mut self, point: &GridPoint) -> Result<()> {
        let copies = if self.options.shared_prefill {
            1
        } else {
            point.parallelism
        };

        for i in 0..point.prompt_len {
            for j in 0..copies {
                self.batch.add(self.options.filler_token, i, &[j], false)?;
            }
        }

        if let Some(last) = self.batch.len().checked_sub(1) {
            self.batch.set_logits(last, true);
        }
        Ok(())
    }

    /// Give every secondary sequence the primary sequence's prompt cache
    fn branch_cache(&mut self, point: &GridPoint) {
        if point.prompt_len == 0 {
            return;
        }
        for j in 1..point.parallelism {
            self.engine.kv_cache_seq_copy(0, j, 0..point.prompt_len);
        }
    }
}
