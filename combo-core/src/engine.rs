//! Decoding engine interface
//!
//! The harness drives any engine that can decode a batch of token requests
//! against a sequence-keyed KV cache. Status codes are opaque integers, as
//! returned by C-style inference libraries; [`check_status`] turns them into
//! a result at the boundary.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::batch::{BatchView, Pos, SeqId};

/// Maximum number of distinct sequences an engine context can track
pub const MAX_SEQUENCES: usize = 64;

/// Status returned by a successful decode call
pub const DECODE_OK: i32 = 0;

/// Parameters an engine context is created with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineParams {
    /// KV cache size in token slots, shared by all sequences
    pub n_ctx: usize,
    /// Maximum number of tokens accepted by a single decode call
    pub n_batch: usize,
    /// Maximum number of distinct sequence ids
    pub n_seq_max: usize,
    /// Seed for any randomness inside the engine
    pub seed: u64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            n_ctx: 8192,
            n_batch: 4096,
            n_seq_max: MAX_SEQUENCES,
            seed: 1234,
        }
    }
}

/// A batched decoding engine with a sequence-keyed KV cache
pub trait DecodeEngine {
    /// Process `batch` in order; 0 on success, any other value is a failure
    fn decode(&mut self, batch: &BatchView<'_>) -> i32;

    /// Drop the cached state of every sequence
    fn kv_cache_clear(&mut self);

    /// Make `dst` share the cache entries of `src` for `positions`
    fn kv_cache_seq_copy(&mut self, src: SeqId, dst: SeqId, positions: Range<Pos>);

    fn params(&self) -> &EngineParams;
}

/// Translate an engine status code into a result
pub fn check_status(status: i32) -> std::result::Result<(), i32> {
    if status == DECODE_OK {
        Ok(())
    } else {
        Err(status)
    }
}
