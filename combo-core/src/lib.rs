//! Combo Core - prefill/decode throughput sweep harness
//!
//! This crate implements the benchmark logic including:
//! - Struct-of-arrays token batches with zero-copy sub-views
//! - Chunked submission to a batched decoding engine
//! - KV cache admission of grid points
//! - Timed trials over prompt, generation and parallelism grids
//! - A candle-backed reference engine with a sequence-keyed KV cache

pub mod error;
pub mod batch;
pub mod engine;
pub mod batcher;
pub mod admission;
pub mod metrics;
pub mod trial;
pub mod sweep;
pub mod report;
pub mod kv_cache;
pub mod model;
pub mod reference;

pub use error::{BenchError, Result};
pub use batch::{BatchView, LogicalBatch, Pos, SeqId, TokenId, TokenRequest};
pub use engine::{check_status, DecodeEngine, EngineParams, DECODE_OK, MAX_SEQUENCES};
pub use batcher::decode_chunked;
pub use admission::{admit, Admission, GridPoint};
pub use metrics::{tokens_per_sec, SkipReason, SkippedTrial, SweepRecord, TrialResult};
pub use trial::{Clock, MonotonicClock, TrialOptions, TrialPhase, TrialRunner};
pub use sweep::{run_sweep, warm_up, FailurePolicy, SweepConfig, SweepOutcome};
pub use report::{format_table_line, OutputFormat, Reporter, TABLE_HEADER};
pub use kv_cache::{CacheStats, KvCache, SeqMask};
pub use model::{load_model_dims, ModelConfig, ModelDims, TINY_MODEL};
pub use reference::{EngineStats, ReferenceEngine};
