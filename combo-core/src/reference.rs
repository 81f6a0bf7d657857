//! Reference decoding engine
//!
//! A synthetic transformer with the shape of a real model and seeded random
//! weights. It does the same work per token as a plain multi-head attention
//! stack (projections, cached K/V, masked attention, logits for requested
//! outputs) so the harness has something real to measure without an external
//! inference library.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use tracing::{debug, info, warn};

use crate::batch::{BatchView, Pos, SeqId};
use crate::engine::{DecodeEngine, EngineParams, DECODE_OK, MAX_SEQUENCES};
use crate::kv_cache::{CacheStats, KvCache, SeqMask};
use crate::model::ModelDims;

/// No free KV slot for the batch
pub const STATUS_NO_KV_SLOT: i32 = 1;
/// Malformed batch (empty, too large, bad token or sequence id)
pub const STATUS_INVALID_BATCH: i32 = -1;
/// The forward pass itself failed
pub const STATUS_COMPUTE_FAILED: i32 = -2;

struct LayerWeights {
    wq: Tensor,
    wk: Tensor,
    wv: Tensor,
    wo: Tensor,
}

/// Engine counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineStats {
    pub decode_calls: u64,
    pub failed_calls: u64,
    pub tokens_decoded: u64,
    pub outputs_computed: u64,
}

pub struct ReferenceEngine {
    params: EngineParams,
    dims: ModelDims,
    device: Device,
    dtype: DType,
    embeddings: Tensor,
    layers: Vec<LayerWeights>,
    lm_head: Tensor,
    kv_cache: KvCache,
    /// Host copy of the logits from the last successful decode
    last_logits: Vec<Vec<f32>>,
    stats: EngineStats,
}

impl ReferenceEngine {
    /// Create an engine context for a model of shape `dims`
    pub fn new(dims: &ModelDims, params: EngineParams, device: Device, dtype: DType) -> Result<Self> {
        dims.validate()?;
        if params.n_seq_max == 0 || params.n_seq_max > MAX_SEQUENCES {
            bail!(
                "n_seq_max must be between 1 and {}, got {}",
                MAX_SEQUENCES,
                params.n_seq_max
            );
        }
        if params.n_ctx == 0 || params.n_batch == 0 {
            bail!("n_ctx and n_batch must be non-zero");
        }

        info!("Initializing reference engine...");
        let mut rng = StdRng::seed_from_u64(params.seed);
        let n_embd = dims.hidden_size;

        let embeddings = random_matrix(&mut rng, dims.vocab_size, n_embd, dtype, &device)?;
        let layers = (0..dims.num_hidden_layers)
            .map(|_| {
                Ok(LayerWeights {
                    wq: random_matrix(&mut rng, n_embd, n_embd, dtype, &device)?,
                    wk: random_matrix(&mut rng, n_embd, n_embd, dtype, &device)?,
                    wv: random_matrix(&mut rng, n_embd, n_embd, dtype, &device)?,
                    wo: random_matrix(&mut rng, n_embd, n_embd, dtype, &device)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let lm_head = random_matrix(&mut rng, n_embd, dims.vocab_size, dtype, &device)?;

        let kv_cache = KvCache::new(dims.num_hidden_layers, n_embd, params.n_ctx, dtype, &device)?;

        let cache_stats = kv_cache.stats();
        info!(
            "Reference engine initialized: {} layers, {} KV cells ({:.1} MB), n_batch = {}",
            dims.num_hidden_layers, cache_stats.total_cells, cache_stats.memory_mb, params.n_batch
        );

        Ok(Self {
            params,
            dims: dims.clone(),
            device,
            dtype,
            embeddings,
            layers,
            lm_head,
            kv_cache,
            last_logits: Vec::new(),
            stats: EngineStats::default(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    /// One row of `vocab_size` logits per request that asked for them
    pub fn last_logits(&self) -> &[Vec<f32>] {
        &self.last_logits
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.kv_cache.stats()
    }

    fn validate_batch(&self, batch: &BatchView<'_>) -> bool {
        let n_tokens = batch.len();
        if n_tokens == 0 {
            warn!("Decode called with an empty batch");
            return false;
        }
        if n_tokens > self.params.n_batch {
            warn!("Batch of {} tokens exceeds n_batch = {}", n_tokens, self.params.n_batch);
            return false;
        }
        if let Some(&token) = batch
            .tokens()
            .iter()
            .find(|&&t| t as usize >= self.dims.vocab_size)
        {
            warn!("Token id {} is outside the vocabulary", token);
            return false;
        }
        for i in 0..n_tokens {
            // A cell with no sequence reads as free and would be handed out again
            if batch.seq_ids(i).is_empty() {
                warn!("Request {} belongs to no sequence", i);
                return false;
            }
            if let Some(&seq) = batch.seq_ids(i).iter().find(|&&s| s >= self.params.n_seq_max) {
                warn!("Sequence id {} exceeds n_seq_max = {}", seq, self.params.n_seq_max);
                return false;
            }
        }
        true
    }

    /// Additive attention mask, shape: [n_tokens, n_kv]
    fn attention_mask(&self, batch: &BatchView<'_>, seqs: &[SeqMask], n_kv: usize) -> Result<Tensor> {
        let n_tokens = batch.len();
        let mut mask = vec![f32::NEG_INFINITY; n_tokens * n_kv];
        for (t, (&pos, &seq)) in batch.positions().iter().zip(seqs).enumerate() {
            let row = &mut mask[t * n_kv..(t + 1) * n_kv];
            for (c, value) in row.iter_mut().enumerate() {
                if self.kv_cache.is_visible(c, seq, pos) {
                    *value = 0.0;
                }
            }
        }
        let mask = Tensor::from_vec(mask, (n_tokens, n_kv), &self.device)?;
        Ok(mask.to_dtype(self.dtype)?)
    }

    /// Run every layer for the batch whose K/V go to cells `start..`;
    /// returns logits for the requests that asked for them.
    fn forward(&mut self, batch: &BatchView<'_>, start: usize, seqs: &[SeqMask]) -> Result<(Tensor, Option<Tensor>)> {
        let n_kv = self.kv_cache.extent();
        let mask = self.attention_mask(batch, seqs, n_kv)?;

        let ids = Tensor::new(batch.tokens(), &self.device)?;
        let mut x = self.embeddings.index_select(&ids, 0)?;

        let n_head = self.dims.num_attention_heads;
        let head_dim = self.dims.head_dim();
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let q = x.matmul(&layer.wq)?;
            let k = x.matmul(&layer.wk)?;
            let v = x.matmul(&layer.wv)?;

            self.kv_cache.write_kv(layer_idx, start, &k, &v)?;
            let (k_all, v_all) = self.kv_cache.read_kv(layer_idx, n_kv)?;

            let attn = attention(&q, &k_all, &v_all, &mask, n_head, head_dim)?;
            x = (x + attn.matmul(&layer.wo)?)?;
        }

        let outputs: Vec<u32> = batch
            .logits()
            .iter()
            .enumerate()
            .filter(|(_, &wanted)| wanted)
            .map(|(i, _)| i as u32)
            .collect();
        if outputs.is_empty() {
            return Ok((x, None));
        }

        let idx = Tensor::new(outputs.as_slice(), &self.device)?;
        let logits = x.index_select(&idx, 0)?.matmul(&self.lm_head)?;
        Ok((x, Some(logits)))
    }

    /// Copy the requested logits to the host, which waits for every queued
    /// kernel of the call. Without outputs a scalar of the last hidden state
    /// is read back instead.
    fn collect_outputs(&mut self, hidden: &Tensor, logits: Option<Tensor>) -> Result<()> {
        self.last_logits.clear();
        match logits {
            Some(logits) => {
                self.last_logits = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
            }
            None => {
                hidden.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            }
        }
        Ok(())
    }
}

impl DecodeEngine for ReferenceEngine {
    fn decode(&mut self, batch: &BatchView<'_>) -> i32 {
        self.stats.decode_calls += 1;

        if !self.validate_batch(batch) {
            self.stats.failed_calls += 1;
            return STATUS_INVALID_BATCH;
        }

        let n_tokens = batch.len();
        let Some(start) = self.kv_cache.find_slot(n_tokens) else {
            debug!(
                "No KV slot for {} tokens ({} of {} cells free)",
                n_tokens,
                self.kv_cache.num_free(),
                self.kv_cache.size()
            );
            self.stats.failed_calls += 1;
            return STATUS_NO_KV_SLOT;
        };

        let seqs: Vec<SeqMask> = (0..n_tokens)
            .map(|i| SeqMask::from_ids(batch.seq_ids(i)))
            .collect();
        self.kv_cache.occupy(start, batch.positions(), &seqs);

        let result = self
            .forward(batch, start, &seqs)
            .and_then(|(hidden, logits)| self.collect_outputs(&hidden, logits));

        match result {
            Ok(()) => {
                self.stats.tokens_decoded += n_tokens as u64;
                self.stats.outputs_computed += self.last_logits.len() as u64;
                DECODE_OK
            }
            Err(e) => {
                warn!("Forward pass failed: {}", e);
                self.kv_cache.release(start, n_tokens);
                self.stats.failed_calls += 1;
                STATUS_COMPUTE_FAILED
            }
        }
    }

    fn kv_cache_clear(&mut self) {
        self.kv_cache.clear();
    }

    fn kv_cache_seq_copy(&mut self, src: SeqId, dst: SeqId, positions: Range<Pos>) {
        self.kv_cache.seq_copy(src, dst, positions);
    }

    fn params(&self) -> &EngineParams {
        &self.params
    }
}

/// Multi-head scaled dot-product attention
///
/// `q`: [n_tokens, n_embd], `k`/`v`: [n_kv, n_embd], `mask`: [n_tokens, n_kv]
fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: &Tensor,
    n_head: usize,
    head_dim: usize,
) -> Result<Tensor> {
    let (n_tokens, n_embd) = q.dims2()?;
    let n_kv = k.dim(0)?;

    let q = q.reshape((n_tokens, n_head, head_dim))?.transpose(0, 1)?.contiguous()?;
    let k = k.reshape((n_kv, n_head, head_dim))?.transpose(0, 1)?.contiguous()?;
    let v = v.reshape((n_kv, n_head, head_dim))?.transpose(0, 1)?.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
    let scores = scores.broadcast_add(mask)?;
    let probs = candle_nn::ops::softmax_last_dim(&scores)?;

    let out = probs.matmul(&v)?;
    Ok(out.transpose(0, 1)?.reshape((n_tokens, n_embd))?)
}

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let bound = 1.0 / (cols as f32).sqrt();
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::LogicalBatch;

    fn engine(n_ctx: usize, n_batch: usize) -> ReferenceEngine {
        let params = EngineParams {
            n_ctx,
            n_batch,
            ..Default::default()
        };
        ReferenceEngine::new(&ModelDims::tiny(), params, Device::Cpu, DType::F32).unwrap()
    }

    fn prompt(len: usize, seq: SeqId) -> LogicalBatch {
        let mut batch = LogicalBatch::new(len, 1);
        for i in 0..len {
            batch.add(1, i, &[seq], i + 1 == len).unwrap();
        }
        batch
    }

    #[test]
    fn test_decode_fills_cache() {
        let mut engine = engine(64, 64);
        let batch = prompt(10, 0);
        assert_eq!(engine.decode(&batch.as_view()), DECODE_OK);

        assert_eq!(engine.cache_stats().used_cells, 10);
        let stats = engine.stats();
        assert_eq!(stats.decode_calls, 1);
        assert_eq!(stats.tokens_decoded, 10);
        assert_eq!(stats.outputs_computed, 1);
    }

    #[test]
    fn test_forward_produces_logits() {
        let mut engine = engine(16, 16);
        let batch = prompt(4, 0);
        let seqs = vec![SeqMask::from_ids(&[0]); 4];
        let start = engine.kv_cache.find_slot(4).unwrap();
        engine.kv_cache.occupy(start, batch.as_view().positions(), &seqs);

        let (hidden, logits) = engine.forward(&batch.as_view(), start, &seqs).unwrap();
        assert_eq!(hidden.dims(), &[4, ModelDims::tiny().hidden_size]);
        let logits = logits.unwrap();
        assert_eq!(logits.dims(), &[1, ModelDims::tiny().vocab_size]);
        let values: Vec<f32> = logits.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_cache_full_returns_no_slot() {
        let mut engine = engine(8, 8);
        assert_eq!(engine.decode(&prompt(6, 0).as_view()), DECODE_OK);
        assert_eq!(engine.decode(&prompt(3, 1).as_view()), STATUS_NO_KV_SLOT);
        assert_eq!(engine.stats().failed_calls, 1);

        engine.kv_cache_clear();
        assert_eq!(engine.decode(&prompt(8, 1).as_view()), DECODE_OK);
    }

    #[test]
    fn test_invalid_batches() {
        let mut engine = engine(32, 4);
        assert_eq!(engine.decode(&prompt(5, 0).as_view()), STATUS_INVALID_BATCH);
        assert_eq!(engine.decode(&LogicalBatch::new(1, 1).as_view()), STATUS_INVALID_BATCH);

        let mut bad_token = LogicalBatch::new(1, 1);
        bad_token.add(u32::MAX, 0, &[0], true).unwrap();
        assert_eq!(engine.decode(&bad_token.as_view()), STATUS_INVALID_BATCH);

        assert_eq!(engine.decode(&prompt(2, MAX_SEQUENCES).as_view()), STATUS_INVALID_BATCH);
        assert_eq!(engine.cache_stats().used_cells, 0);
    }

    #[test]
    fn test_request_without_sequence_is_rejected() {
        let mut engine = engine(4, 4);
        let mut orphan = LogicalBatch::new(4, 1);
        for i in 0..4 {
            orphan.add(1, i, &[], i == 3).unwrap();
        }
        assert_eq!(engine.decode(&orphan.as_view()), STATUS_INVALID_BATCH);
        assert_eq!(engine.cache_stats().used_cells, 0);

        // The whole cache is still available afterwards
        assert_eq!(engine.decode(&prompt(4, 0).as_view()), DECODE_OK);
        assert_eq!(engine.cache_stats().used_cells, 4);
    }

    #[test]
    fn test_decode_returns_logits_on_host() {
        let mut engine = engine(32, 32);
        let mut batch = prompt(6, 0);
        batch.set_logits(2, true);
        assert_eq!(engine.decode(&batch.as_view()), DECODE_OK);

        let logits = engine.last_logits();
        assert_eq!(logits.len(), 2);
        assert!(logits.iter().all(|row| row.len() == ModelDims::tiny().vocab_size));
        assert!(logits.iter().flatten().all(|v| v.is_finite()));

        // No outputs requested: nothing is kept from the previous call
        let mut warmup = LogicalBatch::new(3, 1);
        for i in 0..3 {
            warmup.add(0, i, &[1], false).unwrap();
        }
        assert_eq!(engine.decode(&warmup.as_view()), DECODE_OK);
        assert!(engine.last_logits().is_empty());
        assert_eq!(engine.stats().outputs_computed, 2);
    }

    #[test]
    fn test_shared_prefill_uses_prompt_cells_once() {
        let mut engine = engine(64, 64);
        assert_eq!(engine.decode(&prompt(16, 0).as_view()), DECODE_OK);
        for dst in 1..4 {
            engine.kv_cache_seq_copy(0, dst, 0..16);
        }

        let mut step = LogicalBatch::new(4, 1);
        for seq in 0..4 {
            step.add(2, 16, &[seq], true).unwrap();
        }
        assert_eq!(engine.decode(&step.as_view()), DECODE_OK);
        assert_eq!(engine.cache_stats().used_cells, 20);
        assert_eq!(engine.stats().outputs_computed, 5);
    }

    #[test]
    fn test_rejects_bad_params() {
        let params = EngineParams {
            n_seq_max: MAX_SEQUENCES + 1,
            ..Default::default()
        };
        assert!(ReferenceEngine::new(&ModelDims::tiny(), params, Device::Cpu, DType::F32).is_err());
    }
}
