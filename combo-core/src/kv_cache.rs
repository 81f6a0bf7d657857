use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use std::ops::Range;

use crate::batch::{Pos, SeqId};
use crate::engine::MAX_SEQUENCES;

/// Set of sequence ids, one bit per sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqMask(u64);

impl SeqMask {
    pub fn from_ids(ids: &[SeqId]) -> Self {
        let mut mask = Self::default();
        for &id in ids {
            mask.insert(id);
        }
        mask
    }

    pub fn insert(&mut self, id: SeqId) {
        debug_assert!(id < MAX_SEQUENCES);
        self.0 |= 1u64 << id;
    }

    pub fn contains(&self, id: SeqId) -> bool {
        id < MAX_SEQUENCES && self.0 & (1u64 << id) != 0
    }

    pub fn intersects(&self, other: SeqMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// One token slot of the cache
#[derive(Debug, Clone, Copy, Default)]
struct KvCell {
    pos: Pos,
    seqs: SeqMask,
}

impl KvCell {
    fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }
}

/// Cell-based KV cache
///
/// Every cell holds the keys and values of one token and remembers which
/// sequences may attend to it. Copying a sequence only tags existing cells
/// with the destination sequence, so shared prompts occupy their cells once.
pub struct KvCache {
    cells: Vec<KvCell>,
    /// Where the next slot search starts
    head: usize,
    /// Number of occupied cells
    used: usize,
    n_embd: usize,
    dtype: DType,
    /// Per-layer K/V tensors, shape: [n_cells, n_embd]
    k_cache: Vec<Tensor>,
    v_cache: Vec<Tensor>,
}

impl KvCache {
    /// Create a cache of `n_cells` token slots for every layer
    pub fn new(
        num_layers: usize,
        n_embd: usize,
        n_cells: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mut k_cache = Vec::with_capacity(num_layers);
        let mut v_cache = Vec::with_capacity(num_layers);

        // Pre-allocate all cells for all layers
        for _ in 0..num_layers {
            k_cache.push(Tensor::zeros((n_cells, n_embd), dtype, device)?);
            v_cache.push(Tensor::zeros((n_cells, n_embd), dtype, device)?);
        }

        Ok(Self {
            cells: vec![KvCell::default(); n_cells],
            head: 0,
            used: 0,
            n_embd,
            dtype,
            k_cache,
            v_cache,
        })
    }

    pub fn size(&self) -> usize {
        self.cells.len()
    }

    pub fn num_used(&self) -> usize {
        self.used
    }

    pub fn num_free(&self) -> usize {
        self.cells.len() - self.used
    }

    /// Drop every sequence from every cell
    pub fn clear(&mut self) {
        for cell in self.cells.iter_mut() {
            *cell = KvCell::default();
        }
        self.head = 0;
        self.used = 0;
    }

    /// Find `n_tokens` contiguous free cells and return the first index
    pub fn find_slot(&mut self, n_tokens: usize) -> Option<usize> {
        let n_cells = self.cells.len();
        if n_tokens == 0 || n_tokens > n_cells {
            return None;
        }

        let mut tested = 0;
        loop {
            if self.head + n_tokens > n_cells {
                tested += n_cells - self.head;
                self.head = 0;
                if tested >= n_cells {
                    return None;
                }
                continue;
            }

            match self.cells[self.head..self.head + n_tokens]
                .iter()
                .position(|c| !c.is_empty())
            {
                None => return Some(self.head),
                Some(i) => {
                    self.head += i + 1;
                    tested += i + 1;
                }
            }

            if tested >= n_cells {
                return None;
            }
        }
    }

    /// Claim cells starting at `start`, one per entry of `positions`
    pub fn occupy(&mut self, start: usize, positions: &[Pos], seqs: &[SeqMask]) {
        for (i, (&pos, &mask)) in positions.iter().zip(seqs).enumerate() {
            self.cells[start + i] = KvCell { pos, seqs: mask };
        }
        self.used += positions.len();
        self.head = start + positions.len();
    }

    /// Give back cells claimed by [`KvCache::occupy`]
    pub fn release(&mut self, start: usize, n_tokens: usize) {
        for cell in &mut self.cells[start..start + n_tokens] {
            *cell = KvCell::default();
        }
        self.used -= n_tokens;
        self.head = start;
    }

    /// Tag every cell of `src` within `positions` as also belonging to `dst`
    pub fn seq_copy(&mut self, src: SeqId, dst: SeqId, positions: Range<Pos>) {
        if src == dst || dst >= MAX_SEQUENCES {
            return;
        }
        for cell in self.cells.iter_mut() {
            if cell.seqs.contains(src) && positions.contains(&cell.pos) {
                cell.seqs.insert(dst);
            }
        }
    }

    /// Number of cells from index 0 up to the last occupied cell
    pub fn extent(&self) -> usize {
        self.cells
            .iter()
            .rposition(|c| !c.is_empty())
            .map_or(0, |i| i + 1)
    }

    /// Whether a token of `seqs` at `pos` may attend to cell `index`
    pub fn is_visible(&self, index: usize, seqs: SeqMask, pos: Pos) -> bool {
        let cell = &self.cells[index];
        cell.seqs.intersects(seqs) && cell.pos <= pos
    }

    /// Store K/V rows for consecutive cells starting at `start`
    ///
    /// `k`, `v` shape: [num_tokens, n_embd]
    pub fn write_kv(&mut self, layer_idx: usize, start: usize, k: &Tensor, v: &Tensor) -> Result<()> {
        if layer_idx >= self.k_cache.len() {
            return Err(anyhow!("Layer index {} out of bounds", layer_idx));
        }
        let num_tokens = k.dim(0)?;
        if start + num_tokens > self.cells.len() {
            return Err(anyhow!(
                "Write would exceed cache: start {} + tokens {} > cells {}",
                start,
                num_tokens,
                self.cells.len()
            ));
        }

        let k = k.to_dtype(self.dtype)?.contiguous()?;
        let v = v.to_dtype(self.dtype)?.contiguous()?;
        self.k_cache[layer_idx].slice_set(&k, 0, start)?;
        self.v_cache[layer_idx].slice_set(&v, 0, start)?;
        Ok(())
    }

    /// K/V for the first `n_cells` cells of a layer, shape: [n_cells, n_embd]
    pub fn read_kv(&self, layer_idx: usize, n_cells: usize) -> Result<(Tensor, Tensor)> {
        if layer_idx >= self.k_cache.len() {
            return Err(anyhow!("Layer index {} out of bounds", layer_idx));
        }
        let k = self.k_cache[layer_idx].narrow(0, 0, n_cells)?;
        let v = self.v_cache[layer_idx].narrow(0, 0, n_cells)?;
        Ok((k, v))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_cells: self.cells.len(),
            used_cells: self.used,
            free_cells: self.num_free(),
            memory_mb: self.memory_mb(),
        }
    }

    fn memory_mb(&self) -> f64 {
        let bytes_per_element = self.dtype.size_in_bytes();
        // *2 for K and V
        let bytes = self.cells.len() * self.n_embd * bytes_per_element * 2 * self.k_cache.len();
        bytes as f64 / 1024.0 / 1024.0
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_cells: usize,
    pub used_cells: usize,
    pub free_cells: usize,
    pub memory_mb: f64,
}
