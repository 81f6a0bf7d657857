//! Logical batch storage for batched decode calls
//!
//! A [`LogicalBatch`] is laid out as parallel arrays (token, position,
//! sequence ids, logits flag) so that any contiguous sub-range can be handed
//! to an engine as a borrowed [`BatchView`] without copying.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{BenchError, Result};

/// Token identifier as consumed by the engine
pub type TokenId = u32;

/// Absolute position of a token within its sequence
pub type Pos = usize;

/// Logical sequence identifier
pub type SeqId = usize;

/// A single token request inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: TokenId,
    pub pos: Pos,
    pub seq_ids: Vec<SeqId>,
    pub logits: bool,
}

/// Pre-allocated batch of token requests
///
/// Storage is reserved once for `capacity` requests with up to `n_seq_max`
/// sequence ids each. [`LogicalBatch::clear`] only resets the length, so the
/// same buffer is reused across every phase of every trial.
#[derive(Debug)]
pub struct LogicalBatch {
    tokens: Vec<TokenId>,
    pos: Vec<Pos>,
    n_seq_id: Vec<usize>,
    /// Flat table with a stride of `n_seq_max` ids per request
    seq_id: Vec<SeqId>,
    logits: Vec<bool>,
    capacity: usize,
    n_seq_max: usize,
}

impl LogicalBatch {
    pub fn new(capacity: usize, n_seq_max: usize) -> Self {
        let n_seq_max = n_seq_max.max(1);
        Self {
            tokens: Vec::with_capacity(capacity),
            pos: Vec::with_capacity(capacity),
            n_seq_id: Vec::with_capacity(capacity),
            seq_id: Vec::with_capacity(capacity * n_seq_max),
            logits: Vec::with_capacity(capacity),
            capacity,
            n_seq_max,
        }
    }

    /// Reset the length to zero, keeping the allocation
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.pos.clear();
        self.n_seq_id.clear();
        self.seq_id.clear();
        self.logits.clear();
    }

    /// Append one request and return the new length
    pub fn add(&mut self, token: TokenId, pos: Pos, seq_ids: &[SeqId], logits: bool) -> Result<usize> {
        if self.tokens.len() >= self.capacity {
            return Err(BenchError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if seq_ids.len() > self.n_seq_max {
            return Err(BenchError::TooManySequences {
                given: seq_ids.len(),
                max: self.n_seq_max,
            });
        }

        self.tokens.push(token);
        self.pos.push(pos);
        self.n_seq_id.push(seq_ids.len());
        self.seq_id.extend_from_slice(seq_ids);
        // Pad the stride so request i always starts at i * n_seq_max
        let padded = self.tokens.len() * self.n_seq_max;
        self.seq_id.resize(padded, 0);
        self.logits.push(logits);

        Ok(self.tokens.len())
    }

    /// Overwrite the logits flag of an already appended request
    pub fn set_logits(&mut self, index: usize, logits: bool) {
        self.logits[index] = logits;
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Owned copy of the request at `index`
    pub fn get(&self, index: usize) -> Option<TokenRequest> {
        if index < self.len() {
            Some(self.as_view().request(index))
        } else {
            None
        }
    }

    /// Borrow the whole batch
    pub fn as_view(&self) -> BatchView<'_> {
        BatchView {
            tokens: &self.tokens,
            pos: &self.pos,
            n_seq_id: &self.n_seq_id,
            seq_id: &self.seq_id,
            logits: &self.logits,
            n_seq_max: self.n_seq_max,
        }
    }

    /// Borrow a contiguous sub-range of the batch
    pub fn view(&self, range: Range<usize>) -> BatchView<'_> {
        self.as_view().view(range)
    }
}

/// Zero-copy view over a contiguous range of a [`LogicalBatch`]
#[derive(Debug, Clone, Copy)]
pub struct BatchView<'a> {
    tokens: &'a [TokenId],
    pos: &'a [Pos],
    n_seq_id: &'a [usize],
    seq_id: &'a [SeqId],
    logits: &'a [bool],
    n_seq_max: usize,
}

impl<'a> BatchView<'a> {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Narrow this view further; panics if `range` is out of bounds
    pub fn view(&self, range: Range<usize>) -> BatchView<'a> {
        let stride = self.n_seq_max;
        BatchView {
            tokens: &self.tokens[range.clone()],
            pos: &self.pos[range.clone()],
            n_seq_id: &self.n_seq_id[range.clone()],
            seq_id: &self.seq_id[range.start * stride..range.end * stride],
            logits: &self.logits[range],
            n_seq_max: stride,
        }
    }

    pub fn tokens(&self) -> &'a [TokenId] {
        self.tokens
    }

    pub fn positions(&self) -> &'a [Pos] {
        self.pos
    }

    pub fn logits(&self) -> &'a [bool] {
        self.logits
    }

    /// Sequence ids of request `index`
    pub fn seq_ids(&self, index: usize) -> &'a [SeqId] {
        let start = index * self.n_seq_max;
        &self.seq_id[start..start + self.n_seq_id[index]]
    }

    /// Number of requests that want logits back
    pub fn n_outputs(&self) -> usize {
        self.logits.iter().filter(|&&l| l).count()
    }

    pub fn request(&self, index: usize) -> TokenRequest {
        TokenRequest {
            token: self.tokens[index],
            pos: self.pos[index],
            seq_ids: self.seq_ids(index).to_vec(),
            logits: self.logits[index],
        }
    }

    pub fn requests(&self) -> impl Iterator<Item = TokenRequest> + 'a {
        let view = *self;
        (0..view.len()).map(move |i| view.request(i))
    }
}
