//! Chunked submission of a logical batch to the engine

use tracing::{trace, warn};

use crate::batch::BatchView;
use crate::engine::{check_status, DecodeEngine};
use crate::error::{BenchError, Result};

/// Submit `batch` to the engine in consecutive chunks of at most
/// `max_chunk_size` requests.
///
/// Chunks are zero-copy sub-views issued strictly in order. The first
/// nonzero status stops submission. Returns the number of chunks decoded.
pub fn decode_chunked<E: DecodeEngine + ?Sized>(
    engine: &mut E,
    batch: &BatchView<'_>,
    max_chunk_size: usize,
) -> Result<usize> {
    if max_chunk_size == 0 {
        return Err(BenchError::InvalidConfig(
            "max chunk size must be at least 1".to_string(),
        ));
    }

    let n_tokens = batch.len();
    let mut chunk_index = 0;
    let mut start = 0;

    while start < n_tokens {
        let end = (start + max_chunk_size).min(n_tokens);
        let chunk = batch.view(start..end);
        trace!("Decoding chunk {} ({} tokens)", chunk_index, chunk.len());

        if let Err(status) = check_status(engine.decode(&chunk)) {
            warn!(
                "Failed to decode the batch, n_batch = {}, ret = {}",
                max_chunk_size, status
            );
            return Err(BenchError::DecodeFailed {
                chunk_index,
                status,
            });
        }

        chunk_index += 1;
        start = end;
    }

    Ok(chunk_index)
}
