use std::time::{Duration, Instant};

use crate::backend::{ChunkSequence, InferenceEngine};
use crate::media::MediaQueue;
use crate::{ChunkKind, Position, SessionError, TextInput};

/// Outcome of evaluating one formatted turn.
#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    /// Context position after the last chunk.
    pub n_past: Position,
    /// Context positions the turn occupied (text tokens plus media embeddings).
    pub n_tokens: usize,
    pub n_chunks: usize,
    pub elapsed: Duration,
}

/// Tokenize `formatted` into text/media chunks and feed them to the engine.
///
/// `add_special` must be true only for the first turn of a session. The
/// pending queue is drained whether or not evaluation succeeds.
pub fn evaluate<E: InferenceEngine>(
    engine: &mut E,
    n_past: Position,
    formatted: &str,
    add_special: bool,
    pending: &mut MediaQueue<E::Media>,
    n_batch: usize,
) -> Result<Evaluation, SessionError> {
    let input = TextInput {
        text: formatted,
        add_special,
        parse_special: true,
    };

    let chunks = engine.tokenize_chunks(&input, pending.as_slice());
    pending.drain();
    let chunks = chunks.map_err(|e| {
        log::error!("Unable to tokenize prompt: {e}");
        SessionError::Tokenize(e)
    })?;

    let n_chunks = chunks.chunk_count();
    let n_tokens = chunks.total_tokens();
    log::debug!(
        "Evaluating {n_chunks} chunks ({n_tokens} positions, {} media) from n_past={n_past}",
        chunks.media_count()
    );
    for index in 0..n_chunks {
        if let Some(ChunkKind::Media(kind)) = chunks.chunk_kind(index) {
            log::debug!("Chunk {index}: encoding {kind}");
        }
    }

    let start = Instant::now();
    let new_n_past = engine.eval_chunks(&chunks, n_past, n_batch).map_err(|e| {
        log::error!("Unable to eval prompt: {e}");
        SessionError::Eval(e)
    })?;

    Ok(Evaluation {
        n_past: new_n_past,
        n_tokens,
        n_chunks,
        elapsed: start.elapsed(),
    })
}
