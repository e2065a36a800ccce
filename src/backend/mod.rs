//! Collaborator seams the session core drives.
//!
//! A backend bundles the inference engine, sampler, tokenizer, media encoder
//! and chat template applier behind these traits. Errors cross the seam as
//! plain strings; the session wraps them into [`crate::SessionError`].
//!
//! - `llama.rs`: llama.cpp + mtmd through `llama-cpp-2` (feature `llama`)
//! - `mock.rs`: deterministic scripted backend (tests, feature `mock`)

#[cfg(feature = "llama")]
pub mod llama;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::path::Path;

use crate::{ChunkKind, InputChunk, Message, Position, SessionConfig, TextInput, Token};

pub type BackendResult<T> = Result<T, String>;

/// Text <-> token conversion.
pub trait Tokenizer {
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> BackendResult<Vec<Token>>;

    /// Detokenize a whole sequence in one pass.
    fn detokenize(&self, tokens: &[Token]) -> BackendResult<String>;

    /// Text of a single token. Only suitable for live previews.
    fn token_to_piece(&self, token: Token) -> BackendResult<String>;

    fn is_end_of_generation(&self, token: Token) -> bool;
}

/// Renders role-tagged messages into prompt text.
pub trait ChatFormatter {
    /// Jinja source of the active template (override or model metadata).
    fn template_source(&self, template_override: Option<&str>) -> Option<String>;

    /// Apply the engine's built-in template. `Ok(None)` means the backend has
    /// no built-in applier and the caller falls back to role tags.
    fn apply_builtin_template(
        &self,
        template_override: Option<&str>,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> BackendResult<Option<String>>;

    fn bos_token(&self) -> String;

    fn eos_token(&self) -> String;
}

/// Ordered engine input produced by [`MediaEncoder::tokenize_chunks`].
pub trait ChunkSequence {
    fn chunk_count(&self) -> usize;

    fn chunk_kind(&self, index: usize) -> Option<ChunkKind>;

    /// Sum of context positions the chunks will occupy.
    fn total_tokens(&self) -> usize;

    fn media_count(&self) -> usize {
        (0..self.chunk_count())
            .filter(|&i| matches!(self.chunk_kind(i), Some(ChunkKind::Media(_))))
            .count()
    }
}

/// Media attachment already decoded into engine-native pixels or samples.
pub trait MediaHandle {
    fn kind(&self) -> crate::MediaKind;
}

/// Vision/audio encoder adapter.
pub trait MediaEncoder {
    type Media: MediaHandle;
    type Chunks: ChunkSequence;

    /// Marker that denotes "insert media here" in prompt text.
    fn media_marker(&self) -> &str;

    fn supports_vision(&self) -> bool;

    fn supports_audio(&self) -> bool;

    fn load_media(&self, path: &Path) -> BackendResult<Self::Media>;

    /// Split `input` at media markers into text and media chunks, consuming
    /// one attachment per marker in order.
    fn tokenize_chunks(&self, input: &TextInput<'_>, media: &[Self::Media]) -> BackendResult<Self::Chunks>;
}

/// Fixed-shape decode request, reused across generation steps.
#[derive(Debug, Default, Clone)]
pub struct TokenBatch {
    tokens: Vec<Token>,
    positions: Vec<Position>,
    logits: Vec<bool>,
}

impl TokenBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            logits: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.positions.clear();
        self.logits.clear();
    }

    pub fn add(&mut self, token: Token, position: Position, logits: bool) {
        self.tokens.push(token);
        self.positions.push(position);
        self.logits.push(logits);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// `(token, position, logits)` triples in submission order.
    pub fn iter(&self) -> impl Iterator<Item = (Token, Position, bool)> + '_ {
        self.tokens
            .iter()
            .zip(&self.positions)
            .zip(&self.logits)
            .map(|((&t, &p), &l)| (t, p, l))
    }
}

/// Owns weights and the KV/context cache.
pub trait InferenceEngine: MediaEncoder {
    /// Evaluate all chunks starting at `n_past`, honoring `n_batch`, and return
    /// the position after the last chunk. Logits are kept for the last token.
    fn eval_chunks(&mut self, chunks: &Self::Chunks, n_past: Position, n_batch: usize) -> BackendResult<Position>;

    fn decode(&mut self, batch: &TokenBatch) -> BackendResult<()>;

    /// Drop any retained context/cache.
    fn clear_memory(&mut self);
}

/// Picks the next token from the engine's most recent logits.
pub trait Sampler {
    /// `index` is the logits row; `-1` means the last decoded position.
    fn sample(&mut self, index: i32) -> Token;

    /// Record an emitted token for repetition/penalty bookkeeping.
    fn accept(&mut self, token: Token);
}

/// Everything a loaded session needs from one backend instance.
pub trait ModelRuntime: Tokenizer + ChatFormatter + InferenceEngine + Sampler {}

impl<T> ModelRuntime for T where T: Tokenizer + ChatFormatter + InferenceEngine + Sampler {}

/// One-time engine/tokenizer/encoder initialization.
pub trait RuntimeLoader {
    type Runtime: ModelRuntime;

    fn load(&self, config: &SessionConfig) -> BackendResult<Self::Runtime>;
}

impl<M> ChunkSequence for Vec<InputChunk<M>>
where
    M: MediaHandle + EmbeddingSize,
{
    fn chunk_count(&self) -> usize {
        self.len()
    }

    fn chunk_kind(&self, index: usize) -> Option<ChunkKind> {
        self.get(index).map(|chunk| match chunk {
            InputChunk::TextTokens(_) => ChunkKind::Text,
            InputChunk::EncodedMedia(m) => ChunkKind::Media(m.kind()),
        })
    }

    fn total_tokens(&self) -> usize {
        self.iter()
            .map(|chunk| match chunk {
                InputChunk::TextTokens(tokens) => tokens.len(),
                InputChunk::EncodedMedia(m) => m.n_positions(),
            })
            .sum()
    }
}

/// Context positions an encoded media chunk occupies.
pub trait EmbeddingSize {
    fn n_positions(&self) -> usize;
}
