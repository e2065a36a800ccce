// Scripted backend for tests and dry runs.
//
// Character-level tokenizer, scripted sampler replies, real media decoding
// (PNG/JPEG through `image`, WAV through `hound`) and failure injection.
// Everything the session does to it is recorded in a shared `MockTrace`.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    BackendResult, ChatFormatter, EmbeddingSize, InferenceEngine, MediaEncoder, MediaHandle, RuntimeLoader,
    Sampler, TokenBatch, Tokenizer,
};
use crate::cancel::CancellationContext;
use crate::{InputChunk, MediaKind, Message, Position, SessionConfig, TextInput, Token};

pub const MOCK_MEDIA_MARKER: &str = "<__media__>";
pub const MOCK_BOS_TEXT: &str = "<s>";
pub const MOCK_EOS_TEXT: &str = "</s>";

// Special ids live above the Unicode scalar range so they never collide
// with character tokens.
pub const MOCK_BOS: Token = 0x0011_0001;
pub const MOCK_EOS: Token = 0x0011_0002;
pub const MOCK_MEDIA: Token = 0x0011_0003;

/// Side of one image patch in pixels.
const PATCH_SIZE: u32 = 14;
/// Audio positions per second of samples.
const AUDIO_POSITIONS_PER_SEC: u32 = 25;

/// Minimal ChatML-like template used when the model "has" a template.
pub const MOCK_TEMPLATE: &str = "{% for message in messages %}<|{{ message.role }}|>\n{{ message.content }}</s>\n{% endfor %}{% if add_generation_prompt %}<|assistant|>\n{% endif %}";

/// Character-level tokenization shared by the runtime and tests.
pub fn mock_tokenize(text: &str, add_special: bool, parse_special: bool) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(text.len() + 1);
    if add_special {
        tokens.push(MOCK_BOS);
    }
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if parse_special {
            let special = [
                (MOCK_MEDIA_MARKER, MOCK_MEDIA),
                (MOCK_EOS_TEXT, MOCK_EOS),
                (MOCK_BOS_TEXT, MOCK_BOS),
            ]
            .into_iter()
            .find(|(marker, _)| rest.starts_with(marker));
            if let Some((marker, token)) = special {
                tokens.push(token);
                rest = &rest[marker.len()..];
                continue;
            }
        }
        tokens.push(c as Token);
        rest = &rest[c.len_utf8()..];
    }
    tokens
}

fn piece(token: Token) -> BackendResult<String> {
    match token {
        MOCK_BOS => Ok(MOCK_BOS_TEXT.to_string()),
        MOCK_EOS => Ok(MOCK_EOS_TEXT.to_string()),
        MOCK_MEDIA => Ok(MOCK_MEDIA_MARKER.to_string()),
        _ => u32::try_from(token)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .ok_or_else(|| format!("invalid token id {token}")),
    }
}

/// Decoded attachment: what kind it is and how many positions it embeds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMedia {
    kind: MediaKind,
    n_tokens: usize,
}

impl MockMedia {
    pub fn image(n_tokens: usize) -> Self {
        Self {
            kind: MediaKind::Image,
            n_tokens,
        }
    }

    pub fn audio(n_tokens: usize) -> Self {
        Self {
            kind: MediaKind::Audio,
            n_tokens,
        }
    }
}

impl MediaHandle for MockMedia {
    fn kind(&self) -> MediaKind {
        self.kind
    }
}

impl EmbeddingSize for MockMedia {
    fn n_positions(&self) -> usize {
        self.n_tokens
    }
}

/// Everything the session did to the backend.
#[derive(Debug, Default, Clone)]
pub struct MockTrace {
    pub loads: usize,
    /// Formatted prompts handed to the chunk tokenizer, with `add_special`.
    pub prompts: Vec<(String, bool)>,
    /// Sizes of the text batches submitted during prompt evaluation.
    pub eval_batches: Vec<usize>,
    pub media_evaluated: usize,
    /// `(token, position)` of every single-token decode.
    pub decoded: Vec<(Token, Position)>,
    pub accepted: Vec<Token>,
    pub memory_clears: usize,
}

#[derive(Debug, Default, Clone)]
struct Failures {
    load: Option<String>,
    tokenize: bool,
    eval: bool,
    /// Fail the n-th decode call (1-based) since load.
    decode_at: Option<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder and factory for [`MockRuntime`].
#[derive(Clone, Default)]
pub struct MockLoader {
    replies: Arc<Mutex<VecDeque<Vec<Token>>>>,
    trace: Arc<Mutex<MockTrace>>,
    failures: Failures,
    without_template: bool,
    audio: bool,
    cancel_after: Option<(usize, Arc<CancellationContext>)>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply that ends with the end-of-generation token.
    pub fn with_reply(self, text: &str) -> Self {
        let mut tokens = mock_tokenize(text, false, false);
        tokens.push(MOCK_EOS);
        self.with_reply_tokens(tokens)
    }

    /// Queue raw sampler output for one turn. When it runs out the sampler
    /// keeps returning end-of-generation.
    pub fn with_reply_tokens(self, tokens: Vec<Token>) -> Self {
        lock(&self.replies).push_back(tokens);
        self
    }

    pub fn without_template(mut self) -> Self {
        self.without_template = true;
        self
    }

    pub fn with_audio_support(mut self) -> Self {
        self.audio = true;
        self
    }

    pub fn fail_load(mut self, reason: &str) -> Self {
        self.failures.load = Some(reason.to_string());
        self
    }

    pub fn fail_tokenize(mut self) -> Self {
        self.failures.tokenize = true;
        self
    }

    pub fn fail_eval(mut self) -> Self {
        self.failures.eval = true;
        self
    }

    pub fn fail_decode_at(mut self, call: usize) -> Self {
        self.failures.decode_at = Some(call);
        self
    }

    /// Request cancellation right after the n-th successful decode.
    pub fn cancel_after_decodes(mut self, n: usize, cancel: Arc<CancellationContext>) -> Self {
        self.cancel_after = Some((n, cancel));
        self
    }

    pub fn trace(&self) -> MockTrace {
        lock(&self.trace).clone()
    }
}

impl RuntimeLoader for MockLoader {
    type Runtime = MockRuntime;

    fn load(&self, config: &SessionConfig) -> BackendResult<MockRuntime> {
        if let Some(reason) = &self.failures.load {
            return Err(reason.clone());
        }
        lock(&self.trace).loads += 1;
        Ok(MockRuntime {
            replies: self.replies.clone(),
            trace: self.trace.clone(),
            failures: self.failures.clone(),
            has_template: !self.without_template,
            audio: self.audio,
            cancel_after: self.cancel_after.clone(),
            n_ctx: Position::try_from(config.n_ctx).unwrap_or(Position::MAX),
            image_min_tokens: config.image_min_tokens.map_or(1, |n| n as usize),
            image_max_tokens: config.image_max_tokens.map_or(usize::MAX, |n| n as usize),
            current: VecDeque::new(),
            pending_reply: false,
            decode_calls: 0,
        })
    }
}

/// In-process stand-in for model, context, sampler and projector.
pub struct MockRuntime {
    replies: Arc<Mutex<VecDeque<Vec<Token>>>>,
    trace: Arc<Mutex<MockTrace>>,
    failures: Failures,
    has_template: bool,
    audio: bool,
    cancel_after: Option<(usize, Arc<CancellationContext>)>,
    n_ctx: Position,
    image_min_tokens: usize,
    image_max_tokens: usize,
    current: VecDeque<Token>,
    pending_reply: bool,
    decode_calls: usize,
}

impl MockRuntime {
    fn image_positions(&self, width: u32, height: u32) -> usize {
        let patches = (width.div_ceil(PATCH_SIZE) * height.div_ceil(PATCH_SIZE)) as usize;
        patches.clamp(self.image_min_tokens, self.image_max_tokens.max(self.image_min_tokens))
    }
}

impl Tokenizer for MockRuntime {
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> BackendResult<Vec<Token>> {
        Ok(mock_tokenize(text, add_special, parse_special))
    }

    fn detokenize(&self, tokens: &[Token]) -> BackendResult<String> {
        tokens.iter().map(|&t| piece(t)).collect()
    }

    fn token_to_piece(&self, token: Token) -> BackendResult<String> {
        piece(token)
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == MOCK_EOS
    }
}

impl ChatFormatter for MockRuntime {
    fn template_source(&self, template_override: Option<&str>) -> Option<String> {
        match template_override {
            Some(inline) if inline.contains("{%") || inline.contains("{{") => Some(inline.to_string()),
            _ if self.has_template => Some(MOCK_TEMPLATE.to_string()),
            _ => None,
        }
    }

    fn apply_builtin_template(
        &self,
        _template_override: Option<&str>,
        _messages: &[Message],
        _add_generation_prompt: bool,
    ) -> BackendResult<Option<String>> {
        Ok(None)
    }

    fn bos_token(&self) -> String {
        MOCK_BOS_TEXT.to_string()
    }

    fn eos_token(&self) -> String {
        MOCK_EOS_TEXT.to_string()
    }
}

impl MediaEncoder for MockRuntime {
    type Media = MockMedia;
    type Chunks = Vec<InputChunk<MockMedia>>;

    fn media_marker(&self) -> &str {
        MOCK_MEDIA_MARKER
    }

    fn supports_vision(&self) -> bool {
        true
    }

    fn supports_audio(&self) -> bool {
        self.audio
    }

    fn load_media(&self, path: &Path) -> BackendResult<MockMedia> {
        let bytes = std::fs::read(path).map_err(|e| e.to_string())?;

        if let Ok(img) = image::load_from_memory(&bytes) {
            return Ok(MockMedia::image(self.image_positions(img.width(), img.height())));
        }

        if let Ok(reader) = hound::WavReader::new(Cursor::new(&bytes)) {
            if !self.audio {
                return Err("audio input is not supported by this projector".to_string());
            }
            let spec = reader.spec();
            let frames = reader.duration();
            let per_position = (spec.sample_rate / AUDIO_POSITIONS_PER_SEC).max(1);
            return Ok(MockMedia::audio(frames.div_ceil(per_position).max(1) as usize));
        }

        Err("unsupported media format".to_string())
    }

    fn tokenize_chunks(&self, input: &TextInput<'_>, media: &[MockMedia]) -> BackendResult<Self::Chunks> {
        lock(&self.trace)
            .prompts
            .push((input.text.to_string(), input.add_special));

        if self.failures.tokenize {
            return Err("mock tokenizer rejected the prompt".to_string());
        }

        let parts: Vec<&str> = input.text.split(MOCK_MEDIA_MARKER).collect();
        let n_markers = parts.len() - 1;
        if n_markers != media.len() {
            return Err(format!(
                "number of bitmaps ({}) does not match number of markers ({n_markers})",
                media.len()
            ));
        }

        let mut chunks = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let tokens = mock_tokenize(part, input.add_special && i == 0, input.parse_special);
            if !tokens.is_empty() {
                chunks.push(InputChunk::TextTokens(tokens));
            }
            if let Some(m) = media.get(i) {
                chunks.push(InputChunk::EncodedMedia(m.clone()));
            }
        }
        Ok(chunks)
    }
}

impl InferenceEngine for MockRuntime {
    fn eval_chunks(&mut self, chunks: &Self::Chunks, n_past: Position, n_batch: usize) -> BackendResult<Position> {
        if self.failures.eval {
            return Err("mock engine rejected the batch".to_string());
        }
        let mut trace = lock(&self.trace);
        let mut pos = n_past;
        for chunk in chunks {
            match chunk {
                InputChunk::TextTokens(tokens) => {
                    for batch in tokens.chunks(n_batch.max(1)) {
                        trace.eval_batches.push(batch.len());
                        pos += batch.len() as Position;
                    }
                }
                InputChunk::EncodedMedia(m) => {
                    trace.media_evaluated += 1;
                    pos += m.n_tokens as Position;
                }
            }
            if pos > self.n_ctx {
                return Err(format!("context full ({pos} > {})", self.n_ctx));
            }
        }
        self.pending_reply = true;
        Ok(pos)
    }

    fn decode(&mut self, batch: &TokenBatch) -> BackendResult<()> {
        self.decode_calls += 1;
        if self.failures.decode_at == Some(self.decode_calls) {
            return Err("mock decode failure".to_string());
        }
        lock(&self.trace).decoded.extend(batch.iter().map(|(t, p, _)| (t, p)));
        if let Some((n, cancel)) = &self.cancel_after {
            if self.decode_calls == *n {
                cancel.request_cancel();
            }
        }
        Ok(())
    }

    fn clear_memory(&mut self) {
        self.current.clear();
        lock(&self.trace).memory_clears += 1;
    }
}

impl Sampler for MockRuntime {
    fn sample(&mut self, _index: i32) -> Token {
        if self.pending_reply {
            self.pending_reply = false;
            self.current = lock(&self.replies).pop_front().unwrap_or_default().into();
        }
        self.current.pop_front().unwrap_or(MOCK_EOS)
    }

    fn accept(&mut self, token: Token) {
        lock(&self.trace).accepted.push(token);
    }
}
