use std::ffi::CString;
use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::mtmd::{
    mtmd_default_marker, MtmdBitmap, MtmdContext, MtmdContextParams, MtmdInputChunkType, MtmdInputChunks,
    MtmdInputText,
};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use super::{
    BackendResult, ChatFormatter, ChunkSequence, InferenceEngine, MediaEncoder, MediaHandle, RuntimeLoader, Sampler,
    TokenBatch, Tokenizer,
};
use crate::{ChunkKind, MediaKind, Message, Position, SessionConfig, TextInput, Token};

/// Loads llama.cpp model, context, sampler and mtmd projector.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaLoader;

impl LlamaLoader {
    pub fn new() -> Self {
        Self
    }
}

impl RuntimeLoader for LlamaLoader {
    type Runtime = LlamaRuntime;

    fn load(&self, config: &SessionConfig) -> BackendResult<LlamaRuntime> {
        LlamaRuntime::load(config)
    }
}

/// One loaded model with its context, sampler and projector.
///
/// SAFETY: `context` stores a `LlamaContext` whose lifetime is erased to
/// `'static`. It really borrows `model`, which is boxed so its address is
/// stable. Fields drop in declaration order, so everything that touches the
/// model is released before the model, and the model before the backend.
pub struct LlamaRuntime {
    sampler: LlamaSampler,
    batch: LlamaBatch,
    mtmd: MtmdContext,
    context: LlamaContext<'static>,
    model: Box<LlamaModel>,
    _backend: LlamaBackend,
    marker: String,
}

/// Sampler chain: penalties → top-k → top-p → min-p → temperature → seeded
/// distribution. A non-positive temperature means greedy.
fn build_sampler(config: &SessionConfig, n_vocab: i32) -> LlamaSampler {
    let mut s: Vec<LlamaSampler> = Vec::new();
    if (config.repeat_penalty - 1.0).abs() > f32::EPSILON {
        s.push(LlamaSampler::penalties(n_vocab, config.penalty_last_n, config.repeat_penalty, 0.0, 0.0));
    }
    if config.temperature <= 0.0 {
        log::info!("Using greedy sampler");
        s.push(LlamaSampler::greedy());
        return LlamaSampler::chain_simple(s);
    }
    log::info!(
        "Using sampler chain: top_k={}, top_p={}, min_p={}, temp={}, seed={}",
        config.top_k,
        config.top_p,
        config.min_p,
        config.temperature,
        config.seed
    );
    s.push(LlamaSampler::top_k(config.top_k));
    s.push(LlamaSampler::top_p(config.top_p, 1));
    if config.min_p > 0.0 {
        s.push(LlamaSampler::min_p(config.min_p, 1));
    }
    s.push(LlamaSampler::temp(config.temperature));
    s.push(LlamaSampler::dist(config.seed));
    LlamaSampler::chain_simple(s)
}

/// Projector image token bound, -1 selects the model default.
fn token_bound(bound: Option<u32>) -> i32 {
    bound.map_or(-1, |n| i32::try_from(n).unwrap_or(i32::MAX))
}

fn looks_like_jinja(template: &str) -> bool {
    template.contains("{%") || template.contains("{{")
}

impl LlamaRuntime {
    fn load(config: &SessionConfig) -> BackendResult<Self> {
        let backend = LlamaBackend::init().map_err(|e| format!("Backend init failed: {e}"))?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers);
        let model = LlamaModel::load_from_file(&backend, &config.model_path, &model_params)
            .map_err(|e| format!("Failed to load model {}: {e}", config.model_path.display()))?;
        let model = Box::new(model);
        log::info!("Model loaded ({} GPU layers)", config.n_gpu_layers);

        let mmproj = config
            .mmproj_path
            .as_deref()
            .ok_or_else(|| "Missing --mmproj argument".to_string())?;
        let marker = mtmd_default_marker().to_string();
        let mtmd_params = MtmdContextParams {
            use_gpu: config.mmproj_use_gpu,
            print_timings: false,
            n_threads: config.n_threads,
            media_marker: CString::new(marker.clone()).map_err(|e| e.to_string())?,
            image_min_tokens: token_bound(config.image_min_tokens),
            image_max_tokens: token_bound(config.image_max_tokens),
        };
        let mtmd = MtmdContext::init_from_file(&mmproj.to_string_lossy(), &model, &mtmd_params)
            .map_err(|e| format!("Failed to load vision model from {}: {e}", mmproj.display()))?;
        log::info!(
            "Projector loaded (vision: {}, audio: {}, gpu: {}, image tokens: {}..{})",
            mtmd.support_vision(),
            mtmd.support_audio(),
            config.mmproj_use_gpu,
            mtmd_params.image_min_tokens,
            mtmd_params.image_max_tokens
        );

        let n_ctx = NonZeroU32::new(config.n_ctx).ok_or_else(|| "Context size must be non-zero".to_string())?;
        let n_batch = u32::try_from(config.n_batch).unwrap_or(u32::MAX);
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_batch)
            .with_n_threads(config.n_threads)
            .with_n_threads_batch(config.n_threads);
        if config.flash_attention {
            ctx_params = ctx_params.with_flash_attention_policy(
                1, // LLAMA_FLASH_ATTN_TYPE_ENABLED
            );
        }

        // SAFETY: see the struct docs; `model` outlives `context` by field order.
        let context = unsafe {
            let real_ctx = model
                .new_context(&backend, ctx_params)
                .map_err(|e| format!("Context creation failed: {e}"))?;
            std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(real_ctx)
        };
        log::info!("Context created (n_ctx={}, n_batch={})", config.n_ctx, config.n_batch);

        let mut runtime = Self {
            sampler: build_sampler(config, model.n_vocab()),
            batch: LlamaBatch::new(config.n_batch.max(1), 1),
            mtmd,
            context,
            model,
            _backend: backend,
            marker,
        };
        if config.warmup {
            runtime.warmup()?;
        }
        Ok(runtime)
    }

    /// Run BOS/EOS through the context once so the first turn doesn't pay for
    /// kernel setup, then forget them.
    fn warmup(&mut self) -> BackendResult<()> {
        let mut batch = TokenBatch::with_capacity(2);
        let vocab = self.model.vocab();
        batch.add(vocab.bos().0, 0, false);
        batch.add(vocab.eos().0, 1, true);
        self.decode(&batch).map_err(|e| format!("Warmup failed: {e}"))?;
        self.clear_memory();
        log::debug!("Warmup done");
        Ok(())
    }

    fn piece(&self, token: Token) -> String {
        let bytes = self.model.vocab().token_to_piece(LlamaToken(token), true, None);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Tokenizer for LlamaRuntime {
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> BackendResult<Vec<Token>> {
        let tokens = self.model.vocab().tokenize(text.as_bytes(), add_special, parse_special);
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn detokenize(&self, tokens: &[Token]) -> BackendResult<String> {
        let tokens: Vec<LlamaToken> = tokens.iter().copied().map(LlamaToken).collect();
        let bytes = self.model.vocab().detokenize(&tokens, false, true);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_to_piece(&self, token: Token) -> BackendResult<String> {
        Ok(self.piece(token))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.vocab().is_eog(LlamaToken(token))
    }
}

impl ChatFormatter for LlamaRuntime {
    fn template_source(&self, template_override: Option<&str>) -> Option<String> {
        if let Some(inline) = template_override.filter(|t| looks_like_jinja(t)) {
            return Some(inline.to_string());
        }
        self.model
            .chat_template(None)
            .ok()
            .and_then(|t| t.to_str().ok().map(str::to_string))
    }

    fn apply_builtin_template(
        &self,
        template_override: Option<&str>,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> BackendResult<Option<String>> {
        let template = match template_override {
            Some(name) => LlamaChatTemplate::new(name).map_err(|e| e.to_string())?,
            None => self.model.chat_template(None).map_err(|e| e.to_string())?,
        };
        let chat = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        self.model
            .apply_chat_template(&template, &chat, add_generation_prompt)
            .map(Some)
            .map_err(|e| e.to_string())
    }

    fn bos_token(&self) -> String {
        self.piece(self.model.vocab().bos().0)
    }

    fn eos_token(&self) -> String {
        self.piece(self.model.vocab().eos().0)
    }
}

impl MediaHandle for MtmdBitmap {
    fn kind(&self) -> MediaKind {
        if self.is_audio() {
            MediaKind::Audio
        } else {
            MediaKind::Image
        }
    }
}

impl ChunkSequence for MtmdInputChunks {
    fn chunk_count(&self) -> usize {
        self.len()
    }

    fn chunk_kind(&self, index: usize) -> Option<ChunkKind> {
        self.get(index).map(|chunk| match chunk.chunk_type() {
            MtmdInputChunkType::Text => ChunkKind::Text,
            MtmdInputChunkType::Image => ChunkKind::Media(MediaKind::Image),
            MtmdInputChunkType::Audio => ChunkKind::Media(MediaKind::Audio),
        })
    }

    fn total_tokens(&self) -> usize {
        MtmdInputChunks::total_tokens(self)
    }
}

impl MediaEncoder for LlamaRuntime {
    type Media = MtmdBitmap;
    type Chunks = MtmdInputChunks;

    fn media_marker(&self) -> &str {
        &self.marker
    }

    fn supports_vision(&self) -> bool {
        self.mtmd.support_vision()
    }

    fn supports_audio(&self) -> bool {
        self.mtmd.support_audio()
    }

    fn load_media(&self, path: &Path) -> BackendResult<MtmdBitmap> {
        MtmdBitmap::from_file(&self.mtmd, &path.to_string_lossy(), false).map_err(|e| e.to_string())
    }

    fn tokenize_chunks(&self, input: &TextInput<'_>, media: &[MtmdBitmap]) -> BackendResult<MtmdInputChunks> {
        let text = MtmdInputText {
            text: input.text.to_string(),
            add_special: input.add_special,
            parse_special: input.parse_special,
        };
        let bitmaps: Vec<&MtmdBitmap> = media.iter().collect();
        self.mtmd.tokenize(text, &bitmaps).map_err(|e| e.to_string())
    }
}

impl InferenceEngine for LlamaRuntime {
    fn eval_chunks(&mut self, chunks: &MtmdInputChunks, n_past: Position, n_batch: usize) -> BackendResult<Position> {
        let n_batch = i32::try_from(n_batch).unwrap_or(i32::MAX);
        chunks
            .eval_chunks(&mut self.mtmd, &mut self.context, n_past, 0, n_batch, true)
            .map_err(|e| e.to_string())
    }

    fn decode(&mut self, batch: &TokenBatch) -> BackendResult<()> {
        self.batch.clear();
        for (token, position, logits) in batch.iter() {
            self.batch
                .add(LlamaToken(token), position, &[0], logits)
                .map_err(|e| format!("Batch add failed at position {position}: {e}"))?;
        }
        self.context.decode(&mut self.batch).map_err(|e| e.to_string())
    }

    fn clear_memory(&mut self) {
        self.context.clear_kv_cache();
    }
}

impl Sampler for LlamaRuntime {
    fn sample(&mut self, index: i32) -> Token {
        self.sampler.sample(&self.context, index).0
    }

    fn accept(&mut self, token: Token) {
        self.sampler.accept(LlamaToken(token));
    }
}
