//! Session lifecycle and per-turn orchestration.
//!
//! [`SessionController`] is created unloaded. [`SessionController::load`]
//! initializes the backend once; every turn then runs
//! media loading → prompt assembly → evaluation → generation and records the
//! result in the history. History and the context cursor are only ever
//! reset together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{ChatFormatter, MediaEncoder, ModelRuntime, RuntimeLoader};
use crate::cancel::CancellationContext;
use crate::chat::{self, Antiprompt, ChatTemplates};
use crate::media::{load_attachment, MediaQueue};
use crate::{
    config, History, MediaKind, Message, Position, SessionConfig, SessionError, TurnOutput, TurnStatus,
};

const MISSING_TEMPLATE: &str = "Model does not have a chat template.\n  \
For old llava models, you may need to use '--chat-template vicuna'\n  \
For MobileVLM models, use '--chat-template deepseek'\n  \
For Mistral Small 3.1, use '--chat-template mistral-v7'";

/// State that only exists while the backend is loaded.
struct LoadedSession<R: ModelRuntime> {
    runtime: R,
    templates: ChatTemplates,
    antiprompt: Antiprompt,
    history: History,
    n_past: Position,
    pending: MediaQueue<R::Media>,
}

impl<R: ModelRuntime> LoadedSession<R> {
    fn reset(&mut self) {
        self.history.clear();
        self.n_past = 0;
        self.pending.drain();
        self.runtime.clear_memory();
    }

    fn queue(&mut self, path: &Path) -> Result<MediaKind, SessionError> {
        let media = load_attachment(&self.runtime, path)?;
        Ok(self.pending.push(media))
    }
}

pub struct SessionController<L: RuntimeLoader> {
    loader: L,
    config: SessionConfig,
    cancel: Arc<CancellationContext>,
    state: Option<LoadedSession<L::Runtime>>,
}

impl<L: RuntimeLoader> SessionController<L> {
    pub fn new(loader: L, config: SessionConfig, cancel: Arc<CancellationContext>) -> Self {
        Self {
            loader,
            config,
            cancel,
            state: None,
        }
    }

    /// One-time engine, projector and template initialization.
    ///
    /// Loading an already loaded session is a no-op. On failure the session
    /// stays unloaded.
    pub fn load(&mut self) -> Result<(), SessionError> {
        if self.state.is_some() {
            return Ok(());
        }
        config::validate(&self.config)?;

        log::info!("Loading model {}", self.config.model_path.display());
        if let Some(mmproj) = &self.config.mmproj_path {
            log::info!("Loading projector {}", mmproj.display());
        }
        let runtime = self.loader.load(&self.config).map_err(|e| {
            log::error!("Failed to load model: {e}");
            SessionError::Load(e)
        })?;

        if self.config.chat_template.is_none() && runtime.template_source(None).is_none() {
            log::error!("{MISSING_TEMPLATE}");
            return Err(SessionError::Load(MISSING_TEMPLATE.to_string()));
        }

        let templates = ChatTemplates::new(&runtime, &self.config);
        let example = templates
            .format_example(&runtime)
            .map_err(|e| SessionError::Load(format!("chat template cannot be applied: {e}")))?;
        log::info!("Chat template example:\n{example}");

        let antiprompt = Antiprompt::for_template(self.config.chat_template.as_deref(), &runtime)
            .map_err(|e| SessionError::Load(format!("failed to tokenize antiprompt: {e}")))?;
        if !antiprompt.is_empty() {
            log::info!("Using antiprompt of {} tokens", antiprompt.len());
        }

        log::info!(
            "Model loaded (vision: {}, audio: {}, marker: {})",
            runtime.supports_vision(),
            runtime.supports_audio(),
            runtime.media_marker()
        );

        self.state = Some(LoadedSession {
            runtime,
            templates,
            antiprompt,
            history: History::new(),
            n_past: 0,
            pending: MediaQueue::new(),
        });
        Ok(())
    }

    /// Release the backend. History and position go with it.
    pub fn unload(&mut self) {
        if self.state.take().is_some() {
            log::info!("Model unloaded");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    /// Decode one attachment and queue it for the next turn.
    pub fn queue_media(&mut self, path: &Path) -> Result<MediaKind, SessionError> {
        let state = self.state.as_mut().ok_or(SessionError::NotLoaded)?;
        let kind = state.queue(path).inspect_err(|e| log::error!("{e}"))?;
        log::info!("{} {kind} loaded", path.display());
        Ok(kind)
    }

    pub fn pending_media(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.pending.len())
    }

    /// Run one user turn and return the assistant's reply.
    ///
    /// `media` is loaded and queued after anything already queued with
    /// [`Self::queue_media`]. When `text` has no media marker, one marker per
    /// queued attachment is appended. Streamed pieces go to `on_token` as a
    /// live preview; the returned text is the authoritative reply.
    pub fn submit_turn(
        &mut self,
        text: &str,
        media: &[PathBuf],
        on_token: impl FnMut(&str),
    ) -> Result<TurnOutput, SessionError> {
        let state = self.state.as_mut().ok_or(SessionError::NotLoaded)?;

        for path in media {
            if let Err(e) = state.queue(path) {
                state.pending.drain();
                log::error!("{e}");
                return Err(e);
            }
        }

        self.cancel.begin_generation();
        let result = run_turn(state, &self.config, &self.cancel, text, on_token);
        self.cancel.end_generation();

        if matches!(&result, Ok(out) if out.is_cancelled()) {
            // a programmatic cancel only applies to the turn it stopped
            self.cancel.clear_requested_cancel();
        }
        result
    }

    /// Clear history, context position, queued media and engine memory.
    pub fn reset(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.reset();
            log::info!("Chat history cleared");
        }
    }

    pub fn history(&self) -> &[Message] {
        self.state
            .as_ref()
            .map(|s| s.history.as_slice())
            .unwrap_or_default()
    }

    pub fn n_past(&self) -> Position {
        self.state.as_ref().map_or(0, |s| s.n_past)
    }

    pub fn media_marker(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.runtime.media_marker())
    }

    pub fn supports_vision(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.runtime.supports_vision())
    }

    pub fn supports_audio(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.runtime.supports_audio())
    }

    pub fn antiprompt(&self) -> Option<&Antiprompt> {
        self.state.as_ref().map(|s| &s.antiprompt)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &Arc<CancellationContext> {
        &self.cancel
    }
}

impl<L: RuntimeLoader> Drop for SessionController<L> {
    fn drop(&mut self) {
        self.unload();
    }
}

fn run_turn<R: ModelRuntime>(
    state: &mut LoadedSession<R>,
    config: &SessionConfig,
    cancel: &CancellationContext,
    text: &str,
    on_token: impl FnMut(&str),
) -> Result<TurnOutput, SessionError> {
    let content = chat::merge_media_markers(text, state.runtime.media_marker(), state.pending.len());
    let add_special = state.history.is_empty();

    let formatted = chat::add_and_format(&state.templates, &state.runtime, &mut state.history, Message::user(content))
        .map_err(|e| {
            state.pending.drain();
            log::error!("Unable to format prompt: {e}");
            SessionError::Tokenize(e)
        })?;

    if cancel.should_stop() {
        state.pending.drain();
        log::info!("Turn cancelled before evaluation");
        return Ok(TurnOutput {
            text: String::new(),
            status: TurnStatus::Cancelled,
            n_generated: 0,
            n_past: state.n_past,
            prompt_tok_per_sec: None,
            gen_tok_per_sec: None,
        });
    }

    let evaluation = chat::evaluate(
        &mut state.runtime,
        state.n_past,
        &formatted,
        add_special,
        &mut state.pending,
        config.n_batch,
    )?;
    state.n_past = evaluation.n_past;

    let generation = chat::generate(
        &mut state.runtime,
        &mut state.n_past,
        config.max_tokens(),
        &state.antiprompt,
        cancel,
        on_token,
    )?;

    let prompt_tok_per_sec = tokens_per_sec(evaluation.n_tokens, evaluation.elapsed.as_secs_f64());
    let gen_tok_per_sec = tokens_per_sec(generation.tokens.len(), generation.elapsed.as_secs_f64());
    log::info!(
        "Turn finished ({:?}): prompt={:.1} tok/s ({} tokens), gen={:.1} tok/s ({} tokens), n_past={}",
        generation.stop,
        prompt_tok_per_sec.unwrap_or(0.0),
        evaluation.n_tokens,
        gen_tok_per_sec.unwrap_or(0.0),
        generation.tokens.len(),
        state.n_past
    );

    let status = if generation.stop.is_cancelled() {
        TurnStatus::Cancelled
    } else {
        TurnStatus::Completed
    };
    state.history.push(Message::assistant(generation.text.clone()));

    Ok(TurnOutput {
        text: generation.text,
        status,
        n_generated: generation.tokens.len(),
        n_past: state.n_past,
        prompt_tok_per_sec,
        gen_tok_per_sec,
    })
}

#[allow(clippy::cast_precision_loss)]
fn tokens_per_sec(n_tokens: usize, secs: f64) -> Option<f64> {
    (secs > 0.0 && n_tokens > 0).then(|| n_tokens as f64 / secs)
}
