use std::path::PathBuf;

use thiserror::Error;

use crate::Position;

/// Failure of a session operation.
///
/// Every variant is local to one turn except `Load`, which keeps the session
/// unloaded.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("load failed: {0}")]
    Load(String),

    #[error("model not loaded")]
    NotLoaded,

    #[error("failed to load media {}: {reason}", path.display())]
    Media { path: PathBuf, reason: String },

    #[error("unable to tokenize prompt: {0}")]
    Tokenize(String),

    #[error("unable to eval prompt: {0}")]
    Eval(String),

    #[error("failed to decode token at position {position}: {reason}")]
    Decode { position: Position, reason: String },
}

impl SessionError {
    /// Process exit code the CLI uses for this failure.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// End-of-generation token, antiprompt, or step budget reached.
    Completed,
    /// Cooperative cancellation. The partial output is still committed.
    Cancelled,
}

/// Result of one successful (or cancelled) turn.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub text: String,
    pub status: TurnStatus,
    /// Tokens committed to the assistant message.
    pub n_generated: usize,
    /// Context position after the turn.
    pub n_past: Position,
    /// Prompt evaluation speed in tokens/second.
    pub prompt_tok_per_sec: Option<f64>,
    /// Generation speed in tokens/second.
    pub gen_tok_per_sec: Option<f64>,
}

impl TurnOutput {
    pub fn is_cancelled(&self) -> bool {
        self.status == TurnStatus::Cancelled
    }
}
