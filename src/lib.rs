//! Conversational session driver for multimodal llama.cpp models.
//!
//! A [`SessionController`] owns the chat history and the context cursor,
//! turns a user turn (text plus image/audio attachments) into engine input,
//! evaluates it and then runs the token-by-token generation loop.
//! Engine, sampler, tokenizer, media encoder and chat template are reached
//! through the traits in [`backend`].

pub mod backend;
pub mod cancel;
pub mod chat;
pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod session;

pub use cancel::{CancellationContext, InterruptAction};
pub use error::{SessionError, TurnOutput, TurnStatus};
pub use mtmd_chat_types::{
    ChatRole, ChunkKind, History, InputChunk, MediaKind, Message, Position, SessionConfig, TextInput,
    Token,
};
pub use session::SessionController;
