//! Shared data types for the multimodal chat session driver.
//!
//! Kept free of any engine dependency so both the session core and the
//! backends can agree on messages, chunks and configuration.

mod chunk;
mod config;
mod message;

pub use chunk::{ChunkKind, InputChunk, MediaKind, TextInput};
pub use config::SessionConfig;
pub use message::{ChatRole, History, Message};

/// Token id as understood by the inference engine.
pub type Token = i32;

/// Position inside the engine context (`n_past`).
pub type Position = i32;
