use serde::{Deserialize, Serialize};

use crate::Token;

/// Kind of decoded media held by an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => f.write_str("image"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

/// Discriminant of an engine input chunk, used for summaries and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Text,
    Media(MediaKind),
}

/// One indivisible unit of engine input.
///
/// Produced by tokenizing a formatted turn and consumed exactly once by the
/// engine submission call.
#[derive(Debug, Clone, PartialEq)]
pub enum InputChunk<M> {
    TextTokens(Vec<Token>),
    EncodedMedia(M),
}

impl<M> InputChunk<M> {
    pub fn is_media(&self) -> bool {
        matches!(self, InputChunk::EncodedMedia(_))
    }
}

/// Text handed to the chunk tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct TextInput<'a> {
    pub text: &'a str,
    /// Prepend the beginning-of-sequence marker.
    pub add_special: bool,
    /// Recognise special tokens (including the media marker) in `text`.
    pub parse_special: bool,
}
