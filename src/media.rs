//! Media attachments waiting for the next evaluation.

use std::path::Path;

use crate::backend::{MediaEncoder, MediaHandle};
use crate::{MediaKind, SessionError};

/// Decode one file through the encoder adapter.
pub fn load_attachment<E: MediaEncoder>(encoder: &E, path: &Path) -> Result<E::Media, SessionError> {
    if !path.is_file() {
        return Err(SessionError::Media {
            path: path.to_path_buf(),
            reason: "file not found or unreadable".to_string(),
        });
    }
    encoder.load_media(path).map_err(|reason| SessionError::Media {
        path: path.to_path_buf(),
        reason,
    })
}

/// Attachments owned by the session until one evaluation consumes them.
#[derive(Debug)]
pub struct MediaQueue<M> {
    entries: Vec<M>,
}

impl<M> Default for MediaQueue<M> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<M: MediaHandle> MediaQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, media: M) -> MediaKind {
        let kind = media.kind();
        self.entries.push(media);
        kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[M] {
        &self.entries
    }

    /// Release every queued attachment.
    pub fn drain(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockLoader, MockMedia};
    use crate::backend::RuntimeLoader;
    use crate::SessionConfig;

    #[test]
    fn test_missing_file_is_media_error() {
        let runtime = MockLoader::new()
            .load(&SessionConfig::new("m.gguf").with_mmproj("p.gguf"))
            .unwrap();
        let err = load_attachment(&runtime, Path::new("/definitely/not/here.png")).unwrap_err();
        assert!(matches!(err, SessionError::Media { .. }));
    }

    #[test]
    fn test_undecodable_file_is_media_error() {
        let runtime = MockLoader::new()
            .load(&SessionConfig::new("m.gguf").with_mmproj("p.gguf"))
            .unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not an image").unwrap();
        let err = load_attachment(&runtime, file.path()).unwrap_err();
        assert!(matches!(err, SessionError::Media { ref reason, .. } if reason.contains("unsupported")));
    }

    #[test]
    fn test_queue_drain() {
        let mut queue = MediaQueue::new();
        assert_eq!(queue.push(MockMedia::image(4)), MediaKind::Image);
        assert_eq!(queue.push(MockMedia::audio(2)), MediaKind::Audio);
        assert_eq!(queue.len(), 2);
        queue.drain();
        assert!(queue.is_empty());
    }
}
