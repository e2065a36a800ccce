//! Turning a user turn into prompt text.

use super::templates::ChatTemplates;
use crate::backend::ChatFormatter;
use crate::{ChatRole, History, Message};

/// Append one media marker per attachment unless the caller already placed
/// markers in `text`.
pub fn merge_media_markers(text: &str, marker: &str, attachments: usize) -> String {
    if attachments == 0 || text.contains(marker) {
        return text.to_string();
    }
    let mut merged = String::with_capacity(text.len() + marker.len() * attachments);
    merged.push_str(text);
    for _ in 0..attachments {
        merged.push_str(marker);
    }
    merged
}

/// Prompt text for `new_message` only: the rendering of `past + new` minus the
/// rendering of `past`.
pub fn format_single<F: ChatFormatter>(
    templates: &ChatTemplates,
    formatter: &F,
    past: &[Message],
    new_message: &Message,
    add_generation_prompt: bool,
) -> Result<String, String> {
    let fmt_past = if past.is_empty() {
        String::new()
    } else {
        templates.apply(formatter, past, false)?
    };

    let mut all = past.to_vec();
    all.push(new_message.clone());
    let fmt_new = templates.apply(formatter, &all, add_generation_prompt)?;

    let delta = match fmt_new.strip_prefix(fmt_past.as_str()) {
        Some(rest) => rest,
        None => {
            log::warn!("Chat template rendering of the history changed; using positional delta");
            fmt_new.get(fmt_past.len()..).unwrap_or(fmt_new.as_str())
        }
    };

    let mut out = String::with_capacity(delta.len() + 1);
    // the past rendering's trailing newline belongs to the new message
    if add_generation_prompt && fmt_past.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(delta);
    Ok(out)
}

/// Format `message` against `history`, then record it.
///
/// The message is appended as soon as formatting succeeds, before the turn
/// is evaluated, so a later evaluation failure leaves it in place.
pub fn add_and_format<F: ChatFormatter>(
    templates: &ChatTemplates,
    formatter: &F,
    history: &mut History,
    message: Message,
) -> Result<String, String> {
    let add_generation_prompt = message.role == ChatRole::User;
    let formatted = format_single(templates, formatter, history.as_slice(), &message, add_generation_prompt)?;
    log::debug!("Formatted {} message: {formatted:?}", message.role);
    history.push(message);
    Ok(formatted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockLoader, MockRuntime, MOCK_MEDIA_MARKER};
    use crate::backend::RuntimeLoader;
    use crate::SessionConfig;

    fn setup(use_jinja: bool) -> (ChatTemplates, MockRuntime) {
        let mut config = SessionConfig::new("m.gguf").with_mmproj("p.gguf");
        config.use_jinja = use_jinja;
        let runtime = MockLoader::new().load(&config).unwrap();
        (ChatTemplates::new(&runtime, &config), runtime)
    }

    #[test]
    fn test_markers_appended_once_per_attachment() {
        let merged = merge_media_markers("Compare these.", MOCK_MEDIA_MARKER, 3);
        assert!(merged.starts_with("Compare these."));
        assert_eq!(merged.matches(MOCK_MEDIA_MARKER).count(), 3);
        assert!(merged.ends_with(MOCK_MEDIA_MARKER));
    }

    #[test]
    fn test_caller_placed_markers_are_kept() {
        let text = format!("left {MOCK_MEDIA_MARKER} right {MOCK_MEDIA_MARKER}");
        assert_eq!(merge_media_markers(&text, MOCK_MEDIA_MARKER, 2), text);
        assert_eq!(merge_media_markers("plain", MOCK_MEDIA_MARKER, 0), "plain");
    }

    #[test]
    fn test_first_message_is_full_rendering() {
        let (templates, runtime) = setup(true);
        let mut history = History::new();
        let prompt = add_and_format(&templates, &runtime, &mut history, Message::user("hi")).unwrap();
        assert_eq!(prompt, "<|user|>\nhi</s>\n<|assistant|>\n");
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_later_message_is_only_the_delta() {
        let (templates, runtime) = setup(true);
        let mut history = History::new();
        history.push(Message::user("hi"));
        history.push(Message::assistant("hello"));

        let prompt = add_and_format(&templates, &runtime, &mut history, Message::user("again")).unwrap();
        // past rendering ends with '\n', which is carried into the delta
        assert_eq!(prompt, "\n<|user|>\nagain</s>\n<|assistant|>\n");
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_assistant_message_gets_no_generation_prompt() {
        let (templates, runtime) = setup(false);
        let mut history = History::new();
        history.push(Message::user("hi"));
        let delta = add_and_format(&templates, &runtime, &mut history, Message::assistant("yo")).unwrap();
        assert_eq!(delta, "ASSISTANT:\nyo\n\n");
    }
}
