use std::time::{Duration, Instant};

use super::stop_conditions::Antiprompt;
use crate::backend::{ModelRuntime, TokenBatch};
use crate::cancel::CancellationContext;
use crate::{Position, SessionError, Token};

/// Why the loop reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfGeneration,
    Antiprompt,
    MaxTokens,
    Cancelled,
}

impl StopReason {
    pub fn is_cancelled(self) -> bool {
        self == StopReason::Cancelled
    }
}

/// Tokens committed by one loop run and their detokenized text.
#[derive(Debug, Clone)]
pub struct Generation {
    pub tokens: Vec<Token>,
    pub text: String,
    pub stop: StopReason,
    pub elapsed: Duration,
}

/// Sample, stream and decode tokens until a stop condition fires.
///
/// `n_past` advances by one for every decoded token and is left at the last
/// successful position if decoding fails. Terminating tokens (end of
/// generation, the antiprompt suffix, a token sampled after cancellation)
/// are not committed.
pub fn generate<R: ModelRuntime>(
    runtime: &mut R,
    n_past: &mut Position,
    max_tokens: usize,
    antiprompt: &Antiprompt,
    cancel: &CancellationContext,
    mut on_token: impl FnMut(&str),
) -> Result<Generation, SessionError> {
    let start = Instant::now();
    let mut batch = TokenBatch::with_capacity(1);
    let mut generated: Vec<Token> = Vec::new();
    let mut stop = StopReason::MaxTokens;

    for step in 0..max_tokens {
        let token = runtime.sample(-1);
        generated.push(token);
        runtime.accept(token);

        if cancel.should_stop() {
            generated.pop();
            stop = StopReason::Cancelled;
            break;
        }
        if runtime.is_end_of_generation(token) {
            generated.pop();
            stop = StopReason::EndOfGeneration;
            break;
        }
        if antiprompt.matches(&generated) {
            generated.truncate(generated.len() - antiprompt.len());
            stop = StopReason::Antiprompt;
            break;
        }

        match runtime.token_to_piece(token) {
            Ok(piece) => on_token(&piece),
            Err(e) => log::warn!("Token {token} can't be displayed: {e}. Continuing generation."),
        }

        if cancel.should_stop() {
            generated.pop();
            stop = StopReason::Cancelled;
            break;
        }

        batch.clear();
        batch.add(token, *n_past, true);
        runtime.decode(&batch).map_err(|reason| {
            log::error!("Decode failed at step {step}, position {}: {reason}", *n_past);
            SessionError::Decode {
                position: *n_past,
                reason,
            }
        })?;
        *n_past += 1;
    }

    let text = runtime
        .detokenize(&generated)
        .map_err(|e| SessionError::Decode {
            position: *n_past,
            reason: format!("detokenize failed: {e}"),
        })?;

    log::debug!("Generation stopped ({stop:?}) after {} tokens", generated.len());

    Ok(Generation {
        tokens: generated,
        text,
        stop,
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::mock::{mock_tokenize, MockLoader, MockRuntime, MOCK_EOS};
    use crate::backend::{InferenceEngine, RuntimeLoader};
    use crate::InputChunk;

    /// Runtime with a prompt already evaluated so the sampler serves the reply.
    fn primed(loader: &MockLoader) -> (MockRuntime, Position) {
        let mut rt = loader
            .load(&crate::SessionConfig::new("m.gguf").with_mmproj("p.gguf"))
            .unwrap();
        let n_past = rt
            .eval_chunks(&vec![InputChunk::TextTokens(vec![1, 2, 3])], 0, 16)
            .unwrap();
        (rt, n_past)
    }

    fn generating() -> CancellationContext {
        let cancel = CancellationContext::new();
        cancel.begin_generation();
        cancel
    }

    #[test]
    fn test_stops_at_end_of_generation() {
        let loader = MockLoader::new().with_reply("Hi!");
        let (mut rt, mut n_past) = primed(&loader);
        let mut streamed = String::new();

        let out = generate(&mut rt, &mut n_past, usize::MAX, &Antiprompt::default(), &generating(), |p| {
            streamed.push_str(p);
        })
        .unwrap();

        assert_eq!(out.text, "Hi!");
        assert_eq!(out.stop, StopReason::EndOfGeneration);
        assert_eq!(streamed, "Hi!");
        assert_eq!(n_past, 3 + 3);

        let trace = loader.trace();
        assert_eq!(trace.decoded, vec![('H' as Token, 3), ('i' as Token, 4), ('!' as Token, 5)]);
        // the end-of-generation token is still accepted by the sampler
        assert_eq!(trace.accepted.last(), Some(&MOCK_EOS));
    }

    #[test]
    fn test_max_tokens_bounds_the_loop() {
        let loader = MockLoader::new().with_reply("abcdef");
        let (mut rt, mut n_past) = primed(&loader);

        let out = generate(&mut rt, &mut n_past, 2, &Antiprompt::default(), &generating(), |_| {}).unwrap();
        assert_eq!(out.text, "ab");
        assert_eq!(out.stop, StopReason::MaxTokens);
        assert_eq!(loader.trace().decoded.len(), 2);
    }

    #[test]
    fn test_antiprompt_stops_without_eos() {
        let mut reply = mock_tokenize("Sure.ASSISTANT:", false, true);
        reply.extend(mock_tokenize(" more text", false, true));
        let loader = MockLoader::new().with_reply_tokens(reply);
        let (mut rt, mut n_past) = primed(&loader);
        let antiprompt = Antiprompt::new(mock_tokenize("ASSISTANT:", false, true));

        let out = generate(&mut rt, &mut n_past, usize::MAX, &antiprompt, &generating(), |_| {}).unwrap();
        assert_eq!(out.stop, StopReason::Antiprompt);
        assert_eq!(out.text, "Sure.");
        // the last antiprompt token is never decoded
        assert_eq!(loader.trace().decoded.len(), "Sure.ASSISTANT".len());
    }

    #[test]
    fn test_cancel_commits_exactly_the_decoded_tokens() {
        let cancel = Arc::new(generating());
        let loader = MockLoader::new()
            .with_reply("abcdefgh")
            .cancel_after_decodes(3, cancel.clone());
        let (mut rt, mut n_past) = primed(&loader);

        let out = generate(&mut rt, &mut n_past, usize::MAX, &Antiprompt::default(), &cancel, |_| {}).unwrap();
        assert!(out.stop.is_cancelled());
        assert_eq!(out.text, "abc");
        assert_eq!(n_past, 3 + 3);
    }

    #[test]
    fn test_interrupt_flag_cancels_before_decode() {
        let loader = MockLoader::new().with_reply("abc");
        let (mut rt, mut n_past) = primed(&loader);
        let cancel = generating();

        let out = generate(&mut rt, &mut n_past, usize::MAX, &Antiprompt::default(), &cancel, |_| {
            // interrupt arrives while the first piece is being printed
            cancel.on_interrupt();
        })
        .unwrap();
        assert_eq!(out.stop, StopReason::Cancelled);
        assert!(out.text.is_empty());
        assert!(loader.trace().decoded.is_empty());
    }

    #[test]
    fn test_cancel_wins_over_end_of_generation() {
        let loader = MockLoader::new().with_reply("");
        let (mut rt, mut n_past) = primed(&loader);
        let cancel = generating();
        cancel.request_cancel();

        let out = generate(&mut rt, &mut n_past, usize::MAX, &Antiprompt::default(), &cancel, |_| {}).unwrap();
        assert_eq!(out.stop, StopReason::Cancelled);
        assert!(out.tokens.is_empty());
        assert_eq!(n_past, 3);
        assert_eq!(loader.trace().accepted.last(), Some(&MOCK_EOS));
    }

    #[test]
    fn test_decode_failure_keeps_last_good_position() {
        let loader = MockLoader::new().with_reply("abcdef").fail_decode_at(3);
        let (mut rt, mut n_past) = primed(&loader);

        let err = generate(&mut rt, &mut n_past, usize::MAX, &Antiprompt::default(), &generating(), |_| {})
            .unwrap_err();
        assert!(matches!(err, SessionError::Decode { position: 5, .. }));
        assert_eq!(n_past, 5);
    }
}
