// Stop condition checking for models without a native end-of-generation token

use crate::backend::Tokenizer;
use crate::Token;

/// Template identities that need a fixed stop sequence, with the marker text.
pub const LEGACY_ANTIPROMPTS: &[(&str, &str)] = &[("vicuna", "ASSISTANT:"), ("deepseek", "###")];

/// Fixed token sequence that ends a turn when it appears at the end of the
/// generated tokens. Empty means "never matches".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Antiprompt {
    tokens: Vec<Token>,
}

impl Antiprompt {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    /// Antiprompt for a configured template identity.
    ///
    /// Only the legacy identifiers get one; any other identity, or no
    /// identity at all, yields an empty antiprompt.
    pub fn for_template<T: Tokenizer>(template: Option<&str>, tokenizer: &T) -> Result<Self, String> {
        let Some(marker) = template.and_then(legacy_marker) else {
            return Ok(Self::default());
        };
        let tokens = tokenizer.tokenize(marker, false, true)?;
        Ok(Self::new(tokens))
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Exact suffix equality against the generated tokens.
    pub fn matches(&self, generated: &[Token]) -> bool {
        !self.tokens.is_empty() && generated.ends_with(&self.tokens)
    }
}

fn legacy_marker(template: &str) -> Option<&'static str> {
    LEGACY_ANTIPROMPTS
        .iter()
        .find(|(name, _)| *name == template)
        .map(|(_, marker)| *marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{mock_tokenize, MockLoader};
    use crate::backend::RuntimeLoader;
    use crate::SessionConfig;

    #[test]
    fn test_matches_only_exact_suffix() {
        let a = Antiprompt::new(vec![3, 4]);
        assert!(a.matches(&[1, 2, 3, 4]));
        assert!(a.matches(&[3, 4]));
        assert!(!a.matches(&[3, 4, 5]));
        assert!(!a.matches(&[4]));
        assert!(!a.matches(&[]));
    }

    #[test]
    fn test_empty_antiprompt_never_matches() {
        let a = Antiprompt::default();
        assert!(!a.matches(&[]));
        assert!(!a.matches(&[1, 2, 3]));
    }

    #[test]
    fn test_suffix_property_over_windows() {
        let a = Antiprompt::new(vec![7, 8, 9]);
        let seq = [9, 7, 8, 9, 7, 8, 9, 1];
        for end in 0..=seq.len() {
            let s = &seq[..end];
            let expected = s.len() >= 3 && s[s.len() - 3..] == [7, 8, 9];
            assert_eq!(a.matches(s), expected, "prefix of length {end}");
        }
    }

    #[test]
    fn test_legacy_templates_get_markers() {
        let runtime = MockLoader::new()
            .load(&SessionConfig::new("m.gguf").with_mmproj("p.gguf"))
            .unwrap();

        let vicuna = Antiprompt::for_template(Some("vicuna"), &runtime).unwrap();
        assert_eq!(vicuna.tokens(), mock_tokenize("ASSISTANT:", false, true).as_slice());

        let deepseek = Antiprompt::for_template(Some("deepseek"), &runtime).unwrap();
        assert_eq!(deepseek.len(), 3);

        assert!(Antiprompt::for_template(Some("chatml"), &runtime).unwrap().is_empty());
        assert!(Antiprompt::for_template(None, &runtime).unwrap().is_empty());
    }
}
