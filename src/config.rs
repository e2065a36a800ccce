//! Resolving a [`SessionConfig`] from a JSON file and the environment.
//!
//! Precedence, lowest first: built-in defaults, config file, environment,
//! then whatever the CLI layer sets on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{SessionConfig, SessionError};

pub const MODEL_PATH_ENV: &str = "MTMD_MODEL_PATH";
pub const MMPROJ_PATH_ENV: &str = "MTMD_MMPROJ_PATH";
pub const CONTEXT_SIZE_ENV: &str = "MTMD_CONTEXT_SIZE";
pub const CHAT_TEMPLATE_ENV: &str = "MTMD_CHAT_TEMPLATE";

/// Read a config file. Unknown keys are rejected.
pub fn load_config_file(path: &Path) -> Result<SessionConfig, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("Invalid config {}: {e}", path.display()))
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: &mut SessionConfig) {
    let vars: HashMap<String, String> = [MODEL_PATH_ENV, MMPROJ_PATH_ENV, CONTEXT_SIZE_ENV, CHAT_TEMPLATE_ENV]
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| ((*key).to_string(), v)))
        .collect();
    apply_overrides(config, &vars);
}

/// Apply overrides from an explicit key/value map (testable core of
/// [`apply_env_overrides`]).
pub fn apply_overrides(config: &mut SessionConfig, vars: &HashMap<String, String>) {
    if let Some(path) = vars.get(MODEL_PATH_ENV).filter(|v| !v.is_empty()) {
        config.model_path = PathBuf::from(path);
    }
    if let Some(path) = vars.get(MMPROJ_PATH_ENV).filter(|v| !v.is_empty()) {
        config.mmproj_path = Some(PathBuf::from(path));
    }
    if let Some(raw) = vars.get(CONTEXT_SIZE_ENV) {
        match raw.trim().parse::<u32>() {
            Ok(n_ctx) if n_ctx > 0 => config.n_ctx = n_ctx,
            _ => log::warn!("Ignoring invalid {CONTEXT_SIZE_ENV}={raw:?}"),
        }
    }
    if let Some(template) = vars.get(CHAT_TEMPLATE_ENV).filter(|v| !v.is_empty()) {
        config.chat_template = Some(template.clone());
    }
}

/// Checks that must pass before any engine initialization.
pub fn validate(config: &SessionConfig) -> Result<(), SessionError> {
    if config.mmproj_path.is_none() {
        return Err(SessionError::Load(
            "Missing --mmproj argument: a multimodal projector is required".to_string(),
        ));
    }
    if config.n_batch == 0 {
        return Err(SessionError::Load("n_batch must be greater than zero".to_string()));
    }
    if let (Some(min), Some(max)) = (config.image_min_tokens, config.image_max_tokens) {
        if min > max {
            return Err(SessionError::Load(format!(
                "image_min_tokens ({min}) is larger than image_max_tokens ({max})"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_overrides_apply_on_top_of_file_values() {
        let mut config = SessionConfig::new("from-file.gguf");
        apply_overrides(
            &mut config,
            &vars(&[
                (MODEL_PATH_ENV, "env.gguf"),
                (MMPROJ_PATH_ENV, "env-mmproj.gguf"),
                (CONTEXT_SIZE_ENV, "8192"),
                (CHAT_TEMPLATE_ENV, "vicuna"),
            ]),
        );
        assert_eq!(config.model_path, PathBuf::from("env.gguf"));
        assert_eq!(config.mmproj_path, Some(PathBuf::from("env-mmproj.gguf")));
        assert_eq!(config.n_ctx, 8192);
        assert_eq!(config.chat_template.as_deref(), Some("vicuna"));
    }

    #[test]
    fn test_invalid_context_size_is_ignored() {
        let mut config = SessionConfig::new("m.gguf");
        apply_overrides(&mut config, &vars(&[(CONTEXT_SIZE_ENV, "lots")]));
        assert_eq!(config.n_ctx, 4096);
    }

    #[test]
    fn test_missing_mmproj_is_a_load_error() {
        let err = validate(&SessionConfig::new("m.gguf")).unwrap_err();
        assert!(matches!(err, SessionError::Load(ref msg) if msg.contains("--mmproj")));
        assert!(validate(&SessionConfig::new("m.gguf").with_mmproj("p.gguf")).is_ok());
    }

    #[test]
    fn test_inverted_image_token_bounds_rejected() {
        let mut config = SessionConfig::new("m.gguf").with_mmproj("p.gguf");
        config.image_min_tokens = Some(1024);
        config.image_max_tokens = Some(256);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"model_path": "m.gguf", "mmproj_path": "p.gguf", "n_predict": 64, "chat_template": "deepseek"}}"#
        )
        .unwrap();

        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.max_tokens(), 64);
        assert_eq!(config.chat_template.as_deref(), Some("deepseek"));

        assert!(load_config_file(Path::new("/nonexistent/config.json")).is_err());
    }
}
