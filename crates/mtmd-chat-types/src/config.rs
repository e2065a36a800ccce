use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Resolved, read-only session configuration.
///
/// Built once before `load()` and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub model_path: PathBuf,
    /// Multimodal projector (mmproj) file. Required at load time.
    #[serde(default)]
    pub mmproj_path: Option<PathBuf>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_penalty_last_n")]
    pub penalty_last_n: i32,
    #[serde(default = "default_seed")]
    pub seed: u32,
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,
    /// Maximum tokens per turn. Negative means unbounded.
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,
    #[serde(default = "default_n_threads")]
    pub n_threads: i32,
    #[serde(default)]
    pub n_gpu_layers: u32,
    #[serde(default = "default_true")]
    pub mmproj_use_gpu: bool,
    #[serde(default)]
    pub flash_attention: bool,
    #[serde(default = "default_true")]
    pub warmup: bool,
    /// Chat template override: a built-in template name or a full template.
    #[serde(default)]
    pub chat_template: Option<String>,
    #[serde(default)]
    pub use_jinja: bool,
    #[serde(default)]
    pub image_min_tokens: Option<u32>,
    #[serde(default)]
    pub image_max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    // lower than the usual 0.8 for better multimodal answers
    0.2
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    0.95
}

fn default_min_p() -> f32 {
    0.05
}

fn default_repeat_penalty() -> f32 {
    1.0
}

fn default_penalty_last_n() -> i32 {
    64
}

fn default_seed() -> u32 {
    1234
}

fn default_n_ctx() -> u32 {
    4096
}

fn default_n_batch() -> usize {
    2048
}

fn default_n_predict() -> i32 {
    -1
}

fn default_n_threads() -> i32 {
    4
}

fn default_true() -> bool {
    true
}

impl SessionConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            mmproj_path: None,
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            repeat_penalty: default_repeat_penalty(),
            penalty_last_n: default_penalty_last_n(),
            seed: default_seed(),
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_predict: default_n_predict(),
            n_threads: default_n_threads(),
            n_gpu_layers: 0,
            mmproj_use_gpu: true,
            flash_attention: false,
            warmup: true,
            chat_template: None,
            use_jinja: false,
            image_min_tokens: None,
            image_max_tokens: None,
        }
    }

    pub fn with_mmproj(mut self, mmproj_path: impl Into<PathBuf>) -> Self {
        self.mmproj_path = Some(mmproj_path.into());
        self
    }

    /// Step budget for one generation loop.
    pub fn max_tokens(&self) -> usize {
        usize::try_from(self.n_predict).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_n_predict_is_unbounded() {
        let mut config = SessionConfig::new("model.gguf");
        assert_eq!(config.max_tokens(), usize::MAX);
        config.n_predict = 32;
        assert_eq!(config.max_tokens(), 32);
        config.n_predict = 0;
        assert_eq!(config.max_tokens(), 0);
    }

    #[test]
    fn test_json_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"model_path": "m.gguf", "mmproj_path": "p.gguf"}"#).unwrap();
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.n_batch, 2048);
        assert!(config.mmproj_use_gpu);
        assert_eq!(config, SessionConfig::new("m.gguf").with_mmproj("p.gguf"));
    }

    #[test]
    fn test_json_rejects_unknown_keys() {
        let parsed: Result<SessionConfig, _> =
            serde_json::from_str(r#"{"model_path": "m.gguf", "temprature": 0.5}"#);
        assert!(parsed.is_err());
    }
}
