// Per-turn chat pipeline:
// - prompt.rs: media marker merging and single-message delta formatting
// - templates.rs: chat template rendering (builtin, jinja, role-tagged fallback)
// - evaluator.rs: chunk tokenization and prompt evaluation
// - generation.rs: sampling loop with streaming and cancellation checkpoints
// - stop_conditions.rs: legacy antiprompt matching

pub mod evaluator;
pub mod generation;
pub mod prompt;
pub mod stop_conditions;
pub mod templates;

pub use evaluator::{evaluate, Evaluation};
pub use generation::{generate, Generation, StopReason};
pub use prompt::{add_and_format, format_single, merge_media_markers};
pub use stop_conditions::Antiprompt;
pub use templates::ChatTemplates;
