//! Command-line front end: argument parsing, single-turn mode and the
//! interactive chat loop. Everything here is a consumer of
//! [`SessionController`]; no turn logic lives in this module.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;

use crate::backend::RuntimeLoader;
use crate::config::{apply_env_overrides, load_config_file};
use crate::{MediaKind, SessionConfig, SessionController};

#[derive(Parser, Debug, Clone)]
#[command(name = "mtmd-chat", about = "Chat with a multimodal model about images and audio")]
pub struct Args {
    /// Model GGUF file
    #[arg(short = 'm', long)]
    pub model: Option<PathBuf>,

    /// Multimodal projector GGUF file
    #[arg(long)]
    pub mmproj: Option<PathBuf>,

    /// Image file to attach (repeatable)
    #[arg(long)]
    pub image: Vec<PathBuf>,

    /// Audio file to attach (repeatable)
    #[arg(long)]
    pub audio: Vec<PathBuf>,

    /// Prompt for single-turn mode (requires at least one --image or --audio)
    #[arg(short = 'p', long)]
    pub prompt: Option<String>,

    /// Sampling temperature (default: 0.2)
    #[arg(long)]
    pub temp: Option<f32>,

    /// Maximum tokens per reply, -1 for unbounded
    #[arg(short = 'n', long, allow_hyphen_values = true)]
    pub n_predict: Option<i32>,

    /// Context size in tokens
    #[arg(short = 'c', long)]
    pub ctx_size: Option<u32>,

    /// Maximum tokens per evaluation batch
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    #[arg(short = 't', long)]
    pub threads: Option<i32>,

    /// Layers to offload to the GPU, zero is CPU only
    #[arg(long, visible_alias = "ngl")]
    pub n_gpu_layers: Option<u32>,

    #[arg(short = 's', long)]
    pub seed: Option<u32>,

    /// Built-in template name (e.g. vicuna, deepseek, mistral-v7) or full template
    #[arg(long)]
    pub chat_template: Option<String>,

    /// Render the chat template with the jinja engine
    #[arg(long)]
    pub jinja: bool,

    /// Keep the projector on the CPU
    #[arg(long)]
    pub no_mmproj_offload: bool,

    #[arg(long)]
    pub flash_attn: bool,

    #[arg(long)]
    pub no_warmup: bool,

    #[arg(long)]
    pub image_min_tokens: Option<u32>,

    #[arg(long)]
    pub image_max_tokens: Option<u32>,

    /// JSON config file, applied before environment and flags
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}

impl Args {
    /// Attachments in command-line order, images first.
    pub fn media(&self) -> Vec<PathBuf> {
        self.image.iter().chain(&self.audio).cloned().collect()
    }

    pub fn is_single_turn(&self) -> bool {
        self.prompt.is_some() && !(self.image.is_empty() && self.audio.is_empty())
    }

    /// Defaults, then the config file, then the environment, then flags.
    pub fn resolve_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_file(path).map_err(anyhow::Error::msg)?,
            None => SessionConfig::new(""),
        };
        apply_env_overrides(&mut config);
        self.apply_to(&mut config);
        if config.model_path.as_os_str().is_empty() {
            bail!("Missing --model argument");
        }
        Ok(config)
    }

    /// Flag layer of [`Self::resolve_config`].
    pub fn apply_to(&self, config: &mut SessionConfig) {
        if let Some(model) = &self.model {
            config.model_path.clone_from(model);
        }
        if let Some(mmproj) = &self.mmproj {
            config.mmproj_path = Some(mmproj.clone());
        }
        if let Some(temp) = self.temp {
            config.temperature = temp;
        }
        if let Some(n) = self.n_predict {
            config.n_predict = n;
        }
        if let Some(n_ctx) = self.ctx_size {
            config.n_ctx = n_ctx;
        }
        if let Some(n_batch) = self.batch_size {
            config.n_batch = n_batch;
        }
        if let Some(threads) = self.threads {
            config.n_threads = threads;
        }
        if let Some(layers) = self.n_gpu_layers {
            config.n_gpu_layers = layers;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(template) = &self.chat_template {
            config.chat_template = Some(template.clone());
        }
        if self.jinja {
            config.use_jinja = true;
        }
        if self.no_mmproj_offload {
            config.mmproj_use_gpu = false;
        }
        if self.flash_attn {
            config.flash_attention = true;
        }
        if self.no_warmup {
            config.warmup = false;
        }
        if self.image_min_tokens.is_some() {
            config.image_min_tokens = self.image_min_tokens;
        }
        if self.image_max_tokens.is_some() {
            config.image_max_tokens = self.image_max_tokens;
        }
    }
}

/// Process exit status of the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    Interrupted,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::Interrupted => 130,
        }
    }
}

/// One line of interactive input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Quit,
    Clear,
    Media(MediaKind, PathBuf),
    MissingMediaPath,
    Text(String),
}

impl ChatCommand {
    /// Parse a raw input line. Media commands are only recognised when the
    /// projector supports that kind; otherwise the line is ordinary text.
    /// Blank lines yield `None`.
    pub fn parse(line: &str, vision: bool, audio: bool) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line == "/quit" || line == "/exit" {
            return Some(ChatCommand::Quit);
        }
        if line == "/clear" {
            return Some(ChatCommand::Clear);
        }

        let media = [("/image", MediaKind::Image, vision), ("/audio", MediaKind::Audio, audio)];
        for (prefix, kind, supported) in media {
            let Some(rest) = line.strip_prefix(prefix) else {
                continue;
            };
            if supported && (rest.is_empty() || rest.starts_with(char::is_whitespace)) {
                let path = rest.trim();
                return Some(if path.is_empty() {
                    ChatCommand::MissingMediaPath
                } else {
                    ChatCommand::Media(kind, PathBuf::from(path))
                });
            }
        }

        Some(ChatCommand::Text(line.to_string()))
    }
}

fn print_help<W: Write>(out: &mut W, vision: bool, audio: bool) -> std::io::Result<()> {
    writeln!(out, "\n Running in chat mode, available commands:")?;
    if vision {
        writeln!(out, "   /image <path>    load an image")?;
    }
    if audio {
        writeln!(out, "   /audio <path>    load an audio")?;
    }
    writeln!(out, "   /clear           clear the chat history")?;
    writeln!(out, "   /quit or /exit   exit the program")?;
    writeln!(out)
}

fn stream_to<W: Write>(out: &mut W) -> impl FnMut(&str) + '_ {
    move |piece| {
        // stdout going away mid-reply is not a turn failure
        let _ = out.write_all(piece.as_bytes());
        let _ = out.flush();
    }
}

/// Run exactly one turn with all attachments, streaming the reply to `out`.
pub fn run_single_turn<L: RuntimeLoader, W: Write>(
    session: &mut SessionController<L>,
    prompt: &str,
    media: &[PathBuf],
    out: &mut W,
) -> ExitStatus {
    let result = session.submit_turn(prompt, media, stream_to(out));
    let _ = writeln!(out);
    match result {
        Ok(turn) if turn.is_cancelled() => ExitStatus::Interrupted,
        Ok(_) => ExitStatus::Success,
        Err(e) => {
            let _ = writeln!(out, "ERR: {e}");
            ExitStatus::Failure
        }
    }
}

/// Interactive chat over `input` until EOF, `/quit` or an idle interrupt.
pub fn run_chat<L: RuntimeLoader, R: BufRead, W: Write>(
    session: &mut SessionController<L>,
    input: R,
    out: &mut W,
) -> ExitStatus {
    let vision = session.supports_vision();
    let audio = session.supports_audio();
    let marker = session.media_marker().unwrap_or_default().to_string();
    let _ = print_help(out, vision, audio);

    let mut content = String::new();
    let mut lines = input.lines();
    loop {
        if session.cancellation().is_interrupted() {
            return ExitStatus::Interrupted;
        }
        let _ = write!(out, "\n> ");
        let _ = out.flush();

        let line = match lines.next() {
            None => return ExitStatus::Success,
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                log::error!("Failed to read input: {e}");
                return ExitStatus::Failure;
            }
        };
        if session.cancellation().is_interrupted() {
            return ExitStatus::Interrupted;
        }

        match ChatCommand::parse(&line, vision, audio) {
            None => continue,
            Some(ChatCommand::Quit) => return ExitStatus::Success,
            Some(ChatCommand::Clear) => {
                session.reset();
                content.clear();
                let _ = writeln!(out, "Chat history cleared\n");
                continue;
            }
            Some(ChatCommand::MissingMediaPath) => {
                let _ = writeln!(out, "ERR: Missing media filename");
                continue;
            }
            Some(ChatCommand::Media(_, path)) => {
                queue_for_turn(session, &path, &marker, &mut content, out);
                continue;
            }
            Some(ChatCommand::Text(text)) => content.push_str(&text),
        }

        let result = session.submit_turn(&content, &[], stream_to(out));
        let _ = writeln!(out);
        match result {
            Ok(turn) => {
                if turn.is_cancelled() {
                    let _ = writeln!(out, "[generation stopped]");
                }
                content.clear();
            }
            Err(e) => {
                let _ = writeln!(out, "ERR: {e}");
                return ExitStatus::Failure;
            }
        }
    }
}

fn queue_for_turn<L: RuntimeLoader, W: Write>(
    session: &mut SessionController<L>,
    path: &Path,
    marker: &str,
    content: &mut String,
    out: &mut W,
) {
    match session.queue_media(path) {
        Ok(kind) => {
            content.push_str(marker);
            let _ = writeln!(out, "{} {kind} loaded", path.display());
        }
        // a bad attachment only costs that command
        Err(e) => {
            let _ = writeln!(out, "ERR: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::backend::mock::{MockLoader, MOCK_MEDIA_MARKER};
    use crate::{CancellationContext, ChatRole};

    fn session(loader: MockLoader) -> SessionController<MockLoader> {
        let config = SessionConfig::new("m.gguf").with_mmproj("p.gguf");
        let mut session = SessionController::new(loader, config, Arc::new(CancellationContext::new()));
        session.load().unwrap();
        session
    }

    fn chat(session: &mut SessionController<MockLoader>, input: &str) -> (ExitStatus, String) {
        let mut out = Vec::new();
        let status = run_chat(session, Cursor::new(input.to_string()), &mut out);
        (status, String::from_utf8(out).unwrap())
    }

    fn png(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("pic.png");
        image::RgbImage::new(14, 14).save(&path).unwrap();
        path
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::Failure.code(), 1);
        assert_eq!(ExitStatus::Interrupted.code(), 130);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ChatCommand::parse("  ", true, true), None);
        assert_eq!(ChatCommand::parse("/exit", true, false), Some(ChatCommand::Quit));
        assert_eq!(ChatCommand::parse("/clear ", true, false), Some(ChatCommand::Clear));
        assert_eq!(
            ChatCommand::parse("/image  cat.png", true, false),
            Some(ChatCommand::Media(MediaKind::Image, PathBuf::from("cat.png")))
        );
        assert_eq!(ChatCommand::parse("/image", true, false), Some(ChatCommand::MissingMediaPath));
        // unsupported media commands are plain text
        assert_eq!(
            ChatCommand::parse("/audio a.wav", true, false),
            Some(ChatCommand::Text("/audio a.wav".to_string()))
        );
        // the command word must stand alone
        assert_eq!(
            ChatCommand::parse("/imagefoo.png", true, false),
            Some(ChatCommand::Text("/imagefoo.png".to_string()))
        );
        assert_eq!(
            ChatCommand::parse("/audio\tb.wav", true, true),
            Some(ChatCommand::Media(MediaKind::Audio, PathBuf::from("b.wav")))
        );
    }

    #[test]
    fn test_args_layering_and_mode() {
        let args = Args::try_parse_from([
            "mtmd-chat", "-m", "model.gguf", "--mmproj", "proj.gguf", "--image", "a.png", "--audio", "b.wav",
            "-p", "Describe.", "-n", "-1", "--temp", "0.7", "--jinja", "--no-mmproj-offload",
        ])
        .unwrap();
        assert!(args.is_single_turn());
        assert_eq!(args.media(), vec![PathBuf::from("a.png"), PathBuf::from("b.wav")]);

        let mut config = SessionConfig::new("from-file.gguf");
        config.n_predict = 128;
        args.apply_to(&mut config);
        assert_eq!(config.model_path, PathBuf::from("model.gguf"));
        assert_eq!(config.mmproj_path, Some(PathBuf::from("proj.gguf")));
        assert_eq!(config.n_predict, -1);
        assert!((config.temperature - 0.7).abs() < f32::EPSILON);
        assert!(config.use_jinja);
        assert!(!config.mmproj_use_gpu);

        let chat_only = Args::try_parse_from(["mtmd-chat", "-m", "m.gguf", "-p", "hi"]).unwrap();
        assert!(!chat_only.is_single_turn());
    }

    #[test]
    fn test_chat_prints_help_for_capabilities() {
        let mut s = session(MockLoader::new());
        let (status, out) = chat(&mut s, "");
        assert_eq!(status, ExitStatus::Success);
        assert!(out.contains("/image <path>"));
        assert!(!out.contains("/audio <path>"));
        assert!(out.contains("/quit or /exit"));
    }

    #[test]
    fn test_chat_turns_and_clear() {
        let mut s = session(MockLoader::new().with_reply("Hello!").with_reply("Again!"));
        let (status, out) = chat(&mut s, "hi\n\n/clear\nhey\n/quit\nignored\n");
        assert_eq!(status, ExitStatus::Success);
        assert!(out.contains("Hello!"));
        assert!(out.contains("Chat history cleared"));
        assert!(out.contains("Again!"));
        let roles: Vec<ChatRole> = s.history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ChatRole::User, ChatRole::Assistant]);
        assert_eq!(s.history()[0].content, "hey");
    }

    #[test]
    fn test_chat_image_then_text() {
        let dir = tempfile::tempdir().unwrap();
        let image = png(&dir);
        let loader = MockLoader::new().with_reply("A black square.");
        let mut s = session(loader.clone());

        let input = format!("/image {}\nWhat is it?\n", image.display());
        let (status, out) = chat(&mut s, &input);
        assert_eq!(status, ExitStatus::Success);
        assert!(out.contains("image loaded"));
        assert_eq!(s.history()[0].content, format!("{MOCK_MEDIA_MARKER}What is it?"));
        assert_eq!(loader.trace().media_evaluated, 1);
    }

    #[test]
    fn test_chat_media_errors_do_not_end_session() {
        let mut s = session(MockLoader::new().with_reply("ok"));
        let (status, out) = chat(&mut s, "/image\n/image /nope/x.png\nhello\n");
        assert_eq!(status, ExitStatus::Success);
        assert!(out.contains("ERR: Missing media filename"));
        assert!(out.contains("ERR: failed to load media /nope/x.png"));
        assert_eq!(s.history()[0].content, "hello");
    }

    #[test]
    fn test_chat_turn_failure_exits_with_failure() {
        let mut s = session(MockLoader::new().fail_eval());
        let (status, out) = chat(&mut s, "hi\nnever reached\n");
        assert_eq!(status, ExitStatus::Failure);
        assert!(out.contains("ERR: unable to eval prompt"));
    }

    #[test]
    fn test_idle_interrupt_ends_chat_with_130() {
        let mut s = session(MockLoader::new());
        assert_eq!(s.cancellation().on_interrupt(), crate::InterruptAction::Interrupted);
        let (status, _) = chat(&mut s, "hi\n");
        assert_eq!(status, ExitStatus::Interrupted);
        assert!(s.history().is_empty());
    }

    #[test]
    fn test_single_turn() {
        let dir = tempfile::tempdir().unwrap();
        let image = png(&dir);
        let mut s = session(MockLoader::new().with_reply("Dark."));
        let mut out = Vec::new();

        let status = run_single_turn(&mut s, "Describe this.", &[image], &mut out);
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(String::from_utf8(out).unwrap(), "Dark.\n");
        assert_eq!(s.history().len(), 2);
    }

    #[test]
    fn test_single_turn_media_failure() {
        let mut s = session(MockLoader::new());
        let mut out = Vec::new();
        let status = run_single_turn(&mut s, "Describe.", &[PathBuf::from("/missing.png")], &mut out);
        assert_eq!(status, ExitStatus::Failure);
        assert!(s.history().is_empty());
    }
}
