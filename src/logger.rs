use std::path::Path;
use std::str::FromStr;

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

/// Environment variable overriding the default log level.
pub const LOG_LEVEL_ENV: &str = "MTMD_LOG_LEVEL";

const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";
const CONSOLE_PATTERN: &str = "{l} - {m}{n}";

/// Resolve the level from an explicit value, then the environment, then `info`.
pub fn resolve_level(explicit: Option<&str>) -> LevelFilter {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
        .and_then(|s| LevelFilter::from_str(s.trim()).ok())
        .unwrap_or(LevelFilter::Info)
}

/// Log file path for a session started now, e.g. `logs/2025-01-31-14_05.log`.
pub fn log_file_path(log_dir: &Path) -> std::path::PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    log_dir.join(format!("{timestamp}.log"))
}

/// Route `log` records to a timestamped file and to stderr.
///
/// stdout stays free for streamed tokens.
pub fn setup_logging(log_dir: &Path, level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_file_path(log_dir);

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
        .build(log_path)?;

    let console_appender = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("console", Box::new(console_appender)))
        .build(
            Root::builder()
                .appender("file")
                .appender("console")
                .build(level),
        )?;

    log4rs::init_config(config)?;

    Ok(())
}
