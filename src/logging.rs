//! Logging configuration for the launcher binaries
//!
//! Uses log4rs with appenders:
//! 1. ConsoleAppender - stderr output, so stdout stays free for results
//! 2. RollingFileAppender - log files with rotation, when a directory is given
//!
//! The library itself only uses the `log` macros.

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::PathBuf;

/// Environment variable holding the root log level
pub const LEVEL_ENV: &str = "BITCOIND_LAUNCHER_LOG";

/// Environment variable holding the log directory
pub const DIR_ENV: &str = "BITCOIND_LAUNCHER_LOG_DIR";

const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: u32 = 5;

#[derive(Debug, Clone)]
pub struct LoggerOptions {
    pub level: LevelFilter,
    /// Directory for rolling log files; console only when `None`
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            log_dir: None,
        }
    }
}

impl LoggerOptions {
    /// Read level and directory from the environment
    pub fn from_env() -> Self {
        let level = std::env::var(LEVEL_ENV)
            .ok()
            .and_then(|v| parse_level(&v))
            .unwrap_or(LevelFilter::Info);
        let log_dir = std::env::var_os(DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self { level, log_dir }
    }
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    value.trim().parse().ok()
}

/// Initialize log4rs with a console appender and, optionally, a rolling file
///
/// # Log File Configuration
/// - File: `{log_dir}/bitcoind-launcher.1.log`
/// - Max size: 10 MB per file
/// - Max count: 5 files (rotation)
/// - Pattern: `{timestamp} [{level}] {target} - {message}`
pub fn init_logger(options: LoggerOptions) -> Result<log4rs::Handle, Box<dyn std::error::Error>> {
    Ok(log4rs::init_config(build_config(&options)?)?)
}

fn build_config(options: &LoggerOptions) -> Result<Config, Box<dyn std::error::Error>> {
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S)} [{l}] {t} - {m}{n}",
        )))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("console", Box::new(console)));
    let mut root = Root::builder().appender("console");

    if let Some(log_dir) = &options.log_dir {
        std::fs::create_dir_all(log_dir)?;

        let log_file = log_dir.join("bitcoind-launcher.1.log");
        let log_pattern = log_dir.join("bitcoind-launcher.{}.log");
        let log_pattern = log_pattern
            .to_str()
            .ok_or("log directory is not valid UTF-8")?;

        let roller = FixedWindowRoller::builder()
            .base(1)
            .build(log_pattern, MAX_LOG_FILES)?;
        let trigger = SizeTrigger::new(MAX_LOG_SIZE);
        let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

        let logfile = RollingFileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(
                "{d(%Y-%m-%d %H:%M:%S)} [{l}] {t} - {m}{n}",
            )))
            .build(log_file, Box::new(policy))?;

        builder = builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    Ok(builder.build(root.build(options.level))?)
}
