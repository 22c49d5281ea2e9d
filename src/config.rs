//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How accepted connections are serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    /// Run each session on the accept loop itself, one client at a time.
    #[default]
    #[serde(alias = "none")]
    #[value(alias = "none")]
    Inline,
    /// Fork a child process per connection.
    #[serde(alias = "fork")]
    #[value(alias = "fork")]
    Process,
    /// Spawn a detached thread per connection.
    #[serde(alias = "threads")]
    #[value(alias = "threads")]
    Thread,
}

/// What a session I/O error does to the rest of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SessionErrorPolicy {
    /// The error is fatal to the whole server (process workers exit non-zero).
    #[default]
    Fatal,
    /// Log the error and close only the affected connection.
    Close,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-forkd")]
#[command(author = "echo-forkd authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0 or ::1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Concurrency strategy for accepted connections
    #[arg(short, long, value_enum)]
    pub mode: Option<ConcurrencyMode>,

    /// Detach from the terminal and run in the background
    #[arg(short, long)]
    pub daemonize: bool,

    /// Stay in the foreground even if daemonizing is configured
    #[arg(short, long)]
    pub foreground: bool,

    /// User name or numeric uid to switch to when started as root
    #[arg(short, long)]
    pub user: Option<String>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Maximum concurrent thread workers (0 = unbounded)
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Connection count report interval in milliseconds (0 = disabled)
    #[arg(long)]
    pub report_interval_ms: Option<u64>,

    /// Do not mirror received payload bytes to stdout
    #[arg(long)]
    pub no_mirror: bool,

    /// Close only the failing connection on a session I/O error
    #[arg(long)]
    pub isolate_errors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener and dispatch configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub mode: ConcurrencyMode,
    /// Maximum concurrent thread workers (0 = unbounded)
    #[serde(default)]
    pub max_workers: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            mode: ConcurrencyMode::default(),
            max_workers: 0,
        }
    }
}

/// Startup lifecycle configuration
#[derive(Debug, Deserialize)]
pub struct LifecycleSection {
    #[serde(default)]
    pub daemonize: bool,
    pub user: Option<String>,
    #[serde(default = "default_report_delay_ms")]
    pub report_delay_ms: u64,
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            daemonize: false,
            user: None,
            report_delay_ms: default_report_delay_ms(),
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

/// Per-connection session configuration
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_mirror_payload")]
    pub mirror_payload: bool,
    #[serde(default)]
    pub error_policy: SessionErrorPolicy,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            mirror_payload: default_mirror_payload(),
            error_policy: SessionErrorPolicy::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_backlog() -> i32 {
    1
}

fn default_report_delay_ms() -> u64 {
    1000
}

fn default_report_interval_ms() -> u64 {
    3000
}

fn default_mirror_payload() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub mode: ConcurrencyMode,
    pub max_workers: usize,
    pub daemonize: bool,
    pub foreground: bool,
    pub user: Option<String>,
    pub report_delay: Duration,
    /// Zero disables the periodic report.
    pub report_interval: Duration,
    pub mirror_payload: bool,
    pub error_policy: SessionErrorPolicy,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args, reading the TOML file they point at.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            lifecycle,
            session,
            logging,
        } = toml_config;

        ServerConfig {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            backlog: cli.backlog.unwrap_or(server.backlog),
            mode: cli.mode.unwrap_or(server.mode),
            max_workers: cli.max_workers.unwrap_or(server.max_workers),
            daemonize: cli.daemonize || lifecycle.daemonize,
            foreground: cli.foreground,
            user: cli.user.or(lifecycle.user),
            report_delay: Duration::from_millis(lifecycle.report_delay_ms),
            report_interval: Duration::from_millis(
                cli.report_interval_ms
                    .unwrap_or(lifecycle.report_interval_ms),
            ),
            mirror_payload: !cli.no_mirror && session.mirror_payload,
            error_policy: if cli.isolate_errors {
                SessionErrorPolicy::Close
            } else {
                session.error_policy
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        }
    }

    /// Whether the daemon transition should run.
    pub fn should_daemonize(&self) -> bool {
        self.daemonize && !self.foreground
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
pub(crate) fn test_config(mode: ConcurrencyMode) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        backlog: 128,
        mode,
        max_workers: 0,
        daemonize: false,
        foreground: true,
        user: None,
        report_delay: Duration::ZERO,
        report_interval: Duration::ZERO,
        mirror_payload: false,
        error_policy: SessionErrorPolicy::Close,
        log_level: "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["echo-forkd"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::merge(cli(&[]), TomlConfig::default());
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8888);
        assert_eq!(config.backlog, 1);
        assert_eq!(config.mode, ConcurrencyMode::Inline);
        assert_eq!(config.report_delay, Duration::from_secs(1));
        assert_eq!(config.report_interval, Duration::from_secs(3));
        assert!(config.mirror_payload);
        assert_eq!(config.error_policy, SessionErrorPolicy::Fatal);
        assert!(!config.should_daemonize());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7007
            backlog = 16
            mode = "fork"
            max_workers = 8

            [lifecycle]
            daemonize = true
            user = "daemon"
            report_interval_ms = 0

            [session]
            mirror_payload = false
            error_policy = "close"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7007);
        assert_eq!(config.server.mode, ConcurrencyMode::Process);
        assert_eq!(config.server.max_workers, 8);
        assert!(config.lifecycle.daemonize);
        assert_eq!(config.lifecycle.user.as_deref(), Some("daemon"));
        assert_eq!(config.lifecycle.report_delay_ms, 1000);
        assert_eq!(config.lifecycle.report_interval_ms, 0);
        assert!(!config.session.mirror_payload);
        assert_eq!(config.session.error_policy, SessionErrorPolicy::Close);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7007
            mode = "thread"

            [lifecycle]
            daemonize = true
            "#,
        )
        .unwrap();

        let config = ServerConfig::merge(
            cli(&["-p", "9000", "-m", "none", "-f", "--no-mirror", "--isolate-errors"]),
            file,
        );
        assert_eq!(config.port, 9000);
        assert_eq!(config.mode, ConcurrencyMode::Inline);
        assert!(config.daemonize);
        assert!(!config.should_daemonize());
        assert!(!config.mirror_payload);
        assert_eq!(config.error_policy, SessionErrorPolicy::Close);
    }

    #[test]
    fn test_foreground_overrides_daemonize() {
        let mut config = test_config(ConcurrencyMode::Inline);
        for (daemonize, foreground, expected) in [
            (false, false, false),
            (false, true, false),
            (true, false, true),
            (true, true, false),
        ] {
            config.daemonize = daemonize;
            config.foreground = foreground;
            assert_eq!(
                config.should_daemonize(),
                expected,
                "daemonize={daemonize} foreground={foreground}"
            );
        }
    }

    #[test]
    fn test_mode_aliases() {
        assert_eq!(cli(&["--mode", "fork"]).mode, Some(ConcurrencyMode::Process));
        assert_eq!(cli(&["--mode", "threads"]).mode, Some(ConcurrencyMode::Thread));
        assert_eq!(cli(&["--mode", "inline"]).mode, Some(ConcurrencyMode::Inline));
        assert!(CliArgs::try_parse_from(["echo-forkd", "--mode", "pool"]).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let args = cli(&["-c", "/nonexistent/echo-forkd.toml"]);
        match ServerConfig::from_args(args) {
            Err(ConfigError::FileRead(path, _)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/echo-forkd.toml"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
