//! Configuration module for the tcp-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "tcp-echo")]
#[command(author = "tcp-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-protocol TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server type (standard or raw)
    #[arg(long = "type")]
    pub server_type: Option<String>,

    /// Server address
    #[arg(long)]
    pub addr: Option<String>,

    /// Server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Read timeout duration (e.g., 30s)
    #[arg(long)]
    pub read_timeout: Option<String>,

    /// Write timeout duration (e.g., 30s)
    #[arg(long)]
    pub write_timeout: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append log output to this file instead of stdout/stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Transport variant
    #[serde(rename = "type", default = "default_server_type")]
    pub server_type: String,
    /// Address to bind to
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Read timeout, Go-style duration string
    #[serde(default = "default_timeout")]
    pub read_timeout: String,
    /// Write timeout, Go-style duration string
    #[serde(default = "default_timeout")]
    pub write_timeout: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            server_type: default_server_type(),
            addr: default_addr(),
            port: default_port(),
            read_timeout: default_timeout(),
            write_timeout: default_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file, opened in append mode
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_server_type() -> String {
    "standard".to_string()
}

fn default_addr() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> String {
    "30s".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which transport the server is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    /// `std::net` listener and streams
    Standard,
    /// Hand-rolled listener and connections over raw socket syscalls
    Raw,
}

impl FromStr for ServerType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(ServerType::Standard),
            "raw" => Ok(ServerType::Raw),
            other => Err(ConfigError::UnknownServerType(other.to_string())),
        }
    }
}

/// Logging settings handed to [`crate::logging::init`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    /// Set by `DEBUG=true` in the environment
    pub debug: bool,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server_type: ServerType,
    pub addr: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_args(CliArgs::parse())?;
        config.logging.debug = std::env::var("DEBUG").is_ok_and(|v| v == "true");
        Ok(config)
    }

    /// Merge parsed CLI args over the TOML file they point at (if any).
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::FileRead {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse {
                path: config_path.clone(),
                source: e,
            })?
        } else {
            TomlConfig::default()
        };

        let server = toml_config.server;
        let read_timeout = cli.read_timeout.unwrap_or(server.read_timeout);
        let write_timeout = cli.write_timeout.unwrap_or(server.write_timeout);

        Ok(Config {
            server_type: cli
                .server_type
                .unwrap_or(server.server_type)
                .parse()?,
            addr: cli.addr.unwrap_or(server.addr),
            port: cli.port.unwrap_or(server.port),
            read_timeout: parse_duration(&read_timeout).map_err(|reason| {
                ConfigError::InvalidDuration {
                    field: "read-timeout",
                    value: read_timeout.clone(),
                    reason,
                }
            })?,
            write_timeout: parse_duration(&write_timeout).map_err(|reason| {
                ConfigError::InvalidDuration {
                    field: "write-timeout",
                    value: write_timeout.clone(),
                    reason,
                }
            })?,
            logging: LoggingConfig {
                level: cli.log_level.unwrap_or(toml_config.logging.level),
                file: cli.log_file.or(toml_config.logging.file),
                debug: false,
            },
        })
    }
}

/// Parse a Go-style duration such as `30s`, `250ms` or `1m30s`.
///
/// A bare number is taken as seconds. Fractional amounts are allowed
/// (`1.5s`).
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = input.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|e| e.to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit after {rest:?}"))?;
        if number_len == 0 {
            return Err(format!("expected a number at {rest:?}"));
        }
        let number = &rest[..number_len];
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit: u64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3600 * 1_000_000_000,
            unit => return Err(format!("unknown unit {unit:?}")),
        };
        rest = &rest[unit_len..];

        let part = if number.contains('.') {
            let amount: f64 = number
                .parse()
                .map_err(|_| format!("invalid number {number:?}"))?;
            Duration::try_from_secs_f64(amount * nanos_per_unit as f64 / 1e9)
                .map_err(|e| e.to_string())?
        } else {
            let amount: u64 = number
                .parse()
                .map_err(|_| format!("invalid number {number:?}"))?;
            amount
                .checked_mul(nanos_per_unit)
                .map(Duration::from_nanos)
                .ok_or_else(|| format!("{input:?} overflows"))?
        };
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("{input:?} overflows"))?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["tcp-echo"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::from_args(cli(&[])).unwrap();
        assert_eq!(config.server_type, ServerType::Standard);
        assert_eq!(config.addr, "localhost");
        assert_eq!(config.port, 8080);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(30));
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_cli_flags() {
        let config = Config::from_args(cli(&[
            "--type",
            "raw",
            "--addr",
            "0.0.0.0",
            "--port",
            "9000",
            "--read-timeout",
            "5s",
            "--write-timeout",
            "250ms",
        ]))
        .unwrap();
        assert_eq!(config.server_type, ServerType::Raw);
        assert_eq!(config.addr, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.read_timeout, Duration::from_secs(5));
        assert_eq!(config.write_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_no_connection_cap_flag() {
        // Connections are unbounded; there is no worker pool to size.
        assert!(CliArgs::try_parse_from(["tcp-echo", "--workers", "2"]).is_err());
    }

    #[test]
    fn test_unknown_server_type() {
        let err = Config::from_args(cli(&["--type", "quic"])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownServerType(ref t) if t == "quic"));
        assert_eq!(err.to_string(), "Unknown server type: quic");
    }

    #[test]
    fn test_invalid_timeout() {
        let err = Config::from_args(cli(&["--read-timeout", "soon"])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration {
                field: "read-timeout",
                ..
            }
        ));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            type = "raw"
            addr = "127.0.0.1"
            port = 7000
            read_timeout = "1m"
            write_timeout = "10s"

            [logging]
            level = "debug"
            file = "/tmp/tcp-echo.log"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.server_type, "raw");
        assert_eq!(config.server.addr, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.read_timeout, "1m");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.file.as_deref(),
            Some(std::path::Path::new("/tmp/tcp-echo.log"))
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = std::env::temp_dir().join(format!("tcp-echo-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[server]\ntype = \"raw\"\nport = 7001\nread_timeout = \"2s\"\n",
        )
        .unwrap();

        let config = Config::from_args(cli(&[
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7002",
        ]))
        .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.server_type, ServerType::Raw);
        assert_eq!(config.port, 7002);
        assert_eq!(config.read_timeout, Duration::from_secs(2));
        assert_eq!(config.addr, "localhost");
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::from_args(cli(&["--config", "/nonexistent/tcp-echo.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5h"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("0s"), Ok(Duration::ZERO));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_ok());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
