//! Configuration management for the exporter.
//!
//! This module handles loading, parsing, and merging configuration from TOML files
//! and command-line arguments, and resolves the merged result into the immutable
//! settings the exporter runs with.
//!
//! # Configuration Precedence
//!
//! 1. Default values (lowest priority)
//! 2. Configuration file (certexporter.toml or specified with --config)
//! 3. Command-line arguments (highest priority)
//!
//! # Example Configuration File
//!
//! ```toml
//! listen = ":9090"
//! namespaces = ["org1", "org2", "orderers"]
//! label_selector = "app.kubernetes.io/part-of=fabric"
//! page_limit = 200
//! metric_namespace = "hlf"
//! scrape_timeout_secs = 30
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 200
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum_macros::{Display, EnumString};

pub const DEFAULT_LISTEN: &str = ":9090";
pub const DEFAULT_PAGE_LIMIT: u32 = 200;
pub const DEFAULT_METRIC_NAMESPACE: &str = "hlf";
pub const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONFIG_FILE: &str = "certexporter.toml";

/// Command-line arguments.
#[derive(Parser, Debug, Default)]
#[command(name = "certexporter", version, author, about, long_about = None)]
pub struct Cli {
    /// The address to listen on for HTTP requests
    #[arg(long)]
    pub listen: Option<String>,

    /// List of namespaces to check, comma-separated
    #[arg(long = "ns")]
    pub namespaces: Option<String>,

    /// Label selector used to filter secrets
    #[arg(long = "label")]
    pub label_selector: Option<String>,

    /// Maximum number of secrets returned per listing call
    #[arg(long)]
    pub page_limit: Option<u32>,

    /// Prefix of the exported metric names
    #[arg(long)]
    pub metric_namespace: Option<String>,

    /// Deadline for one scrape in seconds, 0 disables it
    #[arg(long = "scrape-timeout")]
    pub scrape_timeout_secs: Option<u64>,

    /// Terminate the process when a scrape fails instead of answering 500
    #[arg(long, overrides_with = "no_exit_on_scrape_error")]
    pub exit_on_scrape_error: bool,

    /// Answer 500 when a scrape fails, even if the config file enables exiting
    #[arg(long, overrides_with = "exit_on_scrape_error")]
    pub no_exit_on_scrape_error: bool,

    /// Absolute path to the kubeconfig file
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Path to a TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print an example configuration file and exit
    #[arg(long)]
    pub print_example_config: bool,
}

/// Log output format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Main configuration structure.
///
/// All fields are optional to support partial configuration and merging.
/// Missing values will be filled in by defaults or overridden by CLI arguments.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Listen address, `:port` binds all interfaces
    pub listen: Option<String>,
    /// Namespaces to scan, in order
    pub namespaces: Option<Vec<String>>,
    /// Label selector passed to the secret listing
    pub label_selector: Option<String>,
    /// Maximum items per listing page
    pub page_limit: Option<u32>,
    /// Prefix of the metric names
    pub metric_namespace: Option<String>,
    /// Scrape deadline in seconds, 0 disables it
    pub scrape_timeout_secs: Option<u64>,
    /// Exit the process on a failed scrape
    pub exit_on_scrape_error: Option<bool>,
    /// Path to a kubeconfig file
    pub kubeconfig: Option<PathBuf>,
    /// Log output format
    pub log_format: Option<LogFormat>,
    /// Retry policy for listing calls
    pub retry: Option<RetryConfig>,
}

/// Retry policy configuration for secret listing calls.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts per listing call, including the first
    pub max_attempts: Option<u32>,
    /// Delay in milliseconds before the first retry
    pub initial_delay_ms: Option<u64>,
    /// Upper bound of the delay between retries
    pub max_delay_ms: Option<u64>,
    /// Exponential backoff multiplier applied after each attempt
    pub backoff_factor: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: Some(3),
            initial_delay_ms: Some(200),
            max_delay_ms: Some(2_000),
            backoff_factor: Some(2.0),
        }
    }
}

/// Resolved retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// A policy that performs exactly one attempt.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.min(64) as i32);
        if self.initial_delay.as_secs_f64() * factor >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        self.initial_delay.mul_f64(factor)
    }
}

/// What to scan on every scrape. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeConfiguration {
    /// Namespaces to scan; empty entries select the client's default namespace
    pub namespaces: Vec<String>,
    pub label_selector: String,
    pub page_limit: u32,
    /// Deadline of one scrape, `None` for unbounded
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ScrapeConfiguration {
    pub fn new(namespaces: Vec<String>, label_selector: impl Into<String>) -> Self {
        ScrapeConfiguration {
            namespaces,
            label_selector: label_selector.into(),
            page_limit: DEFAULT_PAGE_LIMIT,
            timeout: None,
            retry: RetryPolicy::no_retry(),
        }
    }
}

/// Fully resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen address with a leading `:` expanded to all interfaces
    pub listen: String,
    pub scrape: ScrapeConfiguration,
    pub metric_namespace: String,
    pub exit_on_scrape_error: bool,
    pub kubeconfig: Option<PathBuf>,
    pub log_format: LogFormat,
}

/// Splits a comma-separated namespace selector.
///
/// Entries are kept verbatim, so an empty selector yields one empty namespace.
pub fn split_namespaces(selector: &str) -> Vec<String> {
    selector.split(',').map(String::from).collect()
}

impl Default for Config {
    /// Creates a configuration with the default values.
    ///
    /// # Default Values
    ///
    /// - `listen`: ":9090"
    /// - `namespaces`: [""] (the client's default namespace)
    /// - `label_selector`: ""
    /// - `page_limit`: 200
    /// - `metric_namespace`: "hlf"
    /// - `scrape_timeout_secs`: 30
    /// - `exit_on_scrape_error`: false
    /// - `log_format`: text
    fn default() -> Self {
        Config {
            listen: Some(DEFAULT_LISTEN.to_string()),
            namespaces: Some(split_namespaces("")),
            label_selector: Some(String::new()),
            page_limit: Some(DEFAULT_PAGE_LIMIT),
            metric_namespace: Some(DEFAULT_METRIC_NAMESPACE.to_string()),
            scrape_timeout_secs: Some(DEFAULT_SCRAPE_TIMEOUT_SECS),
            exit_on_scrape_error: Some(false),
            kubeconfig: None,
            log_format: Some(LogFormat::Text),
            retry: Some(RetryConfig::default()),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Returns
    ///
    /// * `Ok(Config)` - Successfully parsed configuration
    /// * `Err(ConfigError::Io)` - File could not be read
    /// * `Err(ConfigError::Parse)` - File contains invalid TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(config)
    }

    /// Merges this configuration with another, prioritizing the other's values.
    ///
    /// For each field, if the `other` config has a value (Some), it overrides
    /// this config's value. If the `other` value is None, keeps the current value.
    pub fn merge_with(mut self, other: Config) -> Self {
        if other.listen.is_some() {
            self.listen = other.listen;
        }
        if other.namespaces.is_some() {
            self.namespaces = other.namespaces;
        }
        if other.label_selector.is_some() {
            self.label_selector = other.label_selector;
        }
        if other.page_limit.is_some() {
            self.page_limit = other.page_limit;
        }
        if other.metric_namespace.is_some() {
            self.metric_namespace = other.metric_namespace;
        }
        if other.scrape_timeout_secs.is_some() {
            self.scrape_timeout_secs = other.scrape_timeout_secs;
        }
        if other.exit_on_scrape_error.is_some() {
            self.exit_on_scrape_error = other.exit_on_scrape_error;
        }
        if other.kubeconfig.is_some() {
            self.kubeconfig = other.kubeconfig;
        }
        if other.log_format.is_some() {
            self.log_format = other.log_format;
        }
        if let Some(other_retry) = other.retry {
            if let Some(ref mut self_retry) = self.retry {
                if other_retry.max_attempts.is_some() {
                    self_retry.max_attempts = other_retry.max_attempts;
                }
                if other_retry.initial_delay_ms.is_some() {
                    self_retry.initial_delay_ms = other_retry.initial_delay_ms;
                }
                if other_retry.max_delay_ms.is_some() {
                    self_retry.max_delay_ms = other_retry.max_delay_ms;
                }
                if other_retry.backoff_factor.is_some() {
                    self_retry.backoff_factor = other_retry.backoff_factor;
                }
            } else {
                self.retry = Some(other_retry);
            }
        }
        self
    }

    /// Creates a Config from command-line arguments for merging.
    ///
    /// Only provided arguments (Some values) will override other configurations.
    pub fn from_cli_args(cli: &Cli) -> Self {
        Config {
            listen: cli.listen.clone(),
            namespaces: cli.namespaces.as_deref().map(split_namespaces),
            label_selector: cli.label_selector.clone(),
            page_limit: cli.page_limit,
            metric_namespace: cli.metric_namespace.clone(),
            scrape_timeout_secs: cli.scrape_timeout_secs,
            exit_on_scrape_error: match (cli.exit_on_scrape_error, cli.no_exit_on_scrape_error) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            },
            kubeconfig: cli.kubeconfig.clone(),
            log_format: cli.log_format,
            retry: None,
        }
    }

    /// Validates the merged configuration and resolves it into [`Settings`].
    ///
    /// Missing values fall back to the defaults.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let defaults = Config::default();
        let merged = defaults.merge_with(self);

        let listen = parse_listen(merged.listen.as_deref().unwrap_or(DEFAULT_LISTEN))?;

        let page_limit = merged.page_limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page_limit == 0 {
            return Err(ConfigError::Validation(
                "page_limit must be greater than 0".to_string(),
            ));
        }

        let metric_namespace = merged
            .metric_namespace
            .unwrap_or_else(|| DEFAULT_METRIC_NAMESPACE.to_string());
        if metric_namespace.is_empty() {
            return Err(ConfigError::Validation(
                "metric_namespace cannot be empty".to_string(),
            ));
        }

        let timeout = match merged
            .scrape_timeout_secs
            .unwrap_or(DEFAULT_SCRAPE_TIMEOUT_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let retry = resolve_retry(merged.retry.unwrap_or_default())?;

        Ok(Settings {
            listen,
            scrape: ScrapeConfiguration {
                namespaces: merged.namespaces.unwrap_or_else(|| split_namespaces("")),
                label_selector: merged.label_selector.unwrap_or_default(),
                page_limit,
                timeout,
                retry,
            },
            metric_namespace,
            exit_on_scrape_error: merged.exit_on_scrape_error.unwrap_or(false),
            kubeconfig: merged.kubeconfig,
            log_format: merged.log_format.unwrap_or_default(),
        })
    }

    /// Generates an example configuration file in TOML format.
    pub fn example_toml() -> String {
        let example = Config {
            listen: Some(DEFAULT_LISTEN.to_string()),
            namespaces: Some(vec![
                "org1".to_string(),
                "org2".to_string(),
                "orderers".to_string(),
            ]),
            label_selector: Some("app.kubernetes.io/part-of=fabric".to_string()),
            page_limit: Some(DEFAULT_PAGE_LIMIT),
            metric_namespace: Some(DEFAULT_METRIC_NAMESPACE.to_string()),
            scrape_timeout_secs: Some(DEFAULT_SCRAPE_TIMEOUT_SECS),
            exit_on_scrape_error: Some(false),
            kubeconfig: None,
            log_format: Some(LogFormat::Text),
            retry: Some(RetryConfig::default()),
        };

        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| "# Error generating example".to_string())
    }
}

/// Host names are kept as given and resolved when the listener binds.
fn parse_listen(listen: &str) -> Result<String, ConfigError> {
    let address = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(address),
        _ => Err(ConfigError::Validation(format!(
            "invalid listen address '{}': expected host:port",
            listen
        ))),
    }
}

fn resolve_retry(retry: RetryConfig) -> Result<RetryPolicy, ConfigError> {
    let defaults = RetryConfig::default();
    let max_attempts = retry.max_attempts.or(defaults.max_attempts).unwrap_or(1);
    if max_attempts == 0 {
        return Err(ConfigError::Validation(
            "retry.max_attempts must be at least 1".to_string(),
        ));
    }
    let backoff_factor = retry.backoff_factor.or(defaults.backoff_factor).unwrap_or(1.0);
    if !backoff_factor.is_finite() || backoff_factor < 1.0 {
        return Err(ConfigError::Validation(
            "retry.backoff_factor must be at least 1.0".to_string(),
        ));
    }

    Ok(RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(
            retry.initial_delay_ms.or(defaults.initial_delay_ms).unwrap_or(0),
        ),
        max_delay: Duration::from_millis(retry.max_delay_ms.or(defaults.max_delay_ms).unwrap_or(0)),
        backoff_factor,
    })
}

/// Errors that can occur during configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("IO Error: {0}")]
    Io(String),
    /// TOML parsing error (invalid syntax, type mismatch, etc.)
    #[error("Parse Error: {0}")]
    Parse(String),
    /// Validation error (invalid values)
    #[error("Validation Error: {0}")]
    Validation(String),
}
