// src/config.rs
use axum::http::Uri;
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;

/// Default port for browser traffic.
pub const DEFAULT_PROXY_PORT: u16 = 8481;
/// Default port for the refresh trigger.
pub const DEFAULT_TRIGGER_PORT: u16 = 8482;
/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "dev-html-proxy.toml";

/// Command-line arguments for the application.
#[derive(Parser, Debug, Deserialize, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// The target host to proxy to (e.g. http://localhost:3000)
    #[clap(
        short,
        long,
        value_parser,
        help = "The target host to proxy to (e.g. http://localhost:3000)"
    )]
    pub target: Option<String>,

    /// HTTP port for serving browser requests
    #[clap(
        short,
        long,
        value_parser,
        help = "HTTP port for serving browser requests [default: 8481]"
    )]
    pub port: Option<u16>,

    /// HTTP port for triggering page refresh
    #[clap(
        long,
        value_parser,
        help = "HTTP port for triggering page refresh [default: 8482]"
    )]
    pub trigger_port: Option<u16>,

    /// Only inject the reload script into text/html responses
    #[clap(long, help = "Only inject the reload script into text/html responses")]
    pub html_only: bool,

    /// Path to a configuration file (e.g., dev-html-proxy.toml)
    #[clap(
        short,
        long,
        value_parser,
        help = "Path to a configuration file (e.g., dev-html-proxy.toml)"
    )]
    pub config: Option<PathBuf>,

    /// Log level (e.g., trace, debug, info, warn, error)
    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,
}

/// Configuration loaded from file, environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct FileConfig {
    /// Target origin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Proxy listener port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Trigger listener port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_port: Option<u16>,
    /// Restrict injection to HTML responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_only: Option<bool>,
    /// Log level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Final application configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Origin every proxied request is forwarded to
    pub target: Uri,
    /// Port for browser traffic and push connections
    pub proxy_port: u16,
    /// Port for the refresh trigger
    pub trigger_port: u16,
    /// Whether to restrict script injection to `text/html` responses
    pub html_only: bool,
    /// Log level
    pub log_level: String,
}

impl AppConfig {
    /// Loads the application configuration from the process arguments, file, and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merges defaults, the config file, `DEV_HTML_PROXY_*` variables and CLI args, in rising precedence.
    pub fn from_cli(cli_args: CliArgs) -> Result<Self, ConfigError> {
        let config_file_path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut fig = Figment::new()
            .merge(Serialized::defaults(FileConfig {
                target: None,
                port: Some(DEFAULT_PROXY_PORT),
                trigger_port: Some(DEFAULT_TRIGGER_PORT),
                html_only: Some(false),
                log_level: Some("info".to_string()),
            }))
            .merge(Toml::file(config_file_path))
            .merge(Env::prefixed("DEV_HTML_PROXY_"));

        // CLI flags win over everything else, but only when actually given.
        fig = fig.merge(Serialized::globals(FileConfig {
            target: cli_args.target,
            port: cli_args.port,
            trigger_port: cli_args.trigger_port,
            html_only: cli_args.html_only.then_some(true),
            log_level: cli_args.log_level,
        }));

        Self::from_file_config(fig.extract()?)
    }

    /// Normalizes and validates merged settings.
    pub fn from_file_config(file_config: FileConfig) -> Result<Self, ConfigError> {
        let proxy_port = file_config.port.unwrap_or(DEFAULT_PROXY_PORT);
        let raw_target = file_config
            .target
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingTarget)?;
        let target = parse_target(raw_target.trim(), proxy_port)?;

        Ok(AppConfig {
            target,
            proxy_port,
            trigger_port: file_config.trigger_port.unwrap_or(DEFAULT_TRIGGER_PORT),
            html_only: file_config.html_only.unwrap_or(false),
            log_level: file_config.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Parses the target origin and rejects targets that would loop back into the proxy.
///
/// A target without a scheme is treated as `http://`.
///
/// # Arguments
/// * `raw` - The target as given on the command line, in the file or in the environment.
/// * `proxy_port` - The port the proxy listener will bind.
///
/// # Returns
/// The normalized origin URI.
///
/// # Errors
/// Returns [`ConfigError::InvalidTarget`] or [`ConfigError::MissingHost`] for malformed input,
/// [`ConfigError::UnsupportedScheme`] for anything but `http` and `https`, and
/// [`ConfigError::TargetIsProxy`] when a loopback host names the proxy port.
pub fn parse_target(raw: &str, proxy_port: u16) -> Result<Uri, ConfigError> {
    let with_scheme = match raw.split_once("://") {
        Some(_) => raw.to_string(),
        None => format!("http://{}", raw),
    };

    let target: Uri = with_scheme
        .parse()
        .map_err(|source| ConfigError::InvalidTarget {
            target: raw.to_string(),
            source,
        })?;

    let default_port = match target.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => 80,
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => 443,
        Some(other) => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        None => return Err(ConfigError::MissingHost(raw.to_string())),
    };
    let host = target
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::MissingHost(raw.to_string()))?;

    let port = target.port_u16().unwrap_or(default_port);
    if is_loopback(host) && port == proxy_port {
        return Err(ConfigError::TargetIsProxy(with_scheme));
    }

    Ok(target)
}

fn is_loopback(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ["localhost", "127.0.0.1", "::1", "0.0.0.0"]
        .iter()
        .any(|name| host.eq_ignore_ascii_case(name))
}
