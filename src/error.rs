// src/error.rs
use std::net::SocketAddr;

use thiserror::Error;

/// Boxed error returned by an [`Executor`](crate::transport::Executor) attempt.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while building the application configuration. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No target origin was given on the command line, in the file, or in the environment.
    #[error("the --target flag is required")]
    MissingTarget,

    /// The target origin could not be parsed as a URL.
    #[error("could not parse target URL {target:?}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: axum::http::uri::InvalidUri,
    },

    /// The target origin parsed but has no host.
    #[error("target URL {0:?} has no host")]
    MissingHost(String),

    /// The target origin uses a scheme the forwarding client cannot speak.
    #[error("unsupported target scheme {0:?}, only http:// and https:// origins can be proxied")]
    UnsupportedScheme(String),

    /// The target origin points back at the proxy listener.
    #[error("target host {0} cannot be the same as the proxy server")]
    TargetIsProxy(String),

    /// Merging or extracting the layered configuration failed.
    #[error(transparent)]
    Figment(#[from] figment::Error),
}

/// Per-request failures of the forwarding proxy. None of them are fatal to the process.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Every attempt to reach the origin failed at the transport level.
    #[error("max retries exceeded after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    /// A request or response body could not be read.
    #[error("failed to read body: {0}")]
    Body(#[from] axum::Error),

    /// The outbound request could not be assembled.
    #[error("failed to build outbound request: {0}")]
    Request(#[from] axum::http::Error),
}

/// Errors raised while starting a listener.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
