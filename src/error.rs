//! Unified error type for the proxy: one flat `thiserror`-derived taxonomy
//! with `Display` messages aimed at `tracing` call sites, and `From`
//! conversions so `?` composes through transport and config code without
//! manual mapping.

use std::net::SocketAddr;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("failed to parse DNS message: {0}")]
    ParseError(String),

    #[error("upstream {endpoint} timed out after {elapsed_ms}ms")]
    Timeout { endpoint: SocketAddr, elapsed_ms: u64 },

    #[error("network error talking to {endpoint}: {source}")]
    NetworkError {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("response from {endpoint} did not match request (id or question mismatch)")]
    MismatchError { endpoint: SocketAddr },

    #[error("upstream {endpoint} returned failure rcode {rcode}")]
    UpstreamFailure { endpoint: SocketAddr, rcode: u8 },

    #[error("synthesized SERVFAIL after exhausting all candidates")]
    ServfailSynthesized,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("failed to acquire single-instance lock: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn parse(msg: impl Into<String>) -> Self {
        ProxyError::ParseError(msg.into())
    }

    /// True for errors that should cause fall-through to the next candidate
    /// resolver rather than aborting the query pipeline outright.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            ProxyError::Timeout { .. }
                | ProxyError::NetworkError { .. }
                | ProxyError::MismatchError { .. }
                | ProxyError::UpstreamFailure { .. }
                | ProxyError::ParseError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
