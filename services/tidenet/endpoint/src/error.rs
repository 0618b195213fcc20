//! Address parsing error types.

use thiserror::Error;

/// Errors produced while turning a URL into an [`crate::Endpoint`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// URL does not match `scheme://host[:port][/path]`
    #[error("url parse error: {0}")]
    UrlParse(String),

    /// Scheme is missing or not one of the supported transports
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Host name did not resolve to any address
    #[error("dns not found: {0}")]
    DnsNotFound(String),
}
