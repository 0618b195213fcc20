//! Transport error taxonomy.

use std::io;
use std::sync::Arc;

use tide_endpoint::EndpointError;
use thiserror::Error;

/// Result alias used across the session crate
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors surfaced to callers, send callbacks and disconnect callbacks.
///
/// Cloneable so the sticky close error of a session can be handed to every
/// pending message and to the disconnected callback.
#[derive(Error, Debug, Clone)]
pub enum NetError {
    /// A connect attempt is already in progress
    #[error("client is connecting")]
    Connecting,

    /// The client already owns an established session
    #[error("client is established")]
    Estab,

    /// Operation on a session that is closing or closed
    #[error("session shut down")]
    Shutdown,

    /// Datagram was only partially transferred
    #[error("send or recv half of package")]
    Half,

    /// Connectionless send without a destination
    #[error("udp send requires a destination address")]
    NoDestination,

    /// Message was not written before its send timeout elapsed
    #[error("send timed out")]
    SendTimeout,

    /// Receive timed out
    #[error("recv timed out")]
    RecvTimeout,

    /// URL could not be parsed
    #[error("url parse error: {0}")]
    UrlParse(String),

    /// Receive callback rejected the byte stream
    #[error("data parse error")]
    DataParse,

    /// Scheme is not served by any transport
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Receive buffer reached its hard limit without the callback consuming
    #[error("recv buffer overflow")]
    RecvOverflow,

    /// Send queue rejected the message
    #[error("send queue overflow")]
    SendOverflow,

    /// Host name did not resolve
    #[error("dns not found: {0}")]
    DnsNotFound(String),

    /// Secure channel configuration or handshake failure
    #[error("tls error: {0}")]
    Tls(String),

    /// Socket level failure
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl NetError {
    /// Stable numeric code; 0 is reserved for success and socket errors
    /// report the OS error number when there is one.
    pub fn code(&self) -> i32 {
        match self {
            NetError::Connecting => 1,
            NetError::Estab => 2,
            NetError::Shutdown => 3,
            NetError::Half => 4,
            NetError::NoDestination => 5,
            NetError::SendTimeout => 6,
            NetError::RecvTimeout => 7,
            NetError::UrlParse(_) => 8,
            NetError::DataParse => 9,
            NetError::UnsupportedProtocol(_) => 10,
            NetError::RecvOverflow => 11,
            NetError::SendOverflow => 12,
            NetError::DnsNotFound(_) => 13,
            NetError::Tls(_) => -1,
            NetError::Io(e) => e.raw_os_error().unwrap_or(-1),
        }
    }

    /// Socket error kind, if this is one
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            NetError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }

    pub(crate) fn eof() -> Self {
        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer").into()
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        NetError::Io(Arc::new(e))
    }
}

impl From<EndpointError> for NetError {
    fn from(e: EndpointError) -> Self {
        match e {
            EndpointError::UrlParse(s) => NetError::UrlParse(s),
            EndpointError::UnsupportedProtocol(s) => NetError::UnsupportedProtocol(s),
            EndpointError::DnsNotFound(s) => NetError::DnsNotFound(s),
        }
    }
}
