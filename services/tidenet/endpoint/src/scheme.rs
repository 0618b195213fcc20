//! Scheme names and the transport each one selects.

use std::fmt;
use std::str::FromStr;

use crate::EndpointError;

/// URL scheme recognised by the facades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain TCP stream
    Tcp,
    /// TCP wrapped in TLS (`tls://` or `ssl://`)
    Tls,
    /// Connectionless datagrams
    Udp,
    /// HTTP, carried as plain TCP
    Http,
    /// HTTPS, carried as plain TCP; the application owns the record layer
    Https,
}

/// Socket family a scheme is carried on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Stream sockets
    Tcp,
    /// Datagram sockets
    Udp,
}

impl Scheme {
    /// Transport implementation this scheme dispatches to
    pub fn transport(self) -> Transport {
        match self {
            Scheme::Udp => Transport::Udp,
            Scheme::Tcp | Scheme::Tls | Scheme::Http | Scheme::Https => Transport::Tcp,
        }
    }

    /// Whether sessions of this scheme run a secure-channel handshake
    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Tls)
    }

    /// Canonical lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
            Scheme::Udp => "udp",
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl FromStr for Scheme {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Scheme::Tcp),
            "tls" | "ssl" => Ok(Scheme::Tls),
            "udp" => Ok(Scheme::Udp),
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            _ => Err(EndpointError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
