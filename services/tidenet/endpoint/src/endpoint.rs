//! `scheme://host[:port][/path]` parsing and resolution.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use tracing::debug;

use crate::{EndpointError, Scheme};

/// A parsed but not yet resolved URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    /// Transport scheme
    pub scheme: Scheme,
    /// Host name or literal address (brackets stripped for IPv6)
    pub host: String,
    /// Port, `None` when the URL omits it
    pub port: Option<u16>,
    /// Path including the leading `/`, empty when absent
    pub path: String,
}

/// A resolved socket address tagged with its scheme
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
    scheme: Scheme,
    path: String,
}

/// Parse a URL of the form `scheme://host[:port][/path]`.
///
/// Structural problems are reported as [`EndpointError::UrlParse`]; a
/// missing or unknown scheme is [`EndpointError::UnsupportedProtocol`].
pub fn parse(url: &str) -> Result<Url, EndpointError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(EndpointError::UrlParse("empty url".to_string()));
    }

    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    };

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    let (host, port) = split_authority(authority)
        .ok_or_else(|| EndpointError::UrlParse(url.to_string()))?;

    let scheme = match scheme {
        Some(s) => s.parse::<Scheme>()?,
        None => return Err(EndpointError::UnsupportedProtocol(String::new())),
    };

    Ok(Url {
        scheme,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

fn split_authority(authority: &str) -> Option<(&str, Option<u16>)> {
    if authority.is_empty() {
        return None;
    }

    // [v6]:port
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        let port = match tail {
            "" => None,
            t => Some(parse_port(t.strip_prefix(':')?)?),
        };
        return Some((host, port));
    }

    // Bare v6 literal without a port
    if authority.matches(':').count() > 1 {
        authority.parse::<Ipv6Addr>().ok()?;
        return Some((authority, None));
    }

    match authority.split_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host, Some(parse_port(port)?))),
        Some(_) => None,
        None => Some((authority, None)),
    }
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl Url {
    /// Resolve the host to a socket address.
    ///
    /// Literal addresses never touch the resolver. Names are looked up
    /// with the runtime's resolver and the first answer wins.
    pub async fn resolve(&self) -> Result<Endpoint, EndpointError> {
        let port = self.port.unwrap_or(0);

        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(Endpoint::new(SocketAddr::new(ip, port), self.scheme).with_path(&self.path));
        }

        let mut addrs = tokio::net::lookup_host((self.host.as_str(), port))
            .await
            .map_err(|e| {
                debug!("Lookup of {} failed: {}", self.host, e);
                EndpointError::DnsNotFound(self.host.clone())
            })?;

        let addr = addrs
            .next()
            .ok_or_else(|| EndpointError::DnsNotFound(self.host.clone()))?;
        debug!("Resolved {} to {}", self.host, addr);

        Ok(Endpoint::new(addr, self.scheme).with_path(&self.path))
    }
}

impl Endpoint {
    /// Create an endpoint without a path
    pub fn new(addr: SocketAddr, scheme: Scheme) -> Self {
        Self {
            addr,
            scheme,
            path: String::new(),
        }
    }

    /// Replace the path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Same scheme and path, different socket address
    pub fn with_addr(&self, addr: SocketAddr) -> Self {
        Self {
            addr,
            scheme: self.scheme,
            path: self.path.clone(),
        }
    }

    /// Socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Scheme
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Path, empty if none
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.addr, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let url = parse("http://127.0.0.1:3030/route/index.html").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, Some(3030));
        assert_eq!(url.path, "/route/index.html");
    }

    #[test]
    fn test_parse_missing_port() {
        let url = parse("udp://localhost").unwrap();
        assert_eq!(url.scheme, Scheme::Udp);
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, None);
        assert!(url.path.is_empty());
    }

    #[test]
    fn test_parse_ipv6() {
        let url = parse("tcp://[::1]:8080").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, Some(8080));

        let bare = parse("tls://::1").unwrap();
        assert_eq!(bare.host, "::1");
        assert_eq!(bare.port, None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(""), Err(EndpointError::UrlParse(_))));
        assert!(matches!(parse("tcp://"), Err(EndpointError::UrlParse(_))));
        assert!(matches!(parse("tcp://host:port"), Err(EndpointError::UrlParse(_))));
        assert!(matches!(parse("tcp://host:70000"), Err(EndpointError::UrlParse(_))));
        assert!(matches!(parse("tcp://:80"), Err(EndpointError::UrlParse(_))));
        assert!(matches!(
            parse("127.0.0.1:80"),
            Err(EndpointError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            parse("zk://127.0.0.1:2181/node"),
            Err(EndpointError::UnsupportedProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let ep = parse("tcp://127.0.0.1").unwrap().resolve().await.unwrap();
        assert_eq!(ep.addr(), "127.0.0.1:0".parse().unwrap());
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_resolve_name() {
        let ep = parse("tcp://localhost:9000/x").unwrap().resolve().await.unwrap();
        assert!(ep.addr().ip().is_loopback());
        assert_eq!(ep.port(), 9000);
        assert_eq!(ep.path(), "/x");
    }

    #[tokio::test]
    async fn test_resolve_unknown_host() {
        let err = parse("tcp://no-such-host.invalid:1")
            .unwrap()
            .resolve()
            .await
            .unwrap_err();
        assert_eq!(err, EndpointError::DnsNotFound("no-such-host.invalid".to_string()));
    }

    #[test]
    fn test_display_with_path() {
        let ep = Endpoint::new("10.0.0.1:443".parse().unwrap(), Scheme::Tls).with_path("/a");
        assert_eq!(ep.to_string(), "tls://10.0.0.1:443/a");
        let moved = ep.with_addr("10.0.0.2:1".parse().unwrap());
        assert_eq!(moved.to_string(), "tls://10.0.0.2:1/a");
    }
}
