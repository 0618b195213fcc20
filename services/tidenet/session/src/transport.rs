//! Plain and TLS byte streams for sessions.
//!
//! A session splits its [`IoStream`] into a [`Reader`] for the receive
//! task and a [`Writer`] for the send task. Plain sockets share one
//! `Arc<TcpStream>` and use readiness plus `try_*` calls so the fast send
//! path can write from any task; TLS streams go through `tokio::io::split`.
//! Half-close and close act on a duplicated socket handle so they work
//! while both halves are borrowed by running tasks.

use std::io::{self, IoSlice};
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// Accepted TLS stream
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// Connected TLS stream
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            IoStream::Tls(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            IoStream::Plain(stream) => stream.is_write_vectored(),
            IoStream::Tls(stream) => stream.is_write_vectored(),
            IoStream::TlsClient(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            IoStream::Plain(stream) => stream,
            IoStream::Tls(stream) => stream.get_ref().0,
            IoStream::TlsClient(stream) => stream.get_ref().0,
        }
    }

    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Get the local address of the underlying stream
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Whether the stream runs over TLS
    pub fn is_secure(&self) -> bool {
        !matches!(self, IoStream::Plain(_))
    }

    /// Duplicate of the socket handle, used for shutdown and socket options
    pub(crate) fn control_handle(&self) -> io::Result<std::net::TcpStream> {
        let dup = socket2::SockRef::from(self.tcp()).try_clone()?;
        Ok(std::net::TcpStream::from(dup))
    }

    /// Split into independently owned halves. Plain streams also hand back
    /// the shared socket for the fast send path.
    pub(crate) fn split(self) -> (Reader, Writer, Option<Arc<TcpStream>>) {
        match self {
            IoStream::Plain(stream) => {
                let shared = Arc::new(stream);
                (
                    Reader::Plain(shared.clone()),
                    Writer::Plain(shared.clone()),
                    Some(shared),
                )
            }
            secure => {
                let (read, write) = tokio::io::split(secure);
                (
                    Reader::Tls(read),
                    Writer::Tls {
                        half: write,
                        unflushed: false,
                    },
                    None,
                )
            }
        }
    }
}

/// Read half owned by the receive task
pub(crate) enum Reader {
    Plain(Arc<TcpStream>),
    Tls(ReadHalf<IoStream>),
}

impl Reader {
    /// Read once; 0 means the peer closed its side
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Reader::Plain(stream) => loop {
                stream.readable().await?;
                match stream.try_read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        continue
                    }
                    Err(e) => return Err(e),
                }
            },
            Reader::Tls(half) => half.read(buf).await,
        }
    }
}

/// Write half owned by the send task
pub(crate) enum Writer {
    Plain(Arc<TcpStream>),
    Tls {
        half: WriteHalf<IoStream>,
        unflushed: bool,
    },
}

impl Writer {
    /// One vectored write. Interrupted writes are retried and a full socket
    /// is waited on for at most `cap`; `Ok(None)` means the cap elapsed
    /// before anything could be written.
    pub(crate) async fn write_vectored(
        &mut self,
        bufs: &[IoSlice<'_>],
        cap: Option<Duration>,
    ) -> io::Result<Option<usize>> {
        let wanted: usize = bufs.iter().map(|b| b.len()).sum();
        if wanted == 0 {
            return Ok(Some(0));
        }

        let written = match self {
            Writer::Plain(stream) => loop {
                match stream.try_write_vectored(bufs) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if !wait_capped(cap, stream.writable()).await? {
                            return Ok(None);
                        }
                    }
                    Err(e) => return Err(e),
                }
            },
            Writer::Tls { half, unflushed } => {
                let n = match cap {
                    Some(cap) => match tokio::time::timeout(cap, half.write_vectored(bufs)).await {
                        Ok(res) => res?,
                        Err(_) => return Ok(None),
                    },
                    None => half.write_vectored(bufs).await?,
                };
                *unflushed = true;
                n
            }
        };

        if written == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"));
        }
        Ok(Some(written))
    }

    /// Push out ciphertext still buffered in the TLS layer. Returns false
    /// when `cap` elapsed first.
    pub(crate) async fn flush(&mut self, cap: Option<Duration>) -> io::Result<bool> {
        match self {
            Writer::Plain(_) => Ok(true),
            Writer::Tls { half, unflushed } => {
                if !*unflushed {
                    return Ok(true);
                }
                let done = match cap {
                    Some(cap) => match tokio::time::timeout(cap, half.flush()).await {
                        Ok(res) => {
                            res?;
                            true
                        }
                        Err(_) => false,
                    },
                    None => {
                        half.flush().await?;
                        true
                    }
                };
                if done {
                    *unflushed = false;
                }
                Ok(done)
            }
        }
    }
}

async fn wait_capped<F>(cap: Option<Duration>, ready: F) -> io::Result<bool>
where
    F: std::future::Future<Output = io::Result<()>>,
{
    match cap {
        Some(cap) => match tokio::time::timeout(cap, ready).await {
            Ok(res) => res.map(|_| true),
            Err(_) => Ok(false),
        },
        None => ready.await.map(|_| true),
    }
}

/// Half-close or close through a control handle, ignoring "not connected"
pub(crate) fn shutdown_socket(ctl: &std::net::TcpStream, how: Shutdown) {
    if let Err(e) = ctl.shutdown(how) {
        if e.kind() != io::ErrorKind::NotConnected {
            tracing::debug!(error = %e, ?how, "socket shutdown failed");
        }
    }
}

/// TLS configuration and handshakes
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::{debug, info};

    fn load_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
        let certs = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse {what}"))?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in {what}");
        }
        Ok(certs)
    }

    fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))
    }

    fn load_roots(pem: &str) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(pem, "CA certificates")? {
            roots
                .add(cert)
                .context("Failed to add CA certificate to root store")?;
        }
        Ok(roots)
    }

    /// Server configuration; with `client_ca_pem` clients must present a
    /// certificate signed by one of those CAs.
    pub fn server_config(
        cert_chain_pem: &str,
        private_key_pem: &str,
        client_ca_pem: Option<&str>,
    ) -> Result<Arc<ServerConfig>> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = load_certs(cert_chain_pem, "certificate chain")?;
        let key = load_key(private_key_pem)?;

        let builder = ServerConfig::builder();
        let config = match client_ca_pem {
            Some(ca_pem) => {
                let verifier =
                    rustls::server::WebPkiClientVerifier::builder(Arc::new(load_roots(ca_pem)?))
                        .build()
                        .context("Failed to build client certificate verifier")?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .context("Failed to configure server certificate")?;

        info!(mutual = client_ca_pem.is_some(), "TLS server configuration created");
        Ok(Arc::new(config))
    }

    /// Client configuration trusting the CAs in `ca_pem`
    pub fn client_config(ca_pem: &str) -> Result<Arc<ClientConfig>> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let config = ClientConfig::builder()
            .with_root_certificates(load_roots(ca_pem)?)
            .with_no_client_auth();

        info!("TLS client configuration created");
        Ok(Arc::new(config))
    }

    /// Server-side handshake
    pub(crate) async fn accept(config: Arc<ServerConfig>, tcp: TcpStream) -> io::Result<IoStream> {
        let stream = TlsAcceptor::from(config).accept(tcp).await?;
        debug!("TLS connection accepted");
        Ok(IoStream::Tls(stream))
    }

    /// Client-side handshake
    pub(crate) async fn connect(
        config: Arc<ClientConfig>,
        tcp: TcpStream,
        sni: &str,
    ) -> std::result::Result<IoStream, crate::error::NetError> {
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| crate::error::NetError::Tls(format!("invalid server name: {sni}")))?;
        let stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| crate::error::NetError::Tls(format!("handshake with {sni} failed: {e}")))?;
        debug!(sni, "TLS connection established");
        Ok(IoStream::TlsClient(stream))
    }
}
