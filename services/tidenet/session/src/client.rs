//! Connecting side: owns at most one session at a time.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tide_endpoint::Endpoint;
use tokio::net::TcpStream;
use tracing::info;

use crate::entry::{Session, SessionEntry};
use crate::error::{NetError, Result};
use crate::options::{Configure, OptionsNode};
use crate::session::TcpSession;
use crate::transport::{tls, IoStream};

/// TCP/TLS client
pub struct TcpClient {
    me: Weak<TcpClient>,
    options: OptionsNode,
    connecting: tokio::sync::Mutex<()>,
    session: Mutex<Option<Arc<TcpSession>>>,
}

impl TcpClient {
    /// Create an unconnected client
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            options: OptionsNode::new(),
            connecting: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
        })
    }

    /// Connect to `ep`, completing the TLS handshake for `tls` endpoints.
    /// `host` is the SNI name used unless one is configured explicitly.
    ///
    /// Fails with `Connecting` while another connect is running and with
    /// `Estab` while the current session is still established.
    pub async fn connect(&self, ep: &Endpoint, host: &str) -> Result<SessionEntry> {
        let Ok(_connecting) = self.connecting.try_lock() else {
            return Err(NetError::Connecting);
        };
        if self.is_established() {
            return Err(NetError::Estab);
        }

        let mut options = self.options.snapshot();
        let tcp = TcpStream::connect(ep.addr()).await?;
        let stream = if ep.scheme().is_secure() {
            let config = options
                .tls
                .client
                .clone()
                .ok_or_else(|| NetError::Tls("no client configuration for tls endpoint".into()))?;
            let sni = options.tls.server_name.clone().unwrap_or_else(|| host.to_string());
            tls::connect(config, tcp, &sni).await?
        } else {
            IoStream::Plain(tcp)
        };

        let user_cb = options.disconnected.take();
        let client = self.me.clone();
        options.disconnected = Some(Arc::new(move |entry: &SessionEntry, err: &NetError| {
            if let Some(cb) = &user_cb {
                cb(entry, err);
            }
            if let Some(client) = client.upgrade() {
                client.forget(entry.id());
            }
        }));

        let session = TcpSession::new(stream, options)?;
        let entry = session.entry();
        let previous = self.session.lock().replace(session.clone());
        if let Some(previous) = previous {
            previous.shutdown(true);
        }
        if !session.start() {
            self.forget(entry.id());
            return Err(NetError::Shutdown);
        }
        info!("Connected to {}", ep);
        Ok(entry)
    }

    fn forget(&self, id: usize) {
        let mut current = self.session.lock();
        if current.as_ref().is_some_and(|s| s.entry().id() == id) {
            *current = None;
        }
    }

    /// Current session, empty when disconnected
    pub fn session(&self) -> SessionEntry {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.entry())
            .unwrap_or_default()
    }

    /// True while the current session is established
    pub fn is_established(&self) -> bool {
        self.session.lock().as_ref().is_some_and(|s| s.is_established())
    }

    /// Shut the current session down
    pub fn shutdown(&self, immediate: bool) {
        let current = self.session.lock().clone();
        if let Some(session) = current {
            session.shutdown(immediate);
        }
    }
}

impl Configure for TcpClient {
    fn options(&self) -> &OptionsNode {
        &self.options
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.shutdown(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TlsOptions;
    use crate::server::TcpServer;
    use crate::transport::tests::self_signed;
    use crate::transport::tls::client_config;
    use std::time::Duration;
    use tide_endpoint::Scheme;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    async fn listening() -> (Arc<TcpServer>, Endpoint) {
        let server = TcpServer::new();
        let ep = Endpoint::new("127.0.0.1:0".parse().unwrap(), Scheme::Tcp);
        let local = server.start(&ep).await.unwrap();
        (server, local)
    }

    #[tokio::test]
    async fn test_connect_then_estab() {
        let (server, local) = listening().await;
        let client = TcpClient::new();

        let entry = client.connect(&local, "127.0.0.1").await.unwrap();
        assert!(entry.is_established());
        assert!(client.is_established());
        assert_eq!(client.session(), entry);
        assert_eq!(entry.remote_addr().map(|r| r.port()), Some(local.port()));

        assert!(matches!(
            client.connect(&local, "127.0.0.1").await,
            Err(NetError::Estab)
        ));
        server.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_failed_connect_is_retryable() {
        let (server, local) = listening().await;
        server.shutdown(true).await;
        // Give the listener time to close
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = TcpClient::new();
        assert!(matches!(
            client.connect(&local, "127.0.0.1").await,
            Err(NetError::Io(_))
        ));

        let (server, local) = listening().await;
        client.connect(&local, "127.0.0.1").await.unwrap();
        server.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_disconnect_clears_session() {
        let (server, local) = listening().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = TcpClient::new();
        client.set_disconnected_cb(move |_, err| {
            let _ = tx.send(err.clone());
        });

        client.connect(&local, "127.0.0.1").await.unwrap();
        server.shutdown(true).await;

        let err = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(!matches!(err, NetError::Shutdown));
        tokio::time::timeout(WAIT, async {
            while !client.session().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!client.is_established());

        // Reconnect is allowed once cleared
        let (server, local) = listening().await;
        client.connect(&local, "127.0.0.1").await.unwrap();
        server.shutdown(true).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_connect_while_handshaking_is_rejected() {
        // Accepts and never answers the client hello
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let (cert_pem, _) = self_signed();
        let client = TcpClient::new();
        client.set_tls(TlsOptions {
            client: Some(client_config(&cert_pem).unwrap()),
            ..TlsOptions::default()
        });
        let tls_ep = Endpoint::new(addr, Scheme::Tls);

        let first = {
            let (client, ep) = (client.clone(), tls_ep.clone());
            tokio::spawn(async move { client.connect(&ep, "localhost").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            client.connect(&tls_ep, "localhost").await,
            Err(NetError::Connecting)
        ));
        assert!(!first.is_finished());
        assert!(client.session().is_empty());

        first.abort();
        holder.abort();
    }

    #[tokio::test]
    async fn test_tls_endpoint_requires_client_config() {
        let (server, local) = listening().await;
        let client = TcpClient::new();
        let tls_ep = Endpoint::new(local.addr(), Scheme::Tls);
        assert!(matches!(
            client.connect(&tls_ep, "localhost").await,
            Err(NetError::Tls(_))
        ));
        assert!(client.session().is_empty());
        server.shutdown(true).await;
    }
}
