//! Listening side: accept loop, session registry and admission control.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tide_endpoint::Endpoint;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entry::{Session, SessionEntry};
use crate::error::{NetError, Result};
use crate::options::{Configure, OptionsNode};
use crate::session::TcpSession;
use crate::transport::{tls, IoStream};

/// TCP/TLS listener owning every session it accepted
pub struct TcpServer {
    me: Weak<TcpServer>,
    options: OptionsNode,
    local: Mutex<Option<Endpoint>>,
    registry: Mutex<HashMap<usize, Arc<TcpSession>>>,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    drained: Notify,
}

impl TcpServer {
    /// Create an idle server
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            options: OptionsNode::new(),
            local: Mutex::new(None),
            registry: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            drained: Notify::new(),
        })
    }

    /// Bind, listen and spawn the accept loop. Returns the bound address
    /// with port 0 resolved.
    pub async fn start(self: &Arc<Self>, ep: &Endpoint) -> Result<Endpoint> {
        if self.local.lock().is_some() {
            return Err(NetError::Estab);
        }
        let options = self.options.snapshot();
        let secure = ep.scheme().is_secure();
        if secure && options.tls.server.is_none() {
            return Err(NetError::Tls("no server configuration for tls listener".into()));
        }

        let socket = match ep.addr() {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(ep.addr())?;
        let listener = socket.listen(options.limits.listen_backlog)?;

        let local = ep.with_addr(listener.local_addr()?);
        *self.local.lock() = Some(local.clone());
        info!("Server listening on {}", local);

        tokio::spawn(self.clone().accept_loop(listener, secure));
        Ok(local)
    }

    /// Bound address once started
    pub fn local_addr(&self) -> Option<Endpoint> {
        self.local.lock().clone()
    }

    /// Registered sessions
    pub fn session_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Handles to every registered session
    pub fn sessions(&self) -> Vec<SessionEntry> {
        self.registry.lock().values().map(|s| s.entry()).collect()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, secure: bool) {
        loop {
            let hooks = self.options.read(|o| o.accept_hooks.clone());
            if let Some(before) = &hooks.before {
                before();
            }
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => None,
                res = listener.accept() => Some(res),
            };
            if let Some(after) = &hooks.after {
                after();
            }

            match accepted {
                None => break,
                Some(Ok((tcp, peer))) => {
                    debug!("Accepted connection from {}", peer);
                    tokio::spawn(self.clone().admit(tcp, peer, secure));
                }
                Some(Err(e)) => {
                    if self.shutting_down.load(Ordering::Acquire) {
                        break;
                    }
                    warn!("Accept failed: {}", e);
                    tokio::task::yield_now().await;
                }
            }
        }
        info!("Accept loop stopped");
    }

    async fn admit(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr, secure: bool) {
        let mut options = self.options.snapshot();

        let stream = if secure {
            let Some(config) = options.tls.server.clone() else {
                return;
            };
            match tls::accept(config, tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            }
        } else {
            IoStream::Plain(tcp)
        };

        // Erase after the user callback so it can still find the session
        let user_cb = options.disconnected.take();
        let server = self.me.clone();
        options.disconnected = Some(Arc::new(move |entry: &SessionEntry, err: &NetError| {
            if let Some(cb) = &user_cb {
                cb(entry, err);
            }
            if let Some(server) = server.upgrade() {
                server.erase(entry.id());
            }
        }));
        let max_connections = options.limits.max_connections;

        let session = match TcpSession::new(stream, options) {
            Ok(session) => session,
            Err(e) => {
                debug!("Dropping connection from {}: {}", peer, e);
                return;
            }
        };
        let id = session.entry().id();

        {
            let mut registry = self.registry.lock();
            if self.shutting_down.load(Ordering::Acquire) || registry.len() >= max_connections {
                drop(registry);
                debug!("Rejecting connection from {} ({} sessions)", peer, self.session_count());
                session.shutdown(true);
                return;
            }
            registry.insert(id, session.clone());
        }
        // A shutdown can land between registration and start
        if !session.start() {
            self.erase(id);
        }
    }

    fn erase(&self, id: usize) {
        let empty = {
            let mut registry = self.registry.lock();
            registry.remove(&id);
            registry.is_empty()
        };
        if empty {
            self.drained.notify_waiters();
        }
    }

    /// Stop accepting and shut every session down without waiting
    pub fn begin_shutdown(&self, immediate: bool) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!("Server shutting down (immediate: {})", immediate);
        }
        self.cancel.cancel();

        let sessions: Vec<_> = self.registry.lock().values().cloned().collect();
        for session in sessions {
            session.shutdown(immediate);
        }
    }

    /// Stop accepting and shut every session down. The graceful variant
    /// returns once every session has disconnected.
    pub async fn shutdown(&self, immediate: bool) {
        self.begin_shutdown(immediate);
        if !immediate {
            self.wait_drained().await;
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.registry.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Configure for TcpServer {
    fn options(&self) -> &OptionsNode {
        &self.options
    }
}
