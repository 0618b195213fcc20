//! Listening facade.

use std::sync::Arc;

use parking_lot::Mutex;
use tide_endpoint::{Endpoint, Transport};
use tide_session::{Configure, NetError, OptionsNode, Result, SessionEntry, TcpServer, UdpPeer};
use tracing::{info, warn};

enum Listener {
    Tcp(Arc<TcpServer>),
    Udp(Arc<UdpPeer>),
}

/// Listens on a `tcp://`, `tls://`, `http(s)://` or `udp://` URL
pub struct Server {
    options: OptionsNode,
    listener: Mutex<Option<Listener>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Create a server that is not listening yet
    pub fn new() -> Self {
        Self {
            options: OptionsNode::new(),
            listener: Mutex::new(None),
        }
    }

    /// Parse `url`, resolve it and start listening. Returns the bound
    /// endpoint; port 0 comes back as the port the OS picked.
    pub async fn start(&self, url: &str) -> Result<Endpoint> {
        if self.listener.lock().is_some() {
            return Err(NetError::Estab);
        }
        let ep = tide_endpoint::parse(url)?.resolve().await?;

        let (listener, local) = match ep.scheme().transport() {
            Transport::Tcp => {
                let server = TcpServer::new();
                self.link(server.options());
                let local = server.start(&ep).await?;
                (Listener::Tcp(server), local)
            }
            Transport::Udp => {
                let peer = UdpPeer::new();
                self.link(peer.options());
                let local = peer.start(&ep).await?;
                (Listener::Udp(peer), local)
            }
        };

        let mut slot = self.listener.lock();
        if slot.is_some() {
            drop(slot);
            shutdown_listener(&listener, true);
            return Err(NetError::Estab);
        }
        *slot = Some(listener);
        info!("Server started on {}", local);
        Ok(local)
    }

    fn link(&self, child: &OptionsNode) {
        if let Err(e) = self.options.link(child) {
            warn!("Failed to link server options: {}", e);
        }
    }

    /// Bound endpoint once started
    pub fn local_addr(&self) -> Option<Endpoint> {
        match self.listener.lock().as_ref()? {
            Listener::Tcp(server) => server.local_addr(),
            Listener::Udp(peer) => peer.local_addr(),
        }
    }

    /// Live sessions (always 0 for UDP)
    pub fn session_count(&self) -> usize {
        match self.listener.lock().as_ref() {
            Some(Listener::Tcp(server)) => server.session_count(),
            _ => 0,
        }
    }

    /// Handles to every live session
    pub fn sessions(&self) -> Vec<SessionEntry> {
        match self.listener.lock().as_ref() {
            Some(Listener::Tcp(server)) => server.sessions(),
            _ => Vec::new(),
        }
    }

    /// Stop listening and shut every session down. The graceful variant
    /// waits until every session has disconnected.
    pub async fn shutdown(&self, immediate: bool) {
        let listener = self.listener.lock().take();
        match listener {
            Some(Listener::Tcp(server)) => server.shutdown(immediate).await,
            Some(Listener::Udp(peer)) => peer.shutdown(),
            None => {}
        }
    }
}

fn shutdown_listener(listener: &Listener, immediate: bool) {
    match listener {
        Listener::Tcp(server) => server.begin_shutdown(immediate),
        Listener::Udp(peer) => peer.shutdown(),
    }
}

impl Configure for Server {
    fn options(&self) -> &OptionsNode {
        &self.options
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            shutdown_listener(&listener, true);
        }
    }
}
