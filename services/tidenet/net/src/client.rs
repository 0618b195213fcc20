//! Connecting facade.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tide_endpoint::{Endpoint, Transport};
use tide_session::{Configure, OptionsNode, Result, SessionEntry, TcpClient, UdpPeer};
use tracing::warn;

#[derive(Clone)]
enum Connector {
    Tcp(Arc<TcpClient>),
    Udp(Arc<UdpPeer>),
}

/// Connects to a `tcp://`, `tls://`, `http(s)://` or `udp://` URL and
/// owns at most one session
pub struct Client {
    options: OptionsNode,
    connector: Mutex<Option<Connector>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Create an unconnected client
    pub fn new() -> Self {
        Self {
            options: OptionsNode::new(),
            connector: Mutex::new(None),
        }
    }

    /// Parse `url`, resolve it and connect.
    ///
    /// Fails with `Connecting` while another connect is in progress and
    /// with `Estab` while the current session is established. A failed
    /// connect can be retried right away.
    pub async fn connect(&self, url: &str) -> Result<SessionEntry> {
        let parsed = tide_endpoint::parse(url)?;
        let ep = parsed.resolve().await?;

        match self.connector_for(ep.scheme().transport()) {
            Connector::Tcp(client) => client.connect(&ep, &parsed.host).await,
            Connector::Udp(peer) => peer.connect(&ep).await,
        }
    }

    fn connector_for(&self, transport: Transport) -> Connector {
        let mut slot = self.connector.lock();
        match (slot.as_ref(), transport) {
            (Some(c @ Connector::Tcp(_)), Transport::Tcp) => return c.clone(),
            (Some(c @ Connector::Udp(peer)), Transport::Udp) if !peer.is_shutdown() => {
                return c.clone()
            }
            _ => {}
        }

        let connector = match transport {
            Transport::Tcp => {
                let client = TcpClient::new();
                self.link(client.options());
                Connector::Tcp(client)
            }
            Transport::Udp => {
                let peer = UdpPeer::new();
                self.link(peer.options());
                Connector::Udp(peer)
            }
        };
        if let Some(previous) = slot.replace(connector.clone()) {
            shutdown_connector(&previous, true);
        }
        connector
    }

    fn link(&self, child: &OptionsNode) {
        if let Err(e) = self.options.link(child) {
            warn!("Failed to link client options: {}", e);
        }
    }

    /// Current session, empty when not connected
    pub fn session(&self) -> SessionEntry {
        match self.connector.lock().as_ref() {
            Some(Connector::Tcp(client)) => client.session(),
            Some(Connector::Udp(peer)) => peer.session(),
            None => SessionEntry::empty(),
        }
    }

    /// Queue `payload` on the current session
    pub fn send(&self, payload: impl Into<Bytes>) {
        self.session().send(payload);
    }

    /// Queue `payload` and report the outcome to `on_done`
    pub fn send_with<F>(&self, payload: impl Into<Bytes>, on_done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.session().send_with(payload, on_done);
    }

    /// Immediate-write variant of [`Client::send`]
    pub fn send_no_delay(&self, payload: impl Into<Bytes>) {
        self.session().send_no_delay(payload);
    }

    /// Immediate-write variant of [`Client::send_with`]
    pub fn send_no_delay_with<F>(&self, payload: impl Into<Bytes>, on_done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.session().send_no_delay_with(payload, on_done);
    }

    /// Shut the current session down
    pub fn shutdown(&self, immediate: bool) {
        let connector = self.connector.lock().clone();
        if let Some(connector) = connector {
            shutdown_connector(&connector, immediate);
        }
    }

    /// True while the current session is established
    pub fn is_established(&self) -> bool {
        match self.connector.lock().as_ref() {
            Some(Connector::Tcp(client)) => client.is_established(),
            Some(Connector::Udp(peer)) => !peer.is_shutdown() && peer.remote_addr().is_some(),
            None => false,
        }
    }

    /// Local endpoint of the current session
    pub fn local_addr(&self) -> Option<Endpoint> {
        match self.connector.lock().as_ref()? {
            Connector::Tcp(client) => client.session().local_addr(),
            Connector::Udp(peer) => peer.local_addr(),
        }
    }

    /// Remote endpoint of the current session
    pub fn remote_addr(&self) -> Option<Endpoint> {
        match self.connector.lock().as_ref()? {
            Connector::Tcp(client) => client.session().remote_addr(),
            Connector::Udp(peer) => peer.remote_addr(),
        }
    }
}

fn shutdown_connector(connector: &Connector, immediate: bool) {
    match connector {
        Connector::Tcp(client) => client.shutdown(immediate),
        Connector::Udp(peer) => peer.shutdown(),
    }
}

impl Configure for Client {
    fn options(&self) -> &OptionsNode {
        &self.options
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(connector) = self.connector.get_mut().take() {
            shutdown_connector(&connector, true);
        }
    }
}
