//! Connectionless peer sharing the facade shape of the TCP side.
//!
//! One socket, one receive task. Every datagram reaches the receive
//! callback with a fresh [`SessionEntry`] bound to its sender, so replies
//! go through the same `send` call as on a stream session. The callback's
//! consumed count is ignored: a datagram is always consumed whole.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tide_endpoint::{Endpoint, Scheme};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entry::{complete, SendCb, Session, SessionEntry, Storage};
use crate::error::{NetError, Result};
use crate::options::{Configure, OptionKey, OptionsNode};

/// UDP endpoint usable as listener, client or both
pub struct UdpPeer {
    me: Weak<UdpPeer>,
    options: OptionsNode,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local: Mutex<Option<Endpoint>>,
    remote: Mutex<Option<SocketAddr>>,
    recv_buf_size: Arc<AtomicUsize>,
    cancel: CancellationToken,
    shut: AtomicBool,
    storage: Storage,
}

impl UdpPeer {
    /// Create an unbound peer
    pub fn new() -> Arc<Self> {
        let options = OptionsNode::new();
        let recv_buf_size = Arc::new(AtomicUsize::new(options.limits().initial_pack_size()));

        let size = recv_buf_size.clone();
        options.on_set(move |key, opts| {
            if matches!(key, OptionKey::MaxPackSize | OptionKey::Limits | OptionKey::Linked) {
                size.store(opts.limits.initial_pack_size(), Ordering::Relaxed);
            }
        });

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            options,
            socket: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            recv_buf_size,
            cancel: CancellationToken::new(),
            shut: AtomicBool::new(false),
            storage: Storage::default(),
        })
    }

    /// Bind `ep` and spawn the receive task
    pub async fn start(&self, ep: &Endpoint) -> Result<Endpoint> {
        if self.shut.load(Ordering::Acquire) {
            return Err(NetError::Shutdown);
        }
        if self.socket.lock().is_some() {
            return Err(NetError::Estab);
        }

        let socket = Arc::new(UdpSocket::bind(ep.addr()).await?);
        let local = ep.with_addr(socket.local_addr()?);
        {
            let mut slot = self.socket.lock();
            if slot.is_some() {
                return Err(NetError::Estab);
            }
            *slot = Some(socket.clone());
        }
        *self.local.lock() = Some(local.clone());
        info!("UDP peer bound on {}", local);

        let Some(me) = self.me.upgrade() else {
            return Err(NetError::Shutdown);
        };
        tokio::spawn(me.recv_loop(socket));
        Ok(local)
    }

    async fn ensure_started(&self, toward: SocketAddr) -> Result<Arc<UdpSocket>> {
        if let Some(socket) = self.live_socket()? {
            return Ok(socket);
        }
        let any = match toward {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        match self.start(&Endpoint::new(any, Scheme::Udp)).await {
            Ok(_) | Err(NetError::Estab) => {}
            Err(e) => return Err(e),
        }
        self.live_socket()?.ok_or(NetError::Shutdown)
    }

    fn live_socket(&self) -> Result<Option<Arc<UdpSocket>>> {
        if self.shut.load(Ordering::Acquire) {
            return Err(NetError::Shutdown);
        }
        Ok(self.socket.lock().clone())
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; self.recv_buf_size.load(Ordering::Relaxed)];
        loop {
            let want = self.recv_buf_size.load(Ordering::Relaxed);
            if buf.len() != want {
                buf.resize(want, 0);
            }

            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = socket.recv_from(&mut buf) => res,
            };
            match received {
                Ok((0, _)) => {}
                Ok((n, from)) => {
                    let cb = self.options.read(|o| o.received.clone());
                    if let Some(cb) = cb {
                        let _ = cb(&self.entry_for(from), &buf[..n]);
                    }
                }
                Err(e) => {
                    // Connected sockets report ICMP errors from earlier sends here
                    debug!("UDP receive failed: {}", e);
                    tokio::task::yield_now().await;
                }
            }
        }
        debug!("UDP receive loop stopped");
    }

    fn entry_for(self: &Arc<Self>, remote: SocketAddr) -> SessionEntry {
        SessionEntry::new(Arc::new(UdpSession {
            peer: self.clone(),
            remote,
        }))
    }

    /// Set the default destination and fire the connected callback
    pub async fn connect(self: &Arc<Self>, ep: &Endpoint) -> Result<SessionEntry> {
        let socket = self.ensure_started(ep.addr()).await?;
        socket.connect(ep.addr()).await?;
        *self.remote.lock() = Some(ep.addr());

        let entry = self.entry_for(ep.addr());
        if let Some(cb) = self.options.read(|o| o.connected.clone()) {
            cb(&entry);
        }
        Ok(entry)
    }

    /// One datagram to `dst`, binding an ephemeral port first if needed
    pub async fn send_to(&self, dst: SocketAddr, data: &[u8]) -> Result<()> {
        let socket = self.ensure_started(dst).await?;
        let n = socket.send_to(data, dst).await?;
        if n < data.len() {
            return Err(NetError::Half);
        }
        Ok(())
    }

    /// One datagram to the connected destination
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let Some(remote) = *self.remote.lock() else {
            return Err(NetError::NoDestination);
        };
        let socket = self.ensure_started(remote).await?;
        let n = socket.send(data).await?;
        if n < data.len() {
            return Err(NetError::Half);
        }
        Ok(())
    }

    /// Bound address
    pub fn local_addr(&self) -> Option<Endpoint> {
        self.local.lock().clone()
    }

    /// Connected destination
    pub fn remote_addr(&self) -> Option<Endpoint> {
        self.remote.lock().map(|addr| Endpoint::new(addr, Scheme::Udp))
    }

    /// Handle bound to the connected destination, empty otherwise
    pub fn session(self: &Arc<Self>) -> SessionEntry {
        match *self.remote.lock() {
            Some(remote) => self.entry_for(remote),
            None => SessionEntry::empty(),
        }
    }

    /// Stop receiving, close the socket and fire the disconnected callback
    /// with `Shutdown`. Runs once.
    pub fn shutdown(self: &Arc<Self>) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let bound = self.socket.lock().take().is_some();
        debug!("UDP peer shut down");

        if bound {
            if let Some(cb) = self.options.read(|o| o.disconnected.clone()) {
                cb(&self.session(), &NetError::Shutdown);
            }
        }
    }

    /// Whether `shutdown` has run
    pub fn is_shutdown(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }
}

impl Configure for UdpPeer {
    fn options(&self) -> &OptionsNode {
        &self.options
    }
}

/// Per-datagram pseudo-session
struct UdpSession {
    peer: Arc<UdpPeer>,
    remote: SocketAddr,
}

impl Session for UdpSession {
    fn send(&self, payload: Bytes, on_done: Option<SendCb>) {
        let socket = match self.peer.live_socket() {
            Ok(Some(socket)) => socket,
            _ => return complete(on_done, Err(NetError::Shutdown)),
        };

        match socket.try_send_to(&payload, self.remote) {
            Ok(n) if n < payload.len() => complete(on_done, Err(NetError::Half)),
            Ok(_) => complete(on_done, Ok(())),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    return complete(on_done, Err(e.into()));
                };
                let remote = self.remote;
                handle.spawn(async move {
                    let result = match socket.send_to(&payload, remote).await {
                        Ok(n) if n < payload.len() => Err(NetError::Half),
                        Ok(_) => Ok(()),
                        Err(e) => Err(e.into()),
                    };
                    complete(on_done, result);
                });
            }
            Err(e) => complete(on_done, Err(e.into())),
        }
    }

    fn shutdown(&self, _immediate: bool) {}

    fn is_established(&self) -> bool {
        true
    }

    fn local_addr(&self) -> Endpoint {
        self.peer
            .local_addr()
            .unwrap_or_else(|| Endpoint::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), Scheme::Udp))
    }

    fn remote_addr(&self) -> Endpoint {
        Endpoint::new(self.remote, Scheme::Udp)
    }

    fn pending_send_count(&self) -> usize {
        0
    }

    fn storage(&self) -> &Storage {
        &self.peer.storage
    }
}
