//! TCP/TLS session engine.
//!
//! Each [`TcpSession`] runs two tasks: the receive task fills a
//! [`RecvBuffer`] and feeds the receive callback, the send task drains the
//! [`SendQueue`] into an in-flight list and writes it with vectored writes.
//! The first failure either task sees becomes the sticky close error. The
//! two half-close paths meet in `on_close`, which runs exactly once, fails
//! everything still pending with `Shutdown` and then fires the
//! disconnected callback.

use std::collections::VecDeque;
use std::fmt;
use std::io::IoSlice;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tide_endpoint::{Endpoint, Scheme};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::buffer::RecvBuffer;
use crate::entry::{complete, SendCb, Session, SessionEntry, Storage};
use crate::error::{NetError, Result};
use crate::message::{Message, Queued, SendQueue};
use crate::options::Options;
use crate::transport::{shutdown_socket, IoStream, Reader, Writer};

/// Messages written per vectored write
pub const BATCH: usize = 64;

#[derive(Default)]
struct SendState {
    in_flight: VecDeque<Message>,
    /// The send task owns the socket's write side right now
    sending: bool,
    /// The send task has returned
    exited: bool,
    /// `on_close` has drained everything
    closed: bool,
}

/// One established TCP or TLS connection
pub struct TcpSession {
    halves: Mutex<Option<(Reader, Writer)>>,
    plain: Option<Arc<TcpStream>>,
    ctl: std::net::TcpStream,
    options: Options,
    queue: SendQueue,
    send_state: tokio::sync::Mutex<SendState>,
    next_id: AtomicU64,
    close_err: OnceLock<NetError>,
    send_closed: AtomicBool,
    recv_closed: AtomicBool,
    initiated_by_owner: AtomicBool,
    closed: AtomicBool,
    local: Endpoint,
    remote: Endpoint,
    storage: Storage,
}

impl TcpSession {
    /// Wrap a connected stream. Nothing runs until [`TcpSession::start`].
    pub fn new(stream: IoStream, options: Options) -> Result<Arc<Self>> {
        let scheme = if stream.is_secure() { Scheme::Tls } else { Scheme::Tcp };
        let local = Endpoint::new(stream.local_addr()?, scheme);
        let remote = Endpoint::new(stream.peer_addr()?, scheme);
        let ctl = stream.control_handle()?;
        let (reader, writer, plain) = stream.split();
        let queue = SendQueue::new(options.limits.max_send_queue);

        Ok(Arc::new(Self {
            halves: Mutex::new(Some((reader, writer))),
            plain,
            ctl,
            options,
            queue,
            send_state: tokio::sync::Mutex::new(SendState::default()),
            next_id: AtomicU64::new(1),
            close_err: OnceLock::new(),
            send_closed: AtomicBool::new(false),
            recv_closed: AtomicBool::new(false),
            initiated_by_owner: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            local,
            remote,
            storage: Storage::default(),
        }))
    }

    /// Fire the connected callback and spawn both pipelines.
    ///
    /// Returns false when the session was already started, or was shut
    /// down before it could start. An unstarted session never fires any
    /// callback; its socket closes when the last handle is dropped.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some((reader, writer)) = self.halves.lock().take() else {
            return false;
        };
        if self.is_closing() {
            debug!("Session {} -> {} shut down before start", self.local, self.remote);
            return false;
        }
        debug!("Session started {} -> {}", self.local, self.remote);

        if let Some(cb) = &self.options.connected {
            cb(&self.entry());
        }

        tokio::spawn(self.clone().recv_loop(reader));
        tokio::spawn(self.clone().send_loop(writer));
        true
    }

    /// Handle for callbacks and registries
    pub fn entry(self: &Arc<Self>) -> SessionEntry {
        SessionEntry::new(self.clone())
    }

    /// The shutdown was requested by the owner rather than caused by a failure
    pub fn initiated_by_owner(&self) -> bool {
        self.initiated_by_owner.load(Ordering::Acquire)
    }

    /// The sticky close error, once recorded
    pub fn close_error(&self) -> Option<&NetError> {
        self.close_err.get()
    }

    fn set_error(&self, err: NetError) {
        let _ = self.close_err.set(err);
    }

    fn is_closing(&self) -> bool {
        self.close_err.get().is_some()
            || self.send_closed.load(Ordering::Acquire)
            || self.recv_closed.load(Ordering::Acquire)
    }

    fn message(&self, payload: Bytes, on_done: Option<SendCb>) -> Message {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Message::new(id, payload, self.options.limits.send_timeout(), on_done)
    }

    async fn recv_loop(self: Arc<Self>, mut reader: Reader) {
        let entry = self.entry();
        let mut buf = RecvBuffer::new(&self.options.limits);

        let err = loop {
            let spare = match buf.spare() {
                Ok(spare) => spare,
                Err(e) => break e,
            };
            let n = match reader.read(spare).await {
                Ok(0) => break NetError::eof(),
                Ok(n) => n,
                Err(e) => break e.into(),
            };
            buf.commit(n);

            match &self.options.received {
                Some(cb) => {
                    let available = buf.data().len();
                    match cb(&entry, buf.data()) {
                        Ok(consumed) if consumed <= available => buf.consume(consumed),
                        _ => break NetError::DataParse,
                    }
                }
                None => buf.clear(),
            }
        };

        debug!("Receive side of {} stopped: {}", self.remote, err);
        self.set_error(err);
        drop(entry);
        self.shutdown_recv().await;
    }

    async fn send_loop(self: Arc<Self>, mut writer: Writer) {
        // Bounded writable waits so timed-out messages are reaped while
        // the peer is not reading.
        let cap = self
            .options
            .limits
            .send_timeout()
            .map(|t| (t / 2).max(Duration::from_millis(1)));
        let mut draining = false;

        let result: Result<()> = loop {
            let mut state = self.send_state.lock().await;
            if state.closed {
                break Ok(());
            }

            let now = Instant::now();
            if !draining {
                draining = self.pull_batch(&mut state.in_flight, now);
            }
            reap_timed_out(&mut state.in_flight, now);

            if state.in_flight.is_empty() {
                if draining {
                    break Ok(());
                }
                state.sending = false;
                drop(state);

                if let Err(e) = flush_all(&mut writer, cap).await {
                    break Err(e.into());
                }
                if self.queue.is_empty() {
                    self.queue.wait().await;
                }
                continue;
            }

            state.sending = true;
            let written = {
                let slices: SmallVec<[IoSlice<'_>; BATCH]> = state
                    .in_flight
                    .iter()
                    .take(BATCH)
                    .map(|m| IoSlice::new(m.remaining()))
                    .collect();
                writer.write_vectored(&slices, cap).await
            };

            match written {
                Ok(Some(n)) => complete_written(&mut state.in_flight, n),
                Ok(None) => {}
                Err(e) => break Err(e.into()),
            }
        };

        match result {
            Err(e) => {
                debug!("Send side of {} failed: {}", self.remote, e);
                self.set_error(e);
            }
            Ok(()) if draining => {
                let _ = flush_all(&mut writer, cap).await;
            }
            Ok(()) => {}
        }
        self.send_state.lock().await.exited = true;
        self.shutdown_send().await;
    }

    /// Move queued messages into the in-flight list. Returns true when the
    /// shutdown sentinel was reached.
    fn pull_batch(&self, in_flight: &mut VecDeque<Message>, now: Instant) -> bool {
        while in_flight.len() < BATCH {
            match self.queue.try_pop() {
                Some(Queued::Data(msg)) if msg.is_timed_out(now) => msg.done(Err(NetError::SendTimeout)),
                Some(Queued::Data(msg)) => in_flight.push_back(msg),
                Some(Queued::Shutdown) => return true,
                None => break,
            }
        }
        false
    }

    async fn shutdown_recv(self: &Arc<Self>) {
        shutdown_socket(&self.ctl, Shutdown::Read);
        self.recv_closed.store(true, Ordering::SeqCst);
        if self.send_closed.load(Ordering::SeqCst) {
            self.on_close().await;
        } else {
            // Nothing more will be read, so stop writing too
            shutdown_socket(&self.ctl, Shutdown::Write);
            self.queue.push_shutdown();
        }
    }

    async fn shutdown_send(self: &Arc<Self>) {
        shutdown_socket(&self.ctl, Shutdown::Write);
        self.send_closed.store(true, Ordering::SeqCst);
        if self.recv_closed.load(Ordering::SeqCst) {
            self.on_close().await;
        }
    }

    async fn on_close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shutdown_socket(&self.ctl, Shutdown::Both);

        for msg in self.queue.close_and_drain() {
            msg.done(Err(NetError::Shutdown));
        }
        let in_flight = {
            let mut state = self.send_state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.in_flight)
        };
        for msg in in_flight {
            msg.done(Err(NetError::Shutdown));
        }

        let err = self.close_err.get().cloned().unwrap_or(NetError::Shutdown);
        debug!(
            "Session closed {} -> {} (owner: {}): {}",
            self.local,
            self.remote,
            self.initiated_by_owner(),
            err
        );
        if let Some(cb) = &self.options.disconnected {
            cb(&self.entry(), &err);
        }
    }
}

fn reap_timed_out(in_flight: &mut VecDeque<Message>, now: Instant) {
    if !in_flight.iter().any(|m| m.is_timed_out(now)) {
        return;
    }
    let mut kept = VecDeque::with_capacity(in_flight.len());
    for msg in in_flight.drain(..) {
        if msg.is_timed_out(now) {
            msg.done(Err(NetError::SendTimeout));
        } else {
            kept.push_back(msg);
        }
    }
    *in_flight = kept;
}

/// Walk the in-flight list from the front, completing fully written messages
fn complete_written(in_flight: &mut VecDeque<Message>, mut written: usize) {
    while written > 0 {
        let Some(front) = in_flight.front_mut() else {
            break;
        };
        let remaining = front.remaining_len();
        if written < remaining {
            front.advance(written);
            return;
        }
        written -= remaining;
        if let Some(msg) = in_flight.pop_front() {
            msg.done(Ok(()));
        }
    }
}

async fn flush_all(writer: &mut Writer, cap: Option<Duration>) -> std::io::Result<()> {
    while !writer.flush(cap).await? {}
    Ok(())
}

impl Session for TcpSession {
    fn send(&self, payload: Bytes, on_done: Option<SendCb>) {
        if payload.is_empty() {
            complete(on_done, Ok(()));
            return;
        }
        if self.is_closing() {
            complete(on_done, Err(NetError::Shutdown));
            return;
        }
        if let Err((msg, e)) = self.queue.push(self.message(payload, on_done)) {
            msg.done(Err(e));
        }
    }

    fn send_no_delay(&self, payload: Bytes, on_done: Option<SendCb>) {
        let Some(stream) = &self.plain else {
            return self.send(payload, on_done);
        };
        if payload.is_empty() || self.is_closing() {
            return self.send(payload, on_done);
        }
        let Ok(mut state) = self.send_state.try_lock() else {
            return self.send(payload, on_done);
        };
        if state.sending
            || state.exited
            || state.closed
            || !state.in_flight.is_empty()
            || !self.queue.is_empty()
        {
            drop(state);
            return self.send(payload, on_done);
        }

        match stream.try_write(&payload) {
            Ok(n) if n == payload.len() => {
                drop(state);
                complete(on_done, Ok(()));
            }
            Ok(n) if n > 0 => {
                let mut msg = self.message(payload, on_done);
                msg.advance(n);
                state.in_flight.push_front(msg);
                state.sending = true;
                drop(state);
                self.queue.wake();
            }
            _ => {
                drop(state);
                self.send(payload, on_done);
            }
        }
    }

    fn shutdown(&self, immediate: bool) {
        self.set_error(NetError::Shutdown);
        self.initiated_by_owner.store(true, Ordering::Release);
        if immediate {
            shutdown_socket(&self.ctl, Shutdown::Both);
        }
        self.queue.push_shutdown();
    }

    fn is_established(&self) -> bool {
        self.close_err.get().is_none()
    }

    fn local_addr(&self) -> Endpoint {
        self.local.clone()
    }

    fn remote_addr(&self) -> Endpoint {
        self.remote.clone()
    }

    fn pending_send_count(&self) -> usize {
        self.queue.len()
    }

    fn storage(&self) -> &Storage {
        &self.storage
    }

    fn set_no_delay(&self, no_delay: bool) -> Result<()> {
        self.ctl.set_nodelay(no_delay)?;
        Ok(())
    }
}

impl fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSession")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("established", &self.is_established())
            .field("pending", &self.queue.len())
            .finish()
    }
}
