//! Application-facing session handle.
//!
//! Callbacks receive a [`SessionEntry`], a nullable shared handle to any
//! [`Session`] implementation (a TCP/TLS engine or a UDP pseudo-session).
//! An empty entry is safe to use: sends fail with [`NetError::Shutdown`],
//! it is never established and it has no addresses.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tide_endpoint::Endpoint;

use crate::error::{NetError, Result};

/// Completion callback for one send request; runs exactly once
pub type SendCb = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Operations every session exposes to application code
pub trait Session: Send + Sync {
    /// Queue `payload` for writing in submission order
    fn send(&self, payload: Bytes, on_done: Option<SendCb>);

    /// Try an immediate write, falling back to [`Session::send`]
    fn send_no_delay(&self, payload: Bytes, on_done: Option<SendCb>) {
        self.send(payload, on_done)
    }

    /// Owner-initiated shutdown. `immediate` closes both directions now;
    /// otherwise queued data is flushed before the write side closes.
    fn shutdown(&self, immediate: bool);

    /// True until the first failure or owner shutdown is recorded
    fn is_established(&self) -> bool;

    /// Local address of the socket
    fn local_addr(&self) -> Endpoint;

    /// Peer address of the socket
    fn remote_addr(&self) -> Endpoint;

    /// Messages waiting in the send queue
    fn pending_send_count(&self) -> usize;

    /// Per-session application storage
    fn storage(&self) -> &Storage;

    /// Toggle TCP_NODELAY where it applies
    fn set_no_delay(&self, _no_delay: bool) -> Result<()> {
        Ok(())
    }
}

/// Nullable, cloneable handle to a session; compares by identity
#[derive(Clone, Default)]
pub struct SessionEntry {
    inner: Option<Arc<dyn Session>>,
}

impl SessionEntry {
    /// Wrap a live session
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self {
            inner: Some(session),
        }
    }

    /// A handle that refers to no session
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Whether this handle refers to no session
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Identity of the referenced session (0 for an empty handle)
    pub fn id(&self) -> usize {
        self.inner
            .as_ref()
            .map(|s| Arc::as_ptr(s) as *const () as usize)
            .unwrap_or(0)
    }

    /// Queue bytes without a completion callback
    pub fn send(&self, payload: impl Into<Bytes>) {
        self.dispatch(payload.into(), None, false)
    }

    /// Queue bytes and get told how it went
    pub fn send_with<F>(&self, payload: impl Into<Bytes>, on_done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.dispatch(payload.into(), Some(Box::new(on_done)), false)
    }

    /// Immediate-write variant of [`SessionEntry::send`]
    pub fn send_no_delay(&self, payload: impl Into<Bytes>) {
        self.dispatch(payload.into(), None, true)
    }

    /// Immediate-write variant of [`SessionEntry::send_with`]
    pub fn send_no_delay_with<F>(&self, payload: impl Into<Bytes>, on_done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.dispatch(payload.into(), Some(Box::new(on_done)), true)
    }

    fn dispatch(&self, payload: Bytes, on_done: Option<SendCb>, no_delay: bool) {
        match &self.inner {
            Some(s) if no_delay => s.send_no_delay(payload, on_done),
            Some(s) => s.send(payload, on_done),
            None => complete(on_done, Err(NetError::Shutdown)),
        }
    }

    /// Shut the session down; no-op on an empty handle
    pub fn shutdown(&self, immediate: bool) {
        if let Some(s) = &self.inner {
            s.shutdown(immediate);
        }
    }

    /// Whether the session is still established
    pub fn is_established(&self) -> bool {
        self.inner.as_ref().map(|s| s.is_established()).unwrap_or(false)
    }

    /// Local address
    pub fn local_addr(&self) -> Option<Endpoint> {
        self.inner.as_ref().map(|s| s.local_addr())
    }

    /// Remote address
    pub fn remote_addr(&self) -> Option<Endpoint> {
        self.inner.as_ref().map(|s| s.remote_addr())
    }

    /// Messages waiting in the send queue
    pub fn pending_send_count(&self) -> usize {
        self.inner.as_ref().map(|s| s.pending_send_count()).unwrap_or(0)
    }

    /// Application storage slot
    pub fn storage(&self) -> Option<&Storage> {
        self.inner.as_ref().map(|s| s.storage())
    }

    /// Toggle TCP_NODELAY
    pub fn set_no_delay(&self, no_delay: bool) -> Result<()> {
        match &self.inner {
            Some(s) => s.set_no_delay(no_delay),
            None => Err(NetError::Shutdown),
        }
    }
}

impl PartialEq for SessionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for SessionEntry {}

impl Hash for SessionEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_addr() {
            Some(remote) => write!(f, "SessionEntry({:#x}, {})", self.id(), remote),
            None => f.write_str("SessionEntry(empty)"),
        }
    }
}

/// Type-erased storage slot owned by a session.
///
/// Closures passed to [`Storage::with`] run under the slot lock and must
/// not touch the same slot again.
#[derive(Default)]
pub struct Storage {
    slot: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Storage {
    /// Replace the stored value
    pub fn set<T: Any + Send>(&self, value: T) {
        *self.slot.lock() = Some(Box::new(value));
    }

    /// Run `f` on the stored value if it has type `T`
    pub fn with<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.slot.lock();
        slot.as_mut()?.downcast_mut::<T>().map(f)
    }

    /// Remove and return the stored value if it has type `T`
    pub fn take<T: Any + Send>(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        match slot.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

pub(crate) fn complete(on_done: Option<SendCb>, result: Result<()>) {
    if let Some(cb) = on_done {
        cb(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_entry_is_total() {
        let entry = SessionEntry::empty();
        assert!(entry.is_empty());
        assert!(!entry.is_established());
        assert!(entry.local_addr().is_none());
        assert!(entry.remote_addr().is_none());
        assert_eq!(entry.pending_send_count(), 0);
        assert!(entry.storage().is_none());
        assert!(matches!(entry.set_no_delay(true), Err(NetError::Shutdown)));
        entry.shutdown(true);

        let failures = Arc::new(AtomicUsize::new(0));
        let f = failures.clone();
        entry.send_with(&b"abc"[..], move |r| {
            assert!(matches!(r, Err(NetError::Shutdown)));
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = failures.clone();
        entry.send_no_delay_with(&b"abc"[..], move |r| {
            assert!(r.is_err());
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_entries_compare_equal() {
        assert_eq!(SessionEntry::empty(), SessionEntry::default());
        assert_eq!(SessionEntry::empty().id(), 0);
    }

    #[test]
    fn test_storage_roundtrip() {
        let storage = Storage::default();
        assert!(storage.is_empty());

        storage.set(41u32);
        assert_eq!(storage.with(|v: &mut u32| {
            *v += 1;
            *v
        }), Some(42));

        // Wrong type leaves the value in place
        assert_eq!(storage.take::<String>(), None);
        assert_eq!(storage.take::<u32>(), Some(42));
        assert!(storage.is_empty());
    }
}
