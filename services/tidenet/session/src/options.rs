//! Cascading configuration.
//!
//! Every facade and engine owner carries an [`OptionsNode`]. Linking a
//! child under a parent copies the parent's current [`Options`] into the
//! child and makes every later setter on the parent cascade into it. That
//! is how a `Server` facade's callbacks and limits reach the `TcpServer`
//! it creates, without the engine re-exposing the setters. Sessions take
//! a plain [`Options`] snapshot at construction.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entry::SessionEntry;
use crate::error::NetError;

/// Fired once a session is established and its pipelines are about to run
pub type ConnectedCb = Arc<dyn Fn(&SessionEntry) + Send + Sync>;

/// Fed every time new bytes arrive with everything not yet consumed.
/// Returns how many leading bytes it consumed.
pub type ReceiveCb =
    Arc<dyn Fn(&SessionEntry, &[u8]) -> Result<usize, ParseError> + Send + Sync>;

/// Fired exactly once per session, last, with the sticky close error
pub type DisconnectedCb = Arc<dyn Fn(&SessionEntry, &NetError) + Send + Sync>;

/// Runs around each blocking accept
pub type AcceptHook = Arc<dyn Fn() + Send + Sync>;

/// Observer for option changes on one node
pub type OnSetHook = Arc<dyn Fn(OptionKey, &Options) + Send + Sync>;

/// Returned by a receive callback that cannot make sense of the stream
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("receive callback rejected the stream")]
pub struct ParseError;

/// Numeric limits; everything here can come from a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Per-message send timeout in milliseconds, 0 disables it
    pub send_timeout_ms: u64,
    /// Initial receive buffer size
    pub max_pack_size: usize,
    /// Size the receive buffer shrinks back to (0: same as `max_pack_size`)
    pub max_pack_size_shrink: usize,
    /// Receive buffer cap (0: same as `max_pack_size`)
    pub max_pack_size_hard: usize,
    /// Concurrent sessions a server admits
    pub max_connections: usize,
    /// Listen backlog
    pub listen_backlog: u32,
    /// Messages the send queue holds before rejecting with `SendOverflow`
    pub max_send_queue: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            send_timeout_ms: 0,
            max_pack_size: 64 * 1024,
            max_pack_size_shrink: 0,
            max_pack_size_hard: 0,
            max_connections: usize::MAX,
            listen_backlog: 1024,
            max_send_queue: usize::MAX,
        }
    }
}

impl Limits {
    /// Send timeout, `None` when disabled
    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_ms > 0).then(|| Duration::from_millis(self.send_timeout_ms))
    }

    /// Effective initial receive buffer size (at least one byte)
    pub fn initial_pack_size(&self) -> usize {
        self.max_pack_size.max(1)
    }

    /// Effective shrink threshold
    pub fn shrink_threshold(&self) -> usize {
        self.max_pack_size_shrink.max(self.initial_pack_size())
    }

    /// Effective hard cap
    pub fn hard_limit(&self) -> usize {
        self.max_pack_size_hard.max(self.initial_pack_size())
    }
}

/// Hooks around each accept, used to serialise accepting across
/// cooperating processes that share one listening socket
#[derive(Clone, Default)]
pub struct AcceptHooks {
    /// Runs before blocking in accept
    pub before: Option<AcceptHook>,
    /// Runs after accept returns, successfully or not
    pub after: Option<AcceptHook>,
}

/// Secure channel parameters
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// Used by listeners on `tls://`
    pub server: Option<Arc<rustls::ServerConfig>>,
    /// Used by clients connecting to `tls://`
    pub client: Option<Arc<rustls::ClientConfig>>,
    /// SNI name; defaults to the host of the connect URL
    pub server_name: Option<String>,
}

/// One complete configuration snapshot
#[derive(Clone, Default)]
pub struct Options {
    /// Numeric limits
    pub limits: Limits,
    /// Connected callback
    pub connected: Option<ConnectedCb>,
    /// Receive callback; `None` means raw mode (bytes are discarded)
    pub received: Option<ReceiveCb>,
    /// Disconnected callback
    pub disconnected: Option<DisconnectedCb>,
    /// Accept hooks
    pub accept_hooks: AcceptHooks,
    /// Secure channel parameters
    pub tls: TlsOptions,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("limits", &self.limits)
            .field("connected", &self.connected.is_some())
            .field("received", &self.received.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("before_accept", &self.accept_hooks.before.is_some())
            .field("after_accept", &self.accept_hooks.after.is_some())
            .field("tls_server", &self.tls.server.is_some())
            .field("tls_client", &self.tls.client.is_some())
            .finish()
    }
}

/// Which setting a cascade carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKey {
    /// The whole snapshot was replaced by linking
    Linked,
    /// `limits.send_timeout_ms`
    SendTimeout,
    /// `limits.max_pack_size`
    MaxPackSize,
    /// `limits.max_pack_size_shrink`
    MaxPackSizeShrink,
    /// `limits.max_pack_size_hard`
    MaxPackSizeHard,
    /// `limits.max_connections`
    MaxConnections,
    /// `limits.listen_backlog`
    ListenBacklog,
    /// `limits.max_send_queue`
    MaxSendQueue,
    /// All of `limits`
    Limits,
    /// `connected`
    ConnectedCb,
    /// `received`
    ReceiveCb,
    /// `disconnected`
    DisconnectedCb,
    /// `accept_hooks`
    AcceptHooks,
    /// `tls`
    Tls,
}

/// Why a link was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The child already has a parent
    #[error("options node already has a parent")]
    AlreadyLinked,
    /// The child is the parent or one of its ancestors
    #[error("linking would create a cycle")]
    Cycle,
}

/// Shared, linkable configuration node
#[derive(Clone, Default)]
pub struct OptionsNode {
    inner: Arc<NodeInner>,
}

#[derive(Default)]
struct NodeInner {
    data: RwLock<Options>,
    children: Mutex<Vec<Weak<NodeInner>>>,
    parent: Mutex<Weak<NodeInner>>,
    linked: AtomicBool,
    on_set: RwLock<Option<OnSetHook>>,
}

impl NodeInner {
    fn apply(&self, key: OptionKey, f: &dyn Fn(&mut Options)) {
        let snapshot = {
            let mut data = self.data.write();
            f(&mut data);
            data.clone()
        };
        self.fire(key, &snapshot);
        for child in self.live_children() {
            child.apply(key, f);
        }
    }

    fn assign(&self, options: Options) {
        *self.data.write() = options.clone();
        self.fire(OptionKey::Linked, &options);
        for child in self.live_children() {
            child.assign(options.clone());
        }
    }

    fn fire(&self, key: OptionKey, options: &Options) {
        let hook = self.on_set.read().clone();
        if let Some(hook) = hook {
            hook(key, options);
        }
    }

    fn live_children(&self) -> Vec<Arc<NodeInner>> {
        let mut children = self.children.lock();
        children.retain(|w| w.strong_count() > 0);
        children.iter().filter_map(Weak::upgrade).collect()
    }
}

impl fmt::Debug for OptionsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsNode")
            .field("options", &*self.inner.data.read())
            .field("children", &self.child_count())
            .finish()
    }
}

impl OptionsNode {
    /// A fresh root node with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// A root node seeded with `options`
    pub fn with_options(options: Options) -> Self {
        let node = Self::default();
        *node.inner.data.write() = options;
        node
    }

    /// Copy of the current options
    pub fn snapshot(&self) -> Options {
        self.inner.data.read().clone()
    }

    /// Run `f` against the current options under the read lock. Clone what
    /// you need out of it; setters called from `f` deadlock.
    pub fn read<R>(&self, f: impl FnOnce(&Options) -> R) -> R {
        f(&self.inner.data.read())
    }

    /// Copy of the current limits
    pub fn limits(&self) -> Limits {
        self.inner.data.read().limits.clone()
    }

    /// Install the observer that runs after every change to this node
    pub fn on_set<F>(&self, hook: F)
    where
        F: Fn(OptionKey, &Options) + Send + Sync + 'static,
    {
        *self.inner.on_set.write() = Some(Arc::new(hook));
    }

    /// Link `child` under `self`: the child takes the current snapshot now
    /// and every later change made through `self`.
    pub fn link(&self, child: &OptionsNode) -> Result<(), LinkError> {
        if self.is_descendant_of(child) {
            return Err(LinkError::Cycle);
        }
        if child.inner.linked.swap(true, Ordering::AcqRel) {
            return Err(LinkError::AlreadyLinked);
        }

        *child.inner.parent.lock() = Arc::downgrade(&self.inner);
        self.inner.children.lock().push(Arc::downgrade(&child.inner));
        child.inner.assign(self.snapshot());
        Ok(())
    }

    fn is_descendant_of(&self, other: &OptionsNode) -> bool {
        let mut cursor = Some(self.inner.clone());
        while let Some(node) = cursor {
            if Arc::ptr_eq(&node, &other.inner) {
                return true;
            }
            cursor = node.parent.lock().upgrade();
        }
        false
    }

    /// Number of live linked children
    pub fn child_count(&self) -> usize {
        self.inner.live_children().len()
    }

    fn update(&self, key: OptionKey, f: &dyn Fn(&mut Options)) -> &Self {
        self.inner.apply(key, f);
        self
    }

    /// Set or clear the per-message send timeout
    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> &Self {
        let ms = timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX).max(1))
            .unwrap_or(0);
        self.update(OptionKey::SendTimeout, &move |o| o.limits.send_timeout_ms = ms)
    }

    /// Set the initial receive buffer size
    pub fn set_max_pack_size(&self, size: usize) -> &Self {
        self.update(OptionKey::MaxPackSize, &move |o| o.limits.max_pack_size = size)
    }

    /// Set the shrink threshold
    pub fn set_max_pack_size_shrink(&self, size: usize) -> &Self {
        self.update(OptionKey::MaxPackSizeShrink, &move |o| {
            o.limits.max_pack_size_shrink = size
        })
    }

    /// Set the receive buffer cap
    pub fn set_max_pack_size_hard(&self, size: usize) -> &Self {
        self.update(OptionKey::MaxPackSizeHard, &move |o| o.limits.max_pack_size_hard = size)
    }

    /// Set the admission limit
    pub fn set_max_connections(&self, max: usize) -> &Self {
        self.update(OptionKey::MaxConnections, &move |o| o.limits.max_connections = max)
    }

    /// Set the listen backlog
    pub fn set_listen_backlog(&self, backlog: u32) -> &Self {
        self.update(OptionKey::ListenBacklog, &move |o| o.limits.listen_backlog = backlog)
    }

    /// Set the send queue capacity
    pub fn set_max_send_queue(&self, max: usize) -> &Self {
        self.update(OptionKey::MaxSendQueue, &move |o| o.limits.max_send_queue = max)
    }

    /// Replace every limit at once
    pub fn set_limits(&self, limits: Limits) -> &Self {
        self.update(OptionKey::Limits, &move |o| o.limits = limits.clone())
    }

    /// Set or clear the connected callback
    pub fn replace_connected_cb(&self, cb: Option<ConnectedCb>) -> &Self {
        self.update(OptionKey::ConnectedCb, &move |o| o.connected = cb.clone())
    }

    /// Set or clear the receive callback
    pub fn replace_receive_cb(&self, cb: Option<ReceiveCb>) -> &Self {
        self.update(OptionKey::ReceiveCb, &move |o| o.received = cb.clone())
    }

    /// Set or clear the disconnected callback
    pub fn replace_disconnected_cb(&self, cb: Option<DisconnectedCb>) -> &Self {
        self.update(OptionKey::DisconnectedCb, &move |o| o.disconnected = cb.clone())
    }

    /// Replace the accept hooks
    pub fn set_accept_hooks(&self, hooks: AcceptHooks) -> &Self {
        self.update(OptionKey::AcceptHooks, &move |o| o.accept_hooks = hooks.clone())
    }

    /// Replace the secure channel parameters
    pub fn set_tls(&self, tls: TlsOptions) -> &Self {
        self.update(OptionKey::Tls, &move |o| o.tls = tls.clone())
    }
}

/// Chaining setters for anything that owns an [`OptionsNode`]
pub trait Configure {
    /// The node the setters write to
    fn options(&self) -> &OptionsNode;

    /// Per-message send timeout (`None` disables it)
    fn set_send_timeout(&self, timeout: Option<Duration>) -> &Self {
        self.options().set_send_timeout(timeout);
        self
    }

    /// Initial receive buffer size
    fn set_max_pack_size(&self, size: usize) -> &Self {
        self.options().set_max_pack_size(size);
        self
    }

    /// Receive buffer shrink threshold
    fn set_max_pack_size_shrink(&self, size: usize) -> &Self {
        self.options().set_max_pack_size_shrink(size);
        self
    }

    /// Receive buffer cap
    fn set_max_pack_size_hard(&self, size: usize) -> &Self {
        self.options().set_max_pack_size_hard(size);
        self
    }

    /// Concurrent sessions a server admits
    fn set_max_connections(&self, max: usize) -> &Self {
        self.options().set_max_connections(max);
        self
    }

    /// Listen backlog
    fn set_listen_backlog(&self, backlog: u32) -> &Self {
        self.options().set_listen_backlog(backlog);
        self
    }

    /// Send queue capacity
    fn set_max_send_queue(&self, max: usize) -> &Self {
        self.options().set_max_send_queue(max);
        self
    }

    /// Every limit at once
    fn set_limits(&self, limits: Limits) -> &Self {
        self.options().set_limits(limits);
        self
    }

    /// Connected callback
    fn set_connected_cb<F>(&self, cb: F) -> &Self
    where
        F: Fn(&SessionEntry) + Send + Sync + 'static,
    {
        self.options().replace_connected_cb(Some(Arc::new(cb)));
        self
    }

    /// Receive callback
    fn set_receive_cb<F>(&self, cb: F) -> &Self
    where
        F: Fn(&SessionEntry, &[u8]) -> Result<usize, ParseError> + Send + Sync + 'static,
    {
        self.options().replace_receive_cb(Some(Arc::new(cb)));
        self
    }

    /// Disconnected callback
    fn set_disconnected_cb<F>(&self, cb: F) -> &Self
    where
        F: Fn(&SessionEntry, &NetError) + Send + Sync + 'static,
    {
        self.options().replace_disconnected_cb(Some(Arc::new(cb)));
        self
    }

    /// Hooks around each accept
    fn set_accept_hooks<B, A>(&self, before: B, after: A) -> &Self
    where
        B: Fn() + Send + Sync + 'static,
        A: Fn() + Send + Sync + 'static,
    {
        self.options().set_accept_hooks(AcceptHooks {
            before: Some(Arc::new(before)),
            after: Some(Arc::new(after)),
        });
        self
    }

    /// Secure channel parameters
    fn set_tls(&self, tls: TlsOptions) -> &Self {
        self.options().set_tls(tls);
        self
    }
}

impl Configure for OptionsNode {
    fn options(&self) -> &OptionsNode {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_limits_effective_values() {
        let mut limits = Limits::default();
        assert_eq!(limits.send_timeout(), None);
        assert_eq!(limits.shrink_threshold(), 64 * 1024);
        assert_eq!(limits.hard_limit(), 64 * 1024);

        limits.max_pack_size = 1024;
        limits.max_pack_size_shrink = 512;
        limits.max_pack_size_hard = 8192;
        limits.send_timeout_ms = 50;
        assert_eq!(limits.shrink_threshold(), 1024);
        assert_eq!(limits.hard_limit(), 8192);
        assert_eq!(limits.send_timeout(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_send_timeout_conversion_saturates() {
        let node = OptionsNode::new();
        node.set_send_timeout(Some(Duration::MAX));
        assert_eq!(node.limits().send_timeout_ms, u64::MAX);

        // Sub-millisecond timeouts still arm the timer
        node.set_send_timeout(Some(Duration::from_micros(10)));
        assert_eq!(node.limits().send_timeout_ms, 1);

        node.set_send_timeout(None);
        assert_eq!(node.limits().send_timeout(), None);
    }

    #[test]
    fn test_link_copies_snapshot() {
        let parent = OptionsNode::new();
        parent.set_max_connections(7).set_send_timeout(Some(Duration::from_millis(20)));

        let child = OptionsNode::new();
        parent.link(&child).unwrap();

        let limits = child.limits();
        assert_eq!(limits.max_connections, 7);
        assert_eq!(limits.send_timeout_ms, 20);
    }

    #[test]
    fn test_setters_cascade_to_grandchildren() {
        let root = OptionsNode::new();
        let child = OptionsNode::new();
        let grandchild = OptionsNode::new();
        root.link(&child).unwrap();
        child.link(&grandchild).unwrap();

        root.set_max_pack_size(4096);
        assert_eq!(child.limits().max_pack_size, 4096);
        assert_eq!(grandchild.limits().max_pack_size, 4096);

        // Setting on a child does not climb back up
        child.set_listen_backlog(16);
        assert_eq!(root.limits().listen_backlog, 1024);
        assert_eq!(grandchild.limits().listen_backlog, 16);
    }

    #[test]
    fn test_single_parent_and_no_cycles() {
        let a = OptionsNode::new();
        let b = OptionsNode::new();
        let c = OptionsNode::new();
        a.link(&b).unwrap();

        assert_eq!(c.link(&b), Err(LinkError::AlreadyLinked));
        assert_eq!(b.link(&a), Err(LinkError::Cycle));
        assert_eq!(a.link(&a), Err(LinkError::Cycle));
    }

    #[test]
    fn test_on_set_hook_sees_new_value() {
        let parent = OptionsNode::new();
        let child = OptionsNode::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        child.on_set(move |key, opts| {
            if key == OptionKey::MaxPackSize {
                s.store(opts.limits.max_pack_size, Ordering::SeqCst);
            }
        });
        parent.link(&child).unwrap();
        parent.set_max_pack_size(2048);

        assert_eq!(seen.load(Ordering::SeqCst), 2048);
    }

    #[test]
    fn test_dropped_child_is_unlinked() {
        let parent = OptionsNode::new();
        {
            let child = OptionsNode::new();
            parent.link(&child).unwrap();
            assert_eq!(parent.child_count(), 1);
        }
        assert_eq!(parent.child_count(), 0);
        parent.set_max_connections(1);
    }

    #[test]
    fn test_callbacks_cascade() {
        let parent = OptionsNode::new();
        let child = OptionsNode::new();
        parent.link(&child).unwrap();

        parent
            .set_receive_cb(|_, data| Ok(data.len()))
            .set_connected_cb(|_| {});
        let snapshot = child.snapshot();
        assert!(snapshot.received.is_some());
        assert!(snapshot.connected.is_some());
        assert!(snapshot.disconnected.is_none());
    }
}
