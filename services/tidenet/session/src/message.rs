//! Send requests and the queue between `send` and the send task.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::entry::{complete, SendCb};
use crate::error::{NetError, Result};

/// One send request.
///
/// The completion callback fires exactly once: through [`Message::done`],
/// or with `Shutdown` when the message is dropped unfinished.
pub(crate) struct Message {
    id: u64,
    payload: Bytes,
    pos: usize,
    half_sent: bool,
    deadline: Option<Instant>,
    on_done: Option<SendCb>,
}

impl Message {
    pub(crate) fn new(
        id: u64,
        payload: Bytes,
        timeout: Option<Duration>,
        on_done: Option<SendCb>,
    ) -> Self {
        Self {
            id,
            payload,
            pos: 0,
            half_sent: false,
            deadline: timeout.map(|t| Instant::now() + t),
            on_done,
        }
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Bytes still to be written
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.payload[self.pos..]
    }

    pub(crate) fn remaining_len(&self) -> usize {
        self.payload.len() - self.pos
    }

    /// Record `n` more bytes written
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining_len());
        self.pos += n;
        if self.pos > 0 {
            self.half_sent = true;
        }
    }

    /// At least one byte of this message is on the wire
    #[cfg(test)]
    pub(crate) fn is_half_sent(&self) -> bool {
        self.half_sent
    }

    /// Deadline passed. Half-sent messages are never reported as timed out.
    pub(crate) fn is_timed_out(&self, now: Instant) -> bool {
        !self.half_sent && self.deadline.is_some_and(|d| now >= d)
    }

    /// Complete the message
    pub(crate) fn done(mut self, result: Result<()>) {
        complete(self.on_done.take(), result);
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .field("pos", &self.pos)
            .field("half_sent", &self.half_sent)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(cb) = self.on_done.take() {
            cb(Err(NetError::Shutdown));
        }
    }
}

/// Queue entry: data, or the owner's request to stop sending
pub(crate) enum Queued {
    Data(Message),
    Shutdown,
}

struct QueueState {
    items: VecDeque<Queued>,
    data_len: usize,
    shutdown_queued: bool,
    closed: bool,
}

/// Multi-producer queue drained by a single send task.
///
/// `Notify` keeps one permit, so a push that lands while the send task
/// is between "saw empty" and "waiting" still wakes it.
pub(crate) struct SendQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                data_len: 0,
                shutdown_queued: false,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a message; a rejected message is handed back with the reason
    pub(crate) fn push(&self, msg: Message) -> std::result::Result<(), (Message, NetError)> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err((msg, NetError::Shutdown));
            }
            if state.data_len >= self.capacity {
                return Err((msg, NetError::SendOverflow));
            }
            state.items.push_back(Queued::Data(msg));
            state.data_len += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Append the shutdown sentinel once
    pub(crate) fn push_shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.shutdown_queued {
                return;
            }
            state.shutdown_queued = true;
            state.items.push_back(Queued::Shutdown);
        }
        self.notify.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<Queued> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        if let Some(Queued::Data(_)) = item {
            state.data_len -= 1;
        }
        item
    }

    /// Queued data messages
    pub(crate) fn len(&self) -> usize {
        self.state.lock().data_len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Wake the send task without queueing anything
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait until something is pushed or [`SendQueue::wake`] is called
    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Refuse further pushes and hand back everything still queued
    pub(crate) fn close_and_drain(&self) -> Vec<Message> {
        let items = {
            let mut state = self.state.lock();
            state.closed = true;
            state.data_len = 0;
            std::mem::take(&mut state.items)
        };
        items
            .into_iter()
            .filter_map(|item| match item {
                Queued::Data(msg) => Some(msg),
                Queued::Shutdown => None,
            })
            .collect()
    }
}
