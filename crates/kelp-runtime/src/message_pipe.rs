//! Thread-crossing message queue with an OS wakeup channel.
//!
//! A [`MessagePipe`] is shared by a sender thread and the receiving thread's
//! event loop. The queue lives under a mutex; after every push the sender
//! signals the pipe's [`WakeupPipe`], whose read end the receiver polls. The
//! receiver drains the wakeup only when it empties the queue, so the read end
//! stays readable while messages are pending.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::shared_buffer::SharedBuffer;
use crate::wakeup::WakeupPipe;

/// A serialized payload plus the shared buffers it references.
///
/// Dropping a message releases its shared buffer references.
#[derive(Debug, Default)]
pub struct Message {
    /// Serialized unit
    pub data: Vec<u8>,
    /// Shared buffer table, indexed by the unit's shared buffer references
    pub shared: Vec<SharedBuffer>,
}

impl Message {
    /// Create a message
    pub fn new(data: Vec<u8>, shared: Vec<SharedBuffer>) -> Self {
        Self { data, shared }
    }
}

struct PipeInner {
    queue: Mutex<VecDeque<Message>>,
    wakeup: WakeupPipe,
}

impl Drop for PipeInner {
    fn drop(&mut self) {
        let pending = self.queue.get_mut().len();
        if pending > 0 {
            trace!(pending, "message pipe freed with queued messages");
        }
    }
}

/// Reference-counted message pipe. Clones share the same queue.
#[derive(Clone)]
pub struct MessagePipe {
    inner: Arc<PipeInner>,
}

impl MessagePipe {
    /// Create an empty pipe
    pub fn new() -> RuntimeResult<Self> {
        let wakeup = WakeupPipe::new().map_err(|e| {
            warn!(error = %e, "failed to create message pipe");
            RuntimeError::Io(e)
        })?;
        Ok(Self {
            inner: Arc::new(PipeInner {
                queue: Mutex::new(VecDeque::new()),
                wakeup,
            }),
        })
    }

    /// Queue a message and wake the receiver.
    ///
    /// Shared buffers in the message must already be duplicated for the
    /// receiver.
    pub fn send(&self, message: Message) -> RuntimeResult<()> {
        let len = message.data.len();
        self.inner.queue.lock().push_back(message);
        self.inner.wakeup.signal()?;
        trace!(len, "message queued");
        Ok(())
    }

    /// Pop the oldest message, or `None` when the queue is empty
    pub fn try_recv(&self) -> Option<Message> {
        let mut queue = self.inner.queue.lock();
        let message = queue.pop_front();
        if queue.is_empty() {
            // Drained under the lock: any later send signals again.
            if let Err(e) = self.inner.wakeup.drain() {
                warn!(error = %e, "failed to drain message pipe wakeup");
            }
        }
        message
    }

    /// Descriptor that becomes readable when messages are queued
    pub fn wakeup_fd(&self) -> RawFd {
        self.inner.wakeup.read_fd()
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Whether no messages are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether anyone besides this handle still references the pipe
    pub fn has_peer(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
    }

    /// Whether two handles share the same pipe
    pub fn ptr_eq(a: &MessagePipe, b: &MessagePipe) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Drop for MessagePipe {
    fn drop(&mut self) {
        // Last handle besides ours: wake the other side so its poll step
        // notices the pipe closed.
        if Arc::strong_count(&self.inner) == 2
            && let Err(e) = self.inner.wakeup.signal()
        {
            warn!(error = %e, "failed to signal message pipe close");
        }
    }
}

impl fmt::Debug for MessagePipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePipe")
            .field("queued", &self.len())
            .field("fd", &self.wakeup_fd())
            .finish()
    }
}
