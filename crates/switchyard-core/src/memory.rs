//! In-process adapter.
//!
//! [`MemoryAdapter`] has no transport: messages are pushed in with
//! [`inject`](MemoryAdapter::inject) and everything the router sends is kept
//! for inspection. Clones share state, so a test can keep one handle while
//! the router owns another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::adapter::{Adapter, EventSink};
use crate::error::{AdapterError, AdapterResult};
use crate::message::Message;

struct Inner {
    name: String,
    events: RwLock<Option<Arc<dyn EventSink>>>,
    options: RwLock<Option<Value>>,
    sent: Mutex<Vec<Message>>,
    outbox: mpsc::UnboundedSender<Message>,
    delivered: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: AtomicBool,
}

/// An adapter backed by in-process channels.
#[derive(Clone)]
pub struct MemoryAdapter {
    inner: Arc<Inner>,
}

impl MemoryAdapter {
    /// Creates an adapter that is not listening yet.
    pub fn new(name: impl Into<String>) -> Self {
        let (outbox, delivered) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                events: RwLock::new(None),
                options: RwLock::new(None),
                sent: Mutex::new(Vec::new()),
                outbox,
                delivered: tokio::sync::Mutex::new(delivered),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Emits `message` as if it had arrived on this adapter's transport.
    pub fn inject(&self, message: Message) -> AdapterResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.closed());
        }
        let events = self.inner.events.read().clone();
        let events = events.ok_or_else(|| AdapterError::NotListening {
            name: self.inner.name.clone(),
        })?;
        events.message(message);
        Ok(())
    }

    /// Returns every message sent through this adapter so far.
    pub fn sent(&self) -> Vec<Message> {
        self.inner.sent.lock().clone()
    }

    /// Returns the messages sent since the last call and clears the log.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.inner.sent.lock())
    }

    /// Waits for the next message sent through this adapter.
    ///
    /// Each message is yielded once, in send order.
    pub async fn recv(&self) -> Option<Message> {
        self.inner.delivered.lock().await.recv().await
    }

    /// Returns `true` once `listen` has been called and until `close`.
    pub fn is_listening(&self) -> bool {
        self.inner.events.read().is_some()
    }

    /// Returns the options passed to the last `listen` call.
    pub fn listen_options(&self) -> Option<Value> {
        self.inner.options.read().clone()
    }

    fn closed(&self) -> AdapterError {
        AdapterError::Closed {
            name: self.inner.name.clone(),
        }
    }
}

impl std::fmt::Debug for MemoryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAdapter")
            .field("name", &self.inner.name)
            .field("listening", &self.is_listening())
            .finish()
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn listen(&self, events: Arc<dyn EventSink>, options: &Value) -> AdapterResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.closed());
        }
        *self.inner.options.write() = Some(options.clone());
        *self.inner.events.write() = Some(events.clone());
        events.ready(&self.inner.name);
        Ok(())
    }

    async fn send(&self, message: &Message) -> AdapterResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.closed());
        }
        trace!(adapter = %self.inner.name, topic = %message.topic, "Delivered");
        self.inner.sent.lock().push(message.clone());
        // The receiver lives as long as `inner`, so this cannot fail.
        let _ = self.inner.outbox.send(message.clone());
        Ok(())
    }

    async fn close(&self) -> AdapterResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.events.write().take();
        Ok(())
    }
}
