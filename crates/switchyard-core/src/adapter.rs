//! Adapter trait and event surface.
//!
//! Adapters bridge a transport (a broker connection, a client socket) with
//! the router. An adapter only has to:
//!
//! - start producing messages when [`Adapter::listen`] is called
//! - deliver outbound messages in [`Adapter::send`]
//! - report readiness and inbound messages through the [`EventSink`] it was
//!   handed
//!
//! # Architecture
//!
//! ```text
//! Broker adapters ──message──▶ Dispatcher ──send──▶ Client adapters
//! Client adapters ──message──▶ Dispatcher ──send──▶ Broker adapters
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! #[async_trait]
//! impl Adapter for StdoutAdapter {
//!     fn name(&self) -> &str {
//!         "stdout"
//!     }
//!
//!     async fn listen(&self, events: Arc<dyn EventSink>, _options: &Value) -> AdapterResult<()> {
//!         events.ready(self.name());
//!         Ok(())
//!     }
//!
//!     async fn send(&self, message: &Message) -> AdapterResult<()> {
//!         println!("{}: {:?}", message.topic, message.payload);
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AdapterResult;
use crate::message::{Message, Origin};

// =============================================================================
// Adapter Trait
// =============================================================================

/// A broker or client connection.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Returns the adapter name used in logs and readiness events.
    fn name(&self) -> &str;

    /// Starts accepting or producing messages.
    ///
    /// `options` is adapter-specific and opaque to the router. Inbound
    /// messages and readiness are reported through `events`, which the
    /// adapter may keep for as long as it runs.
    async fn listen(&self, events: Arc<dyn EventSink>, options: &Value) -> AdapterResult<()>;

    /// Delivers a message outward.
    async fn send(&self, message: &Message) -> AdapterResult<()>;

    /// Called when the router is shutting down.
    async fn close(&self) -> AdapterResult<()> {
        Ok(())
    }
}

/// A shared adapter trait object.
pub type BoxedAdapter = Arc<dyn Adapter>;

/// The callbacks an adapter reports through.
pub trait EventSink: Send + Sync {
    /// The adapter named `name` finished initializing.
    fn ready(&self, name: &str);

    /// A message arrived.
    fn message(&self, message: Message);
}

// =============================================================================
// Side
// =============================================================================

/// Which collection an adapter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Upstream message brokers.
    Broker,
    /// Downstream clients.
    Client,
}

impl Side {
    /// The origin tag given to messages arriving on this side.
    pub fn origin(self) -> Origin {
        match self {
            Self::Broker => Origin::FromBroker,
            Self::Client => Origin::FromClient,
        }
    }

    /// The property name reserved for this side.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Adapter Set
// =============================================================================

/// An ordered, append-only, shared collection of adapters.
///
/// Clones share the same underlying list, so the application shell and the
/// fan-out handler always see the same adapters.
#[derive(Clone, Default)]
pub struct AdapterSet {
    inner: Arc<RwLock<Vec<BoxedAdapter>>>,
}

impl AdapterSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an adapter.
    pub fn push(&self, adapter: BoxedAdapter) {
        self.inner.write().push(adapter);
    }

    /// Returns the adapters in registration order.
    ///
    /// The lock is released before returning, so callers may await on the
    /// adapters freely.
    pub fn snapshot(&self) -> Vec<BoxedAdapter> {
        self.inner.read().clone()
    }

    /// Returns the number of adapters.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .inner
            .read()
            .iter()
            .map(|adapter| adapter.name().to_string())
            .collect();
        f.debug_tuple("AdapterSet").field(&names).finish()
    }
}
