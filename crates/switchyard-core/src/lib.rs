//! # Switchyard Core
//!
//! The dispatch engine of the Switchyard message router.
//!
//! Switchyard sits between a set of *broker* connections and a set of
//! *client* connections. Every inbound message runs through an ordered stack
//! of middleware selected by matching its topic against route patterns, then
//! is forwarded to the adapters on the opposite side.
//!
//! ## Building Blocks
//!
//! - **Messages**: [`Message`] with topic, payload, route params and origin
//! - **Pattern Matching**: [`TopicPattern`] with `:param` and `*` segments
//! - **Handlers**: normal and error middleware ([`Handler`]) driven by a
//!   one-shot continuation ([`Next`])
//! - **Stack**: the ordered, append-only list of layers ([`Stack`])
//! - **Dispatcher**: traverses the stack for one message ([`Dispatcher`])
//! - **Fan-out**: the default final handler ([`FanOut`], [`ErrorPolicy`])
//! - **Adapters**: the transport boundary ([`Adapter`], [`EventSink`]) and
//!   an in-process implementation ([`MemoryAdapter`])
//!
//! ## Flow
//!
//! ```text
//! ┌──────────┐  message  ┌────────────┐  send  ┌──────────┐
//! │  Broker  │──────────▶│ Dispatcher │───────▶│  Client  │
//! │ adapters │◀──────────│  + stack   │◀───────│ adapters │
//! └──────────┘   send    └────────────┘ message└──────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use switchyard_core::{AdapterSet, Dispatcher, ErrorPolicy, FanOut, Handler, Message, Origin};
//!
//! #[tokio::main]
//! async fn main() {
//!     let fan_out = FanOut::new(AdapterSet::new(), AdapterSet::new(), ErrorPolicy::default());
//!     let dispatcher = Dispatcher::new(Arc::new(fan_out));
//!
//!     dispatcher
//!         .register(Some("sensors/:room"), [Handler::sync(|msg, next| {
//!             let room = msg.param("room").unwrap_or_default().to_owned();
//!             msg.insert("room", room);
//!             next.advance();
//!             Ok(())
//!         })])
//!         .unwrap();
//!
//!     let msg = Message::new("sensors/kitchen/temp").tagged(Origin::FromBroker);
//!     dispatcher.dispatch(msg).await;
//! }
//! ```

pub mod adapter;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod memory;
pub mod message;
pub mod stack;
pub mod topic;

pub use adapter::{Adapter, AdapterSet, BoxedAdapter, EventSink, Side};
pub use dispatcher::{Dispatcher, Outcome};
pub use error::{
    AdapterError, AdapterResult, HandlerError, HandlerResult, PatternError, RegistrationError,
};
pub use fanout::{ErrorContext, ErrorPolicy, FanOut, FinalHandler, finish_fn};
pub use handler::{BoxFuture, ErrorMiddleware, Handler, Middleware, Next};
pub use memory::MemoryAdapter;
pub use message::{Message, Origin, Route};
pub use stack::{Layer, Stack};
pub use topic::{TopicMatch, TopicPattern, normalize};

/// Prelude for common imports.
pub mod prelude {
    pub use super::{
        Adapter, AdapterResult, BoxFuture, ErrorMiddleware, EventSink, Handler, HandlerError,
        HandlerResult, Message, Middleware, Next, Origin, Outcome,
    };
}
