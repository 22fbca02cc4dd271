//! # Switchyard
//!
//! A bidirectional message router for sitting between message brokers and
//! their clients.
//!
//! ## Overview
//!
//! Every message arriving from a broker or a client runs through an ordered
//! stack of middleware selected by matching its topic against route
//! patterns. Handlers may rewrite the message, fail, recover from earlier
//! failures or cancel delivery. Whatever survives is forwarded to every
//! adapter on the opposite side.
//!
//! ```text
//! ┌──────────┐     ┌───────────────────────────────┐     ┌──────────┐
//! │  Broker  │────▶│ layer ─▶ layer ─▶ … ─▶ fan-out│────▶│  Client  │
//! │ adapters │◀────│                               │◀────│ adapters │
//! └──────────┘     └───────────────────────────────┘     └──────────┘
//! ```
//!
//! - **Adapters**: transport implementations for either side
//! - **Layers**: `(pattern, handler)` pairs, traversed in registration order
//! - **Handlers**: normal middleware, or error middleware that only runs
//!   while an error is pending
//! - **Fan-out**: the final step, forwarding or reporting
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchyard::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = Switchyard::new();
//!
//!     app.use_route("sensors/:room", [Handler::sync(|msg, next| {
//!         let room = msg.param("room").unwrap_or_default().to_owned();
//!         msg.insert("room", room);
//!         next.advance();
//!         Ok(())
//!     })])?;
//!
//!     app.add_broker(|_| Ok(MemoryAdapter::new("upstream")))?;
//!     app.add_client(|_| Ok(MemoryAdapter::new("downstream")))?;
//!
//!     let options = app.config().listen.clone();
//!     app.run(&options).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: Load `switchyard.toml` (default)
//! - `yaml-config`: Load `switchyard.yaml`
//! - `json-log`: JSON log output

pub use switchyard_core as core;
pub use switchyard_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use switchyard::prelude::*;
/// ```
pub mod prelude {
    // Application shell
    pub use switchyard_runtime::{RuntimeError, RuntimeResult, Switchyard, SwitchyardConfig};

    // Handlers and messages
    pub use switchyard_core::{
        BoxFuture, ErrorMiddleware, Handler, HandlerError, HandlerResult, Message, Middleware,
        Next, Origin, Outcome,
    };

    // Adapters
    pub use switchyard_core::{
        Adapter, AdapterError, AdapterResult, EventSink, MemoryAdapter, Side,
    };
}
