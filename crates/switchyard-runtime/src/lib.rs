//! Switchyard Runtime - application shell for the Switchyard message router.
//!
//! This crate provides:
//! - The application shell ([`Switchyard`]): middleware registration, broker
//!   and client adapter collections, generic properties, event wiring
//! - Layered configuration ([`config`])
//! - Logging setup ([`logging`])
//! - A signal-driven run loop with graceful shutdown
//!
//! ```ignore
//! use switchyard_runtime::Switchyard;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = Switchyard::new();
//!
//!     app.add_broker(|_| Ok(MemoryAdapter::new("upstream")))?;
//!     app.add_client(|_| Ok(MemoryAdapter::new("downstream")))?;
//!
//!     // Run until Ctrl+C
//!     let options = app.config().listen.clone();
//!     app.run(&options).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

// Re-exports
pub use config::{ConfigError, ConfigLoader, ConfigResult, SwitchyardConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{Switchyard, SwitchyardBuilder};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros for application code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
