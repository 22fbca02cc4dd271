//! Configuration for the Switchyard runtime.
//!
//! Configuration is layered with figment: built-in defaults, TOML or YAML
//! files, `SWITCHYARD_*` environment variables and programmatic overrides.
//! See [`loader`] for the exact order.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, PROFILE_ENV, Profile};
pub use schema::{LogFormat, LogLevel, LogOutput, LoggingConfig, SpanEventConfig, SwitchyardConfig};
pub use validation::validate_config;
