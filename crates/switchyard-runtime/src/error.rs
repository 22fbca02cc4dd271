//! Runtime error types.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Middleware registration failed.
    #[error("Registration error: {0}")]
    Registration(#[from] switchyard_core::RegistrationError),

    /// An adapter factory, `listen` or `close` failed.
    #[error("Adapter error: {0}")]
    Adapter(#[from] switchyard_core::AdapterError),

    /// `add` was called with a name reserved for adapter collections.
    #[error("Property '{0}' is reserved, use add_broker/add_client")]
    ReservedProperty(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A property value could not be converted to JSON.
    #[error("Failed to serialize property value: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
