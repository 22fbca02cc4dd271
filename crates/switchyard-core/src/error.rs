//! Error types for the Switchyard core.
//!
//! Registration-time failures ([`PatternError`], [`RegistrationError`]) are
//! programmer errors surfaced synchronously when the stack is built.
//! [`HandlerError`] is the value that travels through a running pipeline.
//! [`AdapterError`] covers the adapter boundary.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

// =============================================================================
// Pattern Errors
// =============================================================================

/// Errors raised while compiling a route pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// Two consecutive slashes produced an empty segment.
    #[error("empty segment at position {position} in pattern '{pattern}'")]
    EmptySegment {
        /// The offending pattern.
        pattern: String,
        /// Zero-based segment index.
        position: usize,
    },

    /// A `:` token without a parameter name.
    #[error("missing parameter name at position {position} in pattern '{pattern}'")]
    MissingParamName {
        /// The offending pattern.
        pattern: String,
        /// Zero-based segment index.
        position: usize,
    },

    /// A parameter name with characters outside `[A-Za-z0-9_]`.
    #[error("invalid parameter name ':{name}' in pattern '{pattern}'")]
    InvalidParamName {
        /// The offending pattern.
        pattern: String,
        /// The rejected name.
        name: String,
    },

    /// The same parameter name bound twice.
    #[error("duplicate parameter ':{name}' in pattern '{pattern}'")]
    DuplicateParam {
        /// The offending pattern.
        pattern: String,
        /// The repeated name.
        name: String,
    },

    /// A `*` wildcard that is not a whole, final segment.
    #[error("wildcard '*' must be the last whole segment in pattern '{pattern}'")]
    MisplacedWildcard {
        /// The offending pattern.
        pattern: String,
    },
}

// =============================================================================
// Registration Errors
// =============================================================================

/// Errors raised by middleware registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The route pattern did not compile.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// The call supplied no handlers.
    #[error("use() requires middleware functions")]
    NoHandlers,
}

// =============================================================================
// Adapter Errors
// =============================================================================

/// Errors that can occur at the adapter boundary.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// The adapter has not been started with `listen` yet.
    #[error("adapter '{name}' is not listening")]
    NotListening {
        /// Adapter name.
        name: String,
    },

    /// Delivering a message failed.
    #[error("adapter '{name}' failed to send: {reason}")]
    SendFailed {
        /// Adapter name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// The adapter was closed.
    #[error("adapter '{name}' is closed")]
    Closed {
        /// Adapter name.
        name: String,
    },

    /// An adapter factory refused to build its adapter.
    #[error("adapter factory failed: {0}")]
    Factory(String),

    /// Internal adapter error.
    #[error("adapter error: {0}")]
    Internal(String),
}

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

// =============================================================================
// Handler Errors
// =============================================================================

/// An error pending in a running pipeline.
///
/// Cheap to clone so it can be handed to error handlers, the reporting
/// policy, and the dispatch [`Outcome`](crate::Outcome) alike. Any
/// `std::error::Error` converts into it, so `?` works inside handlers.
#[derive(Clone)]
pub struct HandlerError {
    inner: Arc<dyn std::error::Error + Send + Sync>,
}

impl HandlerError {
    /// Wraps an existing error.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(err),
        }
    }

    /// Creates an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(TextError(message.into()))
    }

    /// Converts a caught panic payload into an error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::msg(format!("handler panicked: {detail}"))
    }

    /// Attempts to view the underlying error as `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// Returns the underlying error.
    pub fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

/// Plain-text error used by [`HandlerError::msg`].
#[derive(Debug, Error)]
#[error("{0}")]
struct TextError(String);

/// Result type returned by handlers.
pub type HandlerResult = Result<(), HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk full")]
    struct DiskFull;

    #[test]
    fn test_handler_error_downcast() {
        let err: HandlerError = DiskFull.into();
        assert!(err.downcast_ref::<DiskFull>().is_some());
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn test_handler_error_from_panic_payload() {
        let err = HandlerError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "handler panicked: boom");

        let err = HandlerError::from_panic(Box::new(String::from("bang")));
        assert_eq!(err.to_string(), "handler panicked: bang");
    }

    #[test]
    fn test_registration_error_message() {
        assert_eq!(
            RegistrationError::NoHandlers.to_string(),
            "use() requires middleware functions"
        );
    }
}
