//! Middleware handlers and the continuation passed to them.
//!
//! A [`Handler`] is either a *normal* handler, run while no error is pending,
//! or an *error* handler, run only while an error is pending. Both receive a
//! [`Next`] continuation. Calling it is the only way the pipeline moves on:
//!
//! ```rust,ignore
//! use switchyard_core::{Handler, HandlerError};
//!
//! // Async handler: may await I/O before advancing.
//! let audit = Handler::normal(|msg, next| {
//!     Box::pin(async move {
//!         msg.insert("audited", true);
//!         next.advance();
//!         Ok(())
//!     })
//! });
//!
//! // Synchronous handler.
//! let tag = Handler::sync(|msg, next| {
//!     msg.insert("seen", true);
//!     next.advance();
//!     Ok(())
//! });
//!
//! // Error handler that recovers.
//! let recover = Handler::sync_error(|err, msg, next| {
//!     msg.insert("recovered", err.to_string());
//!     next.advance();
//!     Ok(())
//! });
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{HandlerError, HandlerResult};
use crate::message::Message;

/// A type alias for a boxed, pinned future that is `Send`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Continuation
// ============================================================================

/// What a handler asked the dispatcher to do next.
#[derive(Debug)]
pub(crate) enum Step {
    Advance(Option<HandlerError>),
    Cancel,
}

/// The continuation handed to every handler.
///
/// `Next` is one-shot: every method consumes it. It is `Send + 'static`, so a
/// handler may move it into a spawned task and call it once some I/O has
/// completed. Dropping it without calling any method ends the pipeline for
/// that message without reaching the final handler.
pub struct Next {
    tx: oneshot::Sender<Step>,
}

impl Next {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Step>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Continues with the next matching layer, clearing any pending error.
    pub fn advance(self) {
        self.signal(Step::Advance(None));
    }

    /// Continues with `err` pending. Normal handlers are skipped until an
    /// error handler resolves it.
    pub fn fail(self, err: impl Into<HandlerError>) {
        self.signal(Step::Advance(Some(err.into())));
    }

    /// Continues with an optional pending error.
    pub fn resume(self, err: Option<HandlerError>) {
        self.signal(Step::Advance(err));
    }

    /// Skips every remaining layer. The final handler observes the
    /// cancellation and forwards nothing.
    pub fn cancel(self) {
        self.signal(Step::Cancel);
    }

    fn signal(self, step: Step) {
        if self.tx.send(step).is_err() {
            trace!("continuation signalled after the traversal moved on");
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

// ============================================================================
// Handler traits
// ============================================================================

/// A handler invoked while no error is pending.
pub trait Middleware: Send + Sync + 'static {
    /// Processes `message`, then signals `next`.
    fn handle<'a>(&'a self, message: &'a mut Message, next: Next) -> BoxFuture<'a, HandlerResult>;
}

/// A handler invoked only while an error is pending.
pub trait ErrorMiddleware: Send + Sync + 'static {
    /// Processes `error`. Calling [`Next::advance`] recovers from it;
    /// [`Next::fail`] passes it (or another error) on.
    fn handle<'a>(
        &'a self,
        error: HandlerError,
        message: &'a mut Message,
        next: Next,
    ) -> BoxFuture<'a, HandlerResult>;
}

struct AsyncFn<F>(F);

impl<F> Middleware for AsyncFn<F>
where
    F: for<'a> Fn(&'a mut Message, Next) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, message: &'a mut Message, next: Next) -> BoxFuture<'a, HandlerResult> {
        (self.0)(message, next)
    }
}

struct AsyncErrorFn<F>(F);

impl<F> ErrorMiddleware for AsyncErrorFn<F>
where
    F: for<'a> Fn(HandlerError, &'a mut Message, Next) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    fn handle<'a>(
        &'a self,
        error: HandlerError,
        message: &'a mut Message,
        next: Next,
    ) -> BoxFuture<'a, HandlerResult> {
        (self.0)(error, message, next)
    }
}

// Sync closures run inside the returned future so a panic surfaces while the
// dispatcher is polling it.
struct SyncFn<F>(F);

impl<F> Middleware for SyncFn<F>
where
    F: Fn(&mut Message, Next) -> HandlerResult + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, message: &'a mut Message, next: Next) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move { (self.0)(message, next) })
    }
}

struct SyncErrorFn<F>(F);

impl<F> ErrorMiddleware for SyncErrorFn<F>
where
    F: Fn(HandlerError, &mut Message, Next) -> HandlerResult + Send + Sync + 'static,
{
    fn handle<'a>(
        &'a self,
        error: HandlerError,
        message: &'a mut Message,
        next: Next,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move { (self.0)(error, message, next) })
    }
}

// ============================================================================
// Handler
// ============================================================================

/// A registered handler, tagged with its role.
#[derive(Clone)]
pub enum Handler {
    /// Runs while no error is pending.
    Normal(Arc<dyn Middleware>),
    /// Runs only while an error is pending.
    Error(Arc<dyn ErrorMiddleware>),
}

impl Handler {
    /// Wraps an async normal handler.
    pub fn normal<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Message, Next) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        Self::Normal(Arc::new(AsyncFn(f)))
    }

    /// Wraps an async error handler.
    pub fn error<F>(f: F) -> Self
    where
        F: for<'a> Fn(HandlerError, &'a mut Message, Next) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        Self::Error(Arc::new(AsyncErrorFn(f)))
    }

    /// Wraps a synchronous normal handler.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&mut Message, Next) -> HandlerResult + Send + Sync + 'static,
    {
        Self::Normal(Arc::new(SyncFn(f)))
    }

    /// Wraps a synchronous error handler.
    pub fn sync_error<F>(f: F) -> Self
    where
        F: Fn(HandlerError, &mut Message, Next) -> HandlerResult + Send + Sync + 'static,
    {
        Self::Error(Arc::new(SyncErrorFn(f)))
    }

    /// Wraps a [`Middleware`] implementation.
    pub fn middleware(m: impl Middleware) -> Self {
        Self::Normal(Arc::new(m))
    }

    /// Wraps an [`ErrorMiddleware`] implementation.
    pub fn error_middleware(m: impl ErrorMiddleware) -> Self {
        Self::Error(Arc::new(m))
    }

    /// Returns `true` for error handlers.
    pub fn is_error_handler(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<Arc<dyn Middleware>> for Handler {
    fn from(m: Arc<dyn Middleware>) -> Self {
        Self::Normal(m)
    }
}

impl From<Arc<dyn ErrorMiddleware>> for Handler {
    fn from(m: Arc<dyn ErrorMiddleware>) -> Self {
        Self::Error(m)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal(_) => "Handler::Normal",
            Self::Error(_) => "Handler::Error",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_next_advance_signals_once() {
        let (next, rx) = Next::channel();
        next.advance();
        assert!(matches!(rx.await, Ok(Step::Advance(None))));
    }

    #[tokio::test]
    async fn test_next_fail_carries_error() {
        let (next, rx) = Next::channel();
        next.fail(HandlerError::msg("x"));
        match rx.await {
            Ok(Step::Advance(Some(err))) => assert_eq!(err.to_string(), "x"),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_next_closes_channel() {
        let (next, rx) = Next::channel();
        drop(next);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_sync_handler_runs_on_poll() {
        let handler = Handler::sync(|msg, next| {
            msg.insert("seen", true);
            next.cancel();
            Ok(())
        });
        assert!(!handler.is_error_handler());

        let Handler::Normal(mw) = handler else {
            panic!("expected a normal handler");
        };
        let mut msg = Message::new("t");
        let (next, rx) = Next::channel();
        let fut = mw.handle(&mut msg, next);
        fut.await.unwrap();

        assert_eq!(msg.get("seen"), Some(&serde_json::json!(true)));
        assert!(matches!(rx.await, Ok(Step::Cancel)));
    }
}
