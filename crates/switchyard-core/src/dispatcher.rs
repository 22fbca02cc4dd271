//! Message dispatcher.
//!
//! The [`Dispatcher`] walks the middleware stack for one message at a time.
//! Each dispatch call owns a private traversal cursor, so any number of
//! dispatches can run concurrently against the same dispatcher.
//!
//! # Traversal
//!
//! For every step the dispatcher normalizes the topic, takes the next layer,
//! and runs its pattern against the current topic. Non-matching layers are
//! skipped with any pending error preserved. A matching layer is invoked only
//! if its role agrees with the error state:
//!
//! | pending error | normal handler | error handler |
//! |---------------|----------------|---------------|
//! | none          | invoked        | skipped       |
//! | some          | skipped        | invoked       |
//!
//! When the stack is exhausted, or a handler cancelled the dispatch, the
//! final handler runs after yielding once to the scheduler.
//!
//! The traversal is a loop, not recursion: a long stack of non-matching
//! layers costs no call-stack depth.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::error::{HandlerError, HandlerResult, RegistrationError};
use crate::fanout::FinalHandler;
use crate::handler::{BoxFuture, ErrorMiddleware, Handler, Middleware, Next, Step};
use crate::message::Message;
use crate::stack::Stack;

/// How a dispatch call ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The stack was exhausted with no error pending.
    Completed,
    /// The stack was exhausted with an unresolved error.
    Failed(HandlerError),
    /// A handler cancelled the dispatch.
    Cancelled,
    /// A handler dropped its continuation without signalling it. The final
    /// handler is not invoked.
    Abandoned,
}

impl Outcome {
    /// Returns `true` if the message should be forwarded.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns the unresolved error, if any.
    pub fn error(&self) -> Option<&HandlerError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Per-call traversal cursor. Never shared between dispatches.
#[derive(Debug, Default)]
struct Traversal {
    position: usize,
    cancelled: bool,
}

enum Call<'a> {
    Normal(&'a Arc<dyn Middleware>),
    Error(&'a Arc<dyn ErrorMiddleware>, HandlerError),
}

/// Routes messages through the middleware stack.
pub struct Dispatcher {
    stack: RwLock<Arc<Stack>>,
    finalizer: Arc<dyn FinalHandler>,
}

impl Dispatcher {
    /// Creates a dispatcher with an empty stack and the given default final
    /// handler.
    pub fn new(finalizer: Arc<dyn FinalHandler>) -> Self {
        Self {
            stack: RwLock::new(Arc::new(Stack::new())),
            finalizer,
        }
    }

    /// Appends layers to the stack.
    ///
    /// Dispatches already in flight keep traversing the snapshot they
    /// started with.
    pub fn register<I>(&self, pattern: Option<&str>, handlers: I) -> Result<(), RegistrationError>
    where
        I: IntoIterator<Item = Handler>,
    {
        let mut current = self.stack.write();
        let mut next = Stack::clone(&current);
        next.register(pattern, handlers)?;
        *current = Arc::new(next);
        Ok(())
    }

    /// Returns a snapshot of the current stack.
    pub fn stack(&self) -> Arc<Stack> {
        Arc::clone(&self.stack.read())
    }

    /// Returns the number of registered layers.
    pub fn layer_count(&self) -> usize {
        self.stack.read().len()
    }

    /// Dispatches `message` through the stack, ending in the default final
    /// handler.
    pub async fn dispatch(&self, message: Message) -> Outcome {
        self.run(message, None).await
    }

    /// Dispatches `message`, ending in `done` instead of the default final
    /// handler. The original topic is not captured.
    pub async fn dispatch_with(&self, message: Message, done: Arc<dyn FinalHandler>) -> Outcome {
        self.run(message, Some(done)).await
    }

    async fn run(&self, message: Message, done: Option<Arc<dyn FinalHandler>>) -> Outcome {
        let span = debug_span!(
            "dispatch",
            topic = %message.topic,
            origin = ?message.origin(),
        );
        self.traverse(message, done).instrument(span).await
    }

    async fn traverse(&self, mut message: Message, done: Option<Arc<dyn FinalHandler>>) -> Outcome {
        let stack = self.stack();
        let origin = message.origin();
        let capture = done.is_none();
        let finalizer = done.unwrap_or_else(|| Arc::clone(&self.finalizer));

        let mut state = Traversal::default();
        let mut pending: Option<HandlerError> = None;

        loop {
            message.normalize_topic();
            if capture {
                message.capture_original_topic();
            }

            let layer = match stack.get(state.position) {
                Some(layer) if !state.cancelled => layer,
                _ => break,
            };
            state.position += 1;

            let Some(found) = layer.pattern().find(&message.topic) else {
                continue;
            };
            if !found.params.is_empty() {
                message.bind_params(layer.route(), found.params);
            }

            let call = match (layer.handler(), pending.take()) {
                (Handler::Normal(mw), None) => Call::Normal(mw),
                (Handler::Error(mw), Some(err)) => Call::Error(mw, err),
                (_, err) => {
                    pending = err;
                    continue;
                }
            };

            trace!(route = layer.route(), position = state.position - 1, "Invoking handler");

            let (next, mut rx) = Next::channel();
            let msg = &mut message;
            let result = match call {
                Call::Normal(mw) => guarded(move || mw.handle(msg, next)).await,
                Call::Error(mw, err) => guarded(move || mw.handle(err, msg, next)).await,
            };

            let step = match result {
                Ok(()) => match rx.await {
                    Ok(step) => step,
                    Err(_) => {
                        debug!(route = layer.route(), "Continuation dropped, pipeline ended");
                        return Outcome::Abandoned;
                    }
                },
                Err(err) => {
                    rx.close();
                    match rx.try_recv() {
                        Ok(step) => {
                            warn!(
                                route = layer.route(),
                                error = %err,
                                "Handler failed after signalling its continuation, error dropped"
                            );
                            step
                        }
                        Err(_) => Step::Advance(Some(err)),
                    }
                }
            };

            match step {
                Step::Advance(err) => pending = err,
                Step::Cancel => {
                    pending = None;
                    state.cancelled = true;
                }
            }
        }

        // The final handler never runs in the same poll that exhausted the
        // stack.
        tokio::task::yield_now().await;

        let outcome = match pending {
            Some(err) => Outcome::Failed(err),
            None if state.cancelled => Outcome::Cancelled,
            None => Outcome::Completed,
        };
        finalizer.finish(message, origin, &outcome).await;
        outcome
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("layers", &self.layer_count())
            .finish_non_exhaustive()
    }
}

/// Runs a handler, turning a panic at call time or while polling into a
/// [`HandlerError`].
async fn guarded<'a, F>(invoke: F) -> HandlerResult
where
    F: FnOnce() -> BoxFuture<'a, HandlerResult>,
{
    let future = match panic::catch_unwind(AssertUnwindSafe(invoke)) {
        Ok(future) => future,
        Err(payload) => return Err(HandlerError::from_panic(payload)),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::fanout::finish_fn;
    use crate::message::Origin;

    /// Final handler recording the message and outcome it was given.
    fn recorder() -> (Arc<dyn FinalHandler>, Arc<Mutex<Vec<(Message, Outcome)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let done = finish_fn(move |message, _origin, outcome| {
            sink.lock().push((message, outcome.clone()));
        });
        (done, seen)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = counter.clone();
        Handler::sync(move |_, next| {
            counter.fetch_add(1, Ordering::SeqCst);
            next.advance();
            Ok(())
        })
    }

    fn failing(text: &'static str) -> Handler {
        Handler::sync(move |_, _next| Err(HandlerError::msg(text)))
    }

    #[tokio::test]
    async fn test_empty_stack_completes() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);

        let outcome = dispatcher.dispatch(Message::new("/a/")).await;
        assert!(outcome.is_completed());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.topic, "a");
        assert_eq!(seen[0].0.original_topic(), Some("a"));
    }

    #[tokio::test]
    async fn test_prefix_match_runs_handler() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        dispatcher
            .register(
                Some("admin"),
                [Handler::sync(|msg, next| {
                    msg.insert("seen", true);
                    next.advance();
                    Ok(())
                })],
            )
            .unwrap();

        dispatcher.dispatch(Message::new("admin/settings")).await;
        assert_eq!(seen.lock()[0].0.get("seen"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_non_matching_layer_is_skipped() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.register(Some("admin"), [counting(&counter)]).unwrap();

        let outcome = dispatcher.dispatch(Message::new("posts").with("n", 1)).await;
        assert!(outcome.is_completed());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(seen.lock()[0].0, {
            let mut m = Message::new("posts").with("n", 1);
            m.capture_original_topic();
            m
        });
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (done, _) = recorder();
        let dispatcher = Dispatcher::new(done);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            dispatcher
                .register(
                    None,
                    [Handler::sync(move |_, next| {
                        order.lock().push(i);
                        next.advance();
                        Ok(())
                    })],
                )
                .unwrap();
        }

        dispatcher.dispatch(Message::new("x")).await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_original_topic_survives_rewrites() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        dispatcher
            .register(
                None,
                [
                    Handler::sync(|msg, next| {
                        msg.topic = "/rewritten/once/".into();
                        next.advance();
                        Ok(())
                    }),
                    Handler::sync(|msg, next| {
                        msg.topic = "rewritten/twice".into();
                        next.advance();
                        Ok(())
                    }),
                ],
            )
            .unwrap();

        dispatcher.dispatch(Message::new("/start/")).await;

        let seen = seen.lock();
        assert_eq!(seen[0].0.topic, "rewritten/twice");
        assert_eq!(seen[0].0.original_topic(), Some("start"));
    }

    #[tokio::test]
    async fn test_topic_is_stable_across_pass_through_layers() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        let topics = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let topics = topics.clone();
            dispatcher
                .register(
                    None,
                    [Handler::sync(move |msg, next| {
                        topics.lock().push(msg.topic.clone());
                        next.advance();
                        Ok(())
                    })],
                )
                .unwrap();
        }

        dispatcher.dispatch(Message::new("//a/b//")).await;

        assert_eq!(*topics.lock(), vec!["a/b", "a/b"]);
        let seen = seen.lock();
        assert_eq!(seen[0].0.topic, "a/b");
        assert_eq!(seen[0].0.original_topic(), Some("a/b"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_final_handler_runs_after_yielding() {
        let flag = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(Mutex::new(None));

        let sink = observed.clone();
        let seen_flag = flag.clone();
        let dispatcher = Dispatcher::new(finish_fn(move |_, _, _| {
            *sink.lock() = Some(seen_flag.load(Ordering::SeqCst));
        }));

        let setter = flag.clone();
        tokio::spawn(async move {
            setter.store(true, Ordering::SeqCst);
        });

        dispatcher.dispatch(Message::new("t")).await;
        assert_eq!(*observed.lock(), Some(true));
    }

    #[tokio::test]
    async fn test_override_skips_original_topic_capture() {
        let dispatcher = Dispatcher::new(finish_fn(|_, _, _| {}));
        let (done, seen) = recorder();

        dispatcher.dispatch_with(Message::new("a"), done).await;
        assert_eq!(seen.lock()[0].0.original_topic(), None);
    }

    #[tokio::test]
    async fn test_rewritten_topic_routes_later_layers() {
        let (done, _) = recorder();
        let dispatcher = Dispatcher::new(done);
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register(
                None,
                [Handler::sync(|msg, next| {
                    msg.topic = "b/1".into();
                    next.advance();
                    Ok(())
                })],
            )
            .unwrap();
        dispatcher.register(Some("b"), [counting(&counter)]).unwrap();

        dispatcher.dispatch(Message::new("a")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_params_are_bound_before_handler() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        dispatcher
            .register(
                Some("users/:id"),
                [Handler::sync(|msg, next| {
                    let id = msg.param("id").map(str::to_owned);
                    msg.insert("id", id);
                    next.advance();
                    Ok(())
                })],
            )
            .unwrap();

        dispatcher.dispatch(Message::new("users/42/profile")).await;

        let seen = seen.lock();
        let msg = &seen[0].0;
        assert_eq!(msg.get("id"), Some(&json!("42")));
        assert_eq!(msg.route.as_ref().unwrap().path, "users/:id");
    }

    #[tokio::test]
    async fn test_error_recovered_by_error_handler() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        let recorded = Arc::new(Mutex::new(None));
        let sink = recorded.clone();

        dispatcher
            .register(
                None,
                [
                    failing("x"),
                    Handler::sync_error(move |err, _, next| {
                        *sink.lock() = Some(err.to_string());
                        next.advance();
                        Ok(())
                    }),
                ],
            )
            .unwrap();

        let outcome = dispatcher.dispatch(Message::new("t")).await;
        assert!(outcome.is_completed());
        assert_eq!(recorded.lock().as_deref(), Some("x"));
        assert!(seen.lock()[0].1.is_completed());
    }

    #[tokio::test]
    async fn test_unrecovered_error_fails_dispatch() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        dispatcher.register(None, [failing("x")]).unwrap();

        let outcome = dispatcher.dispatch(Message::new("t")).await;
        assert_eq!(outcome.error().map(ToString::to_string), Some("x".into()));
        assert!(matches!(seen.lock()[0].1, Outcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_role_exclusivity() {
        let (done, _) = recorder();
        let dispatcher = Dispatcher::new(done);
        let erroring = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let normal = |erroring: Arc<AtomicBool>, violations: Arc<AtomicUsize>, fail: bool| {
            Handler::sync(move |_, next| {
                if erroring.load(Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                if fail {
                    erroring.store(true, Ordering::SeqCst);
                    next.fail(HandlerError::msg("boom"));
                } else {
                    next.advance();
                }
                Ok(())
            })
        };
        let error = |erroring: Arc<AtomicBool>, violations: Arc<AtomicUsize>, recover: bool| {
            Handler::sync_error(move |err, _, next| {
                if !erroring.load(Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                if recover {
                    erroring.store(false, Ordering::SeqCst);
                    next.advance();
                } else {
                    next.fail(err);
                }
                Ok(())
            })
        };

        let e = || erroring.clone();
        let v = || violations.clone();
        dispatcher.register(None, [error(e(), v(), true)]).unwrap();
        dispatcher.register(None, [normal(e(), v(), true)]).unwrap();
        dispatcher.register(Some("other"), [error(e(), v(), true)]).unwrap();
        dispatcher.register(None, [normal(e(), v(), false)]).unwrap();
        dispatcher.register(None, [error(e(), v(), false)]).unwrap();
        dispatcher.register(Some("t"), [error(e(), v(), true)]).unwrap();
        dispatcher.register(None, [error(e(), v(), true)]).unwrap();
        dispatcher.register(None, [normal(e(), v(), false)]).unwrap();

        let outcome = dispatcher.dispatch(Message::new("t")).await;
        assert!(outcome.is_completed());
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_skips_remaining_layers() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register(
                None,
                [
                    Handler::sync(|_, next| {
                        next.cancel();
                        Ok(())
                    }),
                    counting(&counter),
                ],
            )
            .unwrap();

        let outcome = dispatcher.dispatch(Message::new("t")).await;
        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(seen.lock()[0].1, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_continuation_abandons() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        dispatcher.register(None, [Handler::sync(|_, _next| Ok(()))]).unwrap();

        let outcome = dispatcher.dispatch(Message::new("t")).await;
        assert!(matches!(outcome, Outcome::Abandoned));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_continuation() {
        let (done, seen) = recorder();
        let dispatcher = Dispatcher::new(done);
        dispatcher
            .register(
                None,
                [Handler::normal(|msg, next| {
                    Box::pin(async move {
                        msg.insert("deferred", true);
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            next.advance();
                        });
                        Ok(())
                    })
                })],
            )
            .unwrap();

        let outcome = dispatcher.dispatch(Message::new("t")).await;
        assert!(outcome.is_completed());
        assert_eq!(seen.lock()[0].0.get("deferred"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_panic_becomes_pending_error() {
        let (done, _) = recorder();
        let dispatcher = Dispatcher::new(done);
        dispatcher
            .register(None, [Handler::sync(|_, _| panic!("kaboom"))])
            .unwrap();

        let outcome = dispatcher.dispatch(Message::new("t")).await;
        let err = outcome.error().unwrap().to_string();
        assert!(err.contains("kaboom"), "{err}");
    }

    #[tokio::test]
    async fn test_signal_wins_over_late_error() {
        let (done, _) = recorder();
        let dispatcher = Dispatcher::new(done);
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register(
                None,
                [
                    Handler::sync(|_, next| {
                        next.advance();
                        Err(HandlerError::msg("late"))
                    }),
                    counting(&counter),
                ],
            )
            .unwrap();

        let outcome = dispatcher.dispatch(Message::new("t")).await;
        assert!(outcome.is_completed());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_origin_snapshot_reaches_final_handler() {
        let origins = Arc::new(Mutex::new(Vec::new()));
        let sink = origins.clone();
        let dispatcher = Dispatcher::new(finish_fn(move |_, origin, _| {
            sink.lock().push(origin);
        }));

        dispatcher
            .dispatch(Message::new("t").tagged(Origin::FromClient))
            .await;
        assert_eq!(*origins.lock(), vec![Some(Origin::FromClient)]);
    }

    #[tokio::test]
    async fn test_register_during_dispatch_uses_snapshot() {
        let (done, _) = recorder();
        let dispatcher = Arc::new(Dispatcher::new(done));
        let counter = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(Some(gate_rx)));

        dispatcher
            .register(
                None,
                [Handler::normal(move |_, next| {
                    let gate = gate_rx.lock().take();
                    Box::pin(async move {
                        if let Some(gate) = gate {
                            let _ = gate.await;
                        }
                        next.advance();
                        Ok(())
                    })
                })],
            )
            .unwrap();

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(Message::new("t")).await }
        });
        tokio::task::yield_now().await;

        dispatcher.register(None, [counting(&counter)]).unwrap();
        assert_eq!(dispatcher.layer_count(), 2);
        gate_tx.send(()).unwrap();

        assert!(task.await.unwrap().is_completed());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
