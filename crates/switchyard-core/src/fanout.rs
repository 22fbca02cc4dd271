//! The final handler and default fan-out.
//!
//! Every dispatch ends in a [`FinalHandler`]. The default one, [`FanOut`],
//! forwards completed messages to the opposite side of the router and hands
//! unresolved errors to an [`ErrorPolicy`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, trace, warn};

use crate::adapter::AdapterSet;
use crate::dispatcher::Outcome;
use crate::error::HandlerError;
use crate::message::{Message, Origin};

// =============================================================================
// Final Handler
// =============================================================================

/// The terminal step of a dispatch.
#[async_trait]
pub trait FinalHandler: Send + Sync {
    /// Receives the message once the stack is exhausted or the dispatch was
    /// cancelled. `origin` is the tag the message carried when the dispatch
    /// started.
    async fn finish(&self, message: Message, origin: Option<Origin>, outcome: &Outcome);
}

struct FinishFn<F>(F);

#[async_trait]
impl<F> FinalHandler for FinishFn<F>
where
    F: Fn(Message, Option<Origin>, &Outcome) + Send + Sync + 'static,
{
    async fn finish(&self, message: Message, origin: Option<Origin>, outcome: &Outcome) {
        (self.0)(message, origin, outcome)
    }
}

/// Wraps a synchronous closure as a final handler.
///
/// ```rust,ignore
/// let done = finish_fn(|message, _origin, outcome| {
///     println!("{} -> {outcome:?}", message.topic);
/// });
/// dispatcher.dispatch_with(message, done).await;
/// ```
pub fn finish_fn<F>(f: F) -> Arc<dyn FinalHandler>
where
    F: Fn(Message, Option<Origin>, &Outcome) + Send + Sync + 'static,
{
    Arc::new(FinishFn(f))
}

// =============================================================================
// Error Policy
// =============================================================================

/// Context handed to an error callback.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    /// The environment name the router runs in.
    pub env: &'a str,
}

type OnError = Arc<dyn Fn(&HandlerError, &ErrorContext<'_>) + Send + Sync>;

/// Decides what happens to errors no error handler resolved.
#[derive(Clone)]
pub struct ErrorPolicy {
    env: String,
    onerror: OnError,
}

impl ErrorPolicy {
    /// The environment in which the default callback stays silent.
    pub const TEST_ENV: &'static str = "test";

    /// Creates a policy that logs errors unless `env` is `"test"`.
    pub fn new(env: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            onerror: Arc::new(log_error),
        }
    }

    /// Replaces the error callback.
    pub fn with_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&HandlerError, &ErrorContext<'_>) + Send + Sync + 'static,
    {
        self.onerror = Arc::new(f);
        self
    }

    /// Returns the environment name.
    pub fn env(&self) -> &str {
        &self.env
    }

    /// Reports an unresolved error.
    pub fn report(&self, err: &HandlerError) {
        (self.onerror)(err, &ErrorContext { env: &self.env });
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::new("development")
    }
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorPolicy")
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

fn log_error(err: &HandlerError, ctx: &ErrorContext<'_>) {
    if ctx.env != ErrorPolicy::TEST_ENV {
        error!(env = ctx.env, error = %err, "Unhandled pipeline error");
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Forwards completed messages to the side opposite their origin.
///
/// Broker messages go to every client adapter and client messages to every
/// broker adapter, in registration order. A failing adapter is logged and
/// does not stop delivery to the rest.
#[derive(Debug, Clone)]
pub struct FanOut {
    brokers: AdapterSet,
    clients: AdapterSet,
    policy: ErrorPolicy,
}

impl FanOut {
    /// Creates a fan-out over the given adapter sets.
    pub fn new(brokers: AdapterSet, clients: AdapterSet, policy: ErrorPolicy) -> Self {
        Self {
            brokers,
            clients,
            policy,
        }
    }

    /// Returns the error policy.
    pub fn policy(&self) -> &ErrorPolicy {
        &self.policy
    }

    async fn forward(&self, message: &Message, origin: Option<Origin>) {
        let targets = match origin {
            Some(Origin::FromBroker) => &self.clients,
            Some(Origin::FromClient) => &self.brokers,
            None => {
                warn!(topic = %message.topic, "Message has no origin, dropping");
                return;
            }
        };

        for adapter in targets.snapshot() {
            if let Err(e) = adapter.send(message).await {
                warn!(adapter = adapter.name(), error = %e, "Failed to forward message");
            }
        }
    }
}

#[async_trait]
impl FinalHandler for FanOut {
    async fn finish(&self, message: Message, origin: Option<Origin>, outcome: &Outcome) {
        match outcome {
            Outcome::Completed => self.forward(&message, origin).await,
            Outcome::Failed(err) => self.policy.report(err),
            Outcome::Cancelled | Outcome::Abandoned => {
                trace!(topic = %message.topic, "Dispatch cancelled, nothing forwarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::adapter::{Adapter, EventSink};
    use crate::dispatcher::Dispatcher;
    use crate::error::{AdapterError, AdapterResult};
    use crate::handler::Handler;
    use crate::memory::MemoryAdapter;

    struct Broken;

    #[async_trait]
    impl Adapter for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn listen(&self, _events: Arc<dyn EventSink>, _options: &Value) -> AdapterResult<()> {
            Ok(())
        }

        async fn send(&self, _message: &Message) -> AdapterResult<()> {
            Err(AdapterError::SendFailed {
                name: "broken".into(),
                reason: "offline".into(),
            })
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        brokers: Vec<MemoryAdapter>,
        clients: Vec<MemoryAdapter>,
        reported: Arc<Mutex<Vec<String>>>,
    }

    fn fixture() -> Fixture {
        let brokers = AdapterSet::new();
        let clients = AdapterSet::new();
        let b = vec![MemoryAdapter::new("b1"), MemoryAdapter::new("b2")];
        let c = vec![MemoryAdapter::new("c1"), MemoryAdapter::new("c2")];
        for adapter in &b {
            brokers.push(Arc::new(adapter.clone()));
        }
        for adapter in &c {
            clients.push(Arc::new(adapter.clone()));
        }

        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let policy = ErrorPolicy::new("test").with_handler(move |err, ctx| {
            sink.lock().push(format!("{}:{err}", ctx.env));
        });

        Fixture {
            dispatcher: Dispatcher::new(Arc::new(FanOut::new(brokers, clients, policy))),
            brokers: b,
            clients: c,
            reported,
        }
    }

    #[tokio::test]
    async fn test_broker_message_reaches_every_client() {
        let fx = fixture();
        fx.dispatcher
            .register(
                Some("admin"),
                [Handler::sync(|msg, next| {
                    msg.insert("seen", true);
                    next.advance();
                    Ok(())
                })],
            )
            .unwrap();

        let msg = Message::new("admin/settings").tagged(Origin::FromBroker);
        fx.dispatcher.dispatch(msg).await;

        for client in &fx.clients {
            let sent = client.sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].get("seen"), Some(&json!(true)));
        }
        assert!(fx.brokers.iter().all(|b| b.sent().is_empty()));
    }

    #[tokio::test]
    async fn test_client_message_reaches_every_broker() {
        let fx = fixture();
        let msg = Message::new("posts").tagged(Origin::FromClient);
        fx.dispatcher.dispatch(msg).await;

        for broker in &fx.brokers {
            assert_eq!(broker.sent().len(), 1);
            assert_eq!(broker.sent()[0].topic, "posts");
        }
        assert!(fx.clients.iter().all(|c| c.sent().is_empty()));
    }

    #[tokio::test]
    async fn test_fan_out_preserves_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Ordered(&'static str, Arc<Mutex<Vec<&'static str>>>);

        #[async_trait]
        impl Adapter for Ordered {
            fn name(&self) -> &str {
                self.0
            }

            async fn listen(&self, _: Arc<dyn EventSink>, _: &Value) -> AdapterResult<()> {
                Ok(())
            }

            async fn send(&self, _: &Message) -> AdapterResult<()> {
                self.1.lock().push(self.0);
                Ok(())
            }
        }

        let clients = AdapterSet::new();
        for name in ["first", "second", "third"] {
            clients.push(Arc::new(Ordered(name, order.clone())));
        }
        let fan_out = FanOut::new(AdapterSet::new(), clients, ErrorPolicy::new("test"));
        fan_out
            .finish(Message::new("t"), Some(Origin::FromBroker), &Outcome::Completed)
            .await;

        assert_eq!(*order.lock(), ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_unresolved_error_is_reported_not_sent() {
        let fx = fixture();
        fx.dispatcher
            .register(None, [Handler::sync(|_, _| Err(HandlerError::msg("x")))])
            .unwrap();

        fx.dispatcher
            .dispatch(Message::new("t").tagged(Origin::FromBroker))
            .await;

        assert_eq!(*fx.reported.lock(), ["test:x"]);
        assert!(fx.clients.iter().all(|c| c.sent().is_empty()));
    }

    #[tokio::test]
    async fn test_recovered_error_is_forwarded() {
        let fx = fixture();
        fx.dispatcher
            .register(
                None,
                [
                    Handler::sync(|_, _| Err(HandlerError::msg("x"))),
                    Handler::sync_error(|_, _, next| {
                        next.advance();
                        Ok(())
                    }),
                ],
            )
            .unwrap();

        fx.dispatcher
            .dispatch(Message::new("t").tagged(Origin::FromBroker))
            .await;

        assert!(fx.reported.lock().is_empty());
        assert!(fx.clients.iter().all(|c| c.sent().len() == 1));
    }

    #[tokio::test]
    async fn test_cancel_sends_nothing() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        let hits = counter.clone();
        fx.dispatcher
            .register(
                None,
                [
                    Handler::sync(|_, next| {
                        next.cancel();
                        Ok(())
                    }),
                    Handler::sync(move |_, next| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        next.advance();
                        Ok(())
                    }),
                ],
            )
            .unwrap();

        fx.dispatcher
            .dispatch(Message::new("t").tagged(Origin::FromClient))
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(fx.brokers.iter().all(|b| b.sent().is_empty()));
        assert!(fx.clients.iter().all(|c| c.sent().is_empty()));
        assert!(fx.reported.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_adapter_does_not_block_others() {
        let healthy = MemoryAdapter::new("healthy");
        let clients = AdapterSet::new();
        clients.push(Arc::new(Broken));
        clients.push(Arc::new(healthy.clone()));

        let fan_out = FanOut::new(AdapterSet::new(), clients, ErrorPolicy::new("test"));
        fan_out
            .finish(Message::new("t"), Some(Origin::FromBroker), &Outcome::Completed)
            .await;

        assert_eq!(healthy.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_message_without_origin_is_dropped() {
        let fx = fixture();
        fx.dispatcher.dispatch(Message::new("t")).await;

        assert!(fx.brokers.iter().all(|b| b.sent().is_empty()));
        assert!(fx.clients.iter().all(|c| c.sent().is_empty()));
    }

    #[test]
    fn test_default_policy_env() {
        let policy = ErrorPolicy::default();
        assert_eq!(policy.env(), "development");
        policy.report(&HandlerError::msg("logged, not panicked"));
    }
}
