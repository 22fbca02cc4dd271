//! The application shell.
//!
//! [`Switchyard`] owns the dispatcher and both adapter collections, and wires
//! adapter events into dispatches.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use switchyard_runtime::Switchyard;
//!
//! // Auto-loads switchyard.toml from the current directory
//! let app = Switchyard::new();
//!
//! // Custom configuration
//! let app = Switchyard::builder()
//!     .config_file("config/switchyard.toml")
//!     .profile("production")
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use switchyard_core::{
    Adapter, AdapterResult, AdapterSet, BoxedAdapter, Dispatcher, ErrorContext, ErrorPolicy,
    EventSink, FanOut, Handler, HandlerError, Message, Outcome, Side,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigLoader, ConfigResult, SwitchyardConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

type ErrorHook = Arc<dyn Fn(&HandlerError, &ErrorContext<'_>) + Send + Sync>;

/// The Switchyard application shell.
///
/// # Usage
///
/// ```rust,ignore
/// let app = Switchyard::new();
///
/// app.use_route("sensors/:room", [Handler::sync(|msg, next| {
///     let room = msg.param("room").unwrap_or_default().to_owned();
///     msg.insert("room", room);
///     next.advance();
///     Ok(())
/// })])?;
///
/// app.add_broker(|_| Ok(MqttAdapter::connect("mqtt://localhost")))?;
/// app.add_client(|app| Ok(WsAdapter::new(app.get("ws_port"))))?;
///
/// app.run(&app.config().listen.clone()).await?;
/// ```
pub struct Switchyard {
    config: SwitchyardConfig,
    dispatcher: Arc<Dispatcher>,
    brokers: AdapterSet,
    clients: AdapterSet,
    properties: RwLock<HashMap<String, Vec<Value>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Switchyard {
    /// Creates a shell from the configuration found in the default
    /// locations, falling back to defaults if it cannot be loaded.
    pub fn new() -> Self {
        let config = ConfigLoader::new().load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config ({e}), using defaults");
            SwitchyardConfig::default()
        });
        Self::from_config(&config)
    }

    /// Creates a builder for custom configuration.
    pub fn builder() -> SwitchyardBuilder {
        SwitchyardBuilder::new()
    }

    /// Creates a shell from configuration, initializing logging.
    ///
    /// Unresolved pipeline errors are logged unless `config.env` is `"test"`.
    pub fn from_config(config: &SwitchyardConfig) -> Self {
        Self::with_policy(config, ErrorPolicy::new(config.env.clone()))
    }

    /// Creates a shell with a custom error policy.
    pub fn with_policy(config: &SwitchyardConfig, policy: ErrorPolicy) -> Self {
        logging::init_from_config(&config.logging);

        let brokers = AdapterSet::new();
        let clients = AdapterSet::new();
        let fan_out = FanOut::new(brokers.clone(), clients.clone(), policy);

        info!(
            env = %config.env,
            log_level = %config.logging.level,
            "Switchyard initialized from configuration"
        );

        Self {
            config: config.clone(),
            dispatcher: Arc::new(Dispatcher::new(Arc::new(fan_out))),
            brokers,
            clients,
            properties: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SwitchyardConfig {
        &self.config
    }

    /// Returns the dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    // =========================================================================
    // Middleware
    // =========================================================================

    /// Registers handlers for every topic.
    pub fn use_handlers<I>(&self, handlers: I) -> RuntimeResult<&Self>
    where
        I: IntoIterator<Item = Handler>,
    {
        self.dispatcher.register(None, handlers)?;
        Ok(self)
    }

    /// Registers handlers for topics matching `pattern`.
    pub fn use_route<I>(&self, pattern: &str, handlers: I) -> RuntimeResult<&Self>
    where
        I: IntoIterator<Item = Handler>,
    {
        self.dispatcher.register(Some(pattern), handlers)?;
        Ok(self)
    }

    // =========================================================================
    // Adapters and properties
    // =========================================================================

    /// Builds a broker adapter with `factory` and stores it.
    pub fn add_broker<F, A>(&self, factory: F) -> RuntimeResult<&Self>
    where
        F: FnOnce(&Self) -> AdapterResult<A>,
        A: Adapter + 'static,
    {
        self.add_adapter(Side::Broker, factory)
    }

    /// Builds a client adapter with `factory` and stores it.
    pub fn add_client<F, A>(&self, factory: F) -> RuntimeResult<&Self>
    where
        F: FnOnce(&Self) -> AdapterResult<A>,
        A: Adapter + 'static,
    {
        self.add_adapter(Side::Client, factory)
    }

    fn add_adapter<F, A>(&self, side: Side, factory: F) -> RuntimeResult<&Self>
    where
        F: FnOnce(&Self) -> AdapterResult<A>,
        A: Adapter + 'static,
    {
        let adapter: BoxedAdapter = Arc::new(factory(self)?);
        debug!(adapter = adapter.name(), side = %side, "Adapter added");
        self.adapters(side).push(adapter);
        Ok(self)
    }

    fn adapters(&self, side: Side) -> &AdapterSet {
        match side {
            Side::Broker => &self.brokers,
            Side::Client => &self.clients,
        }
    }

    /// Appends `value` to the named property.
    ///
    /// `broker` and `client` are reserved for the adapter collections.
    pub fn add(&self, property: &str, value: impl Serialize) -> RuntimeResult<&Self> {
        if reserved_side(property).is_some() {
            return Err(RuntimeError::ReservedProperty(property.to_string()));
        }
        let value = serde_json::to_value(value)?;
        self.properties
            .write()
            .entry(property.to_string())
            .or_default()
            .push(value);
        Ok(self)
    }

    /// Returns every value added under `property`, oldest first.
    ///
    /// `broker` and `client` yield the names of the adapters on that side.
    pub fn get(&self, property: &str) -> Vec<Value> {
        if let Some(side) = reserved_side(property) {
            return self
                .adapters(side)
                .snapshot()
                .iter()
                .map(|adapter| Value::from(adapter.name()))
                .collect();
        }
        self.properties
            .read()
            .get(property)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the broker adapters in registration order.
    pub fn brokers(&self) -> Vec<BoxedAdapter> {
        self.brokers.snapshot()
    }

    /// Returns the client adapters in registration order.
    pub fn clients(&self) -> Vec<BoxedAdapter> {
        self.clients.snapshot()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts every broker adapter, then every client adapter, in
    /// registration order. Stops at the first adapter that fails.
    pub async fn listen(&self, options: &Value) -> RuntimeResult<()> {
        for side in [Side::Broker, Side::Client] {
            for adapter in self.adapters(side).snapshot() {
                let events = Arc::new(SideEvents {
                    side,
                    dispatcher: Arc::clone(&self.dispatcher),
                    cancel: self.cancel.clone(),
                    tracker: self.tracker.clone(),
                });
                if let Err(e) = adapter.listen(events, options).await {
                    error!(adapter = adapter.name(), side = %side, error = %e, "Failed to start adapter");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Dispatches a message directly, bypassing the adapters.
    pub async fn dispatch(&self, message: Message) -> Outcome {
        self.dispatcher.dispatch(message).await
    }

    /// Listens, then runs until Ctrl+C or SIGTERM.
    pub async fn run(&self, options: &Value) -> RuntimeResult<()> {
        self.run_until(options, wait_for_signal()).await
    }

    /// Listens, then runs until `shutdown` completes or
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn run_until<F>(&self, options: &Value, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.listen(options).await?;
        info!(
            brokers = self.brokers.len(),
            clients = self.clients.len(),
            "Switchyard is running"
        );

        tokio::select! {
            () = shutdown => {}
            () = self.cancel.cancelled() => {}
        }
        self.shutdown().await
    }

    /// Stops accepting adapter events, waits for in-flight dispatches and
    /// closes every adapter.
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        self.cancel.cancel();
        self.tracker.close();

        if !self.tracker.is_empty() {
            debug!(in_flight = self.tracker.len(), "Waiting for in-flight dispatches");
        }
        self.tracker.wait().await;

        let adapters: Vec<BoxedAdapter> = self
            .brokers
            .snapshot()
            .into_iter()
            .chain(self.clients.snapshot())
            .collect();
        let results = join_all(adapters.iter().map(|adapter| adapter.close())).await;
        for (adapter, result) in adapters.iter().zip(results) {
            if let Err(e) = result {
                error!(adapter = adapter.name(), error = %e, "Error during adapter close");
            }
        }

        info!("Switchyard stopped");
        Ok(())
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for Switchyard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Switchyard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchyard")
            .field("env", &self.config.env)
            .field("dispatcher", &self.dispatcher)
            .field("brokers", &self.brokers)
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}

/// Maps the reserved property names onto their adapter side.
fn reserved_side(property: &str) -> Option<Side> {
    [Side::Broker, Side::Client]
        .into_iter()
        .find(|side| side.as_str() == property)
}

/// The event sink handed to one adapter.
struct SideEvents {
    side: Side,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EventSink for SideEvents {
    fn ready(&self, name: &str) {
        info!(adapter = name, side = %self.side, "Adapter ready");
    }

    fn message(&self, message: Message) {
        if self.cancel.is_cancelled() {
            debug!(topic = %message.topic, side = %self.side, "Shutting down, message dropped");
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(topic = %message.topic, "Message arrived outside a Tokio runtime, dropped");
            return;
        };

        let message = message.tagged(self.side.origin());
        let dispatcher = Arc::clone(&self.dispatcher);
        self.tracker.spawn_on(
            async move {
                dispatcher.dispatch(message).await;
            },
            &handle,
        );
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                wait_for_ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            () = wait_for_ctrl_c() => {}
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// SwitchyardBuilder
// =============================================================================

/// Builder for a [`Switchyard`] with custom configuration.
///
/// ```rust,ignore
/// let app = Switchyard::builder()
///     .config_file("config/switchyard.toml")
///     .profile("production")
///     .on_error(|err, ctx| eprintln!("[{}] {err}", ctx.env))
///     .build()?;
/// ```
pub struct SwitchyardBuilder {
    loader: ConfigLoader,
    on_error: Option<ErrorHook>,
}

impl SwitchyardBuilder {
    /// Creates a builder that searches the default locations.
    pub fn new() -> Self {
        Self {
            loader: ConfigLoader::new(),
            on_error: None,
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.loader = self.loader.file(path);
        self
    }

    /// Sets the configuration profile.
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.loader = self.loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.loader = self.loader.search_path(path);
        self
    }

    /// Enables loading environment variables (enabled by default).
    pub fn with_env(mut self) -> Self {
        self.loader = self.loader.with_env();
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.loader = self.loader.without_env();
        self
    }

    /// Merges configuration programmatically.
    pub fn merge(mut self, config: SwitchyardConfig) -> Self {
        self.loader = self.loader.merge(config);
        self
    }

    /// Replaces the callback for errors no error handler resolved.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&HandlerError, &ErrorContext<'_>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Loads the configuration and builds the shell.
    pub fn build(self) -> ConfigResult<Switchyard> {
        let config = self.loader.load()?;
        let mut policy = ErrorPolicy::new(config.env.clone());
        if let Some(hook) = self.on_error {
            policy = policy.with_handler(move |err, ctx| hook(err, ctx));
        }
        Ok(Switchyard::with_policy(&config, policy))
    }
}

impl Default for SwitchyardBuilder {
    fn default() -> Self {
        Self::new()
    }
}
