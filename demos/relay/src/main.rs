//! Sensor Relay Example
//!
//! Relays sensor readings from an upstream broker to downstream clients, and
//! commands from the clients back upstream, through a small middleware stack:
//!
//! ```text
//! *                    log every message
//! sensors/:room        tag the reading with its room
//! sensors/:room/temp   add a fahrenheit value, fail on malformed readings
//! internal             never relayed (cancelled)
//! * (error handler)    flag malformed readings instead of dropping them
//! ```
//!
//! Both sides are in-memory adapters, so the example runs without a broker.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package switchyard-relay -- --count 10
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::{Value, json};
use switchyard::prelude::*;
use tracing::{info, warn};

/// Command-line options.
#[derive(Debug, Parser)]
#[command(version, about = "Relay sensor readings through a Switchyard pipeline")]
struct Args {
    /// Configuration file (defaults to switchyard.toml in the working directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration profile.
    #[arg(short, long)]
    profile: Option<String>,

    /// Number of readings to publish before stopping.
    #[arg(short = 'n', long, default_value_t = 6)]
    count: usize,

    /// Delay between readings in milliseconds.
    #[arg(long, default_value_t = 200)]
    interval_ms: u64,
}

// ============================================================================
// Middleware
// ============================================================================

fn register_middleware(app: &Switchyard) -> RuntimeResult<()> {
    app.use_handlers([Handler::normal(|msg, next| {
        Box::pin(async move {
            info!(topic = %msg.topic, origin = ?msg.origin(), "Relaying");
            next.advance();
            Ok(())
        })
    })])?
    .use_route(
        "sensors/:room",
        [Handler::sync(|msg, next| {
            let room = msg.param("room").unwrap_or("unknown").to_owned();
            msg.insert("room", room);
            next.advance();
            Ok(())
        })],
    )?
    .use_route(
        "sensors/:room/temp",
        [Handler::sync(|msg, next| {
            let celsius = msg
                .get("celsius")
                .and_then(Value::as_f64)
                .ok_or_else(|| HandlerError::msg("reading has no numeric `celsius` field"))?;
            msg.insert("fahrenheit", celsius * 9.0 / 5.0 + 32.0);
            next.advance();
            Ok(())
        })],
    )?
    .use_route(
        "internal",
        [Handler::sync(|_, next| {
            next.cancel();
            Ok(())
        })],
    )?
    .use_handlers([Handler::sync_error(|err, msg, next| {
        warn!(topic = %msg.topic, error = %err, "Malformed message, forwarding flagged");
        msg.insert("error", err.to_string());
        next.advance();
        Ok(())
    })])?;
    Ok(())
}

// ============================================================================
// Traffic
// ============================================================================

/// Publishes readings on the broker side and one command on the client side.
async fn produce(upstream: MemoryAdapter, downstream: MemoryAdapter, count: usize, interval: Duration) {
    let rooms = ["kitchen", "hall", "attic"];

    for i in 0..count {
        let room = rooms[i % rooms.len()];
        let message = match i % 3 {
            0 => Message::new(format!("sensors/{room}/temp")).with("celsius", 18.0 + i as f64),
            1 => Message::new(format!("sensors/{room}/temp")).with("celsius", "warm"),
            _ => Message::new("internal/heartbeat").with("seq", i),
        };
        if let Err(e) = upstream.inject(message) {
            warn!(error = %e, "Failed to publish reading");
        }
        tokio::time::sleep(interval).await;
    }

    let command = Message::new("/commands/thermostat/").with("target", json!({"celsius": 21}));
    if let Err(e) = downstream.inject(command) {
        warn!(error = %e, "Failed to publish command");
    }
}

/// Prints everything an adapter is asked to send.
async fn print_deliveries(adapter: MemoryAdapter) {
    while let Some(message) = adapter.recv().await {
        // Deliveries are consumed from the channel; the send log is not needed.
        adapter.take_sent();
        info!(
            adapter = adapter.name(),
            topic = %message.topic,
            payload = %serde_json::Value::Object(message.payload.clone()),
            "Delivered"
        );
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = Switchyard::builder();
    if let Some(path) = &args.config {
        builder = builder.config_file(path);
    }
    if let Some(profile) = &args.profile {
        builder = builder.profile(profile);
    }
    let app = builder.build()?;

    register_middleware(&app)?;

    let upstream = MemoryAdapter::new("upstream");
    let downstream = MemoryAdapter::new("downstream");
    app.add_broker(|_| Ok(upstream.clone()))?
        .add_client(|_| Ok(downstream.clone()))?;

    let printers = [
        tokio::spawn(print_deliveries(upstream.clone())),
        tokio::spawn(print_deliveries(downstream.clone())),
    ];

    let options = app.config().listen.clone();
    let interval = Duration::from_millis(args.interval_ms);
    app.run_until(&options, async {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
            () = produce(upstream.clone(), downstream.clone(), args.count, interval) => {
                tokio::time::sleep(interval).await;
            }
        }
    })
    .await?;

    for printer in printers {
        printer.abort();
    }
    Ok(())
}
