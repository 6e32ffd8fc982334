//! mqtt-async - asynchronous MQTT relay client
//!
//! Startup order: parse options, open the connection and start dialing,
//! submit the SUBSCRIBE, then run the work-item pool until a fatal error or
//! a termination signal.

use mqtt_async_relay::cli::parse_options;
use mqtt_async_relay::config::ClientConfig;
use mqtt_async_relay::error::RelayError;
use mqtt_async_relay::observability::{init_default_logging, metrics};
use mqtt_async_relay::relay::{RelaySettings, WorkerPool};
use mqtt_async_relay::subscription::{subscribe_and_log, SubscriptionRequest};
use mqtt_async_relay::transport::mqtt::{Connection, ConnectionState};
use std::process;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = match parse_options(std::env::args_os()) {
        Ok(config) => config,
        Err(e) => {
            let code = e.exit_code();
            if e.is_help() {
                print!("{e}");
            } else {
                eprintln!("mqtt-async: {e}");
            }
            process::exit(code);
        }
    };

    init_default_logging();
    info!(
        "Starting mqtt-async v{} (url {}, MQTT {}, {} work items)",
        env!("CARGO_PKG_VERSION"),
        config.url,
        config.version,
        config.parallel
    );

    if let Err(e) = run_relay(config).await {
        error!("{}", e.log_message());
        eprintln!("mqtt-async: {e}");
        process::exit(e.exit_code());
    }

    info!("Application shutdown complete");
}

async fn run_relay(config: ClientConfig) -> Result<(), RelayError> {
    let connection = Connection::open(&config)?;

    let request = SubscriptionRequest::new(config.tuning.relay.subscriptions.clone())
        .ok_or_else(|| RelayError::invalid_state("no subscriptions configured"))?;
    subscribe_and_log(connection.socket(), request).await?;

    let settings = RelaySettings::from_config(&config);
    let pool = WorkerPool::for_connection(&connection, config.parallel, &settings);

    let outcome = tokio::select! {
        result = pool.run() => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping relay");
            Ok(())
        }
        reason = wait_for_permanent_disconnect(connection.state()) => {
            Err(RelayError::invalid_state(format!("connection permanently lost: {reason}")))
        }
    };

    match serde_json::to_string(&metrics().snapshot()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Relay metrics"),
        Err(e) => error!("Failed to serialize metrics: {}", e),
    }
    connection.shutdown().await;
    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

/// Resolves only once the dialer has given up
async fn wait_for_permanent_disconnect(mut state: watch::Receiver<ConnectionState>) -> String {
    loop {
        if let ConnectionState::PermanentlyDisconnected(reason) = &*state.borrow_and_update() {
            return reason.clone();
        }
        if state.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
