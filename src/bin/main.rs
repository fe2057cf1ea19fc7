//! stream-dns binary entry point.

use clap::Parser;
use std::path::PathBuf;
use stream_dns::{kafka, telemetry, Config, DnsServer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// DNS server answering from records consumed off a Kafka topic.
#[derive(Parser, Debug)]
#[command(name = "stream-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML). Environment variables prefixed
    /// with `STREAM_DNS__` override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = ?args.config,
        listen_addr = %config.dns.listen_addr,
        zones = ?config.dns.zones,
        topic = %config.stream.topic,
        "Starting stream-dns"
    );

    // Setup graceful shutdown
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    let stream_config = config.stream.clone();
    let connect = move |resume: Option<i64>| {
        let stream_config = stream_config.clone();
        async move { kafka::connect(&stream_config, resume).await }
    };
    let result = DnsServer::new(config).run(connect, cancel).await;

    // Shutdown telemetry
    telemetry::shutdown();

    if let Err(e) = result {
        error!("DNS server error: {}", e);
        return Err(e.into());
    }

    info!("stream-dns shutdown complete");
    Ok(())
}
