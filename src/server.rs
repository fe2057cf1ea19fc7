//! DNS server setup and lifecycle management.

use futures::Stream;
use hickory_server::ServerFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::DnsError;
use crate::ingest::{IngestPipeline, StreamEntry};
use crate::metrics::{self, MetricsEmitter, NB_DOMAIN};
use crate::metrics_service::MetricsService;
use crate::router::ZoneRouter;
use crate::sink;
use crate::store::Store;

/// Periodically report the number of stored domains.
async fn state_loop(store: Store, metrics: MetricsEmitter, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.len()).await {
                    Ok(Ok(domains)) => {
                        metrics.gauge(NB_DOMAIN, domains as f64).await;
                        debug!(domains, "emitted state metrics");
                    }
                    Ok(Err(e)) => warn!("failed to count stored domains: {}", e),
                    Err(e) => warn!("store count task failed: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                debug!("state loop shutting down");
                return;
            }
        }
    }
}

/// DNS server answering configured zones from the record store.
pub struct DnsServer {
    config: Config,
}

impl DnsServer {
    /// Create a new DNS server with the given configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Configuration the server runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ingest from sources opened by `connect` and serve DNS until `cancel` fires.
    ///
    /// `connect` receives the offset to resume from and is called again, with
    /// backoff, whenever the record stream fails. Queries keep being answered
    /// from what was stored in the meantime.
    pub async fn run<F, Fut, S>(self, connect: F, cancel: CancellationToken) -> Result<(), DnsError>
    where
        F: FnMut(Option<i64>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, DnsError>> + Send,
        S: Stream<Item = Result<StreamEntry, DnsError>> + Unpin + Send,
    {
        let dns = &self.config.dns;
        info!(
            listen_addr = %dns.listen_addr,
            zones = ?dns.zones,
            resolver = ?dns.resolver_addr,
            store = %self.config.store.path.display(),
            "Starting stream-dns server"
        );

        let store = Store::open(&self.config.store.path)?;
        let router = ZoneRouter::new(dns)?;

        // Metrics
        let (emitter, metrics_rx) = metrics::channel(self.config.metrics.channel_capacity);
        let service = MetricsService::new(
            self.config.metrics.flush_interval(),
            sink::from_outputs(&self.config.metrics.outputs),
        );
        let metrics_handle = tokio::spawn(service.run(metrics_rx, cancel.clone()));

        // Ingestion
        let pipeline = IngestPipeline::new(Arc::new(store.clone()), emitter.clone());
        let ingest_cancel = cancel.child_token();
        let ingest_handle = tokio::spawn(async move {
            pipeline.supervise(connect, ingest_cancel).await;
        });

        let state_handle = tokio::spawn(state_loop(
            store.clone(),
            emitter.clone(),
            self.config.metrics.state_interval(),
            cancel.child_token(),
        ));

        // DNS listeners
        let catalog = router.catalog(store, emitter);
        let mut server = ServerFuture::new(catalog);

        if dns.udp {
            let udp_socket = UdpSocket::bind(dns.listen_addr).await?;
            info!(addr = %udp_socket.local_addr()?, "DNS UDP listening");
            server.register_socket(udp_socket);
        }

        if dns.tcp {
            let tcp_listener = TcpListener::bind(dns.listen_addr).await?;
            info!(addr = %tcp_listener.local_addr()?, "DNS TCP listening");
            server.register_listener(tcp_listener, Duration::from_secs(dns.tcp_timeout_secs));
        }

        info!("DNS server ready to serve queries");

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
                cancel.cancel();
            }
        }
        drop(server);

        if let Err(e) = ingest_handle.await {
            error!("Ingestion task failed: {}", e);
        }
        if let Err(e) = state_handle.await {
            error!("State metrics task failed: {}", e);
        }

        info!("Flushing metrics...");
        if let Err(e) = metrics_handle.await {
            error!("Metrics service task failed: {}", e);
        }

        info!("DNS server stopped");
        Ok(())
    }
}
