//! Routing of query names between local zones and the upstream forwarder.

use hickory_proto::rr::{LowerName, Name};
use hickory_server::authority::{AuthorityObject, Catalog};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::authority::StoreAuthority;
use crate::config::DnsConfig;
use crate::error::DnsError;
use crate::forward::ForwardAuthority;
use crate::metrics::MetricsEmitter;
use crate::store::Store;

/// Where a query name is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// From the store, under the given zone.
    Local(LowerName),
    /// By the upstream resolver.
    Forward,
}

/// Splits the name space into configured zones and everything else.
#[derive(Debug, Clone)]
pub struct ZoneRouter {
    zones: Vec<Name>,
    resolver: Option<SocketAddr>,
    resolver_timeout: Duration,
}

impl ZoneRouter {
    /// Parse the configured zones.
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let zones = config
            .zones
            .iter()
            .map(|zone| {
                let mut name = Name::from_ascii(zone)
                    .map_err(|e| DnsError::Config(format!("invalid zone {zone:?}: {e}")))?;
                name.set_fqdn(true);
                Ok(name)
            })
            .collect::<Result<Vec<_>, DnsError>>()?;

        Ok(Self {
            zones,
            resolver: config.resolver_addr,
            resolver_timeout: config.resolver_timeout(),
        })
    }

    /// Configured zones.
    pub fn zones(&self) -> &[Name] {
        &self.zones
    }

    /// Route `name` to the most specific zone containing it, or upstream.
    pub fn route(&self, name: &LowerName) -> Route {
        self.zones
            .iter()
            .map(LowerName::from)
            .filter(|zone| zone.zone_of(name))
            .max_by_key(|zone| zone.num_labels())
            .map_or(Route::Forward, Route::Local)
    }

    /// Build a catalog with one store authority per zone and a root forwarder.
    ///
    /// The catalog's longest-suffix lookup then mirrors [`ZoneRouter::route`].
    pub fn catalog(&self, store: Store, metrics: MetricsEmitter) -> Catalog {
        let mut catalog = Catalog::new();

        for zone in &self.zones {
            let authority = StoreAuthority::new(zone, store.clone(), metrics.clone());
            let authority: Arc<dyn AuthorityObject> = Arc::new(authority);
            catalog.upsert(authority.origin().clone(), vec![authority]);
            info!(zone = %zone, "serving zone from store");
        }

        let forwarder = ForwardAuthority::new(self.resolver, self.resolver_timeout, metrics);
        match forwarder.upstream() {
            Some(upstream) => info!(upstream = %upstream, "forwarding other names"),
            None => info!("no upstream resolver configured, other names are refused"),
        }
        let forwarder: Arc<dyn AuthorityObject> = Arc::new(forwarder);
        catalog.upsert(forwarder.origin().clone(), vec![forwarder]);

        catalog
    }
}
