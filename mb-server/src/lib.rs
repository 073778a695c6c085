//! Broker assembly: connection layer, service registry, message router,
//! subscription manager, and monitoring, wired together behind a single
//! [`Broker`] handle (§4, §4.9).
//!
//! Transport-agnostic wire types and the routing trie live in `mb-core`;
//! this crate is where they become a running service: `tokio` listeners,
//! the `system.*` control plane, rate limiting, and request/response
//! correlation.

pub mod builder;
pub mod config;
pub mod conn_manager;
pub mod connection;
pub mod monitoring;
pub mod registry;
pub mod router;
pub mod subscription;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

pub use builder::BrokerBuilder;
pub use config::{BrokerConfig, PortsConfig, SslConfig};
pub use conn_manager::ConnectionManager;
pub use monitoring::MonitoringManager;
pub use registry::ServiceRegistry;
pub use router::MessageRouter;
pub use subscription::SubscriptionManager;

/// The actual address each enabled listener bound to — most useful when
/// a configured port was `0` and the OS picked one, as tests do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundAddrs {
    pub tcp: Option<SocketAddr>,
    pub tls: Option<SocketAddr>,
    pub ws: Option<SocketAddr>,
    pub wss: Option<SocketAddr>,
}

/// A fully assembled, running broker (§4.9). Holds every component plus
/// the join handles of its transport acceptor loops.
///
/// Dropping a `Broker` does not stop it — call [`Broker::shutdown`] to tear
/// it down in reverse construction order.
pub struct Broker {
    config: BrokerConfig,
    monitoring: Arc<MonitoringManager>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<MessageRouter>,
    registry: Arc<ServiceRegistry>,
    connections: Arc<ConnectionManager>,
    listeners: Vec<JoinHandle<()>>,
    bound_addrs: BoundAddrs,
}

impl Broker {
    /// Start building a broker from a configuration value. Call
    /// [`BrokerBuilder::build`] to assemble it and start listening.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn monitoring(&self) -> &Arc<MonitoringManager> {
        &self.monitoring
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The actual bound address of each enabled listener (§4.9's "binding
    /// ports 0 picks an ephemeral one" case, mainly useful for tests).
    pub fn bound_addrs(&self) -> BoundAddrs {
        self.bound_addrs
    }

    pub async fn active_connection_count(&self) -> usize {
        self.connections.active_connection_count().await
    }

    /// Tear the broker down in the exact reverse of construction order
    /// (§4.9): transport, then Connections, Registry, Router, Subscription,
    /// Monitoring. Each component's dispose is awaited before the next.
    pub async fn shutdown(self) {
        for handle in self.listeners {
            handle.abort();
        }
        self.connections.dispose().await;
        self.registry.dispose().await;
        self.router.dispose().await;
        self.monitoring.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_assembles_and_shuts_down_cleanly() {
        let config = BrokerConfig::default();
        let broker = Broker::builder(config).build().await.unwrap();
        assert_eq!(broker.active_connection_count().await, 0);
        broker.shutdown().await;
    }
}
