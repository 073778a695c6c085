//! Broker assembly (§4.9): wires the six components together in
//! construction order and binds whichever transport listeners the
//! configuration asks for.
//!
//! Construction order is Monitoring, Subscription Manager, Message Router,
//! Service Registry, Connection Manager, then the transport acceptors. The
//! router and registry are built before the connection manager they need to
//! call into, so their `Weak` back-references are installed as a separate
//! step right after the connection manager exists (§9).

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::conn_manager::ConnectionManager;
use crate::config::BrokerConfig;
use crate::connection::{self, load_tls_config};
use crate::monitoring::MonitoringManager;
use crate::registry::ServiceRegistry;
use crate::router::MessageRouter;
use crate::subscription::SubscriptionManager;
use crate::{BoundAddrs, Broker};

/// Builds a [`Broker`] from a [`BrokerConfig`], binding listeners and
/// spawning acceptor loops along the way.
pub struct BrokerBuilder {
    config: BrokerConfig,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Assemble and start the broker: binds every listener the
    /// configuration enables before returning, so a successful return means
    /// the broker is already accepting connections.
    pub async fn build(self) -> mb_core::Result<Broker> {
        let config = self.config;

        let monitoring = Arc::new(MonitoringManager::with_interval(config.monitoring_interval));
        let subscriptions = Arc::new(SubscriptionManager::new());
        let router = MessageRouter::new(config.clone(), monitoring.clone(), subscriptions.clone());
        let registry = ServiceRegistry::new(config.clone(), monitoring.clone(), subscriptions.clone());
        let connections = ConnectionManager::new(
            config.clone(),
            monitoring.clone(),
            subscriptions.clone(),
            router.clone(),
            registry.clone(),
        );

        router.set_connection_manager(Arc::downgrade(&connections));
        router.set_service_registry(Arc::downgrade(&registry));
        registry.set_connection_manager(Arc::downgrade(&connections));

        let tls_config = match &config.ssl {
            Some(ssl) if config.ports.tls.is_some() || config.ports.wss.is_some() => {
                Some(load_tls_config(&ssl.cert, &ssl.key)?)
            }
            _ => None,
        };

        let mut listeners = Vec::new();
        let mut bound_addrs = BoundAddrs::default();

        if let Some(port) = config.ports.tcp {
            if !config.allow_unsecure {
                return Err(mb_core::Error::Other(
                    "ports.tcp is set but allow_unsecure is false".to_string(),
                ));
            }
            let listener = bind(&config.host, port).await?;
            bound_addrs.tcp = Some(listener.local_addr().map_err(mb_core::Error::Io)?);
            listeners.push(tokio::spawn(connection::accept_tcp_loop(listener, connections.clone())));
        }

        if let Some(port) = config.ports.ws {
            if !config.allow_unsecure {
                return Err(mb_core::Error::Other(
                    "ports.ws is set but allow_unsecure is false".to_string(),
                ));
            }
            let listener = bind(&config.host, port).await?;
            bound_addrs.ws = Some(listener.local_addr().map_err(mb_core::Error::Io)?);
            listeners.push(tokio::spawn(connection::accept_ws_loop(listener, connections.clone())));
        }

        if let Some(port) = config.ports.tls {
            let acceptor = tokio_rustls::TlsAcceptor::from(
                tls_config
                    .clone()
                    .ok_or_else(|| mb_core::Error::Tls("ports.tls set without ssl config".to_string()))?,
            );
            let listener = bind(&config.host, port).await?;
            bound_addrs.tls = Some(listener.local_addr().map_err(mb_core::Error::Io)?);
            listeners.push(tokio::spawn(connection::accept_tls_loop(listener, acceptor, connections.clone())));
        }

        if let Some(port) = config.ports.wss {
            let acceptor = tokio_rustls::TlsAcceptor::from(
                tls_config.ok_or_else(|| mb_core::Error::Tls("ports.wss set without ssl config".to_string()))?,
            );
            let listener = bind(&config.host, port).await?;
            bound_addrs.wss = Some(listener.local_addr().map_err(mb_core::Error::Io)?);
            listeners.push(tokio::spawn(connection::accept_wss_loop(listener, acceptor, connections.clone())));
        }

        Ok(Broker {
            config,
            monitoring,
            subscriptions,
            router,
            registry,
            connections,
            listeners,
            bound_addrs,
        })
    }
}

async fn bind(host: &str, port: u16) -> mb_core::Result<TcpListener> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| mb_core::Error::Bind { addr, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_with_no_ports_starts_no_listeners() {
        let mut config = BrokerConfig::default();
        config.ports = Default::default();
        let broker = BrokerBuilder::new(config).build().await.unwrap();
        assert_eq!(broker.active_connection_count().await, 0);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn build_binds_requested_tcp_port() {
        let mut config = BrokerConfig::default();
        config.ports.tcp = Some(0);
        let broker = BrokerBuilder::new(config).build().await.unwrap();
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn tls_port_without_ssl_config_fails() {
        let mut config = BrokerConfig::default();
        config.ports.tls = Some(0);
        let result = BrokerBuilder::new(config).build().await;
        assert!(result.is_err());
    }
}
