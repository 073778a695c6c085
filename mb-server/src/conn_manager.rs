//! Connection manager (§4.5): owns every live [`ConnectionHandle`], and is
//! the single place that turns a `(Header, Value)` pair into bytes on the
//! wire or bytes off the wire into a routed message.
//!
//! Constructed last in the broker assembly order (§4.9), after the router
//! and registry already exist, so it holds them as ordinary owning `Arc`s —
//! no back-reference dance needed on this side of the cycle (§9). The
//! router and registry each get a `Weak<ConnectionManager>` handed to them
//! once this manager is built.

use std::collections::HashMap;
use std::sync::Arc;

use mb_core::codec::{decode_header, decode_payload, encode_message, split_message, MAX_HEADER_LENGTH};
use mb_core::{Action, ErrorCode, ErrorPayload, Header};
use tokio::sync::Mutex;

use crate::config::BrokerConfig;
use crate::connection::{ConnState, ConnectionHandle};
use crate::monitoring::{MetricKind, MonitoringManager};
use crate::registry::ServiceRegistry;
use crate::router::MessageRouter;
use crate::subscription::SubscriptionManager;

pub struct ConnectionManager {
    connections: Mutex<HashMap<String, Arc<ConnectionHandle>>>,
    registry: Arc<ServiceRegistry>,
    router: Arc<MessageRouter>,
    subscriptions: Arc<SubscriptionManager>,
    config: BrokerConfig,

    connections_active: Arc<crate::monitoring::Metric>,
    connections_established: Arc<crate::monitoring::Metric>,
    connections_closed: Arc<crate::monitoring::Metric>,
    connections_rejected: Arc<crate::monitoring::Metric>,
}

impl ConnectionManager {
    pub fn new(
        config: BrokerConfig,
        monitoring: Arc<MonitoringManager>,
        subscriptions: Arc<SubscriptionManager>,
        router: Arc<MessageRouter>,
        registry: Arc<ServiceRegistry>,
    ) -> Arc<Self> {
        let connections_active = monitoring.register_metric_idempotent("connection.active", MetricKind::Gauge);
        let connections_established = monitoring.register_metric_idempotent("connection.established", MetricKind::Rate);
        let connections_closed = monitoring.register_metric_idempotent("connection.closed", MetricKind::Rate);
        let connections_rejected = monitoring.register_metric_idempotent("connection.rejected", MetricKind::Rate);

        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            registry,
            router,
            subscriptions,
            config,
            connections_active,
            connections_established,
            connections_closed,
            connections_rejected,
        })
    }

    pub fn max_frame_length(&self) -> usize {
        self.config.message_payload_max_length + MAX_HEADER_LENGTH + 1
    }

    pub fn max_payload_length(&self) -> usize {
        self.config.message_payload_max_length
    }

    /// Register a newly accepted connection. Enforces the concurrent
    /// connection cap, closing and dropping the connection over limit.
    pub async fn add_connection(self: &Arc<Self>, handle: Arc<ConnectionHandle>) {
        let mut connections = self.connections.lock().await;
        if connections.len() >= self.config.connection_max_concurrent {
            self.connections_rejected.add(1.0);
            handle.close();
            return;
        }
        let id = handle.id().to_string();
        connections.insert(id.clone(), handle);
        drop(connections);

        self.connections_active.add(1.0);
        self.connections_established.add(1.0);
        self.registry.register_service(id).await;
    }

    /// Tear down a connection: idempotent, safe to call from the transport
    /// loop on natural close, or from the registry on heartbeat expiry.
    pub async fn remove_connection(&self, service_id: &str) {
        let removed = self.connections.lock().await.remove(service_id);
        let Some(handle) = removed else { return };
        handle.close();
        self.connections_active.add(-1.0);
        self.connections_closed.add(1.0);
        self.registry.unregister_service(service_id).await;
        self.subscriptions.unsubscribe(service_id, None);
    }

    /// Encode and deliver a message to `service_id`. Errors (and is a
    /// no-op) if the connection is missing or closed. A stale (closed but
    /// not yet reaped) entry is torn down via [`Self::remove_connection`]
    /// before returning the error, so it can't be found again.
    pub async fn send_message(&self, service_id: &str, header: Header, payload: serde_json::Value) -> mb_core::Result<()> {
        let handle = {
            let connections = self.connections.lock().await;
            connections.get(service_id).cloned()
        };
        let Some(handle) = handle else {
            return Err(mb_core::Error::Other(format!("no such connection: {service_id}")));
        };
        if handle.state() != ConnState::Open {
            self.remove_connection(service_id).await;
            return Err(mb_core::Error::Other("connection is closed".to_string()));
        }
        let bytes = encode_message(&header, &payload);
        handle.send(bytes)
    }

    /// Parse and route a raw message received from `service_id`'s
    /// connection. Header and payload are parsed in that order (§4.5);
    /// either failure is reported back to the sender and the message is
    /// dropped without reaching the router.
    pub async fn handle_message(self: &Arc<Self>, service_id: &str, raw: &[u8]) {
        let Some((header_bytes, payload_bytes)) = split_message(raw) else {
            self.reply_malformed(service_id, None, "message is missing the header/payload separator")
                .await;
            return;
        };

        let header_str = match std::str::from_utf8(header_bytes) {
            Ok(s) => s,
            Err(_) => {
                self.reply_malformed(service_id, None, "header is not valid UTF-8").await;
                return;
            }
        };

        let header = match decode_header(header_str) {
            Ok(h) => h,
            Err(e) => {
                self.reply_malformed(service_id, None, e.to_string()).await;
                return;
            }
        };

        let payload = match decode_payload(payload_bytes, self.config.message_payload_max_length, header.action) {
            Ok(p) => p,
            Err(e) => {
                self.reply_malformed(service_id, Some(&header), e.to_string()).await;
                return;
            }
        };

        self.router.route(service_id, header, payload).await;
    }

    async fn reply_malformed(&self, to: &str, header: Option<&Header>, message: impl Into<String>) {
        let response_header = match header {
            Some(h) => h.response_to(h.topic.clone()),
            None => Header {
                action: Action::Response,
                topic: "error".to_string(),
                version: mb_core::Version::new(1, 0, 0),
                request_id: None,
                parent_request_id: None,
                timeout: None,
            },
        };
        let payload = ErrorPayload::new(ErrorCode::MalformedMessage, message).to_value();
        let _ = self.send_message(to, response_header, payload).await;
    }

    pub async fn active_connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Close every live connection and tear down its registry/subscription
    /// bookkeeping. Used during broker shutdown.
    pub async fn dispose(&self) {
        let ids: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        for id in ids {
            self.remove_connection(&id).await;
        }
    }
}
