//! Service registry and `system.*` control plane (§4.6).
//!
//! Every connection is registered here under a `serviceId` the moment it's
//! accepted. The registry arms a heartbeat timer per service and answers
//! the handful of `system.*` request topics clients use to register
//! metadata, manage subscriptions, and pull metrics.
//!
//! The registry needs to ask the connection manager to drop a connection
//! when its heartbeat lapses, but the connection manager is constructed
//! *after* the registry (§4.9's assembly order) — so, like the router, it
//! holds a [`Weak`] back-reference installed post-construction rather than
//! an owning one, breaking the would-be reference cycle (§9).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use mb_core::{Action, ErrorCode, ErrorPayload, Header};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::sync::Mutex;

use crate::config::BrokerConfig;
use crate::conn_manager::ConnectionManager;
use crate::monitoring::{MetricKind, MonitoringManager};
use crate::subscription::SubscriptionManager;

struct ServiceEntry {
    id: String,
    name: Option<String>,
    description: Option<String>,
    connected_at: DateTime<Utc>,
    heartbeat_task: JoinHandle<()>,
}

pub struct ServiceRegistry {
    services: Mutex<HashMap<String, ServiceEntry>>,
    config: BrokerConfig,
    monitoring: Arc<MonitoringManager>,
    subscriptions: Arc<SubscriptionManager>,
    connection_manager: OnceLock<Weak<ConnectionManager>>,
    services_registered: Arc<crate::monitoring::Metric>,
    heartbeat_timeouts: Arc<crate::monitoring::Metric>,
}

impl ServiceRegistry {
    pub fn new(
        config: BrokerConfig,
        monitoring: Arc<MonitoringManager>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Arc<Self> {
        let services_registered =
            monitoring.register_metric_idempotent("registry.service.registered", MetricKind::Rate);
        let heartbeat_timeouts =
            monitoring.register_metric_idempotent("registry.heartbeat.timeout", MetricKind::Rate);
        Arc::new(Self {
            services: Mutex::new(HashMap::new()),
            config,
            monitoring,
            subscriptions,
            connection_manager: OnceLock::new(),
            services_registered,
            heartbeat_timeouts,
        })
    }

    /// Install the (weak) back-reference to the connection manager. Called
    /// once by the broker assembly right after the connection manager is
    /// constructed.
    pub fn set_connection_manager(&self, cm: Weak<ConnectionManager>) {
        let _ = self.connection_manager.set(cm);
    }

    fn connection_manager(&self) -> Option<Arc<ConnectionManager>> {
        self.connection_manager.get()?.upgrade()
    }

    /// Register a newly accepted connection under `service_id`, arming its
    /// heartbeat timer. Idempotent: re-registering an id just rearms it.
    pub async fn register_service(self: &Arc<Self>, service_id: String) {
        self.services_registered.add(1.0);
        let entry_exists = self.services.lock().await.contains_key(&service_id);
        if !entry_exists {
            let heartbeat_task = self.spawn_heartbeat_timer(service_id.clone());
            self.services.lock().await.insert(
                service_id.clone(),
                ServiceEntry {
                    id: service_id,
                    name: None,
                    description: None,
                    connected_at: Utc::now(),
                    heartbeat_task,
                },
            );
        } else {
            self.rearm(&service_id).await;
        }
    }

    /// Remove `service_id`'s registry bookkeeping. Idempotent. Does not
    /// itself touch connections or subscriptions — the connection manager
    /// orchestrates the full teardown and calls this as one step of it.
    pub async fn unregister_service(&self, service_id: &str) {
        if let Some(entry) = self.services.lock().await.remove(service_id) {
            entry.heartbeat_task.abort();
        }
    }

    fn spawn_heartbeat_timer(self: &Arc<Self>, service_id: String) -> JoinHandle<()> {
        let registry = self.clone();
        let retry = self.config.connection_heartbeat_retry_timeout;
        let deregister = self.config.connection_heartbeat_deregister_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(retry).await;
            registry.send_heartbeat_probe(&service_id).await;
            let remaining = deregister.saturating_sub(retry);
            tokio::time::sleep(remaining).await;
            registry.heartbeat_timeouts.add(1.0);
            if let Some(cm) = registry.connection_manager() {
                cm.remove_connection(&service_id).await;
            }
        })
    }

    async fn rearm(self: &Arc<Self>, service_id: &str) {
        let new_task = self.spawn_heartbeat_timer(service_id.to_string());
        if let Some(entry) = self.services.lock().await.get_mut(service_id) {
            entry.heartbeat_task.abort();
            entry.heartbeat_task = new_task;
        } else {
            new_task.abort();
        }
    }

    async fn send_heartbeat_probe(&self, service_id: &str) {
        if let Some(cm) = self.connection_manager() {
            let header = Header {
                action: Action::Request,
                topic: "system.heartbeat".to_string(),
                version: mb_core::Version::new(1, 0, 0),
                request_id: Some(uuid::Uuid::new_v4()),
                parent_request_id: None,
                timeout: None,
            };
            let _ = cm.send_message(service_id, header, json!({})).await;
        }
    }

    async fn reply(&self, to: &str, header: &Header, payload: Value) {
        if let Some(cm) = self.connection_manager() {
            let response = header.response_to(header.topic.clone());
            let _ = cm.send_message(to, response, payload).await;
        }
    }

    async fn reply_error(&self, to: &str, header: &Header, code: ErrorCode, message: impl Into<String>) {
        self.reply(to, header, ErrorPayload::new(code, message).to_value())
            .await;
    }

    /// Handle a message addressed to a `system.*` topic (§4.6). Any action
    /// other than `Request` is rejected with `INVALID_REQUEST`, except a
    /// bare heartbeat `Response` (the reply to our own probe), which simply
    /// rearms the timer with no further reply.
    pub async fn handle(self: &Arc<Self>, from: &str, header: Header, payload: Value) {
        if header.topic == "system.heartbeat" && header.action == Action::Response {
            self.rearm(from).await;
            return;
        }
        if header.action != Action::Request {
            self.reply_error(
                from,
                &header,
                ErrorCode::InvalidRequest,
                "system topics only accept request/response actions",
            )
            .await;
            return;
        }

        match header.topic.as_str() {
            "system.heartbeat" => self.handle_heartbeat(from, &header).await,
            "system.service.register" => self.handle_register(from, &header, &payload).await,
            "system.service.list" => self.handle_service_list(from, &header).await,
            "system.topic.subscribe" => self.handle_topic_subscribe(from, &header, &payload).await,
            "system.topic.unsubscribe" => self.handle_topic_unsubscribe(from, &header, &payload).await,
            "system.topic.list" => self.handle_topic_list(from, &header).await,
            "system.log.subscribe" | "system.log.unsubscribe" => {
                // Accepted and acknowledged; this core does not implement a
                // log fan-out pipeline (see DESIGN.md).
                self.rearm(from).await;
                self.reply(from, &header, json!({"status": "success"})).await;
            }
            "system.metrics" => self.handle_metrics(from, &header, &payload).await,
            _ => {
                self.reply_error(from, &header, ErrorCode::TopicNotSupported, "unknown system topic")
                    .await;
            }
        }
    }

    async fn handle_heartbeat(self: &Arc<Self>, from: &str, header: &Header) {
        self.rearm(from).await;
        self.reply(from, header, json!({"status": "success"})).await;
    }

    async fn handle_register(self: &Arc<Self>, from: &str, header: &Header, payload: &Value) {
        let name = payload.get("name").and_then(Value::as_str);
        let description = payload.get("description").and_then(Value::as_str);
        if name.is_none() && description.is_none() {
            self.reply_error(
                from,
                header,
                ErrorCode::InvalidRequest,
                "expected at least one of 'name' or 'description'",
            )
            .await;
            return;
        }
        let mut services = self.services.lock().await;
        if let Some(entry) = services.get_mut(from) {
            if let Some(n) = name {
                entry.name = Some(n.to_string());
            }
            if let Some(d) = description {
                entry.description = Some(d.to_string());
            }
        }
        drop(services);
        self.rearm(from).await;
        self.reply(from, header, json!({"status": "success"})).await;
    }

    async fn handle_service_list(self: &Arc<Self>, from: &str, header: &Header) {
        let services = self.services.lock().await;
        let list: Vec<Value> = services
            .values()
            .map(|e| {
                json!({
                    "id": e.id,
                    "name": e.name,
                    "description": e.description,
                    "connectedAt": e.connected_at,
                })
            })
            .collect();
        drop(services);
        self.rearm(from).await;
        self.reply(from, header, json!({"services": list})).await;
    }

    async fn handle_topic_subscribe(self: &Arc<Self>, from: &str, header: &Header, payload: &Value) {
        let Some(topic) = payload.get("topic").and_then(Value::as_str) else {
            self.reply_error(from, header, ErrorCode::InvalidRequest, "missing 'topic' field")
                .await;
            return;
        };
        if mb_core::topic::is_system_topic(&topic.to_ascii_lowercase()) {
            self.reply_error(
                from,
                header,
                ErrorCode::InvalidRequest,
                "subscribing to system.* topics is not permitted",
            )
            .await;
            return;
        }
        let priority = match payload.get("priority") {
            None => Some(0i64),
            Some(v) => v.as_i64(),
        };
        let Some(priority) = priority else {
            self.reply_error(from, header, ErrorCode::InvalidRequest, "'priority' must be an integer")
                .await;
            return;
        };
        let ok = self.subscriptions.subscribe(from, topic, priority);
        self.rearm(from).await;
        self.reply(from, header, json!({"status": if ok {"success"} else {"failure"}}))
            .await;
    }

    async fn handle_topic_unsubscribe(self: &Arc<Self>, from: &str, header: &Header, payload: &Value) {
        let Some(topic) = payload.get("topic").and_then(Value::as_str) else {
            self.reply_error(from, header, ErrorCode::InvalidRequest, "missing 'topic' field")
                .await;
            return;
        };
        let ok = self.subscriptions.unsubscribe(from, Some(topic));
        self.rearm(from).await;
        self.reply(from, header, json!({"status": if ok {"success"} else {"failure"}}))
            .await;
    }

    async fn handle_topic_list(self: &Arc<Self>, from: &str, header: &Header) {
        let topics = self.subscriptions.get_all_subscribed_topics();
        self.rearm(from).await;
        self.reply(from, header, json!({"topics": topics})).await;
    }

    async fn handle_metrics(self: &Arc<Self>, from: &str, header: &Header, payload: &Value) {
        let show_all = payload.get("showAll").and_then(Value::as_bool).unwrap_or(false);
        let filter: Option<Vec<(String, String)>> = payload.get("filter").and_then(Value::as_object).map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        });
        let metrics = self.monitoring.serialize_metrics(show_all, filter.as_deref());
        self.rearm(from).await;
        self.reply(from, header, metrics).await;
    }

    /// Every currently registered service id, for diagnostics/tests.
    pub async fn service_ids(&self) -> Vec<String> {
        self.services.lock().await.keys().cloned().collect()
    }

    /// Abort every outstanding heartbeat timer and forget every service
    /// entry. Used during broker shutdown, after connections have already
    /// been closed.
    pub async fn dispose(&self) {
        for (_, entry) in self.services.lock().await.drain() {
            entry.heartbeat_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Arc<ServiceRegistry> {
        let monitoring = Arc::new(MonitoringManager::new());
        let subscriptions = Arc::new(SubscriptionManager::new());
        ServiceRegistry::new(BrokerConfig::default(), monitoring, subscriptions)
    }

    #[tokio::test]
    async fn register_is_idempotent_and_tracked() {
        let registry = test_registry();
        registry.register_service("svc-1".to_string()).await;
        registry.register_service("svc-1".to_string()).await;
        assert_eq!(registry.service_ids().await, vec!["svc-1".to_string()]);
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let registry = test_registry();
        registry.register_service("svc-1".to_string()).await;
        registry.unregister_service("svc-1").await;
        assert!(registry.service_ids().await.is_empty());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = test_registry();
        registry.unregister_service("nonexistent").await;
    }
}
