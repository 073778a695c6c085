//! Message router (§4.7): PUBLISH fan-out, REQUEST/RESPONSE correlation,
//! timeouts, and rate limiting.
//!
//! Like [`crate::registry::ServiceRegistry`], the router needs a back
//! reference to the connection manager to actually deliver messages, but is
//! constructed before it (§4.9) — so it holds a [`Weak`] back-edge set
//! post-construction, and likewise for the service registry it forwards
//! `system.*` traffic to.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use mb_core::{Action, ErrorCode, ErrorPayload, Header};
use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::conn_manager::ConnectionManager;
use crate::monitoring::{MetricKind, MonitoringManager};
use crate::registry::ServiceRegistry;
use crate::subscription::SubscriptionManager;

struct PendingRequest {
    origin_service_id: String,
    target_service_id: String,
    timeout_task: JoinHandle<()>,
}

/// Per-key (service, or topic) request counters reset every second — used
/// for the rate-limit knobs in [`BrokerConfig`].
struct RateLimiter {
    windows: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `key` is still within `limit` requests/second.
    async fn check(&self, key: &str, limit: u32) -> bool {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= Duration::from_secs(1) {
            *entry = (now, 0);
        }
        if entry.1 >= limit {
            false
        } else {
            entry.1 += 1;
            true
        }
    }
}

pub struct MessageRouter {
    subscriptions: Arc<SubscriptionManager>,
    monitoring: Arc<MonitoringManager>,
    config: BrokerConfig,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    outstanding_per_service: Mutex<HashMap<String, usize>>,
    round_robin: Mutex<HashMap<String, usize>>,
    rate_limiter: RateLimiter,
    connection_manager: OnceLock<Weak<ConnectionManager>>,
    service_registry: OnceLock<Weak<ServiceRegistry>>,

    noroute_publish: Arc<crate::monitoring::Metric>,
    request_timeout: Arc<crate::monitoring::Metric>,
    response_orphan: Arc<crate::monitoring::Metric>,
    response_mismatch: Arc<crate::monitoring::Metric>,
    requests_routed: Arc<crate::monitoring::Metric>,
    publishes_routed: Arc<crate::monitoring::Metric>,
}

impl MessageRouter {
    pub fn new(config: BrokerConfig, monitoring: Arc<MonitoringManager>, subscriptions: Arc<SubscriptionManager>) -> Arc<Self> {
        let noroute_publish = monitoring.register_metric_idempotent("router.noroute.publish", MetricKind::Rate);
        let request_timeout = monitoring.register_metric_idempotent("router.request.timeout", MetricKind::Rate);
        let response_orphan = monitoring.register_metric_idempotent("router.response.orphan", MetricKind::Rate);
        let response_mismatch = monitoring.register_metric_idempotent("router.response.mismatch", MetricKind::Rate);
        let requests_routed = monitoring.register_metric_idempotent("router.request.count", MetricKind::Rate);
        let publishes_routed = monitoring.register_metric_idempotent("router.publish.count", MetricKind::Rate);

        Arc::new(Self {
            subscriptions,
            monitoring,
            config,
            pending: Mutex::new(HashMap::new()),
            outstanding_per_service: Mutex::new(HashMap::new()),
            round_robin: Mutex::new(HashMap::new()),
            rate_limiter: RateLimiter::new(),
            connection_manager: OnceLock::new(),
            service_registry: OnceLock::new(),
            noroute_publish,
            request_timeout,
            response_orphan,
            response_mismatch,
            requests_routed,
            publishes_routed,
        })
    }

    pub fn set_connection_manager(&self, cm: Weak<ConnectionManager>) {
        let _ = self.connection_manager.set(cm);
    }

    pub fn set_service_registry(&self, registry: Weak<ServiceRegistry>) {
        let _ = self.service_registry.set(registry);
    }

    fn connection_manager(&self) -> Option<Arc<ConnectionManager>> {
        self.connection_manager.get()?.upgrade()
    }

    fn service_registry(&self) -> Option<Arc<ServiceRegistry>> {
        self.service_registry.get()?.upgrade()
    }

    async fn reply(&self, to: &str, header: &Header, payload: Value) {
        if let Some(cm) = self.connection_manager() {
            let response = header.response_to(header.topic.clone());
            let _ = cm.send_message(to, response, payload).await;
        }
    }

    async fn reply_error(&self, to: &str, header: &Header, code: ErrorCode, message: impl Into<String>) {
        self.reply(to, header, ErrorPayload::new(code, message).to_value()).await;
    }

    /// Entry point for every message a connection sends once framed and
    /// decoded: dispatches on topic prefix, then action.
    pub async fn route(self: &Arc<Self>, from: &str, header: Header, payload: Value) {
        if mb_core::topic::is_system_topic(&header.topic) {
            if let Some(registry) = self.service_registry() {
                registry.handle(from, header, payload).await;
            }
            return;
        }

        match header.action {
            Action::Publish => self.route_publish(from, header, payload).await,
            Action::Request => self.route_request(from, header, payload).await,
            Action::Response => self.route_response(from, header, payload).await,
        }
    }

    async fn route_publish(&self, from: &str, header: Header, payload: Value) {
        let targets: Vec<String> = self
            .subscriptions
            .get_subscribers(&header.topic)
            .into_iter()
            .filter(|id| id != from)
            .collect();

        if targets.is_empty() {
            self.noroute_publish.add(1.0);
            return;
        }

        self.publishes_routed.add(1.0);
        let Some(cm) = self.connection_manager() else { return };
        for target in targets {
            let _ = cm.send_message(&target, header.clone(), payload.clone()).await;
        }
    }

    async fn route_request(self: &Arc<Self>, from: &str, header: Header, payload: Value) {
        let Some(request_id) = header.request_id else {
            self.reply_error(from, &header, ErrorCode::InvalidRequest, "request requires a requestid")
                .await;
            return;
        };

        if self.pending.lock().await.contains_key(&request_id) {
            self.reply_error(from, &header, ErrorCode::InvalidRequest, "duplicate requestid")
                .await;
            return;
        }

        if let Some(limit) = self.config.rate_limit_global_per_service {
            if !self.rate_limiter.check(&format!("service:{from}"), limit).await {
                self.reply_error(from, &header, ErrorCode::ServiceUnavailable, "rate limit exceeded")
                    .await;
                return;
            }
        }
        if let Some(limit) = self.config.rate_limit_global_per_topic {
            if !self
                .rate_limiter
                .check(&format!("topic:{}", header.topic), limit)
                .await
            {
                self.reply_error(from, &header, ErrorCode::ServiceUnavailable, "rate limit exceeded")
                    .await;
                return;
            }
        }
        if let Some(limit) = self.config.rate_limit_topic_per_service.get(&header.topic).copied() {
            if !self
                .rate_limiter
                .check(&format!("topic:{}:service:{from}", header.topic), limit)
                .await
            {
                self.reply_error(from, &header, ErrorCode::ServiceUnavailable, "rate limit exceeded")
                    .await;
                return;
            }
        }

        {
            let mut outstanding = self.outstanding_per_service.lock().await;
            let count = outstanding.entry(from.to_string()).or_insert(0);
            if *count >= self.config.max_outstanding_requests {
                self.reply_error(
                    from,
                    &header,
                    ErrorCode::ServiceUnavailable,
                    "too many outstanding requests",
                )
                .await;
                return;
            }
            *count += 1;
        }

        let candidates: Vec<String> = self
            .subscriptions
            .get_top_subscribers(&header.topic)
            .into_iter()
            .filter(|id| id != from)
            .collect();

        if candidates.is_empty() {
            self.release_outstanding(from).await;
            self.reply_error(from, &header, ErrorCode::NoRouteFound, "no subscriber for topic")
                .await;
            return;
        }

        let target = self.pick_target(&header.topic, &candidates).await;

        let effective_timeout_ms = header
            .timeout
            .unwrap_or(self.config.request_response_timeout_default.as_millis() as u32)
            .min(self.config.request_response_timeout_max.as_millis() as u32);

        let Some(cm) = self.connection_manager() else {
            self.release_outstanding(from).await;
            return;
        };

        if cm.send_message(&target, header.clone(), payload.clone()).await.is_err() {
            self.release_outstanding(from).await;
            self.reply_error(
                from,
                &header,
                ErrorCode::ServiceUnavailable,
                "target connection is not available",
            )
            .await;
            return;
        }

        self.requests_routed.add(1.0);

        let router = self.clone();
        let origin = from.to_string();
        let timeout_header = header.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(effective_timeout_ms as u64)).await;
            router.fire_timeout(request_id, &origin, &timeout_header).await;
        });

        self.pending.lock().await.insert(
            request_id,
            PendingRequest {
                origin_service_id: from.to_string(),
                target_service_id: target,
                timeout_task,
            },
        );
    }

    async fn release_outstanding(&self, service_id: &str) {
        let mut outstanding = self.outstanding_per_service.lock().await;
        if let Some(count) = outstanding.get_mut(service_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// Round-robin among tied top-priority candidates, with a random
    /// fallback when the stored rotation index has gone stale (candidate
    /// set membership changed since last use).
    async fn pick_target(&self, topic: &str, candidates: &[String]) -> String {
        if candidates.len() == 1 {
            return candidates[0].clone();
        }
        let mut rr = self.round_robin.lock().await;
        let idx = *rr.get(topic).unwrap_or(&0);
        let chosen_idx = if idx < candidates.len() {
            idx
        } else {
            rand::thread_rng().gen_range(0..candidates.len())
        };
        rr.insert(topic.to_string(), (chosen_idx + 1) % candidates.len());
        candidates[chosen_idx].clone()
    }

    async fn fire_timeout(self: Arc<Self>, request_id: Uuid, origin: &str, header: &Header) {
        let removed = self.pending.lock().await.remove(&request_id);
        if removed.is_none() {
            // RESPONSE arrived first; this firing is a no-op.
            return;
        }
        self.release_outstanding(origin).await;
        self.request_timeout.add(1.0);
        self.reply_error(origin, header, ErrorCode::Timeout, "request timed out").await;
    }

    async fn route_response(&self, from: &str, header: Header, payload: Value) {
        let Some(request_id) = header.request_id else {
            self.response_orphan.add(1.0);
            return;
        };

        let pending = self.pending.lock().await.remove(&request_id);
        let Some(pending) = pending else {
            self.response_orphan.add(1.0);
            return;
        };
        pending.timeout_task.abort();

        if pending.target_service_id != from {
            self.response_mismatch.add(1.0);
            return;
        }

        self.release_outstanding(&pending.origin_service_id).await;

        if let Some(cm) = self.connection_manager() {
            let _ = cm
                .send_message(&pending.origin_service_id, header, payload)
                .await;
        }
    }

    /// Cancel every outstanding timeout without replying to any of them.
    /// Called during broker shutdown.
    pub async fn dispose(&self) {
        let mut pending = self.pending.lock().await;
        for (_, p) in pending.drain() {
            p.timeout_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_router() -> Arc<MessageRouter> {
        let monitoring = Arc::new(MonitoringManager::new());
        let subscriptions = Arc::new(SubscriptionManager::new());
        MessageRouter::new(BrokerConfig::default(), monitoring, subscriptions)
    }

    #[tokio::test]
    async fn pick_target_single_candidate_is_trivial() {
        let router = make_router();
        let target = router.pick_target("a.b", &["only".to_string()]).await;
        assert_eq!(target, "only");
    }

    #[tokio::test]
    async fn pick_target_round_robins() {
        let router = make_router();
        let candidates = vec!["s1".to_string(), "s2".to_string()];
        let first = router.pick_target("a.b", &candidates).await;
        let second = router.pick_target("a.b", &candidates).await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn rate_limiter_caps_within_window() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("svc", 2).await);
        assert!(limiter.check("svc", 2).await);
        assert!(!limiter.check("svc", 2).await);
    }

    #[tokio::test]
    async fn dispose_cancels_pending_timeouts() {
        let router = make_router();
        let id = Uuid::new_v4();
        let task = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(60)).await });
        router.pending.lock().await.insert(
            id,
            PendingRequest {
                origin_service_id: "a".to_string(),
                target_service_id: "b".to_string(),
                timeout_task: task,
            },
        );
        router.dispose().await;
        assert!(router.pending.lock().await.is_empty());
    }
}
