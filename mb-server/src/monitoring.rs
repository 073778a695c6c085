//! Monitoring substrate (§4.8): a hierarchical metric registry used by
//! every other broker component to publish counters and gauges, queried
//! back out through `system.metrics`.
//!
//! Two kinds of entries live in the registry:
//!
//! - Flat metrics, registered once under a fixed canonical name
//!   (`connection.active`, `router.request.timeout`, ...).
//! - Parameterized templates (`router.topic.{topic}.requests`), which
//!   dispense concrete child [`Metric`]s on demand, one per distinct set of
//!   parameter bindings.
//!
//! Every metric is one of the [`MetricKind`] slot kinds, each with its own
//! add/set/value/reset semantics. `Rate` slots share a single ticker owned
//! by the [`MonitoringManager`] rather than spawning one task per slot; its
//! period defaults to [`RATE_TICK_INTERVAL`] but the broker assembly wires
//! it to `BrokerConfig::monitoring_interval` via
//! [`MonitoringManager::with_interval`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

/// Maximum number of dot-separated segments in a metric name, matching the
/// topic-shape constraint metric names are held to (§4.8).
pub const MAX_METRIC_DEPTH: usize = 5;
pub const MAX_METRIC_LENGTH: usize = 255;

/// Default `Rate` tick period, used by [`MonitoringManager::new`]. The
/// broker assembly instead calls [`MonitoringManager::with_interval`] with
/// `BrokerConfig::monitoring_interval`.
const RATE_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The kind of a metric slot, governing its add/set/value/reset semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Arbitrary numeric value, set or incremented directly.
    Gauge,
    /// A [0, 1]-constrained gauge; `set` outside that range is rejected.
    Percent,
    /// Accumulates `add`s into a current bucket; `value` reports the
    /// previous completed 1-second bucket.
    Rate,
    /// Seconds elapsed since the slot was started (or reset).
    Uptime,
    /// Smallest value ever `add`ed.
    Minimum,
    /// Largest value ever `add`ed.
    Maximum,
    /// Running mean of every value `add`ed.
    Average,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Percent => "percent",
            MetricKind::Rate => "rate",
            MetricKind::Uptime => "uptime",
            MetricKind::Minimum => "minimum",
            MetricKind::Maximum => "maximum",
            MetricKind::Average => "average",
        }
    }
}

#[derive(Debug)]
enum SlotState {
    Gauge {
        value: f64,
    },
    Percent {
        value: f64,
    },
    Rate {
        current: f64,
        last_interval: f64,
    },
    Uptime {
        started_at: Instant,
        frozen: Option<f64>,
    },
    Minimum {
        value: Option<f64>,
    },
    Maximum {
        value: Option<f64>,
    },
    Average {
        sum: f64,
        count: u64,
    },
}

/// A single metric slot: a name, a kind, and mutable numeric state.
#[derive(Debug)]
pub struct Metric {
    name: String,
    kind: MetricKind,
    state: Mutex<SlotState>,
    last_modified: Mutex<DateTime<Utc>>,
}

impl Metric {
    fn new(name: String, kind: MetricKind) -> Self {
        let state = match kind {
            MetricKind::Gauge => SlotState::Gauge { value: 0.0 },
            MetricKind::Percent => SlotState::Percent { value: 0.0 },
            MetricKind::Rate => SlotState::Rate {
                current: 0.0,
                last_interval: 0.0,
            },
            MetricKind::Uptime => SlotState::Uptime {
                started_at: Instant::now(),
                frozen: None,
            },
            MetricKind::Minimum => SlotState::Minimum { value: None },
            MetricKind::Maximum => SlotState::Maximum { value: None },
            MetricKind::Average => SlotState::Average { sum: 0.0, count: 0 },
        };
        Self {
            name,
            kind,
            state: Mutex::new(state),
            last_modified: Mutex::new(Utc::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    fn touch(&self) {
        *self.last_modified.lock().unwrap() = Utc::now();
    }

    /// Set a gauge or percent slot directly. Returns `false` (no-op) for
    /// slot kinds that don't support `set`, or when a percent value falls
    /// outside `[0, 1]`.
    pub fn set(&self, n: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            SlotState::Gauge { value } => {
                *value = n;
            }
            SlotState::Percent { value } => {
                if !(0.0..=1.0).contains(&n) {
                    return false;
                }
                *value = n;
            }
            _ => return false,
        }
        drop(state);
        self.touch();
        true
    }

    /// Accumulate `n` into the slot: adds to a gauge/percent/rate/average,
    /// compares-and-updates a minimum/maximum. No-op for `Uptime`.
    pub fn add(&self, n: f64) {
        let mut state = self.state.lock().unwrap();
        let mut changed = true;
        match &mut *state {
            SlotState::Gauge { value } => *value += n,
            SlotState::Percent { value } => *value = (*value + n).clamp(0.0, 1.0),
            SlotState::Rate { current, .. } => *current += n,
            SlotState::Minimum { value } => match value {
                Some(v) if *v <= n => changed = false,
                _ => *value = Some(n),
            },
            SlotState::Maximum { value } => match value {
                Some(v) if *v >= n => changed = false,
                _ => *value = Some(n),
            },
            SlotState::Average { sum, count } => {
                *sum += n;
                *count += 1;
            }
            SlotState::Uptime { .. } => changed = false,
        }
        drop(state);
        if changed {
            self.touch();
        }
    }

    /// The slot's current reportable value.
    pub fn value(&self) -> f64 {
        let state = self.state.lock().unwrap();
        match &*state {
            SlotState::Gauge { value } => *value,
            SlotState::Percent { value } => *value,
            SlotState::Rate { last_interval, .. } => *last_interval,
            SlotState::Uptime { started_at, frozen } => match frozen {
                Some(v) => *v,
                None => started_at.elapsed().as_secs_f64().max(0.0).floor(),
            },
            SlotState::Minimum { value } => value.unwrap_or(0.0),
            SlotState::Maximum { value } => value.unwrap_or(0.0),
            SlotState::Average { sum, count } => {
                if *count == 0 {
                    0.0
                } else {
                    *sum / *count as f64
                }
            }
        }
    }

    /// For `Rate` slots, the value accumulated in the current (incomplete)
    /// bucket, not yet rotated into `value()`. Equal to `value()` for every
    /// other kind.
    pub fn accumulated_value(&self) -> f64 {
        let is_rate_current = {
            let state = self.state.lock().unwrap();
            match &*state {
                SlotState::Rate { current, .. } => Some(*current),
                _ => None,
            }
        };
        is_rate_current.unwrap_or_else(|| self.value())
    }

    /// Reset the slot back to its construction-time state (restarting the
    /// clock for `Uptime`).
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = match self.kind {
            MetricKind::Gauge => SlotState::Gauge { value: 0.0 },
            MetricKind::Percent => SlotState::Percent { value: 0.0 },
            MetricKind::Rate => SlotState::Rate {
                current: 0.0,
                last_interval: 0.0,
            },
            MetricKind::Uptime => SlotState::Uptime {
                started_at: Instant::now(),
                frozen: None,
            },
            MetricKind::Minimum => SlotState::Minimum { value: None },
            MetricKind::Maximum => SlotState::Maximum { value: None },
            MetricKind::Average => SlotState::Average { sum: 0.0, count: 0 },
        };
        drop(state);
        self.touch();
    }

    /// Dispose the slot. Only meaningful for `Uptime`, which freezes at its
    /// current value; every other kind is a no-op (the registry is
    /// responsible for actually removing disposed metrics from its maps).
    pub fn dispose(&self) {
        let mut state = self.state.lock().unwrap();
        if let SlotState::Uptime { started_at, frozen } = &mut *state {
            if frozen.is_none() {
                *frozen = Some(started_at.elapsed().as_secs_f64().max(0.0).floor());
            }
        }
    }

    fn tick_rate(&self) {
        let mut state = self.state.lock().unwrap();
        if let SlotState::Rate {
            current,
            last_interval,
        } = &mut *state
        {
            *last_interval = *current;
            *current = 0.0;
        }
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        *self.last_modified.lock().unwrap()
    }

    fn to_full_value(&self) -> Value {
        json!({
            "name": self.name,
            "type": self.kind.as_str(),
            "timestamp": self.last_modified(),
            "value": self.value(),
        })
    }
}

fn split_template(template: &str) -> Vec<String> {
    template.split('.').map(str::to_string).collect()
}

/// Build the concrete name for a parameterized metric: each `{name}`
/// segment becomes `{name:value}` using the supplied bindings, in template
/// order.
fn bind_template(template: &str, params: &[(&str, &str)]) -> Option<String> {
    let lookup: HashMap<&str, &str> = params.iter().copied().collect();
    let mut out = Vec::new();
    for seg in split_template(template) {
        if seg.starts_with('{') && seg.ends_with('}') {
            let name = &seg[1..seg.len() - 1];
            let value = lookup.get(name)?;
            out.push(format!("{{{name}:{value}}}"));
        } else {
            out.push(seg);
        }
    }
    Some(out.join("."))
}

/// A metric template with one or more `{name}` parameter segments,
/// dispensing concrete [`Metric`] children on demand.
pub struct ParameterizedMetric {
    template: String,
    kind: MetricKind,
    children: Mutex<HashMap<String, Arc<Metric>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitoringError {
    #[error("metric name {0:?} is invalid")]
    InvalidName(String),
    #[error("metric {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("template {0:?} is unknown")]
    UnknownTemplate(String),
    #[error("missing binding for template parameter")]
    MissingParameter,
}

impl ParameterizedMetric {
    fn concrete_name(&self, params: &[(&str, &str)]) -> Result<String, MonitoringError> {
        bind_template(&self.template, params).ok_or(MonitoringError::MissingParameter)
    }

    /// Register (or look up, if already present) the child for `params`.
    /// Returns an error only if a *different-kind* child was already
    /// registered under the same concrete name, which cannot currently
    /// happen since a template has one fixed kind — kept for API symmetry
    /// with [`MonitoringManager::register_metric`].
    pub fn register_metric(&self, params: &[(&str, &str)]) -> Result<Arc<Metric>, MonitoringError> {
        let name = self.concrete_name(params)?;
        let mut children = self.children.lock().unwrap();
        if let Some(existing) = children.get(&name) {
            return Ok(existing.clone());
        }
        let metric = Arc::new(Metric::new(name.clone(), self.kind));
        children.insert(name, metric.clone());
        Ok(metric)
    }

    pub fn get_metric(&self, params: &[(&str, &str)]) -> Option<Arc<Metric>> {
        let name = self.concrete_name(params).ok()?;
        self.children.lock().unwrap().get(&name).cloned()
    }

    /// Every child whose concrete name was bound from `partial`'s keys
    /// (values must match too); a subset of `partial` filters the result.
    pub fn filtered_metrics(&self, partial: &[(&str, &str)]) -> Vec<Arc<Metric>> {
        self.children
            .lock()
            .unwrap()
            .values()
            .filter(|m| {
                partial
                    .iter()
                    .all(|(k, v)| m.name.contains(&format!("{{{k}:{v}}}")))
            })
            .cloned()
            .collect()
    }

    pub fn all_metrics(&self) -> Vec<Arc<Metric>> {
        self.children.lock().unwrap().values().cloned().collect()
    }

    pub fn dispose(&self) {
        let mut children = self.children.lock().unwrap();
        for child in children.values() {
            child.dispose();
        }
        children.clear();
    }
}

struct Inner {
    metrics: Mutex<HashMap<String, Arc<Metric>>>,
    templates: Mutex<HashMap<String, Arc<ParameterizedMetric>>>,
    rate_slots: Mutex<Vec<Arc<Metric>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// The broker-wide metric registry (§4.8). Shared via `Arc` by every other
/// component that wants to publish a counter or gauge.
pub struct MonitoringManager {
    inner: Arc<Inner>,
}

impl Default for MonitoringManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitoringManager {
    /// Build a manager whose `Rate` slots rotate once per `RATE_TICK_INTERVAL`
    /// (1s). Equivalent to `with_interval(RATE_TICK_INTERVAL)`; most tests and
    /// call sites that don't care about the tick cadence use this.
    pub fn new() -> Self {
        Self::with_interval(RATE_TICK_INTERVAL)
    }

    /// Build a manager whose `Rate` slots rotate every `interval` (§6's
    /// `monitoring.interval`). The broker assembly wires this to
    /// `BrokerConfig::monitoring_interval`.
    pub fn with_interval(interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            metrics: Mutex::new(HashMap::new()),
            templates: Mutex::new(HashMap::new()),
            rate_slots: Mutex::new(Vec::new()),
            ticker: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let ticker_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                if ticker_inner.disposed.load(Ordering::Relaxed) {
                    break;
                }
                for slot in ticker_inner.rate_slots.lock().unwrap().iter() {
                    slot.tick_rate();
                }
            }
        });
        *inner.ticker.lock().unwrap() = Some(handle);

        Self { inner }
    }

    fn validate_name(name: &str) -> Result<(), MonitoringError> {
        if name.is_empty()
            || name.len() > MAX_METRIC_LENGTH
            || name.split('.').count() > MAX_METRIC_DEPTH
        {
            return Err(MonitoringError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    /// Register a flat (non-parameterized) metric. Errors if the name is
    /// already taken or malformed.
    pub fn register_metric(&self, name: &str, kind: MetricKind) -> Result<Arc<Metric>, MonitoringError> {
        Self::validate_name(name)?;
        let mut metrics = self.inner.metrics.lock().unwrap();
        if metrics.contains_key(name) {
            return Err(MonitoringError::AlreadyRegistered(name.to_string()));
        }
        let metric = Arc::new(Metric::new(name.to_string(), kind));
        metrics.insert(name.to_string(), metric.clone());
        if kind == MetricKind::Rate {
            self.inner.rate_slots.lock().unwrap().push(metric.clone());
        }
        Ok(metric)
    }

    /// Register a flat metric, returning the existing one if already
    /// present instead of erroring. Convenient for component constructors
    /// that register their own counters idempotently.
    pub fn register_metric_idempotent(&self, name: &str, kind: MetricKind) -> Arc<Metric> {
        if let Some(existing) = self.get_metric(name) {
            return existing;
        }
        match self.register_metric(name, kind) {
            Ok(m) => m,
            Err(_) => self.get_metric(name).expect("just raced a concurrent register"),
        }
    }

    pub fn register_template(&self, template: &str, kind: MetricKind) -> Result<Arc<ParameterizedMetric>, MonitoringError> {
        Self::validate_name(template)?;
        let mut templates = self.inner.templates.lock().unwrap();
        if templates.contains_key(template) {
            return Err(MonitoringError::AlreadyRegistered(template.to_string()));
        }
        let parameterized = Arc::new(ParameterizedMetric {
            template: template.to_string(),
            kind,
            children: Mutex::new(HashMap::new()),
        });
        templates.insert(template.to_string(), parameterized.clone());
        Ok(parameterized)
    }

    pub fn register_template_idempotent(&self, template: &str, kind: MetricKind) -> Arc<ParameterizedMetric> {
        if let Some(existing) = self.get_template(template) {
            return existing;
        }
        match self.register_template(template, kind) {
            Ok(t) => t,
            Err(_) => self
                .get_template(template)
                .expect("just raced a concurrent register"),
        }
    }

    pub fn get_metric(&self, name: &str) -> Option<Arc<Metric>> {
        self.inner.metrics.lock().unwrap().get(name).cloned()
    }

    pub fn get_template(&self, template: &str) -> Option<Arc<ParameterizedMetric>> {
        self.inner.templates.lock().unwrap().get(template).cloned()
    }

    /// Track a template-dispensed child as a rate slot so it participates in
    /// the shared ticker. Templates register their own children lazily, so
    /// callers that create `Rate` children through a template should call
    /// this once per new child.
    pub fn track_rate_child(&self, metric: Arc<Metric>) {
        if metric.kind() == MetricKind::Rate {
            self.inner.rate_slots.lock().unwrap().push(metric);
        }
    }

    /// Build the `system.metrics` response payload (§4.6). `show_all=false`
    /// returns a flat `{name: value}` map; `true` returns the full
    /// `{name: {name, type, timestamp, value}}` shape.
    ///
    /// `filter`, if given, is a set of partial parameter bindings matched
    /// against every parameterized template via
    /// [`ParameterizedMetric::filtered_metrics`]; flat metrics are omitted
    /// entirely in that case, since a binding only makes sense against a
    /// template's `{name:value}` segments.
    pub fn serialize_metrics(&self, show_all: bool, filter: Option<&[(String, String)]>) -> Value {
        let mut map = serde_json::Map::new();
        let insert = |map: &mut serde_json::Map<String, Value>, metric: Arc<Metric>| {
            let entry = if show_all { metric.to_full_value() } else { json!(metric.value()) };
            map.insert(metric.name.clone(), entry);
        };

        match filter {
            None => {
                for metric in self.inner.metrics.lock().unwrap().values().cloned().collect::<Vec<_>>() {
                    insert(&mut map, metric);
                }
                for template in self.inner.templates.lock().unwrap().values() {
                    for metric in template.all_metrics() {
                        insert(&mut map, metric);
                    }
                }
            }
            Some(bindings) => {
                let partial: Vec<(&str, &str)> = bindings.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                for template in self.inner.templates.lock().unwrap().values() {
                    for metric in template.filtered_metrics(&partial) {
                        insert(&mut map, metric);
                    }
                }
            }
        }
        Value::Object(map)
    }

    /// Stop the shared rate ticker and dispose every registered parameterized
    /// template's children. Flat metrics are left as-is (their values remain
    /// queryable via `serialize_metrics` until the manager itself is
    /// dropped).
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Relaxed);
        if let Some(handle) = self.inner.ticker.lock().unwrap().take() {
            handle.abort();
        }
        for template in self.inner.templates.lock().unwrap().values() {
            template.dispose();
        }
    }
}

impl Drop for MonitoringManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_set_and_add() {
        let metric = Metric::new("x".into(), MetricKind::Gauge);
        assert!(metric.set(3.0));
        metric.add(2.0);
        assert_eq!(metric.value(), 5.0);
    }

    #[test]
    fn percent_rejects_out_of_range() {
        let metric = Metric::new("x".into(), MetricKind::Percent);
        assert!(!metric.set(1.5));
        assert!(metric.set(0.5));
        assert_eq!(metric.value(), 0.5);
    }

    #[test]
    fn rate_rotates_on_tick() {
        let metric = Metric::new("x".into(), MetricKind::Rate);
        metric.add(4.0);
        assert_eq!(metric.value(), 0.0);
        assert_eq!(metric.accumulated_value(), 4.0);
        metric.tick_rate();
        assert_eq!(metric.value(), 4.0);
        assert_eq!(metric.accumulated_value(), 0.0);
    }

    #[test]
    fn minimum_and_maximum_only_update_on_change() {
        let min = Metric::new("min".into(), MetricKind::Minimum);
        min.add(5.0);
        let before = min.last_modified();
        min.add(10.0); // not smaller, no-op
        assert_eq!(min.value(), 5.0);
        assert_eq!(min.last_modified(), before);
        min.add(1.0);
        assert_eq!(min.value(), 1.0);

        let max = Metric::new("max".into(), MetricKind::Maximum);
        max.add(5.0);
        max.add(1.0);
        assert_eq!(max.value(), 5.0);
        max.add(9.0);
        assert_eq!(max.value(), 9.0);
    }

    #[test]
    fn average_tracks_running_mean() {
        let metric = Metric::new("x".into(), MetricKind::Average);
        metric.add(2.0);
        metric.add(4.0);
        assert_eq!(metric.value(), 3.0);
    }

    #[test]
    fn uptime_grows_and_freezes_on_dispose() {
        let metric = Metric::new("x".into(), MetricKind::Uptime);
        assert_eq!(metric.value(), 0.0);
        metric.dispose();
        let frozen = metric.value();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(metric.value(), frozen);
    }

    #[tokio::test]
    async fn register_metric_rejects_duplicate() {
        let mgr = MonitoringManager::new();
        mgr.register_metric("connection.active", MetricKind::Gauge).unwrap();
        assert!(matches!(
            mgr.register_metric("connection.active", MetricKind::Gauge),
            Err(MonitoringError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn parameterized_template_dispenses_children() {
        let mgr = MonitoringManager::new();
        let template = mgr
            .register_template("router.topic.{topic}.requests", MetricKind::Rate)
            .unwrap();
        let child = template.register_metric(&[("topic", "orders.new")]).unwrap();
        child.add(1.0);
        assert_eq!(
            template
                .get_metric(&[("topic", "orders.new")])
                .unwrap()
                .accumulated_value(),
            1.0
        );
    }

    #[tokio::test]
    async fn serialize_metrics_flat_and_full_shapes() {
        let mgr = MonitoringManager::new();
        let m = mgr.register_metric("x.y", MetricKind::Gauge).unwrap();
        m.set(7.0);
        let flat = mgr.serialize_metrics(false, None);
        assert_eq!(flat["x.y"], json!(7.0));
        let full = mgr.serialize_metrics(true, None);
        assert_eq!(full["x.y"]["value"], json!(7.0));
        assert_eq!(full["x.y"]["type"], json!("gauge"));
    }

    #[tokio::test]
    async fn with_interval_controls_rate_tick_cadence() {
        let mgr = MonitoringManager::with_interval(Duration::from_millis(20));
        let metric = mgr.register_metric("router.fast.rate", MetricKind::Rate).unwrap();
        metric.add(3.0);
        assert_eq!(metric.value(), 0.0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(metric.value(), 3.0, "a short interval should have already rotated the bucket");
    }

    #[tokio::test]
    async fn serialize_metrics_filter_matches_template_bindings_and_drops_flats() {
        let mgr = MonitoringManager::new();
        mgr.register_metric("connection.active", MetricKind::Gauge).unwrap();
        let template = mgr
            .register_template("router.topic.{topic}.requests", MetricKind::Rate)
            .unwrap();
        template.register_metric(&[("topic", "orders.new")]).unwrap();
        template.register_metric(&[("topic", "orders.cancel")]).unwrap();

        let filter = vec![("topic".to_string(), "orders.new".to_string())];
        let filtered = mgr.serialize_metrics(false, Some(&filter));
        let obj = filtered.as_object().unwrap();
        assert!(obj.contains_key("router.topic.{topic:orders.new}.requests"));
        assert!(!obj.contains_key("router.topic.{topic:orders.cancel}.requests"));
        assert!(!obj.contains_key("connection.active"), "flat metrics must be omitted when filter is set");
    }
}
