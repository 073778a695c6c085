//! Broker configuration (§6, §10.3).
//!
//! `BrokerConfig` is a plain, `Clone`, `Debug` struct matching §6's
//! recognized options. Loading from YAML is out of scope for this crate
//! (§1) — callers build this value however they like (defaults, a config
//! file they parse themselves, env vars) and hand it to [`crate::Broker`]
//! by value. [`BrokerConfig::apply_env_overrides`] is the one override
//! step this crate performs itself, reading same-named environment
//! variables, analogous to how `RUST_LOG` overrides the ambient log level.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Listener ports for each of the four transport combinations. `None`
/// disables that listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortsConfig {
    pub tcp: Option<u16>,
    pub tls: Option<u16>,
    pub ws: Option<u16>,
    pub wss: Option<u16>,
}

/// Paths to a PEM-encoded certificate chain and private key, used when
/// `tls` or `wss` is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslConfig {
    pub key: PathBuf,
    pub cert: PathBuf,
}

/// Plain configuration struct supplied at broker construction (§1, §6).
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    pub ports: PortsConfig,
    pub ssl: Option<SslConfig>,
    /// Whether an insecure (non-TLS) listener may be started at all.
    pub allow_unsecure: bool,

    pub message_payload_max_length: usize,

    pub connection_max_concurrent: usize,
    pub connection_heartbeat_retry_timeout: Duration,
    pub connection_heartbeat_deregister_timeout: Duration,

    pub request_response_timeout_default: Duration,
    pub request_response_timeout_max: Duration,

    pub max_outstanding_requests: usize,

    pub rate_limit_global_per_service: Option<u32>,
    pub rate_limit_global_per_topic: Option<u32>,
    pub rate_limit_topic_per_service: HashMap<String, u32>,

    /// Reserved; not used by the core (§6).
    pub auth_failure_lockout_threshold: Option<u32>,
    pub auth_failure_lockout_duration: Duration,

    /// Rate-slot tick period for the monitoring manager (§6
    /// `monitoring.interval`, milliseconds). Wired to
    /// `MonitoringManager::with_interval` at broker assembly.
    pub monitoring_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            ports: PortsConfig::default(),
            ssl: None,
            allow_unsecure: true,
            message_payload_max_length: 1024 * 1024,
            connection_max_concurrent: 10_000,
            connection_heartbeat_retry_timeout: Duration::from_secs(20),
            connection_heartbeat_deregister_timeout: Duration::from_secs(60),
            request_response_timeout_default: Duration::from_secs(30),
            request_response_timeout_max: Duration::from_secs(300),
            max_outstanding_requests: 1000,
            rate_limit_global_per_service: None,
            rate_limit_global_per_topic: None,
            rate_limit_topic_per_service: HashMap::new(),
            auth_failure_lockout_threshold: None,
            auth_failure_lockout_duration: Duration::from_secs(300),
            monitoring_interval: Duration::from_millis(1000),
        }
    }
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_millis)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl BrokerConfig {
    /// Apply same-named environment variable overrides (§6's last bullet).
    /// Unset variables leave the existing value untouched.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("MB_HOST") {
            self.host = host;
        }
        if let Some(v) = env_u16("MB_PORTS_TCP") {
            self.ports.tcp = Some(v);
        }
        if let Some(v) = env_u16("MB_PORTS_TLS") {
            self.ports.tls = Some(v);
        }
        if let Some(v) = env_u16("MB_PORTS_WS") {
            self.ports.ws = Some(v);
        }
        if let Some(v) = env_u16("MB_PORTS_WSS") {
            self.ports.wss = Some(v);
        }
        if let Ok(key) = std::env::var("MB_SSL_KEY") {
            let cert = std::env::var("MB_SSL_CERT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| self.ssl.as_ref().map(|s| s.cert.clone()).unwrap_or_default());
            self.ssl = Some(SslConfig {
                key: PathBuf::from(key),
                cert,
            });
        }
        if let Some(v) = env_bool("MB_ALLOW_UNSECURE") {
            self.allow_unsecure = v;
        }
        if let Some(v) = env_usize("MB_MESSAGE_PAYLOAD_MAXLENGTH") {
            self.message_payload_max_length = v;
        }
        if let Some(v) = env_usize("MB_CONNECTION_MAX_CONCURRENT") {
            self.connection_max_concurrent = v;
        }
        if let Some(v) = env_millis("MB_CONNECTION_HEARTBEATRETRYTIMEOUT") {
            self.connection_heartbeat_retry_timeout = v;
        }
        if let Some(v) = env_millis("MB_CONNECTION_HEARTBEATDEREGISTERTIMEOUT") {
            self.connection_heartbeat_deregister_timeout = v;
        }
        if let Some(v) = env_millis("MB_REQUEST_RESPONSE_TIMEOUT_DEFAULT") {
            self.request_response_timeout_default = v;
        }
        if let Some(v) = env_millis("MB_REQUEST_RESPONSE_TIMEOUT_MAX") {
            self.request_response_timeout_max = v;
        }
        if let Some(v) = env_usize("MB_MAX_OUTSTANDING_REQUESTS") {
            self.max_outstanding_requests = v;
        }
        if let Some(v) = env_u32("MB_RATE_LIMIT_GLOBAL_PER_SERVICE") {
            self.rate_limit_global_per_service = Some(v);
        }
        if let Some(v) = env_u32("MB_RATE_LIMIT_GLOBAL_PER_TOPIC") {
            self.rate_limit_global_per_topic = Some(v);
        }
        if let Some(v) = env_millis("MB_MONITORING_INTERVAL") {
            self.monitoring_interval = v;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = BrokerConfig::default();
        assert!(cfg.allow_unsecure);
        assert_eq!(cfg.message_payload_max_length, 1024 * 1024);
        assert!(cfg.request_response_timeout_default < cfg.request_response_timeout_max);
    }

    #[test]
    fn env_override_host() {
        std::env::set_var("MB_HOST", "127.0.0.1");
        let cfg = BrokerConfig::default().apply_env_overrides();
        assert_eq!(cfg.host, "127.0.0.1");
        std::env::remove_var("MB_HOST");
    }

    #[test]
    fn env_override_leaves_unset_keys_alone() {
        std::env::remove_var("MB_PORTS_TCP");
        let cfg = BrokerConfig::default().apply_env_overrides();
        assert_eq!(cfg.ports.tcp, None);
    }
}
