//! Configuration for the bridge proxy.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};
use crate::model::{BridgeInstance, HomeserverInstance};

/// Proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener settings.
    pub server: ServerSettings,
    /// Appservice registration settings.
    pub appservice: AppserviceSettings,
    /// Outbound call settings.
    pub upstream: UpstreamSettings,
    /// Correlation store settings.
    pub transactions: TransactionSettings,
    /// Bridge registry settings.
    pub registry: RegistrySettings,
    /// Request log settings.
    pub request_log: RequestLogSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
    /// Inline bridge records, used when no registry file is configured.
    pub bridges: Vec<BridgeInstance>,
    /// Inline homeserver records, used when no registry file is configured.
    pub homeservers: Vec<HomeserverInstance>,
}

impl ProxyConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }

    /// Load configuration from a file.
    pub fn from_file(path: impl Into<PathBuf>) -> ProxyResult<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ProxyError::configuration(format!("failed to read config file: {e}")))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match extension {
            "toml" => toml::from_str(&content)
                .map_err(|e| ProxyError::configuration(format!("invalid TOML: {e}"))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| ProxyError::configuration(format!("invalid JSON: {e}"))),
            _ => Err(ProxyError::configuration(format!(
                "unsupported config format: {extension}"
            ))),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Environment variables are prefixed with `BRIDGE_PROXY_` and use
    /// uppercase `snake_case`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("BRIDGE_PROXY_LISTEN_PORT") {
            if let Ok(port) = port.parse() {
                self.server.listen_port = port;
            }
        }

        if let Ok(addr) = std::env::var("BRIDGE_PROXY_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }

        if let Ok(timeout) = std::env::var("BRIDGE_PROXY_UPSTREAM_TIMEOUT") {
            if let Ok(timeout) = duration_format::parse_duration(&timeout) {
                self.upstream.timeout = timeout;
            }
        }

        if let Ok(path) = std::env::var("BRIDGE_PROXY_REGISTRY_PATH") {
            self.registry.path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("BRIDGE_PROXY_REQUEST_LOG_PATH") {
            self.request_log.kind = RequestLogKind::Jsonl;
            self.request_log.path = Some(PathBuf::from(path));
        }

        if let Ok(level) = std::env::var("BRIDGE_PROXY_LOG_LEVEL") {
            self.telemetry.log_level = level;
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ProxyResult<()> {
        let prefix = &self.appservice.namespace_prefix;
        if prefix.is_empty() {
            return Err(ProxyError::configuration("namespace_prefix is required"));
        }
        if !prefix.ends_with("__") || prefix.contains(':') || prefix.contains('@') {
            return Err(ProxyError::configuration(
                "namespace_prefix must end with '__' and contain no '@' or ':'",
            ));
        }

        if self.appservice.id.is_empty() {
            return Err(ProxyError::configuration("appservice id is required"));
        }

        for bridge in &self.bridges {
            validate_url(&bridge.base_url, "bridge", &bridge.bridge_id)?;
            if bridge.bridge_type.contains('_') || bridge.bridge_id.contains('_') {
                return Err(ProxyError::configuration(format!(
                    "bridge {}: bridge_type and bridge_id must not contain '_'",
                    bridge.bridge_id
                )));
            }
        }

        for homeserver in &self.homeservers {
            validate_url(&homeserver.base_url, "homeserver", &homeserver.homeserver_id)?;
        }

        if self.request_log.kind == RequestLogKind::Jsonl && self.request_log.path.is_none() {
            return Err(ProxyError::configuration(
                "request_log.path is required for the jsonl request log",
            ));
        }

        Ok(())
    }
}

fn validate_url(url: &str, kind: &str, id: &str) -> ProxyResult<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ProxyError::configuration(format!(
            "{kind} {id}: base_url must start with http:// or https://"
        )));
    }
    Ok(())
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Port the proxy listens on.
    pub listen_port: u16,
    /// Address to bind to.
    pub listen_addr: String,
    /// Maximum inbound body size in bytes.
    pub max_request_body_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_port: 8090,
            listen_addr: "0.0.0.0".to_string(),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Appservice registration settings shared by every bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppserviceSettings {
    /// Registration id known to the homeserver.
    pub id: String,
    /// Localpart of the appservice sender user.
    pub sender_localpart: String,
    /// Prefix of every encoded user localpart.
    pub namespace_prefix: String,
}

impl Default for AppserviceSettings {
    fn default() -> Self {
        Self {
            id: "bridge_manager_1".to_string(),
            sender_localpart: "_bridge_manager".to_string(),
            namespace_prefix: "_bridge_manager__".to_string(),
        }
    }
}

/// Outbound call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Timeout for a single outbound call.
    #[serde(with = "duration_format")]
    pub timeout: Duration,
    /// Idle connections kept per upstream host.
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Correlation store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// How long a correlation record stays resolvable.
    #[serde(with = "duration_format")]
    pub ttl: Duration,
    /// How often expired records are swept.
    #[serde(with = "duration_format")]
    pub sweep_interval: Duration,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Bridge registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Orchestrator-owned registry file; inline records are used when absent.
    pub path: Option<PathBuf>,
    /// How long a cached lookup is trusted.
    #[serde(with = "duration_format")]
    pub cache_ttl: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            path: None,
            cache_ttl: Duration::from_secs(30),
        }
    }
}

/// Request log backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestLogKind {
    /// Keep rows in process memory.
    #[default]
    Memory,
    /// Append row snapshots to a JSON-lines file.
    Jsonl,
}

/// Request log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLogSettings {
    /// Backend kind.
    pub kind: RequestLogKind,
    /// Output path for the jsonl backend.
    pub path: Option<PathBuf>,
    /// Rows kept in memory for the read path; the oldest are dropped first.
    pub max_rows: usize,
}

impl Default for RequestLogSettings {
    fn default() -> Self {
        Self {
            kind: RequestLogKind::Memory,
            path: None,
            max_rows: 10_000,
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Log filter directive.
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output.
    pub json_logs: bool,
    /// Install the Prometheus recorder.
    pub metrics_enabled: bool,
    /// Service name for telemetry.
    pub service_name: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "bridge_proxy=info,warn".to_string(),
            json_logs: true,
            metrics_enabled: true,
            service_name: "bridge-proxy".to_string(),
        }
    }
}

/// Builder for `ProxyConfig`.
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    /// Set the listen port.
    #[must_use]
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.server.listen_port = port;
        self
    }

    /// Set the listen address.
    #[must_use]
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server.listen_addr = addr.into();
        self
    }

    /// Set the maximum inbound body size.
    #[must_use]
    pub fn max_request_body_size(mut self, size: usize) -> Self {
        self.config.server.max_request_body_size = size;
        self
    }

    /// Set the appservice registration id.
    #[must_use]
    pub fn appservice_id(mut self, id: impl Into<String>) -> Self {
        self.config.appservice.id = id.into();
        self
    }

    /// Set the namespace prefix.
    #[must_use]
    pub fn namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.appservice.namespace_prefix = prefix.into();
        self
    }

    /// Set the outbound timeout.
    #[must_use]
    pub fn upstream_timeout(mut self, timeout: Duration) -> Self {
        self.config.upstream.timeout = timeout;
        self
    }

    /// Set the correlation record TTL.
    #[must_use]
    pub fn transaction_ttl(mut self, ttl: Duration) -> Self {
        self.config.transactions.ttl = ttl;
        self
    }

    /// Set the registry file path.
    #[must_use]
    pub fn registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.registry.path = Some(path.into());
        self
    }

    /// Set the registry cache TTL.
    #[must_use]
    pub fn registry_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.registry.cache_ttl = ttl;
        self
    }

    /// Add an inline bridge record.
    #[must_use]
    pub fn bridge(mut self, bridge: BridgeInstance) -> Self {
        self.config.bridges.push(bridge);
        self
    }

    /// Add an inline homeserver record.
    #[must_use]
    pub fn homeserver(mut self, homeserver: HomeserverInstance) -> Self {
        self.config.homeservers.push(homeserver);
        self
    }

    /// Write the request log to a JSON-lines file.
    #[must_use]
    pub fn request_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.request_log.kind = RequestLogKind::Jsonl;
        self.config.request_log.path = Some(path.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyResult<ProxyConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Duration (de)serialization accepting `"500ms"`, `"30s"`, `"10m"`, `"1h"` or bare seconds.
pub(crate) mod duration_format {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |n: &str| -> Result<u64, String> {
            n.trim().parse().map_err(|_| format!("invalid duration: {s}"))
        };
        if let Some(n) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(number(n)?))
        } else if let Some(n) = s.strip_suffix('s') {
            Ok(Duration::from_secs(number(n)?))
        } else if let Some(n) = s.strip_suffix('m') {
            Ok(Duration::from_secs(number(n)? * 60))
        } else if let Some(n) = s.strip_suffix('h') {
            Ok(Duration::from_secs(number(n)? * 3600))
        } else {
            Ok(Duration::from_secs(number(s)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.server.listen_port, 8090);
        assert_eq!(config.appservice.namespace_prefix, "_bridge_manager__");
        assert_eq!(config.upstream.timeout, Duration::from_secs(20));
        assert_eq!(config.request_log.kind, RequestLogKind::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ProxyConfig::builder()
            .listen_port(9000)
            .appservice_id("bridge_manager_2")
            .upstream_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(config.server.listen_port, 9000);
        assert_eq!(config.appservice.id, "bridge_manager_2");
        assert_eq!(config.upstream.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        assert!(ProxyConfig::builder().namespace_prefix("").build().is_err());
        assert!(ProxyConfig::builder().namespace_prefix("_bm_").build().is_err());
        assert!(ProxyConfig::builder().namespace_prefix("_bm__").build().is_ok());

        let bridge = BridgeInstance {
            bridge_id: "1".to_string(),
            bridge_type: "whatsapp".to_string(),
            base_url: "localhost:29318".to_string(),
            as_token: "as".to_string(),
            hs_token: "hs".to_string(),
            homeserver_id: "hs1".to_string(),
            status: crate::model::BridgeStatus::Active,
        };
        let err = ProxyConfig::builder().bridge(bridge).build().unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_jsonl_requires_path() {
        let mut config = ProxyConfig::default();
        config.request_log.kind = RequestLogKind::Jsonl;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        use duration_format::parse_duration;
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_toml_config() {
        let toml = r#"
[server]
listen_port = 8091

[upstream]
timeout = "5s"

[transactions]
ttl = "2m"

[[bridges]]
bridge_id = "1"
bridge_type = "whatsapp"
base_url = "http://localhost:29318"
as_token = "as-1"
hs_token = "hs-1"
homeserver_id = "local"

[[homeservers]]
homeserver_id = "local"
base_url = "http://localhost:8008"
registration_token = "reg"
domain = "matrix.localhost.me"
"#;
        let config: ProxyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_port, 8091);
        assert_eq!(config.upstream.timeout, Duration::from_secs(5));
        assert_eq!(config.transactions.ttl, Duration::from_secs(120));
        assert_eq!(config.bridges.len(), 1);
        assert_eq!(config.homeservers[0].domain, "matrix.localhost.me");
        assert!(config.validate().is_ok());
    }
}
