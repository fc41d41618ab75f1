//! Shared data model: bridge and homeserver snapshots, request sources,
//! correlation targets and the request/response descriptors written to the
//! request log.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyError;

/// Placeholder written to the request log instead of credentials.
pub const REDACTED: &str = "[REDACTED]";

/// Which side of the proxy a request came from.
///
/// Parsed exactly once at the HTTP boundary; there is no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestSource {
    /// Homeserver → bridge traffic (`/homeserver/{path}`).
    Homeserver,
    /// Bridge → homeserver traffic (`/bridge/{path}`).
    Bridge,
}

impl RequestSource {
    /// Wire representation of the source tag.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Homeserver => "homeserver",
            Self::Bridge => "bridge",
        }
    }
}

impl FromStr for RequestSource {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "homeserver" => Ok(Self::Homeserver),
            "bridge" => Ok(Self::Bridge),
            other => Err(ProxyError::configuration(format!(
                "source must be either 'homeserver' or 'bridge', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RequestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a bridge as reported by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    /// Running and accepting traffic.
    #[default]
    Active,
    /// Provisioned but not yet confirmed healthy.
    Starting,
    /// Stopped by the orchestrator.
    Stopped,
    /// Crashed or failed health checks.
    Failed,
}

/// Read-only snapshot of a bridge registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeInstance {
    /// Bridge identifier; the `{bridgeId}` of an encoded identity.
    pub bridge_id: String,
    /// Bridge software type (e.g. `whatsapp`); the `{bridgeType}` of an encoded identity.
    pub bridge_type: String,
    /// Base URL the bridge listens on.
    pub base_url: String,
    /// Token the bridge presents to us.
    pub as_token: String,
    /// Token we present to the bridge.
    pub hs_token: String,
    /// Homeserver this bridge is registered against.
    pub homeserver_id: String,
    /// Orchestrator status.
    #[serde(default)]
    pub status: BridgeStatus,
}

impl BridgeInstance {
    /// Whether the orchestrator considers this bridge able to take traffic.
    pub fn is_routable(&self) -> bool {
        matches!(self.status, BridgeStatus::Active | BridgeStatus::Starting)
    }
}

/// Read-only snapshot of a homeserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeserverInstance {
    /// Homeserver identifier.
    pub homeserver_id: String,
    /// Client-server API base URL.
    pub base_url: String,
    /// The appservice token registered with this homeserver.
    pub registration_token: String,
    /// Server name used in user IDs.
    pub domain: String,
}

/// Counterpart a correlation record points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum TransactionTarget {
    /// A bridge, by id.
    Bridge(String),
}

impl TransactionTarget {
    /// Id of the target bridge.
    pub fn bridge_id(&self) -> &str {
        match self {
            Self::Bridge(id) => id,
        }
    }
}

/// Serializable description of an inbound or outbound HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// HTTP method.
    pub method: String,
    /// Full URL (outbound) or path with query (inbound).
    pub url: String,
    /// Path without query string.
    pub path: String,
    /// Query parameters.
    pub query_params: BTreeMap<String, String>,
    /// Headers, credentials redacted.
    pub headers: BTreeMap<String, String>,
    /// JSON body, when the body parsed as JSON.
    pub body_json: Option<Value>,
    /// Body size in bytes.
    pub body_size: usize,
}

impl RequestDescriptor {
    /// Build a descriptor, redacting credentials.
    pub fn new(
        method: &Method,
        url: impl Into<String>,
        path: impl Into<String>,
        query: &[(String, String)],
        headers: &HeaderMap,
        body_json: Option<Value>,
        body_size: usize,
    ) -> Self {
        Self {
            method: method.to_string(),
            url: url.into(),
            path: path.into(),
            query_params: redact_query(query),
            headers: redact_headers(headers),
            body_json,
            body_size,
        }
    }
}

/// Serializable description of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseDescriptor {
    /// HTTP status.
    pub status: u16,
    /// Response body as JSON, or as a JSON string for non-JSON text bodies.
    pub body: Option<Value>,
}

impl ResponseDescriptor {
    /// Describe a response body, keeping JSON structure when present.
    pub fn from_body(status: u16, body: &[u8]) -> Self {
        let body = if body.is_empty() {
            None
        } else {
            serde_json::from_slice(body)
                .ok()
                .or_else(|| std::str::from_utf8(body).ok().map(|s| Value::String(s.to_string())))
        };
        Self { status, body }
    }
}

fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if name == http::header::AUTHORIZATION {
                REDACTED.to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}

fn redact_query(query: &[(String, String)]) -> BTreeMap<String, String> {
    query
        .iter()
        .map(|(k, v)| {
            let v = if k == "access_token" {
                REDACTED.to_string()
            } else {
                v.clone()
            };
            (k.clone(), v)
        })
        .collect()
}
