//! Header handling between the proxy and its upstreams.
//!
//! Inbound credentials are never forwarded: the forwarders strip them here
//! and attach the token of the side they are talking to.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Headers the proxy adds to every outbound request.
#[derive(Debug, Clone)]
pub struct PropagatedHeaders {
    /// Request ID for correlation.
    pub request_id: String,
    /// Trace context for distributed tracing.
    pub trace: TraceContext,
}

impl PropagatedHeaders {
    /// Create propagated headers for a request.
    pub fn new(request_id: impl Into<String>, trace: TraceContext) -> Self {
        Self {
            request_id: request_id.into(),
            trace,
        }
    }

    /// Add the propagated headers to a header map.
    pub fn add_to_headers(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            headers.insert(HEADER_REQUEST_ID.clone(), value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.trace.to_traceparent()) {
            headers.insert(HEADER_TRACEPARENT.clone(), value);
        }
    }
}

/// Header name for request ID.
pub static HEADER_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Header name for the W3C trace context.
pub static HEADER_TRACEPARENT: HeaderName = HeaderName::from_static("traceparent");

/// Headers that are never copied onto an outbound request.
pub static FILTERED_HEADERS: &[&str] = &[
    // Credentials are substituted per leg
    "authorization",
    "cookie",
    // Recomputed by the client
    "host",
    "content-length",
    // Hop-by-hop headers (HTTP/1.1)
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    // Re-added from the request context
    "x-request-id",
    "traceparent",
];

/// Headers that are never copied from an upstream response.
pub static FILTERED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Check if a header should be filtered (not forwarded).
pub fn should_filter_header(name: &str) -> bool {
    let name_lower = name.to_lowercase();
    FILTERED_HEADERS.contains(&name_lower.as_str())
}

/// Filter headers for forwarding to upstream.
pub fn filter_headers_for_upstream(headers: &HeaderMap) -> HeaderMap {
    filter(headers, FILTERED_HEADERS)
}

/// Filter upstream response headers before returning them to the caller.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    filter(headers, FILTERED_RESPONSE_HEADERS)
}

fn filter(headers: &HeaderMap, denied: &[&str]) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if !denied.contains(&name.as_str()) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Bearer token from the `Authorization` header, falling back to the
/// `access_token` query parameter.
pub fn bearer_token(headers: &HeaderMap, query: &[(String, String)]) -> Option<String> {
    let from_header = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty());

    from_header
        .map(str::to_string)
        .or_else(|| {
            query
                .iter()
                .find(|(k, _)| k == "access_token")
                .map(|(_, v)| v.clone())
        })
        .filter(|t| !t.is_empty())
}

/// `Authorization` value for a bearer token.
pub fn bearer_value(token: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {token}")).ok()
}

/// Extract trace context from incoming headers.
pub fn extract_trace_context(headers: &HeaderMap) -> Option<TraceContext> {
    headers
        .get(&HEADER_TRACEPARENT)
        .and_then(|v| v.to_str().ok())
        .and_then(TraceContext::from_traceparent)
}

/// W3C Trace Context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Trace ID (32 hex characters).
    pub trace_id: String,
    /// Parent span ID (16 hex characters).
    pub parent_span_id: Option<String>,
    /// Current span ID (16 hex characters).
    pub span_id: String,
    /// Whether this trace is sampled.
    pub sampled: bool,
}

impl TraceContext {
    /// Create a new root trace context.
    pub fn new() -> Self {
        Self {
            trace_id: format!("{:032x}", Uuid::now_v7().as_u128()),
            parent_span_id: None,
            span_id: new_span_id(),
            sampled: true,
        }
    }

    /// Parse from W3C traceparent header.
    ///
    /// Format: `{version}-{trace-id}-{parent-id}-{flags}`
    /// Example: `00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() != 4 || parts[0] != "00" {
            return None;
        }

        let (trace_id, parent_span_id) = (parts[1], parts[2]);
        if !is_hex(trace_id, 32) || !is_hex(parent_span_id, 16) {
            return None;
        }
        let flags = u8::from_str_radix(parts[3], 16).ok()?;

        Some(Self {
            trace_id: trace_id.to_string(),
            parent_span_id: Some(parent_span_id.to_string()),
            span_id: new_span_id(),
            sampled: flags & 0x01 != 0,
        })
    }

    /// Format as W3C traceparent header.
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{}", self.trace_id, self.span_id, flags)
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// The low 64 bits of a v7 UUID are random.
#[allow(clippy::cast_possible_truncation)]
fn new_span_id() -> String {
    format!("{:016x}", Uuid::now_v7().as_u128() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_to_headers() {
        let propagated = PropagatedHeaders::new("req-1", TraceContext::new());

        let mut headers = HeaderMap::new();
        propagated.add_to_headers(&mut headers);

        assert_eq!(headers.get(&HEADER_REQUEST_ID).unwrap(), "req-1");
        let traceparent = headers.get(&HEADER_TRACEPARENT).unwrap().to_str().unwrap();
        assert!(TraceContext::from_traceparent(traceparent).is_some());
    }

    #[test]
    fn test_inbound_credentials_never_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer as-1"));
        headers.insert("cookie", HeaderValue::from_static("session=1"));
        headers.insert("host", HeaderValue::from_static("proxy:8090"));
        headers.insert("x-request-id", HeaderValue::from_static("spoofed"));

        let filtered = filter_headers_for_upstream(&headers);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("content-type"));
        assert!(should_filter_header("Proxy-Authorization"));
        assert!(!should_filter_header("user-agent"));
    }

    #[test]
    fn test_filter_response_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));

        let filtered = filter_response_headers(&headers);
        assert!(filtered.contains_key("content-type"));
        assert!(!filtered.contains_key("content-length"));
        assert!(!filtered.contains_key("connection"));
    }

    #[test]
    fn test_bearer_token_sources() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer as-1"));
        let query = vec![("access_token".to_string(), "as-2".to_string())];

        assert_eq!(bearer_token(&headers, &query).as_deref(), Some("as-1"));
        assert_eq!(bearer_token(&HeaderMap::new(), &query).as_deref(), Some("as-2"));
        assert_eq!(bearer_token(&HeaderMap::new(), &[]), None);

        let mut basic = HeaderMap::new();
        basic.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&basic, &[]), None);
    }

    #[test]
    fn test_incoming_traceparent_continues_the_trace() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "traceparent",
            HeaderValue::from_static("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00"),
        );
        let ctx = extract_trace_context(&headers).unwrap();

        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("00f067aa0ba902b7"));
        assert!(!ctx.sampled);

        let outbound = ctx.to_traceparent();
        assert!(outbound.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));
        assert!(outbound.ends_with("-00"));
        assert!(!outbound.contains("00f067aa0ba902b7"));
    }

    #[test]
    fn test_generated_trace_is_well_formed() {
        let ctx = TraceContext::new();
        assert!(is_hex(&ctx.trace_id, 32));
        assert!(is_hex(&ctx.span_id, 16));
        assert!(ctx.parent_span_id.is_none());
        assert!(TraceContext::from_traceparent(&ctx.to_traceparent()).is_some());
    }

    #[test]
    fn test_trace_context_rejects_malformed() {
        assert!(TraceContext::from_traceparent("01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01").is_none());
        assert!(TraceContext::from_traceparent("00-short-b7ad6b7169203331-01").is_none());
        assert!(TraceContext::from_traceparent("garbage").is_none());
    }
}
