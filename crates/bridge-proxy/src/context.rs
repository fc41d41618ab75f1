//! Per-request context.
//!
//! A [`RequestContext`] is created once per inbound request. It reads the
//! body exactly once, writes the initial log row, and is then passed
//! explicitly to the forwarder, which drives it through its states:
//!
//! ```text
//! Created -> Classified -> Forwarding -> Responded -> Logged
//!    |                         |
//!    +-> Unhandled             +-> Failed
//! ```

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, Request};
use http_body::Body;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn, Span};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::{ErrorResponse, ProxyError, ProxyResult};
use crate::headers::{extract_trace_context, TraceContext};
use crate::model::{BridgeInstance, RequestDescriptor, RequestSource, ResponseDescriptor};
use crate::request_log::{NewRequestRow, OutboundRecord, RequestLogger, RowId};

/// A unique identifier for each request, using UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new unique request ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Body read, initial row written.
    Created,
    /// Counterpart resolved.
    Classified,
    /// Outbound request sent.
    Forwarding,
    /// Response attached.
    Responded,
    /// Response row written.
    Logged,
    /// No counterpart could be resolved.
    Unhandled,
    /// The outbound call failed.
    Failed,
}

impl RequestState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Logged | Self::Unhandled | Self::Failed)
    }
}

/// How the counterpart of a request was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Bearer token of a bridge.
    Token,
    /// Recorded ping transaction id.
    PingTransaction,
    /// Encoded user ids in the path, query or body.
    EncodedIdentity,
    /// Recorded homeserver transaction id.
    TransactionRecord,
    /// Room last used by a bridge.
    RoomRecord,
}

impl Resolution {
    /// Label used in logs and spans.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::PingTransaction => "ping_transaction",
            Self::EncodedIdentity => "encoded_identity",
            Self::TransactionRecord => "transaction_record",
            Self::RoomRecord => "room_record",
        }
    }
}

/// State carried through one request.
#[derive(Debug)]
pub struct RequestContext {
    request_id: RequestId,
    trace: TraceContext,
    transaction_id: Option<String>,
    source: RequestSource,
    method: Method,
    path: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Bytes,
    body_json: Option<Value>,
    received_at: DateTime<Utc>,
    started_at: Instant,
    row_id: RowId,
    logger: Arc<dyn RequestLogger>,

    state: RequestState,
    handled: bool,
    bridge_id: Option<String>,
    homeserver_id: Option<String>,
    resolution: Option<Resolution>,
}

impl RequestContext {
    /// Read `request` once, classify `source` and write the initial log row.
    ///
    /// `path` on the context is the inbound path with the `/{source}` prefix
    /// removed.
    pub async fn create<B>(
        request: Request<B>,
        config: &ProxyConfig,
        source: &str,
        logger: Arc<dyn RequestLogger>,
    ) -> ProxyResult<Self>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source: RequestSource = source.parse()?;
        let received_at = Utc::now();
        let started_at = Instant::now();
        let (parts, body) = request.into_parts();

        let limit = config.server.max_request_body_size;
        let body = Limited::new(body, limit)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    ProxyError::PayloadTooLarge { limit }
                } else {
                    ProxyError::bad_request(format!("failed to read request body: {e}"))
                }
            })?
            .to_bytes();
        let body_json: Option<Value> = if body.is_empty() {
            None
        } else {
            serde_json::from_slice(&body).ok()
        };

        let prefix = format!("/{source}");
        let full_path = parts.uri.path();
        let path = match full_path.strip_prefix(&prefix) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => full_path.to_string(),
        };

        let query: Vec<(String, String)> = match parts.uri.query() {
            Some(q) => serde_urlencoded::from_str(q)
                .map_err(|e| ProxyError::bad_request(format!("invalid query string: {e}")))?,
            None => Vec::new(),
        };

        let transaction_id = transaction_id(&path, body_json.as_ref());
        let trace = extract_trace_context(&parts.headers).unwrap_or_default();

        let url = match parts.uri.query() {
            Some(q) => format!("{path}?{q}"),
            None => path.clone(),
        };
        let inbound = RequestDescriptor::new(
            &parts.method,
            url,
            path.clone(),
            &query,
            &parts.headers,
            body_json.clone(),
            body.len(),
        );
        let row_id = logger
            .create_initial(NewRequestRow {
                source,
                method: parts.method.to_string(),
                path: path.clone(),
                inbound_request: inbound,
                inbound_at: received_at,
            })
            .await?;

        Ok(Self {
            request_id: RequestId::new(),
            trace,
            transaction_id,
            source,
            method: parts.method,
            path,
            headers: parts.headers,
            query,
            body,
            body_json,
            received_at,
            started_at,
            row_id,
            logger,
            state: RequestState::Created,
            handled: false,
            bridge_id: None,
            homeserver_id: None,
            resolution: None,
        })
    }

    /// Request ID.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Trace context.
    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// Trace ID, inherited from `traceparent` or generated.
    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    /// Transaction id from the path (`transactions/{txnId}`) or the body
    /// (`transaction_id`).
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Request source.
    pub fn source(&self) -> RequestSource {
        self.source
    }

    /// Inbound method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Inbound path without the source prefix, still percent-encoded.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Inbound headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Inbound query parameters in order.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Inbound body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Inbound body as JSON, when it parsed.
    pub fn body_json(&self) -> Option<&Value> {
        self.body_json.as_ref()
    }

    /// Arrival time.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Time since arrival.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Log row id.
    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Whether the forwarder handled the request.
    pub fn is_handled(&self) -> bool {
        self.handled
    }

    /// Resolved bridge id.
    pub fn bridge_id(&self) -> Option<&str> {
        self.bridge_id.as_deref()
    }

    /// Resolved homeserver id.
    pub fn homeserver_id(&self) -> Option<&str> {
        self.homeserver_id.as_deref()
    }

    /// How the counterpart was resolved.
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    /// Outcome label for metrics.
    pub fn outcome(&self) -> &'static str {
        match self.state {
            RequestState::Unhandled => "unhandled",
            RequestState::Failed => "failed",
            _ if self.handled => "forwarded",
            _ => "rejected",
        }
    }

    /// Record the resolved bridge.
    pub fn attach_bridge(&mut self, bridge: &BridgeInstance, resolution: Resolution) {
        Span::current()
            .record("bridge_id", bridge.bridge_id.as_str())
            .record("resolution", resolution.as_str());
        self.bridge_id = Some(bridge.bridge_id.clone());
        self.homeserver_id = Some(bridge.homeserver_id.clone());
        self.resolution = Some(resolution);
        self.transition(RequestState::Created, RequestState::Classified);
    }

    /// Record several bridges for a fanned-out request. The first is primary.
    pub fn attach_bridges(&mut self, bridges: &[BridgeInstance], resolution: Resolution) {
        if let Some(first) = bridges.first() {
            self.attach_bridge(first, resolution);
        }
    }

    /// Record the outbound request; `descriptor` is an array for fan-out.
    pub async fn mark_forwarded(&mut self, descriptor: Value) {
        if !self.transition(RequestState::Classified, RequestState::Forwarding) {
            return;
        }
        let outbound = OutboundRecord {
            bridge_id: self.bridge_id.clone(),
            homeserver_id: self.homeserver_id.clone(),
            request: descriptor,
        };
        if let Err(e) = self.logger.update_outbound(self.row_id, outbound).await {
            error!(row_id = self.row_id, error = %e, "failed to record outbound request");
        }
    }

    /// Attach the response returned to the caller and finalize the row.
    pub async fn attach_response(&mut self, response: ResponseDescriptor) {
        if !self.transition(RequestState::Forwarding, RequestState::Responded) {
            return;
        }
        self.write_response(response).await;
        self.state = RequestState::Logged;
    }

    /// Flag the request as forwarded by its service.
    pub fn mark_handled(&mut self) {
        self.handled = true;
    }

    /// No counterpart was found: log the error response and stop.
    pub async fn mark_unhandled(&mut self, err: &ProxyError) {
        if self.state.is_terminal() {
            return;
        }
        self.handled = false;
        self.state = RequestState::Unhandled;
        let body = serde_json::to_value(self.error_body(err)).ok();
        self.write_response(ResponseDescriptor {
            status: err.status_code(),
            body,
        })
        .await;
    }

    /// The outbound call or the request itself failed: log a null body with
    /// the error status.
    pub async fn mark_failed(&mut self, err: &ProxyError) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RequestState::Failed;
        self.write_response(ResponseDescriptor {
            status: err.status_code(),
            body: None,
        })
        .await;
    }

    /// Matrix error body for `err`, tagged with this request's id.
    pub fn error_body(&self, err: &ProxyError) -> ErrorResponse {
        ErrorResponse::from(err).with_request_id(self.request_id.to_string())
    }

    async fn write_response(&self, response: ResponseDescriptor) {
        if let Err(e) = self.logger.update_response(self.row_id, response).await {
            error!(row_id = self.row_id, error = %e, "failed to record response");
        }
    }

    fn transition(&mut self, from: RequestState, to: RequestState) -> bool {
        if self.state == from {
            self.state = to;
            true
        } else {
            warn!(
                request_id = %self.request_id,
                state = ?self.state,
                target = ?to,
                "ignored request state transition"
            );
            false
        }
    }
}

fn transaction_id(path: &str, body: Option<&Value>) -> Option<String> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if let Some(pos) = segments.iter().position(|s| *s == "transactions") {
        if let Some(id) = segments.get(pos + 1).filter(|s| !s.is_empty()) {
            return urlencoding::decode(id).ok().map(|s| s.into_owned());
        }
    }
    body.and_then(|b| b.get("transaction_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_log::MemoryRequestLogger;
    use http_body::Frame;
    use http_body_util::Full;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    struct CountingBody {
        inner: Full<Bytes>,
        polls: Arc<AtomicUsize>,
    }

    impl Body for CountingBody {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            let poll = Pin::new(&mut self.inner).poll_frame(cx);
            if let Poll::Ready(Some(_)) = poll {
                self.polls.fetch_add(1, Ordering::SeqCst);
            }
            poll
        }
    }

    fn request(uri: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("authorization", "Bearer secret")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    fn bridge() -> BridgeInstance {
        BridgeInstance {
            bridge_id: "1".to_string(),
            bridge_type: "whatsapp".to_string(),
            base_url: "http://bridge".to_string(),
            as_token: "as".to_string(),
            hs_token: "hs".to_string(),
            homeserver_id: "local".to_string(),
            status: crate::model::BridgeStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_body_is_read_once() {
        let polls = Arc::new(AtomicUsize::new(0));
        let body = CountingBody {
            inner: Full::new(Bytes::from_static(br#"{"transaction_id":"123"}"#)),
            polls: polls.clone(),
        };
        let req = Request::post("/bridge/_matrix/client/v1/appservice/x/ping")
            .body(body)
            .unwrap();
        let logger = Arc::new(MemoryRequestLogger::new());

        let ctx = RequestContext::create(req, &ProxyConfig::default(), "bridge", logger)
            .await
            .unwrap();
        for _ in 0..3 {
            assert_eq!(ctx.body().len(), 24);
            assert_eq!(ctx.body_json().unwrap()["transaction_id"], "123");
        }

        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.transaction_id(), Some("123"));
    }

    #[tokio::test]
    async fn test_create_writes_initial_row() {
        let logger = Arc::new(MemoryRequestLogger::new());
        let ctx = RequestContext::create(
            request("/homeserver/_matrix/app/v1/transactions/42?access_token=t", "{}"),
            &ProxyConfig::default(),
            "homeserver",
            logger.clone(),
        )
        .await
        .unwrap();

        assert_eq!(ctx.source(), RequestSource::Homeserver);
        assert_eq!(ctx.path(), "/_matrix/app/v1/transactions/42");
        assert_eq!(ctx.transaction_id(), Some("42"));
        assert_eq!(ctx.state(), RequestState::Created);

        let row = logger.get(ctx.row_id()).await.unwrap().unwrap();
        assert_eq!(row.path, "/_matrix/app/v1/transactions/42");
        assert_eq!(row.inbound_request.headers["authorization"], crate::model::REDACTED);
        assert_eq!(row.inbound_request.query_params["access_token"], crate::model::REDACTED);
        assert!(row.bridge_id.is_none());
    }

    #[tokio::test]
    async fn test_non_json_body_is_kept_raw() {
        let logger = Arc::new(MemoryRequestLogger::new());
        let ctx = RequestContext::create(
            request("/bridge/_matrix/media/v3/upload", "not json at all"),
            &ProxyConfig::default(),
            "bridge",
            logger,
        )
        .await
        .unwrap();

        assert!(ctx.body_json().is_none());
        assert_eq!(ctx.body().as_ref(), b"not json at all");
    }

    #[tokio::test]
    async fn test_invalid_source_is_configuration_error() {
        let logger = Arc::new(MemoryRequestLogger::new());
        let err = RequestContext::create(
            request("/other/x", ""),
            &ProxyConfig::default(),
            "other",
            logger.clone(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProxyError::Configuration { .. }));
        assert!(logger.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let mut config = ProxyConfig::default();
        config.server.max_request_body_size = 4;
        let logger = Arc::new(MemoryRequestLogger::new());

        let err = RequestContext::create(request("/bridge/x", "0123456789"), &config, "bridge", logger)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 413);
    }

    #[tokio::test]
    async fn test_forwarded_lifecycle() {
        let logger = Arc::new(MemoryRequestLogger::new());
        let mut ctx = RequestContext::create(
            request("/homeserver/_matrix/app/v1/ping", r#"{"transaction_id":"1"}"#),
            &ProxyConfig::default(),
            "homeserver",
            logger.clone(),
        )
        .await
        .unwrap();

        ctx.attach_bridge(&bridge(), Resolution::PingTransaction);
        assert_eq!(ctx.state(), RequestState::Classified);
        assert_eq!(ctx.resolution(), Some(Resolution::PingTransaction));
        ctx.mark_forwarded(serde_json::json!({"url": "http://bridge/_matrix/app/v1/ping"}))
            .await;
        assert_eq!(ctx.state(), RequestState::Forwarding);
        ctx.attach_response(ResponseDescriptor::from_body(200, b"{}")).await;
        ctx.mark_handled();

        assert_eq!(ctx.state(), RequestState::Logged);
        assert_eq!(ctx.outcome(), "forwarded");
        let row = logger.get(ctx.row_id()).await.unwrap().unwrap();
        assert_eq!(row.bridge_id.as_deref(), Some("1"));
        assert_eq!(row.homeserver_id.as_deref(), Some("local"));
        assert_eq!(row.response_status, Some(200));
        assert!(row.outbound_request.is_some());
    }

    #[tokio::test]
    async fn test_unhandled_is_terminal() {
        let logger = Arc::new(MemoryRequestLogger::new());
        let mut ctx = RequestContext::create(
            request("/bridge/x", ""),
            &ProxyConfig::default(),
            "bridge",
            logger.clone(),
        )
        .await
        .unwrap();

        ctx.mark_unhandled(&ProxyError::unknown_bridge("no token")).await;
        ctx.mark_forwarded(serde_json::json!({})).await;
        ctx.attach_response(ResponseDescriptor::from_body(200, b"")).await;

        assert_eq!(ctx.state(), RequestState::Unhandled);
        assert_eq!(ctx.outcome(), "unhandled");
        let row = logger.get(ctx.row_id()).await.unwrap().unwrap();
        assert_eq!(row.response_status, Some(404));
        assert_eq!(row.response.unwrap()["errcode"], "M_NOT_FOUND");
        assert!(row.outbound_request.is_none());
    }

    #[tokio::test]
    async fn test_failed_logs_null_body() {
        let logger = Arc::new(MemoryRequestLogger::new());
        let mut ctx = RequestContext::create(
            request("/bridge/x", "{}"),
            &ProxyConfig::default(),
            "bridge",
            logger.clone(),
        )
        .await
        .unwrap();

        ctx.attach_bridge(&bridge(), Resolution::Token);
        ctx.mark_forwarded(serde_json::json!({})).await;
        ctx.mark_failed(&ProxyError::upstream("connection refused")).await;

        assert_eq!(ctx.state(), RequestState::Failed);
        let row = logger.get(ctx.row_id()).await.unwrap().unwrap();
        assert_eq!(row.response_status, Some(502));
        assert!(row.response.is_none());
        assert!(row.outbound_request.is_some());
    }

    #[test]
    fn test_resolution_labels_match_serialized_names() {
        for resolution in [
            Resolution::Token,
            Resolution::PingTransaction,
            Resolution::EncodedIdentity,
            Resolution::TransactionRecord,
            Resolution::RoomRecord,
        ] {
            assert_eq!(
                serde_json::to_value(resolution).unwrap(),
                resolution.as_str(),
                "{resolution:?}"
            );
        }
    }

    #[test]
    fn test_transaction_id_sources() {
        assert_eq!(
            transaction_id("/_matrix/app/v1/transactions/abc%2F1", None).as_deref(),
            Some("abc/1")
        );
        let body = serde_json::json!({"transaction_id": "p1"});
        assert_eq!(transaction_id("/_matrix/app/v1/ping", Some(&body)).as_deref(), Some("p1"));
        assert_eq!(transaction_id("/_matrix/app/v1/ping", None), None);
    }
}
