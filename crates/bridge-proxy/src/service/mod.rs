//! Forwarders for the two catchall surfaces.
//!
//! [`BridgeService`] handles `/bridge/{path}` and [`HomeserverService`]
//! handles `/homeserver/{path}`. Both take the [`RequestContext`] explicitly
//! and finish it through [`Forwarder::handle`], which guarantees every
//! request ends with exactly one response row.

mod bridge;
mod homeserver;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use tracing::{error, warn};

use crate::config::ProxyConfig;
use crate::context::RequestContext;
use crate::error::{ProxyError, ProxyResult};
use crate::headers::{filter_response_headers, PropagatedHeaders};
use crate::identity::{Direction, IdentityCodec};
use crate::metrics;
use crate::model::{RequestSource, ResponseDescriptor};
use crate::proxy::{ProxyClient, ProxyRequest, ProxyResponse};
use crate::registry::BridgeRegistry;
use crate::transactions::TransactionRouter;

pub use bridge::BridgeService;
pub use homeserver::HomeserverService;

/// Collaborators shared by both forwarders.
#[derive(Debug, Clone)]
pub struct ProxyState {
    /// Proxy configuration.
    pub config: Arc<ProxyConfig>,
    /// Identity codec for the configured namespace.
    pub codec: Arc<IdentityCodec>,
    /// Bridge and homeserver lookups.
    pub registry: Arc<BridgeRegistry>,
    /// Ping, transaction and room correlation.
    pub router: TransactionRouter,
    /// Outbound client.
    pub client: ProxyClient,
}

impl ProxyState {
    /// Assemble the state from explicit collaborators.
    pub fn new(
        config: ProxyConfig,
        registry: BridgeRegistry,
        router: TransactionRouter,
    ) -> ProxyResult<Self> {
        let codec = IdentityCodec::from_settings(&config.appservice)?;
        let client = ProxyClient::new(&config.upstream)?;
        Ok(Self {
            config: Arc::new(config),
            codec: Arc::new(codec),
            registry: Arc::new(registry),
            router,
            client,
        })
    }

    /// Assemble the state the configuration describes.
    pub fn from_config(config: ProxyConfig) -> ProxyResult<Self> {
        let registry = BridgeRegistry::from_config(&config);
        let router = TransactionRouter::in_memory(config.transactions.ttl);
        Self::new(config, registry, router)
    }

    /// Send one outbound request, recording its duration.
    pub(crate) async fn send(
        &self,
        source: RequestSource,
        request: &ProxyRequest,
    ) -> ProxyResult<ProxyResponse> {
        let started = Instant::now();
        let result = self.client.forward(request).await;
        metrics::record_upstream(source, started.elapsed());
        result
    }
}

/// A forwarder for one request source.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Resolve, rewrite and forward the request.
    ///
    /// Implementations record the outbound descriptor on `ctx` before
    /// sending; [`handle`](Self::handle) attaches the outcome.
    async fn forward(&self, ctx: &mut RequestContext) -> ProxyResult<ProxyResponse>;

    /// Forward the request and finalize `ctx` with its outcome.
    async fn handle(&self, ctx: &mut RequestContext) -> ProxyResponse {
        let result = self.forward(ctx).await;
        finish(ctx, result).await
    }
}

async fn finish(ctx: &mut RequestContext, result: ProxyResult<ProxyResponse>) -> ProxyResponse {
    match result {
        Ok(response) => {
            ctx.attach_response(ResponseDescriptor::from_body(
                response.status.as_u16(),
                &response.body,
            ))
            .await;
            ctx.mark_handled();
            response
        }
        Err(e) => {
            if e.is_unhandled() {
                warn!(request_id = %ctx.request_id(), error = %e, "request unhandled");
                ctx.mark_unhandled(&e).await;
            } else {
                error!(
                    request_id = %ctx.request_id(),
                    category = e.category(),
                    error = %e,
                    "request failed"
                );
                ctx.mark_failed(&e).await;
            }
            error_response(ctx, &e)
        }
    }
}

/// Matrix error response for `err`.
pub fn error_response(ctx: &RequestContext, err: &ProxyError) -> ProxyResponse {
    let body = serde_json::to_vec(&ctx.error_body(err)).unwrap_or_default();
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    ProxyResponse {
        status: StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        headers,
        body: Bytes::from(body),
    }
}

/// Propagated headers for the outbound legs of `ctx`.
fn propagated(ctx: &RequestContext) -> PropagatedHeaders {
    PropagatedHeaders::new(ctx.request_id().to_string(), ctx.trace().clone())
}

/// Outbound body for one leg: the rewritten JSON when anything changed,
/// the original bytes otherwise.
fn outbound_body(
    codec: &IdentityCodec,
    ctx: &RequestContext,
    direction: Direction<'_>,
) -> Option<Bytes> {
    rewrite_body(ctx, |json| codec.rewrite_json(json, direction))
}

/// Outbound body after `rewrite`, which reports whether it changed the JSON.
fn rewrite_body(
    ctx: &RequestContext,
    rewrite: impl FnOnce(&mut serde_json::Value) -> bool,
) -> Option<Bytes> {
    if ctx.body().is_empty() {
        return None;
    }
    if let Some(json) = ctx.body_json() {
        let mut json = json.clone();
        if rewrite(&mut json) {
            if let Ok(bytes) = serde_json::to_vec(&json) {
                return Some(Bytes::from(bytes));
            }
        }
    }
    Some(ctx.body().clone())
}

/// Outbound query for one leg: `access_token` dropped, `user_id` rewritten.
fn outbound_query(
    codec: &IdentityCodec,
    ctx: &RequestContext,
    direction: Direction<'_>,
) -> Vec<(String, String)> {
    let mut query: Vec<(String, String)> = ctx
        .query()
        .iter()
        .filter(|(k, _)| k != "access_token")
        .cloned()
        .collect();
    codec.rewrite_query(&mut query, direction);
    query
}

/// Rewrite an upstream response for the caller.
fn rewrite_response(
    codec: &IdentityCodec,
    response: ProxyResponse,
    direction: Direction<'_>,
) -> ProxyResponse {
    let headers = filter_response_headers(&response.headers);
    let mut body = response.body;
    if let Ok(mut json) = serde_json::from_slice::<serde_json::Value>(&body) {
        if codec.rewrite_json(&mut json, direction) {
            if let Ok(rewritten) = serde_json::to_vec(&json) {
                body = Bytes::from(rewritten);
            }
        }
    }
    ProxyResponse {
        status: response.status,
        headers,
        body,
    }
}

/// Room ids (`!…`) following a `rooms` segment of `path`.
fn room_ids_in_path(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').collect();
    segments
        .windows(2)
        .filter(|w| w[0] == "rooms")
        .filter_map(|w| {
            let id = urlencoding::decode(w[1]).unwrap_or(Cow::Borrowed(w[1]));
            id.starts_with('!').then(|| id.into_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BridgeInstance, BridgeStatus};
    use crate::request_log::MemoryRequestLogger;
    use http_body_util::Full;

    fn bridge() -> BridgeInstance {
        BridgeInstance {
            bridge_id: "1".to_string(),
            bridge_type: "whatsapp".to_string(),
            base_url: "http://bridge".to_string(),
            as_token: "as".to_string(),
            hs_token: "hs".to_string(),
            homeserver_id: "local".to_string(),
            status: BridgeStatus::Active,
        }
    }

    async fn context(uri: &str, body: &'static str) -> RequestContext {
        let req = http::Request::put(uri)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap();
        RequestContext::create(
            req,
            &ProxyConfig::default(),
            "bridge",
            Arc::new(MemoryRequestLogger::new()),
        )
        .await
        .unwrap()
    }

    fn codec() -> IdentityCodec {
        IdentityCodec::new("_bridge_manager__", "_bridge_manager").unwrap()
    }

    #[tokio::test]
    async fn test_outbound_body_keeps_original_bytes_when_unchanged() {
        let ctx = context("/bridge/x", r#"{ "body":  "hello" }"#).await;
        let body = outbound_body(&codec(), &ctx, Direction::ToHomeserver).unwrap();
        assert_eq!(body.as_ref(), br#"{ "body":  "hello" }"#);
    }

    #[tokio::test]
    async fn test_outbound_body_rewrites_json() {
        let ctx = context(
            "/bridge/x",
            r#"{"user_id":"@_bridge_manager__whatsapp_1__alice:matrix.localhost.me"}"#,
        )
        .await;
        let body = outbound_body(&codec(), &ctx, Direction::ToHomeserver).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["user_id"], "@alice:matrix.localhost.me");
    }

    #[tokio::test]
    async fn test_outbound_body_passes_non_json_through() {
        let ctx = context("/bridge/x", "@_bridge_manager__whatsapp_1__alice:hs").await;
        let body = outbound_body(&codec(), &ctx, Direction::ToHomeserver).unwrap();
        assert_eq!(body.as_ref(), b"@_bridge_manager__whatsapp_1__alice:hs");

        let empty = context("/bridge/x", "").await;
        assert!(outbound_body(&codec(), &empty, Direction::ToHomeserver).is_none());
    }

    #[tokio::test]
    async fn test_outbound_query_drops_access_token() {
        let ctx = context("/bridge/x?access_token=as&user_id=%40alice%3Amatrix.localhost.me", "").await;
        let bridge = bridge();
        let query = outbound_query(
            &codec(),
            &ctx,
            Direction::ToBridge {
                bridge: &bridge,
                domain: "matrix.localhost.me",
            },
        );
        assert_eq!(
            query,
            vec![(
                "user_id".to_string(),
                "@_bridge_manager__whatsapp_1__alice:matrix.localhost.me".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_error_response_is_matrix_error() {
        let ctx = context("/bridge/x", "").await;
        let response = error_response(&ctx, &ProxyError::unknown_bridge("no token"));
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["errcode"], "M_NOT_FOUND");
        assert_eq!(body["request_id"], ctx.request_id().to_string());
    }

    #[test]
    fn test_rewrite_response_strips_length_and_rewrites() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("64"));
        let response = ProxyResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(r#"{"user_id":"@alice:matrix.localhost.me"}"#),
        };
        let bridge = bridge();
        let rewritten = rewrite_response(
            &codec(),
            response,
            Direction::ToBridge {
                bridge: &bridge,
                domain: "matrix.localhost.me",
            },
        );

        assert!(!rewritten.headers.contains_key("content-length"));
        let json: serde_json::Value = serde_json::from_slice(&rewritten.body).unwrap();
        assert_eq!(json["user_id"], "@_bridge_manager__whatsapp_1__alice:matrix.localhost.me");
    }

    #[test]
    fn test_room_ids_in_path() {
        assert_eq!(
            room_ids_in_path("/_matrix/client/v3/rooms/%21abc%3Ahs/send/m.room.message/1"),
            vec!["!abc:hs".to_string()]
        );
        assert!(room_ids_in_path("/_matrix/client/v3/rooms/%23alias%3Ahs/join").is_empty());
        assert!(room_ids_in_path("/_matrix/client/v3/sync").is_empty());
    }
}
