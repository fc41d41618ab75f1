//! Homeserver → bridge forwarding.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    outbound_body, outbound_query, propagated, rewrite_response, room_ids_in_path, Forwarder,
    ProxyState,
};
use crate::context::{RequestContext, Resolution};
use crate::error::{ProxyError, ProxyResult};
use crate::identity::Direction;
use crate::model::{BridgeInstance, RequestSource};
use crate::proxy::{ProxyRequest, ProxyResponse};

/// Handles `/homeserver/{path}`.
///
/// Homeserver traffic is pre-authenticated upstream. The target bridge is
/// resolved from, in order: a recorded ping transaction id, encoded
/// identities in the path, query or body, a recorded transaction id, and a
/// room last used by a bridge. A transaction naming several bridges is sent
/// to each of them.
#[derive(Debug, Clone)]
pub struct HomeserverService {
    state: ProxyState,
}

impl HomeserverService {
    /// Create the service.
    pub fn new(state: ProxyState) -> Self {
        Self { state }
    }

    async fn resolve_targets(
        &self,
        ctx: &RequestContext,
    ) -> ProxyResult<(Vec<BridgeInstance>, Resolution)> {
        let state = &self.state;

        if is_ping(ctx.path()) {
            let transaction_id = ctx
                .transaction_id()
                .ok_or_else(|| ProxyError::bad_request("ping carries no transaction_id"))?;
            let bridge_id = state.router.resolve_ping(transaction_id).await?;
            let bridge = self.routable(&bridge_id).await.ok_or_else(|| {
                ProxyError::unknown_bridge(format!("ping bridge {bridge_id} is not routable"))
            })?;
            return Ok((vec![bridge], Resolution::PingTransaction));
        }

        let encoded = self.bridges_by_identity(ctx).await;
        if !encoded.is_empty() {
            return Ok((encoded, Resolution::EncodedIdentity));
        }

        if let Some(transaction_id) = ctx.transaction_id() {
            if let Some(bridge_id) = state.router.lookup_transaction(transaction_id).await? {
                if let Some(bridge) = self.routable(&bridge_id).await {
                    return Ok((vec![bridge], Resolution::TransactionRecord));
                }
            }
        }

        for room_id in room_ids(ctx) {
            if let Some(bridge_id) = state.router.lookup_room(&room_id).await? {
                if let Some(bridge) = self.routable(&bridge_id).await {
                    return Ok((vec![bridge], Resolution::RoomRecord));
                }
            }
        }

        Err(ProxyError::unknown_bridge(format!(
            "no bridge claims {}",
            ctx.path()
        )))
    }

    /// Distinct bridges named by encoded identities, in order of appearance.
    async fn bridges_by_identity(&self, ctx: &RequestContext) -> Vec<BridgeInstance> {
        let codec = &self.state.codec;
        let mut identities = codec.identities_in_path(ctx.path());
        identities.extend(
            ctx.query()
                .iter()
                .filter(|(k, _)| k == "user_id")
                .filter_map(|(_, v)| codec.decode(v).ok()),
        );
        if let Some(body) = ctx.body_json() {
            identities.extend(codec.identities_in_json(body));
        }

        let mut bridges: Vec<BridgeInstance> = Vec::new();
        for identity in identities {
            if bridges.iter().any(|b| b.bridge_id == identity.bridge_id) {
                continue;
            }
            match self.routable(&identity.bridge_id).await {
                Some(bridge) if bridge.bridge_type == identity.bridge_type => bridges.push(bridge),
                Some(bridge) => warn!(
                    bridge_id = %bridge.bridge_id,
                    expected = %identity.bridge_type,
                    actual = %bridge.bridge_type,
                    "encoded identity names a bridge of another type"
                ),
                None => {}
            }
        }
        bridges
    }

    async fn routable(&self, bridge_id: &str) -> Option<BridgeInstance> {
        match self.state.registry.resolve_by_id(bridge_id).await {
            Ok(bridge) if bridge.is_routable() => Some(bridge),
            Ok(bridge) => {
                debug!(bridge_id, status = ?bridge.status, "bridge not routable");
                None
            }
            Err(e) => {
                debug!(bridge_id, error = %e, "bridge lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl Forwarder for HomeserverService {
    async fn forward(&self, ctx: &mut RequestContext) -> ProxyResult<ProxyResponse> {
        let state = &self.state;

        let (targets, resolution) = self.resolve_targets(ctx).await?;
        let primary = targets
            .first()
            .ok_or_else(|| ProxyError::unknown_bridge("no target bridge"))?;
        let mut domains = Vec::with_capacity(targets.len());
        for bridge in &targets {
            let homeserver = state.registry.resolve_homeserver(&bridge.homeserver_id).await?;
            domains.push(homeserver.domain);
        }
        ctx.attach_bridges(&targets, resolution);

        if is_transaction(ctx.path()) {
            if let Some(transaction_id) = ctx.transaction_id() {
                state
                    .router
                    .record_transaction(transaction_id, &primary.bridge_id)
                    .await?;
            }
        }

        let requests: Vec<ProxyRequest> = targets
            .iter()
            .zip(&domains)
            .map(|(bridge, domain)| {
                let direction = Direction::ToBridge { bridge, domain };
                let path = state.codec.rewrite_path(ctx.path(), direction).into_owned();
                let mut request = ProxyRequest::new(
                    ctx.method().clone(),
                    bridge.base_url.clone(),
                    path,
                    propagated(ctx),
                )
                .with_query(outbound_query(&state.codec, ctx, direction))
                .with_headers(ctx.headers().clone())
                .with_bearer(bridge.hs_token.clone());
                if let Some(body) = outbound_body(&state.codec, ctx, direction) {
                    request = request.with_body(body);
                }
                request
            })
            .collect();

        let descriptors = requests
            .iter()
            .map(|r| serde_json::to_value(r.descriptor()))
            .collect::<Result<Vec<Value>, _>>()?;
        let descriptor = if descriptors.len() == 1 {
            descriptors.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::Array(descriptors)
        };
        ctx.mark_forwarded(descriptor).await;

        if targets.len() > 1 {
            info!(
                bridges = ?targets.iter().map(|b| b.bridge_id.as_str()).collect::<Vec<_>>(),
                "fanning out to several bridges"
            );
        }

        let results = join_all(
            requests
                .iter()
                .map(|request| state.send(RequestSource::Homeserver, request)),
        )
        .await;
        let response = pick_response(results)?;

        Ok(rewrite_response(&state.codec, response, Direction::ToHomeserver))
    }
}

/// First leg's response when every leg succeeded, otherwise the first
/// failing leg's outcome.
fn pick_response(results: Vec<ProxyResult<ProxyResponse>>) -> ProxyResult<ProxyResponse> {
    let failed = results
        .iter()
        .position(|r| r.as_ref().map_or(true, |resp| !resp.is_success()));
    let index = failed.unwrap_or(0);
    results
        .into_iter()
        .nth(index)
        .unwrap_or_else(|| Err(ProxyError::upstream("no outbound leg ran")))
}

fn segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').collect()
}

fn is_ping(path: &str) -> bool {
    matches!(segments(path).as_slice(), ["_matrix", "app", _, "ping"])
}

fn is_transaction(path: &str) -> bool {
    matches!(
        segments(path).as_slice(),
        ["_matrix", "app", _, "transactions", _]
    )
}

/// Room ids named by the path and by the events of a transaction body.
fn room_ids(ctx: &RequestContext) -> Vec<String> {
    let mut rooms = room_ids_in_path(ctx.path());
    let events = ctx
        .body_json()
        .and_then(|b| b.get("events"))
        .and_then(Value::as_array);
    for event in events.into_iter().flatten() {
        if let Some(room_id) = event.get("room_id").and_then(Value::as_str) {
            if !rooms.iter().any(|r| r == room_id) {
                rooms.push(room_id.to_string());
            }
        }
    }
    rooms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::model::BridgeStatus;
    use crate::registry::{BridgeRegistry, StaticBridgeStore};
    use crate::request_log::MemoryRequestLogger;
    use crate::transactions::TransactionRouter;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use http_body_util::Full;
    use std::sync::Arc;
    use std::time::Duration;

    fn response(status: StatusCode, body: &'static str) -> ProxyResult<ProxyResponse> {
        Ok(ProxyResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        })
    }

    #[test]
    fn test_path_kinds() {
        assert!(is_ping("/_matrix/app/v1/ping"));
        assert!(!is_ping("/_matrix/app/v1/transactions/1"));
        assert!(is_transaction("/_matrix/app/v1/transactions/1"));
        assert!(!is_transaction("/_matrix/app/v1/users/@a:hs"));
    }

    #[test]
    fn test_pick_response_all_succeed() {
        let picked = pick_response(vec![
            response(StatusCode::OK, "first"),
            response(StatusCode::OK, "second"),
        ])
        .unwrap();
        assert_eq!(picked.body.as_ref(), b"first");
    }

    #[test]
    fn test_pick_response_first_failure_wins() {
        let picked = pick_response(vec![
            response(StatusCode::OK, "first"),
            response(StatusCode::INTERNAL_SERVER_ERROR, "second"),
            Err(ProxyError::upstream("refused")),
        ])
        .unwrap();
        assert_eq!(picked.status, StatusCode::INTERNAL_SERVER_ERROR);

        let err = pick_response(vec![
            response(StatusCode::OK, "first"),
            Err(ProxyError::upstream_timeout("slow")),
        ])
        .unwrap_err();
        assert_eq!(err.status_code(), 504);
    }

    #[tokio::test]
    async fn test_ping_for_stopped_bridge_is_not_routed() {
        let stopped = BridgeInstance {
            bridge_id: "1".to_string(),
            bridge_type: "whatsapp".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            as_token: "as-1".to_string(),
            hs_token: "hs-1".to_string(),
            homeserver_id: "local".to_string(),
            status: BridgeStatus::Stopped,
        };
        let registry = BridgeRegistry::new(
            Arc::new(StaticBridgeStore::new(vec![stopped], Vec::new())),
            Duration::from_secs(30),
        );
        let router = TransactionRouter::in_memory(Duration::from_secs(60));
        router.record_ping("p1", "1").await.unwrap();
        let service =
            HomeserverService::new(ProxyState::new(ProxyConfig::default(), registry, router).unwrap());

        let req = http::Request::post("/homeserver/_matrix/app/v1/ping")
            .body(Full::new(Bytes::from_static(br#"{"transaction_id":"p1"}"#)))
            .unwrap();
        let ctx = RequestContext::create(
            req,
            &ProxyConfig::default(),
            "homeserver",
            Arc::new(MemoryRequestLogger::new()),
        )
        .await
        .unwrap();

        let err = service.resolve_targets(&ctx).await.unwrap_err();
        assert!(err.is_unhandled());
        assert_eq!(err.status_code(), 404);
    }
}
