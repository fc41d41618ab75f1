//! Bridge → homeserver forwarding.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    outbound_body, outbound_query, propagated, rewrite_body, rewrite_response, room_ids_in_path,
    Forwarder, ProxyState,
};
use crate::context::{RequestContext, Resolution};
use crate::error::{ProxyError, ProxyResult};
use crate::headers::bearer_token;
use crate::identity::{Direction, IdentityCodec};
use crate::model::RequestSource;
use crate::proxy::{ProxyRequest, ProxyResponse};

/// Handles `/bridge/{path}`.
///
/// The bridge authenticates with its AS token. Encoded identities are
/// stripped before the request reaches the homeserver, which sees one
/// appservice, and the homeserver's reply is encoded back into the calling
/// bridge's namespace.
#[derive(Debug, Clone)]
pub struct BridgeService {
    state: ProxyState,
}

impl BridgeService {
    /// Create the service.
    pub fn new(state: ProxyState) -> Self {
        Self { state }
    }

    /// Replace the appservice id of a ping path with the registered one.
    fn ping_path(&self, path: &str) -> Option<String> {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            ["_matrix", "client", version, "appservice", _, "ping"] => Some(format!(
                "/_matrix/client/{version}/appservice/{}/ping",
                urlencoding::encode(&self.state.config.appservice.id)
            )),
            _ => None,
        }
    }
}

fn is_register(path: &str) -> bool {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    matches!(segments.as_slice(), ["_matrix", "client", _, "register"])
}

/// Rewrite the bare `username` localpart of a registration body.
fn rewrite_username(
    codec: &IdentityCodec,
    json: &mut serde_json::Value,
    domain: &str,
    direction: Direction<'_>,
) -> bool {
    let Some(serde_json::Value::String(username)) = json.get_mut("username") else {
        return false;
    };
    match codec.rewrite_localpart(username, domain, direction) {
        Some(rewritten) => {
            *username = rewritten;
            true
        }
        None => false,
    }
}

#[async_trait]
impl Forwarder for BridgeService {
    async fn forward(&self, ctx: &mut RequestContext) -> ProxyResult<ProxyResponse> {
        let state = &self.state;

        let token = bearer_token(ctx.headers(), ctx.query())
            .ok_or_else(|| ProxyError::unknown_bridge("request carries no access token"))?;
        let bridge = state.registry.resolve_by_token(&token).await?;
        if !bridge.is_routable() {
            return Err(ProxyError::unknown_bridge(format!(
                "bridge {} is {:?}",
                bridge.bridge_id, bridge.status
            )));
        }
        let homeserver = state.registry.resolve_homeserver(&bridge.homeserver_id).await?;
        ctx.attach_bridge(&bridge, Resolution::Token);

        let mut path = state
            .codec
            .rewrite_path(ctx.path(), Direction::ToHomeserver)
            .into_owned();
        if let Some(ping_path) = self.ping_path(&path) {
            path = ping_path;
            if let Some(transaction_id) = ctx.transaction_id() {
                state.router.record_ping(transaction_id, &bridge.bridge_id).await?;
                info!(
                    transaction_id,
                    bridge_id = %bridge.bridge_id,
                    "bridge ping recorded"
                );
            }
        }

        for room_id in room_ids_in_path(ctx.path()) {
            state.router.record_room(&room_id, &bridge.bridge_id).await?;
        }

        let mut request = ProxyRequest::new(
            ctx.method().clone(),
            homeserver.base_url.clone(),
            path,
            propagated(ctx),
        )
        .with_query(outbound_query(&state.codec, ctx, Direction::ToHomeserver))
        .with_headers(ctx.headers().clone())
        .with_bearer(homeserver.registration_token.clone());
        let body = if is_register(&request.path) {
            rewrite_body(ctx, |json| {
                let changed = state.codec.rewrite_json(json, Direction::ToHomeserver);
                rewrite_username(&state.codec, json, &homeserver.domain, Direction::ToHomeserver)
                    | changed
            })
        } else {
            outbound_body(&state.codec, ctx, Direction::ToHomeserver)
        };
        if let Some(body) = body {
            request = request.with_body(body);
        }

        ctx.mark_forwarded(serde_json::to_value(request.descriptor())?)
            .await;
        debug!(url = %request.url(), "forwarding to homeserver");

        let response = state.send(RequestSource::Bridge, &request).await?;
        Ok(rewrite_response(
            &state.codec,
            response,
            Direction::ToBridge {
                bridge: &bridge,
                domain: &homeserver.domain,
            },
        ))
    }
}
