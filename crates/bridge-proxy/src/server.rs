//! Proxy HTTP server.
//!
//! Routes `/homeserver/{path}` and `/bridge/{path}` to their forwarders and
//! serves the internal endpoints under `/_bridge_proxy/`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, field, info, warn, Instrument, Span};

use crate::context::{RequestContext, Resolution};
use crate::error::{ErrorResponse, ProxyError, ProxyResult};
use crate::health::HealthChecker;
use crate::headers::HEADER_REQUEST_ID;
use crate::metrics;
use crate::model::RequestSource;
use crate::proxy::ProxyResponse;
use crate::request_log::{RequestFilter, RequestLogger};
use crate::service::{BridgeService, Forwarder, HomeserverService, ProxyState};

const INTERNAL_PREFIX: &str = "/_bridge_proxy/";

/// Proxy server.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    state: ProxyState,
    logger: Arc<dyn RequestLogger>,
    health: Arc<HealthChecker>,
    bridge: Arc<BridgeService>,
    homeserver: Arc<HomeserverService>,
}

impl ProxyServer {
    /// Create a new proxy server.
    pub fn new(state: ProxyState, logger: Arc<dyn RequestLogger>) -> Self {
        let health = Arc::new(HealthChecker::new(
            state.registry.clone(),
            state.router.clone(),
        ));
        Self {
            bridge: Arc::new(BridgeService::new(state.clone())),
            homeserver: Arc::new(HomeserverService::new(state.clone())),
            state,
            logger,
            health,
        }
    }

    /// Request logger used by this server.
    pub fn logger(&self) -> &Arc<dyn RequestLogger> {
        &self.logger
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> ProxyResult<TcpListener> {
        let server = &self.state.config.server;
        let addr = SocketAddr::new(
            server
                .listen_addr
                .parse()
                .map_err(|e| ProxyError::configuration(format!("invalid listen address: {e}")))?,
            server.listen_port,
        );
        TcpListener::bind(addr).await.map_err(ProxyError::from)
    }

    /// Bind and serve until the process exits.
    pub async fn run(self) -> ProxyResult<()> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serve connections from `listener` until `shutdown` completes.
    ///
    /// Requests already in flight keep running to completion after the
    /// caller disconnects or the server stops accepting.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> ProxyResult<()> {
        let addr = listener.local_addr()?;
        metrics::init_metrics(&self.state.config.telemetry)?;
        info!("bridge proxy listening on {}", addr);

        let sweeper = self
            .state
            .router
            .spawn_sweeper(self.state.config.transactions.sweep_interval);
        self.health.set_ready(true);

        tokio::pin!(shutdown);
        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                () = &mut shutdown => break,
            };

            let server = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move {
                        // Detached so the outbound call and the final log
                        // write finish even if the caller goes away.
                        let handled = tokio::spawn(async move { server.handle(req).await }).await;
                        Ok::<_, Infallible>(handled.unwrap_or_else(|e| {
                            error!(error = %e, peer = %peer_addr, "request task failed");
                            plain_error(StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN", "internal error")
                        }))
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error: {}", e);
                }
            });
        }

        self.health.set_ready(false);
        sweeper.abort();
        info!("bridge proxy stopped accepting connections");
        Ok(())
    }

    /// Handle one request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        if let Some(endpoint) = path.strip_prefix(INTERNAL_PREFIX) {
            return self.handle_internal(endpoint, req.uri().query()).await;
        }

        let source = match path.trim_start_matches('/').split('/').next() {
            Some(s @ ("homeserver" | "bridge")) => s.to_string(),
            _ => {
                return plain_error(
                    StatusCode::NOT_FOUND,
                    "M_UNRECOGNIZED",
                    "only /homeserver/ and /bridge/ are proxied",
                )
            }
        };

        let span = tracing::info_span!(
            "request",
            request_id = field::Empty,
            source = %source,
            method = %req.method(),
            path = %path,
            bridge_id = field::Empty,
            resolution = field::Empty,
        );

        async move {
            let mut ctx = match RequestContext::create(
                req,
                &self.state.config,
                &source,
                self.logger.clone(),
            )
            .await
            {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(error = %e, "request rejected before classification");
                    let error = ErrorResponse::from(&e);
                    return json_response(
                        StatusCode::from_u16(e.status_code())
                            .unwrap_or(StatusCode::BAD_REQUEST),
                        &error,
                    );
                }
            };
            Span::current().record("request_id", field::display(ctx.request_id()));

            let forwarder: &dyn Forwarder = match ctx.source() {
                RequestSource::Bridge => self.bridge.as_ref(),
                RequestSource::Homeserver => self.homeserver.as_ref(),
            };
            let response = forwarder.handle(&mut ctx).await;

            metrics::record_request(ctx.source(), ctx.outcome(), response.status.as_u16());
            info!(
                status = response.status.as_u16(),
                outcome = ctx.outcome(),
                resolution = ctx.resolution().map(Resolution::as_str),
                duration_ms = %ctx.elapsed().as_millis(),
                "request completed"
            );

            into_http_response(response, &ctx.request_id().to_string())
        }
        .instrument(span)
        .await
    }

    async fn handle_internal(&self, endpoint: &str, query: Option<&str>) -> Response<Full<Bytes>> {
        match endpoint {
            "health" => json_response(StatusCode::OK, &self.health.liveness()),
            "ready" => {
                let report = self.health.readiness().await;
                let status = if report.ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                json_response(status, &report)
            }
            "metrics" => match metrics::render_metrics() {
                Some(body) => {
                    let mut response = Response::new(Full::new(Bytes::from(body)));
                    response.headers_mut().insert(
                        http::header::CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    response
                }
                None => plain_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "metrics are disabled"),
            },
            "version" => {
                let version = serde_json::json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": crate::VERSION,
                });
                json_response(StatusCode::OK, &version)
            }
            "requests" => {
                let filter: RequestFilter = match serde_urlencoded::from_str(query.unwrap_or("")) {
                    Ok(filter) => filter,
                    Err(e) => {
                        return plain_error(
                            StatusCode::BAD_REQUEST,
                            "M_INVALID_PARAM",
                            &format!("invalid filter: {e}"),
                        )
                    }
                };
                match self.logger.query(&filter).await {
                    Ok(rows) => json_response(StatusCode::OK, &rows),
                    Err(e) => plain_error(StatusCode::INTERNAL_SERVER_ERROR, e.errcode(), &e.to_string()),
                }
            }
            other => plain_error(
                StatusCode::NOT_FOUND,
                "M_NOT_FOUND",
                &format!("unknown internal endpoint: {other}"),
            ),
        }
    }
}

fn into_http_response(response: ProxyResponse, request_id: &str) -> Response<Full<Bytes>> {
    let mut http_response = Response::new(Full::new(response.body));
    *http_response.status_mut() = response.status;
    *http_response.headers_mut() = response.headers;
    if let Ok(value) = HeaderValue::from_str(request_id) {
        http_response
            .headers_mut()
            .insert(HEADER_REQUEST_ID.clone(), value);
    }
    http_response
}

/// Create a JSON response.
fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Create a Matrix error response not tied to a request context.
fn plain_error(status: StatusCode, errcode: &str, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &ErrorResponse::new(errcode, message))
}
