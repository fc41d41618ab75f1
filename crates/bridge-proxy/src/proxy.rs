//! Outbound HTTP client shared by both forwarders.
//!
//! Every call is a single attempt. Failures are reported to the caller
//! immediately and are never retried here.

use bytes::Bytes;
use http::{header::HeaderMap, Method, StatusCode};
use reqwest::Client;

use crate::config::UpstreamSettings;
use crate::error::{ProxyError, ProxyResult};
use crate::headers::{bearer_value, filter_headers_for_upstream, PropagatedHeaders};
use crate::model::RequestDescriptor;

/// HTTP client for bridges and homeservers.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    client: Client,
}

impl ProxyClient {
    /// Create a new proxy client.
    pub fn new(settings: &UpstreamSettings) -> ProxyResult<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::configuration(format!("failed to create client: {e}")))?;

        Ok(Self { client })
    }

    /// Send `request` once.
    pub async fn forward(&self, request: &ProxyRequest) -> ProxyResult<ProxyResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url())
            .headers(request.outbound_headers());

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| transport_error(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| transport_error(&e))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

fn transport_error(e: &reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::upstream_timeout(format!("request timed out: {e}"))
    } else {
        ProxyError::upstream(format!("request failed: {e}"))
    }
}

/// Request to be forwarded to a bridge or homeserver.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// HTTP method.
    pub method: Method,
    /// Upstream base URL.
    pub base_url: String,
    /// Request path, percent-encoded, without query string.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Request headers, before filtering.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Option<Bytes>,
    /// Token presented to the upstream.
    pub bearer: Option<String>,
    /// Headers to propagate.
    pub propagated: PropagatedHeaders,
}

impl ProxyRequest {
    /// Create a new proxy request.
    pub fn new(
        method: Method,
        base_url: impl Into<String>,
        path: impl Into<String>,
        propagated: PropagatedHeaders,
    ) -> Self {
        Self {
            method,
            base_url: base_url.into(),
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            bearer: None,
            propagated,
        }
    }

    /// Set the query parameters.
    #[must_use]
    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    /// Set the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the bearer token presented upstream.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Full upstream URL.
    pub fn url(&self) -> String {
        let mut url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );
        if !self.query.is_empty() {
            if let Ok(query) = serde_urlencoded::to_string(&self.query) {
                url.push('?');
                url.push_str(&query);
            }
        }
        url
    }

    /// Headers actually sent: filtered inbound headers, the substituted
    /// token and the propagated headers.
    pub fn outbound_headers(&self) -> HeaderMap {
        let mut headers = filter_headers_for_upstream(&self.headers);
        if let Some(value) = self.bearer.as_deref().and_then(bearer_value) {
            headers.insert(http::header::AUTHORIZATION, value);
        }
        self.propagated.add_to_headers(&mut headers);
        headers
    }

    /// Descriptor of this request for the request log.
    pub fn descriptor(&self) -> RequestDescriptor {
        let body = self.body.as_deref().unwrap_or_default();
        RequestDescriptor::new(
            &self.method,
            self.url(),
            self.path.clone(),
            &self.query,
            &self.outbound_headers(),
            serde_json::from_slice(body).ok(),
            body.len(),
        )
    }
}

/// Response from upstream.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// HTTP status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl ProxyResponse {
    /// Check if the response indicates success.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
