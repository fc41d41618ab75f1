//! Bridge Proxy - one appservice registration for many Matrix bridges
//!
//! A homeserver knows a single application service. The proxy sits between
//! that homeserver and any number of bridge processes, giving each bridge
//! its own namespace of encoded user ids and routing traffic both ways.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  /bridge/{path}   ┌──────────────┐   plain ids    ┌──────────────┐
//!  │  Bridge A    │ ────────────────► │              │ ─────────────► │              │
//!  │  Bridge B    │                   │ Bridge Proxy │                │  Homeserver  │
//!  │  ...         │ ◄──────────────── │              │ ◄───────────── │              │
//!  └──────────────┘   encoded ids     └──────────────┘ /homeserver/.. └──────────────┘
//! ```
//!
//! The homeserver only ever sees plain ids such as `@alice:hs`. Bridge
//! `whatsapp_1` sees the same user as `@_bridge_manager__whatsapp_1__alice:hs`;
//! the proxy encodes ids on the way to a bridge and strips the encoding on
//! the way back.
//!
//! # Features
//!
//! - **Identity rewriting**: user ids in paths, queries and JSON bodies
//! - **Routing**: by token, ping transaction, encoded identity, transaction
//!   record or room record
//! - **Fan-out**: transactions that concern several bridges reach each of them
//! - **Request log**: one row per inbound request, in memory or as JSON lines
//! - **Telemetry**: structured logging and Prometheus metrics
//!
//! # Example Usage
//!
//! ```bash
//! $ bridge-proxy --config /etc/bridge-proxy/proxy.toml
//!
//! $ BRIDGE_PROXY_LISTEN_PORT=9000 bridge-proxy
//! ```

#![doc(html_root_url = "https://docs.rs/bridge-proxy/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod headers;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod model;
pub mod proxy;
pub mod registry;
pub mod request_log;
pub mod server;
pub mod service;
pub mod transactions;

pub use config::{ProxyConfig, ProxyConfigBuilder};
pub use context::{RequestContext, RequestId, RequestState, Resolution};
pub use error::{ErrorResponse, ProxyError, ProxyResult};
pub use health::{HealthChecker, HealthStatus, LivenessReport, ReadinessReport};
pub use identity::{DecodedIdentity, Direction, IdentityCodec};
pub use model::{BridgeInstance, BridgeStatus, HomeserverInstance, RequestSource};
pub use proxy::{ProxyClient, ProxyRequest, ProxyResponse};
pub use registry::{BridgeRegistry, BridgeStore, FileBridgeStore, StaticBridgeStore};
pub use request_log::{
    JsonlRequestLogger, LoggedRequest, MemoryRequestLogger, RequestFilter, RequestLogger,
};
pub use server::ProxyServer;
pub use service::{BridgeService, Forwarder, HomeserverService, ProxyState};
pub use transactions::{CorrelationStore, MemoryCorrelationStore, TransactionRouter};

/// Proxy version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
