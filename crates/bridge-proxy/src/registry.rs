//! Read-through bridge and homeserver lookups.
//!
//! Bridge records are owned by the orchestrator. The proxy only reads them,
//! through a [`BridgeStore`] backend, and keeps positive lookups in a
//! short-lived cache. Misses are never cached so a freshly provisioned bridge
//! is visible on its first request.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::model::{BridgeInstance, HomeserverInstance};

/// Backend holding bridge and homeserver records.
#[async_trait]
pub trait BridgeStore: Send + Sync + fmt::Debug {
    /// Find the bridge presenting `token` as its AS token.
    async fn bridge_by_token(&self, token: &str) -> ProxyResult<Option<BridgeInstance>>;

    /// Find a bridge by id.
    async fn bridge_by_id(&self, bridge_id: &str) -> ProxyResult<Option<BridgeInstance>>;

    /// Find a homeserver by id.
    async fn homeserver_by_id(&self, homeserver_id: &str)
        -> ProxyResult<Option<HomeserverInstance>>;

    /// Check the backend is reachable.
    async fn check(&self) -> ProxyResult<()> {
        Ok(())
    }
}

/// Registry contents as written by the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySnapshot {
    /// Bridge records.
    pub bridges: Vec<BridgeInstance>,
    /// Homeserver records.
    pub homeservers: Vec<HomeserverInstance>,
}

impl RegistrySnapshot {
    fn bridge_by_token(&self, token: &str) -> Option<BridgeInstance> {
        self.bridges.iter().find(|b| b.as_token == token).cloned()
    }

    fn bridge_by_id(&self, bridge_id: &str) -> Option<BridgeInstance> {
        self.bridges.iter().find(|b| b.bridge_id == bridge_id).cloned()
    }

    fn homeserver_by_id(&self, homeserver_id: &str) -> Option<HomeserverInstance> {
        self.homeservers
            .iter()
            .find(|h| h.homeserver_id == homeserver_id)
            .cloned()
    }
}

/// Store over records fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticBridgeStore {
    snapshot: RegistrySnapshot,
}

impl StaticBridgeStore {
    /// Create a store from records.
    pub fn new(bridges: Vec<BridgeInstance>, homeservers: Vec<HomeserverInstance>) -> Self {
        Self {
            snapshot: RegistrySnapshot {
                bridges,
                homeservers,
            },
        }
    }
}

#[async_trait]
impl BridgeStore for StaticBridgeStore {
    async fn bridge_by_token(&self, token: &str) -> ProxyResult<Option<BridgeInstance>> {
        Ok(self.snapshot.bridge_by_token(token))
    }

    async fn bridge_by_id(&self, bridge_id: &str) -> ProxyResult<Option<BridgeInstance>> {
        Ok(self.snapshot.bridge_by_id(bridge_id))
    }

    async fn homeserver_by_id(
        &self,
        homeserver_id: &str,
    ) -> ProxyResult<Option<HomeserverInstance>> {
        Ok(self.snapshot.homeserver_by_id(homeserver_id))
    }
}

/// Store re-reading an orchestrator-owned TOML or JSON file on every lookup.
#[derive(Debug, Clone)]
pub struct FileBridgeStore {
    path: PathBuf,
}

impl FileBridgeStore {
    /// Create a store over `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> ProxyResult<RegistrySnapshot> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ProxyError::storage(format!("failed to read registry {:?}: {e}", self.path))
        })?;

        match self.path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| ProxyError::storage(format!("invalid registry JSON: {e}"))),
            _ => toml::from_str(&content)
                .map_err(|e| ProxyError::storage(format!("invalid registry TOML: {e}"))),
        }
    }
}

#[async_trait]
impl BridgeStore for FileBridgeStore {
    async fn bridge_by_token(&self, token: &str) -> ProxyResult<Option<BridgeInstance>> {
        Ok(self.load().await?.bridge_by_token(token))
    }

    async fn bridge_by_id(&self, bridge_id: &str) -> ProxyResult<Option<BridgeInstance>> {
        Ok(self.load().await?.bridge_by_id(bridge_id))
    }

    async fn homeserver_by_id(
        &self,
        homeserver_id: &str,
    ) -> ProxyResult<Option<HomeserverInstance>> {
        Ok(self.load().await?.homeserver_by_id(homeserver_id))
    }

    async fn check(&self) -> ProxyResult<()> {
        self.load().await.map(|_| ())
    }
}

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    cached_at: Instant,
}

impl<T: Clone> Cached<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
        }
    }

    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.cached_at.elapsed() < ttl).then(|| self.value.clone())
    }
}

/// Cached, read-only view over a [`BridgeStore`].
#[derive(Debug)]
pub struct BridgeRegistry {
    store: Arc<dyn BridgeStore>,
    ttl: Duration,
    by_token: DashMap<String, Cached<BridgeInstance>>,
    by_id: DashMap<String, Cached<BridgeInstance>>,
    homeservers: DashMap<String, Cached<HomeserverInstance>>,
}

impl BridgeRegistry {
    /// Create a registry over `store`, trusting cached lookups for `ttl`.
    pub fn new(store: Arc<dyn BridgeStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            by_token: DashMap::new(),
            by_id: DashMap::new(),
            homeservers: DashMap::new(),
        }
    }

    /// Build the registry the configuration asks for.
    pub fn from_config(config: &ProxyConfig) -> Self {
        let store: Arc<dyn BridgeStore> = match config.registry.path {
            Some(ref path) => Arc::new(FileBridgeStore::new(path.clone())),
            None => Arc::new(StaticBridgeStore::new(
                config.bridges.clone(),
                config.homeservers.clone(),
            )),
        };
        Self::new(store, config.registry.cache_ttl)
    }

    /// Resolve the bridge presenting `token`.
    pub async fn resolve_by_token(&self, token: &str) -> ProxyResult<BridgeInstance> {
        if let Some(bridge) = self.by_token.get(token).and_then(|c| c.fresh(self.ttl)) {
            return Ok(bridge);
        }

        let bridge = self
            .store
            .bridge_by_token(token)
            .await?
            .ok_or_else(|| ProxyError::unknown_bridge("no bridge registered for the presented token"))?;
        debug!(bridge_id = %bridge.bridge_id, "bridge resolved from store by token");
        self.remember(&bridge);
        Ok(bridge)
    }

    /// Resolve a bridge by id.
    pub async fn resolve_by_id(&self, bridge_id: &str) -> ProxyResult<BridgeInstance> {
        if let Some(bridge) = self.by_id.get(bridge_id).and_then(|c| c.fresh(self.ttl)) {
            return Ok(bridge);
        }

        let bridge = self
            .store
            .bridge_by_id(bridge_id)
            .await?
            .ok_or_else(|| ProxyError::unknown_bridge(format!("no bridge with id '{bridge_id}'")))?;
        self.remember(&bridge);
        Ok(bridge)
    }

    /// Resolve a homeserver by id.
    pub async fn resolve_homeserver(&self, homeserver_id: &str) -> ProxyResult<HomeserverInstance> {
        if let Some(homeserver) = self
            .homeservers
            .get(homeserver_id)
            .and_then(|c| c.fresh(self.ttl))
        {
            return Ok(homeserver);
        }

        let homeserver = self
            .store
            .homeserver_by_id(homeserver_id)
            .await?
            .ok_or_else(|| {
                ProxyError::unknown_homeserver(format!("no homeserver with id '{homeserver_id}'"))
            })?;
        self.homeservers
            .insert(homeserver_id.to_string(), Cached::new(homeserver.clone()));
        Ok(homeserver)
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.by_token.clear();
        self.by_id.clear();
        self.homeservers.clear();
    }

    /// Check the backing store is reachable.
    pub async fn check(&self) -> ProxyResult<()> {
        self.store.check().await
    }

    fn remember(&self, bridge: &BridgeInstance) {
        self.by_token
            .insert(bridge.as_token.clone(), Cached::new(bridge.clone()));
        self.by_id
            .insert(bridge.bridge_id.clone(), Cached::new(bridge.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BridgeStatus;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bridge(id: &str) -> BridgeInstance {
        BridgeInstance {
            bridge_id: id.to_string(),
            bridge_type: "whatsapp".to_string(),
            base_url: format!("http://bridge-{id}:29318"),
            as_token: format!("as-{id}"),
            hs_token: format!("hs-{id}"),
            homeserver_id: "local".to_string(),
            status: BridgeStatus::Active,
        }
    }

    fn homeserver() -> HomeserverInstance {
        HomeserverInstance {
            homeserver_id: "local".to_string(),
            base_url: "http://localhost:8008".to_string(),
            registration_token: "reg".to_string(),
            domain: "matrix.localhost.me".to_string(),
        }
    }

    #[derive(Debug, Default)]
    struct CountingStore {
        inner: StaticBridgeStore,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl BridgeStore for CountingStore {
        async fn bridge_by_token(&self, token: &str) -> ProxyResult<Option<BridgeInstance>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.bridge_by_token(token).await
        }

        async fn bridge_by_id(&self, bridge_id: &str) -> ProxyResult<Option<BridgeInstance>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.bridge_by_id(bridge_id).await
        }

        async fn homeserver_by_id(
            &self,
            homeserver_id: &str,
        ) -> ProxyResult<Option<HomeserverInstance>> {
            self.inner.homeserver_by_id(homeserver_id).await
        }
    }

    #[tokio::test]
    async fn test_resolve_by_token_and_id() {
        let store = StaticBridgeStore::new(vec![bridge("1"), bridge("2")], vec![homeserver()]);
        let registry = BridgeRegistry::new(Arc::new(store), Duration::from_secs(30));

        assert_eq!(registry.resolve_by_token("as-2").await.unwrap().bridge_id, "2");
        assert_eq!(registry.resolve_by_id("1").await.unwrap().as_token, "as-1");
        assert_eq!(
            registry.resolve_homeserver("local").await.unwrap().domain,
            "matrix.localhost.me"
        );
    }

    #[tokio::test]
    async fn test_unknown_lookups_fail() {
        let registry = BridgeRegistry::new(Arc::new(StaticBridgeStore::default()), Duration::from_secs(30));

        let err = registry.resolve_by_token("nope").await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownBridge { .. }));
        let err = registry.resolve_by_id("9").await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownBridge { .. }));
        let err = registry.resolve_homeserver("other").await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownHomeserver { .. }));
    }

    #[tokio::test]
    async fn test_lookups_are_cached() {
        let store = Arc::new(CountingStore {
            inner: StaticBridgeStore::new(vec![bridge("1")], vec![]),
            lookups: AtomicUsize::new(0),
        });
        let registry = BridgeRegistry::new(store.clone(), Duration::from_secs(30));

        registry.resolve_by_token("as-1").await.unwrap();
        registry.resolve_by_token("as-1").await.unwrap();
        // a token lookup also warms the id cache
        registry.resolve_by_id("1").await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

        registry.clear();
        registry.resolve_by_id("1").await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_misses_are_not_cached() {
        let store = Arc::new(CountingStore::default());
        let registry = BridgeRegistry::new(store.clone(), Duration::from_secs(30));

        assert!(registry.resolve_by_token("as-1").await.is_err());
        assert!(registry.resolve_by_token("as-1").await.is_err());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_entries_are_reloaded() {
        let store = Arc::new(CountingStore {
            inner: StaticBridgeStore::new(vec![bridge("1")], vec![]),
            lookups: AtomicUsize::new(0),
        });
        let registry = BridgeRegistry::new(store.clone(), Duration::ZERO);

        registry.resolve_by_id("1").await.unwrap();
        registry.resolve_by_id("1").await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_file_store_reads_orchestrator_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[bridges]]
bridge_id = "5"
bridge_type = "signal"
base_url = "http://signal:29328"
as_token = "as-5"
hs_token = "hs-5"
homeserver_id = "local"
status = "starting"

[[homeservers]]
homeserver_id = "local"
base_url = "http://localhost:8008"
registration_token = "reg"
domain = "matrix.localhost.me"
"#
        )
        .unwrap();

        let store = FileBridgeStore::new(file.path());
        assert!(store.check().await.is_ok());

        let bridge = store.bridge_by_token("as-5").await.unwrap().unwrap();
        assert_eq!(bridge.bridge_type, "signal");
        assert_eq!(bridge.status, BridgeStatus::Starting);
        assert!(store.bridge_by_id("6").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_storage_error() {
        let store = FileBridgeStore::new("/nonexistent/registry.toml");
        let err = store.check().await.unwrap_err();
        assert_eq!(err.category(), "storage");
    }
}
