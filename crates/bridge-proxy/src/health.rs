//! Liveness and readiness reporting.
//!
//! Liveness only says the process is serving; it turns `degraded` when the
//! last registry check failed. Readiness checks the bridge registry and the
//! correlation store on every call and also requires the listener to be up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::registry::BridgeRegistry;
use crate::transactions::TransactionRouter;

/// Overall liveness of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Serving, and the registry answered the last check.
    Healthy,
    /// Serving, but the registry failed the last check.
    Degraded,
}

/// A dependency readiness depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// The HTTP listener.
    Listener,
    /// The bridge registry backend.
    Registry,
    /// The ping/transaction/room correlation store.
    CorrelationStore,
}

/// Outcome of checking one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    /// Checked component.
    pub component: Component,
    /// Whether it answered.
    pub up: bool,
    /// Failure reason or a short note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// How long the check took.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ComponentCheck {
    fn up(component: Component) -> Self {
        Self {
            component,
            up: true,
            detail: None,
            latency_ms: None,
        }
    }

    fn down(component: Component, detail: impl Into<String>) -> Self {
        Self {
            component,
            up: false,
            detail: Some(detail.into()),
            latency_ms: None,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn timed(mut self, started: Instant) -> Self {
        self.latency_ms = Some(started.elapsed().as_millis() as u64);
        self
    }
}

/// What the last registry check saw.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegistryObservation {
    /// Whether the registry answered.
    pub reachable: bool,
    /// Seconds since the check ran.
    pub checked_seconds_ago: u64,
}

/// Body of `GET /_bridge_proxy/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Seconds since start.
    pub uptime_seconds: u64,
    /// Crate version.
    pub version: String,
    /// Last registry check, if one has run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryObservation>,
}

/// Body of `GET /_bridge_proxy/ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    /// Whether every check passed.
    pub ready: bool,
    /// Correlation records currently held, when the store answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_correlations: Option<usize>,
    /// Per-component results.
    pub checks: Vec<ComponentCheck>,
}

/// Health checker for the proxy.
#[derive(Debug)]
pub struct HealthChecker {
    started_at: Instant,
    listening: AtomicBool,
    last_registry_check: RwLock<Option<(Instant, bool)>>,
    registry: Arc<BridgeRegistry>,
    router: TransactionRouter,
}

impl HealthChecker {
    /// Create a checker over the proxy's registry and correlation store.
    pub fn new(registry: Arc<BridgeRegistry>, router: TransactionRouter) -> Self {
        Self {
            started_at: Instant::now(),
            listening: AtomicBool::new(false),
            last_registry_check: RwLock::new(None),
            registry,
            router,
        }
    }

    /// Record whether the listener is accepting connections.
    pub fn set_ready(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    /// Whether the listener is accepting connections.
    pub fn is_ready(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Time since the checker was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Liveness report. Never checks anything itself.
    pub fn liveness(&self) -> LivenessReport {
        let registry = (*self.last_registry_check.read()).map(|(at, reachable)| {
            RegistryObservation {
                reachable,
                checked_seconds_ago: at.elapsed().as_secs(),
            }
        });
        let status = match registry {
            Some(RegistryObservation {
                reachable: false, ..
            }) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };

        LivenessReport {
            status,
            uptime_seconds: self.uptime().as_secs(),
            version: crate::VERSION.to_string(),
            registry,
        }
    }

    /// Readiness report, checking the registry and the correlation store.
    pub async fn readiness(&self) -> ReadinessReport {
        let listener = if self.is_ready() {
            ComponentCheck::up(Component::Listener)
        } else {
            ComponentCheck::down(Component::Listener, "not accepting connections yet")
        };
        let registry = self.check_registry().await;

        let started = Instant::now();
        let (store, pending) = match self.router.pending().await {
            Ok(pending) => (ComponentCheck::up(Component::CorrelationStore).timed(started), Some(pending)),
            Err(e) => (
                ComponentCheck::down(Component::CorrelationStore, e.to_string()).timed(started),
                None,
            ),
        };

        let checks = vec![listener, registry, store];
        ReadinessReport {
            ready: checks.iter().all(|p| p.up),
            pending_correlations: pending,
            checks,
        }
    }

    /// Check the registry backend and remember the outcome for liveness.
    pub async fn check_registry(&self) -> ComponentCheck {
        let started = Instant::now();
        let result = self.registry.check().await;
        *self.last_registry_check.write() = Some((Instant::now(), result.is_ok()));

        match result {
            Ok(()) => ComponentCheck::up(Component::Registry).timed(started),
            Err(e) => ComponentCheck::down(Component::Registry, e.to_string()).timed(started),
        }
    }
}
