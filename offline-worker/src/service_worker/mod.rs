//! Service Worker Module
//!
//! The offline resource cache manager. A host adapts its own event model to
//! the three entry points of [`OfflineWorker`]:
//!
//! - [`OfflineWorker::install`]: populate the current generation, then ask
//!   the host to let this worker take over without waiting.
//! - [`OfflineWorker::handle_fetch`]: answer a page request cache-first.
//! - [`OfflineWorker::activate`]: drop every other generation, then claim the
//!   open pages.

mod activate;
mod cache;
mod fetch;
mod install;
mod lifecycle;

pub use activate::*;
pub use cache::*;
pub use fetch::*;
pub use install::*;
pub use lifecycle::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use spin::Mutex;
use url::Url;

use crate::manifest::PrecacheManifest;
use crate::network::{Network, NetworkError};

/// Service Worker global ID counter
static NEXT_SW_ID: AtomicU64 = AtomicU64::new(1);

/// Service Worker ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    /// Create a new unique ID
    pub fn new() -> Self {
        Self(NEXT_SW_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get raw value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Service Worker error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    /// Lifecycle entry point called in the wrong state
    InvalidStateTransition {
        from: ServiceWorkerState,
        to: ServiceWorkerState,
    },
    /// Operation needs an activated worker
    NotActive(ServiceWorkerState),
    /// Manifest rejected at construction
    InvalidManifest(String),
}

impl core::fmt::Display for ServiceWorkerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ServiceWorkerError::InvalidStateTransition { from, to } => {
                write!(f, "invalid state transition {:?} -> {:?}", from, to)
            }
            ServiceWorkerError::NotActive(state) => {
                write!(f, "worker is not active (state {:?})", state)
            }
            ServiceWorkerError::InvalidManifest(s) => write!(f, "invalid manifest: {}", s),
        }
    }
}

impl std::error::Error for ServiceWorkerError {}

/// Signals a worker sends to the environment hosting it.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Let `worker` replace the active worker without waiting for open pages
    /// to release it.
    async fn skip_waiting(&self, worker: ServiceWorkerId);

    /// Make `worker` the controller of every open page in its scope.
    async fn claim_clients(&self, worker: ServiceWorkerId);
}

/// Host for a worker that is driven directly, with no pages to hand over.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHost;

#[async_trait]
impl WorkerHost for DetachedHost {
    async fn skip_waiting(&self, _worker: ServiceWorkerId) {}

    async fn claim_clients(&self, _worker: ServiceWorkerId) {}
}

/// The offline resource cache manager for one cache generation.
pub struct OfflineWorker {
    id: ServiceWorkerId,
    manifest: PrecacheManifest,
    /// URL the worker script was served from
    location: Url,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    host: Arc<dyn WorkerHost>,
    lifecycle: Mutex<LifecycleManager>,
}

impl OfflineWorker {
    pub fn new(
        manifest: PrecacheManifest,
        location: Url,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        host: Arc<dyn WorkerHost>,
    ) -> Result<Self, ServiceWorkerError> {
        manifest
            .validate()
            .map_err(|e| ServiceWorkerError::InvalidManifest(e.to_string()))?;

        let id = ServiceWorkerId::new();
        Ok(Self {
            id,
            manifest,
            location,
            storage,
            network,
            host,
            lifecycle: Mutex::new(LifecycleManager::new(id)),
        })
    }

    /// Get the worker ID
    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    /// Name of the generation this worker owns.
    pub fn cache_name(&self) -> &str {
        &self.manifest.cache_name
    }

    pub fn manifest(&self) -> &PrecacheManifest {
        &self.manifest
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    /// Directory of the worker script; pages under it are controlled.
    pub fn scope(&self) -> Url {
        self.location.join("./").unwrap_or_else(|_| self.location.clone())
    }

    /// Check if a page URL falls within this worker's scope
    pub fn in_scope(&self, page_url: &str) -> bool {
        page_url.starts_with(self.scope().as_str())
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Get current state
    pub fn state(&self) -> ServiceWorkerState {
        self.lifecycle.lock().state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ServiceWorkerState::Activated
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.lifecycle.lock().skip_waiting_requested()
    }

    pub fn clients_claimed(&self) -> bool {
        self.lifecycle.lock().clients_claimed()
    }

    /// Register a listener for lifecycle events.
    ///
    /// Listeners run after the worker's state has been updated and may call
    /// back into the worker.
    pub fn on_lifecycle_event(&self, listener: LifecycleListener) {
        self.lifecycle.lock().add_listener(listener);
    }

    /// Lifecycle events dispatched so far, oldest first.
    pub fn pending_events(&self) -> Vec<LifecycleEvent> {
        self.lifecycle.lock().pending_events().to_vec()
    }

    pub fn clear_pending_events(&self) {
        self.lifecycle.lock().clear_pending();
    }

    /// Apply `change` under the lifecycle lock, then deliver its events with
    /// the lock released.
    fn advance<F>(&self, change: F) -> Result<(), ServiceWorkerError>
    where
        F: FnOnce(&mut LifecycleManager) -> Result<Vec<LifecycleEvent>, ServiceWorkerError>,
    {
        let (events, listeners) = {
            let mut lifecycle = self.lifecycle.lock();
            let events = change(&mut *lifecycle)?;
            (events, lifecycle.listeners())
        };
        notify(&listeners, &events);
        Ok(())
    }

    /// Install: populate the current generation, then skip waiting.
    ///
    /// Individual resources that cannot be fetched or stored are reported,
    /// never fatal.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.advance(|lifecycle| lifecycle.transition(ServiceWorkerState::Installing))?;

        let report = precache(
            self.storage.as_ref(),
            self.network.as_ref(),
            &self.manifest,
            &self.location,
        )
        .await;

        self.advance(|lifecycle| {
            let events = lifecycle.transition(ServiceWorkerState::Installed)?;
            lifecycle.skip_waiting()?;
            Ok(events)
        })?;
        self.host.skip_waiting(self.id).await;

        Ok(report)
    }

    /// Fetch interception: cache first, then network with backfill.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, NetworkError> {
        respond(
            self.storage.as_ref(),
            self.network.as_ref(),
            &self.manifest.cache_name,
            request,
        )
        .await
    }

    /// Activate: delete every other generation, then claim open pages.
    pub async fn activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        self.advance(|lifecycle| lifecycle.transition(ServiceWorkerState::Activating))?;

        let report = prune_generations(self.storage.as_ref(), &self.manifest.cache_name).await;

        self.advance(|lifecycle| lifecycle.transition(ServiceWorkerState::Activated))?;
        self.host.claim_clients(self.id).await;
        self.advance(|lifecycle| lifecycle.claim())?;

        Ok(report)
    }

    /// Mark this worker as replaced.
    pub fn retire(&self) -> Result<(), ServiceWorkerError> {
        self.advance(|lifecycle| lifecycle.transition(ServiceWorkerState::Redundant))
    }
}
