//! Offline Worker
//!
//! Offline resource cache manager for the jsPsych visual search experiment.
//! Once a page has loaded with the worker installed, every asset the
//! experiment needs is answered from a versioned cache, so the study keeps
//! running with no network.
//!
//! # Architecture
//!
//! - `service_worker`: the manager itself ([`OfflineWorker`]) with its
//!   install / fetch / activate entry points, lifecycle state machine, cache
//!   generations and the [`CacheStorage`] abstraction
//! - `manifest`: which generation is current and what to pre-cache
//! - `network`: the transport seam ([`Network`]), a fixed route table and,
//!   with the `http` feature, a `reqwest` transport
//! - `disk`: [`CacheStorage`] persisted to a directory tree
//! - `policy`: isolate-and-log reporting shared by the bulk phases
//!
//! The host environment owns event dispatch. It calls `install` when a new
//! worker version appears, `activate` once that worker takes over, and
//! `handle_fetch` for every request a controlled page makes.

pub mod disk;
pub mod manifest;
pub mod network;
pub mod policy;
pub mod service_worker;

pub use disk::DiskCacheStorage;
pub use manifest::{ManifestError, PrecacheManifest};
pub use network::{Network, NetworkError, StaticNetwork};
pub use policy::BulkReport;
pub use service_worker::{
    ActivateReport, CacheError, CacheMatchOptions, CacheStorage, DetachedHost, FetchOutcome,
    FetchSource, InstallReport, MemoryCacheStorage, OfflineWorker, Request, RequestMethod,
    Response, ServiceWorkerError, ServiceWorkerState, SkipReason, WorkerHost,
};

#[cfg(feature = "http")]
pub use network::HttpNetwork;
