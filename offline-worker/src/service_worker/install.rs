//! Install-time pre-population of a cache generation.

use core::fmt;

use url::Url;

use super::cache::{CacheError, CacheStorage};
use super::fetch::{Request, RequestCache};
use crate::manifest::PrecacheManifest;
use crate::network::{Network, NetworkError};
use crate::policy::BulkReport;

/// Why a resource was left out of the generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Path or URL could not be resolved
    InvalidUrl(String),
    /// The fetch itself failed
    Network(NetworkError),
    /// The server answered with a non-2xx status
    Status(u16),
    /// The response could not be stored
    Storage(CacheError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidUrl(e) => write!(f, "invalid url ({})", e),
            SkipReason::Network(e) => write!(f, "{}", e),
            SkipReason::Status(status) => write!(f, "status {}", status),
            SkipReason::Storage(e) => write!(f, "{}", e),
        }
    }
}

/// Result of pre-caching. Items are absolute URLs (or the raw entry when it
/// could not be resolved).
pub type InstallReport = BulkReport<SkipReason>;

/// Fill `manifest.cache_name` with every resource the manifest lists.
///
/// Same-origin paths are resolved against `location` and fetched bypassing
/// intermediate caches; remote URLs follow with the default cache mode. Each
/// resource is isolated: one failure is logged and skipped, the rest still
/// install. This never fails as a whole.
pub async fn precache(
    storage: &dyn CacheStorage,
    network: &dyn Network,
    manifest: &PrecacheManifest,
    location: &Url,
) -> InstallReport {
    let mut report = InstallReport::new("install");

    if let Err(e) = storage.open(&manifest.cache_name).await {
        log::warn!(
            "[ServiceWorker] could not open cache {}: {}",
            manifest.cache_name,
            e
        );
    }

    for (path, resolved) in manifest.resolve_local(location) {
        match resolved {
            Ok(url) => {
                let result = fetch_and_store(
                    storage,
                    network,
                    &manifest.cache_name,
                    url.as_str(),
                    RequestCache::NoCache,
                )
                .await;
                report.record(url.as_str(), result);
            }
            Err(e) => report.record(path, Err(SkipReason::InvalidUrl(e.to_string()))),
        }
    }

    for (raw, resolved) in manifest.resolve_remote() {
        match resolved {
            Ok(url) => {
                let result = fetch_and_store(
                    storage,
                    network,
                    &manifest.cache_name,
                    url.as_str(),
                    RequestCache::Default,
                )
                .await;
                report.record(url.as_str(), result);
            }
            Err(e) => report.record(raw, Err(SkipReason::InvalidUrl(e.to_string()))),
        }
    }

    log::info!("[ServiceWorker] {} into {}", report, manifest.cache_name);
    report
}

async fn fetch_and_store(
    storage: &dyn CacheStorage,
    network: &dyn Network,
    cache_name: &str,
    url: &str,
    cache_mode: RequestCache,
) -> Result<(), SkipReason> {
    let request = Request::new(url).with_cache(cache_mode);
    let response = network
        .fetch(request.clone())
        .await
        .map_err(SkipReason::Network)?;

    if !response.ok() {
        return Err(SkipReason::Status(response.status));
    }

    // Stored under a plain GET key so page requests for the same URL match.
    storage
        .put(cache_name, &Request::new(url), response)
        .await
        .map_err(SkipReason::Storage)
}
