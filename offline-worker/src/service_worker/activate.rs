//! Activation-time removal of stale cache generations.

use super::cache::{CacheError, CacheStorage};
use crate::policy::BulkReport;

/// Generations deleted (succeeded) or left behind (failed).
pub type ActivateReport = BulkReport<CacheError>;

/// Delete every generation whose name is not `current`.
///
/// Best-effort per generation. `current` is never passed to `delete`.
pub async fn prune_generations(storage: &dyn CacheStorage, current: &str) -> ActivateReport {
    let mut report = ActivateReport::new("activate");

    let names = match storage.keys().await {
        Ok(names) => names,
        Err(e) => {
            log::warn!("[ServiceWorker] could not list cache generations: {}", e);
            return report;
        }
    };

    for name in names.into_iter().filter(|name| name != current) {
        // A generation that is already gone counts as deleted.
        let result = storage.delete(&name).await.map(|_| ());
        report.record(name, result);
    }

    if !report.succeeded().is_empty() {
        log::info!(
            "[ServiceWorker] removed stale generations {:?}, keeping {}",
            report.succeeded(),
            current
        );
    }
    report
}
