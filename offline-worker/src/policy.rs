//! Isolate-and-log policy for bulk operations.
//!
//! Every item of a bulk operation (pre-caching a resource, deleting a stale
//! generation) is attempted on its own. A failed item is logged at warn level
//! and recorded; it never stops the items after it.

use core::fmt;

/// Outcome of one bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReport<E> {
    operation: &'static str,
    succeeded: Vec<String>,
    failed: Vec<(String, E)>,
}

impl<E: fmt::Display> BulkReport<E> {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Record the result for one item. Failures are logged, never returned.
    pub fn record(&mut self, item: impl Into<String>, result: Result<(), E>) {
        let item = item.into();
        match result {
            Ok(()) => self.succeeded.push(item),
            Err(e) => {
                log::warn!("[ServiceWorker] {}: skipping {}: {}", self.operation, item, e);
                self.failed.push((item, e));
            }
        }
    }

    /// Name of the operation this report belongs to.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Items that completed, in processing order.
    pub fn succeeded(&self) -> &[String] {
        &self.succeeded
    }

    /// Items that failed with their reason, in processing order.
    pub fn failed(&self) -> &[(String, E)] {
        &self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

impl<E: fmt::Display> fmt::Display for BulkReport<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} of {} succeeded",
            self.operation,
            self.succeeded.len(),
            self.attempted()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_do_not_stop_later_items() {
        let mut report: BulkReport<String> = BulkReport::new("precache");
        report.record("a", Ok(()));
        report.record("b", Err(String::from("404")));
        report.record("c", Ok(()));

        assert_eq!(report.succeeded(), &["a".to_string(), "c".to_string()]);
        assert_eq!(report.failed(), &[("b".to_string(), "404".to_string())]);
        assert!(!report.is_complete());
        assert_eq!(report.attempted(), 3);
    }

    #[test]
    fn display_summarizes() {
        let mut report: BulkReport<String> = BulkReport::new("prune");
        report.record("v1", Ok(()));
        assert_eq!(report.to_string(), "prune: 1 of 1 succeeded");
        assert!(report.is_complete());
    }
}
