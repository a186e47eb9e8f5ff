//! Progress-callback trait for per-batch extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the pipeline works through a document's batches.
//!
//! # Example
//!
//! ```rust
//! use manifest_extract::{ExtractionProgressCallback, ExtractionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     candidates: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_batch_complete(&self, _batch: usize, _total: usize, _pages: &[usize], candidates: usize) {
//!         self.candidates.fetch_add(candidates, Ordering::SeqCst);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { candidates: AtomicUsize::new(0) });
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes each batch.
///
/// Implementations must be `Send + Sync`: with `concurrency > 1` batch
/// events arrive concurrently and out of order. All methods default to
/// no-ops so callers only override what they care about.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once the page range has been planned.
    fn on_run_start(&self, total_batches: usize, total_pages: usize) {
        let _ = (total_batches, total_pages);
    }

    /// Called just before a batch's payload is built.
    ///
    /// `batch` is 1-indexed for display.
    fn on_batch_start(&self, batch: usize, total_batches: usize, pages: &[usize]) {
        let _ = (batch, total_batches, pages);
    }

    /// Called when a batch produced a parseable response.
    fn on_batch_complete(
        &self,
        batch: usize,
        total_batches: usize,
        pages: &[usize],
        candidates: usize,
    ) {
        let _ = (batch, total_batches, pages, candidates);
    }

    /// Called when a batch failed and contributes nothing.
    fn on_batch_error(&self, batch: usize, total_batches: usize, pages: &[usize], error: &str) {
        let _ = (batch, total_batches, pages, error);
    }

    /// Called once after reconciliation.
    fn on_run_complete(&self, stored: usize, dropped: usize, failed_batches: usize) {
        let _ = (stored, dropped, failed_batches);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        stored: AtomicUsize,
    }

    impl ExtractionProgressCallback for TrackingCallback {
        fn on_batch_start(&self, _batch: usize, _total: usize, _pages: &[usize]) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_complete(&self, _batch: usize, _total: usize, _pages: &[usize], _n: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_error(&self, _batch: usize, _total: usize, _pages: &[usize], _e: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_run_complete(&self, stored: usize, _dropped: usize, _failed: usize) {
            self.stored.store(stored, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(2, 5);
        cb.on_batch_start(1, 2, &[1, 2, 3]);
        cb.on_batch_complete(1, 2, &[1, 2, 3], 4);
        cb.on_batch_error(2, 2, &[4, 5], "timeout");
        cb.on_run_complete(4, 0, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_batch_start(1, 2, &[1, 2, 3]);
        tracker.on_batch_complete(1, 2, &[1, 2, 3], 3);
        tracker.on_batch_start(2, 2, &[4]);
        tracker.on_batch_error(2, 2, &[4], "rate limited");
        tracker.on_run_complete(3, 0, 1);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.stored.load(Ordering::SeqCst), 3);
    }
}
