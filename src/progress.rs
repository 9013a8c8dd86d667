//! Progress-callback trait for batch publishing.
//!
//! Inject an [`Arc<dyn PublishProgressCallback>`] into
//! [`crate::dispatch::TaskExecutor::with_progress`] to receive events while a
//! render-and-publish task works through its pages.
//!
//! # Why callbacks instead of channels?
//!
//! The library does not know whether the host shows a terminal progress
//! bar, updates a chat message, or writes to a database. A `Send + Sync`
//! callback lets it forward events wherever it likes, including into a
//! channel of its own.
//!
//! # Example
//!
//! ```rust
//! use render_relay::PublishProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl PublishProgressCallback for Counter {
//!     fn on_page_published(&self, page_index: usize, total: usize, filename: &str) {
//!         let done = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{filename}: {page_index}/{total} ({done} sent)");
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called as a batch task publishes its pages.
///
/// All methods have no-op defaults so callers only override what they care
/// about.
pub trait PublishProgressCallback: Send + Sync {
    /// Called once after conversion and page selection.
    ///
    /// # Arguments
    /// * `total`: number of pages that will be published
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called when a page was delivered.
    ///
    /// # Arguments
    /// * `page_index`: 1-indexed page number in the source document
    /// * `total`:      pages in this batch
    /// * `filename`:   name the page was sent under
    fn on_page_published(&self, page_index: usize, total: usize, filename: &str) {
        let _ = (page_index, total, filename);
    }

    /// Called when a page could not be watermarked or delivered.
    fn on_page_failed(&self, page_index: usize, total: usize, error: &str) {
        let _ = (page_index, total, error);
    }

    /// Called once after every selected page has been attempted.
    fn on_batch_complete(&self, total: usize, published: usize) {
        let _ = (total, published);
    }
}

/// Ignores every event. The default when no callback is configured.
pub struct NoopProgressCallback;

impl PublishProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn PublishProgressCallback>;
