//! # manifest-extract
//!
//! Extract structured cargo-manifest records from PDF documents with an LLM,
//! and reconcile them into a deduplicated store.
//!
//! A manifest PDF runs to dozens of pages of vessel lines: name, flag,
//! products, volume, weight, date. Page text is extracted deterministically,
//! grouped into small batches, and sent to a language model that returns
//! JSON. That JSON is untrusted: it may be fenced, nested, partially wrong
//! or not JSON at all. Each batch's response is normalised on its own, and
//! the surviving candidates are merged into the store with idempotent
//! upserts keyed by identity.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      local file or URL, `%PDF` check, stored as a Document
//!  ├─ 2. Batch      validate [start, end], chunk into batches of 3 pages
//!  ├─ 3. Payload    page text + tables (text mode) or a cut-down PDF (document mode)
//!  ├─ 4. Inference  concurrent calls with timeout, retry and backoff
//!  ├─ 5. Normalize  fenced / object / list / nested list → candidates
//!  └─ 6. Reconcile  weight check, YYYY-MM-DD dates, identities, upsert
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use manifest_extract::{CancelFlag, ExtractionConfig, Extractor, MemoryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let extractor = Extractor::with_store(ExtractionConfig::default(), Arc::new(MemoryStore::new()));
//!     let bytes = std::fs::read("manifest.pdf")?;
//!     let summary = extractor
//!         .upload("manifest.pdf", bytes, None, None, &CancelFlag::new())
//!         .await?;
//!     println!("{} entries stored, {} batches failed", summary.inserted.len(), summary.failures.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `manifest-extract` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! ```toml
//! manifest-extract = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod config;
pub mod error;
pub mod extract;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod reconcile;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancelFlag;
pub use config::{ExtractionConfig, ExtractionConfigBuilder, ExtractionMode};
pub use error::{BatchError, ExtractError, InferenceError};
pub use extract::Extractor;
pub use model::{
    BatchFailure, BatchOutcome, CandidateEntry, Document, DocumentSummary, ExtractionSegment,
    ManifestEntry, NewDocument, PageBatch, RunSummary, Table,
};
pub use pipeline::inference::{InferenceClient, LlmInferenceClient};
pub use pipeline::pdf::{PdfBackend, PdfiumBackend};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use reconcile::{plan_entries, reconcile, ReconcileReport};
pub use store::{DocumentStore, ManifestStore, MemoryStore};
