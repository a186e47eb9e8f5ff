//! Pipeline stages for manifest extraction.
//!
//! Each submodule implements exactly one step, so each can be tested on its
//! own and swapped without touching the others (the PDF backend and the
//! inference client are traits for that reason).
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ batch ──▶ pdf + format ──▶ payload ──▶ inference ──▶ normalize
//! (bytes)   (plan)    (segments)       (text|pdf)  (retry)       (candidates)
//! ```
//!
//! 1. [`input`]:     read a path or download a URL, check the `%PDF` magic
//! 2. [`batch`]:     validate `[start, end]` and chunk it into page batches
//! 3. [`pdf`]:       per-page text and table detection, page export;
//!    blocking pdfium work
//! 4. [`format`]:    render segments as page-marked text with escaped tables
//! 5. [`payload`]:   pick text or document mode for a batch
//! 6. [`inference`]: the only stage with network I/O: timeout, retry,
//!    error classification
//! 7. [`normalize`]: turn free-form model output into candidate entries
//!
//! Reconciliation into the store lives in [`crate::reconcile`].

pub mod batch;
pub mod format;
pub mod inference;
pub mod input;
pub mod normalize;
pub mod payload;
pub mod pdf;
