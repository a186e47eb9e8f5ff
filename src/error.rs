//! Error types for the manifest-extract library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`ExtractError`] (**fatal**): the run cannot proceed at all (bad input
//!   file, invalid page range, rejected credentials, unknown document).
//!   Returned as `Err(ExtractError)` from the top-level operations, always
//!   before or instead of touching the manifest store.
//!
//! * [`BatchError`] (**non-fatal**): a single batch failed (rate limit,
//!   transport glitch, unparseable model output) but sibling batches are
//!   fine. Stored inside [`crate::model::BatchOutcome`] and surfaced in the
//!   [`crate::model::RunSummary`] so a partially successful document still
//!   yields every entry that could be reconciled.
//!
//! * [`InferenceError`]: the classification the inference client attaches
//!   to a failed external call. The pipeline maps it onto one of the other
//!   two: authentication failures become fatal, the rest become batch errors.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the manifest-extract library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes were read, but they are not a PDF.
    #[error("'{name}' is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { name: String, magic: Vec<u8> },

    // ── Page selection errors ─────────────────────────────────────────────
    /// A single requested page does not exist in the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// The requested `[start, end]` range cannot be satisfied.
    #[error("Invalid page range: {start} to {end} (document has {total} pages)")]
    InvalidRange {
        start: usize,
        end: usize,
        total: usize,
    },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{name}' could not be opened: {detail}")]
    CorruptPdf { name: String, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, set PDFIUM_LIB_PATH=/path/to/libpdfium.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Inference errors ──────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.) or
    /// cannot take the configured extraction mode's payload.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The inference service rejected our credentials. Retrying cannot help,
    /// so the whole run is aborted and nothing is reconciled.
    #[error("Authentication failed against the inference service: {detail}")]
    AuthenticationFailure { detail: String },

    // ── Store errors ──────────────────────────────────────────────────────
    /// No document with this identity exists in the document store.
    #[error("Document {id} not found")]
    DocumentNotFound { id: i64 },

    /// An entry referenced a document the store does not know about.
    #[error("Manifest entry {entry_id} references unknown document {document_id}")]
    OrphanEntry { entry_id: i64, document_id: i64 },

    /// The backing store failed.
    #[error("Store error: {0}")]
    Store(String),

    // ── Run control ───────────────────────────────────────────────────────
    /// The run was cancelled before any batch completed.
    #[error("Extraction of document {document_id} was cancelled")]
    Cancelled { document_id: i64 },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single batch.
///
/// The batch contributes zero candidates; everything else in the run
/// continues.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchError {
    /// The service throttled us and retries were exhausted.
    #[error("rate limited after {retries} retries: {detail}")]
    RateLimited { retries: u32, detail: String },

    /// Network or provider failure after retries were exhausted.
    #[error("transport error after {retries} retries: {detail}")]
    Transport { retries: u32, detail: String },

    /// Every attempt exceeded the per-call timeout.
    #[error("inference call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The response was not valid JSON. `raw` keeps the text for diagnostics.
    #[error("malformed response: {detail}")]
    MalformedResponse { detail: String, raw: String },

    /// The response was JSON but not an object, a list of objects, or a
    /// list of such lists.
    #[error("unexpected response shape: {detail}")]
    UnexpectedShape { detail: String },

    /// Page content could not be extracted for this batch.
    #[error("page extraction failed: {detail}")]
    Extraction { detail: String },

    /// The run was cancelled before this batch was dispatched.
    #[error("batch cancelled before dispatch")]
    Cancelled,
}

impl BatchError {
    /// Short machine-friendly label, used in logs and progress output.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::RateLimited { .. } => "rate_limited",
            BatchError::Transport { .. } => "transport",
            BatchError::Timeout { .. } => "timeout",
            BatchError::MalformedResponse { .. } => "malformed_response",
            BatchError::UnexpectedShape { .. } => "unexpected_shape",
            BatchError::Extraction { .. } => "extraction",
            BatchError::Cancelled => "cancelled",
        }
    }
}

/// Classified failure of one external inference call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    /// 401/403 or an invalid key. Terminal.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// 429 or quota exhaustion. Transient.
    #[error("rate limited: {detail}")]
    RateLimited {
        detail: String,
        retry_after_secs: Option<u64>,
    },

    /// Anything else the provider or the network threw at us. Transient.
    #[error("transport error: {0}")]
    Transport(String),

    /// The per-call timeout elapsed. Transient.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl InferenceError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, InferenceError::Authentication(_))
    }

    /// Map an exhausted transient failure onto the per-batch error reported
    /// in the run summary. Returns `None` for authentication failures, which
    /// are never batch-local.
    pub fn into_batch_error(self, retries: u32) -> Option<BatchError> {
        match self {
            InferenceError::Authentication(_) => None,
            InferenceError::RateLimited { detail, .. } => {
                Some(BatchError::RateLimited { retries, detail })
            }
            InferenceError::Transport(detail) => Some(BatchError::Transport { retries, detail }),
            InferenceError::Timeout { secs } => Some(BatchError::Timeout { secs }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_range_display() {
        let e = ExtractError::InvalidRange {
            start: 6,
            end: 5,
            total: 5,
        };
        let msg = e.to_string();
        assert!(msg.contains("6 to 5"), "got: {msg}");
        assert!(msg.contains("5 pages"), "got: {msg}");
    }

    #[test]
    fn page_out_of_range_display() {
        let e = ExtractError::PageOutOfRange { page: 9, total: 4 };
        assert!(e.to_string().contains("Page 9"));
    }

    #[test]
    fn authentication_is_not_transient() {
        assert!(!InferenceError::Authentication("bad key".into()).is_transient());
        assert!(InferenceError::Transport("reset".into()).is_transient());
        assert!(InferenceError::Timeout { secs: 3 }.is_transient());
    }

    #[test]
    fn exhausted_rate_limit_becomes_batch_error() {
        let e = InferenceError::RateLimited {
            detail: "429".into(),
            retry_after_secs: Some(10),
        };
        assert_eq!(
            e.into_batch_error(2),
            Some(BatchError::RateLimited {
                retries: 2,
                detail: "429".into()
            })
        );
        assert_eq!(
            InferenceError::Authentication("x".into()).into_batch_error(0),
            None
        );
    }

    #[test]
    fn batch_error_serialises_with_kind_tag() {
        let e = BatchError::MalformedResponse {
            detail: "expected value".into(),
            raw: "not json".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "malformed_response");
        assert_eq!(json["raw"], "not json");
        assert_eq!(e.kind(), "malformed_response");
    }
}
