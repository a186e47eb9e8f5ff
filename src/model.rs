//! Data model shared by every pipeline stage.
//!
//! Types fall into three groups:
//!
//! * **Stored**: [`Document`] and [`ManifestEntry`], owned by the store
//!   collaborators in [`crate::store`].
//! * **Transient**: [`PageBatch`], [`ExtractionSegment`], [`Table`] and
//!   [`CandidateEntry`], built and consumed within a single run.
//! * **Reporting**: [`BatchOutcome`] and [`RunSummary`], returned to callers
//!   so they can decide whether partial results are acceptable.

use crate::error::BatchError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ── Stored records ───────────────────────────────────────────────────────

/// A PDF held by the document store.
///
/// Immutable once created. Manifest entries reference it by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub page_count: usize,
    pub created_on: NaiveDate,
}

impl Document {
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id,
            name: self.name.clone(),
            page_count: self.page_count,
            created_on: self.created_on,
        }
    }
}

/// A document about to be created; the store assigns the identity.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub name: String,
    pub content: Vec<u8>,
    pub page_count: usize,
    pub created_on: NaiveDate,
}

/// Listing view of a [`Document`] without its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: i64,
    pub name: String,
    pub page_count: usize,
    pub created_on: NaiveDate,
}

/// Canonical stored cargo record.
///
/// `weight` is never absent: candidates without one are dropped during
/// reconciliation rather than stored with a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: i64,
    pub name: Option<String>,
    pub flag: Option<String>,
    pub products: Option<String>,
    pub volume: Option<f64>,
    pub weight: f64,
    pub date: Option<NaiveDate>,
    pub document_id: i64,
    /// 1-based page of the batch that produced this entry.
    pub page: usize,
}

// ── Transient pipeline values ────────────────────────────────────────────

/// An ordered group of 1-based page numbers processed in one external call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageBatch {
    /// Position of this batch within its run, starting at 0.
    pub index: usize,
    pub pages: Vec<usize>,
}

impl PageBatch {
    pub fn first_page(&self) -> Option<usize> {
        self.pages.first().copied()
    }

    pub fn contains(&self, page: usize) -> bool {
        self.pages.contains(&page)
    }
}

/// A rectangular grid of cells. The first row is the header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table, padding short rows with empty cells so it stays
    /// rectangular.
    pub fn new(mut rows: Vec<Vec<String>>) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        for row in &mut rows {
            row.resize(width, String::new());
        }
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.width() == 0
    }

    pub fn width(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }

    pub fn header(&self) -> Option<&[String]> {
        self.rows.first().map(Vec::as_slice)
    }

    pub fn body(&self) -> &[Vec<String>] {
        self.rows.get(1..).unwrap_or(&[])
    }
}

/// Everything extracted from one page: its plain text plus any tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSegment {
    pub page: usize,
    pub text: String,
    pub tables: Vec<Table>,
}

/// An untrusted record decoded from a model response.
///
/// Nothing here is validated; [`crate::reconcile`] decides what survives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub name: Option<String>,
    pub flag: Option<String>,
    pub products: Option<String>,
    pub volume: Option<f64>,
    pub weight: Option<f64>,
    pub date: Option<String>,
    /// Identity supplied by the model, if any.
    pub id: Option<i64>,
    /// Page the model attributed the record to, if any.
    pub page: Option<usize>,
}

// ── Reporting ────────────────────────────────────────────────────────────

/// Result of processing one batch: its candidates, or why it produced none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch: PageBatch,
    pub candidates: Vec<CandidateEntry>,
    /// Number of inference attempts made (0 when the batch never reached
    /// the service).
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: Option<BatchError>,
}

impl BatchOutcome {
    pub fn failed(batch: PageBatch, attempts: u32, duration_ms: u64, error: BatchError) -> Self {
        Self {
            batch,
            candidates: Vec::new(),
            attempts,
            duration_ms,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A batch that contributed nothing, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub pages: Vec<usize>,
    pub error: BatchError,
}

/// What one extraction run did to the manifest store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub document_id: i64,
    pub total_pages: usize,
    /// Pages belonging to batches that returned a usable response.
    pub processed_pages: usize,
    /// Entries inserted or updated by this run, in reconciliation order.
    pub inserted: Vec<ManifestEntry>,
    /// Entries in the whole store after the run.
    pub total_entries: usize,
    /// Candidates discarded for lacking a weight.
    pub dropped: usize,
    pub failures: Vec<BatchFailure>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Serde adapter storing raw bytes as a base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
