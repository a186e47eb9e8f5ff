//! Per-page content extraction and page-subset export.
//!
//! [`PdfBackend`] is the seam between the pipeline and the PDF engine. The
//! production implementation, [`PdfiumBackend`], opens the document bytes
//! read-only on every call, so calls may run out of order or concurrently
//! against the same document without sharing any mutable state.
//!
//! ## Why blocking?
//!
//! pdfium keeps thread-local state and is not async-safe. Backend methods are
//! plain synchronous functions; the async pipeline calls them through
//! `tokio::task::spawn_blocking` (see [`crate::pipeline::payload`]).
//!
//! ## Tables
//!
//! pdfium has no table model, only positioned text runs. [`detect_tables`]
//! rebuilds simple grid tables from geometry: runs are grouped into lines by
//! vertical position, split into cells wherever the horizontal gap is wider
//! than the line height, and consecutive multi-cell lines with the same cell
//! count become one table.

use crate::error::ExtractError;
use crate::model::{Document, ExtractionSegment, Table};
use pdfium_render::prelude::*;
use tracing::debug;

/// Read-only access to a PDF's pages.
pub trait PdfBackend: Send + Sync {
    /// Number of pages in `content`.
    fn page_count(&self, name: &str, content: &[u8]) -> Result<usize, ExtractError>;

    /// Text and tables of one 1-based page.
    ///
    /// Fails with [`ExtractError::PageOutOfRange`] when `page` is 0 or past
    /// the last page. A page without extractable text yields an empty
    /// segment, not an error.
    fn extract_page(&self, document: &Document, page: usize)
        -> Result<ExtractionSegment, ExtractError>;

    /// A standalone PDF holding exactly `pages` (1-based), in the given
    /// order, with page content untouched.
    fn export_pages(&self, document: &Document, pages: &[usize]) -> Result<Vec<u8>, ExtractError>;
}

/// Check `page` against a document's page count.
pub fn check_page(page: usize, total: usize) -> Result<(), ExtractError> {
    if page < 1 || page > total {
        return Err(ExtractError::PageOutOfRange { page, total });
    }
    Ok(())
}

// ── pdfium implementation ────────────────────────────────────────────────

/// [`PdfBackend`] backed by the pdfium library.
///
/// The library is located (and downloaded on first use) through
/// `pdfium-auto`; set `PDFIUM_LIB_PATH` to use an existing copy.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    password: Option<String>,
}

impl PdfiumBackend {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    fn bind() -> Result<Pdfium, ExtractError> {
        pdfium_auto::bind_pdfium_silent()
            .map_err(|e| ExtractError::PdfiumBindingFailed(e.to_string()))
    }

    fn open<'a>(
        &self,
        pdfium: &'a Pdfium,
        name: &str,
        content: &'a [u8],
    ) -> Result<PdfDocument<'a>, ExtractError> {
        pdfium
            .load_pdf_from_byte_slice(content, self.password.as_deref())
            .map_err(|e| ExtractError::CorruptPdf {
                name: name.to_string(),
                detail: format!("{:?}", e),
            })
    }
}

impl PdfBackend for PdfiumBackend {
    fn page_count(&self, name: &str, content: &[u8]) -> Result<usize, ExtractError> {
        let pdfium = Self::bind()?;
        let document = self.open(&pdfium, name, content)?;
        Ok(document.pages().len() as usize)
    }

    fn extract_page(
        &self,
        document: &Document,
        page: usize,
    ) -> Result<ExtractionSegment, ExtractError> {
        let pdfium = Self::bind()?;
        let pdf = self.open(&pdfium, &document.name, &document.content)?;
        let pages = pdf.pages();
        check_page(page, pages.len() as usize)?;

        let pdf_page = pages
            .get((page - 1) as u16)
            .map_err(|e| ExtractError::CorruptPdf {
                name: document.name.clone(),
                detail: format!("page {page}: {:?}", e),
            })?;

        // No text layer (e.g. a scanned page) is an empty page, not a failure.
        let (text, fragments) = match pdf_page.text() {
            Ok(page_text) => {
                let fragments: Vec<TextFragment> = page_text
                    .segments()
                    .iter()
                    .map(|segment| TextFragment::new(segment.text(), segment.bounds()))
                    .collect();
                (page_text.all(), fragments)
            }
            Err(e) => {
                debug!("Page {}: no text layer ({:?})", page, e);
                (String::new(), Vec::new())
            }
        };

        let tables = detect_tables(&fragments);
        debug!(
            "Page {}: {} chars, {} fragments, {} tables",
            page,
            text.len(),
            fragments.len(),
            tables.len()
        );

        Ok(ExtractionSegment { page, text, tables })
    }

    fn export_pages(&self, document: &Document, pages: &[usize]) -> Result<Vec<u8>, ExtractError> {
        let pdfium = Self::bind()?;
        let source = self.open(&pdfium, &document.name, &document.content)?;
        let total = source.pages().len() as usize;
        for &page in pages {
            check_page(page, total)?;
        }

        let corrupt = |detail: String| ExtractError::CorruptPdf {
            name: document.name.clone(),
            detail,
        };

        let mut subset = pdfium
            .create_new_pdf()
            .map_err(|e| corrupt(format!("create subset: {:?}", e)))?;

        for (dest, &page) in pages.iter().enumerate() {
            subset
                .pages_mut()
                .copy_page_from_document(
                    &source,
                    (page - 1) as u16,
                    dest as u16,
                )
                .map_err(|e| corrupt(format!("copy page {page}: {:?}", e)))?;
        }

        let bytes = subset
            .save_to_bytes()
            .map_err(|e| corrupt(format!("save subset: {:?}", e)))?;
        debug!("Exported pages {:?} → {} bytes", pages, bytes.len());
        Ok(bytes)
    }
}

// ── Table detection ──────────────────────────────────────────────────────

/// A run of text with its bounding box in PDF points (origin bottom-left).
#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    pub text: String,
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

impl TextFragment {
    pub fn new(text: String, bounds: PdfRect) -> Self {
        Self {
            text,
            left: bounds.left().value,
            right: bounds.right().value,
            top: bounds.top().value,
            bottom: bounds.bottom().value,
        }
    }

    fn height(&self) -> f32 {
        (self.top - self.bottom).abs()
    }

    fn mid_y(&self) -> f32 {
        (self.top + self.bottom) / 2.0
    }
}

/// Rebuild grid tables from positioned text fragments.
pub fn detect_tables(fragments: &[TextFragment]) -> Vec<Table> {
    let lines = group_lines(fragments);

    let mut tables = Vec::new();
    let mut current: Vec<Vec<String>> = Vec::new();

    for line in lines {
        let cells = split_cells(&line);
        let continues = current
            .first()
            .map(|first| first.len() == cells.len())
            .unwrap_or(false);

        if cells.len() >= 2 && (current.is_empty() || continues) {
            current.push(cells);
            continue;
        }

        flush(&mut current, &mut tables);
        if cells.len() >= 2 {
            current.push(cells);
        }
    }
    flush(&mut current, &mut tables);
    tables
}

fn flush(current: &mut Vec<Vec<String>>, tables: &mut Vec<Table>) {
    // A lone multi-cell line is more likely a label/value pair than a table.
    if current.len() >= 2 {
        tables.push(Table::new(std::mem::take(current)));
    } else {
        current.clear();
    }
}

/// Group fragments into lines, top of page first, each line sorted by x.
fn group_lines(fragments: &[TextFragment]) -> Vec<Vec<&TextFragment>> {
    let mut sorted: Vec<&TextFragment> = fragments
        .iter()
        .filter(|f| !f.text.trim().is_empty())
        .collect();
    sorted.sort_by(|a, b| b.mid_y().total_cmp(&a.mid_y()));

    let mut lines: Vec<Vec<&TextFragment>> = Vec::new();
    for fragment in sorted {
        let same_line = lines.last().and_then(|l| l.first()).is_some_and(|anchor| {
            let tolerance = anchor.height().max(fragment.height()) / 2.0;
            (anchor.mid_y() - fragment.mid_y()).abs() <= tolerance
        });
        match lines.last_mut() {
            Some(line) if same_line => line.push(fragment),
            _ => lines.push(vec![fragment]),
        }
    }

    for line in &mut lines {
        line.sort_by(|a, b| a.left.total_cmp(&b.left));
    }
    lines
}

/// Merge a line's fragments into cells, splitting on wide horizontal gaps.
fn split_cells(line: &[&TextFragment]) -> Vec<String> {
    let mut cells: Vec<String> = Vec::new();
    let mut prev_right: Option<f32> = None;

    for fragment in line {
        let gap_limit = fragment.height().max(1.0);
        let text = fragment.text.trim();
        match (prev_right, cells.last_mut()) {
            (Some(right), Some(cell)) if fragment.left - right <= gap_limit => {
                if !cell.is_empty() && fragment.left - right > 0.5 {
                    cell.push(' ');
                }
                cell.push_str(text);
            }
            _ => cells.push(text.to_string()),
        }
        prev_right = Some(fragment.right);
    }
    cells
}
