//! Payload construction: turn one batch of pages into what the inference
//! service receives.
//!
//! * [`ExtractionMode::Text`]: extract and format every page, then join the
//!   segments into a single string. Cheap, and works with any chat model.
//! * [`ExtractionMode::Document`]: cut a reduced PDF containing exactly the
//!   batch's pages. More expensive, but the model sees the native layout
//!   instead of a lossy text rendering.
//!
//! Both paths are blocking pdfium work and run in `spawn_blocking`.

use crate::config::ExtractionMode;
use crate::error::ExtractError;
use crate::model::{Document, ExtractionSegment, PageBatch};
use crate::pipeline::format;
use crate::pipeline::pdf::PdfBackend;
use std::sync::Arc;
use tracing::debug;

/// What gets sent for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Formatted page segments, in page order.
    Text(String),
    /// A standalone PDF of the batch's pages.
    Document { bytes: Vec<u8>, pages: Vec<usize> },
}

impl Payload {
    /// Payload size in bytes, for logging.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Document { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the payload for `batch` in the requested mode.
pub async fn build_payload(
    backend: Arc<dyn PdfBackend>,
    document: Arc<Document>,
    batch: &PageBatch,
    mode: ExtractionMode,
) -> Result<Payload, ExtractError> {
    let pages = batch.pages.clone();
    let payload = match mode {
        ExtractionMode::Text => {
            let segments = extract_segments(backend, document, pages).await?;
            Payload::Text(format::join_segments(&segments))
        }
        ExtractionMode::Document => {
            let bytes = blocking({
                let pages = pages.clone();
                move || backend.export_pages(&document, &pages)
            })
            .await?;
            Payload::Document { bytes, pages }
        }
    };
    debug!(
        "Batch {}: built {} payload, {} bytes",
        batch.index + 1,
        mode,
        payload.len()
    );
    Ok(payload)
}

/// Extract the segments of `pages`, in order.
pub async fn extract_segments(
    backend: Arc<dyn PdfBackend>,
    document: Arc<Document>,
    pages: Vec<usize>,
) -> Result<Vec<ExtractionSegment>, ExtractError> {
    blocking(move || {
        pages
            .iter()
            .map(|&page| backend.extract_page(&document, page))
            .collect()
    })
    .await
}

async fn blocking<T, F>(f: F) -> Result<T, ExtractError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ExtractError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ExtractError::Internal(format!("PDF task panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Table;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    /// Backend that records calls and fabricates page content.
    #[derive(Default)]
    struct RecordingBackend {
        extracted: Mutex<Vec<usize>>,
    }

    impl PdfBackend for RecordingBackend {
        fn page_count(&self, _name: &str, _content: &[u8]) -> Result<usize, ExtractError> {
            Ok(5)
        }

        fn extract_page(
            &self,
            _document: &Document,
            page: usize,
        ) -> Result<ExtractionSegment, ExtractError> {
            crate::pipeline::pdf::check_page(page, 5)?;
            self.extracted.lock().unwrap().push(page);
            Ok(ExtractionSegment {
                page,
                text: format!("text of {page}"),
                tables: vec![Table::new(vec![vec!["h".into()], vec![page.to_string()]])],
            })
        }

        fn export_pages(&self, _document: &Document, pages: &[usize]) -> Result<Vec<u8>, ExtractError> {
            Ok(pages.iter().map(|&p| p as u8).collect())
        }
    }

    fn doc() -> Arc<Document> {
        Arc::new(Document {
            id: 1,
            name: "m.pdf".into(),
            content: b"%PDF".to_vec(),
            page_count: 5,
            created_on: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        })
    }

    #[tokio::test]
    async fn text_mode_concatenates_pages_in_order() {
        let backend = Arc::new(RecordingBackend::default());
        let batch = PageBatch { index: 1, pages: vec![4, 5] };
        let payload = build_payload(backend.clone(), doc(), &batch, ExtractionMode::Text)
            .await
            .unwrap();

        let Payload::Text(text) = payload else {
            panic!("expected text payload");
        };
        let p4 = text.find("--- Page 4 ---").unwrap();
        let p5 = text.find("--- Page 5 ---").unwrap();
        assert!(p4 < p5);
        assert!(text.contains("| 5 |"));
        assert_eq!(*backend.extracted.lock().unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn document_mode_exports_exactly_the_batch() {
        let backend = Arc::new(RecordingBackend::default());
        let batch = PageBatch { index: 0, pages: vec![1, 2, 3] };
        let payload = build_payload(backend.clone(), doc(), &batch, ExtractionMode::Document)
            .await
            .unwrap();

        assert_eq!(
            payload,
            Payload::Document {
                bytes: vec![1, 2, 3],
                pages: vec![1, 2, 3]
            }
        );
        assert!(backend.extracted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_page_surfaces_as_error() {
        let backend = Arc::new(RecordingBackend::default());
        let err = extract_segments(backend, doc(), vec![5, 6]).await.unwrap_err();
        assert!(matches!(err, ExtractError::PageOutOfRange { page: 6, total: 5 }));
    }
}
