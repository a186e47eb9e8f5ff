//! Top-level operations: import, extract, list, export, inspect.
//!
//! An [`Extractor`] owns one configuration and the four collaborators the
//! pipeline needs (PDF backend, inference client, document store, manifest
//! store). Every public operation is a method on it.
//!
//! ## One extraction run
//!
//! ```text
//! get document ─▶ plan batches ─▶ ┬─ batch 1: payload ─▶ infer ─▶ normalize ─┐
//!                                 ├─ batch 2: ...                             ├─▶ sort ─▶ reconcile
//!                                 └─ batch N: ...                             ┘
//! ```
//!
//! Batches are independent and run with at most `config.concurrency` in
//! flight. Reconciliation starts only after every dispatched batch has
//! finished, and holds an exclusive section from the `max_identity` read to
//! the last upsert, so two runs never hand out the same synthetic identity.

use crate::cancel::CancelFlag;
use crate::config::ExtractionConfig;
use crate::error::{BatchError, ExtractError, InferenceError};
use crate::model::{
    BatchFailure, BatchOutcome, CandidateEntry, Document, DocumentSummary, ExtractionSegment,
    ManifestEntry, NewDocument, PageBatch, RunSummary,
};
use crate::pipeline::inference::{self, InferenceClient, LlmInferenceClient};
use crate::pipeline::pdf::{PdfBackend, PdfiumBackend};
use crate::pipeline::{batch, input, normalize, payload};
use crate::reconcile;
use crate::store::{DocumentStore, ManifestStore, MemoryStore};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Runs extraction against a pair of stores.
pub struct Extractor {
    config: ExtractionConfig,
    backend: Arc<dyn PdfBackend>,
    client: OnceCell<Arc<dyn InferenceClient>>,
    documents: Arc<dyn DocumentStore>,
    manifest: Arc<dyn ManifestStore>,
    reconcile_lock: Mutex<()>,
}

impl Extractor {
    /// Build an extractor from explicit collaborators.
    pub fn new(
        config: ExtractionConfig,
        backend: Arc<dyn PdfBackend>,
        client: Arc<dyn InferenceClient>,
        documents: Arc<dyn DocumentStore>,
        manifest: Arc<dyn ManifestStore>,
    ) -> Self {
        Self {
            config,
            backend,
            client: OnceCell::with_value(client),
            documents,
            manifest,
            reconcile_lock: Mutex::new(()),
        }
    }

    /// Build an extractor over one [`MemoryStore`], with pdfium as the PDF
    /// backend. The inference provider is resolved from `config` on the
    /// first extraction, so listing and inspection work without API keys.
    pub fn with_store(config: ExtractionConfig, store: Arc<MemoryStore>) -> Self {
        let backend = Arc::new(PdfiumBackend::new(config.password.clone()));
        Self {
            config,
            backend,
            client: OnceCell::new(),
            documents: store.clone(),
            manifest: store,
            reconcile_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    fn client(&self) -> Result<Arc<dyn InferenceClient>, ExtractError> {
        self.client
            .get_or_try_init(|| {
                info!(
                    "Resolving inference provider ({} prompt)",
                    inference::prompt_label(&self.config)
                );
                let client = LlmInferenceClient::from_config(&self.config)?;
                Ok(Arc::new(client) as Arc<dyn InferenceClient>)
            })
            .map(Arc::clone)
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Store a PDF and return the created document.
    pub async fn import_document(
        &self,
        name: impl Into<String>,
        content: Vec<u8>,
    ) -> Result<Document, ExtractError> {
        let name = name.into();
        let page_count = self.count_pages(&name, &content).await?;
        self.create_document(name, content, page_count).await
    }

    async fn count_pages(&self, name: &str, content: &[u8]) -> Result<usize, ExtractError> {
        input::ensure_pdf(name, content)?;
        let backend = Arc::clone(&self.backend);
        let (name, content) = (name.to_string(), content.to_vec());
        tokio::task::spawn_blocking(move || backend.page_count(&name, &content))
            .await
            .map_err(|e| ExtractError::Internal(format!("PDF task panicked: {}", e)))?
    }

    async fn create_document(
        &self,
        name: String,
        content: Vec<u8>,
        page_count: usize,
    ) -> Result<Document, ExtractError> {
        let document = self
            .documents
            .create(NewDocument {
                name,
                content,
                page_count,
                created_on: Utc::now().date_naive(),
            })
            .await?;
        info!(
            "Stored document {} '{}' ({} pages)",
            document.id, document.name, document.page_count
        );
        Ok(document)
    }

    pub async fn document(&self, id: i64) -> Result<Document, ExtractError> {
        self.documents.get(id).await
    }

    /// Stored documents, newest first.
    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>, ExtractError> {
        self.documents.list().await
    }

    /// The stored bytes of a document.
    pub async fn document_bytes(&self, id: i64) -> Result<Vec<u8>, ExtractError> {
        Ok(self.documents.get(id).await?.content)
    }

    /// Delete a document together with its manifest entries.
    pub async fn delete_document(&self, id: i64) -> Result<(), ExtractError> {
        let _guard = self.reconcile_lock.lock().await;
        self.documents.delete(id).await?;
        info!("Deleted document {}", id);
        Ok(())
    }

    /// A standalone PDF holding pages `start..=end` of a stored document.
    pub async fn export_pages(
        &self,
        id: i64,
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<Vec<u8>, ExtractError> {
        let document = Arc::new(self.documents.get(id).await?);
        let pages = selected_pages(document.page_count, start, end)?;
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.export_pages(&document, &pages))
            .await
            .map_err(|e| ExtractError::Internal(format!("PDF task panicked: {}", e)))?
    }

    /// Page segments as a text-mode request would see them. No inference.
    pub async fn inspect(
        &self,
        id: i64,
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<Vec<ExtractionSegment>, ExtractError> {
        let document = Arc::new(self.documents.get(id).await?);
        let pages = selected_pages(document.page_count, start, end)?;
        payload::extract_segments(Arc::clone(&self.backend), document, pages).await
    }

    // ── Manifest entries ─────────────────────────────────────────────────

    pub async fn list_entries(&self) -> Result<Vec<ManifestEntry>, ExtractError> {
        self.manifest.list_all().await
    }

    pub async fn entries_for_document(&self, id: i64) -> Result<Vec<ManifestEntry>, ExtractError> {
        self.documents.get(id).await?;
        self.manifest.list_for_document(id).await
    }

    // ── Extraction ───────────────────────────────────────────────────────

    /// Validate the range, store the PDF, then extract it.
    ///
    /// Nothing is stored when the range is invalid or no inference provider
    /// can serve the configured mode.
    pub async fn upload(
        &self,
        name: impl Into<String>,
        content: Vec<u8>,
        start: Option<usize>,
        end: Option<usize>,
        cancel: &CancelFlag,
    ) -> Result<RunSummary, ExtractError> {
        let name = name.into();
        let page_count = self.count_pages(&name, &content).await?;
        batch::plan(page_count, start, end, self.config.batch_size)?;
        self.client()?;
        let document = self.create_document(name, content, page_count).await?;
        self.extract_document(document.id, start, end, cancel).await
    }

    /// Extract manifest entries from pages `start..=end` of a stored
    /// document and reconcile them into the manifest store.
    ///
    /// Per-batch failures are reported in [`RunSummary::failures`]. Only an
    /// invalid range, an unknown document, rejected credentials or a store
    /// failure return `Err`. When `cancel` fires, unstarted batches are
    /// skipped and the finished ones are still reconciled.
    pub async fn extract_document(
        &self,
        id: i64,
        start: Option<usize>,
        end: Option<usize>,
        cancel: &CancelFlag,
    ) -> Result<RunSummary, ExtractError> {
        let run_start = Instant::now();
        let document = Arc::new(self.documents.get(id).await?);
        let batches = batch::plan(document.page_count, start, end, self.config.batch_size)?;
        let client = self.client()?;

        let total_batches = batches.len();
        let selected: usize = batches.iter().map(|b| b.pages.len()).sum();
        info!(
            "Extracting document {} '{}': {} pages in {} batches ({} mode, concurrency {})",
            document.id,
            document.name,
            selected,
            total_batches,
            self.config.mode,
            self.config.concurrency
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_start(total_batches, selected);
        }

        // A child flag lets an authentication failure stop this run's
        // scheduling without cancelling the caller's flag.
        let run_flag = cancel.child();
        let results: Vec<Result<BatchOutcome, ExtractError>> = stream::iter(batches.into_iter().map(|b| {
            self.run_batch(
                Arc::clone(&client),
                Arc::clone(&document),
                b,
                total_batches,
                &run_flag,
            )
        }))
        .buffer_unordered(self.config.concurrency)
        .collect()
        .await;

        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(result?);
        }
        outcomes.sort_by_key(|o| o.batch.index);

        let cancelled = cancel.is_cancelled();
        let succeeded: Vec<(PageBatch, Vec<CandidateEntry>)> = outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(|o| (o.batch.clone(), o.candidates.clone()))
            .collect();
        if cancelled && succeeded.is_empty() {
            warn!("Document {}: cancelled before any batch completed", document.id);
            return Err(ExtractError::Cancelled {
                document_id: document.id,
            });
        }

        let (report, total_entries) = {
            let _guard = self.reconcile_lock.lock().await;
            let existing_max = self.manifest.max_identity().await?;
            let report =
                reconcile::reconcile(self.manifest.as_ref(), &document, &succeeded, existing_max)
                    .await?;
            (report, self.manifest.count().await?)
        };

        let failures: Vec<BatchFailure> = outcomes
            .iter()
            .filter_map(|o| {
                o.error.clone().map(|error| BatchFailure {
                    batch_index: o.batch.index,
                    pages: o.batch.pages.clone(),
                    error,
                })
            })
            .collect();
        let processed_pages = succeeded.iter().map(|(b, _)| b.pages.len()).sum();

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_complete(report.entries.len(), report.dropped, failures.len());
        }

        let summary = RunSummary {
            document_id: document.id,
            total_pages: document.page_count,
            processed_pages,
            inserted: report.entries,
            total_entries,
            dropped: report.dropped,
            failures,
            cancelled,
            duration_ms: run_start.elapsed().as_millis() as u64,
        };
        info!(
            "Document {} done: {} entries stored, {} dropped, {}/{} batches failed, {}ms{}",
            summary.document_id,
            summary.inserted.len(),
            summary.dropped,
            summary.failures.len(),
            total_batches,
            summary.duration_ms,
            if cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }

    /// Payload → inference → normalisation for one batch.
    ///
    /// Only an authentication failure is returned as `Err`; it cancels
    /// `flag` so no further batch is dispatched.
    async fn run_batch(
        &self,
        client: Arc<dyn InferenceClient>,
        document: Arc<Document>,
        batch: PageBatch,
        total_batches: usize,
        flag: &CancelFlag,
    ) -> Result<BatchOutcome, ExtractError> {
        let label = batch.index + 1;
        let cb = self.config.progress_callback.as_ref();

        if flag.is_cancelled() {
            debug!("Batch {}: skipped, run cancelled", label);
            if let Some(cb) = cb {
                cb.on_batch_error(label, total_batches, &batch.pages, "cancelled");
            }
            return Ok(BatchOutcome::failed(batch, 0, 0, BatchError::Cancelled));
        }

        let start = Instant::now();
        if let Some(cb) = cb {
            cb.on_batch_start(label, total_batches, &batch.pages);
        }

        let fail = |batch: PageBatch, attempts: u32, error: BatchError| {
            warn!("Batch {} (pages {:?}) failed: {}", label, batch.pages, error);
            if let Some(cb) = cb {
                cb.on_batch_error(label, total_batches, &batch.pages, &error.to_string());
            }
            Ok(BatchOutcome::failed(
                batch,
                attempts,
                start.elapsed().as_millis() as u64,
                error,
            ))
        };

        let payload =
            match payload::build_payload(Arc::clone(&self.backend), document, &batch, self.config.mode)
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    return fail(
                        batch,
                        0,
                        BatchError::Extraction {
                            detail: e.to_string(),
                        },
                    )
                }
            };

        let attempt =
            inference::infer_with_retry(client.as_ref(), &payload, &self.config, label, flag).await;
        let retries = attempt.attempts.saturating_sub(1);

        let raw = match attempt.result {
            Ok(raw) => raw,
            Err(InferenceError::Authentication(detail)) => {
                flag.cancel();
                return Err(ExtractError::AuthenticationFailure { detail });
            }
            Err(e) => {
                let error = e.into_batch_error(retries).unwrap_or(BatchError::Transport {
                    retries,
                    detail: "unclassified inference failure".to_string(),
                });
                return fail(batch, attempt.attempts, error);
            }
        };

        match normalize::normalize(&raw) {
            Ok(candidates) => {
                debug!(
                    "Batch {}: {} candidates in {}ms",
                    label,
                    candidates.len(),
                    start.elapsed().as_millis()
                );
                if let Some(cb) = cb {
                    cb.on_batch_complete(label, total_batches, &batch.pages, candidates.len());
                }
                Ok(BatchOutcome {
                    batch,
                    candidates,
                    attempts: attempt.attempts,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: None,
                })
            }
            Err(error) => fail(batch, attempt.attempts, error),
        }
    }
}

/// Validated pages `start..=end`, in order.
fn selected_pages(
    total: usize,
    start: Option<usize>,
    end: Option<usize>,
) -> Result<Vec<usize>, ExtractError> {
    Ok(batch::plan(total, start, end, total.max(1))?
        .into_iter()
        .flat_map(|b| b.pages)
        .collect())
}
