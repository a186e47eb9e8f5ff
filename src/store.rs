//! Store collaborators: documents and manifest entries.
//!
//! The pipeline only talks to the two traits below. [`MemoryStore`]
//! implements both in one process, with optional JSON snapshots so the CLI
//! can keep state between invocations. A relational backend would implement
//! the same traits.
//!
//! Referential integrity is enforced here, not by callers: an entry whose
//! document does not exist is rejected with [`ExtractError::OrphanEntry`],
//! and deleting a document removes its entries.

use crate::error::ExtractError;
use crate::model::{Document, DocumentSummary, ManifestEntry, NewDocument};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Persistent storage for uploaded PDFs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store a new document and return it with its assigned identity.
    async fn create(&self, document: NewDocument) -> Result<Document, ExtractError>;

    /// Fetch a document by identity.
    async fn get(&self, id: i64) -> Result<Document, ExtractError>;

    /// Every document, newest `created_on` first, ties broken by higher id.
    async fn list(&self) -> Result<Vec<DocumentSummary>, ExtractError>;

    /// Delete a document and every manifest entry that references it.
    async fn delete(&self, id: i64) -> Result<(), ExtractError>;
}

/// Persistent storage for reconciled manifest entries.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Insert the entry, or replace the stored entry with the same id, and
    /// return the entry as stored (store-assigned fields populated).
    async fn upsert(&self, entry: ManifestEntry) -> Result<ManifestEntry, ExtractError>;

    /// Every entry, ordered by id.
    async fn list_all(&self) -> Result<Vec<ManifestEntry>, ExtractError>;

    /// Entries of one document, ordered by id.
    async fn list_for_document(&self, document_id: i64) -> Result<Vec<ManifestEntry>, ExtractError>;

    /// Highest stored entry id, or 0 when the store is empty.
    async fn max_identity(&self) -> Result<i64, ExtractError>;

    async fn count(&self) -> Result<usize, ExtractError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_document_id: i64,
    documents: BTreeMap<i64, Document>,
    entries: BTreeMap<i64, ManifestEntry>,
}

/// In-process store for both documents and entries.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by [`MemoryStore::save_json`]. A missing file
    /// yields an empty store.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let path = path.as_ref();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No store snapshot at {}, starting empty", path.display());
                return Ok(Self::new());
            }
            Err(e) => {
                return Err(ExtractError::Store(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let mut snapshot: Snapshot = serde_json::from_slice(&raw).map_err(|e| {
            ExtractError::Store(format!("corrupt snapshot {}: {}", path.display(), e))
        })?;
        let max_doc = snapshot.documents.keys().next_back().copied().unwrap_or(0);
        snapshot.next_document_id = snapshot.next_document_id.max(max_doc.saturating_add(1));

        info!(
            "Loaded store snapshot: {} documents, {} entries",
            snapshot.documents.len(),
            snapshot.entries.len()
        );
        Ok(Self {
            inner: RwLock::new(snapshot),
        })
    }

    /// Write the whole store to `path` atomically (temp file + rename).
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), ExtractError> {
        let path = path.as_ref();
        let json = {
            let guard = self.inner.read().await;
            serde_json::to_vec_pretty(&*guard)
                .map_err(|e| ExtractError::Store(format!("cannot serialise store: {e}")))?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_failed(parent, e))?;
        }
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| write_failed(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| write_failed(path, e))?;

        debug!("Saved store snapshot to {} ({} bytes)", path.display(), json.len());
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_failed(path: &Path, source: std::io::Error) -> ExtractError {
    ExtractError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, document: NewDocument) -> Result<Document, ExtractError> {
        let mut guard = self.inner.write().await;
        let id = guard.next_document_id.max(1);
        // The counter sticks at i64::MAX; once that id is taken nothing is left.
        if guard.documents.contains_key(&id) {
            return Err(ExtractError::Store("document identities exhausted".to_string()));
        }
        guard.next_document_id = id.saturating_add(1);

        let stored = Document {
            id,
            name: document.name,
            content: document.content,
            page_count: document.page_count,
            created_on: document.created_on,
        };
        guard.documents.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: i64) -> Result<Document, ExtractError> {
        self.inner
            .read()
            .await
            .documents
            .get(&id)
            .cloned()
            .ok_or(ExtractError::DocumentNotFound { id })
    }

    async fn list(&self) -> Result<Vec<DocumentSummary>, ExtractError> {
        let guard = self.inner.read().await;
        let mut docs: Vec<DocumentSummary> = guard.documents.values().map(Document::summary).collect();
        docs.sort_by(|a, b| b.created_on.cmp(&a.created_on).then(b.id.cmp(&a.id)));
        Ok(docs)
    }

    async fn delete(&self, id: i64) -> Result<(), ExtractError> {
        let mut guard = self.inner.write().await;
        if guard.documents.remove(&id).is_none() {
            return Err(ExtractError::DocumentNotFound { id });
        }
        let before = guard.entries.len();
        guard.entries.retain(|_, e| e.document_id != id);
        debug!(
            "Deleted document {} and {} entries",
            id,
            before - guard.entries.len()
        );
        Ok(())
    }
}

#[async_trait]
impl ManifestStore for MemoryStore {
    async fn upsert(&self, entry: ManifestEntry) -> Result<ManifestEntry, ExtractError> {
        let mut guard = self.inner.write().await;
        if !guard.documents.contains_key(&entry.document_id) {
            return Err(ExtractError::OrphanEntry {
                entry_id: entry.id,
                document_id: entry.document_id,
            });
        }
        guard.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn list_all(&self) -> Result<Vec<ManifestEntry>, ExtractError> {
        Ok(self.inner.read().await.entries.values().cloned().collect())
    }

    async fn list_for_document(&self, document_id: i64) -> Result<Vec<ManifestEntry>, ExtractError> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn max_identity(&self) -> Result<i64, ExtractError> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(0))
    }

    async fn count(&self) -> Result<usize, ExtractError> {
        Ok(self.inner.read().await.entries.len())
    }
}
