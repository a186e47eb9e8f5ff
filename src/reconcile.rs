//! Manifest reconciliation: candidates → canonical stored entries.
//!
//! Reconciliation is split in two:
//!
//! * [`plan_entries`] is pure. It flattens the per-batch candidates in batch
//!   order, parses dates, drops weightless candidates and assigns identities
//!   starting from a counter passed in by the caller.
//! * [`reconcile`] commits a plan with one upsert per entry.
//!
//! No process-wide counter exists: the starting identity comes in as a
//! parameter and the advanced one goes back out in [`ReconcileReport`]. Given
//! the same candidates and the same starting identity, the plan is
//! identical, so re-running a reconciliation rewrites the same rows instead
//! of duplicating them.

use crate::error::ExtractError;
use crate::model::{CandidateEntry, Document, ManifestEntry, PageBatch};
use crate::store::ManifestStore;
use chrono::NaiveDate;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// The only accepted date format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Largest identity a candidate may supply (2^53 - 1, the largest integer a
/// JSON consumer reads back exactly). Everything above it up to `i64::MAX`
/// is left for synthetic identities.
pub const MAX_SUPPLIED_IDENTITY: i64 = (1 << 53) - 1;

/// Result of a reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    /// Entries written, in flattened candidate order. An identity that
    /// appears more than once keeps its first position and its last values.
    pub entries: Vec<ManifestEntry>,
    /// Candidates discarded: no weight, a supplied identity outside
    /// `1..=MAX_SUPPLIED_IDENTITY`, or no synthetic identity left to give.
    pub dropped: usize,
    /// The identity counter after this run: the highest identity that is
    /// now known to be taken.
    pub max_identity: i64,
}

/// Parse a `YYYY-MM-DD` date; anything else is `None`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// Build the entries a reconciliation would store, without touching a store.
///
/// Synthetic identities start above both `existing_max` and every identity
/// the candidates supply themselves, so a synthetic identity never lands on
/// a row written by the same run.
pub fn plan_entries(
    document_id: i64,
    batches: &[(PageBatch, Vec<CandidateEntry>)],
    existing_max: i64,
) -> ReconcileReport {
    let supplied_max = batches
        .iter()
        .flat_map(|(_, candidates)| candidates)
        .filter(|c| c.weight.is_some())
        .filter_map(|c| c.id)
        .filter(|&id| supplied_in_range(id))
        .max()
        .unwrap_or(existing_max);
    let mut counter = existing_max.max(supplied_max);

    let mut entries: Vec<ManifestEntry> = Vec::new();
    let mut position: HashMap<i64, usize> = HashMap::new();
    let mut dropped = 0;

    for (batch, candidates) in batches {
        for candidate in candidates {
            let Some(weight) = candidate.weight else {
                dropped += 1;
                continue;
            };

            let id = match candidate.id {
                Some(id) if supplied_in_range(id) => id,
                Some(id) => {
                    warn!("Dropping candidate with out-of-range identity {}", id);
                    dropped += 1;
                    continue;
                }
                None => match counter.checked_add(1) {
                    Some(next) => {
                        counter = next;
                        next
                    }
                    None => {
                        warn!("Identity space exhausted, dropping candidate");
                        dropped += 1;
                        continue;
                    }
                },
            };

            let entry = ManifestEntry {
                id,
                name: candidate.name.clone(),
                flag: candidate.flag.clone(),
                products: candidate.products.clone(),
                volume: candidate.volume,
                weight,
                date: candidate.date.as_deref().and_then(parse_date),
                document_id,
                page: attribute_page(batch, candidate.page),
            };

            match position.get(&id) {
                Some(&at) => entries[at] = entry,
                None => {
                    position.insert(id, entries.len());
                    entries.push(entry);
                }
            }
        }
    }

    ReconcileReport {
        entries,
        dropped,
        max_identity: counter,
    }
}

fn supplied_in_range(id: i64) -> bool {
    (1..=MAX_SUPPLIED_IDENTITY).contains(&id)
}

/// The page an entry is linked to: the model's own attribution when it
/// falls inside the batch, otherwise the batch's first page.
fn attribute_page(batch: &PageBatch, claimed: Option<usize>) -> usize {
    claimed
        .filter(|&p| batch.contains(p))
        .or_else(|| batch.first_page())
        .unwrap_or(1)
}

/// Plan and commit entries for `document`.
///
/// Upserts run sequentially in plan order, and the report carries what the
/// store returned for each, not the plan. The caller must hold whatever
/// exclusive section protects `existing_max` until this returns.
pub async fn reconcile(
    store: &dyn ManifestStore,
    document: &Document,
    batches: &[(PageBatch, Vec<CandidateEntry>)],
    existing_max: i64,
) -> Result<ReconcileReport, ExtractError> {
    let plan = plan_entries(document.id, batches, existing_max);
    if plan.dropped > 0 {
        warn!(
            "Document {}: dropped {} candidates",
            document.id, plan.dropped
        );
    }

    let mut stored = Vec::with_capacity(plan.entries.len());
    for entry in plan.entries {
        debug!(
            "Upserting entry {} (document {}, page {})",
            entry.id, entry.document_id, entry.page
        );
        stored.push(store.upsert(entry).await?);
    }
    let report = ReconcileReport {
        entries: stored,
        ..plan
    };

    info!(
        "Document {}: reconciled {} entries, identity counter {} → {}",
        document.id,
        report.entries.len(),
        existing_max,
        report.max_identity
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewDocument;
    use crate::store::{DocumentStore, MemoryStore};

    fn batch(index: usize, pages: &[usize]) -> PageBatch {
        PageBatch {
            index,
            pages: pages.to_vec(),
        }
    }

    fn weighted(name: &str, weight: f64) -> CandidateEntry {
        CandidateEntry {
            name: Some(name.into()),
            weight: Some(weight),
            ..Default::default()
        }
    }

    #[test]
    fn synthetic_identities_follow_existing_max_in_order() {
        let plan = plan_entries(
            1,
            &[(
                batch(0, &[1, 2, 3]),
                vec![weighted("a", 1.0), weighted("b", 2.0), weighted("c", 3.0)],
            )],
            10,
        );
        let ids: Vec<i64> = plan.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![11, 12, 13]);
        assert_eq!(plan.max_identity, 13);
        let names: Vec<&str> = plan.entries.iter().filter_map(|e| e.name.as_deref()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn weightless_candidates_are_dropped_and_counted() {
        let plan = plan_entries(
            1,
            &[(
                batch(0, &[1]),
                vec![
                    weighted("a", 1.0),
                    CandidateEntry {
                        name: Some("no weight".into()),
                        ..Default::default()
                    },
                    weighted("c", 3.0),
                ],
            )],
            0,
        );
        assert_eq!(plan.dropped, 1);
        let ids: Vec<i64> = plan.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn batch_order_determines_identity_order() {
        let plan = plan_entries(
            1,
            &[
                (batch(0, &[1, 2]), vec![weighted("first", 1.0)]),
                (batch(1, &[3, 4]), vec![weighted("second", 1.0), weighted("third", 1.0)]),
            ],
            4,
        );
        let pairs: Vec<(i64, usize)> = plan.entries.iter().map(|e| (e.id, e.page)).collect();
        assert_eq!(pairs, vec![(5, 1), (6, 3), (7, 3)]);
    }

    #[test]
    fn supplied_identities_are_kept_and_not_collided_with() {
        let mut supplied = weighted("supplied", 1.0);
        supplied.id = Some(12);
        let plan = plan_entries(
            1,
            &[(batch(0, &[1]), vec![weighted("x", 1.0), supplied])],
            10,
        );
        let ids: Vec<i64> = plan.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![13, 12]);
        assert_eq!(plan.max_identity, 13);
    }

    #[test]
    fn repeated_identity_in_one_run_is_written_once() {
        let mut a = weighted("old", 1.0);
        a.id = Some(3);
        let mut b = weighted("new", 2.0);
        b.id = Some(3);
        let plan = plan_entries(1, &[(batch(0, &[1]), vec![a, b])], 0);
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].name.as_deref(), Some("new"));
    }

    #[test]
    fn identity_at_i64_max_does_not_overflow_the_counter() {
        let raw = r#"[{"ID":9223372036854775807,"Poids":1},{"Poids":2}]"#;
        let candidates = crate::pipeline::normalize::normalize(raw).unwrap();
        let plan = plan_entries(1, &[(batch(0, &[1]), candidates)], 0);
        assert_eq!(plan.dropped, 1);
        let ids: Vec<i64> = plan.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1]);
        assert_eq!(plan.entries[0].weight, 2.0);
    }

    #[test]
    fn supplied_identities_outside_the_accepted_range_are_dropped() {
        let with_id = |id| {
            let mut c = weighted("x", 1.0);
            c.id = Some(id);
            c
        };
        let plan = plan_entries(
            1,
            &[(
                batch(0, &[1]),
                vec![
                    with_id(MAX_SUPPLIED_IDENTITY),
                    with_id(MAX_SUPPLIED_IDENTITY + 1),
                    with_id(0),
                    with_id(-4),
                    weighted("synthetic", 1.0),
                ],
            )],
            0,
        );
        let ids: Vec<i64> = plan.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![MAX_SUPPLIED_IDENTITY, MAX_SUPPLIED_IDENTITY + 1]);
        assert_eq!(plan.dropped, 3);
    }

    #[test]
    fn exhausted_counter_drops_instead_of_wrapping() {
        let plan = plan_entries(
            1,
            &[(batch(0, &[1]), vec![weighted("a", 1.0), weighted("b", 2.0)])],
            i64::MAX - 1,
        );
        let ids: Vec<i64> = plan.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![i64::MAX]);
        assert_eq!(plan.dropped, 1);
        assert_eq!(plan.max_identity, i64::MAX);
    }

    #[test]
    fn dates_parse_strictly() {
        assert_eq!(parse_date("2024-12-18"), NaiveDate::from_ymd_opt(2024, 12, 18));
        assert_eq!(parse_date(" 2024-12-18 "), NaiveDate::from_ymd_opt(2024, 12, 18));
        assert_eq!(parse_date("18/12/2024"), None);
        assert_eq!(parse_date("2024-13-01"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn page_attribution_prefers_in_batch_claims() {
        let b = batch(1, &[4, 5, 6]);
        assert_eq!(attribute_page(&b, Some(5)), 5);
        assert_eq!(attribute_page(&b, Some(9)), 4);
        assert_eq!(attribute_page(&b, None), 4);
    }

    async fn store_with_doc() -> (MemoryStore, Document) {
        let store = MemoryStore::new();
        let doc = store
            .create(NewDocument {
                name: "m.pdf".into(),
                content: b"%PDF".to_vec(),
                page_count: 3,
                created_on: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            })
            .await
            .unwrap();
        (store, doc)
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (store, doc) = store_with_doc().await;
        let mut dated = weighted("a", 1.0);
        dated.date = Some("2024-12-18".into());
        let batches = vec![(batch(0, &[1, 2]), vec![dated, weighted("b", 2.0)])];

        let first = reconcile(&store, &doc, &batches, 0).await.unwrap();
        let after_first = store.list_all().await.unwrap();
        let second = reconcile(&store, &doc, &batches, 0).await.unwrap();
        let after_second = store.list_all().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.len(), 2);
        assert_eq!(
            after_second[0].date,
            NaiveDate::from_ymd_opt(2024, 12, 18)
        );
    }

    #[tokio::test]
    async fn reconcile_links_entries_to_document() {
        let (store, doc) = store_with_doc().await;
        let batches = vec![(batch(0, &[3]), vec![weighted("a", 1.0)])];
        reconcile(&store, &doc, &batches, 0).await.unwrap();
        let stored = store.list_for_document(doc.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].page, 3);
    }

    /// Stamps every entry's name on the way in, like a store that
    /// normalises columns.
    struct StampingStore(MemoryStore);

    #[async_trait::async_trait]
    impl ManifestStore for StampingStore {
        async fn upsert(&self, mut entry: ManifestEntry) -> Result<ManifestEntry, ExtractError> {
            entry.name = entry.name.map(|n| n.to_uppercase());
            self.0.upsert(entry).await
        }
        async fn list_all(&self) -> Result<Vec<ManifestEntry>, ExtractError> {
            self.0.list_all().await
        }
        async fn list_for_document(&self, id: i64) -> Result<Vec<ManifestEntry>, ExtractError> {
            self.0.list_for_document(id).await
        }
        async fn max_identity(&self) -> Result<i64, ExtractError> {
            self.0.max_identity().await
        }
        async fn count(&self) -> Result<usize, ExtractError> {
            self.0.count().await
        }
    }

    #[tokio::test]
    async fn report_carries_what_the_store_returned() {
        let (store, doc) = store_with_doc().await;
        let store = StampingStore(store);
        let batches = vec![(batch(0, &[1]), vec![weighted("kouros queen", 1.0)])];
        let report = reconcile(&store, &doc, &batches, 0).await.unwrap();
        assert_eq!(report.entries[0].name.as_deref(), Some("KOUROS QUEEN"));
        assert_eq!(report.entries, store.list_all().await.unwrap());
    }

    #[tokio::test]
    async fn unknown_document_is_an_orphan_error() {
        let (store, mut doc) = store_with_doc().await;
        doc.id = 404;
        let batches = vec![(batch(0, &[1]), vec![weighted("a", 1.0)])];
        let err = reconcile(&store, &doc, &batches, 0).await.unwrap_err();
        assert!(matches!(err, ExtractError::OrphanEntry { document_id: 404, .. }));
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
