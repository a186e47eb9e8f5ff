//! Page-range planning: validate `[start, end]` and split it into batches.
//!
//! Validation happens here, before any extraction or network I/O, so a bad
//! range is reported to the caller without spending a single API call.

use crate::error::ExtractError;
use crate::model::PageBatch;

/// Default number of pages per batch.
pub const DEFAULT_BATCH_SIZE: usize = 3;

/// Validate a requested page range and partition it into ordered batches.
///
/// Defaulting and validation, in order:
/// 1. a missing `start` becomes 1, a missing `end` becomes `total_pages`;
/// 2. `start < 1`, `end < start` or `start > total_pages` is
///    [`ExtractError::InvalidRange`];
/// 3. `end > total_pages` is clamped to `total_pages`.
///
/// The resulting pages are cut into consecutive chunks of at most
/// `batch_size` pages, ascending.
pub fn plan(
    total_pages: usize,
    start: Option<usize>,
    end: Option<usize>,
    batch_size: usize,
) -> Result<Vec<PageBatch>, ExtractError> {
    if batch_size == 0 {
        return Err(ExtractError::InvalidConfig(
            "Batch size must be ≥ 1".into(),
        ));
    }

    let start = start.unwrap_or(1);
    let end = end.unwrap_or(total_pages);

    if start < 1 || end < start || start > total_pages {
        return Err(ExtractError::InvalidRange {
            start,
            end,
            total: total_pages,
        });
    }
    let end = end.min(total_pages);

    let pages: Vec<usize> = (start..=end).collect();
    Ok(pages
        .chunks(batch_size)
        .enumerate()
        .map(|(index, chunk)| PageBatch {
            index,
            pages: chunk.to_vec(),
        })
        .collect())
}
