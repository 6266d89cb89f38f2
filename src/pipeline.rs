//! Concurrent entry download with strictly ordered delivery.
//!
//! The range to mirror is partitioned into work units of at most one
//! server batch. Up to `workers` units are fetched concurrently; results
//! are drained in index order through the ordered future buffer, which also
//! bounds memory to `workers * batch_size` entries. Dropping the returned
//! stream cancels every in-flight fetch.

use std::ops::Range;

use async_stream::try_stream;
use futures::{Stream, StreamExt, pin_mut};
use log::{debug, warn};

use crate::Error;
use crate::internal::{self, FetchedEntry, RETRY_ATTEMPTS};

/// A contiguous slice of the fetch range, at most one server batch long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUnit {
    pub start: u64,
    pub end: u64,
}

/// Split `[range.start, range.end)` into units of at most `batch_size`.
pub fn partition(range: Range<u64>, batch_size: u64) -> Vec<WorkUnit> {
    assert!(batch_size > 0, "batch size must be positive");
    let mut units = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let end = u64::min(start + batch_size, range.end);
        units.push(WorkUnit { start, end });
        start = end;
    }
    units
}

/// Fetch `range` with up to `workers` concurrent requests, yielding every
/// entry in strict index order.
pub fn fetch_ordered<'a>(
    client: &'a reqwest::Client,
    base_url: &'a reqwest::Url,
    range: Range<u64>,
    batch_size: u64,
    workers: usize,
) -> impl Stream<Item = Result<FetchedEntry, Error>> + 'a {
    let units = partition(range, batch_size);
    try_stream! {
        let unit_results = futures::stream::iter(units)
            .map(move |unit| fetch_unit(client, base_url, unit, batch_size))
            .buffered(workers.max(1));
        pin_mut!(unit_results);
        while let Some(unit) = unit_results.next().await {
            for entry in unit? {
                yield entry;
            }
        }
    }
}

/// Fetch every entry of one work unit. A short-but-nonempty response
/// requeues the tail without consuming a retry attempt; an empty response
/// consumes one and backs off.
async fn fetch_unit(
    client: &reqwest::Client,
    base_url: &reqwest::Url,
    unit: WorkUnit,
    batch_size: u64,
) -> Result<Vec<FetchedEntry>, Error> {
    let mut out = Vec::with_capacity((unit.end - unit.start) as usize);
    let mut next = unit.start;
    let mut attempts = 0u32;
    while next < unit.end {
        let before = next;
        let entries = internal::get_entries(client, base_url, next..unit.end, batch_size);
        pin_mut!(entries);
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            next = entry.index + 1;
            out.push(entry);
        }
        if next == before {
            attempts += 1;
            if attempts >= RETRY_ATTEMPTS {
                return Err(Error::ExpectedEntry(next));
            }
            let delay = internal::backoff_delay(attempts - 1);
            warn!(
                "no entries returned at index {} (attempt {}/{}, retrying in {:?})",
                next, attempts, RETRY_ATTEMPTS, delay
            );
            tokio::time::sleep(delay).await;
        } else {
            attempts = 0;
            if next < unit.end {
                debug!("short response, requeueing [{}, {})", next, unit.end);
            }
        }
    }
    Ok(out)
}
