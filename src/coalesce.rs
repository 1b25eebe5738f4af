//! Address coalescing for batched reads
//!
//! Turns the set of addresses a device exposes into the smallest number of
//! contiguous `(start, count)` runs, so each poll pass issues one request per
//! run instead of one per register.

use std::collections::BTreeMap;

/// Coalesced table: start address -> number of consecutive addresses
pub type RangeTable = BTreeMap<u16, u16>;

/// Merge addresses into maximal contiguous runs
///
/// Input order and duplicates do not matter. The result is sorted by start
/// address, runs are disjoint, and no two runs touch.
///
/// ```rust
/// use voltage_modbus_sync::coalesce::coalesce;
///
/// let runs = coalesce([1u16, 2, 3, 7, 8, 10]);
/// let runs: Vec<_> = runs.into_iter().collect();
/// assert_eq!(runs, vec![(1, 3), (7, 2), (10, 1)]);
/// ```
pub fn coalesce<I>(addresses: I) -> RangeTable
where
    I: IntoIterator<Item = u16>,
{
    let mut sorted: Vec<u16> = addresses.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut table = RangeTable::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return table;
    };

    // count is u32 so a run covering all 65536 addresses cannot overflow
    let mut start = first;
    let mut previous = first;
    let mut count: u32 = 1;

    for address in iter {
        if previous.checked_add(1) == Some(address) {
            count += 1;
        } else {
            table.insert(start, clamp_count(count));
            start = address;
            count = 1;
        }
        previous = address;
    }
    table.insert(start, clamp_count(count));

    table
}

fn clamp_count(count: u32) -> u16 {
    count.min(u16::MAX as u32) as u16
}

/// Split a run into request-sized pieces
///
/// The coalesced table stays maximal; splitting only happens when the run is
/// turned into wire requests.
pub fn split_range(start: u16, count: u16, max_per_request: u16) -> Vec<(u16, u16)> {
    let max = max_per_request.max(1) as u32;
    let end = start as u32 + count as u32;
    let mut pieces = Vec::new();
    let mut cursor = start as u32;
    while cursor < end {
        let len = (end - cursor).min(max);
        pieces.push((cursor as u16, len as u16));
        cursor += len;
    }
    pieces
}
