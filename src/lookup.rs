//! Single-base disk search: bloom probe, block search, then a bounded
//! binary search over the mapped sorted index with equal-key widening.

use std::cmp::Ordering;

use crate::base::{Base, BaseHold};
use crate::mmap::SortedIndex;
use crate::record::{self, Key, RECORD_SIZE};

/// How many consecutive invalidated bases a lookup tolerates before it
/// gives up with a deadlock error.
pub const MAX_TRIES: u32 = 10;

/// Which entries of an equal-key run the scan may return.
///
/// There is a single production policy today, but the scan is generic over
/// the choice so offline tools can also see tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// Any entry with the key, tombstoned or not.
    Any,
    /// Only entries whose REMOVED bit is clear.
    NonRemoved,
}

impl Accept {
    /// Applies the policy to a raw on-disk entry. The REMOVED bit is tested
    /// against the little-endian image of the flags; no other field is read.
    pub(crate) fn matches(&self, entry: &[u8]) -> bool {
        match self {
            Accept::Any => true,
            Accept::NonRemoved => !record::raw_is_removed(entry),
        }
    }
}

/// Per-lookup search telemetry. Every field is a monotonic counter over
/// one call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SearchStat {
    /// Bases visited
    pub loops: u32,
    /// Bases skipped for lack of a sorted index
    pub no_sort: u32,
    /// Single-base disk searches started
    pub search_on_disk: u32,
    /// Bases whose bloom filter rejected the key
    pub bloom_null: u32,
    /// Block-table searches that found a candidate block
    pub found_index_block: u32,
    /// Block-table searches that found none (or had no table)
    pub no_block: u32,
    /// Intra-block binary searches started
    pub bsearch_reached: u32,
    /// Intra-block binary searches that hit the key
    pub bsearch_found: u32,
    /// Extra entries visited while widening over an equal-key run
    pub additional_reads: u32,
}

/// Where to find the newest live record for a key: the base it lives in
/// and its coordinates in the base's files.
///
/// The locator keeps a hold on its base, deferring reclamation until the
/// caller is done reading the record's data.
#[derive(Debug)]
pub struct Locator {
    pub base: BaseHold,
    /// Byte offset of the record inside the base's data file
    pub data_offset: u64,
    /// Byte offset of the matched entry inside the sorted index
    pub index_offset: u64,
    /// Payload size in bytes
    pub size: u64,
}

/// Searches one closed base for `key` and returns the position of the
/// first acceptable entry in its sorted index.
pub(crate) fn find_on_disk(
    base: &Base,
    sort: &SortedIndex,
    key: &Key,
    accept: Accept,
    st: &mut SearchStat,
) -> Option<u64> {
    st.search_on_disk += 1;

    let block = base.probe(key, st)?;
    st.bsearch_reached += 1;

    let total = sort.record_count();
    let first = block.start_offset / RECORD_SIZE as u64;
    // The last block may be short, and end_offset points one entry past the
    // block, which can be the file end; clamp to what is actually there.
    let num = (total - first).min(base.config().index_block_size as u64);

    let mut low = first;
    let mut high = first + num;
    let mut hit = None;
    while low < high {
        let mid = (low + high) / 2;
        match record::compare_key(sort.entry(mid), key) {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => {
                hit = Some(mid);
                break;
            }
        }
    }
    let hit = hit?;
    st.bsearch_found += 1;

    // Walk forward over the equal-key run, then backward from just before
    // the hit. Runs may cross block boundaries, so both walks are bounded
    // by the file, not the block.
    let mut at = hit;
    while at < total && record::compare_key(sort.entry(at), key) == Ordering::Equal {
        if accept.matches(sort.entry(at)) {
            return Some(at);
        }
        st.additional_reads += 1;
        at += 1;
    }

    let mut at = hit;
    while at > 0 {
        at -= 1;
        st.additional_reads += 1;
        if record::compare_key(sort.entry(at), key) != Ordering::Equal {
            break;
        }
        if accept.matches(sort.entry(at)) {
            return Some(at);
        }
    }

    None
}
