//! Index block table for a closed base.
//!
//! The sorted index is split into blocks of a fixed number of entries; each
//! block is summarised by its byte range in the file and the inclusive key
//! range of its entries:
//!
//! ```text
//! sorted index:  | e0 e1 .. e39 | e40 e41 .. e79 | e80 ..      |
//! block table:   | [k(e0),k(e39)] | [k(e40),k(e79)] | [k(e80),..] |
//! ```
//!
//! Point lookups binary-search the block table to narrow the expensive
//! mapped-file search down to one block. A bloom filter over all live keys
//! sits in front of the table to reject most absent keys outright.
//!
//! Building the table tolerates interior corruption in the sorted index:
//! corrupt entries are counted and skipped as long as they stay off block
//! boundaries and under the configured budget. Anything worse aborts the
//! build, leaving the base for offline repair.

use std::cmp::Ordering as CmpOrdering;
use std::mem::size_of;
use std::sync::atomic::Ordering;

use crate::base::Base;
use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::record::{Key, RecordControl, RECORD_SIZE};

/// Descriptor of one run of entries in the sorted index file.
///
/// `start_offset..end_offset` is the byte range of the block;
/// `[start_key, end_key]` is the inclusive key range of its valid entries.
/// Consecutive blocks may touch at a single key when an equal-key run
/// crosses a block boundary; the intra-block scan widens across the
/// boundary to compensate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBlock {
    pub start_offset: u64,
    pub end_offset: u64,
    pub start_key: Key,
    pub end_key: Key,
}

/// A closed base's search structures, installed and destroyed as a pair.
pub struct SearchIndex {
    pub(crate) blocks: Vec<IndexBlock>,
    pub(crate) bloom: BloomFilter,
}

impl SearchIndex {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Builds the block table and bloom filter over a base's sorted index and
/// installs them on the base.
///
/// Corrupt entries are skipped and counted, unless one lands on the first
/// or last slot of a block or the total exceeds the configured maximum; the
/// build then fails with [`Error::Corrupt`] and the base stays unindexed.
pub fn fill(base: &Base) -> Result<()> {
    let Some(sort) = base.sorted() else {
        return Err(Error::InvalidData(format!(
            "base {} has no sorted index to fill from",
            base.name()
        )));
    };
    let config = base.config();
    let block_size = config.index_block_size as u64;
    let record_count = sort.record_count();

    let bloom_bytes = BloomFilter::size_for(
        record_count,
        config.index_block_size,
        config.index_block_bloom_length,
    );
    tracing::debug!(base = base.index(), bloom_bytes, "sizing bloom filter");
    let bits_per_key = bloom_bytes * 8 / record_count;
    let mut bloom = BloomFilter::with_size(bloom_bytes, BloomFilter::num_hashes_for(bits_per_key))?;
    base.stats().bloom_size.store(bloom_bytes, Ordering::SeqCst);

    let block_count = record_count.div_ceil(block_size);
    let mut blocks: Vec<IndexBlock> = Vec::new();
    blocks
        .try_reserve_exact(block_count as usize)
        .map_err(|_| Error::NoMemory)?;
    base.stats()
        .index_blocks_size
        .store(block_count * size_of::<IndexBlock>() as u64, Ordering::SeqCst);

    let mut corrupt_count = 0u64;
    let mut removed = 0u64;
    let mut removed_size = 0u64;
    let mut idx = 0u64;

    while idx < record_count {
        let start_offset = idx * RECORD_SIZE as u64;
        let mut start_key: Option<Key> = None;
        let mut end_key: Option<Key> = None;

        let mut i = 0u64;
        while i < block_size && idx < record_count {
            let rc = RecordControl::decode(sort.entry(idx))?;
            if !base.check_record(&rc) {
                base.stats()
                    .index_corrupted_entries
                    .fetch_add(1, Ordering::SeqCst);
                corrupt_count += 1;

                // A broken first or last entry of a block cannot be recovered
                // from, and neither can corruption past the budget.
                if corrupt_count > config.index_corrupt_max || i == 0 || i == block_size - 1 {
                    tracing::error!(
                        base = %base.name(),
                        corrupt_count,
                        "index corruption on a block boundary or over budget, can not continue"
                    );
                    tracing::error!(
                        "an offline merge of base '{}' is required to repair its index",
                        base.name()
                    );
                    base.destroy_search_index();
                    return Err(Error::Corrupt(format!(
                        "base {}: {} corrupt index entries",
                        base.name(),
                        corrupt_count
                    )));
                }
                idx += 1;
                i += 1;
                continue;
            }

            if start_key.is_none() {
                start_key = Some(rc.key);
            }
            if rc.is_removed() {
                removed += 1;
                removed_size += rc.disk_size;
            } else {
                bloom.insert(&rc.key);
            }
            end_key = Some(rc.key);

            idx += 1;
            i += 1;
        }

        // Boundary corruption is fatal above, so every block that gets here
        // has at least one valid entry.
        let (Some(start_key), Some(end_key)) = (start_key, end_key) else {
            base.destroy_search_index();
            return Err(Error::Corrupt(format!(
                "base {}: index block without a single valid entry",
                base.name()
            )));
        };
        blocks.push(IndexBlock {
            start_offset,
            end_offset: idx * RECORD_SIZE as u64,
            start_key,
            end_key,
        });
    }

    base.stats().records_removed.store(removed, Ordering::SeqCst);
    base.stats()
        .removed_size
        .store(removed_size, Ordering::SeqCst);
    base.install_search_index(SearchIndex { blocks, bloom });
    Ok(())
}

/// Finds the block whose key range contains `key`, if any.
///
/// Binary search with range containment: a block compares equal to the key
/// when `start_key <= key <= end_key`. With touching ranges the first block
/// found wins; the caller's scan widens over the boundary.
pub(crate) fn find_block<'a>(blocks: &'a [IndexBlock], key: &Key) -> Option<&'a IndexBlock> {
    let mut low = 0;
    let mut high = blocks.len();

    while low < high {
        let mid = (low + high) / 2;
        let block = &blocks[mid];
        match key.cmp(&block.start_key) {
            CmpOrdering::Less => high = mid,
            CmpOrdering::Equal => return Some(block),
            CmpOrdering::Greater => match key.cmp(&block.end_key) {
                CmpOrdering::Greater => low = mid + 1,
                _ => return Some(block),
            },
        }
    }
    None
}
