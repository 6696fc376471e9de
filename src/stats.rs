use std::sync::atomic::{AtomicU64, Ordering};

/// Per-base gauges maintained by the block-table build and teardown paths.
#[derive(Debug, Default)]
pub struct BaseStats {
    /// Size of the base's bloom filter in bytes
    pub bloom_size: AtomicU64,
    /// Size of the base's index block table in bytes
    pub index_blocks_size: AtomicU64,
    /// Corrupt index entries seen while building the block table
    pub index_corrupted_entries: AtomicU64,
    /// Tombstoned records counted in the sorted index
    pub records_removed: AtomicU64,
    /// On-disk bytes held by tombstoned records
    pub removed_size: AtomicU64,
}

impl BaseStats {
    pub fn snapshot(&self) -> BaseStatsSnapshot {
        BaseStatsSnapshot {
            bloom_size: self.bloom_size.load(Ordering::SeqCst),
            index_blocks_size: self.index_blocks_size.load(Ordering::SeqCst),
            index_corrupted_entries: self.index_corrupted_entries.load(Ordering::SeqCst),
            records_removed: self.records_removed.load(Ordering::SeqCst),
            removed_size: self.removed_size.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of a base's gauges, for logging and assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseStatsSnapshot {
    pub bloom_size: u64,
    pub index_blocks_size: u64,
    pub index_corrupted_entries: u64,
    pub records_removed: u64,
    pub removed_size: u64,
}

/// Engine-wide gauges.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Total bases visited by disk lookups
    pub index_reads: AtomicU64,
}

impl EngineStats {
    pub fn index_reads(&self) -> u64 {
        self.index_reads.load(Ordering::SeqCst)
    }
}
