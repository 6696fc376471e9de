use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::blocks::{self, IndexBlock, SearchIndex};
use crate::config::Config;
use crate::lookup::SearchStat;
use crate::mmap::SortedIndex;
use crate::record::{Key, RecordControl};
use crate::stats::BaseStats;

/// One generation of the append-only store: a data file plus index file
/// pair identified by its generation number.
///
/// A base starts *open* (still accepting writes, not indexed here) and
/// becomes *closed* once its sorted index is generated and mapped. Closed
/// bases answer disk lookups through their search index until a background
/// data-sort invalidates them.
pub struct Base {
    index: u32,
    name: String,
    config: Arc<Config>,

    /// Size of the base's data file, used for record validation
    data_size: u64,
    /// The raw, unsorted index file; source for the sorted-index builder
    index_file: File,

    /// Sorted-index mapping slot. The mutex only guards the swap; readers
    /// clone the Arc out and scan the mapping without holding it.
    sorted: Mutex<Option<Arc<SortedIndex>>>,
    /// Block table and bloom filter, always installed and torn down as a pair
    search_index: RwLock<Option<SearchIndex>>,

    holds: AtomicUsize,
    invalidated: AtomicBool,

    stats: BaseStats,
}

impl Base {
    pub fn new(config: Arc<Config>, index: u32, index_file: File, data_size: u64) -> Self {
        let name = config.base_name(index);
        Self {
            index,
            name,
            config,
            data_size,
            index_file,
            sorted: Mutex::new(None),
            search_index: RwLock::new(None),
            holds: AtomicUsize::new(0),
            invalidated: AtomicBool::new(false),
            stats: BaseStats::default(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub(crate) fn index_file(&self) -> &File {
        &self.index_file
    }

    pub fn stats(&self) -> &BaseStats {
        &self.stats
    }

    /// Structural validity of a record against this base's data file.
    pub fn check_record(&self, rc: &RecordControl) -> bool {
        rc.check(self.data_size)
    }

    /// Installs a sorted-index mapping, closing the base.
    pub fn install_sorted(&self, sort: Arc<SortedIndex>) {
        *self.sorted.lock().unwrap() = Some(sort);
    }

    /// The current sorted-index mapping, if the base is closed.
    pub fn sorted(&self) -> Option<Arc<SortedIndex>> {
        self.sorted.lock().unwrap().clone()
    }

    /// Acquire a hold preventing reclamation while the base is being read.
    pub fn hold(self: &Arc<Self>) -> BaseHold {
        self.holds.fetch_add(1, Ordering::SeqCst);
        BaseHold {
            base: Arc::clone(self),
        }
    }

    pub fn hold_count(&self) -> usize {
        self.holds.load(Ordering::SeqCst)
    }

    /// Marks the base as being torn down by a data-sort. Lookups observing
    /// the sentinel drop the base and restart their iteration.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        tracing::debug!(base = self.index, "base invalidated");
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub(crate) fn install_search_index(&self, search_index: SearchIndex) {
        *self.search_index.write().unwrap() = Some(search_index);
    }

    /// Searches the block table for the block whose key range may contain
    /// `key`, probing the bloom filter first.
    pub fn probe(&self, key: &Key, st: &mut SearchStat) -> Option<IndexBlock> {
        let guard = self.search_index.read().unwrap();
        let Some(search_index) = guard.as_ref() else {
            st.no_block += 1;
            return None;
        };
        if !search_index.bloom.probe(key) {
            st.bloom_null += 1;
            return None;
        }
        match blocks::find_block(&search_index.blocks, key) {
            Some(block) => {
                st.found_index_block += 1;
                Some(*block)
            }
            None => {
                st.no_block += 1;
                None
            }
        }
    }

    /// Test-only peek at the installed search structures.
    #[cfg(test)]
    pub(crate) fn with_search_index<R>(&self, f: impl FnOnce(Option<&SearchIndex>) -> R) -> R {
        f(self.search_index.read().unwrap().as_ref())
    }

    /// Frees the block table and bloom filter and zeroes their gauges.
    /// Safe to call repeatedly.
    pub fn destroy_search_index(&self) {
        let mut guard = self.search_index.write().unwrap();
        *guard = None;
        self.stats.bloom_size.store(0, Ordering::SeqCst);
        self.stats.index_blocks_size.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Base {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Base")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("holds", &self.hold_count())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

/// RAII hold on a base; the base will not be reclaimed while any hold is
/// alive. Returned lookups carry one inside their locator.
pub struct BaseHold {
    base: Arc<Base>,
}

impl BaseHold {
    pub fn base(&self) -> &Arc<Base> {
        &self.base
    }
}

impl Drop for BaseHold {
    fn drop(&mut self) {
        self.base.holds.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for BaseHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseHold")
            .field("base", &self.base.index())
            .finish()
    }
}

/// The process-wide list of bases, ordered by creation so the newest is
/// last. Lookups iterate a snapshot of it in reverse.
#[derive(Default)]
pub struct Registry {
    bases: RwLock<Vec<Arc<Base>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a newly created base. Callers must add bases in creation order.
    pub fn push(&self, base: Arc<Base>) {
        self.bases.write().unwrap().push(base);
    }

    /// Drops the base with the given generation number from the list.
    pub fn remove(&self, index: u32) -> Option<Arc<Base>> {
        let mut bases = self.bases.write().unwrap();
        let pos = bases.iter().position(|b| b.index() == index)?;
        Some(bases.remove(pos))
    }

    /// A point-in-time copy of the list, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Base>> {
        self.bases.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.bases.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomFilter;
    use crate::tmpfs::NamedTempFile;

    fn make_base(index: u32) -> (Arc<Base>, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let file = tmp.reopen().unwrap();
        let config = Arc::new(Config::new("/tmp/cinder_tests/base_unit"));
        (Arc::new(Base::new(config, index, file, 1 << 20)), tmp)
    }

    #[test]
    fn test_hold_release() {
        let (base, _tmp) = make_base(0);
        assert_eq!(base.hold_count(), 0);

        let hold = base.hold();
        let second = base.hold();
        assert_eq!(base.hold_count(), 2);
        assert_eq!(hold.base().index(), 0);

        drop(hold);
        assert_eq!(base.hold_count(), 1);
        drop(second);
        assert_eq!(base.hold_count(), 0);
    }

    #[test]
    fn test_invalidate() {
        let (base, _tmp) = make_base(1);
        assert!(!base.is_invalidated());
        base.invalidate();
        assert!(base.is_invalidated());
    }

    #[test]
    fn test_destroy_search_index_idempotent() {
        let (base, _tmp) = make_base(0);
        let bloom = BloomFilter::with_size(64, 3).unwrap();
        base.install_search_index(SearchIndex {
            blocks: Vec::new(),
            bloom,
        });
        base.stats().bloom_size.store(64, Ordering::SeqCst);
        base.stats().index_blocks_size.store(144, Ordering::SeqCst);

        base.destroy_search_index();
        assert_eq!(base.stats().snapshot().bloom_size, 0);
        assert_eq!(base.stats().snapshot().index_blocks_size, 0);

        // A second destroy is a no-op, not a fault.
        base.destroy_search_index();
        assert_eq!(base.stats().snapshot().bloom_size, 0);
    }

    #[test]
    fn test_registry_orders_newest_last() {
        let registry = Registry::new();
        let (b0, _t0) = make_base(0);
        let (b1, _t1) = make_base(1);
        let (b2, _t2) = make_base(2);
        registry.push(b0);
        registry.push(b1);
        registry.push(b2);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.last().unwrap().index(), 2);

        registry.remove(1).unwrap();
        let indices: Vec<u32> = registry.snapshot().iter().map(|b| b.index()).collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(registry.remove(1).is_none());
    }
}
