use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::base::{Base, Registry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lookup::{self, Accept, Locator, SearchStat, MAX_TRIES};
use crate::record::{Key, RecordControl, RECORD_SIZE};
use crate::recovery;
use crate::sort;
use crate::stats::EngineStats;

/// The disk index engine: a registry of bases and the lookup protocol
/// over them.
///
/// Thread-safe for concurrent lookups; serialises against at most one
/// in-flight sorted-index build per base.
pub struct Engine {
    config: Arc<Config>,
    registry: Registry,
    stats: EngineStats,
}

impl Engine {
    /// Creates an engine with an empty base registry.
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            registry: Registry::new(),
            stats: EngineStats::default(),
        }
    }

    /// Creates an engine and discovers existing bases on disk, oldest
    /// first. Closed bases get their search structures rebuilt.
    pub fn open(config: Config) -> Result<Self> {
        let engine = Self::new(config);
        for base in recovery::discover_bases(&engine.config)? {
            engine.registry.push(base);
        }
        tracing::info!(bases = engine.registry.len(), "disk index engine opened");
        Ok(engine)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Opens base `index` from its on-disk files and registers it. The
    /// caller must open bases in creation order.
    pub fn open_base(&self, index: u32) -> Result<Arc<Base>> {
        let base = recovery::open_base(&self.config, index)?;
        self.registry.push(Arc::clone(&base));
        Ok(base)
    }

    /// Builds and installs the sorted index for an open base. See
    /// [`sort::generate_sorted_index`].
    pub fn generate_sorted_index(&self, base: &Base) -> Result<()> {
        sort::generate_sorted_index(&self.config, base)
    }

    /// Finds the newest non-tombstoned record with `key` across all closed
    /// bases. `Ok(None)` means no base holds a live record for the key.
    pub fn lookup(&self, key: &Key) -> Result<Option<Locator>> {
        self.lookup_with_stat(key).0
    }

    /// [`Self::lookup`] plus the search telemetry of the call.
    pub fn lookup_with_stat(&self, key: &Key) -> (Result<Option<Locator>>, SearchStat) {
        let mut st = SearchStat::default();
        let result = self.lookup_inner(key, &mut st);
        tracing::debug!(
            ?key,
            loops = st.loops,
            no_sort = st.no_sort,
            search_on_disk = st.search_on_disk,
            bloom_null = st.bloom_null,
            found_index_block = st.found_index_block,
            no_block = st.no_block,
            bsearch_reached = st.bsearch_reached,
            bsearch_found = st.bsearch_found,
            additional_reads = st.additional_reads,
            "disk lookup finished"
        );
        (result, st)
    }

    fn lookup_inner(&self, key: &Key, st: &mut SearchStat) -> Result<Option<Locator>> {
        let mut tries = 0u32;

        'restart: loop {
            let bases = self.registry.snapshot();
            // Newest base first, so the last writer wins.
            for base in bases.iter().rev() {
                st.loops += 1;
                // Hold the base against reclamation by a concurrent data-sort.
                let hold = base.hold();
                if base.is_invalidated() {
                    drop(hold);
                    tries += 1;
                    if tries > MAX_TRIES {
                        return Err(Error::Deadlock);
                    }
                    continue 'restart;
                }
                // Without a sorted index the base's keys are still served
                // from the in-memory index; skip it here.
                let Some(sort_map) = base.sorted() else {
                    st.no_sort += 1;
                    continue;
                };
                let Some(at) = lookup::find_on_disk(base, &sort_map, key, Accept::NonRemoved, st)
                else {
                    tracing::debug!(?key, base = base.index(), "no data");
                    continue;
                };
                // Convert the matched entry to host byte order once, on the hit.
                let rc = RecordControl::decode(sort_map.entry(at))?;
                self.stats
                    .index_reads
                    .fetch_add(st.loops as u64, Ordering::SeqCst);
                tracing::debug!(
                    ?key,
                    base = base.index(),
                    position = rc.position,
                    size = rc.data_size,
                    "found on disk"
                );
                return Ok(Some(Locator {
                    base: hold,
                    data_offset: rc.position,
                    index_offset: at * RECORD_SIZE as u64,
                    size: rc.data_size,
                }));
            }

            self.stats
                .index_reads
                .fetch_add(st.loops as u64, Ordering::SeqCst);
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks;
    use crate::record::{flags, KEY_SIZE};
    use crate::tmpfs::TempDir;
    use std::fs;
    use std::io::Write;

    fn key(b: u8) -> Key {
        let mut id = [0u8; KEY_SIZE];
        id[0] = b;
        Key(id)
    }

    fn wide_key(i: u16) -> Key {
        let mut id = [0u8; KEY_SIZE];
        id[0] = (i >> 8) as u8;
        id[1] = (i & 0xff) as u8;
        Key(id)
    }

    fn rc(k: Key, record_flags: u64, position: u64) -> RecordControl {
        RecordControl {
            key: k,
            flags: record_flags,
            data_size: 64,
            disk_size: RECORD_SIZE as u64,
            position,
        }
    }

    /// Writes the unsorted index and a sparse data file for base `index`.
    fn write_base_files(config: &Config, index: u32, entries: &[RecordControl]) {
        let mut file = fs::File::create(config.index_path(index)).unwrap();
        for entry in entries {
            file.write_all(&entry.encode()).unwrap();
        }
        file.flush().unwrap();

        let data = fs::File::create(config.data_path(index)).unwrap();
        data.set_len(1 << 20).unwrap();
    }

    fn close_base(engine: &Engine, base: &Arc<Base>) {
        engine.generate_sorted_index(base).unwrap();
        blocks::fill(base).unwrap();
    }

    #[test]
    fn test_lookup_single_base() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("data")).index_block_size(2);
        let engine = Engine::new(config);
        write_base_files(
            engine.config(),
            0,
            &[
                rc(key(b'C'), 0, 300),
                rc(key(b'A'), 0, 100),
                rc(key(b'B'), 0, 200),
            ],
        );
        let base = engine.open_base(0).unwrap();

        // Still open: served from RAM, not from this engine.
        let (result, st) = engine.lookup_with_stat(&key(b'B'));
        assert!(result.unwrap().is_none());
        assert_eq!(st.no_sort, 1);

        close_base(&engine, &base);

        let locator = engine.lookup(&key(b'B')).unwrap().expect("B present");
        assert_eq!(locator.base.base().index(), 0);
        assert_eq!(locator.data_offset, 200);
        assert_eq!(locator.index_offset, RECORD_SIZE as u64);
        assert_eq!(locator.size, 64);
        assert_eq!(base.hold_count(), 1);
        drop(locator);
        assert_eq!(base.hold_count(), 0);
    }

    #[test]
    fn test_newest_base_wins() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(Config::new(dir.path().join("data")));
        write_base_files(engine.config(), 0, &[rc(key(b'K'), flags::REMOVED, 100)]);
        write_base_files(engine.config(), 1, &[rc(key(b'K'), 0, 200)]);
        let base0 = engine.open_base(0).unwrap();
        let base1 = engine.open_base(1).unwrap();
        close_base(&engine, &base0);
        close_base(&engine, &base1);

        let (result, st) = engine.lookup_with_stat(&key(b'K'));
        let locator = result.unwrap().expect("newest base has a live K");
        assert_eq!(locator.base.base().index(), 1);
        assert_eq!(locator.data_offset, 200);
        assert_eq!(st.loops, 1);
        assert_eq!(st.bsearch_found, 1);
        assert_eq!(st.additional_reads, 0);
    }

    #[test]
    fn test_all_tombstones_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(Config::new(dir.path().join("data")));
        write_base_files(engine.config(), 0, &[rc(key(b'K'), flags::REMOVED, 0)]);
        write_base_files(
            engine.config(),
            1,
            &[rc(key(b'K'), flags::REMOVED, 0), rc(key(b'L'), 0, 0)],
        );
        let base0 = engine.open_base(0).unwrap();
        let base1 = engine.open_base(1).unwrap();
        close_base(&engine, &base0);
        close_base(&engine, &base1);

        assert!(engine.lookup(&key(b'K')).unwrap().is_none());

        // A key absent from every base is rejected by each base's bloom.
        let (result, st) = engine.lookup_with_stat(&key(b'Z'));
        assert!(result.unwrap().is_none());
        assert_eq!(st.loops, 2);
        assert_eq!(st.bloom_null, 2);
    }

    #[test]
    fn test_absent_key_counters() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("data")).index_block_size(128);
        let engine = Engine::new(config);
        let entries: Vec<RecordControl> = (0..1024u16)
            .map(|i| rc(wide_key(i), 0, i as u64 * RECORD_SIZE as u64))
            .collect();
        write_base_files(engine.config(), 0, &entries);
        let base = engine.open_base(0).unwrap();
        close_base(&engine, &base);

        base.with_search_index(|si| assert_eq!(si.unwrap().block_count(), 8));

        let (result, st) = engine.lookup_with_stat(&wide_key(u16::MAX));
        assert!(result.unwrap().is_none());
        assert_eq!(st.loops, 1);
        assert_eq!(st.bloom_null, 1);
        assert_eq!(st.found_index_block, 0);
        assert_eq!(st.bsearch_reached, 0);
        assert_eq!(engine.stats().index_reads(), 1);
    }

    #[test]
    fn test_removed_base_is_invisible() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(Config::new(dir.path().join("data")));
        write_base_files(engine.config(), 0, &[rc(key(b'K'), 0, 100)]);
        write_base_files(engine.config(), 1, &[rc(key(b'K'), 0, 200)]);
        let base0 = engine.open_base(0).unwrap();
        let base1 = engine.open_base(1).unwrap();
        close_base(&engine, &base0);
        close_base(&engine, &base1);

        // A data-sort tears base 1 down: after invalidation and removal the
        // lookup result equals the result in the base's absence.
        base1.invalidate();
        engine.registry().remove(1).unwrap();

        let locator = engine.lookup(&key(b'K')).unwrap().expect("K in base 0");
        assert_eq!(locator.base.base().index(), 0);
        assert_eq!(locator.data_offset, 100);
    }

    #[test]
    fn test_lingering_invalidated_base_deadlocks() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(Config::new(dir.path().join("data")));
        write_base_files(engine.config(), 0, &[rc(key(b'K'), 0, 100)]);
        let base = engine.open_base(0).unwrap();
        close_base(&engine, &base);

        // Invalidated but never removed: every restart sees it again.
        base.invalidate();
        match engine.lookup(&key(b'K')) {
            Err(Error::Deadlock) => {}
            other => panic!("expected deadlock, got {other:?}"),
        }
        assert_eq!(base.hold_count(), 0);
    }

    #[test]
    fn test_sorted_index_swap_is_atomic_for_lookups() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(Engine::new(Config::new(dir.path().join("data"))));
        let entries: Vec<RecordControl> = (0..256u16)
            .map(|i| rc(wide_key(i), 0, i as u64 * RECORD_SIZE as u64))
            .collect();
        write_base_files(engine.config(), 0, &entries);
        let base = engine.open_base(0).unwrap();

        let probe = wide_key(137);
        let expected_offset = 137 * RECORD_SIZE as u64;
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        // Every observation is either the pre-swap state
                        // (not found) or the post-swap one, never partial.
                        match engine.lookup(&probe) {
                            Ok(None) => {}
                            Ok(Some(locator)) => {
                                assert_eq!(locator.data_offset, expected_offset)
                            }
                            Err(err) => panic!("lookup failed: {err}"),
                        }
                    }
                })
            })
            .collect();

        close_base(&engine, &base);
        for reader in readers {
            reader.join().unwrap();
        }

        let locator = engine.lookup(&probe).unwrap().expect("swap completed");
        assert_eq!(locator.data_offset, expected_offset);
    }

    #[test]
    fn test_open_discovers_existing_bases() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("data"));
        {
            let engine = Engine::new(config.clone());
            write_base_files(engine.config(), 0, &[rc(key(b'K'), 0, 100)]);
            write_base_files(engine.config(), 1, &[rc(key(b'L'), 0, 200)]);
            let base0 = engine.open_base(0).unwrap();
            engine.open_base(1).unwrap();
            close_base(&engine, &base0);
        }
        // A crashed build leaves a stale artifact behind.
        fs::File::create(config.index_tmp_path(7)).unwrap();

        let engine = Engine::open(config.clone()).unwrap();
        assert_eq!(engine.registry().len(), 2);
        assert!(!config.index_tmp_path(7).exists());

        // Base 0 was reopened closed, base 1 is still open.
        let locator = engine.lookup(&key(b'K')).unwrap().expect("closed base");
        assert_eq!(locator.base.base().index(), 0);
        assert_eq!(locator.data_offset, 100);
        drop(locator);

        let (result, st) = engine.lookup_with_stat(&key(b'L'));
        assert!(result.unwrap().is_none());
        assert_eq!(st.no_sort, 1);
    }
}
