use std::path::PathBuf;

/// Configuration for the disk index engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Path prefix of the store's base files. A base with generation `N`
    /// keeps its data in `<file>-0.N` and its index in `<file>-0.N.index`
    /// (plus `.sorted` / `.tmp` variants once the base is closed).
    pub file: PathBuf,

    /// Number of index entries summarised by one index block (default: 40)
    pub index_block_size: u32,

    /// Bloom filter bits budgeted per index block (default: 640)
    pub index_block_bloom_length: u32,

    /// Maximum skippable corrupt entries per block-table build (default: 10)
    pub index_corrupt_max: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file: PathBuf::from("./cinder/data"),
            index_block_size: 40,
            index_block_bloom_length: 5 * 128,
            index_corrupt_max: 10,
        }
    }
}

impl Config {
    /// Create a new config with the given base file prefix
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            ..Default::default()
        }
    }

    /// Set the index block size in entries
    pub fn index_block_size(mut self, entries: u32) -> Self {
        self.index_block_size = entries;
        self
    }

    /// Set the bloom filter length in bits per index block
    pub fn index_block_bloom_length(mut self, bits: u32) -> Self {
        self.index_block_bloom_length = bits;
        self
    }

    /// Set the maximum number of skippable corrupt index entries
    pub fn index_corrupt_max(mut self, max: u64) -> Self {
        self.index_corrupt_max = max;
        self
    }

    /// Human-readable name of base `index`, used in log lines
    pub fn base_name(&self, index: u32) -> String {
        format!("{}-0.{}", self.file.display(), index)
    }

    /// Path of base `index`'s data file
    pub fn data_path(&self, index: u32) -> PathBuf {
        PathBuf::from(self.base_name(index))
    }

    /// Path of base `index`'s unsorted index file
    pub fn index_path(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}.index", self.base_name(index)))
    }

    /// Path of base `index`'s installed sorted index file
    pub fn index_sorted_path(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}.index.sorted", self.base_name(index)))
    }

    /// Path of base `index`'s work-in-progress sorted index file
    pub fn index_tmp_path(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}.index.tmp", self.base_name(index)))
    }
}
