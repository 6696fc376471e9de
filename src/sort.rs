//! Offline generation of a base's sorted index.
//!
//! The unsorted index is mapped read-only, its entries are written into a
//! preallocated `.index.tmp` mapping in sorted order, and the result is
//! synced, swapped into the base's mapping slot, and renamed into place:
//!
//! ```text
//! <data>-0.N.index  --copy+sort-->  <data>-0.N.index.tmp
//!                                      |  msync
//!                                      |  install mapping   (in-process
//!                                      |                     linearisation)
//!                                      v
//!                                   <data>-0.N.index.sorted (rename: external
//!                                                            linearisation)
//! ```
//!
//! On failure nothing is installed; mappings and descriptors unwind in
//! reverse order as they drop.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::base::Base;
use crate::config::Config;
use crate::errdata;
use crate::error::Result;
use crate::mmap::{self, SortedIndex};
use crate::record::{self, RECORD_SIZE};

/// Sorts the unsorted index of `base` into `<data>-0.N.index.sorted` and
/// installs the new mapping, closing the base.
///
/// Entries are ordered by key, tombstones first within an equal-key run,
/// so downstream consumers see deletions ahead of the data they shadow.
pub fn generate_sorted_index(config: &Config, base: &Base) -> Result<()> {
    let tmp_path = config.index_tmp_path(base.index());
    let sorted_path = config.index_sorted_path(base.index());

    let src_size = mmap::file_size(base.index_file())?;
    if src_size == 0 {
        return errdata!("base {}: index is empty, nothing to sort", base.name());
    }
    if src_size % RECORD_SIZE as u64 != 0 {
        return errdata!(
            "base {}: index size {} is not a multiple of the record stride",
            base.name(),
            src_size
        );
    }
    let src = mmap::map_readonly(base.index_file())?;

    let tmp_file = create_tmp(&tmp_path)?;
    mmap::preallocate(&tmp_file, src_size)?;
    let mut dst = mmap::map_readwrite(&tmp_file)?;

    // Write the source entries into the destination in sorted order; the
    // destination ends up a stride-wise permutation of the source.
    let count = src_size as usize / RECORD_SIZE;
    let mut order: Vec<usize> = (0..count).collect();
    order.sort_unstable_by(|&a, &b| {
        record::compare_with_tombstone(entry_at(&src, a), entry_at(&src, b))
    });
    for (pos, &src_idx) in order.iter().enumerate() {
        dst[pos * RECORD_SIZE..(pos + 1) * RECORD_SIZE].copy_from_slice(entry_at(&src, src_idx));
    }
    dst.flush()?;

    // Concurrent lookups in this process see either the old mapping or the
    // fully sorted new one, never a partial state.
    let map = dst.make_read_only()?;
    base.install_sorted(Arc::new(SortedIndex::from_map(map)?));

    // External observers linearise on the rename.
    fs::rename(&tmp_path, &sorted_path)?;

    tracing::info!(
        base = base.index(),
        size = src_size,
        file = %sorted_path.display(),
        "generated sorted index"
    );
    Ok(())
}

fn entry_at(bytes: &[u8], idx: usize) -> &[u8] {
    &bytes[idx * RECORD_SIZE..(idx + 1) * RECORD_SIZE]
}

#[cfg(unix)]
fn create_tmp(path: &Path) -> Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    Ok(fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)?)
}

#[cfg(not(unix))]
fn create_tmp(path: &Path) -> Result<fs::File> {
    Ok(fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}
