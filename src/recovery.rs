use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use crate::base::Base;
use crate::blocks;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::mmap::SortedIndex;

/// Scans the store directory for base files and opens every base found,
/// oldest first. Leftover sorted-index build artifacts are cleaned up.
pub(crate) fn discover_bases(config: &Arc<Config>) -> Result<Vec<Arc<Base>>> {
    let dir = match config.file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let Some(prefix) = config.file.file_name().and_then(|name| name.to_str()) else {
        return Err(Error::InvalidData(format!(
            "base file prefix {:?} has no valid file name",
            config.file
        )));
    };
    let prefix = format!("{prefix}-0.");

    fs::create_dir_all(dir)?;

    let mut indices = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        // A crashed sorted-index build leaves its work file behind.
        if let Some(stem) = rest.strip_suffix(".index.tmp") {
            if stem.parse::<u32>().is_ok() {
                tracing::warn!(file = name, "removing stale sorted-index build artifact");
                let _ = fs::remove_file(entry.path());
            }
            continue;
        }
        let Some(stem) = rest.strip_suffix(".index") else {
            continue;
        };
        if let Ok(index) = stem.parse::<u32>() {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    indices.dedup();

    let mut bases = Vec::with_capacity(indices.len());
    for index in indices {
        bases.push(open_base(config, index)?);
    }
    Ok(bases)
}

/// Opens one base from its on-disk files. If an installed sorted index
/// exists the base is reopened closed: the index is mapped and the search
/// structures are rebuilt over it.
pub(crate) fn open_base(config: &Arc<Config>, index: u32) -> Result<Arc<Base>> {
    let index_file = File::open(config.index_path(index))?;
    let data_size = fs::metadata(config.data_path(index))?.len();
    let base = Arc::new(Base::new(Arc::clone(config), index, index_file, data_size));

    let sorted_path = config.index_sorted_path(index);
    if sorted_path.exists() {
        let sorted_file = File::open(&sorted_path)?;
        base.install_sorted(Arc::new(SortedIndex::open(&sorted_file)?));
        blocks::fill(&base)?;
        tracing::debug!(base = index, "opened closed base");
    } else {
        tracing::debug!(base = index, "opened base without sorted index");
    }
    Ok(base)
}
