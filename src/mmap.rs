use std::fs::File;

use memmap2::{Mmap, MmapMut};

use crate::error::{Error, Result};
use crate::record::RECORD_SIZE;

/// Actual size in bytes of an open file.
pub fn file_size(file: &File) -> Result<u64> {
    Ok(file.metadata()?.len())
}

/// Maps a file read-only.
pub fn map_readonly(file: &File) -> Result<Mmap> {
    Ok(unsafe { Mmap::map(file)? })
}

/// Maps a file read-write.
pub fn map_readwrite(file: &File) -> Result<MmapMut> {
    Ok(unsafe { MmapMut::map_mut(file)? })
}

/// Reserves `len` bytes of backing storage for `file` before mapping it.
#[cfg(unix)]
pub fn preallocate(file: &File, len: u64) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let err = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    if err != 0 {
        return Err(Error::IO(
            std::io::Error::from_raw_os_error(err).to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn preallocate(file: &File, len: u64) -> Result<()> {
    file.set_len(len)?;
    Ok(())
}

/// A base's sorted index file, memory-mapped read-only.
///
/// The mapping is a packed array of record control entries ascending by
/// [`crate::record::compare_with_tombstone`].
pub struct SortedIndex {
    map: Mmap,
}

impl SortedIndex {
    /// Maps an existing sorted index file.
    pub fn open(file: &File) -> Result<Self> {
        let size = file_size(file)?;
        if size == 0 {
            return Err(Error::InvalidData("sorted index file is empty".into()));
        }
        Self::from_map(map_readonly(file)?)
    }

    /// Wraps an already-established mapping.
    pub(crate) fn from_map(map: Mmap) -> Result<Self> {
        if map.len() == 0 || map.len() % RECORD_SIZE != 0 {
            return Err(Error::InvalidData(format!(
                "sorted index size {} is not a positive multiple of the {}-byte record stride",
                map.len(),
                RECORD_SIZE
            )));
        }
        Ok(Self { map })
    }

    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn record_count(&self) -> u64 {
        (self.map.len() / RECORD_SIZE) as u64
    }

    /// Raw bytes of the entry at position `idx`. `idx` must be below
    /// [`Self::record_count`].
    pub fn entry(&self, idx: u64) -> &[u8] {
        let start = idx as usize * RECORD_SIZE;
        &self.map[start..start + RECORD_SIZE]
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }
}
