//! In-memory page cache entries and the per-file on-disk metadata record.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::PAGE_SIZE;

/// One page-sized window of a file's content, held in memory.
#[derive(Debug, Clone)]
pub struct Page {
    /// Host inode this page belongs to.
    pub inode: u64,
    /// Byte offset within the file this page starts at (a multiple of
    /// [`PAGE_SIZE`]).
    pub offset: u64,
    /// The page's content.
    pub content: Box<[u8; PAGE_SIZE]>,
    /// Whether this page has been written since it was last synced.
    pub dirty: bool,
}

impl Page {
    /// Creates a zero-filled page.
    #[must_use]
    pub fn new(inode: u64, offset: u64) -> Self {
        Self {
            inode,
            offset,
            content: Box::new([0_u8; PAGE_SIZE]),
            dirty: false,
        }
    }
}

/// The JSON-serializable on-disk metadata record for a single file.
///
/// Crash-consistency of this record itself is out of scope — writes to it
/// are plain, non-atomic `fs::write` calls, matching the original
/// implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeMetaRecord {
    /// Logical file size in bytes.
    pub size: u64,
    /// Last access time, seconds since the epoch.
    pub atime: f64,
    /// Last modification time, seconds since the epoch.
    pub mtime: f64,
    /// Map from page-aligned byte offset (as a string key, for JSON object
    /// compatibility) to the backing-file block number holding that page.
    pub offset_to_block: HashMap<String, u64>,
}

/// The in-memory representation of an open file: its page cache entries,
/// offset-to-block mapping, and cached metadata fields.
#[derive(Debug)]
pub struct MemInode {
    /// Host inode number.
    pub host_inode: u64,
    /// Logical path (relative to the mount root) this inode was opened
    /// through. Used as the key fault sequences are installed against.
    pub path: String,
    /// Absolute path to the metadata record file on the host filesystem.
    pub realpath: PathBuf,
    /// Page-aligned offset to backing-file block number.
    pub offset_to_block: BTreeMap<u64, u64>,
    /// Page-aligned offset to the in-memory page, for pages that have been
    /// materialized.
    pub offset_to_page: BTreeMap<u64, Page>,
    /// Logical file size in bytes.
    pub size: u64,
    /// Last access time, seconds since the epoch.
    pub atime: f64,
    /// Last modification time, seconds since the epoch.
    pub mtime: f64,
}

impl MemInode {
    /// Loads a [`MemInode`] by reading its metadata record from disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] or [`crate::Error::Json`] if the record
    /// cannot be read or parsed.
    pub fn load(host_inode: u64, path: String, realpath: PathBuf) -> Result<Self> {
        let record = read_record(&realpath)?;
        Ok(Self {
            host_inode,
            path,
            offset_to_block: record
                .offset_to_block
                .iter()
                .map(|(k, v)| (k.parse().unwrap_or(0), *v))
                .collect(),
            offset_to_page: BTreeMap::new(),
            size: record.size,
            atime: record.atime,
            mtime: record.mtime,
            realpath,
        })
    }

    /// Writes this inode's metadata fields back to its record file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] or [`crate::Error::Json`] if the write
    /// fails.
    pub fn persist_meta(&self) -> Result<()> {
        let record = InodeMetaRecord {
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            offset_to_block: self
                .offset_to_block
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        };
        write_record(&self.realpath, &record)
    }

    /// Reverts this inode's in-memory fields to what is currently on disk,
    /// discarding any in-memory block mapping changes made since the last
    /// successful sync. Used by the Btrfs fsync policy to undo a partially
    /// applied copy-on-write batch.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] or [`crate::Error::Json`] if the record
    /// cannot be read.
    pub fn revert_to_disk(&mut self) -> Result<()> {
        let record = read_record(&self.realpath)?;
        self.size = record.size;
        self.atime = record.atime;
        self.mtime = record.mtime;
        self.offset_to_block = record
            .offset_to_block
            .iter()
            .map(|(k, v)| (k.parse().unwrap_or(0), *v))
            .collect();
        Ok(())
    }

    /// Returns the page-aligned offsets of every dirty page, in ascending
    /// order.
    #[must_use]
    pub fn dirty_offsets(&self) -> Vec<u64> {
        self.offset_to_page
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(&off, _)| off)
            .collect()
    }
}

fn read_record(path: &Path) -> Result<InodeMetaRecord> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn write_record(path: &Path, record: &InodeMetaRecord) -> Result<()> {
    let text = serde_json::to_vec(record)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Writes an initial, empty metadata record for a newly created file.
///
/// # Errors
///
/// Returns [`crate::Error::Io`] or [`crate::Error::Json`] if the write
/// fails.
pub(crate) fn write_initial_record(path: &Path, now: f64) -> Result<()> {
    write_record(
        path,
        &InodeMetaRecord {
            size: 0,
            atime: now,
            mtime: now,
            offset_to_block: HashMap::new(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        write_initial_record(&path, 1000.0).unwrap();

        let mut minode = MemInode::load(42, "/a".into(), path.clone()).unwrap();
        assert_eq!(minode.size, 0);
        minode.size = 4096;
        minode.offset_to_block.insert(0, 7);
        minode.persist_meta().unwrap();

        let reloaded = MemInode::load(42, "/a".into(), path).unwrap();
        assert_eq!(reloaded.size, 4096);
        assert_eq!(reloaded.offset_to_block.get(&0), Some(&7));
    }

    #[test]
    fn dirty_offsets_are_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        write_initial_record(&path, 0.0).unwrap();
        let mut minode = MemInode::load(1, "/a".into(), path).unwrap();

        let mut clean = Page::new(1, 0);
        clean.dirty = false;
        let mut dirty_high = Page::new(1, PAGE_SIZE as u64 * 2);
        dirty_high.dirty = true;
        let mut dirty_low = Page::new(1, PAGE_SIZE as u64);
        dirty_low.dirty = true;

        minode.offset_to_page.insert(clean.offset, clean);
        minode.offset_to_page.insert(dirty_high.offset, dirty_high);
        minode.offset_to_page.insert(dirty_low.offset, dirty_low);

        assert_eq!(
            minode.dirty_offsets(),
            vec![PAGE_SIZE as u64, PAGE_SIZE as u64 * 2]
        );
    }
}
