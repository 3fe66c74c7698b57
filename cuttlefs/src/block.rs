//! Flat backing file, block allocator, and sector-level fault injection.
//!
//! # Layout
//!
//! ```text
//! {metadir}/
//!   blocks.img       — flat file, a multiple of PAGE_SIZE bytes long
//!   blocks.img.meta  — JSON: { size, largest_block_num, free_list }
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fault::{FaultOutcome, FaultSequence};
use crate::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

#[derive(Debug, Serialize, Deserialize)]
struct BlockManagerMeta {
    size: u64,
    largest_block_num: u64,
    free_list: Vec<u64>,
}

/// Owns the single flat backing file blocks are allocated from, and the
/// per-(path, byte offset) fault sequences installed against it.
///
/// Block numbers are never reused while a sequence is still running against
/// them implicitly — they go through `free_list`, a LIFO stack, so a freed
/// block is handed back out before the backing file is grown again.
#[derive(Debug)]
pub struct BlockManager {
    path: PathBuf,
    metapath: PathBuf,
    file: Option<File>,
    size: u64,
    largest_block_num: u64,
    free_list: Vec<u64>,
    faulty_paths: HashMap<String, HashMap<u64, FaultSequence>>,
}

impl BlockManager {
    /// Opens the backing file and its metadata sidecar at `path`, creating
    /// both if they do not yet exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the files cannot be created or read, or
    /// [`Error::Json`] if an existing metadata sidecar is malformed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let metapath = meta_path(path);

        if !metapath.exists() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            file.set_len(PAGE_SIZE as u64)?;
            file.sync_all()?;
            let meta = BlockManagerMeta {
                size: PAGE_SIZE as u64,
                largest_block_num: 0,
                free_list: Vec::new(),
            };
            write_meta_atomically(&metapath, &meta)?;
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let meta_text = fs::read_to_string(&metapath)?;
        let meta: BlockManagerMeta = serde_json::from_str(&meta_text)?;

        Ok(Self {
            path: path.to_path_buf(),
            metapath,
            file: Some(file),
            size: meta.size,
            largest_block_num: meta.largest_block_num,
            free_list: meta.free_list,
            faulty_paths: HashMap::new(),
        })
    }

    /// Allocates a block, preferring a freed block over growing the file.
    pub fn alloc_block(&mut self) -> u64 {
        let bnum = if let Some(bnum) = self.free_list.pop() {
            bnum
        } else {
            let bnum = self.largest_block_num;
            self.largest_block_num += 1;
            bnum
        };
        log::debug!("allocated block {bnum}");
        bnum
    }

    /// Returns a block to the free list for future reuse.
    /// Number of blocks available for reuse before the backing file must
    /// grow. Exposed for tests that need to observe deallocation.
    #[cfg(test)]
    pub(crate) fn free_block_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn dealloc_block(&mut self, bnum: u64) {
        log::debug!("deallocated block {bnum}");
        self.free_list.push(bnum);
    }

    /// Reads one full page's worth of bytes from block `bnum`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the backing file is closed or the read
    /// fails.
    pub fn bread(&self, bnum: u64) -> Result<Box<[u8; PAGE_SIZE]>> {
        let file = self.file.as_ref().ok_or_else(closed_err)?;
        let mut buf = Box::new([0_u8; PAGE_SIZE]);
        file.read_exact_at(&mut buf[..], bnum * PAGE_SIZE as u64)?;
        Ok(buf)
    }

    /// Writes one full page's worth of bytes to block `bnum`, injecting any
    /// fault sequence installed on `path` at the sectors covered by
    /// `logical_offset`.
    ///
    /// Returns `Ok(true)` if every sector in the page was written
    /// successfully, `Ok(false)` if at least one sector's fault sequence
    /// reported a failure (those sectors are left unwritten; the rest still
    /// land on disk, matching how a real disk controller only drops the
    /// sectors it actually fails).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the backing file is closed or an
    /// unsimulated write fails.
    pub fn bwrite(
        &mut self,
        bnum: u64,
        data: &[u8; PAGE_SIZE],
        path: &str,
        logical_offset: u64,
    ) -> Result<bool> {
        let faults = self.faulty_paths.get_mut(path);
        let file = self.file.as_ref().ok_or_else(closed_err)?;
        let base = bnum * PAGE_SIZE as u64;
        let mut all_ok = true;

        if let Some(faults) = faults {
            for i in 0..SECTORS_PER_PAGE {
                let sec_off = logical_offset + (i * SECTOR_SIZE) as u64;
                let outcome = faults.get_mut(&sec_off).map(FaultSequence::next);
                if outcome == Some(FaultOutcome::Fail) {
                    all_ok = false;
                    continue;
                }
                let start = i * SECTOR_SIZE;
                file.write_all_at(&data[start..start + SECTOR_SIZE], base + start as u64)?;
            }
        } else {
            file.write_all_at(data, base)?;
        }

        let end = base + PAGE_SIZE as u64;
        if end > self.size {
            self.size = end;
        }
        if !all_ok {
            log::warn!("fault injected: sector write dropped for {path:?} at block {bnum}");
        }
        Ok(all_ok)
    }

    /// Installs a fault sequence on a block or single sector of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateFaultOffset`] if a sequence is already
    /// installed on any offset this call would touch.
    pub fn enable_failures_on(
        &mut self,
        path: &str,
        seq: &FaultSequence,
        idx: u64,
        is_block: bool,
    ) -> Result<()> {
        let offsets: Vec<u64> = if is_block {
            (0..SECTORS_PER_PAGE)
                .map(|i| idx * PAGE_SIZE as u64 + (i * SECTOR_SIZE) as u64)
                .collect()
        } else {
            vec![idx * SECTOR_SIZE as u64]
        };

        let entry = self.faulty_paths.entry(path.to_string()).or_default();
        for offset in offsets {
            if entry.contains_key(&offset) {
                return Err(Error::DuplicateFaultOffset {
                    path: path.to_string(),
                    offset,
                });
            }
            entry.insert(offset, seq.clone());
        }
        Ok(())
    }

    /// Removes every installed fault sequence (the `allow-all-writes`
    /// control command).
    pub fn clear_all_faults(&mut self) {
        self.faulty_paths.clear();
    }

    /// Flushes and fsyncs the backing file, closes it, then atomically
    /// rewrites and fsyncs the metadata sidecar.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file is already closed or any I/O step
    /// fails.
    pub fn sync(&mut self) -> Result<()> {
        let file = self.file.take().ok_or_else(closed_err)?;
        file.sync_all()?;
        drop(file);

        let meta = BlockManagerMeta {
            size: self.size,
            largest_block_num: self.largest_block_num,
            free_list: self.free_list.clone(),
        };
        write_meta_atomically(&self.metapath, &meta)?;

        self.file = Some(OpenOptions::new().read(true).write(true).open(&self.path)?);
        Ok(())
    }
}

fn meta_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".meta");
    PathBuf::from(p)
}

fn write_meta_atomically(metapath: &Path, meta: &BlockManagerMeta) -> Result<()> {
    let tmp = meta_path(metapath);
    let json = serde_json::to_vec(meta)?;
    fs::write(&tmp, &json)?;
    let f = OpenOptions::new().write(true).open(&tmp)?;
    f.sync_all()?;
    fs::rename(&tmp, metapath)?;
    Ok(())
}

fn closed_err() -> Error {
    Error::Io(std::io::Error::other(
        "block manager's backing file is closed",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> BlockManager {
        BlockManager::open(&dir.join("blocks.img")).unwrap()
    }

    #[test]
    fn alloc_grows_then_reuses_freed_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = manager(dir.path());
        let a = bm.alloc_block();
        let b = bm.alloc_block();
        assert_ne!(a, b);
        bm.dealloc_block(a);
        let c = bm.alloc_block();
        assert_eq!(c, a, "freed block is reused before growing further");
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = manager(dir.path());
        let bnum = bm.alloc_block();
        let mut data = [0_u8; PAGE_SIZE];
        data[0] = 0xAB;
        let ok = bm.bwrite(bnum, &data, "/a", 0).unwrap();
        assert!(ok);
        let back = bm.bread(bnum).unwrap();
        assert_eq!(back[0], 0xAB);
    }

    #[test]
    fn fault_sequence_drops_only_the_targeted_sector() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = manager(dir.path());
        let bnum = bm.alloc_block();
        let seq = FaultSequence::new("X").unwrap();
        bm.enable_failures_on("/a", &seq, 0, false).unwrap();

        let data = [0xFF_u8; PAGE_SIZE];
        let ok = bm.bwrite(bnum, &data, "/a", 0).unwrap();
        assert!(!ok);

        let back = bm.bread(bnum).unwrap();
        // sector 0 was never written (still zero), the rest landed.
        assert_eq!(back[0], 0);
        assert_eq!(back[SECTOR_SIZE], 0xFF);
    }

    #[test]
    fn duplicate_fault_installation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = manager(dir.path());
        let seq = FaultSequence::new("X").unwrap();
        bm.enable_failures_on("/a", &seq, 0, false).unwrap();
        assert!(matches!(
            bm.enable_failures_on("/a", &seq, 0, false),
            Err(Error::DuplicateFaultOffset { .. })
        ));
    }

    #[test]
    fn sync_then_reopen_preserves_allocator_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.img");
        let mut bm = BlockManager::open(&path).unwrap();
        let a = bm.alloc_block();
        bm.dealloc_block(a);
        let b = bm.alloc_block();
        bm.sync().unwrap();
        drop(bm);

        let mut reopened = BlockManager::open(&path).unwrap();
        let c = reopened.alloc_block();
        assert_ne!(c, b, "largest_block_num advanced past both allocations");
    }
}
