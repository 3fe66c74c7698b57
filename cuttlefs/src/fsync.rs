//! The Fsync Policy Engine: four state machines modeling how real
//! filesystems report storage failures through `fsync`.
//!
//! All four share the same "who gets notified" bookkeeping (an fd that
//! witnessed a failure must see it on its own next fsync call, and in the
//! absence of any surviving witness the next fd opened on that inode
//! inherits the debt). They differ in when pages are considered committed
//! and whether a failed commit is rolled back:
//!
//! - [`FsyncKind::Ext4Ordered`] / [`FsyncKind::Xfs`] ("generic"): every
//!   dirty page is attempted regardless of earlier failures in the same
//!   call, each page is marked clean before its write is attempted, and the
//!   failure is reported on the very call that produced it.
//! - [`FsyncKind::Ext4Data`]: a pending failure is checked for and reported
//!   *before* any page is touched; otherwise pages are synced exactly like
//!   the generic policy, but a failure during this call is only queued for
//!   a later call — the call that caused it still reports success.
//! - [`FsyncKind::Btrfs`]: copy-on-write. Every dirty page gets a freshly
//!   allocated block; on the first sector failure the whole batch is
//!   abandoned, every block newly allocated in this batch is freed, and the
//!   inode's in-memory state reverts to what is on disk. A sync write on an
//!   fd is treated identically to a full fsync of every dirty page, not
//!   just the pages that write touched.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::block::BlockManager;
use crate::error::{io_to_errno, Errno, Error};
use crate::page::MemInode;

/// Which fsync failure-reporting policy a mount uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncKind {
    /// ext4 in `data=ordered` mode (the default).
    Ext4Ordered,
    /// XFS. Shares the generic immediate-report policy with `Ext4Ordered`.
    Xfs,
    /// ext4 in a journaling mode with deferred error reporting.
    Ext4Data,
    /// Btrfs's copy-on-write commit-or-revert policy.
    Btrfs,
}

impl FromStr for FsyncKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4-ordered" => Ok(Self::Ext4Ordered),
            "xfs" => Ok(Self::Xfs),
            "ext4-data" => Ok(Self::Ext4Data),
            "btrfs" => Ok(Self::Btrfs),
            other => Err(Error::UnsupportedFsyncPolicy(other.to_string())),
        }
    }
}

/// Tracks, per inode, which open file descriptors still owe a failure
/// notification.
///
/// An empty-but-present set for an inode is a sentinel: it means a failure
/// happened and every fd that witnessed it has since been notified or
/// closed, but the debt itself has not been discharged — the next fd opened
/// on that inode must still be notified once. [`Self::mark_notified`]
/// collapses an emptied entry away (the debt is paid); [`Self::on_close_fd`]
/// deliberately does not, so the sentinel survives an fd closing before it
/// ever calls fsync again.
#[derive(Debug, Default)]
struct NotifyTracker {
    failed: HashMap<u64, HashSet<i32>>,
}

impl NotifyTracker {
    fn should_notify(&self, fd: i32, inode: u64) -> bool {
        match self.failed.get(&inode) {
            None => false,
            Some(set) => set.is_empty() || set.contains(&fd),
        }
    }

    fn add_fds_to_notify(&mut self, inode: u64, open_fds: Option<&HashSet<i32>>) {
        let entry = self.failed.entry(inode).or_default();
        if let Some(set) = open_fds {
            entry.extend(set.iter().copied());
        }
    }

    fn mark_notified(&mut self, fd: i32, inode: u64) {
        if let Some(set) = self.failed.get_mut(&inode) {
            set.remove(&fd);
            if set.is_empty() {
                self.failed.remove(&inode);
            }
        }
    }

    fn on_close_fd(&mut self, fd: i32, inode: u64) {
        if let Some(set) = self.failed.get_mut(&inode) {
            set.remove(&fd);
        }
    }
}

/// The two capabilities an fsync policy needs, bundled so each call site
/// does not have to thread the whole [`crate::Facade`] through.
pub struct FsyncContext<'a> {
    /// The backing-file block allocator and fault injector.
    pub block_manager: &'a mut BlockManager,
    /// File descriptors currently open on each inode, for notification
    /// fan-out.
    pub open_fds: &'a HashMap<u64, HashSet<i32>>,
}

/// The fsync failure-reporting state machine for one mount.
#[derive(Debug)]
pub struct FsyncEngine {
    kind: FsyncKind,
    notify: NotifyTracker,
}

impl FsyncEngine {
    /// Creates an engine implementing `kind`'s policy.
    #[must_use]
    pub fn new(kind: FsyncKind) -> Self {
        Self {
            kind,
            notify: NotifyTracker::default(),
        }
    }

    /// Handles `fsync(2)`/`fdatasync(2)` on `fd`, flushing every dirty page
    /// of `minode` and persisting its metadata record.
    ///
    /// # Errors
    ///
    /// Returns `Err(Errno::EIO)` if the policy determines this call should
    /// report failure.
    pub fn on_fsync(
        &mut self,
        ctx: &mut FsyncContext<'_>,
        fd: i32,
        inode: u64,
        minode: &mut MemInode,
    ) -> Result<(), Errno> {
        let dirty = minode.dirty_offsets();
        match self.kind {
            FsyncKind::Ext4Ordered | FsyncKind::Xfs => {
                generic_on_fsync(&mut self.notify, ctx, fd, inode, minode, &dirty)
            }
            FsyncKind::Ext4Data => {
                ext4_data_sync(&mut self.notify, ctx, fd, inode, minode, &dirty)
            }
            FsyncKind::Btrfs => btrfs_sync(&mut self.notify, ctx, fd, inode, minode, &dirty),
        }
    }

    /// Handles the implicit sync a write performs when its fd was opened
    /// with `O_SYNC`/`O_DSYNC`.
    ///
    /// `written_offsets` are the pages `write` just touched. The generic and
    /// ext4-data policies flush only those; the btrfs policy is defined to
    /// behave exactly as a full fsync, flushing every currently dirty page
    /// regardless of what this particular write touched.
    ///
    /// # Errors
    ///
    /// Returns `Err(Errno::EIO)` under the same conditions as
    /// [`Self::on_fsync`].
    pub fn on_sync_write(
        &mut self,
        ctx: &mut FsyncContext<'_>,
        fd: i32,
        inode: u64,
        minode: &mut MemInode,
        written_offsets: &[u64],
    ) -> Result<(), Errno> {
        match self.kind {
            FsyncKind::Ext4Ordered | FsyncKind::Xfs => {
                generic_on_sync_write(&mut self.notify, ctx, fd, inode, minode, written_offsets)
            }
            FsyncKind::Ext4Data => {
                ext4_data_sync(&mut self.notify, ctx, fd, inode, minode, written_offsets)
            }
            FsyncKind::Btrfs => {
                let dirty = minode.dirty_offsets();
                btrfs_sync(&mut self.notify, ctx, fd, inode, minode, &dirty)
            }
        }
    }

    /// Notifies the engine that `fd` has been closed, so a pending
    /// notification is not left addressed to a descriptor that no longer
    /// exists.
    pub fn on_close_fd(&mut self, fd: i32, inode: u64) {
        self.notify.on_close_fd(fd, inode);
    }
}

/// Writes every page at `offsets`, clearing its dirty flag before the
/// attempt (matching real page-cache writeback, which does not re-dirty a
/// page just because its I/O failed). Returns whether every page in
/// `offsets` was written successfully; a failure on one page does not stop
/// the others from being attempted, matching a single multi-sector bio
/// request where only the failing sectors are dropped.
fn sync_pages(
    block_manager: &mut BlockManager,
    minode: &mut MemInode,
    offsets: &[u64],
) -> Result<bool, Error> {
    let mut all_ok = true;
    for &off in offsets {
        let Some(page) = minode.offset_to_page.get(&off) else {
            continue;
        };
        if !page.dirty {
            continue;
        }
        let block = *minode
            .offset_to_block
            .entry(off)
            .or_insert_with(|| block_manager.alloc_block());
        let page = minode
            .offset_to_page
            .get_mut(&off)
            .expect("checked present above");
        page.dirty = false;
        let ok = block_manager.bwrite(block, &page.content, &minode.path, off)?;
        all_ok &= ok;
    }
    Ok(all_ok)
}

fn sync_meta(minode: &MemInode) -> Result<(), Error> {
    minode.persist_meta()
}

fn generic_on_fsync(
    notify: &mut NotifyTracker,
    ctx: &mut FsyncContext<'_>,
    fd: i32,
    inode: u64,
    minode: &mut MemInode,
    offsets: &[u64],
) -> Result<(), Errno> {
    let ok = sync_pages(ctx.block_manager, minode, offsets).map_err(io_to_errno)?;
    sync_meta(minode).map_err(io_to_errno)?;
    if !ok {
        notify.add_fds_to_notify(inode, ctx.open_fds.get(&inode));
    }
    if notify.should_notify(fd, inode) {
        notify.mark_notified(fd, inode);
        return Err(Errno::EIO);
    }
    Ok(())
}

fn generic_on_sync_write(
    notify: &mut NotifyTracker,
    ctx: &mut FsyncContext<'_>,
    fd: i32,
    inode: u64,
    minode: &mut MemInode,
    offsets: &[u64],
) -> Result<(), Errno> {
    if notify.should_notify(fd, inode) {
        notify.mark_notified(fd, inode);
        return Err(Errno::EIO);
    }
    let ok = sync_pages(ctx.block_manager, minode, offsets).map_err(io_to_errno)?;
    sync_meta(minode).map_err(io_to_errno)?;
    if !ok {
        notify.add_fds_to_notify(inode, ctx.open_fds.get(&inode));
        notify.mark_notified(fd, inode);
        return Err(Errno::EIO);
    }
    Ok(())
}

/// Shared by `Ext4Data`'s `on_fsync` and `on_sync_write` — the original
/// implementation gives both the same body, differing only in which
/// offsets they flush.
fn ext4_data_sync(
    notify: &mut NotifyTracker,
    ctx: &mut FsyncContext<'_>,
    fd: i32,
    inode: u64,
    minode: &mut MemInode,
    offsets: &[u64],
) -> Result<(), Errno> {
    if notify.should_notify(fd, inode) {
        notify.mark_notified(fd, inode);
        return Err(Errno::EIO);
    }
    let ok = sync_pages(ctx.block_manager, minode, offsets).map_err(io_to_errno)?;
    sync_meta(minode).map_err(io_to_errno)?;
    if !ok {
        notify.add_fds_to_notify(inode, ctx.open_fds.get(&inode));
    }
    Ok(())
}

/// Copy-on-write page sync shared by `Btrfs`'s `on_fsync` and
/// `on_sync_write` (the latter simply flushes every dirty page, same as a
/// full fsync).
fn btrfs_sync(
    notify: &mut NotifyTracker,
    ctx: &mut FsyncContext<'_>,
    fd: i32,
    inode: u64,
    minode: &mut MemInode,
    offsets: &[u64],
) -> Result<(), Errno> {
    if notify.should_notify(fd, inode) {
        notify.mark_notified(fd, inode);
        return Err(Errno::EIO);
    }

    let ok = btrfs_sync_pages(ctx.block_manager, minode, offsets).map_err(io_to_errno)?;
    if ok {
        sync_meta(minode).map_err(io_to_errno)?;
        return Ok(());
    }

    minode.revert_to_disk().map_err(io_to_errno)?;
    for &off in offsets {
        minode.offset_to_page.remove(&off);
    }
    notify.add_fds_to_notify(inode, ctx.open_fds.get(&inode));
    notify.mark_notified(fd, inode);
    Err(Errno::EIO)
}

/// Writes every page at `offsets` to a freshly allocated block each,
/// stopping at the first sector failure. On success, the old blocks those
/// offsets used to point at are freed (the rest of the batch already points
/// at the new ones). On failure, every block freshly allocated in this
/// batch — including ones that wrote successfully before the failure — is
/// freed, since the whole batch is abandoned.
fn btrfs_sync_pages(
    block_manager: &mut BlockManager,
    minode: &mut MemInode,
    offsets: &[u64],
) -> Result<bool, Error> {
    let mut old_blocks = Vec::new();
    let mut new_blocks = Vec::new();
    let mut all_ok = true;

    for &off in offsets {
        let Some(page) = minode.offset_to_page.get(&off) else {
            continue;
        };
        if !page.dirty {
            continue;
        }

        let old_block = minode.offset_to_block.get(&off).copied();
        let new_block = block_manager.alloc_block();
        minode.offset_to_block.insert(off, new_block);
        new_blocks.push(new_block);
        if let Some(old_block) = old_block {
            old_blocks.push(old_block);
        }

        let page = minode
            .offset_to_page
            .get_mut(&off)
            .expect("checked present above");
        page.dirty = false;
        let ok = block_manager.bwrite(new_block, &page.content, &minode.path, off)?;
        if !ok {
            all_ok = false;
            break;
        }
    }

    let dealloc = if all_ok { &old_blocks } else { &new_blocks };
    for &block in dealloc {
        block_manager.dealloc_block(block);
    }
    Ok(all_ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::write_initial_record;
    use std::collections::{HashMap, HashSet};

    fn minode(dir: &std::path::Path, inode: u64) -> MemInode {
        let path = dir.join(format!("meta{inode}.json"));
        write_initial_record(&path, 0.0).unwrap();
        MemInode::load(inode, format!("/f{inode}"), path).unwrap()
    }

    fn dirty_page(minode: &mut MemInode, off: u64, byte: u8) {
        let mut page = crate::page::Page::new(minode.host_inode, off);
        page.content[0] = byte;
        page.dirty = true;
        minode.offset_to_page.insert(off, page);
        minode.size = minode.size.max(off + crate::PAGE_SIZE as u64);
    }

    #[test]
    fn fsync_kind_from_str_round_trip() {
        assert_eq!(
            "ext4-ordered".parse::<FsyncKind>().unwrap(),
            FsyncKind::Ext4Ordered
        );
        assert_eq!("xfs".parse::<FsyncKind>().unwrap(), FsyncKind::Xfs);
        assert_eq!(
            "ext4-data".parse::<FsyncKind>().unwrap(),
            FsyncKind::Ext4Data
        );
        assert_eq!("btrfs".parse::<FsyncKind>().unwrap(), FsyncKind::Btrfs);
        assert!("zfs".parse::<FsyncKind>().is_err());
    }

    #[test]
    fn generic_reports_failure_on_the_failing_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = BlockManager::open(&dir.path().join("blocks.img")).unwrap();
        let mut minode = minode(dir.path(), 1);
        dirty_page(&mut minode, 0, 0xAA);
        let seq = crate::fault::FaultSequence::new("X").unwrap();
        bm.enable_failures_on(&minode.path, &seq, 0, true).unwrap();

        let mut engine = FsyncEngine::new(FsyncKind::Ext4Ordered);
        let open_fds: HashMap<u64, HashSet<i32>> = [(1, HashSet::from([5]))].into();
        let mut ctx = FsyncContext {
            block_manager: &mut bm,
            open_fds: &open_fds,
        };
        let result = engine.on_fsync(&mut ctx, 5, 1, &mut minode);
        assert_eq!(result, Err(Errno::EIO));
    }

    #[test]
    fn ext4_data_reports_success_on_the_failing_call_itself() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = BlockManager::open(&dir.path().join("blocks.img")).unwrap();
        let mut minode = minode(dir.path(), 1);
        dirty_page(&mut minode, 0, 0xAA);
        let seq = crate::fault::FaultSequence::new("X").unwrap();
        bm.enable_failures_on(&minode.path, &seq, 0, true).unwrap();

        let mut engine = FsyncEngine::new(FsyncKind::Ext4Data);
        let open_fds: HashMap<u64, HashSet<i32>> = [(1, HashSet::from([5]))].into();
        let mut ctx = FsyncContext {
            block_manager: &mut bm,
            open_fds: &open_fds,
        };

        let first = engine.on_fsync(&mut ctx, 5, 1, &mut minode);
        assert_eq!(first, Ok(()), "the causing call itself reports success");

        dirty_page(&mut minode, crate::PAGE_SIZE as u64, 0xBB);
        let second = engine.on_fsync(&mut ctx, 5, 1, &mut minode);
        assert_eq!(second, Err(Errno::EIO), "the next call on this fd sees it");
    }

    #[test]
    fn ext4_data_notifies_the_next_opener_if_the_failing_fd_closes_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = BlockManager::open(&dir.path().join("blocks.img")).unwrap();
        let mut minode = minode(dir.path(), 1);
        dirty_page(&mut minode, 0, 0xAA);
        let seq = crate::fault::FaultSequence::new("X").unwrap();
        bm.enable_failures_on(&minode.path, &seq, 0, true).unwrap();

        let mut engine = FsyncEngine::new(FsyncKind::Ext4Data);
        let fd5_open: HashMap<u64, HashSet<i32>> = [(1, HashSet::from([5]))].into();
        {
            let mut ctx = FsyncContext {
                block_manager: &mut bm,
                open_fds: &fd5_open,
            };
            let first = engine.on_fsync(&mut ctx, 5, 1, &mut minode);
            assert_eq!(first, Ok(()));
        }

        // fd 5 closes without ever seeing the failure.
        engine.on_close_fd(5, 1);

        // fd 9 opens the same inode and calls fsync with nothing new dirty.
        let fd9_open: HashMap<u64, HashSet<i32>> = [(1, HashSet::from([9]))].into();
        let mut ctx = FsyncContext {
            block_manager: &mut bm,
            open_fds: &fd9_open,
        };
        let result = engine.on_fsync(&mut ctx, 9, 1, &mut minode);
        assert_eq!(result, Err(Errno::EIO), "a never-involved fd inherits it");
    }

    #[test]
    fn btrfs_reverts_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = BlockManager::open(&dir.path().join("blocks.img")).unwrap();
        let mut minode = minode(dir.path(), 1);
        let size_before = minode.size;
        dirty_page(&mut minode, 0, 0xAA);
        let seq = crate::fault::FaultSequence::new("X").unwrap();
        bm.enable_failures_on(&minode.path, &seq, 0, true).unwrap();

        let mut engine = FsyncEngine::new(FsyncKind::Btrfs);
        let open_fds: HashMap<u64, HashSet<i32>> = [(1, HashSet::from([5]))].into();
        let mut ctx = FsyncContext {
            block_manager: &mut bm,
            open_fds: &open_fds,
        };
        let result = engine.on_fsync(&mut ctx, 5, 1, &mut minode);
        assert_eq!(result, Err(Errno::EIO));
        assert_eq!(minode.size, size_before, "in-memory state reverted to disk");
        assert!(
            !minode.offset_to_page.contains_key(&0),
            "the abandoned dirty page is dropped from the cache"
        );
    }

    #[test]
    fn btrfs_commits_all_pages_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = BlockManager::open(&dir.path().join("blocks.img")).unwrap();
        let mut minode = minode(dir.path(), 1);
        dirty_page(&mut minode, 0, 0xAA);

        let mut engine = FsyncEngine::new(FsyncKind::Btrfs);
        let open_fds: HashMap<u64, HashSet<i32>> = [(1, HashSet::from([5]))].into();
        let mut ctx = FsyncContext {
            block_manager: &mut bm,
            open_fds: &open_fds,
        };
        let result = engine.on_fsync(&mut ctx, 5, 1, &mut minode);
        assert_eq!(result, Ok(()));
        assert!(!minode.offset_to_page.get(&0).unwrap().dirty);
    }
}
