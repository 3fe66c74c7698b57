//! Classic-API FUSE binding: translates kernel VFS requests into calls
//! against [`cuttlefs::Facade`].
//!
//! Directory structure, permissions, links and extended attributes are
//! explicitly out of scope for the Facade and are served here by
//! passthrough against the real, mirrored root directory instead.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cuttlefs::{Attr, Errno, Facade};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

fn errno_to_raw(e: Errno) -> i32 {
    -e.code()
}

fn system_time_to_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn now_secs() -> f64 {
    system_time_to_secs(SystemTime::now())
}

fn time_or_now_secs(t: TimeOrNow) -> f64 {
    match t {
        TimeOrNow::SpecificTime(st) => system_time_to_secs(st),
        TimeOrNow::Now => now_secs(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_system_time(secs: f64) -> SystemTime {
    if secs > 0.0 {
        UNIX_EPOCH + Duration::from_secs_f64(secs)
    } else {
        UNIX_EPOCH
    }
}

fn file_attr(attr: &Attr) -> FileAttr {
    let kind = if attr.is_dir {
        FileType::Directory
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: to_system_time(attr.atime),
        mtime: to_system_time(attr.mtime),
        ctime: to_system_time(attr.mtime),
        crtime: UNIX_EPOCH,
        kind,
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: cuttlefs::PAGE_SIZE as u32,
        flags: 0,
    }
}

/// Binds a [`Facade`] to the kernel FUSE protocol.
///
/// Keeps its own `ino -> logical path` table, populated lazily as the
/// kernel looks entries up; the Facade itself is path-addressed (except
/// for fd-keyed `read`/`write`/`fsync`/`release`), so every handler here
/// resolves `ino` to a path before delegating.
pub struct CuttleFuse {
    facade: Arc<Mutex<Facade>>,
    root: PathBuf,
    paths: HashMap<u64, String>,
}

impl CuttleFuse {
    /// Builds an adapter over `facade`, mirroring the real directory tree
    /// rooted at `root` for passthrough directory operations.
    #[must_use]
    pub fn new(facade: Arc<Mutex<Facade>>, root: PathBuf) -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_INO, String::new());
        Self {
            facade,
            root,
            paths,
        }
    }

    fn host_path(&self, logical: &str) -> PathBuf {
        self.root.join(logical.trim_start_matches('/'))
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn child_path(parent: &str, name: &OsStr) -> String {
        let name = name.to_string_lossy();
        if parent.is_empty() {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        }
    }
}

impl Filesystem for CuttleFuse {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        log::info!("mounted at {}", self.root.display());
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(errno) = self.facade.lock().unwrap().sync() {
            log::warn!("checkpoint-and-sync on unmount failed: {errno:?}");
        }
        log::info!("unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = Self::child_path(&parent_path, name);
        match self.facade.lock().unwrap().getattr(&child) {
            Ok(attr) => {
                self.paths.insert(attr.ino, child);
                reply.entry(&TTL, &file_attr(&attr), 0);
            }
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.facade.lock().unwrap().getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &file_attr(&attr)),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut facade = self.facade.lock().unwrap();

        if let Some(len) = size {
            if let Err(e) = facade.truncate(&path, len) {
                reply.error(errno_to_raw(e));
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            let current = match facade.getattr(&path) {
                Ok(attr) => attr,
                Err(e) => {
                    reply.error(errno_to_raw(e));
                    return;
                }
            };
            let a = atime.map_or(current.atime, time_or_now_secs);
            let m = mtime.map_or(current.mtime, time_or_now_secs);
            if let Err(e) = facade.utimens(&path, a, m) {
                reply.error(errno_to_raw(e));
                return;
            }
        }

        match facade.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &file_attr(&attr)),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.facade.lock().unwrap().open(&path, flags) {
            Ok(fd) => reply.opened(fd as u64, 0),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = Self::child_path(&parent_path, name);
        let mut facade = self.facade.lock().unwrap();
        let fd = match facade.create(&child, mode, flags) {
            Ok(fd) => fd,
            Err(e) => {
                reply.error(errno_to_raw(e));
                return;
            }
        };
        match facade.getattr(&child) {
            Ok(attr) => {
                self.paths.insert(attr.ino, child);
                reply.created(&TTL, &file_attr(&attr), 0, fd as u64, 0);
            }
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = offset.max(0) as u64;
        match self.facade.lock().unwrap().read(fh as i32, size as usize, offset) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = offset.max(0) as u64;
        match self.facade.lock().unwrap().write(fh as i32, data, offset) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.facade.lock().unwrap().flush(fh as i32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.facade.lock().unwrap().fsync(fh as i32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.facade.lock().unwrap().release(fh as i32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = Self::child_path(&parent_path, name);
        match self.facade.lock().unwrap().unlink(&child) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old_parent), Some(new_parent)) =
            (self.path_of(parent), self.path_of(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let old = Self::child_path(&old_parent, name);
        let new = Self::child_path(&new_parent, newname);
        match self.facade.lock().unwrap().rename(&old, &new) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = Self::child_path(&parent_path, name);
        let host = self.host_path(&child);
        if let Err(e) = std::fs::create_dir(&host) {
            reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let _ = std::fs::set_permissions(&host, std::fs::Permissions::from_mode(mode));
        match self.facade.lock().unwrap().getattr(&child) {
            Ok(attr) => {
                self.paths.insert(attr.ino, child);
                reply.entry(&TTL, &file_attr(&attr), 0);
            }
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = Self::child_path(&parent_path, name);
        let host = self.host_path(&child);
        match std::fs::remove_dir(&host) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let host = self.host_path(&path);

        let listing: std::io::Result<Vec<(u64, FileType, String)>> = (|| {
            let mut out = vec![
                (ino, FileType::Directory, ".".to_string()),
                (ino, FileType::Directory, "..".to_string()),
            ];
            for entry in std::fs::read_dir(&host)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                let kind = if meta.is_dir() {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                out.push((meta.ino(), kind, entry.file_name().to_string_lossy().into_owned()));
            }
            Ok(out)
        })();

        match listing {
            Ok(entries) => {
                for (idx, (e_ino, kind, name)) in entries
                    .into_iter()
                    .enumerate()
                    .skip(usize::try_from(offset.max(0)).unwrap_or(0))
                {
                    if reply.add(e_ino, (idx + 1) as i64, kind, &name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.facade.lock().unwrap().statfs() {
            Ok(s) => {
                let bsize = u32::try_from(s.bsize).unwrap_or(u32::MAX);
                let namelen = u32::try_from(s.namelen).unwrap_or(u32::MAX);
                reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, bsize, namelen, bsize);
            }
            Err(e) => reply.error(errno_to_raw(e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }
}
