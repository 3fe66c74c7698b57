//! Error types for cuttlefs operations.

/// Alias for `Result<T, cuttlefs::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while setting up or administering a [`crate::Facade`].
///
/// These cover configuration and initialization failures. Day-to-day
/// filesystem operations (`read`, `write`, `fsync`, ...) report failure
/// through [`Errno`] instead, since their failure modes are POSIX errno
/// values observable by a FUSE caller, not exceptional setup conditions.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error from the backing file, a metadata file, or the fault
    /// list.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A metadata or fault-list JSON document was malformed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A Fault Sequence string did not match the `{x,w,X,W}+` grammar.
    #[error("invalid fault sequence {seq:?}: {reason}")]
    InvalidFaultSequence {
        /// The offending sequence string.
        seq: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A fault-list entry set both, or neither, of `block`/`sector`.
    #[error("invalid fault spec for {path:?}: {reason}")]
    InvalidFaultSpec {
        /// The path the entry referred to.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A fault sequence was installed twice on the same (path, offset) pair.
    #[error("fault sequence already installed for {path:?} at offset {offset}")]
    DuplicateFaultOffset {
        /// Logical path the offset belongs to.
        path: String,
        /// Byte offset within the file.
        offset: u64,
    },

    /// An unrecognized `--fsync-behavior` value.
    #[error("unsupported fsync policy {0:?}")]
    UnsupportedFsyncPolicy(String),
}

/// A negative POSIX errno value, returned by every [`crate::Facade`]
/// operation that is visible to a FUSE caller.
///
/// `Ok(_)` corresponds to the original implementation's `0`/success return;
/// `Err(Errno(_))` corresponds to a negative errno return. Representing this
/// as `Result<T, Errno>` instead of a raw sentinel integer keeps the
/// POSIX-facing surface in a shape `?` composes with, while keeping the
/// on-the-wire meaning identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// I/O error (simulated disk fault, or an unexpected host I/O failure).
    pub const EIO: Self = Self(-libc::EIO);
    /// No such file or directory.
    pub const ENOENT: Self = Self(-libc::ENOENT);
    /// Bad file descriptor.
    pub const EBADF: Self = Self(-libc::EBADF);
    /// Operation not supported.
    pub const ENOTSUP: Self = Self(-libc::ENOTSUP);
    /// File exists.
    pub const EEXIST: Self = Self(-libc::EEXIST);
    /// Invalid argument.
    pub const EINVAL: Self = Self(-libc::EINVAL);

    /// Returns the raw negative errno value.
    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }
}

/// Converts an unexpected (non-simulated) I/O failure into `EIO`.
///
/// Every faulty-disk condition the Fsync Policy Engine cares about is
/// modeled explicitly by [`crate::BlockManager::bwrite`] returning
/// `Ok(false)`; an `Err` at this layer means the host filesystem itself
/// misbehaved (out of space, permission revoked mid-flight, ...), which
/// CuttleFS reports the same way a real disk controller would: `EIO`.
pub(crate) fn io_to_errno(err: Error) -> Errno {
    log::error!("unexpected I/O failure: {err}");
    Errno::EIO
}
