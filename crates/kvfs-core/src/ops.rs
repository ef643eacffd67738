//! Filesystem operations trait.
//!
//! One method per operation a host adapter (FUSE bridge, RPC shim, CLI)
//! forwards. Paths are absolute within the filesystem; content calls go
//! through handles from `open`/`create`, which the adapter must release.

use std::time::SystemTime;

use crate::error::FsResult;
use crate::ids::HandleId;
use crate::types::{DirEntry, NodeAttr, OpenFlags, SetAttr, StatFs, XattrMode};

/// Core filesystem operations.
///
/// Every call either takes full effect or none at all.
pub trait FsOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// Get node attributes.
    fn getattr(&self, path: &str) -> FsResult<NodeAttr>;

    /// Read directory entries, sorted by name.
    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    /// Read up to `size` bytes at `offset` through an open handle.
    ///
    /// Returns fewer bytes at end of file.
    fn read(&self, fh: HandleId, offset: u64, size: u32) -> FsResult<Vec<u8>>;

    /// Read symbolic link target.
    fn readlink(&self, path: &str) -> FsResult<Vec<u8>>;

    /// Get an extended attribute.
    fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>>;

    /// List extended attribute names.
    fn listxattr(&self, path: &str) -> FsResult<Vec<String>>;

    // ========================================================================
    // Handles
    // ========================================================================

    /// Open a file. With `flags.create` this behaves like `create` with mode 0o644.
    fn open(&self, path: &str, flags: OpenFlags) -> FsResult<HandleId>;

    /// Open a file for writing, making it first if absent.
    fn create(&self, path: &str, mode: u32, flags: OpenFlags) -> FsResult<HandleId>;

    /// Open a directory.
    fn opendir(&self, path: &str) -> FsResult<HandleId>;

    /// Release a file handle.
    fn release(&self, fh: HandleId) -> FsResult<()>;

    /// Release a directory handle.
    fn releasedir(&self, fh: HandleId) -> FsResult<()>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write `data` at `offset` through an open handle.
    ///
    /// Returns the number of bytes written.
    fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> FsResult<u32>;

    /// Create a regular file (or device node, via `rdev`).
    fn mknod(&self, path: &str, mode: u32, rdev: u32) -> FsResult<NodeAttr>;

    /// Create a new directory.
    fn mkdir(&self, path: &str, mode: u32) -> FsResult<NodeAttr>;

    /// Remove a file.
    fn unlink(&self, path: &str) -> FsResult<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &str) -> FsResult<()>;

    /// Create a hard link at `newpath` to the node at `oldpath`.
    fn link(&self, oldpath: &str, newpath: &str) -> FsResult<NodeAttr>;

    /// Create a symlink at `path` pointing to `target`.
    fn symlink(&self, path: &str, target: &[u8]) -> FsResult<NodeAttr>;

    /// Rename a file or directory, replacing any compatible target.
    fn rename(&self, from: &str, to: &str) -> FsResult<()>;

    /// Truncate or extend a file.
    fn truncate(&self, path: &str, size: u64) -> FsResult<()>;

    /// Set node attributes.
    fn setattr(&self, path: &str, attr: SetAttr) -> FsResult<NodeAttr>;

    /// Set or replace an extended attribute.
    fn setxattr(&self, path: &str, name: &str, value: &[u8], mode: XattrMode) -> FsResult<()>;

    /// Remove an extended attribute.
    fn removexattr(&self, path: &str, name: &str) -> FsResult<()>;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Get filesystem statistics.
    fn statfs(&self) -> FsResult<StatFs>;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Change permission bits.
    fn chmod(&self, path: &str, mode: u32) -> FsResult<NodeAttr> {
        self.setattr(path, SetAttr::new().with_mode(mode))
    }

    /// Change owner and/or group.
    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<NodeAttr> {
        self.setattr(path, SetAttr::new().with_owner(uid, gid))
    }

    /// Change access and/or modification time.
    fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<NodeAttr> {
        self.setattr(path, SetAttr::new().with_times(atime, mtime))
    }

    /// Check if a path exists.
    fn exists(&self, path: &str) -> bool {
        self.getattr(path).is_ok()
    }

    /// Read entire file contents.
    fn read_all(&self, path: &str) -> FsResult<Vec<u8>> {
        let fh = self.open(path, OpenFlags::read())?;
        let mut out = Vec::new();
        let result = loop {
            match self.read(fh, out.len() as u64, u32::MAX) {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        self.release(fh)?;
        result.map(|()| out)
    }

    /// Write entire file contents, creating or truncating as needed.
    fn write_all(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let fh = self.create(path, 0o644, OpenFlags::create_truncate())?;
        let result = self.write(fh, 0, data);
        self.release(fh)?;
        result.map(|_| ())
    }
}
