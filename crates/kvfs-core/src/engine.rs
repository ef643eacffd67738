//! Engine: [`FsOps`] over any transactional KV store.
//!
//! Each call opens exactly one transaction, builds a [`Namespace`] over it,
//! and commits or discards everything the call did. Conflicts are retried by
//! the store; the namespace code never sees them.

use kvfs_kv::KvStore;
use tracing::{debug, info};

use crate::chunk::ChunkCodec;
use crate::config::EngineConfig;
use crate::error::{FsError, FsResult};
use crate::ids::HandleId;
use crate::namespace::Namespace;
use crate::ops::FsOps;
use crate::types::{DirEntry, NodeAttr, NodeKind, OpenFlags, SetAttr, StatFs, XattrMode};

/// A filesystem backed by the store `S`.
pub struct Engine<S> {
    store: S,
    codec: ChunkCodec,
    config: EngineConfig,
}

impl<S: std::fmt::Debug> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("chunk_size", &self.codec.chunk_size())
            .finish_non_exhaustive()
    }
}

impl<S: KvStore> Engine<S> {
    /// Wrap `store`, creating the root directory if it is missing.
    pub fn new(store: S, config: EngineConfig) -> FsResult<Self> {
        config.validate()?;
        let engine = Self {
            store,
            codec: ChunkCodec::new(config.chunk_size),
            config,
        };
        if engine.run("bootstrap", |ns| ns.bootstrap())? {
            info!("bootstrapped root directory");
        }
        Ok(engine)
    }

    /// Run `op` in one transaction.
    fn run<T>(
        &self,
        name: &'static str,
        mut op: impl FnMut(&mut Namespace<'_>) -> FsResult<T>,
    ) -> FsResult<T> {
        let result = self
            .store
            .transact(|tx| op(&mut Namespace::new(tx, self.codec, &self.config)));
        if let Err(e) = &result {
            debug!(op = name, error = %e, "operation failed");
        }
        result
    }

    /// End offset of the highest stored chunk of `path`.
    ///
    /// Matches `getattr(path).size` unless the file has a sparse tail.
    pub fn chunk_extent(&self, path: &str) -> FsResult<u64> {
        self.run("chunk_extent", |ns| ns.chunk_extent(path))
    }
}

impl<S: KvStore> FsOps for Engine<S> {
    fn getattr(&self, path: &str) -> FsResult<NodeAttr> {
        self.run("getattr", |ns| ns.resolve(path).map(|n| n.attr()))
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        self.run("readdir", |ns| ns.readdir(path))
    }

    fn read(&self, fh: HandleId, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        debug!(fh, offset, size, "read");
        self.run("read", |ns| ns.read(fh, offset, size as usize))
    }

    fn readlink(&self, path: &str) -> FsResult<Vec<u8>> {
        self.run("readlink", |ns| ns.readlink(path))
    }

    fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        self.run("getxattr", |ns| ns.get_xattr(path, name))
    }

    fn listxattr(&self, path: &str) -> FsResult<Vec<String>> {
        self.run("listxattr", |ns| ns.list_xattrs(path))
    }

    fn open(&self, path: &str, flags: OpenFlags) -> FsResult<HandleId> {
        debug!(path, ?flags, "open");
        if flags.create {
            return self.create(path, 0o644, flags);
        }
        self.run("open", |ns| ns.open(path, false, flags))
    }

    fn create(&self, path: &str, mode: u32, flags: OpenFlags) -> FsResult<HandleId> {
        debug!(path, mode, ?flags, "create");
        self.run("create", |ns| ns.create(path, mode, flags))
    }

    fn opendir(&self, path: &str) -> FsResult<HandleId> {
        debug!(path, "opendir");
        self.run("opendir", |ns| ns.open(path, true, OpenFlags::read()))
    }

    fn release(&self, fh: HandleId) -> FsResult<()> {
        debug!(fh, "release");
        self.run("release", |ns| ns.close(fh, false))
    }

    fn releasedir(&self, fh: HandleId) -> FsResult<()> {
        debug!(fh, "releasedir");
        self.run("releasedir", |ns| ns.close(fh, true))
    }

    fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> FsResult<u32> {
        debug!(fh, offset, len = data.len(), "write");
        let len = u32::try_from(data.len())
            .map_err(|_| FsError::invalid("write larger than u32::MAX bytes"))?;
        self.run("write", |ns| ns.write(fh, offset, data))?;
        Ok(len)
    }

    fn mknod(&self, path: &str, mode: u32, rdev: u32) -> FsResult<NodeAttr> {
        debug!(path, mode, rdev, "mknod");
        self.run("mknod", |ns| {
            ns.make(path, NodeKind::RegularFile, mode, rdev, None)
                .map(|n| n.attr())
        })
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<NodeAttr> {
        debug!(path, mode, "mkdir");
        self.run("mkdir", |ns| {
            ns.make(path, NodeKind::Directory, mode, 0, None)
                .map(|n| n.attr())
        })
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        debug!(path, "unlink");
        self.run("unlink", |ns| ns.remove(path, false))
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        debug!(path, "rmdir");
        self.run("rmdir", |ns| ns.remove(path, true))
    }

    fn link(&self, oldpath: &str, newpath: &str) -> FsResult<NodeAttr> {
        debug!(oldpath, newpath, "link");
        self.run("link", |ns| ns.link(oldpath, newpath).map(|n| n.attr()))
    }

    fn symlink(&self, path: &str, target: &[u8]) -> FsResult<NodeAttr> {
        debug!(path, "symlink");
        self.run("symlink", |ns| {
            ns.make(path, NodeKind::Symlink, 0o777, 0, Some(target))
                .map(|n| n.attr())
        })
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        debug!(from, to, "rename");
        self.run("rename", |ns| ns.rename(from, to))
    }

    fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        debug!(path, size, "truncate");
        self.run("truncate", |ns| ns.truncate(path, size))
    }

    fn setattr(&self, path: &str, attr: SetAttr) -> FsResult<NodeAttr> {
        debug!(path, ?attr, "setattr");
        self.run("setattr", |ns| ns.setattr(path, &attr).map(|n| n.attr()))
    }

    fn setxattr(&self, path: &str, name: &str, value: &[u8], mode: XattrMode) -> FsResult<()> {
        debug!(path, name, len = value.len(), ?mode, "setxattr");
        self.run("setxattr", |ns| ns.set_xattr(path, name, value, mode))
    }

    fn removexattr(&self, path: &str, name: &str) -> FsResult<()> {
        debug!(path, name, "removexattr");
        self.run("removexattr", |ns| ns.remove_xattr(path, name))
    }

    fn statfs(&self) -> FsResult<StatFs> {
        Ok(StatFs::from_config(&self.config))
    }
}
