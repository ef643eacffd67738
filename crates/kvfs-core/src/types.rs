//! Core filesystem types.
//!
//! These are what the engine hands to a host adapter: path-based, with node
//! identity exposed for adapters that keep their own inode tables.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::config::EngineConfig;
use crate::ids::NodeId;

/// Longest permitted path segment or attribute name, in bytes.
pub const NAME_MAX: usize = 255;

/// Node kind. Fixed when the node is made.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    /// Regular file.
    RegularFile,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl NodeKind {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::RegularFile)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, NodeKind::Symlink)
    }
}

/// Node attributes (metadata), as returned by `getattr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Node identity.
    pub id: NodeId,
    /// Node kind.
    pub kind: NodeKind,
    /// Permission bits (e.g., 0o644).
    pub mode: u32,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Opaque BSD-style flags.
    pub flags: u32,
    /// Device number for special files.
    pub rdev: u32,
    /// Number of directory entries referencing this node.
    pub nlink: u32,
    /// Logical size in bytes.
    pub size: u64,
    /// Last access time.
    pub atime: SystemTime,
    /// Last content modification time.
    pub mtime: SystemTime,
    /// Last metadata change time.
    pub ctime: SystemTime,
    /// Creation time.
    pub crtime: SystemTime,
    /// Number of live open handles.
    pub open_count: u32,
}

impl NodeAttr {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Kind of the node the entry points at.
    pub kind: NodeKind,
    /// The node the entry points at.
    pub node: NodeId,
}

/// Attributes to set (for setattr operation).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetAttr {
    /// New size (truncate/extend).
    pub size: Option<u64>,
    /// New permission bits.
    pub mode: Option<u32>,
    /// New user ID.
    pub uid: Option<u32>,
    /// New group ID.
    pub gid: Option<u32>,
    /// New BSD-style file flags.
    pub flags: Option<u32>,
    /// New access time.
    pub atime: Option<SystemTime>,
    /// New modification time.
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    /// Create a new empty SetAttr.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set permission bits.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the owner.
    pub fn with_owner(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Set file flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Set access and modification times.
    pub fn with_times(mut self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self
    }

    /// Returns true if nothing would change.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Available blocks (to non-root).
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Maximum name length.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

impl StatFs {
    /// Figures reported for a given engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        let bsize = u32::try_from(config.chunk_size).unwrap_or(u32::MAX);
        Self {
            blocks: config.statfs.blocks,
            bfree: config.statfs.bfree,
            bavail: config.statfs.bavail,
            files: config.statfs.files,
            ffree: config.statfs.ffree,
            bsize,
            namelen: NAME_MAX as u32,
            frsize: bsize,
        }
    }
}

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode: every write lands at the current size.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    /// Append-only writes.
    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::create()
        }
    }

    /// Create and truncate.
    pub fn create_truncate() -> Self {
        Self {
            truncate: true,
            ..Self::create()
        }
    }
}

/// How `setxattr` treats an existing value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum XattrMode {
    /// Create or replace.
    #[default]
    Upsert,
    /// Fail with `AlreadyExists` if the attribute is present.
    CreateOnly,
    /// Fail with `AttrNotFound` if the attribute is absent.
    ReplaceOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind() {
        assert!(NodeKind::RegularFile.is_file());
        assert!(!NodeKind::RegularFile.is_dir());
        assert!(NodeKind::Directory.is_dir());
        assert!(NodeKind::Symlink.is_symlink());
        assert_eq!(NodeKind::RegularFile.to_string(), "regular_file");
        assert_eq!("directory".parse::<NodeKind>().unwrap(), NodeKind::Directory);
    }

    #[test]
    fn test_setattr_builder() {
        assert!(SetAttr::new().is_empty());
        let attr = SetAttr::new().with_size(2048).with_mode(0o600);
        assert_eq!(attr.size, Some(2048));
        assert_eq!(attr.mode, Some(0o600));
        assert!(attr.mtime.is_none());
        assert!(!attr.is_empty());
    }

    #[test]
    fn test_open_flags() {
        let read = OpenFlags::read();
        assert!(read.read);
        assert!(!read.write);

        let create = OpenFlags::create_exclusive();
        assert!(create.create);
        assert!(create.exclusive);
        assert!(create.write);
        assert!(create.read);

        let append = OpenFlags::append();
        assert!(append.append && append.write && !append.create);
    }

    #[test]
    fn test_statfs_follows_config() {
        let config = EngineConfig {
            chunk_size: 4096,
            ..Default::default()
        };
        let st = StatFs::from_config(&config);
        assert_eq!(st.bsize, 4096);
        assert_eq!(st.frsize, 4096);
        assert_eq!(st.namelen, 255);
        assert_eq!(st.blocks, config.statfs.blocks);
    }
}
