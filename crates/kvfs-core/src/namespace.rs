//! Namespace: path resolution and the operations that keep the tree consistent.
//!
//! A [`Namespace`] lives for exactly one transaction. It resolves paths
//! through directory entries, mutates node records through the
//! [`NodeStore`], and hands content calls to the [`ChunkCodec`] with the
//! resolved node identity.

use std::time::SystemTime;

use tracing::{debug, trace};

use kvfs_kv::Transaction;

use crate::chunk::ChunkCodec;
use crate::config::EngineConfig;
use crate::error::{FsError, FsResult};
use crate::ids::{HandleId, NodeId};
use crate::store::{EntryRecord, HandleRecord, NodeRecord, NodeStore, timestamp_parts};
use crate::types::{DirEntry, NAME_MAX, NodeKind, OpenFlags, SetAttr, XattrMode};

/// Outcome of resolving a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Directory holding the final segment. `None` for the root, or when an
    /// intermediate directory is missing.
    pub parent: Option<NodeId>,
    /// Final segment. Empty for the root and when the loop guard fired.
    pub name: String,
    /// Node the final segment names, if it exists.
    pub node: Option<NodeId>,
}

impl Resolved {
    /// True when descent passed through the guarded ancestor.
    pub fn hit_ancestor(&self) -> bool {
        self.name.is_empty() && self.parent.is_some()
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::invalid(format!("invalid name {name:?}")));
    }
    if name.contains('\0') {
        return Err(FsError::invalid("name contains NUL"));
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong(name.to_string()));
    }
    Ok(())
}

/// Path-based operations inside one transaction.
pub struct Namespace<'t> {
    store: NodeStore<'t>,
    codec: ChunkCodec,
    config: &'t EngineConfig,
    now: SystemTime,
}

impl<'t> Namespace<'t> {
    pub fn new(tx: &'t mut dyn Transaction, codec: ChunkCodec, config: &'t EngineConfig) -> Self {
        Self {
            store: NodeStore::new(tx),
            codec,
            config,
            now: SystemTime::now(),
        }
    }

    /// Create the root directory if the store has none.
    pub fn bootstrap(&mut self) -> FsResult<bool> {
        if self.store.get(NodeId::root())?.is_some() {
            return Ok(false);
        }
        let mut root = NodeRecord::new(
            NodeId::root(),
            NodeKind::Directory,
            0o755,
            self.config.default_uid,
            self.config.default_gid,
            self.now,
        );
        root.link_count = 1;
        self.store.put(&root)?;
        Ok(true)
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Resolve `path` one segment at a time from the root.
    ///
    /// Empty segments are ignored. When `ancestor` is passed through as an
    /// intermediate directory, descent stops and the result carries an empty
    /// name (see [`Resolved::hit_ancestor`]).
    pub fn lookup(&mut self, path: &str, ancestor: Option<NodeId>) -> FsResult<Resolved> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.iter().any(|s| s.len() > NAME_MAX) {
            return Err(FsError::NameTooLong(path.to_string()));
        }
        let Some((last, intermediate)) = segments.split_last() else {
            return Ok(Resolved {
                parent: None,
                name: String::new(),
                node: Some(NodeId::root()),
            });
        };

        let mut dir = NodeId::root();
        for seg in intermediate {
            match self.store.entry(dir, seg)? {
                None => {
                    return Ok(Resolved {
                        parent: None,
                        name: (*last).to_string(),
                        node: None,
                    });
                }
                Some(entry) if !entry.kind.is_dir() => {
                    return Err(FsError::not_a_directory(path));
                }
                Some(entry) if Some(entry.child) == ancestor => {
                    return Ok(Resolved {
                        parent: Some(entry.child),
                        name: String::new(),
                        node: None,
                    });
                }
                Some(entry) => dir = entry.child,
            }
        }

        let node = self.store.entry(dir, last)?.map(|e| e.child);
        trace!(path, ?node, "lookup");
        Ok(Resolved {
            parent: Some(dir),
            name: (*last).to_string(),
            node,
        })
    }

    /// Load the node at `path`, which must exist.
    pub fn resolve(&mut self, path: &str) -> FsResult<NodeRecord> {
        let id = self
            .lookup(path, None)?
            .node
            .ok_or_else(|| FsError::not_found(path))?;
        self.store.load(id)
    }

    // ========================================================================
    // Tree mutation
    // ========================================================================

    /// Create a node of `kind` at `path`.
    ///
    /// Symlinks need a non-empty `target`; other kinds must not have one.
    pub fn make(
        &mut self,
        path: &str,
        kind: NodeKind,
        mode: u32,
        rdev: u32,
        target: Option<&[u8]>,
    ) -> FsResult<NodeRecord> {
        let resolved = self.lookup(path, None)?;
        if resolved.node.is_some() {
            return Err(FsError::already_exists(path));
        }
        let parent_id = resolved.parent.ok_or_else(|| FsError::not_found(path))?;
        validate_name(&resolved.name)?;
        match (kind, target) {
            (NodeKind::Symlink, Some(t)) if !t.is_empty() => {}
            (NodeKind::Symlink, _) => return Err(FsError::invalid("symlink needs a target")),
            (_, Some(_)) => return Err(FsError::invalid("only symlinks have a target")),
            (_, None) => {}
        }

        let mut parent = self.store.load(parent_id)?;
        let mut node = NodeRecord::new(
            NodeId::new(),
            kind,
            mode & 0o7777,
            self.config.default_uid,
            self.config.default_gid,
            self.now,
        );
        node.rdev = rdev;
        if let Some(t) = target {
            node.size = t.len() as u64;
            node.symlink_target = Some(t.to_vec());
        }
        self.store
            .link(&mut parent, &resolved.name, &mut node, self.now)?;
        debug!(path, id = %node.id, %kind, "made node");
        Ok(node)
    }

    /// Remove the entry at `path`.
    pub fn remove(&mut self, path: &str, expect_dir: bool) -> FsResult<()> {
        let resolved = self.lookup(path, None)?;
        let id = resolved.node.ok_or_else(|| FsError::not_found(path))?;
        let parent = resolved
            .parent
            .ok_or_else(|| FsError::invalid("cannot remove the root directory"))?;
        self.remove_entry(path, parent, &resolved.name, id, expect_dir)
    }

    fn remove_entry(
        &mut self,
        path: &str,
        parent_id: NodeId,
        name: &str,
        id: NodeId,
        expect_dir: bool,
    ) -> FsResult<()> {
        let mut node = self.store.load(id)?;
        match (node.kind.is_dir(), expect_dir) {
            (true, false) => return Err(FsError::is_a_directory(path)),
            (false, true) => return Err(FsError::not_a_directory(path)),
            _ => {}
        }
        if node.kind.is_dir() && self.store.has_entries(id)? {
            return Err(FsError::directory_not_empty(path));
        }
        let mut parent = self.store.load(parent_id)?;
        self.store.unlink(&mut parent, name, &mut node, self.now)?;
        debug!(path, %id, nlink = node.link_count, "removed entry");
        self.reclaim_if_orphaned(&node)?;
        Ok(())
    }

    /// Add `new_path` as another name for the node at `old_path`.
    pub fn link(&mut self, old_path: &str, new_path: &str) -> FsResult<NodeRecord> {
        let mut node = self.resolve(old_path)?;
        if node.kind.is_dir() {
            return Err(FsError::is_a_directory(old_path));
        }
        let resolved = self.lookup(new_path, None)?;
        if resolved.node.is_some() {
            return Err(FsError::already_exists(new_path));
        }
        let parent_id = resolved.parent.ok_or_else(|| FsError::not_found(new_path))?;
        validate_name(&resolved.name)?;

        let mut parent = self.store.load(parent_id)?;
        self.store
            .link(&mut parent, &resolved.name, &mut node, self.now)?;
        debug!(old_path, new_path, nlink = node.link_count, "linked");
        Ok(node)
    }

    /// Move the entry at `old_path` to `new_path`, replacing what is there.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> FsResult<()> {
        let src = self.lookup(old_path, None)?;
        let src_id = src.node.ok_or_else(|| FsError::not_found(old_path))?;
        let src_parent = src
            .parent
            .ok_or_else(|| FsError::invalid("cannot rename the root directory"))?;

        let dst = self.lookup(new_path, Some(src_id))?;
        if dst.hit_ancestor() {
            return Err(FsError::invalid(format!(
                "cannot move {old_path} into its own subtree {new_path}"
            )));
        }
        let dst_parent = dst.parent.ok_or_else(|| FsError::not_found(new_path))?;
        validate_name(&dst.name)?;
        if src_parent == dst_parent && src.name == dst.name {
            return Ok(());
        }

        let mut node = self.store.load(src_id)?;
        if let Some(existing) = dst.node {
            if existing == src_id {
                return Ok(());
            }
            self.remove_entry(new_path, dst_parent, &dst.name, existing, node.kind.is_dir())?;
        }

        let entry = EntryRecord {
            child: src_id,
            kind: node.kind,
        };
        self.store
            .move_entry((src_parent, &src.name), (dst_parent, &dst.name), entry)?;
        for dir in [src_parent, dst_parent] {
            let mut parent = self.store.load(dir)?;
            parent.touch_modified(self.now);
            self.store.put(&parent)?;
            if src_parent == dst_parent {
                break;
            }
        }
        node.changed_at = self.now;
        self.store.put(&node)?;
        debug!(old_path, new_path, id = %src_id, "renamed");
        Ok(())
    }

    /// Physically delete a node nothing refers to any more.
    fn reclaim_if_orphaned(&mut self, node: &NodeRecord) -> FsResult<bool> {
        if !node.is_orphaned() || node.id.is_root() {
            return Ok(false);
        }
        self.codec.clear_all(self.store.tx(), node.id)?;
        self.store.delete(node.id)?;
        debug!(id = %node.id, "reclaimed node");
        Ok(true)
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Open the node at `path` and register a handle for it.
    pub fn open(&mut self, path: &str, want_dir: bool, flags: OpenFlags) -> FsResult<HandleId> {
        let mut node = self.resolve(path)?;
        match node.kind {
            NodeKind::Directory if !want_dir => return Err(FsError::is_a_directory(path)),
            NodeKind::RegularFile if want_dir => return Err(FsError::not_a_directory(path)),
            NodeKind::Symlink if want_dir => return Err(FsError::not_a_directory(path)),
            NodeKind::Symlink => return Err(FsError::invalid(format!("cannot open symlink {path}"))),
            _ => {}
        }
        if !want_dir && flags.write && flags.truncate && node.size > 0 {
            self.codec.clear_all(self.store.tx(), node.id)?;
            node.size = 0;
            node.touch_modified(self.now);
        }
        self.open_node(node, !want_dir && flags.write, !want_dir && flags.append, flags.read || want_dir)
    }

    /// Open `path` for writing, making a regular file there first if needed.
    pub fn create(&mut self, path: &str, mode: u32, flags: OpenFlags) -> FsResult<HandleId> {
        let resolved = self.lookup(path, None)?;
        if resolved.node.is_some() {
            if flags.exclusive {
                return Err(FsError::already_exists(path));
            }
            return self.open(path, false, flags);
        }
        let node = self.make(path, NodeKind::RegularFile, mode, 0, None)?;
        self.open_node(node, true, flags.append, flags.read)
    }

    fn open_node(
        &mut self,
        mut node: NodeRecord,
        writable: bool,
        append: bool,
        readable: bool,
    ) -> FsResult<HandleId> {
        node.open_count = node
            .open_count
            .checked_add(1)
            .ok_or_else(|| FsError::no_space(format!("open count of {}", node.id)))?;
        let handle = self.store.allocate_handle()?;
        self.store.put_handle(
            handle,
            &HandleRecord {
                node: node.id,
                kind: node.kind,
                readable,
                writable,
                append,
            },
        )?;
        self.store.put(&node)?;
        debug!(handle, id = %node.id, open_count = node.open_count, "opened");
        Ok(handle)
    }

    /// Release a handle; the last release of an unlinked node deletes it.
    pub fn close(&mut self, handle: HandleId, want_dir: bool) -> FsResult<()> {
        let record = self.handle(handle)?;
        match (record.kind.is_dir(), want_dir) {
            (true, false) => return Err(FsError::is_a_directory(format!("handle {handle}"))),
            (false, true) => return Err(FsError::not_a_directory(format!("handle {handle}"))),
            _ => {}
        }
        self.store.remove_handle(handle)?;
        let mut node = self.store.load(record.node)?;
        node.open_count = node.open_count.saturating_sub(1);
        self.store.put(&node)?;
        debug!(handle, id = %node.id, open_count = node.open_count, "released");
        self.reclaim_if_orphaned(&node)?;
        Ok(())
    }

    fn handle(&mut self, handle: HandleId) -> FsResult<HandleRecord> {
        self.store
            .handle(handle)?
            .ok_or_else(|| FsError::invalid(format!("unknown handle {handle}")))
    }

    // ========================================================================
    // Content
    // ========================================================================

    /// Read up to `len` bytes at `offset` through an open handle.
    ///
    /// Short at end of file, empty at or past it.
    pub fn read(&mut self, handle: HandleId, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let record = self.handle(handle)?;
        if record.kind.is_dir() {
            return Err(FsError::is_a_directory(format!("handle {handle}")));
        }
        if !record.readable {
            return Err(FsError::invalid(format!("handle {handle} not open for reading")));
        }
        let node = self.store.load(record.node)?;
        let avail = node.size.saturating_sub(offset);
        let mut buf = vec![0u8; (len as u64).min(avail) as usize];
        let n = match self
            .codec
            .read_at(self.store.tx(), node.id, node.size, offset, &mut buf)
        {
            Ok(n) => n,
            Err(FsError::EndOfData { read }) => read,
            Err(e) => return Err(e),
        };
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data` through an open handle; append handles ignore `offset`.
    pub fn write(&mut self, handle: HandleId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let record = self.handle(handle)?;
        if record.kind.is_dir() {
            return Err(FsError::is_a_directory(format!("handle {handle}")));
        }
        if !record.writable {
            return Err(FsError::invalid(format!("handle {handle} not open for writing")));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let mut node = self.store.load(record.node)?;
        let offset = if record.append { node.size } else { offset };
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.config.max_file_size)
            .ok_or_else(|| FsError::no_space(format!("write past maximum file size on {}", node.id)))?;

        // Grow first; the codec never owns size.
        node.size = node.size.max(end);
        node.touch_modified(self.now);
        self.store.put(&node)?;
        self.codec.write_at(self.store.tx(), node.id, offset, data)
    }

    /// Set the logical size of the file at `path`.
    pub fn truncate(&mut self, path: &str, size: u64) -> FsResult<()> {
        let mut node = self.resolve(path)?;
        self.resize(path, &mut node, size)
    }

    fn resize(&mut self, path: &str, node: &mut NodeRecord, size: u64) -> FsResult<()> {
        match node.kind {
            NodeKind::Directory => return Err(FsError::is_a_directory(path)),
            NodeKind::Symlink => return Err(FsError::invalid(format!("cannot resize symlink {path}"))),
            NodeKind::RegularFile => {}
        }
        if size > self.config.max_file_size {
            return Err(FsError::no_space(format!("{path} beyond maximum file size")));
        }
        if size < node.size {
            self.codec.truncate(self.store.tx(), node.id, size)?;
        }
        node.size = size;
        node.touch_modified(self.now);
        self.store.put(node)
    }

    /// End offset of the highest stored chunk of `path`.
    pub fn chunk_extent(&mut self, path: &str) -> FsResult<u64> {
        let node = self.resolve(path)?;
        self.codec.size_of(self.store.tx(), node.id)
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Apply `attr` to the node at `path`.
    pub fn setattr(&mut self, path: &str, attr: &SetAttr) -> FsResult<NodeRecord> {
        let mut node = self.resolve(path)?;
        if attr.is_empty() {
            return Ok(node);
        }
        for time in [attr.atime, attr.mtime].into_iter().flatten() {
            if timestamp_parts(time).is_none() {
                return Err(FsError::invalid(format!("timestamp out of range for {path}")));
            }
        }
        if let Some(size) = attr.size {
            self.resize(path, &mut node, size)?;
        }
        if let Some(mode) = attr.mode {
            node.mode = mode & 0o7777;
        }
        if let Some(uid) = attr.uid {
            node.uid = uid;
        }
        if let Some(gid) = attr.gid {
            node.gid = gid;
        }
        if let Some(flags) = attr.flags {
            node.flags = flags;
        }
        if let Some(atime) = attr.atime {
            node.accessed_at = atime;
        }
        if let Some(mtime) = attr.mtime {
            node.modified_at = mtime;
        }
        node.changed_at = self.now;
        self.store.put(&node)?;
        Ok(node)
    }

    /// Entries of the directory at `path`, sorted by name.
    pub fn readdir(&mut self, path: &str) -> FsResult<Vec<DirEntry>> {
        let dir = self.resolve(path)?;
        if !dir.kind.is_dir() {
            return Err(FsError::not_a_directory(path));
        }
        Ok(self
            .store
            .entries(dir.id)?
            .into_iter()
            .map(|(name, entry)| DirEntry {
                name,
                kind: entry.kind,
                node: entry.child,
            })
            .collect())
    }

    pub fn readlink(&mut self, path: &str) -> FsResult<Vec<u8>> {
        let node = self.resolve(path)?;
        if !node.kind.is_symlink() {
            return Err(FsError::invalid(format!("not a symbolic link: {path}")));
        }
        node.symlink_target
            .ok_or_else(|| FsError::corrupt(format!("symlink {} has no target", node.id)))
    }

    // ========================================================================
    // Extended attributes
    // ========================================================================

    fn check_xattr_name(&self, name: &str) -> FsResult<()> {
        if name.is_empty() {
            return Err(FsError::invalid("empty attribute name"));
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        if self.config.is_reserved_xattr(name) {
            return Err(FsError::NotSupported(name.to_string()));
        }
        Ok(())
    }

    pub fn get_xattr(&mut self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        self.check_xattr_name(name)?;
        let node = self.resolve(path)?;
        self.store
            .xattr(node.id, name)?
            .ok_or_else(|| FsError::attr_not_found(name))
    }

    pub fn set_xattr(
        &mut self,
        path: &str,
        name: &str,
        value: &[u8],
        mode: XattrMode,
    ) -> FsResult<()> {
        self.check_xattr_name(name)?;
        let mut node = self.resolve(path)?;
        let exists = self.store.xattr(node.id, name)?.is_some();
        match mode {
            XattrMode::CreateOnly if exists => return Err(FsError::already_exists(name)),
            XattrMode::ReplaceOnly if !exists => return Err(FsError::attr_not_found(name)),
            _ => {}
        }
        self.store.set_xattr(node.id, name, value)?;
        node.changed_at = self.now;
        self.store.put(&node)
    }

    pub fn remove_xattr(&mut self, path: &str, name: &str) -> FsResult<()> {
        self.check_xattr_name(name)?;
        let mut node = self.resolve(path)?;
        if self.store.xattr(node.id, name)?.is_none() {
            return Err(FsError::attr_not_found(name));
        }
        self.store.remove_xattr(node.id, name)?;
        node.changed_at = self.now;
        self.store.put(&node)
    }

    pub fn list_xattrs(&mut self, path: &str) -> FsResult<Vec<String>> {
        let node = self.resolve(path)?;
        self.store.xattr_names(node.id)
    }
}
