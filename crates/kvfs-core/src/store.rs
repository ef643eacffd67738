//! Node store: records, directory entries, extended attributes and handles.
//!
//! Pure bookkeeping over one live transaction. Nothing here knows about
//! chunks; content lives behind [`crate::chunk::ChunkCodec`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use kvfs_kv::Transaction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::ids::{HandleId, NodeId};
use crate::keys;
use crate::types::{NodeAttr, NodeKind};

/// Persisted node metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub rdev: u32,
    pub link_count: u32,
    pub open_count: u32,
    /// Authoritative logical content length.
    pub size: u64,
    #[serde(with = "timestamp")]
    pub accessed_at: SystemTime,
    #[serde(with = "timestamp")]
    pub modified_at: SystemTime,
    #[serde(with = "timestamp")]
    pub changed_at: SystemTime,
    #[serde(with = "timestamp")]
    pub created_at: SystemTime,
    /// Present only for symlinks.
    pub symlink_target: Option<Vec<u8>>,
}

impl NodeRecord {
    /// A fresh, unlinked node.
    pub fn new(id: NodeId, kind: NodeKind, mode: u32, uid: u32, gid: u32, now: SystemTime) -> Self {
        Self {
            id,
            kind,
            mode,
            uid,
            gid,
            flags: 0,
            rdev: 0,
            link_count: 0,
            open_count: 0,
            size: 0,
            accessed_at: now,
            modified_at: now,
            changed_at: now,
            created_at: now,
            symlink_target: None,
        }
    }

    /// Record a content change.
    pub fn touch_modified(&mut self, now: SystemTime) {
        self.modified_at = now;
        self.changed_at = now;
    }

    /// Returns true once nothing references the node.
    pub fn is_orphaned(&self) -> bool {
        self.link_count == 0 && self.open_count == 0
    }

    /// Attributes as reported to callers.
    pub fn attr(&self) -> NodeAttr {
        NodeAttr {
            id: self.id,
            kind: self.kind,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            flags: self.flags,
            rdev: self.rdev,
            nlink: self.link_count,
            size: self.size,
            atime: self.accessed_at,
            mtime: self.modified_at,
            ctime: self.changed_at,
            crtime: self.created_at,
            open_count: self.open_count,
        }
    }
}

/// Value of a directory entry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub child: NodeId,
    pub kind: NodeKind,
}

/// Value of an open handle key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub node: NodeId,
    pub kind: NodeKind,
    pub readable: bool,
    pub writable: bool,
    pub append: bool,
}

/// Signed seconds and nanoseconds relative to the Unix epoch.
///
/// Nanoseconds are always in `0..1_000_000_000`, so one second before the
/// epoch is `(-1, 0)` and half a second before it is `(-1, 500_000_000)`.
pub(crate) fn timestamp_parts(time: SystemTime) -> Option<(i64, u32)> {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => Some((i64::try_from(after.as_secs()).ok()?, after.subsec_nanos())),
        Err(e) => {
            let before = e.duration();
            let secs = i64::try_from(before.as_secs()).ok()?;
            match before.subsec_nanos() {
                0 => Some((-secs, 0)),
                nanos => Some((secs.checked_neg()?.checked_sub(1)?, 1_000_000_000 - nanos)),
            }
        }
    }
}

fn timestamp_from_parts(secs: i64, nanos: u32) -> Option<SystemTime> {
    if nanos >= 1_000_000_000 {
        return None;
    }
    let whole = if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_secs(secs.unsigned_abs()))?
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))?
    };
    whole.checked_add(Duration::from_nanos(u64::from(nanos)))
}

mod timestamp {
    use std::time::SystemTime;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de, ser};

    pub fn serialize<S: Serializer>(time: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        super::timestamp_parts(*time)
            .ok_or_else(|| <S::Error as ser::Error>::custom("timestamp out of range"))?
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let (secs, nanos) = <(i64, u32)>::deserialize(d)?;
        super::timestamp_from_parts(secs, nanos)
            .ok_or_else(|| <D::Error as de::Error>::custom("timestamp out of range"))
    }
}

fn encode<T: Serialize>(value: &T) -> FsResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| FsError::corrupt(format!("encode: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> FsResult<T> {
    postcard::from_bytes(bytes).map_err(|e| FsError::corrupt(format!("{what}: {e}")))
}

/// Typed access to node state inside one transaction.
pub struct NodeStore<'t> {
    tx: &'t mut dyn Transaction,
}

impl<'t> NodeStore<'t> {
    pub fn new(tx: &'t mut dyn Transaction) -> Self {
        Self { tx }
    }

    /// The underlying transaction, for content operations.
    pub fn tx(&mut self) -> &mut dyn Transaction {
        &mut *self.tx
    }

    // ========================================================================
    // Records
    // ========================================================================

    pub fn get(&mut self, id: NodeId) -> FsResult<Option<NodeRecord>> {
        match self.tx.get(&keys::node_key(id))? {
            Some(bytes) => decode(&bytes, "node record").map(Some),
            None => Ok(None),
        }
    }

    /// Load a record that must exist.
    pub fn load(&mut self, id: NodeId) -> FsResult<NodeRecord> {
        self.get(id)?
            .ok_or_else(|| FsError::not_found(format!("node {id}")))
    }

    pub fn put(&mut self, record: &NodeRecord) -> FsResult<()> {
        self.tx.set(&keys::node_key(record.id), &encode(record)?)?;
        Ok(())
    }

    /// Delete a record with its entries and extended attributes.
    pub fn delete(&mut self, id: NodeId) -> FsResult<()> {
        self.tx.clear(&keys::node_key(id))?;
        for prefix in [keys::dirent_prefix(id), keys::xattr_prefix(id)] {
            self.tx.clear_range(&prefix, &keys::family_end(&prefix))?;
        }
        Ok(())
    }

    // ========================================================================
    // Directory entries
    // ========================================================================

    pub fn entry(&mut self, dir: NodeId, name: &str) -> FsResult<Option<EntryRecord>> {
        match self.tx.get(&keys::dirent_key(dir, name))? {
            Some(bytes) => decode(&bytes, "directory entry").map(Some),
            None => Ok(None),
        }
    }

    /// Insert `name -> child` in `parent` and count the new link.
    ///
    /// Both records are written back.
    pub fn link(
        &mut self,
        parent: &mut NodeRecord,
        name: &str,
        child: &mut NodeRecord,
        now: SystemTime,
    ) -> FsResult<()> {
        child.link_count = child
            .link_count
            .checked_add(1)
            .ok_or_else(|| FsError::no_space(format!("link count of {}", child.id)))?;
        child.changed_at = now;
        let entry = EntryRecord {
            child: child.id,
            kind: child.kind,
        };
        self.tx
            .set(&keys::dirent_key(parent.id, name), &encode(&entry)?)?;
        parent.touch_modified(now);
        self.put(parent)?;
        self.put(child)
    }

    /// Remove `name` from `parent` and drop the link it held on `child`.
    ///
    /// Both records are written back. The child is not deleted here even
    /// when its count reaches zero.
    pub fn unlink(
        &mut self,
        parent: &mut NodeRecord,
        name: &str,
        child: &mut NodeRecord,
        now: SystemTime,
    ) -> FsResult<()> {
        child.link_count = child.link_count.saturating_sub(1);
        child.changed_at = now;
        self.tx.clear(&keys::dirent_key(parent.id, name))?;
        parent.touch_modified(now);
        self.put(parent)?;
        self.put(child)
    }

    /// Repoint an entry without touching link counts.
    pub fn move_entry(
        &mut self,
        from: (NodeId, &str),
        to: (NodeId, &str),
        entry: EntryRecord,
    ) -> FsResult<()> {
        self.tx.clear(&keys::dirent_key(from.0, from.1))?;
        self.tx.set(&keys::dirent_key(to.0, to.1), &encode(&entry)?)?;
        Ok(())
    }

    pub fn has_entries(&mut self, dir: NodeId) -> FsResult<bool> {
        let prefix = keys::dirent_prefix(dir);
        let first = self.tx.get_range(&prefix, &keys::family_end(&prefix), 1, false)?;
        Ok(!first.is_empty())
    }

    /// All entries of `dir`, in name byte order.
    pub fn entries(&mut self, dir: NodeId) -> FsResult<Vec<(String, EntryRecord)>> {
        let prefix = keys::dirent_prefix(dir);
        let end = keys::family_end(&prefix);
        let mut out = Vec::new();
        for item in self.tx.range_scan(&prefix, &end, false) {
            let (key, value) = item?;
            let name = keys::decode_name(&key)
                .ok_or_else(|| FsError::corrupt("directory entry key"))?;
            out.push((name, decode(&value, "directory entry")?));
        }
        Ok(out)
    }

    // ========================================================================
    // Extended attributes
    // ========================================================================

    pub fn xattr(&mut self, id: NodeId, name: &str) -> FsResult<Option<Vec<u8>>> {
        Ok(self.tx.get(&keys::xattr_key(id, name))?)
    }

    pub fn set_xattr(&mut self, id: NodeId, name: &str, value: &[u8]) -> FsResult<()> {
        self.tx.set(&keys::xattr_key(id, name), value)?;
        Ok(())
    }

    pub fn remove_xattr(&mut self, id: NodeId, name: &str) -> FsResult<()> {
        self.tx.clear(&keys::xattr_key(id, name))?;
        Ok(())
    }

    pub fn xattr_names(&mut self, id: NodeId) -> FsResult<Vec<String>> {
        let prefix = keys::xattr_prefix(id);
        let end = keys::family_end(&prefix);
        let mut names = Vec::new();
        for item in self.tx.range_scan(&prefix, &end, false) {
            let (key, _) = item?;
            names.push(keys::decode_name(&key).ok_or_else(|| FsError::corrupt("xattr key"))?);
        }
        Ok(names)
    }

    // ========================================================================
    // Open handles
    // ========================================================================

    /// Allocate the next handle id from the persisted counter.
    pub fn allocate_handle(&mut self) -> FsResult<HandleId> {
        let key = keys::next_handle_key();
        let next = match self.tx.get(&key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| FsError::corrupt("handle counter"))?;
                u64::from_be_bytes(raw)
            }
            None => 1,
        };
        let after = next
            .checked_add(1)
            .ok_or_else(|| FsError::no_space("handle ids exhausted"))?;
        self.tx.set(&key, &after.to_be_bytes())?;
        Ok(next)
    }

    pub fn handle(&mut self, handle: HandleId) -> FsResult<Option<HandleRecord>> {
        match self.tx.get(&keys::handle_key(handle))? {
            Some(bytes) => decode(&bytes, "handle record").map(Some),
            None => Ok(None),
        }
    }

    pub fn put_handle(&mut self, handle: HandleId, record: &HandleRecord) -> FsResult<()> {
        self.tx.set(&keys::handle_key(handle), &encode(record)?)?;
        Ok(())
    }

    pub fn remove_handle(&mut self, handle: HandleId) -> FsResult<()> {
        self.tx.clear(&keys::handle_key(handle))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvfs_kv::{KvStore, MemoryKv};

    fn now() -> SystemTime {
        SystemTime::now()
    }

    fn dir(id: NodeId) -> NodeRecord {
        NodeRecord::new(id, NodeKind::Directory, 0o755, 0, 0, now())
    }

    fn file() -> NodeRecord {
        NodeRecord::new(NodeId::new(), NodeKind::RegularFile, 0o644, 0, 0, now())
    }

    #[test]
    fn test_record_round_trip() {
        let kv = MemoryKv::new();
        let mut rec = file();
        rec.size = 42;
        rec.symlink_target = None;
        let loaded = kv
            .transact(|tx| {
                let mut store = NodeStore::new(tx);
                store.put(&rec)?;
                store.load(rec.id)
            })
            .unwrap();
        assert_eq!(loaded, rec);

        let missing = kv.transact(|tx| NodeStore::new(tx).load(NodeId::new()));
        assert!(matches!(missing, Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_timestamp_parts_before_and_after_epoch() {
        let half = Duration::from_millis(500);
        assert_eq!(timestamp_parts(UNIX_EPOCH), Some((0, 0)));
        assert_eq!(timestamp_parts(UNIX_EPOCH + half), Some((0, 500_000_000)));
        assert_eq!(timestamp_parts(UNIX_EPOCH - Duration::from_secs(1)), Some((-1, 0)));
        assert_eq!(timestamp_parts(UNIX_EPOCH - half), Some((-1, 500_000_000)));
        for time in [UNIX_EPOCH - half, UNIX_EPOCH - Duration::from_secs(86_400 * 365), now()] {
            let (secs, nanos) = timestamp_parts(time).unwrap();
            assert_eq!(timestamp_from_parts(secs, nanos), Some(time));
        }
        assert_eq!(timestamp_from_parts(0, 1_000_000_000), None);
    }

    #[test]
    fn test_record_with_pre_epoch_times_round_trips() {
        let kv = MemoryKv::new();
        let mut rec = file();
        rec.accessed_at = UNIX_EPOCH - Duration::from_secs(60);
        rec.modified_at = UNIX_EPOCH - Duration::from_millis(1_500);
        let loaded = kv
            .transact(|tx| {
                let mut store = NodeStore::new(tx);
                store.put(&rec)?;
                store.load(rec.id)
            })
            .unwrap();
        assert_eq!(loaded.accessed_at, rec.accessed_at);
        assert_eq!(loaded.modified_at, rec.modified_at);
    }

    #[test]
    fn test_link_and_unlink_keep_counts_with_entries() {
        let kv = MemoryKv::new();
        let mut parent = dir(NodeId::root());
        let mut child = file();
        kv.transact(|tx| {
            let mut store = NodeStore::new(tx);
            store.link(&mut parent, "a", &mut child, now())?;
            store.link(&mut parent, "b", &mut child, now())
        })
        .unwrap();

        let (count, names) = kv
            .transact(|tx| {
                let mut store = NodeStore::new(tx);
                let names: Vec<String> =
                    store.entries(parent.id)?.into_iter().map(|(n, _)| n).collect();
                Ok::<_, FsError>((store.load(child.id)?.link_count, names))
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(names, vec!["a", "b"]);

        kv.transact(|tx| {
            let mut store = NodeStore::new(tx);
            let mut parent = store.load(parent.id)?;
            let mut child = store.load(child.id)?;
            store.unlink(&mut parent, "a", &mut child, now())
        })
        .unwrap();
        let (count, entry) = kv
            .transact(|tx| {
                let mut store = NodeStore::new(tx);
                Ok::<_, FsError>((store.load(child.id)?.link_count, store.entry(parent.id, "a")?))
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(entry, None);
    }

    #[test]
    fn test_link_count_overflow_is_no_space() {
        let kv = MemoryKv::new();
        let mut parent = dir(NodeId::root());
        let mut child = file();
        child.link_count = u32::MAX;
        let result = kv.transact(|tx| NodeStore::new(tx).link(&mut parent, "x", &mut child, now()));
        assert!(matches!(result, Err(FsError::NoSpace(_))));
    }

    #[test]
    fn test_delete_clears_entries_and_xattrs() {
        let kv = MemoryKv::new();
        let mut parent = dir(NodeId::new());
        let mut child = file();
        kv.transact(|tx| {
            let mut store = NodeStore::new(tx);
            store.link(&mut parent, "c", &mut child, now())?;
            store.set_xattr(parent.id, "user.k", b"v")?;
            store.delete(parent.id)
        })
        .unwrap();
        let (rec, has, xattrs, child_rec) = kv
            .transact(|tx| {
                let mut store = NodeStore::new(tx);
                Ok::<_, FsError>((
                    store.get(parent.id)?,
                    store.has_entries(parent.id)?,
                    store.xattr_names(parent.id)?,
                    store.get(child.id)?,
                ))
            })
            .unwrap();
        assert!(rec.is_none());
        assert!(!has);
        assert!(xattrs.is_empty());
        assert!(child_rec.is_some());
    }

    #[test]
    fn test_handle_counter_is_monotonic() {
        let kv = MemoryKv::new();
        let ids = kv
            .transact(|tx| {
                let mut store = NodeStore::new(tx);
                Ok::<_, FsError>([store.allocate_handle()?, store.allocate_handle()?])
            })
            .unwrap();
        assert_eq!(ids, [1, 2]);
        let third = kv.transact(|tx| NodeStore::new(tx).allocate_handle()).unwrap();
        assert_eq!(third, 3);
    }
}
