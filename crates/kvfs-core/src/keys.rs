//! Binary key layout.
//!
//! All keys are big-endian byte strings so lexicographic order matches
//! numeric order and every per-node family is one contiguous prefix:
//!
//! ```text
//! 0x01 | node(16) | 0x00                  node record
//! 0x01 | node(16) | 0x01 | name           directory entry
//! 0x01 | node(16) | 0x02 | name           extended attribute
//! 0x01 | node(16) | 0x03 | offset(u64 BE) chunk
//! 0x02 | handle(u64 BE)                   open handle
//! 0x00 | "next_handle"                    handle counter
//! ```

use kvfs_kv::prefix_end;

use crate::ids::{HandleId, NodeId};

const PREFIX_META: u8 = 0x00;
const PREFIX_NODE: u8 = 0x01;
const PREFIX_HANDLE: u8 = 0x02;

const SUFFIX_RECORD: u8 = 0x00;
const SUFFIX_DIRENT: u8 = 0x01;
const SUFFIX_XATTR: u8 = 0x02;
const SUFFIX_CHUNK: u8 = 0x03;

/// Length of `PREFIX_NODE | node`.
const NODE_PREFIX_LEN: usize = 1 + 16;
/// Length of a family prefix: node prefix plus suffix byte.
const FAMILY_LEN: usize = NODE_PREFIX_LEN + 1;

fn family(node: NodeId, suffix: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(FAMILY_LEN + 8);
    key.push(PREFIX_NODE);
    key.extend_from_slice(node.as_bytes());
    key.push(suffix);
    key
}

/// Key of a node's record.
pub fn node_key(node: NodeId) -> Vec<u8> {
    family(node, SUFFIX_RECORD)
}

/// Prefix shared by all directory entries of `dir`.
pub fn dirent_prefix(dir: NodeId) -> Vec<u8> {
    family(dir, SUFFIX_DIRENT)
}

/// Key of the entry `name` in `dir`.
pub fn dirent_key(dir: NodeId, name: &str) -> Vec<u8> {
    let mut key = dirent_prefix(dir);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Prefix shared by all extended attributes of `node`.
pub fn xattr_prefix(node: NodeId) -> Vec<u8> {
    family(node, SUFFIX_XATTR)
}

/// Key of the extended attribute `name` on `node`.
pub fn xattr_key(node: NodeId, name: &str) -> Vec<u8> {
    let mut key = xattr_prefix(node);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Prefix shared by all chunks of `node`.
pub fn chunk_prefix(node: NodeId) -> Vec<u8> {
    family(node, SUFFIX_CHUNK)
}

/// Key of the chunk of `node` starting at `offset`.
pub fn chunk_key(node: NodeId, offset: u64) -> Vec<u8> {
    let mut key = chunk_prefix(node);
    key.extend_from_slice(&offset.to_be_bytes());
    key
}

/// Exclusive end of a family prefix scan.
pub fn family_end(prefix: &[u8]) -> Vec<u8> {
    prefix_end(prefix)
}

/// Name component of a directory entry or xattr key.
pub fn decode_name(key: &[u8]) -> Option<String> {
    if key.len() < FAMILY_LEN || key[0] != PREFIX_NODE {
        return None;
    }
    match key[NODE_PREFIX_LEN] {
        SUFFIX_DIRENT | SUFFIX_XATTR => {
            String::from_utf8(key[FAMILY_LEN..].to_vec()).ok()
        }
        _ => None,
    }
}

/// Offset component of a chunk key.
pub fn decode_chunk_offset(key: &[u8]) -> Option<u64> {
    if key.len() != FAMILY_LEN + 8 || key[0] != PREFIX_NODE || key[NODE_PREFIX_LEN] != SUFFIX_CHUNK
    {
        return None;
    }
    let bytes: [u8; 8] = key[FAMILY_LEN..].try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Key of an open handle record.
pub fn handle_key(handle: HandleId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(PREFIX_HANDLE);
    key.extend_from_slice(&handle.to_be_bytes());
    key
}

/// Key of the handle allocation counter.
pub fn next_handle_key() -> Vec<u8> {
    let mut key = vec![PREFIX_META];
    key.extend_from_slice(b"next_handle");
    key
}
