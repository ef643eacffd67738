//! Typed identifiers for nodes and open handles.
//!
//! `NodeId` wraps a UUIDv7 (time-ordered, globally unique), so allocating one
//! never needs a shared counter and is safe inside a retried transaction.
//! It is opaque on disk (16 raw bytes inside keys) and displays as standard
//! UUID text for logging. The root directory is the nil UUID.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one filesystem node (file, directory, or symlink).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(uuid::Uuid);

/// Identifier of one open file or directory handle.
pub type HandleId = u64;

impl NodeId {
    /// Allocate a fresh node ID (UUIDv7).
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// The root directory.
    pub const fn root() -> Self {
        Self(uuid::Uuid::nil())
    }

    /// Check if this is the root directory.
    pub fn is_root(&self) -> bool {
        self.0.is_nil()
    }

    /// First 8 hex characters — for human display only, not lookup.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "NodeId(root)")
        } else {
            write!(f, "NodeId({})", self.short())
        }
    }
}
