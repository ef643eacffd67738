//! # kvfs-core
//!
//! A POSIX-like filesystem namespace and content store on top of the
//! transactional KV contract in `kvfs-kv`.
//!
//! Layers, leaf first:
//!
//! - [`chunk::ChunkCodec`] - a node's bytes as offset-keyed chunks with
//!   sparse holes
//! - [`store::NodeStore`] - node records, directory entries, extended
//!   attributes and open handles
//! - [`namespace::Namespace`] - path resolution and tree-consistent
//!   mutation, one instance per transaction
//! - [`Engine`] - the [`FsOps`] surface a host adapter calls; every call is
//!   exactly one transaction
//!
//! ```no_run
//! use kvfs_core::{Engine, EngineConfig, FsOps};
//! use kvfs_kv::MemoryKv;
//!
//! let fs = Engine::new(MemoryKv::new(), EngineConfig::default())?;
//! fs.mkdir("/docs", 0o755)?;
//! fs.write_all("/docs/hello.txt", b"hello")?;
//! assert_eq!(fs.read_all("/docs/hello.txt")?, b"hello");
//! # Ok::<(), kvfs_core::FsError>(())
//! ```

pub mod chunk;
pub mod config;
pub mod engine;
mod error;
mod ids;
pub mod keys;
pub mod namespace;
mod ops;
pub mod store;
mod types;

pub use config::{EngineConfig, StatFsConfig};
pub use engine::Engine;
pub use error::{FsError, FsResult};
pub use ids::{HandleId, NodeId};
pub use ops::FsOps;
pub use types::{DirEntry, NAME_MAX, NodeAttr, NodeKind, OpenFlags, SetAttr, StatFs, XattrMode};
