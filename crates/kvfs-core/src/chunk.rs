//! Chunk codec: a node's byte stream as offset-keyed chunks.
//!
//! Each chunk is stored under `chunk_key(node, start)` and holds at most
//! `chunk_size` bytes. For one node, chunks never overlap; gaps between
//! them are sparse holes that read as zeros. The codec has no notion of a
//! node's logical size: callers pass it in for reads and keep it up to date
//! themselves.

use kvfs_kv::Transaction;
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::ids::NodeId;
use crate::keys;

/// A stored chunk: its start offset and bytes.
type Piece = (u64, Vec<u8>);

/// Reads and writes a node's content through chunk keys.
#[derive(Debug, Clone, Copy)]
pub struct ChunkCodec {
    chunk_size: usize,
}

impl ChunkCodec {
    /// A codec splitting content into chunks of at most `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Collect chunks overlapping `[from, to)`, in ascending offset order.
    ///
    /// Scans backward from `to` and stops at the first chunk ending at or
    /// before `from`. With `coalesce`, that chunk is kept too if it is short
    /// and less than one chunk away, so small appends merge into it instead
    /// of leaving a trail of tiny chunks.
    fn select(
        &self,
        tx: &mut dyn Transaction,
        node: NodeId,
        from: u64,
        to: u64,
        coalesce: bool,
    ) -> FsResult<Vec<Piece>> {
        let begin = keys::chunk_key(node, 0);
        let end = keys::chunk_key(node, to);
        let mut pieces = Vec::new();
        for item in tx.range_scan(&begin, &end, true) {
            let (key, data) = item?;
            let start = keys::decode_chunk_offset(&key)
                .ok_or_else(|| FsError::corrupt("chunk key"))?;
            let chunk_end = start + data.len() as u64;
            if chunk_end <= from {
                let short = data.len() < self.chunk_size;
                if coalesce && short && from - chunk_end < self.chunk_size as u64 {
                    pieces.push((start, data));
                }
                break;
            }
            pieces.push((start, data));
        }
        // Scanned backward.
        pieces.reverse();
        Ok(pieces)
    }

    /// Read into `buf` starting at `offset`, bounded by the logical `size`.
    ///
    /// Holes inside `[0, size)` read as zeros. Returns
    /// `FsError::EndOfData` with the number of bytes copied when fewer than
    /// `buf.len()` bytes lie below `size`.
    pub fn read_at(
        &self,
        tx: &mut dyn Transaction,
        node: NodeId,
        size: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset.saturating_add(buf.len() as u64).min(size);
        if offset >= end {
            return Err(FsError::EndOfData { read: 0 });
        }
        let want = (end - offset) as usize;
        let out = &mut buf[..want];
        out.fill(0);

        let pieces = self.select(tx, node, offset, end, false)?;
        for (start, data) in &pieces {
            let lo = (*start).max(offset);
            let hi = (start + data.len() as u64).min(end);
            if lo < hi {
                out[(lo - offset) as usize..(hi - offset) as usize]
                    .copy_from_slice(&data[(lo - start) as usize..(hi - start) as usize]);
            }
        }
        trace!(%node, offset, want, chunks = pieces.len(), "read_at");

        if want < buf.len() {
            Err(FsError::EndOfData { read: want })
        } else {
            Ok(want)
        }
    }

    /// Write `data` at `offset`, re-chunking every chunk it touches.
    ///
    /// Writing past the last chunk leaves a hole unless the last chunk is
    /// short and near enough to absorb the gap as zeros.
    pub fn write_at(
        &self,
        tx: &mut dyn Transaction,
        node: NodeId,
        offset: u64,
        data: &[u8],
    ) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::no_space("write offset overflow"))?;

        let pieces = self.select(tx, node, offset, end, true)?;
        let sel_start = pieces.iter().map(|(s, _)| *s).fold(offset, u64::min);
        let sel_end = pieces
            .iter()
            .map(|(s, d)| s + d.len() as u64)
            .fold(end, u64::max);

        let mut selection = vec![0u8; (sel_end - sel_start) as usize];
        for (start, bytes) in &pieces {
            let at = (start - sel_start) as usize;
            selection[at..at + bytes.len()].copy_from_slice(bytes);
        }
        let at = (offset - sel_start) as usize;
        selection[at..at + data.len()].copy_from_slice(data);

        tx.clear_range(
            &keys::chunk_key(node, sel_start),
            &keys::chunk_key(node, sel_end),
        )?;
        let mut chunks = 0;
        for (i, piece) in selection.chunks(self.chunk_size).enumerate() {
            let start = sel_start + (i * self.chunk_size) as u64;
            tx.set(&keys::chunk_key(node, start), piece)?;
            chunks += 1;
        }
        trace!(
            %node,
            offset,
            len = data.len(),
            sel_start,
            sel_end,
            replaced = pieces.len(),
            chunks,
            "write_at"
        );
        Ok(data.len())
    }

    /// End offset of the highest chunk, or 0 without chunks.
    ///
    /// The node record's size is authoritative; this is a consistency check.
    pub fn size_of(&self, tx: &mut dyn Transaction, node: NodeId) -> FsResult<u64> {
        let prefix = keys::chunk_prefix(node);
        let end = keys::family_end(&prefix);
        let last = tx.range_scan(&prefix, &end, true).next().transpose()?;
        match last {
            Some((key, data)) => {
                let start = keys::decode_chunk_offset(&key)
                    .ok_or_else(|| FsError::corrupt("chunk key"))?;
                Ok(start + data.len() as u64)
            }
            None => Ok(0),
        }
    }

    /// Remove every chunk of `node`.
    pub fn clear_all(&self, tx: &mut dyn Transaction, node: NodeId) -> FsResult<()> {
        let prefix = keys::chunk_prefix(node);
        tx.clear_range(&prefix, &keys::family_end(&prefix))?;
        trace!(%node, "clear_all");
        Ok(())
    }

    /// Drop content at or beyond `new_size`.
    ///
    /// Growing is logical only: the new tail is a hole until written.
    pub fn truncate(&self, tx: &mut dyn Transaction, node: NodeId, new_size: u64) -> FsResult<()> {
        if new_size == 0 {
            return self.clear_all(tx, node);
        }
        let prefix = keys::chunk_prefix(node);
        tx.clear_range(&keys::chunk_key(node, new_size), &keys::family_end(&prefix))?;

        let straddling = tx
            .range_scan(&prefix, &keys::chunk_key(node, new_size), true)
            .next()
            .transpose()?;
        if let Some((key, data)) = straddling {
            let start = keys::decode_chunk_offset(&key)
                .ok_or_else(|| FsError::corrupt("chunk key"))?;
            let keep = new_size - start;
            if (data.len() as u64) > keep {
                tx.set(&key, &data[..keep as usize])?;
            }
        }
        trace!(%node, new_size, "truncate");
        Ok(())
    }

    /// `(start, len)` of every chunk, in offset order.
    pub fn layout(&self, tx: &mut dyn Transaction, node: NodeId) -> FsResult<Vec<(u64, usize)>> {
        let prefix = keys::chunk_prefix(node);
        let end = keys::family_end(&prefix);
        let mut out = Vec::new();
        for item in tx.range_scan(&prefix, &end, false) {
            let (key, data) = item?;
            let start = keys::decode_chunk_offset(&key)
                .ok_or_else(|| FsError::corrupt("chunk key"))?;
            out.push((start, data.len()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvfs_kv::{KvStore, MemoryKv};

    struct Fixture {
        kv: MemoryKv,
        codec: ChunkCodec,
        node: NodeId,
    }

    impl Fixture {
        fn new(chunk_size: usize) -> Self {
            Self {
                kv: MemoryKv::new(),
                codec: ChunkCodec::new(chunk_size),
                node: NodeId::new(),
            }
        }

        fn write(&self, offset: u64, data: &[u8]) {
            let n = self
                .kv
                .transact(|tx| self.codec.write_at(tx, self.node, offset, data))
                .unwrap();
            assert_eq!(n, data.len());
        }

        fn read(&self, size: u64, offset: u64, len: usize) -> (Vec<u8>, FsResult<usize>) {
            let mut buf = vec![0xAA; len];
            let result = self
                .kv
                .transact(|tx| match self.codec.read_at(tx, self.node, size, offset, &mut buf) {
                    Err(FsError::EndOfData { read }) => Ok(Err(FsError::EndOfData { read })),
                    other => other.map(Ok),
                })
                .unwrap();
            (buf, result)
        }

        fn size_of(&self) -> u64 {
            self.kv
                .transact(|tx| self.codec.size_of(tx, self.node))
                .unwrap()
        }

        fn layout(&self) -> Vec<(u64, usize)> {
            self.kv
                .transact(|tx| self.codec.layout(tx, self.node))
                .unwrap()
        }
    }

    #[test]
    fn test_content_round_trip() {
        let f = Fixture::new(4);
        let data: Vec<u8> = (0u8..23).collect();
        for offset in [0u64, 1, 3, 4, 9] {
            f.write(offset, &data);
            let size = f.size_of();
            let (buf, n) = f.read(size, offset, data.len());
            assert_eq!(n.unwrap(), data.len());
            assert_eq!(buf, data);
        }
        // Empty write and read are no-ops.
        f.write(5, &[]);
        let (_, n) = f.read(f.size_of(), 5, 0);
        assert_eq!(n.unwrap(), 0);
    }

    #[test]
    fn test_sparse_hole() {
        let f = Fixture::new(64);
        f.write(3, &[0x05]);
        assert_eq!(f.size_of(), 4);
        let (buf, n) = f.read(4, 0, 4);
        assert_eq!(n.unwrap(), 4);
        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x05]);
    }

    #[test]
    fn test_clear_all_is_idempotent() {
        let f = Fixture::new(4);
        f.write(0, b"some bytes spanning several chunks");
        for _ in 0..2 {
            f.kv.transact(|tx| f.codec.clear_all(tx, f.node)).unwrap();
            assert_eq!(f.size_of(), 0);
        }
        assert!(f.layout().is_empty());
    }

    #[test]
    fn test_overlapping_writes_merge() {
        let f = Fixture::new(64);
        f.write(0, &[1, 2, 3]);
        f.write(2, &[3, 4, 5]);
        assert_eq!(f.size_of(), 5);
        let (buf, n) = f.read(5, 0, 6);
        assert!(matches!(n, Err(FsError::EndOfData { read: 5 })));
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(f.layout(), vec![(0, 5)]);
    }

    #[test]
    fn test_chunks_never_overlap_or_exceed_size() {
        let f = Fixture::new(8);
        let mut model = vec![0u8; 0];
        let writes: &[(u64, &[u8])] = &[
            (0, b"abcdefghijklmnop"),
            (5, b"XYZ"),
            (30, b"tail"),
            (14, b"0123456789"),
            (7, b"-"),
        ];
        for &(offset, data) in writes {
            f.write(offset, data);
            let end = offset as usize + data.len();
            if model.len() < end {
                model.resize(end, 0);
            }
            model[offset as usize..end].copy_from_slice(data);
        }
        let layout = f.layout();
        for pair in layout.windows(2) {
            assert!(pair[0].0 + pair[0].1 as u64 <= pair[1].0);
        }
        assert!(layout.iter().all(|&(_, len)| len > 0 && len <= 8));
        assert_eq!(f.size_of(), model.len() as u64);
        let (buf, n) = f.read(model.len() as u64, 0, model.len());
        assert_eq!(n.unwrap(), model.len());
        assert_eq!(buf, model);
    }

    #[test]
    fn test_far_write_leaves_hole() {
        let f = Fixture::new(4);
        f.write(0, b"ab");
        f.write(100, b"z");
        assert_eq!(f.layout(), vec![(0, 2), (100, 1)]);
        let (buf, n) = f.read(101, 98, 3);
        assert_eq!(n.unwrap(), 3);
        assert_eq!(buf, vec![0, 0, b'z']);
    }

    #[test]
    fn test_near_write_absorbs_short_chunk() {
        let f = Fixture::new(8);
        f.write(0, b"ab");
        f.write(4, b"cd");
        assert_eq!(f.layout(), vec![(0, 6)]);
        let (buf, _) = f.read(6, 0, 6);
        assert_eq!(buf, b"ab\0\0cd".to_vec());
    }

    #[test]
    fn test_read_is_clamped_to_size() {
        let f = Fixture::new(4);
        f.write(0, b"hello world");
        // Logical size smaller than stored content: nothing beyond it is read.
        let (buf, n) = f.read(5, 3, 10);
        assert!(matches!(n, Err(FsError::EndOfData { read: 2 })));
        assert_eq!(&buf[..2], b"lo");
        let (_, n) = f.read(5, 5, 1);
        assert!(matches!(n, Err(FsError::EndOfData { read: 0 })));
    }

    #[test]
    fn test_truncate_shrinks_and_grows() {
        let f = Fixture::new(4);
        f.write(0, b"0123456789");
        f.kv.transact(|tx| f.codec.truncate(tx, f.node, 6)).unwrap();
        assert_eq!(f.size_of(), 6);
        assert_eq!(f.layout(), vec![(0, 4), (4, 2)]);

        // Grow is logical: the tail reads as zeros.
        f.kv.transact(|tx| f.codec.truncate(tx, f.node, 9)).unwrap();
        assert_eq!(f.size_of(), 6);
        let (buf, n) = f.read(9, 4, 5);
        assert_eq!(n.unwrap(), 5);
        assert_eq!(buf, b"45\0\0\0".to_vec());

        f.kv.transact(|tx| f.codec.truncate(tx, f.node, 0)).unwrap();
        assert_eq!(f.size_of(), 0);
    }

    #[test]
    fn test_nodes_do_not_share_chunks() {
        let a = Fixture::new(4);
        let other = NodeId::new();
        a.write(0, b"aaaa");
        a.kv.transact(|tx| a.codec.write_at(tx, other, 0, b"bb")).unwrap();
        a.kv.transact(|tx| a.codec.clear_all(tx, other)).unwrap();
        assert_eq!(a.size_of(), 4);
    }
}
