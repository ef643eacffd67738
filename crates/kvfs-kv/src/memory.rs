//! In-memory transactional store.
//!
//! Used for tests and ephemeral mounts. All data is lost when dropped.
//!
//! Concurrency is optimistic: a transaction reads live data, buffers its
//! writes, and records what it read. Commit validates the read set against
//! every transaction that committed since this one began; any overlap is a
//! [`KvError::Conflict`] and the caller's closure is re-run.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use parking_lot::Mutex;

use crate::error::{KvError, KvResult};
use crate::transaction::{KvPair, KvStore, RetryPolicy, Transaction, TxError, key_successor};

/// How many committed write sets are kept for validation.
const DEFAULT_HISTORY_LIMIT: usize = 4096;

/// Keys and ranges written by one committed transaction.
#[derive(Debug)]
struct CommitRecord {
    version: u64,
    keys: Vec<Vec<u8>>,
    ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl CommitRecord {
    fn touches_key(&self, key: &[u8]) -> bool {
        self.keys.iter().any(|k| k.as_slice() == key)
            || self
                .ranges
                .iter()
                .any(|(b, e)| b.as_slice() <= key && key < e.as_slice())
    }

    fn touches_range(&self, begin: &[u8], end: &[u8]) -> bool {
        self.keys
            .iter()
            .any(|k| begin <= k.as_slice() && k.as_slice() < end)
            || self
                .ranges
                .iter()
                .any(|(b, e)| b.as_slice() < end && begin < e.as_slice())
    }
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    version: u64,
    history: VecDeque<CommitRecord>,
}

/// In-memory ordered KV store with optimistic transactions.
///
/// Thread-safe via an internal `Mutex` held only for individual reads and
/// for commit validation, never across a whole transaction.
#[derive(Debug)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
    policy: RetryPolicy,
    history_limit: usize,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Create a new empty store with the default retry policy.
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    /// Create a new empty store with a custom retry policy.
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    #[cfg(test)]
    fn with_history_limit(history_limit: usize) -> Self {
        Self {
            history_limit,
            ..Self::new()
        }
    }

    /// Number of keys currently committed.
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// Returns true if nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn begin(&self) -> MemoryTx<'_> {
        MemoryTx {
            kv: self,
            read_version: self.inner.lock().version,
            writes: BTreeMap::new(),
            cleared: Vec::new(),
            read_keys: Vec::new(),
            read_ranges: Vec::new(),
        }
    }
}

impl KvStore for MemoryKv {
    fn transact<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut dyn Transaction) -> Result<T, E>,
        E: TxError,
    {
        self.policy.run(|| {
            let mut tx = self.begin();
            match f(&mut tx) {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                Err(e) => {
                    // An error computed from a stale view is retried like a
                    // failed commit.
                    tx.validate(&self.inner.lock())?;
                    Err(e)
                }
            }
        })
    }
}

/// One optimistic transaction against a [`MemoryKv`].
struct MemoryTx<'a> {
    kv: &'a MemoryKv,
    read_version: u64,
    /// Buffered writes; `None` marks a cleared key.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Buffered range clears, applied before `writes` at commit.
    cleared: Vec<(Vec<u8>, Vec<u8>)>,
    read_keys: Vec<Vec<u8>>,
    read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl MemoryTx<'_> {
    fn is_cleared(&self, key: &[u8]) -> bool {
        self.cleared
            .iter()
            .any(|(b, e)| b.as_slice() <= key && key < e.as_slice())
    }

    /// Fail with `Conflict` if anything this transaction read has been
    /// overwritten since it began.
    fn validate(&self, inner: &Inner) -> KvResult<()> {
        let has_reads = !self.read_keys.is_empty() || !self.read_ranges.is_empty();
        if !has_reads || inner.version <= self.read_version {
            return Ok(());
        }
        // Anything committed since we began must be in the window.
        let oldest_needed = self.read_version + 1;
        match inner.history.front() {
            Some(front) if front.version <= oldest_needed => {}
            _ => return Err(KvError::Conflict),
        }
        for record in inner.history.iter().filter(|r| r.version > self.read_version) {
            let hit = self.read_keys.iter().any(|k| record.touches_key(k))
                || self
                    .read_ranges
                    .iter()
                    .any(|(b, e)| record.touches_range(b, e));
            if hit {
                return Err(KvError::Conflict);
            }
        }
        Ok(())
    }

    fn commit(self) -> KvResult<()> {
        let mut inner = self.kv.inner.lock();
        self.validate(&inner)?;

        if self.writes.is_empty() && self.cleared.is_empty() {
            return Ok(());
        }

        for (begin, end) in &self.cleared {
            let doomed: Vec<Vec<u8>> = inner
                .data
                .range::<[u8], _>((Bound::Included(begin.as_slice()), Bound::Excluded(end.as_slice())))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                inner.data.remove(&key);
            }
        }
        let mut keys = Vec::with_capacity(self.writes.len());
        for (key, value) in self.writes {
            match value {
                Some(v) => {
                    inner.data.insert(key.clone(), v);
                }
                None => {
                    inner.data.remove(&key);
                }
            }
            keys.push(key);
        }

        inner.version += 1;
        let version = inner.version;
        inner.history.push_back(CommitRecord {
            version,
            keys,
            ranges: self.cleared,
        });
        while inner.history.len() > self.kv.history_limit {
            inner.history.pop_front();
        }
        Ok(())
    }
}

impl Transaction for MemoryTx<'_> {
    fn get(&mut self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        if self.is_cleared(key) {
            return Ok(None);
        }
        self.read_keys.push(key.to_vec());
        Ok(self.kv.inner.lock().data.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn clear(&mut self, key: &[u8]) -> KvResult<()> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> KvResult<()> {
        if begin >= end {
            return Ok(());
        }
        let buffered: Vec<Vec<u8>> = self
            .writes
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in buffered {
            self.writes.remove(&key);
        }
        self.cleared.push((begin.to_vec(), end.to_vec()));
        Ok(())
    }

    fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> KvResult<Vec<KvPair>> {
        if begin >= end || limit == 0 {
            return Ok(Vec::new());
        }
        let bounds = (Bound::Included(begin), Bound::Excluded(end));

        // Top `limit` from committed data, hiding keys we overwrote or cleared.
        let committed: Vec<KvPair> = {
            let inner = self.kv.inner.lock();
            let iter = inner.data.range::<[u8], _>(bounds);
            let visible = |(k, _): &(&Vec<u8>, &Vec<u8>)| {
                !self.writes.contains_key(k.as_slice()) && !self.is_cleared(k)
            };
            if reverse {
                iter.rev()
                    .filter(visible)
                    .take(limit)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            } else {
                iter.filter(visible)
                    .take(limit)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            }
        };

        // Top `limit` from our own buffered sets.
        let local = self.writes.range::<[u8], _>(bounds);
        let local: Vec<KvPair> = if reverse {
            local
                .rev()
                .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
                .take(limit)
                .collect()
        } else {
            local
                .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
                .take(limit)
                .collect()
        };

        let mut merged = merge_sorted(committed, local, reverse);
        merged.truncate(limit);

        // Record only the window actually observed.
        let observed = if merged.len() < limit {
            (begin.to_vec(), end.to_vec())
        } else if let Some((last, _)) = merged.last() {
            if reverse {
                (last.clone(), end.to_vec())
            } else {
                (begin.to_vec(), key_successor(last))
            }
        } else {
            (begin.to_vec(), end.to_vec())
        };
        self.read_ranges.push(observed);

        Ok(merged)
    }
}

fn merge_sorted(a: Vec<KvPair>, b: Vec<KvPair>, reverse: bool) -> Vec<KvPair> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let take_a = match (a.peek(), b.peek()) {
            (Some((ka, _)), Some((kb, _))) => {
                if reverse {
                    ka > kb
                } else {
                    ka < kb
                }
            }
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_a { a.next() } else { b.next() };
        out.extend(next);
    }
    out
}
