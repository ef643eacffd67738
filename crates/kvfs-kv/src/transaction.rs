//! The transactional KV contract.
//!
//! Everything above this crate talks to storage through [`Transaction`]
//! handed out by [`KvStore::transact`]. A store retries the whole closure
//! when the attempt (or its commit) reports a retryable [`KvError`], so the
//! closure must be free of side effects outside the transaction.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{KvError, KvResult};

/// A key/value pair as returned by range reads.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Default number of pairs fetched per [`RangeScan`] page.
pub const DEFAULT_PAGE_SIZE: usize = 16;

/// Operations available inside one transaction.
///
/// Writes are only visible to other transactions once the enclosing
/// [`KvStore::transact`] call commits. Reads observe this transaction's own
/// buffered writes.
pub trait Transaction {
    /// Read a single key.
    fn get(&mut self, key: &[u8]) -> KvResult<Option<Vec<u8>>>;

    /// Write a single key, replacing any previous value.
    fn set(&mut self, key: &[u8], value: &[u8]) -> KvResult<()>;

    /// Remove a single key. Removing a missing key is not an error.
    fn clear(&mut self, key: &[u8]) -> KvResult<()>;

    /// Remove every key in `[begin, end)`.
    fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> KvResult<()>;

    /// Read up to `limit` pairs from `[begin, end)`, ascending or descending.
    fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> KvResult<Vec<KvPair>>;
}

impl dyn Transaction + '_ {
    /// Lazily iterate `[begin, end)` in key order (or reverse key order).
    pub fn range_scan(&mut self, begin: &[u8], end: &[u8], reverse: bool) -> RangeScan<'_> {
        RangeScan::new(self, begin, end, reverse)
    }
}

/// Lazy, paged iterator over a key range.
///
/// Each page is one [`Transaction::get_range`] call; dropping the scan early
/// means later pages are never read.
pub struct RangeScan<'s> {
    tx: &'s mut dyn Transaction,
    begin: Vec<u8>,
    end: Vec<u8>,
    reverse: bool,
    page_size: usize,
    buffered: VecDeque<KvPair>,
    exhausted: bool,
}

impl<'s> RangeScan<'s> {
    /// Start a scan over `[begin, end)`.
    pub fn new(tx: &'s mut dyn Transaction, begin: &[u8], end: &[u8], reverse: bool) -> Self {
        Self {
            tx,
            begin: begin.to_vec(),
            end: end.to_vec(),
            reverse,
            page_size: DEFAULT_PAGE_SIZE,
            buffered: VecDeque::new(),
            exhausted: begin >= end,
        }
    }

    /// Override the number of pairs fetched per page.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn fill(&mut self) -> KvResult<()> {
        let page = self
            .tx
            .get_range(&self.begin, &self.end, self.page_size, self.reverse)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            // Narrow the remaining window past the last key we saw.
            if self.reverse {
                self.end = last.clone();
            } else {
                self.begin = key_successor(last);
            }
        }
        self.buffered.extend(page);
        Ok(())
    }
}

impl Iterator for RangeScan<'_> {
    type Item = KvResult<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffered.pop_front().map(Ok)
    }
}

/// Error types that can travel through a transaction closure.
///
/// The retry loop needs to see KV conflicts even when the closure returns a
/// domain error type, so that type must expose the wrapped [`KvError`].
pub trait TxError: From<KvError> {
    /// The KV error this value wraps, if any.
    fn as_kv(&self) -> Option<&KvError>;

    /// Returns true if the transaction should be re-run.
    fn is_retryable(&self) -> bool {
        self.as_kv().is_some_and(KvError::is_retryable)
    }
}

impl TxError for KvError {
    fn as_kv(&self) -> Option<&KvError> {
        Some(self)
    }
}

/// A store that runs closures as atomic, retried transactions.
pub trait KvStore: Send + Sync {
    /// Run `f` inside a transaction and commit it.
    ///
    /// `f` may run several times; only the final, committed attempt's writes
    /// become visible. If `f` returns an error the attempt's writes are
    /// discarded.
    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnMut(&mut dyn Transaction) -> Result<T, E>,
        E: TxError;
}

/// How many times to re-run a conflicting transaction and how long to wait.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Upper bound for the first backoff sleep; doubles per attempt.
    pub base_backoff: Duration,
    /// Ceiling for any single backoff sleep.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            base_backoff: Duration::from_micros(50),
            max_backoff: Duration::from_millis(20),
        }
    }
}

impl RetryPolicy {
    /// A policy with the given attempt budget and default backoff.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    fn backoff(&self, attempt: u32) {
        let shift = attempt.saturating_sub(1).min(16);
        let cap = self
            .base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        let micros = cap.as_micros() as u64;
        if micros == 0 {
            return;
        }
        let jitter = rand::thread_rng().gen_range(0..=micros);
        std::thread::sleep(Duration::from_micros(jitter));
    }

    /// Drive `attempt` until it succeeds, fails permanently, or the budget
    /// runs out.
    pub fn run<T, E: TxError>(&self, mut attempt: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt() {
                Err(e) if e.is_retryable() => {
                    if tries >= self.max_attempts {
                        return Err(KvError::RetryLimitExceeded(tries).into());
                    }
                    warn!(attempt = tries, "transaction conflict, retrying");
                    self.backoff(tries);
                }
                other => return other,
            }
        }
    }
}

/// Smallest key strictly greater than `key`.
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Used as the exclusive end of a prefix scan. An all-`0xff` prefix has no
/// such key; the result is then `[0xff; len + 1]`, which still bounds every
/// key the engine writes.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0xff; prefix.len() + 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab"), b"ac".to_vec());
        assert_eq!(prefix_end(&[0x01, 0xff]), vec![0x02]);
        assert_eq!(prefix_end(&[0xff, 0xff]), vec![0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_key_successor_sorts_right_after() {
        let k = b"abc".to_vec();
        let next = key_successor(&k);
        assert!(next > k);
        assert!(next < b"abd".to_vec());
    }

    #[test]
    fn test_range_scan_pages_forward_and_reverse() {
        let kv = MemoryKv::new();
        kv.transact(|tx| {
            for i in 0u8..40 {
                tx.set(&[b'k', i], &[i])?;
            }
            Ok::<_, KvError>(())
        })
        .unwrap();

        let (fwd, rev) = kv
            .transact(|tx| {
                let fwd: Vec<u8> = tx
                    .range_scan(b"k", b"l", false)
                    .page_size(7)
                    .map(|r| r.map(|(_, v)| v[0]))
                    .collect::<KvResult<_>>()?;
                let rev: Vec<u8> = tx
                    .range_scan(&[b'k', 10], &[b'k', 20], true)
                    .page_size(3)
                    .map(|r| r.map(|(_, v)| v[0]))
                    .collect::<KvResult<_>>()?;
                Ok::<_, KvError>((fwd, rev))
            })
            .unwrap();

        assert_eq!(fwd, (0u8..40).collect::<Vec<_>>());
        assert_eq!(rev, (10u8..20).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_range_scan_stops_early() {
        let kv = MemoryKv::new();
        kv.transact(|tx| {
            for i in 0u8..100 {
                tx.set(&[i], b"x")?;
            }
            Ok::<_, KvError>(())
        })
        .unwrap();

        let first = kv
            .transact(|tx| {
                let first: Vec<KvPair> = tx
                    .range_scan(&[0], &[200], true)
                    .take(2)
                    .collect::<KvResult<_>>()?;
                Ok::<_, KvError>(first)
            })
            .unwrap();
        assert_eq!(first[0].0, vec![99]);
        assert_eq!(first[1].0, vec![98]);
    }

    #[test]
    fn test_retry_policy_gives_up() {
        let policy = RetryPolicy::with_max_attempts(3);
        let mut calls = 0;
        let result: Result<(), KvError> = policy.run(|| {
            calls += 1;
            Err(KvError::Conflict)
        });
        assert!(matches!(result, Err(KvError::RetryLimitExceeded(3))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_policy_does_not_retry_hard_errors() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<(), KvError> = policy.run(|| {
            calls += 1;
            Err(KvError::backend("disk on fire"))
        });
        assert!(matches!(result, Err(KvError::Backend(_))));
        assert_eq!(calls, 1);
    }
}
