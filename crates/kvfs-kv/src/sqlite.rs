//! SQLite-backed transactional store.
//!
//! One ordered `kv` table; SQLite compares BLOB keys with `memcmp`, which
//! gives the same byte order as the in-memory store. Each `transact` call is
//! an `IMMEDIATE` transaction, so writers are serialized and a busy or locked
//! database surfaces as a retryable [`KvError::Conflict`].

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::info;

use crate::error::{KvError, KvResult};
use crate::transaction::{KvPair, KvStore, RetryPolicy, Transaction, TxError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key BLOB PRIMARY KEY,
    value BLOB NOT NULL
) WITHOUT ROWID;
"#;

/// Persistent store on an embedded SQLite database.
pub struct SqliteKv {
    conn: Mutex<Connection>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for SqliteKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKv").finish_non_exhaustive()
    }
}

impl SqliteKv {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> KvResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(std::time::Duration::from_millis(100))?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.as_ref().display(), "opened sqlite kv store");
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> KvResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    /// Replace the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            policy: RetryPolicy::default(),
        }
    }
}

impl KvStore for SqliteKv {
    fn transact<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut dyn Transaction) -> Result<T, E>,
        E: TxError,
    {
        self.policy.run(|| {
            let mut conn = self.conn.lock();
            let txn = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(KvError::from)?;
            let value = f(&mut SqliteTx { conn: &txn })?;
            txn.commit().map_err(KvError::from)?;
            Ok(value)
        })
    }
}

/// A live SQLite transaction. Rolled back on drop unless committed.
struct SqliteTx<'c> {
    conn: &'c Connection,
}

impl Transaction for SqliteTx<'_> {
    fn get(&mut self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    fn clear(&mut self, key: &[u8]) -> KvResult<()> {
        let mut stmt = self.conn.prepare_cached("DELETE FROM kv WHERE key = ?1")?;
        stmt.execute(params![key])?;
        Ok(())
    }

    fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> KvResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM kv WHERE key >= ?1 AND key < ?2")?;
        stmt.execute(params![begin, end])?;
        Ok(())
    }

    fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> KvResult<Vec<KvPair>> {
        let sql = if reverse {
            "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key DESC LIMIT ?3"
        } else {
            "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key ASC LIMIT ?3"
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![begin, end, limit], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_clear() {
        let kv = SqliteKv::in_memory().unwrap();
        kv.transact(|tx| {
            tx.set(b"a", b"1")?;
            tx.set(b"b", b"2")?;
            tx.clear(b"a")
        })
        .unwrap();
        let (a, b) = kv
            .transact(|tx| Ok::<_, KvError>((tx.get(b"a")?, tx.get(b"b")?)))
            .unwrap();
        assert_eq!(a, None);
        assert_eq!(b, Some(b"2".to_vec()));
    }

    #[test]
    fn test_error_rolls_back() {
        let kv = SqliteKv::in_memory().unwrap();
        let result: KvResult<()> = kv.transact(|tx| {
            tx.set(b"a", b"1")?;
            Err(KvError::backend("nope"))
        });
        assert!(result.is_err());
        assert_eq!(kv.transact(|tx| tx.get(b"a")).unwrap(), None);
    }

    #[test]
    fn test_range_order_and_clear_range() {
        let kv = SqliteKv::in_memory().unwrap();
        kv.transact(|tx| {
            for i in [3u8, 1, 0xff, 2] {
                tx.set(&[7, i], &[i])?;
            }
            tx.set(&[8], b"outside")
        })
        .unwrap();

        let fwd = kv.transact(|tx| tx.get_range(&[7], &[8], 10, false)).unwrap();
        let keys: Vec<u8> = fwd.iter().map(|(k, _)| k[1]).collect();
        assert_eq!(keys, vec![1, 2, 3, 0xff]);

        let rev = kv.transact(|tx| tx.get_range(&[7], &[8], 2, true)).unwrap();
        let keys: Vec<u8> = rev.iter().map(|(k, _)| k[1]).collect();
        assert_eq!(keys, vec![0xff, 3]);

        kv.transact(|tx| tx.clear_range(&[7, 2], &[7, 4])).unwrap();
        let left = kv.transact(|tx| tx.get_range(&[0], &[9], 10, false)).unwrap();
        assert_eq!(left.len(), 3);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.db");
        {
            let kv = SqliteKv::open(&path).unwrap();
            kv.transact(|tx| tx.set(b"hello", b"world")).unwrap();
        }
        let kv = SqliteKv::open(&path).unwrap();
        assert_eq!(
            kv.transact(|tx| tx.get(b"hello")).unwrap(),
            Some(b"world".to_vec())
        );
    }

    #[test]
    fn test_locked_database_is_retried_not_failed() {
        use std::sync::mpsc;
        use std::time::Duration;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.db");
        let holder = SqliteKv::open(&path).unwrap();
        let waiter = SqliteKv::open(&path).unwrap();
        let (started, wait_started) = mpsc::channel();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                holder
                    .transact(|tx| {
                        tx.set(b"owner", b"holder")?;
                        started.send(()).ok();
                        // Outlast the waiter's busy timeout a few times over.
                        std::thread::sleep(Duration::from_millis(350));
                        Ok::<_, KvError>(())
                    })
                    .unwrap();
            });

            wait_started.recv().unwrap();
            let seen = waiter
                .transact(|tx| {
                    let seen = tx.get(b"owner")?;
                    tx.set(b"owner", b"waiter")?;
                    Ok::<_, KvError>(seen)
                })
                .unwrap();
            assert_eq!(seen, Some(b"holder".to_vec()));
        });

        assert_eq!(
            holder.transact(|tx| tx.get(b"owner")).unwrap(),
            Some(b"waiter".to_vec())
        );
    }
}
