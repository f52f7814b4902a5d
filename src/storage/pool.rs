//! A fixed-capacity pool of pre-opened SQLite connections.
//!
//! This is the pooled-connections alternative to the storage engine's
//! single shared connection, for callers that want parallel readers
//! against one database. Acquire and release both block, with no timeout;
//! the set of connections is created eagerly and never replaced.

use std::path::Path;

use crossbeam::channel::{Receiver, Sender, bounded};
use rusqlite::Connection;

use crate::{Error, Result};

pub struct ConnectionPool {
    slots: Sender<Connection>,
    available: Receiver<Connection>,
    capacity: usize,
}

impl ConnectionPool {
    /// Eagerly open `capacity` connections to `<db_name>.db` under
    /// `storage_dir`.
    pub fn open(storage_dir: &Path, db_name: &str, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Connection(
                "connection pool capacity must be at least 1".to_string(),
            ));
        }
        let db_name = db_name.strip_suffix(".db").unwrap_or(db_name);
        crate::model::validate_identifier(db_name)
            .map_err(|_| Error::Connection(format!("invalid database name: '{db_name}'")))?;
        std::fs::create_dir_all(storage_dir)?;
        let path = storage_dir.join(format!("{db_name}.db"));

        let (slots, available) = bounded(capacity);
        for _ in 0..capacity {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            slots.send(conn).map_err(|_| pool_closed())?;
        }
        Ok(Self {
            slots,
            available,
            capacity,
        })
    }

    /// Take a connection for exclusive use, blocking until one is free
    pub fn acquire(&self) -> Result<Connection> {
        self.available.recv().map_err(|_| pool_closed())
    }

    /// Return a connection to the pool
    pub fn release(&self, conn: Connection) -> Result<()> {
        self.slots.send(conn).map_err(|_| pool_closed())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connections currently waiting to be acquired
    pub fn idle(&self) -> usize {
        self.available.len()
    }
}

fn pool_closed() -> Error {
    Error::Connection("connection pool is closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn acquire_and_release_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path(), "pooled", 3).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.idle(), 3);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.idle(), 1);

        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.idle(), 3);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let pool = std::sync::Arc::new(ConnectionPool::open(dir.path(), "pooled", 1).unwrap());

        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let conn = pool.acquire().unwrap();
                pool.release(conn).unwrap();
            })
        };

        // the waiter cannot finish while the only connection is held
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        pool.release(held).unwrap();
        waiter.join().unwrap();
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn rejects_database_names_that_escape_the_storage_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ConnectionPool::open(dir.path(), "../evil", 1),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ConnectionPool::open(dir.path(), "pooled", 0),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn pooled_connections_share_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path(), "pooled", 2).unwrap();

        let writer = pool.acquire().unwrap();
        writer
            .execute("CREATE TABLE t (v INTEGER NOT NULL)", [])
            .unwrap();
        writer.execute("INSERT INTO t (v) VALUES (7)", []).unwrap();
        pool.release(writer).unwrap();

        let reader = pool.acquire().unwrap();
        let v: i64 = reader
            .query_row("SELECT v FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, 7);
        pool.release(reader).unwrap();
    }
}
