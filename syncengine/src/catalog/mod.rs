//! The shadow catalog (A): the one piece of durable, transactional state
//! shared between the scanner and the upload worker. Everything else in
//! this crate communicates through rows in here rather than by passing
//! data structures between threads.
//!
//! Backed by `rusqlite` against a single on-disk file. `rusqlite::Connection`
//! is blocking by construction, which is a natural fit here: the catalog is
//! only ever touched from the scanner thread and the task-queue worker
//! thread (§5's "kernel threads with condition variables" model), never
//! from an async task, so there is nothing to gain from wrapping it in
//! `spawn_blocking` ceremony.

mod schema;

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use crate::error::SyncError;

pub mod model;
pub use model::*;

/// A handle to the catalog, cheaply cloneable, sharing one connection
/// behind a mutex. `rusqlite` serializes writers at the SQLite level too,
/// but the mutex is what gives us the `begin`/`commit`/`rollback` contract
/// of §4.1 without a connection pool.
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<Mutex<Connection>>,
}

/// A read transaction / write transaction handle. Holds the catalog's
/// mutex for its lifetime — callers must keep these short-lived, per the
/// single-writer contract.
pub struct Txn<'c> {
    guard: MutexGuard<'c, Connection>,
    finished: bool,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(SyncError::Catalog)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(SyncError::Catalog)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(SyncError::Catalog)?;
        schema::init(&conn)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(SyncError::Catalog)?;
        schema::init(&conn)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    /// Begins a write transaction, blocking until any other in-progress
    /// transaction on this catalog completes.
    pub fn begin(&self) -> Result<Txn<'_>, SyncError> {
        let guard = self.inner.lock();
        guard.execute_batch("BEGIN IMMEDIATE").map_err(SyncError::Catalog)?;
        Ok(Txn {
            guard,
            finished: false,
        })
    }

    /// `try-upgrade-lock` from §4.1: returns immediately with `None` rather
    /// than blocking if another writer already holds the catalog, so a
    /// caller with a cheaper fallback (e.g. the scanner skipping a
    /// would-be-blocking apply phase this pass) can back off instead of
    /// stalling behind the upload worker.
    pub fn try_begin(&self) -> Option<Txn<'_>> {
        let guard = self.inner.try_lock()?;
        guard.execute_batch("BEGIN IMMEDIATE").ok()?;
        Some(Txn {
            guard,
            finished: false,
        })
    }

    /// A read-only snapshot: SQLite's own MVCC means concurrent readers
    /// never block a writer holding `begin()`, so this just clones the
    /// `Arc` and opens a fresh read against the same file — used by status
    /// reporting, which must never contend with the hot write path.
    pub fn read_lock(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        Ok(self.inner.lock())
    }

    /// `cell_int(query, default)` from §4.1: a single-value read with a
    /// default for "no rows", used for count-style queries where absence
    /// and zero are equivalent.
    pub fn cell_int(&self, sql: &str, params: &[&dyn rusqlite::ToSql], default: i64) -> Result<i64, SyncError> {
        let conn = self.inner.lock();
        conn.query_row(sql, params, |row| row.get(0))
            .optional()
            .map_err(SyncError::Catalog)
            .map(|v| v.unwrap_or(default))
    }
}

impl<'c> Txn<'c> {
    pub fn conn(&self) -> &Connection {
        &self.guard
    }

    pub fn commit(mut self) -> Result<(), SyncError> {
        self.guard.execute_batch("COMMIT").map_err(SyncError::Catalog)?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), SyncError> {
        self.guard.execute_batch("ROLLBACK").map_err(SyncError::Catalog)?;
        self.finished = true;
        Ok(())
    }

    /// Commits and reopens a transaction in place, without handing back
    /// ownership — used by call sites (the scanner's recursive apply
    /// phase) that hold `&mut Txn` across many levels of recursion and
    /// can't move it out to use [`Txn::flush_and_continue`].
    pub fn flush(&mut self) -> Result<(), SyncError> {
        self.guard.execute_batch("COMMIT").map_err(SyncError::Catalog)?;
        self.guard.execute_batch("BEGIN IMMEDIATE").map_err(SyncError::Catalog)?;
        Ok(())
    }

    /// Commits and immediately reopens a fresh transaction on the same
    /// connection, used by the scanner's apply phase to flush every ~1000
    /// row mutations (§4.5) without holding one unbounded write transaction.
    pub fn flush_and_continue(self) -> Result<Txn<'c>, SyncError> {
        let guard = {
            self.guard.execute_batch("COMMIT").map_err(SyncError::Catalog)?;
            // SAFETY net for the borrow checker: `self.finished` must be set
            // before `self` drops so `Drop` doesn't also try to roll back.
            let Txn { guard, .. } = self;
            guard
        };
        guard.execute_batch("BEGIN IMMEDIATE").map_err(SyncError::Catalog)?;
        Ok(Txn {
            guard,
            finished: false,
        })
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.guard.execute_batch("ROLLBACK");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_commit_persists_rows() {
        let cat = Catalog::open_in_memory().unwrap();
        let txn = cat.begin().unwrap();
        txn.conn()
            .execute("INSERT INTO setting(id, value) VALUES ('usessl', '1')", [])
            .unwrap();
        txn.commit().unwrap();

        let count = cat
            .cell_int("SELECT COUNT(*) FROM setting WHERE id = 'usessl'", &[], 0)
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn dropped_txn_without_commit_rolls_back() {
        let cat = Catalog::open_in_memory().unwrap();
        {
            let txn = cat.begin().unwrap();
            txn.conn()
                .execute("INSERT INTO setting(id, value) VALUES ('usessl', '1')", [])
                .unwrap();
            // txn dropped here without commit
        }
        let count = cat
            .cell_int("SELECT COUNT(*) FROM setting WHERE id = 'usessl'", &[], 0)
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn try_begin_fails_while_another_writer_holds_the_catalog() {
        let cat = Catalog::open_in_memory().unwrap();
        let _txn = cat.begin().unwrap();
        assert!(cat.try_begin().is_none());
    }

    #[test]
    fn cell_int_returns_default_on_no_rows() {
        let cat = Catalog::open_in_memory().unwrap();
        let v = cat.cell_int("SELECT value FROM setting WHERE id = 'missing'", &[], -1);
        assert_eq!(v.unwrap(), -1);
    }
}
