//! `SQLite`-backed authoritative store.
//!
//! One relational database holds every governed table. `SQLite` runs in WAL
//! mode so readers proceed while a writer is active; writers that mutate
//! chained state (`audit_chain`, `tool_tokens.used_at`, decision state) do so
//! inside a transaction that covers both the read and the write.
//!
//! The [`Store`] handle is cheap to clone and safe to share across threads.
//! Callers needing multi-statement atomicity use [`Store::with_tx`], which
//! classifies `SQLITE_BUSY` into the retryable `store_conflict` kind and
//! retries with bounded backoff.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction};
use thiserror::Error;

use crate::error::{ErrorKind, GovernanceError};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Retry attempts for busy/conflict errors before giving up.
pub const CONFLICT_RETRIES: u32 = 5;

/// Base backoff between conflict retries.
const CONFLICT_BACKOFF: Duration = Duration::from_millis(10);

/// Errors from the storage layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Concurrent writers conflicted; the operation may be retried.
    #[error("write conflict after {attempts} attempts")]
    Conflict {
        /// How many attempts were made before giving up.
        attempts: u32,
    },

    /// A row failed to decode into its domain type.
    #[error("corrupt row in {table}: {reason}")]
    CorruptRow {
        /// Table containing the undecodable row.
        table: &'static str,
        /// Description of the decode failure.
        reason: String,
    },
}

impl From<StoreError> for GovernanceError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Conflict { .. } => Self::new(ErrorKind::StoreConflict, err.to_string()),
            StoreError::Database(db) if is_busy(db) => {
                Self::new(ErrorKind::StoreConflict, err.to_string())
            },
            StoreError::Database(_) | StoreError::CorruptRow { .. } => {
                Self::new(ErrorKind::StoreUnavailable, err.to_string())
            },
        }
    }
}

/// Returns true for `SQLITE_BUSY`/`SQLITE_LOCKED` class errors.
fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Shared handle to the authoritative `SQLite` database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Opens or creates the database at `path`, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened or the
    /// schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if initialization fails.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Locks the connection for a read or single-statement write.
    ///
    /// # Panics
    ///
    /// Panics if another thread panicked while holding the lock; that state
    /// is unrecoverable.
    #[must_use]
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Runs `f` inside an immediate transaction, retrying on conflict.
    ///
    /// The transaction acquires the write lock up front (`BEGIN IMMEDIATE`)
    /// so the read-then-write sequences in chain appends and CAS transitions
    /// observe a stable snapshot. `SQLITE_BUSY` failures are retried up to
    /// [`CONFLICT_RETRIES`] times with linear backoff.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] once retries are exhausted, or the
    /// first non-busy error from `f`.
    pub fn with_tx<T>(
        &self,
        mut f: impl FnMut(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        for attempt in 1..=CONFLICT_RETRIES {
            let mut conn = self.conn();
            let tx_result = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate);
            let tx = match tx_result {
                Ok(tx) => tx,
                Err(e) if is_busy(&e) => {
                    std::thread::sleep(CONFLICT_BACKOFF * attempt);
                    continue;
                },
                Err(e) => return Err(e.into()),
            };

            match f(&tx) {
                Ok(value) => {
                    tx.commit()?;
                    return Ok(value);
                },
                Err(StoreError::Database(e)) if is_busy(&e) => {
                    drop(tx);
                    std::thread::sleep(CONFLICT_BACKOFF * attempt);
                },
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Conflict {
            attempts: CONFLICT_RETRIES,
        })
    }
}
