//! *SQLite-backed storage for the light-wallet server.*
//!
//! The database holds the registered accounts, every view-key-owned output
//! and candidate spend the scanner has detected, the recent chain tail used
//! for reorg detection, and the queue of pending account-creation requests.
//!
//! # Concurrency
//!
//! The database runs in WAL mode: readers observe a consistent snapshot for
//! the lifetime of their read transaction while a single writer commits.
//! Each thread owns its own [`StorageConnection`] (obtained from the
//! cheaply-cloneable [`Storage`] handle); the scan workers commit through
//! [`StorageConnection::update`], which performs the entire batch as one
//! immediate transaction — a reader sees all of an update's effects or none
//! of them.
//!
//! Hot-path statements go through the connection's prepared-statement cache,
//! so a worker that polls on an interval reuses its compiled queries across
//! read transactions.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use lws_primitives::Network;

pub mod chain;
pub mod error;
mod init;
pub mod wallet;

pub use error::Error;
pub use wallet::{AccountUpdate, SpendRecord};

/// A handle to the database, cheap to clone and send across threads. Every
/// thread materializes its own connection with [`Storage::connect`].
#[derive(Clone)]
pub struct Storage {
    path: PathBuf,
    network: Network,
    create_queue_max: usize,
}

impl Storage {
    /// Opens (creating if necessary) the database at `path`, initializing
    /// the schema and verifying the genesis checkpoint for `network`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        network: Network,
        create_queue_max: usize,
    ) -> Result<Self, Error> {
        let storage = Storage {
            path: path.as_ref().to_owned(),
            network,
            create_queue_max,
        };
        let mut conn = storage.connect()?;
        init::init_db(&mut conn)?;
        Ok(storage)
    }

    /// Opens a connection for the calling thread.
    pub fn connect(&self) -> Result<StorageConnection, Error> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        Ok(StorageConnection {
            conn,
            network: self.network,
            create_queue_max: self.create_queue_max,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

/// A single thread's connection to the database.
pub struct StorageConnection {
    pub(crate) conn: Connection,
    pub(crate) network: Network,
    pub(crate) create_queue_max: usize,
}

impl StorageConnection {
    /// Begins a read snapshot. Dropping the reader releases it.
    pub fn start_read(&mut self) -> Result<Reader<'_>, Error> {
        let txn = self.conn.transaction()?;
        Ok(Reader { txn })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Begins an immediate write transaction; the engine serializes writers.
    pub(crate) fn write_txn(&mut self) -> Result<Transaction<'_>, Error> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

/// A snapshot-isolated read view of the database.
///
/// The reader keeps using the connection's statement cache, so a worker
/// re-opening readers on a polling interval does not recompile its queries.
pub struct Reader<'a> {
    pub(crate) txn: Transaction<'a>,
}

// u64 values (amounts, heights, global output ids) are stored as their
// two's-complement i64 bit pattern; SQLite INTEGER is 8 bytes either way.
pub(crate) fn encode_u64(value: u64) -> i64 {
    value as i64
}

pub(crate) fn decode_u64(value: i64) -> u64 {
    value as u64
}

pub(crate) fn blob32(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<[u8; 32]> {
    let bytes: Vec<u8> = row.get(idx)?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Blob,
            "expected a 32-byte blob".into(),
        )
    })
}
