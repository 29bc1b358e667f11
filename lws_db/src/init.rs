//! Schema creation and genesis checkpoint verification.

use tracing::info;

use crate::{blob32, Error, StorageConnection};

pub(crate) fn init_db(conn: &mut StorageConnection) -> Result<(), Error> {
    let network = conn.network;
    let txn = conn.write_txn()?;

    txn.execute_batch(
        "CREATE TABLE IF NOT EXISTS blocks (
            height INTEGER PRIMARY KEY,
            hash BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY,
            status INTEGER NOT NULL,
            spend_public BLOB NOT NULL,
            view_public BLOB NOT NULL,
            view_key BLOB NOT NULL,
            scan_height INTEGER NOT NULL,
            start_height INTEGER NOT NULL,
            access_time INTEGER NOT NULL,
            creation_time INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS accounts_by_address
            ON accounts (spend_public, view_public);
        CREATE TABLE IF NOT EXISTS outputs (
            account INTEGER NOT NULL REFERENCES accounts(id),
            height INTEGER NOT NULL,
            output_id INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            unlock_time INTEGER NOT NULL,
            mixin_count INTEGER NOT NULL,
            index_in_tx INTEGER NOT NULL,
            tx_hash BLOB NOT NULL,
            tx_prefix_hash BLOB NOT NULL,
            tx_public BLOB NOT NULL,
            ringct_mask BLOB NOT NULL,
            extra_and_length INTEGER NOT NULL,
            payment_id BLOB NOT NULL,
            PRIMARY KEY (account, height, output_id)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS spends (
            account INTEGER NOT NULL REFERENCES accounts(id),
            output_id INTEGER NOT NULL,
            key_image BLOB NOT NULL,
            height INTEGER NOT NULL,
            tx_hash BLOB NOT NULL,
            mixin_count INTEGER NOT NULL,
            PRIMARY KEY (output_id, key_image)
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS spends_by_account
            ON spends (account, height);
        CREATE TABLE IF NOT EXISTS requests (
            spend_public BLOB NOT NULL,
            view_public BLOB NOT NULL,
            view_key BLOB NOT NULL,
            start_height INTEGER NOT NULL,
            creation_time INTEGER NOT NULL,
            PRIMARY KEY (spend_public, view_public)
        ) WITHOUT ROWID;",
    )?;

    // Seed a fresh chain with the genesis checkpoint; verify an existing one
    // against it so a database cannot silently follow the wrong network.
    let genesis = network.genesis_hash();
    let stored = txn
        .query_row("SELECT hash FROM blocks WHERE height = 0", [], |row| {
            blob32(row, 0)
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match stored {
        None => {
            txn.execute(
                "INSERT INTO blocks (height, hash) VALUES (0, :hash)",
                rusqlite::named_params! {":hash": genesis.as_bytes().as_slice()},
            )?;
            info!("Seeded new database with {} genesis checkpoint", network);
        }
        Some(hash) if hash != *genesis.as_bytes() => {
            return Err(Error::BadBlockchain);
        }
        Some(_) => {}
    }

    txn.commit()?;
    Ok(())
}
