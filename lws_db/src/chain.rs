//! The persisted chain tail: locator construction, tip queries, and the
//! `sync_chain` replacement algorithm with account rollback on divergence.

use rusqlite::{named_params, Transaction};
use tracing::info;

use lws_primitives::{
    crypto::Hash,
    data::{BlockId, BlockInfo},
};

use crate::{blob32, decode_u64, encode_u64, Error, Reader, StorageConnection};

/// Reads the stored hash at `height`, if any.
pub(crate) fn block_hash(txn: &Transaction<'_>, height: u64) -> Result<Option<[u8; 32]>, Error> {
    let mut stmt = txn.prepare_cached("SELECT hash FROM blocks WHERE height = :height")?;
    let hash = stmt
        .query_row(named_params! {":height": encode_u64(height)}, |row| {
            blob32(row, 0)
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(hash)
}

/// Discards the stored chain from `height` upwards and rewinds every account
/// that had scanned past it: outputs and spends at or above the fork point
/// are deleted and scan heights pulled back to `height - 1`.
pub(crate) fn rollback_from(txn: &Transaction<'_>, height: u64) -> Result<(), Error> {
    let fork = encode_u64(height);
    let new_height = encode_u64(height.max(1) - 1);

    txn.execute(
        "DELETE FROM blocks WHERE height >= :height",
        named_params! {":height": fork},
    )?;
    txn.execute(
        "DELETE FROM outputs WHERE height >= :height",
        named_params! {":height": fork},
    )?;
    txn.execute(
        "DELETE FROM spends WHERE height >= :height",
        named_params! {":height": fork},
    )?;
    txn.execute(
        "UPDATE accounts
         SET scan_height = :new_height,
             start_height = MIN(start_height, :new_height)
         WHERE scan_height >= :height",
        named_params! {":new_height": new_height, ":height": fork},
    )?;
    Ok(())
}

pub(crate) fn append_hashes(
    txn: &Transaction<'_>,
    first: u64,
    hashes: &[Hash],
) -> Result<(), Error> {
    let mut stmt = txn.prepare_cached(
        "INSERT OR REPLACE INTO blocks (height, hash) VALUES (:height, :hash)",
    )?;
    for (i, hash) in hashes.iter().enumerate() {
        stmt.execute(named_params! {
            ":height": encode_u64(first + i as u64),
            ":hash": hash.as_bytes().as_slice(),
        })?;
    }
    Ok(())
}

impl Reader<'_> {
    /// The highest stored block.
    pub fn get_last_block(&self) -> Result<BlockInfo, Error> {
        self.txn
            .query_row(
                "SELECT height, hash FROM blocks ORDER BY height DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, blob32(row, 1)?)),
            )
            .map(|(height, hash)| BlockInfo {
                id: BlockId::from_u64(decode_u64(height)),
                hash: Hash(hash),
            })
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    Err(Error::CorruptedData("blocks table is empty".into()))
                }
                other => Err(other.into()),
            })
    }

    /// Builds the locator used to negotiate a common ancestor with the peer:
    /// the tip first, then hashes one factor-of-two step apart going back,
    /// ending at genesis. Heights pruned from the stored window are skipped.
    pub fn get_chain_sync(&self) -> Result<Vec<Hash>, Error> {
        let tip = u64::from(self.get_last_block()?.id);

        let mut heights = vec![tip];
        let mut step = 1u64;
        let mut height = tip;
        while heights.len() < 10 && height > step {
            height -= step;
            heights.push(height);
            step *= 2;
        }
        if *heights.last().expect("non-empty by construction") != 0 {
            heights.push(0);
        }

        let mut stmt = self
            .txn
            .prepare_cached("SELECT hash FROM blocks WHERE height = :height")?;
        let mut out = Vec::with_capacity(heights.len());
        for height in heights {
            let hash = stmt
                .query_row(named_params! {":height": encode_u64(height)}, |row| {
                    blob32(row, 0)
                })
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            if let Some(hash) = hash {
                out.push(Hash(hash));
            }
        }
        Ok(out)
    }
}

impl StorageConnection {
    /// Replaces the stored chain from `start` with `hashes`, atomically.
    ///
    /// The first hash must match the stored block at `start`
    /// (`BadBlockchain` otherwise — the locator negotiation guarantees the
    /// peer anchors its response on a block we know). Where the remainder
    /// diverges from stored history, everything from the divergent height
    /// upwards is rolled back, accounts included, before the replacement
    /// hashes are written.
    pub fn sync_chain(&mut self, start: BlockId, hashes: &[Hash]) -> Result<(), Error> {
        if hashes.is_empty() {
            return Err(Error::BadBlockchain);
        }

        let txn = self.write_txn()?;
        let start_height = u64::from(start);

        match block_hash(&txn, start_height)? {
            Some(stored) if stored == *hashes[0].as_bytes() => {}
            _ => return Err(Error::BadBlockchain),
        }

        let mut insert_from = hashes.len();
        for (i, hash) in hashes.iter().enumerate().skip(1) {
            let height = start_height + i as u64;
            match block_hash(&txn, height)? {
                Some(stored) if stored == *hash.as_bytes() => continue,
                Some(_) => {
                    info!("Stored chain diverges at height {}, rolling back", height);
                    rollback_from(&txn, height)?;
                    insert_from = i;
                    break;
                }
                None => {
                    insert_from = i;
                    break;
                }
            }
        }

        if insert_from < hashes.len() {
            append_hashes(
                &txn,
                start_height + insert_from as u64,
                &hashes[insert_from..],
            )?;
        }

        txn.commit()?;
        Ok(())
    }
}
