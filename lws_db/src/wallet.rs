//! Account, output, spend and request storage, and the scanner's atomic
//! `update` commit.

use std::time::SystemTime;

use rusqlite::{named_params, OptionalExtension, Row, Transaction};

use lws_primitives::{
    crypto::{Hash, Mask},
    data::{
        Account, AccountId, AccountStatus, AccountTime, BlockId, ExtraAndLength, Output, OutputId,
        PaymentId, RequestInfo, Spend,
    },
    keys::{key_check, KeyImage},
    AccountAddress, PublicKey, ViewKey,
};

use crate::{blob32, chain, decode_u64, encode_u64, Error, Reader, StorageConnection};

/// A candidate spend as recorded by the scanner: the spent output, the
/// height and hash of the spending transaction, and the spend data itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpendRecord {
    pub output: OutputId,
    pub height: BlockId,
    pub tx_hash: Hash,
    pub spend: Spend,
}

/// One account's contribution to a scanner commit.
#[derive(Clone, Copy)]
pub struct AccountUpdate<'a> {
    pub id: AccountId,
    /// The stored `scan_height` this batch was scanned from. If the stored
    /// row no longer matches (another writer advanced or rewound it), the
    /// account is skipped.
    pub scan_start: BlockId,
    pub outputs: &'a [Output],
    pub spends: &'a [SpendRecord],
}

fn current_time() -> Result<AccountTime, Error> {
    AccountTime::from_system_time(SystemTime::now()).ok_or(Error::SystemClockInvalidRange)
}

fn tip_height(txn: &Transaction<'_>) -> Result<u64, Error> {
    let height: Option<i64> = txn
        .query_row("SELECT MAX(height) FROM blocks", [], |row| row.get(0))
        .optional()?
        .flatten();
    height
        .map(decode_u64)
        .ok_or_else(|| Error::CorruptedData("blocks table is empty".into()))
}

fn read_account(row: &Row<'_>) -> rusqlite::Result<(u8, Account)> {
    Ok((
        row.get(1)?,
        Account {
            id: AccountId::from_u32(row.get(0)?),
            address: AccountAddress {
                spend_public: PublicKey::from_bytes(blob32(row, 2)?),
                view_public: PublicKey::from_bytes(blob32(row, 3)?),
            },
            view_key: ViewKey::from_bytes(blob32(row, 4)?),
            scan_height: BlockId::from_u64(decode_u64(row.get(5)?)),
            start_height: BlockId::from_u64(decode_u64(row.get(6)?)),
            last_access: AccountTime::from_u32(row.get(7)?),
            creation: AccountTime::from_u32(row.get(8)?),
        },
    ))
}

fn status_from_u8(value: u8) -> Result<AccountStatus, Error> {
    AccountStatus::from_u8(value)
        .ok_or_else(|| Error::CorruptedData(format!("unknown account status {}", value)))
}

fn read_output(row: &Row<'_>) -> rusqlite::Result<Output> {
    let mut payment_id = [0u8; 32];
    payment_id.copy_from_slice(&blob32(row, 12)?);
    Ok(Output {
        height: BlockId::from_u64(decode_u64(row.get(0)?)),
        id: OutputId::from_u64(decode_u64(row.get(1)?)),
        amount: decode_u64(row.get(2)?),
        timestamp: decode_u64(row.get(3)?),
        unlock_time: decode_u64(row.get(4)?),
        mixin_count: row.get(5)?,
        index_in_tx: row.get(6)?,
        tx_hash: Hash(blob32(row, 7)?),
        tx_prefix_hash: Hash(blob32(row, 8)?),
        tx_public: PublicKey::from_bytes(blob32(row, 9)?),
        ringct_mask: Mask(blob32(row, 10)?),
        extra: ExtraAndLength(row.get(11)?),
        payment_id: PaymentId(payment_id),
    })
}

impl Reader<'_> {
    /// Looks up an account by address.
    pub fn get_account(
        &self,
        address: &AccountAddress,
    ) -> Result<(AccountStatus, Account), Error> {
        let mut stmt = self.txn.prepare_cached(
            "SELECT id, status, spend_public, view_public, view_key,
                    scan_height, start_height, access_time, creation_time
             FROM accounts WHERE spend_public = :spend AND view_public = :view",
        )?;
        let row = stmt
            .query_row(
                named_params! {
                    ":spend": address.spend_public.as_bytes().as_slice(),
                    ":view": address.view_public.as_bytes().as_slice(),
                },
                read_account,
            )
            .optional()?;
        match row {
            Some((status, account)) => Ok((status_from_u8(status)?, account)),
            None => Err(Error::NoSuchAccount),
        }
    }

    /// All accounts with `status`, ordered by id.
    pub fn get_accounts(&self, status: AccountStatus) -> Result<Vec<Account>, Error> {
        let mut stmt = self.txn.prepare_cached(
            "SELECT id, status, spend_public, view_public, view_key,
                    scan_height, start_height, access_time, creation_time
             FROM accounts WHERE status = :status ORDER BY id",
        )?;
        let rows = stmt.query_map(
            named_params! {":status": status.to_u8()},
            |row| read_account(row).map(|(_, account)| account),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// An account's outputs in `(height, output_id)` order. Readers rely on
    /// this ordering.
    pub fn get_outputs(&self, id: AccountId) -> Result<Vec<Output>, Error> {
        let mut stmt = self.txn.prepare_cached(
            "SELECT height, output_id, amount, timestamp, unlock_time, mixin_count,
                    index_in_tx, tx_hash, tx_prefix_hash, tx_public, ringct_mask,
                    extra_and_length, payment_id
             FROM outputs WHERE account = :account ORDER BY height, output_id",
        )?;
        let rows = stmt.query_map(named_params! {":account": u32::from(id)}, read_output)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Just the global ids of an account's outputs, ascending. This is the
    /// scanner's receive set.
    pub fn get_output_ids(&self, id: AccountId) -> Result<Vec<OutputId>, Error> {
        let mut stmt = self.txn.prepare_cached(
            "SELECT output_id FROM outputs WHERE account = :account ORDER BY output_id",
        )?;
        let rows = stmt.query_map(named_params! {":account": u32::from(id)}, |row| {
            row.get::<_, i64>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(OutputId::from_u64(decode_u64(row?)));
        }
        Ok(out)
    }

    /// Candidate spends of one output, in key-image order.
    pub fn get_spends(&self, id: OutputId) -> Result<Vec<Spend>, Error> {
        let mut stmt = self.txn.prepare_cached(
            "SELECT key_image, mixin_count FROM spends
             WHERE output_id = :output ORDER BY key_image",
        )?;
        let rows = stmt.query_map(
            named_params! {":output": encode_u64(u64::from(id))},
            |row| {
                Ok(Spend {
                    key_image: KeyImage::from_bytes(blob32(row, 0)?),
                    mixin_count: row.get(1)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every candidate spend recorded against an account, in
    /// `(output_id, key_image)` order.
    pub fn get_account_spends(&self, id: AccountId) -> Result<Vec<SpendRecord>, Error> {
        let mut stmt = self.txn.prepare_cached(
            "SELECT output_id, height, tx_hash, key_image, mixin_count FROM spends
             WHERE account = :account ORDER BY output_id, key_image",
        )?;
        let rows = stmt.query_map(named_params! {":account": u32::from(id)}, |row| {
            Ok(SpendRecord {
                output: OutputId::from_u64(decode_u64(row.get(0)?)),
                height: BlockId::from_u64(decode_u64(row.get(1)?)),
                tx_hash: Hash(blob32(row, 2)?),
                spend: Spend {
                    key_image: KeyImage::from_bytes(blob32(row, 3)?),
                    mixin_count: row.get(4)?,
                },
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Pending creation requests, ordered by address bytes.
    pub fn get_requests(&self) -> Result<Vec<RequestInfo>, Error> {
        let mut stmt = self.txn.prepare_cached(
            "SELECT spend_public, view_public, view_key, start_height, creation_time
             FROM requests ORDER BY spend_public, view_public",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RequestInfo {
                address: AccountAddress {
                    spend_public: PublicKey::from_bytes(blob32(row, 0)?),
                    view_public: PublicKey::from_bytes(blob32(row, 1)?),
                },
                view_key: ViewKey::from_bytes(blob32(row, 2)?),
                start_height: BlockId::from_u64(decode_u64(row.get(3)?)),
                creation: AccountTime::from_u32(row.get(4)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Inserts a new active account, allocating the next id. Ids are never
/// reused: accounts are never deleted, so `MAX(id) + 1` is monotonic.
fn insert_account(
    txn: &Transaction<'_>,
    address: &AccountAddress,
    view_key: &ViewKey,
    start_height: u64,
    creation: AccountTime,
) -> Result<AccountId, Error> {
    if !key_check(address, view_key) {
        return Err(Error::BadViewKey);
    }

    let next_id: u32 = txn.query_row(
        "SELECT COALESCE(MAX(id), 0) + 1 FROM accounts",
        [],
        |row| row.get(0),
    )?;

    let access = current_time()?;
    txn.execute(
        "INSERT INTO accounts
            (id, status, spend_public, view_public, view_key,
             scan_height, start_height, access_time, creation_time)
         VALUES
            (:id, :status, :spend, :view, :key,
             :scan_height, :start_height, :access, :creation)",
        named_params! {
            ":id": next_id,
            ":status": AccountStatus::Active.to_u8(),
            ":spend": address.spend_public.as_bytes().as_slice(),
            ":view": address.view_public.as_bytes().as_slice(),
            ":key": view_key.as_bytes().as_slice(),
            ":scan_height": encode_u64(start_height),
            ":start_height": encode_u64(start_height),
            ":access": u32::from(access),
            ":creation": u32::from(creation),
        },
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            Error::AccountExists
        } else {
            e.into()
        }
    })?;
    Ok(AccountId::from_u32(next_id))
}

impl StorageConnection {
    /// Queues a creation request for `address`, to be accepted or rejected
    /// by an administrator (or immediately, when the server auto-accepts).
    ///
    /// Scanning will start at the current chain tip.
    pub fn creation_request(
        &mut self,
        address: &AccountAddress,
        view_key: &ViewKey,
    ) -> Result<(), Error> {
        if self.create_queue_max == 0 {
            return Err(Error::CreateQueueMax);
        }
        let queue_max = self.create_queue_max;
        let txn = self.write_txn()?;

        let exists: Option<u32> = txn
            .query_row(
                "SELECT id FROM accounts WHERE spend_public = :spend AND view_public = :view",
                named_params! {
                    ":spend": address.spend_public.as_bytes().as_slice(),
                    ":view": address.view_public.as_bytes().as_slice(),
                },
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(Error::AccountExists);
        }

        let pending: usize =
            txn.query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))?;
        if queue_max <= pending {
            return Err(Error::CreateQueueMax);
        }

        let start_height = tip_height(&txn)?;
        let creation = current_time()?;
        txn.execute(
            "INSERT INTO requests
                (spend_public, view_public, view_key, start_height, creation_time)
             VALUES (:spend, :view, :key, :start_height, :creation)",
            named_params! {
                ":spend": address.spend_public.as_bytes().as_slice(),
                ":view": address.view_public.as_bytes().as_slice(),
                ":key": view_key.as_bytes().as_slice(),
                ":start_height": encode_u64(start_height),
                ":creation": u32::from(creation),
            },
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::DuplicateRequest
            } else {
                e.into()
            }
        })?;

        txn.commit()?;
        Ok(())
    }

    /// Creates an active account directly, scanning from the current tip.
    /// Fails with `BadViewKey` when the key does not match the address.
    pub fn add_account(
        &mut self,
        address: &AccountAddress,
        view_key: &ViewKey,
    ) -> Result<AccountId, Error> {
        let txn = self.write_txn()?;
        let start_height = tip_height(&txn)?;
        let creation = current_time()?;
        let id = insert_account(&txn, address, view_key, start_height, creation)?;
        txn.commit()?;
        Ok(id)
    }

    /// Accepts pending creation requests for `addresses`, turning each into
    /// an active account scanning from its requested start height. Returns
    /// the addresses actually created; requests for addresses that raced
    /// into existence (or carry a bad key) are consumed without effect.
    pub fn accept_creation_requests(
        &mut self,
        addresses: &[AccountAddress],
    ) -> Result<Vec<AccountAddress>, Error> {
        let txn = self.write_txn()?;
        let mut created = Vec::with_capacity(addresses.len());

        for address in addresses {
            let request = txn
                .query_row(
                    "SELECT view_key, start_height, creation_time FROM requests
                     WHERE spend_public = :spend AND view_public = :view",
                    named_params! {
                        ":spend": address.spend_public.as_bytes().as_slice(),
                        ":view": address.view_public.as_bytes().as_slice(),
                    },
                    |row| {
                        Ok((
                            blob32(row, 0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, u32>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((key_bytes, start_height, creation)) = request else {
                continue;
            };

            txn.execute(
                "DELETE FROM requests WHERE spend_public = :spend AND view_public = :view",
                named_params! {
                    ":spend": address.spend_public.as_bytes().as_slice(),
                    ":view": address.view_public.as_bytes().as_slice(),
                },
            )?;

            let view_key = ViewKey::from_bytes(key_bytes);
            match insert_account(
                &txn,
                address,
                &view_key,
                decode_u64(start_height),
                AccountTime::from_u32(creation),
            ) {
                Ok(_) => created.push(*address),
                Err(Error::AccountExists) | Err(Error::BadViewKey) => continue,
                Err(e) => return Err(e),
            }
        }

        txn.commit()?;
        Ok(created)
    }

    /// Drops pending creation requests. Returns the addresses removed.
    pub fn reject_creation_requests(
        &mut self,
        addresses: &[AccountAddress],
    ) -> Result<Vec<AccountAddress>, Error> {
        let txn = self.write_txn()?;
        let mut rejected = Vec::with_capacity(addresses.len());
        for address in addresses {
            let removed = txn.execute(
                "DELETE FROM requests WHERE spend_public = :spend AND view_public = :view",
                named_params! {
                    ":spend": address.spend_public.as_bytes().as_slice(),
                    ":view": address.view_public.as_bytes().as_slice(),
                },
            )?;
            if removed != 0 {
                rejected.push(*address);
            }
        }
        txn.commit()?;
        Ok(rejected)
    }

    /// Moves accounts to `status`. Returns the addresses that were found.
    pub fn change_status(
        &mut self,
        status: AccountStatus,
        addresses: &[AccountAddress],
    ) -> Result<Vec<AccountAddress>, Error> {
        let txn = self.write_txn()?;
        let mut changed = Vec::with_capacity(addresses.len());
        for address in addresses {
            let updated = txn.execute(
                "UPDATE accounts SET status = :status
                 WHERE spend_public = :spend AND view_public = :view",
                named_params! {
                    ":status": status.to_u8(),
                    ":spend": address.spend_public.as_bytes().as_slice(),
                    ":view": address.view_public.as_bytes().as_slice(),
                },
            )?;
            if updated != 0 {
                changed.push(*address);
            }
        }
        txn.commit()?;
        Ok(changed)
    }

    /// Pulls accounts' scan and start heights down to at most `height`, so
    /// the scanner revisits older blocks for them. Returns the addresses
    /// that were found.
    pub fn rescan(
        &mut self,
        height: BlockId,
        addresses: &[AccountAddress],
    ) -> Result<Vec<AccountAddress>, Error> {
        let txn = self.write_txn()?;
        let mut updated = Vec::with_capacity(addresses.len());
        for address in addresses {
            let count = txn.execute(
                "UPDATE accounts
                 SET scan_height = MIN(scan_height, :height),
                     start_height = MIN(start_height, :height)
                 WHERE spend_public = :spend AND view_public = :view",
                named_params! {
                    ":height": encode_u64(u64::from(height)),
                    ":spend": address.spend_public.as_bytes().as_slice(),
                    ":view": address.view_public.as_bytes().as_slice(),
                },
            )?;
            if count != 0 {
                updated.push(*address);
            }
        }
        txn.commit()?;
        Ok(updated)
    }

    /// Stamps the account's last-access time with the current clock.
    pub fn update_access_time(&mut self, address: &AccountAddress) -> Result<(), Error> {
        let now = current_time()?;
        let txn = self.write_txn()?;
        let updated = txn.execute(
            "UPDATE accounts SET access_time = :access
             WHERE spend_public = :spend AND view_public = :view",
            named_params! {
                ":access": u32::from(now),
                ":spend": address.spend_public.as_bytes().as_slice(),
                ":view": address.view_public.as_bytes().as_slice(),
            },
        )?;
        if updated == 0 {
            return Err(Error::NoSuchAccount);
        }
        txn.commit()?;
        Ok(())
    }

    /// The scanner's commit: one write transaction covering the chain tail
    /// and every scanned account.
    ///
    /// `height` is the overlap block the batch was anchored on and `chain`
    /// the block hashes from that height upwards. If the stored hash at
    /// `height` is missing or differs, nothing is written and
    /// [`Error::BlockchainReorg`] is returned. Otherwise the tail is
    /// overwritten (and any longer stored tail pruned), each account whose
    /// stored `scan_height` still equals its `scan_start` has its pending
    /// outputs and spends appended and its height advanced, and the number
    /// of accounts actually updated is returned.
    pub fn update(
        &mut self,
        height: BlockId,
        chain: &[Hash],
        users: &[AccountUpdate<'_>],
    ) -> Result<usize, Error> {
        if chain.is_empty() {
            return if users.is_empty() {
                Ok(0)
            } else {
                Err(Error::BadBlockchain)
            };
        }

        let txn = self.write_txn()?;
        let start = u64::from(height);

        match chain::block_hash(&txn, start)? {
            Some(stored) if stored == *chain[0].as_bytes() => {}
            _ => return Err(Error::BlockchainReorg),
        }

        chain::append_hashes(&txn, start + 1, &chain[1..])?;
        let new_height = start + chain.len() as u64 - 1;
        txn.execute(
            "DELETE FROM blocks WHERE height > :height",
            named_params! {":height": encode_u64(new_height)},
        )?;

        let mut updated = 0usize;
        {
            let mut select_height = txn
                .prepare_cached("SELECT scan_height FROM accounts WHERE id = :id")?;
            let mut set_height = txn
                .prepare_cached("UPDATE accounts SET scan_height = :height WHERE id = :id")?;
            let mut insert_output = txn.prepare_cached(
                "INSERT OR IGNORE INTO outputs
                    (account, height, output_id, amount, timestamp, unlock_time,
                     mixin_count, index_in_tx, tx_hash, tx_prefix_hash, tx_public,
                     ringct_mask, extra_and_length, payment_id)
                 VALUES
                    (:account, :height, :output_id, :amount, :timestamp, :unlock_time,
                     :mixin_count, :index_in_tx, :tx_hash, :tx_prefix_hash, :tx_public,
                     :ringct_mask, :extra_and_length, :payment_id)",
            )?;
            let mut insert_spend = txn.prepare_cached(
                "INSERT OR IGNORE INTO spends
                    (account, output_id, key_image, height, tx_hash, mixin_count)
                 VALUES (:account, :output_id, :key_image, :height, :tx_hash, :mixin_count)",
            )?;

            for user in users {
                let stored: Option<i64> = select_height
                    .query_row(named_params! {":id": u32::from(user.id)}, |row| row.get(0))
                    .optional()?;
                // the account vanished from under us, or another writer
                // moved its height; the supervisor restarts in both cases
                let Some(stored) = stored else { continue };
                if decode_u64(stored) != u64::from(user.scan_start) {
                    continue;
                }

                for output in user.outputs {
                    insert_output.execute(named_params! {
                        ":account": u32::from(user.id),
                        ":height": encode_u64(u64::from(output.height)),
                        ":output_id": encode_u64(u64::from(output.id)),
                        ":amount": encode_u64(output.amount),
                        ":timestamp": encode_u64(output.timestamp),
                        ":unlock_time": encode_u64(output.unlock_time),
                        ":mixin_count": output.mixin_count,
                        ":index_in_tx": output.index_in_tx,
                        ":tx_hash": output.tx_hash.as_bytes().as_slice(),
                        ":tx_prefix_hash": output.tx_prefix_hash.as_bytes().as_slice(),
                        ":tx_public": output.tx_public.as_bytes().as_slice(),
                        ":ringct_mask": output.ringct_mask.as_bytes().as_slice(),
                        ":extra_and_length": output.extra.0,
                        ":payment_id": output.payment_id.0.as_slice(),
                    })?;
                }
                for record in user.spends {
                    insert_spend.execute(named_params! {
                        ":account": u32::from(user.id),
                        ":output_id": encode_u64(u64::from(record.output)),
                        ":key_image": record.spend.key_image.as_bytes().as_slice(),
                        ":height": encode_u64(u64::from(record.height)),
                        ":tx_hash": record.tx_hash.as_bytes().as_slice(),
                        ":mixin_count": record.spend.mixin_count,
                    })?;
                }
                set_height.execute(named_params! {
                    ":height": encode_u64(new_height),
                    ":id": u32::from(user.id),
                })?;
                updated += 1;
            }
        }

        txn.commit()?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use lws_primitives::{
        crypto::Hash,
        data::{AccountStatus, BlockId, OutputId},
    };

    use crate::testing::{
        address_for, open_storage, random_hash, random_view_key, sample_output, sample_spend,
    };
    use crate::{AccountUpdate, Error, SpendRecord, StorageConnection};

    /// Extends the stored chain to `height` with random hashes and returns
    /// the full stored chain, genesis first.
    fn grow_chain(conn: &mut StorageConnection, height: u64) -> Vec<Hash> {
        let genesis = conn.start_read().unwrap().get_last_block().unwrap();
        let mut chain = vec![genesis.hash];
        chain.extend((0..height).map(|_| random_hash()));
        conn.sync_chain(BlockId::from_u64(0), &chain).unwrap();
        chain
    }

    fn tables_snapshot(conn: &StorageConnection) -> (Vec<(i64, Vec<u8>)>, usize, usize, Vec<i64>) {
        let blocks = {
            let mut stmt = conn
                .conn
                .prepare("SELECT height, hash FROM blocks ORDER BY height")
                .unwrap();
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .unwrap();
            rows.map(|r| r.unwrap()).collect::<Vec<(i64, Vec<u8>)>>()
        };
        let outputs: usize = conn
            .conn
            .query_row("SELECT COUNT(*) FROM outputs", [], |r| r.get(0))
            .unwrap();
        let spends: usize = conn
            .conn
            .query_row("SELECT COUNT(*) FROM spends", [], |r| r.get(0))
            .unwrap();
        let heights = {
            let mut stmt = conn
                .conn
                .prepare("SELECT scan_height FROM accounts ORDER BY id")
                .unwrap();
            let rows = stmt.query_map([], |row| row.get(0)).unwrap();
            rows.map(|r| r.unwrap()).collect::<Vec<i64>>()
        };
        (blocks, outputs, spends, heights)
    }

    #[test]
    fn update_commits_outputs_and_advances_height() {
        let (_file, _storage, mut conn) = open_storage();
        let chain = grow_chain(&mut conn, 5);

        let key = random_view_key();
        let address = address_for(&key);
        let id = conn.add_account(&address, &key).unwrap();

        // The account starts at the tip (height 5); scan three more blocks.
        let new_chain = vec![chain[5], random_hash(), random_hash(), random_hash()];
        let outputs = vec![sample_output(6, 100, 5000), sample_output(7, 104, 7000)];
        let spends = vec![SpendRecord {
            output: OutputId::from_u64(100),
            height: BlockId::from_u64(7),
            tx_hash: random_hash(),
            spend: sample_spend(),
        }];
        let updated = conn
            .update(
                BlockId::from_u64(5),
                &new_chain,
                &[AccountUpdate {
                    id,
                    scan_start: BlockId::from_u64(5),
                    outputs: &outputs,
                    spends: &spends,
                }],
            )
            .unwrap();
        assert_eq!(updated, 1);

        let reader = conn.start_read().unwrap();
        let (status, account) = reader.get_account(&address).unwrap();
        assert_eq!(status, AccountStatus::Active);
        assert_eq!(u64::from(account.scan_height), 8);

        let stored = reader.get_outputs(id).unwrap();
        assert_eq!(stored, outputs);
        // every committed output is at or below the account's scan height
        assert!(stored
            .iter()
            .all(|out| out.height <= account.scan_height));

        // every committed spend references a stored output row
        for record in reader.get_account_spends(id).unwrap() {
            assert!(stored.iter().any(|out| out.id == record.output));
        }
        assert_eq!(
            reader.get_spends(OutputId::from_u64(100)).unwrap(),
            vec![spends[0].spend]
        );
    }

    #[test]
    fn update_with_mismatched_overlap_writes_nothing() {
        let (_file, _storage, mut conn) = open_storage();
        grow_chain(&mut conn, 10);

        let key = random_view_key();
        let address = address_for(&key);
        let id = conn.add_account(&address, &key).unwrap();

        let before = tables_snapshot(&conn);

        // Overlap hash at height 8 does not match storage.
        let outputs = vec![sample_output(9, 42, 1000)];
        let result = conn.update(
            BlockId::from_u64(8),
            &[random_hash(), random_hash()],
            &[AccountUpdate {
                id,
                scan_start: BlockId::from_u64(10),
                outputs: &outputs,
                spends: &[],
            }],
        );
        assert!(matches!(result, Err(Error::BlockchainReorg)));
        assert_eq!(tables_snapshot(&conn), before);
    }

    #[test]
    fn update_skips_users_whose_height_drifted() {
        let (_file, _storage, mut conn) = open_storage();
        let chain = grow_chain(&mut conn, 4);

        let key = random_view_key();
        let address = address_for(&key);
        let id = conn.add_account(&address, &key).unwrap();

        // Claim the batch was scanned from height 2; the stored row says 4.
        let updated = conn
            .update(
                BlockId::from_u64(4),
                &[chain[4], random_hash()],
                &[AccountUpdate {
                    id,
                    scan_start: BlockId::from_u64(2),
                    outputs: &[],
                    spends: &[],
                }],
            )
            .unwrap();
        assert_eq!(updated, 0);

        let reader = conn.start_read().unwrap();
        let (_, account) = reader.get_account(&address).unwrap();
        assert_eq!(u64::from(account.scan_height), 4);
        // the chain tail itself still advanced
        drop(reader);
        let last = conn.start_read().unwrap().get_last_block().unwrap();
        assert_eq!(u64::from(last.id), 5);
    }

    #[test]
    fn update_prunes_longer_stored_tail() {
        let (_file, _storage, mut conn) = open_storage();
        let chain = grow_chain(&mut conn, 10);

        // A commit anchored at 6 reporting only blocks 6..=8.
        let updated = conn
            .update(
                BlockId::from_u64(6),
                &[chain[6], random_hash(), random_hash()],
                &[],
            )
            .unwrap();
        assert_eq!(updated, 0);
        let last = conn.start_read().unwrap().get_last_block().unwrap();
        assert_eq!(u64::from(last.id), 8);
    }

    #[test]
    fn sync_chain_divergence_rewinds_accounts() {
        let (_file, _storage, mut conn) = open_storage();
        let chain = grow_chain(&mut conn, 4);

        let key = random_view_key();
        let address = address_for(&key);
        let id = conn.add_account(&address, &key).unwrap();

        // Scan two blocks and record an output in each.
        let outputs = vec![sample_output(5, 10, 100), sample_output(6, 11, 200)];
        let spends = vec![SpendRecord {
            output: OutputId::from_u64(10),
            height: BlockId::from_u64(6),
            tx_hash: random_hash(),
            spend: sample_spend(),
        }];
        conn.update(
            BlockId::from_u64(4),
            &[chain[4], random_hash(), random_hash()],
            &[AccountUpdate {
                id,
                scan_start: BlockId::from_u64(4),
                outputs: &outputs,
                spends: &spends,
            }],
        )
        .unwrap();

        // The peer's canonical chain replaces everything from height 6.
        conn.sync_chain(BlockId::from_u64(5), &[outputs_anchor(&conn, 5), random_hash()])
            .unwrap();

        let reader = conn.start_read().unwrap();
        let (_, account) = reader.get_account(&address).unwrap();
        assert_eq!(u64::from(account.scan_height), 5);
        let remaining = reader.get_outputs(id).unwrap();
        assert_eq!(remaining, vec![outputs[0].clone()]);
        assert!(reader.get_account_spends(id).unwrap().is_empty());
    }

    /// The stored hash at `height`, as a sync anchor.
    fn outputs_anchor(conn: &StorageConnection, height: u64) -> Hash {
        let hash: Vec<u8> = conn
            .conn
            .query_row(
                "SELECT hash FROM blocks WHERE height = ?1",
                [height as i64],
                |row| row.get(0),
            )
            .unwrap();
        Hash(<[u8; 32]>::try_from(hash.as_slice()).unwrap())
    }

    #[test]
    fn creation_requests_enforce_uniqueness_and_cap() {
        let (_file, _storage, mut conn) = open_storage();
        grow_chain(&mut conn, 3);

        let key = random_view_key();
        let address = address_for(&key);

        conn.creation_request(&address, &key).unwrap();
        assert!(matches!(
            conn.creation_request(&address, &key),
            Err(Error::DuplicateRequest)
        ));

        // An existing account short-circuits before the queue.
        let existing_key = random_view_key();
        let existing = address_for(&existing_key);
        conn.add_account(&existing, &existing_key).unwrap();
        assert!(matches!(
            conn.creation_request(&existing, &existing_key),
            Err(Error::AccountExists)
        ));

        // Fill the queue to its configured maximum of 10.
        for _ in 0..9 {
            let key = random_view_key();
            conn.creation_request(&address_for(&key), &key).unwrap();
        }
        let overflow_key = random_view_key();
        assert!(matches!(
            conn.creation_request(&address_for(&overflow_key), &overflow_key),
            Err(Error::CreateQueueMax)
        ));

        let requests = conn.start_read().unwrap().get_requests().unwrap();
        assert_eq!(requests.len(), 10);
        assert!(requests.iter().any(|r| r.address == address));
    }

    #[test]
    fn accept_creation_request_creates_scanning_account() {
        let (_file, _storage, mut conn) = open_storage();
        grow_chain(&mut conn, 7);

        let key = random_view_key();
        let address = address_for(&key);
        conn.creation_request(&address, &key).unwrap();

        let created = conn.accept_creation_requests(&[address]).unwrap();
        assert_eq!(created, vec![address]);

        let reader = conn.start_read().unwrap();
        let (status, account) = reader.get_account(&address).unwrap();
        assert_eq!(status, AccountStatus::Active);
        assert_eq!(account.view_key, key);
        // requested at tip height 7
        assert_eq!(u64::from(account.start_height), 7);
        assert_eq!(account.scan_height, account.start_height);
        drop(reader);

        assert!(conn.start_read().unwrap().get_requests().unwrap().is_empty());
    }

    #[test]
    fn rejected_requests_are_dropped() {
        let (_file, _storage, mut conn) = open_storage();

        let key = random_view_key();
        let address = address_for(&key);
        conn.creation_request(&address, &key).unwrap();

        assert_eq!(
            conn.reject_creation_requests(&[address]).unwrap(),
            vec![address]
        );
        assert!(conn.start_read().unwrap().get_requests().unwrap().is_empty());
        // rejecting again finds nothing
        assert!(conn.reject_creation_requests(&[address]).unwrap().is_empty());
    }

    #[test]
    fn add_account_rejects_mismatched_view_key() {
        let (_file, _storage, mut conn) = open_storage();

        let key = random_view_key();
        let other = random_view_key();
        let address = address_for(&key);
        assert!(matches!(
            conn.add_account(&address, &other),
            Err(Error::BadViewKey)
        ));
    }

    #[test]
    fn account_ids_are_not_reused() {
        let (_file, _storage, mut conn) = open_storage();

        let first_key = random_view_key();
        let first = conn.add_account(&address_for(&first_key), &first_key).unwrap();
        let second_key = random_view_key();
        let second = conn
            .add_account(&address_for(&second_key), &second_key)
            .unwrap();
        assert!(first < second);
        assert_eq!(u32::from(second), u32::from(first) + 1);
    }

    #[test]
    fn hidden_accounts_are_not_listed_as_active() {
        let (_file, _storage, mut conn) = open_storage();

        let key = random_view_key();
        let address = address_for(&key);
        conn.add_account(&address, &key).unwrap();

        assert_eq!(
            conn.change_status(AccountStatus::Hidden, &[address]).unwrap(),
            vec![address]
        );
        let reader = conn.start_read().unwrap();
        assert!(reader.get_accounts(AccountStatus::Active).unwrap().is_empty());
        let (status, _) = reader.get_account(&address).unwrap();
        assert_eq!(status, AccountStatus::Hidden);
    }

    #[test]
    fn rescan_pulls_heights_down_only() {
        let (_file, _storage, mut conn) = open_storage();
        grow_chain(&mut conn, 9);

        let key = random_view_key();
        let address = address_for(&key);
        conn.add_account(&address, &key).unwrap();

        conn.rescan(BlockId::from_u64(3), &[address]).unwrap();
        let reader = conn.start_read().unwrap();
        let (_, account) = reader.get_account(&address).unwrap();
        assert_eq!(u64::from(account.scan_height), 3);
        assert_eq!(u64::from(account.start_height), 3);
        drop(reader);

        // A later height never raises them back up.
        conn.rescan(BlockId::from_u64(50), &[address]).unwrap();
        let reader = conn.start_read().unwrap();
        let (_, account) = reader.get_account(&address).unwrap();
        assert_eq!(u64::from(account.scan_height), 3);
    }

    #[test]
    fn update_access_time_requires_account() {
        let (_file, _storage, mut conn) = open_storage();
        let key = random_view_key();
        assert!(matches!(
            conn.update_access_time(&address_for(&key)),
            Err(Error::NoSuchAccount)
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        /// Repeated commits with arbitrary batch sizes never decrease an
        /// account's scan height.
        #[test]
        fn scan_height_is_monotonic(batches in proptest::collection::vec(1u64..5, 1..6)) {
            let (_file, _storage, mut conn) = open_storage();
            let mut chain = grow_chain(&mut conn, 2);

            let key = random_view_key();
            let address = address_for(&key);
            let id = conn.add_account(&address, &key).unwrap();

            let mut last_height = 2u64;
            for batch in batches {
                let mut new_chain = vec![chain[last_height as usize]];
                new_chain.extend((0..batch).map(|_| random_hash()));
                chain.extend_from_slice(&new_chain[1..]);

                let updated = conn
                    .update(
                        BlockId::from_u64(last_height),
                        &new_chain,
                        &[AccountUpdate {
                            id,
                            scan_start: BlockId::from_u64(last_height),
                            outputs: &[],
                            spends: &[],
                        }],
                    )
                    .unwrap();
                prop_assert_eq!(updated, 1);

                let reader = conn.start_read().unwrap();
                let (_, account) = reader.get_account(&address).unwrap();
                let height = u64::from(account.scan_height);
                prop_assert!(height >= last_height);
                last_height = height;
            }
        }
    }
}
