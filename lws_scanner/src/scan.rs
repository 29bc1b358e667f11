//! The per-worker scan loop: block fetching, output matching and the
//! per-batch commit.

use tracing::{debug, info, warn};

use lws_db::{AccountUpdate, Storage};
use lws_primitives::{
    crypto::{self, Hash, Mask},
    data::{pack, BlockId, Extra, Output, OutputId, PaymentId},
};

use crate::account::Account;
use crate::client::DaemonClient;
use crate::proto::{
    self, BlockEntry, GetBlocksRequest, GetBlocksResponse, Transaction, TxInput, GET_BLOCKS_FAST,
};
use crate::{Cancel, Error, BLOCK_POLL_INTERVAL, BLOCK_RPC_TIMEOUT};

/// Streams blocks from the worker's slice minimum height, matches outputs
/// and spends for every user, and commits per batch.
///
/// Returns `Ok(())` to hand control back to the supervisor (reorg, drifted
/// accounts, misbehaving-but-recoverable peer). An unresponsive peer
/// surfaces as `DaemonConnectionFailure`, which the supervisor answers
/// with backoff and a fresh epoch; other errors stop the scanner.
pub(crate) fn scan_loop(
    cancel: Cancel,
    mut client: DaemonClient,
    storage: Storage,
    mut users: Vec<Account>,
) -> Result<(), Error> {
    debug_assert!(!users.is_empty());
    debug_assert!(users
        .windows(2)
        .all(|pair| pair[0].scan_height() <= pair[1].scan_height()));

    let mut conn = storage.connect()?;

    // `start_height == 0` makes the peer substitute a locator, so clamp;
    // genesis is never re-shipped.
    let mut request = GetBlocksRequest {
        start_height: u64::from(users[0].scan_height()).max(1),
        prune: false,
    };
    client.send_request(GET_BLOCKS_FAST, &request, &cancel)?;

    loop {
        cancel.check()?;

        // On a timeout the request is still outstanding at the peer, so
        // wait for the same response once more rather than queueing a
        // duplicate; a second miss hands the connection problem back to
        // the supervisor.
        let mut retried = false;
        let response: GetBlocksResponse = loop {
            match client.recv_response(BLOCK_RPC_TIMEOUT, &cancel) {
                Ok(response) => break response,
                Err(Error::DaemonConnectionFailure) if !retried => {
                    warn!("Block retrieval timeout, retrying");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        };

        if response.blocks.is_empty() {
            return Err(Error::PeerMismatch("daemon returned zero blocks"));
        }
        if response.start_height != request.start_height {
            warn!("Daemon sent wrong blocks, resetting state");
            return Ok(());
        }

        // Request the next run before scanning this one, overlapping the
        // last block so its hash anchors the next reorg check. Peer latency
        // hides behind the CPU-bound work below.
        request.start_height = response.start_height + response.blocks.len() as u64 - 1;
        client.send_request(GET_BLOCKS_FAST, &request, &cancel)?;

        if response.blocks.len() <= 1 {
            // at the chain tip; only the overlap came back
            cancel.wait(BLOCK_POLL_INTERVAL)?;
            continue;
        }

        if response.blocks.len() != response.output_indices.len() {
            return Err(Error::PeerMismatch("need same number of blocks and indices"));
        }

        // The first returned block is normally the overlap: its hash seeds
        // the commit anchor but it was scanned last round. A fresh account
        // at height zero gets a response starting at height 1 with no
        // overlap; the commit then anchors on the genesis checkpoint.
        let commit_anchor = users[0].scan_height();
        let skip = usize::from(response.start_height <= u64::from(commit_anchor));

        let mut blockchain: Vec<Hash> = Vec::with_capacity(response.blocks.len() + 1);
        if skip == 1 {
            blockchain.push(response.blocks[0].block.hash());
        } else {
            blockchain.push(conn.network().genesis_hash());
        }

        for (i, (entry, indices)) in response.blocks[skip..]
            .iter()
            .zip(&response.output_indices[skip..])
            .enumerate()
        {
            let height = BlockId::from_u64(response.start_height + (skip + i) as u64);
            scan_block(&mut users, height, entry, indices)?;
            blockchain.push(entry.block.hash());
        }

        let committed = {
            let updates: Vec<AccountUpdate<'_>> = users
                .iter()
                .map(|user| AccountUpdate {
                    id: user.id(),
                    scan_start: user.scan_height(),
                    outputs: user.outputs(),
                    spends: user.spends(),
                })
                .collect();
            conn.update(commit_anchor, &blockchain, &updates)
        };

        match committed {
            Ok(updated) => {
                info!(
                    "Processed {} block(s) against {} account(s)",
                    blockchain.len() - 1,
                    users.len()
                );
                if updated != users.len() {
                    warn!(
                        "Only updated {} account(s) out of {}, resetting",
                        updated,
                        users.len()
                    );
                    return Ok(());
                }
            }
            Err(lws_db::Error::BlockchainReorg) => {
                info!("Blockchain reorg detected, resetting state");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let tip =
            BlockId::from_u64(response.start_height + response.blocks.len() as u64 - 1);
        for user in &mut users {
            user.updated(tip);
        }
    }
}

fn scan_block(
    users: &mut [Account],
    height: BlockId,
    entry: &BlockEntry,
    indices: &[Vec<u64>],
) -> Result<(), Error> {
    let block = &entry.block;
    if block.tx_hashes.len() != entry.transactions.len() {
        return Err(Error::PeerMismatch("need same number of txes and tx hashes"));
    }
    let Some((miner_ids, tx_ids)) = indices.split_first() else {
        return Err(Error::PeerMismatch("missing coinbase tx indices"));
    };
    if tx_ids.len() != entry.transactions.len() {
        return Err(Error::PeerMismatch("need same number of txes and indices"));
    }

    scan_transaction(
        users,
        height,
        block.timestamp,
        None,
        &block.miner_tx,
        miner_ids,
        true,
    )?;
    for ((tx, tx_hash), ids) in entry
        .transactions
        .iter()
        .zip(&block.tx_hashes)
        .zip(tx_ids)
    {
        scan_transaction(users, height, block.timestamp, Some(*tx_hash), tx, ids, false)?;
    }
    Ok(())
}

/// Matches one transaction against every user: ring inputs against the
/// receive sets, outputs against the derived one-time keys.
///
/// The miner transaction is identified structurally (the block names it),
/// not inferred from the absence of ring inputs.
fn scan_transaction(
    users: &mut [Account],
    height: BlockId,
    timestamp: u64,
    tx_hash: Option<Hash>,
    tx: &Transaction,
    out_ids: &[u64],
    is_miner_tx: bool,
) -> Result<(), Error> {
    if 2 < tx.version {
        return Err(Error::PeerMismatch("unsupported transaction version"));
    }

    // partial parsing of the extra is tolerated, but without a tx public
    // key there is nothing to derive
    let extra = proto::parse_extra(&tx.extra);
    let Some(tx_public) = extra.tx_public else {
        return Ok(());
    };

    let mut tx_hash = tx_hash;
    let mut prefix_hash: Option<Hash> = None;

    for user in users.iter_mut() {
        if height <= user.scan_height() {
            continue; // to next user
        }

        let Some(derivation) = crypto::generate_key_derivation(&tx_public, user.view_key())
        else {
            warn!(address = user.address(), "key derivation failed, skipping user");
            continue;
        };

        let mut ring_size = 0usize;
        for input in &tx.inputs {
            if let TxInput::ToKey {
                key_offsets,
                key_image,
                ..
            } = input
            {
                ring_size = key_offsets.len();
                // the block already names the hash for non-miner txes, so
                // this computes nothing on the common path
                let spending_tx = *tx_hash.get_or_insert_with(|| tx.hash());
                user.check_spends(key_image, key_offsets, height, spending_tx);
            }
        }

        let base_flags = if is_miner_tx { Extra::Coinbase } else { Extra::None };

        for (index, out) in tx.outputs.iter().enumerate() {
            let candidate =
                crypto::derive_public_key(&derivation, index as u64, user.spend_public());
            if candidate.as_ref() != Some(&out.target) {
                continue; // to next output
            }

            let prefix = *prefix_hash.get_or_insert_with(|| tx.prefix_hash());
            let hash = *tx_hash.get_or_insert_with(|| tx.hash());

            let Some(&global_id) = out_ids.get(index) else {
                return Err(Error::PeerMismatch("missing global output index"));
            };

            let mut amount = out.amount;
            let mut mask = Mask([0u8; 32]);
            let mut flags = base_flags;
            if amount == 0 {
                let decoded = tx
                    .ringct
                    .as_ref()
                    .and_then(|rct| {
                        Some((rct.commitments.get(index)?, rct.encrypted_amounts.get(index)?))
                    })
                    .and_then(|(commitment, encrypted)| {
                        crypto::decode_amount(commitment, encrypted, &derivation, index as u64)
                    });
                match decoded {
                    Some((value, decoded_mask)) => {
                        amount = value;
                        mask = decoded_mask;
                        flags = flags.with_ringct();
                    }
                    None => {
                        warn!(
                            address = user.address(),
                            tx = %hash,
                            "failed to decrypt amount, skipping output"
                        );
                        continue; // to next output
                    }
                }
            }

            let (pid_length, payment_id) = match extra.payment_id {
                None => (0u8, PaymentId::NONE),
                Some(proto::ExtraPaymentId::Long(id)) => (32, PaymentId::from_long(id)),
                Some(proto::ExtraPaymentId::Short(id)) => (
                    8,
                    PaymentId::from_short(crypto::decrypt_payment_id(id, &derivation)),
                ),
            };

            debug!(
                address = user.address(),
                tx = %hash,
                amount,
                "found matching output"
            );
            user.add_out(Output {
                height,
                id: OutputId::from_u64(global_id),
                amount,
                timestamp,
                unlock_time: tx.unlock_time,
                mixin_count: u32::try_from(ring_size.max(1) - 1).unwrap_or(u32::MAX),
                index_in_tx: index as u32,
                tx_hash: hash,
                tx_prefix_hash: prefix,
                tx_public,
                ringct_mask: mask,
                extra: pack(flags, pid_length),
                payment_id,
            });
        } // for all tx outs
    } // for all users
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use curve25519_dalek::scalar::Scalar;
    use rand::RngCore;
    use tempfile::NamedTempFile;

    use lws_db::{AccountUpdate, Storage, StorageConnection};
    use lws_primitives::{
        crypto::{self, Hash, Mask},
        data::{self, unpack, BlockId, Extra, ExtraAndLength, OutputId, PaymentId},
        AccountAddress, KeyImage, Network, PublicKey, ViewKey,
    };

    use super::scan_loop;
    use crate::account::Account;
    use crate::client::DaemonClient;
    use crate::proto::{
        build_extra, Block, BlockEntry, ExtraPaymentId, GetBlocksResponse, RingctData,
        Transaction, TxInput, TxOutput,
    };
    use crate::{Cancel, Error};

    fn random_scalar_key() -> ViewKey {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        ViewKey::from_bytes(Scalar::from_bytes_mod_order(bytes).to_bytes())
    }

    struct TestWallet {
        view_key: ViewKey,
        address: AccountAddress,
    }

    fn wallet() -> TestWallet {
        let view_key = random_scalar_key();
        TestWallet {
            address: AccountAddress {
                spend_public: random_scalar_key().to_public(),
                view_public: view_key.to_public(),
            },
            view_key,
        }
    }

    /// A coinbase transaction paying `wallet` at output index 0.
    fn coinbase_tx(height: u64, wallet: &TestWallet, amount: u64) -> Transaction {
        let tx_key = random_scalar_key();
        let tx_public = tx_key.to_public();
        let derivation =
            crypto::generate_key_derivation(&wallet.address.view_public, &tx_key).unwrap();
        let target =
            crypto::derive_public_key(&derivation, 0, &wallet.address.spend_public).unwrap();
        Transaction {
            version: 1,
            unlock_time: 0,
            inputs: vec![TxInput::Gen { height }],
            outputs: vec![TxOutput { amount, target }],
            extra: build_extra(&tx_public, None),
            ringct: None,
        }
    }

    fn foreign_coinbase(height: u64) -> Transaction {
        coinbase_tx(height, &wallet(), 35)
    }

    /// A ringct transaction paying `wallet`, spending through the given
    /// ring, with a short encrypted payment id. Returns the expected
    /// decoded mask and the plaintext payment id alongside.
    fn ringct_tx(
        wallet: &TestWallet,
        amount: u64,
        offsets: Vec<u64>,
        key_image: KeyImage,
        plain_pid: [u8; 8],
    ) -> (Transaction, Mask, [u8; 8]) {
        let tx_key = random_scalar_key();
        let tx_public = tx_key.to_public();
        let derivation =
            crypto::generate_key_derivation(&wallet.address.view_public, &tx_key).unwrap();
        let target =
            crypto::derive_public_key(&derivation, 0, &wallet.address.spend_public).unwrap();
        let mask = crypto::commitment_mask(&derivation, 0);
        let commitment = crypto::commit(amount, &mask);
        let encrypted = crypto::encrypt_amount(amount, &derivation, 0);
        // the payment-id stream cipher is its own inverse
        let encrypted_pid = crypto::decrypt_payment_id(plain_pid, &derivation);
        let tx = Transaction {
            version: 2,
            unlock_time: 0,
            inputs: vec![TxInput::ToKey {
                amount: 0,
                key_offsets: offsets,
                key_image,
            }],
            outputs: vec![TxOutput { amount: 0, target }],
            extra: build_extra(&tx_public, Some(ExtraPaymentId::Short(encrypted_pid))),
            ringct: Some(RingctData {
                commitments: vec![commitment],
                encrypted_amounts: vec![encrypted],
            }),
        };
        (tx, Mask(mask.to_bytes()), plain_pid)
    }

    fn block_with(
        prev: Hash,
        timestamp: u64,
        miner_tx: Transaction,
        transactions: Vec<Transaction>,
    ) -> BlockEntry {
        let tx_hashes = transactions.iter().map(Transaction::hash).collect();
        BlockEntry {
            block: Block {
                major_version: 1,
                timestamp,
                prev_id: prev,
                nonce: 0,
                miner_tx,
                tx_hashes,
            },
            transactions,
        }
    }

    /// Builds blocks 1..=n on top of genesis and stores their hashes.
    fn build_stored_chain(conn: &mut StorageConnection, n: u64) -> Vec<BlockEntry> {
        let mut prev = Network::Testnet.genesis_hash();
        let entries: Vec<BlockEntry> = (1..=n)
            .map(|height| {
                let entry = block_with(
                    prev,
                    1_600_000_000 + height,
                    foreign_coinbase(height),
                    vec![],
                );
                prev = entry.block.hash();
                entry
            })
            .collect();
        let mut hashes = vec![Network::Testnet.genesis_hash()];
        hashes.extend(entries.iter().map(|entry| entry.block.hash()));
        conn.sync_chain(BlockId::from_u64(0), &hashes).unwrap();
        entries
    }

    /// A single-connection peer answering requests in order with the given
    /// results, then holding the socket open until the worker hangs up.
    fn spawn_peer(
        responses: Vec<serde_json::Value>,
    ) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            for result in responses {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    return;
                }
                let envelope: serde_json::Value = serde_json::from_str(&line).unwrap();
                let reply = serde_json::json!({"id": envelope["id"], "result": result});
                let mut bytes = serde_json::to_vec(&reply).unwrap();
                bytes.push(b'\n');
                writer.write_all(&bytes).unwrap();
            }
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) != 0 {
                line.clear();
            }
        });
        (addr, handle)
    }

    fn run_worker(
        addr: &str,
        storage: &Storage,
        users: Vec<Account>,
    ) -> (
        crossbeam_channel::Sender<()>,
        thread::JoinHandle<Result<(), Error>>,
    ) {
        let running = Arc::new(AtomicBool::new(true));
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        let cancel = Cancel::new(running, Some(cancel_rx));
        let client = DaemonClient::connect(addr).unwrap();
        let storage = storage.clone();
        let handle = thread::spawn(move || scan_loop(cancel, client, storage, users));
        (cancel_tx, handle)
    }

    fn wait_for_height(
        storage: &Storage,
        address: &AccountAddress,
        target: u64,
    ) -> data::Account {
        let mut conn = storage.connect().unwrap();
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let (_, account) = conn.start_read().unwrap().get_account(address).unwrap();
            if u64::from(account.scan_height) >= target {
                return account;
            }
            assert!(
                Instant::now() < deadline,
                "scan did not reach height {}",
                target
            );
            thread::sleep(Duration::from_millis(50));
        }
    }

    fn load_user(conn: &mut StorageConnection, network: Network, address: &AccountAddress) -> Account {
        let reader = conn.start_read().unwrap();
        let (_, account) = reader.get_account(address).unwrap();
        let received = reader.get_output_ids(account.id).unwrap();
        Account::new(network, &account, received)
    }

    #[test]
    fn scans_coinbase_output_for_fresh_account() {
        let file = NamedTempFile::new().unwrap();
        let storage = Storage::open(file.path(), Network::Testnet, 10).unwrap();
        let mut conn = storage.connect().unwrap();

        let user = wallet();
        let id = conn.add_account(&user.address, &user.view_key).unwrap();

        let b1 = block_with(
            Network::Testnet.genesis_hash(),
            1_600_000_001,
            coinbase_tx(1, &user, 6_000),
            vec![],
        );
        let b2 = block_with(b1.block.hash(), 1_600_000_002, foreign_coinbase(2), vec![]);
        let miner_hash = b1.block.miner_tx.hash();
        let b2_hash = b2.block.hash();

        let first = GetBlocksResponse {
            start_height: 1,
            blocks: vec![b1, b2.clone()],
            output_indices: vec![vec![vec![10]], vec![vec![11]]],
        };
        let tip_only = GetBlocksResponse {
            start_height: 2,
            blocks: vec![b2],
            output_indices: vec![vec![vec![11]]],
        };
        let (addr, peer) = spawn_peer(vec![
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&tip_only).unwrap(),
        ]);

        let users = vec![load_user(&mut conn, Network::Testnet, &user.address)];
        let (cancel_tx, worker) = run_worker(&addr, &storage, users);

        let account = wait_for_height(&storage, &user.address, 2);
        assert_eq!(u64::from(account.start_height), 0);

        let outputs = conn.start_read().unwrap().get_outputs(id).unwrap();
        assert_eq!(outputs.len(), 1);
        let out = &outputs[0];
        assert_eq!(u64::from(out.height), 1);
        assert_eq!(u64::from(out.id), 10);
        assert_eq!(out.amount, 6_000);
        assert_eq!(out.mixin_count, 0);
        assert_eq!(out.index_in_tx, 0);
        assert_eq!(out.tx_hash, miner_hash);
        assert_eq!(unpack(out.extra), (Extra::Coinbase, 0));

        let last = conn.start_read().unwrap().get_last_block().unwrap();
        assert_eq!(u64::from(last.id), 2);
        assert_eq!(last.hash, b2_hash);

        drop(cancel_tx);
        assert!(matches!(
            worker.join().unwrap(),
            Ok(()) | Err(Error::AbortScan)
        ));
        peer.join().unwrap();
    }

    #[test]
    fn decodes_ringct_amount_and_detects_spend() {
        let file = NamedTempFile::new().unwrap();
        let storage = Storage::open(file.path(), Network::Testnet, 10).unwrap();
        let mut conn = storage.connect().unwrap();

        let chain = build_stored_chain(&mut conn, 4);
        let user = wallet();
        let id = conn.add_account(&user.address, &user.view_key).unwrap();

        // The account already owns global output 100, received at height 4.
        let existing = data::Output {
            height: BlockId::from_u64(4),
            id: OutputId::from_u64(100),
            amount: 1_000,
            timestamp: 1_600_000_004,
            unlock_time: 0,
            mixin_count: 10,
            index_in_tx: 0,
            tx_hash: Hash([0xaa; 32]),
            tx_prefix_hash: Hash([0xbb; 32]),
            tx_public: PublicKey::from_bytes([0xcc; 32]),
            ringct_mask: Mask([0u8; 32]),
            extra: ExtraAndLength(0),
            payment_id: PaymentId::NONE,
        };
        let preload = [existing];
        let committed = conn
            .update(
                BlockId::from_u64(4),
                &[chain[3].block.hash()],
                &[AccountUpdate {
                    id,
                    scan_start: BlockId::from_u64(4),
                    outputs: &preload,
                    spends: &[],
                }],
            )
            .unwrap();
        assert_eq!(committed, 1);

        // Block 5 carries a ringct payment to the user, spending through a
        // ring whose offsets [90, 5, 5] name our output 100.
        let key_image = KeyImage::from_bytes([0x77; 32]);
        let (tx, expected_mask, plain_pid) =
            ringct_tx(&user, 123_000, vec![90, 5, 5], key_image, *b"invoice1");
        let spending_tx_hash = tx.hash();
        let b5 = block_with(
            chain[3].block.hash(),
            1_600_000_005,
            foreign_coinbase(5),
            vec![tx],
        );

        let first = GetBlocksResponse {
            start_height: 4,
            blocks: vec![chain[3].clone(), b5.clone()],
            output_indices: vec![vec![vec![99]], vec![vec![101], vec![200]]],
        };
        let tip_only = GetBlocksResponse {
            start_height: 5,
            blocks: vec![b5],
            output_indices: vec![vec![vec![101], vec![200]]],
        };
        let (addr, peer) = spawn_peer(vec![
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&tip_only).unwrap(),
        ]);

        let users = vec![load_user(&mut conn, Network::Testnet, &user.address)];
        let (cancel_tx, worker) = run_worker(&addr, &storage, users);

        wait_for_height(&storage, &user.address, 5);

        let reader = conn.start_read().unwrap();
        let outputs = reader.get_outputs(id).unwrap();
        assert_eq!(outputs.len(), 2);
        let found = &outputs[1];
        assert_eq!(u64::from(found.height), 5);
        assert_eq!(u64::from(found.id), 200);
        assert_eq!(found.amount, 123_000);
        assert_eq!(found.ringct_mask, expected_mask);
        assert_eq!(found.mixin_count, 2);
        assert_eq!(unpack(found.extra), (Extra::Ringct, 8));
        assert_eq!(found.payment_id.short(), plain_pid);

        let spends = reader.get_spends(OutputId::from_u64(100)).unwrap();
        assert_eq!(spends.len(), 1);
        assert_eq!(spends[0].key_image, key_image);
        assert_eq!(spends[0].mixin_count, 2);

        // the spend is attributed to the transaction that carried the ring
        let records = reader.get_account_spends(id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tx_hash, spending_tx_hash);
        assert_eq!(u64::from(records[0].height), 5);
        drop(reader);

        drop(cancel_tx);
        assert!(matches!(
            worker.join().unwrap(),
            Ok(()) | Err(Error::AbortScan)
        ));
        peer.join().unwrap();
    }

    #[test]
    fn reorged_overlap_aborts_without_commit() {
        let file = NamedTempFile::new().unwrap();
        let storage = Storage::open(file.path(), Network::Testnet, 10).unwrap();
        let mut conn = storage.connect().unwrap();

        let chain = build_stored_chain(&mut conn, 10);
        let user = wallet();
        let id = conn.add_account(&user.address, &user.view_key).unwrap();
        conn.rescan(BlockId::from_u64(8), &[user.address]).unwrap();

        // The peer reports a block 8 that differs from stored history.
        let fake_b8 = block_with(
            chain[6].block.hash(),
            1_999_999_999,
            foreign_coinbase(8),
            vec![],
        );
        assert_ne!(fake_b8.block.hash(), chain[7].block.hash());
        let fake_b9 = block_with(
            fake_b8.block.hash(),
            2_000_000_000,
            coinbase_tx(9, &user, 777),
            vec![],
        );

        let first = GetBlocksResponse {
            start_height: 8,
            blocks: vec![fake_b8, fake_b9],
            output_indices: vec![vec![vec![1]], vec![vec![2]]],
        };
        let (addr, peer) = spawn_peer(vec![serde_json::to_value(&first).unwrap()]);

        let users = vec![load_user(&mut conn, Network::Testnet, &user.address)];
        let (cancel_tx, worker) = run_worker(&addr, &storage, users);

        // The worker detects the reorg and returns to the supervisor.
        assert!(matches!(worker.join().unwrap(), Ok(())));

        let reader = conn.start_read().unwrap();
        let (_, account) = reader.get_account(&user.address).unwrap();
        assert_eq!(u64::from(account.scan_height), 8);
        assert!(reader.get_outputs(id).unwrap().is_empty());
        drop(reader);
        let last = conn.start_read().unwrap().get_last_block().unwrap();
        assert_eq!(u64::from(last.id), 10);
        assert_eq!(last.hash, chain[9].block.hash());

        drop(cancel_tx);
        peer.join().unwrap();
    }

    #[test]
    fn cancellation_interrupts_blocked_fetch() {
        let file = NamedTempFile::new().unwrap();
        let storage = Storage::open(file.path(), Network::Testnet, 10).unwrap();
        let mut conn = storage.connect().unwrap();

        build_stored_chain(&mut conn, 3);
        let user = wallet();
        conn.add_account(&user.address, &user.view_key).unwrap();

        // The peer reads the request but never answers.
        let (addr, peer) = spawn_peer(vec![]);

        let users = vec![load_user(&mut conn, Network::Testnet, &user.address)];
        let (cancel_tx, worker) = run_worker(&addr, &storage, users);

        thread::sleep(Duration::from_millis(300));
        let cancelled_at = Instant::now();
        drop(cancel_tx);

        assert!(matches!(worker.join().unwrap(), Err(Error::AbortScan)));
        assert!(cancelled_at.elapsed() < Duration::from_secs(5));

        // no commit happened for the in-flight batch
        let (_, account) = conn
            .start_read()
            .unwrap()
            .get_account(&user.address)
            .unwrap();
        assert_eq!(u64::from(account.scan_height), 3);
        peer.join().unwrap();
    }
}
