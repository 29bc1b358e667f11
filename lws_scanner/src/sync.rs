//! Chain-tip alignment with the peer before workers start.

use tracing::info;

use lws_db::StorageConnection;
use lws_primitives::data::BlockId;

use crate::client::DaemonClient;
use crate::proto::{GetHashesRequest, GetHashesResponse, GET_HASHES_FAST};
use crate::{Cancel, Error, SYNC_RPC_TIMEOUT};

/// Negotiates a common ancestor with the peer and replays its chain into
/// storage until both agree on the tip.
///
/// Each round sends the locator (newest known hash first, exponentially
/// sparser going back, genesis last); the peer answers with a run of hashes
/// from the common ancestor forward. Convergence is the peer returning
/// nothing new or ending on our tip.
pub(crate) fn sync_chain(
    conn: &mut StorageConnection,
    client: &mut DaemonClient,
    cancel: &Cancel,
) -> Result<(), Error> {
    info!("Starting blockchain sync with daemon");

    let mut known = conn.start_read()?.get_chain_sync()?;

    loop {
        if known.is_empty() {
            return Err(Error::BadBlockchain);
        }

        let request = GetHashesRequest {
            start_height: 0,
            known_hashes: known.clone(),
        };
        client.send_request(GET_HASHES_FAST, &request, cancel)?;
        let response: GetHashesResponse = client.recv_response(SYNC_RPC_TIMEOUT, cancel)?;

        if response.hashes.len() <= 1 || response.hashes.last() == Some(&known[0]) {
            return Ok(());
        }

        conn.sync_chain(BlockId::from_u64(response.start_height), &response.hashes)?;

        // Rebuild the locator from the returned tail and go around again.
        let genesis = *known.last().expect("checked non-empty above");
        known.clear();
        known.extend(response.hashes.iter().rev().take(10).copied());
        known.push(genesis);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    use rand::RngCore;
    use tempfile::NamedTempFile;

    use lws_db::Storage;
    use lws_primitives::{crypto::Hash, Network};

    use super::sync_chain;
    use crate::client::DaemonClient;
    use crate::Cancel;

    fn random_hash() -> Hash {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Hash(bytes)
    }

    /// A peer whose `get_hashes_fast` handler runs the given closure on
    /// each received locator.
    fn spawn_hash_peer(
        mut respond: impl FnMut(serde_json::Value) -> serde_json::Value + Send + 'static,
    ) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) != 0 {
                let envelope: serde_json::Value = serde_json::from_str(&line).unwrap();
                let result = respond(envelope["params"].clone());
                let reply = serde_json::json!({"id": envelope["id"], "result": result});
                let mut bytes = serde_json::to_vec(&reply).unwrap();
                bytes.push(b'\n');
                writer.write_all(&bytes).unwrap();
                line.clear();
            }
        });
        (addr, handle)
    }

    fn no_cancel() -> Cancel {
        Cancel::new(Arc::new(AtomicBool::new(true)), None)
    }

    #[test]
    fn empty_chain_converges_on_genesis() {
        let file = NamedTempFile::new().unwrap();
        let storage = Storage::open(file.path(), Network::Testnet, 10).unwrap();
        let mut conn = storage.connect().unwrap();

        let genesis = Network::Testnet.genesis_hash();
        let (addr, peer) = spawn_hash_peer(move |_| {
            serde_json::json!({"start_height": 0, "hashes": [genesis]})
        });

        let mut client = DaemonClient::connect(&addr).unwrap();
        sync_chain(&mut conn, &mut client, &no_cancel()).unwrap();

        let last = conn.start_read().unwrap().get_last_block().unwrap();
        assert_eq!(u64::from(last.id), 0);

        drop(client);
        peer.join().unwrap();
    }

    #[test]
    fn catches_up_over_multiple_rounds() {
        let file = NamedTempFile::new().unwrap();
        let storage = Storage::open(file.path(), Network::Testnet, 10).unwrap();
        let mut conn = storage.connect().unwrap();

        let genesis = Network::Testnet.genesis_hash();
        let h1 = random_hash();
        let h2 = random_hash();

        // First round hands out the chain from genesis; the second round
        // sees a locator led by the new tip and reports nothing newer.
        let (addr, peer) = spawn_hash_peer(move |params| {
            let newest = params["known_hashes"][0].as_str().unwrap().to_string();
            if newest == genesis.to_string() {
                serde_json::json!({"start_height": 0, "hashes": [genesis, h1, h2]})
            } else {
                assert_eq!(newest, h2.to_string());
                serde_json::json!({"start_height": 2, "hashes": [h2]})
            }
        });

        let mut client = DaemonClient::connect(&addr).unwrap();
        sync_chain(&mut conn, &mut client, &no_cancel()).unwrap();

        let last = conn.start_read().unwrap().get_last_block().unwrap();
        assert_eq!(u64::from(last.id), 2);
        assert_eq!(last.hash, h2);

        drop(client);
        peer.join().unwrap();
    }
}
