//! Per-account in-memory scan state.

use std::sync::Arc;

use lws_db::SpendRecord;
use lws_primitives::{
    data::{self, AccountId, BlockId, Output, OutputId, Spend},
    AccountAddress, Hash, KeyImage, Network, PublicKey, ViewKey,
};

/// The parts of an account that never change while scanning, shared between
/// clones of the mutable state.
struct AccountInfo {
    address: String,
    id: AccountId,
    pubs: AccountAddress,
    view_key: ViewKey,
}

/// One account as held by a scan worker: immutable identity plus the
/// per-batch scratch that `update` commits.
///
/// `received` is the hot lookup set — every ring member of every scanned
/// transaction is tested against it. A sorted vector with binary search
/// beats a hash set at the typical per-account footprint and keeps the
/// lookups cache-friendly.
#[derive(Clone)]
pub struct Account {
    immutable: Arc<AccountInfo>,
    /// Global ids of all outputs known for this account, sorted.
    received: Vec<OutputId>,
    /// Outputs discovered in the current batch.
    outputs: Vec<Output>,
    /// Candidate spends discovered in the current batch.
    spends: Vec<SpendRecord>,
    scan_height: BlockId,
}

impl Account {
    /// Builds scan state from a stored account and its known output ids.
    pub fn new(network: Network, source: &data::Account, mut received: Vec<OutputId>) -> Self {
        received.sort_unstable();
        Account {
            immutable: Arc::new(AccountInfo {
                address: source.address.encode(network),
                id: source.id,
                pubs: source.address,
                view_key: source.view_key.clone(),
            }),
            received,
            outputs: Vec::new(),
            spends: Vec::new(),
            scan_height: source.scan_height,
        }
    }

    pub fn id(&self) -> AccountId {
        self.immutable.id
    }

    /// The printable address, for logging.
    pub fn address(&self) -> &str {
        &self.immutable.address
    }

    pub fn spend_public(&self) -> &PublicKey {
        &self.immutable.pubs.spend_public
    }

    pub fn view_key(&self) -> &ViewKey {
        &self.immutable.view_key
    }

    pub fn scan_height(&self) -> BlockId {
        self.scan_height
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn spends(&self) -> &[SpendRecord] {
        &self.spends
    }

    /// Records a newly detected output and adds its id to the receive set.
    pub fn add_out(&mut self, output: Output) {
        let id = output.id;
        self.outputs.push(output);
        if let Err(position) = self.received.binary_search(&id) {
            self.received.insert(position, id);
        }
    }

    /// Tests a ring input against the receive set. `offsets` are the ring
    /// member offsets as the peer produces them: cumulative, first absolute.
    /// Every reconstructed id that is one of ours is recorded as a candidate
    /// spend at `height` in the transaction `tx_hash`.
    pub fn check_spends(
        &mut self,
        key_image: &KeyImage,
        offsets: &[u64],
        height: BlockId,
        tx_hash: Hash,
    ) {
        let mixin = u32::try_from(offsets.len().max(1) - 1).unwrap_or(u32::MAX);

        let mut id = 0u64;
        for offset in offsets {
            id = id.saturating_add(*offset);
            if self.received.binary_search(&OutputId::from_u64(id)).is_ok() {
                self.spends.push(SpendRecord {
                    output: OutputId::from_u64(id),
                    height,
                    tx_hash,
                    spend: Spend {
                        key_image: *key_image,
                        mixin_count: mixin,
                    },
                });
            }
        }
    }

    /// Called after a successful commit: advances the scan height and drops
    /// the committed scratch.
    pub fn updated(&mut self, new_height: BlockId) {
        self.scan_height = new_height;
        self.outputs = Vec::new();
        self.spends = Vec::new();
    }
}
