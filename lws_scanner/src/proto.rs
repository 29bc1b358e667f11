//! Wire types for the full-node peer, and the canonical hashing of blocks
//! and transactions.
//!
//! Requests and responses travel as JSON envelopes over the message socket;
//! 32-byte values are hex strings on the wire. The hashing here is what the
//! scanner stores in the block-info table and compares against the hashes
//! the peer reports from `get_hashes_fast`, so both must agree on it.

use serde::{Deserialize, Serialize};

use lws_primitives::{
    crypto::{keccak256, Commitment, EncryptedAmount, Hash},
    KeyImage, PublicKey,
};

pub const GET_HASHES_FAST: &str = "get_hashes_fast";
pub const GET_BLOCKS_FAST: &str = "get_blocks_fast";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetHashesRequest {
    pub start_height: u64,
    pub known_hashes: Vec<Hash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetHashesResponse {
    pub start_height: u64,
    pub hashes: Vec<Hash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlocksRequest {
    pub start_height: u64,
    pub prune: bool,
}

/// `output_indices[b][t]` lists the global output ids of transaction `t` in
/// block `b`; index `[b][0]` is the miner transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlocksResponse {
    pub start_height: u64,
    pub blocks: Vec<BlockEntry>,
    pub output_indices: Vec<Vec<Vec<u64>>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockEntry {
    pub block: Block,
    pub transactions: Vec<Transaction>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub major_version: u32,
    pub timestamp: u64,
    pub prev_id: Hash,
    pub nonce: u32,
    pub miner_tx: Transaction,
    pub tx_hashes: Vec<Hash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub unlock_time: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    #[serde(with = "hex_bytes")]
    pub extra: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ringct: Option<RingctData>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxInput {
    /// Miner (coinbase) input.
    Gen { height: u64 },
    /// A ring spend: offsets are cumulative, the first absolute.
    ToKey {
        amount: u64,
        key_offsets: Vec<u64>,
        key_image: KeyImage,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxOutput {
    pub amount: u64,
    /// The one-time stealth key.
    pub target: PublicKey,
}

/// Per-output commitment data for ringct transactions, index-aligned with
/// the output list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RingctData {
    pub commitments: Vec<Commitment>,
    pub encrypted_amounts: Vec<EncryptedAmount>,
}

impl Block {
    /// The canonical block hash: header fields, the miner transaction hash,
    /// and the transaction hash list.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(48 + 32 * (2 + self.tx_hashes.len()));
        buf.extend_from_slice(&self.major_version.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(self.prev_id.as_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(self.miner_tx.hash().as_bytes());
        for tx_hash in &self.tx_hashes {
            buf.extend_from_slice(tx_hash.as_bytes());
        }
        Hash(keccak256(&buf))
    }
}

impl Transaction {
    /// Hash of the prefix: version, unlock time, inputs, outputs and extra.
    pub fn prefix_hash(&self) -> Hash {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.unlock_time.to_le_bytes());
        for input in &self.inputs {
            match input {
                TxInput::Gen { height } => {
                    buf.push(0xff);
                    buf.extend_from_slice(&height.to_le_bytes());
                }
                TxInput::ToKey {
                    amount,
                    key_offsets,
                    key_image,
                } => {
                    buf.push(0x02);
                    buf.extend_from_slice(&amount.to_le_bytes());
                    buf.extend_from_slice(&(key_offsets.len() as u64).to_le_bytes());
                    for offset in key_offsets {
                        buf.extend_from_slice(&offset.to_le_bytes());
                    }
                    buf.extend_from_slice(key_image.as_bytes());
                }
            }
        }
        for output in &self.outputs {
            buf.extend_from_slice(&output.amount.to_le_bytes());
            buf.extend_from_slice(output.target.as_bytes());
        }
        buf.extend_from_slice(&self.extra);
        Hash(keccak256(&buf))
    }

    /// The full transaction hash: the prefix hash followed by a digest of
    /// the ringct data (zero for transactions without one).
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(self.prefix_hash().as_bytes());
        match &self.ringct {
            None => buf.extend_from_slice(&[0u8; 32]),
            Some(rct) => {
                let mut rct_buf = Vec::with_capacity(40 * rct.commitments.len());
                for commitment in &rct.commitments {
                    rct_buf.extend_from_slice(&commitment.0);
                }
                for amount in &rct.encrypted_amounts {
                    rct_buf.extend_from_slice(&amount.0);
                }
                buf.extend_from_slice(&keccak256(&rct_buf));
            }
        }
        Hash(keccak256(&buf))
    }
}

/// Transaction-extra field tags.
const EXTRA_TAG_PADDING: u8 = 0x00;
const EXTRA_TAG_PUB_KEY: u8 = 0x01;
const EXTRA_TAG_NONCE: u8 = 0x02;
const NONCE_TAG_LONG_PAYMENT_ID: u8 = 0x00;
const NONCE_TAG_SHORT_PAYMENT_ID: u8 = 0x01;

/// A payment id as found in the transaction extra. The short form is still
/// encrypted at this point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtraPaymentId {
    Long([u8; 32]),
    Short([u8; 8]),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsedExtra {
    pub tx_public: Option<PublicKey>,
    pub payment_id: Option<ExtraPaymentId>,
}

/// Parses the tagged fields of a transaction's extra bytes. Parsing is
/// tolerant: an unknown tag or truncated field ends the walk with whatever
/// was recognized so far, the way wallets treat malformed extras.
pub fn parse_extra(bytes: &[u8]) -> ParsedExtra {
    let mut parsed = ParsedExtra::default();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            EXTRA_TAG_PADDING => i += 1,
            EXTRA_TAG_PUB_KEY => {
                let Some(field) = bytes.get(i + 1..i + 33) else {
                    break;
                };
                if parsed.tx_public.is_none() {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(field);
                    parsed.tx_public = Some(PublicKey::from_bytes(key));
                }
                i += 33;
            }
            EXTRA_TAG_NONCE => {
                let Some(&len) = bytes.get(i + 1) else { break };
                let Some(nonce) = bytes.get(i + 2..i + 2 + len as usize) else {
                    break;
                };
                if parsed.payment_id.is_none() {
                    parsed.payment_id = parse_nonce(nonce);
                }
                i += 2 + len as usize;
            }
            _ => break,
        }
    }
    parsed
}

fn parse_nonce(nonce: &[u8]) -> Option<ExtraPaymentId> {
    match nonce.split_first()? {
        (&NONCE_TAG_LONG_PAYMENT_ID, rest) if rest.len() == 32 => {
            let mut id = [0u8; 32];
            id.copy_from_slice(rest);
            Some(ExtraPaymentId::Long(id))
        }
        (&NONCE_TAG_SHORT_PAYMENT_ID, rest) if rest.len() == 8 => {
            let mut id = [0u8; 8];
            id.copy_from_slice(rest);
            Some(ExtraPaymentId::Short(id))
        }
        _ => None,
    }
}

/// Builds the extra bytes for a transaction: the public key field plus an
/// optional payment-id nonce.
pub fn build_extra(tx_public: &PublicKey, payment_id: Option<ExtraPaymentId>) -> Vec<u8> {
    let mut out = Vec::with_capacity(33 + 35);
    out.push(EXTRA_TAG_PUB_KEY);
    out.extend_from_slice(tx_public.as_bytes());
    match payment_id {
        None => {}
        Some(ExtraPaymentId::Long(id)) => {
            out.push(EXTRA_TAG_NONCE);
            out.push(33);
            out.push(NONCE_TAG_LONG_PAYMENT_ID);
            out.extend_from_slice(&id);
        }
        Some(ExtraPaymentId::Short(id)) => {
            out.push(EXTRA_TAG_NONCE);
            out.push(9);
            out.push(NONCE_TAG_SHORT_PAYMENT_ID);
            out.extend_from_slice(&id);
        }
    }
    out
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
