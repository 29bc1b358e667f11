//! Curve and hashing primitives used for output detection.
//!
//! Every fallible operation returns `Option`; a `None` from any of these is
//! the `CryptoFailure` condition from the scanner's point of view, and the
//! affected output is skipped rather than aborting the batch.

use std::sync::OnceLock;

use curve25519_dalek::{
    edwards::{CompressedEdwardsY, EdwardsPoint},
    scalar::Scalar,
    traits::IsIdentity,
};
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};
use zeroize::Zeroize;

use crate::keys::{PublicKey, ViewKey};

/// A 32-byte Keccak-256 digest. Used for block hashes, transaction hashes
/// and transaction-prefix hashes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(#[serde(with = "crate::serde_hex")] pub [u8; 32]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// An unencrypted Pedersen commitment mask, stored alongside a decoded
/// ringct output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask(#[serde(with = "crate::serde_hex")] pub [u8; 32]);

impl Mask {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A Pedersen commitment to an output amount, as published on chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment(#[serde(with = "crate::serde_hex")] pub [u8; 32]);

/// An ECDH-encrypted output amount (8 bytes, XOR stream).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedAmount(#[serde(with = "crate::serde_hex")] pub [u8; 8]);

/// The shared secret `D = 8·(v·R)` between a transaction key and a view key,
/// in compressed form. All per-output derivations hash this value; like the
/// view key it came from, the buffer is wiped on drop.
#[derive(Clone)]
pub struct KeyDerivation([u8; 32]);

impl KeyDerivation {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for KeyDerivation {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

const ENCRYPTED_PAYMENT_ID_TAIL: u8 = 0x8d;

/// Computes the Keccak-256 digest of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

/// Hashes `data` to a scalar by reducing the Keccak-256 digest mod the group
/// order.
pub fn hash_to_scalar(data: &[u8]) -> Scalar {
    Scalar::from_bytes_mod_order(keccak256(data))
}

/// Appends the canonical varint encoding of `value` to `buf`.
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Computes the shared secret `D = 8·(v·R)` between the transaction public
/// key `R` and the view key `v`. Returns `None` if `R` is not a valid curve
/// point.
///
/// The same function serves the sender side: `8·(r·V)` yields an identical
/// secret for the transaction secret key `r` and view public `V`.
pub fn generate_key_derivation(tx_public: &PublicKey, view_key: &ViewKey) -> Option<KeyDerivation> {
    let point = CompressedEdwardsY(*tx_public.as_bytes()).decompress()?;
    let scalar = Scalar::from_bytes_mod_order(*view_key.as_bytes());
    let shared = (point * scalar).mul_by_cofactor();
    Some(KeyDerivation(shared.compress().to_bytes()))
}

/// The per-output scalar `Hs(D ‖ varint(index))`.
fn derivation_to_scalar(derivation: &KeyDerivation, index: u64) -> Scalar {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&derivation.0);
    write_varint(&mut buf, index);
    hash_to_scalar(&buf)
}

/// Computes the candidate one-time output key `Hs(D ‖ index)·G + S` for the
/// spend public key `S`. Returns `None` if `S` is not a valid curve point.
///
/// An output belongs to the account iff this equals the stealth key the
/// transaction published at `index`.
pub fn derive_public_key(
    derivation: &KeyDerivation,
    index: u64,
    spend_public: &PublicKey,
) -> Option<PublicKey> {
    let spend = CompressedEdwardsY(*spend_public.as_bytes()).decompress()?;
    let point = EdwardsPoint::mul_base(&derivation_to_scalar(derivation, index)) + spend;
    Some(PublicKey::from_bytes(point.compress().to_bytes()))
}

/// The secondary generator for amount commitments, obtained by
/// try-and-increment hashing of the basepoint encoding.
fn alt_generator() -> &'static EdwardsPoint {
    static H: OnceLock<EdwardsPoint> = OnceLock::new();
    H.get_or_init(|| {
        let mut candidate = keccak256(
            curve25519_dalek::constants::ED25519_BASEPOINT_COMPRESSED.as_bytes(),
        );
        loop {
            if let Some(point) = CompressedEdwardsY(candidate).decompress() {
                let point = point.mul_by_cofactor();
                if !point.is_identity() {
                    return point;
                }
            }
            candidate = keccak256(&candidate);
        }
    })
}

/// Commits to `amount` under `mask`: `mask·G + amount·H`.
pub fn commit(amount: u64, mask: &Scalar) -> Commitment {
    let point = EdwardsPoint::mul_base(mask) + alt_generator() * Scalar::from(amount);
    Commitment(point.compress().to_bytes())
}

/// Recomputes the commitment for a stored mask and decoded amount.
pub fn commitment_from_mask(mask: &Mask, amount: u64) -> Commitment {
    commit(amount, &Scalar::from_bytes_mod_order(mask.0))
}

/// The deterministic commitment mask for an output shared secret.
pub fn commitment_mask(derivation: &KeyDerivation, index: u64) -> Scalar {
    let shared = derivation_to_scalar(derivation, index);
    let mut buf = Vec::with_capacity(47);
    buf.extend_from_slice(b"commitment_mask");
    buf.extend_from_slice(shared.as_bytes());
    hash_to_scalar(&buf)
}

fn amount_mask(derivation: &KeyDerivation, index: u64) -> [u8; 8] {
    let shared = derivation_to_scalar(derivation, index);
    let mut buf = Vec::with_capacity(38);
    buf.extend_from_slice(b"amount");
    buf.extend_from_slice(shared.as_bytes());
    let digest = keccak256(&buf);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Encrypts `amount` for the output at `index` under the shared secret.
/// XOR stream, so this is its own inverse.
pub fn encrypt_amount(amount: u64, derivation: &KeyDerivation, index: u64) -> EncryptedAmount {
    let mask = amount_mask(derivation, index);
    let mut bytes = amount.to_le_bytes();
    for (b, m) in bytes.iter_mut().zip(mask.iter()) {
        *b ^= m;
    }
    EncryptedAmount(bytes)
}

/// Decrypts the amount and deterministic mask of a ringct output, verifying
/// the result against the published commitment.
///
/// Returns `None` when the decrypted pair does not re-commit to
/// `commitment`, which means the output was not actually encrypted to this
/// derivation (or the peer sent garbage).
pub fn decode_amount(
    commitment: &Commitment,
    encrypted: &EncryptedAmount,
    derivation: &KeyDerivation,
    index: u64,
) -> Option<(u64, Mask)> {
    let mask = commitment_mask(derivation, index);
    let stream = amount_mask(derivation, index);
    let mut bytes = encrypted.0;
    for (b, m) in bytes.iter_mut().zip(stream.iter()) {
        *b ^= m;
    }
    let amount = u64::from_le_bytes(bytes);

    if commit(amount, &mask) != *commitment {
        return None;
    }
    Some((amount, Mask(mask.to_bytes())))
}

/// Decrypts (or encrypts: the operation is symmetric) a short payment id
/// with the transaction shared secret.
pub fn decrypt_payment_id(payment_id: [u8; 8], derivation: &KeyDerivation) -> [u8; 8] {
    let mut buf = [0u8; 33];
    buf[..32].copy_from_slice(&derivation.0);
    buf[32] = ENCRYPTED_PAYMENT_ID_TAIL;
    let digest = keccak256(&buf);

    let mut out = payment_id;
    for (b, m) in out.iter_mut().zip(digest.iter()) {
        *b ^= m;
    }
    out
}
