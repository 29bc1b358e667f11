//! Public keys, key images, and the zeroized view-key scalar.

use curve25519_dalek::{edwards::EdwardsPoint, scalar::Scalar};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::address::AccountAddress;

/// A compressed Edwards point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "crate::serde_hex")] [u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A per-spend nullifier. Two spends of the same output share a key image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyImage(#[serde(with = "crate::serde_hex")] [u8; 32]);

impl KeyImage {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        KeyImage(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for KeyImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A 32-byte secret scalar enabling detection of owned outputs but not
/// spending them.
///
/// The view key doubles as the authorization bearer token for API calls, so
/// the backing memory is wiped on drop and equality is constant-time. The
/// raw bytes are reachable through [`ViewKey::as_bytes`] only because the
/// storage layer has to persist them; handle that accessor accordingly.
pub struct ViewKey([u8; 32]);

impl ViewKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ViewKey(bytes)
    }

    /// Parses a view key from its 64-character hex form, as submitted by API
    /// clients.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(ViewKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The public counterpart `k·G`.
    pub fn to_public(&self) -> PublicKey {
        let scalar = Scalar::from_bytes_mod_order(self.0);
        PublicKey(EdwardsPoint::mul_base(&scalar).compress().to_bytes())
    }
}

impl Clone for ViewKey {
    fn clone(&self) -> Self {
        ViewKey(self.0)
    }
}

impl PartialEq for ViewKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for ViewKey {}

impl Drop for ViewKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for ViewKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ViewKey(..)")
    }
}

/// Returns `true` iff `key·G` equals the view public half of `address`.
///
/// This is the whole of API authentication: presenting the correct view key
/// for an address proves the caller may read that account.
pub fn key_check(address: &AccountAddress, key: &ViewKey) -> bool {
    key.to_public()
        .as_bytes()
        .ct_eq(address.view_public.as_bytes())
        .into()
}
