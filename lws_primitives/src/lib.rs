//! Core data model and cryptographic primitives for the light-wallet server.
//!
//! This crate defines the types shared by the storage layer and the chain
//! scanner: the opaque identifier newtypes, the persisted entities, the
//! public-address encoding, and the curve operations used to detect
//! view-key-owned outputs.
//!
//! Identifiers are deliberately distinct types with no implicit numeric
//! conversion between them; a [`data::BlockId`] can never be confused with an
//! [`data::OutputId`] at a call site. Arithmetic on heights and output
//! indices is performed on the raw integers via the explicit `From`
//! conversions.

pub mod address;
pub mod crypto;
pub mod data;
pub mod keys;
pub mod network;

pub use address::AccountAddress;
pub use crypto::Hash;
pub use keys::{KeyImage, PublicKey, ViewKey};
pub use network::Network;

pub(crate) mod serde_hex {
    //! Hex-string (de)serialization for fixed-size byte arrays on the wire.

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        <[u8; N]>::try_from(v.as_slice())
            .map_err(|_| serde::de::Error::custom(format!("expected {} hex bytes", N)))
    }
}
