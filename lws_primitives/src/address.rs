//! Public account addresses and their base58 string encoding.

use serde::{Deserialize, Serialize};

use crate::keys::PublicKey;
use crate::network::Network;

/// The two public halves of an account: the spend key and the view key.
///
/// This is the primary lookup key for accounts and pending creation
/// requests; the string form is network-tagged base58 with a checksum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountAddress {
    pub spend_public: PublicKey,
    pub view_public: PublicKey,
}

/// Reasons an address string failed to parse.
#[derive(Debug)]
pub enum AddressError {
    /// The string is not valid base58check.
    Base58(bs58::decode::Error),
    /// The payload decoded to the wrong number of bytes.
    BadLength(usize),
    /// The network tag byte belongs to a different network.
    WrongNetwork(u8),
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::Base58(e) => write!(f, "{}", e),
            AddressError::BadLength(len) => {
                write!(f, "address payload is {} bytes, expected 65", len)
            }
            AddressError::WrongNetwork(tag) => {
                write!(f, "address tag {:#04x} is for a different network", tag)
            }
        }
    }
}

impl std::error::Error for AddressError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AddressError::Base58(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bs58::decode::Error> for AddressError {
    fn from(e: bs58::decode::Error) -> Self {
        AddressError::Base58(e)
    }
}

impl AccountAddress {
    /// Encodes the address for `network` as base58check:
    /// `tag ‖ spend_public ‖ view_public` plus checksum.
    pub fn encode(&self, network: Network) -> String {
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(self.spend_public.as_bytes());
        payload.extend_from_slice(self.view_public.as_bytes());
        bs58::encode(payload)
            .with_check_version(network.address_prefix())
            .into_string()
    }

    /// Parses an address string, verifying the checksum and the network tag.
    pub fn decode(s: &str, network: Network) -> Result<Self, AddressError> {
        let payload = bs58::decode(s)
            .with_check(Some(network.address_prefix()))
            .into_vec()
            .map_err(|e| match e {
                // Surface a tag mismatch distinctly from garbage input.
                bs58::decode::Error::InvalidVersion { ver, .. } => {
                    AddressError::WrongNetwork(ver)
                }
                other => AddressError::Base58(other),
            })?;

        // with_check keeps the version byte at the front of the payload
        if payload.len() != 65 {
            return Err(AddressError::BadLength(payload.len()));
        }

        let mut spend = [0u8; 32];
        let mut view = [0u8; 32];
        spend.copy_from_slice(&payload[1..33]);
        view.copy_from_slice(&payload[33..65]);
        Ok(AccountAddress {
            spend_public: PublicKey::from_bytes(spend),
            view_public: PublicKey::from_bytes(view),
        })
    }
}
