//! Network parameters, threaded as a value from process startup.

use crate::crypto::Hash;

/// The network a server instance scans. Selects the address tag byte and the
/// genesis checkpoint; every component receives this as a parameter rather
/// than reading process-global state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Stagenet,
}

impl Network {
    /// The base58check version byte for public addresses on this network.
    pub fn address_prefix(self) -> u8 {
        match self {
            Network::Mainnet => 0x12,
            Network::Testnet => 0x35,
            Network::Stagenet => 0x18,
        }
    }

    /// The hash of block 0. A fresh database is seeded with this checkpoint
    /// and an existing database is verified against it on open.
    pub fn genesis_hash(self) -> Hash {
        const MAINNET: [u8; 32] = [
            0x41, 0x80, 0x15, 0xbb, 0x9a, 0xe9, 0x82, 0xa1, 0x97, 0x5d, 0xa7, 0xd7, 0x92, 0x77,
            0xc2, 0x70, 0x57, 0x27, 0xa5, 0x68, 0x94, 0xba, 0x0f, 0xb2, 0x46, 0xad, 0xaa, 0xbb,
            0x1f, 0x46, 0x32, 0xe3,
        ];
        const TESTNET: [u8; 32] = [
            0x48, 0xca, 0x7c, 0xd3, 0xc8, 0xde, 0x5b, 0x6a, 0x4d, 0x53, 0xd2, 0x86, 0x1f, 0xbd,
            0xae, 0xdc, 0xa1, 0x41, 0x55, 0x35, 0x59, 0xf9, 0xbe, 0x95, 0x20, 0x06, 0x80, 0x53,
            0xcd, 0xa8, 0x43, 0x0b,
        ];
        const STAGENET: [u8; 32] = [
            0x76, 0xee, 0x3c, 0xc9, 0x86, 0x46, 0x29, 0x22, 0x06, 0xcd, 0x3e, 0x86, 0xf1, 0xd4,
            0xb0, 0x4f, 0x49, 0xbd, 0xbd, 0xfc, 0x88, 0x76, 0x47, 0xa7, 0x05, 0xae, 0x27, 0x1d,
            0x3a, 0xba, 0xf3, 0x6e,
        ];
        match self {
            Network::Mainnet => Hash(MAINNET),
            Network::Testnet => Hash(TESTNET),
            Network::Stagenet => Hash(STAGENET),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Stagenet => "stagenet",
        })
    }
}
