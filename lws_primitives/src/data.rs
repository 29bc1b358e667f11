//! Persisted entities and the opaque identifier newtypes.
//!
//! The identifiers are fixed-width tags, not numbers: they compare and
//! order, but arithmetic is deliberately unavailable so that a height can
//! never be silently mixed with an output index or an account id. Where the
//! scanner genuinely needs height arithmetic it converts through `u64` at
//! the call site.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::address::AccountAddress;
use crate::crypto::{Hash, Mask};
use crate::keys::{KeyImage, PublicKey, ViewKey};

/// References an account stored in the database; faster than lookup by
/// address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(u32);

impl AccountId {
    /// Never refers to an account. All-ones, reserved.
    pub const INVALID: AccountId = AccountId(u32::MAX);

    pub const fn from_u32(v: u32) -> Self {
        AccountId(v)
    }
}

impl From<u32> for AccountId {
    fn from(v: u32) -> Self {
        AccountId(v)
    }
}

impl From<AccountId> for u32 {
    fn from(v: AccountId) -> u32 {
        v.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// References a block by chain height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(u64);

impl BlockId {
    pub const fn from_u64(v: u64) -> Self {
        BlockId(v)
    }
}

impl From<u64> for BlockId {
    fn from(v: u64) -> Self {
        BlockId(v)
    }
}

impl From<BlockId> for u64 {
    fn from(v: BlockId) -> u64 {
        v.0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// References a global output number, as assigned by the full node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(u64);

impl OutputId {
    pub const fn from_u64(v: u64) -> Self {
        OutputId(v)
    }
}

impl From<u64> for OutputId {
    fn from(v: u64) -> Self {
        OutputId(v)
    }
}

impl From<OutputId> for u64 {
    fn from(v: OutputId) -> u64 {
        v.0
    }
}

impl std::fmt::Display for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Seconds since the Unix epoch, in the storage format's 32-bit range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountTime(u32);

impl AccountTime {
    pub const fn from_u32(v: u32) -> Self {
        AccountTime(v)
    }

    /// Converts a system timestamp, returning `None` when it falls outside
    /// the representable range (the `SystemClockInvalidRange` condition).
    pub fn from_system_time(time: SystemTime) -> Option<Self> {
        let secs = time.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs();
        u32::try_from(secs).ok().map(AccountTime)
    }
}

impl From<u32> for AccountTime {
    fn from(v: u32) -> Self {
        AccountTime(v)
    }
}

impl From<AccountTime> for u32 {
    fn from(v: AccountTime) -> u32 {
        v.0
    }
}

impl std::fmt::Display for AccountTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Account visibility and scan eligibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountStatus {
    /// Actively scanned and reported by the API.
    Active,
    /// Not scanned, but still reported by the API.
    Inactive,
    /// Neither scanned nor reported.
    Hidden,
}

impl AccountStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            AccountStatus::Active => 0,
            AccountStatus::Inactive => 1,
            AccountStatus::Hidden => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AccountStatus::Active),
            1 => Some(AccountStatus::Inactive),
            2 => Some(AccountStatus::Hidden),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Hidden => "hidden",
        })
    }
}

/// A registered account as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    /// Last time `get_address_info` touched this account.
    pub last_access: AccountTime,
    pub address: AccountAddress,
    /// Doubles as the API authorization handle.
    pub view_key: ViewKey,
    /// Last block scanned for this account.
    pub scan_height: BlockId,
    /// Height the account began scanning at.
    pub start_height: BlockId,
    /// Time the account first appeared in the database.
    pub creation: AccountTime,
}

/// One entry of the persisted chain tail used for reorg detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: BlockId,
    pub hash: Hash,
}

/// Variant tag for an output's provenance, packed with the payment-id
/// length into a single byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extra {
    None,
    Coinbase,
    Ringct,
    CoinbaseAndRingct,
}

impl Extra {
    fn to_u8(self) -> u8 {
        match self {
            Extra::None => 0,
            Extra::Coinbase => 1,
            Extra::Ringct => 2,
            Extra::CoinbaseAndRingct => 3,
        }
    }

    /// Adds the ringct bit, preserving the coinbase bit.
    pub fn with_ringct(self) -> Extra {
        match self {
            Extra::None => Extra::Ringct,
            Extra::Coinbase => Extra::CoinbaseAndRingct,
            other => other,
        }
    }
}

/// `Extra` and the payment-id length packed into one byte: low 3 bits carry
/// the variant, high 5 bits the length (0, 8 or 32).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtraAndLength(pub u8);

/// Packs `extra` and a payment-id `length` into a single byte.
pub fn pack(extra: Extra, length: u8) -> ExtraAndLength {
    debug_assert!(length <= 32);
    ExtraAndLength((extra.to_u8() & 0x7) | (length << 3))
}

/// The inverse of [`pack`].
pub fn unpack(value: ExtraAndLength) -> (Extra, u8) {
    let extra = match value.0 & 0x7 {
        1 => Extra::Coinbase,
        2 => Extra::Ringct,
        3 => Extra::CoinbaseAndRingct,
        _ => Extra::None,
    };
    (extra, value.0 >> 3)
}

/// A payment id in its 32-byte storage form. The 8-byte short form occupies
/// the front of the buffer; the actual length lives in [`ExtraAndLength`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaymentId(pub [u8; 32]);

impl PaymentId {
    pub const NONE: PaymentId = PaymentId([0u8; 32]);

    pub fn from_short(short: [u8; 8]) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&short);
        PaymentId(bytes)
    }

    pub fn from_long(long: [u8; 32]) -> Self {
        PaymentId(long)
    }

    pub fn short(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.0[..8]);
        out
    }
}

/// An output received by an account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    pub height: BlockId,
    pub id: OutputId,
    pub amount: u64,
    pub timestamp: u64,
    /// Not always a timestamp; mirrors the chain value.
    pub unlock_time: u64,
    /// Ring size of the transaction, minus one.
    pub mixin_count: u32,
    /// Offset within the transaction.
    pub index_in_tx: u32,
    pub tx_hash: Hash,
    pub tx_prefix_hash: Hash,
    pub tx_public: PublicKey,
    /// Unencrypted commitment mask; all-zero for pre-ringct outputs.
    pub ringct_mask: Mask,
    pub extra: ExtraAndLength,
    pub payment_id: PaymentId,
}

/// A possible spend of a received output. Keyed by `(OutputId, key_image)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Spend {
    pub key_image: KeyImage,
    /// Ring size of the transaction spending the output, minus one.
    pub mixin_count: u32,
}

/// A pending account-creation request, keyed by address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestInfo {
    pub address: AccountAddress,
    pub view_key: ViewKey,
    pub start_height: BlockId,
    pub creation: AccountTime,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for Extra {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: ()) -> Self::Strategy {
            prop_oneof![
                Just(Extra::None),
                Just(Extra::Coinbase),
                Just(Extra::Ringct),
                Just(Extra::CoinbaseAndRingct),
            ]
            .boxed()
        }
    }

    proptest! {
        #[test]
        fn pack_unpack_round_trip(extra in any::<Extra>(), length in 0u8..=32) {
            prop_assert_eq!(unpack(pack(extra, length)), (extra, length));
        }
    }

    #[test]
    fn ringct_bit_preserves_coinbase() {
        assert_eq!(Extra::None.with_ringct(), Extra::Ringct);
        assert_eq!(Extra::Coinbase.with_ringct(), Extra::CoinbaseAndRingct);
        assert_eq!(Extra::Ringct.with_ringct(), Extra::Ringct);
        assert_eq!(
            Extra::CoinbaseAndRingct.with_ringct(),
            Extra::CoinbaseAndRingct
        );
    }

    #[test]
    fn short_payment_id_occupies_buffer_front() {
        let pid = PaymentId::from_short([9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(pid.short(), [9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(&pid.0[8..], &[0u8; 24]);
    }

    #[test]
    fn account_time_rejects_out_of_range() {
        use std::time::{Duration, SystemTime};

        let far_future = SystemTime::UNIX_EPOCH + Duration::from_secs(u64::from(u32::MAX) + 1);
        assert!(AccountTime::from_system_time(far_future).is_none());

        let epoch = SystemTime::UNIX_EPOCH;
        assert_eq!(
            AccountTime::from_system_time(epoch),
            Some(AccountTime::from_u32(0))
        );
    }
}
