use std::error;
use std::fmt;

/// Errors produced by the storage layer.
///
/// The account-lifecycle variants (`AccountExists`, `NoSuchAccount`,
/// `DuplicateRequest`, `CreateQueueMax`, `BadViewKey`) are API-visible; the
/// chain variants are consumed by the scanner's recovery logic.
#[derive(Debug)]
pub enum Error {
    /// Tried to create an account that already exists.
    AccountExists,
    /// The account address is not in the database.
    NoSuchAccount,
    /// The address already has a creation request pending.
    DuplicateRequest,
    /// The pending-creation queue is at its configured maximum.
    CreateQueueMax,
    /// The supplied view key does not match the address.
    BadViewKey,
    /// Stored chain data is invalid or belongs to a different network.
    BadBlockchain,
    /// The chain diverged from stored hashes during an update.
    BlockchainReorg,
    /// The system clock is outside the storage format's range.
    SystemClockInvalidRange,
    /// A stored row failed to decode.
    CorruptedData(String),
    /// The underlying database failed.
    Database(rusqlite::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AccountExists => write!(f, "account already exists"),
            Error::NoSuchAccount => write!(f, "no such account"),
            Error::DuplicateRequest => write!(f, "a request for this address is already pending"),
            Error::CreateQueueMax => write!(f, "creation request queue is full"),
            Error::BadViewKey => write!(f, "view key does not match address"),
            Error::BadBlockchain => write!(f, "stored blockchain is invalid or wrong network"),
            Error::BlockchainReorg => write!(f, "blockchain reorg detected during update"),
            Error::SystemClockInvalidRange => {
                write!(f, "system clock is out of range for the storage format")
            }
            Error::CorruptedData(reason) => write!(f, "stored data is corrupted: {}", reason),
            Error::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e)
    }
}
