use std::error;
use std::fmt;
use std::io;

/// Errors produced while fetching and scanning blocks.
#[derive(Debug)]
pub enum Error {
    /// Cooperative cancellation; never surfaced to users.
    AbortScan,
    /// The peer timed out or refused the connection.
    DaemonConnectionFailure,
    /// A peer response exceeded the frame buffer.
    ExceededBlockchainBuffer,
    /// No locator path to the peer's chain remains.
    BadBlockchain,
    /// The peer sent a response inconsistent with its own protocol.
    PeerMismatch(&'static str),
    /// A wire message failed to encode or decode.
    Wire(serde_json::Error),
    /// Socket-level failure.
    Io(io::Error),
    /// The storage layer failed.
    Db(lws_db::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AbortScan => write!(f, "scan aborted"),
            Error::DaemonConnectionFailure => write!(f, "daemon connection failure"),
            Error::ExceededBlockchainBuffer => {
                write!(f, "daemon response exceeded the blockchain buffer")
            }
            Error::BadBlockchain => write!(f, "no chain sync path with the daemon remains"),
            Error::PeerMismatch(reason) => write!(f, "bad daemon response: {}", reason),
            Error::Wire(e) => write!(f, "wire format error: {}", e),
            Error::Io(e) => write!(f, "socket error: {}", e),
            Error::Db(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Wire(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Db(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Wire(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<lws_db::Error> for Error {
    fn from(e: lws_db::Error) -> Self {
        Error::Db(e)
    }
}
