use failure::Fail;

pub type Result<T> = std::result::Result<T, NodeError>;

/// Everything that can go wrong inside the node. Recoverable conditions
/// (missing wallet, unreachable peer, bad address) are surfaced to the
/// caller; CLI commands print them and exit non-zero, server handlers
/// log and drop the offending request.
#[derive(Debug, Fail)]
pub enum NodeError {
    #[fail(display = "invalid address: {}", _0)]
    InvalidAddress(String),

    #[fail(display = "not enough funds: have {}, need {}", have, need)]
    InsufficientFunds { have: i64, need: i64 },

    #[fail(display = "previous transaction {} was not supplied", _0)]
    MissingPrevTx(String),

    #[fail(display = "invalid transaction: {}", _0)]
    InvalidTransaction(String),

    #[fail(display = "invalid block: {}", _0)]
    InvalidBlock(String),

    #[fail(display = "not found: {}", _0)]
    NotFound(String),

    #[fail(display = "protocol error: {}", _0)]
    Protocol(String),

    #[fail(display = "configuration error: {}", _0)]
    Config(String),

    #[fail(display = "storage error: {}", _0)]
    Storage(String),

    #[fail(display = "codec error: {}", _0)]
    Codec(String),

    #[fail(display = "io error: {}", _0)]
    Io(String),

    #[fail(display = "crypto error: {}", _0)]
    Crypto(String),

    #[fail(display = "clock error: {}", _0)]
    Clock(String),
}

impl From<sled::Error> for NodeError {
    fn from(err: sled::Error) -> NodeError {
        NodeError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for NodeError {
    fn from(err: bincode::Error) -> NodeError {
        NodeError::Codec(err.to_string())
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> NodeError {
        NodeError::Io(err.to_string())
    }
}

impl From<hex::FromHexError> for NodeError {
    fn from(err: hex::FromHexError) -> NodeError {
        NodeError::Codec(err.to_string())
    }
}

impl From<std::time::SystemTimeError> for NodeError {
    fn from(err: std::time::SystemTimeError) -> NodeError {
        NodeError::Clock(err.to_string())
    }
}
