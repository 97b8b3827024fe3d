use std::convert::From;
use std::error::Error;
use std::fmt;

pub type OpResult<T> = Result<T, OpError>;

///
/// Error raised anywhere in decoding, classification, chain tracking,
/// ledger materialization or queries.
///
/// `kind` tells callers which failure class they are looking at,
/// `message` accumulates diagnostic context (hash, path, offset)
/// while the error propagates.
///
#[derive(Debug)]
pub struct OpError {
    kind: OpErrorKind,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpErrorKind {
    /// truncated or malformed binary data
    ParseError,
    /// no script template matched an output script
    UnknownScript,
    /// no head candidate, cycle, or ambiguous head without selector
    ChainTopology,
    /// chain mutated in a way its contract forbids
    ChainUsage,
    /// history memory budget exhausted
    ResourceLimit,
    /// underlying persisted store failure or inconsistency
    StoreError,
    IoError,
    JsonError,
    RuntimeError,
}

impl OpError {
    pub fn new(kind: OpErrorKind) -> Self {
        OpError {
            kind,
            message: String::new(),
        }
    }

    pub fn kind(&self) -> OpErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prepend context to the message.
    pub fn join_msg(mut self, msg: &str) -> Self {
        if self.message.is_empty() {
            self.message = msg.to_owned();
        } else {
            self.message = format!("{}: {}", msg, self.message);
        }
        self
    }

    pub fn is_kind(&self, kind: OpErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for OpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpErrorKind::ParseError => "parse error",
            OpErrorKind::UnknownScript => "unknown script",
            OpErrorKind::ChainTopology => "invalid chain topology",
            OpErrorKind::ChainUsage => "incorrect chain usage",
            OpErrorKind::ResourceLimit => "resource limit exceeded",
            OpErrorKind::StoreError => "store error",
            OpErrorKind::IoError => "io error",
            OpErrorKind::JsonError => "json error",
            OpErrorKind::RuntimeError => "runtime error",
        };
        f.write_str(name)
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl Error for OpError {}

impl From<&str> for OpError {
    fn from(msg: &str) -> Self {
        OpError::new(OpErrorKind::RuntimeError).join_msg(msg)
    }
}

impl From<String> for OpError {
    fn from(msg: String) -> Self {
        OpError::new(OpErrorKind::RuntimeError).join_msg(&msg)
    }
}

impl From<std::io::Error> for OpError {
    fn from(err: std::io::Error) -> Self {
        OpError::new(OpErrorKind::IoError).join_msg(&err.to_string())
    }
}

impl From<serde_json::Error> for OpError {
    fn from(err: serde_json::Error) -> Self {
        OpError::new(OpErrorKind::JsonError).join_msg(&err.to_string())
    }
}

impl From<bincode::Error> for OpError {
    fn from(err: bincode::Error) -> Self {
        OpError::new(OpErrorKind::StoreError).join_msg(&err.to_string())
    }
}

impl From<bitcoin::hashes::hex::Error> for OpError {
    fn from(err: bitcoin::hashes::hex::Error) -> Self {
        OpError::new(OpErrorKind::ParseError).join_msg(&err.to_string())
    }
}

impl From<bitcoin::bech32::Error> for OpError {
    fn from(err: bitcoin::bech32::Error) -> Self {
        OpError::new(OpErrorKind::RuntimeError).join_msg(&err.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for OpError {
    fn from(err: rocksdb::Error) -> Self {
        OpError::new(OpErrorKind::StoreError).join_msg(&err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for OpError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        OpError::new(OpErrorKind::RuntimeError).join_msg("lock poisoned")
    }
}
