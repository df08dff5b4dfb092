//! Error taxonomy for the driver.
//!
//! Every fallible operation returns [`Error`], which groups failures into the classes a caller
//! can act on differently:
//!
//! - [`ConnectionError`]: nothing reached the server, or the topology could not satisfy the
//!   request (bad connection string, unreachable seeds, replica-set mismatch, no member matched
//!   a read preference).
//! - [`CursorError`]: the server answered, but with an error document, or the reply did not
//!   belong to the request that was sent.
//! - [`Error::Timeout`]: a blocking receive exceeded its deadline. The socket involved is
//!   unusable afterwards and must be reconnected.
//! - [`ProtocolError`]: bytes on the wire violate the document or message format.
//! - [`EncodingError`]: a value cannot be represented in the document format.
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("[connection] {0}")]
    Connection(#[from] ConnectionError),

    #[error("[cursor] {0}")]
    Cursor(#[from] CursorError),

    #[error("[timeout] receive from '{host}' exceeded its deadline")]
    Timeout { host: String },

    #[error("[protocol] {0}")]
    Protocol(#[from] ProtocolError),

    #[error("[encoding] {0}")]
    Encoding(#[from] EncodingError),
}

impl Error {
    /// Whether retrying the operation on a fresh connection may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Connection(cause) => matches!(
                cause,
                ConnectionError::Connect { .. }
                    | ConnectionError::Io(_)
                    | ConnectionError::Unusable { .. }
            ),
            _ => false,
        }
    }

    /// The numeric code the server attached to an error document, if any.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Error::Cursor(CursorError::Server { code, .. }) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("malformed connection string '{uri}': {reason}")]
    MalformedUri { uri: String, reason: String },

    #[error("malformed host '{0}'")]
    MalformedHost(String),

    #[error("failed to resolve '{host}': {source}")]
    Resolve { host: String, source: io::Error },

    #[error("failed to connect to '{host}': {source}")]
    Connect { host: String, source: io::Error },

    #[error("no seed host reachable, last failure: {last}")]
    SeedsExhausted { last: String },

    #[error("replica set name mismatch: expected '{expected}', server reported '{found}'")]
    ReplicaSetMismatch { expected: String, found: String },

    #[error("replica set has no primary")]
    NoPrimary,

    #[error("no replica set member matches tagsets {tagsets}")]
    NoCandidate { tagsets: String },

    #[error("invalid read preference: {0}")]
    InvalidReadPreference(String),

    #[error("connection to '{host}' is unusable and must be re-established")]
    Unusable { host: String },

    #[error("not connected")]
    NotConnected,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("{message} (code {code})")]
    Server { message: String, code: i32 },

    #[error("response to request {found} does not match request {expected}")]
    ResponseMismatch { expected: i32, found: i32 },

    #[error("cursor {0} not found on server")]
    NotFound(i64),

    #[error("invalid cursor arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("document declares {declared} bytes but {consumed} were consumed")]
    LengthMismatch { declared: usize, consumed: usize },

    #[error("unknown element type 0x{0:02x}")]
    UnknownType(u8),

    #[error("unknown opcode {0}")]
    UnknownOpcode(i32),

    #[error("unexpected end of input while reading {0}")]
    Truncated(&'static str),

    #[error("missing terminator while reading {0}")]
    MissingTerminator(&'static str),

    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("invalid message header length {0}")]
    InvalidHeader(i32),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("string is not valid UTF-8")]
    NonUtf8String,

    #[error("key '{0}' contains a NUL byte")]
    KeyContainsNul(String),

    #[error("invalid object id '{0}'")]
    InvalidObjectId(String),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Connection(ConnectionError::Io(value))
    }
}
