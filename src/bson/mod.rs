//! Binary document codec.
//!
//! This module converts between the in-memory [`Document`] model and the binary document format
//! spoken on the wire. Every message the driver exchanges with a server carries one or more of
//! these documents, so the codec is the foundation the [`protocol`](crate::protocol) layer is
//! built on.
//!
//! # Binary Format
//!
//! A document is laid out as:
//!
//! - A 4-byte little-endian total length, counting the length field itself and the trailing NUL.
//! - A sequence of elements, each a 1-byte type tag, a NUL-terminated key and a type-specific
//!   payload.
//! - A single trailing NUL byte.
//!
//! Decoding is strict: the declared length must equal the number of bytes consumed while parsing
//! the elements, and any violation fails the whole document. There is no partial recovery.
//!
//! # Arrays
//!
//! Arrays are documents whose keys are `"0"`, `"1"`, ... in order. On encode a
//! [`Value::Document`] whose keys form exactly that sequence is written as an array; documents
//! with any other key layout (including `"1", "0"` or `"00"`) stay documents.
//!
//! # Example
//! ```rust
//! use docwire::bson::{self, Value};
//! use docwire::doc;
//!
//! let document = doc! { "hello" => "world", "tags" => vec![Value::from(1), Value::from(2)] };
//! let bytes = bson::encode(&document).unwrap();
//! assert_eq!(bson::decode(&bytes).unwrap(), document);
//! ```
mod decode;
mod document;
mod encode;
mod oid;

pub use decode::{decode, decode_many};
pub use document::{Document, Value};
pub use encode::{encode, encode_many};
pub use oid::ObjectId;

pub(crate) use decode::Reader;
pub(crate) use encode::{encode_into, write_i32, write_i64};

/// Largest document accepted from the wire.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

pub mod element {
    pub(crate) const DOUBLE: u8 = 0x01;
    pub(crate) const STRING: u8 = 0x02;
    pub(crate) const DOCUMENT: u8 = 0x03;
    pub(crate) const ARRAY: u8 = 0x04;
    pub(crate) const BINARY: u8 = 0x05;
    pub(crate) const OBJECT_ID: u8 = 0x07;
    pub(crate) const BOOLEAN: u8 = 0x08;
    pub(crate) const DATE_TIME: u8 = 0x09;
    pub(crate) const NULL: u8 = 0x0A;
    pub(crate) const REGEX: u8 = 0x0B;
    pub(crate) const CODE: u8 = 0x0D;
    pub(crate) const CODE_WITH_SCOPE: u8 = 0x0F;
    pub(crate) const INT32: u8 = 0x10;
    pub(crate) const TIMESTAMP: u8 = 0x11;
    pub(crate) const INT64: u8 = 0x12;
    pub(crate) const MIN_KEY: u8 = 0xFF;
    pub(crate) const MAX_KEY: u8 = 0x7F;

    /// Binary subtype whose payload carries a redundant inner length.
    pub(crate) const BINARY_OLD: u8 = 0x02;

    pub(crate) const OBJECT_ID_SIZE: usize = 12;
}
