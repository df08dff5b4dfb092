//! A client driver for a document database's wire protocol.
//!
//! - [`bson`]: the binary document codec.
//! - [`protocol`]: message framing and the database operations built on it.
//! - [`connection`]: connection strings, replica-set discovery and read routing.
//! - [`cursor`]: batched iteration over query results.
pub mod bson;
pub mod cli;
pub mod command;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod protocol;

pub use bson::{Document, ObjectId, Value};
pub use cli::{execute, prompt};
pub use command::{Command, CommandError};
pub use connection::{
    ClientOptions, ConnectionManager, ConnectionString, ReadMode, ReadPreference,
};
pub use cursor::{Cursor, DocumentTransform};
pub use error::{Error, Result};
pub use protocol::{Protocol, WriteConcern};
