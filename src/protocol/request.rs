use crate::{
    bson::{Document, encode_into, write_i32, write_i64},
    error::{CursorError, Result},
};

use super::OpCode;

/// Bit flags carried by the opcode payloads.
pub mod flags {
    pub const INSERT_CONTINUE_ON_ERROR: i32 = 1;

    pub const UPDATE_UPSERT: i32 = 1;
    pub const UPDATE_MULTI: i32 = 1 << 1;

    pub const DELETE_SINGLE_REMOVE: i32 = 1;

    pub const QUERY_TAILABLE: i32 = 1 << 1;
    pub const QUERY_SLAVE_OK: i32 = 1 << 2;
    pub const QUERY_NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const QUERY_AWAIT_DATA: i32 = 1 << 5;
    pub const QUERY_EXHAUST: i32 = 1 << 6;
    pub const QUERY_PARTIAL: i32 = 1 << 7;
}

/// Body of a query message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage<'a> {
    pub namespace: &'a str,
    pub query: &'a Document,
    pub fields: Option<&'a Document>,
    pub skip: i32,
    /// Number of documents to return in the first batch. Negative asks the server to close the
    /// cursor after a single batch.
    pub limit: i32,
    pub flags: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request<'a> {
    Insert {
        namespace: &'a str,
        documents: &'a [Document],
        flags: i32,
    },
    Update {
        namespace: &'a str,
        selector: &'a Document,
        update: &'a Document,
        flags: i32,
    },
    Delete {
        namespace: &'a str,
        selector: &'a Document,
        flags: i32,
    },
    Query(QueryMessage<'a>),
    GetMore {
        namespace: &'a str,
        limit: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: &'a [i64],
    },
}

impl Request<'_> {
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Insert { .. } => OpCode::Insert,
            Request::Update { .. } => OpCode::Update,
            Request::Delete { .. } => OpCode::Delete,
            Request::Query(_) => OpCode::Query,
            Request::GetMore { .. } => OpCode::GetMore,
            Request::KillCursors { .. } => OpCode::KillCursors,
        }
    }

    /// Namespace the request addresses, if it addresses one.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Request::Insert { namespace, .. }
            | Request::Update { namespace, .. }
            | Request::Delete { namespace, .. }
            | Request::GetMore { namespace, .. }
            | Request::Query(QueryMessage { namespace, .. }) => Some(namespace),
            Request::KillCursors { .. } => None,
        }
    }

    /// Opcode-specific payload, everything after the message header.
    pub fn payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Request::Insert {
                namespace,
                documents,
                flags,
            } => {
                write_i32(&mut buf, *flags);
                write_cstring(&mut buf, namespace);
                for document in documents.iter() {
                    encode_into(&mut buf, document)?;
                }
            }
            Request::Update {
                namespace,
                selector,
                update,
                flags,
            } => {
                write_i32(&mut buf, 0);
                write_cstring(&mut buf, namespace);
                write_i32(&mut buf, *flags);
                encode_into(&mut buf, selector)?;
                encode_into(&mut buf, update)?;
            }
            Request::Delete {
                namespace,
                selector,
                flags,
            } => {
                write_i32(&mut buf, 0);
                write_cstring(&mut buf, namespace);
                write_i32(&mut buf, *flags);
                encode_into(&mut buf, selector)?;
            }
            Request::Query(message) => {
                write_i32(&mut buf, message.flags);
                write_cstring(&mut buf, message.namespace);
                write_i32(&mut buf, message.skip);
                write_i32(&mut buf, message.limit);
                encode_into(&mut buf, message.query)?;
                if let Some(fields) = message.fields {
                    encode_into(&mut buf, fields)?;
                }
            }
            Request::GetMore {
                namespace,
                limit,
                cursor_id,
            } => {
                write_i32(&mut buf, 0);
                write_cstring(&mut buf, namespace);
                write_i32(&mut buf, *limit);
                write_i64(&mut buf, *cursor_id);
            }
            Request::KillCursors { cursor_ids } => {
                if cursor_ids.is_empty() {
                    return Err(CursorError::InvalidArguments("no cursor ids".into()).into());
                }
                write_i32(&mut buf, 0);
                write_i32(&mut buf, cursor_ids.len() as i32);
                for id in cursor_ids.iter() {
                    write_i64(&mut buf, *id);
                }
            }
        }

        Ok(buf)
    }
}

/// Namespaces are produced by the driver from database and collection names, never from raw
/// bytes, so a NUL can only be a caller bug; it is cut off rather than smuggled into the frame.
fn write_cstring(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    buf.extend_from_slice(&bytes[..end]);
    buf.push(0);
}
