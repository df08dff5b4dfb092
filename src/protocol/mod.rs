//! Wire protocol between the driver and a database server.
//!
//! This module defines how operations are packed into framed messages, exchanged over a socket,
//! and how replies are turned back into documents. It sits directly on top of the
//! [`bson`](crate::bson) codec and underneath the [`connection`](crate::connection) manager.
//!
//! # Overview
//!
//! Every message starts with a 16-byte header followed by an opcode-specific payload:
//!
//! - total message length, including the header
//! - request id, issued by the sending transport
//! - response-to, the request id a reply answers (zero on requests)
//! - opcode
//!
//! All integers are little-endian. Only one call is in flight per socket; replies are matched to
//! requests by the response-to field and a mismatch is fatal for the call.
//!
//! # Key Components
//!
//! - [`ProtocolTransport`]: framing, request ids, receive timeouts.
//! - [`Request`]: opcode payloads for insert, update, delete, query, get-more and kill-cursors.
//! - [`Reply`]: the reply sub-header and its documents.
//! - [`Protocol`]: the operations above, plus write acknowledgment via [`WriteConcern`].
//!
//! # Writes
//!
//! Writes have no reply of their own. When the write concern asks for acknowledgment, a
//! `getlasterror` query is appended to the same outbound buffer and its reply is awaited. At the
//! weakest level (`w: 0`, no journal wait) nothing is awaited at all.
//!
//! # See Also
//!
//! - [`cursor`](crate::cursor): batches query results using [`Protocol::query`] and
//!   [`Protocol::get_more`].
pub mod commands;
mod request;
mod response;
mod transport;
mod write_concern;

use std::{
    net::TcpStream,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    bson::Document,
    error::{CursorError, ProtocolError, Result},
};

pub use request::{QueryMessage, Request, flags};
pub use response::{REPLY_CURSOR_NOT_FOUND, REPLY_QUERY_FAILURE, Reply};
pub use transport::{HEADER_SIZE, MAX_MESSAGE_SIZE, MessageHeader, ProtocolTransport, Socket};
pub use write_concern::{Acknowledgment, WriteConcern};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
}

impl TryFrom<i32> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

impl From<OpCode> for i32 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
        }
    }
}

/// Database operations over one socket.
pub struct Protocol<T: Socket = TcpStream> {
    transport: ProtocolTransport<T>,
    write_concern: WriteConcern,
    timeout: Option<Duration>,
}

impl<T: Socket> Protocol<T> {
    pub fn new(transport: ProtocolTransport<T>) -> Self {
        Self {
            transport,
            write_concern: WriteConcern::default(),
            timeout: None,
        }
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    /// Receive timeout applied to every call that waits for a reply. `None` blocks indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn host(&self) -> &str {
        self.transport.host()
    }

    pub fn is_usable(&self) -> bool {
        self.transport.is_usable()
    }

    pub fn write_concern(&self) -> &WriteConcern {
        &self.write_concern
    }

    /// Inserts documents. Returns the acknowledgment document, or `None` when the write concern
    /// asked for none.
    pub fn insert(
        &mut self,
        namespace: &str,
        documents: &[Document],
        flags: i32,
        write_concern: Option<&WriteConcern>,
    ) -> Result<Option<Document>> {
        self.write(
            Request::Insert {
                namespace,
                documents,
                flags,
            },
            write_concern,
        )
    }

    pub fn update(
        &mut self,
        namespace: &str,
        selector: &Document,
        update: &Document,
        flags: i32,
        write_concern: Option<&WriteConcern>,
    ) -> Result<Option<Document>> {
        self.write(
            Request::Update {
                namespace,
                selector,
                update,
                flags,
            },
            write_concern,
        )
    }

    pub fn delete(
        &mut self,
        namespace: &str,
        selector: &Document,
        flags: i32,
        write_concern: Option<&WriteConcern>,
    ) -> Result<Option<Document>> {
        self.write(
            Request::Delete {
                namespace,
                selector,
                flags,
            },
            write_concern,
        )
    }

    pub fn query(&mut self, message: QueryMessage<'_>, timeout: Option<Duration>) -> Result<Reply> {
        debug!(
            "query {} skip={} limit={} on {}",
            message.namespace,
            message.skip,
            message.limit,
            self.host()
        );
        self.read(&Request::Query(message), timeout)
    }

    pub fn get_more(
        &mut self,
        namespace: &str,
        limit: i32,
        cursor_id: i64,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        debug!("get more {namespace} cursor={cursor_id} limit={limit}");
        self.read(
            &Request::GetMore {
                namespace,
                limit,
                cursor_id,
            },
            timeout,
        )
    }

    /// Asks the server to release cursors. Fire-and-forget: the result only says whether the
    /// arguments were usable, never whether the server freed anything.
    pub fn kill_cursors(&mut self, cursor_ids: &[i64]) -> bool {
        if cursor_ids.is_empty() || cursor_ids.contains(&0) {
            return false;
        }
        let request = Request::KillCursors { cursor_ids };
        match request.payload() {
            Ok(payload) => {
                if let Err(e) = self.transport.send(request.opcode(), &payload) {
                    warn!("kill cursors {cursor_ids:?} on {}: {e}", self.host());
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Runs a command against `database` and returns its reply, failing when `ok` is not 1.
    pub fn run_command(&mut self, database: &str, command: &Document) -> Result<Document> {
        let namespace = commands::command_namespace(database);
        let reply = self.query(
            QueryMessage {
                namespace: &namespace,
                query: command,
                fields: None,
                skip: 0,
                limit: -1,
                flags: 0,
            },
            self.timeout,
        )?;

        let document = reply.into_first().ok_or(ProtocolError::InvalidField {
            field: "command reply",
            reason: "no document returned".into(),
        })?;

        if document.get_f64("ok") != Some(1.0) {
            return Err(CursorError::Server {
                message: document
                    .get_str("errmsg")
                    .unwrap_or("command failed")
                    .to_string(),
                code: document.get_i32("code").unwrap_or(0),
            }
            .into());
        }
        Ok(document)
    }

    /// Round-trip time of a `ping` command.
    pub fn ping(&mut self) -> Result<Duration> {
        let started = Instant::now();
        self.run_command("admin", &commands::ping())?;
        Ok(started.elapsed())
    }

    fn read(&mut self, request: &Request<'_>, timeout: Option<Duration>) -> Result<Reply> {
        let payload = request.payload()?;
        let timeout = timeout.or(self.timeout);
        let reply = self.transport.read(request.opcode(), &payload, timeout)?;
        Reply::parse(&reply)?.check()
    }

    fn write(
        &mut self,
        request: Request<'_>,
        write_concern: Option<&WriteConcern>,
    ) -> Result<Option<Document>> {
        let concern = write_concern.unwrap_or(&self.write_concern).clone();
        let payload = request.payload()?;

        let acknowledgment = if concern.requires_acknowledgment() {
            let database = request
                .namespace()
                .and_then(|ns| ns.split('.').next())
                .unwrap_or("admin");
            let namespace = commands::command_namespace(database);
            let command = concern.command();
            Some(
                Request::Query(QueryMessage {
                    namespace: &namespace,
                    query: &command,
                    fields: None,
                    skip: 0,
                    limit: -1,
                    flags: 0,
                })
                .payload()?,
            )
        } else {
            None
        };

        let reply = self.transport.write(
            request.opcode(),
            &payload,
            acknowledgment.as_deref(),
            self.timeout,
        )?;

        match reply {
            None => Ok(None),
            Some(reply) => {
                let document = Reply::parse(&reply)?.check()?.into_first().ok_or(
                    ProtocolError::InvalidField {
                        field: "acknowledgment",
                        reason: "no document returned".into(),
                    },
                )?;
                write_concern::check_last_error(&document)?;
                Ok(Some(document))
            }
        }
    }
}
