use std::{
    io::{self, Read, Write},
    net::TcpStream,
    time::Duration,
};

use log::{debug, trace};

use crate::error::{ConnectionError, CursorError, Error, ProtocolError, Result};

use super::OpCode;

/// Length, request id, response-to and opcode; four little-endian `i32`s.
pub const HEADER_SIZE: usize = 16;

/// Largest message accepted from a server.
pub const MAX_MESSAGE_SIZE: usize = 48 * 1000 * 1000;

/// Request ids at or below this value are never issued.
const RESERVED_REQUEST_IDS: i32 = 1024;

/// A byte stream with a controllable receive timeout.
pub trait Socket: Read + Write {
    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub opcode: OpCode,
}

/// Frames messages over a single socket. One call is in flight at a time: every read sends one
/// request and blocks for the one reply that answers it.
///
/// After a timeout or an I/O failure the stream position is unknown, so the transport marks
/// itself unusable and refuses further calls; the owner must reconnect.
pub struct ProtocolTransport<T: Socket> {
    stream: T,
    host: String,
    next_request_id: i32,
    usable: bool,
}

impl<T: Socket> ProtocolTransport<T> {
    pub fn new(stream: T, host: impl Into<String>) -> Self {
        Self {
            stream,
            host: host.into(),
            next_request_id: RESERVED_REQUEST_IDS,
            usable: true,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    fn next_id(&mut self) -> i32 {
        self.next_request_id = match self.next_request_id.checked_add(1) {
            Some(id) => id,
            None => RESERVED_REQUEST_IDS + 1,
        };
        self.next_request_id
    }

    /// Appends one framed message to `buf` and returns the request id assigned to it.
    fn frame(&mut self, buf: &mut Vec<u8>, opcode: OpCode, payload: &[u8]) -> i32 {
        let request_id = self.next_id();
        let length = (HEADER_SIZE + payload.len()) as i32;

        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&request_id.to_le_bytes());
        buf.extend_from_slice(&0_i32.to_le_bytes());
        buf.extend_from_slice(&i32::from(opcode).to_le_bytes());
        buf.extend_from_slice(payload);

        trace!("framed {opcode:?} request {request_id} ({length} bytes)");
        request_id
    }

    /// Sends a request and blocks for the reply that answers it, returning the reply payload.
    pub fn read(
        &mut self,
        opcode: OpCode,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        let request_id = self.frame(&mut buf, opcode, payload);

        self.transmit(&buf)?;
        self.receive(request_id, timeout)
    }

    /// Sends a write, optionally followed in the same buffer by an acknowledgment query. Without
    /// an acknowledgment nothing is read back and `None` is returned as soon as the bytes are out.
    pub fn write(
        &mut self,
        opcode: OpCode,
        payload: &[u8],
        acknowledgment: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_usable()?;
        let mut buf = Vec::new();
        self.frame(&mut buf, opcode, payload);

        match acknowledgment {
            Some(ack) => {
                let request_id = self.frame(&mut buf, OpCode::Query, ack);
                self.transmit(&buf)?;
                self.receive(request_id, timeout).map(Some)
            }
            None => {
                self.transmit(&buf)?;
                Ok(None)
            }
        }
    }

    /// Sends a message that has no reply.
    pub fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let mut buf = Vec::new();
        self.frame(&mut buf, opcode, payload);
        self.transmit(&buf)
    }

    fn ensure_usable(&self) -> Result<()> {
        if !self.usable {
            return Err(ConnectionError::Unusable {
                host: self.host.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn transmit(&mut self, buf: &[u8]) -> Result<()> {
        let res = self
            .stream
            .write_all(buf)
            .and_then(|_| self.stream.flush());
        res.map_err(|e| self.fail(e))
    }

    fn receive(&mut self, request_id: i32, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if let Err(e) = self.stream.set_receive_timeout(timeout) {
            return Err(self.fail(e));
        }

        let mut header = [0; HEADER_SIZE];
        if let Err(e) = self.stream.read_exact(&mut header) {
            return Err(self.fail(e));
        }
        let header = match parse_header(&header) {
            Ok(header) => header,
            Err(e) => {
                self.usable = false;
                return Err(e);
            }
        };

        let mut payload = vec![0; header.length as usize - HEADER_SIZE];
        if let Err(e) = self.stream.read_exact(&mut payload) {
            return Err(self.fail(e));
        }

        if header.response_to != request_id {
            self.usable = false;
            return Err(CursorError::ResponseMismatch {
                expected: request_id,
                found: header.response_to,
            }
            .into());
        }
        if header.opcode != OpCode::Reply {
            self.usable = false;
            return Err(ProtocolError::UnknownOpcode(header.opcode.into()).into());
        }

        debug!(
            "received reply to request {request_id} from {} ({} bytes)",
            self.host, header.length
        );
        Ok(payload)
    }

    fn fail(&mut self, e: io::Error) -> Error {
        self.usable = false;
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout {
                host: self.host.clone(),
            },
            _ => ConnectionError::Io(e).into(),
        }
    }
}

fn parse_header(bytes: &[u8; HEADER_SIZE]) -> Result<MessageHeader> {
    let word = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
    let length = word(0);

    if length < HEADER_SIZE as i32 {
        return Err(ProtocolError::InvalidHeader(length).into());
    }
    if length as usize > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            size: length as usize,
            limit: MAX_MESSAGE_SIZE,
        }
        .into());
    }

    Ok(MessageHeader {
        length,
        request_id: word(4),
        response_to: word(8),
        opcode: OpCode::try_from(word(12))?,
    })
}
