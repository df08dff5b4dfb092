//! A scripted server speaking just enough of the wire protocol for integration tests.
#![allow(dead_code)]

use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use docwire::{
    Document, Value,
    bson::{self, decode_many},
    doc,
};

const OP_REPLY: i32 = 1;
const OP_UPDATE: i32 = 2001;
const OP_INSERT: i32 = 2002;
const OP_QUERY: i32 = 2004;
const OP_GET_MORE: i32 = 2005;
const OP_DELETE: i32 = 2006;
const OP_KILL_CURSORS: i32 = 2007;

pub const QUERY_FAILURE: i32 = 2;

/// A request as the server saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Query {
        namespace: String,
        query: Document,
        skip: i32,
        limit: i32,
        flags: i32,
    },
    GetMore {
        namespace: String,
        limit: i32,
        cursor_id: i64,
    },
    Insert {
        namespace: String,
        documents: Vec<Document>,
    },
    Update {
        namespace: String,
    },
    Delete {
        namespace: String,
    },
    KillCursors(Vec<i64>),
}

impl Op {
    /// Name of the command a query on `<db>.$cmd` runs.
    pub fn command(&self) -> Option<&str> {
        match self {
            Op::Query {
                namespace, query, ..
            } if namespace.ends_with(".$cmd") => query.keys().next(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub flags: i32,
    pub cursor_id: i64,
    pub documents: Vec<Document>,
}

impl Response {
    pub fn document(document: Document) -> Self {
        Self {
            documents: vec![document],
            ..Default::default()
        }
    }
}

type Handler = dyn Fn(&Op) -> Option<Response> + Send + Sync;

pub struct MockServer {
    port: u16,
    ops: Arc<Mutex<Vec<Op>>>,
    stopped: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Binds a listener so its address can be handed to other servers before any of them runs.
    pub fn bind() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").unwrap()
    }

    pub fn start<H>(handler: H) -> Self
    where
        H: Fn(&Op) -> Option<Response> + Send + Sync + 'static,
    {
        Self::serve(Self::bind(), handler)
    }

    /// Answers every connection on `listener` with `handler`. Requests with no reply (writes,
    /// kill-cursors) are only recorded.
    pub fn serve<H>(listener: TcpListener, handler: H) -> Self
    where
        H: Fn(&Op) -> Option<Response> + Send + Sync + 'static,
    {
        let port = listener.local_addr().unwrap().port();
        let ops = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let stopped = Arc::new(AtomicBool::new(false));

        let recorded = ops.clone();
        let stop = stopped.clone();
        let acceptor = thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let handler = handler.clone();
                let recorded = recorded.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let _ = connection(stream, handler, recorded, stop);
                });
            }
        });

        Self {
            port,
            ops,
            stopped,
            acceptor: Some(acceptor),
        }
    }

    /// Closes the listener and hangs up on open connections at their next request. Returns once
    /// the port refuses connections.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.join().unwrap();
        }
    }

    pub fn hash(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    /// Waits until a recorded request satisfies `predicate`; fire-and-forget requests may
    /// arrive after the client call returned.
    pub fn wait_for(&self, predicate: impl Fn(&Op) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.ops().iter().any(&predicate) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

pub fn hash_of(listener: &TcpListener) -> String {
    format!("127.0.0.1:{}", listener.local_addr().unwrap().port())
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Answers the commands discovery and acknowledgment rely on for a replica-set member.
pub struct Member {
    pub set: String,
    pub me: String,
    pub primary: String,
    pub hosts: Vec<String>,
    /// `(host, stateStr, tags)` for status and config replies.
    pub members: Vec<(String, String, Document)>,
}

impl Member {
    pub fn answer(&self, op: &Op) -> Option<Response> {
        let reply = match op.command()? {
            "isMaster" => doc! {
                "ismaster" => self.me == self.primary,
                "secondary" => self.me != self.primary,
                "setName" => self.set.as_str(),
                "primary" => self.primary.as_str(),
                "hosts" => self.hosts.iter().map(String::as_str).collect::<Vec<_>>(),
                "ok" => 1.0,
            },
            "replSetGetStatus" => doc! {
                "set" => self.set.as_str(),
                "members" => self
                    .members
                    .iter()
                    .map(|(host, state, _)| {
                        doc! { "name" => host.as_str(), "health" => 1.0, "stateStr" => state.as_str() }
                    })
                    .collect::<Vec<_>>(),
                "ok" => 1.0,
            },
            "replSetGetConfig" => doc! {
                "config" => doc! {
                    "_id" => self.set.as_str(),
                    "members" => self
                        .members
                        .iter()
                        .map(|(host, _, tags)| doc! { "host" => host.as_str(), "tags" => tags.clone() })
                        .collect::<Vec<_>>(),
                },
                "ok" => 1.0,
            },
            "ping" => doc! { "ok" => 1.0 },
            "getlasterror" => doc! { "ok" => 1.0, "err" => Value::Null, "n" => 0 },
            _ => return None,
        };
        Some(Response::document(reply))
    }
}

fn connection(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    ops: Arc<Mutex<Vec<Op>>>,
    stopped: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut next_id: i32 = 1;
    loop {
        let mut header = [0u8; 16];
        stream.read_exact(&mut header)?;
        if stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let length = word(&header, 0) as usize;
        let request_id = word(&header, 4);
        let opcode = word(&header, 12);

        let mut payload = vec![0u8; length - header.len()];
        stream.read_exact(&mut payload)?;

        let op = parse(opcode, &payload)?;
        ops.lock().unwrap().push(op.clone());

        let expects_reply = matches!(op, Op::Query { .. } | Op::GetMore { .. });
        if !expects_reply {
            continue;
        }
        let response = handler(&op).unwrap_or_else(|| {
            Response::document(doc! { "ok" => 0.0, "errmsg" => "unscripted request" })
        });

        let mut body = Vec::new();
        body.extend_from_slice(&response.flags.to_le_bytes());
        body.extend_from_slice(&response.cursor_id.to_le_bytes());
        body.extend_from_slice(&0_i32.to_le_bytes());
        body.extend_from_slice(&(response.documents.len() as i32).to_le_bytes());
        for document in &response.documents {
            body.extend_from_slice(&bson::encode(document).map_err(invalid)?);
        }

        let mut frame = Vec::new();
        frame.extend_from_slice(&((16 + body.len()) as i32).to_le_bytes());
        frame.extend_from_slice(&next_id.to_le_bytes());
        frame.extend_from_slice(&request_id.to_le_bytes());
        frame.extend_from_slice(&OP_REPLY.to_le_bytes());
        frame.extend_from_slice(&body);
        stream.write_all(&frame)?;
        next_id += 1;
    }
}

fn parse(opcode: i32, payload: &[u8]) -> io::Result<Op> {
    let mut at = 0;
    let op = match opcode {
        OP_QUERY => {
            let flags = word(payload, at);
            at += 4;
            let namespace = cstring(payload, &mut at);
            let skip = word(payload, at);
            let limit = word(payload, at + 4);
            at += 8;
            let documents = decode_many(&payload[at..]).map_err(invalid)?;
            Op::Query {
                namespace,
                query: documents.into_iter().next().unwrap_or_default(),
                skip,
                limit,
                flags,
            }
        }
        OP_GET_MORE => {
            at += 4;
            let namespace = cstring(payload, &mut at);
            let limit = word(payload, at);
            let cursor_id = i64::from_le_bytes(payload[at + 4..at + 12].try_into().unwrap());
            Op::GetMore {
                namespace,
                limit,
                cursor_id,
            }
        }
        OP_INSERT => {
            at += 4;
            let namespace = cstring(payload, &mut at);
            Op::Insert {
                namespace,
                documents: decode_many(&payload[at..]).map_err(invalid)?,
            }
        }
        OP_UPDATE => {
            at += 4;
            Op::Update {
                namespace: cstring(payload, &mut at),
            }
        }
        OP_DELETE => {
            at += 4;
            Op::Delete {
                namespace: cstring(payload, &mut at),
            }
        }
        OP_KILL_CURSORS => {
            let count = word(payload, 4) as usize;
            Op::KillCursors(
                (0..count)
                    .map(|i| {
                        let start = 8 + i * 8;
                        i64::from_le_bytes(payload[start..start + 8].try_into().unwrap())
                    })
                    .collect(),
            )
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected opcode {other}"),
            ));
        }
    };
    Ok(op)
}

fn word(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn cstring(bytes: &[u8], at: &mut usize) -> String {
    let end = *at + bytes[*at..].iter().position(|b| *b == 0).unwrap();
    let s = String::from_utf8(bytes[*at..end].to_vec()).unwrap();
    *at = end + 1;
    s
}

fn invalid(e: docwire::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}
