//! Result cursor: iterates a query's documents, fetching batches from the server on demand.
//!
//! # Overview
//!
//! A [`Cursor`] does nothing until it is first polled. The first poll sends the query to the
//! member the read preference resolves to; that reply carries the first batch and the server's
//! cursor id. Whenever the local buffer runs dry and the server still holds the cursor, a
//! get-more is sent to the same member.
//!
//! Iteration stops when the server returns a zero cursor id, an empty batch, or when the
//! requested limit has been received. Reaching the limit while the server still holds a cursor
//! kills it.
//!
//! [`Cursor::reset`] rewinds over the documents already fetched. It never re-runs the query.
//!
//! # Transforms
//!
//! A [`DocumentTransform`] sees every document as it arrives and may rewrite or drop it.
//! Dropped documents still count against the limit, since the server sent them.
use std::time::Duration;

use log::debug;

use crate::{
    bson::{Document, Value},
    connection::{ConnectionManager, ReadMode, ReadPreference},
    error::{ConnectionError, Result},
    protocol::{QueryMessage, Reply, flags},
};

/// Batch size asked for when the caller set none.
pub const INTERNAL_BATCH_SIZE: i32 = 100;

/// Rewrites or drops documents as they are received.
pub trait DocumentTransform {
    fn apply(&mut self, document: Document) -> Option<Document>;
}

impl<F> DocumentTransform for F
where
    F: FnMut(Document) -> Option<Document>,
{
    fn apply(&mut self, document: Document) -> Option<Document> {
        self(document)
    }
}

/// Passes every document through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl DocumentTransform for Identity {
    fn apply(&mut self, document: Document) -> Option<Document> {
        Some(document)
    }
}

pub struct Cursor<'a, F: DocumentTransform = Identity> {
    manager: &'a mut ConnectionManager,
    namespace: String,
    query: Document,
    fields: Option<Document>,
    sort: Option<Document>,
    hint: Option<Document>,
    skip: i32,
    limit: i32,
    batch_size: i32,
    flags: i32,
    read_preference: ReadPreference,
    timeout: Option<Duration>,
    transform: F,

    host: Option<String>,
    cursor_id: i64,
    buffer: Vec<Document>,
    position: usize,
    received: usize,
    started: bool,
    has_more: bool,
    end: bool,
}

impl<'a> Cursor<'a, Identity> {
    pub fn new(manager: &'a mut ConnectionManager, namespace: &str, query: Document) -> Self {
        Cursor::with_transform(manager, namespace, query, Identity)
    }
}

impl<'a, F: DocumentTransform> Cursor<'a, F> {
    pub fn with_transform(
        manager: &'a mut ConnectionManager,
        namespace: &str,
        query: Document,
        transform: F,
    ) -> Self {
        let read_preference = manager.options().read_preference.clone();
        Self {
            manager,
            namespace: namespace.to_string(),
            query,
            fields: None,
            sort: None,
            hint: None,
            skip: 0,
            limit: 0,
            batch_size: 0,
            flags: 0,
            read_preference,
            timeout: None,
            transform,
            host: None,
            cursor_id: 0,
            buffer: Vec::new(),
            position: 0,
            received: 0,
            started: false,
            has_more: false,
            end: false,
        }
    }

    /// Projection applied by the server.
    pub fn fields(mut self, fields: Document) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn skip(mut self, skip: i32) -> Self {
        self.skip = skip;
        self
    }

    /// Total documents to return; zero means no limit. A negative limit returns at most that
    /// many documents in a single batch and closes the server cursor.
    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    pub fn batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn hint(mut self, hint: Document) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = read_preference;
        self
    }

    /// Receive timeout for this cursor's calls, overriding the connection's.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tailable(mut self) -> Self {
        self.flags |= flags::QUERY_TAILABLE;
        self
    }

    pub fn no_cursor_timeout(mut self) -> Self {
        self.flags |= flags::QUERY_NO_CURSOR_TIMEOUT;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Server cursor id; zero once the server has no more results or the cursor was killed.
    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    /// The member the query went to, once sent.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Documents received from the server so far, including dropped ones.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_exhausted(&self) -> bool {
        self.end
    }

    /// Whether a document is available at the current position, fetching if needed.
    pub fn valid(&mut self) -> Result<bool> {
        self.fill()?;
        Ok(self.position < self.buffer.len())
    }

    pub fn current(&mut self) -> Result<Option<&Document>> {
        self.fill()?;
        Ok(self.buffer.get(self.position))
    }

    /// Key of the current document: its `_id` when that is an object id or string, the position
    /// otherwise.
    pub fn key(&mut self) -> Result<Option<String>> {
        let position = self.position;
        Ok(self.current()?.map(|document| match document.get("_id") {
            Some(Value::ObjectId(id)) => id.to_hex(),
            Some(Value::String(id)) => id.clone(),
            _ => position.to_string(),
        }))
    }

    /// Moves to the next document. Fetching is deferred to the next poll.
    pub fn advance(&mut self) {
        if self.position < self.buffer.len() {
            self.position += 1;
        }
    }

    /// Rewinds to the first document already fetched.
    pub fn reset(&mut self) {
        self.position = 0;
        self.end = false;
    }

    /// Asks the server to release the cursor. Only reports whether there was a cursor to kill.
    pub fn kill(&mut self) -> bool {
        let (Some(host), id) = (self.host.as_deref(), self.cursor_id) else {
            return false;
        };
        if id == 0 {
            return false;
        }
        let killed = match self.manager.protocol_for(host) {
            Ok(protocol) => protocol.kill_cursors(&[id]),
            Err(_) => false,
        };
        self.cursor_id = 0;
        self.has_more = false;
        killed
    }

    fn fill(&mut self) -> Result<()> {
        let result = self.fetch_until_available();
        if result.is_err() {
            self.end = true;
        }
        result
    }

    fn fetch_until_available(&mut self) -> Result<()> {
        while self.position >= self.buffer.len() && !self.end {
            if !self.started {
                self.started = true;
                self.send_query()?;
            } else if self.has_more {
                let before = self.received;
                self.send_get_more()?;
                if self.flags & flags::QUERY_TAILABLE != 0 && self.received == before {
                    break;
                }
            } else {
                self.end = true;
            }
        }
        Ok(())
    }

    fn send_query(&mut self) -> Result<()> {
        let query = self.query_document();
        let flags = self.query_flags();
        let limit = if self.limit < 0 {
            self.limit
        } else {
            self.request_size()
        };

        let host = self.manager.read_target(&self.read_preference)?;
        let reply = self.manager.protocol_for(&host)?.query(
            QueryMessage {
                namespace: &self.namespace,
                query: &query,
                fields: self.fields.as_ref(),
                skip: self.skip,
                limit,
                flags,
            },
            self.timeout,
        )?;
        self.host = Some(host);
        self.absorb(reply);
        Ok(())
    }

    fn send_get_more(&mut self) -> Result<()> {
        let host = self.host.clone().ok_or(ConnectionError::NotConnected)?;
        let limit = self.request_size();
        let reply = self.manager.protocol_for(&host)?.get_more(
            &self.namespace,
            limit,
            self.cursor_id,
            self.timeout,
        )?;
        self.absorb(reply);
        Ok(())
    }

    fn absorb(&mut self, reply: Reply) {
        let count = reply.documents.len();
        self.received += count;
        self.cursor_id = reply.cursor_id;
        for document in reply.documents {
            if let Some(document) = self.transform.apply(document) {
                self.buffer.push(document);
            }
        }

        let limit_reached = self.limit != 0 && self.received >= self.limit.unsigned_abs() as usize;
        let tailable = self.flags & flags::QUERY_TAILABLE != 0;
        self.has_more = self.cursor_id != 0
            && (count > 0 || tailable)
            && !limit_reached
            && self.limit >= 0;
        debug!(
            "cursor {} on {}: batch of {count}, {} received",
            self.cursor_id, self.namespace, self.received
        );

        if !self.has_more && self.cursor_id != 0 {
            self.kill();
        }
    }

    /// The filter, wrapped in `$query` when a sort or hint has to travel with it.
    fn query_document(&self) -> Document {
        if self.sort.is_none() && self.hint.is_none() {
            return self.query.clone();
        }
        let mut wrapped = Document::new();
        wrapped.insert("$query", self.query.clone());
        if let Some(sort) = &self.sort {
            wrapped.insert("$orderby", sort.clone());
        }
        if let Some(hint) = &self.hint {
            wrapped.insert("$hint", hint.clone());
        }
        wrapped
    }

    fn query_flags(&self) -> i32 {
        if self.read_preference.mode() == ReadMode::Primary {
            self.flags
        } else {
            self.flags | flags::QUERY_SLAVE_OK
        }
    }

    /// Smaller of the remaining limit and the batch size.
    fn request_size(&self) -> i32 {
        let batch = if self.batch_size > 0 {
            self.batch_size
        } else {
            INTERNAL_BATCH_SIZE
        };
        if self.limit > 0 {
            let remaining = (self.limit as usize).saturating_sub(self.received);
            batch.min(remaining as i32)
        } else {
            batch
        }
    }
}

impl<F: DocumentTransform> Iterator for Cursor<'_, F> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.fill() {
            Err(e) => Some(Err(e)),
            Ok(()) => {
                let document = self.buffer.get(self.position).cloned()?;
                self.position += 1;
                Some(Ok(document))
            }
        }
    }
}

impl<F: DocumentTransform> Drop for Cursor<'_, F> {
    fn drop(&mut self) {
        if self.cursor_id == 0 {
            return;
        }
        if let Some(protocol) = self
            .host
            .as_deref()
            .and_then(|host| self.manager.connected_protocol(host))
        {
            protocol.kill_cursors(&[self.cursor_id]);
        }
    }
}
