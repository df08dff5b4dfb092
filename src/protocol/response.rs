use crate::{
    bson::{Document, Reader},
    error::{CursorError, ProtocolError, Result},
};

pub const REPLY_CURSOR_NOT_FOUND: i32 = 1;
pub const REPLY_QUERY_FAILURE: i32 = 1 << 1;

/// Server reply to a query or get-more: a fixed sub-header followed by documents.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub flags: i32,
    /// Zero once the server holds no further results.
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let flags = reader.read_i32("reply flags")?;
        let cursor_id = reader.read_i64("cursor id")?;
        let starting_from = reader.read_i32("starting from")?;
        let number_returned = reader.read_i32("number returned")?;

        let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
        while reader.remaining() > 0 {
            documents.push(reader.read_document()?);
        }

        if documents.len() as i64 != i64::from(number_returned) {
            return Err(ProtocolError::InvalidField {
                field: "number returned",
                reason: format!(
                    "reply declares {number_returned} documents but carries {}",
                    documents.len()
                ),
            }
            .into());
        }

        Ok(Self {
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    /// Turns server-reported failures into errors: a missing cursor, or an error document in
    /// first position.
    pub fn check(self) -> Result<Self> {
        if let Some(first) = self.documents.first() {
            if let Some(message) = server_error(first) {
                return Err(CursorError::Server {
                    message,
                    code: first.get_i32("code").unwrap_or(0),
                }
                .into());
            }
        }
        if self.flags & REPLY_CURSOR_NOT_FOUND != 0 {
            return Err(CursorError::NotFound(self.cursor_id).into());
        }
        Ok(self)
    }

    pub fn query_failed(&self) -> bool {
        self.flags & REPLY_QUERY_FAILURE != 0
    }

    pub fn into_first(self) -> Option<Document> {
        self.documents.into_iter().next()
    }
}

fn server_error(document: &Document) -> Option<String> {
    let value = document.get("$err")?;
    Some(match value.as_str() {
        Some(message) => message.to_string(),
        None => value.to_string(),
    })
}
