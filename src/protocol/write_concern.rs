use std::time::Duration;

use crate::{
    bson::{Document, Value},
    doc,
    error::{CursorError, Result},
};

/// How many members must acknowledge a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgment {
    Nodes(i32),
    /// Named mode, e.g. `majority`, or a custom tag-based mode.
    Tag(String),
}

impl From<&Acknowledgment> for Value {
    fn from(value: &Acknowledgment) -> Self {
        match value {
            Acknowledgment::Nodes(n) => Value::Int32(*n),
            Acknowledgment::Tag(tag) => Value::String(tag.clone()),
        }
    }
}

impl From<&str> for Acknowledgment {
    fn from(value: &str) -> Self {
        match value.parse::<i32>() {
            Ok(n) => Acknowledgment::Nodes(n),
            Err(_) => Acknowledgment::Tag(value.to_string()),
        }
    }
}

/// Durability requested for writes, sent as a piggy-backed `getlasterror` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConcern {
    pub w: Acknowledgment,
    pub journal: bool,
    pub timeout: Duration,
}

impl Default for WriteConcern {
    fn default() -> Self {
        Self {
            w: Acknowledgment::Nodes(1),
            journal: false,
            timeout: Duration::from_secs(10),
        }
    }
}

impl WriteConcern {
    /// Fire-and-forget: no acknowledgment round trip at all.
    pub fn unacknowledged() -> Self {
        Self {
            w: Acknowledgment::Nodes(0),
            journal: false,
            ..Default::default()
        }
    }

    pub fn requires_acknowledgment(&self) -> bool {
        self.w != Acknowledgment::Nodes(0) || self.journal
    }

    pub fn command(&self) -> Document {
        let mut command = doc! {
            "getlasterror" => 1,
            "w" => Value::from(&self.w),
            "wtimeout" => self.timeout.as_millis().min(i32::MAX as u128) as i32,
        };
        if self.journal {
            command.insert("j", true);
        }
        command
    }
}

/// Raises the error a `getlasterror` reply reports, if any.
pub(crate) fn check_last_error(reply: &Document) -> Result<()> {
    let code = reply.get_i32("code").unwrap_or(0);

    if let Some(err) = reply.get("err") {
        if *err != Value::Null {
            let message = err.as_str().map_or_else(|| err.to_string(), str::to_string);
            return Err(CursorError::Server { message, code }.into());
        }
    }
    if reply.get_f64("ok") != Some(1.0) {
        let message = reply.get_str("errmsg").unwrap_or("write not acknowledged");
        return Err(CursorError::Server {
            message: message.to_string(),
            code,
        }
        .into());
    }
    Ok(())
}
