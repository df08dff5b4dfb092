//! Database command documents the driver issues on its own behalf, and the replies it reads.
use crate::{
    bson::{Document, Value},
    doc,
};

pub fn is_master() -> Document {
    doc! { "isMaster" => 1 }
}

pub fn ping() -> Document {
    doc! { "ping" => 1 }
}

pub fn replica_set_status() -> Document {
    doc! { "replSetGetStatus" => 1 }
}

pub fn replica_set_config() -> Document {
    doc! { "replSetGetConfig" => 1 }
}

pub fn command_namespace(database: &str) -> String {
    format!("{database}.$cmd")
}

/// Fields of an `isMaster` reply that topology discovery relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsMaster {
    pub is_master: bool,
    pub secondary: bool,
    pub set_name: Option<String>,
    /// `host:port` of the current primary, as the server sees it.
    pub primary: Option<String>,
    pub hosts: Vec<String>,
    pub passives: Vec<String>,
}

impl IsMaster {
    pub fn from_document(document: &Document) -> Self {
        Self {
            is_master: document.get_bool("ismaster").unwrap_or(false),
            secondary: document.get_bool("secondary").unwrap_or(false),
            set_name: document.get_str("setName").map(str::to_string),
            primary: document.get_str("primary").map(str::to_string),
            hosts: strings(document.get_array("hosts")),
            passives: strings(document.get_array("passives")),
        }
    }

    /// Active and passive members, in reported order.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .map(String::as_str)
    }
}

fn strings(values: Option<&[Value]>) -> Vec<String> {
    values
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}
