use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use log::debug;

use crate::bson::{Document, Value};

use super::{MemberState, read_preference::TagSet};

/// How long a fetched view is reused before status is polled again.
pub const VIEW_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
pub struct MemberView {
    pub state_str: String,
    pub health: f64,
    pub tags: TagSet,
}

impl MemberView {
    pub fn state(&self) -> MemberState {
        MemberState::from_state_str(&self.state_str)
    }
}

/// Members as reported by replica-set status, with tags from the configuration, restricted to
/// hosts the manager already knows. Hidden members and arbiters never appear in discovery's host
/// list, so they drop out here.
#[derive(Debug, Clone)]
pub struct ReplicaSetView {
    members: BTreeMap<String, MemberView>,
    primary: String,
    fetched_at: Instant,
}

impl ReplicaSetView {
    /// Merges a `replSetGetStatus` reply with a `replSetGetConfig` reply. The configuration may
    /// be passed either as the command reply (members under `config`) or as the bare
    /// configuration document.
    pub fn merge<F>(status: &Document, config: &Document, primary: &str, known: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        let config = config.get_document("config").unwrap_or(config);
        let mut tags: BTreeMap<&str, TagSet> = BTreeMap::new();
        for member in documents(config.get_array("members")) {
            if let Some(host) = member.get_str("host") {
                tags.insert(host, tagset(member.get_document("tags")));
            }
        }

        let mut members = BTreeMap::new();
        for member in documents(status.get_array("members")) {
            let Some(name) = member.get_str("name") else {
                continue;
            };
            if !known(name) {
                debug!("ignoring replica set member {name} outside the host list");
                continue;
            }
            members.insert(
                name.to_string(),
                MemberView {
                    state_str: member.get_str("stateStr").unwrap_or("UNKNOWN").to_string(),
                    health: member.get_f64("health").unwrap_or(0.0),
                    tags: tags.get(name).cloned().unwrap_or_default(),
                },
            );
        }

        Self {
            members,
            primary: primary.to_string(),
            fetched_at: Instant::now(),
        }
    }

    /// Still usable for `primary` at `now`.
    pub fn is_fresh(&self, primary: &str, now: Instant) -> bool {
        self.primary == primary && now.duration_since(self.fetched_at) < VIEW_TTL
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn member(&self, hash: &str) -> Option<&MemberView> {
        self.members.get(hash)
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &MemberView)> {
        self.members.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn documents(values: Option<&[Value]>) -> impl Iterator<Item = &Document> {
    values
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_document)
}

fn tagset(tags: Option<&Document>) -> TagSet {
    tags.map(|t| {
        t.iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.to_string(), v.to_string())))
            .collect()
    })
    .unwrap_or_default()
}
