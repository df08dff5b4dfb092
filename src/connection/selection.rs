//! Member selection: picks the replica-set member that services a read.
//!
//! Selection runs in three steps:
//!
//! 1. Keep members whose state the read mode allows.
//! 2. Try the tagsets in order and keep the members matching the first tagset that matches
//!    anything. A later tagset never wins over an earlier one, even when it would match more
//!    members.
//! 3. Among the survivors, `nearest` takes the lowest latency. Every other mode keeps the members
//!    within the acceptable-latency window of the fastest and picks one uniformly at random.
use std::time::Duration;

use rand::{Rng, seq::SliceRandom};

use crate::error::{ConnectionError, Result};

use super::{
    MemberState,
    read_preference::{ReadMode, TagSet, format_tagset, tags_match},
};

pub const DEFAULT_LATENCY_WINDOW: Duration = Duration::from_millis(15);

/// A member as seen by the selection algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub hash: String,
    pub state: MemberState,
    pub tags: TagSet,
    pub ping: Option<Duration>,
}

pub fn eligible(members: Vec<Member>, states: &[MemberState]) -> Vec<Member> {
    members
        .into_iter()
        .filter(|m| states.contains(&m.state))
        .collect()
}

/// Narrows `members` to those matching the first tagset any of them satisfies. No tagsets at all
/// behaves like a single empty tagset.
pub fn match_tagsets(members: Vec<Member>, tagsets: &[TagSet]) -> Result<Vec<Member>> {
    if tagsets.is_empty() {
        if members.is_empty() {
            return Err(no_candidate(tagsets));
        }
        return Ok(members);
    }

    for tagset in tagsets {
        let matched: Vec<Member> = members
            .iter()
            .filter(|m| tags_match(tagset, &m.tags))
            .cloned()
            .collect();
        if !matched.is_empty() {
            return Ok(matched);
        }
    }

    Err(no_candidate(tagsets))
}

/// Picks one member by latency. Members without a measurement sort after every measured one.
pub fn choose<'a, R: Rng + ?Sized>(
    candidates: &'a [Member],
    mode: ReadMode,
    window: Duration,
    rng: &mut R,
) -> Option<&'a Member> {
    let latency = |m: &Member| m.ping.unwrap_or(Duration::MAX);
    let fastest = candidates.iter().min_by_key(|m| latency(m))?;

    if mode == ReadMode::Nearest {
        return Some(fastest);
    }

    let bound = latency(fastest).saturating_add(window);
    let within: Vec<&Member> = candidates.iter().filter(|m| latency(m) <= bound).collect();
    within.choose(rng).copied()
}

pub(crate) fn no_candidate(tagsets: &[TagSet]) -> crate::Error {
    let tagsets = tagsets
        .iter()
        .map(|t| format!("{{{}}}", format_tagset(t)))
        .collect::<Vec<_>>()
        .join(", ");
    ConnectionError::NoCandidate {
        tagsets: format!("[{tagsets}]"),
    }
    .into()
}
