//! Topology: which hosts exist, which one is primary, and which one serves a given read.
//!
//! # Overview
//!
//! A [`ConnectionManager`] is built from a [`ConnectionString`]. It keeps one
//! [`Protocol`](crate::protocol::Protocol) per host, created lazily and replaced when a call left
//! it unusable.
//!
//! In replica-set mode the seeds are only used to find the set. The first seed that answers
//! `isMaster` provides the authoritative member list and the primary; a mismatched set name
//! aborts. The primary then provides `replSetGetStatus` and `replSetGetConfig`, merged into a
//! [`ReplicaSetView`] that is reused for [`replica_set::VIEW_TTL`].
//!
//! # Key Components
//!
//! - [`ConnectionString`] / [`ClientOptions`]: the parsed URI and its defaults.
//! - [`HostAddress`] / [`HostEntry`]: a validated seed and what is known about it.
//! - [`ReadPreference`]: mode plus ordered tagsets.
//! - [`selection`]: the member-selection algorithm, free of any I/O.
//! - [`ConnectionManager`]: routing, discovery and the per-host socket cache.
mod host;
mod manager;
pub mod read_preference;
pub mod replica_set;
pub mod selection;
mod uri;

pub use host::{DEFAULT_PORT, HostAddress, HostEntry, MemberState};
pub use manager::ConnectionManager;
pub use read_preference::{ReadMode, ReadPreference, TagSet};
pub use replica_set::{MemberView, ReplicaSetView};
pub use uri::{ClientOptions, ConnectionString, SCHEME};
