use std::{
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use crate::error::{ConnectionError, Error};

pub const DEFAULT_PORT: u16 = 27017;

/// A validated `host[:port]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Identity used for every per-host cache: `host:port`.
    pub fn hash(&self) -> String {
        self.to_string()
    }
}

impl FromStr for HostAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::from(ConnectionError::MalformedHost(s.to_string()));

        if s.contains("://") {
            return Err(malformed());
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                // Parsed wider than u16 so that 65536 is reported as out of range rather than
                // silently failing for a different reason.
                let port: u32 = port.parse().map_err(|_| malformed())?;
                if !(1..=u32::from(u16::MAX)).contains(&port) {
                    return Err(malformed());
                }
                (host, port as u16)
            }
            None => (s, DEFAULT_PORT),
        };

        let valid = !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(malformed());
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Replica-set role of a member, as last reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    Startup,
    Primary,
    Secondary,
}

impl MemberState {
    /// Maps a status `stateStr`; anything that is neither primary nor secondary (recovering,
    /// arbiter, rollback, ...) counts as not yet usable.
    pub fn from_state_str(state: &str) -> Self {
        match state {
            "PRIMARY" => MemberState::Primary,
            "SECONDARY" => MemberState::Secondary,
            _ => MemberState::Startup,
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberState::Startup => "STARTUP",
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
        };
        write!(f, "{s}")
    }
}

/// What the manager knows about one host. Entries are created from seeds or discovery and are
/// never removed while the manager is alive, except when discovery replaces the seed list.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub address: HostAddress,
    pub hash: String,
    /// Set once any connection attempt to the host succeeded.
    pub healthy: bool,
    pub state: MemberState,
    /// Last measured round-trip time.
    pub ping: Option<Duration>,
    pub last_ping: Option<Instant>,
}

impl HostEntry {
    pub fn new(address: HostAddress) -> Self {
        Self {
            hash: address.hash(),
            address,
            healthy: false,
            state: MemberState::Startup,
            ping: None,
            last_ping: None,
        }
    }

    pub fn record_ping(&mut self, rtt: Duration) {
        self.ping = Some(rtt);
        self.last_ping = Some(Instant::now());
    }
}
