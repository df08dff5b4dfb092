use std::time::Duration;

use log::warn;

use crate::{
    error::{ConnectionError, Error, Result},
    protocol::{Acknowledgment, WriteConcern},
};

use super::{
    HostAddress,
    read_preference::{ReadMode, ReadPreference, TagSet, parse_tagset},
    selection::DEFAULT_LATENCY_WINDOW,
};

pub const SCHEME: &str = "mongodb://";

/// Settings a [`ConnectionManager`](super::ConnectionManager) runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    /// Receive timeout for every call; `None` blocks indefinitely.
    pub socket_timeout: Option<Duration>,
    pub write_concern: WriteConcern,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Set name to require; its presence switches the manager into replica-set mode.
    pub replica_set: Option<String>,
    pub read_preference: ReadPreference,
    /// Connect while constructing the manager.
    pub auto_connect: bool,
    /// Acceptable-latency window for member selection.
    pub latency_window: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            socket_timeout: Some(Duration::from_secs(30)),
            write_concern: WriteConcern::default(),
            username: None,
            password: None,
            database: None,
            replica_set: None,
            read_preference: ReadPreference::default(),
            auto_connect: true,
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }
}

impl ClientOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    pub fn with_replica_set(mut self, name: impl Into<String>) -> Self {
        self.replica_set = Some(name.into());
        self
    }

    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = read_preference;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_latency_window(mut self, window: Duration) -> Self {
        self.latency_window = window;
        self
    }
}

/// A parsed `mongodb://[user:pass@]host1[:port1][,host2...][/database][?options]` string.
///
/// Parsing never touches the network; every seed is validated up front.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionString {
    pub hosts: Vec<HostAddress>,
    pub options: ClientOptions,
}

impl ConnectionString {
    pub fn parse(uri: &str) -> Result<Self> {
        let malformed = |reason: &str| -> Error {
            ConnectionError::MalformedUri {
                uri: uri.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };

        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| malformed("expected the mongodb:// scheme"))?;
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };

        let mut options = ClientOptions::default();

        let rest = match rest.rsplit_once('@') {
            Some((user_info, rest)) => {
                let (username, password) = user_info
                    .split_once(':')
                    .ok_or_else(|| malformed("user info must be user:password"))?;
                let decode = |s: &str| percent_decode(s).map_err(|_| malformed("bad escape"));
                options.username = Some(decode(username)?);
                options.password = Some(decode(password)?);
                rest
            }
            None => rest,
        };

        let hosts = match rest.split_once('/') {
            Some((hosts, database)) => {
                if !database.is_empty() {
                    options.database = Some(database.to_string());
                }
                hosts
            }
            None => rest,
        };
        if hosts.is_empty() {
            return Err(malformed("no hosts"));
        }
        let hosts = hosts
            .split(',')
            .map(str::parse::<HostAddress>)
            .collect::<Result<Vec<_>>>()?;

        if let Some(query) = query {
            let mut mode = None;
            let mut tagsets = Vec::new();
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = percent_decode(value).map_err(|_| malformed("bad escape in option"))?;
                apply_option(&mut options, &mut mode, &mut tagsets, name, &value)
                    .map_err(|reason| malformed(&reason))?;
            }
            if mode.is_some() || !tagsets.is_empty() {
                options.read_preference =
                    ReadPreference::new(mode.unwrap_or(ReadMode::Primary), tagsets)?;
            }
        }

        Ok(Self { hosts, options })
    }
}

fn apply_option(
    options: &mut ClientOptions,
    mode: &mut Option<ReadMode>,
    tagsets: &mut Vec<TagSet>,
    name: &str,
    value: &str,
) -> std::result::Result<(), String> {
    match name.to_ascii_lowercase().as_str() {
        "connecttimeoutms" | "timeout" | "connecttimeout" => {
            options.connect_timeout = millis(name, value)?;
        }
        "sockettimeoutms" => {
            let timeout = millis(name, value)?;
            options.socket_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        "wtimeoutms" | "wtimeout" => options.write_concern.timeout = millis(name, value)?,
        "w" => options.write_concern.w = Acknowledgment::from(value),
        "journal" | "j" => options.write_concern.journal = boolean(name, value)?,
        "username" => options.username = Some(value.to_string()),
        "password" => options.password = Some(value.to_string()),
        "db" => options.database = Some(value.to_string()),
        "replicaset" => options.replica_set = Some(value.to_string()),
        "readpreference" => {
            *mode = Some(value.parse().map_err(|e: Error| e.to_string())?);
        }
        "readpreferencetags" => tagsets.push(parse_tagset(value).map_err(|e| e.to_string())?),
        "connect" => options.auto_connect = boolean(name, value)?,
        "localthresholdms" | "secondaryacceptablelatencyms" => {
            options.latency_window = millis(name, value)?;
        }
        _ => warn!("ignoring unknown connection option '{name}'"),
    }
    Ok(())
}

fn millis(name: &str, value: &str) -> std::result::Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| format!("option '{name}' expects milliseconds, got '{value}'"))
}

fn boolean(name: &str, value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(format!("option '{name}' expects a boolean, got '{value}'")),
    }
}

fn percent_decode(s: &str) -> std::result::Result<String, std::string::FromUtf8Error> {
    urlencoding::decode(s).map(|decoded| decoded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_connection_string() {
        let parsed = ConnectionString::parse(
            "mongodb://app:p%40ss@a:27017,b:27018/inventory?replicaSet=rs0&connectTimeoutMS=500\
             &readPreference=secondaryPreferred&readPreferenceTags=dc:ny&readPreferenceTags=\
             &w=majority&j=true&localThresholdMS=30",
        )
        .unwrap();

        assert_eq!(
            parsed.hosts,
            vec![HostAddress::new("a", 27017), HostAddress::new("b", 27018)]
        );
        let options = parsed.options;
        assert_eq!(options.username.as_deref(), Some("app"));
        assert_eq!(options.password.as_deref(), Some("p@ss"));
        assert_eq!(options.database.as_deref(), Some("inventory"));
        assert_eq!(options.replica_set.as_deref(), Some("rs0"));
        assert_eq!(options.connect_timeout, Duration::from_millis(500));
        assert_eq!(options.read_preference.mode(), ReadMode::SecondaryPreferred);
        assert_eq!(options.read_preference.tagsets().len(), 2);
        assert!(options.read_preference.tagsets()[1].is_empty());
        assert_eq!(options.write_concern.w, Acknowledgment::Tag("majority".into()));
        assert!(options.write_concern.journal);
        assert_eq!(options.latency_window, Duration::from_millis(30));
    }

    #[test]
    fn legacy_aliases() {
        let options = ConnectionString::parse(
            "mongodb://a/?timeout=100&wtimeout=200&secondaryAcceptableLatencyMS=5&connect=false",
        )
        .unwrap()
        .options;

        assert_eq!(options.connect_timeout, Duration::from_millis(100));
        assert_eq!(options.write_concern.timeout, Duration::from_millis(200));
        assert_eq!(options.latency_window, Duration::from_millis(5));
        assert!(!options.auto_connect);
    }

    #[test]
    fn defaults_without_options() {
        let parsed = ConnectionString::parse("mongodb://localhost").unwrap();
        assert_eq!(parsed.hosts, vec![HostAddress::new("localhost", 27017)]);
        assert_eq!(parsed.options, ClientOptions::default());
    }

    #[test]
    fn rejects_malformed_strings() {
        for uri in [
            "localhost:27017",
            "http://localhost",
            "mongodb://",
            "mongodb:///db",
            "mongodb://a:0",
            "mongodb://a,,b",
            "mongodb://user@a",
            "mongodb://a/?connectTimeoutMS=soon",
            "mongodb://a/?readPreference=fastest",
            "mongodb://a/?readPreferenceTags=dc:ny",
        ] {
            assert!(
                matches!(
                    ConnectionString::parse(uri),
                    Err(Error::Connection(
                        ConnectionError::MalformedUri { .. }
                            | ConnectionError::MalformedHost(_)
                            | ConnectionError::InvalidReadPreference(_)
                    ))
                ),
                "{uri} should be rejected"
            );
        }
    }

    #[test]
    fn unknown_options_are_ignored() {
        let parsed = ConnectionString::parse("mongodb://a/?frobnicate=yes").unwrap();
        assert_eq!(parsed.options, ClientOptions::default());
    }
}
