use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::error::{ConnectionError, Error, Result};

use super::MemberState;

/// Key/value labels a member must carry to be eligible.
pub type TagSet = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadMode {
    /// Member states member selection may pick from under this mode.
    pub fn eligible_states(&self) -> &'static [MemberState] {
        match self {
            ReadMode::Primary => &[MemberState::Primary],
            ReadMode::PrimaryPreferred | ReadMode::Secondary | ReadMode::SecondaryPreferred => {
                &[MemberState::Secondary]
            }
            ReadMode::Nearest => &[MemberState::Primary, MemberState::Secondary],
        }
    }
}

impl FromStr for ReadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(ReadMode::Primary),
            "primarypreferred" => Ok(ReadMode::PrimaryPreferred),
            "secondary" => Ok(ReadMode::Secondary),
            "secondarypreferred" => Ok(ReadMode::SecondaryPreferred),
            "nearest" => Ok(ReadMode::Nearest),
            _ => Err(ConnectionError::InvalidReadPreference(format!("unknown mode '{s}'")).into()),
        }
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        };
        write!(f, "{s}")
    }
}

/// Which replica-set member services a read, and which tags it must carry. Tagsets are tried in
/// order; the first one any member satisfies wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadPreference {
    mode: ReadMode,
    tagsets: Vec<TagSet>,
}

impl Default for ReadPreference {
    fn default() -> Self {
        Self::primary()
    }
}

impl ReadPreference {
    /// Fails when `primary` is combined with a non-empty tagset: the primary is a single member
    /// and cannot be filtered.
    pub fn new(mode: ReadMode, tagsets: Vec<TagSet>) -> Result<Self> {
        if mode == ReadMode::Primary && tagsets.iter().any(|t| !t.is_empty()) {
            return Err(ConnectionError::InvalidReadPreference(
                "primary read preference cannot have tagsets".into(),
            )
            .into());
        }
        Ok(Self { mode, tagsets })
    }

    pub fn primary() -> Self {
        Self {
            mode: ReadMode::Primary,
            tagsets: Vec::new(),
        }
    }

    pub fn with_mode(mode: ReadMode) -> Self {
        Self {
            mode,
            tagsets: Vec::new(),
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn tagsets(&self) -> &[TagSet] {
        &self.tagsets
    }

    /// Stable serialized form, used to memoize which member a preference resolved to.
    pub fn key(&self) -> String {
        let mut key = self.mode.to_string();
        for tagset in &self.tagsets {
            key.push('|');
            key.push_str(&format_tagset(tagset));
        }
        key
    }
}

/// Parses `dc:ny,rack:1` into a tagset. The empty string is the empty tagset, which matches
/// every member.
pub fn parse_tagset(s: &str) -> Result<TagSet> {
    let mut tagset = TagSet::new();
    for pair in s.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair.split_once(':').ok_or_else(|| {
            ConnectionError::InvalidReadPreference(format!("malformed tag '{pair}'"))
        })?;
        tagset.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(tagset)
}

pub fn format_tagset(tagset: &TagSet) -> String {
    tagset
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `member` carries every tag in `tagset`.
pub fn tags_match(tagset: &TagSet, member: &TagSet) -> bool {
    tagset.iter().all(|(k, v)| member.get(k) == Some(v))
}
