// src/version/mod.rs

//! Versions and branches
//!
//! A version is a path through the version tree: alternating labels and
//! revisions, always ending in a revision. A branch is a version without its
//! trailing revision, so it always ends in a label.
//!
//! ```text
//! /conary.example.com@rpl:2/1.0-1                        version on a trunk
//! /conary.example.com@rpl:2/1.0-1/local@local:LOCAL/1.0-1-1   shadow of it
//! ```
//!
//! Every revision carries a timestamp. Two versions on the same branch are
//! ordered by the timestamp of their trailing revision; equality and hashing
//! ignore timestamps. The *frozen* form embeds the timestamps
//! (`/host@ns:tag/1146248662.000:1.0-1`) and is what the local database
//! stores.

use crate::error::{Error, Result};
use crate::label::Label;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Revision timestamp in milliseconds since the epoch
pub type Timestamp = u64;

/// The `version-release[-buildcount]` node of a version
#[derive(Debug, Clone)]
pub struct Revision {
    /// Upstream version, must start with a digit
    pub version: String,
    /// Source release count
    pub release: u32,
    /// Binary build count, absent on source versions
    pub build_count: Option<u32>,
    /// Milliseconds since the epoch
    pub timestamp: Timestamp,
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.release == other.release
            && self.build_count == other.build_count
    }
}

impl Eq for Revision {}

impl Hash for Revision {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.version.hash(state);
        self.release.hash(state);
        self.build_count.hash(state);
    }
}

impl Revision {
    pub fn new(version: impl Into<String>, release: u32, build_count: Option<u32>) -> Self {
        Self {
            version: version.into(),
            release,
            build_count,
            timestamp: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Parse `ver-rel[-bc]`, possibly abbreviated relative to `template`
    fn parse(value: &str, template: Option<&Revision>) -> Result<Self> {
        if value.contains(':') {
            return Err(Error::ParseError(
                "version/release pairs may not contain colons".to_string(),
            ));
        }
        if value.contains('@') {
            return Err(Error::ParseError(
                "version/release pairs may not contain @ signs".to_string(),
            ));
        }

        let fields: Vec<&str> = value.split('-').collect();
        let (version, release, build_count) = match (fields.as_slice(), template) {
            ([bc], Some(t)) if t.build_count.is_some() => {
                (t.version.clone(), t.release.to_string(), Some(*bc))
            }
            ([rel], Some(t)) => (t.version.clone(), rel.to_string(), None),
            ([rel, bc], Some(t)) if t.build_count.is_some() => {
                (t.version.clone(), rel.to_string(), Some(*bc))
            }
            ([ver, rel], _) => (ver.to_string(), rel.to_string(), None),
            ([ver, rel, bc], _) => (ver.to_string(), rel.to_string(), Some(*bc)),
            ([_], None) => {
                return Err(Error::ParseError(format!(
                    "bad version/release set {}",
                    value
                )));
            }
            _ => {
                return Err(Error::ParseError(format!(
                    "too many fields in version/release set {}",
                    value
                )));
            }
        };

        if !version.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return Err(Error::ParseError(format!(
                "version numbers must begin with a digit: {}",
                value
            )));
        }
        let release = release.parse::<u32>().map_err(|_| {
            Error::ParseError(format!("release numbers must be all numeric: {}", release))
        })?;
        let build_count = build_count
            .map(|bc| {
                bc.parse::<u32>().map_err(|_| {
                    Error::ParseError(format!("build count numbers must be all numeric: {}", bc))
                })
            })
            .transpose()?;

        Ok(Self {
            version,
            release,
            build_count,
            timestamp: 0,
        })
    }

    fn freeze_timestamp(&self) -> String {
        format!("{}.{:03}", self.timestamp / 1000, self.timestamp % 1000)
    }

    fn thaw_timestamp(s: &str) -> Result<Timestamp> {
        let bad = || Error::ParseError(format!("bad timestamp {}", s));
        let (secs, frac) = match s.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (s, ""),
        };
        let secs: u64 = secs.parse().map_err(|_| bad())?;
        let mut millis = 0u64;
        for (i, c) in frac.chars().take(3).enumerate() {
            let digit = c.to_digit(10).ok_or_else(bad)?;
            millis += u64::from(digit) * 10u64.pow(2 - i as u32);
        }
        Ok(secs * 1000 + millis)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.version, self.release)?;
        if let Some(bc) = self.build_count {
            write!(f, "-{}", bc)?;
        }
        Ok(())
    }
}

/// A branch: zero or more (label, revision) ancestors and a trailing label
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Branch {
    parents: Vec<(Label, Revision)>,
    label: Label,
}

impl Branch {
    /// A trunk branch directly on `label`
    pub fn trunk(label: Label) -> Self {
        Self {
            parents: Vec::new(),
            label,
        }
    }

    pub fn label(&self) -> &Label {
        &self.label
    }

    /// The version this branch was created from
    pub fn parent_version(&self) -> Option<Version> {
        let mut parents = self.parents.clone();
        let (label, revision) = parents.pop()?;
        Some(Version {
            branch: Branch { parents, label },
            revision,
        })
    }

    /// A version on this branch
    pub fn create_version(&self, revision: Revision) -> Version {
        Version {
            branch: self.clone(),
            revision,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match parse_nodes(s, false)? {
            Parsed::Branch(b) => Ok(b),
            Parsed::Version(_) => Err(Error::ParseError(format!("{} is a version, not a branch", s))),
        }
    }

    fn write(&self, f: &mut impl fmt::Write, frozen: bool) -> fmt::Result {
        for (label, revision) in &self.parents {
            write!(f, "/{}/", label)?;
            write_revision(f, revision, frozen)?;
        }
        write!(f, "/{}", self.label)
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, false)
    }
}

fn write_revision(f: &mut impl fmt::Write, revision: &Revision, frozen: bool) -> fmt::Result {
    if frozen {
        write!(f, "{}:{}", revision.freeze_timestamp(), revision)
    } else {
        write!(f, "{}", revision)
    }
}

/// A fully qualified version: a branch plus a trailing revision
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    branch: Branch,
    revision: Revision,
}

impl Version {
    pub fn new(branch: Branch, revision: Revision) -> Self {
        Self { branch, revision }
    }

    /// Parse the display form; all timestamps are zero
    pub fn parse(s: &str) -> Result<Self> {
        match parse_nodes(s, false)? {
            Parsed::Version(v) => Ok(v),
            Parsed::Branch(_) => Err(Error::ParseError(format!("{} is a branch, not a version", s))),
        }
    }

    /// Parse the frozen form produced by [`Version::freeze`]
    pub fn thaw(s: &str) -> Result<Self> {
        match parse_nodes(s, true)? {
            Parsed::Version(v) => Ok(v),
            Parsed::Branch(_) => Err(Error::ParseError(format!("{} is a branch, not a version", s))),
        }
    }

    /// Frozen form including timestamps
    pub fn freeze(&self) -> String {
        let mut s = String::new();
        // writing into a String cannot fail
        let _ = self.branch.write(&mut s, true);
        s.push('/');
        let _ = write_revision(&mut s, &self.revision, true);
        s
    }

    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    pub fn trailing_revision(&self) -> &Revision {
        &self.revision
    }

    pub fn trailing_label(&self) -> &Label {
        &self.branch.label
    }

    /// The version this version's branch was created from
    pub fn parent(&self) -> Option<Version> {
        self.branch.parent_version()
    }

    /// Whether this version lives on a `local@local:*` branch
    pub fn is_local(&self) -> bool {
        self.branch.label.is_local()
    }

    /// Timestamps of every revision, outermost first
    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.branch
            .parents
            .iter()
            .map(|(_, r)| r.timestamp)
            .chain(std::iter::once(self.revision.timestamp))
            .collect()
    }

    /// Whether this version is newer than `other`
    pub fn is_after(&self, other: &Version) -> bool {
        self.revision.timestamp > other.revision.timestamp
    }

    /// Order by trailing timestamp, then by frozen string for determinism
    pub fn cmp_age(&self, other: &Version) -> Ordering {
        self.revision
            .timestamp
            .cmp(&other.revision.timestamp)
            .then_with(|| self.freeze().cmp(&other.freeze()))
    }

    /// A new branch rooted at this version
    pub fn create_branch(&self, label: Label) -> Branch {
        let mut parents = self.branch.parents.clone();
        parents.push((self.branch.label.clone(), self.revision.clone()));
        Branch { parents, label }
    }

    /// A version on a new branch at `label` reusing this version's revision
    ///
    /// Used to name locally modified or synthesized troves, for example
    /// `/repo@ns:1/1.0-1/local@local:LOCAL/1.0-1`.
    pub fn create_shadow(&self, label: Label) -> Version {
        let branch = self.create_branch(label);
        Version {
            branch,
            revision: self.revision.clone(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.branch.write(f, false)?;
        write!(f, "/{}", self.revision)
    }
}

enum Parsed {
    Version(Version),
    Branch(Branch),
}

fn parse_nodes(s: &str, frozen: bool) -> Result<Parsed> {
    let rest = s
        .strip_prefix('/')
        .ok_or_else(|| Error::ParseError(format!("version {} must start with '/'", s)))?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::ParseError(format!("empty node in version {}", s)));
    }

    let mut pairs: Vec<(Label, Revision)> = Vec::new();
    let mut last_label: Option<Label> = None;
    let mut last_revision: Option<Revision> = None;
    let mut i = 0;
    while i < parts.len() {
        let label = Label::parse_with_template(parts[i], last_label.as_ref())?;
        if i + 1 == parts.len() {
            return Ok(Parsed::Branch(Branch {
                parents: pairs,
                label,
            }));
        }
        let node = parts[i + 1];
        let revision = if frozen {
            let (stamp, value) = node.split_once(':').ok_or_else(|| {
                Error::ParseError(format!("frozen revision {} lacks a timestamp", node))
            })?;
            let mut r = Revision::parse(value, last_revision.as_ref())?;
            r.timestamp = Revision::thaw_timestamp(stamp)?;
            r
        } else {
            Revision::parse(node, last_revision.as_ref())?
        };
        last_label = Some(label.clone());
        last_revision = Some(revision.clone());
        pairs.push((label, revision));
        i += 2;
    }

    let (label, revision) = pairs
        .pop()
        .ok_or_else(|| Error::ParseError(format!("empty version {}", s)))?;
    Ok(Parsed::Version(Version {
        branch: Branch {
            parents: pairs,
            label,
        },
        revision,
    }))
}
