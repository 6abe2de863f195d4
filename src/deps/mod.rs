// src/deps/mod.rs

//! Typed dependencies and dependency sets
//!
//! A dependency is a name within a class (`soname: ELF64/libc.so.6`) plus a
//! set of flags, each with a [`Sense`]. Provides and requires of a trove are
//! [`DependencySet`]s; a flavor is a dependency set restricted to the
//! instruction-set and use classes.
//!
//! The frozen form is `class#name:flag:flag|class#name...` with classes and
//! names in sorted order. `:` and `|` inside names or flags are doubled.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumIter, EnumString};

/// Dependency classes, numbered as they are stored
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum DependencyClass {
    Abi,
    #[strum(serialize = "is")]
    InstructionSet,
    #[strum(serialize = "oldsoname")]
    OldSoname,
    File,
    Trove,
    Use,
    Soname,
    #[strum(serialize = "userinfo")]
    UserInfo,
    #[strum(serialize = "groupinfo")]
    GroupInfo,
    Cil,
    Java,
    Python,
    Perl,
    Ruby,
    Php,
    Rpm,
    #[strum(serialize = "rpmlib")]
    RpmLib,
}

impl DependencyClass {
    pub fn tag(self) -> u32 {
        match self {
            Self::Abi => 0,
            Self::InstructionSet => 1,
            Self::OldSoname => 2,
            Self::File => 3,
            Self::Trove => 4,
            Self::Use => 5,
            Self::Soname => 6,
            Self::UserInfo => 7,
            Self::GroupInfo => 8,
            Self::Cil => 9,
            Self::Java => 10,
            Self::Python => 11,
            Self::Perl => 12,
            Self::Ruby => 13,
            Self::Php => 14,
            Self::Rpm => 16,
            Self::RpmLib => 17,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self> {
        Ok(match tag {
            0 => Self::Abi,
            1 => Self::InstructionSet,
            2 => Self::OldSoname,
            3 => Self::File,
            4 => Self::Trove,
            5 => Self::Use,
            6 => Self::Soname,
            7 => Self::UserInfo,
            8 => Self::GroupInfo,
            9 => Self::Cil,
            10 => Self::Java,
            11 => Self::Python,
            12 => Self::Perl,
            13 => Self::Ruby,
            14 => Self::Php,
            16 => Self::Rpm,
            17 => Self::RpmLib,
            other => {
                return Err(Error::ParseError(format!(
                    "unknown dependency class {}",
                    other
                )));
            }
        })
    }
}

/// Sense of a dependency flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sense {
    /// No prefix
    Required,
    /// `~`
    Preferred,
    /// `~!`
    PreferNot,
    /// `!`
    Disallowed,
}

impl Sense {
    pub fn as_prefix(&self) -> &'static str {
        match self {
            Self::Required => "",
            Self::Preferred => "~",
            Self::PreferNot => "~!",
            Self::Disallowed => "!",
        }
    }

    /// Split a prefixed flag into its sense and name
    pub fn parse_with_name(s: &str) -> Result<(Self, &str)> {
        let s = s.trim();
        let (sense, name) = if let Some(rest) = s.strip_prefix("~!") {
            (Self::PreferNot, rest)
        } else if let Some(rest) = s.strip_prefix('~') {
            (Self::Preferred, rest)
        } else if let Some(rest) = s.strip_prefix('!') {
            (Self::Disallowed, rest)
        } else {
            (Self::Required, s)
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::ParseError(format!("missing flag name in '{}'", s)));
        }
        Ok((sense, name))
    }

    /// Required/Disallowed counterpart of a soft sense
    pub fn to_strong(self) -> Self {
        match self {
            Self::Required | Self::Preferred => Self::Required,
            Self::Disallowed | Self::PreferNot => Self::Disallowed,
        }
    }

    /// Score of a system flag sense (`None` when the system lacks the flag)
    /// against a required sense; `None` means incompatible.
    pub fn score(system: Option<Sense>, required: Sense) -> Option<i32> {
        use Sense::*;
        match (system, required) {
            (None, Required) => None,
            (None, Disallowed) => Some(0),
            (None, Preferred) => Some(-1),
            (None, PreferNot) => Some(1),

            (Some(Required), Required) => Some(2),
            (Some(Required), Disallowed) => None,
            (Some(Required), Preferred) => Some(1),
            (Some(Required), PreferNot) => None,

            (Some(Disallowed), Required) => None,
            (Some(Disallowed), Disallowed) => Some(2),
            (Some(Disallowed), Preferred) => None,
            (Some(Disallowed), PreferNot) => Some(1),

            (Some(Preferred), Required) => Some(1),
            (Some(Preferred), Disallowed) => None,
            (Some(Preferred), Preferred) => Some(2),
            (Some(Preferred), PreferNot) => Some(-1),

            (Some(PreferNot), Required) => Some(-2),
            (Some(PreferNot), Disallowed) => Some(1),
            (Some(PreferNot), Preferred) => Some(-1),
            (Some(PreferNot), PreferNot) => Some(1),
        }
    }
}

/// A single named dependency with flags
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dependency {
    pub name: String,
    pub flags: BTreeMap<String, Sense>,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: BTreeMap::new(),
        }
    }

    /// Add a required flag
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into(), Sense::Required);
        self
    }

    pub fn with_sensed_flag(mut self, flag: impl Into<String>, sense: Sense) -> Self {
        self.flags.insert(flag.into(), sense);
        self
    }

    /// Score of this (provided) dependency against `required`
    pub fn score(&self, required: &Dependency) -> Option<i32> {
        if self.name != required.name {
            return None;
        }
        let mut score = 0;
        for (flag, sense) in &required.flags {
            score += Sense::score(self.flags.get(flag).copied(), *sense)?;
        }
        Some(score)
    }

    /// Score when the providing side has nothing for this name
    fn empty_score(&self) -> Option<i32> {
        if self.flags.is_empty() {
            return None;
        }
        let mut score = 0;
        for sense in self.flags.values() {
            score += Sense::score(None, *sense)?;
        }
        Some(score)
    }

    pub fn satisfies(&self, required: &Dependency) -> bool {
        self.score(required).is_some()
    }

    fn freeze(&self) -> String {
        let mut out = escape(&self.name);
        for (flag, sense) in &self.flags {
            out.push(':');
            out.push_str(sense.as_prefix());
            out.push_str(&escape(flag));
        }
        out
    }

    fn thaw(frozen: &str) -> Result<Self> {
        let mut parts = split_unescaped(frozen, ':').into_iter();
        let name = parts
            .next()
            .ok_or_else(|| Error::ParseError("empty dependency".to_string()))?;
        let mut dep = Dependency::new(name);
        for flag in parts {
            let (sense, flag_name) = if let Some(rest) = flag.strip_prefix("~!") {
                (Sense::PreferNot, rest)
            } else if let Some(rest) = flag.strip_prefix('!') {
                (Sense::Disallowed, rest)
            } else if let Some(rest) = flag.strip_prefix('~') {
                (Sense::Preferred, rest)
            } else {
                (Sense::Required, flag.as_str())
            };
            dep.flags.insert(flag_name.to_string(), sense);
        }
        Ok(dep)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flags.is_empty() {
            return write!(f, "{}", self.name);
        }
        let flags: Vec<String> = self
            .flags
            .iter()
            .map(|(flag, sense)| format!("{}{}", sense.as_prefix(), flag))
            .collect();
        write!(f, "{}({})", self.name, flags.join(" "))
    }
}

fn escape(s: &str) -> String {
    s.replace(':', "::").replace('|', "||")
}

/// Split on single occurrences of `sep`, turning doubled separators into
/// literal characters
fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == sep {
            if chars.peek() == Some(&sep) {
                chars.next();
                current.push(sep);
            } else {
                out.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    out.push(current);
    out
}

/// A set of dependencies grouped by class
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DependencySet {
    members: BTreeMap<DependencyClass, BTreeMap<String, Dependency>>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency, merging flags with an existing one of the same name
    pub fn add(&mut self, class: DependencyClass, dep: Dependency) {
        let members = self.members.entry(class).or_default();
        match members.get_mut(&dep.name) {
            Some(existing) => existing.flags.extend(dep.flags),
            None => {
                members.insert(dep.name.clone(), dep);
            }
        }
    }

    pub fn with(mut self, class: DependencyClass, dep: Dependency) -> Self {
        self.add(class, dep);
        self
    }

    /// Record a class with no members (meaningful for flavors)
    pub fn add_empty_class(&mut self, class: DependencyClass) {
        self.members.entry(class).or_default();
    }

    pub fn remove(&mut self, class: DependencyClass, name: &str) {
        if let Some(members) = self.members.get_mut(&class) {
            members.remove(name);
            if members.is_empty() {
                self.members.remove(&class);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.values().all(|m| m.is_empty())
    }

    pub fn len(&self) -> usize {
        self.members.values().map(|m| m.len()).sum()
    }

    /// Every (class, dependency), classes and names in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (DependencyClass, &Dependency)> {
        self.members
            .iter()
            .flat_map(|(class, deps)| deps.values().map(move |d| (*class, d)))
    }

    pub fn iter_class(&self, class: DependencyClass) -> impl Iterator<Item = &Dependency> {
        self.members.get(&class).into_iter().flat_map(|m| m.values())
    }

    pub fn classes(&self) -> impl Iterator<Item = DependencyClass> + '_ {
        self.members.keys().copied()
    }

    pub fn contains(&self, class: DependencyClass, dep: &Dependency) -> bool {
        self.members
            .get(&class)
            .and_then(|m| m.get(&dep.name))
            .is_some_and(|d| d == dep)
    }

    pub fn union(&mut self, other: &DependencySet) {
        for (class, deps) in &other.members {
            if deps.is_empty() {
                self.add_empty_class(*class);
            }
            for dep in deps.values() {
                self.add(*class, dep.clone());
            }
        }
    }

    /// Dependencies of `self` that are not exactly present in `other`
    pub fn difference(&self, other: &DependencySet) -> DependencySet {
        let mut out = DependencySet::new();
        for (class, dep) in self.iter() {
            if !other.contains(class, dep) {
                out.add(class, dep.clone());
            }
        }
        out
    }

    /// Dependencies exactly present in both sets
    pub fn intersection(&self, other: &DependencySet) -> DependencySet {
        let mut out = DependencySet::new();
        for (class, dep) in self.iter() {
            if other.contains(class, dep) {
                out.add(class, dep.clone());
            }
        }
        out
    }

    /// Score this set (the system or provider) against `required`.
    /// `None` means the requirement is not met.
    pub fn score(&self, required: &DependencySet) -> Option<i32> {
        let mut total = 0;
        for (class, req_deps) in &required.members {
            if req_deps.is_empty() {
                continue;
            }
            let ours = self.members.get(class);
            for req in req_deps.values() {
                let s = match ours.and_then(|m| m.get(&req.name)) {
                    Some(have) => have.score(req)?,
                    None => req.empty_score()?,
                };
                total += s;
            }
        }
        Some(total)
    }

    /// Whether every dependency in `required` is provided by this set
    pub fn satisfies(&self, required: &DependencySet) -> bool {
        self.score(required).is_some()
    }

    /// Canonical frozen form
    pub fn freeze(&self) -> String {
        self.iter()
            .map(|(class, dep)| format!("{}#{}", class.tag(), dep.freeze()))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        let mut set = DependencySet::new();
        if frozen.is_empty() {
            return Ok(set);
        }
        for item in split_unescaped(frozen, '|') {
            let (tag, dep) = item
                .split_once('#')
                .ok_or_else(|| Error::ParseError(format!("bad frozen dependency {}", item)))?;
            let tag: u32 = tag
                .parse()
                .map_err(|_| Error::ParseError(format!("bad dependency class {}", tag)))?;
            set.add(DependencyClass::from_tag(tag)?, Dependency::thaw(dep)?);
        }
        Ok(set)
    }

    /// Parse the display form: one `class: name(flag flag)` per line
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = DependencySet::new();
        for line in s.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (class, rest) = line
                .split_once(':')
                .ok_or_else(|| Error::ParseError(format!("missing class in '{}'", line)))?;
            let class = DependencyClass::from_str(class.trim())
                .map_err(|_| Error::ParseError(format!("no such dependency class {}", class)))?;
            let rest = rest.trim();
            let dep = match rest.find('(') {
                Some(open) if rest.ends_with(')') => {
                    let mut dep = Dependency::new(rest[..open].trim());
                    for flag in rest[open + 1..rest.len() - 1].split_whitespace() {
                        let (sense, name) = Sense::parse_with_name(flag)?;
                        dep.flags.insert(name.to_string(), sense);
                    }
                    dep
                }
                _ => Dependency::new(rest),
            };
            if dep.name.is_empty() {
                return Err(Error::ParseError(format!("empty dependency in '{}'", line)));
            }
            set.add(class, dep);
        }
        Ok(set)
    }
}

impl fmt::Display for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .iter()
            .map(|(class, dep)| format!("{}: {}", class, dep))
            .collect();
        write!(f, "{}", lines.join("\n"))
    }
}
