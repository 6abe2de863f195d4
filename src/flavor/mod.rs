// src/flavor/mod.rs
//! Flavor parsing, formatting and scoring
//!
//! A flavor is a [`DependencySet`] holding at most the `use` and `is`
//! (instruction set) classes. Written form: `[ssl, !debug, ~vmware, is: x86_64(sse2)]`.
//!
//! Scoring follows the sense table in [`Sense::score`]: the system flavor is
//! the providing side, the trove flavor the requiring side. A `None` score
//! means the trove cannot be installed on that system.

use crate::deps::{Dependency, DependencyClass, DependencySet, Sense};
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Name of the single dependency in the `use` class
const USE_DEP: &str = "use";

/// A build flavor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Flavor {
    deps: DependencySet,
}

impl Flavor {
    /// The empty flavor
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Flavor matching a single architecture with no use flags
    pub fn for_arch(arch: &str) -> Self {
        let mut deps = DependencySet::new();
        deps.add(DependencyClass::InstructionSet, Dependency::new(arch));
        Self { deps }
    }

    pub fn deps(&self) -> &DependencySet {
        &self.deps
    }

    /// Wrap a dependency set, rejecting classes other than `use` and `is`
    pub fn from_deps(deps: DependencySet) -> Result<Self> {
        if let Some(class) = deps
            .classes()
            .find(|c| !matches!(c, DependencyClass::Use | DependencyClass::InstructionSet))
        {
            return Err(Error::ParseError(format!(
                "{} dependencies cannot appear in a flavor",
                class
            )));
        }
        Ok(Self { deps })
    }

    /// Use flags with their senses, sorted by name
    pub fn use_flags(&self) -> impl Iterator<Item = (&str, Sense)> {
        self.deps
            .iter_class(DependencyClass::Use)
            .flat_map(|d| d.flags.iter().map(|(f, s)| (f.as_str(), *s)))
    }

    /// Architectures named by the instruction-set class
    pub fn architectures(&self) -> impl Iterator<Item = &Dependency> {
        self.deps.iter_class(DependencyClass::InstructionSet)
    }

    pub fn freeze(&self) -> String {
        self.deps.freeze()
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        Self::from_deps(DependencySet::thaw(frozen)?)
    }

    /// Parse a flavor specification string
    ///
    /// Examples:
    /// - `[ssl, !debug, is: x86_64]`
    /// - `ssl, !debug` (without brackets)
    /// - `[]` (empty)
    /// - `[is: x86 x86_64(sse2,~3dnow)]` (arch only)
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let inner = if s.starts_with('[') && s.ends_with(']') {
            &s[1..s.len() - 1]
        } else {
            s
        };

        // the is: clause always comes last
        let (use_part, is_part) = match inner.find("is:") {
            Some(pos) => (&inner[..pos], Some(&inner[pos + 3..])),
            None => (inner, None),
        };

        let mut deps = DependencySet::new();

        let mut use_dep = Dependency::new(USE_DEP);
        for item in use_part.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (sense, name) = Sense::parse_with_name(item)?;
            use_dep.flags.insert(name.to_string(), sense);
        }
        if !use_dep.flags.is_empty() {
            deps.add(DependencyClass::Use, use_dep);
        }

        if let Some(is_part) = is_part {
            let archs = split_archs(is_part)?;
            if archs.is_empty() {
                return Err(Error::ParseError(
                    "Empty architecture specification after 'is:'".to_string(),
                ));
            }
            for arch in archs {
                deps.add(DependencyClass::InstructionSet, arch);
            }
        }

        Ok(Self { deps })
    }

    /// Score this (system) flavor against a trove's flavor
    pub fn score(&self, trove: &Flavor) -> Option<i32> {
        self.deps.score(&trove.deps)
    }

    /// Whether a trove of flavor `trove` may be installed on this system
    pub fn satisfies(&self, trove: &Flavor) -> bool {
        self.score(trove).is_some()
    }

    /// Select the best scoring candidate for this system flavor
    pub fn select_best<'a, T>(&self, candidates: &'a [(Flavor, T)]) -> Option<&'a T> {
        candidates
            .iter()
            .filter_map(|(flavor, item)| self.score(flavor).map(|score| (score, item)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, item)| item)
    }
}

/// Split `x86 x86_64(sse2, ~3dnow)` into instruction-set dependencies
fn split_archs(s: &str) -> Result<Vec<Dependency>> {
    let mut out = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let name_end = rest
            .find(|c: char| c.is_whitespace() || c == '(' || c == ',')
            .unwrap_or(rest.len());
        let mut dep = Dependency::new(&rest[..name_end]);
        rest = rest[name_end..].trim_start();
        if let Some(after) = rest.strip_prefix('(') {
            let close = after
                .find(')')
                .ok_or_else(|| Error::ParseError(format!("unclosed '(' in '{}'", s)))?;
            for flag in after[..close].split(',').map(str::trim).filter(|f| !f.is_empty()) {
                let (sense, name) = Sense::parse_with_name(flag)?;
                dep.flags.insert(name.to_string(), sense);
            }
            rest = after[close + 1..].trim_start();
        }
        rest = rest.trim_start_matches(',').trim_start();
        if dep.name.is_empty() {
            return Err(Error::ParseError(format!("bad architecture list '{}'", s)));
        }
        out.push(dep);
    }
    Ok(out)
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }

        let mut parts: Vec<String> = self
            .use_flags()
            .map(|(name, sense)| format!("{}{}", sense.as_prefix(), name))
            .collect();

        let archs: Vec<String> = self
            .architectures()
            .map(|d| {
                if d.flags.is_empty() {
                    d.name.clone()
                } else {
                    let flags: Vec<String> = d
                        .flags
                        .iter()
                        .map(|(n, s)| format!("{}{}", s.as_prefix(), n))
                        .collect();
                    format!("{}({})", d.name, flags.join(","))
                }
            })
            .collect();
        // Architecture always goes last
        if !archs.is_empty() {
            parts.push(format!("is: {}", archs.join(" ")));
        }

        write!(f, "[{}]", parts.join(", "))
    }
}

impl FromStr for Flavor {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Flavor::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_forms() {
        assert!(Flavor::parse("[]").unwrap().is_empty());
        assert!(Flavor::parse("").unwrap().is_empty());
        assert_eq!(Flavor::empty().to_string(), "");
    }

    #[test]
    fn test_parse_mixed_is_canonical() {
        let a = Flavor::parse("[ssl, !debug, is: x86_64]").unwrap();
        let b = Flavor::parse("!debug,ssl is: x86_64").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "[!debug, ssl, is: x86_64]");
        assert_eq!(a.freeze(), "1#x86_64|5#use:!debug:ssl");
    }

    #[test]
    fn test_parse_all_operators() {
        let f = Flavor::parse("[ssl, !debug, ~vmware, ~!xen]").unwrap();
        let flags: Vec<_> = f.use_flags().collect();
        assert_eq!(
            flags,
            vec![
                ("debug", Sense::Disallowed),
                ("ssl", Sense::Required),
                ("vmware", Sense::Preferred),
                ("xen", Sense::PreferNot),
            ]
        );
    }

    #[test]
    fn test_arch_flags_roundtrip() {
        let f = Flavor::parse("[is: x86_64(sse2,~3dnow) x86]").unwrap();
        assert_eq!(f.architectures().count(), 2);
        assert_eq!(f.to_string(), "[is: x86 x86_64(~3dnow,sse2)]");
        assert_eq!(Flavor::parse(&f.to_string()).unwrap(), f);
        assert_eq!(Flavor::thaw(&f.freeze()).unwrap(), f);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Flavor::parse("[is: ]").is_err());
        assert!(Flavor::parse("[!]").is_err());
        assert!(Flavor::parse("[is: x86(sse2]").is_err());
        assert!(Flavor::thaw("4#foo").is_err());
    }

    #[test]
    fn test_scoring_required_and_disallowed() {
        let system = Flavor::parse("[ssl, !debug, is: x86_64]").unwrap();
        assert!(system.satisfies(&Flavor::parse("[ssl, is: x86_64]").unwrap()));
        assert!(!system.satisfies(&Flavor::parse("[debug]").unwrap()));
        assert!(!system.satisfies(&Flavor::parse("[is: aarch64]").unwrap()));
        assert_eq!(system.score(&Flavor::empty()), Some(0));
    }

    #[test]
    fn test_select_best() {
        let candidates = vec![
            (Flavor::parse("[ssl]").unwrap(), "pkg-ssl"),
            (Flavor::parse("[!ssl]").unwrap(), "pkg-no-ssl"),
            (Flavor::parse("[~ssl]").unwrap(), "pkg-prefers-ssl"),
        ];

        let with_ssl = Flavor::parse("[ssl]").unwrap();
        assert_eq!(with_ssl.select_best(&candidates), Some(&"pkg-ssl"));

        let without_ssl = Flavor::parse("[!ssl]").unwrap();
        assert_eq!(without_ssl.select_best(&candidates), Some(&"pkg-no-ssl"));
    }
}
