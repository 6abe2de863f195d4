// src/resolver/mod.rs

//! Dependency checking, job ordering and provider resolution
//!
//! [`DependencyChecker`] validates a proposed set of jobs against the
//! installed database: every requirement of a new trove must be provided by
//! something that is installed (and stays installed) or arrives in the same
//! job set, and no installed trove may lose the provider of one of its
//! requirements. On request it also orders the jobs so providers land before
//! requirers and requirers leave before providers.
//!
//! [`resolve`] answers the other question: which candidate troves would
//! satisfy a set of dependencies.

mod check;
mod graph;

pub use check::{CheckOutcome, DependencyChecker};
pub use graph::{JobGraph, order_key};

use crate::deps::{Dependency, DependencyClass, DependencySet};
use crate::label::Label;
use crate::trove::{Trove, TroveTuple};
use std::collections::BTreeMap;
use std::fmt;

/// One unit of change: install (no old), erase (no new) or update
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Job {
    pub old: Option<TroveTuple>,
    pub new: Option<TroveTuple>,
}

impl Job {
    pub fn install(new: TroveTuple) -> Self {
        Self {
            old: None,
            new: Some(new),
        }
    }

    pub fn erase(old: TroveTuple) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }

    pub fn update(old: TroveTuple, new: TroveTuple) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn name(&self) -> &str {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|t| t.name.as_str())
            .unwrap_or_default()
    }

    /// The tuple the job is best described by
    pub fn primary(&self) -> Option<&TroveTuple> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.old, &self.new) {
            (None, Some(new)) => write!(f, "install {}", new),
            (Some(old), None) => write!(f, "erase {}", old),
            (Some(old), Some(new)) => write!(f, "update {} -> {}", old, new),
            (None, None) => write!(f, "empty job"),
        }
    }
}

/// Requirements that a job set leaves unmet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyFailure {
    /// Requirements of new troves that nothing provides
    pub unsatisfied: Vec<(TroveTuple, DependencySet)>,
    /// Requirements of installed troves whose provider is being removed
    pub unresolveable: Vec<(TroveTuple, DependencySet)>,
}

impl DependencyFailure {
    pub fn is_empty(&self) -> bool {
        self.unsatisfied.is_empty() && self.unresolveable.is_empty()
    }
}

impl fmt::Display for DependencyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (label, list) in [
            ("The following dependencies could not be resolved:", &self.unsatisfied),
            (
                "The following dependencies would no longer be satisfied:",
                &self.unresolveable,
            ),
        ] {
            if list.is_empty() {
                continue;
            }
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{}", label)?;
            for (tuple, deps) in list {
                write!(f, "\n    {}:", tuple)?;
                for (class, dep) in deps.iter() {
                    write!(f, "\n\t{}: {}", class, dep)?;
                }
            }
        }
        Ok(())
    }
}

/// Where [`resolve`] may look for providers
#[derive(Debug, Clone, Copy)]
pub enum ResolveScope<'a> {
    /// Any candidate
    Any,
    /// Only candidates whose version lives on this label
    Label(&'a Label),
}

/// Providers for each dependency of each request
///
/// Output is parallel to `requests`; a dependency no candidate provides maps
/// to an empty list. When several versions of the same (name, flavor)
/// qualify only the newest is kept.
pub fn resolve(
    requests: &[DependencySet],
    candidates: &[Trove],
    scope: ResolveScope<'_>,
) -> Vec<BTreeMap<(DependencyClass, Dependency), Vec<TroveTuple>>> {
    let mut ordered: Vec<&Trove> = candidates
        .iter()
        .filter(|t| match scope {
            ResolveScope::Any => true,
            ResolveScope::Label(label) => t.version.trailing_label() == label,
        })
        .collect();
    // newest first so duplicates collapse onto the latest version
    ordered.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| b.version.cmp_age(&a.version))
    });

    requests
        .iter()
        .map(|request| {
            let mut found = BTreeMap::new();
            for (class, dep) in request.iter() {
                let mut providers: Vec<TroveTuple> = Vec::new();
                for trove in &ordered {
                    let single = DependencySet::new().with(class, dep.clone());
                    if !trove.provides.satisfies(&single) {
                        continue;
                    }
                    if providers
                        .iter()
                        .any(|p| p.name == trove.name && p.flavor == trove.flavor)
                    {
                        continue;
                    }
                    providers.push(trove.tuple());
                }
                found.insert((class, dep.clone()), providers);
            }
            found
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::Flavor;
    use crate::version::Version;

    fn trove(name: &str, version: &str, provides: &[&str]) -> Trove {
        let mut t = Trove::new(name, Version::parse(version).unwrap(), Flavor::empty());
        for p in provides {
            t.provides.add(DependencyClass::Soname, Dependency::new(*p));
        }
        t
    }

    #[test]
    fn test_resolve_picks_latest_per_name() {
        let candidates = vec![
            trove("libfoo:lib", "/conary.example.com@rpl:1/1.0-1-1", &["libfoo.so.1"]),
            trove("libfoo:lib", "/conary.example.com@rpl:1/2.0-1-1", &["libfoo.so.1"]),
            trove("other:lib", "/conary.example.com@rpl:1/1.0-1-1", &["libbar.so.1"]),
        ];
        let request = DependencySet::new()
            .with(DependencyClass::Soname, Dependency::new("libfoo.so.1"))
            .with(DependencyClass::Soname, Dependency::new("libmissing.so.1"));

        let result = resolve(&[request], &candidates, ResolveScope::Any);
        assert_eq!(result.len(), 1);
        let foo = &result[0][&(DependencyClass::Soname, Dependency::new("libfoo.so.1"))];
        assert_eq!(foo.len(), 1);
        assert_eq!(foo[0].version.trailing_revision().to_string(), "2.0-1-1");
        let missing = &result[0][&(DependencyClass::Soname, Dependency::new("libmissing.so.1"))];
        assert!(missing.is_empty());
    }

    #[test]
    fn test_resolve_respects_label_scope() {
        let candidates = vec![
            trove("a:lib", "/conary.example.com@rpl:1/1.0-1-1", &["liba.so"]),
            trove("b:lib", "/other.example.com@rpl:1/1.0-1-1", &["liba.so"]),
        ];
        let label = Label::parse("other.example.com@rpl:1").unwrap();
        let request = DependencySet::new().with(DependencyClass::Soname, Dependency::new("liba.so"));
        let result = resolve(&[request], &candidates, ResolveScope::Label(&label));
        let found = &result[0][&(DependencyClass::Soname, Dependency::new("liba.so"))];
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "b:lib");
    }

    #[test]
    fn test_failure_display() {
        let tuple = TroveTuple::new(
            "a:runtime",
            Version::parse("/conary.example.com@rpl:1/1.0-1-1").unwrap(),
            Flavor::empty(),
        );
        let failure = DependencyFailure {
            unsatisfied: vec![(
                tuple,
                DependencySet::new().with(DependencyClass::Trove, Dependency::new("d:runtime")),
            )],
            unresolveable: Vec::new(),
        };
        let text = failure.to_string();
        assert!(text.contains("could not be resolved"));
        assert!(text.contains("a:runtime"));
        assert!(text.contains("trove: d:runtime"));
    }
}
