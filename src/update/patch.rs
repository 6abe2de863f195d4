// src/update/patch.rs

//! Line-based patching for config file merges
//!
//! A config file edited locally is merged by diffing the shipped versions
//! (base to head) and applying that diff to what is on disk. Each hunk is
//! located near the line it was generated for; hunks whose context cannot
//! be found anywhere are reported back instead of aborting, so the caller
//! can write them to a `.conflicts` file and still install the rest.

use crate::error::{Error, Result};
use diffy::{Line, Patch};
use std::path::{Path, PathBuf};

/// Result of applying a diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// The patched text, containing every hunk that applied
    pub text: String,
    /// Hunks that did not apply, rendered as unified diff hunks
    pub failed: Vec<String>,
}

impl PatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Contents for the `.conflicts` file
    pub fn conflicts(&self) -> String {
        self.failed.concat()
    }
}

/// Unified diff turning `old` into `new`
pub fn make_diff(old: &str, new: &str) -> String {
    diffy::create_patch(old, new).to_string()
}

/// Apply a unified diff to `current`
pub fn apply(current: &str, diff: &str) -> Result<PatchOutcome> {
    let patch = Patch::from_str(diff)
        .map_err(|e| Error::ParseError(format!("malformed contents diff: {}", e)))?;
    Ok(apply_patch(current, &patch))
}

/// Merge the change from `base` to `head` into `local`
pub fn three_way(base: &str, local: &str, head: &str) -> PatchOutcome {
    if local == base {
        return PatchOutcome {
            text: head.to_string(),
            failed: Vec::new(),
        };
    }
    if base == head || local == head {
        return PatchOutcome {
            text: local.to_string(),
            failed: Vec::new(),
        };
    }
    let patch = diffy::create_patch(base, head);
    apply_patch(local, &patch)
}

/// Sibling path that receives failed hunks
pub fn conflicts_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".conflicts");
    PathBuf::from(name)
}

fn apply_patch(current: &str, patch: &Patch<'_, str>) -> PatchOutcome {
    let lines: Vec<&str> = current.split_inclusive('\n').collect();
    let mut out = String::with_capacity(current.len());
    let mut failed = Vec::new();
    let mut cursor = 0usize;
    // drift between where hunks were generated and where they landed
    let mut offset: isize = 0;

    for hunk in patch.hunks() {
        let mut old = Vec::new();
        let mut new = Vec::new();
        for line in hunk.lines() {
            match line {
                Line::Context(s) => {
                    old.push(*s);
                    new.push(*s);
                }
                Line::Delete(s) => old.push(*s),
                Line::Insert(s) => new.push(*s),
            }
        }

        let range = hunk.old_range();
        // ranges are 1-based; an empty range names the line it follows
        let generated = if range.len() == 0 {
            range.start()
        } else {
            range.start().saturating_sub(1)
        };
        let wanted = (generated as isize + offset).max(cursor as isize) as usize;

        match find_block(&lines, &old, wanted, cursor) {
            Some(at) => {
                for line in &lines[cursor..at] {
                    out.push_str(line);
                }
                for line in &new {
                    out.push_str(line);
                }
                offset = at as isize - generated as isize;
                cursor = at + old.len();
            }
            None => {
                let new_range = hunk.new_range();
                failed.push(render_hunk(
                    (range.start(), range.len()),
                    (new_range.start(), new_range.len()),
                    hunk.lines(),
                ));
            }
        }
    }

    for line in &lines[cursor..] {
        out.push_str(line);
    }
    PatchOutcome { text: out, failed }
}

/// Position of `block` in `lines`, searching outward from `wanted` but never
/// before `floor`
fn find_block(lines: &[&str], block: &[&str], wanted: usize, floor: usize) -> Option<usize> {
    let fits = |at: usize| {
        at >= floor && at + block.len() <= lines.len() && lines[at..at + block.len()] == *block
    };
    if fits(wanted) {
        return Some(wanted);
    }
    for distance in 1..=lines.len() {
        if let Some(at) = wanted.checked_sub(distance)
            && fits(at)
        {
            return Some(at);
        }
        if fits(wanted + distance) {
            return Some(wanted + distance);
        }
    }
    None
}

fn render_hunk(old: (usize, usize), new: (usize, usize), lines: &[Line<'_, str>]) -> String {
    let mut out = format!("@@ -{},{} +{},{} @@\n", old.0, old.1, new.0, new.1);
    for line in lines {
        let (prefix, text) = match line {
            Line::Context(s) => (' ', *s),
            Line::Delete(s) => ('-', *s),
            Line::Insert(s) => ('+', *s),
        };
        out.push(prefix);
        out.push_str(text);
        if !text.ends_with('\n') {
            out.push_str("\n\\ No newline at end of file\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_local_append() {
        let out = three_way("first\n", "first\nnew", "second\n");
        assert!(out.is_clean());
        assert_eq!(out.text, "second\nnew");
    }

    #[test]
    fn test_trivial_sides() {
        assert_eq!(three_way("a\n", "a\n", "b\n").text, "b\n");
        assert_eq!(three_way("a\n", "c\n", "a\n").text, "c\n");
        assert_eq!(three_way("a\n", "b\n", "b\n").text, "b\n");
    }

    #[test]
    fn test_hunk_found_after_local_insertions() {
        let base = "one\ntwo\nthree\nfour\nfive\nsix\nseven\n";
        let head = "one\ntwo\nthree\nfour\nfive\nsix\nSEVEN\n";
        let local = "zero\nzero\none\ntwo\nthree\nfour\nfive\nsix\nseven\n";
        let out = three_way(base, local, head);
        assert!(out.is_clean());
        assert_eq!(out.text, "zero\nzero\none\ntwo\nthree\nfour\nfive\nsix\nSEVEN\n");
    }

    #[test]
    fn test_conflicting_hunk_reported() {
        let base = "a\nb\nc\n";
        let head = "a\nB\nc\n";
        let local = "x\ny\nz\n";
        let out = three_way(base, local, head);
        assert_eq!(out.text, local);
        assert_eq!(out.failed.len(), 1);
        assert!(out.conflicts().contains("+B"));
    }

    #[test]
    fn test_apply_text_diff() {
        let diff = make_diff("a\nb\n", "a\nc\n");
        let out = apply("a\nb\n", &diff).unwrap();
        assert_eq!(out.text, "a\nc\n");
    }

    #[test]
    fn test_conflicts_path() {
        assert_eq!(
            conflicts_path(Path::new("/etc/foo.conf")),
            PathBuf::from("/etc/foo.conf.conflicts")
        );
    }
}
