// src/filesystem/path.rs

//! Path handling for trove paths under an install root
//!
//! Trove paths are absolute ("/usr/bin/foo") and always interpreted
//! relative to the root being managed. Paths come from change sets and
//! foreign package headers, so they are sanitized before they are joined
//! with the root.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Sanitize a trove path into a relative path
///
/// Rejects `..` components and empty results, drops `.` components and
/// strips leading slashes.
///
/// ```
/// use conary_engine::filesystem::path::sanitize_path;
/// use std::path::PathBuf;
///
/// assert_eq!(sanitize_path("/usr/bin/foo").unwrap(), PathBuf::from("usr/bin/foo"));
/// assert!(sanitize_path("usr/../../etc/passwd").is_err());
/// ```
pub fn sanitize_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let path_str = path.to_string_lossy();
    let relative = path_str.trim_start_matches('/');

    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir => {}
            Component::ParentDir => return Err(Error::PathTraversal(path_str.to_string())),
            Component::Prefix(_) | Component::RootDir => {}
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidPath("Empty path after sanitization".to_string()));
    }
    Ok(normalized)
}

/// Join a trove path onto `root`, refusing anything that escapes it
///
/// ```
/// use conary_engine::filesystem::path::safe_join;
/// use std::path::{Path, PathBuf};
///
/// let root = Path::new("/srv/root");
/// assert_eq!(safe_join(root, "/etc/foo").unwrap(), PathBuf::from("/srv/root/etc/foo"));
/// assert!(safe_join(root, "../etc/passwd").is_err());
/// ```
pub fn safe_join(root: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<PathBuf> {
    let root = root.as_ref();
    let joined = root.join(sanitize_path(path.as_ref())?);

    // symlinks inside the root may still point out of it
    if let (Ok(canonical_root), Ok(canonical_joined)) = (root.canonicalize(), joined.canonicalize())
        && !canonical_joined.starts_with(&canonical_root)
    {
        return Err(Error::PathTraversal(format!(
            "Path {} escapes root {}",
            joined.display(),
            root.display()
        )));
    }
    Ok(joined)
}

/// Canonical form of a trove path: one leading slash, no empty or `.`
/// components, no trailing slash
///
/// This is the form handed to tag handlers and stored in the journal.
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for part in path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Trove path of `full`, which lies under `root`
pub fn relative_to_root(root: &Path, full: &Path) -> Option<String> {
    let rel = full.strip_prefix(root).ok()?;
    Some(normalize(&rel.to_string_lossy()))
}

/// Parent directory of a normalized trove path; `None` for "/"
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Whether `path` sits at or below `dir`
pub fn is_under(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}
