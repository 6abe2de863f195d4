// src/trigger/description.rs

//! Tag description files

use crate::error::{Error, Result};
use crate::filesystem::path::{normalize, relative_to_root};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

/// How a handler receives its file list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DataSource {
    /// Paths on the command line
    #[default]
    Args,
    /// One path per line on stdin
    Stdin,
    /// Alternating lines of space separated tags and a path
    MultiTag,
}

/// Calls a handler accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Implements {
    FilesUpdate,
    FilesPreUpdate,
    FilesRemove,
    FilesPreRemove,
    HandlerUpdate,
    HandlerPreRemove,
}

impl FromStr for Implements {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let words: Vec<&str> = s.split_whitespace().collect();
        match words.as_slice() {
            ["files", "update"] => Ok(Implements::FilesUpdate),
            ["files", "preupdate"] => Ok(Implements::FilesPreUpdate),
            ["files", "remove"] => Ok(Implements::FilesRemove),
            ["files", "preremove"] => Ok(Implements::FilesPreRemove),
            ["handler", "update"] => Ok(Implements::HandlerUpdate),
            ["handler", "preremove"] => Ok(Implements::HandlerPreRemove),
            [_] => Err(Error::ParseError(format!(
                "missing type/action in \"implements {}\"",
                s
            ))),
            _ => Err(Error::ParseError(format!("unknown implements value \"{}\"", s))),
        }
    }
}

/// One parsed tag description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDescription {
    /// Tag name; the description's file name
    pub tag: String,
    /// Handler program, as a path inside the root
    pub file: String,
    /// Where the description lives, inside the root
    pub description_path: String,
    pub datasource: DataSource,
    pub implements: BTreeSet<Implements>,
}

impl TagDescription {
    /// Parse description text for `tag`
    pub fn parse(tag: &str, description_path: &str, text: &str) -> Result<Self> {
        let mut file = None;
        let mut datasource = DataSource::default();
        let mut implements = BTreeSet::new();

        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "file" => file = Some(normalize(value)),
                "datasource" => {
                    datasource = DataSource::from_str(value).map_err(|_| {
                        Error::ParseError(format!(
                            "{}:{}: unknown datasource {}",
                            description_path,
                            n + 1,
                            value
                        ))
                    })?;
                }
                "implements" => {
                    // old handler protocol name, ignored
                    if value.starts_with("description ") {
                        continue;
                    }
                    implements.insert(value.parse::<Implements>()?);
                }
                // build-time keys
                "name" | "description" | "include" | "exclude" => {}
                other => debug!("{}: ignoring {}", description_path, other),
            }
        }

        let file = file.ok_or_else(|| {
            Error::ParseError(format!("{}: no handler file given", description_path))
        })?;
        Ok(Self {
            tag: tag.to_string(),
            file,
            description_path: normalize(description_path),
            datasource,
            implements,
        })
    }

    /// Read the description at trove path `path` under `root`
    pub fn load(root: &Path, path: &str) -> Result<Self> {
        let path = normalize(path);
        let tag = path
            .rsplit('/')
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::InvalidPath(path.clone()))?;
        let host = root.join(path.trim_start_matches('/'));
        let text = fs::read_to_string(&host)?;
        Self::parse(tag, &path, &text)
    }
}

/// Every description in `tag_dir` (a host path under `root`), keyed by tag
///
/// A missing directory yields an empty map; hidden files are skipped and
/// unreadable descriptions are logged and skipped.
pub fn load_tag_dict(root: &Path, tag_dir: &Path) -> Result<BTreeMap<String, TagDescription>> {
    let mut out = BTreeMap::new();
    if !tag_dir.is_dir() {
        return Ok(out);
    }
    let pattern = tag_dir.join("*");
    let options = glob::MatchOptions {
        require_literal_leading_dot: true,
        ..Default::default()
    };
    let entries = glob::glob_with(&pattern.to_string_lossy(), options)
        .map_err(|e| Error::ParseError(e.to_string()))?;

    for entry in entries {
        let host = entry.map_err(|e| Error::IoError(e.to_string()))?;
        if !host.is_file() {
            continue;
        }
        let Some(path) = relative_to_root(root, &host) else {
            continue;
        };
        match TagDescription::load(root, &path) {
            Ok(desc) => {
                out.insert(desc.tag.clone(), desc);
            }
            Err(e) => warn!("skipping tag description {}: {}", host.display(), e),
        }
    }
    Ok(out)
}
