// src/db/config_cache.rs

//! Pristine contents of installed config files
//!
//! Three-way merges of config files need the contents the installed version
//! shipped with, and the filesystem only has the locally edited copy. Every
//! config file restored by an apply is stored here, addressed by the sha1 of
//! its contents, at `config-contents/{first2}/{rest}`.

use crate::error::{Error, Result};
use crate::hash::Sha1Digest;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content-addressed store of config file contents
#[derive(Debug, Clone)]
pub struct ConfigCache {
    dir: PathBuf,
}

impl ConfigCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store contents and return their sha1; existing entries are kept
    pub fn store(&self, contents: &[u8]) -> Result<Sha1Digest> {
        let sha1 = Sha1Digest::of(contents);
        let path = self.path_for(&sha1);
        if path.exists() {
            return Ok(sha1);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        debug!("Cached config contents {} ({} bytes)", sha1, contents.len());
        Ok(sha1)
    }

    /// Contents for `sha1`, verified; `None` if never stored
    pub fn get(&self, sha1: &Sha1Digest) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(sha1);
        let contents = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let found = Sha1Digest::of(&contents);
        if found != *sha1 {
            return Err(Error::IoError(format!(
                "config cache entry {} is corrupt (contents hash to {})",
                sha1, found
            )));
        }
        Ok(Some(contents))
    }

    pub fn contains(&self, sha1: &Sha1Digest) -> bool {
        self.path_for(sha1).exists()
    }

    /// Drop an entry no installed trove references any more
    pub fn remove(&self, sha1: &Sha1Digest) -> Result<()> {
        match fs::remove_file(self.path_for(sha1)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn path_for(&self, sha1: &Sha1Digest) -> PathBuf {
        let hex = sha1.to_hex();
        let (prefix, rest) = hex.split_at(2);
        self.dir.join(prefix).join(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_get() {
        let dir = TempDir::new().unwrap();
        let cache = ConfigCache::new(dir.path().join("config-contents"));

        let sha1 = cache.store(b"first\n").unwrap();
        assert_eq!(sha1, Sha1Digest::of(b"first\n"));
        assert!(cache.contains(&sha1));
        assert_eq!(cache.get(&sha1).unwrap().unwrap(), b"first\n");

        // storing twice is a no-op
        assert_eq!(cache.store(b"first\n").unwrap(), sha1);

        cache.remove(&sha1).unwrap();
        assert!(cache.get(&sha1).unwrap().is_none());
        cache.remove(&sha1).unwrap();
    }

    #[test]
    fn test_corrupt_entry_is_error() {
        let dir = TempDir::new().unwrap();
        let cache = ConfigCache::new(dir.path());
        let sha1 = cache.store(b"good").unwrap();
        fs::write(cache.path_for(&sha1), b"bad").unwrap();
        assert!(cache.get(&sha1).is_err());
    }
}
