// src/engine/restart.rs

//! Restart marker left behind by a critical update
//!
//! After the critical troves are in place the jobs still to run are saved
//! as a change set next to a JSON marker. The restarted process calls
//! [`super::Engine::resume`] to finish them.

use crate::config::UpdateFlags;
use crate::db::paths;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::resolver::Job;
use crate::trove::TroveTuple;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A trove tuple in frozen string form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenTuple {
    pub name: String,
    pub version: String,
    pub flavor: String,
}

impl FrozenTuple {
    pub fn freeze(tuple: &TroveTuple) -> Self {
        Self {
            name: tuple.name.clone(),
            version: tuple.version.freeze(),
            flavor: tuple.flavor.freeze(),
        }
    }

    pub fn thaw(&self) -> Result<TroveTuple> {
        Ok(TroveTuple::new(
            self.name.clone(),
            Version::thaw(&self.version)?,
            Flavor::thaw(&self.flavor)?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenJob {
    pub old: Option<FrozenTuple>,
    pub new: Option<FrozenTuple>,
}

impl FrozenJob {
    pub fn freeze(job: &Job) -> Self {
        Self {
            old: job.old.as_ref().map(FrozenTuple::freeze),
            new: job.new.as_ref().map(FrozenTuple::freeze),
        }
    }

    pub fn thaw(&self) -> Result<Job> {
        Ok(Job {
            old: self.old.as_ref().map(FrozenTuple::thaw).transpose()?,
            new: self.new.as_ref().map(FrozenTuple::thaw).transpose()?,
        })
    }
}

/// Contents of `restart-info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartInfo {
    /// Change set holding the remaining jobs
    pub changeset: PathBuf,
    pub jobs: Vec<FrozenJob>,
    /// Update flags of the interrupted apply
    pub flags: u32,
    /// When the marker was written (RFC 3339)
    pub created: String,
}

impl RestartInfo {
    pub fn new(changeset: PathBuf, jobs: &[Job], flags: UpdateFlags) -> Self {
        Self {
            changeset,
            jobs: jobs.iter().map(FrozenJob::freeze).collect(),
            flags: flags.bits(),
            created: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn flags(&self) -> UpdateFlags {
        UpdateFlags::from_bits(self.flags)
    }

    pub fn jobs(&self) -> Result<Vec<Job>> {
        self.jobs.iter().map(FrozenJob::thaw).collect()
    }

    /// Write the marker to `{db_dir}/restart-info`, returning its path
    pub fn write(&self, db_dir: &Path) -> Result<PathBuf> {
        let path = paths::restart_info(db_dir);
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::IoError(format!("cannot encode restart data: {}", e)))?;
        let tmp = path.with_extension("new");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        debug!("wrote restart marker {}", path.display());
        Ok(path)
    }

    /// The pending marker, if any
    pub fn load(db_dir: &Path) -> Result<Option<Self>> {
        let path = paths::restart_info(db_dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let info = serde_json::from_str(&text)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))?;
        Ok(Some(info))
    }

    /// Remove the marker and its change set
    pub fn clear(db_dir: &Path) -> Result<()> {
        for path in [paths::restart_info(db_dir), paths::restart_changeset(db_dir)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tuple(name: &str) -> TroveTuple {
        TroveTuple::new(
            name,
            Version::thaw("/repo@ns:1/100.000:1.0-1-1").unwrap(),
            Flavor::empty(),
        )
    }

    #[test]
    fn test_marker_round_trip() {
        let dir = TempDir::new().unwrap();
        let jobs = vec![
            Job::install(tuple("foo:runtime")),
            Job::erase(tuple("bar:runtime")),
        ];
        let info = RestartInfo::new(
            paths::restart_changeset(dir.path()),
            &jobs,
            UpdateFlags::MERGE | UpdateFlags::NO_SCRIPTS,
        );
        let path = info.write(dir.path()).unwrap();
        assert!(path.ends_with("restart-info"));

        let loaded = RestartInfo::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.jobs().unwrap(), jobs);
        assert!(loaded.flags().contains(UpdateFlags::NO_SCRIPTS));

        RestartInfo::clear(dir.path()).unwrap();
        assert!(RestartInfo::load(dir.path()).unwrap().is_none());
    }
}
