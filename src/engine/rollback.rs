// src/engine/rollback.rs

//! The rollback stack
//!
//! Rollbacks live in numbered directories under `{db}/rollbacks`. The
//! `status` file holds the live range as two lines, `first N` and `last M`;
//! an empty stack has `last` one below `first`. A rollback directory holds
//! one (repository, local) change set pair per job group of the update it
//! reverses, as `repos.K.ccs` / `local.K.ccs` with a `count` file, plus the
//! postrollback scripts to run once a pair has been applied.

use super::restart::FrozenTuple;
use crate::capsule::capsule_file_id;
use crate::changeset::{ChangeSet, ChangeSetBuilder, TroveChange};
use crate::db::{ConfigCache, TroveStore, paths};
use crate::error::{Error, Result};
use crate::filesystem::path::safe_join;
use crate::hash::{PathId, Sha1Digest};
use crate::resolver::Job;
use crate::scriptlet::ScriptJob;
use crate::trove::{ScriptKind, Trove, TroveScript};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const META_FILE: &str = "post-scripts.meta";
const COUNT_FILE: &str = "count";

/// Parse `r.N`
pub fn parse_name(name: &str) -> Option<i64> {
    name.strip_prefix("r.")?.parse().ok()
}

/// The live rollbacks of one database directory
#[derive(Debug)]
pub struct RollbackStack {
    db_dir: PathBuf,
    first: i64,
    last: i64,
}

impl RollbackStack {
    /// Open the stack, creating an empty one if none exists
    pub fn open(db_dir: &Path) -> Result<Self> {
        fs::create_dir_all(paths::rollback_dir(db_dir))?;
        let mut stack = Self {
            db_dir: db_dir.to_path_buf(),
            first: 0,
            last: -1,
        };
        let status = paths::rollback_status(db_dir);
        match fs::read_to_string(&status) {
            Ok(text) => stack.parse_status(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => stack.write_status()?,
            Err(e) => return Err(e.into()),
        }
        Ok(stack)
    }

    fn parse_status(&mut self, text: &str) -> Result<()> {
        let bad = || Error::ParseError(format!("malformed rollback status: {:?}", text));
        let mut first = None;
        let mut last = None;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let (key, value) = line.split_once(' ').ok_or_else(bad)?;
            let value: i64 = value.trim().parse().map_err(|_| bad())?;
            match key {
                "first" => first = Some(value),
                "last" => last = Some(value),
                _ => return Err(bad()),
            }
        }
        self.first = first.ok_or_else(bad)?;
        self.last = last.ok_or_else(bad)?;
        Ok(())
    }

    fn write_status(&self) -> Result<()> {
        let status = paths::rollback_status(&self.db_dir);
        let tmp = status.with_extension("new");
        fs::write(&tmp, format!("first {}\nlast {}\n", self.first, self.last))?;
        fs::rename(&tmp, &status)?;
        Ok(())
    }

    pub fn first(&self) -> i64 {
        self.first
    }

    pub fn last(&self) -> i64 {
        self.last
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    pub fn get_rollback_list(&self) -> Vec<String> {
        (self.first..=self.last).map(|i| format!("r.{}", i)).collect()
    }

    pub fn has_rollback(&self, name: &str) -> bool {
        parse_name(name).is_some_and(|n| n >= self.first && n <= self.last)
    }

    /// Allocate the next rollback, replacing any stale directory at its index
    pub fn create_rollback(&mut self) -> Result<Rollback> {
        let index = self.last + 1;
        let dir = paths::rollback_entry(&self.db_dir, index as u64);
        if dir.exists() {
            warn!("removing stale rollback directory {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(COUNT_FILE), "0\n")?;
        self.last = index;
        self.write_status()?;
        debug!("created rollback r.{}", index);
        Ok(Rollback {
            name: format!("r.{}", index),
            dir,
            count: 0,
        })
    }

    pub fn get_rollback(&self, name: &str) -> Result<Rollback> {
        let index = parse_name(name)
            .filter(|_| self.has_rollback(name))
            .ok_or_else(|| Error::RollbackDoesNotExist(name.to_string()))?;
        Rollback::load(name, paths::rollback_entry(&self.db_dir, index as u64))
    }

    pub fn remove_last_rollback(&mut self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let dir = paths::rollback_entry(&self.db_dir, self.last as u64);
        self.last -= 1;
        self.write_status()?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Drop every rollback; returns how many there were
    pub fn invalidate(&mut self) -> Result<usize> {
        let count = self.get_rollback_list().len();
        let dirs: Vec<PathBuf> = (self.first..=self.last)
            .map(|i| paths::rollback_entry(&self.db_dir, i as u64))
            .collect();
        self.first = self.last + 1;
        self.write_status()?;
        for dir in dirs {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        if count > 0 {
            info!("invalidated {} rollbacks", count);
        }
        Ok(count)
    }

    /// Names must exist and run newest first without gaps
    pub fn check_order(&self, names: &[String]) -> Result<()> {
        for name in names {
            if !self.has_rollback(name) {
                return Err(Error::RollbackDoesNotExist(name.clone()));
            }
        }
        let mut expected = self.last;
        for name in names {
            if parse_name(name) != Some(expected) {
                return Err(Error::RollbackOrder(name.clone()));
            }
            expected -= 1;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PostScriptMeta {
    pair: usize,
    file: String,
    /// Trove the system returns to
    new: FrozenTuple,
    new_compat_class: Option<u32>,
    /// Trove being rolled back
    old: FrozenTuple,
    old_compat_class: Option<u32>,
    conversions: Vec<(u32, u32)>,
}

/// One rollback directory
#[derive(Debug)]
pub struct Rollback {
    name: String,
    dir: PathBuf,
    count: usize,
}

impl Rollback {
    fn load(name: &str, dir: PathBuf) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::RollbackDoesNotExist(name.to_string()));
        }
        let count = match fs::read_to_string(dir.join(COUNT_FILE)) {
            Ok(text) => text
                .trim()
                .parse()
                .map_err(|_| Error::ParseError(format!("{}: bad count {:?}", name, text)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            name: name.to_string(),
            dir,
            count,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn repos_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("repos.{}.ccs", index))
    }

    fn local_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("local.{}.ccs", index))
    }

    fn write_count(&self) -> Result<()> {
        let path = self.dir.join(COUNT_FILE);
        let tmp = path.with_extension("new");
        fs::write(&tmp, format!("{}\n", self.count))?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Append a pair; the count only moves once both files are written
    pub fn add(&mut self, repos: &ChangeSet, local: &ChangeSet) -> Result<usize> {
        let index = self.count;
        repos.write_to_file(&self.repos_path(index))?;
        local.write_to_file(&self.local_path(index))?;
        self.count += 1;
        self.write_count()?;
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Result<(ChangeSet, ChangeSet)> {
        if index >= self.count {
            return Err(Error::RollbackDoesNotExist(format!("{} pair {}", self.name, index)));
        }
        Ok((
            ChangeSet::read_file(&self.repos_path(index))?,
            ChangeSet::read_file(&self.local_path(index))?,
        ))
    }

    /// The newest pair and its index
    pub fn get_last(&self) -> Result<Option<(usize, ChangeSet, ChangeSet)>> {
        if self.count == 0 {
            return Ok(None);
        }
        let index = self.count - 1;
        let (repos, local) = self.get(index)?;
        Ok(Some((index, repos, local)))
    }

    /// Forget the newest pair once it has been applied
    pub fn remove_last(&mut self) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        self.count -= 1;
        self.write_count()?;
        for path in [self.repos_path(self.count), self.local_path(self.count)] {
            if let Err(e) = fs::remove_file(&path) {
                debug!("could not remove {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    fn read_meta(&self) -> Result<Vec<PostScriptMeta>> {
        match fs::read_to_string(self.dir.join(META_FILE)) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| Error::ParseError(format!("{} {}: {}", self.name, META_FILE, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save postrollback scripts for pair `pair`
    pub fn add_post_scripts(&self, pair: usize, scripts: &[ScriptJob]) -> Result<()> {
        if scripts.is_empty() {
            return Ok(());
        }
        let mut meta = self.read_meta()?;
        for job in scripts {
            let (Some(new), Some(old)) = (&job.new, &job.old) else {
                continue;
            };
            let file = format!("post-script.{}", meta.len());
            fs::write(self.dir.join(&file), &job.script.script)?;
            meta.push(PostScriptMeta {
                pair,
                file,
                new: FrozenTuple::freeze(new),
                new_compat_class: job.new_compat_class,
                old: FrozenTuple::freeze(old),
                old_compat_class: job.old_compat_class,
                conversions: job.script.conversions.clone(),
            });
        }
        let text = serde_json::to_string_pretty(&meta)
            .map_err(|e| Error::IoError(format!("cannot encode {}: {}", META_FILE, e)))?;
        fs::write(self.dir.join(META_FILE), text)?;
        Ok(())
    }

    /// Postrollback scripts saved for pair `pair`
    pub fn post_scripts(&self, pair: usize) -> Result<Vec<ScriptJob>> {
        let mut out = Vec::new();
        for meta in self.read_meta()?.into_iter().filter(|m| m.pair == pair) {
            let script = fs::read_to_string(self.dir.join(&meta.file))?;
            out.push(ScriptJob {
                kind: ScriptKind::PostRollback,
                script: TroveScript {
                    script,
                    conversions: meta.conversions,
                },
                new: Some(meta.new.thaw()?),
                new_compat_class: meta.new_compat_class,
                old: Some(meta.old.thaw()?),
                old_compat_class: meta.old_compat_class,
            });
        }
        Ok(out)
    }
}

/// Whether an update from `old` to `new` crosses a compatibility class
/// boundary that no postrollback script of `new` converts back over
pub fn is_rollback_fence(old: &Trove, new: &Trove) -> bool {
    let Some(new_class) = new.info.compat_class else {
        return false;
    };
    let old_class = old.compat_class();
    if new_class == old_class {
        return false;
    }
    !new
        .info
        .scripts
        .get(&ScriptKind::PostRollback)
        .is_some_and(|s| s.handles(new_class, old_class))
}

/// The postrollback script to save for an update from `old` to `new`
///
/// Runs after the rollback with the current class as old and the prior
/// class as new. Installs get none.
pub fn post_rollback_job(old: &Trove, new: &Trove) -> Option<ScriptJob> {
    let script = new.info.scripts.get(&ScriptKind::PostRollback)?;
    Some(ScriptJob {
        kind: ScriptKind::PostRollback,
        script: script.clone(),
        new: Some(old.tuple()),
        new_compat_class: Some(old.compat_class()),
        old: Some(new.tuple()),
        old_compat_class: Some(new.compat_class()),
    })
}

/// The change set that undoes `jobs`, built before they run
///
/// Installs become erasures. Erased and replaced troves come back from
/// their pristine database entries. Contents are taken from the config
/// cache or from unmodified files on disk; anything else is a placeholder.
/// Capsule payloads are never stored, so rolling back to a capsule trove
/// needs its package from elsewhere.
pub fn reverse_changeset(
    store: &TroveStore<'_>,
    cache: &ConfigCache,
    root: &Path,
    cs: &ChangeSet,
    jobs: &[Job],
) -> Result<ChangeSet> {
    let mut builder = ChangeSetBuilder::new();
    for job in jobs {
        let Some(old) = &job.old else {
            if let Some(new) = &job.new {
                builder.erase(new.clone());
            }
            continue;
        };
        let trove = store
            .get_trove(old, true)?
            .ok_or_else(|| Error::TroveMissing(old.to_string()))?;
        let incoming = job
            .new
            .as_ref()
            .and_then(|n| cs.trove_change(n))
            .map(|c| &c.new);

        for (path_id, tf) in &trove.files {
            let obj = store
                .get_file_stream(&tf.file_id)?
                .ok_or_else(|| Error::FileStreamMissing(tf.path.clone()))?;
            builder.add_file_stream(&obj);

            let unchanged = incoming
                .and_then(|n| n.files.get(path_id))
                .is_some_and(|f| f.file_id == tf.file_id);
            let Some(sha1) = obj.contents_sha1() else {
                continue;
            };
            if unchanged || (trove.is_capsule() && obj.flags.is_encapsulated_content()) {
                continue;
            }
            let data = if obj.flags.is_config() {
                cache.get(&sha1)?
            } else {
                None
            };
            let data = match data {
                Some(data) => Some(data),
                None => read_if_pristine(root, &tf.path, &sha1)?,
            };
            match data {
                Some(data) => builder.add_regular_contents(*path_id, tf.file_id, sha1, data),
                None => {
                    debug!("no contents for {} in rollback", tf.path);
                    builder.add_hldr(*path_id, tf.file_id);
                }
            }
        }
        if let Some(info) = &trove.info.capsule {
            builder.add_hldr(PathId::CAPSULE, capsule_file_id(info));
        }

        match &job.new {
            Some(new) => builder.add_trove_change(TroveChange::relative(new, trove)),
            None => builder.add_trove_change(TroveChange::absolute(trove)),
        }
    }
    Ok(builder.build())
}

fn read_if_pristine(root: &Path, path: &str, sha1: &Sha1Digest) -> Result<Option<Vec<u8>>> {
    let target = safe_join(root, path)?;
    match fs::symlink_metadata(&target) {
        Ok(meta) if meta.is_file() => {
            let data = fs::read(&target)?;
            Ok((Sha1Digest::of(&data) == *sha1).then_some(data))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::Flavor;
    use crate::version::Version;
    use tempfile::TempDir;

    #[test]
    fn test_stack_status_and_order() {
        let dir = TempDir::new().unwrap();
        let mut stack = RollbackStack::open(dir.path()).unwrap();
        assert!(stack.is_empty());
        assert_eq!(
            fs::read_to_string(paths::rollback_status(dir.path())).unwrap(),
            "first 0\nlast -1\n"
        );

        for _ in 0..3 {
            let mut rb = stack.create_rollback().unwrap();
            rb.add(&ChangeSet::new(), &ChangeSet::new()).unwrap();
        }
        assert_eq!(stack.get_rollback_list(), vec!["r.0", "r.1", "r.2"]);

        let reopened = RollbackStack::open(dir.path()).unwrap();
        assert_eq!((reopened.first(), reopened.last()), (0, 2));
        assert!(reopened.has_rollback("r.1"));
        assert!(!reopened.has_rollback("r.3"));
        assert!(!reopened.has_rollback("bogus"));

        reopened
            .check_order(&["r.2".to_string(), "r.1".to_string()])
            .unwrap();
        assert!(matches!(
            reopened.check_order(&["r.1".to_string()]),
            Err(Error::RollbackOrder(_))
        ));
        assert!(matches!(
            reopened.check_order(&["r.7".to_string()]),
            Err(Error::RollbackDoesNotExist(_))
        ));

        stack.remove_last_rollback().unwrap();
        assert_eq!(stack.last(), 1);
        assert!(!paths::rollback_entry(dir.path(), 2).exists());

        assert_eq!(stack.invalidate().unwrap(), 2);
        assert!(stack.is_empty());
        assert!(matches!(
            stack.get_rollback("r.0"),
            Err(Error::RollbackDoesNotExist(_))
        ));
        // numbering continues after an invalidation
        assert_eq!(stack.create_rollback().unwrap().name(), "r.2");
    }

    #[test]
    fn test_pairs_and_post_scripts() {
        let dir = TempDir::new().unwrap();
        let mut stack = RollbackStack::open(dir.path()).unwrap();
        let mut rb = stack.create_rollback().unwrap();
        let mut first = ChangeSet::new();
        let v = Version::thaw("/repo@ns:1/100.000:1.0-1-1").unwrap();
        let old = crate::trove::TroveTuple::new("group-foo", v.clone(), Flavor::empty());
        first.add_old_trove(old.clone());
        rb.add(&first, &ChangeSet::new()).unwrap();
        rb.add(&ChangeSet::new(), &ChangeSet::new()).unwrap();

        let job = ScriptJob {
            kind: ScriptKind::PostRollback,
            script: TroveScript::new("echo back").with_conversion(1, 0),
            new: Some(old.clone()),
            new_compat_class: Some(0),
            old: Some(old.clone()),
            old_compat_class: Some(1),
        };
        rb.add_post_scripts(0, &[job]).unwrap();

        let loaded = stack.get_rollback("r.0").unwrap();
        assert_eq!(loaded.count(), 2);
        let scripts = loaded.post_scripts(0).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].script.script, "echo back");
        assert!(scripts[0].script.handles(1, 0));
        assert_eq!(scripts[0].old_compat_class, Some(1));
        assert!(loaded.post_scripts(1).unwrap().is_empty());

        let mut loaded = loaded;
        let (index, _, _) = loaded.get_last().unwrap().unwrap();
        assert_eq!(index, 1);
        loaded.remove_last().unwrap();
        let (index, repos, _) = loaded.get_last().unwrap().unwrap();
        assert_eq!(index, 0);
        assert_eq!(repos.old_troves(), &[old]);
    }

    #[test]
    fn test_rollback_fence() {
        let v = Version::thaw("/repo@ns:1/100.000:1.0-1-1").unwrap();
        let old = Trove::new("group-foo", v.clone(), Flavor::empty());
        let mut new = Trove::new("group-foo", v, Flavor::empty());
        assert!(!is_rollback_fence(&old, &new));

        new.info.compat_class = Some(1);
        assert!(is_rollback_fence(&old, &new));
        assert!(post_rollback_job(&old, &new).is_none());

        new.info.scripts.insert(
            ScriptKind::PostRollback,
            TroveScript::new("echo").with_conversion(1, 0),
        );
        assert!(!is_rollback_fence(&old, &new));
        let job = post_rollback_job(&old, &new).unwrap();
        assert_eq!(job.old_compat_class, Some(1));
        assert_eq!(job.new_compat_class, Some(0));
    }
}
