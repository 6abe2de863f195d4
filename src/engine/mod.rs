// src/engine/mod.rs

//! Applying change sets to an install root
//!
//! [`Engine`] ties the pieces together. One apply:
//!
//! 1. takes the root lock and recovers any interrupted journal
//! 2. checks dependencies and orders the jobs into groups
//! 3. for each group: plans the file changes, builds the rollback pair,
//!    runs pre scripts and tag handlers, writes the files through the
//!    journal, hands capsules to their packager, updates the database,
//!    commits the journal, then runs post scripts and tag handlers
//! 4. records the rollback pairs under one new rollback
//!
//! Everything a group writes is undone when any step before the database
//! commit fails.

pub mod local;
pub mod restart;
pub mod rollback;

pub use local::{LocalChange, apply_local, local_changeset, verify};
pub use restart::RestartInfo;
pub use rollback::{Rollback, RollbackStack, is_rollback_fence, reverse_changeset};

use crate::capsule::{CapsuleManager, CapsulePlugin, ForeignOptions, PartialTuple, capsule_file_id};
use crate::changeset::{ChangeSet, ChangeSetBuilder, ContentKind};
use crate::config::{EngineConfig, UpdateFlags};
use crate::db::{self, ConfigCache, TroveStore, paths};
use crate::error::{Error, Result};
use crate::files::{FileObject, IdLookup, RestoreContext};
use crate::filesystem::path::safe_join;
use crate::hash::{PathId, Sha1Digest};
use crate::progress::{Phase, UpdateCallback};
use crate::resolver::{CheckOutcome, DependencyChecker, Job};
use crate::scriptlet::{ScriptJob, ScriptRunner, is_pre_script};
use crate::transaction::{self, CancelToken, JobJournal, RecoveryOutcome, RootLock, SignalGuard};
use crate::trigger::{self, load_tag_dict};
use crate::trove::{CapsuleInfo, ScriptKind, Trove, TroveTuple};
use crate::update::{ApplyContext, FilesystemJob, MergeContext};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How an apply was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    /// Applying the repository half of a rollback
    Rollback,
    /// Recording foreign packages in the database only
    CapsuleSync,
}

/// Options for one [`Engine::apply`]
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub flags: UpdateFlags,
    /// Troves that must be in place before the rest may run; the process
    /// restarts itself once they are
    pub critical: BTreeSet<TroveTuple>,
    /// Do not record a rollback
    pub skip_rollback: bool,
}

/// What an apply did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Jobs in the order they ran
    pub jobs: Vec<Job>,
    /// Rollback recorded for this apply
    pub rollback: Option<String>,
    /// Post scripts that exited nonzero
    pub failed_scripts: usize,
    /// Rollbacks dropped because an update crossed a compatibility class
    pub invalidated_rollbacks: usize,
}

/// Every job `cs` describes: trove changes in tuple order, then erasures
pub fn changeset_jobs(cs: &ChangeSet) -> Vec<Job> {
    let mut jobs: Vec<Job> = cs
        .trove_changes()
        .map(|c| Job {
            old: c.old_tuple(),
            new: Some(c.new_tuple()),
        })
        .collect();
    jobs.extend(cs.old_troves().iter().cloned().map(Job::erase));
    jobs
}

/// A job with the troves it involves
struct JobTroves {
    new: Option<Trove>,
    old: Option<Trove>,
}

fn load_job_troves(store: &TroveStore<'_>, cs: &ChangeSet, jobs: &[Job]) -> Result<Vec<JobTroves>> {
    let mut out = Vec::with_capacity(jobs.len());
    for job in jobs {
        let new = job
            .new
            .as_ref()
            .and_then(|t| cs.trove_change(t))
            .map(|c| c.new.clone());
        let old = match &job.old {
            Some(t) => Some(
                store
                    .get_trove(t, true)?
                    .ok_or_else(|| Error::TroveMissing(t.to_string()))?,
            ),
            None => None,
        };
        out.push(JobTroves { new, old });
    }
    Ok(out)
}

fn script_job(kind: ScriptKind, owner: &Trove, new: Option<&Trove>, old: Option<&Trove>) -> Option<ScriptJob> {
    Some(ScriptJob {
        kind,
        script: owner.info.scripts.get(&kind)?.clone(),
        new: new.map(Trove::tuple),
        new_compat_class: new.map(Trove::compat_class),
        old: old.map(Trove::tuple),
        old_compat_class: old.map(Trove::compat_class),
    })
}

/// Scripts for a group: (pre, post), post ordered erase, update, install
fn group_scripts(troves: &[JobTroves], mode: Mode) -> (Vec<ScriptJob>, Vec<ScriptJob>) {
    let mut all = Vec::new();
    for jt in troves {
        match (&jt.new, &jt.old) {
            (Some(new), None) => {
                for kind in [ScriptKind::PreInstall, ScriptKind::PostInstall] {
                    all.extend(script_job(kind, new, Some(new), None));
                }
            }
            (Some(new), Some(old)) => {
                if mode == Mode::Rollback {
                    all.extend(script_job(ScriptKind::PreRollback, old, Some(new), Some(old)));
                }
                for kind in [ScriptKind::PreUpdate, ScriptKind::PostUpdate] {
                    all.extend(script_job(kind, new, Some(new), Some(old)));
                }
            }
            (None, Some(old)) => {
                for kind in [ScriptKind::PreErase, ScriptKind::PostErase] {
                    all.extend(script_job(kind, old, None, Some(old)));
                }
            }
            (None, None) => {}
        }
    }
    let (pre, mut post): (Vec<ScriptJob>, Vec<ScriptJob>) = all.into_iter().partition(|s| is_pre_script(s.kind));
    post.sort_by_key(|s| match s.kind {
        ScriptKind::PostErase => 0,
        ScriptKind::PostUpdate => 1,
        ScriptKind::PostInstall => 2,
        _ => 3,
    });
    (pre, post)
}

fn run_pre_scripts(runner: &ScriptRunner<'_>, scripts: &[ScriptJob]) -> Result<()> {
    for script in scripts {
        let status = runner.run(script)?;
        if status != 0 {
            let owner = script.owner().map(ToString::to_string).unwrap_or_default();
            return Err(Error::ScriptletError(format!(
                "{} script of {} failed with status {}",
                script.kind, owner, status
            )));
        }
    }
    Ok(())
}

/// Post scripts never undo anything; returns how many failed
fn run_post_scripts(runner: &ScriptRunner<'_>, scripts: &[ScriptJob]) -> usize {
    let mut failed = 0;
    for script in scripts {
        match runner.run(script) {
            Ok(0) => {}
            Ok(status) => {
                warn!("{} script exited with status {}", script.kind, status);
                failed += 1;
            }
            Err(e) => {
                error!("{} script could not run: {}", script.kind, e);
                failed += 1;
            }
        }
    }
    failed
}

/// Pinned troves that stay next to a newly installed trove of the same name
fn pinned_pairs(store: &TroveStore<'_>, jobs: &[Job]) -> Result<Vec<(TroveTuple, TroveTuple)>> {
    let pinned = store.pinned_troves()?;
    if pinned.is_empty() {
        return Ok(Vec::new());
    }
    let mut pairs = Vec::new();
    for new in jobs.iter().filter(|j| j.old.is_none()).filter_map(|j| j.new.as_ref()) {
        for p in pinned.iter().filter(|p| p.name == new.name && *p != new) {
            pairs.push((p.clone(), new.clone()));
        }
    }
    Ok(pairs)
}

/// Cut the group list after the last group holding a critical trove;
/// returns the jobs left over
fn split_critical(groups: &mut Vec<Vec<usize>>, jobs: &[Job], critical: &BTreeSet<TroveTuple>) -> Vec<Job> {
    if critical.is_empty() {
        return Vec::new();
    }
    let is_critical = |i: &usize| {
        let job = &jobs[*i];
        job.new.iter().chain(job.old.iter()).any(|t| critical.contains(t))
    };
    let Some(last) = groups.iter().rposition(|g| g.iter().any(is_critical)) else {
        return Vec::new();
    };
    groups
        .split_off(last + 1)
        .into_iter()
        .flatten()
        .map(|i| jobs[i].clone())
        .collect()
}

fn audit(jobs: &[Job]) {
    for job in jobs {
        match (&job.old, &job.new) {
            (None, Some(new)) => info!(target: "conary::audit", "installed {}", new),
            (Some(old), Some(new)) => info!(target: "conary::audit", "updated {} -> {}", old, new),
            (Some(old), None) => info!(target: "conary::audit", "removed {}", old),
            (None, None) => {}
        }
    }
}

fn plugin<'m>(capsules: &'m mut CapsuleManager, kind: &str) -> Result<&'m mut Box<dyn CapsulePlugin>> {
    capsules
        .get_mut(kind)
        .ok_or_else(|| Error::CapsuleError(format!("no capsule plugin handles {} packages", kind)))
}

fn capsule_info(trove: &Trove) -> Result<&CapsuleInfo> {
    trove
        .info
        .capsule
        .as_ref()
        .ok_or_else(|| Error::CapsuleError(format!("{} is not a capsule trove", trove.tuple())))
}

fn capsule_payload(cs: &ChangeSet, trove: &Trove, mode: Mode) -> Result<Vec<u8>> {
    let info = capsule_info(trove)?;
    let missing = || match mode {
        Mode::Rollback => Error::MissingRollbackCapsule(trove.tuple().to_string()),
        _ => Error::CapsuleError(format!("{}: capsule payload is missing", trove.tuple())),
    };
    let entry = cs
        .resolve_contents(&PathId::CAPSULE, &capsule_file_id(info))
        .ok_or_else(missing)?;
    if entry.kind == ContentKind::Hldr {
        return Err(missing());
    }
    entry.read_all()
}

/// Switches for one apply
struct RunContext<'a> {
    flags: UpdateFlags,
    mode: Mode,
    cancel: &'a CancelToken,
    callback: &'a dyn UpdateCallback,
    want_rollback: bool,
    /// False when the pre scripts already ran up front
    pre_scripts: bool,
}

/// Planning results for one group
struct Plan {
    job: FilesystemJob,
    troves: Vec<JobTroves>,
    candidates: Vec<String>,
    pinned: Vec<(TroveTuple, TroveTuple)>,
    /// Installed capsule troves the group erases or replaces
    capsule_removals: Vec<Trove>,
}

#[derive(Default)]
struct GroupOutcome {
    /// (repository, local) change sets and postrollback scripts
    rollback: Option<(ChangeSet, ChangeSet, Vec<ScriptJob>)>,
    fence: bool,
    failed_scripts: usize,
}

/// What writing a group needs besides the plan
struct WriteContext<'a> {
    root: &'a Path,
    ids: &'a IdLookup,
    cache: &'a ConfigCache,
    flags: UpdateFlags,
    mode: Mode,
    cancel: &'a CancelToken,
    callback: &'a dyn UpdateCallback,
}

/// Files, capsules and database for one group
fn write_group(
    conn: &mut Connection,
    capsules: &mut CapsuleManager,
    plan: &mut Plan,
    cs: &ChangeSet,
    mut journal: Option<&mut JobJournal>,
    w: &WriteContext<'_>,
) -> Result<Vec<Sha1Digest>> {
    if let Some(journal) = journal.as_deref_mut() {
        let restore = RestoreContext::for_root(w.root, w.flags.contains(UpdateFlags::IGNORE_UGIDS));
        let ctx = ApplyContext {
            restore: &restore,
            config_cache: w.cache,
            cancel: w.cancel,
            callback: w.callback,
            flags: w.flags,
        };
        w.callback.phase(Phase::RemovingFiles);
        plan.job.apply(journal, cs, &ctx)?;
    }

    if w.mode != Mode::CapsuleSync
        && (!plan.job.capsule_installs().is_empty() || !plan.capsule_removals.is_empty())
    {
        w.callback.phase(Phase::Capsules);
        run_capsules(capsules, plan, cs, journal.as_deref_mut(), w)?;
    }

    w.cancel.check()?;
    w.callback.phase(Phase::UpdatingDatabase);
    let job = &plan.job;
    let candidates = &plan.candidates;
    let pinned = &plan.pinned;
    db::transaction(conn, |tx| {
        let store = TroveStore::new(tx);
        let dropped = job.update_database(&store)?;
        if let Some(journal) = journal {
            let removed = job.remove_directories(journal, &store, candidates)?;
            if removed > 0 {
                debug!("removed {} empty directories", removed);
            }
        }
        store.map_pinned_troves(pinned)?;
        Ok(dropped)
    })
}

/// Hand capsule work to the foreign packagers, then take ownership of the
/// files Conary manages inside the capsules
fn run_capsules(
    capsules: &mut CapsuleManager,
    plan: &mut Plan,
    cs: &ChangeSet,
    mut journal: Option<&mut JobJournal>,
    w: &WriteContext<'_>,
) -> Result<()> {
    // files the packager may overwrite; put back afterwards
    let mut saved = Vec::new();
    for (_, _, path) in plan.job.capsule_captures() {
        let target = safe_join(w.root, path)?;
        let existing = match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_file() => Some((fs::read(&target)?, meta.permissions())),
            _ => None,
        };
        if let Some(journal) = journal.as_deref_mut() {
            journal.backup(&target)?;
        }
        if let Some((data, perms)) = existing {
            saved.push((target, data, perms));
        }
    }

    let mut kinds = BTreeSet::new();
    for trove in &plan.capsule_removals {
        let info = capsule_info(trove)?;
        plugin(capsules, &info.kind)?.remove(trove)?;
        kinds.insert(info.kind.clone());
    }
    for tuple in plan.job.capsule_installs() {
        let trove = plan
            .job
            .new_troves()
            .iter()
            .find(|t| t.tuple() == *tuple)
            .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?;
        let payload = capsule_payload(cs, trove, w.mode)?;
        let info = capsule_info(trove)?;
        plugin(capsules, &info.kind)?.install(trove, payload)?;
        kinds.insert(info.kind.clone());
    }

    let opts = ForeignOptions {
        just_database: w.flags.contains(UpdateFlags::JUST_DATABASE),
        no_scripts: w.flags.contains(UpdateFlags::NO_SCRIPTS),
    };
    for kind in &kinds {
        info!("running {} transaction", kind);
        plugin(capsules, kind)?.apply(w.root, &opts)?;
    }

    for (target, data, perms) in saved {
        debug!("restoring {} after the capsule transaction", target.display());
        fs::write(&target, data)?;
        fs::set_permissions(&target, perms)?;
    }
    capture_files(&mut plan.job, w)
}

/// Record what is on disk for capsule files whose contents the change set
/// did not carry
fn capture_files(job: &mut FilesystemJob, w: &WriteContext<'_>) -> Result<()> {
    let captures = job.capsule_captures().to_vec();
    let mut touched = BTreeSet::new();
    for (tuple, path_id, path) in captures {
        let target = safe_join(w.root, &path)?;
        let Some(mut obj) = FileObject::from_path(&target, w.ids, None)? else {
            warn!("{} was not written by the capsule of {}", path, tuple);
            continue;
        };
        let Some(old_id) = job
            .new_troves()
            .iter()
            .find(|t| t.tuple() == tuple)
            .and_then(|t| t.files.get(&path_id))
            .map(|f| f.file_id)
        else {
            continue;
        };
        if let Some(stream) = job.streams().get(&old_id) {
            obj.flags = stream.flags;
            obj.tags = stream.tags.clone();
        }
        if obj.is_regular() && obj.flags.is_config() {
            w.cache.store(&fs::read(&target)?)?;
        }
        let file_id = obj.file_id();
        job.streams_mut().insert(file_id, obj);
        if let Some(tf) = job
            .new_troves_mut()
            .iter_mut()
            .find(|t| t.tuple() == tuple)
            .and_then(|t| t.files.get_mut(&path_id))
        {
            tf.file_id = file_id;
        }
        touched.insert(tuple);
    }
    for trove in job.new_troves_mut() {
        if touched.contains(&trove.tuple()) {
            trove.sign();
        }
    }
    Ok(())
}

/// The installation engine for one root
pub struct Engine {
    config: EngineConfig,
    db_dir: PathBuf,
    conn: Connection,
    cache: ConfigCache,
    capsules: CapsuleManager,
}

impl Engine {
    /// Open (creating if needed) the database of `config.root`
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.label_path()?;
        let db_dir = config.db_dir();
        let conn = db::init(&paths::db_file(&db_dir))?;
        let cache = ConfigCache::new(paths::config_contents_dir(&db_dir));
        let capsules = CapsuleManager::for_root(&config.root);
        Ok(Self {
            config,
            db_dir,
            conn,
            cache,
            capsules,
        })
    }

    /// Register a capsule plugin, replacing any of the same kind
    pub fn with_capsule_plugin(mut self, plugin: Box<dyn CapsulePlugin>) -> Self {
        self.capsules.add(plugin);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn store(&self) -> TroveStore<'_> {
        TroveStore::new(&self.conn)
    }

    fn lock(&self) -> Result<RootLock> {
        RootLock::acquire(&self.db_dir, Duration::from_secs(self.config.lock_timeout_secs))
    }

    fn recover_locked(&self) -> Result<RecoveryOutcome> {
        let outcome = transaction::recover(&self.config.root, &self.db_dir)?;
        match &outcome {
            RecoveryOutcome::Clean => {}
            RecoveryOutcome::RolledForward { entries } => {
                info!("finished an interrupted apply ({} journal entries)", entries)
            }
            RecoveryOutcome::RolledBack { entries, failures } => warn!(
                "reverted an interrupted apply ({} entries, {} failures)",
                entries, failures
            ),
            RecoveryOutcome::Corrupted { error } => error!("journal was unreadable: {}", error),
        }
        Ok(outcome)
    }

    /// Finish or revert an interrupted apply
    pub fn recover(&self) -> Result<RecoveryOutcome> {
        let _lock = self.lock()?;
        self.recover_locked()
    }

    /// Check `cs` against the installed troves without applying it
    pub fn check(&self, cs: &ChangeSet) -> Result<CheckOutcome> {
        let store = self.store();
        DependencyChecker::new(&store)?.check(&changeset_jobs(cs), cs, true)
    }

    /// Files of an installed trove that differ from the database
    pub fn verify(&self, tuple: &TroveTuple) -> Result<Vec<LocalChange>> {
        let ids = IdLookup::load(&self.config.root);
        verify(&self.store(), &self.config.root, &ids, tuple, self.config.ignore_ugids)
    }

    pub fn list_rollbacks(&self) -> Result<Vec<String>> {
        Ok(RollbackStack::open(&self.db_dir)?.get_rollback_list())
    }

    /// Apply `cs`
    pub fn apply(&mut self, cs: &ChangeSet, opts: &ApplyOptions, callback: &dyn UpdateCallback) -> Result<ApplyReport> {
        let _lock = self.lock()?;
        self.recover_locked()?;
        let _signals = SignalGuard::install()?;
        let cancel = CancelToken::new();
        let report = self.apply_locked(cs, opts, Mode::Normal, &cancel, callback)?;
        callback.done();
        Ok(report)
    }

    /// Erase installed troves
    pub fn erase(&mut self, tuples: &[TroveTuple], opts: &ApplyOptions, callback: &dyn UpdateCallback) -> Result<ApplyReport> {
        let mut builder = ChangeSetBuilder::new();
        for tuple in tuples {
            if !self.store().has_trove(tuple)? {
                return Err(Error::TroveMissing(tuple.to_string()));
            }
            builder.erase(tuple.clone());
        }
        self.apply(&builder.build(), opts, callback)
    }

    /// Finish the jobs a critical update left behind
    ///
    /// Returns `None` when no restart is pending.
    pub fn resume(&mut self, callback: &dyn UpdateCallback) -> Result<Option<ApplyReport>> {
        let _lock = self.lock()?;
        self.recover_locked()?;
        let Some(marker) = RestartInfo::load(&self.db_dir)? else {
            return Ok(None);
        };
        info!("resuming {} jobs from {}", marker.jobs.len(), marker.created);
        let cs = ChangeSet::read_file(&marker.changeset)?.select(&marker.jobs()?);
        let opts = ApplyOptions {
            flags: marker.flags(),
            ..Default::default()
        };
        let _signals = SignalGuard::install()?;
        let cancel = CancelToken::new();
        let report = self.apply_locked(&cs, &opts, Mode::Normal, &cancel, callback)?;
        RestartInfo::clear(&self.db_dir)?;
        callback.done();
        Ok(Some(report))
    }

    fn apply_locked(
        &mut self,
        cs: &ChangeSet,
        opts: &ApplyOptions,
        mode: Mode,
        cancel: &CancelToken,
        callback: &dyn UpdateCallback,
    ) -> Result<ApplyReport> {
        let jobs = changeset_jobs(cs);
        let mut report = ApplyReport::default();
        if jobs.is_empty() {
            return Ok(report);
        }
        let flags = opts.flags | self.config.default_flags();
        let test = flags.contains(UpdateFlags::TEST);

        let mut groups = match mode {
            Mode::Normal => {
                let store = self.store();
                DependencyChecker::new(&store)?.check_and_order(&jobs, cs)?
            }
            Mode::Rollback | Mode::CapsuleSync => vec![(0..jobs.len()).collect()],
        };
        let remaining = split_critical(&mut groups, &jobs, &opts.critical);

        let scripts_on =
            !flags.contains(UpdateFlags::NO_SCRIPTS) && !flags.contains(UpdateFlags::JUST_DATABASE);
        let mut pre_done = false;
        if self.config.legacy_prescripts && scripts_on && mode == Mode::Normal && !test {
            let selected: Vec<Job> = groups.iter().flatten().map(|&i| jobs[i].clone()).collect();
            let troves = load_job_troves(&self.store(), cs, &selected)?;
            let (pre, _) = group_scripts(&troves, mode);
            callback.phase(Phase::PreScripts);
            let runner = ScriptRunner::new(&self.config.root, self.config.tag_script.as_deref(), callback);
            run_pre_scripts(&runner, &pre)?;
            pre_done = true;
        }

        let want_rollback = mode == Mode::Normal && !opts.skip_rollback && !test;
        let mut stack = if want_rollback {
            Some(RollbackStack::open(&self.db_dir)?)
        } else {
            None
        };
        let mut rollback: Option<Rollback> = None;
        let mut fenced = false;

        let total = groups.len();
        for (n, group) in groups.iter().enumerate() {
            cancel.check()?;
            callback.job_started(n + 1, total);
            let group_jobs: Vec<Job> = group.iter().map(|&i| jobs[i].clone()).collect();
            debug!("job {}/{}: {:?}", n + 1, total, group_jobs.iter().map(ToString::to_string).collect::<Vec<_>>());
            let run = RunContext {
                flags,
                mode,
                cancel,
                callback,
                want_rollback: want_rollback && !fenced,
                pre_scripts: !pre_done,
            };
            let outcome = self.apply_group(&cs.select(&group_jobs), &group_jobs, &run)?;
            report.failed_scripts += outcome.failed_scripts;

            if outcome.fence {
                if let Some(stack) = stack.as_mut() {
                    warn!("update crosses a compatibility class; dropping all rollbacks");
                    report.invalidated_rollbacks += stack.invalidate()?;
                }
                rollback = None;
                fenced = true;
            } else if let (Some(stack), Some((repos, local, post))) = (stack.as_mut(), outcome.rollback) {
                callback.phase(Phase::CreatingRollback);
                if rollback.is_none() {
                    rollback = Some(stack.create_rollback()?);
                }
                if let Some(rb) = rollback.as_mut() {
                    let index = rb.add(&repos, &local)?;
                    rb.add_post_scripts(index, &post)?;
                }
            }
            report.jobs.extend(group_jobs);
        }
        report.rollback = rollback.map(|r| r.name().to_string());

        if !remaining.is_empty() && !test {
            let path = paths::restart_changeset(&self.db_dir);
            cs.select(&remaining).write_to_file(&path)?;
            let marker = RestartInfo::new(path, &remaining, opts.flags).write(&self.db_dir)?;
            info!("critical troves are in place; {} jobs wait for a restart", remaining.len());
            return Err(Error::ReexecRequired(marker));
        }
        Ok(report)
    }

    fn apply_group(&mut self, cs: &ChangeSet, jobs: &[Job], run: &RunContext<'_>) -> Result<GroupOutcome> {
        let Engine {
            config,
            db_dir,
            conn,
            cache,
            capsules,
        } = self;
        let root = config.root.clone();
        let label_path = config.label_path()?;
        let ids = IdLookup::load(&root);
        let cb = run.callback;

        let mut flags = run.flags;
        let just_db = flags.contains(UpdateFlags::JUST_DATABASE);
        if just_db {
            flags.insert(UpdateFlags::REPLACE_UNMANAGED_FILES | UpdateFlags::REPLACE_MODIFIED_FILES);
        }
        let ignore_ugids = flags.contains(UpdateFlags::IGNORE_UGIDS);
        let scripts_on = !flags.contains(UpdateFlags::NO_SCRIPTS) && !just_db;

        cb.phase(Phase::Planning);
        let mut outcome = GroupOutcome::default();
        let mut plan = {
            let store = TroveStore::new(&*conn);
            let ctx = MergeContext {
                store: &store,
                config_cache: cache,
                root: &root,
                flags,
                label_path: &label_path,
                ids: &ids,
            };
            let job = FilesystemJob::plan(&ctx, cs)?;
            job.check_errors()?;
            if flags.contains(UpdateFlags::TEST) {
                return Ok(outcome);
            }

            let troves = load_job_troves(&store, cs, jobs)?;
            outcome.fence = troves.iter().any(|jt| match (&jt.new, &jt.old) {
                (Some(new), Some(old)) => is_rollback_fence(old, new),
                _ => false,
            });
            if run.want_rollback && !outcome.fence {
                let repos = reverse_changeset(&store, cache, &root, cs, jobs)?;
                let leaving: Vec<TroveTuple> = jobs.iter().filter_map(|j| j.old.clone()).collect();
                let local = local_changeset(&store, &root, &ids, &leaving, ignore_ugids)?;
                let post: Vec<ScriptJob> = troves
                    .iter()
                    .filter_map(|jt| match (&jt.new, &jt.old) {
                        (Some(new), Some(old)) => rollback::post_rollback_job(old, new),
                        _ => None,
                    })
                    .collect();
                outcome.rollback = Some((repos, local, post));
            }

            let capsule_removals = troves
                .iter()
                .filter_map(|jt| jt.old.as_ref())
                .filter(|t| t.is_capsule())
                .cloned()
                .collect();
            Plan {
                candidates: job.directory_candidates()?,
                pinned: pinned_pairs(&store, jobs)?,
                job,
                troves,
                capsule_removals,
            }
        };

        let (pre, post) = group_scripts(&plan.troves, run.mode);
        let runner = ScriptRunner::new(&root, config.tag_script.as_deref(), cb);
        if scripts_on && run.pre_scripts && !pre.is_empty() {
            cb.phase(Phase::PreScripts);
            run_pre_scripts(&runner, &pre)?;
        }

        let mut tags = BTreeMap::new();
        if scripts_on {
            tags = load_tag_dict(&root, &config.tag_dir())?;
            let cmds = {
                let store = TroveStore::new(&*conn);
                trigger::pre_commands(&plan.job, &mut tags, &store)?
            };
            if !cmds.is_empty() {
                cb.phase(Phase::PreTagHandlers);
                cmds.run(&root, config.tag_script.as_deref(), true, cb)?;
            }
        }

        let mut journal = if just_db {
            None
        } else {
            Some(JobJournal::start(&root, &paths::journal_path(db_dir))?)
        };
        let write = WriteContext {
            root: &root,
            ids: &ids,
            cache,
            flags,
            mode: run.mode,
            cancel: run.cancel,
            callback: cb,
        };
        let dropped = match write_group(conn, capsules, &mut plan, cs, journal.as_mut(), &write) {
            Ok(dropped) => dropped,
            Err(e) => {
                if let Some(journal) = journal {
                    match journal.revert() {
                        Ok(0) => {}
                        Ok(failures) => error!("{} journal entries could not be reverted", failures),
                        Err(re) => error!("journal revert failed: {}", re),
                    }
                }
                return Err(e);
            }
        };
        if let Some(journal) = journal {
            cb.phase(Phase::Committing);
            journal.commit()?;
        }
        for sha1 in dropped {
            if let Err(e) = cache.remove(&sha1) {
                debug!("could not drop cached config {}: {}", sha1, e);
            }
        }

        if scripts_on {
            if !post.is_empty() {
                cb.phase(Phase::PostScripts);
                outcome.failed_scripts = run_post_scripts(&runner, &post);
            }
            let cmds = {
                let store = TroveStore::new(&*conn);
                trigger::post_commands(&plan.job, &mut tags, &root, &store)?
            };
            if !cmds.is_empty() {
                cb.phase(Phase::PostTagHandlers);
                if let Err(e) = cmds.run(&root, config.tag_script.as_deref(), false, cb) {
                    cb.warning(&format!("tag handlers failed: {}", e));
                }
            }
        }
        audit(jobs);
        Ok(outcome)
    }

    /// Apply rollbacks, newest first
    ///
    /// `names` must start at the newest rollback and continue without gaps.
    /// Each rollback's pairs are applied last to first: the repository
    /// change set, then the local changes, then the saved postrollback
    /// scripts. Returns the number of rollbacks applied.
    pub fn rollback(&mut self, names: &[String], flags: UpdateFlags, callback: &dyn UpdateCallback) -> Result<usize> {
        let _lock = self.lock()?;
        self.recover_locked()?;
        let mut stack = RollbackStack::open(&self.db_dir)?;
        stack.check_order(names)?;
        let _signals = SignalGuard::install()?;
        let cancel = CancelToken::new();

        for name in names {
            info!("applying rollback {}", name);
            self.apply_rollback(&mut stack, name, flags, &cancel, callback)
                .map_err(|e| match e {
                    Error::MissingRollbackCapsule(_) | Error::Cancelled => e,
                    other => Error::RollbackError(name.clone(), other.to_string()),
                })?;
            info!(target: "conary::audit", "applied rollback {}", name);
        }
        callback.done();
        Ok(names.len())
    }

    fn apply_rollback(
        &mut self,
        stack: &mut RollbackStack,
        name: &str,
        flags: UpdateFlags,
        cancel: &CancelToken,
        callback: &dyn UpdateCallback,
    ) -> Result<()> {
        let mut entry = stack.get_rollback(name)?;
        let opts = ApplyOptions {
            flags: flags | UpdateFlags::MERGE | UpdateFlags::MISSING_FILES_OKAY,
            skip_rollback: true,
            ..Default::default()
        };
        while let Some((index, repos, local)) = entry.get_last()? {
            debug!("{}: applying pair {}", name, index);
            self.apply_locked(&repos, &opts, Mode::Rollback, cancel, callback)?;
            self.apply_local_changes(&local)?;
            if !opts.flags.contains(UpdateFlags::NO_SCRIPTS) {
                let scripts = entry.post_scripts(index)?;
                let runner = ScriptRunner::new(&self.config.root, self.config.tag_script.as_deref(), callback);
                run_post_scripts(&runner, &scripts);
            }
            entry.remove_last()?;
        }
        stack.remove_last_rollback()
    }

    fn apply_local_changes(&mut self, local: &ChangeSet) -> Result<usize> {
        if local.is_empty() {
            return Ok(0);
        }
        let root = self.config.root.clone();
        let restore = RestoreContext::for_root(&root, self.config.ignore_ugids);
        let mut journal = JobJournal::start(&root, &paths::journal_path(&self.db_dir))?;
        let store = TroveStore::new(&self.conn);
        match apply_local(local, &store, &root, &mut journal, &restore) {
            Ok(touched) => {
                journal.commit()?;
                Ok(touched)
            }
            Err(e) => {
                if let Err(re) = journal.revert() {
                    error!("journal revert failed: {}", re);
                }
                Err(e)
            }
        }
    }

    /// Bring the database in line with the foreign package databases
    ///
    /// Packages installed behind Conary's back become phantom troves;
    /// capsule troves whose package is gone are erased. Only the database
    /// changes.
    pub fn sync_capsules(&mut self, callback: &dyn UpdateCallback) -> Result<ApplyReport> {
        let _lock = self.lock()?;
        self.recover_locked()?;

        let mut builder = ChangeSetBuilder::new();
        {
            let store = TroveStore::new(&self.conn);
            for plugin in self.capsules.plugins() {
                let local = plugin.get_capsule_keys_from_local(&store)?;
                let target = plugin.get_capsule_keys_from_target()?;
                let missing: Vec<&PartialTuple> = target
                    .iter()
                    .filter(|t| !local.iter().any(|(key, _)| key.matches(t)))
                    .collect();
                for (n, key) in missing.iter().enumerate() {
                    plugin.add_phantom_trove(&mut builder, &self.config.root, key, callback, n + 1, missing.len())?;
                }
                for (key, tuple) in &local {
                    if !target.iter().any(|t| t.matches(key)) {
                        info!("{} is gone from the {} database", tuple, plugin.kind());
                        builder.erase(tuple.clone());
                    }
                }
            }
        }
        let cs = builder.build();
        if cs.is_empty() {
            return Ok(ApplyReport::default());
        }
        let opts = ApplyOptions {
            flags: UpdateFlags::JUST_DATABASE | UpdateFlags::NO_SCRIPTS,
            skip_rollback: true,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let report = self.apply_locked(&cs, &opts, Mode::CapsuleSync, &cancel, callback)?;
        callback.done();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::rpm::tests::build_rpm;
    use crate::capsule::rpm::{encapsulate, file_flag};
    use crate::capsule::{MemoryRpmDb, RpmCapsule, RpmPackage};
    use crate::flavor::Flavor;
    use crate::progress::{RecordingCallback, SilentCallback};
    use crate::version::Version;
    use tempfile::TempDir;

    fn rpm_engine(root: &Path, rpmdb: &MemoryRpmDb) -> Engine {
        let mut config = EngineConfig::for_root(root);
        config.ignore_ugids = true;
        Engine::open(config)
            .unwrap()
            .with_capsule_plugin(Box::new(RpmCapsule::new(Box::new(rpmdb.clone()))))
    }

    fn foo_rpm() -> RpmPackage {
        RpmPackage::parse(build_rpm(
            "foo",
            "1.0",
            "1",
            &[
                ("/bin/a", 0o100755, b"a-bin", 0),
                ("/etc/conary-config", 0o100644, b"key=1\n", file_flag::CONFIG),
            ],
        ))
        .unwrap()
    }

    #[test]
    fn test_rpm_capsule_keeps_existing_config() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/conary-config"), b"key=local\n").unwrap();

        let rpmdb = MemoryRpmDb::new();
        let mut engine = rpm_engine(root, &rpmdb);
        let pkg = foo_rpm();
        let mut builder = ChangeSetBuilder::new();
        let version = Version::thaw("/repo@ns:1/100.000:1.0-1-1").unwrap();
        let tuple = encapsulate(&mut builder, &pkg, "foo:rpm", version).unwrap();

        let cb = RecordingCallback::new();
        let opts = ApplyOptions {
            flags: UpdateFlags::MERGE,
            ..Default::default()
        };
        engine.apply(&builder.build(), &opts, &cb).unwrap();
        assert!(cb.events().contains(&"phase Capsules".to_string()));

        assert_eq!(fs::read(root.join("bin/a")).unwrap(), b"a-bin");
        assert_eq!(fs::read(root.join("etc/conary-config")).unwrap(), b"key=local\n");
        assert_eq!(rpmdb.nevras(), vec![pkg.nevra.to_string()]);

        let store = engine.store();
        let trove = store.get_trove(&tuple, false).unwrap().unwrap();
        assert!(trove.is_capsule());
        let file_id = trove.files[&PathId::for_path("/etc/conary-config")].file_id;
        let stream = store.get_file_stream(&file_id).unwrap().unwrap();
        assert_eq!(stream.contents_sha1(), Some(Sha1Digest::of(b"key=local\n")));
        assert!(stream.flags.is_config());
        assert!(engine.verify(&tuple).unwrap().is_empty());
    }

    #[test]
    fn test_sync_capsules() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let rpmdb = MemoryRpmDb::new();
        let mut engine = rpm_engine(root, &rpmdb);

        let foo = foo_rpm();
        let mut builder = ChangeSetBuilder::new();
        let version = Version::thaw("/repo@ns:1/100.000:1.0-1-1").unwrap();
        encapsulate(&mut builder, &foo, "foo:rpm", version).unwrap();
        let opts = ApplyOptions {
            flags: UpdateFlags::MERGE,
            ..Default::default()
        };
        engine.apply(&builder.build(), &opts, &SilentCallback).unwrap();
        assert!(engine.sync_capsules(&SilentCallback).unwrap().jobs.is_empty());

        // installed behind our back
        let bar = RpmPackage::parse(build_rpm("bar", "2.0", "3", &[("/usr/bin/bar", 0o100755, b"bar", 0)])).unwrap();
        rpmdb.record(&bar).unwrap();
        let cb = RecordingCallback::new();
        let report = engine.sync_capsules(&cb).unwrap();
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(report.jobs[0].name(), "bar:rpm");
        assert!(cb.events().iter().any(|e| e.starts_with("phantom bar 1/1")));
        assert!(report.rollback.is_none());

        // removed behind our back; files stay where the packager left them
        rpmdb.forget(&foo.nevra).unwrap();
        let report = engine.sync_capsules(&SilentCallback).unwrap();
        assert_eq!(report.jobs.len(), 1);
        assert!(report.jobs[0].new.is_none());
        assert!(!engine.store().all_troves().unwrap().iter().any(|t| t.name == "foo:rpm"));
        assert!(root.join("bin/a").exists());
        assert_eq!(engine.list_rollbacks().unwrap().len(), 1);
    }

    fn tuple(name: &str) -> TroveTuple {
        TroveTuple::new(
            name,
            Version::thaw("/repo@ns:1/100.000:1.0-1-1").unwrap(),
            Flavor::empty(),
        )
    }

    #[test]
    fn test_split_critical() {
        let jobs = vec![
            Job::install(tuple("a")),
            Job::install(tuple("b")),
            Job::install(tuple("c")),
        ];
        let mut groups = vec![vec![0], vec![1], vec![2]];
        let critical = BTreeSet::from([tuple("b")]);
        let rest = split_critical(&mut groups, &jobs, &critical);
        assert_eq!(groups, vec![vec![0], vec![1]]);
        assert_eq!(rest, vec![Job::install(tuple("c"))]);

        let mut groups = vec![vec![0, 1, 2]];
        assert!(split_critical(&mut groups, &jobs, &critical).is_empty());
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_post_script_order() {
        let v = Version::thaw("/repo@ns:1/100.000:1.0-1-1").unwrap();
        let with = |name: &str, kinds: &[ScriptKind]| {
            let mut t = Trove::new(name, v.clone(), Flavor::empty());
            for k in kinds {
                t.info.scripts.insert(*k, crate::trove::TroveScript::new("true"));
            }
            t
        };
        let troves = vec![
            JobTroves {
                new: Some(with("inst", &[ScriptKind::PreInstall, ScriptKind::PostInstall])),
                old: None,
            },
            JobTroves {
                new: Some(with("upd", &[ScriptKind::PostUpdate])),
                old: Some(with("upd", &[ScriptKind::PreRollback])),
            },
            JobTroves {
                new: None,
                old: Some(with("gone", &[ScriptKind::PostErase])),
            },
        ];
        let (pre, post) = group_scripts(&troves, Mode::Normal);
        assert_eq!(pre.iter().map(|s| s.kind).collect::<Vec<_>>(), vec![ScriptKind::PreInstall]);
        assert_eq!(
            post.iter().map(|s| s.kind).collect::<Vec<_>>(),
            vec![ScriptKind::PostErase, ScriptKind::PostUpdate, ScriptKind::PostInstall]
        );
        assert_eq!(post[0].new, None);
        assert_eq!(post[1].old_compat_class, Some(0));

        let (pre, _) = group_scripts(&troves, Mode::Rollback);
        assert!(pre.iter().any(|s| s.kind == ScriptKind::PreRollback));
    }
}
