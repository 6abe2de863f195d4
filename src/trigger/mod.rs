// src/trigger/mod.rs

//! Tag handlers
//!
//! Files may carry tags. A tag is served by a handler program described by a
//! tag description file under `{root}/etc/conary/tags/<tag>`:
//!
//! ```text
//! file        /usr/libexec/conary/tags/info-file
//! implements  files update
//! implements  files remove
//! datasource  stdin
//! ```
//!
//! After a job's files are planned, [`pre_commands`] and [`post_commands`]
//! group the tagged paths by handler and phase. [`TagCommands::run`] invokes
//! each handler once per phase, or appends the invocations to a tag script.

mod description;

pub use description::{DataSource, Implements, TagDescription, load_tag_dict};

use crate::db::TroveStore;
use crate::error::Result;
use crate::filesystem::path::normalize;
use crate::progress::UpdateCallback;
use crate::scriptlet::{command_in_root, is_live_root};
use crate::update::FilesystemJob;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::process::Stdio;
use tracing::{debug, error, info, warn};

/// Tag carried by tag description files
pub const TAG_DESCRIPTION: &str = "tagdescription";
/// Tag carried by handler programs
pub const TAG_HANDLER: &str = "taghandler";

/// Handler invocation phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    HandlerPreRemove,
    FilesPreUpdate,
    FilesPreRemove,
    HandlerUpdate,
    FilesUpdate,
    FilesRemove,
}

impl Stage {
    /// The two leading handler arguments
    pub fn words(self) -> (&'static str, &'static str) {
        match self {
            Stage::HandlerPreRemove => ("handler", "preremove"),
            Stage::FilesPreUpdate => ("files", "preupdate"),
            Stage::FilesPreRemove => ("files", "preremove"),
            Stage::HandlerUpdate => ("handler", "update"),
            Stage::FilesUpdate => ("files", "update"),
            Stage::FilesRemove => ("files", "remove"),
        }
    }

    fn implements(self) -> Implements {
        match self {
            Stage::HandlerPreRemove => Implements::HandlerPreRemove,
            Stage::FilesPreUpdate => Implements::FilesPreUpdate,
            Stage::FilesPreRemove => Implements::FilesPreRemove,
            Stage::HandlerUpdate => Implements::HandlerUpdate,
            Stage::FilesUpdate => Implements::FilesUpdate,
            Stage::FilesRemove => Implements::FilesRemove,
        }
    }
}

/// Everything one handler receives in one stage
#[derive(Debug, Default, Clone)]
struct HandlerInfo {
    /// tag -> (protocol, paths)
    tags: BTreeMap<String, (DataSource, BTreeSet<String>)>,
}

impl HandlerInfo {
    fn add(&mut self, desc: &TagDescription, paths: impl IntoIterator<Item = String>) {
        let entry = self
            .tags
            .entry(desc.tag.clone())
            .or_insert_with(|| (desc.datasource, BTreeSet::new()));
        entry.1.extend(paths.into_iter().map(|p| normalize(&p)));
    }

    /// Protocol for this invocation; `None` when several tags share a
    /// handler that does not speak multitag
    fn datasource(&self, handler: &str) -> Option<DataSource> {
        if self.tags.len() > 1 {
            if self.tags.values().any(|(ds, _)| *ds != DataSource::MultiTag) {
                error!("tag handler {} used by multiple tags without multitag protocol", handler);
                return None;
            }
            return Some(DataSource::MultiTag);
        }
        self.tags.values().next().map(|(ds, _)| *ds)
    }

    fn all_paths(&self) -> BTreeSet<&str> {
        self.tags
            .values()
            .flat_map(|(_, paths)| paths.iter().map(String::as_str))
            .collect()
    }

    /// path -> sorted tags, for the multitag protocol
    fn path_tags(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut out: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (tag, (_, paths)) in &self.tags {
            for path in paths {
                out.entry(path.as_str()).or_default().push(tag.as_str());
            }
        }
        out
    }

    /// Lines written to the handler's stdin
    fn stdin_lines(&self, datasource: DataSource) -> Vec<String> {
        match datasource {
            DataSource::Args => Vec::new(),
            DataSource::Stdin => self.all_paths().into_iter().map(str::to_string).collect(),
            DataSource::MultiTag => self
                .path_tags()
                .into_iter()
                .flat_map(|(path, tags)| [tags.join(" "), path.to_string()])
                .collect(),
        }
    }
}

/// Handler invocations grouped by stage and handler path
#[derive(Debug, Default, Clone)]
pub struct TagCommands {
    commands: BTreeMap<Stage, BTreeMap<String, HandlerInfo>>,
}

impl TagCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.values().all(|h| h.is_empty())
    }

    pub fn add(&mut self, desc: &TagDescription, stage: Stage, paths: impl IntoIterator<Item = String>) {
        self.commands
            .entry(stage)
            .or_default()
            .entry(desc.file.clone())
            .or_default()
            .add(desc, paths);
    }

    /// `(stage, handler, argv)` for every invocation, in run order
    pub fn invocations(&self) -> Vec<(Stage, String, Vec<String>)> {
        let mut out = Vec::new();
        for (stage, handlers) in &self.commands {
            for (handler, info) in handlers {
                let Some(ds) = info.datasource(handler) else {
                    break;
                };
                out.push((*stage, handler.clone(), argv(handler, *stage, info, ds)));
            }
        }
        out
    }

    /// Run every handler, or append the invocations to `tag_script`
    ///
    /// Handler failures are reported through the callback and do not stop
    /// later handlers.
    pub fn run(
        &self,
        root: &Path,
        tag_script: Option<&Path>,
        pre: bool,
        callback: &dyn UpdateCallback,
    ) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if let Some(script) = tag_script {
            return self.write_script(script, pre);
        }

        let as_root = nix::unistd::geteuid().is_root();
        for (stage, handlers) in &self.commands {
            let (kind, action) = stage.words();
            for (handler, info) in handlers {
                let Some(ds) = info.datasource(handler) else {
                    break;
                };
                let args = argv(handler, *stage, info, ds);
                debug!("running {}", args.join(" "));
                if !is_live_root(root) && !as_root {
                    continue;
                }
                callback.tag_handler_started(handler, &format!("{} {}", kind, action));
                match run_handler(root, &args, &info.stdin_lines(ds)) {
                    Ok(0) => {}
                    Ok(status) => {
                        error!("{} failed", handler);
                        callback.tag_handler_failed(handler, status);
                    }
                    Err(e) => {
                        error!("{}: {}", handler, e);
                        callback.tag_handler_failed(handler, -1);
                    }
                }
            }
        }
        Ok(())
    }

    fn write_script(&self, path: &Path, pre: bool) -> Result<()> {
        let prefix = if pre { "# " } else { "" };
        let mut out = String::new();
        for (stage, handlers) in &self.commands {
            let (kind, action) = stage.words();
            for (handler, info) in handlers {
                let Some(ds) = info.datasource(handler) else {
                    break;
                };
                match ds {
                    DataSource::Args => {
                        let paths: Vec<&str> = info.all_paths().into_iter().collect();
                        out.push_str(&format!(
                            "{}{} {} {} {}\n",
                            prefix,
                            handler,
                            kind,
                            action,
                            paths.join(" ")
                        ));
                    }
                    DataSource::Stdin | DataSource::MultiTag => {
                        out.push_str(&format!("{}{} {} {} <<EOF\n", prefix, handler, kind, action));
                        for line in info.stdin_lines(ds) {
                            out.push_str(&format!("{}{}\n", prefix, line));
                        }
                        out.push_str(&format!("{}EOF\n", prefix));
                    }
                }
            }
        }
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        f.write_all(out.as_bytes())?;
        Ok(())
    }
}

fn argv(handler: &str, stage: Stage, info: &HandlerInfo, ds: DataSource) -> Vec<String> {
    let (kind, action) = stage.words();
    let mut args = vec![handler.to_string(), kind.to_string(), action.to_string()];
    if ds == DataSource::Args {
        args.extend(info.all_paths().into_iter().map(str::to_string));
    }
    args
}

/// Run one handler in its own child, feeding `lines` on stdin
fn run_handler(root: &Path, args: &[String], lines: &[String]) -> Result<i32> {
    let mut cmd = command_in_root(root, &args[0])?;
    cmd.args(&args[1..]).stdin(Stdio::piped());
    let mut child = cmd.spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        for line in lines {
            if let Err(e) = writeln!(stdin, "{}", line) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e.into());
                }
                error!("{}: {}", args[0], e);
                break;
            }
        }
    }
    let status = child.wait()?;
    Ok(status.code().unwrap_or(-1))
}

/// The description of `tag` if its handler takes part in `stage`
fn handler_for(tags: &BTreeMap<String, TagDescription>, tag: &str, stage: Stage) -> Option<TagDescription> {
    tags.get(tag)
        .filter(|d| d.implements.contains(&stage.implements()))
        .cloned()
}

/// Handler calls made before the job touches the filesystem
///
/// Handlers being removed by the job get `handler preremove` with every
/// file the database tags for them and are dropped from `tags`, so they see
/// no further calls.
pub fn pre_commands(
    job: &FilesystemJob,
    tags: &mut BTreeMap<String, TagDescription>,
    store: &TroveStore<'_>,
) -> Result<TagCommands> {
    let mut cmds = TagCommands::new();

    for (tag, paths) in job.tag_updates() {
        if tag == TAG_DESCRIPTION || tag == TAG_HANDLER {
            continue;
        }
        if let Some(desc) = handler_for(tags, tag, Stage::FilesPreUpdate) {
            cmds.add(&desc, Stage::FilesPreUpdate, paths.iter().cloned());
        }
    }

    if let Some(removed) = job.tag_removes().get(TAG_HANDLER) {
        let leaving: Vec<TagDescription> = tags
            .values()
            .filter(|d| removed.contains(&d.file))
            .cloned()
            .collect();
        for desc in leaving {
            tags.remove(&desc.tag);
            if desc.implements.contains(&Implements::HandlerPreRemove) {
                cmds.add(&desc, Stage::HandlerPreRemove, store.iter_files_with_tag(&desc.tag)?);
            }
        }
    }

    for (tag, paths) in job.tag_removes() {
        if tag == TAG_DESCRIPTION || tag == TAG_HANDLER {
            continue;
        }
        if let Some(desc) = handler_for(tags, tag, Stage::FilesPreRemove) {
            cmds.add(&desc, Stage::FilesPreRemove, paths.iter().cloned());
        }
    }
    Ok(cmds)
}

/// Handler calls made after files and database are updated
///
/// A tag description installed by the job, or whose handler the job
/// updated, is new: its handler gets `handler update` (or `files update`)
/// with every file the database tags for it, including the job's own files,
/// and it joins `tags`.
pub fn post_commands(
    job: &FilesystemJob,
    tags: &mut BTreeMap<String, TagDescription>,
    root: &Path,
    store: &TroveStore<'_>,
) -> Result<TagCommands> {
    let mut cmds = TagCommands::new();
    let mut fresh: BTreeMap<String, TagDescription> = BTreeMap::new();

    for path in job.tag_updates().get(TAG_DESCRIPTION).into_iter().flatten() {
        match TagDescription::load(root, path) {
            Ok(desc) => {
                fresh.insert(desc.tag.clone(), desc);
            }
            Err(e) => warn!("ignoring tag description {}: {}", path, e),
        }
    }
    for path in job.tag_updates().get(TAG_HANDLER).into_iter().flatten() {
        for desc in tags.values().filter(|d| &d.file == path) {
            fresh.entry(desc.tag.clone()).or_insert_with(|| desc.clone());
        }
    }

    for (tag, desc) in &fresh {
        info!("new tag handler {} for {}", desc.file, tag);
        if desc.implements.contains(&Implements::HandlerUpdate) {
            cmds.add(desc, Stage::HandlerUpdate, store.iter_files_with_tag(tag)?);
        } else if desc.implements.contains(&Implements::FilesUpdate) {
            let paths = store.iter_files_with_tag(tag)?;
            if !paths.is_empty() {
                cmds.add(desc, Stage::FilesUpdate, paths);
            }
        }
        tags.insert(tag.clone(), desc.clone());
    }

    for (tag, paths) in job.tag_updates() {
        if tag == TAG_DESCRIPTION || fresh.contains_key(tag) {
            continue;
        }
        if let Some(desc) = handler_for(tags, tag, Stage::FilesUpdate) {
            cmds.add(&desc, Stage::FilesUpdate, paths.iter().cloned());
        }
    }
    for (tag, paths) in job.tag_removes() {
        if let Some(desc) = handler_for(tags, tag, Stage::FilesRemove) {
            cmds.add(&desc, Stage::FilesRemove, paths.iter().cloned());
        }
    }
    Ok(cmds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingCallback;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn desc(tag: &str, file: &str, ds: DataSource, implements: &[Implements]) -> TagDescription {
        TagDescription {
            tag: tag.to_string(),
            file: file.to_string(),
            description_path: format!("/etc/conary/tags/{}", tag),
            datasource: ds,
            implements: implements.iter().copied().collect(),
        }
    }

    fn paths(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_phase_order_and_sorting() {
        let a = desc("a", "/usr/libexec/b-handler", DataSource::Args, &[]);
        let b = desc("b", "/usr/libexec/a-handler", DataSource::Args, &[]);
        let mut cmds = TagCommands::new();
        cmds.add(&a, Stage::FilesRemove, paths(&["/x"]));
        cmds.add(&a, Stage::FilesUpdate, paths(&["//usr/z", "/usr/y"]));
        cmds.add(&b, Stage::FilesUpdate, paths(&["/w"]));
        cmds.add(&b, Stage::HandlerPreRemove, paths(&["/v"]));

        let inv = cmds.invocations();
        let order: Vec<(Stage, &str)> = inv.iter().map(|(s, h, _)| (*s, h.as_str())).collect();
        assert_eq!(
            order,
            vec![
                (Stage::HandlerPreRemove, "/usr/libexec/a-handler"),
                (Stage::FilesUpdate, "/usr/libexec/a-handler"),
                (Stage::FilesUpdate, "/usr/libexec/b-handler"),
                (Stage::FilesRemove, "/usr/libexec/b-handler"),
            ]
        );
        assert_eq!(
            inv[2].2,
            paths(&["/usr/libexec/b-handler", "files", "update", "/usr/y", "/usr/z"])
        );
    }

    #[test]
    fn test_multitag_protocol() {
        let a = desc("font", "/h", DataSource::MultiTag, &[]);
        let b = desc("icon", "/h", DataSource::MultiTag, &[]);
        let mut cmds = TagCommands::new();
        cmds.add(&a, Stage::FilesUpdate, paths(&["/f1", "/f2"]));
        cmds.add(&b, Stage::FilesUpdate, paths(&["/f2"]));

        let info = &cmds.commands[&Stage::FilesUpdate]["/h"];
        assert_eq!(info.datasource("/h"), Some(DataSource::MultiTag));
        assert_eq!(
            info.stdin_lines(DataSource::MultiTag),
            paths(&["font", "/f1", "font icon", "/f2"])
        );
    }

    #[test]
    fn test_shared_handler_without_multitag() {
        let a = desc("font", "/h", DataSource::Stdin, &[]);
        let b = desc("icon", "/h", DataSource::MultiTag, &[]);
        let mut cmds = TagCommands::new();
        cmds.add(&a, Stage::FilesUpdate, paths(&["/f1"]));
        cmds.add(&b, Stage::FilesUpdate, paths(&["/f2"]));
        assert!(cmds.invocations().is_empty());
    }

    #[test]
    fn test_tag_script_output() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("tagscript");
        let args = desc("a", "/ha", DataSource::Args, &[]);
        let stdin = desc("s", "/hs", DataSource::Stdin, &[]);

        let mut pre = TagCommands::new();
        pre.add(&stdin, Stage::FilesPreRemove, paths(&["/gone"]));
        pre.run(tmp.path(), Some(&script), true, &RecordingCallback::new())
            .unwrap();

        let mut post = TagCommands::new();
        post.add(&args, Stage::FilesUpdate, paths(&["/b", "/a"]));
        post.add(&stdin, Stage::FilesRemove, paths(&["/gone"]));
        post.run(tmp.path(), Some(&script), false, &RecordingCallback::new())
            .unwrap();

        let text = fs::read_to_string(&script).unwrap();
        assert_eq!(
            text,
            "# /hs files preremove <<EOF\n# /gone\n# EOF\n\
             /ha files update /a /b\n\
             /hs files remove <<EOF\n/gone\nEOF\n"
        );
    }

    #[test]
    fn test_handler_runs_with_stdin() {
        if !Path::new("/bin/sh").exists() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("seen");
        let handler = tmp.path().join("handler");
        fs::write(
            &handler,
            format!("#!/bin/sh\necho \"$@\" > {0}\ncat >> {0}\n", out.display()),
        )
        .unwrap();
        fs::set_permissions(&handler, fs::Permissions::from_mode(0o755)).unwrap();

        let d = desc("t", &handler.to_string_lossy(), DataSource::Stdin, &[]);
        let mut cmds = TagCommands::new();
        cmds.add(&d, Stage::FilesUpdate, paths(&["/etc/a", "/etc/b"]));
        let cb = RecordingCallback::new();
        cmds.run(Path::new("/"), None, false, &cb).unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "files update\n/etc/a\n/etc/b\n");
        assert_eq!(cb.events().len(), 1);
    }
}
