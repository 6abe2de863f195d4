// src/scriptlet/mod.rs

//! Trove script execution
//!
//! Troves carry scripts for install, update, erase and rollback hook points.
//! A script is written to a private file under `{root}/tmp` and executed
//! with a minimal environment describing the troves involved:
//!
//! - `CONARY_NEW_NAME`, `CONARY_NEW_VERSION`, `CONARY_NEW_FLAVOR`,
//!   `CONARY_NEW_COMPATIBILITY_CLASS` for the trove being installed
//! - `CONARY_OLD_*` and `CONARY_OLD_COMPATIBILITY_CLASS` for the trove being
//!   replaced or erased
//!
//! When the root is not `/` the script runs chrooted into it, which needs
//! root privileges; without them the script is skipped. A nonzero exit is
//! reported through the callback and never undoes the content change.
//!
//! In tag-script mode nothing runs: the script stays in `{root}/tmp` and an
//! invocation line is appended to the tag script instead.

use crate::error::{Error, Result};
use crate::progress::UpdateCallback;
use crate::trove::{ScriptKind, TroveScript, TroveTuple};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// PATH handed to scripts and tag handlers
pub const SCRIPT_PATH: &str = "/sbin:/bin:/usr/sbin:/usr/bin";

/// Whether `kind` runs before content changes
pub fn is_pre_script(kind: ScriptKind) -> bool {
    matches!(
        kind,
        ScriptKind::PreInstall | ScriptKind::PreUpdate | ScriptKind::PreErase | ScriptKind::PreRollback
    )
}

/// One script to run, with the troves it describes
#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub kind: ScriptKind,
    pub script: TroveScript,
    /// Trove being installed; `None` for erase scripts
    pub new: Option<TroveTuple>,
    pub new_compat_class: Option<u32>,
    /// Trove being replaced or erased
    pub old: Option<TroveTuple>,
    pub old_compat_class: Option<u32>,
}

impl ScriptJob {
    /// The trove whose script this is
    pub fn owner(&self) -> Option<&TroveTuple> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Environment passed to the script, sorted by name
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        let mut push = |side: &str, trove: &TroveTuple, class: Option<u32>| {
            env.push((format!("CONARY_{}_NAME", side), trove.name.clone()));
            env.push((format!("CONARY_{}_VERSION", side), trove.version.to_string()));
            env.push((format!("CONARY_{}_FLAVOR", side), trove.flavor.to_string()));
            if let Some(class) = class {
                env.push((format!("CONARY_{}_COMPATIBILITY_CLASS", side), class.to_string()));
            }
        };
        if let Some(new) = &self.new {
            push("NEW", new, self.new_compat_class);
        }
        if let Some(old) = &self.old {
            push("OLD", old, self.old_compat_class);
        }
        env.sort();
        env
    }
}

/// Runs trove scripts against an install root
pub struct ScriptRunner<'a> {
    root: PathBuf,
    tag_script: Option<&'a Path>,
    callback: &'a dyn UpdateCallback,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(root: &Path, tag_script: Option<&'a Path>, callback: &'a dyn UpdateCallback) -> Self {
        Self {
            root: root.to_path_buf(),
            tag_script,
            callback,
        }
    }

    /// Run one script, returning its exit status
    ///
    /// Skipped scripts report 0. Failures to start the script are returned
    /// as errors; a nonzero exit is not.
    pub fn run(&self, job: &ScriptJob) -> Result<i32> {
        let Some(owner) = job.owner() else {
            return Err(Error::ScriptletError(format!("{} script has no trove", job.kind)));
        };
        self.callback.script_started(job.kind, owner);

        if let Some(tag_script) = self.tag_script {
            let (_, inner) = self.write_script(job, true)?;
            append_script_entry(tag_script, &job.environment(), &inner, is_pre_script(job.kind))?;
            return Ok(0);
        }

        if !is_live_root(&self.root) && !nix::unistd::geteuid().is_root() {
            warn!(
                "Skipping {} script of {}: running scripts in {} requires root",
                job.kind,
                owner,
                self.root.display()
            );
            return Ok(0);
        }

        info!("Running {} script of {}", job.kind, owner);
        let (host, inner) = self.write_script(job, false)?;
        let result = self.execute(job, &inner);
        if let Err(e) = fs::remove_file(&host) {
            debug!("could not remove {}: {}", host.display(), e);
        }
        let status = result?;
        if status != 0 {
            self.callback.script_failed(job.kind, owner, status);
        }
        Ok(status)
    }

    fn execute(&self, job: &ScriptJob, inner: &str) -> Result<i32> {
        let mut cmd = command_in_root(&self.root, inner)?;
        cmd.envs(job.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .map_err(|e| Error::ScriptletError(format!("failed to run {} script: {}", job.kind, e)))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!("[{}] {}", job.kind, line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!("[{}] {}", job.kind, line);
        }
        Ok(output.status.code().unwrap_or(-1))
    }

    /// Write the script under `{root}/tmp`; returns the host path and the
    /// path seen from inside the root
    fn write_script(&self, job: &ScriptJob, keep: bool) -> Result<(PathBuf, String)> {
        let dir = self.root.join("tmp");
        fs::create_dir_all(&dir)?;
        let file = tempfile::Builder::new()
            .prefix(&format!("conary-{}-", job.kind))
            .tempfile_in(&dir)?;

        let mut text = job.script.script.clone();
        if !text.starts_with("#!") {
            text.insert_str(0, "#!/bin/sh\n");
        }
        file.as_file().write_all(text.as_bytes())?;
        file.as_file().set_permissions(fs::Permissions::from_mode(0o700))?;

        let (_, host) = file.keep().map_err(|e| Error::IoError(e.to_string()))?;
        let name = host
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::IoError(format!("bad script path {}", host.display())))?;
        if keep {
            debug!("kept {} for the tag script", host.display());
        }
        Ok((host, format!("/tmp/{}", name)))
    }
}

pub(crate) fn is_live_root(root: &Path) -> bool {
    root == Path::new("/")
}

/// A command that runs `program` with `root` as its filesystem root
///
/// The environment is cleared down to `PATH`. For any root other than `/`
/// the child chroots before exec, so `program` is a path inside the root.
pub(crate) fn command_in_root(root: &Path, program: &str) -> Result<Command> {
    let mut cmd = Command::new(program);
    cmd.env_clear().env("PATH", SCRIPT_PATH);
    if is_live_root(root) {
        cmd.current_dir("/");
        return Ok(cmd);
    }

    let root_cstr = std::ffi::CString::new(root.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::ScriptletError(format!("invalid root path: {}", e)))?;
    cmd.current_dir(root);
    // chroot and chdir are async-signal-safe
    unsafe {
        cmd.pre_exec(move || {
            if libc::chroot(root_cstr.as_ptr()) != 0 || libc::chdir(c"/".as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(cmd)
}

/// Append a script invocation to a tag script
///
/// Environment assignments prefix the command and the script removes itself
/// afterwards. Pre entries are commented out.
pub fn append_script_entry(
    tag_script: &Path,
    env: &[(String, String)],
    inner_path: &str,
    pre: bool,
) -> Result<()> {
    let prefix = if pre { "# " } else { "" };
    let assignments: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
        .collect();
    let mut line = String::new();
    line.push_str(prefix);
    if !assignments.is_empty() {
        line.push_str(&assignments.join(" "));
        line.push(' ');
    }
    line.push_str(inner_path);
    line.push('\n');
    line.push_str(&format!("{}rm {}\n", prefix, inner_path));

    let mut f = OpenOptions::new().create(true).append(true).open(tag_script)?;
    f.write_all(line.as_bytes())?;
    Ok(())
}

/// Single-quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:@+=,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::Flavor;
    use crate::progress::RecordingCallback;
    use crate::version::Version;
    use tempfile::TempDir;

    fn tuple(name: &str, v: &str) -> TroveTuple {
        TroveTuple::new(name, Version::thaw(v).unwrap(), Flavor::empty())
    }

    fn update_job(script: &str) -> ScriptJob {
        ScriptJob {
            kind: ScriptKind::PostUpdate,
            script: TroveScript::new(script),
            new: Some(tuple("group-foo", "/repo@ns:1/200.000:1.1-1-1")),
            new_compat_class: Some(1),
            old: Some(tuple("group-foo", "/repo@ns:1/100.000:1.0-1-1")),
            old_compat_class: None,
        }
    }

    #[test]
    fn test_environment() {
        let env = update_job("true").environment();
        let get = |k: &str| env.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("CONARY_NEW_NAME"), Some("group-foo"));
        assert_eq!(get("CONARY_NEW_COMPATIBILITY_CLASS"), Some("1"));
        assert_eq!(get("CONARY_OLD_NAME"), Some("group-foo"));
        assert_eq!(get("CONARY_OLD_COMPATIBILITY_CLASS"), None);
        assert!(get("CONARY_OLD_VERSION").unwrap().contains("1.0-1-1"));
    }

    #[test]
    fn test_erase_script_has_only_old_side() {
        let job = ScriptJob {
            kind: ScriptKind::PreErase,
            script: TroveScript::new("true"),
            new: None,
            new_compat_class: None,
            old: Some(tuple("foo", "/repo@ns:1/100.000:1.0-1-1")),
            old_compat_class: Some(2),
        };
        assert_eq!(job.owner().map(|t| t.name.as_str()), Some("foo"));
        assert!(job.environment().iter().all(|(k, _)| k.starts_with("CONARY_OLD_")));
    }

    #[test]
    fn test_tag_script_mode() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let tag_script = tmp.path().join("tagscript");
        let cb = RecordingCallback::new();

        let runner = ScriptRunner::new(&root, Some(&tag_script), &cb);
        assert_eq!(runner.run(&update_job("echo hi")).unwrap(), 0);
        let mut pre = update_job("echo pre");
        pre.kind = ScriptKind::PreUpdate;
        runner.run(&pre).unwrap();

        let text = fs::read_to_string(&tag_script).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("CONARY_NEW_COMPATIBILITY_CLASS=1 "));
        assert!(lines[0].ends_with(lines[1].trim_start_matches("rm ")));
        assert!(lines[2].starts_with("# CONARY_"));
        assert!(lines[3].starts_with("# rm /tmp/conary-preupdate-"));

        // scripts stay in place for the tag script to run
        assert_eq!(fs::read_dir(root.join("tmp")).unwrap().count(), 2);
        assert_eq!(cb.events().len(), 2);
    }

    #[test]
    fn test_runs_on_live_root() {
        if !Path::new("/bin/sh").exists() {
            return;
        }
        let cb = RecordingCallback::new();
        let runner = ScriptRunner::new(Path::new("/"), None, &cb);
        let job = update_job("#!/bin/sh\ntest \"$CONARY_NEW_NAME\" = group-foo\n");
        // writing into /tmp of the live root is fine for a test
        assert_eq!(runner.run(&job).unwrap(), 0);

        let failing = update_job("exit 3\n");
        assert_eq!(runner.run(&failing).unwrap(), 3);
        assert!(cb.events().iter().any(|e| e.starts_with("script failed postupdate")));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain/value-1.0"), "plain/value-1.0");
        assert_eq!(shell_quote("is: x86"), "'is: x86'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_pre_kinds() {
        assert!(is_pre_script(ScriptKind::PreRollback));
        assert!(!is_pre_script(ScriptKind::PostInstall));
    }
}
