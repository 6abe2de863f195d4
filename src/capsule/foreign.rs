// src/capsule/foreign.rs

//! The foreign package database a capsule plugin drives
//!
//! [`RpmCommandDb`] runs the system `rpm` tool against the install root.
//! [`MemoryRpmDb`] keeps its package list in memory and unpacks payloads
//! itself, for roots that have no rpm tooling.

use super::rpm::{Nevra, RpmFile, RpmPackage};
use crate::error::{Error, Result};
use crate::hash::Sha1Digest;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A package recorded in the foreign database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub nevra: Nevra,
    pub header_sha1: Option<Sha1Digest>,
    pub files: Vec<RpmFile>,
}

impl InstalledPackage {
    pub fn from_package(pkg: &RpmPackage) -> Self {
        Self {
            nevra: pkg.nevra.clone(),
            header_sha1: Some(pkg.header_sha1),
            files: pkg.files.clone(),
        }
    }
}

/// A package file written to disk for the foreign transaction
#[derive(Debug, Clone)]
pub struct StagedPackage {
    pub path: PathBuf,
    pub package: RpmPackage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForeignOptions {
    /// Record the transaction without touching files
    pub just_database: bool,
    pub no_scripts: bool,
}

pub trait ForeignDb {
    /// Whether this database can be used for `root`
    fn is_available(&self, root: &Path) -> bool;

    fn installed(&self) -> Result<Vec<InstalledPackage>>;

    /// Erase `erase`, then install `install`, as one transaction
    fn commit(
        &mut self,
        root: &Path,
        erase: &[Nevra],
        install: &[StagedPackage],
        opts: &ForeignOptions,
    ) -> Result<()>;
}

/// The system rpm tool, run with `--root`
#[derive(Debug, Clone)]
pub struct RpmCommandDb {
    root: PathBuf,
    program: PathBuf,
}

const QUERY_FORMAT: &str = "%{NAME}\t%{EPOCH}\t%{VERSION}\t%{RELEASE}\t%{ARCH}\t%{SHA1HEADER}\n\
[@\t%{FILENAMES}\t%{FILEMODES}\t%{FILESIZES}\t%{FILEMTIMES}\t%{FILERDEVS}\t%{FILEUSERNAME}\t%{FILEGROUPNAME}\t%{FILEFLAGS}\t%{FILELINKTOS}\n]";

impl RpmCommandDb {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            program: PathBuf::from("rpm"),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--root").arg(&self.root);
        cmd
    }

    fn run(&self, mut cmd: Command, what: &str) -> Result<String> {
        debug!("running {:?}", cmd);
        let output = cmd
            .output()
            .map_err(|e| Error::CapsuleError(format!("failed to run rpm: {}. Is rpm installed?", e)))?;
        if !output.status.success() {
            return Err(Error::CapsuleError(format!(
                "rpm {} failed: {}",
                what,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn none_or<T>(field: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    if field == "(none)" || field.is_empty() {
        None
    } else {
        parse(field)
    }
}

/// Parse query output in [`QUERY_FORMAT`]
pub fn parse_query(output: &str) -> Vec<InstalledPackage> {
    let mut out: Vec<InstalledPackage> = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        match fields.as_slice() {
            ["@", path, mode, size, mtime, rdev, user, group, flags, link] => {
                let Some(pkg) = out.last_mut() else {
                    warn!("file line before any package: {}", line);
                    continue;
                };
                let num = |s: &str| s.parse::<u64>().unwrap_or(0);
                pkg.files.push(RpmFile {
                    path: path.to_string(),
                    mode: num(mode) as u32,
                    size: num(size),
                    mtime: num(mtime) as u32,
                    rdev: num(rdev) as u32,
                    user: user.to_string(),
                    group: group.to_string(),
                    link_to: link.to_string(),
                    flags: num(flags) as u32,
                });
            }
            [name, epoch, version, release, arch, sha1] => out.push(InstalledPackage {
                nevra: Nevra {
                    name: name.to_string(),
                    epoch: none_or(epoch, |s| s.parse().ok()),
                    version: version.to_string(),
                    release: release.to_string(),
                    arch: none_or(arch, |s| Some(s.to_string())).unwrap_or_else(|| "noarch".to_string()),
                },
                header_sha1: none_or(sha1, |s| Sha1Digest::from_hex(s).ok()),
                files: Vec::new(),
            }),
            [""] => {}
            _ => warn!("unexpected rpm query line: {}", line),
        }
    }
    out
}

impl ForeignDb for RpmCommandDb {
    fn is_available(&self, root: &Path) -> bool {
        let has_db = ["var/lib/rpm", "usr/lib/sysimage/rpm"]
            .iter()
            .any(|d| root.join(d).is_dir());
        has_db
            && Command::new(&self.program)
                .arg("--version")
                .output()
                .is_ok_and(|o| o.status.success())
    }

    fn installed(&self) -> Result<Vec<InstalledPackage>> {
        let mut cmd = self.command();
        cmd.args(["-qa", "--queryformat", QUERY_FORMAT]);
        Ok(parse_query(&self.run(cmd, "query")?))
    }

    fn commit(
        &mut self,
        _root: &Path,
        erase: &[Nevra],
        install: &[StagedPackage],
        opts: &ForeignOptions,
    ) -> Result<()> {
        let flags = |cmd: &mut Command| {
            cmd.arg("--nodeps");
            if opts.just_database {
                cmd.arg("--justdb");
            }
            if opts.no_scripts {
                cmd.arg("--noscripts");
            }
        };
        if !erase.is_empty() {
            let mut cmd = self.command();
            cmd.arg("-e");
            flags(&mut cmd);
            cmd.args(erase.iter().map(Nevra::nvra));
            self.run(cmd, "erase")?;
        }
        if !install.is_empty() {
            let mut cmd = self.command();
            cmd.args(["-i", "--replacefiles", "--replacepkgs"]);
            flags(&mut cmd);
            cmd.args(install.iter().map(|s| s.path.as_os_str()));
            self.run(cmd, "install")?;
        }
        Ok(())
    }
}

/// An in-memory package list that writes payloads itself
#[derive(Debug, Clone, Default)]
pub struct MemoryRpmDb {
    packages: Arc<Mutex<Vec<InstalledPackage>>>,
}

impl MemoryRpmDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<InstalledPackage>>> {
        self.packages
            .lock()
            .map_err(|_| Error::CapsuleError("foreign package list is poisoned".to_string()))
    }

    /// Record `pkg` as installed without touching any files
    pub fn record(&self, pkg: &RpmPackage) -> Result<()> {
        self.lock()?.push(InstalledPackage::from_package(pkg));
        Ok(())
    }

    /// Drop a package from the list without touching any files
    pub fn forget(&self, nevra: &Nevra) -> Result<()> {
        self.lock()?.retain(|p| p.nevra != *nevra);
        Ok(())
    }

    pub fn nevras(&self) -> Vec<String> {
        self.lock()
            .map(|p| p.iter().map(|p| p.nevra.to_string()).collect())
            .unwrap_or_default()
    }
}

impl ForeignDb for MemoryRpmDb {
    fn is_available(&self, _root: &Path) -> bool {
        true
    }

    fn installed(&self) -> Result<Vec<InstalledPackage>> {
        Ok(self.lock()?.clone())
    }

    fn commit(
        &mut self,
        root: &Path,
        erase: &[Nevra],
        install: &[StagedPackage],
        opts: &ForeignOptions,
    ) -> Result<()> {
        let mut packages = self.lock()?;
        for nevra in erase {
            let Some(pos) = packages.iter().position(|p| p.nevra == *nevra) else {
                return Err(Error::CapsuleError(format!("{} is not installed", nevra)));
            };
            let pkg = packages.remove(pos);
            if opts.just_database {
                continue;
            }
            let mut dirs = Vec::new();
            for file in pkg.files.iter().rev() {
                let target = root.join(file.path.trim_start_matches('/'));
                match fs::symlink_metadata(&target) {
                    Ok(meta) if meta.is_dir() => dirs.push(target),
                    Ok(_) => fs::remove_file(&target)?,
                    Err(_) => {}
                }
            }
            for dir in dirs {
                if fs::remove_dir(&dir).is_err() {
                    debug!("{} is not empty; leaving it", dir.display());
                }
            }
        }
        for staged in install {
            if !opts.just_database {
                staged.package.extract(root)?;
            }
            packages.retain(|p| p.nevra != staged.package.nevra);
            packages.push(InstalledPackage::from_package(&staged.package));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::rpm::tests::build_rpm;

    #[test]
    fn test_parse_query() {
        let out = "bash\t(none)\t5.2\t1.fc40\tx86_64\t0123456789abcdef0123456789abcdef01234567\n\
@\t/usr/bin/bash\t33261\t100\t1700000000\t0\troot\troot\t0\t\n\
@\t/etc/bashrc\t33188\t10\t1700000000\t0\troot\troot\t17\t\n\
kernel\t1\t6.8\t2\t(none)\t(none)\n";
        let pkgs = parse_query(out);
        assert_eq!(pkgs.len(), 2);
        assert_eq!(pkgs[0].nevra.to_string(), "bash-5.2-1.fc40.x86_64");
        assert_eq!(pkgs[0].files.len(), 2);
        assert!(pkgs[0].files[1].is_config());
        assert_eq!(pkgs[0].files[0].mode, 0o100755);
        assert!(pkgs[0].header_sha1.is_some());
        assert_eq!(pkgs[1].nevra.epoch, Some(1));
        assert_eq!(pkgs[1].nevra.arch, "noarch");
        assert!(pkgs[1].header_sha1.is_none());
    }

    #[test]
    fn test_memory_db() {
        let tmp = tempfile::TempDir::new().unwrap();
        let data = build_rpm("foo", "1.0", "1", &[("/usr/bin/foo", 0o100755, b"x", 0)]);
        let package = RpmPackage::parse(data).unwrap();
        let path = tmp.path().join("foo.rpm");
        fs::write(&path, package.bytes()).unwrap();
        let staged = StagedPackage { path, package: package.clone() };

        let mut db = MemoryRpmDb::new();
        let view = db.clone();
        db.commit(tmp.path(), &[], &[staged], &ForeignOptions::default()).unwrap();
        assert_eq!(view.nevras(), vec!["foo-1.0-1.x86_64"]);
        assert!(tmp.path().join("usr/bin/foo").exists());

        db.commit(tmp.path(), &[package.nevra.clone()], &[], &ForeignOptions::default()).unwrap();
        assert!(view.nevras().is_empty());
        assert!(!tmp.path().join("usr/bin/foo").exists());

        let err = db.commit(tmp.path(), &[package.nevra.clone()], &[], &ForeignOptions::default());
        assert!(matches!(err, Err(Error::CapsuleError(_))));
    }
}
