// src/files/ids.rs

//! User and group name lookup relative to an install root
//!
//! File objects record owners by name. Restoring under a root other than `/`
//! must resolve names against that root's `etc/passwd` and `etc/group`, not
//! the host's. When the root has no such files, the host database is used.

use nix::unistd::{Gid, Group, Uid, User};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Name/id maps loaded from an install root
#[derive(Debug, Clone, Default)]
pub struct IdLookup {
    users: HashMap<String, u32>,
    groups: HashMap<String, u32>,
    use_host: bool,
}

impl IdLookup {
    /// Load `etc/passwd` and `etc/group` from `root`
    pub fn load(root: &Path) -> Self {
        let passwd = root.join("etc/passwd");
        let group = root.join("etc/group");
        let use_host = root == Path::new("/") || !passwd.exists();
        Self {
            users: parse_db(&passwd),
            groups: parse_db(&group),
            use_host,
        }
    }

    /// Uid for `name`, or `None` when the name is unknown
    pub fn uid(&self, name: &str) -> Option<u32> {
        if let Some(id) = self.users.get(name) {
            return Some(*id);
        }
        if self.use_host {
            return User::from_name(name).ok().flatten().map(|u| u.uid.as_raw());
        }
        None
    }

    pub fn gid(&self, name: &str) -> Option<u32> {
        if let Some(id) = self.groups.get(name) {
            return Some(*id);
        }
        if self.use_host {
            return Group::from_name(name).ok().flatten().map(|g| g.gid.as_raw());
        }
        None
    }

    /// Name for `uid`; falls back to the decimal id
    pub fn user_name(&self, uid: u32) -> String {
        if let Some((name, _)) = self.users.iter().find(|(_, id)| **id == uid) {
            return name.clone();
        }
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| uid.to_string())
    }

    pub fn group_name(&self, gid: u32) -> String {
        if let Some((name, _)) = self.groups.iter().find(|(_, id)| **id == gid) {
            return name.clone();
        }
        Group::from_gid(Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.name)
            .unwrap_or_else(|| gid.to_string())
    }
}

/// Parse `name:x:id:...` lines
fn parse_db(path: &Path) -> HashMap<String, u32> {
    let mut out = HashMap::new();
    let Ok(text) = fs::read_to_string(path) else {
        return out;
    };
    for line in text.lines() {
        let mut fields = line.split(':');
        let (Some(name), Some(_), Some(id)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(id) = id.parse::<u32>() {
            out.entry(name.to_string()).or_insert(id);
        }
    }
    out
}
