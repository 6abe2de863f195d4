// src/db/store.rs

//! Trove-level operations on the installed-system database
//!
//! [`TroveStore`] wraps a connection (usually an open transaction) and turns
//! [`Trove`] values into rows and back. Interned version and flavor ids are
//! cached on the handle for the lifetime of the borrow.

use super::models::{
    self, FileStream, Instance, InternTable, Presence, TroveFileRow, TroveTroveRow, dependency,
    trove_info,
};
use crate::error::{Error, Result};
use crate::files::FileObject;
use crate::flavor::Flavor;
use crate::hash::{FileId, PathId, Sha1Digest};
use crate::streams::{FieldReader, FieldWriter};
use crate::trove::{Redirect, Trove, TroveRef, TroveTuple, TroveType};
use crate::version::{Branch, Version};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Store-private troveinfo type holding redirect targets
const REDIRECTS_INFO: u8 = 200;

/// A present owner of a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathOwner {
    pub tuple: TroveTuple,
    pub instance_id: i64,
    pub path_id: PathId,
    pub file_id: FileId,
}

/// One file of an installed trove, with its stream thawed
#[derive(Debug, Clone)]
pub struct InstalledFile {
    pub path_id: PathId,
    pub path: String,
    pub file_id: FileId,
    pub version: Version,
    pub object: FileObject,
}

/// Options for [`TroveStore::add_trove`]
#[derive(Debug, Clone)]
pub struct AddOptions {
    pub presence: Presence,
    /// Files recorded in the pristine manifest but not owned on disk
    pub skip_paths: BTreeSet<PathId>,
    /// Paths the merge approved for sharing despite differing content
    pub shared_paths: BTreeSet<String>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            presence: Presence::Present,
            skip_paths: BTreeSet::new(),
            shared_paths: BTreeSet::new(),
        }
    }
}

/// Handle for trove-level reads and writes
pub struct TroveStore<'a> {
    conn: &'a Connection,
    versions: RefCell<HashMap<String, i64>>,
    flavors: RefCell<HashMap<String, i64>>,
}

impl<'a> TroveStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            versions: RefCell::new(HashMap::new()),
            flavors: RefCell::new(HashMap::new()),
        }
    }

    pub fn conn(&self) -> &'a Connection {
        self.conn
    }

    fn version_id(&self, version: &Version) -> Result<i64> {
        let frozen = version.freeze();
        if let Some(id) = self.versions.borrow().get(&frozen) {
            return Ok(*id);
        }
        let id = InternTable::Versions.intern(self.conn, &frozen)?;
        self.versions.borrow_mut().insert(frozen, id);
        Ok(id)
    }

    fn flavor_id(&self, flavor: &Flavor) -> Result<i64> {
        let frozen = flavor.freeze();
        if let Some(id) = self.flavors.borrow().get(&frozen) {
            return Ok(*id);
        }
        let id = models::intern_flavor(self.conn, flavor)?;
        self.flavors.borrow_mut().insert(frozen, id);
        Ok(id)
    }

    /// Ids of a tuple without inserting anything
    fn find_ids(&self, tuple: &TroveTuple) -> Result<Option<(i64, i64, i64)>> {
        let Some(item) = InternTable::Items.find(self.conn, &tuple.name)? else {
            return Ok(None);
        };
        let Some(version) = InternTable::Versions.find(self.conn, &tuple.version.freeze())? else {
            return Ok(None);
        };
        let flavor = if tuple.flavor.is_empty() {
            0
        } else {
            match InternTable::Flavors.find(self.conn, &tuple.flavor.freeze())? {
                Some(id) => id,
                None => return Ok(None),
            }
        };
        Ok(Some((item, version, flavor)))
    }

    fn find_instance(&self, tuple: &TroveTuple) -> Result<Option<Instance>> {
        match self.find_ids(tuple)? {
            Some((item, version, flavor)) => Instance::find_by_ids(self.conn, item, version, flavor),
            None => Ok(None),
        }
    }

    /// Instance row of an installed (present or hidden) trove
    fn installed_instance(&self, tuple: &TroveTuple) -> Result<Instance> {
        match self.find_instance(tuple)? {
            Some(inst) if inst.presence != Presence::Missing => Ok(inst),
            _ => Err(Error::TroveMissing(tuple.to_string())),
        }
    }

    /// Instance id for a tuple, creating a missing placeholder if needed
    fn placeholder_instance(&self, tuple: &TroveTuple) -> Result<i64> {
        if let Some(inst) = self.find_instance(tuple)?
            && let Some(id) = inst.id
        {
            return Ok(id);
        }
        let item = InternTable::Items.intern(self.conn, &tuple.name)?;
        let mut inst = Instance::new(
            item,
            self.version_id(&tuple.version)?,
            self.flavor_id(&tuple.flavor)?,
            stamps(&tuple.version),
        );
        inst.presence = Presence::Missing;
        inst.insert(self.conn)
    }

    pub fn instance_id(&self, tuple: &TroveTuple) -> Result<Option<i64>> {
        Ok(self.find_instance(tuple)?.and_then(|i| i.id))
    }

    /// Tuple stored under an instance id
    pub fn tuple_for_instance(&self, instance_id: i64) -> Result<Option<TroveTuple>> {
        let row = self
            .conn
            .query_row(
                "SELECT item, version, flavor FROM Instances
                 JOIN Items USING (itemId)
                 JOIN Versions USING (versionId)
                 JOIN Flavors USING (flavorId)
                 WHERE instanceId = ?1",
                [instance_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((name, version, flavor)) => Ok(Some(TroveTuple::new(
                name,
                Version::thaw(&version)?,
                Flavor::thaw(&flavor)?,
            ))),
            None => Ok(None),
        }
    }

    /// Record a trove with its files, dependencies, children and troveinfo
    ///
    /// `streams` must hold a file object for every fileId not already in the
    /// database. Fails with `DatabasePathConflict` if a present file would
    /// collide with a different file another installed trove owns.
    ///
    /// Runs in its own savepoint: on error nothing of the trove is left.
    pub fn add_trove(
        &self,
        trove: &Trove,
        streams: &BTreeMap<FileId, FileObject>,
        opts: &AddOptions,
    ) -> Result<i64> {
        let result = super::savepoint(self.conn, "add_trove", || self.insert_trove(trove, streams, opts));
        if result.is_err() {
            // ids interned inside the savepoint are gone
            self.versions.borrow_mut().clear();
            self.flavors.borrow_mut().clear();
        }
        result
    }

    fn insert_trove(
        &self,
        trove: &Trove,
        streams: &BTreeMap<FileId, FileObject>,
        opts: &AddOptions,
    ) -> Result<i64> {
        let tuple = trove.tuple();
        let item_id = InternTable::Items.intern(self.conn, &trove.name)?;
        let version_id = self.version_id(&trove.version)?;
        let flavor_id = self.flavor_id(&trove.flavor)?;
        let time_stamps = stamps(&trove.version);

        let instance_id = match Instance::find_by_ids(self.conn, item_id, version_id, flavor_id)? {
            Some(existing) if existing.presence != Presence::Missing => {
                return Err(Error::TroveAlreadyInstalled(tuple.to_string()));
            }
            Some(existing) => {
                let id = existing
                    .id
                    .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?;
                Instance::set_presence(self.conn, id, opts.presence)?;
                Instance::set_details(self.conn, id, &time_stamps, trove.trove_type.as_i64())?;
                id
            }
            None => {
                let mut inst = Instance::new(item_id, version_id, flavor_id, time_stamps);
                inst.presence = opts.presence;
                inst.trove_type = trove.trove_type.as_i64();
                inst.insert(self.conn)?
            }
        };

        models::add_label_map(
            self.conn,
            item_id,
            &trove.version.trailing_label().to_string(),
            &trove.version.branch().to_string(),
        )?;

        for (path_id, file) in &trove.files {
            let stream_id = match FileStream::find_id(self.conn, &file.file_id)? {
                Some(id) => id,
                None => {
                    let obj = streams.get(&file.file_id).ok_or_else(|| {
                        Error::FileStreamMissing(format!("{} ({})", file.path, file.file_id))
                    })?;
                    let mut row = FileStream::new(file.file_id, obj.freeze(), obj.contents_sha1());
                    let id = row.insert_or_get(self.conn)?;
                    let tag_ids = obj
                        .tags
                        .iter()
                        .map(|t| InternTable::Tags.intern(self.conn, t))
                        .collect::<Result<Vec<_>>>()?;
                    FileStream::set_tags(self.conn, id, &tag_ids)?;
                    id
                }
            };

            let is_present = !opts.skip_paths.contains(path_id);
            if is_present && !opts.shared_paths.contains(&file.path) {
                for owner in self.iter_find_path(&file.path)? {
                    if owner.instance_id != instance_id && owner.file_id != file.file_id {
                        return Err(Error::DatabasePathConflict {
                            path: file.path.clone(),
                            owner: owner.tuple.to_string(),
                        });
                    }
                }
            }

            TroveFileRow {
                instance_id,
                stream_id,
                version_id: self.version_id(&file.version)?,
                path_id: *path_id,
                path: file.path.clone(),
                is_present,
            }
            .insert(self.conn)?;
        }

        dependency::insert_provides(self.conn, instance_id, &trove.provides)?;
        dependency::insert_requires(self.conn, instance_id, &trove.requires)?;

        for (child, reference) in &trove.troves {
            let included_id = self.placeholder_instance(child)?;
            TroveTroveRow {
                instance_id,
                included_id,
                flags: reference.bits(),
                in_pristine: true,
            }
            .insert(self.conn)?;
        }

        for (info, body) in trove.info.entries() {
            trove_info::insert(self.conn, instance_id, info, &body)?;
        }
        if !trove.redirects.is_empty() {
            trove_info::insert(self.conn, instance_id, REDIRECTS_INFO, &freeze_redirects(&trove.redirects))?;
        }

        debug!("Added {} to the database as instance {}", tuple, instance_id);
        Ok(instance_id)
    }

    /// Rebuild an installed trove
    ///
    /// The pristine view is the trove as shipped: every file and every
    /// collection edge it came with. The non-pristine view is what is on the
    /// system now: files other troves took over are dropped, children that
    /// were erased are dropped and locally added edges are included.
    pub fn get_trove(&self, tuple: &TroveTuple, pristine: bool) -> Result<Option<Trove>> {
        let Some(inst) = self.find_instance(tuple)? else {
            return Ok(None);
        };
        if inst.presence == Presence::Missing {
            return Ok(None);
        }
        let instance_id = inst
            .id
            .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?;

        let mut trove = Trove::new(tuple.name.clone(), tuple.version.clone(), tuple.flavor.clone());
        trove.trove_type = TroveType::from_i64(inst.trove_type)?;

        let mut versions: HashMap<i64, Version> = HashMap::new();
        for row in TroveFileRow::find_by_instance(self.conn, instance_id, !pristine)? {
            let stream = FileStream::find_by_id(self.conn, row.stream_id)?
                .ok_or_else(|| Error::FileStreamMissing(row.path.clone()))?;
            let version = match versions.get(&row.version_id) {
                Some(v) => v.clone(),
                None => {
                    let frozen = InternTable::Versions
                        .value(self.conn, row.version_id)?
                        .ok_or_else(|| Error::NotFound(format!("version {}", row.version_id)))?;
                    let v = Version::thaw(&frozen)?;
                    versions.insert(row.version_id, v.clone());
                    v
                }
            };
            trove.add_file(row.path_id, row.path, stream.file_id, version);
        }

        for edge in TroveTroveRow::children(self.conn, instance_id)? {
            if pristine && !edge.in_pristine {
                continue;
            }
            if !pristine {
                let present = Instance::find_by_id(self.conn, edge.included_id)?
                    .is_some_and(|i| i.presence != Presence::Missing);
                if !present {
                    continue;
                }
            }
            if let Some(child) = self.tuple_for_instance(edge.included_id)? {
                trove.add_trove(child, TroveRef::from_bits(edge.flags));
            }
        }

        trove.provides = dependency::load_provides(self.conn, instance_id)?;
        trove.requires = dependency::load_requires(self.conn, instance_id)?;

        for (info, body) in trove_info::find_by_instance(self.conn, instance_id)? {
            if info == REDIRECTS_INFO {
                trove.redirects = thaw_redirects(&body)?;
            } else {
                trove.info.set_entry(info, &body)?;
            }
        }
        Ok(Some(trove))
    }

    /// Whether the trove is installed (present or hidden)
    pub fn has_trove(&self, tuple: &TroveTuple) -> Result<bool> {
        Ok(self
            .find_instance(tuple)?
            .is_some_and(|i| i.presence != Presence::Missing))
    }

    /// Installed troves owning `path`
    pub fn iter_find_path(&self, path: &str) -> Result<Vec<PathOwner>> {
        let mut stmt = self.conn.prepare(
            "SELECT TroveFiles.instanceId, pathId, fileId FROM TroveFiles
             JOIN Instances USING (instanceId)
             JOIN FileStreams USING (streamId)
             WHERE TroveFiles.path = ?1
               AND TroveFiles.isPresent = 1
               AND Instances.isPresent != 0
             ORDER BY TroveFiles.instanceId",
        )?;
        let rows = stmt
            .query_map([path], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut owners = Vec::with_capacity(rows.len());
        for (instance_id, path_id, file_id) in rows {
            let tuple = self
                .tuple_for_instance(instance_id)?
                .ok_or_else(|| Error::TroveMissing(format!("instance {}", instance_id)))?;
            owners.push(PathOwner {
                tuple,
                instance_id,
                path_id: PathId::from_slice(&path_id)?,
                file_id: Sha1Digest::from_slice(&file_id)?,
            });
        }
        Ok(owners)
    }

    pub fn path_is_owned(&self, path: &str) -> Result<bool> {
        let owned: bool = self.conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM TroveFiles JOIN Instances USING (instanceId)
                WHERE TroveFiles.path = ?1
                  AND TroveFiles.isPresent = 1
                  AND Instances.isPresent != 0)",
            [path],
            |row| row.get(0),
        )?;
        Ok(owned)
    }

    /// Remove an installed trove
    ///
    /// Instances still referenced by a collection stay behind as missing
    /// placeholders. File streams no other trove references are deleted and
    /// the contents sha1s of deleted regular files are returned.
    pub fn erase_trove(&self, tuple: &TroveTuple) -> Result<Vec<Sha1Digest>> {
        let inst = self.installed_instance(tuple)?;
        let instance_id = inst
            .id
            .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?;

        TroveFileRow::delete_by_instance(self.conn, instance_id)?;
        dependency::delete_for_instance(self.conn, instance_id)?;
        trove_info::delete_for_instance(self.conn, instance_id)?;

        let children = TroveTroveRow::children(self.conn, instance_id)?;
        TroveTroveRow::delete_children(self.conn, instance_id)?;

        self.drop_or_hide(instance_id)?;
        for child in children {
            if let Some(inst) = Instance::find_by_id(self.conn, child.included_id)?
                && inst.presence == Presence::Missing
            {
                self.drop_or_hide(child.included_id)?;
            }
        }

        let dropped = FileStream::delete_unreferenced(self.conn)?;
        debug!("Erased {} ({} streams dropped)", tuple, dropped.len());
        Ok(dropped)
    }

    /// Delete an instance unless a collection still references it
    fn drop_or_hide(&self, instance_id: i64) -> Result<()> {
        if TroveTroveRow::parents(self.conn, instance_id)?.is_empty() {
            Instance::delete(self.conn, instance_id)?;
        } else {
            Instance::set_presence(self.conn, instance_id, Presence::Missing)?;
            Instance::set_pinned(self.conn, instance_id, false)?;
        }
        Ok(())
    }

    pub fn set_presence(&self, tuple: &TroveTuple, presence: Presence) -> Result<()> {
        let inst = self.installed_instance(tuple)?;
        if let Some(id) = inst.id {
            Instance::set_presence(self.conn, id, presence)?;
        }
        Ok(())
    }

    /// Every present instance's troveinfo of one type
    pub fn get_all_trove_info(&self, info_type: u8) -> Result<Vec<(TroveTuple, Vec<u8>)>> {
        let mut out = Vec::new();
        for (instance_id, data) in trove_info::find_by_type(self.conn, info_type)? {
            if let Some(tuple) = self.tuple_for_instance(instance_id)? {
                out.push((tuple, data));
            }
        }
        Ok(out)
    }

    pub fn pin(&self, tuple: &TroveTuple) -> Result<()> {
        self.set_pinned(tuple, true)
    }

    pub fn unpin(&self, tuple: &TroveTuple) -> Result<()> {
        self.set_pinned(tuple, false)
    }

    fn set_pinned(&self, tuple: &TroveTuple, pinned: bool) -> Result<()> {
        let inst = self.installed_instance(tuple)?;
        if let Some(id) = inst.id {
            Instance::set_pinned(self.conn, id, pinned)?;
        }
        Ok(())
    }

    pub fn is_pinned(&self, tuple: &TroveTuple) -> Result<bool> {
        Ok(self.installed_instance(tuple)?.pinned)
    }

    pub fn pinned_troves(&self) -> Result<Vec<TroveTuple>> {
        self.tuples_where("pinned = 1 AND isPresent != 0")
    }

    /// Bind pinned troves into the collections that include their
    /// replacements
    ///
    /// For each (pinned, new) pair, every collection shipping an edge to
    /// `new` gets a non-pristine edge to `pinned` with the same flags, so the
    /// pinned trove stays a member while the new one is installed next to it.
    pub fn map_pinned_troves(&self, mapping: &[(TroveTuple, TroveTuple)]) -> Result<()> {
        for (pinned, new) in mapping {
            let pinned_id = self.installed_instance(pinned)?.id.ok_or_else(|| {
                Error::TroveMissing(pinned.to_string())
            })?;
            let Some(new_id) = self.instance_id(new)? else {
                continue;
            };
            for parent in TroveTroveRow::parents(self.conn, new_id)? {
                if !parent.in_pristine {
                    continue;
                }
                TroveTroveRow {
                    instance_id: parent.instance_id,
                    included_id: pinned_id,
                    flags: parent.flags,
                    in_pristine: false,
                }
                .insert(self.conn)?;
            }
        }
        Ok(())
    }

    /// Mark files as taken over by another trove
    pub fn remove_files_from_trove(&self, tuple: &TroveTuple, path_ids: &[PathId]) -> Result<()> {
        let inst = self.installed_instance(tuple)?;
        let instance_id = inst
            .id
            .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?;
        for path_id in path_ids {
            TroveFileRow::set_present(self.conn, instance_id, path_id, false)?;
        }
        Ok(())
    }

    /// Installed paths whose file carries `tag`
    pub fn iter_files_with_tag(&self, tag: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT TroveFiles.path FROM Tags
             JOIN TroveFileTags USING (tagId)
             JOIN TroveFiles USING (streamId)
             JOIN Instances USING (instanceId)
             WHERE Tags.tag = ?1
               AND TroveFiles.isPresent = 1
               AND Instances.isPresent != 0
             ORDER BY TroveFiles.path",
        )?;
        let paths = stmt
            .query_map([tag], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    pub fn get_file_stream(&self, file_id: &FileId) -> Result<Option<FileObject>> {
        match FileStream::find_by_file_id(self.conn, file_id)? {
            Some(row) => Ok(Some(FileObject::thaw(&row.stream)?)),
            None => Ok(None),
        }
    }

    /// Present files of an installed trove with their thawed streams
    pub fn get_trove_files(&self, tuple: &TroveTuple) -> Result<Vec<InstalledFile>> {
        let trove = self
            .get_trove(tuple, false)?
            .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?;
        let mut files = Vec::with_capacity(trove.files.len());
        for (path_id, file) in trove.files {
            let object = self
                .get_file_stream(&file.file_id)?
                .ok_or_else(|| Error::FileStreamMissing(file.path.clone()))?;
            files.push(InstalledFile {
                path_id,
                path: file.path,
                file_id: file.file_id,
                version: file.version,
                object,
            });
        }
        Ok(files)
    }

    /// Installed versions of a name, oldest first
    pub fn find_by_name(&self, name: &str) -> Result<Vec<TroveTuple>> {
        let Some(item_id) = InternTable::Items.find(self.conn, name)? else {
            return Ok(Vec::new());
        };
        let mut tuples = Vec::new();
        for inst in Instance::find_by_item(self.conn, item_id)? {
            if inst.presence == Presence::Missing {
                continue;
            }
            if let Some(id) = inst.id
                && let Some(tuple) = self.tuple_for_instance(id)?
            {
                tuples.push(tuple);
            }
        }
        tuples.sort_by(|a, b| a.version.cmp_age(&b.version).then_with(|| a.cmp(b)));
        Ok(tuples)
    }

    /// Newest present, non-hidden version of a name
    pub fn latest(&self, name: &str) -> Result<Option<TroveTuple>> {
        let mut best: Option<TroveTuple> = None;
        for tuple in self.find_by_name(name)? {
            if self.find_instance(&tuple)?.map(|i| i.presence) != Some(Presence::Present) {
                continue;
            }
            best = Some(tuple);
        }
        Ok(best)
    }

    /// Every installed trove, sorted
    pub fn all_troves(&self) -> Result<Vec<TroveTuple>> {
        self.tuples_where("isPresent != 0")
    }

    fn tuples_where(&self, condition: &str) -> Result<Vec<TroveTuple>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT instanceId FROM Instances WHERE {condition} ORDER BY instanceId"
        ))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut tuples = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(t) = self.tuple_for_instance(id)? {
                tuples.push(t);
            }
        }
        tuples.sort();
        Ok(tuples)
    }

    /// Installed collections including `tuple`
    pub fn trove_containers(&self, tuple: &TroveTuple) -> Result<Vec<TroveTuple>> {
        let Some(id) = self.instance_id(tuple)? else {
            return Ok(Vec::new());
        };
        let mut parents = Vec::new();
        for edge in TroveTroveRow::parents(self.conn, id)? {
            let present = Instance::find_by_id(self.conn, edge.instance_id)?
                .is_some_and(|i| i.presence != Presence::Missing);
            if present && let Some(t) = self.tuple_for_instance(edge.instance_id)? {
                parents.push(t);
            }
        }
        parents.sort();
        parents.dedup();
        Ok(parents)
    }

    /// Whether `name` matches the regular expression `pattern`, cached in
    /// CheckTroveCache
    pub fn name_matches(&self, pattern: &str, name: &str) -> Result<bool> {
        let pattern_id = InternTable::Items.intern(self.conn, pattern)?;
        let item_id = InternTable::Items.intern(self.conn, name)?;
        let cached: Option<bool> = self
            .conn
            .query_row(
                "SELECT matches FROM CheckTroveCache WHERE patternId = ?1 AND itemId = ?2",
                params![pattern_id, item_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(matches) = cached {
            return Ok(matches);
        }

        let re = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| Error::ConfigError(format!("bad trove pattern {}: {}", pattern, e)))?;
        let matches = re.is_match(name);
        self.conn.execute(
            "INSERT OR REPLACE INTO CheckTroveCache (patternId, itemId, matches) VALUES (?1, ?2, ?3)",
            params![pattern_id, item_id, matches],
        )?;
        Ok(matches)
    }
}

fn stamps(version: &Version) -> String {
    version
        .timestamps()
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(":")
}

fn freeze_redirects(redirects: &[Redirect]) -> Vec<u8> {
    let mut w = FieldWriter::new();
    for redirect in redirects {
        let mut inner = FieldWriter::new();
        inner.str(1, &redirect.name).str(2, &redirect.branch.to_string());
        if let Some(flavor) = &redirect.flavor {
            inner.str(3, &flavor.freeze());
        }
        w.nested(1, inner);
    }
    w.finish()
}

fn thaw_redirects(data: &[u8]) -> Result<Vec<Redirect>> {
    let r = FieldReader::parse(data)?;
    r.all(1)
        .map(|body| {
            let t = FieldReader::parse(body)?;
            Ok(Redirect {
                name: t.require_string(1)?,
                branch: Branch::parse(&t.require_string(2)?)?,
                flavor: t.string(3)?.map(|f| Flavor::thaw(&f)).transpose()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::TroveBuilder;
    use crate::db::schema;
    use crate::deps::{Dependency, DependencyClass};
    use crate::files::FileFlags;
    use crate::trove::{ScriptKind, TroveScript};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    fn v(s: &str) -> Version {
        Version::thaw(s).unwrap()
    }

    fn streams(files: &[(PathId, FileObject, Option<Vec<u8>>)]) -> BTreeMap<FileId, FileObject> {
        files.iter().map(|(_, f, _)| (f.file_id(), f.clone())).collect()
    }

    fn foo_runtime(version: &str, contents: &[u8]) -> (Trove, BTreeMap<FileId, FileObject>) {
        let (trove, files) = TroveBuilder::new("foo:runtime", v(version))
            .file(
                "/etc/foo",
                FileObject::regular(contents).with_flag(FileFlags::CONFIG).with_tags(["init"]),
                contents,
            )
            .file("/usr/bin/foo", FileObject::regular(b"binary").with_perms(0o755), b"binary")
            .requires(
                DependencyClass::Soname,
                Dependency::new("ELF64/libc.so.6").with_flag("GLIBC_2.2.5"),
            )
            .script(ScriptKind::PostInstall, TroveScript::new("#!/bin/sh\n"))
            .compat_class(1)
            .finish();
        let map = streams(&files);
        (trove, map)
    }

    #[test]
    fn test_add_get_round_trip_preserves_digest() {
        let conn = conn();
        let store = TroveStore::new(&conn);
        let (trove, streams) = foo_runtime("/a@b:c/1000.000:1.0-1", b"first\n");

        store.add_trove(&trove, &streams, &AddOptions::default()).unwrap();
        assert!(store.has_trove(&trove.tuple()).unwrap());

        let loaded = store.get_trove(&trove.tuple(), true).unwrap().unwrap();
        assert_eq!(loaded.compute_digest(), trove.compute_digest());
        loaded.verify_digest().unwrap();
        assert_eq!(loaded, trove);

        assert!(matches!(
            store.add_trove(&trove, &streams, &AddOptions::default()),
            Err(Error::TroveAlreadyInstalled(_))
        ));
    }

    #[test]
    fn test_missing_stream_is_error() {
        let conn = conn();
        let store = TroveStore::new(&conn);
        let (trove, _) = foo_runtime("/a@b:c/1000.000:1.0-1", b"first\n");
        assert!(matches!(
            store.add_trove(&trove, &BTreeMap::new(), &AddOptions::default()),
            Err(Error::FileStreamMissing(_))
        ));
    }

    #[test]
    fn test_path_lookup_and_tags() {
        let conn = conn();
        let store = TroveStore::new(&conn);
        let (trove, streams) = foo_runtime("/a@b:c/1000.000:1.0-1", b"first\n");
        store.add_trove(&trove, &streams, &AddOptions::default()).unwrap();

        let owners = store.iter_find_path("/etc/foo").unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].tuple, trove.tuple());
        assert!(store.path_is_owned("/usr/bin/foo").unwrap());
        assert!(!store.path_is_owned("/usr/bin/bar").unwrap());
        assert_eq!(store.iter_files_with_tag("init").unwrap(), vec!["/etc/foo"]);
    }

    #[test]
    fn test_conflicting_owner_is_rejected_unless_shared() {
        let conn = conn();
        let store = TroveStore::new(&conn);
        let (foo, foo_streams) = foo_runtime("/a@b:c/1000.000:1.0-1", b"first\n");
        store.add_trove(&foo, &foo_streams, &AddOptions::default()).unwrap();

        let (bar, bar_files) = TroveBuilder::new("bar:runtime", v("/a@b:c/1000.000:1.0-1"))
            .file("/etc/foo", FileObject::regular(b"other\n"), b"other\n")
            .finish();
        let bar_streams = streams(&bar_files);
        let err = store
            .add_trove(&bar, &bar_streams, &AddOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::DatabasePathConflict { .. }));
        // the failed add left nothing behind
        assert!(!store.has_trove(&bar.tuple()).unwrap());
        assert!(store.find_instance(&bar.tuple()).unwrap().is_none());

        let opts = AddOptions {
            shared_paths: ["/etc/foo".to_string()].into_iter().collect(),
            ..AddOptions::default()
        };
        store.add_trove(&bar, &bar_streams, &opts).unwrap();
        assert_eq!(store.iter_find_path("/etc/foo").unwrap().len(), 2);
    }

    #[test]
    fn test_shared_streams_survive_erase() {
        let conn = conn();
        let store = TroveStore::new(&conn);
        let shared = FileObject::regular(b"X");
        let (foo, files) = TroveBuilder::new("foo:runtime", v("/a@b:c/1000.000:1.0-1"))
            .file("/shared", shared.clone(), b"X")
            .finish();
        let (bar, _) = TroveBuilder::new("bar:runtime", v("/a@b:c/1000.000:1.0-1"))
            .file("/shared", shared.clone(), b"X")
            .finish();
        store.add_trove(&foo, &streams(&files), &AddOptions::default()).unwrap();
        store.add_trove(&bar, &BTreeMap::new(), &AddOptions::default()).unwrap();
        assert_eq!(store.iter_find_path("/shared").unwrap().len(), 2);

        let dropped = store.erase_trove(&foo.tuple()).unwrap();
        assert!(dropped.is_empty());
        assert_eq!(store.iter_find_path("/shared").unwrap()[0].tuple, bar.tuple());
        assert!(store.get_file_stream(&shared.file_id()).unwrap().is_some());

        let dropped = store.erase_trove(&bar.tuple()).unwrap();
        assert_eq!(dropped, vec![Sha1Digest::of(b"X")]);
        assert!(!store.path_is_owned("/shared").unwrap());
        assert!(matches!(
            store.erase_trove(&bar.tuple()),
            Err(Error::TroveMissing(_))
        ));
    }

    #[test]
    fn test_collections_pins_and_placeholders() {
        let conn = conn();
        let store = TroveStore::new(&conn);
        let (comp, files) = foo_runtime("/a@b:c/1000.000:1.0-1", b"first\n");
        let (comp2, files2) = foo_runtime("/a@b:c/2000.000:2.0-1", b"second\n");
        let (group, _) = TroveBuilder::new("group-foo", v("/a@b:c/2000.000:2.0-1"))
            .include(comp2.tuple(), TroveRef::strong())
            .finish();

        store.add_trove(&comp, &files, &AddOptions::default()).unwrap();
        store.pin(&comp.tuple()).unwrap();
        assert!(store.is_pinned(&comp.tuple()).unwrap());
        assert_eq!(store.pinned_troves().unwrap(), vec![comp.tuple()]);

        // the collection references comp2 before it is installed
        store.add_trove(&group, &BTreeMap::new(), &AddOptions::default()).unwrap();
        assert!(!store.has_trove(&comp2.tuple()).unwrap());
        assert!(store.get_trove(&group.tuple(), false).unwrap().unwrap().troves.is_empty());

        let opts = AddOptions {
            shared_paths: ["/etc/foo".to_string(), "/usr/bin/foo".to_string()]
                .into_iter()
                .collect(),
            ..AddOptions::default()
        };
        store.add_trove(&comp2, &files2, &opts).unwrap();
        store
            .map_pinned_troves(&[(comp.tuple(), comp2.tuple())])
            .unwrap();

        let pristine = store.get_trove(&group.tuple(), true).unwrap().unwrap();
        assert_eq!(pristine.troves.len(), 1);
        let current = store.get_trove(&group.tuple(), false).unwrap().unwrap();
        assert_eq!(current.troves.len(), 2);
        assert!(current.troves.contains_key(&comp.tuple()));
        assert_eq!(store.trove_containers(&comp.tuple()).unwrap(), vec![group.tuple()]);

        assert_eq!(store.find_by_name("foo:runtime").unwrap(), vec![comp.tuple(), comp2.tuple()]);
        assert_eq!(store.latest("foo:runtime").unwrap(), Some(comp2.tuple()));
        store.set_presence(&comp2.tuple(), Presence::Hidden).unwrap();
        assert_eq!(store.latest("foo:runtime").unwrap(), Some(comp.tuple()));

        // erasing a referenced trove leaves a placeholder
        store.erase_trove(&comp2.tuple()).unwrap();
        assert!(store.instance_id(&comp2.tuple()).unwrap().is_some());
        assert!(!store.has_trove(&comp2.tuple()).unwrap());
    }

    #[test]
    fn test_remove_files_from_trove() {
        let conn = conn();
        let store = TroveStore::new(&conn);
        let (trove, streams) = foo_runtime("/a@b:c/1000.000:1.0-1", b"first\n");
        store.add_trove(&trove, &streams, &AddOptions::default()).unwrap();

        let (path_id, _) = trove.file_by_path("/etc/foo").unwrap();
        store.remove_files_from_trove(&trove.tuple(), &[*path_id]).unwrap();
        assert!(!store.path_is_owned("/etc/foo").unwrap());
        assert_eq!(store.get_trove(&trove.tuple(), false).unwrap().unwrap().files.len(), 1);
        assert_eq!(store.get_trove(&trove.tuple(), true).unwrap().unwrap().files.len(), 2);
        assert_eq!(store.get_trove_files(&trove.tuple()).unwrap().len(), 1);
    }

    #[test]
    fn test_trove_info_dump_and_patterns() {
        let conn = conn();
        let store = TroveStore::new(&conn);
        let (trove, streams) = foo_runtime("/a@b:c/1000.000:1.0-1", b"first\n");
        store.add_trove(&trove, &streams, &AddOptions::default()).unwrap();

        let all = store
            .get_all_trove_info(crate::trove::info_type::COMPAT_CLASS)
            .unwrap();
        assert_eq!(all, vec![(trove.tuple(), 1u32.to_be_bytes().to_vec())]);

        assert!(store.name_matches("foo:.*", "foo:runtime").unwrap());
        assert!(store.name_matches("foo:.*", "foo:runtime").unwrap());
        assert!(!store.name_matches("kernel.*", "foo:runtime").unwrap());
    }
}
