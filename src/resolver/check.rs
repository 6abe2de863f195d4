// src/resolver/check.rs

//! SQL-backed dependency check
//!
//! The proposed job set is loaded into temporary tables next to the
//! installed Provides/Requires data:
//!
//! - `TmpProvides` / `TmpRequires` hold the dependencies of troves being
//!   installed, keyed by negative trove ids (`-(job + 1)`) so they never
//!   collide with instance ids. New requirements use negative depNums.
//! - `RemovedTroveIds` holds the instances leaving the system.
//! - Installed requirements that some removed trove used to satisfy are
//!   copied into `TmpRequires` with their real instance id and depNum so
//!   they get checked again.
//!
//! A requirement is satisfied by a provider when the provider supplies every
//! row of it: the base row plus one per flag, counted against `depCount`.

use super::graph::{EdgePhase, JobGraph};
use super::{DependencyFailure, Job};
use crate::changeset::ChangeSet;
use crate::db::TroveStore;
use crate::db::models::dependency::{self, expand};
use crate::db::models::{Presence, TroveTroveRow};
use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::trove::{Trove, TroveTuple};
use rusqlite::params;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

const TEMP_SCHEMA: &str = "
    CREATE TEMP TABLE IF NOT EXISTS TmpProvides (
        troveId INTEGER NOT NULL,
        class INTEGER NOT NULL,
        name TEXT NOT NULL,
        flag TEXT NOT NULL
    );
    CREATE TEMP TABLE IF NOT EXISTS TmpRequires (
        troveId INTEGER NOT NULL,
        depNum INTEGER NOT NULL,
        depCount INTEGER NOT NULL,
        class INTEGER NOT NULL,
        name TEXT NOT NULL,
        flag TEXT NOT NULL
    );
    CREATE TEMP TABLE IF NOT EXISTS RemovedTroveIds (
        troveId INTEGER PRIMARY KEY
    );
    CREATE TEMP VIEW IF NOT EXISTS AllProvides AS
        SELECT Provides.instanceId AS troveId, class, name, flag
        FROM Provides
        JOIN Dependencies USING (depId)
        JOIN Instances USING (instanceId)
        WHERE Instances.isPresent = 1
        UNION ALL
        SELECT troveId, class, name, flag FROM TmpProvides;
";

/// Result of [`DependencyChecker::check`]
#[derive(Debug, Clone, Default)]
pub struct CheckOutcome {
    pub failure: DependencyFailure,
    /// Job indexes grouped into components, in execution order
    pub order: Option<Vec<Vec<usize>>>,
}

/// (requirer troveId, depNum, provider troveId)
type Satisfaction = (i64, i64, i64);

/// Checks job sets against one database
pub struct DependencyChecker<'s, 'c> {
    store: &'s TroveStore<'c>,
}

impl<'s, 'c> DependencyChecker<'s, 'c> {
    pub fn new(store: &'s TroveStore<'c>) -> Result<Self> {
        store.conn().execute_batch(TEMP_SCHEMA)?;
        Ok(Self { store })
    }

    fn reset(&self) -> Result<()> {
        self.store.conn().execute_batch(
            "DELETE FROM TmpProvides;
             DELETE FROM TmpRequires;
             DELETE FROM RemovedTroveIds;",
        )?;
        Ok(())
    }

    /// Check `jobs`, taking new troves from `changeset`
    ///
    /// With `find_order` the jobs are also ordered; the order is only
    /// produced when the check passes.
    pub fn check(&self, jobs: &[Job], changeset: &ChangeSet, find_order: bool) -> Result<CheckOutcome> {
        self.reset()?;
        let conn = self.store.conn();

        let mut new_troves: Vec<Option<&Trove>> = Vec::with_capacity(jobs.len());
        let mut removed: BTreeMap<i64, usize> = BTreeMap::new();
        for (index, job) in jobs.iter().enumerate() {
            let new = match &job.new {
                Some(tuple) => Some(
                    &changeset
                        .trove_change(tuple)
                        .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?
                        .new,
                ),
                None => None,
            };
            if let Some(trove) = new {
                self.add_new_trove(-(index as i64 + 1), trove)?;
            }
            new_troves.push(new);

            if let Some(old) = &job.old {
                let id = self
                    .store
                    .instance_id(old)?
                    .ok_or_else(|| Error::TroveMissing(old.to_string()))?;
                conn.execute("INSERT OR IGNORE INTO RemovedTroveIds (troveId) VALUES (?1)", [id])?;
                removed.insert(id, index);
            }
        }

        self.add_rechecks()?;

        let satisfied = self.satisfied()?;
        let satisfied_groups: BTreeSet<(i64, i64)> =
            satisfied.iter().map(|(t, d, _)| (*t, *d)).collect();

        // a new trove's requirement only a removed trove provides is broken
        // by the job, not merely missing from it
        let broken_by_removal: BTreeSet<(i64, i64)> = self
            .satisfied_by_removed()?
            .iter()
            .map(|(t, d, _)| (*t, *d))
            .collect();

        let mut failure = DependencyFailure::default();
        let mut missing: BTreeMap<i64, DependencySet> = BTreeMap::new();
        let mut broken: BTreeMap<i64, DependencySet> = BTreeMap::new();
        for ((trove_id, dep_num), deps) in self.requirement_groups()? {
            if satisfied_groups.contains(&(trove_id, dep_num)) {
                continue;
            }
            if trove_id < 0 && broken_by_removal.contains(&(trove_id, dep_num)) {
                broken.entry(trove_id).or_default().union(&deps);
            } else {
                missing.entry(trove_id).or_default().union(&deps);
            }
        }
        for (trove_id, deps) in missing {
            let tuple = self.tuple_for(trove_id, jobs)?;
            if trove_id < 0 {
                failure.unsatisfied.push((tuple, deps));
            } else {
                failure.unresolveable.push((tuple, deps));
            }
        }
        for (trove_id, deps) in broken {
            let tuple = self.tuple_for(trove_id, jobs)?;
            failure.unresolveable.push((tuple, deps));
        }
        failure.unsatisfied.sort();
        failure.unresolveable.sort();

        if !failure.is_empty() {
            debug!(
                "dependency check failed: {} unsatisfied, {} unresolveable",
                failure.unsatisfied.len(),
                failure.unresolveable.len()
            );
            return Ok(CheckOutcome {
                failure,
                order: None,
            });
        }

        let order = if find_order {
            Some(self.order(jobs, &new_troves, &removed, &satisfied)?)
        } else {
            None
        };
        Ok(CheckOutcome { failure, order })
    }

    /// Check and order, turning failures into [`Error::DependencyFailure`]
    pub fn check_and_order(&self, jobs: &[Job], changeset: &ChangeSet) -> Result<Vec<Vec<usize>>> {
        let outcome = self.check(jobs, changeset, true)?;
        if !outcome.failure.is_empty() {
            return Err(Error::DependencyFailure(outcome.failure));
        }
        Ok(outcome.order.unwrap_or_default())
    }

    fn add_new_trove(&self, trove_id: i64, trove: &Trove) -> Result<()> {
        let conn = self.store.conn();
        let mut provide = conn.prepare(
            "INSERT INTO TmpProvides (troveId, class, name, flag) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (class, dep) in trove.provides.iter() {
            for row in expand(class, dep) {
                provide.execute(params![trove_id, row.class, row.name, row.flag])?;
            }
        }

        let mut require = conn.prepare(
            "INSERT INTO TmpRequires (troveId, depNum, depCount, class, name, flag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        let mut dep_num: i64 = 0;
        for (class, dep) in trove.requires.iter() {
            // self-satisfied requirements never constrain anything
            let single = DependencySet::new().with(class, dep.clone());
            if trove.provides.satisfies(&single) {
                continue;
            }
            dep_num -= 1;
            let rows = expand(class, dep);
            let count = rows.len() as i64;
            for row in rows {
                require.execute(params![trove_id, dep_num, count, row.class, row.name, row.flag])?;
            }
        }
        Ok(())
    }

    /// Copy installed requirements served by a removed trove into TmpRequires
    fn add_rechecks(&self) -> Result<()> {
        self.store.conn().execute(
            "INSERT INTO TmpRequires (troveId, depNum, depCount, class, name, flag)
             SELECT Requires.instanceId, Requires.depNum, Requires.depCount,
                    Dependencies.class, Dependencies.name, Dependencies.flag
             FROM Requires
             JOIN Dependencies USING (depId)
             JOIN Instances USING (instanceId)
             WHERE Instances.isPresent = ?1
               AND Requires.instanceId NOT IN (SELECT troveId FROM RemovedTroveIds)
               AND (Requires.instanceId, Requires.depNum) IN (
                   SELECT R.instanceId, R.depNum FROM Requires AS R
                   JOIN Provides AS P ON P.depId = R.depId
                   WHERE P.instanceId IN (SELECT troveId FROM RemovedTroveIds)
               )",
            [Presence::Present.as_i64()],
        )?;
        Ok(())
    }

    /// Every (requirement, provider) pair where the provider stays or arrives
    fn satisfied(&self) -> Result<Vec<Satisfaction>> {
        let mut stmt = self.store.conn().prepare(
            "SELECT r.troveId, r.depNum, p.troveId
             FROM TmpRequires AS r
             JOIN AllProvides AS p
               ON p.class = r.class AND p.name = r.name AND p.flag = r.flag
             WHERE p.troveId NOT IN (SELECT troveId FROM RemovedTroveIds)
             GROUP BY r.troveId, r.depNum, p.troveId
             HAVING COUNT(*) = MAX(r.depCount)
             ORDER BY r.troveId, r.depNum, p.troveId",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Requirements a removed trove would have satisfied
    fn satisfied_by_removed(&self) -> Result<Vec<Satisfaction>> {
        let mut stmt = self.store.conn().prepare(
            "SELECT r.troveId, r.depNum, p.instanceId
             FROM TmpRequires AS r
             JOIN Dependencies AS d
               ON d.class = r.class AND d.name = r.name AND d.flag = r.flag
             JOIN Provides AS p ON p.depId = d.depId
             WHERE p.instanceId IN (SELECT troveId FROM RemovedTroveIds)
             GROUP BY r.troveId, r.depNum, p.instanceId
             HAVING COUNT(*) = MAX(r.depCount)
             ORDER BY r.troveId, r.depNum, p.instanceId",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// (requirer, provider) instance pairs where both are being removed
    fn removed_pairs(&self) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self.store.conn().prepare(
            "SELECT DISTINCT requirer, provider FROM (
                 SELECT R.instanceId AS requirer, P.instanceId AS provider
                 FROM Requires AS R
                 JOIN Provides AS P ON P.depId = R.depId
                 WHERE R.instanceId IN (SELECT troveId FROM RemovedTroveIds)
                   AND P.instanceId IN (SELECT troveId FROM RemovedTroveIds)
                   AND R.instanceId != P.instanceId
                 GROUP BY R.instanceId, R.depNum, P.instanceId
                 HAVING COUNT(*) = MAX(R.depCount)
             )
             ORDER BY requirer, provider",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Requirement rows grouped by (troveId, depNum)
    fn requirement_groups(&self) -> Result<BTreeMap<(i64, i64), DependencySet>> {
        let mut stmt = self.store.conn().prepare(
            "SELECT troveId, depNum, class, name, flag FROM TmpRequires
             ORDER BY troveId, depNum",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut grouped: BTreeMap<(i64, i64), Vec<(u32, String, String)>> = BTreeMap::new();
        for (trove_id, dep_num, class, name, flag) in rows {
            grouped
                .entry((trove_id, dep_num))
                .or_default()
                .push((class, name, flag));
        }
        grouped
            .into_iter()
            .map(|(key, rows)| Ok((key, dependency::collect(rows)?)))
            .collect()
    }

    fn tuple_for(&self, trove_id: i64, jobs: &[Job]) -> Result<TroveTuple> {
        if trove_id < 0 {
            let index = (-trove_id - 1) as usize;
            return jobs
                .get(index)
                .and_then(|j| j.new.clone())
                .ok_or_else(|| Error::NotFound(format!("job {}", index)));
        }
        self.store
            .tuple_for_instance(trove_id)?
            .ok_or_else(|| Error::NotFound(format!("instance {}", trove_id)))
    }

    fn order(
        &self,
        jobs: &[Job],
        new_troves: &[Option<&Trove>],
        removed: &BTreeMap<i64, usize>,
        satisfied: &[Satisfaction],
    ) -> Result<Vec<Vec<usize>>> {
        let mut graph = JobGraph::new(jobs);
        let job_of_new = |trove_id: i64| (trove_id < 0).then(|| (-trove_id - 1) as usize);

        // install provider before requirer
        for (requirer, _, provider) in satisfied {
            if let (Some(req), Some(prov)) = (job_of_new(*requirer), job_of_new(*provider)) {
                graph.add_edge(JobGraph::node(prov), JobGraph::node(req), EdgePhase::Install);
            }
        }

        // a kept trove switching providers: the old and new provider share a
        // component so the requirement holds across the swap
        let replacements: HashMap<(i64, i64), Vec<usize>> = satisfied
            .iter()
            .filter(|(requirer, _, _)| *requirer > 0)
            .filter_map(|(requirer, dep_num, provider)| {
                job_of_new(*provider).map(|job| ((*requirer, *dep_num), job))
            })
            .fold(HashMap::new(), |mut acc, (key, job)| {
                acc.entry(key).or_insert_with(Vec::new).push(job);
                acc
            });
        for (requirer, dep_num, old_provider) in self.satisfied_by_removed()? {
            let Some(&erase_job) = removed.get(&old_provider) else {
                continue;
            };
            if let Some(new_jobs) = replacements.get(&(requirer, dep_num)) {
                for &new_job in new_jobs {
                    graph.add_edge(JobGraph::node(new_job), JobGraph::node(erase_job), EdgePhase::Install);
                    graph.add_edge(JobGraph::node(erase_job), JobGraph::node(new_job), EdgePhase::Install);
                }
            }
        }

        // erase requirer before provider
        for (requirer, provider) in self.removed_pairs()? {
            if let (Some(&req), Some(&prov)) = (removed.get(&requirer), removed.get(&provider)) {
                graph.add_edge(JobGraph::node(req), JobGraph::node(prov), EdgePhase::Erase);
            }
        }

        // collections: members install first and erase last
        let new_index: HashMap<&TroveTuple, usize> = jobs
            .iter()
            .enumerate()
            .filter_map(|(i, j)| j.new.as_ref().map(|t| (t, i)))
            .collect();
        for (index, trove) in new_troves.iter().enumerate() {
            let Some(trove) = trove else { continue };
            for child in trove.troves.keys() {
                if let Some(&member) = new_index.get(child) {
                    graph.add_edge(JobGraph::node(member), JobGraph::node(index), EdgePhase::Collection);
                }
            }
        }
        for (&instance_id, &index) in removed {
            for edge in TroveTroveRow::children(self.store.conn(), instance_id)? {
                if let Some(&member) = removed.get(&edge.included_id) {
                    graph.add_edge(JobGraph::node(index), JobGraph::node(member), EdgePhase::Collection);
                }
            }
        }

        graph.cancel_opposing();
        graph.tie_leaves(jobs);
        Ok(graph.order())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{ChangeSetBuilder, TroveBuilder};
    use crate::db;
    use crate::db::store::AddOptions;
    use crate::deps::{Dependency, DependencyClass};
    use crate::trove::TroveRef;
    use crate::version::Version;
    use std::collections::BTreeMap as Map;
    use tempfile::TempDir;

    fn version(v: &str) -> Version {
        Version::parse(&format!("/conary.example.com@rpl:1/{}", v)).unwrap()
    }

    fn dep(name: &str) -> Dependency {
        Dependency::new(name)
    }

    fn setup() -> (TempDir, rusqlite::Connection) {
        let dir = TempDir::new().unwrap();
        let conn = db::init(&dir.path().join("conarydb")).unwrap();
        (dir, conn)
    }

    fn install(store: &TroveStore, builder: TroveBuilder) {
        let (trove, files) = builder.finish();
        let streams: Map<_, _> = files.into_iter().map(|(_, obj, _)| (obj.file_id(), obj)).collect();
        store.add_trove(&trove, &streams, &AddOptions::default()).unwrap();
    }

    #[test]
    fn test_new_provider_orders_first() {
        let (_dir, conn) = setup();
        let store = TroveStore::new(&conn);
        let checker = DependencyChecker::new(&store).unwrap();

        let mut cs = ChangeSetBuilder::new();
        let a = cs.add(
            TroveBuilder::new("a:runtime", version("2.0-1-1"))
                .requires(DependencyClass::Trove, dep("d:runtime")),
        );
        let b = cs.add(
            TroveBuilder::new("b:runtime", version("2.0-1-1"))
                .provides(DependencyClass::Trove, dep("d:runtime")),
        );
        let cs = cs.build();
        let jobs = vec![Job::install(a.clone()), Job::install(b.clone())];

        let outcome = checker.check(&jobs, &cs, true).unwrap();
        assert!(outcome.failure.is_empty());
        assert_eq!(outcome.order.unwrap(), vec![vec![1], vec![0]]);

        // alone, a is unsatisfiable
        let outcome = checker.check(&jobs[..1], &cs, true).unwrap();
        assert_eq!(outcome.failure.unsatisfied.len(), 1);
        assert_eq!(outcome.failure.unsatisfied[0].0, a);
        assert!(
            outcome.failure.unsatisfied[0]
                .1
                .contains(DependencyClass::Trove, &dep("d:runtime"))
        );
        assert!(outcome.order.is_none());
        assert!(matches!(
            checker.check_and_order(&jobs[..1], &cs),
            Err(Error::DependencyFailure(_))
        ));
    }

    #[test]
    fn test_flags_must_all_be_provided() {
        let (_dir, conn) = setup();
        let store = TroveStore::new(&conn);
        install(
            &store,
            TroveBuilder::new("glibc:lib", version("2.3-1-1")).provides(
                DependencyClass::Soname,
                dep("ELF64/libc.so.6").with_flag("GLIBC_2.2.5"),
            ),
        );
        let checker = DependencyChecker::new(&store).unwrap();

        let mut cs = ChangeSetBuilder::new();
        let ok = cs.add(TroveBuilder::new("ok:runtime", version("1-1-1")).requires(
            DependencyClass::Soname,
            dep("ELF64/libc.so.6").with_flag("GLIBC_2.2.5"),
        ));
        let bad = cs.add(TroveBuilder::new("bad:runtime", version("1-1-1")).requires(
            DependencyClass::Soname,
            dep("ELF64/libc.so.6")
                .with_flag("GLIBC_2.2.5")
                .with_flag("GLIBC_2.34"),
        ));
        let cs = cs.build();

        let outcome = checker.check(&[Job::install(ok)], &cs, false).unwrap();
        assert!(outcome.failure.is_empty());
        let outcome = checker.check(&[Job::install(bad.clone())], &cs, false).unwrap();
        assert_eq!(outcome.failure.unsatisfied.len(), 1);
        assert_eq!(outcome.failure.unsatisfied[0].0, bad);
    }

    #[test]
    fn test_erase_breaks_installed_requirer() {
        let (_dir, conn) = setup();
        let store = TroveStore::new(&conn);
        let lib = TroveBuilder::new("lib:lib", version("1-1-1"))
            .provides(DependencyClass::Soname, dep("libx.so.1"));
        let lib_tuple = lib.tuple();
        install(&store, lib);
        let app = TroveBuilder::new("app:runtime", version("1-1-1"))
            .requires(DependencyClass::Soname, dep("libx.so.1"));
        let app_tuple = app.tuple();
        install(&store, app);

        let checker = DependencyChecker::new(&store).unwrap();
        let cs = ChangeSet::new();
        let outcome = checker
            .check(&[Job::erase(lib_tuple.clone())], &cs, false)
            .unwrap();
        assert_eq!(outcome.failure.unresolveable.len(), 1);
        assert_eq!(outcome.failure.unresolveable[0].0, app_tuple);

        // erasing both is fine, and the requirer goes first
        let jobs = vec![Job::erase(lib_tuple), Job::erase(app_tuple)];
        let outcome = checker.check(&jobs, &cs, true).unwrap();
        assert!(outcome.failure.is_empty());
        assert_eq!(outcome.order.unwrap(), vec![vec![1], vec![0]]);
    }

    #[test]
    fn test_update_replacing_provider() {
        let (_dir, conn) = setup();
        let store = TroveStore::new(&conn);
        let old = TroveBuilder::new("lib:lib", version("1-1-1"))
            .provides(DependencyClass::Soname, dep("libx.so.1"));
        let old_tuple = old.tuple();
        install(&store, old);
        install(
            &store,
            TroveBuilder::new("app:runtime", version("1-1-1"))
                .requires(DependencyClass::Soname, dep("libx.so.1")),
        );

        let checker = DependencyChecker::new(&store).unwrap();
        let mut cs = ChangeSetBuilder::new();
        let new = cs.add_relative(
            &old_tuple,
            TroveBuilder::new("lib:lib", version("2-1-1"))
                .provides(DependencyClass::Soname, dep("libx.so.1")),
        );
        let cs = cs.build();
        let outcome = checker
            .check(&[Job::update(old_tuple, new)], &cs, true)
            .unwrap();
        assert!(outcome.failure.is_empty());
        assert_eq!(outcome.order.unwrap(), vec![vec![0]]);
    }

    #[test]
    fn test_requirement_met_only_by_removed_trove() {
        let (_dir, conn) = setup();
        let store = TroveStore::new(&conn);
        let b = TroveBuilder::new("b:runtime", version("1-1-1"))
            .provides(DependencyClass::Soname, dep("ELF64/libb.so.1"));
        let b_tuple = b.tuple();
        install(&store, b);

        let checker = DependencyChecker::new(&store).unwrap();
        let mut cs = ChangeSetBuilder::new();
        let a = cs.add(
            TroveBuilder::new("a:runtime", version("1-1-1"))
                .requires(DependencyClass::Soname, dep("ELF64/libb.so.1")),
        );
        let cs = cs.build();

        let jobs = vec![Job::install(a.clone()), Job::erase(b_tuple)];
        let outcome = checker.check(&jobs, &cs, true).unwrap();
        assert!(outcome.failure.unsatisfied.is_empty());
        assert_eq!(outcome.failure.unresolveable.len(), 1);
        assert_eq!(outcome.failure.unresolveable[0].0, a);
        assert!(
            outcome.failure.unresolveable[0]
                .1
                .contains(DependencyClass::Soname, &dep("ELF64/libb.so.1"))
        );
        assert!(outcome.order.is_none());

        // without the erase it is simply satisfied
        let outcome = checker.check(&jobs[..1], &cs, false).unwrap();
        assert!(outcome.failure.is_empty());
    }

    #[test]
    fn test_provider_swap_shares_component() {
        let (_dir, conn) = setup();
        let store = TroveStore::new(&conn);
        let old = TroveBuilder::new("old:lib", version("1-1-1"))
            .provides(DependencyClass::Soname, dep("libx.so.1"));
        let old_tuple = old.tuple();
        install(&store, old);
        install(
            &store,
            TroveBuilder::new("app:runtime", version("1-1-1"))
                .requires(DependencyClass::Soname, dep("libx.so.1")),
        );

        let checker = DependencyChecker::new(&store).unwrap();
        let mut cs = ChangeSetBuilder::new();
        let new = cs.add(
            TroveBuilder::new("new:lib", version("1-1-1"))
                .provides(DependencyClass::Soname, dep("libx.so.1")),
        );
        let cs = cs.build();

        let jobs = vec![Job::erase(old_tuple), Job::install(new)];
        let outcome = checker.check(&jobs, &cs, true).unwrap();
        assert!(outcome.failure.is_empty());
        let order = outcome.order.unwrap();
        assert_eq!(order.len(), 1);
        let mut component = order[0].clone();
        component.sort_unstable();
        assert_eq!(component, vec![0, 1]);
    }

    #[test]
    fn test_collection_members_first() {
        let (_dir, conn) = setup();
        let store = TroveStore::new(&conn);
        let checker = DependencyChecker::new(&store).unwrap();

        let mut cs = ChangeSetBuilder::new();
        let runtime = cs.add(TroveBuilder::new("foo:runtime", version("1-1-1")));
        let lib = cs.add(TroveBuilder::new("foo:lib", version("1-1-1")));
        let foo = cs.add(
            TroveBuilder::new("foo", version("1-1-1"))
                .include(runtime.clone(), TroveRef::strong())
                .include(lib.clone(), TroveRef::strong()),
        );
        let cs = cs.build();
        let jobs = vec![Job::install(foo), Job::install(runtime), Job::install(lib)];
        let outcome = checker.check(&jobs, &cs, true).unwrap();
        assert_eq!(outcome.order.unwrap(), vec![vec![2], vec![1], vec![0]]);
    }
}
