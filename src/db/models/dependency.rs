// src/db/models/dependency.rs

//! Dependency rows and the Provides/Requires expansion
//!
//! A dependency `soname: ELF64/libc.so.6(GLIBC_2.2.5 GLIBC_2.3)` becomes
//! three Dependencies rows sharing class and name: one per flag and a base
//! row whose flag is [`NO_FLAG_MAGIC`]. Provides links an instance to every
//! row; Requires does the same and tags them with a per-instance `depNum`
//! and `depCount` (flags + 1), so a provider satisfies a requirement when it
//! provides `depCount` of the requirement's rows.

use crate::db::schema::NO_FLAG_MAGIC;
use crate::deps::{Dependency, DependencyClass, DependencySet, Sense};
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};

/// One row of the Dependencies table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyRow {
    pub class: u32,
    pub name: String,
    pub flag: String,
}

impl DependencyRow {
    pub fn new(class: DependencyClass, name: &str, flag: &str) -> Self {
        Self {
            class: class.tag(),
            name: name.to_string(),
            flag: flag.to_string(),
        }
    }

    pub fn find_id(&self, conn: &Connection) -> Result<Option<i64>> {
        let found = conn
            .query_row(
                "SELECT depId FROM Dependencies WHERE class = ?1 AND name = ?2 AND flag = ?3",
                params![self.class, &self.name, &self.flag],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found)
    }

    pub fn intern(&self, conn: &Connection) -> Result<i64> {
        if let Some(id) = self.find_id(conn)? {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO Dependencies (class, name, flag) VALUES (?1, ?2, ?3)",
            params![self.class, &self.name, &self.flag],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

/// Rows a single dependency expands to, base row first
pub fn expand(class: DependencyClass, dep: &Dependency) -> Vec<DependencyRow> {
    let mut rows = vec![DependencyRow::new(class, &dep.name, NO_FLAG_MAGIC)];
    for (flag, sense) in &dep.flags {
        rows.push(DependencyRow::new(
            class,
            &dep.name,
            &format!("{}{}", sense.as_prefix(), flag),
        ));
    }
    rows
}

pub fn insert_provides(conn: &Connection, instance_id: i64, provides: &DependencySet) -> Result<()> {
    let mut stmt = conn.prepare("INSERT INTO Provides (instanceId, depId) VALUES (?1, ?2)")?;
    for (class, dep) in provides.iter() {
        for row in expand(class, dep) {
            let dep_id = row.intern(conn)?;
            stmt.execute(params![instance_id, dep_id])?;
        }
    }
    Ok(())
}

pub fn insert_requires(conn: &Connection, instance_id: i64, requires: &DependencySet) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO Requires (instanceId, depId, depNum, depCount) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (dep_num, (class, dep)) in requires.iter().enumerate() {
        let rows = expand(class, dep);
        let count = rows.len() as i64;
        for row in rows {
            let dep_id = row.intern(conn)?;
            stmt.execute(params![instance_id, dep_id, dep_num as i64, count])?;
        }
    }
    Ok(())
}

/// Rebuild a dependency set from (class, name, flag) rows
pub fn collect(rows: Vec<(u32, String, String)>) -> Result<DependencySet> {
    let mut set = DependencySet::new();
    for (class, name, flag) in rows {
        let class = DependencyClass::from_tag(class)?;
        let mut dep = Dependency::new(name);
        if flag != NO_FLAG_MAGIC {
            let (sense, flag_name) = Sense::parse_with_name(&flag)?;
            dep.flags.insert(flag_name.to_string(), sense);
        }
        set.add(class, dep);
    }
    Ok(set)
}

pub fn load_provides(conn: &Connection, instance_id: i64) -> Result<DependencySet> {
    let mut stmt = conn.prepare(
        "SELECT class, name, flag FROM Provides
         JOIN Dependencies USING (depId)
         WHERE instanceId = ?1",
    )?;
    let rows = stmt
        .query_map([instance_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    collect(rows)
}

pub fn load_requires(conn: &Connection, instance_id: i64) -> Result<DependencySet> {
    let mut stmt = conn.prepare(
        "SELECT class, name, flag FROM Requires
         JOIN Dependencies USING (depId)
         WHERE instanceId = ?1
         ORDER BY depNum",
    )?;
    let rows = stmt
        .query_map([instance_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    collect(rows)
}

pub fn delete_for_instance(conn: &Connection, instance_id: i64) -> Result<()> {
    conn.execute("DELETE FROM Provides WHERE instanceId = ?1", [instance_id])?;
    conn.execute("DELETE FROM Requires WHERE instanceId = ?1", [instance_id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;

    #[test]
    fn test_requires_expansion_and_reload() {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        conn.execute("INSERT INTO Items (item) VALUES ('foo')", []).unwrap();
        conn.execute("INSERT INTO Versions (version) VALUES ('/a@b:c/1-1')", []).unwrap();
        conn.execute(
            "INSERT INTO Instances (itemId, versionId, flavorId, timeStamps) VALUES (1, 1, 0, '0')",
            [],
        )
        .unwrap();

        let requires = DependencySet::new()
            .with(
                DependencyClass::Soname,
                Dependency::new("ELF64/libc.so.6")
                    .with_flag("GLIBC_2.2.5")
                    .with_flag("GLIBC_2.3"),
            )
            .with(DependencyClass::Trove, Dependency::new("bar:lib"));
        insert_requires(&conn, 1, &requires).unwrap();

        let counts: Vec<(i64, i64)> = conn
            .prepare("SELECT depNum, COUNT(*) FROM Requires GROUP BY depNum ORDER BY depNum")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(counts.len(), 2);
        let mut sizes: Vec<i64> = counts.iter().map(|(_, c)| *c).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 3]);

        assert_eq!(load_requires(&conn, 1).unwrap(), requires);

        insert_provides(&conn, 1, &requires).unwrap();
        assert_eq!(load_provides(&conn, 1).unwrap(), requires);
        delete_for_instance(&conn, 1).unwrap();
        assert!(load_provides(&conn, 1).unwrap().is_empty());
    }
}
