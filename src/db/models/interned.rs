// src/db/models/interned.rs

//! Interned strings: trove names, versions, branches, labels, flavors, tags
//!
//! Each of these tables maps a unique string to a small integer id. Rows are
//! created on first use and looked up by value afterwards.

use crate::deps::DependencyClass;
use crate::error::Result;
use crate::flavor::Flavor;
use rusqlite::{Connection, OptionalExtension, params};

/// One of the `(id, unique string)` tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternTable {
    Items,
    Versions,
    Branches,
    Labels,
    Flavors,
    Tags,
}

impl InternTable {
    fn columns(self) -> (&'static str, &'static str, &'static str) {
        match self {
            InternTable::Items => ("Items", "itemId", "item"),
            InternTable::Versions => ("Versions", "versionId", "version"),
            InternTable::Branches => ("Branches", "branchId", "branch"),
            InternTable::Labels => ("Labels", "labelId", "label"),
            InternTable::Flavors => ("Flavors", "flavorId", "flavor"),
            InternTable::Tags => ("Tags", "tagId", "tag"),
        }
    }

    /// Id of `value`, if it has been interned
    pub fn find(self, conn: &Connection, value: &str) -> Result<Option<i64>> {
        let (table, id, col) = self.columns();
        let sql = format!("SELECT {id} FROM {table} WHERE {col} = ?1");
        let found = conn
            .query_row(&sql, [value], |row| row.get(0))
            .optional()?;
        Ok(found)
    }

    /// Id of `value`, inserting it if needed
    pub fn intern(self, conn: &Connection, value: &str) -> Result<i64> {
        if let Some(id) = self.find(conn, value)? {
            return Ok(id);
        }
        let (table, _, col) = self.columns();
        conn.execute(&format!("INSERT INTO {table} ({col}) VALUES (?1)"), [value])?;
        Ok(conn.last_insert_rowid())
    }

    /// String stored under `id`
    pub fn value(self, conn: &Connection, id: i64) -> Result<Option<String>> {
        let (table, id_col, col) = self.columns();
        let sql = format!("SELECT {col} FROM {table} WHERE {id_col} = ?1");
        let found = conn.query_row(&sql, [id], |row| row.get(0)).optional()?;
        Ok(found)
    }
}

/// Intern a flavor, expanding new ones into FlavorMap
///
/// The empty flavor is always id 0.
pub fn intern_flavor(conn: &Connection, flavor: &Flavor) -> Result<i64> {
    if flavor.is_empty() {
        return Ok(0);
    }
    let frozen = flavor.freeze();
    if let Some(id) = InternTable::Flavors.find(conn, &frozen)? {
        return Ok(id);
    }
    let id = InternTable::Flavors.intern(conn, &frozen)?;

    let mut stmt = conn.prepare(
        "INSERT INTO FlavorMap (flavorId, base, sense, flag) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (class, dep) in flavor.deps().iter() {
        let base = match class {
            DependencyClass::Use => "use".to_string(),
            _ => dep.name.clone(),
        };
        if dep.flags.is_empty() {
            stmt.execute(params![id, &base, 0, ""])?;
        }
        for (flag, sense) in &dep.flags {
            stmt.execute(params![id, &base, *sense as i64, flag])?;
        }
    }
    Ok(id)
}

/// Record that `item` has a version on `branch`
pub fn add_label_map(conn: &Connection, item_id: i64, label: &str, branch: &str) -> Result<()> {
    let label_id = InternTable::Labels.intern(conn, label)?;
    let branch_id = InternTable::Branches.intern(conn, branch)?;
    conn.execute(
        "INSERT OR IGNORE INTO LabelMap (itemId, labelId, branchId) VALUES (?1, ?2, ?3)",
        params![item_id, label_id, branch_id],
    )?;
    Ok(())
}

/// Branches on which `item` has versions, sorted
pub fn branches_for_item(conn: &Connection, item: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT Branches.branch FROM LabelMap
         JOIN Items USING (itemId)
         JOIN Branches USING (branchId)
         WHERE Items.item = ?1
         ORDER BY Branches.branch",
    )?;
    let branches = stmt
        .query_map([item], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(branches)
}
