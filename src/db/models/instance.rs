// src/db/models/instance.rs

//! Instance model - one row per (name, version, flavor) known locally

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Presence state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Presence {
    /// Referenced by a collection but not installed
    Missing,
    Present,
    /// Installed but excluded from "latest" queries
    Hidden,
}

impl Presence {
    pub fn as_i64(self) -> i64 {
        match self {
            Presence::Missing => 0,
            Presence::Present => 1,
            Presence::Hidden => 2,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Presence::Missing),
            1 => Ok(Presence::Present),
            2 => Ok(Presence::Hidden),
            other => Err(Error::ParseError(format!("invalid presence value {}", other))),
        }
    }
}

/// A row of the Instances table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: Option<i64>,
    pub item_id: i64,
    pub version_id: i64,
    pub flavor_id: i64,
    /// Colon-separated revision timestamps, outermost first
    pub time_stamps: String,
    pub presence: Presence,
    pub pinned: bool,
    pub trove_type: i64,
}

const COLUMNS: &str =
    "instanceId, itemId, versionId, flavorId, timeStamps, isPresent, pinned, troveType";

impl Instance {
    pub fn new(item_id: i64, version_id: i64, flavor_id: i64, time_stamps: String) -> Self {
        Self {
            id: None,
            item_id,
            version_id,
            flavor_id,
            time_stamps,
            presence: Presence::Present,
            pinned: false,
            trove_type: 0,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO Instances (itemId, versionId, flavorId, timeStamps, isPresent, pinned, troveType)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.item_id,
                self.version_id,
                self.flavor_id,
                &self.time_stamps,
                self.presence.as_i64(),
                self.pinned,
                self.trove_type,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM Instances WHERE instanceId = ?1"
        ))?;
        let found = stmt.query_row([id], Self::from_row).optional()?;
        Ok(found)
    }

    pub fn find_by_ids(
        conn: &Connection,
        item_id: i64,
        version_id: i64,
        flavor_id: i64,
    ) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM Instances
             WHERE itemId = ?1 AND versionId = ?2 AND flavorId = ?3"
        ))?;
        let found = stmt
            .query_row(params![item_id, version_id, flavor_id], Self::from_row)
            .optional()?;
        Ok(found)
    }

    /// All instances of a name, regardless of presence
    pub fn find_by_item(conn: &Connection, item_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM Instances WHERE itemId = ?1 ORDER BY instanceId"
        ))?;
        let rows = stmt
            .query_map([item_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_presence(conn: &Connection, id: i64, presence: Presence) -> Result<()> {
        conn.execute(
            "UPDATE Instances SET isPresent = ?1 WHERE instanceId = ?2",
            params![presence.as_i64(), id],
        )?;
        Ok(())
    }

    pub fn set_pinned(conn: &Connection, id: i64, pinned: bool) -> Result<()> {
        conn.execute(
            "UPDATE Instances SET pinned = ?1 WHERE instanceId = ?2",
            params![pinned, id],
        )?;
        Ok(())
    }

    pub fn set_details(conn: &Connection, id: i64, time_stamps: &str, trove_type: i64) -> Result<()> {
        conn.execute(
            "UPDATE Instances SET timeStamps = ?1, troveType = ?2 WHERE instanceId = ?3",
            params![time_stamps, trove_type, id],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM Instances WHERE instanceId = ?1", [id])?;
        Ok(())
    }

    /// Timestamps parsed back into numbers
    pub fn timestamps(&self) -> Vec<u64> {
        self.time_stamps
            .split(':')
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let presence_raw: i64 = row.get(5)?;
        let presence = Presence::from_i64(presence_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Integer,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                )),
            )
        })?;
        Ok(Self {
            id: Some(row.get(0)?),
            item_id: row.get(1)?,
            version_id: row.get(2)?,
            flavor_id: row.get(3)?,
            time_stamps: row.get(4)?,
            presence,
            pinned: row.get(6)?,
            trove_type: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::InternTable;
    use crate::db::schema;

    #[test]
    fn test_insert_find_and_flags() {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        let item = InternTable::Items.intern(&conn, "foo").unwrap();
        let version = InternTable::Versions.intern(&conn, "/a@b:c/1.000:1-1").unwrap();

        let mut inst = Instance::new(item, version, 0, "1000".to_string());
        let id = inst.insert(&conn).unwrap();

        let found = Instance::find_by_ids(&conn, item, version, 0).unwrap().unwrap();
        assert_eq!(found.id, Some(id));
        assert_eq!(found.presence, Presence::Present);
        assert_eq!(found.timestamps(), vec![1000]);

        Instance::set_presence(&conn, id, Presence::Hidden).unwrap();
        Instance::set_pinned(&conn, id, true).unwrap();
        let found = Instance::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.presence, Presence::Hidden);
        assert!(found.pinned);

        Instance::delete(&conn, id).unwrap();
        assert!(Instance::find_by_id(&conn, id).unwrap().is_none());
    }
}
