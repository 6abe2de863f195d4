// src/db/models/trove_troves.rs

//! TroveTroves model - collection membership edges

use crate::error::Result;
use rusqlite::{Connection, Row, params};

/// Edge from a collection instance to an included instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveTroveRow {
    pub instance_id: i64,
    pub included_id: i64,
    /// `TroveRef` bits
    pub flags: u8,
    /// Set for edges the collection shipped with; cleared for edges the
    /// local system added (pinned troves bound into a new collection)
    pub in_pristine: bool,
}

impl TroveTroveRow {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO TroveTroves (instanceId, includedId, flags, inPristine)
             VALUES (?1, ?2, ?3, ?4)",
            params![self.instance_id, self.included_id, self.flags, self.in_pristine],
        )?;
        Ok(())
    }

    pub fn children(conn: &Connection, instance_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT instanceId, includedId, flags, inPristine FROM TroveTroves
             WHERE instanceId = ?1 ORDER BY includedId",
        )?;
        let rows = stmt
            .query_map([instance_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn parents(conn: &Connection, included_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT instanceId, includedId, flags, inPristine FROM TroveTroves
             WHERE includedId = ?1 ORDER BY instanceId",
        )?;
        let rows = stmt
            .query_map([included_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_children(conn: &Connection, instance_id: i64) -> Result<()> {
        conn.execute("DELETE FROM TroveTroves WHERE instanceId = ?1", [instance_id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            instance_id: row.get(0)?,
            included_id: row.get(1)?,
            flags: row.get(2)?,
            in_pristine: row.get(3)?,
        })
    }
}
