// src/db/models/trove_info.rs

//! TroveInfo rows - typed auxiliary blobs per instance

use crate::error::Result;
use rusqlite::{Connection, params};

pub fn insert(conn: &Connection, instance_id: i64, info_type: u8, data: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO TroveInfo (instanceId, infoType, data) VALUES (?1, ?2, ?3)",
        params![instance_id, info_type, data],
    )?;
    Ok(())
}

/// All (infoType, data) rows of an instance, by type
pub fn find_by_instance(conn: &Connection, instance_id: i64) -> Result<Vec<(u8, Vec<u8>)>> {
    let mut stmt = conn.prepare(
        "SELECT infoType, data FROM TroveInfo WHERE instanceId = ?1 ORDER BY infoType",
    )?;
    let rows = stmt
        .query_map([instance_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// (instanceId, data) for every present instance carrying `info_type`
pub fn find_by_type(conn: &Connection, info_type: u8) -> Result<Vec<(i64, Vec<u8>)>> {
    let mut stmt = conn.prepare(
        "SELECT TroveInfo.instanceId, data FROM TroveInfo
         JOIN Instances USING (instanceId)
         WHERE infoType = ?1 AND Instances.isPresent = 1
         ORDER BY TroveInfo.instanceId",
    )?;
    let rows = stmt
        .query_map([info_type], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_for_instance(conn: &Connection, instance_id: i64) -> Result<()> {
    conn.execute("DELETE FROM TroveInfo WHERE instanceId = ?1", [instance_id])?;
    Ok(())
}
