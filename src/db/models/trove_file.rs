// src/db/models/trove_file.rs

//! TroveFile model - which instance owns which path

use crate::error::Result;
use crate::hash::PathId;
use rusqlite::{Connection, Row, params};

/// A row of TroveFiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveFileRow {
    pub instance_id: i64,
    pub stream_id: i64,
    pub version_id: i64,
    pub path_id: PathId,
    pub path: String,
    /// Cleared when another trove took the path over
    pub is_present: bool,
}

impl TroveFileRow {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO TroveFiles (instanceId, streamId, versionId, pathId, path, isPresent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.instance_id,
                self.stream_id,
                self.version_id,
                self.path_id.as_bytes(),
                &self.path,
                self.is_present,
            ],
        )?;
        Ok(())
    }

    /// Files of an instance; `present_only` skips files taken over by others
    pub fn find_by_instance(
        conn: &Connection,
        instance_id: i64,
        present_only: bool,
    ) -> Result<Vec<Self>> {
        let sql = if present_only {
            "SELECT instanceId, streamId, versionId, pathId, path, isPresent
             FROM TroveFiles WHERE instanceId = ?1 AND isPresent = 1 ORDER BY pathId"
        } else {
            "SELECT instanceId, streamId, versionId, pathId, path, isPresent
             FROM TroveFiles WHERE instanceId = ?1 ORDER BY pathId"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([instance_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_present(
        conn: &Connection,
        instance_id: i64,
        path_id: &PathId,
        present: bool,
    ) -> Result<usize> {
        let changed = conn.execute(
            "UPDATE TroveFiles SET isPresent = ?1 WHERE instanceId = ?2 AND pathId = ?3",
            params![present, instance_id, path_id.as_bytes()],
        )?;
        Ok(changed)
    }

    pub fn delete_by_instance(conn: &Connection, instance_id: i64) -> Result<()> {
        conn.execute("DELETE FROM TroveFiles WHERE instanceId = ?1", [instance_id])?;
        Ok(())
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let path_id: Vec<u8> = row.get(3)?;
        let path_id = PathId::from_slice(&path_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Blob,
                Box::new(e),
            )
        })?;
        Ok(Self {
            instance_id: row.get(0)?,
            stream_id: row.get(1)?,
            version_id: row.get(2)?,
            path_id,
            path: row.get(4)?,
            is_present: row.get(5)?,
        })
    }
}
