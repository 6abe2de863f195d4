// src/db/models/file_stream.rs

//! FileStream model - frozen file objects, shared between troves by fileId

use crate::error::Result;
use crate::hash::{FileId, Sha1Digest};
use rusqlite::{Connection, OptionalExtension, Row, params};

#[derive(Debug, Clone)]
pub struct FileStream {
    pub id: Option<i64>,
    pub file_id: FileId,
    pub stream: Vec<u8>,
    /// Contents sha1 of regular files
    pub sha1: Option<Sha1Digest>,
}

impl FileStream {
    pub fn new(file_id: FileId, stream: Vec<u8>, sha1: Option<Sha1Digest>) -> Self {
        Self {
            id: None,
            file_id,
            stream,
            sha1,
        }
    }

    /// Insert unless a stream with the same fileId exists; returns the streamId
    pub fn insert_or_get(&mut self, conn: &Connection) -> Result<i64> {
        if let Some(id) = Self::find_id(conn, &self.file_id)? {
            self.id = Some(id);
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO FileStreams (fileId, stream, sha1) VALUES (?1, ?2, ?3)",
            params![
                self.file_id.as_bytes(),
                &self.stream,
                self.sha1.as_ref().map(|s| s.as_bytes().to_vec()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_id(conn: &Connection, file_id: &FileId) -> Result<Option<i64>> {
        let found = conn
            .query_row(
                "SELECT streamId FROM FileStreams WHERE fileId = ?1",
                [file_id.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found)
    }

    pub fn find_by_file_id(conn: &Connection, file_id: &FileId) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT streamId, fileId, stream, sha1 FROM FileStreams WHERE fileId = ?1",
        )?;
        let found = stmt
            .query_row([file_id.as_bytes()], Self::from_row)
            .optional()?;
        Ok(found)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT streamId, fileId, stream, sha1 FROM FileStreams WHERE streamId = ?1",
        )?;
        let found = stmt.query_row([id], Self::from_row).optional()?;
        Ok(found)
    }

    /// Attach tags to a stream
    pub fn set_tags(conn: &Connection, stream_id: i64, tag_ids: &[i64]) -> Result<()> {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO TroveFileTags (streamId, tagId) VALUES (?1, ?2)",
        )?;
        for tag_id in tag_ids {
            stmt.execute(params![stream_id, tag_id])?;
        }
        Ok(())
    }

    /// Delete streams no TroveFiles row references; returns the contents
    /// sha1s of the deleted regular files
    pub fn delete_unreferenced(conn: &Connection) -> Result<Vec<Sha1Digest>> {
        let mut stmt = conn.prepare(
            "SELECT sha1 FROM FileStreams
             WHERE sha1 IS NOT NULL
               AND streamId NOT IN (SELECT streamId FROM TroveFiles)",
        )?;
        let sha1s = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        conn.execute(
            "DELETE FROM FileStreams WHERE streamId NOT IN (SELECT streamId FROM TroveFiles)",
            [],
        )?;
        Ok(sha1s
            .iter()
            .filter_map(|b| Sha1Digest::from_slice(b).ok())
            .collect())
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let file_id: Vec<u8> = row.get(1)?;
        let sha1: Option<Vec<u8>> = row.get(3)?;
        let file_id = Sha1Digest::from_slice(&file_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Blob,
                Box::new(e),
            )
        })?;
        Ok(Self {
            id: Some(row.get(0)?),
            file_id,
            stream: row.get(2)?,
            sha1: sha1.and_then(|b| Sha1Digest::from_slice(&b).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;

    #[test]
    fn test_dedup_by_file_id() {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        let file_id = Sha1Digest::of(b"stream");
        let mut a = FileStream::new(file_id, b"stream".to_vec(), Some(Sha1Digest::of(b"x")));
        let mut b = FileStream::new(file_id, b"stream".to_vec(), None);
        let id_a = a.insert_or_get(&conn).unwrap();
        let id_b = b.insert_or_get(&conn).unwrap();
        assert_eq!(id_a, id_b);

        let found = FileStream::find_by_file_id(&conn, &file_id).unwrap().unwrap();
        assert_eq!(found.sha1, Some(Sha1Digest::of(b"x")));

        let removed = FileStream::delete_unreferenced(&conn).unwrap();
        assert_eq!(removed, vec![Sha1Digest::of(b"x")]);
        assert!(FileStream::find_by_id(&conn, id_a).unwrap().is_none());
    }
}
