use crate::database::models::PostHeaderRecord;
use anyhow::Result;
use rusqlite::{params, Connection};

pub(super) struct SqlitePostHeaderRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

impl<'conn> super::PostHeaderRepository for SqlitePostHeaderRepository<'conn> {
    fn insert(&self, record: &PostHeaderRecord) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO post_headers (fingerprint, parent_fingerprint, language, dirty)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.fingerprint,
                record.parent_fingerprint,
                record.language,
                record.dirty
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, fingerprint: &str) -> Result<Option<PostHeaderRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, fingerprint, parent_fingerprint, language, dirty
            FROM post_headers
            WHERE fingerprint = ?1
            ORDER BY id DESC
            "#,
        )?;
        let rows = stmt.query_map(params![fingerprint], |row| {
            Ok(PostHeaderRecord {
                id: row.get(0)?,
                fingerprint: row.get(1)?,
                parent_fingerprint: row.get(2)?,
                language: row.get(3)?,
                dirty: row.get(4)?,
            })
        })?;
        let mut headers = Vec::new();
        for row in rows {
            headers.push(row?);
        }
        if headers.len() > 1 {
            tracing::warn!(
                fingerprint,
                duplicates = headers.len() - 1,
                "collapsing duplicate header rows"
            );
            for stale in headers.drain(1..) {
                self.conn
                    .execute("DELETE FROM post_headers WHERE id = ?1", params![stale.id])?;
            }
        }
        Ok(headers.into_iter().next())
    }

    fn exists(&self, fingerprint: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM post_headers WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
