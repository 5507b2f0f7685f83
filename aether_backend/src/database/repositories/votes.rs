use crate::database::models::VoteRecord;
use anyhow::Result;
use rusqlite::{params, Connection, Row};

pub(super) struct SqliteVoteRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

fn map_vote(row: &Row<'_>) -> rusqlite::Result<VoteRecord> {
    Ok(VoteRecord {
        id: row.get(0)?,
        target_fingerprint: row.get(1)?,
        node_id: row.get(2)?,
        direction: row.get(3)?,
    })
}

impl<'conn> super::VoteRepository for SqliteVoteRepository<'conn> {
    fn insert(&self, record: &VoteRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO votes (target_fingerprint, node_id, direction) VALUES (?1, ?2, ?3)",
            params![record.target_fingerprint, record.node_id, record.direction],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_direction(&self, id: i64, direction: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE votes SET direction = ?2 WHERE id = ?1",
            params![id, direction],
        )?;
        Ok(())
    }

    fn get(&self, target_fingerprint: &str, node_id: &str) -> Result<Option<VoteRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, target_fingerprint, node_id, direction
            FROM votes
            WHERE target_fingerprint = ?1 AND node_id = ?2
            ORDER BY id DESC
            "#,
        )?;
        let rows = stmt.query_map(params![target_fingerprint, node_id], map_vote)?;
        let mut votes = Vec::new();
        for row in rows {
            votes.push(row?);
        }
        if votes.len() > 1 {
            tracing::warn!(
                target_fingerprint,
                node_id,
                duplicates = votes.len() - 1,
                "collapsing duplicate vote rows"
            );
            for stale in votes.drain(1..) {
                if let Some(id) = stale.id {
                    self.delete(id)?;
                }
            }
        }
        Ok(votes.into_iter().next())
    }

    fn list_for_target(&self, target_fingerprint: &str) -> Result<Vec<VoteRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, target_fingerprint, node_id, direction
            FROM votes
            WHERE target_fingerprint = ?1
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![target_fingerprint], map_vote)?;
        let mut votes = Vec::new();
        for row in rows {
            votes.push(row?);
        }
        Ok(votes)
    }

    fn delete(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM votes WHERE id = ?1", params![id])?;
        Ok(())
    }
}
