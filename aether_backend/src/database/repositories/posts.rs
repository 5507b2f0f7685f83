use super::{ActivityWindow, PostFlag};
use crate::database::models::PostRecord;
use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

const POST_COLUMNS: &str = "id, fingerprint, parent_fingerprint, subject, body, owner_username, \
    owner_fingerprint, language, protocol_version, creation_date, last_vote_date, upvote_count, \
    downvote_count, neutral_count, reply_count, upvoted, downvoted, neutral, saved, is_reply, \
    locally_created, dirty, rank_score";

pub(super) struct SqlitePostRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

fn map_post(row: &Row<'_>) -> rusqlite::Result<PostRecord> {
    Ok(PostRecord {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        parent_fingerprint: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        owner_username: row.get(5)?,
        owner_fingerprint: row.get(6)?,
        language: row.get(7)?,
        protocol_version: row.get(8)?,
        creation_date: row.get(9)?,
        last_vote_date: row.get(10)?,
        upvote_count: row.get(11)?,
        downvote_count: row.get(12)?,
        neutral_count: row.get(13)?,
        reply_count: row.get(14)?,
        upvoted: row.get(15)?,
        downvoted: row.get(16)?,
        neutral: row.get(17)?,
        saved: row.get(18)?,
        is_reply: row.get(19)?,
        locally_created: row.get(20)?,
        dirty: row.get(21)?,
        rank_score: row.get(22)?,
    })
}

impl<'conn> SqlitePostRepository<'conn> {
    fn query(&self, sql: &str, values: Vec<Value>) -> Result<Vec<PostRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), map_post)?;
        let mut posts = Vec::new();
        for row in rows {
            posts.push(row?);
        }
        Ok(posts)
    }

    fn count(&self, sql: &str, values: Vec<Value>) -> Result<i64> {
        Ok(self
            .conn
            .query_row(sql, params_from_iter(values), |row| row.get(0))?)
    }
}

/// Appends a `created_after` bound to a parent lookup.
fn children_filter(parent: &str, created_after: Option<i64>) -> (String, Vec<Value>) {
    let mut clause = String::from("parent_fingerprint = ?");
    let mut values = vec![Value::Text(parent.to_string())];
    if let Some(after) = created_after {
        clause.push_str(" AND creation_date > ?");
        values.push(Value::Integer(after));
    }
    (clause, values)
}

impl<'conn> super::PostRepository for SqlitePostRepository<'conn> {
    fn insert(&self, record: &PostRecord) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO posts (fingerprint, parent_fingerprint, subject, body, owner_username,
                owner_fingerprint, language, protocol_version, creation_date, last_vote_date,
                upvote_count, downvote_count, neutral_count, reply_count, upvoted, downvoted,
                neutral, saved, is_reply, locally_created, dirty, rank_score)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21, ?22)
            "#,
            params![
                record.fingerprint,
                record.parent_fingerprint,
                record.subject,
                record.body,
                record.owner_username,
                record.owner_fingerprint,
                record.language,
                record.protocol_version,
                record.creation_date,
                record.last_vote_date,
                record.upvote_count,
                record.downvote_count,
                record.neutral_count,
                record.reply_count,
                record.upvoted,
                record.downvoted,
                record.neutral,
                record.saved,
                record.is_reply,
                record.locally_created,
                record.dirty,
                record.rank_score,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update(&self, record: &PostRecord) -> Result<()> {
        let Some(id) = record.id else {
            anyhow::bail!("cannot update unsaved post {}", record.fingerprint);
        };
        self.conn.execute(
            r#"
            UPDATE posts SET
                last_vote_date = ?2,
                upvote_count = ?3,
                downvote_count = ?4,
                neutral_count = ?5,
                reply_count = ?6,
                upvoted = ?7,
                downvoted = ?8,
                neutral = ?9,
                saved = ?10,
                is_reply = ?11,
                locally_created = ?12,
                dirty = ?13,
                rank_score = ?14
            WHERE id = ?1
            "#,
            params![
                id,
                record.last_vote_date,
                record.upvote_count,
                record.downvote_count,
                record.neutral_count,
                record.reply_count,
                record.upvoted,
                record.downvoted,
                record.neutral,
                record.saved,
                record.is_reply,
                record.locally_created,
                record.dirty,
                record.rank_score,
            ],
        )?;
        Ok(())
    }

    fn get(&self, fingerprint: &str) -> Result<Option<PostRecord>> {
        let mut rows = self.query(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE fingerprint = ? ORDER BY id DESC"),
            vec![Value::Text(fingerprint.to_string())],
        )?;
        if rows.len() > 1 {
            tracing::warn!(
                fingerprint,
                duplicates = rows.len() - 1,
                "collapsing duplicate post rows"
            );
            for stale in rows.drain(1..) {
                if let Some(id) = stale.id {
                    self.delete(id)?;
                }
            }
        }
        Ok(rows.into_iter().next())
    }

    fn exists(&self, fingerprint: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn delete(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM posts WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn list_dirty(&self) -> Result<Vec<PostRecord>> {
        self.query(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE dirty = 1 ORDER BY id ASC"),
            Vec::new(),
        )
    }

    fn list_for_sync(
        &self,
        flag: PostFlag,
        window: ActivityWindow,
        languages: Option<&[String]>,
    ) -> Result<Vec<PostRecord>> {
        let mut sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE ");
        let mut values = Vec::new();
        sql.push_str(match flag {
            PostFlag::Upvoted => "upvoted = 1",
            PostFlag::Neutral => "neutral = 1",
            PostFlag::Downvoted => "downvoted = 1",
            PostFlag::Topic => "parent_fingerprint IS NULL",
        });
        match window {
            ActivityWindow::VotedSince(ts) => {
                sql.push_str(" AND last_vote_date >= ?");
                values.push(Value::Integer(ts));
            }
            ActivityWindow::CreatedAfter(ts) => {
                sql.push_str(" AND creation_date > ?");
                values.push(Value::Integer(ts));
            }
        }
        if let Some(languages) = languages {
            if languages.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; languages.len()].join(", ");
            sql.push_str(&format!(" AND language IN ({placeholders})"));
            values.extend(languages.iter().cloned().map(Value::Text));
        }
        sql.push_str(" ORDER BY id ASC");
        self.query(&sql, values)
    }

    fn list_topics(&self) -> Result<Vec<PostRecord>> {
        self.query(
            &format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE parent_fingerprint IS NULL ORDER BY subject ASC"
            ),
            Vec::new(),
        )
    }

    fn list_children(&self, parent: &str, created_after: Option<i64>) -> Result<Vec<PostRecord>> {
        let (clause, values) = children_filter(parent, created_after);
        self.query(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE {clause} ORDER BY creation_date DESC"),
            values,
        )
    }

    fn list_children_by_votes(
        &self,
        parent: &str,
        created_after: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<PostRecord>> {
        let (clause, mut values) = children_filter(parent, created_after);
        let mut sql = format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE {clause} ORDER BY upvote_count DESC, creation_date DESC"
        );
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        self.query(&sql, values)
    }

    fn count_children(&self, parent: &str, created_after: Option<i64>) -> Result<i64> {
        let (clause, values) = children_filter(parent, created_after);
        self.count(&format!("SELECT COUNT(*) FROM posts WHERE {clause}"), values)
    }

    fn count_topics(&self) -> Result<i64> {
        self.count(
            "SELECT COUNT(*) FROM posts WHERE parent_fingerprint IS NULL",
            Vec::new(),
        )
    }

    fn count_subjects(&self) -> Result<i64> {
        self.count(
            "SELECT COUNT(*) FROM posts WHERE parent_fingerprint IS NOT NULL AND subject IS NOT NULL AND subject != ''",
            Vec::new(),
        )
    }

    fn list_popular_subjects(&self, limit: usize) -> Result<Vec<PostRecord>> {
        self.query(
            &format!(
                "SELECT {POST_COLUMNS} FROM posts \
                 WHERE parent_fingerprint IS NOT NULL AND subject IS NOT NULL AND subject != '' \
                 ORDER BY rank_score DESC LIMIT ?"
            ),
            vec![Value::Integer(limit as i64)],
        )
    }

    fn list_topics_in(&self, fingerprints: &[String], limit: usize) -> Result<Vec<PostRecord>> {
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; fingerprints.len()].join(", ");
        let mut values: Vec<Value> = fingerprints.iter().cloned().map(Value::Text).collect();
        values.push(Value::Integer(limit as i64));
        self.query(
            &format!(
                "SELECT {POST_COLUMNS} FROM posts \
                 WHERE parent_fingerprint IS NULL AND fingerprint IN ({placeholders}) \
                 ORDER BY subject ASC LIMIT ?"
            ),
            values,
        )
    }

    fn list_by_owner_username(&self, username: &str) -> Result<Vec<PostRecord>> {
        self.query(
            &format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE owner_username = ? ORDER BY creation_date DESC"
            ),
            vec![Value::Text(username.to_string())],
        )
    }

    fn list_saved(&self) -> Result<Vec<PostRecord>> {
        self.query(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE saved = 1 ORDER BY creation_date DESC"),
            Vec::new(),
        )
    }

    fn list_locally_created(&self) -> Result<Vec<PostRecord>> {
        self.query(
            &format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE locally_created = 1 ORDER BY creation_date DESC"
            ),
            Vec::new(),
        )
    }

    fn list_replies(&self) -> Result<Vec<PostRecord>> {
        self.query(
            &format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE is_reply = 1 ORDER BY creation_date DESC"
            ),
            Vec::new(),
        )
    }

    fn count_replies(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM posts WHERE is_reply = 1", Vec::new())
    }

    fn clear_reply_flags(&self) -> Result<usize> {
        Ok(self
            .conn
            .execute("UPDATE posts SET is_reply = 0 WHERE is_reply = 1", [])?)
    }
}
