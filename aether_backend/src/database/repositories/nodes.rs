use crate::database::models::NodeRecord;
use crate::utils::LOCAL_IP_MARKER;
use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

const NODE_COLUMNS: &str = "id, node_id, last_connected_ip, last_connected_port, \
    last_connected_date, last_retrieved_ip, last_retrieved_port, last_retrieved_date, \
    last_sync_timestamp";

/// Excludes this node's own row.
const REMOTE_ONLY: &str = "(last_connected_ip IS NULL OR last_connected_ip != ?)";

pub(super) struct SqliteNodeRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

fn map_node(row: &Row<'_>) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        id: row.get(0)?,
        node_id: row.get(1)?,
        last_connected_ip: row.get(2)?,
        last_connected_port: row.get(3)?,
        last_connected_date: row.get(4)?,
        last_retrieved_ip: row.get(5)?,
        last_retrieved_port: row.get(6)?,
        last_retrieved_date: row.get(7)?,
        last_sync_timestamp: row.get(8)?,
    })
}

impl<'conn> SqliteNodeRepository<'conn> {
    fn query(&self, sql: &str, values: Vec<Value>) -> Result<Vec<NodeRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), map_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }

    fn local_marker() -> Value {
        Value::Text(LOCAL_IP_MARKER.to_string())
    }
}

impl<'conn> super::NodeRepository for SqliteNodeRepository<'conn> {
    fn insert(&self, record: &NodeRecord) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO nodes (node_id, last_connected_ip, last_connected_port, last_connected_date,
                last_retrieved_ip, last_retrieved_port, last_retrieved_date, last_sync_timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.node_id,
                record.last_connected_ip,
                record.last_connected_port,
                record.last_connected_date,
                record.last_retrieved_ip,
                record.last_retrieved_port,
                record.last_retrieved_date,
                record.last_sync_timestamp,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update(&self, record: &NodeRecord) -> Result<()> {
        let Some(id) = record.id else {
            anyhow::bail!("cannot update unsaved node {}", record.node_id);
        };
        self.conn.execute(
            r#"
            UPDATE nodes SET
                last_connected_ip = ?2,
                last_connected_port = ?3,
                last_connected_date = ?4,
                last_retrieved_ip = ?5,
                last_retrieved_port = ?6,
                last_retrieved_date = ?7,
                last_sync_timestamp = ?8
            WHERE id = ?1
            "#,
            params![
                id,
                record.last_connected_ip,
                record.last_connected_port,
                record.last_connected_date,
                record.last_retrieved_ip,
                record.last_retrieved_port,
                record.last_retrieved_date,
                record.last_sync_timestamp,
            ],
        )?;
        Ok(())
    }

    fn get(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        let mut nodes = self.query(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = ? ORDER BY id DESC"),
            vec![Value::Text(node_id.to_string())],
        )?;
        if nodes.len() > 1 {
            tracing::warn!(
                node_id,
                duplicates = nodes.len() - 1,
                "collapsing duplicate node rows"
            );
            for stale in nodes.drain(1..) {
                self.conn
                    .execute("DELETE FROM nodes WHERE id = ?1", params![stale.id])?;
            }
        }
        Ok(nodes.into_iter().next())
    }

    fn get_local(&self) -> Result<Option<NodeRecord>> {
        Ok(self
            .query(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM nodes WHERE last_connected_ip = ? ORDER BY id DESC LIMIT 1"
                ),
                vec![Self::local_marker()],
            )?
            .into_iter()
            .next())
    }

    fn list_connected_before(&self, cutoff: i64, limit: usize) -> Result<Vec<NodeRecord>> {
        self.query(
            &format!(
                "SELECT {NODE_COLUMNS} FROM nodes \
                 WHERE last_connected_ip IS NOT NULL AND {REMOTE_ONLY} AND last_connected_date < ? \
                 ORDER BY last_connected_date DESC LIMIT ?"
            ),
            vec![
                Self::local_marker(),
                Value::Integer(cutoff),
                Value::Integer(limit as i64),
            ],
        )
    }

    fn list_retrieved_only(&self, limit: usize) -> Result<Vec<NodeRecord>> {
        self.query(
            &format!(
                "SELECT {NODE_COLUMNS} FROM nodes \
                 WHERE last_connected_ip IS NULL AND last_retrieved_ip IS NOT NULL \
                 ORDER BY last_retrieved_date DESC LIMIT ?"
            ),
            vec![Value::Integer(limit as i64)],
        )
    }

    fn list_directory(&self, since: Option<i64>, floor: i64) -> Result<Vec<NodeRecord>> {
        match since {
            Some(since) => {
                let bound = since.max(floor);
                self.query(
                    &format!(
                        "SELECT {NODE_COLUMNS} FROM nodes WHERE {REMOTE_ONLY} \
                         AND (last_connected_date >= ? OR last_retrieved_date >= ?) \
                         ORDER BY id ASC"
                    ),
                    vec![
                        Self::local_marker(),
                        Value::Integer(bound),
                        Value::Integer(bound),
                    ],
                )
            }
            None => self.query(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE {REMOTE_ONLY} ORDER BY id ASC"),
                vec![Self::local_marker()],
            ),
        }
    }

    fn count_remote(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            &format!("SELECT COUNT(*) FROM nodes WHERE {REMOTE_ONLY}"),
            params![LOCAL_IP_MARKER],
            |row| row.get(0),
        )?)
    }

    fn count_connected_since(&self, since: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            &format!("SELECT COUNT(*) FROM nodes WHERE {REMOTE_ONLY} AND last_connected_date >= ?"),
            params![LOCAL_IP_MARKER, since],
            |row| row.get(0),
        )?)
    }

    fn last_connection_time(&self) -> Result<Option<i64>> {
        Ok(self.conn.query_row(
            &format!("SELECT MAX(last_connected_date) FROM nodes WHERE {REMOTE_ONLY}"),
            params![LOCAL_IP_MARKER],
            |row| row.get(0),
        )?)
    }
}
