pub mod models;
pub mod repositories;

use crate::config::AetherPaths;
use crate::error::SyncError;
use anyhow::{anyhow, Result};
use rusqlite::{Connection, ErrorCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const MIGRATIONS: &str = r#"
    PRAGMA journal_mode = WAL;

    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS posts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL,
        parent_fingerprint TEXT,
        subject TEXT,
        body TEXT,
        owner_username TEXT,
        owner_fingerprint TEXT,
        language TEXT,
        protocol_version INTEGER,
        creation_date INTEGER,
        last_vote_date INTEGER,
        upvote_count INTEGER NOT NULL DEFAULT 0,
        downvote_count INTEGER NOT NULL DEFAULT 0,
        neutral_count INTEGER NOT NULL DEFAULT 0,
        reply_count INTEGER NOT NULL DEFAULT 0,
        upvoted INTEGER NOT NULL DEFAULT 0,
        downvoted INTEGER NOT NULL DEFAULT 0,
        neutral INTEGER NOT NULL DEFAULT 0,
        saved INTEGER NOT NULL DEFAULT 0,
        is_reply INTEGER NOT NULL DEFAULT 0,
        locally_created INTEGER NOT NULL DEFAULT 0,
        dirty INTEGER NOT NULL DEFAULT 0,
        rank_score REAL NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS post_headers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL,
        parent_fingerprint TEXT,
        language TEXT,
        dirty INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS votes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        target_fingerprint TEXT NOT NULL,
        node_id TEXT NOT NULL,
        direction INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        last_connected_ip TEXT,
        last_connected_port INTEGER,
        last_connected_date INTEGER,
        last_retrieved_ip TEXT,
        last_retrieved_port INTEGER,
        last_retrieved_date INTEGER,
        last_sync_timestamp INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_posts_fingerprint ON posts(fingerprint);
    CREATE INDEX IF NOT EXISTS idx_posts_parent ON posts(parent_fingerprint);
    CREATE INDEX IF NOT EXISTS idx_posts_last_vote ON posts(last_vote_date);
    CREATE INDEX IF NOT EXISTS idx_post_headers_fingerprint ON post_headers(fingerprint);
    CREATE INDEX IF NOT EXISTS idx_votes_target_node ON votes(target_fingerprint, node_id);
    CREATE INDEX IF NOT EXISTS idx_nodes_node_id ON nodes(node_id);
"#;

/// Retry ceiling and backoff for writes that hit a busy or locked store.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    newly_created: bool,
}

impl Database {
    pub fn connect(paths: &AetherPaths) -> Result<Self> {
        let newly_created = !paths.db_path.exists();
        let conn = Connection::open(&paths.db_path)?;
        conn.busy_timeout(Duration::from_millis(250))?;
        Ok(Self::from_connection(conn, newly_created))
    }

    pub fn from_connection(conn: Connection, newly_created: bool) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            newly_created,
        }
    }

    /// Opens a private in-memory store with the schema applied.
    pub fn open_in_memory() -> Result<Self> {
        let database = Self::from_connection(Connection::open_in_memory()?, true);
        database.ensure_migrations()?;
        Ok(database)
    }

    /// Applies the schema. Returns whether the database file was created by
    /// this process.
    pub fn ensure_migrations(&self) -> Result<bool> {
        self.with_conn(|conn| {
            conn.execute_batch(MIGRATIONS)?;
            Ok(())
        })?;
        Ok(self.newly_created)
    }

    pub fn with_repositories<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(repositories::SqliteRepositories<'_>) -> Result<T>,
    {
        self.with_conn(|conn| {
            let repos = repositories::SqliteRepositories::new(conn);
            f(repos)
        })
    }

    /// Runs `f` inside one transaction. The transaction rolls back when `f`
    /// fails or panics.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(repositories::SqliteRepositories<'_>) -> Result<T>,
    {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let value = f(repositories::SqliteRepositories::new(&tx))?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))?;
        f(&guard)
    }
}

/// Whether any cause in the chain is SQLite reporting a busy or locked store.
pub fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

/// Repeats `op` while the store reports busy, sleeping `policy.backoff`
/// between attempts. Other errors are returned immediately.
pub fn retry_busy<T, F>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                if attempt >= policy.attempts {
                    return Err(err.context(SyncError::StorageBusy { attempts: attempt }));
                }
                tracing::debug!(attempt, "storage busy, retrying");
                std::thread::sleep(policy.backoff);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
