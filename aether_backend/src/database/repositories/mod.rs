mod headers;
mod nodes;
mod posts;
mod settings;
mod votes;

use super::models::{NodeRecord, PostHeaderRecord, PostRecord, VoteRecord};
use anyhow::Result;
use rusqlite::Connection;

/// Which posts a header exchange draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostFlag {
    Upvoted,
    Neutral,
    Downvoted,
    Topic,
}

/// Time bound applied to a header exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityWindow {
    /// Posts whose last vote date is at or after the timestamp.
    VotedSince(i64),
    /// Posts created strictly after the timestamp.
    CreatedAfter(i64),
}

pub trait PostRepository {
    fn insert(&self, record: &PostRecord) -> Result<i64>;
    fn update(&self, record: &PostRecord) -> Result<()>;
    /// Looks a post up by fingerprint. Duplicate rows are collapsed to the
    /// newest one as a side effect.
    fn get(&self, fingerprint: &str) -> Result<Option<PostRecord>>;
    fn exists(&self, fingerprint: &str) -> Result<bool>;
    fn delete(&self, id: i64) -> Result<()>;
    fn list_dirty(&self) -> Result<Vec<PostRecord>>;
    fn list_for_sync(
        &self,
        flag: PostFlag,
        window: ActivityWindow,
        languages: Option<&[String]>,
    ) -> Result<Vec<PostRecord>>;
    fn list_topics(&self) -> Result<Vec<PostRecord>>;
    /// Direct children, newest first.
    fn list_children(&self, parent: &str, created_after: Option<i64>) -> Result<Vec<PostRecord>>;
    /// Direct children, most upvoted first.
    fn list_children_by_votes(
        &self,
        parent: &str,
        created_after: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<PostRecord>>;
    fn count_children(&self, parent: &str, created_after: Option<i64>) -> Result<i64>;
    fn count_topics(&self) -> Result<i64>;
    fn count_subjects(&self) -> Result<i64>;
    fn list_popular_subjects(&self, limit: usize) -> Result<Vec<PostRecord>>;
    fn list_topics_in(&self, fingerprints: &[String], limit: usize) -> Result<Vec<PostRecord>>;
    fn list_by_owner_username(&self, username: &str) -> Result<Vec<PostRecord>>;
    fn list_saved(&self) -> Result<Vec<PostRecord>>;
    fn list_locally_created(&self) -> Result<Vec<PostRecord>>;
    fn list_replies(&self) -> Result<Vec<PostRecord>>;
    fn count_replies(&self) -> Result<i64>;
    fn clear_reply_flags(&self) -> Result<usize>;
}

pub trait PostHeaderRepository {
    fn insert(&self, record: &PostHeaderRecord) -> Result<i64>;
    fn get(&self, fingerprint: &str) -> Result<Option<PostHeaderRecord>>;
    fn exists(&self, fingerprint: &str) -> Result<bool>;
}

pub trait VoteRepository {
    fn insert(&self, record: &VoteRecord) -> Result<i64>;
    fn update_direction(&self, id: i64, direction: i64) -> Result<()>;
    fn get(&self, target_fingerprint: &str, node_id: &str) -> Result<Option<VoteRecord>>;
    fn list_for_target(&self, target_fingerprint: &str) -> Result<Vec<VoteRecord>>;
    fn delete(&self, id: i64) -> Result<()>;
}

pub trait NodeRepository {
    fn insert(&self, record: &NodeRecord) -> Result<i64>;
    fn update(&self, record: &NodeRecord) -> Result<()>;
    fn get(&self, node_id: &str) -> Result<Option<NodeRecord>>;
    fn get_local(&self) -> Result<Option<NodeRecord>>;
    /// Directly connected peers last seen before `cutoff`, most recent first.
    fn list_connected_before(&self, cutoff: i64, limit: usize) -> Result<Vec<NodeRecord>>;
    /// Peers only known through gossip, most recently learned first.
    fn list_retrieved_only(&self, limit: usize) -> Result<Vec<NodeRecord>>;
    /// Peer directory served to other nodes. `since` bounds by activity and
    /// `floor` caps the age; `None` returns every remote node.
    fn list_directory(&self, since: Option<i64>, floor: i64) -> Result<Vec<NodeRecord>>;
    fn count_remote(&self) -> Result<i64>;
    fn count_connected_since(&self, since: i64) -> Result<i64>;
    fn last_connection_time(&self) -> Result<Option<i64>>;
}

pub trait SettingsRepository {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

pub struct SqliteRepositories<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRepositories<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn posts(&self) -> impl PostRepository + '_ {
        posts::SqlitePostRepository { conn: self.conn }
    }

    pub fn headers(&self) -> impl PostHeaderRepository + '_ {
        headers::SqlitePostHeaderRepository { conn: self.conn }
    }

    pub fn votes(&self) -> impl VoteRepository + '_ {
        votes::SqliteVoteRepository { conn: self.conn }
    }

    pub fn nodes(&self) -> impl NodeRepository + '_ {
        nodes::SqliteNodeRepository { conn: self.conn }
    }

    pub fn settings(&self) -> impl SettingsRepository + '_ {
        settings::SqliteSettingsRepository { conn: self.conn }
    }

    pub fn conn(&self) -> &'conn Connection {
        self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MIGRATIONS;
    use rusqlite::params;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        conn.execute_batch(MIGRATIONS).expect("base migrations");
        conn
    }

    fn post(fingerprint: &str, parent: Option<&str>) -> PostRecord {
        let mut record = PostRecord::blank(fingerprint);
        record.parent_fingerprint = parent.map(str::to_string);
        record.subject = Some(format!("subject {fingerprint}"));
        record.language = Some("English".into());
        record.creation_date = Some(1_000);
        record.last_vote_date = Some(1_000);
        record
    }

    #[test]
    fn post_round_trip_and_update() {
        let conn = setup_conn();
        let repos = SqliteRepositories::new(&conn);

        let mut record = post("fp-1", None);
        let id = repos.posts().insert(&record).unwrap();
        record.id = Some(id);
        record.reply_count = 3;
        record.saved = true;
        repos.posts().update(&record).unwrap();

        let fetched = repos.posts().get("fp-1").unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(repos.posts().exists("fp-1").unwrap());
        assert!(!repos.posts().exists("fp-2").unwrap());
    }

    #[test]
    fn duplicate_post_rows_collapse_to_newest() {
        let conn = setup_conn();
        let repos = SqliteRepositories::new(&conn);

        let mut older = post("dup", None);
        older.reply_count = 1;
        repos.posts().insert(&older).unwrap();
        let mut newer = post("dup", None);
        newer.reply_count = 2;
        let newer_id = repos.posts().insert(&newer).unwrap();

        let fetched = repos.posts().get("dup").unwrap().unwrap();
        assert_eq!(fetched.id, Some(newer_id));
        assert_eq!(fetched.reply_count, 2);

        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM posts WHERE fingerprint = ?1",
                params!["dup"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn sync_listing_filters_by_flag_window_and_language() {
        let conn = setup_conn();
        let repos = SqliteRepositories::new(&conn);

        let mut upvoted = post("up", Some("topic"));
        upvoted.upvoted = true;
        upvoted.last_vote_date = Some(5_000);
        repos.posts().insert(&upvoted).unwrap();

        let mut stale = post("stale", Some("topic"));
        stale.upvoted = true;
        stale.last_vote_date = Some(10);
        repos.posts().insert(&stale).unwrap();

        let mut foreign = post("foreign", Some("topic"));
        foreign.upvoted = true;
        foreign.language = Some("German".into());
        foreign.last_vote_date = Some(5_000);
        repos.posts().insert(&foreign).unwrap();

        let langs = vec!["English".to_string()];
        let listed = repos
            .posts()
            .list_for_sync(PostFlag::Upvoted, ActivityWindow::VotedSince(1_000), Some(&langs))
            .unwrap();
        let fingerprints: Vec<_> = listed.iter().map(|p| p.fingerprint.as_str()).collect();
        assert_eq!(fingerprints, vec!["up"]);

        let all = repos
            .posts()
            .list_for_sync(PostFlag::Upvoted, ActivityWindow::CreatedAfter(0), None)
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn vote_lookup_and_direction_update() {
        let conn = setup_conn();
        let repos = SqliteRepositories::new(&conn);

        let id = repos
            .votes()
            .insert(&VoteRecord {
                id: None,
                target_fingerprint: "fp".into(),
                node_id: "node-a".into(),
                direction: 1,
            })
            .unwrap();
        repos.votes().update_direction(id, -1).unwrap();
        let vote = repos.votes().get("fp", "node-a").unwrap().unwrap();
        assert_eq!(vote.direction, -1);
        assert!(repos.votes().get("fp", "node-b").unwrap().is_none());
    }

    #[test]
    fn node_queries_skip_local_row() {
        let conn = setup_conn();
        let repos = SqliteRepositories::new(&conn);

        let mut local = NodeRecord::new("me");
        local.last_connected_ip = Some(crate::utils::LOCAL_IP_MARKER.into());
        local.last_connected_port = Some(4000);
        local.last_connected_date = Some(1);
        repos.nodes().insert(&local).unwrap();

        let mut connected = NodeRecord::new("peer-1");
        connected.last_connected_ip = Some("10.0.0.1".into());
        connected.last_connected_port = Some(5000);
        connected.last_connected_date = Some(100);
        repos.nodes().insert(&connected).unwrap();

        let mut gossiped = NodeRecord::new("peer-2");
        gossiped.last_retrieved_ip = Some("10.0.0.2".into());
        gossiped.last_retrieved_port = Some(5001);
        gossiped.last_retrieved_date = Some(200);
        repos.nodes().insert(&gossiped).unwrap();

        let candidates = repos.nodes().list_connected_before(1_000, 40).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_id, "peer-1");

        let retrieved = repos.nodes().list_retrieved_only(5).unwrap();
        assert_eq!(retrieved.len(), 1);
        assert_eq!(retrieved[0].node_id, "peer-2");

        assert_eq!(repos.nodes().list_directory(None, 0).unwrap().len(), 2);
        assert_eq!(repos.nodes().list_directory(Some(150), 0).unwrap().len(), 1);
        assert_eq!(repos.nodes().count_remote().unwrap(), 2);
        assert_eq!(repos.nodes().get_local().unwrap().unwrap().node_id, "me");
        assert_eq!(repos.nodes().last_connection_time().unwrap(), Some(100));
    }

    #[test]
    fn settings_overwrite() {
        let conn = setup_conn();
        let repos = SqliteRepositories::new(&conn);
        repos.settings().set("node_id", "a").unwrap();
        repos.settings().set("node_id", "b").unwrap();
        assert_eq!(repos.settings().get("node_id").unwrap().as_deref(), Some("b"));
        assert!(repos.settings().get("missing").unwrap().is_none());
    }
}
