use super::{CommitItem, CommitReport, Hand, NodeUpdate, Origin, SyncStamp};
use crate::config::CommitConfig;
use crate::database::models::{NodeRecord, PostHeaderRecord, PostRecord, VoteRecord};
use crate::database::repositories::{
    NodeRepository, PostHeaderRepository, PostRepository, SqliteRepositories, VoteRepository,
};
use crate::database::{retry_busy, RetryPolicy};
use anyhow::Result;
use std::collections::{HashMap, HashSet};

/// Entities touched in the current cycle. Each is held once; a record with
/// an `id` already exists in storage and is updated on flush.
#[derive(Default)]
pub(super) struct Staging {
    pub(super) posts: Vec<PostRecord>,
    post_index: HashMap<String, usize>,
    headers: Vec<PostHeaderRecord>,
    header_index: HashSet<String>,
    pub(super) votes: Vec<VoteRecord>,
    vote_index: HashMap<(String, String), usize>,
    nodes: Vec<NodeRecord>,
    node_index: HashMap<String, usize>,
    /// Posts that did not exist anywhere before this cycle.
    pub(super) newcomers: Vec<String>,
    pub(super) replies: bool,
    /// Wall clock of the cycle, stamped on posts that arrive without a
    /// last vote date.
    now: i64,
}

impl Staging {
    pub(super) fn new(now: i64) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    pub(super) fn sanitize(&mut self, repos: &SqliteRepositories<'_>, item: CommitItem) -> Result<()> {
        match item {
            CommitItem::Post { record, origin } => self.add_post(repos, record, origin),
            CommitItem::Header(record) => self.add_header(repos, record),
            CommitItem::Vote(record) => self.add_vote(repos, record),
            CommitItem::Node(update) => self.add_node(repos, update),
        }
    }

    pub(super) fn post_position(&self, fingerprint: &str) -> Option<usize> {
        self.post_index.get(fingerprint).copied()
    }

    pub(super) fn stage_post(&mut self, record: PostRecord) -> usize {
        let position = self.posts.len();
        self.post_index.insert(record.fingerprint.clone(), position);
        self.posts.push(record);
        position
    }

    /// Finds a post in staging or loads it from storage into staging.
    pub(super) fn load_post(
        &mut self,
        repos: &SqliteRepositories<'_>,
        fingerprint: &str,
    ) -> Result<Option<usize>> {
        if let Some(position) = self.post_position(fingerprint) {
            return Ok(Some(position));
        }
        Ok(repos
            .posts()
            .get(fingerprint)?
            .map(|record| self.stage_post(record)))
    }

    fn add_post(
        &mut self,
        repos: &SqliteRepositories<'_>,
        mut record: PostRecord,
        origin: Origin,
    ) -> Result<()> {
        if record.fingerprint.is_empty() {
            return Ok(());
        }
        if self.post_index.contains_key(&record.fingerprint)
            || repos.posts().exists(&record.fingerprint)?
        {
            return Ok(());
        }

        record.id = None;
        if origin == Origin::Remote {
            record.upvote_count = 0;
            record.downvote_count = 0;
            record.reply_count = 0;
            record.upvoted = false;
            record.downvoted = false;
            record.saved = false;
            record.is_reply = false;
            record.locally_created = false;
            record.rank_score = 0.0;
        }
        if record.last_vote_date.is_none() {
            record.last_vote_date = Some(self.now);
        }
        record.neutral = true;
        record.neutral_count = 1;
        record.dirty = true;

        self.newcomers.push(record.fingerprint.clone());
        self.stage_post(record);
        Ok(())
    }

    fn add_header(&mut self, repos: &SqliteRepositories<'_>, mut record: PostHeaderRecord) -> Result<()> {
        if record.fingerprint.is_empty()
            || self.header_index.contains(&record.fingerprint)
            || repos.headers().exists(&record.fingerprint)?
        {
            return Ok(());
        }
        record.id = None;
        self.header_index.insert(record.fingerprint.clone());
        self.headers.push(record);
        Ok(())
    }

    /// Votes are mutable per node: a repeat overwrites the direction.
    fn add_vote(&mut self, repos: &SqliteRepositories<'_>, record: VoteRecord) -> Result<()> {
        let key = (record.target_fingerprint.clone(), record.node_id.clone());
        if let Some(&position) = self.vote_index.get(&key) {
            let pending = &mut self.votes[position];
            if pending.direction != record.direction {
                tracing::debug!(
                    target_fingerprint = %pending.target_fingerprint,
                    from = pending.direction,
                    to = record.direction,
                    "vote flipped"
                );
            }
            pending.direction = record.direction;
            return Ok(());
        }

        let staged = match repos.votes().get(&key.0, &key.1)? {
            Some(mut existing) => {
                existing.direction = record.direction;
                existing
            }
            None => VoteRecord { id: None, ..record },
        };
        self.vote_index.insert(key, self.votes.len());
        self.votes.push(staged);
        Ok(())
    }

    fn add_node(&mut self, repos: &SqliteRepositories<'_>, update: NodeUpdate) -> Result<()> {
        if update.node_id.is_empty() {
            return Ok(());
        }
        let position = match self.node_index.get(&update.node_id) {
            Some(&position) => position,
            None => {
                let record = repos
                    .nodes()
                    .get(&update.node_id)?
                    .unwrap_or_else(|| NodeRecord::new(update.node_id.clone()));
                self.node_index
                    .insert(update.node_id.clone(), self.nodes.len());
                self.nodes.push(record);
                self.nodes.len() - 1
            }
        };
        merge_node(&mut self.nodes[position], &update);
        Ok(())
    }

    /// Writes everything in the current transaction. A failing item is
    /// retried while the store is busy, then dropped.
    pub(super) fn flush(self, repos: &SqliteRepositories<'_>, config: &CommitConfig) -> CommitReport {
        let policy = RetryPolicy {
            attempts: config.busy_retries.max(1),
            backoff: config.busy_backoff,
        };
        let mut report = CommitReport {
            replies: self.replies,
            ..CommitReport::default()
        };

        for post in &self.posts {
            let result = retry_busy(policy, || match post.id {
                Some(_) => repos.posts().update(post),
                None => repos.posts().insert(post).map(|_| ()),
            });
            tally(&mut report.posts, &mut report.failed, result, "post", &post.fingerprint);
        }
        for header in &self.headers {
            let result = retry_busy(policy, || repos.headers().insert(header).map(|_| ()));
            tally(&mut report.headers, &mut report.failed, result, "header", &header.fingerprint);
        }
        for vote in &self.votes {
            let result = retry_busy(policy, || match vote.id {
                Some(id) => repos.votes().update_direction(id, vote.direction),
                None => repos.votes().insert(vote).map(|_| ()),
            });
            tally(&mut report.votes, &mut report.failed, result, "vote", &vote.target_fingerprint);
        }
        for node in &self.nodes {
            let result = retry_busy(policy, || match node.id {
                Some(_) => repos.nodes().update(node),
                None => repos.nodes().insert(node).map(|_| ()),
            });
            tally(&mut report.nodes, &mut report.failed, result, "node", &node.node_id);
        }
        report
    }
}

fn tally(ok: &mut usize, failed: &mut usize, result: Result<()>, kind: &str, key: &str) {
    match result {
        Ok(()) => *ok += 1,
        Err(err) => {
            *failed += 1;
            tracing::error!(error = ?err, kind, key, "dropping item after storage failure");
        }
    }
}

/// First-hand updates only touch connected fields and the sync stamp;
/// gossip only touches retrieved fields. Absent values never erase.
pub(super) fn merge_node(node: &mut NodeRecord, update: &NodeUpdate) {
    match update.hand {
        Hand::First => {
            if let Some(ip) = &update.ip {
                node.last_connected_ip = Some(ip.clone());
            }
            if let Some(port) = update.port {
                node.last_connected_port = Some(port);
            }
            if let Some(seen_at) = update.seen_at {
                node.last_connected_date = Some(seen_at);
            }
            match update.sync_timestamp {
                SyncStamp::Keep => {}
                SyncStamp::Set(ts) => node.last_sync_timestamp = Some(ts),
                SyncStamp::Clear => node.last_sync_timestamp = None,
            }
        }
        Hand::Second => {
            if let Some(ip) = &update.ip {
                node.last_retrieved_ip = Some(ip.clone());
            }
            if let Some(port) = update.port {
                node.last_retrieved_port = Some(port);
            }
            if let Some(seen_at) = update.seen_at {
                node.last_retrieved_date = Some(seen_at);
            }
        }
    }
}
