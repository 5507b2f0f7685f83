//! Serialized batch writer for everything arriving from peers or the local
//! user.
//!
//! Producers call [`Committer::enqueue`] (never blocks). Each
//! [`Committer::commit`] drains whatever has queued so far, deduplicates it
//! against staging and storage, recomputes vote-derived state, and flushes
//! the batch in one transaction. Items that arrive during a cycle wait for
//! the next one.

mod maintenance;
mod staging;

use crate::config::CommitConfig;
use crate::database::models::{PostHeaderRecord, PostRecord, VoteRecord};
use crate::database::Database;
use crate::signals::{Signal, SignalBus};
use crate::utils::now_unix;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub use maintenance::rank_score;

/// Where a queued post came from. Remote posts lose all local-only state
/// before they are staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hand {
    /// This node talked to the peer directly.
    First,
    /// Learned from another peer's directory.
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStamp {
    Keep,
    Set(i64),
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub node_id: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub seen_at: Option<i64>,
    pub hand: Hand,
    pub sync_timestamp: SyncStamp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitItem {
    Post { record: PostRecord, origin: Origin },
    Header(PostHeaderRecord),
    Vote(VoteRecord),
    Node(NodeUpdate),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub posts: usize,
    pub headers: usize,
    pub votes: usize,
    pub nodes: usize,
    /// Items dropped after a storage failure.
    pub failed: usize,
    pub replies: bool,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.posts + self.headers + self.votes + self.nodes + self.failed == 0
    }
}

#[derive(Clone)]
pub struct Committer {
    database: Database,
    config: CommitConfig,
    signals: SignalBus,
    tx: mpsc::UnboundedSender<CommitItem>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<CommitItem>>>,
}

impl Committer {
    pub fn new(database: Database, config: CommitConfig, signals: SignalBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            database,
            config,
            signals,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn enqueue(&self, item: CommitItem) {
        if self.tx.send(item).is_err() {
            tracing::warn!("commit queue closed, item dropped");
        }
    }

    pub fn add_post(&self, record: PostRecord, origin: Origin) {
        self.enqueue(CommitItem::Post { record, origin });
    }

    pub fn add_header(&self, record: PostHeaderRecord) {
        self.enqueue(CommitItem::Header(record));
    }

    pub fn add_vote(&self, record: VoteRecord) {
        self.enqueue(CommitItem::Vote(record));
    }

    pub fn add_node(&self, update: NodeUpdate) {
        self.enqueue(CommitItem::Node(update));
    }

    /// Runs one cycle. Concurrent callers queue behind each other.
    pub async fn commit(&self) -> Result<CommitReport> {
        let mut rx = self.rx.lock().await;
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }

        let database = self.database.clone();
        let config = self.config.clone();
        let report = tokio::task::spawn_blocking(move || {
            run_cycle(&database, &config, items, now_unix())
        })
        .await
        .context("commit worker panicked")??;
        drop(rx);

        if !report.is_empty() {
            tracing::info!(
                posts = report.posts,
                headers = report.headers,
                votes = report.votes,
                nodes = report.nodes,
                failed = report.failed,
                "commit cycle finished"
            );
        }
        if report.replies {
            self.signals.emit(Signal::ThereAreReplies);
        }
        Ok(report)
    }
}

/// One full cycle over `items`, evaluated at wall-clock `now`.
pub(crate) fn run_cycle(
    database: &Database,
    config: &CommitConfig,
    items: Vec<CommitItem>,
    now: i64,
) -> Result<CommitReport> {
    database.with_transaction(|repos| {
        let mut staging = staging::Staging::new(now);
        for item in items {
            if let Err(err) = staging.sanitize(&repos, item) {
                tracing::warn!(error = ?err, "failed to sanitize queued item");
            }
        }
        maintenance::dirty_vote_targets(&repos, &mut staging)?;
        maintenance::resolve_votes_and_flags(&repos, &mut staging, config, now)?;
        maintenance::increment_reply_counts(&repos, &mut staging, config.max_ancestor_depth)?;
        Ok(staging.flush(&repos, config))
    })
}

#[cfg(test)]
mod tests;
