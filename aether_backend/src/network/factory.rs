//! Registry of live sessions and the overseer that keeps them moving.

use super::connection::{verdict, ConnectionState, Role, Verdict};
use crate::error::SyncError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

/// Sent from the overseer to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    ForceAdvance,
    Abort,
}

#[derive(Debug)]
struct ConnectionEntry {
    role: Role,
    node_id: Option<String>,
    state: ConnectionState,
    last_activity: Instant,
    control: mpsc::UnboundedSender<Control>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OverseerReport {
    pub advanced: usize,
    pub aborted: usize,
    pub pruned: usize,
}

#[derive(Clone, Default)]
pub struct ConnectionFactory {
    connections: Arc<RwLock<HashMap<u64, ConnectionEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, role: Role) -> (u64, mpsc::UnboundedReceiver<Control>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(
            id,
            ConnectionEntry {
                role,
                node_id: None,
                state: ConnectionState::Newborn,
                last_activity: Instant::now(),
                control: tx,
            },
        );
        (id, rx)
    }

    pub async fn deregister(&self, id: u64) {
        self.connections.write().await.remove(&id);
    }

    /// A message arrived on `id`.
    pub async fn touch(&self, id: u64, state: ConnectionState) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.state = state;
            entry.last_activity = Instant::now();
        }
    }

    /// State moved without traffic, e.g. after a forced advance.
    pub async fn set_state(&self, id: u64, state: ConnectionState) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.state = state;
        }
    }

    /// Open inbound sessions, the caller's own included.
    pub async fn inbound_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|entry| entry.role == Role::Inbound && entry.state != ConnectionState::Closed)
            .count()
    }

    pub async fn open_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|entry| entry.state != ConnectionState::Closed)
            .count()
    }

    pub async fn is_connected(&self, node_id: &str) -> bool {
        self.connections.read().await.values().any(|entry| {
            entry.state != ConnectionState::Closed && entry.node_id.as_deref() == Some(node_id)
        })
    }

    /// Binds `node_id` to session `id`. Fails when another live session
    /// already talks to that node.
    pub async fn claim_peer(&self, id: u64, node_id: &str) -> Result<(), SyncError> {
        let mut connections = self.connections.write().await;
        let taken = connections.iter().any(|(other, entry)| {
            *other != id
                && entry.state != ConnectionState::Closed
                && entry.node_id.as_deref() == Some(node_id)
        });
        if taken {
            return Err(SyncError::DuplicateConnection {
                node_id: node_id.to_string(),
            });
        }
        if let Some(entry) = connections.get_mut(&id) {
            entry.node_id = Some(node_id.to_string());
        }
        Ok(())
    }

    /// One overseer pass: stalled sessions are told to advance or abort,
    /// closed ones are pruned. Aborted sessions leave the registry at once.
    pub async fn oversee(&self, stall_after: Duration, abort_after: Duration) -> OverseerReport {
        let mut report = OverseerReport::default();
        let mut connections = self.connections.write().await;
        connections.retain(|id, entry| {
            if entry.state == ConnectionState::Closed || entry.control.is_closed() {
                report.pruned += 1;
                return false;
            }
            match verdict(entry.state, entry.last_activity.elapsed(), stall_after, abort_after) {
                Verdict::Keep => true,
                Verdict::ForceAdvance => {
                    if entry.control.send(Control::ForceAdvance).is_err() {
                        tracing::debug!(connection = id, "session gone before force-advance");
                        report.pruned += 1;
                        return false;
                    }
                    tracing::info!(connection = id, state = ?entry.state, node_id = ?entry.node_id, "force-advancing stalled connection");
                    report.advanced += 1;
                    true
                }
                Verdict::Abort => {
                    if entry.control.send(Control::Abort).is_err() {
                        tracing::debug!(connection = id, "session gone before abort");
                        report.pruned += 1;
                        return false;
                    }
                    tracing::warn!(connection = id, state = ?entry.state, node_id = ?entry.node_id, "aborting idle connection");
                    report.aborted += 1;
                    false
                }
            }
        });
        report
    }

    #[cfg(test)]
    async fn backdate(&self, id: u64, by: Duration) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            if let Some(earlier) = entry.last_activity.checked_sub(by) {
                entry.last_activity = earlier;
            }
        }
    }
}
