//! Per-peer protocol state.
//!
//! A [`Connection`] tracks this node's pull from one peer: handshake, then
//! headers, then the posts those headers reference, then the peer's node
//! directory. Serving the peer's own pull is stateless and happens beside
//! it. The struct does no I/O; the session loop feeds it events and acts
//! on the returned [`Step`].

use crate::committer::SyncStamp;
use std::collections::HashSet;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Newborn,
    Handshake,
    Header,
    Post,
    Node,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This node dialed.
    Outbound,
    /// The peer dialed.
    Inbound,
}

/// What the session should send next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    RequestPosts(Vec<String>),
    RequestNodes,
    /// The local pull is over: announce the sync timestamp.
    Finish,
    Wait,
}

/// What the overseer does with a connection after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    ForceAdvance,
    Abort,
}

#[derive(Debug)]
pub struct Connection {
    role: Role,
    state: ConnectionState,
    peer: Option<String>,
    remote_finished: bool,
    local_finished: bool,
    sync_invalidated: bool,
    received_sync_timestamp: Option<i64>,
    header_total: Option<usize>,
    header_packets: HashSet<usize>,
    needed_posts: Vec<String>,
    needed_index: HashSet<String>,
    posts_requested: usize,
    posts_arrived: usize,
    node_total: Option<usize>,
    node_packets: HashSet<usize>,
    last_activity: Instant,
}

impl Connection {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ConnectionState::Newborn,
            peer: None,
            remote_finished: false,
            local_finished: false,
            sync_invalidated: false,
            received_sync_timestamp: None,
            header_total: None,
            header_packets: HashSet::new(),
            needed_posts: Vec::new(),
            needed_index: HashSet::new(),
            posts_requested: 0,
            posts_arrived: 0,
            node_total: None,
            node_packets: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn is_established(&self) -> bool {
        self.peer.is_some()
    }

    pub fn sync_invalidated(&self) -> bool {
        self.sync_invalidated
    }

    pub fn needed_posts(&self) -> &[String] {
        &self.needed_posts
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// The dialer has sent its handshake and waits for the reply.
    pub fn handshake_sent(&mut self) {
        if self.state == ConnectionState::Newborn {
            self.state = ConnectionState::Handshake;
        }
    }

    /// Both identities are known; the local pull starts with headers.
    pub fn establish(&mut self, peer: String) {
        self.peer = Some(peer);
        self.state = ConnectionState::Header;
    }

    /// Records one header packet and the not-yet-stored fingerprints it
    /// referenced. Returns true once every announced packet has arrived.
    /// Packets outside the header stage are ignored.
    pub fn record_header_packet<I>(&mut self, total: usize, current: usize, needed: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        if self.state != ConnectionState::Header {
            return false;
        }
        self.header_total = Some(total.max(1));
        self.header_packets.insert(current);
        for fingerprint in needed {
            if self.needed_index.insert(fingerprint.clone()) {
                self.needed_posts.push(fingerprint);
            }
        }
        self.header_packets.len() >= self.header_total.unwrap_or(1)
    }

    pub fn complete_headers(&mut self) -> Step {
        if self.needed_posts.is_empty() {
            self.state = ConnectionState::Node;
            Step::RequestNodes
        } else {
            self.state = ConnectionState::Post;
            self.posts_requested = self.needed_posts.len();
            Step::RequestPosts(self.needed_posts.clone())
        }
    }

    /// Returns true once every requested post has been answered.
    pub fn record_post_arrival(&mut self) -> bool {
        if self.state != ConnectionState::Post {
            return false;
        }
        self.posts_arrived += 1;
        self.posts_arrived >= self.posts_requested
    }

    pub fn complete_posts(&mut self) -> Step {
        self.state = ConnectionState::Node;
        Step::RequestNodes
    }

    pub fn record_node_packet(&mut self, total: usize, current: usize) -> bool {
        if self.state != ConnectionState::Node || self.local_finished {
            return false;
        }
        self.node_total = Some(total.max(1));
        self.node_packets.insert(current);
        self.node_packets.len() >= self.node_total.unwrap_or(1)
    }

    pub fn complete_nodes(&mut self) -> Step {
        self.local_finished = true;
        Step::Finish
    }

    /// The peer announced the end of its pull. Returns whether the
    /// connection can close now.
    pub fn mark_remote_finished(&mut self, sync_timestamp: i64) -> bool {
        self.remote_finished = true;
        self.received_sync_timestamp = Some(sync_timestamp);
        self.ready_to_close()
    }

    pub fn ready_to_close(&self) -> bool {
        self.local_finished && self.remote_finished
    }

    /// Moves past a stalled stage as if its count had been reached. The
    /// sync timestamp is invalidated so the next session pulls in full.
    pub fn force_advance(&mut self) -> Step {
        match self.state {
            ConnectionState::Header => {
                self.sync_invalidated = true;
                self.complete_headers()
            }
            ConnectionState::Post => {
                self.sync_invalidated = true;
                self.complete_posts()
            }
            ConnectionState::Node if !self.local_finished => {
                self.sync_invalidated = true;
                self.complete_nodes()
            }
            _ => Step::Wait,
        }
    }

    /// Closes the connection and returns the sync timestamp update owed to
    /// the peer's node row, if the peer is known.
    pub fn close(&mut self) -> Option<(String, SyncStamp)> {
        self.state = ConnectionState::Closed;
        let peer = self.peer.clone()?;
        let stamp = if self.sync_invalidated || !self.local_finished {
            SyncStamp::Clear
        } else if let Some(ts) = self.received_sync_timestamp {
            SyncStamp::Set(ts)
        } else {
            SyncStamp::Keep
        };
        Some((peer, stamp))
    }
}

/// Overseer policy for one connection. `abort_after` applies in every
/// state; past `stall_after` a connection that never finished its
/// handshake is aborted and one in a transfer stage is force-advanced.
pub fn verdict(
    state: ConnectionState,
    idle: Duration,
    stall_after: Duration,
    abort_after: Duration,
) -> Verdict {
    if state == ConnectionState::Closed {
        return Verdict::Keep;
    }
    if idle > abort_after {
        return Verdict::Abort;
    }
    if idle <= stall_after {
        return Verdict::Keep;
    }
    match state {
        ConnectionState::Newborn | ConnectionState::Handshake => Verdict::Abort,
        ConnectionState::Header | ConnectionState::Post | ConnectionState::Node => {
            Verdict::ForceAdvance
        }
        ConnectionState::Closed => Verdict::Keep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fps(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    const STALL: Duration = Duration::from_secs(10);
    const ABORT: Duration = Duration::from_secs(30);

    #[test]
    fn full_pull_walks_every_stage() {
        let mut conn = Connection::new(Role::Outbound);
        conn.handshake_sent();
        assert_eq!(conn.state(), ConnectionState::Handshake);
        conn.establish("peer".into());
        assert_eq!(conn.state(), ConnectionState::Header);

        assert!(!conn.record_header_packet(3, 1, fps(&["a", "b"])));
        assert!(!conn.record_header_packet(3, 2, fps(&["b", "c"])));
        assert!(conn.record_header_packet(3, 3, Vec::new()));
        assert_eq!(conn.complete_headers(), Step::RequestPosts(fps(&["a", "b", "c"])));

        assert!(!conn.record_post_arrival());
        assert!(!conn.record_post_arrival());
        assert!(conn.record_post_arrival());
        assert_eq!(conn.complete_posts(), Step::RequestNodes);

        assert!(conn.record_node_packet(1, 1));
        assert_eq!(conn.complete_nodes(), Step::Finish);
        assert!(!conn.ready_to_close());
        assert!(conn.mark_remote_finished(500));

        assert_eq!(conn.close(), Some(("peer".into(), SyncStamp::Set(500))));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn no_needed_posts_skips_to_nodes() {
        let mut conn = Connection::new(Role::Inbound);
        conn.establish("peer".into());
        assert!(conn.record_header_packet(1, 1, Vec::new()));
        assert_eq!(conn.complete_headers(), Step::RequestNodes);
        assert_eq!(conn.state(), ConnectionState::Node);
    }

    #[test]
    fn stalled_header_stage_advances_with_partial_list() {
        let mut conn = Connection::new(Role::Outbound);
        conn.establish("peer".into());
        conn.record_header_packet(3, 1, fps(&["a"]));
        conn.record_header_packet(3, 2, fps(&["b"]));

        let idle = Duration::from_secs(11);
        assert_eq!(verdict(conn.state(), idle, STALL, ABORT), Verdict::ForceAdvance);
        assert_eq!(conn.force_advance(), Step::RequestPosts(fps(&["a", "b"])));
        assert_eq!(conn.state(), ConnectionState::Post);
        assert!(conn.sync_invalidated());

        // a late third packet no longer counts
        assert!(!conn.record_header_packet(3, 3, fps(&["z"])));
        assert_eq!(conn.needed_posts(), &fps(&["a", "b"])[..]);
    }

    #[test]
    fn invalidated_pull_clears_the_stored_timestamp() {
        let mut conn = Connection::new(Role::Outbound);
        conn.establish("peer".into());
        conn.record_header_packet(1, 1, Vec::new());
        conn.complete_headers();
        assert_eq!(conn.force_advance(), Step::Finish);
        conn.mark_remote_finished(900);
        assert_eq!(conn.close(), Some(("peer".into(), SyncStamp::Clear)));
    }

    #[test]
    fn unfinished_pull_clears_and_unknown_peer_owes_nothing() {
        let mut conn = Connection::new(Role::Inbound);
        assert_eq!(conn.close(), None);

        let mut conn = Connection::new(Role::Inbound);
        conn.establish("peer".into());
        conn.mark_remote_finished(42);
        assert_eq!(conn.close(), Some(("peer".into(), SyncStamp::Clear)));
    }

    #[test]
    fn finished_without_remote_timestamp_keeps_the_old_one() {
        let mut conn = Connection::new(Role::Outbound);
        conn.establish("peer".into());
        conn.record_header_packet(1, 1, Vec::new());
        conn.complete_headers();
        conn.record_node_packet(1, 1);
        conn.complete_nodes();
        assert_eq!(conn.close(), Some(("peer".into(), SyncStamp::Keep)));
    }

    #[test]
    fn force_advance_after_local_finish_waits() {
        let mut conn = Connection::new(Role::Outbound);
        conn.establish("peer".into());
        conn.record_header_packet(1, 1, Vec::new());
        conn.complete_headers();
        conn.record_node_packet(1, 1);
        conn.complete_nodes();
        assert_eq!(conn.force_advance(), Step::Wait);
        assert!(!conn.sync_invalidated());
    }

    #[test]
    fn overseer_policy() {
        let short = Duration::from_secs(5);
        let stalled = Duration::from_secs(11);
        let dead = Duration::from_secs(31);

        assert_eq!(verdict(ConnectionState::Post, short, STALL, ABORT), Verdict::Keep);
        assert_eq!(verdict(ConnectionState::Handshake, stalled, STALL, ABORT), Verdict::Abort);
        assert_eq!(verdict(ConnectionState::Newborn, stalled, STALL, ABORT), Verdict::Abort);
        assert_eq!(verdict(ConnectionState::Node, stalled, STALL, ABORT), Verdict::ForceAdvance);
        assert_eq!(verdict(ConnectionState::Node, dead, STALL, ABORT), Verdict::Abort);
        assert_eq!(verdict(ConnectionState::Closed, dead, STALL, ABORT), Verdict::Keep);
    }
}
