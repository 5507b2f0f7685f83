//! Drives one peer session over any byte stream.
//!
//! Reads and overseer commands are multiplexed with `select!`; writes go
//! through a queue drained by a dedicated task so serving a bulk reply
//! never blocks reading. Storage access happens on the blocking pool.

use super::connection::{Connection, ConnectionState, Role, Step};
use super::exchange;
use super::factory::{ConnectionFactory, Control};
use crate::committer::{Committer, Hand, NodeUpdate, SyncStamp};
use crate::config::{SharedProfile, SyncConfig};
use crate::database::repositories::SqliteRepositories;
use crate::database::Database;
use crate::error::SyncError;
use crate::identity::LocalIdentity;
use crate::protocol::framing::{MessageSink, MessageStream};
use crate::protocol::{Handshake, HeaderPacket, Message, NodePacket, WirePost};
use crate::utils::{now_unix, PROTOCOL_VERSION};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything a session needs from the running node.
#[derive(Clone)]
pub struct SessionContext {
    pub database: Database,
    pub committer: Committer,
    pub factory: ConnectionFactory,
    pub local: LocalIdentity,
    pub profile: SharedProfile,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Both pulls finished.
    Completed,
    /// The peer closed the stream or sent `KillConnection` early.
    PeerClosed,
    /// The overseer gave up on the session.
    Aborted,
    /// Protocol violation, refused handshake or transport failure.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer: Option<String>,
    pub end: SessionEnd,
    pub posts_requested: usize,
    pub sync_invalidated: bool,
}

enum Flow {
    Continue,
    Close,
}

pub async fn run_session<S>(
    ctx: Arc<SessionContext>,
    stream: S,
    role: Role,
    remote: SocketAddr,
) -> Result<SessionSummary>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (id, mut control) = ctx.factory.register(role).await;
    let (reader, writer) = tokio::io::split(stream);
    let mut inbound = MessageStream::new(reader, ctx.sync.max_frame_bytes);
    let (outbox, pending) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(
        MessageSink::new(writer, ctx.sync.max_frame_bytes),
        pending,
    ));

    let mut session = Session {
        ctx: ctx.clone(),
        id,
        remote,
        conn: Connection::new(role),
        outbox,
        pull_since: None,
    };
    tracing::debug!(peer = %remote, ?role, "session opened");
    if role == Role::Outbound {
        session.send(Message::Handshake(session.local_handshake()));
        session.conn.handshake_sent();
        ctx.factory.set_state(id, session.conn.state()).await;
    }

    let end = loop {
        tokio::select! {
            received = inbound.recv() => match received {
                Ok(Some(msg)) => match session.handle(msg).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => {
                        break if session.conn.ready_to_close() {
                            SessionEnd::Completed
                        } else {
                            SessionEnd::PeerClosed
                        };
                    }
                    Err(err) => {
                        tracing::warn!(peer = %remote, error = ?err, "session failed");
                        break SessionEnd::Failed;
                    }
                },
                Ok(None) => break SessionEnd::PeerClosed,
                Err(err) => {
                    tracing::warn!(peer = %remote, error = ?err, "failed to read from peer");
                    break SessionEnd::Failed;
                }
            },
            command = control.recv() => match command {
                Some(Control::ForceAdvance) => match session.force_advance().await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break SessionEnd::Completed,
                    Err(err) => {
                        tracing::warn!(peer = %remote, error = ?err, "forced advance failed");
                        break SessionEnd::Failed;
                    }
                },
                Some(Control::Abort) | None => break SessionEnd::Aborted,
            },
        }
    };

    let summary = session.close(end);
    drop(session);
    ctx.factory.deregister(id).await;
    finish_writer(writer_task, end, ctx.sync.connect_timeout).await;

    tracing::info!(
        peer = %remote,
        node_id = ?summary.peer,
        end = ?summary.end,
        posts_requested = summary.posts_requested,
        invalidated = summary.sync_invalidated,
        "session closed"
    );
    Ok(summary)
}

async fn write_loop<W>(mut sink: MessageSink<W>, mut pending: mpsc::UnboundedReceiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = pending.recv().await {
        if let Err(err) = sink.send(&msg).await {
            tracing::debug!(error = ?err, "peer stopped accepting frames");
            return;
        }
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(error = ?err, "failed to close write half");
    }
}

/// Lets queued frames drain on an orderly close. A failed session sends
/// nothing more.
async fn finish_writer(task: JoinHandle<()>, end: SessionEnd, grace: std::time::Duration) {
    if matches!(end, SessionEnd::Failed | SessionEnd::Aborted) {
        task.abort();
        return;
    }
    let abort = task.abort_handle();
    if tokio::time::timeout(grace, task).await.is_err() {
        abort.abort();
    }
}

struct Session {
    ctx: Arc<SessionContext>,
    id: u64,
    remote: SocketAddr,
    conn: Connection,
    outbox: mpsc::UnboundedSender<Message>,
    /// Timestamp this node pulls from the peer with.
    pull_since: Option<i64>,
}

impl Session {
    fn send(&self, msg: Message) {
        if self.outbox.send(msg).is_err() {
            tracing::debug!(peer = %self.remote, "writer gone, dropping message");
        }
    }

    fn local_handshake(&self) -> Handshake {
        Handshake {
            node_id: self.ctx.local.node_id.clone(),
            listening_port: self.ctx.local.listening_port,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    async fn storage<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(SqliteRepositories<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let database = self.ctx.database.clone();
        tokio::task::spawn_blocking(move || database.with_repositories(f))
            .await
            .context("storage worker panicked")?
    }

    async fn handle(&mut self, msg: Message) -> Result<Flow> {
        self.conn.touch();
        let flow = match msg {
            Message::Handshake(handshake) => self.on_handshake(handshake).await?,
            Message::HandshakeReply(handshake) => self.on_handshake_reply(handshake).await?,
            other if !self.conn.is_established() => {
                return Err(SyncError::ProtocolViolation(format!(
                    "{} before handshake",
                    other.name()
                ))
                .into());
            }
            Message::RequestHeaders {
                last_sync_timestamp,
                languages,
            } => {
                let window = self.ctx.sync.header_window_secs;
                let bucket = self.ctx.sync.header_packet_size;
                let packets = self
                    .storage(move |repos| {
                        let headers = exchange::collect_headers(
                            &repos,
                            last_sync_timestamp,
                            &languages,
                            window,
                            now_unix(),
                        )?;
                        Ok(exchange::header_packets(headers, bucket))
                    })
                    .await?;
                for packet in packets {
                    self.send(Message::ReceiveHeaders(packet));
                }
                Flow::Continue
            }
            Message::ReceiveHeaders(packet) => self.on_headers(packet).await?,
            Message::RequestPost { fingerprint } => {
                let lookup = fingerprint.clone();
                let post = self
                    .storage(move |repos| exchange::export_post(&repos, &lookup))
                    .await?;
                self.send(Message::PostReply { fingerprint, post });
                Flow::Continue
            }
            Message::PostReply { fingerprint, post } => self.on_post(fingerprint, post),
            Message::RequestNodes {
                last_sync_timestamp,
            } => {
                let window = self.ctx.sync.node_window_secs;
                let bucket = self.ctx.sync.node_packet_size;
                let packets = self
                    .storage(move |repos| {
                        let nodes =
                            exchange::collect_nodes(&repos, last_sync_timestamp, window, now_unix())?;
                        Ok(exchange::node_packets(nodes, bucket))
                    })
                    .await?;
                for packet in packets {
                    self.send(Message::ReceiveNodes(packet));
                }
                Flow::Continue
            }
            Message::ReceiveNodes(packet) => self.on_nodes(packet),
            Message::SyncTimestamps { new_sync_timestamp } => {
                if self.conn.mark_remote_finished(new_sync_timestamp) {
                    self.send(Message::KillConnection);
                    Flow::Close
                } else {
                    Flow::Continue
                }
            }
            Message::KillConnection => Flow::Close,
        };
        self.ctx.factory.touch(self.id, self.conn.state()).await;
        Ok(flow)
    }

    fn check_identity(&self, handshake: &Handshake) -> Result<()> {
        if self.conn.is_established() {
            return Err(SyncError::ProtocolViolation("repeated handshake".into()).into());
        }
        if handshake.node_id.is_empty() || handshake.node_id == self.ctx.local.node_id {
            return Err(SyncError::ProtocolViolation("unusable peer node id".into()).into());
        }
        if handshake.protocol_version != PROTOCOL_VERSION {
            tracing::debug!(
                peer = %self.remote,
                version = handshake.protocol_version,
                "peer speaks a different protocol version"
            );
        }
        Ok(())
    }

    async fn on_handshake(&mut self, handshake: Handshake) -> Result<Flow> {
        if self.conn.role() != Role::Inbound {
            return Err(SyncError::ProtocolViolation("handshake sent to the dialer".into()).into());
        }
        self.check_identity(&handshake)?;

        let open = self.ctx.factory.inbound_count().await;
        let limit = self.ctx.profile.snapshot().details.max_inbound_count;
        if open > limit {
            return Err(SyncError::InboundLimit { open, limit }.into());
        }
        self.ctx.factory.claim_peer(self.id, &handshake.node_id).await?;
        self.record_peer(&handshake);
        self.send(Message::HandshakeReply(self.local_handshake()));
        self.begin_pull(handshake.node_id).await
    }

    async fn on_handshake_reply(&mut self, handshake: Handshake) -> Result<Flow> {
        if self.conn.role() != Role::Outbound {
            return Err(SyncError::ProtocolViolation("unsolicited handshake reply".into()).into());
        }
        self.check_identity(&handshake)?;
        self.ctx.factory.claim_peer(self.id, &handshake.node_id).await?;
        self.record_peer(&handshake);
        self.begin_pull(handshake.node_id).await
    }

    /// First-hand address: the IP the stream comes from and the port the
    /// peer says it listens on.
    fn record_peer(&self, handshake: &Handshake) {
        self.ctx.committer.add_node(NodeUpdate {
            node_id: handshake.node_id.clone(),
            ip: Some(self.remote.ip().to_string()),
            port: Some(handshake.listening_port),
            seen_at: Some(now_unix()),
            hand: Hand::First,
            sync_timestamp: SyncStamp::Keep,
        });
    }

    async fn begin_pull(&mut self, peer: String) -> Result<Flow> {
        let lookup = peer.clone();
        self.pull_since = self
            .storage(move |repos| exchange::peer_sync_timestamp(&repos, &lookup))
            .await?;
        self.conn.establish(peer);
        let languages =
            exchange::language_filter(&self.ctx.profile.snapshot().details.languages);
        self.send(Message::RequestHeaders {
            last_sync_timestamp: self.pull_since,
            languages,
        });
        Ok(Flow::Continue)
    }

    async fn on_headers(&mut self, packet: HeaderPacket) -> Result<Flow> {
        let Some(peer) = self.conn.peer().map(str::to_string) else {
            return Ok(Flow::Continue);
        };
        for item in exchange::stage_header_packet(&packet, &peer) {
            self.ctx.committer.enqueue(item);
        }
        let total = packet.total_packets;
        let current = packet.current_packet;
        let needed = self
            .storage(move |repos| exchange::needed_posts(&repos, &packet))
            .await?;
        if self.conn.record_header_packet(total, current, needed) {
            let step = self.conn.complete_headers();
            return Ok(self.apply(step));
        }
        Ok(Flow::Continue)
    }

    fn on_post(&mut self, fingerprint: String, post: Option<WirePost>) -> Flow {
        match post {
            Some(post) => match exchange::accept_post(&fingerprint, post) {
                Ok(item) => self.ctx.committer.enqueue(item),
                Err(err) => tracing::warn!(peer = %self.remote, error = %err, "dropping post"),
            },
            None => tracing::debug!(peer = %self.remote, %fingerprint, "peer no longer has post"),
        }
        if self.conn.record_post_arrival() {
            let step = self.conn.complete_posts();
            return self.apply(step);
        }
        Flow::Continue
    }

    fn on_nodes(&mut self, packet: NodePacket) -> Flow {
        for item in exchange::stage_node_packet(&packet, &self.ctx.local.node_id) {
            self.ctx.committer.enqueue(item);
        }
        if self
            .conn
            .record_node_packet(packet.total_packets, packet.current_packet)
        {
            let step = self.conn.complete_nodes();
            return self.apply(step);
        }
        Flow::Continue
    }

    fn apply(&mut self, step: Step) -> Flow {
        match step {
            Step::RequestPosts(fingerprints) => {
                for fingerprint in fingerprints {
                    self.send(Message::RequestPost { fingerprint });
                }
                Flow::Continue
            }
            Step::RequestNodes => {
                self.send(Message::RequestNodes {
                    last_sync_timestamp: self.pull_since,
                });
                Flow::Continue
            }
            Step::Finish => {
                self.send(Message::SyncTimestamps {
                    new_sync_timestamp: now_unix(),
                });
                if self.conn.ready_to_close() {
                    self.send(Message::KillConnection);
                    Flow::Close
                } else {
                    Flow::Continue
                }
            }
            Step::Wait => Flow::Continue,
        }
    }

    async fn force_advance(&mut self) -> Result<Flow> {
        let before = self.conn.state();
        let step = self.conn.force_advance();
        tracing::info!(peer = %self.remote, from = ?before, to = ?self.conn.state(), "stage forced forward");
        let flow = self.apply(step);
        self.ctx.factory.set_state(self.id, self.conn.state()).await;
        Ok(flow)
    }

    /// Settles the peer's sync timestamp and reports how the session went.
    fn close(&mut self, end: SessionEnd) -> SessionSummary {
        let completed = self.conn.ready_to_close();
        let posts_requested = self.conn.needed_posts().len();
        let sync_invalidated = self.conn.sync_invalidated();
        let peer = self.conn.peer().map(str::to_string);

        if let Some((node_id, stamp)) = self.conn.close() {
            if stamp != SyncStamp::Keep {
                self.ctx.committer.add_node(NodeUpdate {
                    node_id,
                    ip: None,
                    port: None,
                    seen_at: None,
                    hand: Hand::First,
                    sync_timestamp: stamp,
                });
            }
        }
        debug_assert_eq!(self.conn.state(), ConnectionState::Closed);

        SessionSummary {
            peer,
            end: if completed { SessionEnd::Completed } else { end },
            posts_requested,
            sync_invalidated,
        }
    }
}
