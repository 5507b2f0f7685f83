pub mod connection;
pub mod exchange;
pub mod factory;
pub mod selector;
pub mod session;
pub mod tls;

use crate::utils::now_unix;
use anyhow::{Context, Result};
use connection::Role;
use factory::{ConnectionFactory, OverseerReport};
use selector::DialTarget;
use session::{run_session, SessionContext, SessionSummary};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tls::TlsConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct NetworkHandle {
    ctx: Arc<SessionContext>,
    tls: TlsConfig,
    local_addr: SocketAddr,
    accept_worker: Arc<JoinHandle<()>>,
}

impl NetworkHandle {
    /// Binds the TLS listener and starts accepting peers.
    pub async fn start(ctx: SessionContext, tls: TlsConfig, bind: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind peer listener on {bind}"))?;
        let local_addr = listener.local_addr()?;
        let ctx = Arc::new(ctx);

        let accept_ctx = ctx.clone();
        let acceptor = tls.acceptor();
        let accept_worker = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((tcp, remote)) => {
                        let ctx = accept_ctx.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let handshake = tokio::time::timeout(
                                ctx.sync.connect_timeout,
                                acceptor.accept(tcp),
                            )
                            .await;
                            match handshake {
                                Ok(Ok(stream)) => {
                                    if let Err(err) =
                                        run_session(ctx, stream, Role::Inbound, remote).await
                                    {
                                        tracing::warn!(peer = %remote, error = ?err, "inbound session failed");
                                    }
                                }
                                Ok(Err(err)) => {
                                    tracing::debug!(peer = %remote, error = ?err, "TLS accept failed");
                                }
                                Err(_) => {
                                    tracing::debug!(peer = %remote, "TLS accept timed out");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, "failed to accept incoming connection");
                    }
                }
            }
        });

        tracing::info!(addr = %local_addr, node_id = %ctx.local.node_id, "peer listener started");
        Ok(Self {
            ctx,
            tls,
            local_addr,
            accept_worker: Arc::new(accept_worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.ctx.factory
    }

    /// Dials `addr` and runs one full session.
    pub async fn connect(&self, addr: SocketAddr) -> Result<SessionSummary> {
        let timeout = self.ctx.sync.connect_timeout;
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))?
            .with_context(|| format!("failed to connect to {addr}"))?;
        let stream = tokio::time::timeout(
            timeout,
            self.tls.connector().connect(TlsConfig::server_name()?, tcp),
        )
        .await
        .with_context(|| format!("TLS handshake with {addr} timed out"))?
        .with_context(|| format!("TLS handshake with {addr} failed"))?;
        run_session(self.ctx.clone(), stream, Role::Outbound, addr).await
    }

    pub fn spawn_connect(&self, addr: SocketAddr) {
        let handle = self.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.connect(addr).await {
                tracing::warn!(peer = %addr, error = ?err, "outbound session failed");
            }
        });
    }

    /// Picks peers and dials each one that has no live session. Returns
    /// the number of dials started.
    pub async fn connect_round(&self) -> Result<usize> {
        let details = self.ctx.profile.snapshot().details;
        let seeds = self.ctx.sync.seeds.clone();
        let database = self.ctx.database.clone();
        let targets: Vec<DialTarget> = tokio::task::spawn_blocking(move || {
            database.with_repositories(|repos| {
                selector::select_peers(
                    &repos,
                    details.max_outbound_count,
                    details.cooldown_minutes,
                    now_unix(),
                    &seeds,
                    &mut rand::rng(),
                )
            })
        })
        .await
        .context("peer selection worker panicked")??;

        let mut dialed = HashSet::new();
        let mut started = 0;
        for target in targets {
            if target.addr == self.local_addr || !dialed.insert(target.addr) {
                continue;
            }
            if let Some(node_id) = &target.node_id {
                if self.ctx.factory.is_connected(node_id).await {
                    continue;
                }
            }
            self.spawn_connect(target.addr);
            started += 1;
        }
        tracing::debug!(started, "connection round dispatched");
        Ok(started)
    }

    /// Stops accepting peers. Sessions already running finish on their own.
    pub fn shutdown(&self) {
        self.accept_worker.abort();
    }

    pub fn is_accepting(&self) -> bool {
        !self.accept_worker.is_finished()
    }

    pub async fn oversee(&self) -> OverseerReport {
        self.ctx
            .factory
            .oversee(self.ctx.sync.stall_timeout, self.ctx.sync.idle_abort)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committer::Committer;
    use crate::config::{AetherPaths, CommitConfig, SharedProfile, SyncConfig, UserProfile};
    use crate::database::Database;
    use crate::identity::{ensure_tls_material, LocalIdentity};
    use crate::signals::SignalBus;
    use tempfile::tempdir;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop() {
        let dir = tempdir().expect("tempdir");
        let paths = AetherPaths::from_base_dir(dir.path()).expect("paths");
        ensure_tls_material(&paths).expect("tls material");
        let tls = TlsConfig::load(&paths).expect("tls config");

        let database = Database::open_in_memory().expect("db");
        let ctx = SessionContext {
            database: database.clone(),
            committer: Committer::new(database, CommitConfig::default(), SignalBus::default()),
            factory: ConnectionFactory::new(),
            local: LocalIdentity {
                node_id: "me".into(),
                listening_port: 0,
            },
            profile: SharedProfile::new(paths.user_profile_path.clone(), UserProfile::default()),
            sync: SyncConfig::default(),
        };
        let bind: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let network = NetworkHandle::start(ctx, tls, bind).await.expect("start");
        assert!(network.is_accepting());

        let observer = network.clone();
        network.shutdown();
        drop(network);
        timeout(Duration::from_secs(5), async {
            while observer.is_accepting() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("accept loop stopped");
    }
}
