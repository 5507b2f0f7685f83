use crate::bootstrap::{self, BootstrapResources};
use crate::committer::{CommitReport, Committer};
use crate::config::AetherConfig;
use crate::database::Database;
use crate::forum::ForumService;
use crate::identity::IdentitySummary;
use crate::network::factory::ConnectionFactory;
use crate::network::session::{SessionContext, SessionSummary};
use crate::network::tls::TlsConfig;
use crate::network::NetworkHandle;
use crate::signals::{Signal, SignalBus};
use crate::update;
use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Counters printed by the `stats` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub topics: i64,
    pub subjects: i64,
    pub replies: i64,
    pub connected_nodes: i64,
    pub last_connection: Option<i64>,
}

/// One running node: storage, committer, listener and the periodic loops
/// that drive them.
pub struct AetherNode {
    config: AetherConfig,
    bootstrap: BootstrapResources,
    signals: SignalBus,
    committer: Committer,
    forum: ForumService,
    network: NetworkHandle,
}

impl AetherNode {
    /// Bootstraps persistent state and starts the peer listener.
    pub async fn start(config: AetherConfig) -> Result<Self> {
        let bootstrap = bootstrap::initialize(&config).await?;
        let signals = SignalBus::default();
        let committer = Committer::new(
            bootstrap.database.clone(),
            config.commit.clone(),
            signals.clone(),
        );
        let identity = bootstrap.identity.identity.clone();
        let forum = ForumService::new(
            bootstrap.database.clone(),
            committer.clone(),
            signals.clone(),
            bootstrap.profile.clone(),
            identity.node_id.clone(),
        );

        let tls = TlsConfig::load(&config.paths)?;
        let ctx = SessionContext {
            database: bootstrap.database.clone(),
            committer: committer.clone(),
            factory: ConnectionFactory::new(),
            local: identity.clone(),
            profile: bootstrap.profile.clone(),
            sync: config.sync.clone(),
        };
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), identity.listening_port);
        let network = NetworkHandle::start(ctx, tls, bind).await?;

        tracing::info!(
            directories_created = ?bootstrap.directories_created,
            database_initialized = bootstrap.database_initialized,
            node_id = %identity.node_id,
            listening_port = identity.listening_port,
            "aether node initialized"
        );

        Ok(Self {
            config,
            bootstrap,
            signals,
            committer,
            forum,
            network,
        })
    }

    pub fn identity(&self) -> &IdentitySummary {
        &self.bootstrap.identity
    }

    pub fn database(&self) -> Database {
        self.bootstrap.database.clone()
    }

    pub fn forum(&self) -> ForumService {
        self.forum.clone()
    }

    pub fn signals(&self) -> SignalBus {
        self.signals.clone()
    }

    pub fn network(&self) -> NetworkHandle {
        self.network.clone()
    }

    pub async fn commit(&self) -> Result<CommitReport> {
        self.committer.commit().await
    }

    /// Dials one peer, waits for the session to end and commits what it
    /// brought in.
    pub async fn connect_once(&self, addr: SocketAddr) -> Result<SessionSummary> {
        let summary = self.network.connect(addr).await?;
        self.committer.commit().await?;
        Ok(summary)
    }

    pub fn stats(&self) -> Result<NodeStats> {
        Ok(NodeStats {
            topics: self.forum.count_topics()?,
            subjects: self.forum.count_subjects()?,
            replies: self.forum.count_replies()?,
            connected_nodes: self.forum.count_connected_nodes()?,
            last_connection: self.forum.last_connection_time()?,
        })
    }

    /// Runs the scheduler until Ctrl-C or a `KillApp` signal, then flushes
    /// the commit queue one last time.
    pub async fn run(&self) -> Result<()> {
        let mut kill = self.signals.subscribe();
        let workers = vec![
            self.spawn_commit_loop(),
            self.spawn_connect_loop(),
            self.spawn_overseer_loop(),
            self.spawn_signal_loop(),
            self.spawn_update_loop(),
        ];

        let wait_for_kill = async {
            loop {
                match kill.recv().await {
                    Ok(Signal::KillApp) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::warn!(error = ?err, "failed to listen for Ctrl-C");
                }
            }
            _ = wait_for_kill => {}
        }

        tracing::info!("shutting down");
        for worker in workers {
            worker.abort();
        }
        self.network.shutdown();
        if let Err(err) = self.committer.commit().await {
            tracing::error!(error = ?err, "final commit failed");
        }
        Ok(())
    }

    fn spawn_commit_loop(&self) -> JoinHandle<()> {
        let committer = self.committer.clone();
        let period = self.config.commit.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = committer.commit().await {
                    tracing::error!(error = ?err, "commit cycle failed");
                }
            }
        })
    }

    fn spawn_connect_loop(&self) -> JoinHandle<()> {
        let network = self.network.clone();
        let period = self.config.sync.connect_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = network.connect_round().await {
                    tracing::warn!(error = ?err, "connection round failed");
                }
            }
        })
    }

    fn spawn_overseer_loop(&self) -> JoinHandle<()> {
        let network = self.network.clone();
        let period = self.config.sync.overseer_tick;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let report = network.oversee().await;
                if report.advanced + report.aborted > 0 {
                    tracing::debug!(?report, "overseer pass");
                }
            }
        })
    }

    fn spawn_signal_loop(&self) -> JoinHandle<()> {
        let network = self.network.clone();
        let mut signals = self.signals.subscribe();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(Signal::ConnectWithIp { ip, port }) => match ip.parse::<IpAddr>() {
                        Ok(ip) => network.spawn_connect(SocketAddr::new(ip, port)),
                        Err(err) => tracing::warn!(%ip, error = %err, "ignoring connect request"),
                    },
                    Ok(Signal::LocalCommit { fingerprint }) => {
                        tracing::debug!(%fingerprint, "local commit, starting an early round");
                        if let Err(err) = network.connect_round().await {
                            tracing::warn!(error = ?err, "connection round failed");
                        }
                    }
                    Ok(Signal::KillApp) | Err(RecvError::Closed) => break,
                    Ok(Signal::ThereAreReplies) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "signal loop lagged");
                    }
                }
            }
        })
    }

    fn spawn_update_loop(&self) -> JoinHandle<()> {
        let config = self.config.update.clone();
        let database = self.bootstrap.database.clone();
        tokio::spawn(async move {
            if !config.enabled {
                return;
            }
            let client = match update::http_client() {
                Ok(client) => client,
                Err(err) => {
                    tracing::warn!(error = ?err, "update checks disabled");
                    return;
                }
            };
            let mut ticker = tokio::time::interval(UPDATE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(err) = update::check_for_update(&client, &config, &database).await {
                    tracing::debug!(error = ?err, "update check failed");
                }
            }
        })
    }
}
