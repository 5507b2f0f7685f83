use tokio::sync::broadcast;

/// One-way notifications between the sync engine and whatever presents it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A locally authored item was committed.
    LocalCommit { fingerprint: String },
    KillApp,
    ConnectWithIp { ip: String, port: u16 },
    /// At least one post replying to local content arrived.
    ThereAreReplies,
}

#[derive(Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Signal>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    /// Sending with no subscribers is not an error.
    pub fn emit(&self, signal: Signal) {
        if self.tx.send(signal.clone()).is_err() {
            tracing::debug!(?signal, "signal dropped, no subscribers");
        }
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(64)
    }
}
