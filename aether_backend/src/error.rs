use thiserror::Error;

/// Failures the sync engine distinguishes from generic I/O or storage errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A peer sent a command out of order or otherwise broke the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Another live session already talks to this node id.
    #[error("node {node_id} already has a live connection")]
    DuplicateConnection { node_id: String },

    /// Too many inbound sessions are open.
    #[error("inbound connection limit reached: {open} open, limit {limit}")]
    InboundLimit { open: usize, limit: usize },

    /// A received post does not hash to the fingerprint it claims.
    #[error("fingerprint mismatch: claimed {claimed}, computed {computed}")]
    FingerprintMismatch { claimed: String, computed: String },

    /// The store stayed busy past the retry ceiling.
    #[error("storage busy after {attempts} attempts")]
    StorageBusy { attempts: u32 },

    /// A persisted setting could not be parsed.
    #[error("invalid setting {key}: {value}")]
    InvalidSetting { key: String, value: String },
}
