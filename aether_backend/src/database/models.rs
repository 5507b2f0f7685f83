use serde::{Deserialize, Serialize};

/// A topic, subject or leaf post. `id` is `None` until the row is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: Option<i64>,
    pub fingerprint: String,
    pub parent_fingerprint: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub owner_username: Option<String>,
    pub owner_fingerprint: Option<String>,
    pub language: Option<String>,
    pub protocol_version: Option<i64>,
    /// Unix seconds.
    pub creation_date: Option<i64>,
    /// Unix seconds.
    pub last_vote_date: Option<i64>,
    pub upvote_count: i64,
    pub downvote_count: i64,
    pub neutral_count: i64,
    pub reply_count: i64,
    pub upvoted: bool,
    pub downvoted: bool,
    pub neutral: bool,
    pub saved: bool,
    pub is_reply: bool,
    pub locally_created: bool,
    pub dirty: bool,
    pub rank_score: f64,
}

impl PostRecord {
    /// An empty record carrying only immutable content fields; counters and
    /// flags start at their zero values.
    pub fn blank(fingerprint: impl Into<String>) -> Self {
        Self {
            id: None,
            fingerprint: fingerprint.into(),
            parent_fingerprint: None,
            subject: None,
            body: None,
            owner_username: None,
            owner_fingerprint: None,
            language: None,
            protocol_version: None,
            creation_date: None,
            last_vote_date: None,
            upvote_count: 0,
            downvote_count: 0,
            neutral_count: 0,
            reply_count: 0,
            upvoted: false,
            downvoted: false,
            neutral: false,
            saved: false,
            is_reply: false,
            locally_created: false,
            dirty: false,
            rank_score: 0.0,
        }
    }

    pub fn is_topic(&self) -> bool {
        self.parent_fingerprint.is_none()
    }

    /// Subjects have a parent and a non-empty subject line.
    pub fn is_subject(&self) -> bool {
        self.parent_fingerprint.is_some()
            && self
                .subject
                .as_deref()
                .map(|subject| !subject.is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostHeaderRecord {
    pub id: Option<i64>,
    pub fingerprint: String,
    pub parent_fingerprint: Option<String>,
    pub language: Option<String>,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub id: Option<i64>,
    pub target_fingerprint: String,
    pub node_id: String,
    /// 1 up, 0 neutral, -1 down.
    pub direction: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: Option<i64>,
    pub node_id: String,
    pub last_connected_ip: Option<String>,
    pub last_connected_port: Option<u16>,
    pub last_connected_date: Option<i64>,
    pub last_retrieved_ip: Option<String>,
    pub last_retrieved_port: Option<u16>,
    pub last_retrieved_date: Option<i64>,
    pub last_sync_timestamp: Option<i64>,
}

impl NodeRecord {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            id: None,
            node_id: node_id.into(),
            last_connected_ip: None,
            last_connected_port: None,
            last_connected_date: None,
            last_retrieved_ip: None,
            last_retrieved_port: None,
            last_retrieved_date: None,
            last_sync_timestamp: None,
        }
    }

    /// Best known address: first-hand data wins over gossip.
    pub fn dial_address(&self) -> Option<(String, u16)> {
        match (&self.last_connected_ip, self.last_connected_port) {
            (Some(ip), Some(port)) => Some((ip.clone(), port)),
            _ => match (&self.last_retrieved_ip, self.last_retrieved_port) {
                (Some(ip), Some(port)) => Some((ip.clone(), port)),
                _ => None,
            },
        }
    }
}
