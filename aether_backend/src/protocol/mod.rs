//! Messages exchanged between peers.
//!
//! Every frame carries one [`Message`] encoded as JSON. Bulk collections are
//! split into numbered packets, see [`pagination`].

pub mod framing;
pub mod pagination;

use crate::database::models::{NodeRecord, PostRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload")]
pub enum Message {
    Handshake(Handshake),
    HandshakeReply(Handshake),
    RequestHeaders {
        last_sync_timestamp: Option<i64>,
        languages: LanguageFilter,
    },
    ReceiveHeaders(HeaderPacket),
    RequestPost {
        fingerprint: String,
    },
    PostReply {
        fingerprint: String,
        post: Option<WirePost>,
    },
    RequestNodes {
        last_sync_timestamp: Option<i64>,
    },
    ReceiveNodes(NodePacket),
    /// The sender's clock at the end of its pull. The receiver stores it as
    /// the high-water mark for the sender and treats it as "finished".
    SyncTimestamps {
        new_sync_timestamp: i64,
    },
    KillConnection,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "Handshake",
            Message::HandshakeReply(_) => "HandshakeReply",
            Message::RequestHeaders { .. } => "RequestHeaders",
            Message::ReceiveHeaders(_) => "ReceiveHeaders",
            Message::RequestPost { .. } => "RequestPost",
            Message::PostReply { .. } => "PostReply",
            Message::RequestNodes { .. } => "RequestNodes",
            Message::ReceiveNodes(_) => "ReceiveNodes",
            Message::SyncTimestamps { .. } => "SyncTimestamps",
            Message::KillConnection => "KillConnection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: String,
    pub listening_port: u16,
    pub protocol_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanguageFilter {
    All,
    Only(Vec<String>),
}

impl LanguageFilter {
    pub fn as_slice(&self) -> Option<&[String]> {
        match self {
            LanguageFilter::All => None,
            LanguageFilter::Only(languages) => Some(languages),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    pub fingerprint: String,
    pub parent_fingerprint: Option<String>,
    pub language: Option<String>,
}

impl WireHeader {
    pub fn from_record(record: &PostRecord) -> Self {
        Self {
            fingerprint: record.fingerprint.clone(),
            parent_fingerprint: record.parent_fingerprint.clone(),
            language: record.language.clone(),
        }
    }
}

/// Which of the four header lists a header travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderBucket {
    Positive,
    Neutral,
    Negative,
    Topic,
}

impl HeaderBucket {
    /// Vote the sending node implicitly casts on a header in this bucket.
    pub fn vote_direction(self) -> Option<i64> {
        match self {
            HeaderBucket::Positive => Some(1),
            HeaderBucket::Neutral => Some(0),
            HeaderBucket::Negative => Some(-1),
            HeaderBucket::Topic => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPacket {
    pub positive: Vec<WireHeader>,
    pub neutral: Vec<WireHeader>,
    pub negative: Vec<WireHeader>,
    pub topic: Vec<WireHeader>,
    pub total_packets: usize,
    pub current_packet: usize,
}

impl HeaderPacket {
    pub fn from_page(page: pagination::Page<(HeaderBucket, WireHeader)>) -> Self {
        let mut packet = Self {
            total_packets: page.total_packets,
            current_packet: page.current_packet,
            ..Self::default()
        };
        for (bucket, header) in page.items {
            match bucket {
                HeaderBucket::Positive => packet.positive.push(header),
                HeaderBucket::Neutral => packet.neutral.push(header),
                HeaderBucket::Negative => packet.negative.push(header),
                HeaderBucket::Topic => packet.topic.push(header),
            }
        }
        packet
    }

    /// Every header paired with the bucket it arrived in.
    pub fn entries(&self) -> impl Iterator<Item = (HeaderBucket, &WireHeader)> {
        self.positive
            .iter()
            .map(|h| (HeaderBucket::Positive, h))
            .chain(self.neutral.iter().map(|h| (HeaderBucket::Neutral, h)))
            .chain(self.negative.iter().map(|h| (HeaderBucket::Negative, h)))
            .chain(self.topic.iter().map(|h| (HeaderBucket::Topic, h)))
    }

    pub fn len(&self) -> usize {
        self.positive.len() + self.neutral.len() + self.negative.len() + self.topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fingerprints worth fetching. Downvoted content is never requested.
    pub fn wanted(&self) -> impl Iterator<Item = &WireHeader> {
        self.positive
            .iter()
            .chain(self.neutral.iter())
            .chain(self.topic.iter())
    }
}

/// Immutable post content. Counters and local flags never leave the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePost {
    pub fingerprint: String,
    pub parent_fingerprint: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub owner_username: Option<String>,
    pub owner_fingerprint: Option<String>,
    pub language: Option<String>,
    pub protocol_version: Option<i64>,
    pub creation_date: Option<i64>,
    pub last_vote_date: Option<i64>,
}

impl WirePost {
    pub fn from_record(record: &PostRecord) -> Self {
        Self {
            fingerprint: record.fingerprint.clone(),
            parent_fingerprint: record.parent_fingerprint.clone(),
            subject: record.subject.clone(),
            body: record.body.clone(),
            owner_username: record.owner_username.clone(),
            owner_fingerprint: record.owner_fingerprint.clone(),
            language: record.language.clone(),
            protocol_version: record.protocol_version,
            creation_date: record.creation_date,
            last_vote_date: record.last_vote_date,
        }
    }

    /// A fresh record with local-only state zeroed.
    pub fn into_record(self) -> PostRecord {
        PostRecord {
            parent_fingerprint: self.parent_fingerprint,
            subject: self.subject,
            body: self.body,
            owner_username: self.owner_username,
            owner_fingerprint: self.owner_fingerprint,
            language: self.language,
            protocol_version: self.protocol_version,
            creation_date: self.creation_date,
            last_vote_date: self.last_vote_date,
            ..PostRecord::blank(self.fingerprint)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNode {
    pub node_id: String,
    pub ip: String,
    pub port: u16,
    pub seen_at: Option<i64>,
}

impl WireNode {
    /// Advertises the first-hand address when known, otherwise the gossiped
    /// one. Nodes with no usable address are not advertised.
    pub fn from_record(record: &NodeRecord) -> Option<Self> {
        if let (Some(ip), Some(port)) = (&record.last_connected_ip, record.last_connected_port) {
            return Some(Self {
                node_id: record.node_id.clone(),
                ip: ip.clone(),
                port,
                seen_at: record.last_connected_date,
            });
        }
        match (&record.last_retrieved_ip, record.last_retrieved_port) {
            (Some(ip), Some(port)) => Some(Self {
                node_id: record.node_id.clone(),
                ip: ip.clone(),
                port,
                seen_at: record.last_retrieved_date,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePacket {
    pub nodes: Vec<WireNode>,
    pub total_packets: usize,
    pub current_packet: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_by_command() {
        let msg = Message::RequestPost {
            fingerprint: "abc".into(),
        };
        let json = serde_json::to_value(&msg).expect("encode");
        assert_eq!(json["command"], "RequestPost");
        assert_eq!(json["payload"]["fingerprint"], "abc");

        let kill = serde_json::to_string(&Message::KillConnection).expect("encode");
        let decoded: Message = serde_json::from_str(&kill).expect("decode");
        assert_eq!(decoded, Message::KillConnection);
    }

    #[test]
    fn wire_post_strips_local_state() {
        let mut record = PostRecord::blank("fp");
        record.id = Some(9);
        record.subject = Some("s".into());
        record.saved = true;
        record.upvoted = true;
        record.upvote_count = 12;
        record.rank_score = 3.5;

        let json = serde_json::to_value(WirePost::from_record(&record)).expect("encode");
        let object = json.as_object().expect("object");
        for local in ["id", "saved", "upvoted", "upvote_count", "rank_score", "dirty"] {
            assert!(!object.contains_key(local), "{local} leaked onto the wire");
        }

        let back = WirePost::from_record(&record).into_record();
        assert_eq!(back.id, None);
        assert!(!back.saved);
        assert_eq!(back.upvote_count, 0);
        assert_eq!(back.subject.as_deref(), Some("s"));
    }

    #[test]
    fn wire_node_prefers_first_hand_address() {
        let mut node = NodeRecord::new("n");
        assert!(WireNode::from_record(&node).is_none());

        node.last_retrieved_ip = Some("10.0.0.2".into());
        node.last_retrieved_port = Some(2);
        node.last_retrieved_date = Some(20);
        assert_eq!(WireNode::from_record(&node).unwrap().ip, "10.0.0.2");

        node.last_connected_ip = Some("10.0.0.1".into());
        node.last_connected_port = Some(1);
        node.last_connected_date = Some(10);
        let wire = WireNode::from_record(&node).unwrap();
        assert_eq!((wire.ip.as_str(), wire.port, wire.seen_at), ("10.0.0.1", 1, Some(10)));
    }

    #[test]
    fn header_packet_never_wants_negative() {
        let header = |fp: &str| WireHeader {
            fingerprint: fp.into(),
            parent_fingerprint: None,
            language: None,
        };
        let packet = HeaderPacket {
            positive: vec![header("p")],
            neutral: vec![header("n")],
            negative: vec![header("x")],
            topic: vec![header("t")],
            total_packets: 1,
            current_packet: 1,
        };
        let wanted: Vec<_> = packet.wanted().map(|h| h.fingerprint.as_str()).collect();
        assert_eq!(wanted, vec!["p", "n", "t"]);
        assert_eq!(packet.len(), 4);
    }
}
