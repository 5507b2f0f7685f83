//! Storage-facing halves of the sync exchange: what to serve a peer and
//! how to stage what a peer sent. Everything here is blocking and runs on
//! the worker pool.

use crate::committer::{CommitItem, Hand, NodeUpdate, Origin};
use crate::database::models::{PostHeaderRecord, VoteRecord};
use crate::database::repositories::{
    ActivityWindow, NodeRepository, PostFlag, PostRepository, SqliteRepositories,
};
use crate::error::SyncError;
use crate::fingerprint;
use crate::protocol::pagination::paginate;
use crate::protocol::{
    HeaderBucket, HeaderPacket, LanguageFilter, NodePacket, WireHeader, WireNode, WirePost,
};
use anyhow::Result;
use std::collections::HashSet;

const BUCKETS: [(PostFlag, HeaderBucket); 4] = [
    (PostFlag::Upvoted, HeaderBucket::Positive),
    (PostFlag::Neutral, HeaderBucket::Neutral),
    (PostFlag::Downvoted, HeaderBucket::Negative),
    (PostFlag::Topic, HeaderBucket::Topic),
];

/// Headers owed to a peer, positive first and topics last. Without a sync
/// timestamp only posts created inside `window_secs` are listed. Topics
/// ignore the language filter.
pub fn collect_headers(
    repos: &SqliteRepositories<'_>,
    since: Option<i64>,
    languages: &LanguageFilter,
    window_secs: i64,
    now: i64,
) -> Result<Vec<(HeaderBucket, WireHeader)>> {
    let window = match since {
        Some(ts) => ActivityWindow::VotedSince(ts),
        None => ActivityWindow::CreatedAfter(now - window_secs),
    };
    let mut headers = Vec::new();
    for (flag, bucket) in BUCKETS {
        let filter = match bucket {
            HeaderBucket::Topic => None,
            _ => languages.as_slice(),
        };
        for post in repos.posts().list_for_sync(flag, window, filter)? {
            headers.push((bucket, WireHeader::from_record(&post)));
        }
    }
    Ok(headers)
}

pub fn header_packets(
    headers: Vec<(HeaderBucket, WireHeader)>,
    bucket_size: usize,
) -> Vec<HeaderPacket> {
    paginate(headers, bucket_size)
        .into_iter()
        .map(HeaderPacket::from_page)
        .collect()
}

/// Headers and the sender's implicit votes to queue for commit.
pub fn stage_header_packet(packet: &HeaderPacket, peer: &str) -> Vec<CommitItem> {
    let mut items = Vec::with_capacity(packet.len() * 2);
    for (bucket, header) in packet.entries() {
        items.push(CommitItem::Header(PostHeaderRecord {
            id: None,
            fingerprint: header.fingerprint.clone(),
            parent_fingerprint: header.parent_fingerprint.clone(),
            language: header.language.clone(),
            dirty: true,
        }));
        if let Some(direction) = bucket.vote_direction() {
            items.push(CommitItem::Vote(VoteRecord {
                id: None,
                target_fingerprint: header.fingerprint.clone(),
                node_id: peer.to_string(),
                direction,
            }));
        }
    }
    items
}

/// Wanted fingerprints from `packet` that are not stored yet.
pub fn needed_posts(repos: &SqliteRepositories<'_>, packet: &HeaderPacket) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut needed = Vec::new();
    for header in packet.wanted() {
        if header.fingerprint.is_empty() || !seen.insert(header.fingerprint.as_str()) {
            continue;
        }
        if !repos.posts().exists(&header.fingerprint)? {
            needed.push(header.fingerprint.clone());
        }
    }
    Ok(needed)
}

pub fn export_post(repos: &SqliteRepositories<'_>, fingerprint: &str) -> Result<Option<WirePost>> {
    Ok(repos
        .posts()
        .get(fingerprint)?
        .map(|record| WirePost::from_record(&record)))
}

/// Checks a received post against its claimed fingerprint and turns it
/// into a commit item.
pub fn accept_post(claimed: &str, post: WirePost) -> Result<CommitItem, SyncError> {
    let record = post.into_record();
    let computed = fingerprint::compute(&record);
    if record.fingerprint != claimed || computed != claimed {
        return Err(SyncError::FingerprintMismatch {
            claimed: claimed.to_string(),
            computed,
        });
    }
    Ok(CommitItem::Post {
        record,
        origin: Origin::Remote,
    })
}

/// Node directory for a peer. A timestamped request is still capped to
/// `window_secs` of history; an untimestamped one gets everything.
pub fn collect_nodes(
    repos: &SqliteRepositories<'_>,
    since: Option<i64>,
    window_secs: i64,
    now: i64,
) -> Result<Vec<WireNode>> {
    Ok(repos
        .nodes()
        .list_directory(since, now - window_secs)?
        .iter()
        .filter_map(WireNode::from_record)
        .collect())
}

pub fn node_packets(nodes: Vec<WireNode>, bucket_size: usize) -> Vec<NodePacket> {
    paginate(nodes, bucket_size)
        .into_iter()
        .map(|page| NodePacket {
            nodes: page.items,
            total_packets: page.total_packets,
            current_packet: page.current_packet,
        })
        .collect()
}

/// Gossiped nodes become second-hand updates. This node's own entry is
/// never taken from a peer.
pub fn stage_node_packet(packet: &NodePacket, local_node_id: &str) -> Vec<CommitItem> {
    packet
        .nodes
        .iter()
        .filter(|node| !node.node_id.is_empty() && node.node_id != local_node_id)
        .map(|node| {
            CommitItem::Node(NodeUpdate {
                node_id: node.node_id.clone(),
                ip: Some(node.ip.clone()),
                port: Some(node.port),
                seen_at: node.seen_at,
                hand: Hand::Second,
                sync_timestamp: crate::committer::SyncStamp::Keep,
            })
        })
        .collect()
}

pub fn peer_sync_timestamp(repos: &SqliteRepositories<'_>, node_id: &str) -> Result<Option<i64>> {
    Ok(repos
        .nodes()
        .get(node_id)?
        .and_then(|node| node.last_sync_timestamp))
}

/// Languages as a header request carries them. An empty list or one
/// naming `ALL` asks for everything.
pub fn language_filter(languages: &[String]) -> LanguageFilter {
    if languages.is_empty() || languages.iter().any(|lang| lang.eq_ignore_ascii_case("ALL")) {
        LanguageFilter::All
    } else {
        LanguageFilter::Only(languages.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{NodeRecord, PostRecord};
    use crate::database::Database;
    use crate::utils::LOCAL_IP_MARKER;

    const NOW: i64 = 1_700_000_000;

    fn stored(fingerprint: &str, parent: Option<&str>, language: &str) -> PostRecord {
        let mut record = PostRecord::blank(fingerprint);
        record.parent_fingerprint = parent.map(str::to_string);
        record.language = Some(language.into());
        record.creation_date = Some(NOW - 60);
        record.last_vote_date = Some(NOW - 60);
        record
    }

    #[test]
    fn headers_are_bucketed_and_windowed() {
        let database = Database::open_in_memory().expect("db");
        database
            .with_repositories(|repos| {
                let mut up = stored("up", Some("t"), "English");
                up.upvoted = true;
                repos.posts().insert(&up)?;
                let mut down = stored("down", Some("t"), "English");
                down.downvoted = true;
                repos.posts().insert(&down)?;
                let mut foreign = stored("foreign", Some("t"), "German");
                foreign.neutral = true;
                repos.posts().insert(&foreign)?;
                repos.posts().insert(&stored("t", None, "German"))?;
                let mut ancient = stored("ancient", Some("t"), "English");
                ancient.upvoted = true;
                ancient.creation_date = Some(NOW - 400 * 24 * 3600);
                ancient.last_vote_date = Some(NOW - 400 * 24 * 3600);
                repos.posts().insert(&ancient)?;
                Ok(())
            })
            .expect("seed");

        let english = LanguageFilter::Only(vec!["English".into()]);
        let headers = database
            .with_repositories(|repos| {
                collect_headers(&repos, None, &english, 26 * 7 * 24 * 3600, NOW)
            })
            .expect("headers");
        let listed: Vec<_> = headers
            .iter()
            .map(|(bucket, header)| (*bucket, header.fingerprint.as_str()))
            .collect();
        assert_eq!(
            listed,
            vec![
                (HeaderBucket::Positive, "up"),
                (HeaderBucket::Negative, "down"),
                (HeaderBucket::Topic, "t"),
            ]
        );

        let since = database
            .with_repositories(|repos| {
                collect_headers(&repos, Some(NOW - 400 * 24 * 3600), &LanguageFilter::All, 0, NOW)
            })
            .expect("headers");
        assert_eq!(since.len(), 5);
    }

    #[test]
    fn needed_list_skips_negative_and_stored_posts() {
        let database = Database::open_in_memory().expect("db");
        database
            .with_repositories(|repos| repos.posts().insert(&stored("have", Some("t"), "English")))
            .expect("seed");
        let header = |fp: &str| WireHeader {
            fingerprint: fp.into(),
            parent_fingerprint: Some("t".into()),
            language: None,
        };
        let packet = HeaderPacket {
            positive: vec![header("have"), header("want")],
            neutral: vec![header("want")],
            negative: vec![header("never")],
            topic: vec![header("t")],
            total_packets: 1,
            current_packet: 1,
        };
        let needed = database
            .with_repositories(|repos| needed_posts(&repos, &packet))
            .expect("needed");
        assert_eq!(needed, vec!["want".to_string(), "t".to_string()]);

        let items = stage_header_packet(&packet, "peer");
        let votes: Vec<_> = items
            .iter()
            .filter_map(|item| match item {
                CommitItem::Vote(vote) => Some((vote.target_fingerprint.as_str(), vote.direction)),
                _ => None,
            })
            .collect();
        assert_eq!(votes, vec![("have", 1), ("want", 1), ("want", 0), ("never", -1)]);
    }

    #[test]
    fn tampered_post_is_refused() {
        let mut record = PostRecord::blank("");
        record.parent_fingerprint = Some("t".into());
        record.body = Some("hello".into());
        record.creation_date = Some(NOW);
        record.fingerprint = fingerprint::compute(&record);
        let claimed = record.fingerprint.clone();

        let wire = WirePost::from_record(&record);
        assert!(accept_post(&claimed, wire.clone()).is_ok());

        let mut tampered = wire;
        tampered.body = Some("goodbye".into());
        assert!(matches!(
            accept_post(&claimed, tampered),
            Err(SyncError::FingerprintMismatch { .. })
        ));
    }

    #[test]
    fn node_directory_excludes_local_and_self_gossip() {
        let database = Database::open_in_memory().expect("db");
        database
            .with_repositories(|repos| {
                let mut local = NodeRecord::new("me");
                local.last_connected_ip = Some(LOCAL_IP_MARKER.into());
                local.last_connected_port = Some(1);
                repos.nodes().insert(&local)?;
                let mut peer = NodeRecord::new("peer");
                peer.last_connected_ip = Some("10.0.0.1".into());
                peer.last_connected_port = Some(2);
                peer.last_connected_date = Some(NOW - 60);
                repos.nodes().insert(&peer)?;
                Ok(())
            })
            .expect("seed");

        let nodes = database
            .with_repositories(|repos| collect_nodes(&repos, None, 10 * 24 * 3600, NOW))
            .expect("nodes");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, "peer");

        let packets = node_packets(nodes.clone(), 10);
        let mut gossip = packets[0].clone();
        gossip.nodes.push(WireNode {
            node_id: "me".into(),
            ip: "1.2.3.4".into(),
            port: 9,
            seen_at: None,
        });
        assert_eq!(stage_node_packet(&gossip, "me").len(), 1);
    }

    #[test]
    fn all_sentinel_widens_the_language_filter() {
        assert_eq!(language_filter(&[]), LanguageFilter::All);
        assert_eq!(language_filter(&["ALL".to_string()]), LanguageFilter::All);
        assert_eq!(
            language_filter(&["English".to_string()]),
            LanguageFilter::Only(vec!["English".to_string()])
        );
    }
}
