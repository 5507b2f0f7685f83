use super::*;
use crate::database::models::NodeRecord;
use crate::database::repositories::{NodeRepository, PostRepository};
use crate::fingerprint;

const NOW: i64 = 1_700_000_000;

fn topic(subject: &str) -> PostRecord {
    let mut record = PostRecord::blank("");
    record.subject = Some(subject.into());
    record.fingerprint = fingerprint::compute(&record);
    record
}

fn child(parent: &PostRecord, subject: &str, body: &str) -> PostRecord {
    let mut record = PostRecord::blank("");
    record.parent_fingerprint = Some(parent.fingerprint.clone());
    record.subject = Some(subject.into());
    record.body = Some(body.into());
    record.owner_username = Some("tester".into());
    record.protocol_version = Some(crate::utils::PROTOCOL_VERSION);
    record.creation_date = Some(NOW - 100);
    record.last_vote_date = Some(NOW - 100);
    record.language = Some("English".into());
    record.fingerprint = fingerprint::compute(&record);
    record
}

fn vote(target: &PostRecord, node: &str, direction: i64) -> CommitItem {
    CommitItem::Vote(VoteRecord {
        id: None,
        target_fingerprint: target.fingerprint.clone(),
        node_id: node.into(),
        direction,
    })
}

fn remote(record: &PostRecord) -> CommitItem {
    CommitItem::Post {
        record: record.clone(),
        origin: Origin::Remote,
    }
}

fn stored(database: &Database, fingerprint: &str) -> PostRecord {
    database
        .with_repositories(|repos| repos.posts().get(fingerprint))
        .expect("query")
        .expect("post stored")
}

fn cycle(database: &Database, items: Vec<CommitItem>) -> CommitReport {
    run_cycle(database, &CommitConfig::default(), items, NOW).expect("cycle")
}

#[test]
fn repeated_arrivals_store_one_post() {
    let database = Database::open_in_memory().expect("db");
    let t = topic("news");
    let p = child(&t, "", "hello");

    let report = cycle(&database, vec![remote(&t), remote(&p), remote(&p)]);
    assert_eq!(report.posts, 2);
    cycle(&database, vec![remote(&p)]);

    let count: i64 = database
        .with_repositories(|repos| repos.posts().count_children(&t.fingerprint, None))
        .expect("count");
    assert_eq!(count, 1);
}

#[test]
fn arrivals_without_vote_date_take_the_cycle_time() {
    let database = Database::open_in_memory().expect("db");
    let t = topic("news");
    assert_eq!(t.last_vote_date, None);
    let p = child(&t, "", "hello");

    cycle(&database, vec![remote(&t), remote(&p)]);
    assert_eq!(stored(&database, &t.fingerprint).last_vote_date, Some(NOW));
    assert_eq!(stored(&database, &p.fingerprint).last_vote_date, Some(NOW - 100));
}

#[test]
fn remote_posts_lose_local_state() {
    let database = Database::open_in_memory().expect("db");
    let t = topic("news");
    let mut p = child(&t, "", "hello");
    p.saved = true;
    p.upvoted = true;
    p.locally_created = true;
    p.reply_count = 99;

    cycle(&database, vec![remote(&t), remote(&p)]);
    let post = stored(&database, &p.fingerprint);
    assert!(!post.saved);
    assert!(!post.upvoted);
    assert!(!post.locally_created);
    assert_eq!(post.reply_count, 0);
    assert!(post.neutral);
    assert!(!post.dirty);
}

#[test]
fn last_vote_from_a_node_wins() {
    let database = Database::open_in_memory().expect("db");
    let t = topic("news");
    let p = child(&t, "", "hello");
    cycle(&database, vec![remote(&t), remote(&p)]);

    cycle(&database, vec![vote(&p, "peer", 1), vote(&p, "peer", 0)]);
    cycle(&database, vec![vote(&p, "peer", -1)]);

    let votes = database
        .with_repositories(|repos| {
            use crate::database::repositories::VoteRepository;
            repos.votes().list_for_target(&p.fingerprint)
        })
        .expect("votes");
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].direction, -1);

    let post = stored(&database, &p.fingerprint);
    assert_eq!((post.upvote_count, post.downvote_count), (0, 1));
}

#[test]
fn recomputation_is_idempotent() {
    let database = Database::open_in_memory().expect("db");
    let t = topic("news");
    let s = child(&t, "a subject", "");
    let items = vec![
        remote(&t),
        remote(&s),
        vote(&s, "a", 1),
        vote(&s, "b", 1),
        vote(&s, "c", -1),
        vote(&s, "d", 0),
    ];

    cycle(&database, items.clone());
    let first = stored(&database, &s.fingerprint);
    cycle(&database, items);
    let second = stored(&database, &s.fingerprint);

    assert_eq!(first, second);
    assert_eq!((first.upvote_count, first.downvote_count, first.neutral_count), (2, 1, 1));
    assert!(first.neutral);
    assert!(first.rank_score > 0.0);
}

#[test]
fn tenth_vote_clears_neutral_and_discounts_own_vote() {
    let database = Database::open_in_memory().expect("db");
    let t = topic("news");
    let mut p = child(&t, "", "hello");
    p.upvoted = true;
    p.locally_created = true;

    let mut items = vec![
        remote(&t),
        CommitItem::Post {
            record: p.clone(),
            origin: Origin::Local,
        },
        vote(&p, "local", 1),
    ];
    for n in 0..9 {
        items.push(vote(&p, &format!("peer-{n}"), 0));
    }
    cycle(&database, items);

    let post = stored(&database, &p.fingerprint);
    assert!(!post.neutral);
    assert_eq!(post.upvote_count, 1);
    assert_eq!(post.neutral_count, 8);
}

#[test]
fn locally_voted_post_below_threshold_is_not_neutral() {
    let database = Database::open_in_memory().expect("db");
    let t = topic("news");
    let mut p = child(&t, "", "mine");
    p.upvoted = true;
    p.locally_created = true;

    cycle(
        &database,
        vec![
            remote(&t),
            CommitItem::Post {
                record: p.clone(),
                origin: Origin::Local,
            },
        ],
    );
    let post = stored(&database, &p.fingerprint);
    assert!(!post.neutral);
    assert_eq!(post.last_vote_date, Some(NOW));
    assert!(post.locally_created);
}

#[test]
fn new_reply_increments_each_ancestor_once() {
    let database = Database::open_in_memory().expect("db");
    let t = topic("news");
    let x = child(&t, "", "x");
    let other = child(&t, "", "bystander");
    cycle(&database, vec![remote(&t), remote(&x), remote(&other)]);
    let topic_before = stored(&database, &t.fingerprint).reply_count;

    let mut reply = child(&x, "", "reply");
    reply.locally_created = true;
    cycle(
        &database,
        vec![CommitItem::Post {
            record: reply.clone(),
            origin: Origin::Local,
        }],
    );

    assert_eq!(stored(&database, &x.fingerprint).reply_count, 1);
    assert_eq!(stored(&database, &t.fingerprint).reply_count, topic_before + 1);
    assert_eq!(stored(&database, &other.fingerprint).reply_count, 0);
    assert_eq!(stored(&database, &reply.fingerprint).reply_count, 0);
}

#[test]
fn ancestor_cycle_terminates() {
    let database = Database::open_in_memory().expect("db");
    let mut a = PostRecord::blank("a");
    a.parent_fingerprint = Some("b".into());
    let mut b = PostRecord::blank("b");
    b.parent_fingerprint = Some("a".into());
    cycle(&database, vec![remote(&a), remote(&b)]);

    let mut c = PostRecord::blank("c");
    c.parent_fingerprint = Some("a".into());
    let report = cycle(&database, vec![remote(&c)]);
    assert_eq!(report.failed, 0);
    assert!(stored(&database, "a").reply_count >= 1);
}

#[test]
fn replies_to_local_posts_are_flagged() {
    let database = Database::open_in_memory().expect("db");
    let t = topic("news");
    let mut mine = child(&t, "", "mine");
    mine.locally_created = true;
    mine.upvoted = true;
    cycle(
        &database,
        vec![
            remote(&t),
            CommitItem::Post {
                record: mine.clone(),
                origin: Origin::Local,
            },
        ],
    );

    let answer = child(&mine, "", "an answer");
    let report = cycle(&database, vec![remote(&answer)]);
    assert!(report.replies);
    assert!(stored(&database, &answer.fingerprint).is_reply);
}

#[test]
fn first_hand_and_gossip_fields_stay_separate() {
    let database = Database::open_in_memory().expect("db");
    cycle(
        &database,
        vec![CommitItem::Node(NodeUpdate {
            node_id: "peer".into(),
            ip: Some("10.0.0.1".into()),
            port: Some(4000),
            seen_at: Some(100),
            hand: Hand::First,
            sync_timestamp: SyncStamp::Set(90),
        })],
    );
    cycle(
        &database,
        vec![
            CommitItem::Node(NodeUpdate {
                node_id: "peer".into(),
                ip: Some("192.168.1.9".into()),
                port: Some(5000),
                seen_at: Some(200),
                hand: Hand::Second,
                sync_timestamp: SyncStamp::Set(12345),
            }),
            CommitItem::Node(NodeUpdate {
                node_id: String::new(),
                ip: Some("1.1.1.1".into()),
                port: Some(1),
                seen_at: None,
                hand: Hand::Second,
                sync_timestamp: SyncStamp::Keep,
            }),
        ],
    );

    let node: NodeRecord = database
        .with_repositories(|repos| repos.nodes().get("peer"))
        .expect("query")
        .expect("node");
    assert_eq!(node.last_connected_ip.as_deref(), Some("10.0.0.1"));
    assert_eq!(node.last_connected_port, Some(4000));
    assert_eq!(node.last_sync_timestamp, Some(90));
    assert_eq!(node.last_retrieved_ip.as_deref(), Some("192.168.1.9"));
    assert_eq!(node.last_retrieved_date, Some(200));

    let total = database
        .with_repositories(|repos| repos.nodes().count_remote())
        .expect("count");
    assert_eq!(total, 1);

    cycle(
        &database,
        vec![CommitItem::Node(NodeUpdate {
            node_id: "peer".into(),
            ip: None,
            port: None,
            seen_at: None,
            hand: Hand::First,
            sync_timestamp: SyncStamp::Clear,
        })],
    );
    let node = database
        .with_repositories(|repos| repos.nodes().get("peer"))
        .expect("query")
        .expect("node");
    assert_eq!(node.last_sync_timestamp, None);
    assert_eq!(node.last_connected_ip.as_deref(), Some("10.0.0.1"));
}

#[tokio::test]
async fn commit_drains_queue_and_signals_replies() {
    let database = Database::open_in_memory().expect("db");
    let signals = SignalBus::default();
    let mut rx = signals.subscribe();
    let committer = Committer::new(database.clone(), CommitConfig::default(), signals);

    let t = topic("news");
    let mut mine = child(&t, "", "mine");
    mine.locally_created = true;
    committer.add_post(t.clone(), Origin::Remote);
    committer.add_post(mine.clone(), Origin::Local);
    let report = committer.commit().await.expect("commit");
    assert_eq!(report.posts, 2);

    committer.add_post(child(&mine, "", "reply"), Origin::Remote);
    let report = committer.commit().await.expect("commit");
    assert!(report.replies);
    assert_eq!(rx.recv().await.expect("signal"), Signal::ThereAreReplies);

    let empty = committer.commit().await.expect("commit");
    assert!(empty.is_empty());
}
