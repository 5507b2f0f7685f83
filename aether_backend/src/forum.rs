//! Local read and write surface for whatever presents the forum.
//!
//! Reads go straight to storage. Locally authored content is pushed through
//! the committer and flushed at once so it gets the same dedupe and
//! recomputation as network arrivals.

use crate::committer::{Committer, Origin};
use crate::config::{SharedProfile, UserProfile};
use crate::database::models::{PostHeaderRecord, PostRecord, VoteRecord};
use crate::database::repositories::{NodeRepository, PostRepository, VoteRepository};
use crate::database::Database;
use crate::fingerprint;
use crate::signals::{Signal, SignalBus};
use crate::utils::{days_to_secs, now_unix, PROTOCOL_VERSION};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

pub const FIRST_POST_PREVIEW_CHARS: usize = 410;
pub const MOST_POPULAR: &str = "Most Popular";
/// A node counts as connected if it was seen this recently.
pub const CONNECTED_WINDOW_SECS: i64 = 30 * 60;

/// Vote value that withdraws the local vote.
pub const REMOVE_VOTE: i64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectSummary {
    pub subject: PostRecord,
    pub first_post_body: String,
    pub first_post_owner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HomeSection {
    pub topic_name: String,
    pub subjects: Vec<PostRecord>,
}

#[derive(Clone)]
pub struct ForumService {
    database: Database,
    committer: Committer,
    signals: SignalBus,
    profile: SharedProfile,
    local_node_id: String,
}

impl ForumService {
    pub fn new(
        database: Database,
        committer: Committer,
        signals: SignalBus,
        profile: SharedProfile,
        local_node_id: String,
    ) -> Self {
        Self {
            database,
            committer,
            signals,
            profile,
            local_node_id,
        }
    }

    pub fn get_post(&self, fingerprint: &str) -> Result<Option<PostRecord>> {
        self.database
            .with_repositories(|repos| repos.posts().get(fingerprint))
    }

    pub fn uppermost_topics(&self) -> Result<Vec<PostRecord>> {
        self.database.with_repositories(|repos| repos.posts().list_topics())
    }

    /// Children of `fingerprint`, newest first, optionally only those
    /// created in the last `within_days` days.
    pub fn direct_descendants(
        &self,
        fingerprint: &str,
        within_days: Option<i64>,
    ) -> Result<Vec<PostRecord>> {
        let after = within_days.map(|days| now_unix() - days_to_secs(days));
        self.database
            .with_repositories(|repos| repos.posts().list_children(fingerprint, after))
    }

    /// The post itself followed by its descendants down to `depth` levels.
    /// Depth zero returns only the post.
    pub fn descendants(&self, fingerprint: &str, depth: usize) -> Result<Vec<PostRecord>> {
        self.database.with_repositories(|repos| {
            let posts = repos.posts();
            let mut found = Vec::new();
            let Some(root) = posts.get(fingerprint)? else {
                return Ok(found);
            };
            let mut visited = HashSet::from([root.fingerprint.clone()]);
            let mut queue = VecDeque::from([(root.fingerprint.clone(), 0usize)]);
            found.push(root);
            while let Some((parent, level)) = queue.pop_front() {
                if level >= depth {
                    continue;
                }
                for child in posts.list_children(&parent, None)? {
                    if visited.insert(child.fingerprint.clone()) {
                        queue.push_back((child.fingerprint.clone(), level + 1));
                        found.push(child);
                    }
                }
            }
            Ok(found)
        })
    }

    /// Every post below `fingerprint`, excluding the post itself.
    pub fn all_descendants(&self, fingerprint: &str) -> Result<Vec<PostRecord>> {
        let mut all = self.descendants(fingerprint, usize::MAX)?;
        if !all.is_empty() {
            all.remove(0);
        }
        Ok(all)
    }

    pub fn count_direct_descendants(
        &self,
        fingerprint: &str,
        within_days: Option<i64>,
    ) -> Result<i64> {
        let after = within_days.map(|days| now_unix() - days_to_secs(days));
        self.database
            .with_repositories(|repos| repos.posts().count_children(fingerprint, after))
    }

    pub fn count_all_descendants(&self, fingerprint: &str) -> Result<i64> {
        Ok(self.all_descendants(fingerprint)?.len() as i64)
    }

    /// Direct descendant counts for several posts at once. Zero days means
    /// no time bound.
    pub fn multi_count_direct_descendants(
        &self,
        days: i64,
        fingerprints: &[String],
    ) -> Result<HashMap<String, i64>> {
        let after = (days != 0).then(|| now_unix() - days_to_secs(days));
        self.database.with_repositories(|repos| {
            let posts = repos.posts();
            let mut counts = HashMap::with_capacity(fingerprints.len());
            for fingerprint in fingerprints {
                counts.insert(fingerprint.clone(), posts.count_children(fingerprint, after)?);
            }
            Ok(counts)
        })
    }

    pub fn count_topics(&self) -> Result<i64> {
        self.database.with_repositories(|repos| repos.posts().count_topics())
    }

    pub fn count_subjects(&self) -> Result<i64> {
        self.database.with_repositories(|repos| repos.posts().count_subjects())
    }

    pub fn count_replies(&self) -> Result<i64> {
        self.database.with_repositories(|repos| repos.posts().count_replies())
    }

    pub fn count_connected_nodes(&self) -> Result<i64> {
        let since = now_unix() - CONNECTED_WINDOW_SECS;
        self.database
            .with_repositories(|repos| repos.nodes().count_connected_since(since))
    }

    pub fn last_connection_time(&self) -> Result<Option<i64>> {
        self.database
            .with_repositories(|repos| repos.nodes().last_connection_time())
    }

    /// Subjects of a topic created in the last `days` days, most upvoted
    /// first, each with a preview of its best first post.
    pub fn subjects_of_topic(&self, topic: &str, days: i64) -> Result<Vec<SubjectSummary>> {
        let after = now_unix() - days_to_secs(days);
        self.database.with_repositories(|repos| {
            let posts = repos.posts();
            let mut summaries = Vec::new();
            for subject in posts.list_children_by_votes(topic, Some(after), None)? {
                let first = posts
                    .list_children_by_votes(&subject.fingerprint, None, Some(1))?
                    .into_iter()
                    .next();
                let (first_post_body, first_post_owner) = match first {
                    Some(post) => (
                        post.body
                            .unwrap_or_default()
                            .chars()
                            .take(FIRST_POST_PREVIEW_CHARS)
                            .collect(),
                        post.owner_username.unwrap_or_default(),
                    ),
                    None => (String::new(), String::new()),
                };
                summaries.push(SubjectSummary {
                    subject,
                    first_post_body,
                    first_post_owner,
                });
            }
            Ok(summaries)
        })
    }

    /// "Most Popular" subjects followed by the top subjects of each
    /// selected topic.
    pub fn home_screen(&self, topic_limit: usize, subject_limit: usize) -> Result<Vec<HomeSection>> {
        let selected = self.profile.snapshot().selected_topics;
        self.database.with_repositories(|repos| {
            let posts = repos.posts();
            let mut sections = vec![HomeSection {
                topic_name: MOST_POPULAR.to_string(),
                subjects: posts.list_popular_subjects(subject_limit)?,
            }];
            for topic in posts.list_topics_in(&selected, topic_limit)? {
                let subjects =
                    posts.list_children_by_votes(&topic.fingerprint, None, Some(subject_limit))?;
                sections.push(HomeSection {
                    topic_name: topic.subject.unwrap_or_default(),
                    subjects,
                });
            }
            Ok(sections)
        })
    }

    /// Highest upvoted direct reply.
    pub fn topmost_comment(&self, fingerprint: &str) -> Result<Option<PostRecord>> {
        self.database.with_repositories(|repos| {
            Ok(repos
                .posts()
                .list_children_by_votes(fingerprint, None, Some(1))?
                .into_iter()
                .next())
        })
    }

    pub fn posts_by_owner(&self, username: &str) -> Result<Vec<PostRecord>> {
        self.database
            .with_repositories(|repos| repos.posts().list_by_owner_username(username))
    }

    pub fn saved_posts(&self) -> Result<Vec<PostRecord>> {
        self.database.with_repositories(|repos| repos.posts().list_saved())
    }

    pub fn locally_created_posts(&self) -> Result<Vec<PostRecord>> {
        self.database
            .with_repositories(|repos| repos.posts().list_locally_created())
    }

    pub fn replies(&self) -> Result<Vec<PostRecord>> {
        self.database.with_repositories(|repos| repos.posts().list_replies())
    }

    /// The subject a post lives under. Topics have none; a broken or
    /// cyclic ancestry yields none.
    pub fn parent_subject(&self, fingerprint: &str) -> Result<Option<PostRecord>> {
        self.database.with_repositories(|repos| {
            let posts = repos.posts();
            let mut visited = HashSet::new();
            let mut cursor = Some(fingerprint.to_string());
            while let Some(current) = cursor.take() {
                if !visited.insert(current.clone()) {
                    tracing::warn!(%fingerprint, "ancestry cycle while resolving subject");
                    return Ok(None);
                }
                let Some(post) = posts.get(&current)? else {
                    return Ok(None);
                };
                if post.is_topic() {
                    return Ok(None);
                }
                if post.is_subject() {
                    return Ok(Some(post));
                }
                cursor = post.parent_fingerprint;
            }
            Ok(None)
        })
    }

    pub fn user_profile_json(&self) -> Result<String> {
        self.profile.raw_json()
    }

    pub fn write_user_profile(&self, raw: &str) -> Result<UserProfile> {
        self.profile.replace_from_json(raw)
    }

    pub async fn create_topic(&self, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            bail!("topic name cannot be empty");
        }
        let now = now_unix();
        let mut record = PostRecord::blank("");
        record.subject = Some(name.to_string());
        record.creation_date = Some(now);
        record.last_vote_date = Some(now);
        record.locally_created = true;
        record.fingerprint = fingerprint::compute(&record);

        let fingerprint = record.fingerprint.clone();
        self.committer.add_header(header_for(&record));
        self.committer.add_post(record, Origin::Local);
        self.committer.commit().await?;
        self.signals.emit(Signal::LocalCommit {
            fingerprint: fingerprint.clone(),
        });
        tracing::info!(%fingerprint, "topic created");
        Ok(fingerprint)
    }

    /// Creates a subject or reply under `parent`. The author's upvote is
    /// cast with it.
    pub async fn create_post(
        &self,
        subject: &str,
        body: &str,
        parent: &str,
        owner: &str,
        language: &str,
    ) -> Result<String> {
        if !self
            .database
            .with_repositories(|repos| repos.posts().exists(parent))?
        {
            bail!("parent post {parent} does not exist");
        }
        let now = now_unix();
        let mut record = PostRecord::blank("");
        record.parent_fingerprint = Some(parent.to_string());
        record.subject = non_empty(subject);
        record.body = non_empty(body);
        record.owner_username = non_empty(owner);
        record.language = non_empty(language);
        record.protocol_version = Some(PROTOCOL_VERSION);
        record.creation_date = Some(now);
        record.last_vote_date = Some(now);
        record.locally_created = true;
        record.upvoted = true;
        record.upvote_count = 1;
        record.fingerprint = fingerprint::compute(&record);

        let fingerprint = record.fingerprint.clone();
        self.committer.add_header(header_for(&record));
        self.committer.add_vote(VoteRecord {
            id: None,
            target_fingerprint: fingerprint.clone(),
            node_id: self.local_node_id.clone(),
            direction: 1,
        });
        self.committer.add_post(record, Origin::Local);
        self.committer.commit().await?;
        self.signals.emit(Signal::LocalCommit {
            fingerprint: fingerprint.clone(),
        });
        tracing::info!(%fingerprint, %parent, "post created");
        Ok(fingerprint)
    }

    /// Casts, changes or (with [`REMOVE_VOTE`]) withdraws the local vote.
    /// The post's counters and flags change in the same transaction.
    pub fn vote_post(&self, fingerprint: &str, direction: i64) -> Result<PostRecord> {
        if !matches!(direction, -1..=1 | REMOVE_VOTE) {
            bail!("invalid vote direction {direction}");
        }
        let local = self.local_node_id.clone();
        self.database.with_transaction(|repos| {
            let posts = repos.posts();
            let votes = repos.votes();
            let mut post = posts
                .get(fingerprint)?
                .with_context(|| format!("post {fingerprint} not found"))?;
            let existing = votes.get(fingerprint, &local)?;
            let now = now_unix();

            match (direction, existing) {
                (REMOVE_VOTE, Some(vote)) => {
                    withdraw(&mut post, vote.direction);
                    post.last_vote_date = Some(now);
                    if let Some(id) = vote.id {
                        votes.delete(id)?;
                    }
                }
                (REMOVE_VOTE, None) => return Ok(post),
                (direction, None) => {
                    votes.insert(&VoteRecord {
                        id: None,
                        target_fingerprint: fingerprint.to_string(),
                        node_id: local.clone(),
                        direction,
                    })?;
                    if direction != 0 {
                        cast(&mut post, direction);
                        post.last_vote_date = Some(now);
                        if post.neutral && post.neutral_count > 0 {
                            post.neutral_count -= 1;
                        }
                        post.neutral = false;
                    }
                }
                (direction, Some(vote)) if vote.direction != direction => {
                    if let Some(id) = vote.id {
                        votes.update_direction(id, direction)?;
                    }
                    withdraw(&mut post, vote.direction);
                    cast(&mut post, direction);
                    post.last_vote_date = Some(now);
                }
                (_, Some(_)) => return Ok(post),
            }

            post.dirty = true;
            posts.update(&post)?;
            Ok(post)
        })
    }

    /// Toggles the saved flag and returns the new value.
    pub fn save_post(&self, fingerprint: &str) -> Result<bool> {
        self.database.with_transaction(|repos| {
            let posts = repos.posts();
            let mut post = posts
                .get(fingerprint)?
                .with_context(|| format!("post {fingerprint} not found"))?;
            post.saved = !post.saved;
            posts.update(&post)?;
            Ok(post.saved)
        })
    }

    pub fn mark_all_replies_read(&self) -> Result<usize> {
        self.database
            .with_repositories(|repos| repos.posts().clear_reply_flags())
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn header_for(record: &PostRecord) -> PostHeaderRecord {
    PostHeaderRecord {
        id: None,
        fingerprint: record.fingerprint.clone(),
        parent_fingerprint: record.parent_fingerprint.clone(),
        language: record.language.clone(),
        dirty: false,
    }
}

fn cast(post: &mut PostRecord, direction: i64) {
    match direction {
        1 => {
            post.upvoted = true;
            post.upvote_count += 1;
        }
        -1 => {
            post.downvoted = true;
            post.downvote_count += 1;
        }
        _ => {}
    }
}

fn withdraw(post: &mut PostRecord, direction: i64) {
    match direction {
        1 => {
            post.upvoted = false;
            post.upvote_count = (post.upvote_count - 1).max(0);
        }
        -1 => {
            post.downvoted = false;
            post.downvote_count = (post.downvote_count - 1).max(0);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommitConfig, UserProfile, USER_PROFILE_FILE};
    use tempfile::tempdir;

    struct Fixture {
        forum: ForumService,
        signals: SignalBus,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let database = Database::open_in_memory().expect("db");
        let signals = SignalBus::default();
        let committer = Committer::new(database.clone(), CommitConfig::default(), signals.clone());
        let profile = SharedProfile::new(dir.path().join(USER_PROFILE_FILE), UserProfile::default());
        Fixture {
            forum: ForumService::new(database, committer, signals.clone(), profile, "me".into()),
            signals,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn authoring_builds_a_tree() {
        let fx = fixture();
        let mut rx = fx.signals.subscribe();
        let topic = fx.forum.create_topic("  rust  ").await.expect("topic");
        assert_eq!(
            rx.recv().await.expect("signal"),
            Signal::LocalCommit {
                fingerprint: topic.clone()
            }
        );

        let subject = fx
            .forum
            .create_post("first thread", "", &topic, "alice", "English")
            .await
            .expect("subject");
        let reply = fx
            .forum
            .create_post("", "hello there", &subject, "bob", "English")
            .await
            .expect("reply");

        let stored = fx.forum.get_post(&subject).expect("query").expect("subject");
        assert!(stored.locally_created && stored.upvoted);
        assert_eq!(stored.upvote_count, 1);
        assert!(!stored.neutral);

        assert_eq!(fx.forum.count_topics().expect("count"), 1);
        assert_eq!(fx.forum.count_subjects().expect("count"), 1);
        assert_eq!(fx.forum.count_all_descendants(&topic).expect("count"), 2);
        assert_eq!(fx.forum.descendants(&topic, 1).expect("tree").len(), 2);
        assert_eq!(
            fx.forum
                .parent_subject(&reply)
                .expect("query")
                .map(|p| p.fingerprint),
            Some(subject.clone())
        );
        assert_eq!(fx.forum.parent_subject(&topic).expect("query"), None);

        let summaries = fx.forum.subjects_of_topic(&topic, 7).expect("subjects");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].first_post_body, "hello there");
        assert_eq!(summaries[0].first_post_owner, "bob");
    }

    #[tokio::test]
    async fn new_topic_is_offered_to_synced_peers() {
        use crate::network::exchange::collect_headers;
        use crate::protocol::{HeaderBucket, LanguageFilter};

        let fx = fixture();
        let since = now_unix() - 60;
        let topic = fx.forum.create_topic("fresh").await.expect("topic");
        let subject = fx
            .forum
            .create_post("under fresh", "", &topic, "alice", "English")
            .await
            .expect("subject");

        let stored = fx.forum.get_post(&topic).expect("query").expect("topic");
        assert!(stored.last_vote_date.is_some());

        let headers = fx
            .forum
            .database
            .with_repositories(|repos| {
                collect_headers(&repos, Some(since), &LanguageFilter::All, 0, now_unix())
            })
            .expect("headers");
        let listed: Vec<_> = headers
            .iter()
            .map(|(bucket, header)| (*bucket, header.fingerprint.clone()))
            .collect();
        assert_eq!(
            listed,
            vec![(HeaderBucket::Positive, subject), (HeaderBucket::Topic, topic)]
        );
    }

    #[tokio::test]
    async fn post_under_missing_parent_is_refused() {
        let fx = fixture();
        assert!(fx
            .forum
            .create_post("", "orphan", "no-such-parent", "", "English")
            .await
            .is_err());
        assert!(fx.forum.create_topic("   ").await.is_err());
    }

    #[tokio::test]
    async fn vote_transitions_keep_counters_consistent() {
        let fx = fixture();
        let topic = fx.forum.create_topic("votes").await.expect("topic");
        let subject = fx
            .forum
            .create_post("s", "", &topic, "alice", "English")
            .await
            .expect("subject");

        let post = fx.forum.vote_post(&subject, -1).expect("flip down");
        assert!(!post.upvoted && post.downvoted);
        assert_eq!((post.upvote_count, post.downvote_count), (0, 1));

        let post = fx.forum.vote_post(&subject, -1).expect("repeat");
        assert_eq!((post.upvote_count, post.downvote_count), (0, 1));

        let post = fx.forum.vote_post(&subject, REMOVE_VOTE).expect("remove");
        assert!(!post.downvoted);
        assert_eq!((post.upvote_count, post.downvote_count), (0, 0));

        let post = fx.forum.vote_post(&subject, 1).expect("fresh up");
        assert!(post.upvoted && !post.neutral);
        assert_eq!(post.upvote_count, 1);

        assert!(fx.forum.vote_post(&subject, 5).is_err());
    }

    #[tokio::test]
    async fn save_toggles_and_replies_clear() {
        let fx = fixture();
        let topic = fx.forum.create_topic("saves").await.expect("topic");
        assert!(fx.forum.save_post(&topic).expect("save"));
        assert_eq!(fx.forum.saved_posts().expect("saved").len(), 1);
        assert!(!fx.forum.save_post(&topic).expect("unsave"));
        assert_eq!(fx.forum.mark_all_replies_read().expect("clear"), 0);
    }

    #[tokio::test]
    async fn home_screen_leads_with_most_popular() {
        let fx = fixture();
        let topic = fx.forum.create_topic("news").await.expect("topic");
        fx.forum
            .create_post("headline", "", &topic, "alice", "English")
            .await
            .expect("subject");
        fx.forum
            .write_user_profile(&format!(r#"{{"selectedTopics":["{topic}"]}}"#))
            .expect("profile");

        let home = fx.forum.home_screen(5, 5).expect("home");
        assert_eq!(home.len(), 2);
        assert_eq!(home[0].topic_name, MOST_POPULAR);
        assert_eq!(home[0].subjects.len(), 1);
        assert_eq!(home[1].topic_name, "news");
        assert_eq!(home[1].subjects.len(), 1);
    }
}
