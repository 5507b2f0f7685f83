use super::staging::Staging;
use crate::config::{CommitConfig, RankingConfig};
use crate::database::models::PostRecord;
use crate::database::repositories::{PostRepository, SqliteRepositories, VoteRepository};
use anyhow::Result;
use std::collections::{HashMap, HashSet};

/// Marks every post targeted by a staged vote as dirty. Votes for posts
/// that have not arrived yet are left alone; the post starts dirty when it
/// does arrive.
pub(super) fn dirty_vote_targets(
    repos: &SqliteRepositories<'_>,
    staging: &mut Staging,
) -> Result<()> {
    let targets: Vec<String> = staging
        .votes
        .iter()
        .map(|vote| vote.target_fingerprint.clone())
        .collect();
    for target in targets {
        if let Some(position) = staging.load_post(repos, &target)? {
            staging.posts[position].dirty = true;
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Tally {
    up: i64,
    down: i64,
    neutral: i64,
}

impl Tally {
    fn total(&self) -> i64 {
        self.up + self.down + self.neutral
    }
}

/// Stored votes overlaid with the ones staged this cycle.
fn tally_votes(
    repos: &SqliteRepositories<'_>,
    staging: &Staging,
    fingerprint: &str,
) -> Result<Tally> {
    let mut by_node: HashMap<String, i64> = repos
        .votes()
        .list_for_target(fingerprint)?
        .into_iter()
        .map(|vote| (vote.node_id, vote.direction))
        .collect();
    for vote in staging
        .votes
        .iter()
        .filter(|vote| vote.target_fingerprint == fingerprint)
    {
        by_node.insert(vote.node_id.clone(), vote.direction);
    }

    let mut tally = Tally::default();
    for direction in by_node.values() {
        match direction {
            1 => tally.up += 1,
            -1 => tally.down += 1,
            0 => tally.neutral += 1,
            other => tracing::debug!(fingerprint, direction = other, "ignoring unknown vote direction"),
        }
    }
    Ok(tally)
}

fn parent_is_local(
    repos: &SqliteRepositories<'_>,
    staging: &Staging,
    post: &PostRecord,
) -> Result<bool> {
    let Some(parent) = post.parent_fingerprint.as_deref() else {
        return Ok(false);
    };
    if let Some(position) = staging.post_position(parent) {
        return Ok(staging.posts[position].locally_created);
    }
    Ok(repos
        .posts()
        .get(parent)?
        .map(|record| record.locally_created)
        .unwrap_or(false))
}

/// Recounts votes, neutrality, the reply flag and rank for every dirty post.
/// Running it again over unchanged votes yields the same values.
pub(super) fn resolve_votes_and_flags(
    repos: &SqliteRepositories<'_>,
    staging: &mut Staging,
    config: &CommitConfig,
    now: i64,
) -> Result<()> {
    for stored in repos.posts().list_dirty()? {
        if staging.post_position(&stored.fingerprint).is_none() {
            staging.stage_post(stored);
        }
    }

    let newcomers: HashSet<String> = staging.newcomers.iter().cloned().collect();
    let dirty: Vec<usize> = staging
        .posts
        .iter()
        .enumerate()
        .filter(|(_, post)| post.dirty)
        .map(|(position, _)| position)
        .collect();

    for position in dirty {
        let tally = tally_votes(repos, staging, &staging.posts[position].fingerprint)?;
        let is_reply = if newcomers.contains(&staging.posts[position].fingerprint) {
            let post = &staging.posts[position];
            Some(!post.locally_created && parent_is_local(repos, staging, post)?)
        } else {
            None
        };

        let post = &mut staging.posts[position];
        post.upvote_count = tally.up;
        post.downvote_count = tally.down;
        post.neutral_count = tally.neutral;

        if tally.total() < config.neutral_threshold {
            if post.parent_fingerprint.is_some() {
                if !post.upvoted && !post.downvoted {
                    post.neutral = true;
                } else {
                    post.neutral = false;
                    post.last_vote_date = Some(now);
                }
            } else {
                post.neutral = false;
            }
        } else {
            post.neutral = false;
            post.neutral_count = (tally.neutral - 1).max(0);
        }

        if let Some(is_reply) = is_reply {
            post.is_reply = is_reply;
            if is_reply {
                staging.replies = true;
            }
        }

        if post.is_subject() {
            post.rank_score = rank_score(tally.up, tally.down, now, config.ranking);
        }
        post.dirty = false;
    }
    Ok(())
}

/// Hot ranking: log-scaled vote magnitude plus a linear time term, rounded
/// to seven decimals. Zero net votes rank at zero.
pub fn rank_score(upvotes: i64, downvotes: i64, now: i64, ranking: RankingConfig) -> f64 {
    let raw = upvotes - downvotes;
    if raw == 0 {
        return 0.0;
    }
    let sign = raw.signum() as f64;
    let order = (raw.unsigned_abs() as f64).log2();
    let seconds = (now - ranking.epoch_anchor) as f64;
    let score = sign * order + sign * seconds / ranking.decay_divisor;
    (score * 1e7).round() / 1e7
}

/// Adds one to the reply count of every ancestor of each post that is new
/// this cycle. The walk stops at a topic, at a missing parent, at a repeated
/// fingerprint, or after `max_depth` steps.
pub(super) fn increment_reply_counts(
    repos: &SqliteRepositories<'_>,
    staging: &mut Staging,
    max_depth: usize,
) -> Result<()> {
    let newcomers = staging.newcomers.clone();
    for fingerprint in newcomers {
        let mut visited = HashSet::from([fingerprint.clone()]);
        let mut cursor = staging
            .post_position(&fingerprint)
            .and_then(|position| staging.posts[position].parent_fingerprint.clone());
        let mut depth = 0;

        while let Some(ancestor) = cursor.take() {
            if depth >= max_depth {
                tracing::warn!(%fingerprint, max_depth, "ancestor walk hit depth bound");
                break;
            }
            if !visited.insert(ancestor.clone()) {
                tracing::warn!(%fingerprint, %ancestor, "ancestry cycle detected");
                break;
            }
            let Some(position) = staging.load_post(repos, &ancestor)? else {
                break;
            };
            let post = &mut staging.posts[position];
            post.reply_count += 1;
            cursor = post.parent_fingerprint.clone();
            depth += 1;
        }
    }
    Ok(())
}
