//! Chooses which known peers to dial in a connection round.

use crate::database::models::NodeRecord;
use crate::database::repositories::{NodeRepository, SqliteRepositories};
use anyhow::Result;
use rand::seq::index::sample;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    /// `None` for seed addresses.
    pub node_id: Option<String>,
    pub addr: SocketAddr,
}

/// Up to `count` peers: half from directly connected peers past their
/// cooldown, the rest from gossip-only peers. Each half is drawn at random
/// from a window of the `4 * count` most recent candidates. With no known
/// peers at all the seeds are returned.
pub fn select_peers<R: Rng + ?Sized>(
    repos: &SqliteRepositories<'_>,
    count: usize,
    cooldown_minutes: i64,
    now: i64,
    seeds: &[SocketAddr],
    rng: &mut R,
) -> Result<Vec<DialTarget>> {
    let nodes = repos.nodes();
    if nodes.count_remote()? == 0 {
        return Ok(seed_targets(seeds));
    }
    if count == 0 {
        return Ok(Vec::new());
    }

    let window = count.saturating_mul(4);
    let connected_half = count.div_ceil(2);
    let cutoff = now - cooldown_minutes.max(0) * 60;

    let connected = nodes.list_connected_before(cutoff, window)?;
    let mut picked = pick(&connected, window, connected_half, rng);
    let retrieved = nodes.list_retrieved_only(window)?;
    let remaining = count.saturating_sub(picked.len());
    picked.extend(pick(&retrieved, window, remaining, rng));

    let targets: Vec<DialTarget> = picked.into_iter().filter_map(dial_target).collect();
    tracing::debug!(
        connected = connected.len(),
        retrieved = retrieved.len(),
        chosen = targets.len(),
        "selected peers"
    );
    Ok(targets)
}

/// Random positions out of a full window; the most recent ones otherwise.
fn pick<'a, R: Rng + ?Sized>(
    candidates: &'a [NodeRecord],
    window: usize,
    amount: usize,
    rng: &mut R,
) -> Vec<&'a NodeRecord> {
    let amount = amount.min(candidates.len());
    if candidates.len() < window {
        return candidates.iter().take(amount).collect();
    }
    sample(rng, candidates.len(), amount)
        .into_iter()
        .map(|index| &candidates[index])
        .collect()
}

fn dial_target(node: &NodeRecord) -> Option<DialTarget> {
    let (ip, port) = node.dial_address()?;
    match ip.parse::<IpAddr>() {
        Ok(ip) => Some(DialTarget {
            node_id: Some(node.node_id.clone()),
            addr: SocketAddr::new(ip, port),
        }),
        Err(_) => {
            tracing::debug!(node_id = %node.node_id, ip = %ip, "skipping node with unusable address");
            None
        }
    }
}

fn seed_targets(seeds: &[SocketAddr]) -> Vec<DialTarget> {
    seeds
        .iter()
        .map(|addr| DialTarget {
            node_id: None,
            addr: *addr,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    const NOW: i64 = 1_700_000_000;

    fn seed() -> Vec<SocketAddr> {
        vec!["151.236.11.192:39994".parse().expect("addr")]
    }

    fn connected(id: &str, octet: u8, minutes_ago: i64) -> NodeRecord {
        let mut node = NodeRecord::new(id);
        node.last_connected_ip = Some(format!("10.0.0.{octet}"));
        node.last_connected_port = Some(4000);
        node.last_connected_date = Some(NOW - minutes_ago * 60);
        node
    }

    fn gossiped(id: &str, octet: u8) -> NodeRecord {
        let mut node = NodeRecord::new(id);
        node.last_retrieved_ip = Some(format!("10.1.0.{octet}"));
        node.last_retrieved_port = Some(5000);
        node.last_retrieved_date = Some(NOW - i64::from(octet));
        node
    }

    #[test]
    fn empty_directory_falls_back_to_seeds() {
        let database = Database::open_in_memory().expect("db");
        let mut rng = StdRng::seed_from_u64(7);
        let targets = database
            .with_repositories(|repos| select_peers(&repos, 10, 5, NOW, &seed(), &mut rng))
            .expect("select");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].node_id, None);
    }

    #[test]
    fn cooldown_excludes_recent_peers_and_gossip_fills_the_rest() {
        let database = Database::open_in_memory().expect("db");
        database
            .with_repositories(|repos| {
                repos.nodes().insert(&connected("recent", 1, 1))?;
                repos.nodes().insert(&connected("cooled", 2, 60))?;
                repos.nodes().insert(&gossiped("g1", 3))?;
                repos.nodes().insert(&gossiped("g2", 4))?;
                Ok(())
            })
            .expect("seed");

        let mut rng = StdRng::seed_from_u64(7);
        let targets = database
            .with_repositories(|repos| select_peers(&repos, 4, 5, NOW, &seed(), &mut rng))
            .expect("select");
        let ids: Vec<_> = targets
            .iter()
            .map(|t| t.node_id.clone().expect("known node"))
            .collect();
        assert_eq!(ids, vec!["cooled", "g1", "g2"]);
        assert_eq!(targets[0].addr, "10.0.0.2:4000".parse().expect("addr"));
    }

    #[test]
    fn full_window_is_sampled_without_repeats() {
        let database = Database::open_in_memory().expect("db");
        database
            .with_repositories(|repos| {
                for n in 0..8u8 {
                    repos
                        .nodes()
                        .insert(&connected(&format!("c{n}"), n + 1, 60 + i64::from(n)))?;
                }
                Ok(())
            })
            .expect("seed");

        let mut rng = StdRng::seed_from_u64(42);
        let targets = database
            .with_repositories(|repos| select_peers(&repos, 2, 5, NOW, &seed(), &mut rng))
            .expect("select");
        assert_eq!(targets.len(), 1);
        let unique: HashSet<_> = targets.iter().map(|t| t.addr).collect();
        assert_eq!(unique.len(), targets.len());
    }
}
