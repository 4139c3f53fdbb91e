//! Fork-server selection for a requested package set.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use crate::types::PackageName;

use super::forkserver::ForkServer;

/// Outcome of matching a requested package set against the cache tree.
pub struct Match {
    /// Index of the chosen node in the server list.
    pub index: usize,
    pub server: Arc<ForkServer>,
    /// Requested packages the chosen node does not already hold, in request
    /// order with duplicates dropped.
    pub to_cache: Vec<PackageName>,
    /// True when the chosen node already holds every requested package.
    pub hit: bool,
}

/// Picks the fork server with the most pre-imported overlap.
///
/// Selection order: largest overlap with the request; then fewest packages
/// outside the request; then higher hit count; then lower creation
/// sequence. The second criterion sends an empty request to the root and
/// keeps new entries from inheriting unrelated baggage, while a node that
/// fully covers the request still wins on overlap. The root is always a
/// candidate, so a non-empty server list always matches.
pub struct SubsetMatcher;

impl SubsetMatcher {
    pub fn best_match(
        &self,
        servers: &[Arc<ForkServer>],
        requested: &[PackageName],
    ) -> Option<Match> {
        let wanted: HashSet<&PackageName> = requested.iter().collect();

        let mut best: Option<(usize, usize, Reverse<usize>, u64)> = None;
        for (index, server) in servers.iter().enumerate() {
            if server.is_dead() {
                continue;
            }

            let overlap = server
                .packages()
                .iter()
                .filter(|p| wanted.contains(p))
                .count();
            let extra = Reverse(server.packages().len() - overlap);
            let hits = server.hits();

            // strict comparison keeps the earliest node on full ties
            let better = match best {
                None => true,
                Some((_, b_overlap, b_extra, b_hits)) => {
                    (overlap, extra, hits) > (b_overlap, b_extra, b_hits)
                }
            };
            if better {
                best = Some((index, overlap, extra, hits));
            }
        }

        best.map(|(index, ..)| {
            let server = Arc::clone(&servers[index]);
            let mut seen = HashSet::new();
            let to_cache: Vec<PackageName> = requested
                .iter()
                .filter(|p| !server.packages().contains(*p) && seen.insert(*p))
                .cloned()
                .collect();
            let hit = to_cache.is_empty();
            Match {
                index,
                server,
                to_cache,
                hit,
            }
        })
    }
}
