//! # Consolidation
//!
//! Racing pings can create two clusters for the same vehicle. After every
//! resolution the coordinator asks the sweeper to look around the user's
//! cluster and merge it with the nearest compatible neighbour. The older
//! cluster always survives.
//!
//! `sweep_route` does the same for a whole route at once (bulk cleanup), and
//! `duplicate_pairs` lists candidates without changing anything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::geo_utils::haversine_distance;
use crate::store::ClusterStore;
use crate::types::Cluster;
use crate::{now_millis, ClusterId, RouteId};

/// One merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Consolidation {
    /// Surviving cluster after the merge
    pub survivor: Cluster,
    /// Id of the cluster that was absorbed (now inactive)
    pub absorbed: ClusterId,
}

/// Two active clusters close enough to be the same vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicatePair {
    /// Older cluster (would survive)
    pub keep: ClusterId,
    /// Younger cluster (would be absorbed)
    pub remove: ClusterId,
    pub distance_meters: f64,
    /// Plates keep these apart, so they will never be merged
    pub plate_conflict: bool,
}

/// Survivor first: older by creation time, lower id on a tie.
fn order_by_age(a: Cluster, b: Cluster) -> (Cluster, Cluster) {
    if a.is_older_than(&b) {
        (a, b)
    } else {
        (b, a)
    }
}

/// Index-based disjoint set with path halving and union by rank.
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Merges near-duplicate active clusters.
pub struct ConsolidationSweeper {
    store: Arc<dyn ClusterStore>,
    merge_threshold: f64,
    min_interval_ms: i64,
    strict_plates: bool,
    last_sweep: Mutex<HashMap<RouteId, i64>>,
}

impl std::fmt::Debug for ConsolidationSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidationSweeper")
            .field("merge_threshold", &self.merge_threshold)
            .field("min_interval_ms", &self.min_interval_ms)
            .field("strict_plates", &self.strict_plates)
            .finish()
    }
}

impl ConsolidationSweeper {
    pub fn new(store: Arc<dyn ClusterStore>, config: &ClusterConfig) -> Self {
        Self {
            store,
            merge_threshold: config.merge_threshold,
            min_interval_ms: i64::try_from(config.sweep_min_interval_ms).unwrap_or(i64::MAX),
            strict_plates: config.strict_plate_after_conflict,
            last_sweep: Mutex::new(HashMap::new()),
        }
    }

    /// Rate limit per route. Returns false when the route was swept too recently.
    fn claim_slot(&self, route_id: RouteId) -> bool {
        if self.min_interval_ms <= 0 {
            return true;
        }
        let now = now_millis();
        // A poisoned map only holds timestamps; keep using it
        let mut last = self
            .last_sweep
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last.get(&route_id) {
            Some(&at) if now - at < self.min_interval_ms => false,
            _ => {
                last.insert(route_id, now);
                true
            }
        }
    }

    /// Merge `cluster_id` with its nearest compatible neighbour, if any.
    ///
    /// Runs after each resolution, under the route lock. Idempotent: a second
    /// call right after a merge finds nothing.
    pub fn sweep_after(&self, cluster_id: ClusterId) -> Result<Option<Consolidation>> {
        let cluster = match self.store.cluster(cluster_id)? {
            Some(c) if c.active => c,
            _ => return Ok(None),
        };
        if !self.claim_slot(cluster.route_id) {
            log::debug!(
                "[Consolidation] Route {} swept recently, skipping",
                cluster.route_id
            );
            return Ok(None);
        }

        let neighbour = self
            .store
            .active_near(cluster.route_id, &cluster.centroid, self.merge_threshold)?
            .into_iter()
            .find(|n| {
                n.cluster.id != cluster.id && cluster.mergeable_with(&n.cluster, self.strict_plates)
            });
        let Some(neighbour) = neighbour else {
            return Ok(None);
        };

        let distance = neighbour.distance_meters;
        let (survivor, absorbed) = order_by_age(cluster, neighbour.cluster);
        let merged = self.store.merge(survivor.id, absorbed.id)?;
        log::info!(
            "[Consolidation] Merged cluster {} into {} ({:.1}m apart, {} members)",
            absorbed.id,
            merged.id,
            distance,
            merged.member_count
        );
        Ok(Some(Consolidation {
            survivor: merged,
            absorbed: absorbed.id,
        }))
    }

    /// Pairs of active clusters on a route within `radius_meters` of each other,
    /// closest first.
    pub fn duplicate_pairs(&self, route_id: RouteId, radius_meters: f64) -> Result<Vec<DuplicatePair>> {
        let clusters = self.store.active_on_route(route_id)?;
        let mut pairs = Vec::new();
        for (i, a) in clusters.iter().enumerate() {
            for b in &clusters[i + 1..] {
                let distance = haversine_distance(&a.centroid, &b.centroid);
                if distance >= radius_meters {
                    continue;
                }
                let (keep, remove) = order_by_age(a.clone(), b.clone());
                pairs.push(DuplicatePair {
                    keep: keep.id,
                    remove: remove.id,
                    distance_meters: distance,
                    plate_conflict: !a.mergeable_with(b, self.strict_plates),
                });
            }
        }
        pairs.sort_by(|x, y| {
            x.distance_meters
                .total_cmp(&y.distance_meters)
                .then(x.keep.cmp(&y.keep))
                .then(x.remove.cmp(&y.remove))
        });
        Ok(pairs)
    }

    /// Merge every group of mutually close clusters on a route into its
    /// oldest member. Clusters whose plate conflicts with the survivor are
    /// left alone.
    pub fn sweep_route(&self, route_id: RouteId) -> Result<Vec<Consolidation>> {
        let clusters = self.store.active_on_route(route_id)?;
        let index: HashMap<ClusterId, usize> = clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i))
            .collect();

        let mut sets = DisjointSet::new(clusters.len());
        for pair in self.duplicate_pairs(route_id, self.merge_threshold)? {
            if pair.plate_conflict {
                continue;
            }
            if let (Some(&a), Some(&b)) = (index.get(&pair.keep), index.get(&pair.remove)) {
                sets.union(a, b);
            }
        }

        let mut groups: HashMap<usize, Vec<Cluster>> = HashMap::new();
        for (i, cluster) in clusters.iter().enumerate() {
            groups.entry(sets.find(i)).or_default().push(cluster.clone());
        }

        let mut merges = Vec::new();
        let mut groups: Vec<Vec<Cluster>> = groups.into_values().filter(|g| g.len() > 1).collect();
        groups.sort_by_key(|g| g.iter().map(|c| c.id).min());

        for mut group in groups {
            group.sort_by_key(|c| (c.created_at, c.id));
            let mut survivor = group[0].clone();
            let survivor_id = survivor.id;
            for absorbed in &group[1..] {
                // The survivor may have picked up a plate from an earlier merge
                if !survivor.mergeable_with(absorbed, self.strict_plates) {
                    log::warn!(
                        "[Consolidation] Cluster {} kept apart from {} (plates)",
                        absorbed.id,
                        survivor_id
                    );
                    continue;
                }
                match self.store.merge(survivor_id, absorbed.id) {
                    Ok(merged) => {
                        survivor = merged.clone();
                        merges.push(Consolidation {
                            survivor: merged,
                            absorbed: absorbed.id,
                        });
                    }
                    Err(ClusterError::PlateMismatch { .. }) => {
                        log::warn!(
                            "[Consolidation] Cluster {} kept apart from {} (plates differ)",
                            absorbed.id,
                            survivor_id
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if !merges.is_empty() {
            log::info!(
                "[Consolidation] Route {} cleanup merged {} clusters",
                route_id,
                merges.len()
            );
        }
        Ok(merges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryClusterStore;
    use crate::types::{Membership, Ping};
    use crate::GpsPoint;

    fn setup() -> (Arc<InMemoryClusterStore>, ConsolidationSweeper) {
        let store = Arc::new(InMemoryClusterStore::new());
        let sweeper = ConsolidationSweeper::new(store.clone(), &ClusterConfig::default());
        (store, sweeper)
    }

    fn seed(store: &InMemoryClusterStore, user: &str, lat: f64, plate: Option<&str>) -> Cluster {
        let m = Membership::from_ping(&Ping::new(user, 1, GpsPoint::new(lat, -71.2400)), 0);
        store
            .create_with_member(m, plate.map(str::to_string))
            .unwrap()
            .cluster
    }

    #[test]
    fn test_sweep_after_merges_into_older() {
        let (store, sweeper) = setup();
        let older = seed(&store, "a", -34.9800, None);
        let younger = seed(&store, "b", -34.9805, None); // ~56m

        let merged = sweeper.sweep_after(younger.id).unwrap().unwrap();
        assert_eq!(merged.survivor.id, older.id);
        assert_eq!(merged.absorbed, younger.id);
        assert_eq!(merged.survivor.member_count, 2);
        assert_eq!(store.membership("b").unwrap().unwrap().cluster_id, older.id);

        // Idempotent
        assert!(sweeper.sweep_after(older.id).unwrap().is_none());
    }

    #[test]
    fn test_sweep_after_ignores_far_and_conflicting() {
        let (store, sweeper) = setup();
        let a = seed(&store, "a", -34.9800, Some("AAAA11"));
        seed(&store, "b", -34.9803, Some("BBBB22"));
        seed(&store, "c", -34.9900, None);
        assert!(sweeper.sweep_after(a.id).unwrap().is_none());
        assert_eq!(store.active_on_route(1).unwrap().len(), 3);
    }

    #[test]
    fn test_rate_limit() {
        let store = Arc::new(InMemoryClusterStore::new());
        let config = ClusterConfig {
            sweep_min_interval_ms: 60_000,
            ..ClusterConfig::default()
        };
        let sweeper = ConsolidationSweeper::new(store.clone(), &config);
        let a = seed(&store, "a", -34.9800, None);
        assert!(sweeper.sweep_after(a.id).unwrap().is_none());

        seed(&store, "b", -34.9801, None);
        // Too soon after the first sweep on this route
        assert!(sweeper.sweep_after(a.id).unwrap().is_none());
        assert_eq!(store.active_on_route(1).unwrap().len(), 2);
    }

    #[test]
    fn test_huge_interval_still_limits() {
        let store = Arc::new(InMemoryClusterStore::new());
        let config = ClusterConfig {
            sweep_min_interval_ms: u64::MAX,
            ..ClusterConfig::default()
        };
        let sweeper = ConsolidationSweeper::new(store.clone(), &config);
        let a = seed(&store, "a", -34.9800, None);
        assert!(sweeper.sweep_after(a.id).unwrap().is_none());

        seed(&store, "b", -34.9801, None);
        assert!(sweeper.sweep_after(a.id).unwrap().is_none());
        assert_eq!(store.active_on_route(1).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_pairs() {
        let (store, sweeper) = setup();
        let a = seed(&store, "a", -34.9800, Some("AAAA11"));
        let b = seed(&store, "b", -34.9802, Some("BBBB22"));
        let c = seed(&store, "c", -34.9806, None);

        // a-b ~22m, b-c ~44m, a-c ~67m
        let pairs = sweeper.duplicate_pairs(1, 80.0).unwrap();
        let ids: Vec<(ClusterId, ClusterId)> = pairs.iter().map(|p| (p.keep, p.remove)).collect();
        assert_eq!(ids, vec![(a.id, b.id), (b.id, c.id), (a.id, c.id)]);
        assert!(pairs[0].plate_conflict);
        assert!(!pairs[1].plate_conflict);
        assert!(!pairs[2].plate_conflict);

        assert_eq!(sweeper.duplicate_pairs(1, 30.0).unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_route_chains() {
        let (store, sweeper) = setup();
        let a = seed(&store, "a", -34.9800, None);
        seed(&store, "b", -34.9806, None);
        seed(&store, "c", -34.9812, None);
        let far = seed(&store, "d", -34.9900, None);

        let merges = sweeper.sweep_route(1).unwrap();
        assert_eq!(merges.len(), 2);
        let active: Vec<ClusterId> = store.active_on_route(1).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(active, vec![a.id, far.id]);
        assert_eq!(store.cluster(a.id).unwrap().unwrap().member_count, 3);
    }

    #[test]
    fn test_strict_plates_keep_bare_cluster_apart() {
        let store = Arc::new(InMemoryClusterStore::new());
        let config = ClusterConfig {
            strict_plate_after_conflict: true,
            ..ClusterConfig::default()
        };
        let sweeper = ConsolidationSweeper::new(store.clone(), &config);
        let plated = seed(&store, "a", -34.9800, Some("BXJK12"));
        store.record_plate_conflict(plated.id).unwrap();
        let bare = seed(&store, "b", -34.9802, None);

        assert!(sweeper.sweep_after(bare.id).unwrap().is_none());
        assert!(sweeper.sweep_route(1).unwrap().is_empty());
        assert!(sweeper.duplicate_pairs(1, 80.0).unwrap()[0].plate_conflict);
        assert_eq!(store.active_on_route(1).unwrap().len(), 2);

        // Without the strict rule they are the same vehicle
        let (store, sweeper) = setup();
        let plated = seed(&store, "a", -34.9800, Some("BXJK12"));
        store.record_plate_conflict(plated.id).unwrap();
        let bare = seed(&store, "b", -34.9802, None);
        let merged = sweeper.sweep_after(bare.id).unwrap().unwrap();
        assert_eq!(merged.survivor.id, plated.id);
    }

    #[test]
    fn test_sweep_route_keeps_conflicting_plates_apart() {
        let (store, sweeper) = setup();
        seed(&store, "a", -34.9800, Some("AAAA11"));
        seed(&store, "b", -34.9803, None);
        seed(&store, "c", -34.9806, Some("CCCC33"));

        let merges = sweeper.sweep_route(1).unwrap();
        assert_eq!(merges.len(), 1);
        assert_eq!(store.active_on_route(1).unwrap().len(), 2);
    }
}
