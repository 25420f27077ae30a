//! In-memory cluster store.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{ClusterError, Result};
use crate::store::spatial::ClusterSpatialIndex;
use crate::store::{centroid_of, rank_nearby, ClusterStore, ExpiryReport, StoreStats};
use crate::types::{Cluster, Departure, Membership, Nearby, Placement};
use crate::{now_millis, ClusterId, GpsPoint, RouteId};

#[derive(Debug)]
struct Inner {
    next_id: ClusterId,
    clusters: HashMap<ClusterId, Cluster>,
    memberships: HashMap<String, Membership>,
    members: HashMap<ClusterId, BTreeSet<String>>,
    spatial: ClusterSpatialIndex,
}

impl Inner {
    fn new() -> Self {
        Self {
            next_id: 1,
            clusters: HashMap::new(),
            memberships: HashMap::new(),
            members: HashMap::new(),
            spatial: ClusterSpatialIndex::default(),
        }
    }

    fn active_cluster(&self, id: ClusterId) -> Result<&Cluster> {
        match self.clusters.get(&id) {
            Some(c) if c.active => Ok(c),
            Some(_) => Err(ClusterError::Internal {
                message: format!("cluster {} is not active", id),
            }),
            None => Err(ClusterError::Internal {
                message: format!("cluster {} does not exist", id),
            }),
        }
    }

    /// Recompute count and centroid from the member set. Deactivates the
    /// cluster when it is empty. Returns whether it was deactivated.
    fn refresh(&mut self, id: ClusterId, now: i64) -> bool {
        let Some(cluster) = self.clusters.get_mut(&id) else {
            return false;
        };
        let users = self.members.get(&id);
        let count = users.map_or(0, |u| u.len());
        let centroid = centroid_of(
            users
                .into_iter()
                .flatten()
                .filter_map(|u| self.memberships.get(u)),
            cluster.centroid,
        );

        let old_centroid = cluster.centroid;
        cluster.member_count = count as u32;
        cluster.centroid = centroid;
        cluster.updated_at = now;

        if count == 0 && cluster.active {
            cluster.active = false;
            self.spatial.remove(cluster.route_id, id, &old_centroid);
            self.members.remove(&id);
            true
        } else {
            if cluster.active {
                self.spatial.relocate(cluster.route_id, id, &old_centroid, &centroid);
            }
            false
        }
    }

    fn detach(&mut self, user_id: &str, now: i64) -> Option<Departure> {
        let membership = self.memberships.remove(user_id)?;
        if let Some(users) = self.members.get_mut(&membership.cluster_id) {
            users.remove(user_id);
        }
        let deactivated = self.refresh(membership.cluster_id, now);
        let cluster = self.clusters.get(&membership.cluster_id)?.clone();
        Some(Departure {
            user_id: membership.user_id,
            cluster,
            deactivated,
        })
    }

    fn attach(&mut self, membership: Membership) {
        self.members
            .entry(membership.cluster_id)
            .or_default()
            .insert(membership.user_id.clone());
        self.memberships.insert(membership.user_id.clone(), membership);
    }
}

/// Cluster store backed by in-process maps.
///
/// A single `RwLock` guards all state, so each trait call is one lock section.
#[derive(Debug)]
pub struct InMemoryClusterStore {
    inner: RwLock<Inner>,
}

impl Default for InMemoryClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClusterStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| ClusterError::store("cluster store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| ClusterError::store("cluster store lock poisoned"))
    }
}

impl ClusterStore for InMemoryClusterStore {
    fn cluster(&self, id: ClusterId) -> Result<Option<Cluster>> {
        Ok(self.read()?.clusters.get(&id).cloned())
    }

    fn active_near(
        &self,
        route_id: RouteId,
        point: &GpsPoint,
        radius_meters: f64,
    ) -> Result<Vec<Nearby>> {
        let inner = self.read()?;
        let candidates = inner
            .spatial
            .candidates(route_id, point, radius_meters)
            .into_iter()
            .filter_map(|id| inner.clusters.get(&id).cloned());
        Ok(rank_nearby(candidates, point, radius_meters))
    }

    fn active_on_route(&self, route_id: RouteId) -> Result<Vec<Cluster>> {
        let inner = self.read()?;
        let mut clusters: Vec<Cluster> = inner
            .clusters
            .values()
            .filter(|c| c.active && c.route_id == route_id)
            .cloned()
            .collect();
        clusters.sort_by_key(|c| c.id);
        Ok(clusters)
    }

    fn membership(&self, user_id: &str) -> Result<Option<Membership>> {
        Ok(self.read()?.memberships.get(user_id).cloned())
    }

    fn members(&self, cluster_id: ClusterId) -> Result<Vec<Membership>> {
        let inner = self.read()?;
        Ok(inner
            .members
            .get(&cluster_id)
            .into_iter()
            .flatten()
            .filter_map(|u| inner.memberships.get(u).cloned())
            .collect())
    }

    fn stats(&self) -> Result<StoreStats> {
        let inner = self.read()?;
        Ok(StoreStats {
            clusters: inner.clusters.len(),
            active_clusters: inner.clusters.values().filter(|c| c.active).count(),
            memberships: inner.memberships.len(),
            plate_conflicts: inner
                .clusters
                .values()
                .map(|c| c.plate_conflicts as u64)
                .sum(),
        })
    }

    fn create_with_member(
        &self,
        mut membership: Membership,
        plate: Option<String>,
    ) -> Result<Placement> {
        let mut inner = self.write()?;
        let now = now_millis();

        let previous = inner.detach(&membership.user_id, now);

        let id = inner.next_id;
        inner.next_id += 1;
        let cluster = Cluster {
            id,
            route_id: membership.route_id,
            centroid: membership.position,
            member_count: 1,
            plate,
            plate_conflicts: 0,
            active: true,
            created_at: now,
            updated_at: now,
        };
        inner.spatial.insert(cluster.route_id, id, &cluster.centroid);
        inner.clusters.insert(id, cluster.clone());
        membership.cluster_id = id;
        inner.attach(membership);

        Ok(Placement { cluster, previous })
    }

    fn place_member(
        &self,
        membership: Membership,
        claim_plate: Option<String>,
    ) -> Result<Placement> {
        let mut inner = self.write()?;
        let now = now_millis();
        let target_id = membership.cluster_id;

        // All checks before any mutation
        let target = inner.active_cluster(target_id)?;
        if target.route_id != membership.route_id {
            return Err(ClusterError::Internal {
                message: format!(
                    "cluster {} belongs to route {}, not {}",
                    target_id, target.route_id, membership.route_id
                ),
            });
        }
        target.plate_check(claim_plate.as_deref(), false)?;

        let previous_cluster = inner
            .memberships
            .get(&membership.user_id)
            .map(|m| m.cluster_id);
        let previous = match previous_cluster {
            Some(cid) if cid != target_id => inner.detach(&membership.user_id, now),
            _ => None,
        };

        inner.attach(membership);
        if let (Some(plate), Some(cluster)) = (claim_plate, inner.clusters.get_mut(&target_id)) {
            if cluster.plate.is_none() {
                cluster.plate = Some(plate);
            }
        }
        inner.refresh(target_id, now);

        let cluster = inner.active_cluster(target_id)?.clone();
        Ok(Placement { cluster, previous })
    }

    fn remove_member(&self, user_id: &str) -> Result<Option<Departure>> {
        let mut inner = self.write()?;
        Ok(inner.detach(user_id, now_millis()))
    }

    fn record_plate_conflict(&self, cluster_id: ClusterId) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(cluster) = inner.clusters.get_mut(&cluster_id) {
            cluster.plate_conflicts += 1;
        }
        Ok(())
    }

    fn merge(&self, survivor: ClusterId, absorbed: ClusterId) -> Result<Cluster> {
        let mut inner = self.write()?;
        let now = now_millis();

        if survivor == absorbed {
            return Err(ClusterError::Internal {
                message: format!("cannot merge cluster {} into itself", survivor),
            });
        }
        let keep = inner.active_cluster(survivor)?.clone();
        let gone = inner.active_cluster(absorbed)?.clone();
        if keep.route_id != gone.route_id {
            return Err(ClusterError::Internal {
                message: format!(
                    "clusters {} and {} are on different routes",
                    survivor, absorbed
                ),
            });
        }
        if !keep.plates_compatible(&gone) {
            return Err(ClusterError::PlateMismatch {
                cluster_id: survivor,
                recorded: keep.plate.unwrap_or_default(),
                presented: gone.plate.unwrap_or_default(),
            });
        }

        let moved = inner.members.remove(&absorbed).unwrap_or_default();
        for user in &moved {
            if let Some(m) = inner.memberships.get_mut(user) {
                m.cluster_id = survivor;
            }
        }
        inner.members.entry(survivor).or_default().extend(moved);

        if let Some(c) = inner.clusters.get_mut(&survivor) {
            if c.plate.is_none() {
                c.plate = gone.plate.clone();
            }
            c.plate_conflicts += gone.plate_conflicts;
        }
        // Absorbed cluster is now empty; refresh deactivates it
        inner.refresh(absorbed, now);
        inner.refresh(survivor, now);

        Ok(inner.active_cluster(survivor)?.clone())
    }

    fn expire_idle(&self, older_than: i64) -> Result<ExpiryReport> {
        let mut inner = self.write()?;
        let now = now_millis();

        let mut idle: Vec<String> = inner
            .memberships
            .values()
            .filter(|m| m.timestamp < older_than)
            .map(|m| m.user_id.clone())
            .collect();
        idle.sort();

        let mut report = ExpiryReport::default();
        for user in idle {
            if let Some(departure) = inner.detach(&user, now) {
                if departure.deactivated {
                    report.deactivated_clusters.push(departure.cluster.id);
                }
                report.expired_users.push(user);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ping;

    fn membership(user: &str, route: RouteId, lat: f64, lng: f64) -> Membership {
        Membership::from_ping(&Ping::new(user, route, GpsPoint::new(lat, lng)), 0)
    }

    #[test]
    fn test_create_and_join_recomputes_centroid() {
        let store = InMemoryClusterStore::new();
        let created = store
            .create_with_member(membership("a", 1, -34.9800, -71.2400), None)
            .unwrap();
        assert_eq!(created.cluster.member_count, 1);
        assert!(created.previous.is_none());

        let mut m = membership("b", 1, -34.9802, -71.2400);
        m.cluster_id = created.cluster.id;
        let joined = store.place_member(m, None).unwrap();
        assert_eq!(joined.cluster.member_count, 2);
        assert!((joined.cluster.centroid.latitude - -34.9801).abs() < 1e-9);

        let near = store
            .active_near(1, &GpsPoint::new(-34.9801, -71.2400), 35.0)
            .unwrap();
        assert_eq!(near.len(), 1);
        assert!(near[0].distance_meters < 1.0);
    }

    #[test]
    fn test_plate_conflict_leaves_store_untouched() {
        let store = InMemoryClusterStore::new();
        let created = store
            .create_with_member(
                membership("a", 1, -34.9800, -71.2400),
                Some("BXJK12".to_string()),
            )
            .unwrap();

        let mut m = membership("b", 1, -34.9800, -71.2400);
        m.cluster_id = created.cluster.id;
        let result = store.place_member(m, Some("XXXX99".to_string()));
        assert!(matches!(result, Err(ClusterError::PlateMismatch { .. })));
        assert!(store.membership("b").unwrap().is_none());
        assert_eq!(store.cluster(created.cluster.id).unwrap().unwrap().member_count, 1);
    }

    #[test]
    fn test_move_between_clusters_deactivates_empty() {
        let store = InMemoryClusterStore::new();
        let first = store
            .create_with_member(membership("a", 1, -34.9800, -71.2400), None)
            .unwrap();
        let second = store
            .create_with_member(membership("b", 1, -34.9700, -71.2400), None)
            .unwrap();

        let mut m = membership("a", 1, -34.9700, -71.2400);
        m.cluster_id = second.cluster.id;
        let placed = store.place_member(m, None).unwrap();

        let departure = placed.previous.unwrap();
        assert_eq!(departure.cluster.id, first.cluster.id);
        assert!(departure.deactivated);
        assert_eq!(placed.cluster.member_count, 2);
        assert!(!store.cluster(first.cluster.id).unwrap().unwrap().active);
        assert!(store
            .active_near(1, &GpsPoint::new(-34.9800, -71.2400), 35.0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_place_into_inactive_cluster_fails() {
        let store = InMemoryClusterStore::new();
        let created = store
            .create_with_member(membership("a", 1, -34.98, -71.24), None)
            .unwrap();
        store.remove_member("a").unwrap();

        let mut m = membership("b", 1, -34.98, -71.24);
        m.cluster_id = created.cluster.id;
        assert!(store.place_member(m, None).is_err());
    }

    #[test]
    fn test_merge_moves_members() {
        let store = InMemoryClusterStore::new();
        let older = store
            .create_with_member(membership("a", 1, -34.9800, -71.2400), None)
            .unwrap();
        let younger = store
            .create_with_member(
                membership("b", 1, -34.9804, -71.2400),
                Some("BXJK12".to_string()),
            )
            .unwrap();

        let survivor = store.merge(older.cluster.id, younger.cluster.id).unwrap();
        assert_eq!(survivor.member_count, 2);
        assert_eq!(survivor.plate.as_deref(), Some("BXJK12"));
        assert_eq!(
            store.membership("b").unwrap().unwrap().cluster_id,
            older.cluster.id
        );
        assert!(!store.cluster(younger.cluster.id).unwrap().unwrap().active);
        assert_eq!(store.active_on_route(1).unwrap().len(), 1);
    }

    #[test]
    fn test_merge_refuses_conflicting_plates() {
        let store = InMemoryClusterStore::new();
        let a = store
            .create_with_member(membership("a", 1, -34.98, -71.24), Some("AAAA11".into()))
            .unwrap();
        let b = store
            .create_with_member(membership("b", 1, -34.98, -71.24), Some("BBBB22".into()))
            .unwrap();
        assert!(store.merge(a.cluster.id, b.cluster.id).is_err());
        assert_eq!(store.active_on_route(1).unwrap().len(), 2);
    }

    #[test]
    fn test_expire_idle() {
        let store = InMemoryClusterStore::new();
        let mut stale = membership("old", 1, -34.98, -71.24);
        stale.timestamp = 1_000;
        let created = store.create_with_member(stale, None).unwrap();
        store
            .create_with_member(membership("fresh", 1, -34.97, -71.24), None)
            .unwrap();

        let report = store.expire_idle(2_000).unwrap();
        assert_eq!(report.expired_users, vec!["old".to_string()]);
        assert_eq!(report.deactivated_clusters, vec![created.cluster.id]);
        assert_eq!(store.stats().unwrap().memberships, 1);
    }
}
