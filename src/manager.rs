//! # Cluster Manager
//!
//! Find-or-create-or-join, expressed as an ordered list of join strategies.
//! Each strategy either resolves the ping or passes. The default order is:
//!
//! 1. [`ExistingMembership`] - refresh the user's current cluster
//! 2. [`NearestCluster`] at `proximity_threshold` - `UNIDO_A_CLUSTER`
//! 3. [`NearestCluster`] at `amplified_threshold` - `UNIDO_A_CLUSTER_AMPLIADO`
//! 4. [`CreateCluster`] - `CLUSTER_CREADO`
//!
//! Clusters whose plate conflicts with the ping are recorded and excluded for
//! the rest of the search.
//!
//! The manager does no locking of its own; callers hold the route lock.

use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::store::ClusterStore;
use crate::types::{Action, Cluster, Departure, Membership, Ping, Placement};
use crate::ClusterId;

/// Outcome of registering a ping.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub action: Action,
    /// The user's cluster after this ping
    pub cluster: Cluster,
    /// Cluster the user left as part of this resolution
    pub previous: Option<Departure>,
    /// Clusters skipped because of a plate conflict
    pub excluded: Vec<ClusterId>,
}

impl Resolution {
    fn from_placement(action: Action, placement: Placement) -> Self {
        Self {
            action,
            cluster: placement.cluster,
            previous: placement.previous,
            excluded: Vec::new(),
        }
    }
}

/// State shared by the strategies while resolving one ping.
pub struct JoinContext<'a> {
    pub ping: &'a Ping,
    /// The user's membership as read under the route lock
    pub membership: Option<&'a Membership>,
    pub store: &'a dyn ClusterStore,
    pub config: &'a ClusterConfig,
    excluded: Vec<ClusterId>,
}

impl<'a> JoinContext<'a> {
    pub fn new(
        ping: &'a Ping,
        membership: Option<&'a Membership>,
        store: &'a dyn ClusterStore,
        config: &'a ClusterConfig,
    ) -> Self {
        Self {
            ping,
            membership,
            store,
            config,
            excluded: Vec::new(),
        }
    }

    pub fn is_excluded(&self, cluster_id: ClusterId) -> bool {
        self.excluded.contains(&cluster_id)
    }

    pub fn excluded(&self) -> &[ClusterId] {
        &self.excluded
    }

    /// Drop a cluster from the search after a plate conflict.
    ///
    /// The conflict is only counted against the cluster once the ping is
    /// resolved, so a failed placement leaves the counters untouched.
    pub fn reject_for_plate(&mut self, err: &ClusterError) {
        let ClusterError::PlateMismatch {
            cluster_id,
            recorded,
            presented,
        } = err
        else {
            return;
        };
        log::warn!(
            "[ClusterManager] User {} plate '{}' conflicts with cluster {} ('{}')",
            self.ping.user_id,
            presented,
            cluster_id,
            recorded
        );
        if !self.is_excluded(*cluster_id) {
            self.excluded.push(*cluster_id);
        }
    }
}

/// One step of the find-or-create search.
pub trait JoinStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolve the ping, or return `None` to let the next strategy try.
    fn try_join(&self, ctx: &mut JoinContext<'_>) -> Result<Option<Resolution>>;
}

// ============================================================================
// Strategies
// ============================================================================

/// Keep a user in the cluster they already belong to on the claimed route.
#[derive(Debug, Default)]
pub struct ExistingMembership;

impl JoinStrategy for ExistingMembership {
    fn name(&self) -> &'static str {
        "existing-membership"
    }

    fn try_join(&self, ctx: &mut JoinContext<'_>) -> Result<Option<Resolution>> {
        let Some(current) = ctx.membership else {
            return Ok(None);
        };
        if current.route_id != ctx.ping.route_id {
            return Ok(None);
        }
        let cluster = match ctx.store.cluster(current.cluster_id)? {
            Some(c) if c.active => c,
            _ => return Ok(None),
        };

        if ctx.ping.timestamp < current.timestamp {
            log::warn!(
                "[ClusterManager] Stale ping for {} ({} < {}), keeping stored position",
                ctx.ping.user_id,
                ctx.ping.timestamp,
                current.timestamp
            );
            return Ok(Some(Resolution {
                action: Action::Updated,
                cluster,
                previous: None,
                excluded: Vec::new(),
            }));
        }

        // Existing members are never barred by the strict plate rule
        if let Err(e) = cluster.plate_check(ctx.ping.plate.as_deref(), false) {
            ctx.reject_for_plate(&e);
            return Ok(None);
        }

        let placement = ctx.store.place_member(
            Membership::from_ping(ctx.ping, cluster.id),
            ctx.ping.plate.clone(),
        )?;
        log::debug!(
            "[ClusterManager] {} refreshed in cluster {}",
            ctx.ping.user_id,
            placement.cluster.id
        );
        Ok(Some(Resolution::from_placement(Action::Updated, placement)))
    }
}

/// Join the nearest plate-compatible active cluster within a radius.
#[derive(Debug)]
pub struct NearestCluster {
    pub radius_meters: f64,
    pub action: Action,
}

impl NearestCluster {
    pub fn new(radius_meters: f64, action: Action) -> Self {
        Self {
            radius_meters,
            action,
        }
    }
}

impl JoinStrategy for NearestCluster {
    fn name(&self) -> &'static str {
        match self.action {
            Action::JoinedAmplified => "nearest-cluster-amplified",
            _ => "nearest-cluster",
        }
    }

    fn try_join(&self, ctx: &mut JoinContext<'_>) -> Result<Option<Resolution>> {
        let nearby = ctx.store.active_near(
            ctx.ping.route_id,
            &ctx.ping.position,
            self.radius_meters,
        )?;
        let strict = ctx.config.strict_plate_after_conflict;

        for candidate in nearby {
            let cluster = candidate.cluster;
            if ctx.is_excluded(cluster.id) {
                continue;
            }
            if let Err(e) = cluster.plate_check(ctx.ping.plate.as_deref(), strict) {
                ctx.reject_for_plate(&e);
                continue;
            }

            let membership = Membership::from_ping(ctx.ping, cluster.id);
            match ctx.store.place_member(membership, ctx.ping.plate.clone()) {
                Ok(placement) => {
                    log::debug!(
                        "[ClusterManager] {} joined cluster {} at {:.1}m ({})",
                        ctx.ping.user_id,
                        cluster.id,
                        candidate.distance_meters,
                        self.action
                    );
                    return Ok(Some(Resolution::from_placement(self.action, placement)));
                }
                Err(e @ ClusterError::PlateMismatch { .. }) => {
                    ctx.reject_for_plate(&e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// Start a new cluster seeded with the ping.
#[derive(Debug, Default)]
pub struct CreateCluster;

impl JoinStrategy for CreateCluster {
    fn name(&self) -> &'static str {
        "create-cluster"
    }

    fn try_join(&self, ctx: &mut JoinContext<'_>) -> Result<Option<Resolution>> {
        let placement = ctx
            .store
            .create_with_member(Membership::from_ping(ctx.ping, 0), ctx.ping.plate.clone())?;
        log::info!(
            "[ClusterManager] Created cluster {} on route {} for {}",
            placement.cluster.id,
            placement.cluster.route_id,
            ctx.ping.user_id
        );
        Ok(Some(Resolution::from_placement(
            Action::ClusterCreated,
            placement,
        )))
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Runs the join strategies in order until one resolves the ping.
pub struct ClusterManager {
    store: Arc<dyn ClusterStore>,
    config: ClusterConfig,
    strategies: Vec<Box<dyn JoinStrategy>>,
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("ClusterManager")
            .field("strategies", &names)
            .finish()
    }
}

impl ClusterManager {
    /// Manager with the default strategy order.
    pub fn new(store: Arc<dyn ClusterStore>, config: ClusterConfig) -> Self {
        let strategies: Vec<Box<dyn JoinStrategy>> = vec![
            Box::new(ExistingMembership),
            Box::new(NearestCluster::new(
                config.proximity_threshold,
                Action::Joined,
            )),
            Box::new(NearestCluster::new(
                config.amplified_threshold,
                Action::JoinedAmplified,
            )),
            Box::new(CreateCluster),
        ];
        Self::with_strategies(store, config, strategies)
    }

    /// Manager with a custom strategy list.
    pub fn with_strategies(
        store: Arc<dyn ClusterStore>,
        config: ClusterConfig,
        strategies: Vec<Box<dyn JoinStrategy>>,
    ) -> Self {
        Self {
            store,
            config,
            strategies,
        }
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    /// Count plate conflicts against the clusters a resolved ping skipped.
    ///
    /// The placement is already committed, so a failure here is logged
    /// rather than turned into a failed request.
    fn record_conflicts(&self, excluded: &[ClusterId]) {
        for &cluster_id in excluded {
            if let Err(e) = self.store.record_plate_conflict(cluster_id) {
                log::error!(
                    "[ClusterManager] Could not record plate conflict on cluster {}: {}",
                    cluster_id,
                    e
                );
            }
        }
    }

    /// Find, join or create a cluster for the ping.
    ///
    /// `membership` is the user's current membership, read under the route lock.
    pub fn register_ping(&self, ping: &Ping, membership: Option<&Membership>) -> Result<Resolution> {
        let mut ctx = JoinContext::new(ping, membership, self.store.as_ref(), &self.config);

        for strategy in &self.strategies {
            if let Some(mut resolution) = strategy.try_join(&mut ctx)? {
                log::debug!(
                    "[ClusterManager] {} resolved by {} -> {} (cluster {})",
                    ping.user_id,
                    strategy.name(),
                    resolution.action,
                    resolution.cluster.id
                );
                resolution.excluded = ctx.excluded().to_vec();
                self.record_conflicts(&resolution.excluded);
                return Ok(resolution);
            }
        }

        Err(ClusterError::Internal {
            message: format!("no join strategy resolved ping for {}", ping.user_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryClusterStore;
    use crate::GpsPoint;

    fn manager() -> ClusterManager {
        ClusterManager::new(Arc::new(InMemoryClusterStore::new()), ClusterConfig::default())
    }

    fn ping(user: &str, lat: f64) -> Ping {
        Ping::new(user, 1, GpsPoint::new(lat, -71.2400))
    }

    fn register(m: &ClusterManager, p: &Ping) -> Resolution {
        let membership = m.store().membership(&p.user_id).unwrap();
        m.register_ping(p, membership.as_ref()).unwrap()
    }

    #[test]
    fn test_create_then_join() {
        let m = manager();
        let first = register(&m, &ping("a", -34.9800));
        assert_eq!(first.action, Action::ClusterCreated);

        // ~22m away
        let second = register(&m, &ping("b", -34.9802));
        assert_eq!(second.action, Action::Joined);
        assert_eq!(second.cluster.id, first.cluster.id);
        assert_eq!(second.cluster.member_count, 2);
    }

    #[test]
    fn test_amplified_join() {
        let m = manager();
        let first = register(&m, &ping("a", -34.9800));
        // ~67m away: beyond 35m, within 100m
        let second = register(&m, &ping("b", -34.9806));
        assert_eq!(second.action, Action::JoinedAmplified);
        assert_eq!(second.cluster.id, first.cluster.id);
    }

    #[test]
    fn test_far_ping_creates() {
        let m = manager();
        let first = register(&m, &ping("a", -34.9800));
        let second = register(&m, &ping("b", -34.9820));
        assert_eq!(second.action, Action::ClusterCreated);
        assert_ne!(second.cluster.id, first.cluster.id);
    }

    #[test]
    fn test_existing_member_updates() {
        let m = manager();
        let first = register(&m, &ping("a", -34.9800));
        let again = register(&m, &ping("a", -34.9801));
        assert_eq!(again.action, Action::Updated);
        assert_eq!(again.cluster.id, first.cluster.id);
        assert_eq!(again.cluster.member_count, 1);
    }

    #[test]
    fn test_stale_ping_keeps_state() {
        let m = manager();
        register(&m, &ping("a", -34.9800).with_timestamp(2_000));
        let stale = register(&m, &ping("a", -34.9810).with_timestamp(1_000));
        assert_eq!(stale.action, Action::Updated);
        let stored = m.store().membership("a").unwrap().unwrap();
        assert_eq!(stored.position.latitude, -34.9800);
        assert_eq!(stored.timestamp, 2_000);
    }

    #[test]
    fn test_plate_conflict_skips_cluster() {
        let m = manager();
        let plated = register(&m, &ping("a", -34.9800).with_plate("BXJK12"));

        let other = register(&m, &ping("b", -34.9801).with_plate("XXXX99"));
        assert_eq!(other.action, Action::ClusterCreated);
        assert_eq!(other.excluded, vec![plated.cluster.id]);

        let conflicts = m.store().cluster(plated.cluster.id).unwrap().unwrap().plate_conflicts;
        assert_eq!(conflicts, 1);
    }

    #[test]
    fn test_member_changing_plate_moves_out() {
        let m = manager();
        let plated = register(&m, &ping("a", -34.9800).with_plate("BXJK12"));
        register(&m, &ping("b", -34.9800).with_plate("BXJK12"));

        let moved = register(&m, &ping("b", -34.9800).with_plate("XXXX99"));
        assert_eq!(moved.action, Action::ClusterCreated);
        let departure = moved.previous.unwrap();
        assert_eq!(departure.cluster.id, plated.cluster.id);
        assert_eq!(departure.cluster.member_count, 1);
    }

    struct Never;

    impl JoinStrategy for Never {
        fn name(&self) -> &'static str {
            "never"
        }

        fn try_join(&self, _ctx: &mut JoinContext<'_>) -> Result<Option<Resolution>> {
            Ok(None)
        }
    }

    #[test]
    fn test_unresolved_is_internal_error() {
        let m = ClusterManager::with_strategies(
            Arc::new(InMemoryClusterStore::new()),
            ClusterConfig::default(),
            vec![Box::new(Never)],
        );
        let result = m.register_ping(&ping("a", -34.98), None);
        assert!(matches!(result, Err(ClusterError::Internal { .. })));
    }
}
