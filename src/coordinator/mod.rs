//! # Ingestion Coordinator
//!
//! Per-ping orchestration:
//!
//! 1. validate the ping and pass the per-user gate
//! 2. lock the routes involved (current membership route and claimed route)
//! 3. an explicit "not on a bus" ends in `USUARIO_SOLO`
//! 4. deviation check for users who already hold a membership
//! 5. corridor check against the claimed route
//! 6. cluster resolution via [`ClusterManager`]
//! 7. consolidation sweep around the resolved cluster
//! 8. nearest-stop lookup and outcome assembly
//!
//! Store mutations happen only while the route locks are held, so two pings
//! for the same route never interleave their read-decide-write steps.

mod gate;

#[cfg(feature = "async")]
mod async_ingestion;
#[cfg(feature = "async")]
pub use async_ingestion::AsyncIngestion;

use std::sync::Arc;

use crate::api::{ErrorBody, IngestionRequest, IngestionResponse};
use crate::config::ClusterConfig;
use crate::consolidation::{Consolidation, ConsolidationSweeper, DuplicatePair};
use crate::deviation::{Deviation, DeviationDetector, DeviationVerdict};
use crate::error::{ClusterError, Result};
use crate::manager::ClusterManager;
use crate::routes::{Geometry, RouteCatalog, RouteMatcher};
use crate::stops::{Stop, StopIndex};
use crate::store::{ClusterStore, ExpiryReport, StoreStats};
use crate::types::{Action, Cluster, Membership, Motive, Ping};
use crate::{now_millis, ClusterId, RouteId};

use gate::{RouteLocks, UserGate};

/// Result of ingesting one ping.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionOutcome {
    pub action: Action,
    /// Whether the user is considered to be riding a bus after this ping
    pub on_bus: bool,
    /// Cluster the user belongs to after this ping
    pub cluster: Option<Cluster>,
    /// Absorbed cluster id when the sweep merged two clusters
    pub consolidated_from: Option<ClusterId>,
    /// Route the user was assigned to before a deviation
    pub original_route: Option<RouteId>,
    /// Route the user appears to be following after a deviation
    pub detected_route: Option<RouteId>,
    /// Whether ejecting the user left their old cluster empty
    pub cluster_deactivated: Option<bool>,
    pub motive: Option<Motive>,
    /// Nearest stop to the ping and its distance in meters
    pub nearest_stop: Option<(Stop, f64)>,
}

impl IngestionOutcome {
    fn new(action: Action, on_bus: bool) -> Self {
        Self {
            action,
            on_bus,
            cluster: None,
            consolidated_from: None,
            original_route: None,
            detected_route: None,
            cluster_deactivated: None,
            motive: None,
            nearest_stop: None,
        }
    }

    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.cluster.as_ref().map(|c| c.id)
    }

    /// Member count of the resolved cluster, 0 when there is none.
    pub fn member_count(&self) -> u32 {
        self.cluster.as_ref().map_or(0, |c| c.member_count)
    }
}

/// Entry point for pings.
pub struct IngestionCoordinator {
    config: ClusterConfig,
    store: Arc<dyn ClusterStore>,
    matcher: RouteMatcher,
    detector: DeviationDetector,
    manager: ClusterManager,
    sweeper: ConsolidationSweeper,
    stops: StopIndex,
    gate: UserGate,
    route_locks: RouteLocks,
}

impl std::fmt::Debug for IngestionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionCoordinator")
            .field("routes", &self.matcher.catalog().len())
            .field("stops", &self.stops.len())
            .field("policy", &self.config.in_flight_policy)
            .finish()
    }
}

impl IngestionCoordinator {
    pub fn new(
        catalog: Arc<RouteCatalog>,
        store: Arc<dyn ClusterStore>,
        config: ClusterConfig,
    ) -> Self {
        let matcher = RouteMatcher::new(catalog.clone(), &config);
        log::info!(
            "[Ingestion] Coordinator ready: {} routes, policy {:?}",
            catalog.len(),
            config.in_flight_policy
        );
        Self {
            detector: DeviationDetector::new(matcher.clone(), &config),
            manager: ClusterManager::new(store.clone(), config.clone()),
            sweeper: ConsolidationSweeper::new(store.clone(), &config),
            gate: UserGate::new(config.in_flight_policy),
            route_locks: RouteLocks::new(catalog.ids()),
            stops: StopIndex::default(),
            matcher,
            store,
            config,
        }
    }

    /// Attach the stops used for `paraderosCercano`.
    pub fn with_stops(mut self, stops: StopIndex) -> Self {
        self.stops = stops;
        self
    }

    /// Swap the corridor geometry (for both the claimed-route check and
    /// deviation detection).
    pub fn with_geometry(mut self, geometry: Arc<dyn Geometry>) -> Self {
        self.matcher = self.matcher.with_geometry(geometry);
        self.detector = DeviationDetector::new(self.matcher.clone(), &self.config);
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    pub fn matcher(&self) -> &RouteMatcher {
        &self.matcher
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// Current members of a cluster.
    pub fn cluster_members(&self, cluster_id: ClusterId) -> Result<Vec<Membership>> {
        self.store.members(cluster_id)
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Ingest one ping.
    pub fn ingest_ping(&self, ping: Ping) -> Result<IngestionOutcome> {
        ping.validate()?;
        if !self.matcher.catalog().contains(ping.route_id) {
            return Err(ClusterError::UnknownRoute {
                route_id: ping.route_id,
            });
        }

        let _pass = self.gate.enter(&ping.user_id)?;

        // Memberships only move between routes under this user's gate, so the
        // route read here is still current once the locks are held.
        let current_route = self.store.membership(&ping.user_id)?.map(|m| m.route_id);
        let mut routes = vec![ping.route_id];
        routes.extend(current_route);
        let _guards = self.route_locks.lock_all(&routes);

        let membership = self.store.membership(&ping.user_id)?;
        let outcome = self.process(&ping, membership)?;

        log::debug!(
            "[Ingestion] {} on route {} -> {} (cluster {:?}, {} members)",
            ping.user_id,
            ping.route_id,
            outcome.action,
            outcome.cluster_id(),
            outcome.member_count()
        );
        Ok(outcome)
    }

    fn process(&self, ping: &Ping, membership: Option<Membership>) -> Result<IngestionOutcome> {
        if let Some(current) = &membership {
            if ping.timestamp < current.timestamp {
                if let Some(outcome) = self.stale_outcome(ping, current)? {
                    return Ok(outcome);
                }
            }
        }

        if ping.on_bus == Some(false) {
            let departure = self.store.remove_member(&ping.user_id)?;
            let mut outcome = IngestionOutcome::new(Action::Solo, false);
            outcome.cluster_deactivated = departure.map(|d| d.deactivated);
            outcome.nearest_stop = self.nearest_stop(ping);
            return Ok(outcome);
        }

        if let Some(current) = &membership {
            if let Some(deviation) = self.detector.detect(self.store.as_ref(), ping, current)? {
                return Ok(self.deviation_outcome(ping, deviation));
            }
        }

        let corridor = self
            .matcher
            .match_route(ping.route_id, &ping.position, ping.heading, ping.speed)?;
        if !corridor.in_corridor {
            let departure = match membership {
                Some(_) => self.store.remove_member(&ping.user_id)?,
                None => None,
            };
            log::info!(
                "[Ingestion] {} outside corridor of route {} ({:.0}m, heading delta {:?})",
                ping.user_id,
                ping.route_id,
                corridor.offset_meters,
                corridor.heading_delta_degrees
            );
            let mut outcome = IngestionOutcome::new(Action::OffRoute, false);
            outcome.motive = Some(corridor.motive().unwrap_or(Motive::OutsideCorridor));
            outcome.cluster_deactivated = departure.map(|d| d.deactivated);
            outcome.nearest_stop = self.nearest_stop(ping);
            return Ok(outcome);
        }

        let resolution = self.manager.register_ping(ping, membership.as_ref())?;
        if !resolution.excluded.is_empty() {
            log::debug!(
                "[Ingestion] {} skipped clusters {:?} on plate",
                ping.user_id,
                resolution.excluded
            );
        }

        let mut outcome = IngestionOutcome::new(resolution.action, true);
        outcome.cluster_deactivated = resolution.previous.as_ref().map(|d| d.deactivated);
        match self.sweeper.sweep_after(resolution.cluster.id)? {
            Some(Consolidation { survivor, absorbed }) => {
                outcome.action = Action::Consolidated;
                outcome.cluster = Some(survivor);
                outcome.consolidated_from = Some(absorbed);
            }
            None => outcome.cluster = Some(resolution.cluster),
        }
        outcome.nearest_stop = self.nearest_stop(ping);
        Ok(outcome)
    }

    /// A ping older than the stored membership changes nothing.
    fn stale_outcome(&self, ping: &Ping, current: &Membership) -> Result<Option<IngestionOutcome>> {
        let cluster = match self.store.cluster(current.cluster_id)? {
            Some(c) if c.active => c,
            _ => return Ok(None),
        };
        log::warn!(
            "[Ingestion] Stale ping for {} ({} < {}), keeping cluster {}",
            ping.user_id,
            ping.timestamp,
            current.timestamp,
            cluster.id
        );
        let mut outcome = IngestionOutcome::new(Action::Updated, true);
        outcome.cluster = Some(cluster);
        outcome.nearest_stop = self.nearest_stop(ping);
        Ok(Some(outcome))
    }

    fn deviation_outcome(&self, ping: &Ping, deviation: Deviation) -> IngestionOutcome {
        let Deviation { verdict, departure } = deviation;
        let mut outcome = match verdict {
            DeviationVerdict::Deviated { from, to, motive, .. } => {
                let mut outcome = IngestionOutcome::new(Action::Deviated, false);
                outcome.original_route = Some(from);
                outcome.detected_route = Some(to);
                outcome.motive = Some(motive);
                outcome
            }
            DeviationVerdict::OffRoute { from, motive } => {
                let mut outcome = IngestionOutcome::new(Action::OffRoute, false);
                outcome.original_route = Some(from);
                outcome.motive = Some(motive);
                outcome
            }
            // detect() never reports a stay
            DeviationVerdict::Stay => IngestionOutcome::new(Action::Updated, true),
        };
        outcome.cluster_deactivated = Some(departure.is_some_and(|d| d.deactivated));
        outcome.nearest_stop = self.nearest_stop(ping);
        outcome
    }

    fn nearest_stop(&self, ping: &Ping) -> Option<(Stop, f64)> {
        self.stops
            .nearest(
                &ping.position,
                Some(ping.route_id),
                self.config.stop_search_radius,
            )
            .map(|(stop, distance)| (stop.clone(), distance))
    }

    /// Ingest a decoded request and build the response envelope.
    pub fn ingest(&self, request: IngestionRequest) -> Result<IngestionResponse> {
        let ping = request.into_ping()?;
        self.ingest_ping(ping).map(IngestionResponse::from)
    }

    /// Ingest a raw JSON body, returning an HTTP-equivalent status and a JSON body.
    pub fn ingest_json(&self, body: &str) -> (u16, String) {
        let result = serde_json::from_str::<IngestionRequest>(body)
            .map_err(|e| ClusterError::invalid(format!("Malformed request: {}", e)))
            .and_then(|request| self.ingest(request));

        match result {
            Ok(response) => match serde_json::to_string(&response) {
                Ok(json) => (200, json),
                Err(e) => error_reply(&ClusterError::Internal {
                    message: e.to_string(),
                }),
            },
            Err(err) => {
                if err.is_recoverable() {
                    log::debug!("[Ingestion] Request rejected: {}", err);
                } else {
                    log::error!("[Ingestion] Request failed: {}", err);
                }
                error_reply(&err)
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop memberships idle for longer than the configured TTL.
    pub fn expire_idle(&self) -> Result<ExpiryReport> {
        let ttl_ms = i64::try_from(self.config.cluster_idle_ttl_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let cutoff = now_millis().saturating_sub(ttl_ms);
        let _guards = self.route_locks.lock_everything();
        let report = self.store.expire_idle(cutoff)?;
        if !report.expired_users.is_empty() {
            log::info!(
                "[Ingestion] Expired {} idle memberships, deactivated {} clusters",
                report.expired_users.len(),
                report.deactivated_clusters.len()
            );
        }
        Ok(report)
    }

    /// Full consolidation pass over one route.
    pub fn sweep_route(&self, route_id: RouteId) -> Result<Vec<Consolidation>> {
        let _guards = self.route_locks.lock_all(&[route_id]);
        self.sweeper.sweep_route(route_id)
    }

    /// Near-duplicate clusters on a route, for diagnostics.
    pub fn duplicate_pairs(&self, route_id: RouteId, radius_meters: f64) -> Result<Vec<DuplicatePair>> {
        self.sweeper.duplicate_pairs(route_id, radius_meters)
    }
}

fn error_reply(err: &ClusterError) -> (u16, String) {
    let body = ErrorBody::from(err);
    let json = serde_json::to_string(&body).unwrap_or_else(|_| {
        format!(
            "{{\"success\":false,\"error\":\"internal\",\"code\":\"{}\"}}",
            err.code()
        )
    });
    (err.status_code(), json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::Route;
    use crate::store::InMemoryClusterStore;
    use crate::GpsPoint;

    fn coordinator() -> IngestionCoordinator {
        let route = Route::new(
            1,
            vec![GpsPoint::new(-34.9800, -71.2500), GpsPoint::new(-34.9800, -71.2400)],
        )
        .unwrap();
        let catalog = Arc::new(RouteCatalog::new(vec![route]));
        IngestionCoordinator::new(
            catalog,
            Arc::new(InMemoryClusterStore::new()),
            ClusterConfig::default(),
        )
        .with_stops(StopIndex::new(vec![
            Stop::new(7, "Alameda", GpsPoint::new(-34.9802, -71.2452)).on_route(1),
        ]))
    }

    fn eastbound(user: &str, lng: f64) -> Ping {
        Ping::new(user, 1, GpsPoint::new(-34.9800, lng))
            .with_heading(90.0)
            .with_speed(8.0)
    }

    #[test]
    fn test_create_then_join() {
        let c = coordinator();
        let first = c.ingest_ping(eastbound("a", -71.2450)).unwrap();
        assert_eq!(first.action, Action::ClusterCreated);
        assert!(first.on_bus);
        assert_eq!(first.member_count(), 1);

        let second = c.ingest_ping(eastbound("b", -71.2452)).unwrap();
        assert_eq!(second.action, Action::Joined);
        assert_eq!(second.cluster_id(), first.cluster_id());
        assert_eq!(second.member_count(), 2);

        let (stop, distance) = second.nearest_stop.unwrap();
        assert_eq!(stop.id, 7);
        assert!(distance < 50.0);
    }

    #[test]
    fn test_unknown_route() {
        let c = coordinator();
        let ping = Ping::new("a", 42, GpsPoint::new(-34.9800, -71.2450));
        assert!(matches!(
            c.ingest_ping(ping),
            Err(ClusterError::UnknownRoute { route_id: 42 })
        ));
    }

    #[test]
    fn test_invalid_ping() {
        let c = coordinator();
        let ping = Ping::new("a", 1, GpsPoint::new(120.0, -71.2450));
        let err = c.ingest_ping(ping).unwrap_err();
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn test_solo_leaves_cluster() {
        let c = coordinator();
        c.ingest_ping(eastbound("a", -71.2450)).unwrap();
        let solo = c
            .ingest_ping(eastbound("a", -71.2450).with_on_bus(false))
            .unwrap();
        assert_eq!(solo.action, Action::Solo);
        assert!(!solo.on_bus);
        assert_eq!(solo.cluster_deactivated, Some(true));
        assert!(c.store().membership("a").unwrap().is_none());
    }

    /// Treats every route as a straight line through every point.
    struct Everywhere;

    impl Geometry for Everywhere {
        fn distance(&self, _a: &GpsPoint, _b: &GpsPoint) -> f64 {
            0.0
        }

        fn project_onto_corridor(
            &self,
            point: &GpsPoint,
            _heading: Option<f64>,
            _route: &Route,
            _tolerance_meters: f64,
        ) -> crate::routes::CorridorProjection {
            crate::routes::CorridorProjection {
                on_corridor: true,
                offset_meters: 0.0,
                heading_delta_degrees: None,
                segment_index: 0,
                projected: *point,
            }
        }
    }

    #[test]
    fn test_custom_geometry() {
        let c = coordinator().with_geometry(Arc::new(Everywhere));
        // ~2km off the polyline, accepted by the custom geometry
        let ping = Ping::new("a", 1, GpsPoint::new(-34.9600, -71.2450));
        let outcome = c.ingest_ping(ping).unwrap();
        assert_eq!(outcome.action, Action::ClusterCreated);
    }

    #[test]
    fn test_json_error_reply() {
        let c = coordinator();
        let (status, body) = c.ingest_json("{\"usuario_id\": 5");
        assert_eq!(status, 422);
        assert!(body.contains("INVALID_PING"));
    }
}
