//! # Cluster Store
//!
//! Storage for clusters and memberships behind the [`ClusterStore`] trait.
//!
//! ## Locking responsibilities
//!
//! Every method is atomic on its own: it either applies completely or leaves
//! the store as it was. The store does NOT serialize read-decide-write
//! sequences across calls. Callers that read (e.g. `active_near`) and then
//! write based on what they saw must hold the route lock for the routes
//! involved, which is what the ingestion coordinator does.
//!
//! ## Implementations
//!
//! - [`InMemoryClusterStore`] - `RwLock`-guarded maps with a per-route R-tree
//! - `SqliteClusterStore` (feature `persistence`) - one transaction per mutation

mod memory;
mod spatial;
#[cfg(feature = "persistence")]
mod sqlite;

pub use memory::InMemoryClusterStore;
#[cfg(feature = "persistence")]
pub use sqlite::SqliteClusterStore;

use serde::Serialize;

use crate::error::Result;
use crate::geo_utils::{compute_center, haversine_distance};
use crate::types::{Cluster, Departure, Membership, Nearby, Placement};
use crate::{ClusterId, GpsPoint, RouteId};

/// Store-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub clusters: usize,
    pub active_clusters: usize,
    pub memberships: usize,
    pub plate_conflicts: u64,
}

/// Result of an idle sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpiryReport {
    pub expired_users: Vec<String>,
    pub deactivated_clusters: Vec<ClusterId>,
}

/// Cluster and membership storage.
pub trait ClusterStore: Send + Sync {
    // ------------------------------------------------------------------
    // Reads (each a consistent snapshot)
    // ------------------------------------------------------------------

    fn cluster(&self, id: ClusterId) -> Result<Option<Cluster>>;

    /// Active clusters on `route_id` within `radius_meters` of `point`, nearest
    /// first, lower id first on an exact distance tie.
    fn active_near(&self, route_id: RouteId, point: &GpsPoint, radius_meters: f64)
        -> Result<Vec<Nearby>>;

    /// Active clusters on a route, ascending by id.
    fn active_on_route(&self, route_id: RouteId) -> Result<Vec<Cluster>>;

    fn membership(&self, user_id: &str) -> Result<Option<Membership>>;

    /// Members of a cluster, ascending by user id.
    fn members(&self, cluster_id: ClusterId) -> Result<Vec<Membership>>;

    fn stats(&self) -> Result<StoreStats>;

    // ------------------------------------------------------------------
    // Mutations (each atomic)
    // ------------------------------------------------------------------

    /// Create a cluster seeded with one member.
    ///
    /// The user's previous membership, if any, is removed in the same step.
    /// `membership.cluster_id` is ignored.
    fn create_with_member(&self, membership: Membership, plate: Option<String>)
        -> Result<Placement>;

    /// Insert or replace a user's membership in an existing active cluster.
    ///
    /// Leaving the previous cluster, joining the target, claiming the plate
    /// and recomputing both centroids happen in one step. Fails with
    /// `PlateMismatch` (store untouched) if `claim_plate` conflicts with the
    /// target's recorded plate.
    fn place_member(&self, membership: Membership, claim_plate: Option<String>)
        -> Result<Placement>;

    /// Remove a user's membership. Empty clusters are deactivated.
    fn remove_member(&self, user_id: &str) -> Result<Option<Departure>>;

    /// Count a turned-away plate against a cluster.
    fn record_plate_conflict(&self, cluster_id: ClusterId) -> Result<()>;

    /// Move every member of `absorbed` into `survivor` and deactivate `absorbed`.
    ///
    /// Both clusters must be active. The survivor inherits the absorbed plate
    /// when it has none. Returns the updated survivor.
    fn merge(&self, survivor: ClusterId, absorbed: ClusterId) -> Result<Cluster>;

    /// Drop memberships last updated before `older_than` (unix millis).
    fn expire_idle(&self, older_than: i64) -> Result<ExpiryReport>;
}

/// Centroid of a member set, falling back to `previous` for an empty set.
pub(crate) fn centroid_of<'a, I>(members: I, previous: GpsPoint) -> GpsPoint
where
    I: IntoIterator<Item = &'a Membership>,
{
    compute_center(members.into_iter().map(|m| &m.position)).unwrap_or(previous)
}

/// Filter clusters to `radius_meters` around `point` and order them nearest
/// first (lower id on a tie).
pub(crate) fn rank_nearby<I>(clusters: I, point: &GpsPoint, radius_meters: f64) -> Vec<Nearby>
where
    I: IntoIterator<Item = Cluster>,
{
    let mut nearby: Vec<Nearby> = clusters
        .into_iter()
        .filter(|c| c.active)
        .map(|c| Nearby {
            distance_meters: haversine_distance(point, &c.centroid),
            cluster: c,
        })
        .filter(|n| n.distance_meters <= radius_meters)
        .collect();
    nearby.sort_by(|a, b| {
        a.distance_meters
            .total_cmp(&b.distance_meters)
            .then(a.cluster.id.cmp(&b.cluster.id))
    });
    nearby
}
