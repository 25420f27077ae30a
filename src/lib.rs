//! # Bus Cluster
//!
//! Real-time passenger ping clustering and route corridor matching.
//!
//! Passengers riding a bus send periodic location pings. This library groups
//! pings that plausibly come from the same vehicle into clusters, checks that
//! every ping lies inside the corridor of the route it claims, notices when a
//! passenger drifts onto another route, and merges duplicate clusters created
//! by racing pings.
//!
//! ## Components
//!
//! - [`RouteMatcher`] - corridor membership and best-route discovery
//! - [`ClusterStore`] - cluster and membership storage (in-memory, optional SQLite)
//! - [`ClusterManager`] - find-or-create-or-join as an ordered list of strategies
//! - [`DeviationDetector`] - drift detection for users already in a cluster
//! - [`ConsolidationSweeper`] - merges near-duplicate clusters after each ping
//! - [`IngestionCoordinator`] - per-ping orchestration with per-user and per-route locking
//!
//! ## Features
//!
//! - **`parallel`** - Score candidate routes in parallel with rayon
//! - **`persistence`** - SQLite-backed cluster store and route catalog
//! - **`async`** - Tokio wrapper around the coordinator
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use bus_cluster::{
//!     Action, ClusterConfig, GpsPoint, InMemoryClusterStore, IngestionCoordinator, Ping,
//!     Route, RouteCatalog,
//! };
//!
//! let route = Route::new(
//!     1,
//!     vec![GpsPoint::new(-34.9800, -71.2500), GpsPoint::new(-34.9800, -71.2400)],
//! )
//! .unwrap();
//! let catalog = Arc::new(RouteCatalog::new(vec![route]));
//! let store = Arc::new(InMemoryClusterStore::new());
//! let coordinator = IngestionCoordinator::new(catalog, store, ClusterConfig::default());
//!
//! let ping = Ping::new("rider-1", 1, GpsPoint::new(-34.9800, -71.2450))
//!     .with_heading(90.0)
//!     .with_speed(8.0);
//! let outcome = coordinator.ingest_ping(ping).unwrap();
//! assert_eq!(outcome.action, Action::ClusterCreated);
//! ```

use rstar::AABB;
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{ClusterError, OptionExt, Result};

// Thresholds and environment overrides
pub mod config;
pub use config::{ClusterConfig, InFlightPolicy, DEFAULT_CONFIG};

// Geographic utilities (distance, bearing, projections)
pub mod geo_utils;

// Route catalog, corridor geometry and matching
pub mod routes;
pub use routes::{
    CorridorMatch, CorridorProjection, Geometry, HaversineGeometry, Route, RouteCatalog,
    RouteMatcher,
};

// Nearest stop lookup
pub mod stops;
pub use stops::{Stop, StopIndex};

// Pings, clusters, memberships and outcomes
pub mod types;
pub use types::{
    normalize_plate, Action, Cluster, Departure, Membership, Motive, Nearby, Ping, Placement,
};

// Cluster storage
pub mod store;
#[cfg(feature = "persistence")]
pub use store::SqliteClusterStore;
pub use store::{ClusterStore, ExpiryReport, InMemoryClusterStore, StoreStats};

// Find-or-create-or-join engine
pub mod manager;
pub use manager::{ClusterManager, JoinContext, JoinStrategy, Resolution};

// Route drift detection
pub mod deviation;
pub use deviation::{DeviationDetector, DeviationVerdict};

// Duplicate cluster merging
pub mod consolidation;
pub use consolidation::{Consolidation, ConsolidationSweeper};

// Per-ping orchestration
pub mod coordinator;
#[cfg(feature = "async")]
pub use coordinator::AsyncIngestion;
pub use coordinator::{IngestionCoordinator, IngestionOutcome};

// Request/response contract
pub mod api;
pub use api::{ErrorBody, IngestionRequest, IngestionResponse, ResponseData, StopInfo};

// ============================================================================
// Core Types
// ============================================================================

/// Route identifier.
pub type RouteId = u32;

/// Cluster identifier.
pub type ClusterId = u64;

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use bus_cluster::GpsPoint;
/// let point = GpsPoint::new(-34.9816, -71.2443); // Curicó
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Grow the box by a margin given in degrees.
    pub fn expanded(&self, dlat: f64, dlng: f64) -> Self {
        Self {
            min_lat: self.min_lat - dlat,
            max_lat: self.max_lat + dlat,
            min_lng: self.min_lng - dlng,
            max_lng: self.max_lng + dlng,
        }
    }

    /// R-tree envelope, `[lng, lat]` ordered.
    pub fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
