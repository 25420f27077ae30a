//! # Routes
//!
//! Route polylines, the spatially indexed route catalog, corridor geometry and
//! the matcher that decides whether a ping is on a route.
//!
//! Routes are immutable once loaded. The catalog keeps an R-tree of segment
//! bounding boxes so that best-route discovery only scores routes that pass
//! near the ping.

mod geometry;
mod matcher;

pub use geometry::{CorridorProjection, Geometry, HaversineGeometry};
pub use matcher::{effective_heading, CorridorMatch, RouteMatcher};

use std::collections::BTreeMap;

use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::geo_utils::{bearing_degrees, bounds_around, haversine_distance};
use crate::{Bounds, GpsPoint, RouteId};

// ============================================================================
// Route
// ============================================================================

/// A declared bus route: an ordered polyline with a heading per segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    id: RouteId,
    name: Option<String>,
    points: Vec<GpsPoint>,
    corridor_half_width: Option<f64>,
    headings: Vec<f64>,
}

impl Route {
    /// Build a route from its polyline. Segment headings are derived from the
    /// polyline bearing.
    pub fn new(id: RouteId, points: Vec<GpsPoint>) -> Result<Self> {
        if points.len() < 2 {
            return Err(ClusterError::InvalidRoute {
                route_id: id,
                message: format!("needs at least 2 points, got {}", points.len()),
            });
        }
        if let Some(bad) = points.iter().position(|p| !p.is_valid()) {
            return Err(ClusterError::InvalidRoute {
                route_id: id,
                message: format!("point {} has invalid coordinates", bad),
            });
        }

        let headings = points
            .windows(2)
            .map(|w| bearing_degrees(&w[0], &w[1]))
            .collect();

        Ok(Self {
            id,
            name: None,
            points,
            corridor_half_width: None,
            headings,
        })
    }

    /// Attach a display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the global corridor tolerance for this route.
    pub fn with_corridor_half_width(mut self, meters: f64) -> Result<Self> {
        if !(meters.is_finite() && meters > 0.0) {
            return Err(ClusterError::InvalidRoute {
                route_id: self.id,
                message: format!("corridor half-width must be positive, got {}", meters),
            });
        }
        self.corridor_half_width = Some(meters);
        Ok(self)
    }

    /// Replace the derived segment headings with explicit ones.
    pub fn with_headings(mut self, headings: Vec<f64>) -> Result<Self> {
        if headings.len() != self.points.len() - 1 {
            return Err(ClusterError::InvalidRoute {
                route_id: self.id,
                message: format!(
                    "expected {} segment headings, got {}",
                    self.points.len() - 1,
                    headings.len()
                ),
            });
        }
        if headings.iter().any(|h| !h.is_finite()) {
            return Err(ClusterError::InvalidRoute {
                route_id: self.id,
                message: "segment headings must be finite".to_string(),
            });
        }
        self.headings = headings.into_iter().map(|h| h.rem_euclid(360.0)).collect();
        Ok(self)
    }

    pub fn id(&self) -> RouteId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn points(&self) -> &[GpsPoint] {
        &self.points
    }

    pub fn corridor_half_width(&self) -> Option<f64> {
        self.corridor_half_width
    }

    /// Expected heading of each segment, in degrees from north.
    pub fn headings(&self) -> &[f64] {
        &self.headings
    }

    /// Iterate `(segment_index, start, end, heading)`.
    pub fn segments(&self) -> impl Iterator<Item = (usize, &GpsPoint, &GpsPoint, f64)> + '_ {
        self.points
            .windows(2)
            .zip(self.headings.iter())
            .enumerate()
            .map(|(i, (w, &h))| (i, &w[0], &w[1], h))
    }

    pub fn bounds(&self) -> Bounds {
        // Route::new guarantees at least two points
        Bounds::from_points(&self.points).unwrap_or(Bounds {
            min_lat: 0.0,
            max_lat: 0.0,
            min_lng: 0.0,
            max_lng: 0.0,
        })
    }

    /// Total polyline length in meters.
    pub fn length_meters(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| haversine_distance(&w[0], &w[1]))
            .sum()
    }
}

// ============================================================================
// Route Catalog
// ============================================================================

/// Segment bounding box for R-tree spatial indexing
#[derive(Debug, Clone)]
struct SegmentBounds {
    route_id: RouteId,
    bounds: Bounds,
}

impl RTreeObject for SegmentBounds {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds.envelope()
    }
}

/// All known routes plus a segment-level spatial index.
#[derive(Debug)]
pub struct RouteCatalog {
    routes: BTreeMap<RouteId, Route>,
    index: RTree<SegmentBounds>,
    max_half_width: f64,
}

impl RouteCatalog {
    /// Build a catalog. A later route with a duplicate id replaces the earlier one.
    pub fn new(routes: Vec<Route>) -> Self {
        let mut by_id = BTreeMap::new();
        for route in routes {
            if by_id.insert(route.id, route).is_some() {
                log::warn!("[RouteCatalog] Duplicate route id, keeping the last definition");
            }
        }

        let entries: Vec<SegmentBounds> = by_id
            .values()
            .flat_map(|route| {
                route.points.windows(2).filter_map(move |w| {
                    Bounds::from_points(w).map(|bounds| SegmentBounds {
                        route_id: route.id,
                        bounds,
                    })
                })
            })
            .collect();

        let max_half_width = by_id
            .values()
            .filter_map(|r| r.corridor_half_width)
            .fold(0.0_f64, f64::max);

        log::info!(
            "[RouteCatalog] Loaded {} routes ({} segments)",
            by_id.len(),
            entries.len()
        );

        Self {
            routes: by_id,
            index: RTree::bulk_load(entries),
            max_half_width,
        }
    }

    pub fn get(&self, id: RouteId) -> Option<&Route> {
        self.routes.get(&id)
    }

    pub fn contains(&self, id: RouteId) -> bool {
        self.routes.contains_key(&id)
    }

    /// Route ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = RouteId> + '_ {
        self.routes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Largest per-route corridor half-width (0 when no route overrides it).
    pub fn max_half_width(&self) -> f64 {
        self.max_half_width
    }

    /// Routes with at least one segment whose bounding box comes within
    /// `radius_meters` of `point`. Ascending by id, no duplicates.
    pub fn candidate_routes(&self, point: &GpsPoint, radius_meters: f64) -> Vec<RouteId> {
        let search = bounds_around(point, radius_meters).envelope();
        let mut ids: Vec<RouteId> = self
            .index
            .locate_in_envelope_intersecting(&search)
            .map(|s| s.route_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
