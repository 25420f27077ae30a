//! Corridor membership for a single route and best-route discovery.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::error::{ClusterError, OptionExt, Result};
use crate::routes::{Geometry, HaversineGeometry, Route, RouteCatalog};
use crate::types::{Motive, Ping};
use crate::{GpsPoint, RouteId};

/// Heading to use for the corridor heading check.
///
/// Returns `None` (skip the check) when the heading is unknown or negative, or
/// when the device reports it is standing still.
pub fn effective_heading(heading: Option<f64>, speed: Option<f64>) -> Option<f64> {
    let heading = heading.filter(|h| h.is_finite() && *h >= 0.0)?;
    match speed {
        Some(s) if s <= 0.0 => None,
        _ => Some(heading.rem_euclid(360.0)),
    }
}

/// Result of checking a ping against one route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorridorMatch {
    pub route_id: RouteId,
    /// Offset and heading both within tolerance
    pub in_corridor: bool,
    pub within_offset: bool,
    pub heading_ok: bool,
    pub offset_meters: f64,
    /// `None` when the heading check was skipped
    pub heading_delta_degrees: Option<f64>,
    pub segment_index: usize,
}

impl CorridorMatch {
    /// Heading delta used for ranking (a skipped check counts as a perfect match).
    pub fn heading_rank(&self) -> f64 {
        self.heading_delta_degrees.unwrap_or(0.0)
    }

    /// Why this match failed, if it did.
    pub fn motive(&self) -> Option<Motive> {
        if !self.within_offset {
            Some(Motive::OutsideCorridor)
        } else if !self.heading_ok {
            Some(Motive::HeadingMismatch)
        } else {
            None
        }
    }

    /// Ordering for best-route selection: smaller offset, then smaller heading
    /// delta, then lower route id.
    pub fn rank_cmp(&self, other: &CorridorMatch) -> Ordering {
        self.offset_meters
            .total_cmp(&other.offset_meters)
            .then(self.heading_rank().total_cmp(&other.heading_rank()))
            .then(self.route_id.cmp(&other.route_id))
    }

    pub(crate) fn into_error(self) -> ClusterError {
        ClusterError::OutOfCorridor {
            route_id: self.route_id,
            offset_meters: self.offset_meters,
            heading_delta_degrees: self.heading_rank(),
        }
    }
}

/// Decides whether pings are on a route, and which route fits best.
#[derive(Clone)]
pub struct RouteMatcher {
    catalog: Arc<RouteCatalog>,
    geometry: Arc<dyn Geometry>,
    offset_tolerance: f64,
    heading_tolerance: f64,
}

impl std::fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatcher")
            .field("routes", &self.catalog.len())
            .field("offset_tolerance", &self.offset_tolerance)
            .field("heading_tolerance", &self.heading_tolerance)
            .finish()
    }
}

impl RouteMatcher {
    /// Create a matcher with the default haversine geometry.
    pub fn new(catalog: Arc<RouteCatalog>, config: &ClusterConfig) -> Self {
        Self {
            catalog,
            geometry: Arc::new(HaversineGeometry),
            offset_tolerance: config.route_offset_meters,
            heading_tolerance: config.route_heading_delta,
        }
    }

    /// Swap the GIS backend.
    pub fn with_geometry(mut self, geometry: Arc<dyn Geometry>) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn catalog(&self) -> &Arc<RouteCatalog> {
        &self.catalog
    }

    pub fn geometry(&self) -> &Arc<dyn Geometry> {
        &self.geometry
    }

    /// Offset tolerance for a route: its own half-width when set, else the global one.
    pub fn tolerance_for(&self, route: &Route) -> f64 {
        route.corridor_half_width().unwrap_or(self.offset_tolerance)
    }

    /// Check one point against one route.
    pub fn match_corridor(
        &self,
        route: &Route,
        point: &GpsPoint,
        heading: Option<f64>,
        speed: Option<f64>,
    ) -> CorridorMatch {
        let tolerance = self.tolerance_for(route);
        let heading = effective_heading(heading, speed);
        let projection = self
            .geometry
            .project_onto_corridor(point, heading, route, tolerance);

        let within_offset = projection.offset_meters <= tolerance;
        let heading_ok = projection
            .heading_delta_degrees
            .map_or(true, |d| d <= self.heading_tolerance);

        CorridorMatch {
            route_id: route.id(),
            in_corridor: within_offset && heading_ok,
            within_offset,
            heading_ok,
            offset_meters: projection.offset_meters,
            heading_delta_degrees: projection.heading_delta_degrees,
            segment_index: projection.segment_index,
        }
    }

    /// Check one point against a route looked up by id.
    pub fn match_route(
        &self,
        route_id: RouteId,
        point: &GpsPoint,
        heading: Option<f64>,
        speed: Option<f64>,
    ) -> Result<CorridorMatch> {
        let route = self.catalog.get(route_id).ok_or_unknown_route(route_id)?;
        Ok(self.match_corridor(route, point, heading, speed))
    }

    /// Corridor check for a ping's claimed route.
    ///
    /// Fails with `OutOfCorridor` when the ping is off the route and with
    /// `UnknownRoute` when the route does not exist.
    pub fn check(&self, route_id: RouteId, ping: &Ping) -> Result<CorridorMatch> {
        let m = self.match_route(route_id, &ping.position, ping.heading, ping.speed)?;
        if m.in_corridor {
            Ok(m)
        } else {
            Err(m.into_error())
        }
    }

    /// Score every route passing near the point (in or out of corridor).
    pub fn score_all(
        &self,
        point: &GpsPoint,
        heading: Option<f64>,
        speed: Option<f64>,
    ) -> Vec<CorridorMatch> {
        let radius = self.offset_tolerance.max(self.catalog.max_half_width());
        let candidates = self.catalog.candidate_routes(point, radius);
        self.score_candidates(&candidates, point, heading, speed)
    }

    #[cfg(not(feature = "parallel"))]
    fn score_candidates(
        &self,
        candidates: &[RouteId],
        point: &GpsPoint,
        heading: Option<f64>,
        speed: Option<f64>,
    ) -> Vec<CorridorMatch> {
        candidates
            .iter()
            .filter_map(|id| self.catalog.get(*id))
            .map(|route| self.match_corridor(route, point, heading, speed))
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn score_candidates(
        &self,
        candidates: &[RouteId],
        point: &GpsPoint,
        heading: Option<f64>,
        speed: Option<f64>,
    ) -> Vec<CorridorMatch> {
        use rayon::prelude::*;

        candidates
            .par_iter()
            .filter_map(|id| self.catalog.get(*id))
            .map(|route| self.match_corridor(route, point, heading, speed))
            .collect()
    }

    /// Best in-corridor route for a point, if any.
    ///
    /// Ties break by smallest offset, then smallest heading delta, then lowest
    /// route id.
    pub fn best_route(
        &self,
        point: &GpsPoint,
        heading: Option<f64>,
        speed: Option<f64>,
    ) -> Option<(RouteId, CorridorMatch)> {
        self.score_all(point, heading, speed)
            .into_iter()
            .filter(|m| m.in_corridor)
            .min_by(|a, b| a.rank_cmp(b))
            .map(|m| (m.route_id, m))
    }
}
