//! Bus stops ("paraderos") and nearest-stop lookup.

use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{bounds_around, haversine_distance};
use crate::{GpsPoint, RouteId};

/// A known bus stop. A stop without a route id serves every route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: u32,
    pub name: String,
    pub position: GpsPoint,
    pub route_id: Option<RouteId>,
}

impl Stop {
    pub fn new(id: u32, name: impl Into<String>, position: GpsPoint) -> Self {
        Self {
            id,
            name: name.into(),
            position,
            route_id: None,
        }
    }

    pub fn on_route(mut self, route_id: RouteId) -> Self {
        self.route_id = Some(route_id);
        self
    }

    fn serves(&self, route_id: Option<RouteId>) -> bool {
        match (self.route_id, route_id) {
            (Some(own), Some(wanted)) => own == wanted,
            _ => true,
        }
    }
}

/// Stop position for R-tree spatial indexing
#[derive(Debug, Clone, Copy)]
struct IndexedStop {
    idx: usize,
    lat: f64,
    lng: f64,
}

impl RTreeObject for IndexedStop {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lng, self.lat])
    }
}

/// Spatial index over all stops.
#[derive(Debug)]
pub struct StopIndex {
    stops: Vec<Stop>,
    tree: RTree<IndexedStop>,
}

impl Default for StopIndex {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl StopIndex {
    pub fn new(stops: Vec<Stop>) -> Self {
        let indexed: Vec<IndexedStop> = stops
            .iter()
            .enumerate()
            .filter(|(_, s)| s.position.is_valid())
            .map(|(idx, s)| IndexedStop {
                idx,
                lat: s.position.latitude,
                lng: s.position.longitude,
            })
            .collect();
        Self {
            tree: RTree::bulk_load(indexed),
            stops,
        }
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Nearest stop within `max_radius` meters that serves `route_id`.
    ///
    /// Ties on distance go to the lower stop id.
    pub fn nearest(
        &self,
        point: &GpsPoint,
        route_id: Option<RouteId>,
        max_radius: f64,
    ) -> Option<(&Stop, f64)> {
        let search = bounds_around(point, max_radius).envelope();
        self.tree
            .locate_in_envelope(&search)
            .filter_map(|entry| self.stops.get(entry.idx))
            .filter(|stop| stop.serves(route_id))
            .map(|stop| (stop, haversine_distance(point, &stop.position)))
            .filter(|(_, d)| *d <= max_radius)
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.id.cmp(&b.0.id)))
    }
}
