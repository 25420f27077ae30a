//! Per-route R-tree over active cluster centroids.

use std::collections::HashMap;

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::geo_utils::bounds_around;
use crate::{ClusterId, GpsPoint, RouteId};

/// A cluster centroid for R-tree queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CentroidEntry {
    pub id: ClusterId,
    pub lat: f64,
    pub lng: f64,
}

impl CentroidEntry {
    fn new(id: ClusterId, point: &GpsPoint) -> Self {
        Self {
            id,
            lat: point.latitude,
            lng: point.longitude,
        }
    }
}

impl RTreeObject for CentroidEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lng, self.lat])
    }
}

impl PointDistance for CentroidEntry {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlng = self.lng - point[0];
        let dlat = self.lat - point[1];
        dlat * dlat + dlng * dlng
    }
}

/// Active cluster centroids, one R-tree per route.
#[derive(Debug, Default)]
pub(crate) struct ClusterSpatialIndex {
    trees: HashMap<RouteId, RTree<CentroidEntry>>,
}

impl ClusterSpatialIndex {
    pub fn insert(&mut self, route_id: RouteId, id: ClusterId, centroid: &GpsPoint) {
        self.trees
            .entry(route_id)
            .or_default()
            .insert(CentroidEntry::new(id, centroid));
    }

    pub fn remove(&mut self, route_id: RouteId, id: ClusterId, centroid: &GpsPoint) -> bool {
        let removed = self
            .trees
            .get_mut(&route_id)
            .and_then(|tree| tree.remove(&CentroidEntry::new(id, centroid)))
            .is_some();
        if self.trees.get(&route_id).is_some_and(|t| t.size() == 0) {
            self.trees.remove(&route_id);
        }
        removed
    }

    /// Move a cluster's entry after its centroid changed.
    pub fn relocate(&mut self, route_id: RouteId, id: ClusterId, from: &GpsPoint, to: &GpsPoint) {
        if from == to {
            return;
        }
        self.remove(route_id, id, from);
        self.insert(route_id, id, to);
    }

    /// Clusters whose centroid falls in the bounding box of the radius.
    /// Callers apply the exact distance filter.
    pub fn candidates(&self, route_id: RouteId, point: &GpsPoint, radius_meters: f64) -> Vec<ClusterId> {
        let Some(tree) = self.trees.get(&route_id) else {
            return Vec::new();
        };
        let search = bounds_around(point, radius_meters).envelope();
        tree.locate_in_envelope(&search).map(|e| e.id).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.trees.values().map(|t| t.size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_query_relocate() {
        let mut index = ClusterSpatialIndex::default();
        let a = GpsPoint::new(-34.9800, -71.2400);
        let b = GpsPoint::new(-34.9900, -71.2400);
        index.insert(1, 10, &a);
        index.insert(2, 11, &a);

        assert_eq!(index.candidates(1, &a, 50.0), vec![10]);
        assert!(index.candidates(3, &a, 50.0).is_empty());

        index.relocate(1, 10, &a, &b);
        assert!(index.candidates(1, &a, 50.0).is_empty());
        assert_eq!(index.candidates(1, &b, 50.0), vec![10]);

        assert!(index.remove(1, 10, &b));
        assert!(!index.remove(1, 10, &b));
        assert_eq!(index.len(), 1);
    }
}
