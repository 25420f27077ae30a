//! GIS primitives consumed by the matcher.

use crate::geo_utils::{haversine_distance, heading_delta, project_onto_segment};
use crate::routes::Route;
use crate::GpsPoint;

/// Where a point falls relative to a route corridor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorridorProjection {
    /// Offset is within the tolerance passed in (heading not considered)
    pub on_corridor: bool,
    /// Distance from the point to the chosen segment in meters
    pub offset_meters: f64,
    /// Delta between the given heading and the chosen segment's heading.
    /// `None` when no heading was given.
    pub heading_delta_degrees: Option<f64>,
    /// Index of the chosen segment
    pub segment_index: usize,
    /// Closest point on the chosen segment
    pub projected: GpsPoint,
}

/// Distance and corridor projection.
///
/// Implementations must be pure and cheap: they run inside route locks.
pub trait Geometry: Send + Sync {
    /// Distance between two points in meters.
    fn distance(&self, a: &GpsPoint, b: &GpsPoint) -> f64;

    /// Project `point` onto `route`.
    ///
    /// Among segments within `tolerance_meters` the one whose heading is closest
    /// to `heading` wins, so out-and-back routes resolve to the right direction.
    /// When no segment is within tolerance (or no heading is given) the nearest
    /// segment wins.
    fn project_onto_corridor(
        &self,
        point: &GpsPoint,
        heading: Option<f64>,
        route: &Route,
        tolerance_meters: f64,
    ) -> CorridorProjection;
}

/// Default geometry on top of the `geo` crate's haversine formulas.
#[derive(Debug, Clone, Copy, Default)]
pub struct HaversineGeometry;

struct SegmentHit {
    index: usize,
    offset: f64,
    delta: Option<f64>,
    projected: GpsPoint,
}

fn nearest<'a>(hits: impl Iterator<Item = &'a SegmentHit>) -> Option<&'a SegmentHit> {
    hits.min_by(|x, y| x.offset.total_cmp(&y.offset).then(x.index.cmp(&y.index)))
}

impl Geometry for HaversineGeometry {
    fn distance(&self, a: &GpsPoint, b: &GpsPoint) -> f64 {
        haversine_distance(a, b)
    }

    fn project_onto_corridor(
        &self,
        point: &GpsPoint,
        heading: Option<f64>,
        route: &Route,
        tolerance_meters: f64,
    ) -> CorridorProjection {
        let hits: Vec<SegmentHit> = route
            .segments()
            .map(|(index, a, b, segment_heading)| {
                let (projected, offset) = project_onto_segment(point, a, b);
                SegmentHit {
                    index,
                    offset,
                    delta: heading.map(|h| heading_delta(h, segment_heading)),
                    projected,
                }
            })
            .collect();

        let in_tolerance = |hit: &&SegmentHit| hit.offset <= tolerance_meters;
        let chosen = match heading {
            Some(_) => hits.iter().filter(in_tolerance).min_by(|x, y| {
                x.delta
                    .unwrap_or(0.0)
                    .total_cmp(&y.delta.unwrap_or(0.0))
                    .then(x.offset.total_cmp(&y.offset))
                    .then(x.index.cmp(&y.index))
            }),
            None => nearest(hits.iter().filter(in_tolerance)),
        }
        .or_else(|| nearest(hits.iter()));

        match chosen {
            Some(hit) => CorridorProjection {
                on_corridor: hit.offset <= tolerance_meters,
                offset_meters: hit.offset,
                heading_delta_degrees: hit.delta,
                segment_index: hit.index,
                projected: hit.projected,
            },
            None => CorridorProjection {
                on_corridor: false,
                offset_meters: f64::INFINITY,
                heading_delta_degrees: None,
                segment_index: 0,
                projected: *point,
            },
        }
    }
}
