//! Geographic utilities: distance, bearing, heading deltas and local projections.

use geo::{Bearing, Closest, ClosestPoint, Distance, Haversine, Line, Point};

use crate::{Bounds, GpsPoint};

/// Mean Earth radius used for meter/degree conversions.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

const METERS_PER_DEGREE: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

fn to_point(p: &GpsPoint) -> Point<f64> {
    Point::new(p.longitude, p.latitude)
}

/// Great-circle distance between two GPS points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    Haversine::distance(to_point(p1), to_point(p2))
}

/// Initial bearing from `from` to `to`, normalized to [0, 360).
pub fn bearing_degrees(from: &GpsPoint, to: &GpsPoint) -> f64 {
    Haversine::bearing(to_point(from), to_point(to)).rem_euclid(360.0)
}

/// Smallest angle between two headings, in [0, 180].
pub fn heading_delta(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// Convert a distance in meters to (lat_degrees, lng_degrees) at a reference latitude.
pub fn meters_to_degrees(meters: f64, ref_lat: f64) -> (f64, f64) {
    let lat_deg = meters / METERS_PER_DEGREE;
    let cos_lat = ref_lat.to_radians().cos().abs().max(1e-6);
    (lat_deg, lat_deg / cos_lat)
}

/// Bounds of a radius (meters) around a point.
pub fn bounds_around(center: &GpsPoint, radius_meters: f64) -> Bounds {
    let (dlat, dlng) = meters_to_degrees(radius_meters, center.latitude);
    Bounds {
        min_lat: center.latitude - dlat,
        max_lat: center.latitude + dlat,
        min_lng: center.longitude - dlng,
        max_lng: center.longitude + dlng,
    }
}

/// Arithmetic mean of a set of positions. Returns `None` for an empty set.
pub fn compute_center<'a, I>(points: I) -> Option<GpsPoint>
where
    I: IntoIterator<Item = &'a GpsPoint>,
{
    let mut lat = 0.0;
    let mut lng = 0.0;
    let mut n = 0usize;
    for p in points {
        lat += p.latitude;
        lng += p.longitude;
        n += 1;
    }
    if n == 0 {
        return None;
    }
    Some(GpsPoint::new(lat / n as f64, lng / n as f64))
}

/// Project `point` onto the segment `a -> b`.
///
/// Works in a local equirectangular frame centred on `point`, which is accurate
/// at corridor scales (hundreds of meters). Returns the closest point on the
/// segment and its distance in meters.
pub fn project_onto_segment(point: &GpsPoint, a: &GpsPoint, b: &GpsPoint) -> (GpsPoint, f64) {
    let cos_lat = point.latitude.to_radians().cos();
    let to_local = |p: &GpsPoint| {
        (
            (p.longitude - point.longitude) * cos_lat * METERS_PER_DEGREE,
            (p.latitude - point.latitude) * METERS_PER_DEGREE,
        )
    };

    let line = Line::new(to_local(a), to_local(b));
    let closest = match line.closest_point(&Point::new(0.0, 0.0)) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => p,
        Closest::Indeterminate => Point::from(to_local(a)),
    };

    let projected = GpsPoint::new(
        point.latitude + closest.y() / METERS_PER_DEGREE,
        point.longitude + closest.x() / (cos_lat * METERS_PER_DEGREE),
    );
    (projected, haversine_distance(point, &projected))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_distance_same_point() {
        let p = GpsPoint::new(-34.9816, -71.2443);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_distance_known_value() {
        // 0.001 degrees of latitude is roughly 111m
        let a = GpsPoint::new(-34.9800, -71.2400);
        let b = GpsPoint::new(-34.9810, -71.2400);
        assert!(approx_eq(haversine_distance(&a, &b), 111.2, 1.0));
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        let origin = GpsPoint::new(-34.98, -71.24);
        let north = GpsPoint::new(-34.97, -71.24);
        let east = GpsPoint::new(-34.98, -71.23);
        assert!(approx_eq(bearing_degrees(&origin, &north), 0.0, 0.5));
        assert!(approx_eq(bearing_degrees(&origin, &east), 90.0, 0.5));
        assert!(approx_eq(bearing_degrees(&north, &origin), 180.0, 0.5));
    }

    #[test]
    fn test_heading_delta_wraps() {
        assert_eq!(heading_delta(10.0, 350.0), 20.0);
        assert_eq!(heading_delta(90.0, 270.0), 180.0);
        assert_eq!(heading_delta(266.0, 266.0), 0.0);
    }

    #[test]
    fn test_compute_center() {
        let points = [GpsPoint::new(-34.0, -71.0), GpsPoint::new(-35.0, -72.0)];
        let center = compute_center(points.iter()).unwrap();
        assert!(approx_eq(center.latitude, -34.5, 1e-9));
        assert!(approx_eq(center.longitude, -71.5, 1e-9));
        assert!(compute_center(std::iter::empty()).is_none());
    }

    #[test]
    fn test_project_onto_segment_perpendicular() {
        // East-west segment; point 0.0005 deg (~55m) north of its middle
        let a = GpsPoint::new(-34.98, -71.25);
        let b = GpsPoint::new(-34.98, -71.24);
        let p = GpsPoint::new(-34.9795, -71.245);
        let (projected, offset) = project_onto_segment(&p, &a, &b);
        assert!(approx_eq(offset, 55.6, 1.0));
        assert!(approx_eq(projected.latitude, -34.98, 1e-6));
    }

    #[test]
    fn test_project_onto_segment_clamps_to_endpoint() {
        let a = GpsPoint::new(-34.98, -71.25);
        let b = GpsPoint::new(-34.98, -71.24);
        let p = GpsPoint::new(-34.98, -71.23);
        let (projected, offset) = project_onto_segment(&p, &a, &b);
        assert!(approx_eq(offset, haversine_distance(&p, &b), 0.5));
        assert!(approx_eq(projected.longitude, -71.24, 1e-6));
    }

    #[test]
    fn test_meters_to_degrees() {
        let (dlat, dlng) = meters_to_degrees(111.2, 0.0);
        assert!(approx_eq(dlat, 0.001, 1e-5));
        assert!(approx_eq(dlng, 0.001, 1e-5));
        let (_, dlng_south) = meters_to_degrees(111.2, -60.0);
        assert!(approx_eq(dlng_south, 0.002, 1e-4));
    }
}
