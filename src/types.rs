//! Pings, clusters, memberships and the outcomes reported back to callers.

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::routes::effective_heading;
use crate::{now_millis, ClusterId, GpsPoint, RouteId};

// ============================================================================
// Ping
// ============================================================================

/// Normalize a vehicle plate: trim, uppercase, drop spaces and dashes.
///
/// Returns `None` for an empty plate (absence is not a conflict).
pub fn normalize_plate(raw: &str) -> Option<String> {
    let plate: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '·')
        .flat_map(char::to_uppercase)
        .collect();
    if plate.is_empty() {
        None
    } else {
        Some(plate)
    }
}

/// One passenger location report. Ephemeral: only its effect on a membership
/// is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Ping {
    pub user_id: String,
    /// Route the passenger says they are riding
    pub route_id: RouteId,
    pub position: GpsPoint,
    /// Degrees from north
    pub heading: Option<f64>,
    /// Meters per second
    pub speed: Option<f64>,
    /// Reported GPS accuracy in meters
    pub accuracy: Option<f64>,
    /// Normalized vehicle plate
    pub plate: Option<String>,
    pub registered: bool,
    pub confirmed: bool,
    /// Explicit "I am (not) on a bus" flag
    pub on_bus: Option<bool>,
    /// Unix millis
    pub timestamp: i64,
}

impl Ping {
    /// Create a ping stamped with the current time.
    pub fn new(user_id: impl Into<String>, route_id: RouteId, position: GpsPoint) -> Self {
        Self {
            user_id: user_id.into(),
            route_id,
            position,
            heading: None,
            speed: None,
            accuracy: None,
            plate: None,
            registered: false,
            confirmed: false,
            on_bus: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Set the plate (normalized; blank plates are ignored).
    pub fn with_plate(mut self, plate: &str) -> Self {
        self.plate = normalize_plate(plate);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_on_bus(mut self, on_bus: bool) -> Self {
        self.on_bus = Some(on_bus);
        self
    }

    pub fn registered(mut self, registered: bool) -> Self {
        self.registered = registered;
        self
    }

    pub fn confirmed(mut self, confirmed: bool) -> Self {
        self.confirmed = confirmed;
        self
    }

    /// Heading used for corridor checks (`None` when unknown or stationary).
    pub fn effective_heading(&self) -> Option<f64> {
        effective_heading(self.heading, self.speed)
    }

    /// Reject pings that cannot be processed at all.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(ClusterError::invalid("user id is empty"));
        }
        if !self.position.is_valid() {
            return Err(ClusterError::invalid(format!(
                "coordinates ({}, {}) are out of range",
                self.position.latitude, self.position.longitude
            )));
        }
        if self.heading.is_some_and(|h| !h.is_finite()) {
            return Err(ClusterError::invalid("heading is not a number"));
        }
        if self.speed.is_some_and(|s| !s.is_finite() || s < 0.0) {
            return Err(ClusterError::invalid("speed must be a non-negative number"));
        }
        if self.accuracy.is_some_and(|a| !a.is_finite() || a < 0.0) {
            return Err(ClusterError::invalid("accuracy must be a non-negative number"));
        }
        Ok(())
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// The working hypothesis that a group of users ride the same vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub route_id: RouteId,
    /// Mean of the active members' last positions
    pub centroid: GpsPoint,
    pub member_count: u32,
    /// Set on first claim, immutable afterwards
    pub plate: Option<String>,
    /// Number of conflicting plates turned away
    pub plate_conflicts: u32,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Cluster {
    /// Whether a ping with `plate` may join.
    ///
    /// Differing plates conflict. A missing plate never conflicts unless
    /// `strict` is set and this cluster has already turned a plate away.
    pub fn plate_check(&self, plate: Option<&str>, strict: bool) -> Result<()> {
        match (self.plate.as_deref(), plate) {
            (Some(recorded), Some(presented)) if recorded != presented => {
                Err(ClusterError::PlateMismatch {
                    cluster_id: self.id,
                    recorded: recorded.to_string(),
                    presented: presented.to_string(),
                })
            }
            (Some(recorded), None) if strict && self.plate_conflicts > 0 => {
                Err(ClusterError::PlateMismatch {
                    cluster_id: self.id,
                    recorded: recorded.to_string(),
                    presented: String::new(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Two clusters may merge only if they do not carry different plates.
    pub fn plates_compatible(&self, other: &Cluster) -> bool {
        match (&self.plate, &other.plate) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    /// Whether two clusters may merge. In strict mode a plate-less cluster
    /// never merges with a plated one that has already turned plates away.
    pub fn mergeable_with(&self, other: &Cluster, strict: bool) -> bool {
        if !self.plates_compatible(other) {
            return false;
        }
        let barred = |plated: &Cluster, bare: &Cluster| {
            plated.plate.is_some() && plated.plate_conflicts > 0 && bare.plate.is_none()
        };
        !strict || !(barred(self, other) || barred(other, self))
    }

    /// Older by creation time, lower id on a tie.
    pub fn is_older_than(&self, other: &Cluster) -> bool {
        (self.created_at, self.id) < (other.created_at, other.id)
    }
}

// ============================================================================
// Membership
// ============================================================================

/// A user's current place in a cluster. A user has at most one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: String,
    pub cluster_id: ClusterId,
    pub route_id: RouteId,
    pub position: GpsPoint,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub registered: bool,
    pub confirmed: bool,
    pub timestamp: i64,
}

impl Membership {
    pub fn from_ping(ping: &Ping, cluster_id: ClusterId) -> Self {
        Self {
            user_id: ping.user_id.clone(),
            cluster_id,
            route_id: ping.route_id,
            position: ping.position,
            heading: ping.heading,
            speed: ping.speed,
            accuracy: ping.accuracy,
            registered: ping.registered,
            confirmed: ping.confirmed,
            timestamp: ping.timestamp,
        }
    }
}

// ============================================================================
// Store results
// ============================================================================

/// A user left a cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub user_id: String,
    /// The cluster as it stands after the user left
    pub cluster: Cluster,
    /// The cluster became empty and was deactivated
    pub deactivated: bool,
}

/// A user was placed into a cluster, possibly leaving another one.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub cluster: Cluster,
    pub previous: Option<Departure>,
}

/// An active cluster found near a point.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearby {
    pub cluster: Cluster,
    pub distance_meters: f64,
}

// ============================================================================
// Outcomes
// ============================================================================

/// What happened to a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "CLUSTER_CREADO")]
    ClusterCreated,
    #[serde(rename = "UNIDO_A_CLUSTER")]
    Joined,
    /// Joined at the amplified radius (lower confidence)
    #[serde(rename = "UNIDO_A_CLUSTER_AMPLIADO")]
    JoinedAmplified,
    #[serde(rename = "ACTUALIZADO")]
    Updated,
    #[serde(rename = "CLUSTER_CONSOLIDADO")]
    Consolidated,
    #[serde(rename = "USUARIO_SOLO")]
    Solo,
    #[serde(rename = "FUERA_DE_RUTA")]
    OffRoute,
    #[serde(rename = "DESVIO_DETECTADO")]
    Deviated,
}

impl Action {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ClusterCreated => "CLUSTER_CREADO",
            Action::Joined => "UNIDO_A_CLUSTER",
            Action::JoinedAmplified => "UNIDO_A_CLUSTER_AMPLIADO",
            Action::Updated => "ACTUALIZADO",
            Action::Consolidated => "CLUSTER_CONSOLIDADO",
            Action::Solo => "USUARIO_SOLO",
            Action::OffRoute => "FUERA_DE_RUTA",
            Action::Deviated => "DESVIO_DETECTADO",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a user was taken off a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Motive {
    /// Too far from the route polyline
    #[serde(rename = "FUERA_DEL_CORREDOR")]
    OutsideCorridor,
    /// Close enough but travelling the wrong way
    #[serde(rename = "RUMBO_INCOMPATIBLE")]
    HeadingMismatch,
    /// Another route fits clearly better
    #[serde(rename = "RUTA_ALTERNATIVA")]
    BetterRoute,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(plate: Option<&str>, conflicts: u32) -> Cluster {
        Cluster {
            id: 1,
            route_id: 2,
            centroid: GpsPoint::new(-34.98, -71.24),
            member_count: 1,
            plate: plate.map(str::to_string),
            plate_conflicts: conflicts,
            active: true,
            created_at: 1_000,
            updated_at: 1_000,
        }
    }

    #[test]
    fn test_normalize_plate() {
        assert_eq!(normalize_plate(" bx-jk 12 "), Some("BXJK12".to_string()));
        assert_eq!(normalize_plate("BXJK12"), Some("BXJK12".to_string()));
        assert_eq!(normalize_plate("  "), None);
        assert_eq!(normalize_plate(""), None);
    }

    #[test]
    fn test_plate_check() {
        let c = cluster(Some("BXJK12"), 0);
        assert!(c.plate_check(Some("BXJK12"), false).is_ok());
        assert!(c.plate_check(None, false).is_ok());
        assert!(matches!(
            c.plate_check(Some("XXXX99"), false),
            Err(ClusterError::PlateMismatch { cluster_id: 1, .. })
        ));
        assert!(cluster(None, 0).plate_check(Some("XXXX99"), false).is_ok());
    }

    #[test]
    fn test_strict_plate_after_conflict() {
        let c = cluster(Some("BXJK12"), 1);
        assert!(c.plate_check(None, false).is_ok());
        assert!(c.plate_check(None, true).is_err());
        assert!(cluster(Some("BXJK12"), 0).plate_check(None, true).is_ok());
    }

    #[test]
    fn test_mergeable_with() {
        let plated = cluster(Some("BXJK12"), 1);
        let bare = cluster(None, 0);
        assert!(plated.mergeable_with(&bare, false));
        assert!(!plated.mergeable_with(&bare, true));
        assert!(!bare.mergeable_with(&plated, true));
        assert!(cluster(Some("BXJK12"), 0).mergeable_with(&bare, true));
        assert!(!plated.mergeable_with(&cluster(Some("XXXX99"), 0), false));
    }

    #[test]
    fn test_ping_validation() {
        let p = GpsPoint::new(-34.98, -71.24);
        assert!(Ping::new("u1", 1, p).validate().is_ok());
        assert!(Ping::new(" ", 1, p).validate().is_err());
        assert!(Ping::new("u1", 1, GpsPoint::new(-95.0, 0.0)).validate().is_err());
        assert!(Ping::new("u1", 1, p).with_speed(-2.0).validate().is_err());
    }

    #[test]
    fn test_action_wire_names() {
        let json = serde_json::to_string(&Action::JoinedAmplified).unwrap();
        assert_eq!(json, "\"UNIDO_A_CLUSTER_AMPLIADO\"");
        assert_eq!(Action::Deviated.to_string(), "DESVIO_DETECTADO");
    }

    #[test]
    fn test_older_than() {
        let a = cluster(None, 0);
        let mut b = a.clone();
        b.id = 2;
        assert!(a.is_older_than(&b));
        b.created_at = 500;
        assert!(b.is_older_than(&a));
    }
}
