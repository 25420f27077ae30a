//! Engine configuration.
//!
//! All thresholds are plain numbers with sensible defaults. They can be
//! overridden from environment-style key/value pairs (`PROXIMITY_THRESHOLD=35`).

use std::str::FromStr;

use once_cell::sync::Lazy;

use crate::error::{ClusterError, Result};

/// What to do with a ping that arrives while another ping for the same user is
/// still being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightPolicy {
    /// Queue behind the in-flight ping (pings are processed in arrival order)
    Wait,
    /// Reject with `DuplicateInFlight`
    Reject,
}

impl FromStr for InFlightPolicy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" | "queue" => Ok(InFlightPolicy::Wait),
            "reject" | "drop" => Ok(InFlightPolicy::Reject),
            other => Err(ClusterError::Config {
                message: format!("unknown in-flight policy '{}'", other),
            }),
        }
    }
}

/// Configuration for clustering, corridor matching and consolidation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// Radius for joining an existing cluster.
    /// Default: 35.0 meters
    pub proximity_threshold: f64,

    /// Second-chance radius tried when nothing is within `proximity_threshold`.
    /// Joins at this radius are reported as lower confidence.
    /// Default: 100.0 meters
    pub amplified_threshold: f64,

    /// Two active clusters on the same route closer than this are merged.
    /// Default: 80.0 meters
    pub merge_threshold: f64,

    /// Maximum distance from a route polyline for a ping to be on that route.
    /// Routes with their own corridor half-width override this.
    /// Default: 80.0 meters
    pub route_offset_meters: f64,

    /// Maximum difference between ping heading and segment heading.
    /// Default: 120.0 degrees
    pub route_heading_delta: f64,

    /// A competing route must beat the assigned route's offset by this much
    /// to count as a deviation.
    /// Default: 20.0 meters
    pub deviation_offset_margin: f64,

    /// A competing route must beat the assigned route's heading delta by this much
    /// to count as a deviation.
    /// Default: 45.0 degrees
    pub deviation_heading_margin: f64,

    /// Nearest stop lookup radius.
    /// Default: 500.0 meters
    pub stop_search_radius: f64,

    /// Memberships without a ping for this long are dropped by `expire_idle`.
    /// Default: 900 seconds
    pub cluster_idle_ttl_secs: u64,

    /// Minimum time between consolidation sweeps on the same route (0 = every ping).
    /// Default: 0
    pub sweep_min_interval_ms: u64,

    /// Bar plate-less pings from plate-bearing clusters that have already turned
    /// away a conflicting plate.
    /// Default: false
    pub strict_plate_after_conflict: bool,

    /// Same-user concurrency policy.
    /// Default: Wait
    pub in_flight_policy: InFlightPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            proximity_threshold: 35.0,
            amplified_threshold: 100.0,
            merge_threshold: 80.0,
            route_offset_meters: 80.0,
            route_heading_delta: 120.0,
            deviation_offset_margin: 20.0,
            deviation_heading_margin: 45.0,
            stop_search_radius: 500.0,
            cluster_idle_ttl_secs: 900,
            sweep_min_interval_ms: 0,
            strict_plate_after_conflict: false,
            in_flight_policy: InFlightPolicy::Wait,
        }
    }
}

/// Configuration read once from the process environment.
///
/// Falls back to defaults (with a warning) when the environment is malformed.
pub static DEFAULT_CONFIG: Lazy<ClusterConfig> = Lazy::new(|| {
    ClusterConfig::from_env().unwrap_or_else(|e| {
        log::warn!("[Config] {}; using defaults", e);
        ClusterConfig::default()
    })
});

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| ClusterError::Config {
        message: format!("{}='{}' is not a valid value", key, raw),
    })
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ClusterError::Config {
            message: format!("{}='{}' is not a boolean", key, raw),
        }),
    }
}

impl ClusterConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides from any key/value source. Missing keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        macro_rules! read {
            ($key:literal => $field:ident) => {
                if let Some(raw) = lookup($key) {
                    config.$field = parse_var($key, &raw)?;
                }
            };
        }

        read!("PROXIMITY_THRESHOLD" => proximity_threshold);
        read!("AMPLIFIED_THRESHOLD" => amplified_threshold);
        read!("MERGE_THRESHOLD" => merge_threshold);
        read!("ROUTE_OFFSET_METERS" => route_offset_meters);
        read!("ROUTE_HEADING_DELTA" => route_heading_delta);
        read!("DEVIATION_OFFSET_MARGIN" => deviation_offset_margin);
        read!("DEVIATION_HEADING_MARGIN" => deviation_heading_margin);
        read!("STOP_SEARCH_RADIUS" => stop_search_radius);
        read!("CLUSTER_IDLE_TTL_SECS" => cluster_idle_ttl_secs);
        read!("SWEEP_MIN_INTERVAL_MS" => sweep_min_interval_ms);

        if let Some(raw) = lookup("STRICT_PLATE_AFTER_CONFLICT") {
            config.strict_plate_after_conflict = parse_flag("STRICT_PLATE_AFTER_CONFLICT", &raw)?;
        }
        if let Some(raw) = lookup("IN_FLIGHT_POLICY") {
            config.in_flight_policy = raw.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that thresholds are positive and correctly ordered.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("PROXIMITY_THRESHOLD", self.proximity_threshold),
            ("AMPLIFIED_THRESHOLD", self.amplified_threshold),
            ("MERGE_THRESHOLD", self.merge_threshold),
            ("ROUTE_OFFSET_METERS", self.route_offset_meters),
            ("ROUTE_HEADING_DELTA", self.route_heading_delta),
        ];
        for (key, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ClusterError::Config {
                    message: format!("{} must be positive, got {}", key, value),
                });
            }
        }
        if self.deviation_offset_margin < 0.0 || self.deviation_heading_margin < 0.0 {
            return Err(ClusterError::Config {
                message: "deviation margins cannot be negative".to_string(),
            });
        }
        if self.proximity_threshold > self.amplified_threshold {
            return Err(ClusterError::Config {
                message: format!(
                    "PROXIMITY_THRESHOLD ({}) exceeds AMPLIFIED_THRESHOLD ({})",
                    self.proximity_threshold, self.amplified_threshold
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.proximity_threshold, 35.0);
        assert_eq!(config.route_offset_meters, 80.0);
        assert_eq!(config.route_heading_delta, 120.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = ClusterConfig::from_lookup(lookup_from(&[
            ("PROXIMITY_THRESHOLD", "50"),
            ("ROUTE_HEADING_DELTA", " 90 "),
            ("STRICT_PLATE_AFTER_CONFLICT", "yes"),
            ("IN_FLIGHT_POLICY", "reject"),
        ]))
        .unwrap();
        assert_eq!(config.proximity_threshold, 50.0);
        assert_eq!(config.route_heading_delta, 90.0);
        assert!(config.strict_plate_after_conflict);
        assert_eq!(config.in_flight_policy, InFlightPolicy::Reject);
        assert_eq!(config.merge_threshold, 80.0);
    }

    #[test]
    fn test_malformed_value() {
        let result = ClusterConfig::from_lookup(lookup_from(&[("MERGE_THRESHOLD", "far")]));
        assert!(matches!(result, Err(ClusterError::Config { .. })));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let result = ClusterConfig::from_lookup(lookup_from(&[("PROXIMITY_THRESHOLD", "150")]));
        assert!(matches!(result, Err(ClusterError::Config { .. })));
    }

    #[test]
    fn test_process_default_is_valid() {
        // Whatever the test environment holds, the lazily read config is usable
        assert!(DEFAULT_CONFIG.validate().is_ok());
    }
}
