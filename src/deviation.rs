//! # Deviation Detection
//!
//! For users who already hold a membership: re-score the ping against the
//! route of their cluster and against every other route. A user is ejected
//! when their assigned route no longer fits, or when another route fits
//! clearly better (by a configurable offset or heading margin).

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::routes::{CorridorMatch, RouteMatcher};
use crate::store::ClusterStore;
use crate::types::{Departure, Membership, Motive, Ping};
use crate::RouteId;

/// Verdict on a ping from a user who holds a membership.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviationVerdict {
    /// Assigned route still fits; continue with the normal flow
    Stay,
    /// A different route wins
    Deviated {
        from: RouteId,
        to: RouteId,
        motive: Motive,
        best: CorridorMatch,
    },
    /// The assigned route fails and nothing else fits
    OffRoute { from: RouteId, motive: Motive },
}

impl DeviationVerdict {
    pub fn is_stay(&self) -> bool {
        matches!(self, DeviationVerdict::Stay)
    }
}

/// A non-stay verdict together with the ejection it caused.
#[derive(Debug, Clone, PartialEq)]
pub struct Deviation {
    pub verdict: DeviationVerdict,
    pub departure: Option<Departure>,
}

/// Detects drift away from the assigned route.
#[derive(Debug, Clone)]
pub struct DeviationDetector {
    matcher: RouteMatcher,
    offset_margin: f64,
    heading_margin: f64,
}

impl DeviationDetector {
    pub fn new(matcher: RouteMatcher, config: &ClusterConfig) -> Self {
        Self {
            matcher,
            offset_margin: config.deviation_offset_margin,
            heading_margin: config.deviation_heading_margin,
        }
    }

    /// Whether `candidate` beats `assigned` by at least one of the margins.
    fn meaningfully_better(&self, candidate: &CorridorMatch, assigned: &CorridorMatch) -> bool {
        assigned.offset_meters - candidate.offset_meters >= self.offset_margin
            || assigned.heading_rank() - candidate.heading_rank() >= self.heading_margin
    }

    /// Score the ping without touching the store.
    pub fn assess(&self, ping: &Ping, membership: &Membership) -> Result<DeviationVerdict> {
        let from = membership.route_id;
        let assigned = match self
            .matcher
            .match_route(from, &ping.position, ping.heading, ping.speed)
        {
            Ok(m) => Some(m),
            // Route dropped from the catalog: treat as failing
            Err(ClusterError::UnknownRoute { .. }) => None,
            Err(e) => return Err(e),
        };
        let best = self
            .matcher
            .best_route(&ping.position, ping.heading, ping.speed);

        let verdict = match (assigned, best) {
            (Some(assigned), Some((to, best))) if assigned.in_corridor => {
                if to != from && self.meaningfully_better(&best, &assigned) {
                    DeviationVerdict::Deviated {
                        from,
                        to,
                        motive: Motive::BetterRoute,
                        best,
                    }
                } else {
                    DeviationVerdict::Stay
                }
            }
            (Some(assigned), None) if assigned.in_corridor => DeviationVerdict::Stay,
            (assigned, Some((to, best))) => DeviationVerdict::Deviated {
                from,
                to,
                motive: assigned
                    .and_then(|m| m.motive())
                    .unwrap_or(Motive::OutsideCorridor),
                best,
            },
            (assigned, None) => DeviationVerdict::OffRoute {
                from,
                motive: assigned
                    .and_then(|m| m.motive())
                    .unwrap_or(Motive::OutsideCorridor),
            },
        };
        Ok(verdict)
    }

    /// Assess and, unless the user stays, remove their membership.
    ///
    /// Callers hold the route locks for the user's current route.
    pub fn detect(
        &self,
        store: &dyn ClusterStore,
        ping: &Ping,
        membership: &Membership,
    ) -> Result<Option<Deviation>> {
        let verdict = self.assess(ping, membership)?;
        match &verdict {
            DeviationVerdict::Stay => return Ok(None),
            DeviationVerdict::Deviated { from, to, motive, .. } => log::info!(
                "[Deviation] {} left route {} for route {} ({:?})",
                ping.user_id,
                from,
                to,
                motive
            ),
            DeviationVerdict::OffRoute { from, motive } => log::info!(
                "[Deviation] {} is off route {} ({:?})",
                ping.user_id,
                from,
                motive
            ),
        }

        let departure = store.remove_member(&ping.user_id)?;
        if let Some(d) = departure.as_ref().filter(|d| d.deactivated) {
            log::info!("[Deviation] Cluster {} deactivated (empty)", d.cluster.id);
        }
        Ok(Some(Deviation { verdict, departure }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::routes::{Route, RouteCatalog};
    use crate::GpsPoint;

    /// Route 2 runs west along one street; route 3 runs south-east and
    /// crosses it at (-34.9756, -71.2620).
    fn detector() -> DeviationDetector {
        let r2 = Route::new(
            2,
            vec![GpsPoint::new(-34.9756, -71.2550), GpsPoint::new(-34.9756, -71.2650)],
        )
        .unwrap();
        let r3 = Route::new(
            3,
            vec![GpsPoint::new(-34.9740, -71.2660), GpsPoint::new(-34.9780, -71.2560)],
        )
        .unwrap();
        let catalog = Arc::new(RouteCatalog::new(vec![r2, r3]));
        let config = ClusterConfig::default();
        DeviationDetector::new(RouteMatcher::new(catalog, &config), &config)
    }

    fn member_of(route: RouteId) -> Membership {
        let p = Ping::new("u", route, GpsPoint::new(-34.9756, -71.2600));
        Membership::from_ping(&p, 1)
    }

    #[test]
    fn test_stays_on_assigned_route() {
        let ping = Ping::new("u", 2, GpsPoint::new(-34.9757, -71.2580))
            .with_heading(268.0)
            .with_speed(7.0);
        let verdict = detector().assess(&ping, &member_of(2)).unwrap();
        assert!(verdict.is_stay());
    }

    #[test]
    fn test_detects_better_route() {
        // On route 3's line, travelling its direction (opposite to route 2)
        let ping = Ping::new("u", 2, GpsPoint::new(-34.9752, -71.2630))
            .with_heading(117.0)
            .with_speed(7.0);
        let verdict = detector().assess(&ping, &member_of(2)).unwrap();
        match verdict {
            DeviationVerdict::Deviated { from, to, .. } => {
                assert_eq!(from, 2);
                assert_eq!(to, 3);
            }
            other => panic!("expected deviation, got {:?}", other),
        }
    }

    #[test]
    fn test_off_every_route() {
        let ping = Ping::new("u", 2, GpsPoint::new(-34.9600, -71.2600));
        let verdict = detector().assess(&ping, &member_of(2)).unwrap();
        assert_eq!(
            verdict,
            DeviationVerdict::OffRoute {
                from: 2,
                motive: Motive::OutsideCorridor
            }
        );
    }

    #[test]
    fn test_small_improvement_is_not_deviation() {
        // Near the crossing: route 3 is ~12m closer, below the 20m margin
        let ping = Ping::new("u", 2, GpsPoint::new(-34.97545, -71.2625));
        let verdict = detector().assess(&ping, &member_of(2)).unwrap();
        assert!(verdict.is_stay());
    }
}
