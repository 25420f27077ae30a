//! Per-user gate and per-route locks.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::config::InFlightPolicy;
use crate::error::{ClusterError, Result};
use crate::RouteId;

/// Ticket counters for one user with pings in flight.
#[derive(Debug, Default)]
struct Lane {
    next_ticket: u64,
    serving: u64,
}

/// Serializes pings per user.
///
/// With `Wait`, pings take a ticket and are let through in arrival order.
/// With `Reject`, a ping arriving while another is in flight fails with
/// `DuplicateInFlight`.
#[derive(Debug)]
pub(crate) struct UserGate {
    policy: InFlightPolicy,
    lanes: Mutex<HashMap<String, Lane>>,
    turn: Condvar,
}

/// Held while a ping is processed; dropping it lets the next ping through.
pub(crate) struct GatePass<'a> {
    gate: &'a UserGate,
    user_id: String,
}

impl UserGate {
    pub fn new(policy: InFlightPolicy) -> Self {
        Self {
            policy,
            lanes: Mutex::new(HashMap::new()),
            turn: Condvar::new(),
        }
    }

    // Lanes are plain counters, so a poisoned map is still consistent
    fn lanes(&self) -> MutexGuard<'_, HashMap<String, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enter(&self, user_id: &str) -> Result<GatePass<'_>> {
        let mut lanes = self.lanes();

        if self.policy == InFlightPolicy::Reject && lanes.contains_key(user_id) {
            log::debug!("[Ingestion] Rejecting duplicate in-flight ping for {}", user_id);
            return Err(ClusterError::DuplicateInFlight {
                user_id: user_id.to_string(),
            });
        }

        let lane = lanes.entry(user_id.to_string()).or_default();
        let ticket = lane.next_ticket;
        lane.next_ticket += 1;

        while lanes.get(user_id).is_some_and(|lane| lane.serving != ticket) {
            lanes = self
                .turn
                .wait(lanes)
                .unwrap_or_else(PoisonError::into_inner);
        }

        Ok(GatePass {
            gate: self,
            user_id: user_id.to_string(),
        })
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.lanes().len()
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut lanes = self.gate.lanes();
        if let Some(lane) = lanes.get_mut(&self.user_id) {
            lane.serving += 1;
            if lane.serving == lane.next_ticket {
                lanes.remove(&self.user_id);
            }
        }
        drop(lanes);
        self.gate.turn.notify_all();
    }
}

/// One mutex per route, taken in ascending id order.
#[derive(Debug)]
pub(crate) struct RouteLocks {
    locks: HashMap<RouteId, Mutex<()>>,
    /// Shared by routes missing from the catalog
    fallback: Mutex<()>,
}

pub(crate) type RouteGuards<'a> = Vec<MutexGuard<'a, ()>>;

impl RouteLocks {
    pub fn new(route_ids: impl IntoIterator<Item = RouteId>) -> Self {
        Self {
            locks: route_ids.into_iter().map(|id| (id, Mutex::new(()))).collect(),
            fallback: Mutex::new(()),
        }
    }

    /// Lock the given routes (duplicates allowed) without risk of deadlock
    /// against other callers.
    pub fn lock_all(&self, route_ids: &[RouteId]) -> RouteGuards<'_> {
        // None (fallback) sorts first, then ascending route id
        let mut keys: Vec<Option<RouteId>> = route_ids
            .iter()
            .map(|id| self.locks.contains_key(id).then_some(*id))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        keys.into_iter()
            .map(|key| {
                let mutex = key
                    .and_then(|id| self.locks.get(&id))
                    .unwrap_or(&self.fallback);
                mutex.lock().unwrap_or_else(|poisoned| {
                    log::warn!("[Ingestion] Route lock poisoned by a panicked ingestion");
                    poisoned.into_inner()
                })
            })
            .collect()
    }

    /// Lock every route.
    pub fn lock_everything(&self) -> RouteGuards<'_> {
        let ids: Vec<RouteId> = self.locks.keys().copied().collect();
        let mut guards = self.lock_all(&ids);
        if ids.is_empty() {
            guards.push(self.fallback.lock().unwrap_or_else(PoisonError::into_inner));
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reject_policy() {
        let gate = UserGate::new(InFlightPolicy::Reject);
        let pass = gate.enter("u1").unwrap();
        assert!(matches!(
            gate.enter("u1"),
            Err(ClusterError::DuplicateInFlight { .. })
        ));
        // Other users are unaffected
        assert!(gate.enter("u2").is_ok());
        drop(pass);
        assert!(gate.enter("u1").is_ok());
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_wait_policy_serializes_same_user() {
        let gate = Arc::new(UserGate::new(InFlightPolicy::Wait));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let _pass = gate.enter("same-user").unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_lock_all_dedups() {
        let locks = RouteLocks::new([1, 2, 3]);
        // Duplicates and unknown ids must not self-deadlock
        let guards = locks.lock_all(&[3, 1, 3, 99, 98]);
        assert_eq!(guards.len(), 3);
        drop(guards);
        assert_eq!(locks.lock_everything().len(), 3);
    }
}
