//! Scenario Pending Set - scenario ids awaiting exactly one result.
//!
//! ```text
//!   insert ──► pending ──claim──► in-flight ──complete──► fulfilled
//!                 ▲                   │
//!                 └──── drop/abort ───┘
//! ```
//!
//! A claim moves the id out of the pending set atomically, so two
//! deliveries of the same message can never both be handled. If handling
//! fails the claim is dropped and the id becomes pending again.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct PendingState {
    pending: BTreeSet<String>,
    in_flight: BTreeSet<String>,
    fulfilled: BTreeSet<String>,
    /// Bumped by `clear` so claims from before a reload are not restored
    generation: u64,
}

/// Session-scoped registry of pending scenario ids. Cloning shares the set.
#[derive(Debug, Clone, Default)]
pub struct PendingScenarios {
    inner: Arc<Mutex<PendingState>>,
}

/// Result of trying to claim a scenario id.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The id was pending and is now held by the returned claim
    Claimed(ScenarioClaim),
    /// Another delivery is handling this id right now
    InFlight,
    /// The id was already fulfilled (re-delivery)
    AlreadyFulfilled,
    /// The id was never requested
    Unsolicited,
}

impl PendingScenarios {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        // A poisoned set is still structurally valid
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a scenario id. Returns `false` if it is already pending
    /// or being handled.
    pub fn insert(&self, scenario_id: impl Into<String>) -> bool {
        let id = scenario_id.into();
        let mut state = self.lock();
        if state.in_flight.contains(&id) {
            return false;
        }
        state.fulfilled.remove(&id);
        state.pending.insert(id)
    }

    /// Atomically moves an id from pending to in-flight.
    pub fn claim(&self, scenario_id: &str) -> ClaimOutcome {
        let mut state = self.lock();
        if state.pending.remove(scenario_id) {
            state.in_flight.insert(scenario_id.to_string());
            return ClaimOutcome::Claimed(ScenarioClaim {
                set: self.clone(),
                scenario_id: scenario_id.to_string(),
                generation: state.generation,
                settled: false,
            });
        }
        if state.in_flight.contains(scenario_id) {
            ClaimOutcome::InFlight
        } else if state.fulfilled.contains(scenario_id) {
            ClaimOutcome::AlreadyFulfilled
        } else {
            ClaimOutcome::Unsolicited
        }
    }

    /// True if the id is waiting for a result.
    pub fn contains(&self, scenario_id: &str) -> bool {
        self.lock().pending.contains(scenario_id)
    }

    /// True if a result for the id has been handled.
    pub fn is_fulfilled(&self, scenario_id: &str) -> bool {
        self.lock().fulfilled.contains(scenario_id)
    }

    /// Number of pending ids.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending ids in sorted order.
    pub fn pending_ids(&self) -> Vec<String> {
        self.lock().pending.iter().cloned().collect()
    }

    /// Forgets all pending and in-flight ids (case or scenario reload).
    ///
    /// Claims taken before the call are neither restored nor recorded as
    /// fulfilled when they settle.
    pub fn clear(&self) {
        let mut state = self.lock();
        let dropped = state.pending.len() + state.in_flight.len();
        state.pending.clear();
        state.in_flight.clear();
        state.generation += 1;
        debug!(dropped, "cleared pending scenarios");
    }

    fn settle(&self, scenario_id: &str, generation: u64, fulfilled: bool) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.in_flight.remove(scenario_id);
        if fulfilled {
            state.fulfilled.insert(scenario_id.to_string());
        } else {
            state.pending.insert(scenario_id.to_string());
        }
    }
}

/// Exclusive hold on a scenario id while its result is handled.
///
/// Dropping the claim without calling [`ScenarioClaim::complete`] returns
/// the id to the pending set.
#[derive(Debug)]
pub struct ScenarioClaim {
    set: PendingScenarios,
    scenario_id: String,
    generation: u64,
    settled: bool,
}

impl ScenarioClaim {
    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    /// Marks the scenario fulfilled; the id is gone for good.
    pub fn complete(mut self) {
        self.settled = true;
        self.set.settle(&self.scenario_id, self.generation, true);
    }

    /// Explicitly gives the id back to the pending set.
    pub fn abort(self) {
        drop(self);
    }
}

impl Drop for ScenarioClaim {
    fn drop(&mut self) {
        if !self.settled {
            self.set.settle(&self.scenario_id, self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_complete_removes_once() {
        let pending = PendingScenarios::new();
        assert!(pending.insert("s1"));
        assert!(pending.contains("s1"));

        let claim = match pending.claim("s1") {
            ClaimOutcome::Claimed(c) => c,
            other => panic!("expected claim, got {other:?}"),
        };
        assert!(!pending.contains("s1"));
        assert!(matches!(pending.claim("s1"), ClaimOutcome::InFlight));

        claim.complete();
        assert!(pending.is_fulfilled("s1"));
        assert!(matches!(pending.claim("s1"), ClaimOutcome::AlreadyFulfilled));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_dropped_claim_returns_to_pending() {
        let pending = PendingScenarios::new();
        pending.insert("s1");
        if let ClaimOutcome::Claimed(claim) = pending.claim("s1") {
            claim.abort();
        }
        assert!(pending.contains("s1"));
        assert!(!pending.is_fulfilled("s1"));
    }

    #[test]
    fn test_unsolicited() {
        let pending = PendingScenarios::new();
        pending.insert("s1");
        assert!(matches!(pending.claim("other"), ClaimOutcome::Unsolicited));
        assert_eq!(pending.pending_ids(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_clear_discards_outstanding_claims() {
        let pending = PendingScenarios::new();
        pending.insert("s1");
        pending.insert("s2");
        let claim = match pending.claim("s1") {
            ClaimOutcome::Claimed(c) => c,
            other => panic!("expected claim, got {other:?}"),
        };
        pending.clear();
        drop(claim);

        assert!(pending.is_empty());
        assert!(matches!(pending.claim("s1"), ClaimOutcome::Unsolicited));
    }

    #[test]
    fn test_rerequest_after_fulfilment() {
        let pending = PendingScenarios::new();
        pending.insert("s1");
        if let ClaimOutcome::Claimed(claim) = pending.claim("s1") {
            claim.complete();
        }
        assert!(pending.insert("s1"));
        assert!(!pending.is_fulfilled("s1"));
        assert!(matches!(pending.claim("s1"), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn test_concurrent_claims_only_one_wins() {
        let pending = PendingScenarios::new();
        pending.insert("s1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pending = pending.clone();
                std::thread::spawn(move || match pending.claim("s1") {
                    ClaimOutcome::Claimed(claim) => {
                        claim.complete();
                        1
                    }
                    _ => 0,
                })
            })
            .collect();
        let winners: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
    }
}
