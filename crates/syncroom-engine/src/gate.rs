//! Quorum barriers.
//!
//! A gate resolves once the local participant is ready and every peer that is
//! active *at evaluation time* has signalled, or once its deadline passes.
//! Peers that disconnect simply stop appearing in the active set, so they can
//! never hold a gate shut. Resolution happens at most once per cycle.

use std::collections::BTreeSet;
use std::time::Duration;

use syncroom_types::PeerId;
use tokio::time::Instant;

/// Result of a gate resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Peers that had signalled when the gate resolved.
    pub signaled: Vec<PeerId>,
    /// `true` when the deadline, not the quorum, resolved the gate.
    pub forced: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Gate {
    open: bool,
    local_ready: bool,
    signaled: BTreeSet<PeerId>,
    deadline: Option<Instant>,
    resolved: bool,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new cycle, forgetting every earlier signal.
    pub fn open(&mut self, deadline: Option<Instant>) {
        *self = Self {
            open: true,
            deadline,
            ..Self::default()
        };
    }

    /// Close without resolving.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Set the deadline to `now + timeout` unless one is already running.
    pub fn arm_deadline(&mut self, now: Instant, timeout: Duration) {
        if self.deadline.is_none() {
            self.deadline = now.checked_add(timeout);
        }
    }

    pub fn set_local_ready(&mut self) {
        self.local_ready = true;
    }

    /// Record a peer's signal; `false` if the gate isn't collecting.
    pub fn signal(&mut self, peer: &PeerId) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.signaled.insert(peer.clone());
        true
    }

    /// Open and not yet resolved.
    pub fn is_pending(&self) -> bool {
        self.open && !self.resolved
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check the gate against the live active peer set.
    ///
    /// Returns `Some` only on the evaluation that resolves it.
    pub fn evaluate<'a>(
        &mut self,
        active: impl IntoIterator<Item = &'a PeerId>,
        now: Instant,
    ) -> Option<Resolution> {
        if !self.is_pending() {
            return None;
        }
        let quorum = self.local_ready && active.into_iter().all(|p| self.signaled.contains(p));
        let expired = self.deadline.is_some_and(|d| now >= d);
        if !quorum && !expired {
            return None;
        }
        self.resolved = true;
        Some(Resolution {
            signaled: self.signaled.iter().cloned().collect(),
            forced: !quorum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::new(s)
    }

    fn open_gate(now: Instant) -> Gate {
        let mut gate = Gate::new();
        gate.open(Some(now + Duration::from_secs(15)));
        gate
    }

    #[test]
    fn no_active_peers_resolves_on_local_readiness() {
        let now = Instant::now();
        let mut gate = open_gate(now);
        assert_eq!(gate.evaluate([], now), None);
        gate.set_local_ready();
        let res = gate.evaluate([], now).unwrap();
        assert!(!res.forced);
        assert!(res.signaled.is_empty());
    }

    #[test]
    fn waits_for_every_active_peer_in_any_order() {
        let now = Instant::now();
        let peers = [id("a"), id("b"), id("c")];
        let mut gate = open_gate(now);
        gate.set_local_ready();
        gate.signal(&id("c"));
        gate.signal(&id("a"));
        assert_eq!(gate.evaluate(&peers, now), None);
        gate.signal(&id("b"));
        let res = gate.evaluate(&peers, now).unwrap();
        assert!(!res.forced);
        assert_eq!(res.signaled, vec![id("a"), id("b"), id("c")]);
    }

    #[test]
    fn disconnected_peer_drops_out() {
        let now = Instant::now();
        let mut gate = open_gate(now);
        gate.set_local_ready();
        gate.signal(&id("a"));
        assert_eq!(gate.evaluate(&[id("a"), id("b")], now), None);
        // b went away; only a remains active.
        assert!(gate.evaluate(&[id("a")], now).is_some());
    }

    #[test]
    fn deadline_forces_resolution() {
        let now = Instant::now();
        let mut gate = open_gate(now);
        gate.signal(&id("a"));
        let later = now + Duration::from_secs(15);
        let res = gate.evaluate(&[id("a"), id("b")], later).unwrap();
        assert!(res.forced);
        assert_eq!(res.signaled, vec![id("a")]);
    }

    #[test]
    fn resolution_is_monotonic() {
        let now = Instant::now();
        let mut gate = open_gate(now);
        gate.set_local_ready();
        assert!(gate.evaluate([], now).is_some());
        assert!(gate.is_resolved());
        assert_eq!(gate.evaluate([], now), None);
        assert!(!gate.signal(&id("late")));
    }

    #[test]
    fn reopening_clears_roster() {
        let now = Instant::now();
        let mut gate = open_gate(now);
        gate.signal(&id("a"));
        gate.open(None);
        assert!(gate.is_pending());
        assert_eq!(gate.deadline(), None);
        gate.set_local_ready();
        // a has to signal again in the new cycle.
        assert_eq!(gate.evaluate(&[id("a")], now), None);
        gate.signal(&id("a"));
        assert!(gate.evaluate(&[id("a")], now).is_some());
    }

    #[test]
    fn arm_deadline_keeps_first() {
        let now = Instant::now();
        let mut gate = Gate::new();
        gate.open(None);
        gate.arm_deadline(now, Duration::from_secs(15));
        gate.arm_deadline(now + Duration::from_secs(5), Duration::from_secs(15));
        assert_eq!(gate.deadline(), Some(now + Duration::from_secs(15)));
    }

    #[test]
    fn closed_gate_ignores_everything() {
        let now = Instant::now();
        let mut gate = Gate::new();
        gate.set_local_ready();
        assert!(!gate.signal(&id("a")));
        assert_eq!(gate.evaluate([], now), None);
    }
}
