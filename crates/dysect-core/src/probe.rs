//! Probes: event + domain + condition + actions, chained into trees.
//!
//! Session scripts build [`ProbeSpec`] trees; the session flattens them
//! into engine-side [`Probe`] slots at prepare. A probe's backend id is
//! a deterministic hash of its position in the tree (root index plus
//! child-edge path), so every overlay tier keys packets identically
//! without coordination.
//!
//! Back-end lifecycle:
//!
//! ```text
//!         arm()                    event
//! unarmed ─────→ armed ──────────────→ triggered
//!                 ▲                      │ evaluate
//!                 │                      ▼
//!                 │               ┌─ collected ─┐
//!                 │  stay         │             │ emit
//!                 │               ▼             ▼
//!                 └───────── reported ◄──── quorum-ready
//!                                 │
//!                             once│
//!                                 ▼
//!                               dead
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::action::Action;
use crate::condition::Condition;
use crate::domain::Domain;
use crate::engine::{ProcId, ThreadId};
use crate::event::Event;
use crate::process_table::ProcSet;

/// Wire identifier of a probe (tree-position hash).
pub type ProbeId = u32;

/// Slab index of a flattened probe within its session.
pub type ProbeIdx = usize;

/// Whether a probe disarms after its first report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Persistence {
    /// Disarm and die after the first report.
    #[default]
    Once,
    /// Re-arm after every report.
    Stay,
}

/// Back-end probe lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeState {
    Unarmed,
    /// Parked on unresolved pending symbols.
    Pending,
    Armed,
    Triggered,
    Collected,
    QuorumReady,
    Reported,
    Dead,
}

impl ProbeState {
    /// Legal state-machine edges.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        use ProbeState::{
            Armed, Collected, Dead, Pending, QuorumReady, Reported, Triggered, Unarmed,
        };
        matches!(
            (self, to),
            (Unarmed, Armed | Pending)
                | (Pending, Armed | Dead)
                | (Armed, Triggered | Dead)
                | (Triggered, Collected | Armed | Dead)
                | (Collected, QuorumReady | Collected | Triggered)
                | (QuorumReady, Reported)
                | (Reported, Armed | Dead | Unarmed)
        )
    }
}

/// User-facing probe description; session scripts build trees of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub event: Event,
    pub domain: Domain,
    pub condition: Option<Condition>,
    pub actions: Vec<Action>,
    pub persistence: Persistence,
    pub children: Vec<ProbeSpec>,
}

impl ProbeSpec {
    /// Probe on an event over a domain, no condition, no actions yet.
    #[must_use]
    pub fn new(event: Event, domain: Domain) -> Self {
        Self {
            event,
            domain,
            condition: None,
            actions: Vec::new(),
            persistence: Persistence::Once,
            children: Vec::new(),
        }
    }

    /// Attach a condition.
    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Append an action (declaration order is execution order).
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Append several actions.
    #[must_use]
    pub fn actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Set persistence.
    #[must_use]
    pub fn persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    /// Add a child probe; the edge arms the child when this probe
    /// reports.
    #[must_use]
    pub fn link(mut self, child: ProbeSpec) -> Self {
        self.children.push(child);
        self
    }
}

/// Deterministic backend probe id from tree position.
#[must_use]
pub fn probe_id(root_index: usize, path: &[u8]) -> ProbeId {
    let mut hasher = Sha256::new();
    hasher.update((root_index as u64).to_be_bytes());
    hasher.update([path.len() as u8]);
    hasher.update(path);
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Engine-side probe slot.
#[derive(Debug)]
pub struct Probe {
    /// Wire id (tree-position hash).
    pub id: ProbeId,
    pub event: Event,
    pub domain: Domain,
    pub condition: Option<Condition>,
    pub actions: Vec<Action>,
    pub persistence: Persistence,
    pub state: ProbeState,
    pub parent: Option<ProbeIdx>,
    pub children: Vec<ProbeIdx>,
    /// Processes that satisfied the probe this round.
    pub satisfied: ProcSet,
    /// Stopped threads held while the domain is blocking.
    pub stopped: Vec<(ProcId, ThreadId)>,
}

impl Probe {
    /// Fresh unarmed probe slot.
    #[must_use]
    pub fn new(
        id: ProbeId,
        event: Event,
        domain: Domain,
        condition: Option<Condition>,
        actions: Vec<Action>,
        persistence: Persistence,
        parent: Option<ProbeIdx>,
    ) -> Self {
        Self {
            id,
            event,
            domain,
            condition,
            actions,
            persistence,
            state: ProbeState::Unarmed,
            parent,
            children: Vec::new(),
            satisfied: ProcSet::new(),
            stopped: Vec::new(),
        }
    }

    /// Transition the lifecycle state, logging illegal edges.
    pub fn transition(&mut self, to: ProbeState) {
        if !self.state.can_transition(to) && self.state != to {
            warn!(
                probe = self.id,
                from = ?self.state,
                to = ?to,
                "illegal probe state transition"
            );
        }
        self.state = to;
    }

    /// True while the probe participates in event dispatch.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self.state, ProbeState::Dead | ProbeState::Unarmed)
    }

    /// Reset per-round state for a `stay` re-arm.
    pub fn rearm_round(&mut self) {
        self.event.reset_fired();
        self.satisfied.clear();
        self.stopped.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_ids_are_stable_and_position_dependent() {
        assert_eq!(probe_id(0, &[]), probe_id(0, &[]));
        assert_ne!(probe_id(0, &[]), probe_id(1, &[]));
        assert_ne!(probe_id(0, &[0]), probe_id(0, &[1]));
        assert_ne!(probe_id(0, &[0]), probe_id(0, &[0, 0]));
    }

    #[test]
    fn lifecycle_edges() {
        use ProbeState::*;
        assert!(Unarmed.can_transition(Armed));
        assert!(Armed.can_transition(Triggered));
        assert!(Triggered.can_transition(Collected));
        assert!(Collected.can_transition(QuorumReady));
        assert!(QuorumReady.can_transition(Reported));
        assert!(Reported.can_transition(Armed)); // stay
        assert!(Reported.can_transition(Dead)); // once
        assert!(!Armed.can_transition(Reported));
        assert!(!Dead.can_transition(Armed));
    }

    #[test]
    fn spec_builder_links_children() {
        let spec = ProbeSpec::new(Event::signal(11), Domain::world())
            .action(Action::stack_trace())
            .persistence(Persistence::Stay)
            .link(ProbeSpec::new(
                Event::within_ms(500),
                Domain::inherit(crate::domain::WAIT_INF),
            ));
        assert_eq!(spec.children.len(), 1);
        assert_eq!(spec.persistence, Persistence::Stay);
        assert_eq!(spec.actions.len(), 1);
    }
}
