//! Back-end quorum coordinator.
//!
//! Per probe round, the coordinator stages each process's aggregate
//! contribution and decides when to emit:
//!
//! ```text
//! stage[p]    : map<procId, contribution>
//! expected[p] : set<procId>          resolved at prepare
//! ```
//!
//! Emit fires when `keys(stage) ⊇ live(expected)`. If the quorum is not
//! met within the domain's wait window of the first arrival, the session
//! emits whatever is staged with the partial flag set. A round with no
//! arrivals never emits.

use std::collections::BTreeMap;

use tracing::warn;

use crate::aggregate::{AggId, Aggregate};
use crate::engine::ProcId;
use crate::probe::ProbeIdx;
use crate::process_table::ProcSet;

/// One probe's staging slot.
#[derive(Debug, Default)]
struct StagedRound {
    expected: ProcSet,
    stage: BTreeMap<ProcId, Vec<Aggregate>>,
    first_arrival_ms: Option<u64>,
}

/// Staging buffers for every armed probe on this back-end.
#[derive(Debug, Default)]
pub struct Coordinator {
    rounds: BTreeMap<ProbeIdx, StagedRound>,
}

impl Coordinator {
    /// Empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reset) a probe's round with its expected process set.
    pub fn begin_round(&mut self, probe: ProbeIdx, expected: ProcSet) {
        self.rounds.insert(
            probe,
            StagedRound {
                expected,
                stage: BTreeMap::new(),
                first_arrival_ms: None,
            },
        );
    }

    /// Drop a probe's round entirely (probe death).
    pub fn drop_round(&mut self, probe: ProbeIdx) {
        self.rounds.remove(&probe);
    }

    /// Stage a process's contribution. Re-reports replace the previous
    /// contribution (actions are safe to re-run). Returns true when this
    /// is the round's first arrival, which starts the wait timer.
    pub fn report(
        &mut self,
        probe: ProbeIdx,
        proc: ProcId,
        contribution: Vec<Aggregate>,
        now_ms: u64,
    ) -> bool {
        let round = self.rounds.entry(probe).or_default();
        round.stage.insert(proc, contribution);
        let first = round.first_arrival_ms.is_none();
        if first {
            round.first_arrival_ms = Some(now_ms);
        }
        first
    }

    /// Expected set for a probe's round.
    #[must_use]
    pub fn expected(&self, probe: ProbeIdx) -> ProcSet {
        self.rounds
            .get(&probe)
            .map(|r| r.expected.clone())
            .unwrap_or_default()
    }

    /// Processes that have reported so far.
    #[must_use]
    pub fn reported(&self, probe: ProbeIdx) -> ProcSet {
        self.rounds
            .get(&probe)
            .map(|r| r.stage.keys().copied().collect())
            .unwrap_or_default()
    }

    /// True when anything is staged.
    #[must_use]
    pub fn has_arrivals(&self, probe: ProbeIdx) -> bool {
        self.rounds
            .get(&probe)
            .is_some_and(|r| !r.stage.is_empty())
    }

    /// Timestamp of the round's first arrival.
    #[must_use]
    pub fn first_arrival(&self, probe: ProbeIdx) -> Option<u64> {
        self.rounds.get(&probe).and_then(|r| r.first_arrival_ms)
    }

    /// Emit condition: every live expected process has reported.
    ///
    /// `live` is the subset of the expected set still alive; dead
    /// processes do not hold up the quorum.
    #[must_use]
    pub fn quorum_met(&self, probe: ProbeIdx, live: &ProcSet) -> bool {
        let Some(round) = self.rounds.get(&probe) else {
            return false;
        };
        round
            .expected
            .iter()
            .filter(|p| live.contains(p))
            .all(|p| round.stage.contains_key(p))
    }

    /// Close the round: merge all staged contributions into one
    /// aggregate map. Returns the merged map and the number of
    /// processes that reported. Mismatched-kind collisions drop both
    /// sides with a warning.
    pub fn take_round(&mut self, probe: ProbeIdx) -> (BTreeMap<AggId, Aggregate>, u32) {
        let Some(round) = self.rounds.get_mut(&probe) else {
            return (BTreeMap::new(), 0);
        };

        let reported = round.stage.len() as u32;
        let mut merged: BTreeMap<AggId, Aggregate> = BTreeMap::new();
        let mut dropped: Vec<AggId> = Vec::new();

        for (_, contribution) in std::mem::take(&mut round.stage) {
            for agg in contribution {
                match merged.get_mut(&agg.id) {
                    None => {
                        merged.insert(agg.id, agg);
                    }
                    Some(existing) => {
                        if existing.merge(&agg).is_err() {
                            warn!(
                                id = agg.id,
                                left = existing.kind.label(),
                                right = agg.kind.label(),
                                "staged aggregate kind mismatch, dropping both"
                            );
                            dropped.push(agg.id);
                        }
                    }
                }
            }
        }
        for id in dropped {
            merged.remove(&id);
        }

        round.first_arrival_ms = None;
        (merged, reported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggKind, Aggregate};
    use crate::value::Value;

    fn contribution(id: AggId, v: i32) -> Vec<Aggregate> {
        let mut agg = Aggregate::identity(AggKind::Min, id);
        agg.fold_value(Value::Int(v), 0);
        vec![agg]
    }

    #[test]
    fn quorum_requires_all_live_expected() {
        let mut c = Coordinator::new();
        let expected: ProcSet = [1, 2, 3].into();
        c.begin_round(0, expected.clone());

        assert!(c.report(0, 1, contribution(7, 5), 100));
        assert!(!c.report(0, 2, contribution(7, 3), 150), "second arrival");
        assert!(!c.quorum_met(0, &expected));

        c.report(0, 3, contribution(7, 9), 160);
        assert!(c.quorum_met(0, &expected));
    }

    #[test]
    fn dead_processes_do_not_hold_quorum() {
        let mut c = Coordinator::new();
        c.begin_round(0, [1, 2].into());
        c.report(0, 1, contribution(7, 5), 100);
        // Process 2 died; the live subset shrinks to {1}.
        assert!(c.quorum_met(0, &[1].into()));
    }

    #[test]
    fn take_round_merges_contributions() {
        let mut c = Coordinator::new();
        c.begin_round(0, [1, 2].into());
        c.report(0, 1, contribution(7, 5), 100);
        c.report(0, 2, contribution(7, 3), 110);

        let (merged, reported) = c.take_round(0);
        assert_eq!(reported, 2);
        assert_eq!(merged[&7].count, 2);
        assert_eq!(merged[&7].render(None), "3");
        // The round is consumed.
        assert!(!c.has_arrivals(0));
        assert_eq!(c.first_arrival(0), None);
    }

    #[test]
    fn rereport_replaces_contribution() {
        let mut c = Coordinator::new();
        c.begin_round(0, [1].into());
        c.report(0, 1, contribution(7, 5), 100);
        c.report(0, 1, contribution(7, 2), 120);
        let (merged, reported) = c.take_round(0);
        assert_eq!(reported, 1);
        assert_eq!(merged[&7].count, 1);
        assert_eq!(merged[&7].render(None), "2");
    }

    #[test]
    fn kind_collision_drops_both() {
        let mut c = Coordinator::new();
        c.begin_round(0, [1, 2].into());
        c.report(0, 1, contribution(7, 5), 100);
        let mut max = Aggregate::identity(AggKind::Max, 7);
        max.fold_value(Value::Int(1), 0);
        c.report(0, 2, vec![max], 110);
        let (merged, _) = c.take_round(0);
        assert!(merged.is_empty());
    }
}
