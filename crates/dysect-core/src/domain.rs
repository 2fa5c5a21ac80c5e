//! Domains: the set of processes expected to participate in a probe.
//!
//! Three kinds: `world` (every process in the session), `group` (a rank
//! expression like `"0,2-3,5"`), and `inherit` (the parent probe's
//! resolved set, filtered to the processes that satisfied the parent).
//! A domain also owns the probe's wait time (quorum window) and the
//! blocking flag.
//!
//! Rank ranges resolve through a sequence map: MPI ranks sorted, with a
//! new sequence id whenever the owning back-end changes. Contiguous
//! runs on one back-end collapse to a single sequence entry, so a range
//! `[a..b]` resolves by sequence-id interval instead of scanning every
//! rank.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{DysectError, Result};
use crate::process_table::{BackendRank, MpiRank, ProcSet, ProcessTable};

/// Wait forever: quorum only, no timer.
pub const WAIT_INF: u64 = u64::MAX;

/// Domain kind discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainKind {
    /// Every process known to the session.
    World,
    /// Rank expression, resolved at prepare.
    Group(String),
    /// Copy of the parent probe's resolved set at arm time.
    Inherit,
}

/// A probe's participation set plus quorum policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    kind: DomainKind,
    wait_ms: u64,
    blocking: bool,
    /// Local processes expected to participate; populated by `prepare`.
    #[serde(skip)]
    attached: Option<ProcSet>,
    /// Back-end ranks expected to contribute packets upstream.
    #[serde(skip)]
    backends: Option<BTreeSet<BackendRank>>,
}

impl Domain {
    /// World domain with no quorum window.
    #[must_use]
    pub fn world() -> Self {
        Self::world_with(WAIT_INF)
    }

    /// World domain with a quorum window in milliseconds.
    #[must_use]
    pub fn world_with(wait_ms: u64) -> Self {
        Self {
            kind: DomainKind::World,
            wait_ms,
            blocking: false,
            attached: None,
            backends: None,
        }
    }

    /// Group domain from a rank expression.
    #[must_use]
    pub fn group(expr: &str, wait_ms: u64) -> Self {
        Self {
            kind: DomainKind::Group(expr.to_string()),
            wait_ms,
            blocking: false,
            attached: None,
            backends: None,
        }
    }

    /// Inherit the parent's resolved set. `WAIT_INF` also inherits the
    /// parent's wait time.
    #[must_use]
    pub fn inherit(wait_ms: u64) -> Self {
        Self {
            kind: DomainKind::Inherit,
            wait_ms,
            blocking: false,
            attached: None,
            backends: None,
        }
    }

    /// Set the blocking flag: participating processes stay stopped until
    /// the probe reports.
    #[must_use]
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Domain kind.
    #[must_use]
    pub fn kind(&self) -> &DomainKind {
        &self.kind
    }

    /// Quorum window in milliseconds.
    #[must_use]
    pub fn wait_ms(&self) -> u64 {
        self.wait_ms
    }

    /// True when a finite quorum window is set.
    #[must_use]
    pub fn has_wait(&self) -> bool {
        self.wait_ms != WAIT_INF
    }

    /// Blocking flag.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Resolved local participation set. Empty before `prepare`.
    #[must_use]
    pub fn attached(&self) -> ProcSet {
        self.attached.clone().unwrap_or_default()
    }

    /// Back-end ranks expected to contribute. Empty before `prepare`.
    #[must_use]
    pub fn expected_backends(&self) -> BTreeSet<BackendRank> {
        self.backends.clone().unwrap_or_default()
    }

    /// Resolve the domain against the process table.
    ///
    /// For `inherit`, `parent` supplies the parent's resolved set (already
    /// filtered to satisfying processes by the caller) and wait time.
    pub fn prepare(
        &mut self,
        table: &ProcessTable,
        parent: Option<(&ProcSet, &BTreeSet<BackendRank>, u64)>,
    ) -> Result<()> {
        match &self.kind {
            DomainKind::World => {
                self.attached = Some(table.local_procs());
                self.backends = Some(table.iter().map(|e| e.backend_rank).collect());
            }
            DomainKind::Group(expr) => {
                let intervals = parse_group_expr(expr)?;
                let sequence = SequenceMap::build(table);

                let mut attached = ProcSet::new();
                let mut backends = BTreeSet::new();
                for &(lo, hi) in &intervals {
                    backends.extend(sequence.backends_in_range(lo, hi));
                    for entry in table.iter() {
                        if entry.mpi_rank >= lo
                            && entry.mpi_rank <= hi
                            && entry.backend_rank == table.local_backend()
                        {
                            attached.insert(entry.proc);
                        }
                    }
                }
                self.attached = Some(attached);
                self.backends = Some(backends);
            }
            DomainKind::Inherit => {
                let (parent_procs, parent_backends, parent_wait) =
                    parent.ok_or_else(|| {
                        DysectError::DomainNotFound(
                            "inherit domain without a parent".into(),
                        )
                    })?;
                let local = table.local_procs();
                self.attached = Some(
                    parent_procs
                        .iter()
                        .copied()
                        .filter(|p| local.contains(p))
                        .collect(),
                );
                self.backends = Some(parent_backends.clone());
                if self.wait_ms == WAIT_INF {
                    self.wait_ms = parent_wait;
                }
            }
        }
        Ok(())
    }

}

/// Parse `item (',' item)*` where `item := rank | low '-' high`.
pub fn parse_group_expr(expr: &str) -> Result<Vec<(MpiRank, MpiRank)>> {
    let mut intervals = Vec::new();
    for item in expr.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.split_once('-') {
            None => {
                let rank: MpiRank = item.parse().map_err(|_| bad_expr(expr, item))?;
                intervals.push((rank, rank));
            }
            Some((lo, hi)) => {
                let lo: MpiRank = lo.trim().parse().map_err(|_| bad_expr(expr, item))?;
                let hi: MpiRank = hi.trim().parse().map_err(|_| bad_expr(expr, item))?;
                if lo > hi {
                    return Err(DysectError::DomainExpressionError(format!(
                        "interval not valid in '{expr}': {lo} > {hi}"
                    )));
                }
                intervals.push((lo, hi));
            }
        }
    }
    if intervals.is_empty() {
        return Err(DysectError::DomainExpressionError(format!(
            "empty rank expression '{expr}'"
        )));
    }
    Ok(intervals)
}

fn bad_expr(expr: &str, item: &str) -> DysectError {
    DysectError::DomainExpressionError(format!("ill-formed item '{item}' in '{expr}'"))
}

/// Rank-range lookup structure.
///
/// MPI ranks sorted by rank; a new sequence id starts whenever the
/// back-end rank of the owning agent changes:
///
/// ```text
/// mpi rank:   backend:   sequence:
///        0          0           0
///        1          0           0
///        2          1           1
///        3          0           2
///        4          1           3
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequenceMap {
    rank_to_seq: BTreeMap<MpiRank, u32>,
    seq_to_backend: Vec<BackendRank>,
}

impl SequenceMap {
    /// Build from the session's process table.
    #[must_use]
    pub fn build(table: &ProcessTable) -> Self {
        let mut rank_to_seq = BTreeMap::new();
        let mut seq_to_backend = Vec::new();
        let mut prev_backend: Option<BackendRank> = None;

        for rank in table.all_ranks() {
            let Some(entry) = table.by_rank(rank) else {
                continue;
            };
            if prev_backend != Some(entry.backend_rank) {
                seq_to_backend.push(entry.backend_rank);
                prev_backend = Some(entry.backend_rank);
            }
            rank_to_seq.insert(rank, (seq_to_backend.len() - 1) as u32);
        }

        Self {
            rank_to_seq,
            seq_to_backend,
        }
    }

    /// Sequence id of a rank, when the rank exists.
    #[must_use]
    pub fn seq_of(&self, rank: MpiRank) -> Option<u32> {
        self.rank_to_seq.get(&rank).copied()
    }

    /// Back-end ranks whose sequence ids fall inside the rank range.
    #[must_use]
    pub fn backends_in_range(&self, lo: MpiRank, hi: MpiRank) -> BTreeSet<BackendRank> {
        // Clamp to ranks that exist; an empty overlap yields an empty set.
        let mut in_range = self.rank_to_seq.range(lo..=hi).map(|(_, &seq)| seq);
        let Some(first) = in_range.next() else {
            return BTreeSet::new();
        };
        let last = in_range.last().unwrap_or(first);

        (first..=last)
            .filter_map(|seq| self.seq_to_backend.get(seq as usize).copied())
            .collect()
    }
}
