//! Session process table.
//!
//! One row per target process resident on this back-end, plus the two
//! lookup tables domain resolution needs: MPI rank → process and MPI
//! rank → back-end rank. The debugger-engine thread owns process
//! discovery; the probe engine sees immutable snapshots taken per event.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::engine::ProcId;

/// MPI rank of a target process.
pub type MpiRank = u32;

/// Rank of a back-end agent in the overlay tree.
pub type BackendRank = u32;

/// Set of target processes.
pub type ProcSet = BTreeSet<ProcId>;

/// One target process known to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    /// Process id on this back-end.
    pub proc: ProcId,
    /// Global MPI rank.
    pub mpi_rank: MpiRank,
    /// Back-end agent this process is attached to.
    pub backend_rank: BackendRank,
    /// False once the process exited, crashed, or was detached.
    pub alive: bool,
}

/// Process table for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessTable {
    entries: Vec<ProcessEntry>,
    by_proc: BTreeMap<ProcId, usize>,
    by_mpi_rank: BTreeMap<MpiRank, usize>,
    /// Back-end rank of the local agent.
    local_backend: BackendRank,
}

impl ProcessTable {
    /// Empty table for the given local back-end rank.
    #[must_use]
    pub fn new(local_backend: BackendRank) -> Self {
        Self {
            local_backend,
            ..Self::default()
        }
    }

    /// Rank of the local back-end agent.
    #[must_use]
    pub fn local_backend(&self) -> BackendRank {
        self.local_backend
    }

    /// Register a process. Later registrations for the same MPI rank
    /// replace earlier ones.
    pub fn add(&mut self, proc: ProcId, mpi_rank: MpiRank, backend_rank: BackendRank) {
        let entry = ProcessEntry {
            proc,
            mpi_rank,
            backend_rank,
            alive: true,
        };
        let idx = self.entries.len();
        self.entries.push(entry);
        self.by_proc.insert(proc, idx);
        self.by_mpi_rank.insert(mpi_rank, idx);
    }

    /// Look up by process id.
    #[must_use]
    pub fn by_proc(&self, proc: ProcId) -> Option<&ProcessEntry> {
        self.by_proc.get(&proc).map(|&idx| &self.entries[idx])
    }

    /// Look up by MPI rank.
    #[must_use]
    pub fn by_rank(&self, rank: MpiRank) -> Option<&ProcessEntry> {
        self.by_mpi_rank.get(&rank).map(|&idx| &self.entries[idx])
    }

    /// MPI rank of a process, if known.
    #[must_use]
    pub fn rank_of(&self, proc: ProcId) -> Option<MpiRank> {
        self.by_proc(proc).map(|e| e.mpi_rank)
    }

    /// All processes resident on the local back-end.
    #[must_use]
    pub fn local_procs(&self) -> ProcSet {
        self.entries
            .iter()
            .filter(|e| e.backend_rank == self.local_backend)
            .map(|e| e.proc)
            .collect()
    }

    /// All MPI ranks in the table, sorted.
    #[must_use]
    pub fn all_ranks(&self) -> Vec<MpiRank> {
        self.by_mpi_rank.keys().copied().collect()
    }

    /// Iterate all entries.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessEntry> {
        self.entries.iter()
    }

    /// Mark a process dead (exit, crash, or detach). Idempotent.
    pub fn mark_dead(&mut self, proc: ProcId) {
        if let Some(&idx) = self.by_proc.get(&proc) {
            self.entries[idx].alive = false;
        }
    }

    /// True while the process participates in quorums.
    #[must_use]
    pub fn is_alive(&self, proc: ProcId) -> bool {
        self.by_proc(proc).is_some_and(|e| e.alive)
    }

    /// The subset of `procs` still alive.
    #[must_use]
    pub fn live_subset(&self, procs: &ProcSet) -> ProcSet {
        procs
            .iter()
            .copied()
            .filter(|&p| self.is_alive(p))
            .collect()
    }

    /// Immutable snapshot handed to the engine thread.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProcessEntry> {
        self.entries.clone()
    }
}
