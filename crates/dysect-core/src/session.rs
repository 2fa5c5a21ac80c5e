//! Back-end session: the single owner of all process-wide probe state.
//!
//! One [`Session`] per back-end agent. It owns the flattened probe
//! slab, the event subscriber registries, the wait-timer heap, and the
//! quorum coordinator; nothing in the crate is module-global, so
//! multiple sessions can coexist in one process and tests stay
//! hermetic.
//!
//! # Threading
//!
//! The probe engine is single-threaded cooperative. The debugger
//! engine and the overlay I/O run on their own OS threads and hand
//! [`EngineEvent`]s over a crossbeam channel; [`Session::run`] blocks on
//! the channel with a timeout bounded by the next timer deadline. The
//! direct entry points (`on_breakpoint`, `on_signal`, ...) take an
//! explicit `now_ms` so every quorum decision is deterministic under
//! test.
//!
//! # Error recovery
//!
//! Probe-local failures (resolution, transient target, domain
//! expression) mark the owning probe dead and leave siblings running.
//! Fatal failures propagate; [`Session::shutdown`] disarms every event,
//! drains timers, flushes staged rounds, and reports final stats.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, trace, warn};

use crate::action::{ActionKind, AggScope, CollectCtx};
use crate::condition::{self, ConditionResult};
use crate::config::SessionConfig;
use crate::coordinator::Coordinator;
use crate::engine::{DebugEngine, ProcId, ThreadId};
use crate::error::{DysectError, Result};
use crate::event::{EventPath, PrepareOutcome, Registration};
use crate::packet::{Packet, PacketFlags};
use crate::probe::{probe_id, Persistence, Probe, ProbeIdx, ProbeSpec, ProbeState};
use crate::probe_tree::ProbeTree;
use crate::process_table::ProcessTable;
use crate::timer::WaitTimer;

/// Fallback poll interval when no timer is armed.
const SELECT_TIMEOUT_MS: u64 = 1000;

/// Events delivered from the debugger-engine and overlay threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Breakpoint {
        proc: ProcId,
        thread: ThreadId,
        address: u64,
    },
    Signal {
        proc: ProcId,
        thread: ThreadId,
        signum: i32,
    },
    Exit {
        proc: ProcId,
    },
    Crash {
        proc: ProcId,
        thread: ThreadId,
    },
    LibraryLoaded {
        path: String,
    },
    Shutdown,
}

/// Timer keys: quorum windows and relative time events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum TimerKey {
    Quorum(ProbeIdx),
    Event(ProbeIdx, EventPath),
}

/// One back-end agent's probe engine.
pub struct Session {
    config: SessionConfig,
    engine: Box<dyn DebugEngine>,
    table: ProcessTable,
    stream_id: u32,

    probes: Vec<Probe>,
    roots: Vec<ProbeIdx>,
    /// Probes parked on unresolved pending symbols.
    pending: Vec<ProbeIdx>,
    /// Pending probes that should arm as soon as they resolve.
    arm_on_resolve: BTreeSet<ProbeIdx>,

    breakpoints: BTreeMap<(ProcId, u64), Vec<(ProbeIdx, EventPath)>>,
    signal_subs: BTreeMap<i32, Vec<(ProbeIdx, EventPath)>>,
    exit_subs: Vec<(ProbeIdx, EventPath)>,
    crash_subs: Vec<(ProbeIdx, EventPath)>,

    timers: WaitTimer<TimerKey>,
    coordinator: Coordinator,
    frame_names: BTreeMap<u64, String>,

    out: VecDeque<Vec<u8>>,
    running: bool,
    packets_emitted: u64,
}

impl Session {
    /// New session over a debugger engine and a discovered process
    /// table. `stream_id` names the overlay stream this back-end
    /// reports on.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        engine: Box<dyn DebugEngine>,
        table: ProcessTable,
        stream_id: u32,
    ) -> Self {
        Self {
            config,
            engine,
            table,
            stream_id,
            probes: Vec::new(),
            roots: Vec::new(),
            pending: Vec::new(),
            arm_on_resolve: BTreeSet::new(),
            breakpoints: BTreeMap::new(),
            signal_subs: BTreeMap::new(),
            exit_subs: Vec::new(),
            crash_subs: Vec::new(),
            timers: WaitTimer::new(),
            coordinator: Coordinator::new(),
            frame_names: BTreeMap::new(),
            out: VecDeque::new(),
            running: true,
            packets_emitted: 0,
        }
    }

    /// Flatten the registered tree and arm the roots.
    pub fn prepare(&mut self, tree: &mut ProbeTree, now_ms: u64) -> Result<()> {
        let specs = tree.seal();
        let mut ids = crate::aggregate::AggIdGen::default();
        for (root_index, spec) in specs.into_iter().enumerate() {
            let idx = self.flatten(spec, root_index, &mut Vec::new(), None, &mut ids);
            self.roots.push(idx);
        }

        let local = self.table.local_procs();
        let roots = self.roots.clone();
        for idx in roots {
            // Resolve symbols across the whole subtree up front;
            // children keep their resolution for later arming.
            let outcome = self.prepare_events_below(idx, &local);
            match outcome {
                Ok(root_outcome) => {
                    if let Err(e) = self.probes[idx].domain.prepare(&self.table, None) {
                        self.kill_probe(idx, &e);
                        continue;
                    }
                    match root_outcome {
                        PrepareOutcome::Ready => {
                            if let Err(e) = self.arm_probe(idx, now_ms) {
                                if e.is_probe_local() {
                                    self.kill_probe(idx, &e);
                                } else {
                                    return Err(e);
                                }
                            }
                        }
                        PrepareOutcome::Pending => {
                            self.probes[idx].transition(ProbeState::Pending);
                            self.pending.push(idx);
                            self.arm_on_resolve.insert(idx);
                            debug!(probe = self.probes[idx].id, "root parked pending");
                        }
                    }
                }
                Err(e) if e.is_probe_local() => self.kill_probe(idx, &e),
                Err(e) => return Err(e),
            }
        }

        info!(
            stream = self.stream_id,
            probes = self.probes.len(),
            pending = self.pending.len(),
            break_on_enter = self.config.break_on_enter,
            verbose = self.config.verbose,
            "session prepared"
        );
        Ok(())
    }

    fn flatten(
        &mut self,
        spec: ProbeSpec,
        root_index: usize,
        path: &mut Vec<u8>,
        parent: Option<ProbeIdx>,
        ids: &mut crate::aggregate::AggIdGen,
    ) -> ProbeIdx {
        let id = probe_id(root_index, path);
        let mut actions = spec.actions;
        for action in &mut actions {
            action.prepare(ids);
        }

        let idx = self.probes.len();
        self.probes.push(Probe::new(
            id,
            spec.event,
            spec.domain,
            spec.condition,
            actions,
            spec.persistence,
            parent,
        ));

        for (child_index, child) in spec.children.into_iter().enumerate() {
            path.push(child_index as u8);
            let child_idx = self.flatten(child, root_index, path, Some(idx), ids);
            path.pop();
            self.probes[idx].children.push(child_idx);
        }
        idx
    }

    /// Resolve symbols for a probe and its whole subtree; returns the
    /// probe's own outcome.
    fn prepare_events_below(
        &mut self,
        idx: ProbeIdx,
        local: &crate::process_table::ProcSet,
    ) -> Result<PrepareOutcome> {
        let children = self.probes[idx].children.clone();
        for child in children {
            match self.prepare_events_below(child, local) {
                Ok(_) => {}
                Err(e) if e.is_probe_local() => self.kill_probe(child, &e),
                Err(e) => return Err(e),
            }
        }
        self.probes[idx].event.prepare(&*self.engine, local)
    }

    /// Arm a probe: enable events, hook registries, open the quorum
    /// round. A `stay` re-arm goes through `emit_round` instead, which
    /// keeps the registries and only restarts time leaves.
    fn arm_probe(&mut self, idx: ProbeIdx, now_ms: u64) -> Result<()> {
        let attached = self.probes[idx].domain.attached();
        self.probes[idx].event.enable(&attached);
        let registrations = self.probes[idx].event.registrations(&attached);

        for (path, registration) in registrations {
            match registration {
                Registration::Breakpoint { proc, address } => {
                    self.engine
                        .breakpoint_at(proc, address)
                        .map_err(crate::engine::EngineError::into_dysect)?;
                    self.breakpoints
                        .entry((proc, address))
                        .or_default()
                        .push((idx, path.clone()));
                }
                Registration::Signal(signum) => {
                    self.signal_subs
                        .entry(signum)
                        .or_default()
                        .push((idx, path.clone()));
                }
                Registration::Exit => {
                    self.exit_subs.push((idx, path.clone()));
                }
                Registration::Crash => {
                    self.crash_subs.push((idx, path.clone()));
                }
                // Time events re-anchor on every arm: the deadline is
                // relative to the moment the parent edge traversed.
                Registration::Timer { after_ms } => {
                    self.timers
                        .start(TimerKey::Event(idx, path.clone()), now_ms + after_ms);
                }
            }
        }

        self.coordinator.begin_round(idx, attached);
        self.probes[idx].transition(ProbeState::Armed);
        trace!(probe = self.probes[idx].id, "probe armed");
        Ok(())
    }

    /// Mark a probe dead after a probe-local error; siblings continue.
    fn kill_probe(&mut self, idx: ProbeIdx, err: &DysectError) {
        warn!(probe = self.probes[idx].id, error = %err, "probe failed, marking dead");
        self.disarm_probe(idx);
        self.probes[idx].transition(ProbeState::Dead);
    }

    fn disarm_probe(&mut self, idx: ProbeIdx) {
        let attached = self.probes[idx].domain.attached();
        self.probes[idx].event.disable(&attached);

        // Remove this probe's breakpoints; drop the engine breakpoint
        // once no other probe shares the address.
        let mut to_remove = Vec::new();
        for ((proc, address), handlers) in &mut self.breakpoints {
            handlers.retain(|(p, _)| *p != idx);
            if handlers.is_empty() {
                to_remove.push((*proc, *address));
            }
        }
        for (proc, address) in to_remove {
            self.breakpoints.remove(&(proc, address));
            let _ = self.engine.remove_breakpoint(proc, address);
        }

        for handlers in self.signal_subs.values_mut() {
            handlers.retain(|(p, _)| *p != idx);
        }
        self.exit_subs.retain(|(p, _)| *p != idx);
        self.crash_subs.retain(|(p, _)| *p != idx);

        self.timers.clear(&TimerKey::Quorum(idx));
        let stale: Vec<TimerKey> = self.probes[idx]
            .event
            .leaves()
            .into_iter()
            .map(|(path, _)| TimerKey::Event(idx, path))
            .collect();
        for key in stale {
            self.timers.clear(&key);
        }

        self.coordinator.drop_round(idx);
    }

    // -- Event entry points ------------------------------------------------------

    /// A breakpoint hit was reported for a stopped thread.
    pub fn on_breakpoint(
        &mut self,
        proc: ProcId,
        thread: ThreadId,
        address: u64,
        now_ms: u64,
    ) -> Result<()> {
        let handlers = self
            .breakpoints
            .get(&(proc, address))
            .cloned()
            .unwrap_or_default();
        let mut hold = false;
        for (idx, path) in handlers {
            hold |= self.handle_leaf_fired(idx, &path, proc, thread, now_ms)?;
        }
        if !hold && self.table.is_alive(proc) {
            let _ = self.engine.continue_proc(proc);
        }
        Ok(())
    }

    /// A signal was delivered to a stopped thread.
    pub fn on_signal(
        &mut self,
        proc: ProcId,
        thread: ThreadId,
        signum: i32,
        now_ms: u64,
    ) -> Result<()> {
        let handlers = self
            .signal_subs
            .get(&signum)
            .cloned()
            .unwrap_or_default();
        let mut hold = false;
        for (idx, path) in handlers {
            hold |= self.handle_leaf_fired(idx, &path, proc, thread, now_ms)?;
        }
        if !hold && self.table.is_alive(proc) {
            let _ = self.engine.continue_proc(proc);
        }
        Ok(())
    }

    /// A process exited normally.
    pub fn on_process_exit(&mut self, proc: ProcId, now_ms: u64) -> Result<()> {
        let handlers = self.exit_subs.clone();
        for (idx, path) in handlers {
            self.handle_leaf_fired(idx, &path, proc, 0, now_ms)?;
        }
        self.retire_process(proc, now_ms)
    }

    /// A process terminated abnormally.
    pub fn on_crash(&mut self, proc: ProcId, thread: ThreadId, now_ms: u64) -> Result<()> {
        let handlers = self.crash_subs.clone();
        for (idx, path) in handlers {
            self.handle_leaf_fired(idx, &path, proc, thread, now_ms)?;
        }
        self.retire_process(proc, now_ms)
    }

    /// A shared object finished loading; pending locations re-resolve.
    pub fn on_library_loaded(&mut self, path: &str, now_ms: u64) -> Result<()> {
        debug!(library = path, "re-resolving pending probes");
        let local = self.table.local_procs();
        let parked = std::mem::take(&mut self.pending);
        for idx in parked {
            if self.probes[idx].state != ProbeState::Pending {
                continue;
            }
            match self.probes[idx].event.prepare(&*self.engine, &local) {
                Ok(PrepareOutcome::Ready) => {
                    if self.arm_on_resolve.remove(&idx) {
                        if let Err(e) = self.arm_probe(idx, now_ms) {
                            if e.is_probe_local() {
                                self.kill_probe(idx, &e);
                            } else {
                                return Err(e);
                            }
                        }
                    }
                }
                Ok(PrepareOutcome::Pending) => self.pending.push(idx),
                Err(e) if e.is_probe_local() => self.kill_probe(idx, &e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Mark a process dead and re-check quorums it was holding up.
    fn retire_process(&mut self, proc: ProcId, now_ms: u64) -> Result<()> {
        self.table.mark_dead(proc);
        for idx in 0..self.probes.len() {
            if !self.probes[idx].is_active() || !self.coordinator.has_arrivals(idx) {
                continue;
            }
            let expected = self.coordinator.expected(idx);
            let live = self.table.live_subset(&expected);
            if self.coordinator.quorum_met(idx, &live) {
                self.emit_round(idx, now_ms)?;
            }
        }
        Ok(())
    }

    /// Timer boundary: fire expired quorum windows and time events.
    pub fn tick(&mut self, now_ms: u64) -> Result<()> {
        for key in self.timers.drain_expired(now_ms) {
            match key {
                TimerKey::Quorum(idx) => {
                    if self.coordinator.has_arrivals(idx) {
                        debug!(probe = self.probes[idx].id, "quorum window expired");
                        self.emit_round(idx, now_ms)?;
                    }
                }
                TimerKey::Event(idx, path) => self.fire_time_leaf(idx, &path, now_ms)?,
            }
        }
        Ok(())
    }

    fn fire_time_leaf(&mut self, idx: ProbeIdx, path: &[u8], now_ms: u64) -> Result<()> {
        if !self.probes[idx].is_active() {
            return Ok(());
        }
        let procs = match self.probes[idx].event.leaf_at(path) {
            Some(crate::event::Event::Time { enabled, .. }) => enabled.clone(),
            _ => return Ok(()),
        };
        for proc in procs {
            if !self.table.is_alive(proc) {
                continue;
            }
            self.handle_leaf_fired(idx, path, proc, 0, now_ms)?;
        }
        Ok(())
    }

    /// Core dispatch: a leaf fired for a process. Returns true when the
    /// caller must not resume the process (blocked, or already resumed
    /// at emit).
    fn handle_leaf_fired(
        &mut self,
        idx: ProbeIdx,
        path: &[u8],
        proc: ProcId,
        thread: ThreadId,
        now_ms: u64,
    ) -> Result<bool> {
        if !matches!(
            self.probes[idx].state,
            ProbeState::Armed | ProbeState::Triggered | ProbeState::Collected
        ) {
            return Ok(false);
        }
        if !self.probes[idx].event.note_fired(path, proc) {
            return Ok(false);
        }
        if !self.probes[idx].event.satisfied(proc) {
            return Ok(false);
        }
        if self.probes[idx].satisfied.contains(&proc) {
            // Already collected this round.
            return Ok(false);
        }

        self.probes[idx].transition(ProbeState::Triggered);

        let evaluated = self.probes[idx]
            .condition
            .as_ref()
            .map(|cond| cond.evaluate(&*self.engine, proc, thread));
        let proceed = match evaluated {
            None => true,
            Some(Ok(result)) => match result {
                ConditionResult::ResolvedTrue | ConditionResult::Resolved => true,
                ConditionResult::ResolvedFalse => false,
                ConditionResult::Unresolved => condition::proceed_on_unresolved(
                    self.probes[idx].event.leaf_is_location(path),
                ),
                ConditionResult::CollectiveResolvable
                | ConditionResult::CollectiveResolvedTrue
                | ConditionResult::CollectiveResolvedFalse => false,
            },
            Some(Err(e)) if e.is_probe_local() => {
                self.kill_probe(idx, &e);
                return Ok(false);
            }
            Some(Err(e)) => return Err(e),
        };

        if !proceed {
            trace!(probe = self.probes[idx].id, proc, "condition rejected process");
            self.probes[idx].event.reset_fired_for(proc);
            let back = if self.coordinator.has_arrivals(idx) {
                ProbeState::Collected
            } else {
                ProbeState::Armed
            };
            self.probes[idx].transition(back);
            return Ok(false);
        }

        let contributions = match self.collect_for(idx, proc, thread, now_ms) {
            Ok(contributions) => contributions,
            Err(e) if e.is_probe_local() => {
                self.kill_probe(idx, &e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.probes[idx].satisfied.insert(proc);
        let first_arrival = self.coordinator.report(idx, proc, contributions, now_ms);
        self.probes[idx].transition(ProbeState::Collected);

        if first_arrival && self.probes[idx].domain.has_wait() {
            let deadline = now_ms + self.probes[idx].domain.wait_ms();
            self.timers.start(TimerKey::Quorum(idx), deadline);
        }

        let hold = self.probes[idx].domain.is_blocking();
        if hold {
            self.probes[idx].stopped.push((proc, thread));
        }

        let expected = self.coordinator.expected(idx);
        let live = self.table.live_subset(&expected);
        if self.coordinator.quorum_met(idx, &live) {
            self.emit_round(idx, now_ms)?;
        }
        Ok(hold)
    }

    /// Run all actions at the stopped process, in declaration order.
    fn collect_for(
        &mut self,
        idx: ProbeIdx,
        proc: ProcId,
        thread: ThreadId,
        now_ms: u64,
    ) -> Result<Vec<crate::aggregate::Aggregate>> {
        let actions = &self.probes[idx].actions;
        let mut ctx = CollectCtx {
            engine: &mut *self.engine,
            table: &mut self.table,
            frame_names: &mut self.frame_names,
            proc,
            thread,
            now_ms,
        };
        let mut contributions = Vec::new();
        for action in actions {
            contributions.extend(action.collect(&mut ctx)?);
        }
        Ok(contributions)
    }

    /// Widen stat scopes beyond the satisfying processes before a round
    /// closes.
    fn widen_scopes(&mut self, idx: ProbeIdx, now_ms: u64) -> Result<()> {
        let expected = self.coordinator.expected(idx);
        let satisfied = self.probes[idx].satisfied.clone();
        let reported = self.coordinator.reported(idx);

        for action_index in 0..self.probes[idx].actions.len() {
            let scope = match self.probes[idx].actions[action_index].kind() {
                ActionKind::Stat { scope, .. } => *scope,
                _ => continue,
            };
            let extra: Vec<ProcId> = match scope {
                AggScope::SatisfyingProcs => continue,
                AggScope::InvSatisfyingProcs => expected
                    .iter()
                    .copied()
                    .filter(|p| !satisfied.contains(p))
                    .collect(),
                AggScope::AllProcs => expected
                    .iter()
                    .copied()
                    .filter(|p| !reported.contains(p))
                    .collect(),
            };
            for proc in extra {
                if !self.table.is_alive(proc) {
                    continue;
                }
                let contribution = {
                    let action = &self.probes[idx].actions[action_index];
                    let mut ctx = CollectCtx {
                        engine: &mut *self.engine,
                        table: &mut self.table,
                        frame_names: &mut self.frame_names,
                        proc,
                        thread: 0,
                        now_ms,
                    };
                    action.collect(&mut ctx)
                };
                match contribution {
                    Ok(c) => {
                        self.coordinator.report(idx, proc, c, now_ms);
                    }
                    Err(e) if e.is_probe_local() => {
                        debug!(proc, error = %e, "scope widening skipped process");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Close a probe round: emit one packet, release blocked processes,
    /// arm children, apply persistence.
    fn emit_round(&mut self, idx: ProbeIdx, now_ms: u64) -> Result<()> {
        // Quorum is judged on satisfying participation, before any
        // scope widening adds non-satisfying contributions.
        let expected = self.coordinator.expected(idx);
        let live = self.table.live_subset(&expected);
        let quorum = self.coordinator.quorum_met(idx, &live);

        self.widen_scopes(idx, now_ms)?;
        let (merged, reported) = self.coordinator.take_round(idx);
        self.timers.clear(&TimerKey::Quorum(idx));

        if reported == 0 {
            // Timer property: with no arrivals there is no packet and
            // the probe stays armed.
            return Ok(());
        }

        let mut packet = Packet::new(self.stream_id, self.probes[idx].id);
        packet.count = reported;
        if !quorum {
            packet.flags = PacketFlags::partial();
        }
        packet.aggregates = merged;
        self.out.push_back(packet.encode());
        self.packets_emitted += 1;

        self.probes[idx].transition(ProbeState::QuorumReady);
        self.probes[idx].transition(ProbeState::Reported);
        info!(
            probe = self.probes[idx].id,
            count = reported,
            partial = !quorum,
            "probe round emitted"
        );

        // Blocked processes resume at report. On a missed quorum with
        // break-on-timeout set they stay stopped for inspection.
        let release = quorum || !self.config.break_on_timeout;
        for (proc, _thread) in std::mem::take(&mut self.probes[idx].stopped) {
            if release && self.table.is_alive(proc) {
                let _ = self.engine.continue_proc(proc);
            }
        }

        // Children arm strictly after the parent's report, with the
        // satisfying set as their inherited parent set.
        let satisfied = self.probes[idx].satisfied.clone();
        let parent_backends = self.probes[idx].domain.expected_backends();
        let parent_wait = self.probes[idx].domain.wait_ms();
        let children = self.probes[idx].children.clone();
        for child in children {
            if self.probes[child].state != ProbeState::Unarmed {
                continue;
            }
            let prepared = self.probes[child].domain.prepare(
                &self.table,
                Some((&satisfied, &parent_backends, parent_wait)),
            );
            if let Err(e) = prepared {
                self.kill_probe(child, &e);
                continue;
            }
            if self.probes[child].event.has_pending_location() {
                self.probes[child].transition(ProbeState::Pending);
                self.pending.push(child);
                self.arm_on_resolve.insert(child);
                continue;
            }
            if let Err(e) = self.arm_probe(child, now_ms) {
                if e.is_probe_local() {
                    self.kill_probe(child, &e);
                } else {
                    return Err(e);
                }
            }
        }

        match self.probes[idx].persistence {
            Persistence::Stay => {
                self.probes[idx].rearm_round();
                let attached = self.probes[idx].domain.attached();
                self.coordinator.begin_round(idx, attached);
                self.restart_time_leaves(idx, now_ms);
                self.probes[idx].transition(ProbeState::Armed);
            }
            Persistence::Once => {
                self.disarm_probe(idx);
                self.probes[idx].transition(ProbeState::Dead);
            }
        }
        Ok(())
    }

    fn restart_time_leaves(&mut self, idx: ProbeIdx, now_ms: u64) {
        let timers: Vec<(EventPath, u64)> = self.probes[idx]
            .event
            .leaves()
            .into_iter()
            .filter_map(|(path, leaf)| match leaf {
                crate::event::Event::Time { after_ms, .. } => Some((path, *after_ms)),
                _ => None,
            })
            .collect();
        for (path, after_ms) in timers {
            self.timers
                .start(TimerKey::Event(idx, path), now_ms + after_ms);
        }
    }

    // -- Loop and teardown -------------------------------------------------------

    /// Dispatch one engine event.
    pub fn dispatch(&mut self, event: EngineEvent, now_ms: u64) -> Result<()> {
        match event {
            EngineEvent::Breakpoint {
                proc,
                thread,
                address,
            } => self.on_breakpoint(proc, thread, address, now_ms),
            EngineEvent::Signal {
                proc,
                thread,
                signum,
            } => self.on_signal(proc, thread, signum, now_ms),
            EngineEvent::Exit { proc } => self.on_process_exit(proc, now_ms),
            EngineEvent::Crash { proc, thread } => self.on_crash(proc, thread, now_ms),
            EngineEvent::LibraryLoaded { path } => self.on_library_loaded(&path, now_ms),
            EngineEvent::Shutdown => {
                self.shutdown(now_ms);
                Ok(())
            }
        }
    }

    /// Engine loop: block on the event channel, bounded by the next
    /// timer deadline. Returns when shut down or when the channel
    /// disconnects.
    pub fn run(&mut self, events: &Receiver<EngineEvent>) -> Result<()> {
        let origin = Instant::now();
        while self.running {
            let now_ms = origin.elapsed().as_millis() as u64;
            let wait = self
                .timers
                .next_deadline()
                .map_or(SELECT_TIMEOUT_MS, |deadline| {
                    deadline.saturating_sub(now_ms).min(SELECT_TIMEOUT_MS)
                });

            match events.recv_timeout(Duration::from_millis(wait)) {
                Ok(event) => {
                    let now_ms = origin.elapsed().as_millis() as u64;
                    if let Err(e) = self.dispatch(event, now_ms) {
                        if e.is_fatal() {
                            warn!(error = %e, "fatal engine error, tearing down");
                            self.shutdown(now_ms);
                            return Err(e);
                        }
                        warn!(error = %e, "engine event failed");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now_ms = origin.elapsed().as_millis() as u64;
            self.tick(now_ms)?;
        }
        Ok(())
    }

    /// Tear the session down cleanly: flush staged rounds, disarm every
    /// event, drain timers, report final stats.
    pub fn shutdown(&mut self, now_ms: u64) {
        self.running = false;
        for idx in 0..self.probes.len() {
            if self.probes[idx].is_active() && self.coordinator.has_arrivals(idx) {
                if let Err(e) = self.emit_round(idx, now_ms) {
                    warn!(error = %e, "flush on shutdown failed");
                }
            }
        }
        for idx in 0..self.probes.len() {
            if self.probes[idx].is_active() {
                self.disarm_probe(idx);
                self.probes[idx].transition(ProbeState::Dead);
            }
        }
        self.timers.drain_all();
        info!(
            packets = self.packets_emitted,
            probes = self.probes.len(),
            "session drained"
        );
    }

    // -- Introspection -----------------------------------------------------------

    /// Drain packets emitted since the last call.
    pub fn drain_packets(&mut self) -> Vec<Vec<u8>> {
        self.out.drain(..).collect()
    }

    /// Earliest armed timer deadline.
    pub fn next_deadline(&mut self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Frame-id → name table accumulated while walking stacks.
    #[must_use]
    pub fn frame_names(&self) -> &BTreeMap<u64, String> {
        &self.frame_names
    }

    /// Lifecycle state of the `index`-th registered root.
    #[must_use]
    pub fn root_state(&self, index: usize) -> Option<ProbeState> {
        self.roots
            .get(index)
            .map(|&idx| self.probes[idx].state)
    }

    /// The process table (engine-thread snapshots go through here).
    #[must_use]
    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    /// Total packets emitted.
    #[must_use]
    pub fn packets_emitted(&self) -> u64 {
        self.packets_emitted
    }
}
