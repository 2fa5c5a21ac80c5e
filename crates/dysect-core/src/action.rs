//! Probe actions.
//!
//! Actions run in declaration order when a probe collects. On the
//! back-end, `collect` produces the triggered process's aggregate
//! contribution; contributions are staged per process and merged at
//! quorum. On the front-end, `finish_fe` renders the merged result.
//!
//! Actions must be independently safe to re-run: a process that
//! re-triggers before the quorum window closes simply replaces its
//! staged contribution.
//!
//! The closed set: `trace` (format string with `@function()`,
//! `@location()`, `@desc(var)`, `@min(var)`, `@max(var)`), `stat`,
//! `stackTrace`, `detach`, and the thin engine commands `depositCore`,
//! `loadLibrary`, `writeModuleVariable`, `irpc`, `signal`, `totalview`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregate::{self, frame_id, AggId, AggIdGen, AggKind, Aggregate};
use crate::data_ref::{DataRef, ReadOutcome};
use crate::engine::{DebugEngine, ProcId, ThreadId};
use crate::error::Result;
use crate::process_table::{MpiRank, ProcessTable};
use crate::value::Value;

/// Which processes an aggregate-producing action covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggScope {
    /// Processes that satisfied the probe.
    SatisfyingProcs,
    /// Domain processes that did not satisfy the probe.
    InvSatisfyingProcs,
    /// Every process in the domain.
    AllProcs,
}

/// One piece of a trace format string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TracePart {
    Literal(String),
    Directive(TraceDirective),
}

/// Substitution directives inside a trace format string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceDirective {
    /// `@function()` — innermost function name (lexicographic min).
    Function,
    /// `@location()` — `file:line` of the stop (lexicographic min).
    Location,
    /// `@desc(var)` — synthetic min/max/count description of a variable.
    Desc(DataRef),
    /// `@min(var)`.
    Min(DataRef),
    /// `@max(var)`.
    Max(DataRef),
}

/// Parse a trace format string into literals and directives.
pub fn parse_trace_format(format: &str) -> Result<Vec<TracePart>> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = format;

    while let Some(at) = rest.find('@') {
        literal.push_str(&rest[..at]);
        let tail = &rest[at + 1..];

        let Some(open) = tail.find('(') else {
            // A lone '@' is literal text.
            literal.push('@');
            rest = tail;
            continue;
        };
        let name = &tail[..open];
        let Some(close) = tail[open..].find(')') else {
            return Err(crate::error::DysectError::ResolutionFailure(format!(
                "unterminated directive '@{name}(' in trace format"
            )));
        };
        let arg = &tail[open + 1..open + close];

        let directive = match name {
            "function" => TraceDirective::Function,
            "location" => TraceDirective::Location,
            "desc" => TraceDirective::Desc(DataRef::parse(arg)),
            "min" => TraceDirective::Min(DataRef::parse(arg)),
            "max" => TraceDirective::Max(DataRef::parse(arg)),
            other => {
                // Unknown directives pass through as literal text.
                debug!(directive = other, "unknown trace directive, kept literal");
                literal.push('@');
                literal.push_str(&tail[..open + close + 1]);
                rest = &tail[open + close + 1..];
                continue;
            }
        };

        if !literal.is_empty() {
            parts.push(TracePart::Literal(std::mem::take(&mut literal)));
        }
        parts.push(TracePart::Directive(directive));
        rest = &tail[open + close + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(TracePart::Literal(literal));
    }
    Ok(parts)
}

/// Action kind plus its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionKind {
    Trace {
        format: String,
        parts: Vec<TracePart>,
    },
    Stat {
        scope: AggScope,
        traces: u32,
        frequency_hz: u32,
        threads: bool,
    },
    StackTrace,
    Detach,
    DepositCore,
    LoadLibrary {
        path: String,
    },
    WriteModuleVariable {
        library: String,
        variable: String,
        value: Value,
    },
    Irpc {
        function: String,
    },
    Signal {
        signum: i32,
    },
    Totalview,
}

/// An aggregate slot owned by an action, allocated at prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Slot {
    kind: AggKind,
    id: AggId,
}

/// Everything `collect` needs at a stopped process.
pub struct CollectCtx<'a> {
    pub engine: &'a mut dyn DebugEngine,
    pub table: &'a mut ProcessTable,
    /// Frame-id → name table filled as stacks are walked.
    pub frame_names: &'a mut BTreeMap<u64, String>,
    pub proc: ProcId,
    pub thread: ThreadId,
    pub now_ms: u64,
}

impl CollectCtx<'_> {
    fn mpi_rank(&self) -> Option<MpiRank> {
        self.table.rank_of(self.proc)
    }
}

/// One action of a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    kind: ActionKind,
    /// Slots in directive order (trace) or fixed role order (stat,
    /// stackTrace, totalview).
    slots: Vec<Slot>,
    prepared: bool,
}

impl Action {
    /// `trace(format)`.
    pub fn trace(format: &str) -> Result<Self> {
        let parts = parse_trace_format(format)?;
        Ok(Self {
            kind: ActionKind::Trace {
                format: format.to_string(),
                parts,
            },
            slots: Vec::new(),
            prepared: false,
        })
    }

    /// `stat()` with the original defaults.
    #[must_use]
    pub fn stat() -> Self {
        Self::stat_with(AggScope::SatisfyingProcs, 5, 300, false)
    }

    /// `stat(scope, traces, frequency, threads)`.
    #[must_use]
    pub fn stat_with(scope: AggScope, traces: u32, frequency_hz: u32, threads: bool) -> Self {
        Self {
            kind: ActionKind::Stat {
                scope,
                traces,
                frequency_hz,
                threads,
            },
            slots: Vec::new(),
            prepared: false,
        }
    }

    /// `stackTrace()`.
    #[must_use]
    pub fn stack_trace() -> Self {
        Self {
            kind: ActionKind::StackTrace,
            slots: Vec::new(),
            prepared: false,
        }
    }

    /// `detach()`.
    #[must_use]
    pub fn detach() -> Self {
        Self {
            kind: ActionKind::Detach,
            slots: Vec::new(),
            prepared: false,
        }
    }

    /// `depositCore()`.
    #[must_use]
    pub fn deposit_core() -> Self {
        Self {
            kind: ActionKind::DepositCore,
            slots: Vec::new(),
            prepared: false,
        }
    }

    /// `loadLibrary(path)`.
    #[must_use]
    pub fn load_library(path: &str) -> Self {
        Self {
            kind: ActionKind::LoadLibrary {
                path: path.to_string(),
            },
            slots: Vec::new(),
            prepared: false,
        }
    }

    /// `writeModuleVariable(library, variable, value)`.
    #[must_use]
    pub fn write_module_variable(library: &str, variable: &str, value: Value) -> Self {
        Self {
            kind: ActionKind::WriteModuleVariable {
                library: library.to_string(),
                variable: variable.to_string(),
                value,
            },
            slots: Vec::new(),
            prepared: false,
        }
    }

    /// `irpc(function)`.
    #[must_use]
    pub fn irpc(function: &str) -> Self {
        Self {
            kind: ActionKind::Irpc {
                function: function.to_string(),
            },
            slots: Vec::new(),
            prepared: false,
        }
    }

    /// `signal(signum)`.
    #[must_use]
    pub fn signal(signum: i32) -> Self {
        Self {
            kind: ActionKind::Signal { signum },
            slots: Vec::new(),
            prepared: false,
        }
    }

    /// `totalview()` — request an external-debugger attach on the
    /// satisfying ranks.
    #[must_use]
    pub fn totalview() -> Self {
        Self {
            kind: ActionKind::Totalview,
            slots: Vec::new(),
            prepared: false,
        }
    }

    /// Action kind.
    #[must_use]
    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    /// Allocate aggregate slots. Id allocation is deterministic in tree
    /// and declaration order, so front-end and back-end instances of the
    /// same probe tree agree on ids.
    pub fn prepare(&mut self, ids: &mut AggIdGen) {
        if self.prepared {
            return;
        }
        match &self.kind {
            ActionKind::Trace { parts, .. } => {
                for part in parts {
                    let TracePart::Directive(directive) = part else {
                        continue;
                    };
                    let kind = match directive {
                        TraceDirective::Function | TraceDirective::Location => AggKind::StaticStr,
                        TraceDirective::Desc(_) => AggKind::DescribeVariable,
                        TraceDirective::Min(_) => AggKind::Min,
                        TraceDirective::Max(_) => AggKind::Max,
                    };
                    self.slots.push(Slot {
                        kind,
                        id: ids.next_id(),
                    });
                    if kind == AggKind::DescribeVariable {
                        // Sub-aggregate ids are allocated alongside so
                        // both tiers agree; see `describe_variable`.
                        ids.next_id();
                        ids.next_id();
                        ids.next_id();
                    }
                }
            }
            ActionKind::Stat { .. } => {
                self.slots.push(Slot {
                    kind: AggKind::RankList,
                    id: ids.next_id(),
                });
                self.slots.push(Slot {
                    kind: AggKind::StackTraces,
                    id: ids.next_id(),
                });
            }
            ActionKind::StackTrace => {
                self.slots.push(Slot {
                    kind: AggKind::StackTraces,
                    id: ids.next_id(),
                });
            }
            ActionKind::Totalview => {
                self.slots.push(Slot {
                    kind: AggKind::RankList,
                    id: ids.next_id(),
                });
            }
            _ => {}
        }
        self.prepared = true;
    }

    fn fresh_slot_agg(slot: Slot) -> Aggregate {
        if slot.kind == AggKind::DescribeVariable {
            // Recreate the sub-id layout chosen at prepare.
            let mut sub_ids = AggIdGen::default();
            for _ in 0..=slot.id {
                sub_ids.next_id();
            }
            aggregate::describe_variable(&mut sub_ids, slot.id)
        } else {
            Aggregate::identity(slot.kind, slot.id)
        }
    }

    /// Run at the stopped process; returns this process's aggregate
    /// contribution.
    pub fn collect(&self, ctx: &mut CollectCtx<'_>) -> Result<Vec<Aggregate>> {
        match &self.kind {
            ActionKind::Trace { parts, .. } => {
                let mut out = Vec::new();
                let mut slot_iter = self.slots.iter();
                for part in parts {
                    let TracePart::Directive(directive) = part else {
                        continue;
                    };
                    let slot = *slot_iter.next().expect("slot per directive");
                    let mut agg = Self::fresh_slot_agg(slot);
                    match directive {
                        TraceDirective::Function => {
                            if let Ok(frame) = ctx.engine.current_frame(ctx.proc, ctx.thread) {
                                agg.fold_str(&frame.function);
                            }
                        }
                        TraceDirective::Location => {
                            if let Ok(frame) = ctx.engine.current_frame(ctx.proc, ctx.thread) {
                                agg.fold_str(&frame.location());
                            }
                        }
                        TraceDirective::Desc(var)
                        | TraceDirective::Min(var)
                        | TraceDirective::Max(var) => {
                            if let ReadOutcome::Resolved(value) =
                                var.read(ctx.engine, ctx.proc, ctx.thread)?
                            {
                                agg.fold_value(value, ctx.now_ms);
                            }
                        }
                    }
                    if agg.count > 0 {
                        out.push(agg);
                    }
                }
                Ok(out)
            }
            ActionKind::Stat {
                // Scope widening beyond the triggering process is applied
                // by the session at emit time.
                scope: _,
                traces,
                frequency_hz,
                threads,
            } => {
                let mut rank_list = Self::fresh_slot_agg(self.slots[0]);
                let mut stack_traces = Self::fresh_slot_agg(self.slots[1]);

                if let Some(rank) = ctx.mpi_rank() {
                    rank_list.fold_rank(rank);
                }
                if let Ok(frames) = ctx.engine.stackwalk(ctx.proc, ctx.thread) {
                    fold_walk(&frames, &mut stack_traces, ctx.frame_names);
                }
                ctx.engine
                    .request_stat_trace(&[ctx.proc], *traces, *frequency_hz, *threads)
                    .map_err(crate::engine::EngineError::into_dysect)?;

                Ok(vec![rank_list, stack_traces])
            }
            ActionKind::StackTrace => {
                let mut stack_traces = Self::fresh_slot_agg(self.slots[0]);
                let frames = ctx
                    .engine
                    .stackwalk(ctx.proc, ctx.thread)
                    .map_err(crate::engine::EngineError::into_dysect)?;
                fold_walk(&frames, &mut stack_traces, ctx.frame_names);
                Ok(vec![stack_traces])
            }
            ActionKind::Detach => {
                if ctx.table.is_alive(ctx.proc) {
                    ctx.engine
                        .detach(ctx.proc)
                        .map_err(crate::engine::EngineError::into_dysect)?;
                    ctx.table.mark_dead(ctx.proc);
                }
                Ok(Vec::new())
            }
            ActionKind::DepositCore => {
                ctx.engine
                    .deposit_core(ctx.proc)
                    .map_err(crate::engine::EngineError::into_dysect)?;
                Ok(Vec::new())
            }
            ActionKind::LoadLibrary { path } => {
                ctx.engine
                    .load_library(ctx.proc, path)
                    .map_err(crate::engine::EngineError::into_dysect)?;
                Ok(Vec::new())
            }
            ActionKind::WriteModuleVariable {
                library: _,
                variable,
                value,
            } => {
                let location = match ctx.engine.find_variable(ctx.proc, variable) {
                    Ok(location) => location,
                    Err(e) => return Err(e.into_dysect()),
                };
                let mut bytes = Vec::new();
                value.encode(&mut bytes);
                // Skip the tag byte; the target stores raw value bytes.
                ctx.engine
                    .write_mem(ctx.proc, location.address, &bytes[1..])
                    .map_err(crate::engine::EngineError::into_dysect)?;
                Ok(Vec::new())
            }
            ActionKind::Irpc { function } => {
                ctx.engine
                    .call_function(ctx.proc, function, &[])
                    .map_err(crate::engine::EngineError::into_dysect)?;
                Ok(Vec::new())
            }
            ActionKind::Signal { signum } => {
                ctx.engine
                    .send_signal(ctx.proc, *signum)
                    .map_err(crate::engine::EngineError::into_dysect)?;
                Ok(Vec::new())
            }
            ActionKind::Totalview => {
                let mut rank_list = Self::fresh_slot_agg(self.slots[0]);
                if let Some(rank) = ctx.mpi_rank() {
                    rank_list.fold_rank(rank);
                }
                Ok(vec![rank_list])
            }
        }
    }

    /// Render the front-end finish line from the merged aggregate map.
    #[must_use]
    pub fn finish_fe(
        &self,
        count: u32,
        aggregates: &BTreeMap<AggId, Aggregate>,
        frame_names: &BTreeMap<u64, String>,
    ) -> Option<String> {
        match &self.kind {
            ActionKind::Trace { parts, .. } => {
                let mut line = String::new();
                let mut slot_iter = self.slots.iter();
                for part in parts {
                    match part {
                        TracePart::Literal(text) => line.push_str(text),
                        TracePart::Directive(_) => {
                            let slot = slot_iter.next().expect("slot per directive");
                            match aggregates.get(&slot.id) {
                                Some(agg) => line.push_str(&agg.render(Some(frame_names))),
                                None => line.push_str("<?>"),
                            }
                        }
                    }
                }
                Some(line)
            }
            ActionKind::Stat { .. } => {
                let ranks = aggregates
                    .get(&self.slots[0].id)
                    .map_or_else(|| "<?>".to_string(), |a| a.render(Some(frame_names)));
                let mut line = format!("stat: procs={count} ranks={ranks}");
                if let Some(traces) = aggregates.get(&self.slots[1].id) {
                    let rendered = traces.render(Some(frame_names));
                    if !rendered.is_empty() {
                        line.push('\n');
                        line.push_str(rendered.trim_end());
                    }
                }
                Some(line)
            }
            ActionKind::StackTrace => aggregates
                .get(&self.slots[0].id)
                .map(|traces| traces.render(Some(frame_names)).trim_end().to_string()),
            ActionKind::Totalview => {
                let ranks = aggregates
                    .get(&self.slots[0].id)
                    .map_or_else(|| "<?>".to_string(), |a| a.render(Some(frame_names)));
                Some(format!("totalview attach requested for ranks {ranks}"))
            }
            _ => None,
        }
    }
}

fn fold_walk(
    frames: &[crate::engine::StackFrame],
    agg: &mut Aggregate,
    names: &mut BTreeMap<u64, String>,
) {
    // Walkers report innermost first; the prefix tree wants root first.
    let mut ids = Vec::with_capacity(frames.len());
    for frame in frames.iter().rev() {
        let id = frame_id(&frame.function);
        names.entry(id).or_insert_with(|| frame.function.clone());
        ids.push(id);
    }
    agg.fold_trace(&ids);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockEngine;

    fn ctx<'a>(
        engine: &'a mut MockEngine,
        table: &'a mut ProcessTable,
        names: &'a mut BTreeMap<u64, String>,
        proc: ProcId,
    ) -> CollectCtx<'a> {
        CollectCtx {
            engine,
            table,
            frame_names: names,
            proc,
            thread: 1,
            now_ms: 0,
        }
    }

    // -- Format parsing ---------------------------------------------------------

    #[test]
    fn parse_format_with_directives() {
        let parts = parse_trace_format("hit @function() at @location()").unwrap();
        assert_eq!(
            parts,
            vec![
                TracePart::Literal("hit ".into()),
                TracePart::Directive(TraceDirective::Function),
                TracePart::Literal(" at ".into()),
                TracePart::Directive(TraceDirective::Location),
            ]
        );
    }

    #[test]
    fn parse_format_min_max_desc() {
        let parts = parse_trace_format("@min(x) @max(x) @desc(rank)").unwrap();
        let directives: Vec<_> = parts
            .iter()
            .filter(|p| matches!(p, TracePart::Directive(_)))
            .collect();
        assert_eq!(directives.len(), 3);
    }

    #[test]
    fn parse_format_keeps_unknown_and_lone_at() {
        let parts = parse_trace_format("mail@host @bogus(x)").unwrap();
        assert_eq!(
            parts,
            vec![TracePart::Literal("mail@host @bogus(x)".into())]
        );
        assert!(parse_trace_format("@min(x").is_err());
    }

    // -- Collect / finish -------------------------------------------------------

    #[test]
    fn trace_collect_and_finish_roundtrip() {
        let mut engine = MockEngine::new();
        engine.set_stack(100, 1, &["foo", "main"]);
        engine.set_variable(100, "x", Value::Int(7));
        let mut table = ProcessTable::new(0);
        table.add(100, 0, 0);
        let mut names = BTreeMap::new();

        let mut action = Action::trace("hit @function() x=@min(x)").unwrap();
        let mut ids = AggIdGen::default();
        action.prepare(&mut ids);

        let contributions = {
            let mut c = ctx(&mut engine, &mut table, &mut names, 100);
            action.collect(&mut c).unwrap()
        };
        assert_eq!(contributions.len(), 2);

        let merged: BTreeMap<AggId, Aggregate> =
            contributions.into_iter().map(|a| (a.id, a)).collect();
        let line = action.finish_fe(1, &merged, &names).unwrap();
        assert_eq!(line, "hit foo x=7");
    }

    #[test]
    fn stat_collects_rank_and_stack() {
        let mut engine = MockEngine::new();
        engine.set_stack(100, 1, &["handler", "main"]);
        let mut table = ProcessTable::new(0);
        table.add(100, 2, 0);
        let mut names = BTreeMap::new();

        let mut action = Action::stat();
        let mut ids = AggIdGen::default();
        action.prepare(&mut ids);

        let contributions = {
            let mut c = ctx(&mut engine, &mut table, &mut names, 100);
            action.collect(&mut c).unwrap()
        };
        let rank_list = &contributions[0];
        let stack = &contributions[1];
        assert_eq!(rank_list.render(None), "2");
        assert!(matches!(
            &stack.data,
            crate::aggregate::AggData::StackTraces { tree } if !tree.is_empty()
        ));
        assert!(engine
            .commands()
            .iter()
            .any(|c| c.starts_with("stat_trace")));
    }

    #[test]
    fn detach_is_idempotent() {
        let mut engine = MockEngine::new();
        let mut table = ProcessTable::new(0);
        table.add(100, 0, 0);
        let mut names = BTreeMap::new();

        let action = Action::detach();
        for _ in 0..2 {
            let mut c = ctx(&mut engine, &mut table, &mut names, 100);
            action.collect(&mut c).unwrap();
        }
        assert!(engine.is_detached(100));
        assert!(!table.is_alive(100));
    }

    #[test]
    fn slot_ids_are_deterministic() {
        let mut a = Action::trace("@min(x) @max(x)").unwrap();
        let mut b = Action::trace("@min(x) @max(x)").unwrap();
        let mut ids_a = AggIdGen::default();
        let mut ids_b = AggIdGen::default();
        a.prepare(&mut ids_a);
        b.prepare(&mut ids_b);
        assert_eq!(a, b);
    }
}
