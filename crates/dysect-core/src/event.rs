//! Event layer: sources of probe triggers.
//!
//! An event is a tree — leaves observe the target (code locations,
//! signals, exits, crashes, relative time), interior nodes are boolean
//! combinators. Leaves record which processes they have fired for;
//! [`Event::satisfied`] folds the combinator logic over those sets:
//!
//! - `Or` fires when any child has fired;
//! - `And` fires once every child has fired without an intervening
//!   re-arm;
//! - `Not` demonstrates absence: it is satisfied exactly while its child
//!   has not fired, which pairs with a `Time` sibling to express "still
//!   inside `foo` after 500 ms".
//!
//! Code locations support deferred resolution: a location that does not
//! resolve yet (`pending`) parks the owning probe until a shared object
//! load triggers re-resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::engine::{DebugEngine, EngineError, ProcId};
use crate::error::{DysectError, Result};
use crate::process_table::ProcSet;

/// Path from an event-tree root to a node (child indices).
pub type EventPath = Vec<u8>;

/// A code-location expression.
///
/// Script syntax: `foo` (function entry), `~foo` (function exit),
/// `main.c#42` (source line), `libfoo!bar` (symbol in a library, `~`
/// allowed on the symbol), or a regex pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationSpec {
    Function { name: String, exit: bool },
    SourceLine { file: String, line: u32 },
    LibSymbol { lib: String, symbol: String, exit: bool },
    Pattern { pattern: String, exit: bool },
}

impl LocationSpec {
    /// Parse script syntax.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let (exit, rest) = match trimmed.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        if rest.is_empty() {
            return Err(DysectError::ResolutionFailure(
                "empty code location".into(),
            ));
        }

        if let Some((lib, symbol)) = rest.split_once('!') {
            if lib.is_empty() || symbol.is_empty() {
                return Err(DysectError::ResolutionFailure(format!(
                    "malformed library location '{trimmed}'"
                )));
            }
            return Ok(Self::LibSymbol {
                lib: lib.to_string(),
                symbol: symbol.to_string(),
                exit,
            });
        }

        if let Some((file, line)) = rest.split_once('#') {
            let line: u32 = line.parse().map_err(|_| {
                DysectError::ResolutionFailure(format!(
                    "bad line number in location '{trimmed}'"
                ))
            })?;
            return Ok(Self::SourceLine {
                file: file.to_string(),
                line,
            });
        }

        if rest
            .chars()
            .any(|c| matches!(c, '*' | '[' | ']' | '?' | '^' | '$' | '+' | '|' | '('))
        {
            // Validate the pattern eagerly so a bad regex fails at
            // construction, not at prepare.
            regex::Regex::new(rest).map_err(|e| {
                DysectError::ResolutionFailure(format!("bad location pattern: {e}"))
            })?;
            return Ok(Self::Pattern {
                pattern: rest.to_string(),
                exit,
            });
        }

        Ok(Self::Function {
            name: rest.to_string(),
            exit,
        })
    }

    /// Script-syntax rendering.
    #[must_use]
    pub fn render(&self) -> String {
        let (exit, body) = match self {
            Self::Function { name, exit } => (*exit, name.clone()),
            Self::SourceLine { file, line } => (false, format!("{file}#{line}")),
            Self::LibSymbol { lib, symbol, exit } => (*exit, format!("{lib}!{symbol}")),
            Self::Pattern { pattern, exit } => (*exit, pattern.clone()),
        };
        if exit {
            format!("~{body}")
        } else {
            body
        }
    }

    /// Library the location depends on, when any.
    #[must_use]
    pub fn library(&self) -> Option<&str> {
        match self {
            Self::LibSymbol { lib, .. } => Some(lib),
            _ => None,
        }
    }
}

/// Asynchronous trigger kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncKind {
    /// A specific signal was delivered.
    Signal(i32),
    /// Normal process exit.
    Exit,
    /// Abnormal termination.
    Crash,
}

/// Outcome of symbol resolution during `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// All leaves resolved; the probe can arm.
    Ready,
    /// A pending-enabled location is unresolved; park the probe.
    Pending,
}

/// What a leaf needs hooked into the session registries when enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Insert a breakpoint and route hits back.
    Breakpoint { proc: ProcId, address: u64 },
    /// Subscribe to a signal.
    Signal(i32),
    /// Subscribe to process exits.
    Exit,
    /// Subscribe to crashes.
    Crash,
    /// Arm a relative deadline at probe-arm time.
    Timer { after_ms: u64 },
}

/// Event tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Code location (breakpoint) trigger.
    CodeLocation {
        spec: LocationSpec,
        /// Queue the probe for re-resolution instead of failing when the
        /// location does not resolve.
        pending: bool,
        /// Resolved addresses per process.
        #[serde(skip)]
        addrs: BTreeMap<ProcId, Vec<u64>>,
        #[serde(skip)]
        enabled: ProcSet,
        #[serde(skip)]
        fired: ProcSet,
    },
    /// Signal, exit, or crash trigger.
    Async {
        kind: AsyncKind,
        #[serde(skip)]
        enabled: ProcSet,
        #[serde(skip)]
        fired: ProcSet,
    },
    /// Fires `after_ms` after the parent edge was traversed.
    Time {
        after_ms: u64,
        #[serde(skip)]
        enabled: ProcSet,
        #[serde(skip)]
        fired: ProcSet,
    },
    And { children: Vec<Event> },
    Or { children: Vec<Event> },
    Not { child: Box<Event> },
}

impl Event {
    /// Code-location event, failing hard when unresolved.
    pub fn location(expr: &str) -> Result<Self> {
        Ok(Self::CodeLocation {
            spec: LocationSpec::parse(expr)?,
            pending: false,
            addrs: BTreeMap::new(),
            enabled: ProcSet::new(),
            fired: ProcSet::new(),
        })
    }

    /// Code-location event that parks the probe until the symbol loads.
    pub fn location_pending(expr: &str) -> Result<Self> {
        Ok(Self::CodeLocation {
            spec: LocationSpec::parse(expr)?,
            pending: true,
            addrs: BTreeMap::new(),
            enabled: ProcSet::new(),
            fired: ProcSet::new(),
        })
    }

    /// Signal event.
    #[must_use]
    pub fn signal(signum: i32) -> Self {
        Self::Async {
            kind: AsyncKind::Signal(signum),
            enabled: ProcSet::new(),
            fired: ProcSet::new(),
        }
    }

    /// Process-exit event.
    #[must_use]
    pub fn exit() -> Self {
        Self::Async {
            kind: AsyncKind::Exit,
            enabled: ProcSet::new(),
            fired: ProcSet::new(),
        }
    }

    /// Crash event.
    #[must_use]
    pub fn crash() -> Self {
        Self::Async {
            kind: AsyncKind::Crash,
            enabled: ProcSet::new(),
            fired: ProcSet::new(),
        }
    }

    /// Fires `after_ms` after the probe arms.
    #[must_use]
    pub fn within_ms(after_ms: u64) -> Self {
        Self::Time {
            after_ms,
            enabled: ProcSet::new(),
            fired: ProcSet::new(),
        }
    }

    /// Both children must fire.
    #[must_use]
    pub fn and(a: Self, b: Self) -> Self {
        Self::And {
            children: vec![a, b],
        }
    }

    /// Either child fires.
    #[must_use]
    pub fn or(a: Self, b: Self) -> Self {
        Self::Or {
            children: vec![a, b],
        }
    }

    /// Satisfied while the child has not fired.
    #[must_use]
    pub fn not(child: Self) -> Self {
        Self::Not {
            child: Box::new(child),
        }
    }

    /// True for leaf nodes.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            Self::CodeLocation { .. } | Self::Async { .. } | Self::Time { .. }
        )
    }

    fn children(&self) -> &[Event] {
        match self {
            Self::And { children } | Self::Or { children } => children,
            Self::Not { child } => std::slice::from_ref(child),
            _ => &[],
        }
    }

    fn children_mut(&mut self) -> &mut [Event] {
        match self {
            Self::And { children } | Self::Or { children } => children,
            Self::Not { child } => std::slice::from_mut(child),
            _ => &mut [],
        }
    }

    /// Enumerate leaves with their tree paths.
    #[must_use]
    pub fn leaves(&self) -> Vec<(EventPath, &Event)> {
        let mut out = Vec::new();
        self.collect_leaves(&mut Vec::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(
        &'a self,
        path: &mut EventPath,
        out: &mut Vec<(EventPath, &'a Event)>,
    ) {
        if self.is_leaf() {
            out.push((path.clone(), self));
            return;
        }
        for (i, child) in self.children().iter().enumerate() {
            path.push(i as u8);
            child.collect_leaves(path, out);
            path.pop();
        }
    }

    /// Leaf at a path produced by [`Event::leaves`].
    #[must_use]
    pub fn leaf_at(&self, path: &[u8]) -> Option<&Event> {
        let mut node = self;
        for &idx in path {
            node = node.children().get(idx as usize)?;
        }
        node.is_leaf().then_some(node)
    }

    /// Mutable leaf access.
    pub fn leaf_at_mut(&mut self, path: &[u8]) -> Option<&mut Event> {
        let mut node = self;
        for &idx in path {
            node = node.children_mut().get_mut(idx as usize)?;
        }
        node.is_leaf().then_some(node)
    }

    /// Resolve symbolic references for the given processes.
    pub fn prepare(
        &mut self,
        engine: &dyn DebugEngine,
        procs: &ProcSet,
    ) -> Result<PrepareOutcome> {
        match self {
            Self::CodeLocation {
                spec,
                pending,
                addrs,
                ..
            } => {
                let mut unresolved = false;
                for &proc in procs {
                    match engine.resolve_location(proc, spec) {
                        Ok(resolved) if !resolved.is_empty() => {
                            addrs.insert(proc, resolved);
                        }
                        Ok(_) | Err(EngineError::NotFound(_)) => unresolved = true,
                        Err(other) => return Err(other.into_dysect()),
                    }
                }
                if unresolved && addrs.is_empty() {
                    if *pending {
                        trace!(location = %spec.render(), "location pending resolution");
                        return Ok(PrepareOutcome::Pending);
                    }
                    return Err(DysectError::ResolutionFailure(format!(
                        "code location '{}' did not resolve",
                        spec.render()
                    )));
                }
                Ok(PrepareOutcome::Ready)
            }
            Self::Async { .. } | Self::Time { .. } => Ok(PrepareOutcome::Ready),
            Self::And { children } | Self::Or { children } => {
                let mut outcome = PrepareOutcome::Ready;
                for child in children {
                    if child.prepare(engine, procs)? == PrepareOutcome::Pending {
                        outcome = PrepareOutcome::Pending;
                    }
                }
                Ok(outcome)
            }
            Self::Not { child } => child.prepare(engine, procs),
        }
    }

    /// Mark the given processes enabled on every leaf.
    pub fn enable(&mut self, procs: &ProcSet) {
        match self {
            Self::CodeLocation { enabled, .. }
            | Self::Async { enabled, .. }
            | Self::Time { enabled, .. } => {
                enabled.extend(procs.iter().copied());
            }
            _ => {
                for child in self.children_mut() {
                    child.enable(procs);
                }
            }
        }
    }

    /// Remove the given processes from every leaf and clear their fired
    /// marks.
    pub fn disable(&mut self, procs: &ProcSet) {
        match self {
            Self::CodeLocation { enabled, fired, .. }
            | Self::Async { enabled, fired, .. }
            | Self::Time { enabled, fired, .. } => {
                for proc in procs {
                    enabled.remove(proc);
                    fired.remove(proc);
                }
            }
            _ => {
                for child in self.children_mut() {
                    child.disable(procs);
                }
            }
        }
    }

    /// True when the process is enabled on any leaf.
    #[must_use]
    pub fn is_enabled(&self, proc: ProcId) -> bool {
        match self {
            Self::CodeLocation { enabled, .. }
            | Self::Async { enabled, .. }
            | Self::Time { enabled, .. } => enabled.contains(&proc),
            _ => self.children().iter().any(|c| c.is_enabled(proc)),
        }
    }

    /// Union of enabled processes across leaves.
    #[must_use]
    pub fn enabled_procs(&self) -> ProcSet {
        match self {
            Self::CodeLocation { enabled, .. }
            | Self::Async { enabled, .. }
            | Self::Time { enabled, .. } => enabled.clone(),
            _ => {
                let mut out = ProcSet::new();
                for child in self.children() {
                    out.extend(child.enabled_procs());
                }
                out
            }
        }
    }

    /// Record a leaf firing for a process. Returns false when the leaf
    /// path is invalid or the process is not enabled there.
    pub fn note_fired(&mut self, path: &[u8], proc: ProcId) -> bool {
        let Some(leaf) = self.leaf_at_mut(path) else {
            return false;
        };
        match leaf {
            Self::CodeLocation { enabled, fired, .. }
            | Self::Async { enabled, fired, .. }
            | Self::Time { enabled, fired, .. } => {
                if !enabled.contains(&proc) {
                    return false;
                }
                fired.insert(proc);
                true
            }
            _ => false,
        }
    }

    /// Fold combinator logic over the leaves' fired sets.
    #[must_use]
    pub fn satisfied(&self, proc: ProcId) -> bool {
        match self {
            Self::CodeLocation { fired, .. }
            | Self::Async { fired, .. }
            | Self::Time { fired, .. } => fired.contains(&proc),
            Self::And { children } => children.iter().all(|c| c.satisfied(proc)),
            Self::Or { children } => children.iter().any(|c| c.satisfied(proc)),
            Self::Not { child } => !child.satisfied(proc),
        }
    }

    /// Clear one process's fired marks (condition rejected the process;
    /// it may re-fire within the same round).
    pub fn reset_fired_for(&mut self, proc: ProcId) {
        match self {
            Self::CodeLocation { fired, .. }
            | Self::Async { fired, .. }
            | Self::Time { fired, .. } => {
                fired.remove(&proc);
            }
            _ => {
                for child in self.children_mut() {
                    child.reset_fired_for(proc);
                }
            }
        }
    }

    /// Clear fired marks (probe re-arm).
    pub fn reset_fired(&mut self) {
        match self {
            Self::CodeLocation { fired, .. }
            | Self::Async { fired, .. }
            | Self::Time { fired, .. } => fired.clear(),
            _ => {
                for child in self.children_mut() {
                    child.reset_fired();
                }
            }
        }
    }

    /// What this leaf needs hooked when the probe arms for `procs`.
    #[must_use]
    pub fn registrations(&self, procs: &ProcSet) -> Vec<(EventPath, Registration)> {
        let mut out = Vec::new();
        for (path, leaf) in self.leaves() {
            match leaf {
                Self::CodeLocation { addrs, .. } => {
                    for &proc in procs {
                        if let Some(proc_addrs) = addrs.get(&proc) {
                            for &address in proc_addrs {
                                out.push((
                                    path.clone(),
                                    Registration::Breakpoint { proc, address },
                                ));
                            }
                        }
                    }
                }
                Self::Async { kind, .. } => {
                    let registration = match kind {
                        AsyncKind::Signal(signum) => Registration::Signal(*signum),
                        AsyncKind::Exit => Registration::Exit,
                        AsyncKind::Crash => Registration::Crash,
                    };
                    out.push((path, registration));
                }
                Self::Time { after_ms, .. } => {
                    out.push((path, Registration::Timer { after_ms: *after_ms }));
                }
                _ => {}
            }
        }
        out
    }

    /// True when the leaf at `path` is a code location (condition
    /// policy: proceed on unresolved).
    #[must_use]
    pub fn leaf_is_location(&self, path: &[u8]) -> bool {
        matches!(self.leaf_at(path), Some(Self::CodeLocation { .. }))
    }

    /// True when any leaf is an unresolved pending code location.
    #[must_use]
    pub fn has_pending_location(&self) -> bool {
        match self {
            Self::CodeLocation { pending, addrs, .. } => *pending && addrs.is_empty(),
            _ => self.children().iter().any(Event::has_pending_location),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- LocationSpec -----------------------------------------------------------

    #[test]
    fn parse_function_and_exit() {
        assert_eq!(
            LocationSpec::parse("foo").unwrap(),
            LocationSpec::Function {
                name: "foo".into(),
                exit: false
            }
        );
        assert_eq!(
            LocationSpec::parse("~foo").unwrap(),
            LocationSpec::Function {
                name: "foo".into(),
                exit: true
            }
        );
    }

    #[test]
    fn parse_source_line() {
        assert_eq!(
            LocationSpec::parse("mpi_ringtopo2.cpp#97").unwrap(),
            LocationSpec::SourceLine {
                file: "mpi_ringtopo2.cpp".into(),
                line: 97
            }
        );
        assert!(LocationSpec::parse("main.c#abc").is_err());
    }

    #[test]
    fn parse_lib_symbol_and_pattern() {
        assert_eq!(
            LocationSpec::parse("libfoo!bar").unwrap(),
            LocationSpec::LibSymbol {
                lib: "libfoo".into(),
                symbol: "bar".into(),
                exit: false
            }
        );
        assert!(matches!(
            LocationSpec::parse("MPI_.*").unwrap(),
            LocationSpec::Pattern { .. }
        ));
        assert!(LocationSpec::parse("MPI_[").is_err());
        assert!(LocationSpec::parse("").is_err());
    }

    #[test]
    fn render_roundtrip() {
        for expr in ["foo", "~foo", "main.c#42", "libfoo!bar", "~libfoo!bar"] {
            assert_eq!(LocationSpec::parse(expr).unwrap().render(), expr);
        }
    }

    // -- Combinators ------------------------------------------------------------

    fn fired(event: &mut Event, path: &[u8], proc: ProcId) {
        assert!(event.note_fired(path, proc), "note_fired failed");
    }

    #[test]
    fn and_requires_all_children() {
        let mut event = Event::and(Event::within_ms(100), Event::signal(11));
        let procs: ProcSet = [1].into();
        event.enable(&procs);

        assert!(!event.satisfied(1));
        fired(&mut event, &[0], 1);
        assert!(!event.satisfied(1));
        fired(&mut event, &[1], 1);
        assert!(event.satisfied(1));
    }

    #[test]
    fn or_fires_on_any_child() {
        let mut event = Event::or(Event::signal(6), Event::signal(11));
        event.enable(&[1].into());
        fired(&mut event, &[1], 1);
        assert!(event.satisfied(1));
    }

    #[test]
    fn not_demonstrates_absence() {
        // Time::within(100) && !exit-location
        let mut event = Event::and(
            Event::within_ms(100),
            Event::not(Event::location("~foo").unwrap()),
        );
        event.enable(&[1, 2].into());

        // Timer fires for both; proc 2 also left foo.
        fired(&mut event, &[0], 1);
        fired(&mut event, &[0], 2);
        fired(&mut event, &[1, 0], 2);

        assert!(event.satisfied(1), "proc 1 still inside foo");
        assert!(!event.satisfied(2), "proc 2 left foo before the window");
    }

    #[test]
    fn disable_clears_fired_marks() {
        let mut event = Event::signal(9);
        event.enable(&[1].into());
        fired(&mut event, &[], 1);
        assert!(event.satisfied(1));
        event.disable(&[1].into());
        assert!(!event.satisfied(1));
        assert!(!event.note_fired(&[], 1), "disabled proc must not fire");
    }

    #[test]
    fn registrations_cover_leaves() {
        let event = Event::and(Event::within_ms(500), Event::signal(11));
        let regs = event.registrations(&[1].into());
        assert!(regs
            .iter()
            .any(|(_, r)| matches!(r, Registration::Timer { after_ms: 500 })));
        assert!(regs
            .iter()
            .any(|(_, r)| matches!(r, Registration::Signal(11))));
    }

    #[test]
    fn leaf_paths_resolve() {
        let event = Event::and(
            Event::within_ms(1),
            Event::not(Event::signal(2)),
        );
        let leaves = event.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].0, vec![0]);
        assert_eq!(leaves[1].0, vec![1, 0]);
        assert!(event.leaf_at(&[1, 0]).is_some());
        assert!(event.leaf_at(&[2]).is_none());
    }
}
