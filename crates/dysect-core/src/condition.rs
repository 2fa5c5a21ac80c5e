//! Probe conditions.
//!
//! A condition is an expression tree evaluated against the stopped
//! process when the probe's event fires. The result is tri-state plus a
//! collective hook: `CollectiveResolvable` marks conditions that would
//! need a front-end aggregation round before resolving locally. The
//! collective variants are declared for forward compatibility and never
//! produced by local evaluation.

use serde::{Deserialize, Serialize};

use crate::engine::{DebugEngine, ProcId, ThreadId};
use crate::error::Result;
use crate::expr::{EvalOutcome, ExprTree, NodeType};

/// Outcome of condition evaluation at a stopped process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionResult {
    /// A referenced variable could not be read.
    Unresolved,
    /// Resolved without a boolean interpretation.
    Resolved,
    ResolvedTrue,
    ResolvedFalse,
    /// Needs a front-end aggregation step (future hook).
    CollectiveResolvable,
    CollectiveResolvedTrue,
    CollectiveResolvedFalse,
}

impl ConditionResult {
    /// True when evaluation settled locally.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(
            self,
            Self::Resolved | Self::ResolvedTrue | Self::ResolvedFalse
        )
    }
}

/// An expression condition attached to a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    tree: ExprTree,
}

impl Condition {
    /// Parse an expression condition, e.g. `"rank == 3 && size > 1"`.
    pub fn parse(expr: &str) -> Result<Self> {
        Ok(Self {
            tree: ExprTree::parse(expr)?,
        })
    }

    /// Cached leaf classification of the underlying expression.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        self.tree.node_type()
    }

    /// Source text.
    #[must_use]
    pub fn source(&self) -> &str {
        self.tree.source()
    }

    /// Evaluate at a stopped thread.
    pub fn evaluate(
        &self,
        engine: &dyn DebugEngine,
        proc: ProcId,
        thread: ThreadId,
    ) -> Result<ConditionResult> {
        Ok(match self.tree.evaluate(engine, proc, thread)? {
            EvalOutcome::Unresolved => ConditionResult::Unresolved,
            EvalOutcome::Val(value) => match value.as_long() {
                Some(0) => ConditionResult::ResolvedFalse,
                Some(_) => ConditionResult::ResolvedTrue,
                None => match value.as_double() {
                    Some(d) if d == 0.0 => ConditionResult::ResolvedFalse,
                    Some(_) => ConditionResult::ResolvedTrue,
                    None => ConditionResult::Resolved,
                },
            },
        })
    }
}

/// Policy for an unresolved condition at trigger time: code-location
/// triggers proceed (the stopped location itself is the signal), data
/// conditions on async or time triggers skip the process.
#[must_use]
pub const fn proceed_on_unresolved(triggered_by_location: bool) -> bool {
    triggered_by_location
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockEngine;
    use crate::value::Value;

    #[test]
    fn resolves_true_and_false() {
        let engine = MockEngine::new();
        engine.set_variable(1, "rank", Value::Int(3));
        let cond = Condition::parse("rank == 3").unwrap();
        assert_eq!(
            cond.evaluate(&engine, 1, 1).unwrap(),
            ConditionResult::ResolvedTrue
        );
        let cond = Condition::parse("rank > 7").unwrap();
        assert_eq!(
            cond.evaluate(&engine, 1, 1).unwrap(),
            ConditionResult::ResolvedFalse
        );
    }

    #[test]
    fn exposes_source_and_classification() {
        let cond = Condition::parse("rank > 3").unwrap();
        assert_eq!(cond.source(), "rank > 3");
        assert_eq!(cond.node_type(), crate::expr::NodeType::Target);
    }

    #[test]
    fn missing_variable_is_unresolved() {
        let engine = MockEngine::new();
        let cond = Condition::parse("ghost == 1").unwrap();
        assert_eq!(
            cond.evaluate(&engine, 1, 1).unwrap(),
            ConditionResult::Unresolved
        );
    }

    #[test]
    fn unresolved_policy_depends_on_trigger() {
        assert!(proceed_on_unresolved(true));
        assert!(!proceed_on_unresolved(false));
    }
}
