//! Symbolic references to target variables.
//!
//! A [`DataRef`] names a variable to read at a stopped process. Reads
//! never fail hard on missing data: optimized-out or absent variables
//! yield [`ReadOutcome::Unresolved`], and the caller decides whether the
//! probe proceeds.
//!
//! Reference syntax (from probe scripts):
//!
//! - `rank` — variable in the innermost scope
//! - `frame:rank` — variable in the named function's frame
//! - `msg.header.len` — field path into a struct
//! - `*ptr` — dereference before reading

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::engine::{DebugEngine, EngineError, ProcId, ThreadId};
use crate::error::Result;
use crate::value::Value;

/// Scope qualifier for a variable lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarScope {
    /// Innermost frame of the stopped thread.
    Innermost,
    /// A specific function's frame somewhere on the stack.
    Frame(String),
}

/// Outcome of reading a target variable.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// The variable was found and its value read.
    Resolved(Value),
    /// Optimized out, absent, or not yet materialized. Never fatal.
    Unresolved,
}

/// A symbolic name plus resolution metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    /// Base variable name.
    pub name: String,
    /// Frame scope to search.
    pub scope: VarScope,
    /// Struct field path below the base variable.
    pub field_path: Vec<String>,
    /// Dereference the (pointer) value before reading.
    pub deref: bool,
}

impl DataRef {
    /// Reference to `name` in the innermost scope.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: VarScope::Innermost,
            field_path: Vec::new(),
            deref: false,
        }
    }

    /// Parse probe-script reference syntax.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        let mut rest = spec.trim();

        let deref = rest.starts_with('*');
        if deref {
            rest = &rest[1..];
        }

        let (scope, rest) = match rest.split_once(':') {
            Some((frame, tail)) if !frame.is_empty() => {
                (VarScope::Frame(frame.to_string()), tail)
            }
            _ => (VarScope::Innermost, rest),
        };

        let mut segments = rest.split('.').map(str::to_string);
        let name = segments.next().unwrap_or_default();
        let field_path: Vec<String> = segments.collect();

        Self {
            name,
            scope,
            field_path,
            deref,
        }
    }

    /// The full lookup name handed to the engine (`base.field.sub`).
    #[must_use]
    pub fn lookup_name(&self) -> String {
        if self.field_path.is_empty() {
            self.name.clone()
        } else {
            let mut out = self.name.clone();
            for field in &self.field_path {
                out.push('.');
                out.push_str(field);
            }
            out
        }
    }

    /// Read the referenced value at a stopped thread.
    ///
    /// `NotFound` from the engine becomes `Unresolved`; transient and
    /// fatal failures propagate.
    pub fn read(
        &self,
        engine: &dyn DebugEngine,
        proc: ProcId,
        _thread: ThreadId,
    ) -> Result<ReadOutcome> {
        let lookup = self.lookup_name();

        let location = match engine.find_variable(proc, &lookup) {
            Ok(location) => location,
            Err(EngineError::NotFound(reason)) => {
                debug!(proc, var = %lookup, %reason, "variable unresolved");
                return Ok(ReadOutcome::Unresolved);
            }
            Err(other) => return Err(other.into_dysect()),
        };

        let value = match engine.read_at(proc, &location) {
            Ok(value) => value,
            Err(EngineError::NotFound(reason)) => {
                debug!(proc, var = %lookup, %reason, "value unresolved");
                return Ok(ReadOutcome::Unresolved);
            }
            Err(other) => return Err(other.into_dysect()),
        };

        let value = if self.deref {
            match value {
                Value::Pointer(address) => {
                    let target = crate::engine::DataLocation {
                        address,
                        tag: crate::value::ValueTag::Long,
                    };
                    match engine.read_at(proc, &target) {
                        Ok(v) => v,
                        Err(EngineError::NotFound(_)) => return Ok(ReadOutcome::Unresolved),
                        Err(other) => return Err(other.into_dysect()),
                    }
                }
                // Deref of a non-pointer never resolves.
                _ => return Ok(ReadOutcome::Unresolved),
            }
        } else {
            value
        };

        trace!(proc, var = %lookup, value = %value, "read target variable");
        Ok(ReadOutcome::Resolved(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_name() {
        let r = DataRef::parse("rank");
        assert_eq!(r.name, "rank");
        assert_eq!(r.scope, VarScope::Innermost);
        assert!(r.field_path.is_empty());
        assert!(!r.deref);
        assert_eq!(r, DataRef::new("rank"));
    }

    #[test]
    fn parse_frame_qualified() {
        let r = DataRef::parse("do_SendOrStall:rank");
        assert_eq!(r.scope, VarScope::Frame("do_SendOrStall".into()));
        assert_eq!(r.name, "rank");
    }

    #[test]
    fn parse_field_path_and_deref() {
        let r = DataRef::parse("*msg.header.len");
        assert!(r.deref);
        assert_eq!(r.name, "msg");
        assert_eq!(r.field_path, vec!["header".to_string(), "len".to_string()]);
        assert_eq!(r.lookup_name(), "msg.header.len");
    }
}
