//! Debugger-engine interface consumed by the core.
//!
//! The engine that inserts breakpoints, reads target memory, and walks
//! stacks is an external collaborator. The core talks to it through
//! [`DebugEngine`]; back-end embedders implement the trait over their
//! process-control stack, and the tests drive the core with a scripted
//! mock.
//!
//! All operations may fail with [`EngineError`]; `Transient` failures are
//! probe-local, `Fatal` tears the session down.

use thiserror::Error;

use crate::event::LocationSpec;
use crate::value::{Value, ValueTag};

/// Target process identifier, unique within a back-end.
pub type ProcId = u32;

/// Target thread identifier.
pub type ThreadId = u64;

/// Failure classes for engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Symbol, variable, or process not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Retryable failure (target busy, ptrace race, ...).
    #[error("transient: {0}")]
    Transient(String),

    /// Unrecoverable engine failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Resolved storage of a target variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLocation {
    /// Address in the target's memory.
    pub address: u64,
    /// Type of the stored value.
    pub tag: ValueTag,
}

/// One frame of a walked stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name, empty when stripped.
    pub function: String,
}

/// Where a stopped thread currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    /// Innermost function name.
    pub function: String,
    /// Source file, empty when line info is absent.
    pub file: String,
    /// Source line, 0 when line info is absent.
    pub line: u32,
}

impl FrameInfo {
    /// `file:line` rendering used by `@location()`.
    #[must_use]
    pub fn location(&self) -> String {
        if self.file.is_empty() {
            self.function.clone()
        } else {
            format!("{}:{}", self.file, self.line)
        }
    }
}

/// The debugger-engine operations the core consumes.
pub trait DebugEngine {
    /// Locate a named variable in the scope of a stopped process.
    fn find_variable(&self, proc: ProcId, name: &str) -> Result<DataLocation, EngineError>;

    /// Read the value stored at a resolved location.
    fn read_at(&self, proc: ProcId, location: &DataLocation) -> Result<Value, EngineError>;

    /// Resolve a code-location expression to target addresses.
    fn resolve_location(
        &self,
        proc: ProcId,
        spec: &LocationSpec,
    ) -> Result<Vec<u64>, EngineError>;

    /// Insert a breakpoint; the embedder routes hits back through the
    /// session's `on_breakpoint` entry point.
    fn breakpoint_at(&mut self, proc: ProcId, address: u64) -> Result<(), EngineError>;

    /// Remove a previously inserted breakpoint.
    fn remove_breakpoint(&mut self, proc: ProcId, address: u64) -> Result<(), EngineError>;

    /// Walk the stack of a stopped thread, innermost frame first.
    fn stackwalk(&self, proc: ProcId, thread: ThreadId) -> Result<Vec<StackFrame>, EngineError>;

    /// Innermost frame with source info for a stopped thread.
    fn current_frame(&self, proc: ProcId, thread: ThreadId) -> Result<FrameInfo, EngineError>;

    /// Load a shared object into the target.
    fn load_library(&mut self, proc: ProcId, path: &str) -> Result<(), EngineError>;

    /// Inferior RPC: call a function in the target.
    fn call_function(
        &mut self,
        proc: ProcId,
        name: &str,
        args: &[u8],
    ) -> Result<(), EngineError>;

    /// Write raw bytes into target memory.
    fn write_mem(&mut self, proc: ProcId, address: u64, buf: &[u8]) -> Result<(), EngineError>;

    /// Dump a core file for the process.
    fn deposit_core(&mut self, proc: ProcId) -> Result<(), EngineError>;

    /// Deliver a signal to the process.
    fn send_signal(&mut self, proc: ProcId, signum: i32) -> Result<(), EngineError>;

    /// Detach from the process; it keeps running outside the session.
    fn detach(&mut self, proc: ProcId) -> Result<(), EngineError>;

    /// Resume a stopped process.
    fn continue_proc(&mut self, proc: ProcId) -> Result<(), EngineError>;

    /// Ask the external stat-trace sampler for stack samples across a
    /// process subset.
    fn request_stat_trace(
        &mut self,
        procs: &[ProcId],
        traces: u32,
        frequency_hz: u32,
        threads: bool,
    ) -> Result<(), EngineError>;
}

impl EngineError {
    /// Map an engine failure onto the core taxonomy.
    #[must_use]
    pub fn into_dysect(self) -> crate::error::DysectError {
        match self {
            Self::NotFound(msg) => crate::error::DysectError::ResolutionFailure(msg),
            Self::Transient(msg) => crate::error::DysectError::TargetTransient(msg),
            Self::Fatal(msg) => crate::error::DysectError::Fatal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_info_location_rendering() {
        let with_line = FrameInfo {
            function: "foo".into(),
            file: "main.c".into(),
            line: 42,
        };
        assert_eq!(with_line.location(), "main.c:42");

        let stripped = FrameInfo {
            function: "foo".into(),
            file: String::new(),
            line: 0,
        };
        assert_eq!(stripped.location(), "foo");
    }

    #[test]
    fn engine_errors_map_onto_taxonomy() {
        use crate::error::DysectError;
        assert!(matches!(
            EngineError::NotFound("x".into()).into_dysect(),
            DysectError::ResolutionFailure(_)
        ));
        assert!(matches!(
            EngineError::Transient("x".into()).into_dysect(),
            DysectError::TargetTransient(_)
        ));
        assert!(matches!(
            EngineError::Fatal("x".into()).into_dysect(),
            DysectError::Fatal(_)
        ));
    }
}
