//! Scripted debugger engine for tests.
//!
//! [`MockEngine`] implements [`DebugEngine`] over in-memory tables:
//! tests script variables, symbols, and stacks, then drive the session
//! entry points directly. Clones share state, so a test can hand one
//! clone to the session and keep another for scripting and assertions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::engine::{
    DataLocation, DebugEngine, EngineError, FrameInfo, ProcId, StackFrame, ThreadId,
};
use crate::event::LocationSpec;
use crate::value::Value;

#[derive(Default)]
struct MockState {
    next_addr: u64,
    /// (proc, lookup name) -> location
    vars: BTreeMap<(ProcId, String), DataLocation>,
    /// (proc, address) -> value
    memory: BTreeMap<(ProcId, u64), Value>,
    /// (proc, symbol key) -> addresses
    symbols: BTreeMap<(ProcId, String), Vec<u64>>,
    /// loaded shared objects, by path
    libraries: BTreeSet<String>,
    /// (proc, thread) -> stack, innermost frame first
    stacks: BTreeMap<(ProcId, ThreadId), Vec<String>>,
    /// (proc, thread) -> source info override
    frames: BTreeMap<(ProcId, ThreadId), FrameInfo>,
    breakpoints: BTreeSet<(ProcId, u64)>,
    detached: BTreeSet<ProcId>,
    continued: Vec<ProcId>,
    commands: Vec<String>,
    read_counts: BTreeMap<(ProcId, String), u32>,
}

/// In-memory scripted engine.
#[derive(Default, Clone)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    /// Empty engine; nothing resolves until scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a variable readable at `proc`.
    pub fn set_variable(&self, proc: ProcId, name: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        state.next_addr += 8;
        let address = 0x1000 + state.next_addr;
        let location = DataLocation {
            address,
            tag: value.tag(),
        };
        state.vars.insert((proc, name.to_string()), location);
        state.memory.insert((proc, address), value);
    }

    /// Define a resolvable symbol. Exit locations are scripted with a
    /// `~` prefix on the key, matching the script syntax.
    pub fn set_symbol(&self, proc: ProcId, key: &str, address: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .symbols
            .entry((proc, key.to_string()))
            .or_default()
            .push(address);
    }

    /// Mark a shared object as loaded.
    pub fn mark_library_loaded(&self, path: &str) {
        self.state.lock().unwrap().libraries.insert(path.to_string());
    }

    /// Script the stack of a stopped thread, innermost frame first.
    pub fn set_stack(&self, proc: ProcId, thread: ThreadId, frames: &[&str]) {
        self.state.lock().unwrap().stacks.insert(
            (proc, thread),
            frames.iter().map(|&f| f.to_string()).collect(),
        );
    }

    /// Script the source position of a stopped thread.
    pub fn set_frame(&self, proc: ProcId, thread: ThreadId, function: &str, file: &str, line: u32) {
        self.state.lock().unwrap().frames.insert(
            (proc, thread),
            FrameInfo {
                function: function.to_string(),
                file: file.to_string(),
                line,
            },
        );
    }

    /// Number of breakpoints currently inserted for `proc`.
    #[must_use]
    pub fn breakpoint_count(&self, proc: ProcId) -> usize {
        self.state
            .lock()
            .unwrap()
            .breakpoints
            .iter()
            .filter(|&&(p, _)| p == proc)
            .count()
    }

    /// Processes the engine was told to continue, in order.
    #[must_use]
    pub fn continued(&self) -> Vec<ProcId> {
        self.state.lock().unwrap().continued.clone()
    }

    /// True once `detach` ran for the process.
    #[must_use]
    pub fn is_detached(&self, proc: ProcId) -> bool {
        self.state.lock().unwrap().detached.contains(&proc)
    }

    /// Commands the engine received (deposit_core, signal, ...).
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Forget variable read counters.
    pub fn reset_read_counts(&self) {
        self.state.lock().unwrap().read_counts.clear();
    }

    /// How many times a variable was looked up.
    #[must_use]
    pub fn read_count(&self, proc: ProcId, name: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .read_counts
            .get(&(proc, name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn symbol_key(spec: &LocationSpec) -> Option<String> {
        match spec {
            LocationSpec::Function { name, exit } => {
                Some(if *exit { format!("~{name}") } else { name.clone() })
            }
            LocationSpec::SourceLine { file, line } => Some(format!("{file}#{line}")),
            LocationSpec::LibSymbol { lib, symbol, exit } => Some(if *exit {
                format!("~{lib}!{symbol}")
            } else {
                format!("{lib}!{symbol}")
            }),
            LocationSpec::Pattern { .. } => None,
        }
    }
}

impl DebugEngine for MockEngine {
    fn find_variable(&self, proc: ProcId, name: &str) -> Result<DataLocation, EngineError> {
        let mut state = self.state.lock().unwrap();
        *state
            .read_counts
            .entry((proc, name.to_string()))
            .or_insert(0) += 1;
        state
            .vars
            .get(&(proc, name.to_string()))
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("variable '{name}'")))
    }

    fn read_at(&self, proc: ProcId, location: &DataLocation) -> Result<Value, EngineError> {
        self.state
            .lock()
            .unwrap()
            .memory
            .get(&(proc, location.address))
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("address {:#x}", location.address)))
    }

    fn resolve_location(
        &self,
        proc: ProcId,
        spec: &LocationSpec,
    ) -> Result<Vec<u64>, EngineError> {
        let state = self.state.lock().unwrap();

        if let Some(lib) = spec.library() {
            let loaded = state.libraries.iter().any(|l| l.contains(lib));
            if !loaded {
                return Err(EngineError::NotFound(format!("library '{lib}' not loaded")));
            }
        }

        match Self::symbol_key(spec) {
            Some(key) => Ok(state
                .symbols
                .get(&(proc, key))
                .cloned()
                .unwrap_or_default()),
            None => {
                let LocationSpec::Pattern { pattern, exit } = spec else {
                    unreachable!("non-pattern spec without key");
                };
                let re = regex::Regex::new(pattern)
                    .map_err(|e| EngineError::NotFound(format!("bad pattern: {e}")))?;
                let mut out = Vec::new();
                for ((p, key), addrs) in &state.symbols {
                    if *p != proc {
                        continue;
                    }
                    let (key_exit, name) = match key.strip_prefix('~') {
                        Some(rest) => (true, rest),
                        None => (false, key.as_str()),
                    };
                    if key_exit == *exit && re.is_match(name) {
                        out.extend_from_slice(addrs);
                    }
                }
                Ok(out)
            }
        }
    }

    fn breakpoint_at(&mut self, proc: ProcId, address: u64) -> Result<(), EngineError> {
        self.state.lock().unwrap().breakpoints.insert((proc, address));
        Ok(())
    }

    fn remove_breakpoint(&mut self, proc: ProcId, address: u64) -> Result<(), EngineError> {
        self.state.lock().unwrap().breakpoints.remove(&(proc, address));
        Ok(())
    }

    fn stackwalk(
        &self,
        proc: ProcId,
        thread: ThreadId,
    ) -> Result<Vec<StackFrame>, EngineError> {
        let state = self.state.lock().unwrap();
        let frames = state
            .stacks
            .get(&(proc, thread))
            .ok_or_else(|| EngineError::NotFound(format!("no stack for proc {proc}")))?;
        Ok(frames
            .iter()
            .map(|f| StackFrame {
                function: f.clone(),
            })
            .collect())
    }

    fn current_frame(&self, proc: ProcId, thread: ThreadId) -> Result<FrameInfo, EngineError> {
        let state = self.state.lock().unwrap();
        if let Some(frame) = state.frames.get(&(proc, thread)) {
            return Ok(frame.clone());
        }
        state
            .stacks
            .get(&(proc, thread))
            .and_then(|frames| frames.first())
            .map(|innermost| FrameInfo {
                function: innermost.clone(),
                file: String::new(),
                line: 0,
            })
            .ok_or_else(|| EngineError::NotFound(format!("no frame for proc {proc}")))
    }

    fn load_library(&mut self, proc: ProcId, path: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.libraries.insert(path.to_string());
        state.commands.push(format!("load_library({proc}, {path})"));
        Ok(())
    }

    fn call_function(
        &mut self,
        proc: ProcId,
        name: &str,
        args: &[u8],
    ) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .commands
            .push(format!("call_function({proc}, {name}, {} bytes)", args.len()));
        Ok(())
    }

    fn write_mem(&mut self, proc: ProcId, address: u64, buf: &[u8]) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .commands
            .push(format!("write_mem({proc}, {address:#x}, {} bytes)", buf.len()));
        Ok(())
    }

    fn deposit_core(&mut self, proc: ProcId) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .commands
            .push(format!("deposit_core({proc})"));
        Ok(())
    }

    fn send_signal(&mut self, proc: ProcId, signum: i32) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .commands
            .push(format!("send_signal({proc}, {signum})"));
        Ok(())
    }

    fn detach(&mut self, proc: ProcId) -> Result<(), EngineError> {
        self.state.lock().unwrap().detached.insert(proc);
        Ok(())
    }

    fn continue_proc(&mut self, proc: ProcId) -> Result<(), EngineError> {
        self.state.lock().unwrap().continued.push(proc);
        Ok(())
    }

    fn request_stat_trace(
        &mut self,
        procs: &[ProcId],
        traces: u32,
        frequency_hz: u32,
        threads: bool,
    ) -> Result<(), EngineError> {
        self.state.lock().unwrap().commands.push(format!(
            "stat_trace({procs:?}, traces={traces}, hz={frequency_hz}, threads={threads})"
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variables_resolve_after_scripting() {
        let engine = MockEngine::new();
        assert!(engine.find_variable(1, "x").is_err());
        engine.set_variable(1, "x", Value::Int(7));
        let loc = engine.find_variable(1, "x").unwrap();
        assert_eq!(engine.read_at(1, &loc).unwrap(), Value::Int(7));
        assert_eq!(engine.read_count(1, "x"), 2);
    }

    #[test]
    fn pattern_resolution_matches_scripted_symbols() {
        let engine = MockEngine::new();
        engine.set_symbol(1, "MPI_Send", 0x100);
        engine.set_symbol(1, "MPI_Recv", 0x200);
        engine.set_symbol(1, "main", 0x300);
        let spec = LocationSpec::parse("MPI_.*").unwrap();
        let mut addrs = engine.resolve_location(1, &spec).unwrap();
        addrs.sort_unstable();
        assert_eq!(addrs, vec![0x100, 0x200]);
    }

    #[test]
    fn library_symbols_need_the_library() {
        let engine = MockEngine::new();
        engine.set_symbol(1, "libfoo!bar", 0x500);
        let spec = LocationSpec::parse("libfoo!bar").unwrap();
        assert!(engine.resolve_location(1, &spec).is_err());
        engine.mark_library_loaded("libfoo.so");
        assert_eq!(engine.resolve_location(1, &spec).unwrap(), vec![0x500]);
    }
}
