//! Scripted in-memory target for exercising the pump without an OS debugger.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::debugger::DebugError;
use crate::core::memory::{MemoryError, PointerWidth, ProcessMemory};
use crate::core::remote::{LocalExport, RemoteHost};

use super::types::{
    ContinueStatus, DebugEvent, DebugEventKind, ExceptionCode, ModuleInfo, RemoteThreadExit,
    ThreadContext,
};
use super::Target;

const ALLOCATION_BASE: u64 = 0x1000_0000;

#[derive(Default)]
struct State {
    memory: HashMap<u64, u8>,
    writes: Vec<(u64, Vec<u8>)>,
    fail_writes: bool,
    pointer_width: PointerWidth,
    events: VecDeque<DebugEvent>,
    continued: Vec<(DebugEvent, ContinueStatus)>,
    contexts: HashMap<u32, ThreadContext>,
    context_failures: HashSet<u32>,
    threads: Vec<u32>,
    suspended: HashMap<u32, i32>,
    modules: Vec<ModuleInfo>,
    being_debugged: bool,
    begin_error: Option<DebugError>,
    debugging: bool,
    stopped: bool,
    exited: bool,
    next_allocation: u64,
    fail_allocations: bool,
    freed: Vec<u64>,
    loader: Option<u64>,
    exports: HashMap<String, LocalExport>,
    thread_results: VecDeque<RemoteThreadExit>,
    remote_calls: Vec<(u64, u64)>,
}

pub(crate) struct MockTarget {
    pid: u32,
    state: Mutex<State>,
}

impl MockTarget {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            state: Mutex::new(State {
                next_allocation: ALLOCATION_BASE,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Make `bytes` readable and writable at `address`
    pub fn map(&self, address: u64, bytes: &[u8]) {
        let mut state = self.state();
        for (i, byte) in bytes.iter().enumerate() {
            state.memory.insert(address + i as u64, *byte);
        }
    }

    pub fn byte(&self, address: u64) -> u8 {
        self.state().memory[&address]
    }

    /// Number of writes that touched `address`
    pub fn writes_at(&self, address: u64) -> usize {
        self.state()
            .writes
            .iter()
            .filter(|(start, data)| (*start..*start + data.len() as u64).contains(&address))
            .count()
    }

    /// Make every memory write fail until switched off
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Report 4-byte pointers, as a 32-bit target would
    pub fn use_32bit_pointers(&self) {
        self.state().pointer_width = PointerWidth::Bits32;
    }

    pub fn add_thread(&self, tid: u32) {
        let mut state = self.state();
        state.threads.push(tid);
        state.contexts.entry(tid).or_default();
    }

    pub fn add_module(&self, module: ModuleInfo) {
        self.state().modules.push(module);
    }

    pub fn context(&self, tid: u32) -> ThreadContext {
        self.state().contexts.get(&tid).cloned().unwrap_or_default()
    }

    pub fn fail_context_for(&self, tid: u32) {
        self.state().context_failures.insert(tid);
    }

    pub fn set_being_debugged(&self) {
        self.state().being_debugged = true;
    }

    pub fn fail_begin(&self, error: DebugError) {
        self.state().begin_error = Some(error);
    }

    pub fn push_event(&self, event: DebugEvent) {
        self.state().events.push_back(event);
    }

    /// Emulate thread `tid` executing the trap at `address`
    pub fn hit(&self, tid: u32, address: u64) {
        let mut state = self.state();
        state.contexts.entry(tid).or_default().rip = address + 1;
        state.events.push_back(DebugEvent::new(
            self.pid,
            tid,
            DebugEventKind::Exception {
                code: ExceptionCode::Breakpoint,
                address,
                first_chance: true,
            },
        ));
    }

    /// Emulate the trap flag firing on `tid` after one instruction
    pub fn step(&self, tid: u32) {
        let mut state = self.state();
        let context = state.contexts.entry(tid).or_default();
        context.clear_trap_flag();
        context.rip += 1;
        let address = context.rip;
        state.events.push_back(DebugEvent::new(
            self.pid,
            tid,
            DebugEventKind::Exception {
                code: ExceptionCode::SingleStep,
                address,
                first_chance: true,
            },
        ));
    }

    pub fn exit(&self, exit_code: u32) {
        let mut state = self.state();
        state.exited = true;
        state
            .events
            .push_back(DebugEvent::new(self.pid, 1, DebugEventKind::ProcessExited { exit_code }));
    }

    pub fn continued(&self) -> Vec<(DebugEvent, ContinueStatus)> {
        self.state().continued.clone()
    }

    pub fn continued_count(&self) -> usize {
        self.state().continued.len()
    }

    pub fn suspend_depth(&self, tid: u32) -> i32 {
        self.state().suspended.get(&tid).copied().unwrap_or(0)
    }

    pub fn is_debugging(&self) -> bool {
        self.state().debugging
    }

    pub fn was_stopped(&self) -> bool {
        self.state().stopped
    }

    pub fn set_loader(&self, address: u64) {
        self.state().loader = Some(address);
    }

    pub fn set_local_export(&self, function: &str, export: LocalExport) {
        self.state().exports.insert(function.to_string(), export);
    }

    pub fn push_thread_result(&self, result: RemoteThreadExit) {
        self.state().thread_results.push_back(result);
    }

    pub fn fail_allocations(&self) {
        self.state().fail_allocations = true;
    }

    pub fn freed(&self) -> Vec<u64> {
        self.state().freed.clone()
    }

    pub fn remote_calls(&self) -> Vec<(u64, u64)> {
        self.state().remote_calls.clone()
    }
}

impl ProcessMemory for MockTarget {
    fn read_raw(&self, address: u64, buffer: &mut [u8]) -> Result<(), MemoryError> {
        let state = self.state();
        for (i, slot) in buffer.iter_mut().enumerate() {
            let at = address + i as u64;
            *slot = *state.memory.get(&at).ok_or(MemoryError::ReadFailed {
                address: at,
                reason: "unmapped".into(),
            })?;
        }
        Ok(())
    }

    fn write_raw(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(MemoryError::WriteFailed {
                address,
                reason: "page is read-only".into(),
            });
        }
        for i in 0..data.len() as u64 {
            if !state.memory.contains_key(&(address + i)) {
                return Err(MemoryError::WriteFailed {
                    address: address + i,
                    reason: "unmapped".into(),
                });
            }
        }
        for (i, byte) in data.iter().enumerate() {
            state.memory.insert(address + i as u64, *byte);
        }
        state.writes.push((address, data.to_vec()));
        Ok(())
    }

    fn pointer_width(&self) -> PointerWidth {
        self.state().pointer_width
    }
}

impl Target for MockTarget {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, DebugError> {
        Ok(self.state().modules.clone())
    }

    fn threads(&self) -> Result<Vec<u32>, DebugError> {
        Ok(self.state().threads.clone())
    }

    fn has_exited(&self) -> bool {
        self.state().exited
    }

    fn is_being_debugged(&self) -> Result<bool, DebugError> {
        Ok(self.state().being_debugged)
    }

    fn begin_debugging(&self, _kill_on_exit: bool) -> Result<(), DebugError> {
        let mut state = self.state();
        if let Some(error) = state.begin_error.clone() {
            return Err(error);
        }
        state.debugging = true;
        state.being_debugged = true;
        Ok(())
    }

    fn wait_event(&self, timeout: Duration) -> Result<Option<DebugEvent>, DebugError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.state().events.pop_front() {
                return Ok(Some(event));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn continue_event(&self, event: &DebugEvent, status: ContinueStatus) -> Result<(), DebugError> {
        self.state().continued.push((event.clone(), status));
        Ok(())
    }

    fn stop_debugging(&self) -> Result<(), DebugError> {
        let mut state = self.state();
        state.debugging = false;
        state.being_debugged = false;
        state.stopped = true;
        Ok(())
    }

    fn suspend_thread(&self, tid: u32) -> Result<(), DebugError> {
        *self.state().suspended.entry(tid).or_default() += 1;
        Ok(())
    }

    fn resume_thread(&self, tid: u32) -> Result<(), DebugError> {
        *self.state().suspended.entry(tid).or_default() -= 1;
        Ok(())
    }

    fn get_context(&self, tid: u32) -> Result<ThreadContext, DebugError> {
        let state = self.state();
        if state.context_failures.contains(&tid) {
            return Err(DebugError::ThreadContext {
                tid,
                reason: "access denied".into(),
            });
        }
        Ok(state.contexts.get(&tid).cloned().unwrap_or_default())
    }

    fn set_context(&self, tid: u32, context: &ThreadContext) -> Result<(), DebugError> {
        let mut state = self.state();
        if state.context_failures.contains(&tid) {
            return Err(DebugError::ThreadContext {
                tid,
                reason: "access denied".into(),
            });
        }
        state.contexts.insert(tid, context.clone());
        Ok(())
    }
}

impl RemoteHost for MockTarget {
    fn allocate(&self, size: usize, _hint: Option<u64>) -> Option<u64> {
        let mut state = self.state();
        if state.fail_allocations || size == 0 {
            return None;
        }
        let address = state.next_allocation;
        state.next_allocation += (size as u64 + 0xfff) & !0xfff;
        for i in 0..size as u64 {
            state.memory.insert(address + i, 0);
        }
        Some(address)
    }

    fn free(&self, address: u64) -> bool {
        self.state().freed.push(address);
        true
    }

    fn create_remote_thread(
        &self,
        entry: u64,
        parameter: u64,
        _timeout: Duration,
    ) -> Result<RemoteThreadExit, DebugError> {
        let mut state = self.state();
        state.remote_calls.push((entry, parameter));
        Ok(state
            .thread_results
            .pop_front()
            .unwrap_or(RemoteThreadExit::Finished(0)))
    }

    fn library_loader(&self) -> Result<u64, DebugError> {
        self.state()
            .loader
            .ok_or(DebugError::Unsupported("no library loader"))
    }

    fn local_export(&self, _library: &str, function: &str) -> Result<LocalExport, DebugError> {
        self.state()
            .exports
            .get(function)
            .copied()
            .ok_or_else(|| DebugError::ExportNotFound {
                name: function.to_string(),
            })
    }
}

/// Poll `condition` until it holds or two seconds pass
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
