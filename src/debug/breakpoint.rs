//! Software breakpoints and the keyed collection a session owns.
//!
//! A breakpoint is *enabled* exactly when the trap opcode is present at its
//! address in target memory. Separately it may be *armed*: an armed
//! breakpoint is installed whenever a session is live. Registering while no
//! session is attached captures the original byte but leaves memory alone
//! until the pump arms it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::core::memory::{MemoryError, MemoryExt, ProcessMemory};

use super::types::ThreadContext;

/// The INT3 opcode used for software breakpoints
pub const TRAP_OPCODE: u8 = 0xCC;

/// Called when a breakpoint is hit and its condition holds
pub type HitHandler = Box<dyn FnMut(&mut BreakpointHit) + Send>;

/// Decides whether a hit should reach the handler
pub type Condition = Box<dyn Fn(&BreakpointHit) -> bool + Send + Sync>;

/// Everything a hit handler may inspect or change
#[derive(Debug, Clone)]
pub struct BreakpointHit {
    pub address: u64,
    pub pid: u32,
    pub tid: u32,
    /// Register state of the faulting thread, instruction pointer already
    /// rolled back to `address`. Written back before the thread resumes.
    pub context: ThreadContext,
    disable_requested: bool,
}

impl BreakpointHit {
    pub fn new(address: u64, pid: u32, tid: u32, context: ThreadContext) -> Self {
        Self {
            address,
            pid,
            tid,
            context,
            disable_requested: false,
        }
    }

    /// Leave the original instruction in place and stop trapping here
    pub fn disable_breakpoint(&mut self) {
        self.disable_requested = true;
    }

    pub fn disable_requested(&self) -> bool {
        self.disable_requested
    }
}

/// Breakpoint cleanup failures collected across a whole pass
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} breakpoint(s) could not be restored", .0.len())]
pub struct CleanupFailures(pub Vec<(u64, MemoryError)>);

/// Software breakpoint
pub struct Breakpoint {
    address: u64,
    original_byte: u8,
    enabled: Mutex<bool>,
    armed: AtomicBool,
    condition: Option<Condition>,
    handler: Mutex<Option<HitHandler>>,
}

impl std::fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Breakpoint")
            .field("address", &format_args!("{:#x}", self.address))
            .field("original_byte", &format_args!("{:#04x}", self.original_byte))
            .field("enabled", &self.is_enabled())
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl Breakpoint {
    fn new(
        address: u64,
        original_byte: u8,
        handler: Option<HitHandler>,
        condition: Option<Condition>,
    ) -> Self {
        Self {
            address,
            original_byte,
            enabled: Mutex::new(false),
            armed: AtomicBool::new(true),
            condition,
            handler: Mutex::new(handler),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Instruction byte saved when the breakpoint was registered
    pub fn original_byte(&self) -> u8 {
        self.original_byte
    }

    /// Is the trap opcode currently written at the address?
    pub fn is_enabled(&self) -> bool {
        *lock(&self.enabled)
    }

    /// Should the trap be installed while a session is live?
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }

    /// Replace the hit handler. Must not be called from inside the handler itself.
    pub fn set_handler(&self, handler: impl FnMut(&mut BreakpointHit) + Send + 'static) {
        *lock(&self.handler) = Some(Box::new(handler));
    }

    /// Write the trap opcode. Returns whether a transition happened.
    pub(crate) fn enable(&self, memory: &dyn ProcessMemory) -> Result<bool, MemoryError> {
        let mut enabled = lock(&self.enabled);
        if *enabled {
            return Ok(false);
        }
        memory.write_u8(self.address, TRAP_OPCODE)?;
        *enabled = true;
        Ok(true)
    }

    /// Restore the original byte. Returns whether a transition happened.
    pub(crate) fn disable(&self, memory: &dyn ProcessMemory) -> Result<bool, MemoryError> {
        let mut enabled = lock(&self.enabled);
        if !*enabled {
            return Ok(false);
        }
        memory.write_u8(self.address, self.original_byte)?;
        *enabled = false;
        Ok(true)
    }

    /// Mark as not installed without touching memory (the target is gone)
    pub(crate) fn forget_installed(&self) {
        *lock(&self.enabled) = false;
    }

    pub(crate) fn condition_holds(&self, hit: &BreakpointHit) -> bool {
        self.condition.as_ref().map_or(true, |condition| condition(hit))
    }

    pub(crate) fn notify(&self, hit: &mut BreakpointHit) {
        if let Some(handler) = lock(&self.handler).as_mut() {
            handler(hit);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Registry {
    map: HashMap<u64, Arc<Breakpoint>>,
    live: bool,
}

/// All breakpoints owned by one session, keyed by address.
///
/// Cloning yields another handle to the same collection. Registration from
/// any thread is serialized with the pump through the internal lock.
#[derive(Clone)]
pub struct Breakpoints {
    registry: Arc<Mutex<Registry>>,
    memory: Arc<dyn ProcessMemory>,
}

impl Breakpoints {
    pub fn new(memory: Arc<dyn ProcessMemory>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                map: HashMap::new(),
                live: false,
            })),
            memory,
        }
    }

    /// Register a breakpoint that calls `handler` on every hit
    pub fn add(
        &self,
        address: u64,
        handler: impl FnMut(&mut BreakpointHit) + Send + 'static,
    ) -> Result<Arc<Breakpoint>, MemoryError> {
        self.insert(address, Some(Box::new(handler)), None)
    }

    /// Register a breakpoint whose handler only runs when `condition` holds
    pub fn add_with_condition(
        &self,
        address: u64,
        handler: impl FnMut(&mut BreakpointHit) + Send + 'static,
        condition: impl Fn(&BreakpointHit) -> bool + Send + Sync + 'static,
    ) -> Result<Arc<Breakpoint>, MemoryError> {
        self.insert(address, Some(Box::new(handler)), Some(Box::new(condition)))
    }

    fn insert(
        &self,
        address: u64,
        handler: Option<HitHandler>,
        condition: Option<Condition>,
    ) -> Result<Arc<Breakpoint>, MemoryError> {
        let mut registry = lock(&self.registry);
        self.insert_locked(&mut registry, address, handler, condition)
    }

    fn insert_locked(
        &self,
        registry: &mut Registry,
        address: u64,
        handler: Option<HitHandler>,
        condition: Option<Condition>,
    ) -> Result<Arc<Breakpoint>, MemoryError> {
        // Restore the old entry first so the byte saved below is never the trap.
        if let Some(existing) = registry.map.get(&address) {
            existing.disable(self.memory.as_ref())?;
            existing.set_armed(false);
            registry.map.remove(&address);
            log::debug!("Replacing breakpoint at {:#x}", address);
        }

        let original = self.memory.read_u8(address)?;
        let breakpoint = Arc::new(Breakpoint::new(address, original, handler, condition));
        if registry.live {
            breakpoint.enable(self.memory.as_ref())?;
        }
        registry.map.insert(address, Arc::clone(&breakpoint));

        log::debug!(
            "Breakpoint registered at {:#x} (original byte {:#04x}, live: {})",
            address,
            original,
            registry.live
        );
        Ok(breakpoint)
    }

    /// Existing breakpoint at `address`, or a new one without a handler
    pub fn get_or_create(&self, address: u64) -> Result<Arc<Breakpoint>, MemoryError> {
        let mut registry = lock(&self.registry);
        if let Some(existing) = registry.map.get(&address) {
            return Ok(Arc::clone(existing));
        }
        self.insert_locked(&mut registry, address, None, None)
    }

    pub fn get(&self, address: u64) -> Option<Arc<Breakpoint>> {
        lock(&self.registry).map.get(&address).cloned()
    }

    pub fn contains(&self, address: u64) -> bool {
        lock(&self.registry).map.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of `(address, breakpoint)` pairs, sorted by address
    pub fn entries(&self) -> Vec<(u64, Arc<Breakpoint>)> {
        let mut entries: Vec<_> = lock(&self.registry)
            .map
            .iter()
            .map(|(address, bp)| (*address, Arc::clone(bp)))
            .collect();
        entries.sort_by_key(|(address, _)| *address);
        entries
    }

    /// Restore the original byte and forget the breakpoint.
    ///
    /// On a failed restore the entry stays registered so it is not leaked
    /// into target memory untracked.
    pub fn remove(&self, address: u64) -> Result<bool, MemoryError> {
        let mut registry = lock(&self.registry);
        let Some(breakpoint) = registry.map.get(&address) else {
            return Ok(false);
        };
        breakpoint.disable(self.memory.as_ref())?;
        breakpoint.set_armed(false);
        registry.map.remove(&address);
        log::debug!("Breakpoint removed at {:#x}", address);
        Ok(true)
    }

    /// Remove every breakpoint, attempting each restore regardless of earlier failures
    pub fn clear(&self) -> Result<(), CleanupFailures> {
        let mut registry = lock(&self.registry);
        let mut failures = Vec::new();
        registry.map.retain(|address, breakpoint| {
            match breakpoint.disable(self.memory.as_ref()) {
                Ok(_) => {
                    breakpoint.set_armed(false);
                    false
                }
                Err(e) => {
                    failures.push((*address, e));
                    true
                }
            }
        });
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupFailures(failures))
        }
    }

    /// Install the trap at `address` and keep it armed for future sessions
    pub fn enable(&self, address: u64) -> Result<bool, MemoryError> {
        let registry = lock(&self.registry);
        match registry.map.get(&address) {
            Some(breakpoint) => {
                breakpoint.set_armed(true);
                breakpoint.enable(self.memory.as_ref())
            }
            None => Ok(false),
        }
    }

    /// Restore the original byte at `address` and stop arming it
    pub fn disable(&self, address: u64) -> Result<bool, MemoryError> {
        let registry = lock(&self.registry);
        match registry.map.get(&address) {
            Some(breakpoint) => {
                breakpoint.set_armed(false);
                breakpoint.disable(self.memory.as_ref())
            }
            None => Ok(false),
        }
    }

    /// Is `breakpoint` still the registered entry for its address?
    pub(crate) fn is_current(&self, breakpoint: &Arc<Breakpoint>) -> bool {
        lock(&self.registry)
            .map
            .get(&breakpoint.address())
            .is_some_and(|current| Arc::ptr_eq(current, breakpoint))
    }

    pub(crate) fn memory(&self) -> &dyn ProcessMemory {
        self.memory.as_ref()
    }

    /// Session went live: install every armed breakpoint
    pub(crate) fn arm_all(&self) -> Result<(), CleanupFailures> {
        let mut registry = lock(&self.registry);
        registry.live = true;
        let failures: Vec<_> = registry
            .map
            .iter()
            .filter(|(_, bp)| bp.is_armed())
            .filter_map(|(address, bp)| {
                bp.enable(self.memory.as_ref()).err().map(|e| (*address, e))
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupFailures(failures))
        }
    }

    /// Session is ending: restore every installed breakpoint, keeping registrations
    pub(crate) fn disarm_all(&self) -> Result<(), CleanupFailures> {
        let mut registry = lock(&self.registry);
        registry.live = false;
        let failures: Vec<_> = registry
            .map
            .iter()
            .filter_map(|(address, bp)| {
                bp.disable(self.memory.as_ref()).err().map(|e| (*address, e))
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupFailures(failures))
        }
    }

    /// The target exited: nothing is installed any more
    pub(crate) fn forget_installed(&self) {
        let mut registry = lock(&self.registry);
        registry.live = false;
        for breakpoint in registry.map.values() {
            breakpoint.forget_installed();
        }
    }
}
