//! Common types for debugging functionality.

/// Information about a running process
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: u32,
    /// Process name (executable name)
    pub name: String,
}

/// A loaded executable image in the target's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module file name, e.g. `kernel32.dll`
    pub name: String,
    /// Full path on disk, when known
    pub path: Option<String>,
    /// Base address the image is mapped at
    pub base_address: u64,
    /// Size of the mapped image in bytes
    pub size: u64,
}

impl ModuleInfo {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address - self.base_address < self.size
    }
}

/// Exception classification for [`DebugEventKind::Exception`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// A trap opcode was executed
    Breakpoint,
    /// The trap flag fired after one instruction
    SingleStep,
    /// Anything else, carrying the raw OS code (NTSTATUS or signal number)
    Other(u32),
}

/// Discriminated debug event payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEventKind {
    /// Process created/attached
    ProcessCreated { base_address: u64 },
    /// Thread created
    ThreadCreated,
    /// DLL / shared object loaded
    ModuleLoaded { base_address: u64 },
    /// DLL / shared object unloaded
    ModuleUnloaded { base_address: u64 },
    /// Exception occurred
    Exception {
        code: ExceptionCode,
        address: u64,
        first_chance: bool,
    },
    /// Thread exited
    ThreadExited { exit_code: u32 },
    /// Process exited
    ProcessExited { exit_code: u32 },
    /// Events the pump does not model (debug strings, RIP events)
    Other { code: u32 },
}

/// Debug event received from the OS debugging facility
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    pub pid: u32,
    pub tid: u32,
    pub kind: DebugEventKind,
}

impl DebugEvent {
    pub fn new(pid: u32, tid: u32, kind: DebugEventKind) -> Self {
        Self { pid, tid, kind }
    }
}

/// How the OS should resume the thread that reported an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueStatus {
    /// The event was handled; resume normally
    Continue,
    /// Hand the exception back to the target's own handlers
    ExceptionNotHandled,
}

/// Debug session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Detached,
    Attaching,
    Attached,
    Detaching,
}

/// Single-step flag in EFLAGS/RFLAGS
pub const TRAP_FLAG: u64 = 0x100;

/// CPU register state (x86 family).
///
/// 32-bit targets use the low halves (`rax` holds EAX, `rip` holds EIP).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl ThreadContext {
    pub fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    pub fn set_instruction_pointer(&mut self, address: u64) {
        self.rip = address;
    }

    pub fn trap_flag(&self) -> bool {
        self.rflags & TRAP_FLAG != 0
    }

    pub fn set_trap_flag(&mut self) {
        self.rflags |= TRAP_FLAG;
    }

    pub fn clear_trap_flag(&mut self) {
        self.rflags &= !TRAP_FLAG;
    }
}

/// Result of waiting on a thread created in the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteThreadExit {
    /// The thread returned with this exit code
    Finished(u32),
    /// The wait timed out; the thread may still be running
    StillRunning,
}

/// Observable session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Attached {
        pid: u32,
    },
    /// Breakpoints were restored and the debug port released.
    /// `failures` lists cleanup steps that did not succeed.
    Detached {
        pid: u32,
        failures: Vec<String>,
    },
    ProcessExited {
        pid: u32,
        exit_code: u32,
    },
    /// One event's special handling was abandoned; the pump kept running
    DispatchFailed {
        pid: u32,
        tid: u32,
        address: Option<u64>,
        error: String,
    },
}
