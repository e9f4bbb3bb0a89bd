//! Windows backend using the Win32 Debug API.

mod process;
mod remote;

pub use process::{enumerate_processes, find_process_by_name};

use std::ffi::c_void;
use std::time::Duration;

use windows::Win32::Foundation::{CloseHandle, BOOL, ERROR_SEM_TIMEOUT, HANDLE, NTSTATUS};
use windows::Win32::System::Diagnostics::Debug::{
    CheckRemoteDebuggerPresent, ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop,
    DebugSetProcessKillOnExit, FlushInstructionCache, GetThreadContext, ReadProcessMemory,
    SetThreadContext, WaitForDebugEvent, Wow64GetThreadContext, Wow64SetThreadContext,
    WriteProcessMemory, CONTEXT, CONTEXT_FULL_AMD64, CREATE_PROCESS_DEBUG_EVENT,
    CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT,
    EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT, UNLOAD_DLL_DEBUG_EVENT, WOW64_CONTEXT,
    WOW64_CONTEXT_FULL,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Thread32First, Thread32Next,
    MODULEENTRY32W, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, IsWow64Process, OpenProcess, OpenThread, ResumeThread, SuspendThread,
    PROCESS_ALL_ACCESS, THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT,
    THREAD_SUSPEND_RESUME,
};

use crate::core::debugger::DebugError;
use crate::core::memory::{MemoryError, PointerWidth, ProcessMemory};

use super::types::{
    ContinueStatus, DebugEvent, DebugEventKind, ExceptionCode, ModuleInfo, ThreadContext,
};
use super::Target;

const DBG_CONTINUE: NTSTATUS = NTSTATUS(0x00010002);
const DBG_EXCEPTION_NOT_HANDLED: NTSTATUS = NTSTATUS(0x80010001u32 as i32);
const EXCEPTION_BREAKPOINT_CODE: u32 = 0x80000003;
const EXCEPTION_SINGLE_STEP_CODE: u32 = 0x80000004;
/// Raised by 32-bit code running under WOW64
const STATUS_WX86_BREAKPOINT: u32 = 0x4000001F;
const STATUS_WX86_SINGLE_STEP: u32 = 0x4000001E;
const STILL_ACTIVE: u32 = 259;

/// Kernel handle closed exactly once, on drop
pub(crate) struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub(crate) fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// A process opened with full access
pub struct WindowsProcess {
    pid: u32,
    handle: OwnedHandle,
    wow64: bool,
}

impl WindowsProcess {
    /// Open a process by PID
    pub fn open(pid: u32) -> Result<Self, DebugError> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid) }.map_err(|e| {
            DebugError::ProcessNotFound {
                pid,
                reason: e.to_string(),
            }
        })?;
        let handle = OwnedHandle(handle);

        let mut wow64 = BOOL::default();
        unsafe {
            let _ = IsWow64Process(handle.raw(), &mut wow64);
        }

        Ok(Self {
            pid,
            handle,
            wow64: wow64.as_bool(),
        })
    }

    /// Open the first process whose image name matches, ignoring case
    pub fn open_by_name(name: &str) -> Result<Self, DebugError> {
        let process = find_process_by_name(name).ok_or_else(|| DebugError::ProcessNotFound {
            pid: 0,
            reason: format!("no process named {}", name),
        })?;
        Self::open(process.pid)
    }

    /// 32-bit process running under WOW64
    pub fn is_wow64(&self) -> bool {
        self.wow64
    }

    pub(crate) fn handle(&self) -> HANDLE {
        self.handle.raw()
    }

    fn open_thread(&self, tid: u32) -> Result<OwnedHandle, DebugError> {
        let access =
            THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_SET_CONTEXT | THREAD_QUERY_INFORMATION;
        unsafe { OpenThread(access, false, tid) }
            .map(OwnedHandle)
            .map_err(|e| DebugError::Thread {
                tid,
                reason: e.to_string(),
            })
    }

    fn translate(&self, event: &DEBUG_EVENT) -> DebugEventKind {
        unsafe {
            match event.dwDebugEventCode {
                EXCEPTION_DEBUG_EVENT => {
                    let info = event.u.Exception;
                    let record = info.ExceptionRecord;
                    let raw = record.ExceptionCode.0 as u32;
                    let code = match raw {
                        EXCEPTION_BREAKPOINT_CODE | STATUS_WX86_BREAKPOINT => ExceptionCode::Breakpoint,
                        EXCEPTION_SINGLE_STEP_CODE | STATUS_WX86_SINGLE_STEP => {
                            ExceptionCode::SingleStep
                        }
                        other => ExceptionCode::Other(other),
                    };
                    DebugEventKind::Exception {
                        code,
                        address: record.ExceptionAddress as u64,
                        first_chance: info.dwFirstChance != 0,
                    }
                }
                CREATE_PROCESS_DEBUG_EVENT => {
                    let info = event.u.CreateProcessInfo;
                    // The debugger owns the image file handle.
                    if !info.hFile.is_invalid() {
                        let _ = CloseHandle(info.hFile);
                    }
                    DebugEventKind::ProcessCreated {
                        base_address: info.lpBaseOfImage as u64,
                    }
                }
                CREATE_THREAD_DEBUG_EVENT => DebugEventKind::ThreadCreated,
                EXIT_THREAD_DEBUG_EVENT => DebugEventKind::ThreadExited {
                    exit_code: event.u.ExitThread.dwExitCode,
                },
                EXIT_PROCESS_DEBUG_EVENT => DebugEventKind::ProcessExited {
                    exit_code: event.u.ExitProcess.dwExitCode,
                },
                LOAD_DLL_DEBUG_EVENT => {
                    let info = event.u.LoadDll;
                    if !info.hFile.is_invalid() {
                        let _ = CloseHandle(info.hFile);
                    }
                    DebugEventKind::ModuleLoaded {
                        base_address: info.lpBaseOfDll as u64,
                    }
                }
                UNLOAD_DLL_DEBUG_EVENT => DebugEventKind::ModuleUnloaded {
                    base_address: event.u.UnloadDll.lpBaseOfDll as u64,
                },
                other => DebugEventKind::Other { code: other.0 },
            }
        }
    }
}

impl ProcessMemory for WindowsProcess {
    fn read_raw(&self, address: u64, buffer: &mut [u8]) -> Result<(), MemoryError> {
        let mut bytes_read = 0usize;

        unsafe {
            ReadProcessMemory(
                self.handle(),
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len(),
                Some(&mut bytes_read),
            )
            .map_err(|e| MemoryError::ReadFailed {
                address,
                reason: e.to_string(),
            })?;
        }

        if bytes_read != buffer.len() {
            return Err(MemoryError::Partial {
                address,
                expected: buffer.len(),
                transferred: bytes_read,
            });
        }
        Ok(())
    }

    fn write_raw(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut bytes_written = 0usize;

        unsafe {
            WriteProcessMemory(
                self.handle(),
                address as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                Some(&mut bytes_written),
            )
            .map_err(|e| MemoryError::WriteFailed {
                address,
                reason: e.to_string(),
            })?;

            // Patched code must be visible to instruction fetch.
            let _ = FlushInstructionCache(self.handle(), Some(address as *const c_void), data.len());
        }

        if bytes_written != data.len() {
            return Err(MemoryError::Partial {
                address,
                expected: data.len(),
                transferred: bytes_written,
            });
        }
        Ok(())
    }

    fn pointer_width(&self) -> PointerWidth {
        if self.wow64 {
            PointerWidth::Bits32
        } else {
            PointerWidth::Bits64
        }
    }
}

impl Target for WindowsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, DebugError> {
        let snapshot = unsafe {
            CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid)
        }
        .map(OwnedHandle)
        .map_err(|e| DebugError::ProcessNotFound {
            pid: self.pid,
            reason: e.to_string(),
        })?;

        let mut modules = Vec::new();
        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };
        unsafe {
            let mut more = Module32FirstW(snapshot.raw(), &mut entry).is_ok();
            while more {
                modules.push(ModuleInfo {
                    name: wide_to_string(&entry.szModule),
                    path: Some(wide_to_string(&entry.szExePath)),
                    base_address: entry.modBaseAddr as u64,
                    size: entry.modBaseSize as u64,
                });
                more = Module32NextW(snapshot.raw(), &mut entry).is_ok();
            }
        }
        Ok(modules)
    }

    fn threads(&self) -> Result<Vec<u32>, DebugError> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }
            .map(OwnedHandle)
            .map_err(|e| DebugError::Event(e.to_string()))?;

        let mut threads = Vec::new();
        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };
        unsafe {
            let mut more = Thread32First(snapshot.raw(), &mut entry).is_ok();
            while more {
                if entry.th32OwnerProcessID == self.pid {
                    threads.push(entry.th32ThreadID);
                }
                more = Thread32Next(snapshot.raw(), &mut entry).is_ok();
            }
        }
        Ok(threads)
    }

    fn has_exited(&self) -> bool {
        let mut code = 0u32;
        match unsafe { GetExitCodeProcess(self.handle(), &mut code) } {
            Ok(()) => code != STILL_ACTIVE,
            Err(_) => true,
        }
    }

    fn is_being_debugged(&self) -> Result<bool, DebugError> {
        let mut present = BOOL::default();
        unsafe { CheckRemoteDebuggerPresent(self.handle(), &mut present) }.map_err(|e| {
            DebugError::ProcessNotFound {
                pid: self.pid,
                reason: e.to_string(),
            }
        })?;
        Ok(present.as_bool())
    }

    fn begin_debugging(&self, kill_on_exit: bool) -> Result<(), DebugError> {
        unsafe {
            DebugActiveProcess(self.pid).map_err(|e| DebugError::AttachFailed {
                pid: self.pid,
                reason: e.to_string(),
            })?;
            if let Err(e) = DebugSetProcessKillOnExit(kill_on_exit) {
                log::warn!("DebugSetProcessKillOnExit failed: {}", e);
            }
        }
        Ok(())
    }

    fn wait_event(&self, timeout: Duration) -> Result<Option<DebugEvent>, DebugError> {
        let mut debug_event = DEBUG_EVENT::default();
        let millis = timeout.as_millis().min(u32::MAX as u128) as u32;
        match unsafe { WaitForDebugEvent(&mut debug_event, millis) } {
            Ok(()) => Ok(Some(DebugEvent::new(
                debug_event.dwProcessId,
                debug_event.dwThreadId,
                self.translate(&debug_event),
            ))),
            Err(e) if e.code() == ERROR_SEM_TIMEOUT.to_hresult() => Ok(None),
            Err(e) => Err(DebugError::Event(e.to_string())),
        }
    }

    fn continue_event(&self, event: &DebugEvent, status: ContinueStatus) -> Result<(), DebugError> {
        let status = match status {
            ContinueStatus::Continue => DBG_CONTINUE,
            ContinueStatus::ExceptionNotHandled => DBG_EXCEPTION_NOT_HANDLED,
        };
        unsafe { ContinueDebugEvent(event.pid, event.tid, status) }
            .map_err(|e| DebugError::Event(format!("Continue failed: {}", e)))
    }

    fn stop_debugging(&self) -> Result<(), DebugError> {
        unsafe { DebugActiveProcessStop(self.pid) }.map_err(|e| DebugError::DetachFailed {
            pid: self.pid,
            reason: e.to_string(),
        })
    }

    fn suspend_thread(&self, tid: u32) -> Result<(), DebugError> {
        let thread = self.open_thread(tid)?;
        if unsafe { SuspendThread(thread.raw()) } == u32::MAX {
            return Err(DebugError::Thread {
                tid,
                reason: windows::core::Error::from_win32().to_string(),
            });
        }
        Ok(())
    }

    fn resume_thread(&self, tid: u32) -> Result<(), DebugError> {
        let thread = self.open_thread(tid)?;
        if unsafe { ResumeThread(thread.raw()) } == u32::MAX {
            return Err(DebugError::Thread {
                tid,
                reason: windows::core::Error::from_win32().to_string(),
            });
        }
        Ok(())
    }

    fn get_context(&self, tid: u32) -> Result<ThreadContext, DebugError> {
        let thread = self.open_thread(tid)?;
        let context_error = |e: windows::core::Error| DebugError::ThreadContext {
            tid,
            reason: e.to_string(),
        };

        if self.wow64 {
            let mut ctx = WOW64_CONTEXT {
                ContextFlags: WOW64_CONTEXT_FULL,
                ..Default::default()
            };
            unsafe { Wow64GetThreadContext(thread.raw(), &mut ctx) }.map_err(context_error)?;
            return Ok(ThreadContext {
                rax: ctx.Eax as u64,
                rbx: ctx.Ebx as u64,
                rcx: ctx.Ecx as u64,
                rdx: ctx.Edx as u64,
                rsi: ctx.Esi as u64,
                rdi: ctx.Edi as u64,
                rbp: ctx.Ebp as u64,
                rsp: ctx.Esp as u64,
                rip: ctx.Eip as u64,
                rflags: ctx.EFlags as u64,
                ..Default::default()
            });
        }

        let mut ctx = CONTEXT {
            ContextFlags: CONTEXT_FULL_AMD64,
            ..Default::default()
        };
        unsafe { GetThreadContext(thread.raw(), &mut ctx) }.map_err(context_error)?;
        Ok(ThreadContext {
            rax: ctx.Rax,
            rbx: ctx.Rbx,
            rcx: ctx.Rcx,
            rdx: ctx.Rdx,
            rsi: ctx.Rsi,
            rdi: ctx.Rdi,
            rbp: ctx.Rbp,
            rsp: ctx.Rsp,
            r8: ctx.R8,
            r9: ctx.R9,
            r10: ctx.R10,
            r11: ctx.R11,
            r12: ctx.R12,
            r13: ctx.R13,
            r14: ctx.R14,
            r15: ctx.R15,
            rip: ctx.Rip,
            rflags: ctx.EFlags as u64,
        })
    }

    fn set_context(&self, tid: u32, context: &ThreadContext) -> Result<(), DebugError> {
        let thread = self.open_thread(tid)?;
        let context_error = |e: windows::core::Error| DebugError::ThreadContext {
            tid,
            reason: e.to_string(),
        };

        // Read first so segment and floating point state survive the write.
        if self.wow64 {
            let mut ctx = WOW64_CONTEXT {
                ContextFlags: WOW64_CONTEXT_FULL,
                ..Default::default()
            };
            unsafe { Wow64GetThreadContext(thread.raw(), &mut ctx) }.map_err(context_error)?;
            ctx.Eax = context.rax as u32;
            ctx.Ebx = context.rbx as u32;
            ctx.Ecx = context.rcx as u32;
            ctx.Edx = context.rdx as u32;
            ctx.Esi = context.rsi as u32;
            ctx.Edi = context.rdi as u32;
            ctx.Ebp = context.rbp as u32;
            ctx.Esp = context.rsp as u32;
            ctx.Eip = context.rip as u32;
            ctx.EFlags = context.rflags as u32;
            return unsafe { Wow64SetThreadContext(thread.raw(), &ctx) }.map_err(context_error);
        }

        let mut ctx = CONTEXT {
            ContextFlags: CONTEXT_FULL_AMD64,
            ..Default::default()
        };
        unsafe { GetThreadContext(thread.raw(), &mut ctx) }.map_err(context_error)?;
        ctx.Rax = context.rax;
        ctx.Rbx = context.rbx;
        ctx.Rcx = context.rcx;
        ctx.Rdx = context.rdx;
        ctx.Rsi = context.rsi;
        ctx.Rdi = context.rdi;
        ctx.Rbp = context.rbp;
        ctx.Rsp = context.rsp;
        ctx.R8 = context.r8;
        ctx.R9 = context.r9;
        ctx.R10 = context.r10;
        ctx.R11 = context.r11;
        ctx.R12 = context.r12;
        ctx.R13 = context.r13;
        ctx.R14 = context.r14;
        ctx.R15 = context.r15;
        ctx.Rip = context.rip;
        ctx.EFlags = context.rflags as u32;
        unsafe { SetThreadContext(thread.raw(), &ctx) }.map_err(context_error)
    }
}

/// Convert a NUL-terminated UTF-16 buffer
fn wide_to_string(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}
