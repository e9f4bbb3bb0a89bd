//! Linux ptrace backend (x86_64).
//!
//! Threads are seized rather than attached, so nothing stops until it traps.
//! Thread suspension is implicit: a thread that reported an event stays
//! stopped until it is continued, and other threads keep running.

mod procfs;

pub use procfs::enumerate_processes;

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::core::debugger::DebugError;
use crate::core::memory::{MemoryError, PointerWidth, ProcessMemory};

use super::breakpoint::TRAP_OPCODE;
use super::types::{
    ContinueStatus, DebugEvent, DebugEventKind, ExceptionCode, ModuleInfo, ProcessInfo,
    ThreadContext,
};
use super::Target;

/// `si_code` values for SIGTRAP
const SI_KERNEL: i32 = 0x80;
const TRAP_BRKPT: i32 = 1;
const TRAP_TRACE: i32 = 2;

/// Exit code reported for a process killed by a signal
const SIGNAL_EXIT_BASE: u32 = 128;

/// How long one poll sleeps when no tracee has anything to report
const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Default)]
struct Tracer {
    active: bool,
    /// Seized thread ids
    threads: BTreeSet<i32>,
    /// Threads stopped on an event that has not been continued yet
    stopped: HashSet<i32>,
    /// Cloned threads that have not reported their first stop
    fresh: HashSet<i32>,
    /// Events produced without a ptrace stop
    synthetic: VecDeque<DebugEvent>,
}

/// A process on the local machine, instrumented through ptrace and `/proc`
pub struct LinuxProcess {
    pid: u32,
    name: String,
    width: PointerWidth,
    tracer: Mutex<Tracer>,
}

impl LinuxProcess {
    /// Open a process by PID
    pub fn open(pid: u32) -> Result<Self, DebugError> {
        if !Path::new(&format!("/proc/{}", pid)).exists() {
            return Err(DebugError::ProcessNotFound {
                pid,
                reason: "no such process".into(),
            });
        }
        let width = match procfs::read_elf_class(pid) {
            Some(1) => PointerWidth::Bits32,
            _ => PointerWidth::Bits64,
        };
        Ok(Self {
            pid,
            name: procfs::read_name(pid).unwrap_or_default(),
            width,
            tracer: Mutex::new(Tracer::default()),
        })
    }

    /// Open the first process whose name matches, ignoring case
    pub fn open_by_name(name: &str) -> Result<Self, DebugError> {
        let process = find_process_by_name(name).ok_or_else(|| DebugError::ProcessNotFound {
            pid: 0,
            reason: format!("no process named {}", name),
        })?;
        Self::open(process.pid)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn tracer(&self) -> MutexGuard<'_, Tracer> {
        self.tracer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn leader(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }

    fn mem_file(&self, write: bool) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(format!("/proc/{}/mem", self.pid))
    }

    fn event(&self, tid: i32, kind: DebugEventKind) -> DebugEvent {
        DebugEvent::new(self.pid, tid as u32, kind)
    }

    /// Translate one wait status; `None` for stops the pump never sees
    fn translate(&self, tracer: &mut Tracer, status: WaitStatus) -> Option<DebugEvent> {
        match status {
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                tracer.stopped.insert(pid.as_raw());
                Some(self.classify_trap(pid))
            }
            WaitStatus::Stopped(pid, signal) => {
                tracer.stopped.insert(pid.as_raw());
                let address = ptrace::getregs(pid).map(|regs| regs.rip).unwrap_or(0);
                Some(self.event(
                    pid.as_raw(),
                    DebugEventKind::Exception {
                        code: ExceptionCode::Other(signal as u32),
                        address,
                        first_chance: true,
                    },
                ))
            }
            WaitStatus::PtraceEvent(pid, _, event) => {
                let tid = pid.as_raw();
                tracer.stopped.insert(tid);
                if event == Event::PTRACE_EVENT_CLONE as i32 {
                    if let Ok(child) = ptrace::getevent(pid) {
                        log::trace!("Thread {} cloned from {}", child, tid);
                        tracer.threads.insert(child as i32);
                        tracer.fresh.insert(child as i32);
                    }
                }
                // A cloned thread's first stop announces it.
                let kind = if event == Event::PTRACE_EVENT_STOP as i32 && tracer.fresh.remove(&tid) {
                    DebugEventKind::ThreadCreated
                } else {
                    DebugEventKind::Other { code: event as u32 }
                };
                Some(self.event(tid, kind))
            }
            WaitStatus::Exited(pid, code) => Some(self.exited(tracer, pid, code as u32)),
            WaitStatus::Signaled(pid, signal, _) => {
                Some(self.exited(tracer, pid, SIGNAL_EXIT_BASE + signal as u32))
            }
            WaitStatus::PtraceSyscall(pid) => {
                tracer.stopped.insert(pid.as_raw());
                Some(self.event(pid.as_raw(), DebugEventKind::Other { code: 0 }))
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => None,
        }
    }

    fn exited(&self, tracer: &mut Tracer, pid: Pid, exit_code: u32) -> DebugEvent {
        tracer.threads.remove(&pid.as_raw());
        tracer.stopped.remove(&pid.as_raw());
        tracer.fresh.remove(&pid.as_raw());
        if pid == self.leader() {
            self.event(pid.as_raw(), DebugEventKind::ProcessExited { exit_code })
        } else {
            self.event(pid.as_raw(), DebugEventKind::ThreadExited { exit_code })
        }
    }

    fn classify_trap(&self, pid: Pid) -> DebugEvent {
        let code = ptrace::getsiginfo(pid).map(|info| info.si_code).unwrap_or(0);
        let regs = match ptrace::getregs(pid) {
            Ok(regs) => regs,
            Err(e) => {
                log::warn!("Could not read registers of thread {}: {}", pid, e);
                return self.event(
                    pid.as_raw(),
                    DebugEventKind::Exception {
                        code: ExceptionCode::Other(Signal::SIGTRAP as u32),
                        address: 0,
                        first_chance: true,
                    },
                );
            }
        };

        let (code, address) = match code {
            SI_KERNEL | TRAP_BRKPT => (ExceptionCode::Breakpoint, regs.rip.wrapping_sub(1)),
            TRAP_TRACE => {
                // The kernel leaves a user-set trap flag in place.
                let mut cleared = regs;
                cleared.eflags &= !super::types::TRAP_FLAG;
                if let Err(e) = ptrace::setregs(pid, cleared) {
                    log::warn!("Could not clear trap flag on thread {}: {}", pid, e);
                }
                (ExceptionCode::SingleStep, regs.rip)
            }
            _ => (ExceptionCode::Other(Signal::SIGTRAP as u32), regs.rip),
        };
        self.event(
            pid.as_raw(),
            DebugEventKind::Exception {
                code,
                address,
                first_chance: true,
            },
        )
    }

    /// Stop one seized thread and let it go
    fn release(&self, tid: i32, was_stopped: bool) -> Result<(), DebugError> {
        let pid = Pid::from_raw(tid);
        let mut pending = None;

        if !was_stopped {
            match ptrace::interrupt(pid) {
                Ok(()) => {}
                Err(Errno::ESRCH) => return Ok(()),
                Err(e) => return Err(thread_error(tid, "interrupt", e)),
            }
            loop {
                match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                        self.rewind_lifted_trap(pid);
                        break;
                    }
                    Ok(WaitStatus::Stopped(_, signal)) => {
                        pending = Some(signal);
                        break;
                    }
                    Ok(WaitStatus::PtraceEvent(..)) | Ok(WaitStatus::PtraceSyscall(_)) => break,
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return Ok(()),
                    Ok(_) => continue,
                    Err(Errno::ECHILD) | Err(Errno::ESRCH) => return Ok(()),
                    Err(e) => return Err(thread_error(tid, "wait", e)),
                }
            }
        }

        match ptrace::detach(pid, pending) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(thread_error(tid, "detach", e)),
        }
    }

    /// A trap reported after its breakpoint was restored must re-run the original instruction
    fn rewind_lifted_trap(&self, pid: Pid) {
        let Ok(info) = ptrace::getsiginfo(pid) else { return };
        if !matches!(info.si_code, SI_KERNEL | TRAP_BRKPT) {
            return;
        }
        let Ok(mut regs) = ptrace::getregs(pid) else { return };
        let address = regs.rip.wrapping_sub(1);
        let mut byte = [0u8; 1];
        if self.read_raw(address, &mut byte).is_ok() && byte[0] != TRAP_OPCODE {
            regs.rip = address;
            let _ = ptrace::setregs(pid, regs);
        }
    }
}

fn thread_error(tid: i32, what: &str, errno: Errno) -> DebugError {
    DebugError::Thread {
        tid: tid as u32,
        reason: format!("{}: {}", what, errno),
    }
}

impl ProcessMemory for LinuxProcess {
    fn read_raw(&self, address: u64, buffer: &mut [u8]) -> Result<(), MemoryError> {
        let file = self.mem_file(false).map_err(|e| MemoryError::ReadFailed {
            address,
            reason: e.to_string(),
        })?;

        let mut transferred = 0;
        while transferred < buffer.len() {
            match file.read_at(&mut buffer[transferred..], address + transferred as u64) {
                Ok(0) => break,
                Ok(n) => transferred += n,
                Err(e) if transferred == 0 => {
                    return Err(MemoryError::ReadFailed {
                        address,
                        reason: e.to_string(),
                    })
                }
                Err(_) => break,
            }
        }
        if transferred != buffer.len() {
            return Err(MemoryError::Partial {
                address,
                expected: buffer.len(),
                transferred,
            });
        }
        Ok(())
    }

    fn write_raw(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let file = self.mem_file(true).map_err(|e| MemoryError::WriteFailed {
            address,
            reason: e.to_string(),
        })?;

        let mut transferred = 0;
        while transferred < data.len() {
            match file.write_at(&data[transferred..], address + transferred as u64) {
                Ok(0) => break,
                Ok(n) => transferred += n,
                Err(e) if transferred == 0 => {
                    return Err(MemoryError::WriteFailed {
                        address,
                        reason: e.to_string(),
                    })
                }
                Err(_) => break,
            }
        }
        // x86 keeps instruction fetch coherent with stores; nothing to flush.
        if transferred != data.len() {
            return Err(MemoryError::Partial {
                address,
                expected: data.len(),
                transferred,
            });
        }
        Ok(())
    }

    fn pointer_width(&self) -> PointerWidth {
        self.width
    }
}

impl Target for LinuxProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, DebugError> {
        procfs::read_modules(self.pid).map_err(|e| DebugError::ProcessNotFound {
            pid: self.pid,
            reason: e.to_string(),
        })
    }

    fn threads(&self) -> Result<Vec<u32>, DebugError> {
        procfs::read_threads(self.pid).map_err(|e| DebugError::ProcessNotFound {
            pid: self.pid,
            reason: e.to_string(),
        })
    }

    fn has_exited(&self) -> bool {
        procfs::read_status(self.pid)
            .map(|status| procfs::parse_is_dead(&status))
            .unwrap_or(true)
    }

    fn is_being_debugged(&self) -> Result<bool, DebugError> {
        let status = procfs::read_status(self.pid).map_err(|e| DebugError::ProcessNotFound {
            pid: self.pid,
            reason: e.to_string(),
        })?;
        Ok(procfs::parse_tracer_pid(&status).is_some_and(|tracer| tracer != 0))
    }

    fn begin_debugging(&self, kill_on_exit: bool) -> Result<(), DebugError> {
        let mut options = Options::PTRACE_O_TRACECLONE;
        if kill_on_exit {
            options |= Options::PTRACE_O_EXITKILL;
        }

        ptrace::seize(self.leader(), options).map_err(|e| DebugError::AttachFailed {
            pid: self.pid,
            reason: e.to_string(),
        })?;

        let mut tracer = self.tracer();
        tracer.active = true;
        tracer.threads.insert(self.pid as i32);
        for tid in self.threads()? {
            if tid == self.pid {
                continue;
            }
            match ptrace::seize(Pid::from_raw(tid as i32), options) {
                Ok(()) => {
                    tracer.threads.insert(tid as i32);
                }
                Err(e) => log::warn!("Could not seize thread {}: {}", tid, e),
            }
        }

        let base_address = self
            .modules()
            .ok()
            .and_then(|modules| modules.first().map(|m| m.base_address))
            .unwrap_or(0);
        tracer.synthetic.push_back(self.event(
            self.pid as i32,
            DebugEventKind::ProcessCreated { base_address },
        ));
        log::debug!("Seized {} thread(s) of process {}", tracer.threads.len(), self.pid);
        Ok(())
    }

    fn wait_event(&self, timeout: Duration) -> Result<Option<DebugEvent>, DebugError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut tracer = self.tracer();
                if !tracer.active {
                    return Err(DebugError::Event("not debugging".into()));
                }
                if let Some(event) = tracer.synthetic.pop_front() {
                    return Ok(Some(event));
                }

                let threads: Vec<i32> = tracer.threads.iter().copied().collect();
                for tid in threads {
                    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL;
                    match waitpid(Pid::from_raw(tid), Some(flags)) {
                        Ok(status) => {
                            if let Some(event) = self.translate(&mut tracer, status) {
                                return Ok(Some(event));
                            }
                        }
                        Err(Errno::ECHILD) => {
                            tracer.threads.remove(&tid);
                        }
                        Err(e) => return Err(DebugError::Event(format!("waitpid({}): {}", tid, e))),
                    }
                }
                if tracer.threads.is_empty() {
                    // Every tracee vanished without an exit status.
                    return Ok(Some(self.event(
                        self.pid as i32,
                        DebugEventKind::ProcessExited { exit_code: 0 },
                    )));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn continue_event(&self, event: &DebugEvent, status: ContinueStatus) -> Result<(), DebugError> {
        let tid = event.tid as i32;
        if !self.tracer().stopped.remove(&tid) {
            return Ok(());
        }

        let signal = match (&event.kind, status) {
            (
                DebugEventKind::Exception {
                    code: ExceptionCode::Other(signo),
                    ..
                },
                ContinueStatus::ExceptionNotHandled,
            ) => Signal::try_from(*signo as i32).ok(),
            _ => None,
        };

        match ptrace::cont(Pid::from_raw(tid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(DebugError::Event(format!("continue thread {}: {}", tid, e))),
        }
    }

    fn stop_debugging(&self) -> Result<(), DebugError> {
        let mut tracer = self.tracer();
        let threads: Vec<i32> = tracer.threads.iter().copied().collect();
        let mut first_error = None;
        for tid in threads {
            let was_stopped = tracer.stopped.remove(&tid);
            if let Err(e) = self.release(tid, was_stopped) {
                log::warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        tracer.threads.clear();
        tracer.fresh.clear();
        tracer.synthetic.clear();
        tracer.active = false;

        match first_error {
            Some(e) => Err(DebugError::DetachFailed {
                pid: self.pid,
                reason: e.to_string(),
            }),
            None => Ok(()),
        }
    }

    // Only the thread that reported an event is stopped; others keep running.
    fn suspend_thread(&self, _tid: u32) -> Result<(), DebugError> {
        Ok(())
    }

    fn resume_thread(&self, _tid: u32) -> Result<(), DebugError> {
        Ok(())
    }

    fn get_context(&self, tid: u32) -> Result<ThreadContext, DebugError> {
        let regs = ptrace::getregs(Pid::from_raw(tid as i32)).map_err(|e| {
            DebugError::ThreadContext {
                tid,
                reason: e.to_string(),
            }
        })?;
        Ok(ThreadContext {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rbp: regs.rbp,
            rsp: regs.rsp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.eflags,
        })
    }

    fn set_context(&self, tid: u32, context: &ThreadContext) -> Result<(), DebugError> {
        let pid = Pid::from_raw(tid as i32);
        let context_error = |e: Errno| DebugError::ThreadContext {
            tid,
            reason: e.to_string(),
        };
        let mut regs = ptrace::getregs(pid).map_err(context_error)?;
        regs.rax = context.rax;
        regs.rbx = context.rbx;
        regs.rcx = context.rcx;
        regs.rdx = context.rdx;
        regs.rsi = context.rsi;
        regs.rdi = context.rdi;
        regs.rbp = context.rbp;
        regs.rsp = context.rsp;
        regs.r8 = context.r8;
        regs.r9 = context.r9;
        regs.r10 = context.r10;
        regs.r11 = context.r11;
        regs.r12 = context.r12;
        regs.r13 = context.r13;
        regs.r14 = context.r14;
        regs.r15 = context.r15;
        regs.rip = context.rip;
        regs.eflags = context.rflags;
        ptrace::setregs(pid, regs).map_err(context_error)
    }
}

/// Find a process by name (case-insensitive)
pub fn find_process_by_name(name: &str) -> Option<ProcessInfo> {
    procfs::enumerate_processes()
        .into_iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}
