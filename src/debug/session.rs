//! Debug event pump - attach, dispatch, hit/retrap and detach.
//!
//! The pump owns the debug port for its whole lifetime and runs on one
//! dedicated thread, because the OS binds a debugging session to the thread
//! that started it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::debugger::DebugError;

use super::breakpoint::{Breakpoint, BreakpointHit, Breakpoints, CleanupFailures};
use super::types::{
    ContinueStatus, DebugEvent, DebugEventKind, ExceptionCode, SessionNotice, SessionStatus,
};
use super::Target;

/// Cooperative cancellation flag shared with the pump
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Optional callbacks for events without mandatory handling.
///
/// Runs on the pump thread. Every method defaults to doing nothing.
pub trait EventHook: Send {
    fn process_created(&mut self, _event: &DebugEvent) {}

    fn thread_created(&mut self, _event: &DebugEvent) {}

    fn thread_exited(&mut self, _event: &DebugEvent) {}

    fn module_loaded(&mut self, _event: &DebugEvent) {}

    fn module_unloaded(&mut self, _event: &DebugEvent) {}

    /// Exceptions other than our own breakpoints and single steps.
    /// The default hands them back to the target.
    fn exception(&mut self, _event: &DebugEvent) -> ContinueStatus {
        ContinueStatus::ExceptionNotHandled
    }
}

/// Hook used when the caller installs none
pub struct NoHook;

impl EventHook for NoHook {}

pub(crate) type SharedHook = Arc<Mutex<Box<dyn EventHook>>>;

/// Fan-out of [`SessionNotice`]s to every subscriber
#[derive(Default)]
pub(crate) struct NoticeHub {
    subscribers: Mutex<Vec<Sender<SessionNotice>>>,
}

impl NoticeHub {
    pub fn subscribe(&self) -> Receiver<SessionNotice> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn publish(&self, notice: SessionNotice) {
        lock(&self.subscribers).retain(|tx| tx.send(notice.clone()).is_ok());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachReason {
    Cancelled,
    ProcessExited { exit_code: u32 },
    /// The debug port stopped working; cleanup was still attempted
    Failed(String),
}

/// Outcome of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachReport {
    pub pid: u32,
    pub reason: DetachReason,
    /// Cleanup steps that did not succeed, in the order they were attempted
    pub failures: Vec<String>,
}

impl DetachReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A breakpoint lifted so its original instruction can run once
struct PendingRetrap {
    breakpoint: Arc<Breakpoint>,
}

/// Everything the pump thread needs, moved onto it at spawn
pub(crate) struct Pump<T: Target> {
    pub target: Arc<T>,
    pub breakpoints: Breakpoints,
    pub cancel: CancelToken,
    pub hook: SharedHook,
    pub notices: Arc<NoticeHub>,
    pub status: Arc<Mutex<SessionStatus>>,
    pub event_timeout: Duration,
    pub kill_on_exit: bool,
    /// Keyed by thread id
    pending: HashMap<u32, PendingRetrap>,
}

impl<T: Target> Pump<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target: Arc<T>,
        breakpoints: Breakpoints,
        cancel: CancelToken,
        hook: SharedHook,
        notices: Arc<NoticeHub>,
        status: Arc<Mutex<SessionStatus>>,
        event_timeout: Duration,
        kill_on_exit: bool,
    ) -> Self {
        Self {
            target,
            breakpoints,
            cancel,
            hook,
            notices,
            status,
            event_timeout,
            kill_on_exit,
            pending: HashMap::new(),
        }
    }

    /// Thread body: attach, report the outcome on `ready`, then pump events
    pub fn start(mut self, ready: SyncSender<Result<(), DebugError>>) -> Result<DetachReport, DebugError> {
        match self.attach() {
            Ok(()) => {
                let _ = ready.send(Ok(()));
                Ok(self.run())
            }
            Err(e) => {
                let _ = ready.send(Err(e.clone()));
                Err(e)
            }
        }
    }

    fn set_status(&self, status: SessionStatus) {
        *lock(&self.status) = status;
    }

    fn pid(&self) -> u32 {
        self.target.pid()
    }

    fn attach(&mut self) -> Result<(), DebugError> {
        let pid = self.pid();
        self.set_status(SessionStatus::Attaching);
        log::info!("Attaching to process {}", pid);

        if let Err(e) = self.target.begin_debugging(self.kill_on_exit) {
            self.set_status(SessionStatus::Detached);
            return Err(e);
        }

        if let Err(CleanupFailures(failures)) = self.breakpoints.arm_all() {
            for (address, error) in failures {
                self.report(pid, 0, Some(address), &DebugError::Memory(error));
            }
        }

        self.set_status(SessionStatus::Attached);
        self.notices.publish(SessionNotice::Attached { pid });
        log::info!("Attached to process {} ({} breakpoint(s))", pid, self.breakpoints.len());
        Ok(())
    }

    fn run(mut self) -> DetachReport {
        loop {
            // Never leave with a lifted breakpoint; it would stay disabled for good.
            if self.cancel.is_cancelled() && self.pending.is_empty() {
                return self.detach(DetachReason::Cancelled);
            }

            let event = match self.target.wait_event(self.event_timeout) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("Waiting for debug event failed: {}", e);
                    return self.detach(DetachReason::Failed(e.to_string()));
                }
            };
            log::trace!("Debug event: {:?}", event);

            if let DebugEventKind::ProcessExited { exit_code } = event.kind {
                return self.process_exited(&event, exit_code);
            }

            let status = self.dispatch(&event);
            if let Err(e) = self.target.continue_event(&event, status) {
                log::error!("Continuing debug event failed: {}", e);
                return self.detach(DetachReason::Failed(e.to_string()));
            }
        }
    }

    fn dispatch(&mut self, event: &DebugEvent) -> ContinueStatus {
        match &event.kind {
            DebugEventKind::Exception {
                code: ExceptionCode::Breakpoint,
                address,
                ..
            } => self.on_breakpoint(event, *address),
            DebugEventKind::Exception {
                code: ExceptionCode::SingleStep,
                ..
            } => self.on_single_step(event),
            DebugEventKind::Exception { .. } => lock(&self.hook).exception(event),
            DebugEventKind::ProcessCreated { .. } => {
                lock(&self.hook).process_created(event);
                ContinueStatus::Continue
            }
            DebugEventKind::ThreadCreated => {
                lock(&self.hook).thread_created(event);
                ContinueStatus::Continue
            }
            DebugEventKind::ThreadExited { .. } => {
                if let Some(pending) = self.pending.remove(&event.tid) {
                    self.rearm(event, pending);
                }
                lock(&self.hook).thread_exited(event);
                ContinueStatus::Continue
            }
            DebugEventKind::ModuleLoaded { .. } => {
                lock(&self.hook).module_loaded(event);
                ContinueStatus::Continue
            }
            DebugEventKind::ModuleUnloaded { .. } => {
                lock(&self.hook).module_unloaded(event);
                ContinueStatus::Continue
            }
            DebugEventKind::ProcessExited { .. } | DebugEventKind::Other { .. } => {
                ContinueStatus::Continue
            }
        }
    }

    fn on_breakpoint(&mut self, event: &DebugEvent, address: u64) -> ContinueStatus {
        let Some(breakpoint) = self.breakpoints.get(address) else {
            log::debug!("Trap at {:#x} on thread {} is not ours", address, event.tid);
            return ContinueStatus::Continue;
        };

        // A thread cannot trap twice without single-stepping in between, but
        // if the backend dropped a step, put the older breakpoint back first.
        if let Some(stale) = self.pending.remove(&event.tid) {
            self.rearm(event, stale);
        }

        if let Err(e) = self.target.suspend_thread(event.tid) {
            self.report(event.pid, event.tid, Some(address), &e);
            return ContinueStatus::Continue;
        }
        if let Err(e) = self.handle_hit(event, &breakpoint, address) {
            self.report(event.pid, event.tid, Some(address), &e);
        }
        if let Err(e) = self.target.resume_thread(event.tid) {
            self.report(event.pid, event.tid, Some(address), &e);
        }
        ContinueStatus::Continue
    }

    fn handle_hit(
        &mut self,
        event: &DebugEvent,
        breakpoint: &Arc<Breakpoint>,
        address: u64,
    ) -> Result<(), DebugError> {
        let mut context = self.target.get_context(event.tid)?;
        // The trap byte has executed; the real instruction has not.
        context.set_instruction_pointer(address);

        let mut retrap = false;
        let mut restore_failure = None;
        if breakpoint.is_enabled() {
            let mut hit = BreakpointHit::new(address, event.pid, event.tid, context);
            if breakpoint.condition_holds(&hit) {
                log::debug!("Breakpoint hit at {:#x} on thread {}", address, event.tid);
                breakpoint.notify(&mut hit);
            } else {
                log::trace!("Breakpoint at {:#x} skipped by its condition", address);
            }

            if hit.disable_requested() {
                breakpoint.set_armed(false);
                match breakpoint.disable(self.breakpoints.memory()) {
                    Ok(_) => log::debug!("Breakpoint at {:#x} disabled by its handler", address),
                    Err(e) => restore_failure = Some(e),
                }
            } else if breakpoint.is_enabled() {
                hit.context.set_trap_flag();
                retrap = true;
            }
            context = hit.context;
        }

        if retrap {
            if let Err(e) = breakpoint.disable(self.breakpoints.memory()) {
                // The trap byte is still there; resume onto it without stepping.
                context.clear_trap_flag();
                retrap = false;
                restore_failure = Some(e);
            }
        }

        // Written back on every path; the IP must not stay past the trap byte.
        if let Err(e) = self.target.set_context(event.tid, &context) {
            if retrap {
                // Leave the breakpoint as it was before this hit.
                if let Err(restore) = breakpoint.enable(self.breakpoints.memory()) {
                    log::warn!("Could not reinstall breakpoint at {:#x}: {}", address, restore);
                }
            }
            if let Some(failure) = restore_failure {
                log::warn!("Could not restore byte at {:#x}: {}", address, failure);
            }
            return Err(e);
        }
        if retrap {
            self.pending.insert(
                event.tid,
                PendingRetrap {
                    breakpoint: Arc::clone(breakpoint),
                },
            );
        }
        match restore_failure {
            Some(e) => Err(DebugError::Memory(e)),
            None => Ok(()),
        }
    }

    fn on_single_step(&mut self, event: &DebugEvent) -> ContinueStatus {
        match self.pending.remove(&event.tid) {
            Some(pending) => self.rearm(event, pending),
            None => log::trace!("Single step on thread {} did not come from a retrap", event.tid),
        }
        ContinueStatus::Continue
    }

    fn rearm(&self, event: &DebugEvent, pending: PendingRetrap) {
        let breakpoint = pending.breakpoint;
        // Removed or disabled by the caller while the instruction ran.
        if !self.breakpoints.is_current(&breakpoint) || !breakpoint.is_armed() {
            return;
        }
        match breakpoint.enable(self.breakpoints.memory()) {
            Ok(_) => log::trace!("Breakpoint at {:#x} re-armed", breakpoint.address()),
            Err(e) => self.report(
                event.pid,
                event.tid,
                Some(breakpoint.address()),
                &DebugError::Memory(e),
            ),
        }
    }

    fn report(&self, pid: u32, tid: u32, address: Option<u64>, error: &DebugError) {
        match address {
            Some(address) => log::warn!("Handling event at {:#x} on thread {} failed: {}", address, tid, error),
            None => log::warn!("Handling event on thread {} failed: {}", tid, error),
        }
        self.notices.publish(SessionNotice::DispatchFailed {
            pid,
            tid,
            address,
            error: error.to_string(),
        });
    }

    fn process_exited(mut self, event: &DebugEvent, exit_code: u32) -> DetachReport {
        let pid = self.pid();
        log::info!("Process {} exited with code {}", pid, exit_code);

        // Nothing left to restore.
        self.breakpoints.forget_installed();
        self.pending.clear();

        let mut failures = Vec::new();
        if let Err(e) = self.target.continue_event(event, ContinueStatus::Continue) {
            failures.push(format!("continue exit event: {}", e));
        }

        self.set_status(SessionStatus::Detached);
        self.notices.publish(SessionNotice::ProcessExited { pid, exit_code });
        self.notices.publish(SessionNotice::Detached {
            pid,
            failures: failures.clone(),
        });
        DetachReport {
            pid,
            reason: DetachReason::ProcessExited { exit_code },
            failures,
        }
    }

    fn detach(mut self, reason: DetachReason) -> DetachReport {
        let pid = self.pid();
        self.set_status(SessionStatus::Detaching);
        log::info!("Detaching from process {} ({:?})", pid, reason);

        let mut failures = Vec::new();

        let threads = self.target.threads().unwrap_or_else(|e| {
            failures.push(format!("enumerate threads: {}", e));
            Vec::new()
        });
        let mut suspended = Vec::with_capacity(threads.len());
        for tid in threads {
            match self.target.suspend_thread(tid) {
                Ok(()) => suspended.push(tid),
                Err(e) => failures.push(format!("suspend thread {}: {}", tid, e)),
            }
        }

        // Only reachable with retraps outstanding when the port failed; a
        // stray trap flag would kill the target once we are gone.
        for tid in std::mem::take(&mut self.pending).into_keys() {
            let cleared = self.target.get_context(tid).and_then(|mut context| {
                context.clear_trap_flag();
                self.target.set_context(tid, &context)
            });
            if let Err(e) = cleared {
                failures.push(format!("clear trap flag on thread {}: {}", tid, e));
            }
        }

        if let Err(CleanupFailures(list)) = self.breakpoints.disarm_all() {
            failures.extend(
                list.into_iter()
                    .map(|(address, e)| format!("restore breakpoint at {:#x}: {}", address, e)),
            );
        }

        for tid in suspended {
            if let Err(e) = self.target.resume_thread(tid) {
                failures.push(format!("resume thread {}: {}", tid, e));
            }
        }

        if let Err(e) = self.target.stop_debugging() {
            failures.push(format!("stop debugging: {}", e));
        }

        self.set_status(SessionStatus::Detached);
        if failures.is_empty() {
            log::info!("Detached from process {}", pid);
        } else {
            log::warn!("Detached from process {} with {} failure(s)", pid, failures.len());
        }
        self.notices.publish(SessionNotice::Detached {
            pid,
            failures: failures.clone(),
        });

        DetachReport {
            pid,
            reason,
            failures,
        }
    }
}
