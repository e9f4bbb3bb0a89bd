//! Debugger - Session controller over a [`Target`]
//!
//! Owns the target, its breakpoint collection and, while attached, the
//! event pump thread. Everything here may be called from any thread; only
//! the pump talks to the debug port.

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::core::memory::MemoryError;
use crate::core::remote::{self, RemoteHost};
use crate::core::resolver::{self, AddressExpression, ResolveError};
use crate::debug::breakpoint::{Breakpoint, BreakpointHit, Breakpoints};
use crate::debug::session::{
    CancelToken, DetachReport, EventHook, NoHook, NoticeHub, Pump, SharedHook,
};
use crate::debug::types::{ModuleInfo, RemoteThreadExit, SessionNotice, SessionStatus};
use crate::debug::Target;

/// Debugger-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DebugError {
    #[error("Process not found: {pid} ({reason})")]
    ProcessNotFound { pid: u32, reason: String },

    #[error("Already attached to process {pid}")]
    AlreadyAttached { pid: u32 },

    #[error("Not attached to process {pid}")]
    NotAttached { pid: u32 },

    #[error("Process {pid} is already being debugged")]
    AlreadyBeingDebugged { pid: u32 },

    #[error("Failed to attach to process {pid}: {reason}")]
    AttachFailed { pid: u32, reason: String },

    #[error("Failed to detach from process {pid}: {reason}")]
    DetachFailed { pid: u32, reason: String },

    #[error("Thread context error on thread {tid}: {reason}")]
    ThreadContext { tid: u32, reason: String },

    #[error("Thread {tid}: {reason}")]
    Thread { tid: u32, reason: String },

    #[error("Debug event error: {0}")]
    Event(String),

    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("Failed to allocate {size} bytes in the target")]
    AllocationFailed { size: usize },

    #[error("Remote thread error: {0}")]
    RemoteThread(String),

    #[error("Failed to load library {path}: {reason}")]
    LibraryLoad { path: String, reason: String },

    #[error("Export not found: {name}")]
    ExportNotFound { name: String },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on one wait for a debug event; also the cancellation latency
    pub event_timeout: Duration,
    /// Kill the target when the controller exits without detaching
    pub kill_on_exit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_timeout: Duration::from_millis(1000),
            kill_on_exit: false,
        }
    }
}

struct Running {
    handle: JoinHandle<Result<DetachReport, DebugError>>,
    cancel: CancelToken,
}

/// Main debugger interface
pub struct Debugger<T: Target> {
    target: Arc<T>,
    config: SessionConfig,
    breakpoints: Breakpoints,
    hook: SharedHook,
    notices: Arc<NoticeHub>,
    status: Arc<Mutex<SessionStatus>>,
    session: Option<Running>,
}

impl<T: Target> Debugger<T> {
    /// Create a new debugger instance
    pub fn new(target: T) -> Self {
        Self::with_config(target, SessionConfig::default())
    }

    pub fn with_config(target: T, config: SessionConfig) -> Self {
        let target = Arc::new(target);
        let breakpoints = Breakpoints::new(target.clone());
        Self {
            target,
            config,
            breakpoints,
            hook: Arc::new(Mutex::new(Box::new(NoHook))),
            notices: Arc::new(NoticeHub::default()),
            status: Arc::new(Mutex::new(SessionStatus::Detached)),
            session: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.target.pid()
    }

    /// The target; memory helpers come from [`crate::core::memory::MemoryExt`]
    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_attached(&self) -> bool {
        self.status() == SessionStatus::Attached
    }

    pub fn breakpoints(&self) -> &Breakpoints {
        &self.breakpoints
    }

    /// Receive attach/detach/exit notifications from now on
    pub fn subscribe(&self) -> Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn set_hook(&self, hook: impl EventHook + 'static) {
        *self.hook.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Box::new(hook);
    }

    /// Start a session on a dedicated pump thread.
    ///
    /// Returns once the OS attach has succeeded or failed; events are
    /// handled in the background until [`Debugger::detach`] or process exit.
    pub fn attach(&mut self) -> Result<(), DebugError> {
        let pid = self.pid();
        self.reap_finished();
        if self.session.is_some() {
            return Err(DebugError::AlreadyAttached { pid });
        }
        if self.target.has_exited() {
            return Err(DebugError::ProcessNotFound {
                pid,
                reason: "process has exited".into(),
            });
        }
        if self.target.is_being_debugged()? {
            return Err(DebugError::AlreadyBeingDebugged { pid });
        }

        let cancel = CancelToken::new();
        let pump = Pump::new(
            Arc::clone(&self.target),
            self.breakpoints.clone(),
            cancel.clone(),
            Arc::clone(&self.hook),
            Arc::clone(&self.notices),
            Arc::clone(&self.status),
            self.config.event_timeout,
            self.config.kill_on_exit,
        );

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name(format!("debug-pump-{}", pid))
            .spawn(move || pump.start(ready_tx))
            .map_err(|e| DebugError::AttachFailed {
                pid,
                reason: format!("failed to spawn event pump: {}", e),
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.session = Some(Running { handle, cancel });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(DebugError::AttachFailed {
                    pid,
                    reason: "event pump exited before attaching".into(),
                })
            }
        }
    }

    /// Attach and block until the session ends
    pub fn attach_and_wait(&mut self) -> Result<DetachReport, DebugError> {
        self.attach()?;
        self.wait()
    }

    /// Block until the running session ends on its own or is cancelled
    pub fn wait(&mut self) -> Result<DetachReport, DebugError> {
        let running = self
            .session
            .take()
            .ok_or(DebugError::NotAttached { pid: self.pid() })?;
        running
            .handle
            .join()
            .map_err(|_| DebugError::Event("event pump panicked".into()))?
    }

    /// Ask the pump to detach; returns immediately
    pub fn cancel(&self) {
        if let Some(running) = &self.session {
            running.cancel.cancel();
        }
    }

    /// Token that cancels the current session from another thread
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.session.as_ref().map(|running| running.cancel.clone())
    }

    /// Restore every breakpoint and release the target
    pub fn detach(&mut self) -> Result<DetachReport, DebugError> {
        self.reap_finished();
        self.cancel();
        self.wait()
    }

    /// Detach if needed and release the process handle
    pub fn dispose(mut self) -> Result<Option<DetachReport>, DebugError> {
        self.reap_finished();
        if self.session.is_none() {
            return Ok(None);
        }
        self.detach().map(Some)
    }

    /// Drop a session whose pump already ended (process exit, port failure)
    fn reap_finished(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|running| running.handle.is_finished())
        {
            if let Ok(report) = self.wait() {
                log::debug!("Session for process {} ended: {:?}", report.pid, report.reason);
            }
        }
    }

    pub fn modules(&self) -> Result<Vec<ModuleInfo>, DebugError> {
        self.target.modules()
    }

    pub fn threads(&self) -> Result<Vec<u32>, DebugError> {
        self.target.threads()
    }

    pub fn find_module(&self, name: &str) -> Result<ModuleInfo, DebugError> {
        let modules = self.target.modules()?;
        resolver::find_module(&modules, name)
            .cloned()
            .ok_or_else(|| ResolveError::ModuleNotFound(name.to_string()).into())
    }

    /// Resolve an address expression such as `"app.exe"+0x1000+0x10`
    pub fn resolve(&self, expression: &str) -> Result<u64, DebugError> {
        let expression: AddressExpression = expression.parse()?;
        self.resolve_expression(&expression)
    }

    pub fn resolve_expression(&self, expression: &AddressExpression) -> Result<u64, DebugError> {
        let modules = match expression.module {
            Some(_) => self.target.modules()?,
            None => Vec::new(),
        };
        Ok(resolver::resolve(self.target.as_ref(), &modules, expression)?)
    }

    /// First address of `pattern` in the named module
    pub fn seek(&self, module: &str, pattern: &[u8]) -> Result<Option<u64>, DebugError> {
        let module = self.find_module(module)?;
        Ok(resolver::seek(self.target.as_ref(), &module, pattern)?)
    }

    /// Resolve `expression` and register a breakpoint there
    pub fn add_breakpoint(
        &self,
        expression: &str,
        handler: impl FnMut(&mut BreakpointHit) + Send + 'static,
    ) -> Result<Arc<Breakpoint>, DebugError> {
        let address = self.resolve(expression)?;
        Ok(self.breakpoints.add(address, handler)?)
    }
}

impl<T: RemoteHost> Debugger<T> {
    pub fn allocate(&self, size: usize, hint: Option<u64>) -> Option<u64> {
        self.target.allocate(size, hint)
    }

    pub fn free(&self, address: u64) -> bool {
        self.target.free(address)
    }

    pub fn create_remote_thread(
        &self,
        entry: u64,
        parameter: u64,
        timeout: Duration,
    ) -> Result<RemoteThreadExit, DebugError> {
        self.target.create_remote_thread(entry, parameter, timeout)
    }

    /// Load `path` into the target; returns the module base
    pub fn inject_library(&self, path: &str, timeout: Duration) -> Result<u64, DebugError> {
        remote::inject_library(self.target.as_ref(), path, timeout)
    }

    /// Call an export of a library already loaded at `module_base` in the target
    pub fn execute_remote_function(
        &self,
        library_path: &str,
        module_base: u64,
        function: &str,
        parameter: u64,
        timeout: Duration,
    ) -> Result<RemoteThreadExit, DebugError> {
        remote::execute_remote_function(
            self.target.as_ref(),
            library_path,
            module_base,
            function,
            parameter,
            timeout,
        )
    }
}

impl<T: Target> Drop for Debugger<T> {
    fn drop(&mut self) {
        if self.session.is_some() {
            match self.detach() {
                Ok(report) if !report.is_clean() => {
                    log::warn!("Detach on drop left failures: {:?}", report.failures)
                }
                Ok(_) => {}
                Err(e) => log::warn!("Detach on drop failed: {}", e),
            }
        }
    }
}
