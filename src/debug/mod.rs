//! Debug module - Dynamic instrumentation of a live process.
//!
//! Provides:
//! - Software breakpoints and their collection
//! - The debug event pump with the hit/retrap protocol
//! - Platform backends behind the [`Target`] trait

pub mod breakpoint;
pub mod session;
pub mod types;

#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub mod windows;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(test)]
mod tests;

#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub use windows::{enumerate_processes, find_process_by_name, WindowsProcess as PlatformTarget};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use linux::{enumerate_processes, find_process_by_name, LinuxProcess as PlatformTarget};

use std::time::Duration;

use crate::core::debugger::DebugError;
use crate::core::memory::ProcessMemory;
use types::{ContinueStatus, DebugEvent, ModuleInfo, ThreadContext};

/// The OS collaborator a session drives.
///
/// Memory access comes from [`ProcessMemory`]; everything here is either a
/// query about the process or a debug-port primitive. The debug-port methods
/// (`begin_debugging` through `stop_debugging`, plus thread context access)
/// are only ever called from the session's pump thread.
pub trait Target: ProcessMemory + Send + Sync + 'static {
    fn pid(&self) -> u32;

    /// Loaded modules, freshly enumerated
    fn modules(&self) -> Result<Vec<ModuleInfo>, DebugError>;

    /// IDs of the threads currently in the process
    fn threads(&self) -> Result<Vec<u32>, DebugError>;

    fn has_exited(&self) -> bool;

    /// Is some debugger (possibly another one) already attached?
    fn is_being_debugged(&self) -> Result<bool, DebugError>;

    /// Become the process's debugger. Binds the debug port to the calling thread.
    fn begin_debugging(&self, kill_on_exit: bool) -> Result<(), DebugError>;

    /// Next debug event, or `None` if none arrived within `timeout`
    fn wait_event(&self, timeout: Duration) -> Result<Option<DebugEvent>, DebugError>;

    /// Acknowledge `event` and let the reporting thread run
    fn continue_event(&self, event: &DebugEvent, status: ContinueStatus) -> Result<(), DebugError>;

    /// Release the debug port; the process keeps running
    fn stop_debugging(&self) -> Result<(), DebugError>;

    fn suspend_thread(&self, tid: u32) -> Result<(), DebugError>;

    fn resume_thread(&self, tid: u32) -> Result<(), DebugError>;

    fn get_context(&self, tid: u32) -> Result<ThreadContext, DebugError>;

    fn set_context(&self, tid: u32, context: &ThreadContext) -> Result<(), DebugError>;
}
