//! Core module - session controller and target-independent operations
//!
//! Memory access, address resolution and remote execution are written
//! against traits so they run the same on every backend.

pub mod debugger;
pub mod memory;
pub mod remote;
pub mod resolver;

// Re-export common types
pub use debugger::{DebugError, Debugger, SessionConfig};
pub use memory::{MemoryError, MemoryExt, ProcessMemory};
pub use resolver::{AddressExpression, ResolveError};
