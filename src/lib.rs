//! Trapdoor - live process instrumentation
//!
//! Software breakpoints with a transparent hit/retrap cycle, typed access to
//! target memory, address expressions and remote code execution.

pub mod app;
pub mod core;
pub mod debug;
