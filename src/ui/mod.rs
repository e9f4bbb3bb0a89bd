//! UI module - Command Line Interface
//!
//! Provides the reedline-based REPL.

pub mod cli;
