//! App module - console command model
//!
//! Front-end independent command parsing; the REPL in `ui::cli` executes it.

mod commands;

pub use commands::*;
