//! Trapdoor - live process instrumentation
//!
//! Entry point that handles CLI argument parsing and starts the REPL,
//! optionally opening or attaching to a target first.

#[cfg(all(target_arch = "x86_64", any(target_os = "windows", target_os = "linux")))]
mod ui;

use clap::Parser;
use std::time::Duration;

use trapdoor::app::ProcessRef;
use trapdoor::core::SessionConfig;

/// Trapdoor: breakpoints, memory access and remote execution in a live process
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target process ID
    #[arg(short, long, conflicts_with = "name")]
    pid: Option<u32>,

    /// Target process image name, e.g. notepad.exe
    #[arg(short, long)]
    name: Option<String>,

    /// Attach right away instead of only opening the process
    #[arg(short, long, default_value_t = false)]
    attach: bool,

    /// How long the event pump blocks per wait before checking for cancellation
    #[arg(long, default_value_t = 1000)]
    event_timeout_ms: u64,

    /// Kill the target if the debugger goes away without detaching
    #[arg(long, default_value_t = false)]
    kill_on_exit: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn process(&self) -> Option<ProcessRef> {
        match (&self.pid, &self.name) {
            (Some(pid), _) => Some(ProcessRef::Pid(*pid)),
            (None, Some(name)) => Some(ProcessRef::Name(name.clone())),
            (None, None) => None,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            event_timeout: Duration::from_millis(self.event_timeout_ms.max(1)),
            kill_on_exit: self.kill_on_exit,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level; RUST_LOG wins
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    log::info!("Trapdoor initialized");
    log::debug!("Arguments: {:?}", args);

    if args.attach && args.process().is_none() {
        anyhow::bail!("--attach needs --pid or --name");
    }

    println!("[*] Trapdoor v{}", env!("CARGO_PKG_VERSION"));
    run(&args)
}

#[cfg(all(target_arch = "x86_64", any(target_os = "windows", target_os = "linux")))]
fn run(args: &Args) -> anyhow::Result<()> {
    ui::cli::run_cli(args.session_config(), args.process(), args.attach)
}

#[cfg(not(all(target_arch = "x86_64", any(target_os = "windows", target_os = "linux"))))]
fn run(_args: &Args) -> anyhow::Result<()> {
    anyhow::bail!("no debugging backend for this platform")
}
