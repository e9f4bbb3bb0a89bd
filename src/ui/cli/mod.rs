//! CLI - reedline-based REPL interface
//!
//! Drives a [`Debugger`] over the platform backend. Breakpoints set here log
//! each hit; session notices are printed before every prompt.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use reedline::{Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline, Signal};
use std::borrow::Cow;
use std::sync::mpsc::Receiver;

use trapdoor::app::{parse_command, AppCommand, ProcessRef};
use trapdoor::core::{Debugger, MemoryExt, SessionConfig};
use trapdoor::debug::breakpoint::BreakpointHit;
use trapdoor::debug::types::{SessionNotice, SessionStatus};
use trapdoor::debug::{enumerate_processes, PlatformTarget};

/// Prompt showing the current process and session state
pub struct TrapdoorPrompt {
    pid: Option<u32>,
    attached: bool,
}

impl TrapdoorPrompt {
    fn new() -> Self {
        Self {
            pid: None,
            attached: false,
        }
    }
}

impl Prompt for TrapdoorPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        let status = if self.attached { "dbg" } else { "---" };
        match self.pid {
            Some(pid) => Cow::Owned(format!("[{}:{}]", status, pid)),
            None => Cow::Owned(format!("[{}]", status)),
        }
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("> ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("... ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "(failed) ",
        };
        Cow::Owned(format!("(search: {}{}) ", prefix, history_search.term))
    }
}

/// REPL state: at most one debugger, kept across detach so breakpoints survive
pub struct Console {
    config: SessionConfig,
    debugger: Option<Debugger<PlatformTarget>>,
    notices: Option<Receiver<SessionNotice>>,
}

impl Console {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            debugger: None,
            notices: None,
        }
    }

    /// Open a process without attaching
    pub fn open(&mut self, process: &ProcessRef) -> Result<()> {
        let target = match process {
            ProcessRef::Pid(pid) => PlatformTarget::open(*pid)?,
            ProcessRef::Name(name) => PlatformTarget::open_by_name(name)?,
        };

        // Dropping the old debugger detaches it.
        self.debugger = None;
        let debugger = Debugger::with_config(target, self.config.clone());
        self.notices = Some(debugger.subscribe());
        println!("[*] Opened process {}", debugger.pid());
        self.debugger = Some(debugger);
        Ok(())
    }

    fn debugger(&self) -> Result<&Debugger<PlatformTarget>> {
        self.debugger
            .as_ref()
            .context("no process selected; use 'attach <pid|name>'")
    }

    fn debugger_mut(&mut self) -> Result<&mut Debugger<PlatformTarget>> {
        self.debugger
            .as_mut()
            .context("no process selected; use 'attach <pid|name>'")
    }

    /// Print notices the pump published since the last prompt
    pub fn drain_notices(&self) {
        let Some(notices) = &self.notices else { return };
        for notice in notices.try_iter() {
            match notice {
                SessionNotice::Attached { pid } => {
                    println!("{} Attached to {}", "[+]".green(), pid);
                }
                SessionNotice::Detached { pid, failures } => {
                    println!("{} Detached from {}", "[*]".cyan(), pid);
                    for failure in failures {
                        println!("    {} {}", "!".yellow(), failure);
                    }
                }
                SessionNotice::ProcessExited { pid, exit_code } => {
                    println!("{} Process {} exited with code {}", "[*]".cyan(), pid, exit_code);
                }
                SessionNotice::DispatchFailed {
                    tid,
                    address,
                    error,
                    ..
                } => {
                    let at = address.map(|a| format!(" at {:#x}", a)).unwrap_or_default();
                    println!("{} Thread {}{}: {}", "[!]".red(), tid, at, error);
                }
            }
        }
    }

    /// Run one command; `Ok(false)` means quit
    pub fn execute(&mut self, cmd: AppCommand) -> Result<bool> {
        match cmd {
            AppCommand::Attach(Some(process)) => {
                self.open(&process)?;
                self.debugger_mut()?.attach()?;
            }
            AppCommand::Attach(None) => {
                self.debugger_mut()?.attach()?;
            }
            AppCommand::Detach => {
                let report = self.debugger_mut()?.detach()?;
                if !report.is_clean() {
                    println!("{} Detached with {} failure(s)", "[!]".yellow(), report.failures.len());
                }
            }

            AppCommand::BreakpointSet(expression) => {
                let debugger = self.debugger()?;
                let breakpoint = debugger.add_breakpoint(&expression, log_hit)?;
                let state = if breakpoint.is_enabled() { "armed" } else { "pending attach" };
                println!(
                    "[*] Breakpoint at {:#x} ({}, original byte {:02x})",
                    breakpoint.address(),
                    state,
                    breakpoint.original_byte()
                );
            }
            AppCommand::BreakpointClear(expression) => {
                let debugger = self.debugger()?;
                let address = debugger.resolve(&expression)?;
                if debugger.breakpoints().remove(address)? {
                    println!("[*] Breakpoint at {:#x} removed", address);
                } else {
                    println!("{} No breakpoint at {:#x}", "[!]".yellow(), address);
                }
            }
            AppCommand::BreakpointClearAll => {
                if let Err(failures) = self.debugger()?.breakpoints().clear() {
                    for (address, error) in failures.0 {
                        println!("    {} {:#x}: {}", "!".yellow(), address, error);
                    }
                }
            }
            AppCommand::BreakpointList => {
                let entries = self.debugger()?.breakpoints().entries();
                if entries.is_empty() {
                    println!("    {}", "(no breakpoints)".dimmed());
                }
                for (address, breakpoint) in entries {
                    let state = if breakpoint.is_enabled() {
                        format!("{:<8}", "enabled").green()
                    } else if breakpoint.is_armed() {
                        format!("{:<8}", "armed").yellow()
                    } else {
                        format!("{:<8}", "disabled").dimmed()
                    };
                    println!(
                        "    {:#018x}  {}  orig {:02x}",
                        address,
                        state,
                        breakpoint.original_byte()
                    );
                }
            }

            AppCommand::Examine { expression, len } => {
                let debugger = self.debugger()?;
                let address = debugger.resolve(&expression)?;
                let bytes = debugger.target().read(address, len)?;
                print!("{}", hexdump(address, &bytes));
            }
            AppCommand::Write { expression, bytes } => {
                let debugger = self.debugger()?;
                let address = debugger.resolve(&expression)?;
                debugger.target().write(address, &bytes)?;
                println!("[*] Wrote {} byte(s) at {:#x}", bytes.len(), address);
            }
            AppCommand::Resolve(expression) => {
                let address = self.debugger()?.resolve(&expression)?;
                println!("{:#x}", address);
            }
            AppCommand::Seek { module, pattern } => {
                match self.debugger()?.seek(&module, &pattern)? {
                    Some(address) => println!("{:#x}", address),
                    None => println!("{} Pattern not found in {}", "[!]".yellow(), module),
                }
            }

            AppCommand::Modules => {
                for module in self.debugger()?.modules()? {
                    println!(
                        "    {:#018x}  {:>10x}  {}",
                        module.base_address,
                        module.size,
                        module.path.as_deref().unwrap_or(&module.name)
                    );
                }
            }
            AppCommand::Threads => {
                for tid in self.debugger()?.threads()? {
                    println!("    {}", tid);
                }
            }
            AppCommand::Processes => {
                for process in enumerate_processes() {
                    println!("    {:>7}  {}", process.pid, process.name);
                }
            }

            cmd @ (AppCommand::Alloc(_)
            | AppCommand::Free(_)
            | AppCommand::Inject(_)
            | AppCommand::Call { .. }) => execute_remote(self.debugger()?, cmd)?,

            AppCommand::Help => print_help(),
            AppCommand::Quit => return Ok(false),
            AppCommand::Invalid(reason) => {
                println!("{} {}", "[!]".red(), reason);
            }
            AppCommand::Unknown(input) => {
                println!("{} Unknown command: '{}'", "[!]".red(), input);
                println!("    Type '?' for help");
            }
        }
        Ok(true)
    }

    fn prompt_state(&self, prompt: &mut TrapdoorPrompt) {
        prompt.pid = self.debugger.as_ref().map(|d| d.pid());
        prompt.attached = self
            .debugger
            .as_ref()
            .is_some_and(|d| d.status() == SessionStatus::Attached);
    }
}

/// Handler installed by `bp`: log the hit and keep going
fn log_hit(hit: &mut BreakpointHit) {
    println!(
        "\n{} {:#x} hit by thread {} (rsp {:#x})",
        "[bp]".magenta(),
        hit.address,
        hit.tid,
        hit.context.rsp
    );
}

#[cfg(target_os = "windows")]
fn execute_remote(debugger: &Debugger<PlatformTarget>, cmd: AppCommand) -> Result<()> {
    use std::time::Duration;
    use trapdoor::debug::types::RemoteThreadExit;

    // Remote threads still running after this are reported, not awaited.
    const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

    match cmd {
        AppCommand::Alloc(size) => match debugger.allocate(size, None) {
            Some(address) => println!("[*] Allocated {} byte(s) at {:#x}", size, address),
            None => bail!("allocation of {} bytes failed", size),
        },
        AppCommand::Free(address) => {
            if !debugger.free(address) {
                bail!("could not free {:#x}", address);
            }
            println!("[*] Freed {:#x}", address);
        }
        AppCommand::Inject(path) => {
            let base = debugger.inject_library(&path, REMOTE_TIMEOUT)?;
            println!("[*] {} loaded at {:#x}", path, base);
        }
        AppCommand::Call {
            library,
            function,
            parameter,
        } => {
            let name = std::path::Path::new(&library)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| library.clone());
            let module = debugger.find_module(&name)?;
            match debugger.execute_remote_function(
                &library,
                module.base_address,
                &function,
                parameter,
                REMOTE_TIMEOUT,
            )? {
                RemoteThreadExit::Finished(code) => {
                    println!("[*] {} returned {:#x}", function, code);
                }
                RemoteThreadExit::StillRunning => {
                    println!("{} {} still running after {:?}", "[!]".yellow(), function, REMOTE_TIMEOUT);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn execute_remote(_debugger: &Debugger<PlatformTarget>, _cmd: AppCommand) -> Result<()> {
    bail!("remote execution is only available on Windows")
}

/// Classic 16-bytes-per-row dump with an ASCII column
pub fn hexdump(base: u64, bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex_bytes: Vec<String> = chunk.iter().map(|b| hex::encode([*b])).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!(
            "{:#018x}  {:<47}  {}\n",
            base + (row as u64) * 16,
            hex_bytes.join(" "),
            ascii
        ));
    }
    out
}

/// Print the help message
fn print_help() {
    println!("{}", "Trapdoor CLI Commands".bold().cyan());
    println!("{}", "═".repeat(50).cyan());

    println!("\n{}", "Session:".bold().yellow());
    println!("  {}  Open and attach", "attach <pid|name>".green());
    println!("  {}             Re-attach to the current process", "attach".green());
    println!("  {}             Detach, keeping breakpoints", "detach".green());

    println!("\n{}", "Breakpoints:".bold().yellow());
    println!("  {}        Log hits at an address", "bp <expr>".green());
    println!("  {}  Remove one or all", "bc <expr> | bc *".green());
    println!("  {}                 List", "bl".green());

    println!("\n{}", "Memory:".bold().yellow());
    println!("  {}   Hex dump", "x <expr> [len]".green());
    println!("  {}    Write bytes", "w <expr> <hex>".green());
    println!("  {}   Evaluate an expression", "resolve <expr>".green());
    println!("  {}  Find a byte pattern", "seek <mod> <hex>".green());

    println!("\n{}", "Process:".bold().yellow());
    println!("  {}  Modules / threads / processes", "mods | threads | ps".green());

    println!("\n{}", "Remote (Windows):".bold().yellow());
    println!("  {}       Allocate RWX memory", "alloc <size>".green());
    println!("  {}      Release it", "free <addr>".green());
    println!("  {}     Load a library", "inject <path>".green());
    println!("  {}  Run an export", "call <path> <export> [arg]".green());

    println!("\n{}", "Expressions:".bold().yellow());
    println!("  {}", "0x401000   \"app.exe\"+1000   \"app.exe\"+0x20+0x8-0x4".dimmed());

    println!("\n{}", "Other:".bold().yellow());
    println!("  {}            Show this help", "?".green());
    println!("  {}            Quit", "q".green());
}

/// Run the CLI REPL, optionally opening (and attaching to) a process first
pub fn run_cli(config: SessionConfig, initial: Option<ProcessRef>, attach: bool) -> Result<()> {
    let mut line_editor = Reedline::create();
    let mut prompt = TrapdoorPrompt::new();
    let mut console = Console::new(config);

    println!(
        "{}",
        "╔══════════════════════════════════════════════════════════════╗".cyan()
    );
    println!(
        "{}",
        "║  Trapdoor CLI - Type '?' for help, 'q' to quit               ║".cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════════════════════════╝".cyan()
    );

    if let Some(process) = initial {
        console.open(&process)?;
        if attach {
            console.debugger_mut()?.attach()?;
        }
    }

    loop {
        console.drain_notices();
        console.prompt_state(&mut prompt);

        let sig = line_editor.read_line(&prompt)?;
        match sig {
            Signal::Success(buffer) => {
                let input = buffer.trim();
                if input.is_empty() {
                    continue;
                }

                match console.execute(parse_command(input)) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("{} {:#}", "[!]".red(), e),
                }
            }
            Signal::CtrlD | Signal::CtrlC => {
                println!("\n[*] Interrupted");
                break;
            }
        }
    }

    if let Some(debugger) = console.debugger.take() {
        if let Some(report) = debugger.dispose()? {
            log::info!("Detached from {} on exit: {:?}", report.pid, report.reason);
        }
    }
    println!("[*] Shutting down...");
    Ok(())
}
