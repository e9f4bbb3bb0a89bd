//! Command processing
//!
//! Parses console input into [`AppCommand`]s. Execution lives in the UI.

/// How the user named a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessRef {
    Pid(u32),
    Name(String),
}

/// Application commands that can be executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    /// Attach to a process, or re-attach to the current one
    Attach(Option<ProcessRef>),
    /// Detach, keeping registered breakpoints
    Detach,
    /// Register a logging breakpoint at an address expression
    BreakpointSet(String),
    /// Remove the breakpoint at an address expression
    BreakpointClear(String),
    /// Remove every breakpoint
    BreakpointClearAll,
    BreakpointList,
    /// Dump `len` bytes at an address expression
    Examine { expression: String, len: usize },
    /// Write raw bytes at an address expression
    Write { expression: String, bytes: Vec<u8> },
    /// Evaluate an address expression
    Resolve(String),
    /// Search a module for a byte pattern
    Seek { module: String, pattern: Vec<u8> },
    Modules,
    Threads,
    Processes,
    /// Allocate executable memory in the target
    Alloc(usize),
    /// Release memory from [`AppCommand::Alloc`]
    Free(u64),
    /// Load a library into the target
    Inject(String),
    /// Run an export of an injected library on a remote thread
    Call {
        library: String,
        function: String,
        parameter: u64,
    },
    /// Show help
    Help,
    /// Quit application
    Quit,
    /// Known command with bad arguments
    Invalid(String),
    /// Unknown command
    Unknown(String),
}

pub const DEFAULT_DUMP_LEN: usize = 64;

/// Parse a command string into AppCommand
pub fn parse_command(input: &str) -> AppCommand {
    let input = input.trim();
    let args = split_args(input);
    let Some((cmd, args)) = args.split_first() else {
        return AppCommand::Unknown(String::new());
    };

    match cmd.as_str() {
        "attach" | "a" => match args.first() {
            None => AppCommand::Attach(None),
            Some(target) => match target.parse() {
                Ok(pid) => AppCommand::Attach(Some(ProcessRef::Pid(pid))),
                Err(_) => AppCommand::Attach(Some(ProcessRef::Name(unquote(target).to_string()))),
            },
        },
        "detach" | "d" => AppCommand::Detach,

        "bp" | "b" if !args.is_empty() => AppCommand::BreakpointSet(args.concat()),
        "bp" | "b" => AppCommand::Invalid("usage: bp <expression>".into()),
        "bc" => match args.concat().as_str() {
            "" => AppCommand::Invalid("usage: bc <expression> | bc *".into()),
            "*" => AppCommand::BreakpointClearAll,
            expression => AppCommand::BreakpointClear(expression.to_string()),
        },
        "bl" => AppCommand::BreakpointList,

        "x" => {
            let Some(expression) = args.first() else {
                return AppCommand::Invalid("usage: x <expression> [len]".into());
            };
            let len = match args.get(1) {
                None => DEFAULT_DUMP_LEN,
                Some(len) => match parse_number(len) {
                    Some(len) if len > 0 => len as usize,
                    _ => return AppCommand::Invalid(format!("bad length '{}'", len)),
                },
            };
            AppCommand::Examine {
                expression: expression.clone(),
                len,
            }
        }
        "w" => {
            let Some(expression) = args.first() else {
                return AppCommand::Invalid("usage: w <expression> <hex bytes>".into());
            };
            match parse_hex_bytes(&args[1..]) {
                Ok(bytes) => AppCommand::Write {
                    expression: expression.clone(),
                    bytes,
                },
                Err(reason) => AppCommand::Invalid(reason),
            }
        }
        "resolve" | "r" if !args.is_empty() => AppCommand::Resolve(args.concat()),
        "resolve" | "r" => AppCommand::Invalid("usage: resolve <expression>".into()),
        "seek" | "s" => {
            let Some(module) = args.first() else {
                return AppCommand::Invalid("usage: seek <module> <hex pattern>".into());
            };
            match parse_hex_bytes(&args[1..]) {
                Ok(pattern) => AppCommand::Seek {
                    module: unquote(module).to_string(),
                    pattern,
                },
                Err(reason) => AppCommand::Invalid(reason),
            }
        }

        "mods" | "lm" => AppCommand::Modules,
        "threads" | "t" => AppCommand::Threads,
        "ps" => AppCommand::Processes,

        "alloc" => match args.first().and_then(|size| parse_number(size)) {
            Some(size) if size > 0 => AppCommand::Alloc(size as usize),
            _ => AppCommand::Invalid("usage: alloc <size>".into()),
        },
        "free" => match args.first().and_then(|address| parse_number(address)) {
            Some(address) => AppCommand::Free(address),
            None => AppCommand::Invalid("usage: free <address>".into()),
        },
        "inject" => match args.first() {
            Some(path) => AppCommand::Inject(unquote(path).to_string()),
            None => AppCommand::Invalid("usage: inject <library path>".into()),
        },
        "call" => {
            let (Some(library), Some(function)) = (args.first(), args.get(1)) else {
                return AppCommand::Invalid("usage: call <library path> <export> [parameter]".into());
            };
            let parameter = match args.get(2) {
                None => 0,
                Some(value) => match parse_number(value) {
                    Some(value) => value,
                    None => return AppCommand::Invalid(format!("bad parameter '{}'", value)),
                },
            };
            AppCommand::Call {
                library: unquote(library).to_string(),
                function: function.clone(),
                parameter,
            }
        }

        "help" | "?" => AppCommand::Help,
        "quit" | "exit" | "q" => AppCommand::Quit,
        _ => AppCommand::Unknown(input.to_string()),
    }
}

/// Parse an address or size: `0x` prefix for hex, decimal otherwise
pub fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Join the remaining arguments and decode them as hex (`48 8b c4` or `488bc4`)
fn parse_hex_bytes(args: &[String]) -> Result<Vec<u8>, String> {
    let joined: String = args.concat();
    if joined.is_empty() {
        return Err("expected hex bytes".into());
    }
    hex::decode(&joined).map_err(|e| format!("bad hex '{}': {}", joined, e))
}

/// Split on whitespace, keeping double-quoted runs (quotes included) together
fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}
