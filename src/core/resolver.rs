//! Address Resolver - symbolic addresses and byte-pattern search
//!
//! Expressions look like `"game.exe"+0x1A2B+0x10-8`: an optional quoted module
//! name followed by signed hexadecimal offsets. The first offset is added to
//! the module base (or is itself the base when no module is named); every
//! following offset dereferences a pointer first.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::core::memory::{MemoryError, MemoryExt, ProcessMemory};
use crate::debug::types::ModuleInfo;

/// Bytes read per step while scanning a module
const SEEK_CHUNK: usize = 0x1000;

/// Address resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Invalid address expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Invalid base address")]
    InvalidBaseAddress,

    #[error("Search pattern is empty")]
    EmptyPattern,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

fn offset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\+|-)?(?:0[xX])?([0-9a-fA-F]{1,8})").unwrap_or_else(|e| {
            unreachable!("offset pattern is a valid regex: {e}")
        })
    })
}

/// A parsed `"module"+offset+offset...` expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressExpression {
    pub module: Option<String>,
    /// Added to the module base, or the absolute base without a module
    pub base_offset: i64,
    /// Applied after dereferencing, left to right
    pub offsets: Vec<i64>,
}

impl AddressExpression {
    pub fn absolute(address: u64) -> Self {
        Self {
            module: None,
            base_offset: address as i64,
            offsets: Vec::new(),
        }
    }

    pub fn in_module(module: impl Into<String>, base_offset: i64) -> Self {
        Self {
            module: Some(module.into()),
            base_offset,
            offsets: Vec::new(),
        }
    }

    pub fn then(mut self, offset: i64) -> Self {
        self.offsets.push(offset);
        self
    }
}

impl FromStr for AddressExpression {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ResolveError::InvalidExpression {
            expression: s.to_string(),
            reason: reason.to_string(),
        };

        let text: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let (module, rest) = match text.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted
                    .find('"')
                    .ok_or_else(|| invalid("could not find matching \""))?;
                let name = &quoted[..end];
                if name.is_empty() {
                    return Err(invalid("empty module name"));
                }
                (Some(name.to_string()), &quoted[end + 1..])
            }
            None => (None, text.as_str()),
        };

        let mut values = Vec::new();
        let mut cursor = 0;
        for captures in offset_pattern().captures_iter(rest) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            if whole.start() != cursor {
                return Err(invalid(&format!("unexpected '{}'", &rest[cursor..whole.start()])));
            }
            // The first token after a module must carry an explicit sign.
            let sign = captures.get(1).map(|m| m.as_str());
            if sign.is_none() && (module.is_some() || !values.is_empty()) {
                return Err(invalid("offsets must be joined with '+' or '-'"));
            }
            let digits = captures.get(2).map_or("", |m| m.as_str());
            let magnitude =
                i64::from_str_radix(digits, 16).map_err(|e| invalid(&e.to_string()))?;
            values.push(if sign == Some("-") { -magnitude } else { magnitude });
            cursor = whole.end();
        }
        if cursor != rest.len() {
            return Err(invalid(&format!("unexpected '{}'", &rest[cursor..])));
        }

        let mut values = values.into_iter();
        let base_offset = match (values.next(), &module) {
            (Some(value), _) => value,
            (None, Some(_)) => 0,
            (None, None) => return Err(invalid("no address given")),
        };

        Ok(Self {
            module,
            base_offset,
            offsets: values.collect(),
        })
    }
}

impl fmt::Display for AddressExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn signed(f: &mut fmt::Formatter<'_>, value: i64) -> fmt::Result {
            if value < 0 {
                write!(f, "-{:#x}", value.unsigned_abs())
            } else {
                write!(f, "+{:#x}", value)
            }
        }

        match &self.module {
            Some(module) => {
                write!(f, "\"{}\"", module)?;
                signed(f, self.base_offset)?;
            }
            None => write!(f, "{:#x}", self.base_offset)?,
        }
        for offset in &self.offsets {
            signed(f, *offset)?;
        }
        Ok(())
    }
}

/// Case-insensitive lookup of a loaded module by file name
pub fn find_module<'a>(modules: &'a [ModuleInfo], name: &str) -> Option<&'a ModuleInfo> {
    modules.iter().find(|m| m.name.eq_ignore_ascii_case(name))
}

/// Resolve an expression against the target's current memory.
///
/// Every call reads the pointer chain afresh.
pub fn resolve<M: ProcessMemory + ?Sized>(
    memory: &M,
    modules: &[ModuleInfo],
    expression: &AddressExpression,
) -> Result<u64, ResolveError> {
    let base = match &expression.module {
        Some(name) => {
            let module = find_module(modules, name)
                .ok_or_else(|| ResolveError::ModuleNotFound(name.clone()))?;
            module.base_address.wrapping_add_signed(expression.base_offset)
        }
        None => expression.base_offset as u64,
    };
    if base == 0 {
        return Err(ResolveError::InvalidBaseAddress);
    }

    let mut address = base;
    for offset in &expression.offsets {
        address = memory.read_pointer(address)?.wrapping_add_signed(*offset);
    }
    log::trace!("Resolved {} to {:#x}", expression, address);
    Ok(address)
}

/// Find the first occurrence of `pattern` inside a module's mapped range.
///
/// Pages that cannot be read are skipped. Returns `None` when the pattern
/// does not occur.
pub fn seek<M: ProcessMemory + ?Sized>(
    memory: &M,
    module: &ModuleInfo,
    pattern: &[u8],
) -> Result<Option<u64>, ResolveError> {
    if pattern.is_empty() {
        return Err(ResolveError::EmptyPattern);
    }
    if (pattern.len() as u64) > module.size {
        return Ok(None);
    }

    let end = module.base_address + module.size;
    let mut window: Vec<u8> = Vec::with_capacity(SEEK_CHUNK + pattern.len());
    // Address of window[0]
    let mut window_start = module.base_address;
    let mut address = module.base_address;

    while address < end {
        let len = SEEK_CHUNK.min((end - address) as usize);
        match memory.read(address, len) {
            Ok(chunk) => {
                if window.is_empty() {
                    window_start = address;
                }
                window.extend_from_slice(&chunk);
                if let Some(index) = window.windows(pattern.len()).position(|w| w == pattern) {
                    return Ok(Some(window_start + index as u64));
                }
                // Keep the tail that could still start a match.
                let keep = (pattern.len() - 1).min(window.len());
                window.drain(..window.len() - keep);
                window_start = address + len as u64 - keep as u64;
            }
            Err(e) => {
                log::trace!("Seek skipping unreadable range at {:#x}: {}", address, e);
                window.clear();
            }
        }
        address += len as u64;
    }
    Ok(None)
}
