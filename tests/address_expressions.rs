//! Integration tests for address expressions, pattern search and the
//! console grammar, driven through the public API against a sparse
//! in-memory address space.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use trapdoor::app::{parse_command, AppCommand};
use trapdoor::core::memory::{MemoryError, MemoryExt, PointerWidth, ProcessMemory};
use trapdoor::core::resolver::{self, AddressExpression, ResolveError};
use trapdoor::debug::breakpoint::Breakpoints;
use trapdoor::debug::types::ModuleInfo;

/// Pages of 0x1000 bytes; anything unmapped fails to read
struct SparseMemory {
    pages: Mutex<BTreeMap<u64, Vec<u8>>>,
    width: PointerWidth,
}

impl SparseMemory {
    fn new(width: PointerWidth) -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            width,
        }
    }

    fn map(&self, base: u64, pages: u64) {
        let mut map = self.pages.lock().unwrap();
        for page in 0..pages {
            map.insert(base + page * 0x1000, vec![0; 0x1000]);
        }
    }

    fn unmap(&self, page: u64) {
        self.pages.lock().unwrap().remove(&page);
    }
}

impl ProcessMemory for SparseMemory {
    fn read_raw(&self, address: u64, buffer: &mut [u8]) -> Result<(), MemoryError> {
        let pages = self.pages.lock().unwrap();
        for (i, byte) in buffer.iter_mut().enumerate() {
            let at = address + i as u64;
            let page = pages.get(&(at & !0xFFF)).ok_or(MemoryError::ReadFailed {
                address: at,
                reason: "unmapped".into(),
            })?;
            *byte = page[(at & 0xFFF) as usize];
        }
        Ok(())
    }

    fn write_raw(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut pages = self.pages.lock().unwrap();
        for (i, byte) in data.iter().enumerate() {
            let at = address + i as u64;
            let page = pages.get_mut(&(at & !0xFFF)).ok_or(MemoryError::WriteFailed {
                address: at,
                reason: "unmapped".into(),
            })?;
            page[(at & 0xFFF) as usize] = *byte;
        }
        Ok(())
    }

    fn pointer_width(&self) -> PointerWidth {
        self.width
    }
}

fn game_module() -> ModuleInfo {
    ModuleInfo {
        name: "Game.exe".into(),
        path: Some("C:\\Games\\Game.exe".into()),
        base_address: 0x40_0000,
        size: 0x4000,
    }
}

#[test]
fn test_pointer_chain_follows_live_memory() {
    let memory = SparseMemory::new(PointerWidth::Bits64);
    memory.map(0x40_0000, 4);
    memory.map(0x90_0000, 1);
    let modules = vec![game_module()];

    // "Game.exe"+0x1000 holds a pointer to a player struct; health at +0x20.
    memory.write_pointer(0x40_1000, 0x90_0100).unwrap();
    let expression: AddressExpression = "\"game.EXE\" + 0x1000 + 0x20".parse().unwrap();
    assert_eq!(
        resolver::resolve(&memory, &modules, &expression).unwrap(),
        0x90_0120
    );

    // The chain is re-read on every resolve.
    memory.write_pointer(0x40_1000, 0x90_0400).unwrap();
    assert_eq!(
        resolver::resolve(&memory, &modules, &expression).unwrap(),
        0x90_0420
    );
}

#[test]
fn test_thirty_two_bit_targets_read_four_byte_pointers() {
    let memory = SparseMemory::new(PointerWidth::Bits32);
    memory.map(0x40_0000, 4);
    memory.write(0x40_0010, &[0x00, 0x20, 0x40, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();

    let expression: AddressExpression = "\"Game.exe\"+10-8".parse().unwrap();
    assert_eq!(
        resolver::resolve(&memory, &[game_module()], &expression).unwrap(),
        0x40_1FF8
    );
}

#[test]
fn test_resolution_failures() {
    let memory = SparseMemory::new(PointerWidth::Bits64);
    memory.map(0x40_0000, 4);

    let missing: AddressExpression = "\"other.dll\"+0x10".parse().unwrap();
    assert!(matches!(
        resolver::resolve(&memory, &[game_module()], &missing),
        Err(ResolveError::ModuleNotFound(name)) if name == "other.dll"
    ));

    let zero: AddressExpression = "0".parse().unwrap();
    assert!(matches!(
        resolver::resolve(&memory, &[], &zero),
        Err(ResolveError::InvalidBaseAddress)
    ));

    // Dereferencing into unmapped memory surfaces the read failure.
    let dangling: AddressExpression = "0x7000+0x8".parse().unwrap();
    assert!(matches!(
        resolver::resolve(&memory, &[], &dangling),
        Err(ResolveError::Memory(_))
    ));
}

#[test]
fn test_expression_text_round_trips_through_display() {
    let expression: AddressExpression = "\"Game.exe\"+1A0-8+0x10".parse().unwrap();
    assert_eq!(expression.module.as_deref(), Some("Game.exe"));
    assert_eq!(expression.base_offset, 0x1A0);
    assert_eq!(expression.offsets, vec![-8, 0x10]);
    assert_eq!(expression.to_string(), "\"Game.exe\"+0x1a0-0x8+0x10");

    let built = AddressExpression::in_module("Game.exe", 0x1A0).then(-8).then(0x10);
    assert_eq!(built, expression);

    assert!("\"Game.exe\"+zz".parse::<AddressExpression>().is_err());
    assert!("\"Game.exe".parse::<AddressExpression>().is_err());
}

#[test]
fn test_seek_skips_unreadable_pages() {
    let memory = SparseMemory::new(PointerWidth::Bits64);
    memory.map(0x40_0000, 4);
    memory.unmap(0x40_1000);
    memory.write(0x40_2FFE, &[0x48, 0x8B, 0xC4]).unwrap();

    let module = game_module();
    assert_eq!(
        resolver::seek(&memory, &module, &[0x48, 0x8B, 0xC4]).unwrap(),
        Some(0x40_2FFE)
    );
    assert_eq!(resolver::seek(&memory, &module, &[0xDE, 0xAD, 0xBE]).unwrap(), None);
    assert!(matches!(
        resolver::seek(&memory, &module, &[]),
        Err(ResolveError::EmptyPattern)
    ));
}

#[test]
fn test_breakpoints_registered_while_detached_leave_code_alone() {
    let memory = Arc::new(SparseMemory::new(PointerWidth::Bits64));
    memory.map(0x40_0000, 4);
    memory.write(0x40_1000, &[0x55, 0x48, 0x89, 0xE5]).unwrap();

    let breakpoints = Breakpoints::new(memory.clone());
    let first = breakpoints.add(0x40_1001, |_| {}).unwrap();
    breakpoints.add(0x40_1000, |_| {}).unwrap();

    assert_eq!(first.original_byte(), 0x48);
    assert!(!first.is_enabled());
    assert_eq!(memory.read(0x40_1000, 4).unwrap(), vec![0x55, 0x48, 0x89, 0xE5]);

    let addresses: Vec<u64> = breakpoints.entries().into_iter().map(|(a, _)| a).collect();
    assert_eq!(addresses, vec![0x40_1000, 0x40_1001]);

    assert!(breakpoints.remove(0x40_1001).unwrap());
    assert!(!breakpoints.remove(0x40_1001).unwrap());
    assert_eq!(breakpoints.len(), 1);
}

#[test]
fn test_console_expressions_parse_as_address_expressions() {
    let AppCommand::BreakpointSet(text) = parse_command("bp \"Game.exe\" +0x1000 +0x20") else {
        panic!("expected a breakpoint command");
    };
    let expression: AddressExpression = text.parse().unwrap();
    assert_eq!(expression, AddressExpression::in_module("Game.exe", 0x1000).then(0x20));
}
