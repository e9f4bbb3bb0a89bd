//! `/proc` parsing for the ptrace backend.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::super::types::{ModuleInfo, ProcessInfo};

/// Group file-backed mappings of `/proc/<pid>/maps` into one module per path
pub fn parse_maps(text: &str) -> Vec<ModuleInfo> {
    let mut spans: BTreeMap<&str, (u64, u64)> = BTreeMap::new();

    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else { continue };
        // perms, offset, dev, inode
        let path = fields.nth(4).unwrap_or("");
        if !path.starts_with('/') {
            continue;
        }
        let Some((start, end)) = range.split_once('-') else { continue };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };

        let span = spans.entry(path).or_insert((start, end));
        span.0 = span.0.min(start);
        span.1 = span.1.max(end);
    }

    let mut modules: Vec<ModuleInfo> = spans
        .into_iter()
        .map(|(path, (start, end))| ModuleInfo {
            name: Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string()),
            path: Some(path.to_string()),
            base_address: start,
            size: end - start,
        })
        .collect();
    modules.sort_by_key(|m| m.base_address);
    modules
}

/// `TracerPid` from `/proc/<pid>/status`
pub fn parse_tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

/// Is the `State:` line of `/proc/<pid>/status` a zombie or dead task?
pub fn parse_is_dead(status: &str) -> bool {
    status
        .lines()
        .find_map(|line| line.strip_prefix("State:"))
        .map(|value| matches!(value.trim().chars().next(), Some('Z') | Some('X')))
        .unwrap_or(false)
}

pub fn read_modules(pid: u32) -> std::io::Result<Vec<ModuleInfo>> {
    Ok(parse_maps(&fs::read_to_string(format!("/proc/{}/maps", pid))?))
}

pub fn read_status(pid: u32) -> std::io::Result<String> {
    fs::read_to_string(format!("/proc/{}/status", pid))
}

pub fn read_threads(pid: u32) -> std::io::Result<Vec<u32>> {
    let mut threads: Vec<u32> = fs::read_dir(format!("/proc/{}/task", pid))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    threads.sort_unstable();
    Ok(threads)
}

pub fn read_name(pid: u32) -> Option<String> {
    fs::read_to_string(format!("/proc/{}/comm", pid))
        .ok()
        .map(|name| name.trim_end().to_string())
}

/// ELF class byte of the executable: 1 for 32-bit, 2 for 64-bit
pub fn read_elf_class(pid: u32) -> Option<u8> {
    use std::io::Read;

    let mut header = [0u8; 5];
    fs::File::open(format!("/proc/{}/exe", pid))
        .and_then(|mut file| file.read_exact(&mut header))
        .ok()?;
    (&header[..4] == b"\x7fELF").then_some(header[4])
}

/// Enumerate all running processes
pub fn enumerate_processes() -> Vec<ProcessInfo> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut processes: Vec<ProcessInfo> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .map(|pid| ProcessInfo {
            pid,
            name: read_name(pid).unwrap_or_else(|| format!("<PID {}>", pid)),
        })
        .collect();

    processes.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    processes
}
