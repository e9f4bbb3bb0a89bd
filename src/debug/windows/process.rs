//! Process enumeration using Windows API.

use super::super::types::ProcessInfo;
use super::OwnedHandle;

use windows::Win32::Foundation::{HANDLE, MAX_PATH};
use windows::Win32::System::ProcessStatus::{EnumProcesses, GetModuleBaseNameW};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

/// Enumerate all running processes
pub fn enumerate_processes() -> Vec<ProcessInfo> {
    let mut processes = Vec::new();
    let mut pids: [u32; 4096] = [0; 4096];
    let mut bytes_returned: u32 = 0;

    unsafe {
        // Get list of all PIDs
        if EnumProcesses(
            pids.as_mut_ptr(),
            (pids.len() * std::mem::size_of::<u32>()) as u32,
            &mut bytes_returned,
        )
        .is_err()
        {
            return processes;
        }
    }

    let count = bytes_returned as usize / std::mem::size_of::<u32>();
    for &pid in pids.iter().take(count).filter(|&&pid| pid != 0) {
        // Skip processes we can't access
        let Ok(handle) = (unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) })
        else {
            continue;
        };
        let handle = OwnedHandle(handle);
        let name = process_name(handle.raw()).unwrap_or_else(|| format!("<PID {}>", pid));
        processes.push(ProcessInfo { pid, name });
    }

    // Sort by name
    processes.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    processes
}

/// Find a process by image name, e.g. `notepad.exe` (case-insensitive)
pub fn find_process_by_name(name: &str) -> Option<ProcessInfo> {
    enumerate_processes()
        .into_iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Get process name from handle
fn process_name(handle: HANDLE) -> Option<String> {
    let mut name_buf = [0u16; MAX_PATH as usize];
    let len = unsafe { GetModuleBaseNameW(handle, None, &mut name_buf) };
    if len == 0 {
        return None;
    }
    Some(String::from_utf16_lossy(&name_buf[..len as usize]))
}
