//! Remote execution primitives: VirtualAllocEx, CreateRemoteThread, export lookup.

use std::ffi::{c_void, CString};
use std::time::Duration;

use windows::core::{s, w, HSTRING, PCSTR};
use windows::Win32::Foundation::{FreeLibrary, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::LibraryLoader::{
    GetModuleHandleW, GetProcAddress, LoadLibraryExW, DONT_RESOLVE_DLL_REFERENCES,
};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetExitCodeThread, WaitForSingleObject, LPTHREAD_START_ROUTINE,
};

use crate::core::debugger::DebugError;
use crate::core::remote::{LocalExport, RemoteHost};
use crate::debug::types::RemoteThreadExit;

use super::{OwnedHandle, WindowsProcess};

impl RemoteHost for WindowsProcess {
    fn allocate(&self, size: usize, hint: Option<u64>) -> Option<u64> {
        let address = unsafe {
            VirtualAllocEx(
                self.handle(),
                hint.map(|h| h as *const c_void),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if address.is_null() {
            log::debug!("VirtualAllocEx of {} bytes failed", size);
            None
        } else {
            Some(address as u64)
        }
    }

    fn free(&self, address: u64) -> bool {
        unsafe { VirtualFreeEx(self.handle(), address as *mut c_void, 0, MEM_RELEASE) }.is_ok()
    }

    fn create_remote_thread(
        &self,
        entry: u64,
        parameter: u64,
        timeout: Duration,
    ) -> Result<RemoteThreadExit, DebugError> {
        // SAFETY: the address is only ever called inside the target.
        let start: LPTHREAD_START_ROUTINE = unsafe {
            std::mem::transmute::<usize, Option<unsafe extern "system" fn(*mut c_void) -> u32>>(
                entry as usize,
            )
        };
        if start.is_none() {
            return Err(DebugError::RemoteThread("null entry point".into()));
        }

        let thread = unsafe {
            CreateRemoteThread(
                self.handle(),
                None,
                0,
                start,
                Some(parameter as *const c_void),
                0,
                None,
            )
        }
        .map(OwnedHandle)
        .map_err(|e| DebugError::RemoteThread(e.to_string()))?;

        let millis = timeout.as_millis().min(u32::MAX as u128) as u32;
        let waited = unsafe { WaitForSingleObject(thread.raw(), millis) };
        if waited == WAIT_TIMEOUT {
            return Ok(RemoteThreadExit::StillRunning);
        }
        if waited != WAIT_OBJECT_0 {
            return Err(DebugError::RemoteThread(format!(
                "wait failed: {}",
                windows::core::Error::from_win32()
            )));
        }

        let mut exit_code = 0u32;
        unsafe { GetExitCodeThread(thread.raw(), &mut exit_code) }
            .map_err(|e| DebugError::RemoteThread(e.to_string()))?;
        Ok(RemoteThreadExit::Finished(exit_code))
    }

    fn library_loader(&self) -> Result<u64, DebugError> {
        if self.wow64 {
            return Err(DebugError::Unsupported("library injection into a 32-bit target"));
        }
        // kernel32 is mapped at the same base in every process of a session.
        let kernel32 = unsafe { GetModuleHandleW(w!("kernel32.dll")) }
            .map_err(|_| DebugError::Unsupported("kernel32.dll is not mapped in the controller"))?;
        unsafe { GetProcAddress(kernel32, s!("LoadLibraryW")) }
            .map(|f| f as usize as u64)
            .ok_or(DebugError::ExportNotFound {
                name: "LoadLibraryW".into(),
            })
    }

    fn local_export(&self, library: &str, function: &str) -> Result<LocalExport, DebugError> {
        // A 64-bit controller cannot map a 32-bit image to measure the offset.
        if self.wow64 {
            return Err(DebugError::Unsupported("remote calls into a 32-bit target"));
        }
        let path = HSTRING::from(library);
        let module = unsafe { LoadLibraryExW(&path, HANDLE::default(), DONT_RESOLVE_DLL_REFERENCES) }
            .map_err(|e| DebugError::LibraryLoad {
                path: library.to_string(),
                reason: e.to_string(),
            })?;

        let name = CString::new(function).map_err(|_| DebugError::ExportNotFound {
            name: function.to_string(),
        })?;
        let address = unsafe { GetProcAddress(module, PCSTR(name.as_ptr() as *const u8)) }
            .map(|f| f as usize as u64);
        let export = address.map(|address| LocalExport {
            local_base: module.0 as u64,
            address,
        });

        unsafe {
            let _ = FreeLibrary(module);
        }
        export.ok_or_else(|| DebugError::ExportNotFound {
            name: function.to_string(),
        })
    }
}
