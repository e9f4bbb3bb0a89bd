//! Remote execution - code running inside the target
//!
//! Backends supply the OS primitives through [`RemoteHost`]; library
//! injection and remote calls are composed from them here.

use std::time::Duration;

use crate::core::debugger::DebugError;
use crate::core::memory::{MemoryExt, PointerWidth, TextEncoding};
use crate::core::resolver::find_module;
use crate::debug::types::RemoteThreadExit;
use crate::debug::Target;

/// An export located in a copy of a library loaded by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalExport {
    pub local_base: u64,
    pub address: u64,
}

impl LocalExport {
    /// Distance from the image base; identical in every process mapping the image.
    ///
    /// `None` when the export lies below the base it was reported with.
    pub fn offset(&self) -> Option<u64> {
        self.address.checked_sub(self.local_base)
    }
}

/// OS primitives for executing code in a target
pub trait RemoteHost: Target {
    /// Reserve and commit read/write/execute pages. `None` on failure.
    fn allocate(&self, size: usize, hint: Option<u64>) -> Option<u64>;

    /// Release pages returned by [`RemoteHost::allocate`]
    fn free(&self, address: u64) -> bool;

    /// Run `entry(parameter)` on a new thread in the target and wait up to `timeout`
    fn create_remote_thread(
        &self,
        entry: u64,
        parameter: u64,
        timeout: Duration,
    ) -> Result<RemoteThreadExit, DebugError>;

    /// Address of the target's library loader routine (wide-string variant)
    fn library_loader(&self) -> Result<u64, DebugError>;

    /// Load `library` locally without running its initializers and find `function`
    fn local_export(&self, library: &str, function: &str) -> Result<LocalExport, DebugError>;
}

/// Make the target load the library at `path`.
///
/// Returns the module's base address in the target.
pub fn inject_library<H: RemoteHost + ?Sized>(
    host: &H,
    path: &str,
    timeout: Duration,
) -> Result<u64, DebugError> {
    let payload = TextEncoding::Utf16Le.encode_with_nul(path);
    let remote_path = host
        .allocate(payload.len(), None)
        .ok_or(DebugError::AllocationFailed {
            size: payload.len(),
        })?;

    let outcome = host
        .write(remote_path, &payload)
        .map_err(DebugError::from)
        .and_then(|()| host.library_loader())
        .and_then(|loader| host.create_remote_thread(loader, remote_path, timeout));

    // A loader still running may yet read the path.
    match outcome {
        Ok(RemoteThreadExit::StillRunning) => {
            log::warn!("Loader thread still running; leaking path buffer at {:#x}", remote_path)
        }
        _ => {
            if !host.free(remote_path) {
                log::warn!("Failed to free path buffer at {:#x}", remote_path);
            }
        }
    }

    match outcome? {
        RemoteThreadExit::StillRunning => Err(DebugError::RemoteThread(format!(
            "loader did not finish within {:?}",
            timeout
        ))),
        RemoteThreadExit::Finished(0) => Err(DebugError::LibraryLoad {
            path: path.to_string(),
            reason: "loader returned a null module handle".into(),
        }),
        RemoteThreadExit::Finished(handle) => {
            // Thread exit codes are 32 bits; the module list has the full base.
            let base = loaded_base(host, path).or_else(|| match host.pointer_width() {
                PointerWidth::Bits32 => Some(u64::from(handle)),
                PointerWidth::Bits64 => None,
            });
            match base {
                Some(base) => {
                    log::info!("Injected {} at {:#x}", path, base);
                    Ok(base)
                }
                None => Err(DebugError::LibraryLoad {
                    path: path.to_string(),
                    reason: format!(
                        "loaded (handle low bits {:#x}) but missing from the module list",
                        handle
                    ),
                }),
            }
        }
    }
}

/// Base of the module loaded from `path`, as listed by the target.
///
/// A file name without an extension also matches `<name>.dll`, which is
/// what the loader appends.
fn loaded_base<H: RemoteHost + ?Sized>(host: &H, path: &str) -> Option<u64> {
    let file_name = path.rsplit(['\\', '/']).next().unwrap_or(path);
    let modules = host.modules().ok()?;
    find_module(&modules, file_name)
        .or_else(|| {
            (!file_name.contains('.'))
                .then(|| find_module(&modules, &format!("{}.dll", file_name)))
                .flatten()
        })
        .map(|module| module.base_address)
}

/// Call `function` from the library loaded at `module_base` in the target.
///
/// The export is found in a local copy of the same library and translated by
/// its offset from the local image base.
pub fn execute_remote_function<H: RemoteHost + ?Sized>(
    host: &H,
    library_path: &str,
    module_base: u64,
    function: &str,
    parameter: u64,
    timeout: Duration,
) -> Result<RemoteThreadExit, DebugError> {
    let export = host.local_export(library_path, function)?;
    let translated = export
        .offset()
        .and_then(|offset| Some((offset, module_base.checked_add(offset)?)));
    let Some((offset, remote_address)) = translated else {
        log::warn!(
            "{}!{} at {:#x} does not fit module base {:#x} (local base {:#x})",
            library_path,
            function,
            export.address,
            module_base,
            export.local_base
        );
        return Err(DebugError::ExportNotFound {
            name: function.to_string(),
        });
    };
    log::debug!(
        "Calling {}!{} at {:#x} (offset {:#x})",
        library_path,
        function,
        remote_address,
        offset
    );
    host.create_remote_thread(remote_address, parameter, timeout)
}
