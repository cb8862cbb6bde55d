//! Native manager entry point
//!
//! The entire protocol projects onto a single exported function in the
//! data source manager library. [`NativeEntry`] is that function as a
//! trait, so the manager can be a dynamically loaded library in
//! production and a scriptable double in tests. Sessions share one
//! loaded manager through `Arc`: the first session to need it loads
//! it, later sessions clone the handle, and the library unloads when
//! the last clone drops.

use crate::errors::{Result, TwainError};
use crate::types::{ReturnCode, TwIdentity};
use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

/// Raw signature of the manager's exported entry function.
pub type RawDsmEntry = unsafe extern "C" fn(
    origin: *mut TwIdentity,
    dest: *mut TwIdentity,
    dg: u32,
    dat: u16,
    msg: u16,
    data: *mut c_void,
) -> u16;

/// Fixed signature of the notification callback registered with the
/// manager. `ref_con` is the value supplied at registration and is
/// passed back verbatim on every invocation, always on the manager's
/// internal thread.
pub type CallbackProc = extern "C" fn(
    ref_con: usize,
    origin: *const TwIdentity,
    dg: u32,
    dat: u16,
    msg: u16,
    data: *mut c_void,
) -> u16;

/// Modern callback registration record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TwCallback2 {
    pub callback_proc: CallbackProc,
    pub ref_con: usize,
    pub message: u16,
}

/// Legacy callback registration record, used when the manager rejects
/// the modern one.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TwCallback {
    pub callback_proc: CallbackProc,
    pub ref_con: usize,
    pub message: u16,
}

/// The one native call every operation is expressed through.
pub trait NativeEntry: Send + Sync {
    /// Invokes the manager with one triplet. `dest` is null for
    /// manager-level operations and the source identity otherwise;
    /// `data` points at the operation's payload.
    fn dsm_entry(
        &self,
        origin: *mut TwIdentity,
        dest: *mut TwIdentity,
        dg: u32,
        dat: u16,
        msg: u16,
        data: *mut c_void,
    ) -> ReturnCode;
}

/// Platform-default file name of the manager library.
pub fn default_library_name() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "TWAINDSM.dll"
    }
    #[cfg(target_os = "macos")]
    {
        "/Library/Frameworks/TWAIN.framework/TWAIN"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "libtwaindsm.so"
    }
}

/// A data source manager loaded from a shared library.
pub struct DsmLibrary {
    entry: RawDsmEntry,
    // Held for its lifetime only; the symbol above points into it.
    _library: libloading::Library,
}

impl DsmLibrary {
    /// Loads the manager from the platform-default location.
    pub fn load_default() -> Result<Arc<Self>> {
        Self::load(default_library_name())
    }

    /// Loads the manager library at `path` and resolves its entry
    /// symbol.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        // SAFETY: loading runs the library's initialization code; a
        // manager library is trusted to the same degree as any device
        // driver the process links against.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| {
            TwainError::config(format!("cannot load manager library {}: {e}", path.display()))
        })?;

        // SAFETY: DSM_Entry is the published export with the RawDsmEntry
        // signature; a library without it is not a manager.
        let entry = unsafe {
            library
                .get::<RawDsmEntry>(b"DSM_Entry\0")
                .map(|symbol| *symbol)
                .map_err(|e| {
                    TwainError::config(format!(
                        "{} does not export DSM_Entry: {e}",
                        path.display()
                    ))
                })?
        };

        log::info!("loaded manager library {}", path.display());
        Ok(Arc::new(Self {
            entry,
            _library: library,
        }))
    }
}

impl NativeEntry for DsmLibrary {
    fn dsm_entry(
        &self,
        origin: *mut TwIdentity,
        dest: *mut TwIdentity,
        dg: u32,
        dat: u16,
        msg: u16,
        data: *mut c_void,
    ) -> ReturnCode {
        // SAFETY: pointer arguments are built by the dispatcher from
        // live stack or heap payloads that outlast this call.
        let raw = unsafe { (self.entry)(origin, dest, dg, dat, msg, data) };
        ReturnCode::from_u16(raw)
    }
}

impl std::fmt::Debug for DsmLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsmLibrary").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_library_name_is_platform_specific() {
        assert!(!default_library_name().is_empty());
    }

    #[test]
    fn loading_a_missing_library_is_a_config_error() {
        let err = DsmLibrary::load("/nonexistent/manager.so").unwrap_err();
        assert!(matches!(err, TwainError::Config(_)));
    }
}
