//! Thin wrapper around the platform dynamic loader.

use std::ffi::{CStr, CString, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use grugc::CompileError;
use tracing::warn;

/// An open shared object. Closing happens on drop; the reload dance that
/// needs the old handle closed at a precise point drops explicitly.
#[derive(Debug)]
pub struct Dll {
    handle: *mut c_void,
}

impl Dll {
    pub fn open(path: &Path) -> Result<Dll, CompileError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| CompileError::new(format!("{}: embedded NUL", path.display())))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(CompileError::new(format!("dlopen: {}", last_dlerror())).with_path(path));
        }
        Ok(Dll { handle })
    }

    pub fn raw(&self) -> *mut c_void {
        self.handle
    }

    pub fn sym(&self, name: &str) -> Option<*mut c_void> {
        let c_name = CString::new(name).ok()?;
        let address = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        if address.is_null() { None } else { Some(address) }
    }

    /// Read an exported u64 data symbol (`globals_size`, `resources_size`,
    /// `entities_size`).
    pub fn sym_u64(&self, name: &str) -> Option<u64> {
        let address = self.sym(name)? as *const u64;
        Some(unsafe { *address })
    }

    /// Read entry `index` of an exported array of C strings, copied out of
    /// the object's `.data`. The caller guarantees `index` is below the
    /// exported count.
    pub fn sym_c_string_array_entry(&self, name: &str, index: usize) -> Option<String> {
        let array = self.sym(name)? as *const *const libc::c_char;
        let entry = unsafe { *array.add(index) };
        if entry.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(entry) }.to_string_lossy().into_owned())
    }
}

impl Drop for Dll {
    fn drop(&mut self) {
        if unsafe { libc::dlclose(self.handle) } != 0 {
            warn!("dlclose: {}", last_dlerror());
        }
    }
}

fn last_dlerror() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dlerror".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}
