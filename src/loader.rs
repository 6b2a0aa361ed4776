//! Dynamic server-type loader (§4.11): loads a shared library by a
//! prefix/suffix naming convention and resolves its exported
//! `"<description>_server_definition"` symbol, refcounted across repeat
//! loads.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_void;

use log::debug;

use crate::error::{Error, Result};

struct LoadedLib {
    handle: *mut c_void,
    refcount: u32,
}

/// `load`/`unload` bookkeeping for `(path, native_handle, refcount)`
/// triples, per §4.11.
#[derive(Default)]
pub struct DynamicLoader {
    libs: HashMap<String, LoadedLib>,
}

fn library_filename(description: &str) -> String {
    if cfg!(target_os = "macos") {
        format!("libserveez_{description}.dylib")
    } else {
        format!("libserveez_{description}.so")
    }
}

fn symbol_name(description: &str) -> String {
    format!("{description}_server_definition")
}

fn dlerror_string() -> String {
    unsafe {
        let ptr = libc::dlerror();
        if ptr.is_null() {
            "unknown dynamic loader error".to_owned()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

fn lookup_symbol(handle: *mut c_void, description: &str) -> Result<*mut c_void> {
    let c_symbol = CString::new(symbol_name(description))
        .map_err(|_| Error::configuration(description, "invalid symbol name"))?;
    unsafe { libc::dlerror() }; // clear any pending error
    let sym = unsafe { libc::dlsym(handle, c_symbol.as_ptr()) };
    if sym.is_null() {
        return Err(Error::configuration(description, dlerror_string()));
    }
    Ok(sym)
}

impl DynamicLoader {
    pub fn new() -> Self {
        DynamicLoader::default()
    }

    /// Loads (or bumps the refcount on) the library backing `description`
    /// and returns its `<description>_server_definition` symbol. "lazy-no,
    /// global-symbols yes" maps to `RTLD_NOW | RTLD_GLOBAL`.
    pub fn load(&mut self, description: &str) -> Result<*mut c_void> {
        if let Some(lib) = self.libs.get_mut(description) {
            lib.refcount += 1;
            debug!("loader: {} refcount now {}", description, lib.refcount);
            return lookup_symbol(lib.handle, description);
        }

        let filename = library_filename(description);
        let c_filename =
            CString::new(filename).map_err(|_| Error::configuration(description, "invalid library filename"))?;
        let handle = unsafe { libc::dlopen(c_filename.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(Error::configuration(description, dlerror_string()));
        }

        let symbol = match lookup_symbol(handle, description) {
            Ok(sym) => sym,
            Err(e) => {
                unsafe { libc::dlclose(handle) };
                return Err(e);
            }
        };

        self.libs.insert(description.to_owned(), LoadedLib { handle, refcount: 1 });
        Ok(symbol)
    }

    /// Decrements the refcount for `description`; closes the library once
    /// it reaches zero. Fails if `description` was never loaded.
    pub fn unload(&mut self, description: &str) -> Result<()> {
        let Some(lib) = self.libs.get_mut(description) else {
            return Err(Error::configuration(description, "not loaded"));
        };
        lib.refcount -= 1;
        if lib.refcount == 0 {
            if let Some(lib) = self.libs.remove(description) {
                unsafe { libc::dlclose(lib.handle) };
            }
        }
        Ok(())
    }

    pub fn refcount(&self, description: &str) -> Option<u32> {
        self.libs.get(description).map(|l| l.refcount)
    }
}

impl Drop for DynamicLoader {
    fn drop(&mut self) {
        for (_, lib) in self.libs.drain() {
            unsafe { libc::dlclose(lib.handle) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_filename_follows_platform_convention() {
        let name = library_filename("http");
        assert!(name.contains("http"));
        assert!(name.starts_with("libserveez_"));
    }

    #[test]
    fn loading_a_nonexistent_library_returns_a_configuration_error() {
        let mut loader = DynamicLoader::new();
        let err = loader.load("definitely_not_a_real_serveez_module_xyz").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn unloading_something_never_loaded_is_an_error() {
        let mut loader = DynamicLoader::new();
        assert!(loader.unload("never_loaded").is_err());
    }
}
