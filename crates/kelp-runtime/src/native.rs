//! Native extension modules loaded from shared libraries.

use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use tracing::debug;

use crate::engine::{Engine, NativeInit};
use crate::error::{RuntimeError, RuntimeResult};

/// Symbol every native module exports
pub const NATIVE_INIT_SYMBOL: &str = "kelp_init_module";

/// Shared libraries behind a runtime's native modules.
///
/// The engine keeps the definitions a library's init function built, so the
/// runtime drops this only after its engine.
#[derive(Debug, Default)]
pub(crate) struct NativeLibraries(Vec<Library>);

impl NativeLibraries {
    pub(crate) fn new(libraries: Vec<Library>) -> Self {
        Self(libraries)
    }
}

impl Drop for NativeLibraries {
    fn drop(&mut self) {
        debug!(count = self.0.len(), "native libraries unloaded");
    }
}

/// Names without a directory component load from the current directory
/// rather than the system library path.
fn library_path(name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        Path::new(".").join(name)
    }
}

/// Open `name`, look up its init function and let the engine build the
/// module from it.
///
/// The library must stay loaded for as long as the module exists; the
/// caller keeps the returned handle.
pub(crate) fn load_native<E: Engine>(
    engine: &mut E,
    name: &str,
) -> RuntimeResult<(Library, E::Module)> {
    let path = library_path(name);
    let native_error = |reason: String| RuntimeError::Native {
        name: name.to_string(),
        reason,
    };

    // SAFETY: loading a library runs its initializers; native modules are
    // trusted the same way as scripts.
    let library = unsafe { Library::new(&path) }.map_err(|e| native_error(e.to_string()))?;

    // SAFETY: the exported symbol has the `NativeInit` signature by contract.
    let init: NativeInit = unsafe {
        let symbol: Symbol<NativeInit> = library
            .get(b"kelp_init_module\0")
            .map_err(|e| native_error(format!("missing {NATIVE_INIT_SYMBOL}: {e}")))?;
        *symbol
    };

    let module = engine.instantiate_native(init, name)?;
    debug!(module = name, path = %path.display(), "native module loaded");
    Ok((library, module))
}
