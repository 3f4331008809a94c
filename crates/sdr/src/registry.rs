// Copyright 2025-2026 CEMAXECUTER LLC

//! Driver registry and runtime module loading.
//!
//! Drivers register an explicit descriptor; there is no reflection. The
//! built-in drivers register once on first factory use, and external
//! driver modules are shared libraries that export a registration symbol
//! the loader invokes as a side effect of loading.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use libloading::{Library, Symbol};

use crate::args::Kwargs;
use crate::device::Device;
use crate::{Error, null};

/// Registration symbol a driver module must export:
/// `extern "C" fn cbmod_register_driver()`.
pub const MODULE_REGISTER_SYMBOL: &str = "cbmod_register_driver";

/// Shared-library stem prefix that marks a driver module.
const MODULE_STEM_PREFIX: &str = "cbmod";

/// One registered driver: discovery plus construction.
#[derive(Clone, Copy)]
pub struct DriverDescriptor {
    pub name: &'static str,
    /// Enumerate hardware matching the filter args. Results omit the
    /// `driver` key; the factory tags it.
    pub find: fn(&Kwargs) -> Result<Vec<Kwargs>, Error>,
    /// Construct a device from fully-merged args.
    pub make: fn(&Kwargs) -> Result<std::sync::Arc<dyn Device>, Error>,
}

static REGISTRY: Mutex<Vec<DriverDescriptor>> = Mutex::new(Vec::new());
static MODULES: Mutex<Vec<Library>> = Mutex::new(Vec::new());
static BUILTINS: Once = Once::new();

/// Add a descriptor to the registry. Each name registers once; a
/// duplicate is refused and reported by the return value.
pub fn register_driver(descriptor: DriverDescriptor) -> bool {
    let mut registry = REGISTRY.lock().unwrap();
    if registry.iter().any(|d| d.name == descriptor.name) {
        log::warn!("driver \"{}\" already registered", descriptor.name);
        return false;
    }
    log::debug!("registered driver \"{}\"", descriptor.name);
    registry.push(descriptor);
    true
}

/// All registered descriptors, in registration order.
pub fn drivers() -> Vec<DriverDescriptor> {
    REGISTRY.lock().unwrap().clone()
}

/// Look up one descriptor by name.
pub fn driver(name: &str) -> Option<DriverDescriptor> {
    REGISTRY.lock().unwrap().iter().find(|d| d.name == name).copied()
}

/// Register the compiled-in drivers. Runs once; safe to call from every
/// factory entry point.
pub fn ensure_builtin_drivers() {
    BUILTINS.call_once(|| {
        register_driver(null::descriptor());
        #[cfg(feature = "hackrf")]
        register_driver(crate::hackrf::descriptor());
        #[cfg(feature = "rtlsdr")]
        register_driver(crate::rtlsdr::descriptor());
        #[cfg(feature = "airspy")]
        register_driver(crate::airspy::descriptor());
    });
}

/// Default module search path: the current directory and its `Modules`
/// subdirectory.
pub fn default_module_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("."), PathBuf::from("./Modules")]
}

/// Load every driver module found on the default search path. Returns the
/// number of modules loaded; failures are logged and skipped.
pub fn load_modules() -> usize {
    load_modules_from(&default_module_paths())
}

/// Load every driver module found under `paths`.
pub fn load_modules_from(paths: &[PathBuf]) -> usize {
    let mut loaded = 0;
    for dir in paths {
        if !dir.is_dir() {
            log::debug!("module path {} does not exist", dir.display());
            continue;
        }
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cannot scan module path {}: {}", dir.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_driver_module(&path) {
                continue;
            }
            match load_module(&path) {
                Ok(()) => {
                    log::info!("loaded driver module {}", path.display());
                    loaded += 1;
                }
                Err(e) => log::warn!("failed to load module {}: {}", path.display(), e),
            }
        }
    }
    loaded
}

/// Load one driver module and run its registration symbol. The library
/// stays resident so the registered function pointers remain valid.
pub fn load_module(path: &Path) -> Result<(), Error> {
    let lib = unsafe { Library::new(path) }
        .map_err(|e| Error::Module(format!("{}: {}", path.display(), e)))?;
    {
        let register: Symbol<unsafe extern "C" fn()> = unsafe {
            lib.get(MODULE_REGISTER_SYMBOL.as_bytes())
        }
        .map_err(|_| {
            Error::Module(format!(
                "{}: missing symbol {}",
                path.display(),
                MODULE_REGISTER_SYMBOL
            ))
        })?;
        unsafe { register() };
    }
    MODULES.lock().unwrap().push(lib);
    Ok(())
}

/// A driver module is a shared library whose stem (after any `lib`
/// prefix) starts with `cbmod`.
pub fn is_driver_module(path: &Path) -> bool {
    let shared = matches!(
        path.extension().and_then(OsStr::to_str),
        Some("so") | Some("dll") | Some("dylib")
    );
    if !shared {
        return false;
    }
    path.file_stem()
        .and_then(OsStr::to_str)
        .map(|stem| stem.strip_prefix("lib").unwrap_or(stem))
        .map(|stem| stem.starts_with(MODULE_STEM_PREFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn stub_find(_args: &Kwargs) -> Result<Vec<Kwargs>, Error> {
        Ok(Vec::new())
    }

    fn stub_make(_args: &Kwargs) -> Result<Arc<dyn Device>, Error> {
        Err(Error::NoDevice("stub".to_string()))
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let descriptor = DriverDescriptor {
            name: "registry-test-stub",
            find: stub_find,
            make: stub_make,
        };
        assert!(register_driver(descriptor));
        assert!(!register_driver(descriptor), "second registration refused");
        assert_eq!(
            drivers()
                .iter()
                .filter(|d| d.name == "registry-test-stub")
                .count(),
            1
        );
        assert!(driver("registry-test-stub").is_some());
        assert!(driver("no-such-driver").is_none());
    }

    #[test]
    fn test_builtins_include_null() {
        ensure_builtin_drivers();
        ensure_builtin_drivers();
        assert_eq!(drivers().iter().filter(|d| d.name == "null").count(), 1);
    }

    #[test]
    fn test_module_naming_convention() {
        assert!(is_driver_module(Path::new("/tmp/libcbmod_sim.so")));
        assert!(is_driver_module(Path::new("cbmod_extra.dylib")));
        assert!(is_driver_module(Path::new("C:\\radio\\cbmod_x.dll")));
        assert!(!is_driver_module(Path::new("/tmp/libother.so")));
        assert!(!is_driver_module(Path::new("/tmp/cbmod_readme.txt")));
        assert!(!is_driver_module(Path::new("/tmp/cbmod_noext")));
    }

    #[test]
    fn test_load_module_bad_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("libcbmod_bogus.so");
        std::fs::write(&path, b"not a shared library").unwrap();
        assert!(load_module(&path).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_modules_missing_dir() {
        let missing = PathBuf::from("/definitely/not/a/dir");
        assert_eq!(load_modules_from(&[missing]), 0);
    }
}
