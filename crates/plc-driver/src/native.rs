//! Native plugin artifact loading.

use std::path::Path;

use libloading::Library;
use tracing::debug;

use plc_pluginapi::{
    PluginCleanupFn, PluginCycleFn, PluginInitFn, PluginStartFn, PluginStopFn,
};

use crate::DriverError;

/// The resolved lifecycle entry points of one native plugin.
///
/// `cycle_start` and `cycle_end` are opt-in: a plugin that does not export
/// them simply takes no part in the scan cycle, which is not an error.
pub struct EntryPoints {
    pub init: PluginInitFn,
    pub start: PluginStartFn,
    pub stop: PluginStopFn,
    pub cleanup: PluginCleanupFn,
    pub cycle_start: Option<PluginCycleFn>,
    pub cycle_end: Option<PluginCycleFn>,
}

pub struct NativePlugin {
    pub entries: EntryPoints,
    // Dropping the library unloads the artifact; field order keeps it alive
    // past the entry points above.
    _lib: Option<Library>,
}

impl NativePlugin {
    pub fn load(path: &Path) -> Result<Self, DriverError> {
        let lib = unsafe { Library::new(path) }.map_err(|source| DriverError::Load {
            path: path.display().to_string(),
            source,
        })?;

        // Safety: signatures per the native plugin ABI.
        let entries = unsafe {
            EntryPoints {
                init: *required::<PluginInitFn>(&lib, path, "init")?,
                start: *required::<PluginStartFn>(&lib, path, "start_loop")?,
                stop: *required::<PluginStopFn>(&lib, path, "stop_loop")?,
                cleanup: *required::<PluginCleanupFn>(&lib, path, "cleanup")?,
                cycle_start: optional::<PluginCycleFn>(&lib, "cycle_start"),
                cycle_end: optional::<PluginCycleFn>(&lib, "cycle_end"),
            }
        };
        debug!(
            target: "plugin.driver",
            path = %path.display(),
            cycle_start = entries.cycle_start.is_some(),
            cycle_end = entries.cycle_end.is_some(),
            "plugin_symbols_resolved"
        );
        Ok(Self {
            entries,
            _lib: Some(lib),
        })
    }

    /// Build a plugin around an already-resolved entry-point table. Used by
    /// in-process tests; dynamically loaded plugins go through [`load`].
    ///
    /// [`load`]: NativePlugin::load
    pub fn from_entries(entries: EntryPoints) -> Self {
        Self {
            entries,
            _lib: None,
        }
    }
}

unsafe fn required<'lib, T>(
    lib: &'lib Library,
    path: &Path,
    name: &'static str,
) -> Result<libloading::Symbol<'lib, T>, DriverError> {
    unsafe {
        lib.get(name.as_bytes())
            .map_err(|source| DriverError::Symbol {
                path: path.display().to_string(),
                name,
                source,
            })
    }
}

fn optional<T>(lib: &Library, name: &str) -> Option<T>
where
    T: Copy,
{
    unsafe { lib.get::<T>(name.as_bytes()).ok().map(|sym| *sym) }
}
