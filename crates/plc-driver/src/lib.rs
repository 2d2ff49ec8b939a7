//! Plugin driver: owns the configured plugin instances and drives their
//! lifecycle.
//!
//! The driver loads a plugin list from configuration, resolves each native
//! plugin's entry points, hands every plugin a runtime-args capability
//! bundle at `init`, and fans lifecycle operations out across the set. A
//! failure in one plugin never aborts its siblings: it is logged, the
//! plugin is left inactive, and iteration continues. Cycle hooks are
//! dispatched only to running plugins that opted in by exporting them, and
//! only while the executive holds the image mutex.

use std::path::Path;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use plc_image::{BITS_PER_CELL, BUFFER_SIZE, ImageBank, image_mutex_give, image_mutex_take};
use plc_pluginapi::PluginRuntimeArgs;

pub mod config;
mod native;
mod shims;

pub use config::{ConfigError, DriverConfig, PluginKind, PluginSpec};
pub use native::{EntryPoints, NativePlugin};

/// Upper bound on simultaneously managed plugins.
pub const MAX_PLUGINS: usize = 16;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load plugin artifact `{path}`: {source}")]
    Load {
        path: String,
        source: libloading::Error,
    },
    #[error("plugin `{path}` is missing required symbol `{name}`: {source}")]
    Symbol {
        path: String,
        name: &'static str,
        source: libloading::Error,
    },
    #[error("plugin `{name}` init returned {code}")]
    InitFailed { name: String, code: i32 },
    #[error("scripted plugins are not supported by this build")]
    ScriptedUnsupported,
}

struct PluginSlot {
    spec: PluginSpec,
    native: Option<NativePlugin>,
    // Box keeps the args at a stable address for the duration of `init`;
    // plugins copy the struct, so the box can die with the slot.
    args: Box<PluginRuntimeArgs>,
    initialized: bool,
    running: bool,
}

impl PluginSlot {
    fn name(&self) -> String {
        self.spec.display_name()
    }
}

/// The plugin driver. One per executive.
pub struct PluginDriver {
    image: Arc<ImageBank>,
    specs: Vec<PluginSpec>,
    slots: Vec<PluginSlot>,
}

impl PluginDriver {
    pub fn new(image: Arc<ImageBank>) -> Self {
        Self {
            image,
            specs: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Replace the plugin list from a configuration file. Must not be
    /// called with live plugins; callers stop/destroy first.
    pub fn load_config(&mut self, path: &Path) -> Result<usize, DriverError> {
        let mut cfg = config::load(path)?;
        if cfg.plugins.len() > MAX_PLUGINS {
            warn!(
                target: "plugin.driver",
                configured = cfg.plugins.len(),
                max = MAX_PLUGINS,
                "plugin_list_truncated"
            );
            cfg.plugins.truncate(MAX_PLUGINS);
        }
        info!(
            target: "plugin.driver",
            path = %path.display(),
            plugins = cfg.plugins.len(),
            "plugin_config_loaded"
        );
        self.specs = cfg.plugins;
        Ok(self.specs.len())
    }

    /// Same as [`load_config`]; the executive exposes both spellings.
    ///
    /// [`load_config`]: PluginDriver::load_config
    pub fn update_config(&mut self, path: &Path) -> Result<usize, DriverError> {
        self.load_config(path)
    }

    /// Load artifacts, build runtime args, and call `init` on every enabled
    /// plugin. Failures are isolated per plugin.
    pub fn init(&mut self) {
        let specs: Vec<PluginSpec> = self
            .specs
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        for spec in specs {
            match self.init_one(&spec) {
                Ok(slot) => self.slots.push(slot),
                Err(err) => {
                    error!(
                        target: "plugin.driver",
                        plugin = %spec.display_name(),
                        %err,
                        "plugin_init_failed"
                    );
                }
            }
        }
        info!(
            target: "plugin.driver",
            initialized = self.slots.len(),
            "plugin_driver_initialized"
        );
    }

    fn init_one(&self, spec: &PluginSpec) -> Result<PluginSlot, DriverError> {
        let native = match spec.kind {
            PluginKind::Native => NativePlugin::load(&spec.path)?,
            PluginKind::Scripted => return Err(DriverError::ScriptedUnsupported),
        };
        let args = self.build_runtime_args(spec);
        let name = spec.display_name();

        let code = catch_unwind(AssertUnwindSafe(|| unsafe {
            (native.entries.init)(&*args)
        }))
        .unwrap_or(-1);
        if code != 0 {
            return Err(DriverError::InitFailed { name, code });
        }
        debug!(target: "plugin.driver", plugin = %name, "plugin_initialized");
        Ok(PluginSlot {
            spec: spec.clone(),
            native: Some(native),
            args,
            initialized: true,
            running: false,
        })
    }

    /// Assemble the capability bundle for one plugin.
    pub fn build_runtime_args(&self, spec: &PluginSpec) -> Box<PluginRuntimeArgs> {
        let ptrs = self.image.pointers();
        let config_path = spec
            .config
            .as_ref()
            .map(|p| p.display().to_string());
        Box::new(PluginRuntimeArgs {
            bool_input: ptrs.bool_input,
            bool_output: ptrs.bool_output,
            bool_memory: ptrs.bool_memory,
            byte_input: ptrs.byte_input,
            byte_output: ptrs.byte_output,
            int_input: ptrs.int_input,
            int_output: ptrs.int_output,
            int_memory: ptrs.int_memory,
            dint_input: ptrs.dint_input,
            dint_output: ptrs.dint_output,
            dint_memory: ptrs.dint_memory,
            lint_input: ptrs.lint_input,
            lint_output: ptrs.lint_output,
            lint_memory: ptrs.lint_memory,
            image_bank: Arc::as_ptr(&self.image),
            mutex_take: image_mutex_take,
            mutex_give: image_mutex_give,
            config_path: PluginRuntimeArgs::encode_config_path(config_path.as_deref()),
            buffer_size: BUFFER_SIZE as i32,
            bits_per_cell: BITS_PER_CELL as i32,
            log_info: shims::log_info,
            log_debug: shims::log_debug,
            log_warn: shims::log_warn,
            log_error: shims::log_error,
            journal_write_bool: shims::journal_write_bool,
            journal_write_byte: shims::journal_write_byte,
            journal_write_int: shims::journal_write_int,
            journal_write_dint: shims::journal_write_dint,
            journal_write_lint: shims::journal_write_lint,
        })
    }

    /// Call `start_loop` on every initialized plugin and mark it running.
    pub fn start(&mut self) {
        for slot in &mut self.slots {
            if !slot.initialized || slot.running {
                continue;
            }
            let name = slot.name();
            if let Some(native) = &slot.native {
                let start = native.entries.start;
                if invoke_hook(&name, "start_loop", || unsafe { start() }) {
                    slot.running = true;
                    info!(target: "plugin.driver", plugin = %name, "plugin_started");
                }
            }
        }
    }

    /// Call `stop_loop` on every running plugin and clear its flag.
    pub fn stop(&mut self) {
        for slot in &mut self.slots {
            if !slot.running {
                continue;
            }
            let name = slot.name();
            if let Some(native) = &slot.native {
                let stop = native.entries.stop;
                invoke_hook(&name, "stop_loop", || unsafe { stop() });
            }
            slot.running = false;
            info!(target: "plugin.driver", plugin = %name, "plugin_stopped");
        }
    }

    pub fn restart(&mut self) {
        self.stop();
        self.start();
    }

    /// Dispatch `cycle_start` to running plugins that export it. The caller
    /// must hold the image mutex.
    pub fn cycle_start(&mut self) {
        self.dispatch_cycle("cycle_start", |e| e.cycle_start);
    }

    /// Dispatch `cycle_end` to running plugins that export it. The caller
    /// must hold the image mutex.
    pub fn cycle_end(&mut self) {
        self.dispatch_cycle("cycle_end", |e| e.cycle_end);
    }

    fn dispatch_cycle(
        &mut self,
        what: &'static str,
        select: impl Fn(&EntryPoints) -> Option<plc_pluginapi::PluginCycleFn>,
    ) {
        for slot in &mut self.slots {
            if !slot.running {
                continue;
            }
            let Some(native) = &slot.native else {
                continue;
            };
            let Some(hook) = select(&native.entries) else {
                continue;
            };
            if !invoke_hook(&slot.name(), what, || unsafe { hook() }) {
                // A hook that unwound is disabled for the rest of the run.
                slot.running = false;
            }
        }
    }

    /// Stop everything, run per-plugin `cleanup`, and unload the artifacts.
    pub fn destroy(&mut self) {
        self.stop();
        for slot in &mut self.slots {
            if !slot.initialized {
                continue;
            }
            let name = slot.name();
            if let Some(native) = &slot.native {
                let cleanup = native.entries.cleanup;
                invoke_hook(&name, "cleanup", || unsafe { cleanup() });
            }
            slot.initialized = false;
            // Invalidate the bundle; the artifact unloads when the slot drops.
            slot.args.buffer_size = 0;
        }
        self.slots.clear();
        info!(target: "plugin.driver", "plugin_driver_destroyed");
    }

    pub fn initialized_count(&self) -> usize {
        self.slots.iter().filter(|s| s.initialized).count()
    }

    pub fn running_count(&self) -> usize {
        self.slots.iter().filter(|s| s.running).count()
    }

    #[cfg(test)]
    fn push_test_slot(&mut self, entries: EntryPoints, spec: PluginSpec) {
        let args = self.build_runtime_args(&spec);
        self.slots.push(PluginSlot {
            spec,
            native: Some(NativePlugin::from_entries(entries)),
            args,
            initialized: true,
            running: false,
        });
    }
}

impl Drop for PluginDriver {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            self.destroy();
        }
    }
}

/// Run one plugin entry point behind an unwind barrier. Returns `false`
/// when the callee panicked.
fn invoke_hook(plugin: &str, what: &'static str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            error!(
                target: "plugin.driver",
                plugin,
                hook = what,
                "plugin_hook_panicked"
            );
            false
        }
    }
}
