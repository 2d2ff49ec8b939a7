//! Compiled control-program loading and symbol resolution.
//!
//! The control program is an externally built dynamic artifact with a fixed
//! C-ABI contract: `config_init__`, `config_run__(tick)`, `glueVars`,
//! `updateTime`, `setBufferPointers(..)`, and a readable `common_ticktime__`
//! variable holding the tick period in nanoseconds. Failure to resolve any
//! of the six symbols is fatal to startup. Beyond this contract the runtime
//! has no interaction with the artifact.
//!
//! The image table arrays are allocated and owned by the runtime;
//! `bind_image` pushes their base pointers into the artifact, whose glue
//! step then installs cell references for every location the program maps.

use std::path::Path;
use std::time::Duration;

use libloading::Library;
use thiserror::Error;
use tracing::{debug, info};

use plc_image::{BoolRow, IecByte, IecUdint, IecUint, IecUlint, ImagePointers};

pub const SYM_INIT: &str = "config_init__";
pub const SYM_RUN: &str = "config_run__";
pub const SYM_GLUE: &str = "glueVars";
pub const SYM_UPDATE_TIME: &str = "updateTime";
pub const SYM_SET_POINTERS: &str = "setBufferPointers";
pub const SYM_TICKTIME: &str = "common_ticktime__";

type InitFn = unsafe extern "C" fn();
type RunFn = unsafe extern "C" fn(u64);
type GlueFn = unsafe extern "C" fn();
type UpdateTimeFn = unsafe extern "C" fn();
#[allow(clippy::type_complexity)]
type SetBufferPointersFn = unsafe extern "C" fn(
    *mut BoolRow,
    *mut BoolRow,
    *mut BoolRow,
    *mut *mut IecByte,
    *mut *mut IecByte,
    *mut *mut IecUint,
    *mut *mut IecUint,
    *mut *mut IecUint,
    *mut *mut IecUdint,
    *mut *mut IecUdint,
    *mut *mut IecUdint,
    *mut *mut IecUlint,
    *mut *mut IecUlint,
    *mut *mut IecUlint,
);

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("failed to load control program `{path}`: {source}")]
    Load {
        path: String,
        source: libloading::Error,
    },
    #[error("missing or unreadable symbol `{name}`: {source}")]
    Symbol {
        name: &'static str,
        source: libloading::Error,
    },
    #[error("control program reports an unusable tick period of {0} ns")]
    TickPeriod(u64),
}

#[derive(Debug)]
struct EntryPoints {
    init: InitFn,
    run: RunFn,
    glue: GlueFn,
    update_time: UpdateTimeFn,
    set_pointers: SetBufferPointersFn,
}

/// A loaded control program with its five entry points resolved and the
/// tick period read out.
#[derive(Debug)]
pub struct ControlProgram {
    entries: EntryPoints,
    tick_ns: u64,
    // Keeps the resolved symbols alive; must drop after the fn pointers go
    // out of use, which struct field order guarantees.
    _lib: Library,
}

impl ControlProgram {
    /// Load the artifact and resolve all six symbols. Minimum accepted tick
    /// period is 1 µs.
    pub fn load(path: &Path) -> Result<Self, ProgramError> {
        let lib = unsafe { Library::new(path) }.map_err(|source| ProgramError::Load {
            path: path.display().to_string(),
            source,
        })?;

        // Safety: each signature matches the artifact contract above.
        let entries = unsafe {
            EntryPoints {
                init: *resolve::<InitFn>(&lib, SYM_INIT)?,
                run: *resolve::<RunFn>(&lib, SYM_RUN)?,
                glue: *resolve::<GlueFn>(&lib, SYM_GLUE)?,
                update_time: *resolve::<UpdateTimeFn>(&lib, SYM_UPDATE_TIME)?,
                set_pointers: *resolve::<SetBufferPointersFn>(&lib, SYM_SET_POINTERS)?,
            }
        };
        let tick_ns = unsafe {
            let ticktime = resolve::<*const u64>(&lib, SYM_TICKTIME)?;
            **ticktime
        };
        if tick_ns < 1_000 {
            return Err(ProgramError::TickPeriod(tick_ns));
        }

        info!(
            target: "exec.startup",
            path = %path.display(),
            tick_ns,
            "control_program_loaded"
        );
        Ok(Self {
            entries,
            tick_ns,
            _lib: lib,
        })
    }

    /// Hand every image table base pointer to the artifact.
    pub fn bind_image(&self, ptrs: &ImagePointers) {
        debug!(target: "exec.startup", "binding_image_pointers");
        unsafe {
            (self.entries.set_pointers)(
                ptrs.bool_input,
                ptrs.bool_output,
                ptrs.bool_memory,
                ptrs.byte_input,
                ptrs.byte_output,
                ptrs.int_input,
                ptrs.int_output,
                ptrs.int_memory,
                ptrs.dint_input,
                ptrs.dint_output,
                ptrs.dint_memory,
                ptrs.lint_input,
                ptrs.lint_output,
                ptrs.lint_memory,
            );
        }
    }

    pub fn init(&self) {
        unsafe { (self.entries.init)() }
    }

    /// One control-program step. Called under the image mutex.
    pub fn run(&self, tick: u64) {
        unsafe { (self.entries.run)(tick) }
    }

    /// Install cell references into the image tables. Called once, after
    /// `bind_image` and `init`.
    pub fn glue(&self) {
        unsafe { (self.entries.glue)() }
    }

    pub fn update_time(&self) {
        unsafe { (self.entries.update_time)() }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos(self.tick_ns)
    }
}

unsafe fn resolve<'lib, T>(
    lib: &'lib Library,
    name: &'static str,
) -> Result<libloading::Symbol<'lib, T>, ProgramError> {
    unsafe {
        lib.get(name.as_bytes())
            .map_err(|source| ProgramError::Symbol { name, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifact_reports_the_path() {
        let err = ControlProgram::load(Path::new("/nonexistent/program.so")).unwrap_err();
        match err {
            ProgramError::Load { path, .. } => assert!(path.contains("program.so")),
            other => panic!("expected load error, got {other}"),
        }
    }

    #[test]
    fn tick_period_error_formats_nanoseconds() {
        let err = ProgramError::TickPeriod(0);
        assert_eq!(
            err.to_string(),
            "control program reports an unusable tick period of 0 ns"
        );
    }
}
