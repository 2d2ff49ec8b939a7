//! The native plugin ABI.
//!
//! A native plugin is a dynamic object exporting C-ABI entry points:
//! `init(runtime_args*)` (0 ok, -1 fail), `start_loop`, `stop_loop`,
//! `cleanup`, and optionally `cycle_start` / `cycle_end`. At `init` the
//! driver passes a [`PluginRuntimeArgs`] capability bundle; the pointer is
//! only valid for the duration of the call, so plugins copy the struct into
//! their own storage. The bundle is invalid after `cleanup`.
//!
//! Everything in this crate is `#[repr(C)]` or a plain function pointer so
//! that plugins written in other languages can consume the same contract.

use std::ffi::{CStr, CString, c_char, c_int};
use std::path::PathBuf;

use plc_image::{BITS_PER_CELL, BoolRow, BufferTag, IecByte, IecUdint, IecUint, IecUlint, ImageBank};

/// Capacity of the inline config path, terminator included.
pub const CONFIG_PATH_MAX: usize = 256;

pub type PluginInitFn = unsafe extern "C" fn(*const PluginRuntimeArgs) -> c_int;
pub type PluginStartFn = unsafe extern "C" fn();
pub type PluginStopFn = unsafe extern "C" fn();
pub type PluginCycleFn = unsafe extern "C" fn();
pub type PluginCleanupFn = unsafe extern "C" fn();

/// Logging entry point: takes one pre-formatted, NUL-terminated message.
pub type LogFn = extern "C" fn(*const c_char);
/// Image mutex take/give. 0 on success, -1 on a null handle.
pub type MutexFn = extern "C" fn(*const ImageBank) -> c_int;

// Journal write entry points, one per width. The first argument is the
// ABI-stable buffer tag code (0..14). 0 on success, -1 on validation
// failure.
pub type JournalWriteBoolFn = extern "C" fn(u8, u16, u8, u8) -> c_int;
pub type JournalWriteByteFn = extern "C" fn(u8, u16, u8) -> c_int;
pub type JournalWriteIntFn = extern "C" fn(u8, u16, u16) -> c_int;
pub type JournalWriteDintFn = extern "C" fn(u8, u16, u32) -> c_int;
pub type JournalWriteLintFn = extern "C" fn(u8, u16, u64) -> c_int;

/// The capability bundle handed to each plugin at `init`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PluginRuntimeArgs {
    // Image table base pointers. Dereference only between mutex_take and
    // mutex_give, or inside a cycle hook (the executive already holds the
    // image mutex there).
    pub bool_input: *mut BoolRow,
    pub bool_output: *mut BoolRow,
    pub bool_memory: *mut BoolRow,
    pub byte_input: *mut *mut IecByte,
    pub byte_output: *mut *mut IecByte,
    pub int_input: *mut *mut IecUint,
    pub int_output: *mut *mut IecUint,
    pub int_memory: *mut *mut IecUint,
    pub dint_input: *mut *mut IecUdint,
    pub dint_output: *mut *mut IecUdint,
    pub dint_memory: *mut *mut IecUdint,
    pub lint_input: *mut *mut IecUlint,
    pub lint_output: *mut *mut IecUlint,
    pub lint_memory: *mut *mut IecUlint,

    pub image_bank: *const ImageBank,
    pub mutex_take: MutexFn,
    pub mutex_give: MutexFn,

    /// NUL-terminated path of the plugin's private configuration file;
    /// empty string when none was configured.
    pub config_path: [u8; CONFIG_PATH_MAX],

    pub buffer_size: c_int,
    pub bits_per_cell: c_int,

    pub log_info: LogFn,
    pub log_debug: LogFn,
    pub log_warn: LogFn,
    pub log_error: LogFn,

    pub journal_write_bool: JournalWriteBoolFn,
    pub journal_write_byte: JournalWriteByteFn,
    pub journal_write_int: JournalWriteIntFn,
    pub journal_write_dint: JournalWriteDintFn,
    pub journal_write_lint: JournalWriteLintFn,
}

// Safety: the embedded pointers follow the image access discipline (stable
// for the bank's lifetime, dereferenced only under the image mutex), so the
// bundle may be copied into plugin-owned storage on any thread.
unsafe impl Send for PluginRuntimeArgs {}
unsafe impl Sync for PluginRuntimeArgs {}

impl PluginRuntimeArgs {
    /// Decode the inline config path. `None` when empty or not UTF-8.
    pub fn config_path(&self) -> Option<PathBuf> {
        let nul = self.config_path.iter().position(|&b| b == 0)?;
        if nul == 0 {
            return None;
        }
        std::str::from_utf8(&self.config_path[..nul])
            .ok()
            .map(PathBuf::from)
    }

    /// Encode `path` into an inline config path field, truncating to fit.
    pub fn encode_config_path(path: Option<&str>) -> [u8; CONFIG_PATH_MAX] {
        let mut field = [0u8; CONFIG_PATH_MAX];
        if let Some(path) = path {
            let len = path.len().min(CONFIG_PATH_MAX - 1);
            field[..len].copy_from_slice(&path.as_bytes()[..len]);
        }
        field
    }
}

/// Plugin-side logger that routes through the central logging entry points
/// and prefixes every message with the plugin name. Before [`bind`] (or if
/// the runtime ever hands out a bundle without working pointers) messages
/// fall back to standard output.
///
/// [`bind`]: PluginLogger::bind
#[derive(Clone, Copy)]
pub struct PluginLogger {
    name: &'static str,
    sinks: Option<LogSinks>,
}

#[derive(Clone, Copy)]
struct LogSinks {
    info: LogFn,
    debug: LogFn,
    warn: LogFn,
    error: LogFn,
}

impl PluginLogger {
    pub const fn new(name: &'static str) -> Self {
        Self { name, sinks: None }
    }

    /// Adopt the central logging entry points from the runtime args.
    pub fn bind(&mut self, args: &PluginRuntimeArgs) {
        self.sinks = Some(LogSinks {
            info: args.log_info,
            debug: args.log_debug,
            warn: args.log_warn,
            error: args.log_error,
        });
    }

    fn emit(&self, sink: impl Fn(&LogSinks) -> LogFn, level: &str, msg: &str) {
        let line = format!("[{}] {}", self.name, msg);
        match (&self.sinks, CString::new(line)) {
            (Some(sinks), Ok(line)) => sink(sinks)(line.as_ptr()),
            (_, line) => {
                // Fallback path; also reached for messages with interior NULs.
                if let Ok(line) = line {
                    println!("[{}] {}", level, line.to_string_lossy());
                } else {
                    println!("[{}] [{}] <unprintable message>", level, self.name);
                }
            }
        }
    }

    pub fn info(&self, msg: &str) {
        self.emit(|s| s.info, "INFO", msg);
    }

    pub fn debug(&self, msg: &str) {
        self.emit(|s| s.debug, "DEBUG", msg);
    }

    pub fn warn(&self, msg: &str) {
        self.emit(|s| s.warn, "WARN", msg);
    }

    pub fn error(&self, msg: &str) {
        self.emit(|s| s.error, "ERROR", msg);
    }
}

/// A typed view over the image table pointers of a runtime-args bundle.
///
/// Every accessor requires the image mutex to be held by the caller, either
/// via `mutex_take`/`mutex_give` or because the call happens inside a cycle
/// hook. Indices must be below `buffer_size`; accessors return `None` /
/// `false` for unmapped cells and debug-assert the bounds.
#[derive(Clone, Copy)]
pub struct ImageView {
    args: PluginRuntimeArgs,
}

impl ImageView {
    pub fn new(args: &PluginRuntimeArgs) -> Self {
        Self { args: *args }
    }

    pub fn buffer_size(&self) -> usize {
        self.args.buffer_size as usize
    }

    fn bool_table(&self, tag: BufferTag) -> Option<*mut BoolRow> {
        match tag {
            BufferTag::BoolInput => Some(self.args.bool_input),
            BufferTag::BoolOutput => Some(self.args.bool_output),
            BufferTag::BoolMemory => Some(self.args.bool_memory),
            _ => None,
        }
    }

    fn byte_table(&self, tag: BufferTag) -> Option<*mut *mut IecByte> {
        match tag {
            BufferTag::ByteInput => Some(self.args.byte_input),
            BufferTag::ByteOutput => Some(self.args.byte_output),
            _ => None,
        }
    }

    fn int_table(&self, tag: BufferTag) -> Option<*mut *mut IecUint> {
        match tag {
            BufferTag::IntInput => Some(self.args.int_input),
            BufferTag::IntOutput => Some(self.args.int_output),
            BufferTag::IntMemory => Some(self.args.int_memory),
            _ => None,
        }
    }

    fn dint_table(&self, tag: BufferTag) -> Option<*mut *mut IecUdint> {
        match tag {
            BufferTag::DintInput => Some(self.args.dint_input),
            BufferTag::DintOutput => Some(self.args.dint_output),
            BufferTag::DintMemory => Some(self.args.dint_memory),
            _ => None,
        }
    }

    fn lint_table(&self, tag: BufferTag) -> Option<*mut *mut IecUlint> {
        match tag {
            BufferTag::LintInput => Some(self.args.lint_input),
            BufferTag::LintOutput => Some(self.args.lint_output),
            BufferTag::LintMemory => Some(self.args.lint_memory),
            _ => None,
        }
    }

    /// Read one bool cell packed into a byte, bit 0 at the LSB. Unmapped
    /// bits read as 0. `None` when `tag` is not a bool tag.
    pub unsafe fn load_bool_bank(&self, tag: BufferTag, index: usize) -> Option<u8> {
        debug_assert!(index < self.buffer_size());
        let table = self.bool_table(tag)?;
        let mut packed = 0u8;
        unsafe {
            let row = &*table.add(index);
            for (bit, cell) in row.iter().enumerate().take(BITS_PER_CELL) {
                if !cell.is_null() && **cell != 0 {
                    packed |= 1 << bit;
                }
            }
        }
        Some(packed)
    }

    /// Write a packed byte into one bool cell; only mapped bits change.
    pub unsafe fn store_bool_bank(&self, tag: BufferTag, index: usize, packed: u8) -> bool {
        debug_assert!(index < self.buffer_size());
        let Some(table) = self.bool_table(tag) else {
            return false;
        };
        unsafe {
            let row = &*table.add(index);
            for (bit, cell) in row.iter().enumerate().take(BITS_PER_CELL) {
                if !cell.is_null() {
                    **cell = (packed >> bit) & 1;
                }
            }
        }
        true
    }

    pub unsafe fn load_byte(&self, tag: BufferTag, index: usize) -> Option<u8> {
        debug_assert!(index < self.buffer_size());
        let table = self.byte_table(tag)?;
        unsafe {
            let cell = *table.add(index);
            (!cell.is_null()).then(|| *cell)
        }
    }

    pub unsafe fn store_byte(&self, tag: BufferTag, index: usize, value: u8) -> bool {
        debug_assert!(index < self.buffer_size());
        let Some(table) = self.byte_table(tag) else {
            return false;
        };
        unsafe {
            let cell = *table.add(index);
            if cell.is_null() {
                return false;
            }
            *cell = value;
        }
        true
    }

    pub unsafe fn load_int(&self, tag: BufferTag, index: usize) -> Option<u16> {
        debug_assert!(index < self.buffer_size());
        let table = self.int_table(tag)?;
        unsafe {
            let cell = *table.add(index);
            (!cell.is_null()).then(|| *cell)
        }
    }

    pub unsafe fn store_int(&self, tag: BufferTag, index: usize, value: u16) -> bool {
        debug_assert!(index < self.buffer_size());
        let Some(table) = self.int_table(tag) else {
            return false;
        };
        unsafe {
            let cell = *table.add(index);
            if cell.is_null() {
                return false;
            }
            *cell = value;
        }
        true
    }

    pub unsafe fn load_dint(&self, tag: BufferTag, index: usize) -> Option<u32> {
        debug_assert!(index < self.buffer_size());
        let table = self.dint_table(tag)?;
        unsafe {
            let cell = *table.add(index);
            (!cell.is_null()).then(|| *cell)
        }
    }

    pub unsafe fn store_dint(&self, tag: BufferTag, index: usize, value: u32) -> bool {
        debug_assert!(index < self.buffer_size());
        let Some(table) = self.dint_table(tag) else {
            return false;
        };
        unsafe {
            let cell = *table.add(index);
            if cell.is_null() {
                return false;
            }
            *cell = value;
        }
        true
    }

    pub unsafe fn load_lint(&self, tag: BufferTag, index: usize) -> Option<u64> {
        debug_assert!(index < self.buffer_size());
        let table = self.lint_table(tag)?;
        unsafe {
            let cell = *table.add(index);
            (!cell.is_null()).then(|| *cell)
        }
    }

    pub unsafe fn store_lint(&self, tag: BufferTag, index: usize, value: u64) -> bool {
        debug_assert!(index < self.buffer_size());
        let Some(table) = self.lint_table(tag) else {
            return false;
        };
        unsafe {
            let cell = *table.add(index);
            if cell.is_null() {
                return false;
            }
            *cell = value;
        }
        true
    }
}

/// Decode a message pointer arriving through a [`LogFn`]. Host-side helper
/// for the shims that bridge plugin logging into the central system.
///
/// # Safety
/// `msg` must be null or a valid NUL-terminated string.
pub unsafe fn message_from_ptr<'a>(msg: *const c_char) -> Option<&'a str> {
    if msg.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(msg) }.to_str().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_round_trips() {
        let field = PluginRuntimeArgs::encode_config_path(Some("/etc/plc/s7.json"));
        let nul = field.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&field[..nul], b"/etc/plc/s7.json");

        let empty = PluginRuntimeArgs::encode_config_path(None);
        assert!(empty.iter().all(|&b| b == 0));
    }

    #[test]
    fn overlong_config_path_is_truncated_not_overflowed() {
        let long = "x".repeat(CONFIG_PATH_MAX * 2);
        let field = PluginRuntimeArgs::encode_config_path(Some(&long));
        assert_eq!(field[CONFIG_PATH_MAX - 1], 0);
        assert_eq!(field[CONFIG_PATH_MAX - 2], b'x');
    }

    #[test]
    fn unbound_logger_falls_back_to_stdout() {
        // Just exercises the fallback path; nothing to assert beyond "does
        // not panic without bound sinks".
        let logger = PluginLogger::new("TEST");
        logger.info("hello");
        logger.error("world");
    }
}
