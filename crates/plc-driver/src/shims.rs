//! Host-side `extern "C"` entry points installed into plugin runtime args.
//!
//! Logging shims forward pre-formatted plugin messages into the central
//! tracing system; journal shims decode the ABI tag code and route into the
//! process-global journal. All of them swallow invalid input (null or
//! non-UTF-8 messages, unknown tag codes) rather than unwinding across the
//! FFI boundary.

use std::ffi::{c_char, c_int};

use tracing::{debug, error, info, warn};

use plc_image::BufferTag;
use plc_journal::journal;
use plc_pluginapi::message_from_ptr;

pub extern "C" fn log_info(msg: *const c_char) {
    if let Some(msg) = unsafe { message_from_ptr(msg) } {
        info!(target: "plugin", "{msg}");
    }
}

pub extern "C" fn log_debug(msg: *const c_char) {
    if let Some(msg) = unsafe { message_from_ptr(msg) } {
        debug!(target: "plugin", "{msg}");
    }
}

pub extern "C" fn log_warn(msg: *const c_char) {
    if let Some(msg) = unsafe { message_from_ptr(msg) } {
        warn!(target: "plugin", "{msg}");
    }
}

pub extern "C" fn log_error(msg: *const c_char) {
    if let Some(msg) = unsafe { message_from_ptr(msg) } {
        error!(target: "plugin", "{msg}");
    }
}

fn status(result: Result<(), plc_journal::JournalError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

pub extern "C" fn journal_write_bool(tag: u8, index: u16, bit: u8, value: u8) -> c_int {
    match BufferTag::from_code(tag) {
        Some(tag) => status(journal().write_bool(tag, index, bit, value != 0)),
        None => -1,
    }
}

pub extern "C" fn journal_write_byte(tag: u8, index: u16, value: u8) -> c_int {
    match BufferTag::from_code(tag) {
        Some(tag) => status(journal().write_byte(tag, index, value)),
        None => -1,
    }
}

pub extern "C" fn journal_write_int(tag: u8, index: u16, value: u16) -> c_int {
    match BufferTag::from_code(tag) {
        Some(tag) => status(journal().write_int(tag, index, value)),
        None => -1,
    }
}

pub extern "C" fn journal_write_dint(tag: u8, index: u16, value: u32) -> c_int {
    match BufferTag::from_code(tag) {
        Some(tag) => status(journal().write_dint(tag, index, value)),
        None => -1,
    }
}

pub extern "C" fn journal_write_lint(tag: u8, index: u16, value: u64) -> c_int {
    match BufferTag::from_code(tag) {
        Some(tag) => status(journal().write_lint(tag, index, value)),
        None => -1,
    }
}
