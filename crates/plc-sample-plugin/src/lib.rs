//! Minimal native plugin exercising the runtime-args contract.
//!
//! Demonstrates what every native plugin does at least once: copy the args
//! bundle, route logging through the central entry points, take and give
//! the image mutex, and submit journal writes instead of touching image
//! cells directly. Useful as a wiring check for a fresh deployment and as
//! a template for new plugins.

use std::ffi::c_int;

use parking_lot::Mutex;

use plc_image::BufferTag;
use plc_pluginapi::{PluginLogger, PluginRuntimeArgs};

struct SampleState {
    logger: PluginLogger,
    args: PluginRuntimeArgs,
    running: bool,
    cycles: u64,
}

static STATE: Mutex<Option<SampleState>> = Mutex::new(None);

/// # Safety
/// `args` must be null or point at a live [`PluginRuntimeArgs`] for the
/// duration of the call; the driver guarantees this.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn init(args: *const PluginRuntimeArgs) -> c_int {
    let mut logger = PluginLogger::new("SAMPLE");
    logger.info("initializing sample plugin");
    if args.is_null() {
        logger.error("init args is null");
        return -1;
    }
    let args = unsafe { *args };
    logger.bind(&args);

    logger.info(&format!(
        "buffer size: {}, bits per cell: {}",
        args.buffer_size, args.bits_per_cell
    ));
    match args.config_path() {
        Some(path) => logger.debug(&format!("config path: {}", path.display())),
        None => logger.debug("no private config"),
    }

    // Mutex smoke test: take and give once before the scan loop starts.
    if (args.mutex_take)(args.image_bank) == 0 {
        logger.debug("image mutex acquired and released");
        (args.mutex_give)(args.image_bank);
    } else {
        logger.warn("failed to take the image mutex");
    }

    *STATE.lock() = Some(SampleState {
        logger,
        args,
        running: false,
        cycles: 0,
    });
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn start_loop() {
    let mut state = STATE.lock();
    let Some(plugin) = state.as_mut() else {
        PluginLogger::new("SAMPLE").error("cannot start: not initialized");
        return;
    };
    plugin.running = true;
    plugin.logger.info("sample plugin started");
}

#[unsafe(no_mangle)]
pub extern "C" fn stop_loop() {
    let mut state = STATE.lock();
    let Some(plugin) = state.as_mut() else {
        return;
    };
    if plugin.running {
        plugin.running = false;
        plugin.logger.info("sample plugin stopped");
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cycle_start() {
    let mut state = STATE.lock();
    let Some(plugin) = state.as_mut() else {
        return;
    };
    if !plugin.running {
        return;
    }
    plugin.cycles += 1;
    if plugin.cycles % 1000 == 0 {
        plugin
            .logger
            .debug(&format!("cycle {} starting", plugin.cycles));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cycle_end() {
    let state = STATE.lock();
    let Some(plugin) = state.as_ref() else {
        return;
    };
    if !plugin.running {
        return;
    }
    // Journal one write per width every thousand cycles; the executive
    // applies them at the top of the next tick.
    if plugin.cycles % 1000 == 0 {
        let args = &plugin.args;
        let n = plugin.cycles;
        (args.journal_write_bool)(BufferTag::BoolMemory.code(), 0, 0, (n % 2) as u8);
        (args.journal_write_int)(BufferTag::IntMemory.code(), 0, n as u16);
        (args.journal_write_dint)(BufferTag::DintMemory.code(), 0, n as u32);
        (args.journal_write_lint)(BufferTag::LintMemory.code(), 0, n);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cleanup() {
    let mut state = STATE.lock();
    let Some(mut plugin) = state.take() else {
        return;
    };
    plugin.running = false;
    plugin.logger.info("sample plugin cleaned up");
}
