//! The cyclic executive.
//!
//! Startup binds the control-program symbols, allocates the image, wires
//! the journal and the plugin driver, and brings up the ambient threads
//! (watchdog, control plane). The tick loop then runs until a signal or a
//! `stop` command: stamp the heartbeat, record the cycle start, apply the
//! journal and run the control program and cycle hooks under the image
//! mutex, record the cycle end, and sleep until the next absolute deadline
//! `baseline + tick × period` on the monotonic clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use thiserror::Error;
use tracing::{debug, info};

use plc_driver::PluginDriver;
use plc_image::ImageBank;
use plc_journal::journal;
use plc_program::{ControlProgram, ProgramError};
use plc_scan::{ScanCycle, TimingStats};

use crate::control::{ControlCommand, ControlContext, ControlServer};
use crate::{Args, watchdog};

#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("interrupted by a signal during startup")]
    Interrupted,
    #[error("failed to install signal handlers: {0}")]
    Signals(std::io::Error),
    #[error("failed to bind the control socket: {0}")]
    ControlSocket(std::io::Error),
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Program(_) => 1,
            FatalError::Interrupted | FatalError::Signals(_) => 2,
            FatalError::ControlSocket(_) => 3,
        }
    }
}

pub fn run(args: &Args) -> Result<(), FatalError> {
    install_panic_hook();

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        flag::register(signal, shutdown.clone()).map_err(FatalError::Signals)?;
    }

    info!(target: "exec.startup", program = %args.program.display(), "startup");

    let image = ImageBank::new();
    let program = ControlProgram::load(&args.program)?;
    program.bind_image(&image.pointers());
    journal().init(image.clone());

    let stats = Arc::new(Mutex::new(TimingStats::default()));
    let (command_tx, command_rx) = crossbeam_channel::bounded::<ControlCommand>(8);
    let _control = ControlServer::bind(
        &args.control_socket,
        ControlContext {
            stats: stats.clone(),
            commands: command_tx,
            shutdown: shutdown.clone(),
        },
    )
    .map_err(FatalError::ControlSocket)?;

    let heartbeat = Arc::new(AtomicI64::new(watchdog::unix_secs()));
    let watchdog_thread = watchdog::spawn(heartbeat.clone(), shutdown.clone());

    let mut driver = PluginDriver::new(image.clone());
    if let Some(path) = &args.plugins {
        match driver.load_config(path) {
            Ok(count) => debug!(target: "exec.startup", plugins = count, "plugin_list_ready"),
            Err(err) => {
                // A broken plugin list never takes the control program down.
                tracing::error!(target: "exec.startup", %err, "plugin_config_rejected");
            }
        }
    }
    driver.init();

    program.init();
    program.glue();
    driver.start();

    if shutdown.load(Ordering::Acquire) {
        driver.destroy();
        journal().cleanup();
        return Err(FatalError::Interrupted);
    }

    let period = program.tick_period();
    info!(
        target: "exec.startup",
        period_us = period.as_micros() as u64,
        "entering_scan_loop"
    );

    let mut scan = ScanCycle::new(period);
    let mut tick: u64 = 0;
    let baseline = Instant::now();

    while !shutdown.load(Ordering::Acquire) {
        heartbeat.store(watchdog::unix_secs(), Ordering::Relaxed);
        scan.start();
        {
            let tables = image.lock();
            journal().apply_and_clear(&tables);
            driver.cycle_start();
            program.run(tick);
            program.update_time();
            driver.cycle_end();
        }
        tick += 1;
        scan.end();
        *stats.lock() = scan.stats();

        if let Ok(ControlCommand::Stop) = command_rx.try_recv() {
            info!(target: "exec", "stop_command");
            break;
        }
        sleep_until_deadline(baseline, period, tick);
    }

    let final_stats = scan.stats();
    info!(
        target: "exec.shutdown",
        ticks = tick,
        overruns = final_stats.overruns,
        scan_time_max_us = final_stats.scan_time_max,
        "scan_loop_exited"
    );

    driver.stop();
    driver.destroy();
    journal().cleanup();
    shutdown.store(true, Ordering::Release);
    let _ = watchdog_thread.join();
    info!(target: "exec.shutdown", "shutdown_complete");
    Ok(())
}

/// Absolute deadline of tick `tick` against the loop baseline.
fn deadline_for(baseline: Instant, period: Duration, tick: u64) -> Instant {
    let nanos = period.as_nanos().saturating_mul(u128::from(tick));
    baseline + Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
}

/// Sleep until the tick deadline; an already-passed deadline means the
/// scan overran and the next cycle starts immediately.
fn sleep_until_deadline(baseline: Instant, period: Duration, tick: u64) {
    let deadline = deadline_for(baseline, period, tick);
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

fn install_panic_hook() {
    use std::sync::Once;
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "exec.panic", ?info, "panic");
            default_panic(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn deadlines_advance_by_exactly_one_period() {
        let baseline = Instant::now();
        let period = Duration::from_millis(20);
        let d1 = deadline_for(baseline, period, 1);
        let d2 = deadline_for(baseline, period, 2);
        let d100 = deadline_for(baseline, period, 100);
        assert_eq!(d2 - d1, period);
        assert_eq!(d100 - baseline, period * 100);
    }

    #[test]
    fn deadline_overflow_saturates() {
        let baseline = Instant::now();
        let period = Duration::from_secs(3600);
        // Far beyond any real uptime; must not panic.
        let _ = deadline_for(baseline, period, u64::MAX);
    }

    #[test]
    fn missing_program_exits_with_code_one() {
        let err = FatalError::from(
            ControlProgram::load(Path::new("/nonexistent/program.so")).unwrap_err(),
        );
        assert_eq!(err.exit_code(), 1);
    }
}
