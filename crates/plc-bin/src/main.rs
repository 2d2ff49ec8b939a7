//! ferroplc entrypoint.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::error;

mod control;
mod executive;
mod watchdog;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "ferroplc", version, about = "Cyclic PLC runtime")]
pub struct Args {
    /// Compiled control-program artifact (dynamic object).
    pub program: PathBuf,
    /// Plugin list configuration (JSON). Without it no plugins run.
    #[arg(long = "plugins")]
    pub plugins: Option<PathBuf>,
    /// Unix-domain socket of the log collector.
    #[arg(long = "log-socket")]
    pub log_socket: Option<PathBuf>,
    /// Unix-domain socket of the local control plane.
    #[arg(long = "control-socket", default_value = "/tmp/ferroplc.sock")]
    pub control_socket: PathBuf,
}

fn main() {
    let args = Args::parse();
    let log_guard = plc_logsink::init(args.log_socket.as_deref());

    let result = executive::run(&args);
    if let Err(err) = &result {
        error!(target: "exec", %err, exit_code = err.exit_code(), "fatal");
    }
    // Flush the shipping worker before exiting.
    drop(log_guard);
    if let Err(err) = result {
        process::exit(err.exit_code());
    }
}
