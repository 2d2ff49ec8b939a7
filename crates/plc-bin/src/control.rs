//! Local control-plane socket.
//!
//! A Unix-domain stream socket accepting newline-terminated text commands:
//! `status`, `stats` (timing statistics as one JSON line), and `stop`
//! (orderly shutdown). Anything else answers `err unknown command`. The
//! socket file is removed again on teardown.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use plc_scan::TimingStats;

const ACCEPT_POLL: Duration = Duration::from_millis(200);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
}

#[derive(Clone)]
pub struct ControlContext {
    pub stats: Arc<Mutex<TimingStats>>,
    pub commands: Sender<ControlCommand>,
    pub shutdown: Arc<AtomicBool>,
}

pub struct ControlServer {
    path: PathBuf,
    run: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind the socket and start the accept thread. A bind failure is
    /// fatal to startup.
    pub fn bind(path: &Path, ctx: ControlContext) -> io::Result<Self> {
        // A stale socket file from an unclean shutdown would fail the bind.
        let _ = fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!(target: "control", path = %path.display(), "control_socket_listening");

        let run = Arc::new(AtomicBool::new(true));
        let accept_run = run.clone();
        let thread = thread::Builder::new()
            .name("control".into())
            .spawn(move || accept_loop(listener, ctx, accept_run))
            .expect("spawning the control thread");
        Ok(Self {
            path: path.to_path_buf(),
            run,
            thread: Some(thread),
        })
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = fs::remove_file(&self.path);
        debug!(target: "control", "control_socket_closed");
    }
}

fn accept_loop(listener: UnixListener, ctx: ControlContext, run: Arc<AtomicBool>) {
    while run.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => serve_client(stream, &ctx, &run),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                warn!(target: "control", %err, "control_accept_error");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_client(stream: UnixStream, ctx: &ControlContext, run: &AtomicBool) {
    let _ = stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT));
    let Ok(writer) = stream.try_clone() else {
        return;
    };
    let mut writer = writer;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while run.load(Ordering::Acquire) {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let response = respond(&line, ctx);
                if writer.write_all(response.as_bytes()).is_err()
                    || writer.write_all(b"\n").is_err()
                {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(_) => break,
        }
    }
}

/// Answer one command line.
pub fn respond(line: &str, ctx: &ControlContext) -> String {
    match line.trim() {
        "status" => {
            if ctx.shutdown.load(Ordering::Acquire) {
                "ok stopping".to_string()
            } else {
                "ok running".to_string()
            }
        }
        "stats" => serde_json::to_string(&*ctx.stats.lock())
            .unwrap_or_else(|_| "err stats unavailable".to_string()),
        "stop" => {
            info!(target: "control", "stop_requested");
            let _ = ctx.commands.try_send(ControlCommand::Stop);
            "ok stopping".to_string()
        }
        "" => "err empty command".to_string(),
        other => {
            debug!(target: "control", command = other, "unknown_command");
            "err unknown command".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> (ControlContext, crossbeam_channel::Receiver<ControlCommand>) {
        let (tx, rx) = crossbeam_channel::bounded(4);
        (
            ControlContext {
                stats: Arc::new(Mutex::new(TimingStats::default())),
                commands: tx,
                shutdown: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    #[test]
    fn known_commands_answer_ok() {
        let (ctx, rx) = test_ctx();
        assert_eq!(respond("status\n", &ctx), "ok running");
        assert_eq!(respond("stop\n", &ctx), "ok stopping");
        assert_eq!(rx.try_recv(), Ok(ControlCommand::Stop));

        ctx.shutdown.store(true, Ordering::Release);
        assert_eq!(respond("status", &ctx), "ok stopping");
    }

    #[test]
    fn stats_answer_is_one_json_line() {
        let (ctx, _rx) = test_ctx();
        ctx.stats.lock().scan_count = 42;
        let answer = respond("stats", &ctx);
        assert!(answer.contains("\"scan_count\":42"));
        assert!(!answer.contains('\n'));
    }

    #[test]
    fn unknown_and_empty_commands_answer_err() {
        let (ctx, _rx) = test_ctx();
        assert_eq!(respond("reboot\n", &ctx), "err unknown command");
        assert_eq!(respond("   \n", &ctx), "err empty command");
    }

    #[test]
    fn socket_lifecycle_binds_serves_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let (ctx, _rx) = test_ctx();
        let server = ControlServer::bind(&path, ctx).unwrap();
        assert!(path.exists());

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"status\n").unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut answer = String::new();
        reader.read_line(&mut answer).unwrap();
        assert_eq!(answer.trim_end(), "ok running");

        drop(stream);
        drop(server);
        assert!(!path.exists(), "socket file unlinked on teardown");
    }
}
