//! Process heartbeat watchdog.
//!
//! The executive stamps a shared wall-clock heartbeat at the top of every
//! tick; this thread samples it once per second and complains when the
//! scan loop stops making progress. External watchdogs can watch the same
//! symptom through the control plane.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Heartbeat staleness threshold in seconds.
const STALE_AFTER: i64 = 5;

pub fn unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn spawn(heartbeat: Arc<AtomicI64>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("watchdog".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                let last = heartbeat.load(Ordering::Relaxed);
                let stale = unix_secs() - last;
                if stale > STALE_AFTER {
                    warn!(
                        target: "exec.watchdog",
                        stale_seconds = stale,
                        "heartbeat_stale"
                    );
                }
            }
        })
        .expect("spawning the watchdog thread")
}
