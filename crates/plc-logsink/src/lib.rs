//! Logging assembly: stdout plus a reconnecting log-collector transport.
//!
//! Every event always reaches standard output through a regular fmt layer.
//! When a collector socket path is configured, a second layer formats each
//! event as
//!
//! ```text
//! [YYYY-MM-DD HH:MM:SS] [LEVEL] message
//! ```
//!
//! and hands the line to a non-blocking worker whose writer owns a
//! Unix-domain stream connection to the collector. While the collector is
//! unreachable the writer retries at most once per second and the lines are
//! dropped; stdout is unaffected.

use std::fmt;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{Event, Subscriber, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Keeps the non-blocking shipping worker alive; drop on shutdown to flush.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Install the global subscriber. `collector` is the optional Unix-domain
/// socket path of the log collector. Safe to call more than once (later
/// calls keep the first subscriber, as in tests).
pub fn init(collector: Option<&Path>) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(io::stdout);

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer);

    let worker = match collector {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(SocketWriter::new(path));
            let ship_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .event_format(ShipFormat)
                .with_writer(writer);
            // A second subscriber in the same process (tests) keeps the
            // first one; the guard still tears the worker down cleanly.
            let _ = registry.with(ship_layer).try_init();
            Some(guard)
        }
        None => {
            let _ = registry.try_init();
            None
        }
    };
    let collector_path = collector.map(|p| p.display().to_string());
    info!(
        target: "log.ship",
        collector = collector_path.as_deref(),
        "logging_initialized"
    );
    LogGuard { _worker: worker }
}

/// The collector line format: `[timestamp] [LEVEL] fields`.
struct ShipFormat;

impl<S, N> FormatEvent<S, N> for ShipFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        write!(writer, "[{ts}] [{}] ", event.metadata().level())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// A Unix-stream writer that reconnects in the background of the logging
/// worker thread. Lines written while disconnected are dropped; a write
/// error drops the connection so the next line retries.
pub struct SocketWriter {
    path: PathBuf,
    stream: Option<UnixStream>,
    last_attempt: Option<Instant>,
}

impl SocketWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            stream: None,
            last_attempt: None,
        }
    }

    fn ensure_connected(&mut self) {
        if self.stream.is_some() {
            return;
        }
        let due = match self.last_attempt {
            None => true,
            Some(at) => at.elapsed() >= RECONNECT_INTERVAL,
        };
        if !due {
            return;
        }
        self.last_attempt = Some(Instant::now());
        match UnixStream::connect(&self.path) {
            Ok(stream) => {
                self.stream = Some(stream);
            }
            Err(_) => {
                // Collector absent; retry on a later line.
            }
        }
    }

    #[cfg(test)]
    fn force_retry(&mut self) {
        self.last_attempt = None;
    }
}

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_connected();
        if let Some(stream) = &mut self.stream
            && stream.write_all(buf).is_err()
        {
            // Trigger reconnection; the current line is lost.
            self.stream = None;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stream) = &mut self.stream {
            let _ = stream.flush();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;
    use std::sync::{Arc, Mutex};
    use tracing::subscriber::with_default;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct BufferWriter {
        inner: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for BufferWriter {
        type Writer = BufferWriter;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn ship_format_matches_the_collector_contract() {
        let buffer = BufferWriter::default();
        let inner = buffer.inner.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .event_format(ShipFormat)
            .with_writer(buffer)
            .finish();

        with_default(subscriber, || {
            tracing::warn!("valve stuck");
        });

        let text = String::from_utf8(inner.lock().unwrap().clone()).unwrap();
        let line = text.lines().next().expect("one log line");
        // [YYYY-MM-DD HH:MM:SS] [WARN] valve stuck
        assert_eq!(&line[0..1], "[");
        assert_eq!(&line[5..6], "-");
        assert_eq!(&line[8..9], "-");
        assert_eq!(&line[11..12], " ");
        assert_eq!(&line[20..22], "] ");
        assert!(line.contains("[WARN] "), "line was: {line}");
        assert!(line.ends_with("valve stuck"), "line was: {line}");
    }

    #[test]
    fn writer_ships_lines_to_a_listening_collector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut writer = SocketWriter::new(&path);
        writer.write_all(b"[2026-08-01 12:00:00] [INFO] hello\n").unwrap();

        let (mut conn, _) = listener.accept().unwrap();
        let mut received = [0u8; 64];
        let n = conn.read(&mut received).unwrap();
        assert_eq!(&received[..n], b"[2026-08-01 12:00:00] [INFO] hello\n");
    }

    #[test]
    fn writer_drops_lines_and_reconnects_when_collector_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.sock");

        let mut writer = SocketWriter::new(&path);
        // No listener yet: the write succeeds from the caller's point of
        // view and the line is dropped.
        writer.write_all(b"dropped\n").unwrap();

        let listener = UnixListener::bind(&path).unwrap();
        writer.force_retry();
        writer.write_all(b"delivered\n").unwrap();

        let (mut conn, _) = listener.accept().unwrap();
        let mut received = [0u8; 64];
        let n = conn.read(&mut received).unwrap();
        assert_eq!(&received[..n], b"delivered\n");
    }
}
