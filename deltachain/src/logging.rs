//! Process-global log sink.
//!
//! One `tracing` subscriber is installed on first use with two fmt layers:
//! a console layer and a file layer. Their levels, the console mode and
//! the log file can be changed at any time through the functions below;
//! the settings apply to every `Descriptor` in the process. `RUST_LOG`,
//! when set, filters on top of both layers.

use std::fmt as std_fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use deltachain_shared::errors::{DeltaError, DeltaResult};
use parking_lot::Mutex;
use tracing::{Level, Metadata};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Console verbosity settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerboseLevel {
    /// No console output at all.
    NoConsole,
    /// Everything goes to stderr, nothing to stdout.
    NoStdout,
    /// Prefix console lines with a timestamp.
    Timestamps,
    /// 0 errors only, 1 warnings, 2 info, 3 debug, 4 and up trace.
    Level(u8),
}

const CONSOLE_NORMAL: u8 = 0;
const CONSOLE_OFF: u8 = 1;
const CONSOLE_STDERR_ONLY: u8 = 2;

const DEFAULT_CONSOLE_LEVEL: u8 = 1;
const DEFAULT_FILE_LEVEL: u8 = 2;

static CONSOLE_MODE: AtomicU8 = AtomicU8::new(CONSOLE_NORMAL);
static CONSOLE_LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_CONSOLE_LEVEL);
static CONSOLE_TIMESTAMPS: AtomicBool = AtomicBool::new(false);
static FILE_LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_FILE_LEVEL);

struct FileSink {
    writer: NonBlocking,
    _guard: WorkerGuard,
}

static FILE_SINK: Mutex<Option<FileSink>> = parking_lot::const_mutex(None);
static INSTALLED: OnceLock<()> = OnceLock::new();

/// Set console verbosity or console mode.
pub fn set_verbose_level(level: VerboseLevel) {
    install();
    match level {
        VerboseLevel::NoConsole => CONSOLE_MODE.store(CONSOLE_OFF, Ordering::Relaxed),
        VerboseLevel::NoStdout => CONSOLE_MODE.store(CONSOLE_STDERR_ONLY, Ordering::Relaxed),
        VerboseLevel::Timestamps => CONSOLE_TIMESTAMPS.store(true, Ordering::Relaxed),
        VerboseLevel::Level(n) => {
            CONSOLE_MODE.store(CONSOLE_NORMAL, Ordering::Relaxed);
            CONSOLE_LEVEL.store(n, Ordering::Relaxed);
        }
    }
}

/// Send log output to `path` (appending), replacing any previous file.
pub fn set_log_file(path: &Path) -> DeltaResult<()> {
    install();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DeltaError::io(format!("failed to open log file {}", path.display()), e))?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    // Dropping the old guard flushes the previous file.
    *FILE_SINK.lock() = Some(FileSink {
        writer,
        _guard: guard,
    });
    tracing::debug!(log_file = %path.display(), "Log file opened");
    Ok(())
}

/// Stop logging to a file, flushing pending lines.
pub fn close_log_file() {
    FILE_SINK.lock().take();
}

/// Set the file log level (same scale as [`VerboseLevel::Level`]).
pub fn set_log_level(level: u8) {
    install();
    FILE_LEVEL.store(level, Ordering::Relaxed);
}

/// Install the subscriber if nobody did yet.
///
/// Another global subscriber installed by the application wins; the
/// controls above then have no effect.
pub fn install() {
    INSTALLED.get_or_init(|| {
        let console = fmt::layer()
            .with_writer(ConsoleWriter)
            .with_timer(ToggleTime)
            .with_target(false)
            .with_ansi(false)
            .with_filter(filter_fn(|meta| {
                CONSOLE_MODE.load(Ordering::Relaxed) != CONSOLE_OFF
                    && allows(CONSOLE_LEVEL.load(Ordering::Relaxed), meta)
            }));

        let file = fmt::layer()
            .with_writer(FileWriter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(false)
            .with_filter(filter_fn(|meta| {
                FILE_SINK.lock().is_some() && allows(FILE_LEVEL.load(Ordering::Relaxed), meta)
            }));

        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().ok())
            .with(console)
            .with(file)
            .try_init();
    });
}

fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn allows(verbosity: u8, meta: &Metadata<'_>) -> bool {
    *meta.level() <= level_for(verbosity)
}

struct ToggleTime;

impl FormatTime for ToggleTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std_fmt::Result {
        if CONSOLE_TIMESTAMPS.load(Ordering::Relaxed) {
            SystemTime.format_time(w)
        } else {
            Ok(())
        }
    }
}

/// Warnings and errors go to stderr, the rest to stdout unless the
/// console is in stderr-only mode.
struct ConsoleWriter;

enum ConsoleStream {
    Out(io::Stdout),
    Err(io::Stderr),
}

impl Write for ConsoleStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ConsoleStream::Out(s) => s.write(buf),
            ConsoleStream::Err(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ConsoleStream::Out(s) => s.flush(),
            ConsoleStream::Err(s) => s.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for ConsoleWriter {
    type Writer = ConsoleStream;

    fn make_writer(&'a self) -> Self::Writer {
        ConsoleStream::Err(io::stderr())
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        let stderr_only = CONSOLE_MODE.load(Ordering::Relaxed) == CONSOLE_STDERR_ONLY;
        if stderr_only || *meta.level() <= Level::WARN {
            ConsoleStream::Err(io::stderr())
        } else {
            ConsoleStream::Out(io::stdout())
        }
    }
}

struct FileWriter;

enum FileStream {
    File(NonBlocking),
    Discard,
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileStream::File(w) => w.write(buf),
            FileStream::Discard => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileStream::File(w) => w.flush(),
            FileStream::Discard => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for FileWriter {
    type Writer = FileStream;

    fn make_writer(&'a self) -> Self::Writer {
        match FILE_SINK.lock().as_ref() {
            Some(sink) => FileStream::File(sink.writer.clone()),
            None => FileStream::Discard,
        }
    }
}
