use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "LETS_LOG";

/// Run logs always record the client's own debug events.
const RUN_LOG_DIRECTIVE: &str = "warn,lets_core=debug,lets=debug";

static RUN_LOGGER: OnceLock<RunLogger> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug)]
struct RunState {
    writer: Option<BufWriter<std::fs::File>>,
}

#[derive(Debug)]
struct RunLogger {
    state: Mutex<RunState>,
}

impl RunLogger {
    fn new() -> Self {
        Self {
            state: Mutex::new(RunState { writer: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.lock();
        if guard.writer.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "run log already active",
            ));
        }

        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        guard.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn finish(&self) -> std::io::Result<()> {
        let mut guard = self.lock();
        let Some(mut writer) = guard.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

enum RunLogWriter<'a> {
    Sink(std::io::Sink),
    Guard(MutexGuard<'a, RunState>),
}

impl Write for RunLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Sink(sink) => sink.write(buf),
            Self::Guard(guard) => match guard.writer.as_mut() {
                Some(writer) => writer.write(buf),
                None => Ok(buf.len()),
            },
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Sink(sink) => sink.flush(),
            Self::Guard(guard) => match guard.writer.as_mut() {
                Some(writer) => writer.flush(),
                None => Ok(()),
            },
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = self.lock();
        if guard.writer.is_some() {
            RunLogWriter::Guard(guard)
        } else {
            RunLogWriter::Sink(std::io::sink())
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(lets_log: Option<&str>, rust_log: Option<&str>, default: &str) -> EnvFilter {
    let fallback = || EnvFilter::new(default);

    if let Some(v) = lets_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| fallback());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| fallback());
    }
    fallback()
}

fn stderr_filter(verbose: bool) -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
        if verbose { "debug" } else { "warn" },
    )
}

/// Installs the process-wide subscriber: human-readable events on stderr plus the
/// NDJSON run log layer, which stays silent until [`start_run_log`] opens a file.
/// Later calls are no-ops.
pub fn init_logging(verbose: bool) {
    TRACING_INIT.get_or_init(|| {
        let logger = RUN_LOGGER.get_or_init(RunLogger::new);

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(stderr_filter(verbose));

        let run_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(logger)
            .with_filter(EnvFilter::new(RUN_LOG_DIRECTIVE));

        let _ = tracing_subscriber::registry()
            .with(stderr_layer)
            .with(run_layer)
            .try_init();
    });
}

pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(logger) = RUN_LOGGER.get() {
            let _ = logger.finish();
        }
    }
}

/// Opens `<config_dir>/logs/deploy-<utc>-<project>.ndjson` for the current deploy run.
/// The file is flushed and synced when the guard drops.
pub fn start_run_log(config_dir: &Path, project: &str) -> std::io::Result<RunLogGuard> {
    init_logging(false);

    let log_dir = config_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_name = format!(
        "deploy-{}-{}.ndjson",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(project)
    );
    let path = log_dir.join(file_name);

    let logger = RUN_LOGGER.get_or_init(RunLogger::new);
    logger.start(&path)?;

    Ok(RunLogGuard { path })
}

fn sanitize_filename_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() {
        "project".to_string()
    } else {
        cleaned
    }
}
