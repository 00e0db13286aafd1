use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "AUDIT_ETL_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    Stdout,
    /// Keeps stdout clean for command output.
    Stderr,
}

/// Flushes the log file when dropped.
pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

pub fn resolve_level(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    match env_level {
        Some(level) if !level.trim().is_empty() => level.trim().to_string(),
        _ => "info".to_string(),
    }
}

pub fn init_logging(log_file: Option<&Path>, debug: bool, console: Console) -> Option<LogGuard> {
    let level = resolve_level(debug, std::env::var(LOG_LEVEL_ENV).ok());
    let filter = if debug {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    let guard = match log_file {
        Some(path) => match open_shared_log_file(path) {
            Ok(file) => LogGuard { file: Some(file) },
            Err(err) => {
                eprintln!("log_file_error: {}: {err}", path.display());
                LogGuard { file: None }
            }
        },
        None => LogGuard { file: None },
    };
    let subscriber = build_subscriber(filter, console, guard.file.clone());
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

pub fn build_subscriber(
    filter: EnvFilter,
    console: Console,
    file: Option<Arc<Mutex<File>>>,
) -> impl Subscriber + Send + Sync + 'static {
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(console, file.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish()
}

pub fn open_shared_log_file(path: &Path) -> io::Result<Arc<Mutex<File>>> {
    open_log_file(path).map(|file| Arc::new(Mutex::new(file)))
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

struct MultiWriter {
    console: Console,
    file: Option<Arc<Mutex<File>>>,
}

impl MultiWriter {
    fn new(console: Console, file: Option<Arc<Mutex<File>>>) -> Self {
        Self { console, file }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = match self.console {
            Console::Stdout => io::stdout().write_all(buf),
            Console::Stderr => io::stderr().write_all(buf),
        };
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = match self.console {
            Console::Stdout => io::stdout().flush(),
            Console::Stderr => io::stderr().flush(),
        };
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}
