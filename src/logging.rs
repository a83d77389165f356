//! Tracing setup with a filter and log file that follow configuration reloads.
//!
//! Human-readable output goes to stdout. A JSON copy of every event goes to
//! the configured log file, which is reopened for each generation.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::{AppConfig, DEFAULT_LOG_FILTER};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("Failed to update log filter: {0}")]
    Reload(#[from] reload::Error),

    #[error("Failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Handle for adjusting logging after each configuration load.
pub struct LogControl {
    filter: reload::Handle<EnvFilter, Registry>,
    file: LogFile,
    /// Filter from the command line or `RUST_LOG`; wins over the config.
    fixed_filter: Option<String>,
}

impl LogControl {
    /// Install the global subscriber.
    ///
    /// Priority: CLI > env > config. Until a configuration is applied the
    /// default filter is used.
    pub fn init(cli_filter: Option<String>) -> Result<Self, LoggingError> {
        let fixed_filter = cli_filter.or_else(|| std::env::var("RUST_LOG").ok());
        let initial = fixed_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);

        let (filter_layer, filter) = reload::Layer::new(EnvFilter::try_new(initial)?);
        let file = LogFile::default();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer())
            .with(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(file.clone()),
            )
            .try_init()?;

        Ok(Self {
            filter,
            file,
            fixed_filter,
        })
    }

    /// Apply `logLevel` and `logFile` from a freshly loaded configuration.
    pub fn apply(&self, config: &AppConfig) -> Result<(), LoggingError> {
        if self.fixed_filter.is_none() {
            self.filter
                .reload(EnvFilter::try_new(config.log_filter())?)?;
        }

        match config.log_file() {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| LoggingError::File {
                        path: path.to_path_buf(),
                        source,
                    })?;
                self.file.replace(Some(file));
                tracing::debug!(path = %path.display(), "Logging to file");
            }
            None => self.file.replace(None),
        }
        Ok(())
    }
}

/// Swappable file sink; writes are dropped while no file is open.
#[derive(Clone, Default)]
pub struct LogFile {
    file: Arc<Mutex<Option<File>>>,
}

impl LogFile {
    fn replace(&self, file: Option<File>) {
        *self.file.lock().unwrap_or_else(PoisonError::into_inner) = file;
    }
}

pub struct LogFileWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            file: self.file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_log_file_swaps_target() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.log");
        let second = dir.path().join("second.log");
        let sink = LogFile::default();

        sink.make_writer().write_all(b"dropped\n").unwrap();

        sink.replace(Some(File::create(&first).unwrap()));
        sink.make_writer().write_all(b"one\n").unwrap();

        sink.replace(Some(File::create(&second).unwrap()));
        sink.make_writer().write_all(b"two\n").unwrap();

        sink.replace(None);
        sink.make_writer().write_all(b"dropped\n").unwrap();

        let mut contents = String::new();
        File::open(&first)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "one\n");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "two\n");
    }
}
