//! Log setup: `tracing` to stderr, or to a file via a non-blocking appender.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Installs the global subscriber.
///
/// The returned guard flushes the file appender on drop; `main` must keep it
/// alive for the lifetime of the process.
pub fn init(log_file: Option<&Path>, log_level: Option<&str>) -> Result<Option<WorkerGuard>, Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter(log_level)?.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        None => {
            builder.with_writer(io::stderr).init();

            Ok(None)
        }
        Some(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .map_err(|source| Error::OpenLogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            let (writer, guard) = tracing_appender::non_blocking(file);

            builder.with_writer(writer).with_ansi(false).init();

            Ok(Some(guard))
        }
    }
}

fn level_filter(log_level: Option<&str>) -> Result<LevelFilter, Error> {
    let level = match log_level {
        None => return Ok(LevelFilter::INFO),
        Some(level) => level,
    };

    match level.to_ascii_lowercase().as_str() {
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        // `tracing` has no CRITICAL; the next-severest level is ERROR.
        "error" | "critical" => Ok(LevelFilter::ERROR),
        other => Err(Error::UnknownLevel(other.to_owned())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open log file `{path}`")]
    OpenLogFile { path: String, source: io::Error },
    #[error("unknown log level `{0}`")]
    UnknownLevel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_configured_levels() {
        assert_eq!(level_filter(None).unwrap(), LevelFilter::INFO);
        assert_eq!(level_filter(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
        assert_eq!(level_filter(Some("critical")).unwrap(), LevelFilter::ERROR);
        assert!(level_filter(Some("verbose")).is_err());
    }
}
