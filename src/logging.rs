//! Per-entry logger adapter
//!
//! Maps the `logger:` block of an entry onto sqlx statement logging and,
//! when the entry asks for its own encoding or output paths, onto a
//! dedicated `tracing::Dispatch` used while the entry bootstraps, probes
//! and shuts down.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

use crate::backend::BackendKind;
use crate::config::LoggerSection;
use crate::error::ConfigError;

pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(5000);
const DEFAULT_LOGGER_ENTRY: &str = "default";

/// Verbosity of statement logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Silent,
    Error,
    #[default]
    Warn,
    Info,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(LogLevel::Silent),
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            other => Err(format!("unknown level {}, expected silent|error|warn|info", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Console,
    Json,
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(Encoding::Console),
            "json" => Ok(Encoding::Json),
            other => Err(format!("unknown encoding {}, expected console|json", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntryLogger {
    logger_entry: String,
    level: LogLevel,
    slow_threshold: Duration,
    ignore_record_not_found: bool,
    dispatch: Option<Dispatch>,
}

impl Default for EntryLogger {
    fn default() -> Self {
        Self {
            logger_entry: DEFAULT_LOGGER_ENTRY.to_string(),
            level: LogLevel::default(),
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            ignore_record_not_found: false,
            dispatch: None,
        }
    }
}

impl EntryLogger {
    pub fn from_section(entry: &str, section: &LoggerSection) -> Result<Self, ConfigError> {
        let invalid = |field: &'static str, reason: String| ConfigError::Invalid {
            entry: entry.to_string(),
            field,
            reason,
        };

        let level = if section.level.is_empty() {
            LogLevel::default()
        } else {
            section
                .level
                .parse()
                .map_err(|e| invalid("logger.level", e))?
        };

        let encoding = if section.encoding.is_empty() {
            Encoding::default()
        } else {
            section
                .encoding
                .parse()
                .map_err(|e| invalid("logger.encoding", e))?
        };

        let slow_threshold = if section.slow_threshold_ms > 0 {
            Duration::from_millis(section.slow_threshold_ms)
        } else {
            DEFAULT_SLOW_THRESHOLD
        };

        let dispatch = if encoding == Encoding::Json || !section.output_paths.is_empty() {
            Some(build_dispatch(entry, encoding, &section.output_paths)?)
        } else {
            None
        };

        Ok(Self {
            logger_entry: if section.entry.is_empty() {
                DEFAULT_LOGGER_ENTRY.to_string()
            } else {
                section.entry.clone()
            },
            level,
            slow_threshold,
            ignore_record_not_found: section.ignore_record_not_found_error,
            dispatch,
        })
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Whether `level` or the slow threshold differ from the defaults.
    pub fn customizes_statements(&self) -> bool {
        self.level != LogLevel::default() || self.slow_threshold != DEFAULT_SLOW_THRESHOLD
    }

    pub fn has_dedicated_output(&self) -> bool {
        self.dispatch.is_some()
    }

    /// Level every executed statement is logged at.
    pub fn statement_level(&self) -> LevelFilter {
        match self.level {
            LogLevel::Info => LevelFilter::Info,
            _ => LevelFilter::Off,
        }
    }

    /// Level statements slower than the threshold are logged at.
    pub fn slow_statement_level(&self) -> LevelFilter {
        match self.level {
            LogLevel::Silent | LogLevel::Error => LevelFilter::Off,
            LogLevel::Warn | LogLevel::Info => LevelFilter::Warn,
        }
    }

    /// Apply statement logging to sqlx connect options.
    pub fn apply<O: sqlx::ConnectOptions>(&self, options: O) -> O {
        options
            .log_statements(self.statement_level())
            .log_slow_statements(self.slow_statement_level(), self.slow_threshold)
    }

    /// Whether a query error should be logged for this entry.
    pub fn should_report(&self, err: &sqlx::Error) -> bool {
        match self.level {
            LogLevel::Silent => false,
            _ => !(self.ignore_record_not_found && matches!(err, sqlx::Error::RowNotFound)),
        }
    }

    /// Log a query error if this entry is configured to report it.
    pub fn report_query_error(&self, database: &str, err: &sqlx::Error) {
        if !self.should_report(err) {
            return;
        }
        let emit = || tracing::error!(logger = %self.logger_entry, database = %database, "Query failed: {}", err);
        match &self.dispatch {
            Some(d) => tracing::dispatcher::with_default(d, emit),
            None => emit(),
        }
    }

    /// Run `fut` inside the entry span, routed to the dedicated output if any.
    pub(crate) fn scope<F>(
        &self,
        entry: &str,
        kind: BackendKind,
        fut: F,
    ) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let dispatch = self.dispatch.clone();
        let span = match &dispatch {
            Some(d) => tracing::dispatcher::with_default(d, || self.span(entry, kind)),
            None => self.span(entry, kind),
        };
        let fut = fut.instrument(span);

        async move {
            match dispatch {
                Some(d) => fut.with_subscriber(d).await,
                None => fut.await,
            }
        }
    }

    fn span(&self, entry: &str, kind: BackendKind) -> tracing::Span {
        tracing::info_span!(
            "entry",
            entry = %entry,
            kind = %kind,
            logger = %self.logger_entry
        )
    }
}

fn build_dispatch(entry: &str, encoding: Encoding, paths: &[String]) -> Result<Dispatch, ConfigError> {
    let writer = make_writer(entry, paths)?;
    let builder = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO);

    let dispatch = match encoding {
        Encoding::Json => Dispatch::new(builder.json().finish()),
        Encoding::Console => Dispatch::new(builder.finish()),
    };

    Ok(dispatch)
}

fn make_writer(entry: &str, paths: &[String]) -> Result<BoxMakeWriter, ConfigError> {
    let mut writers = paths
        .iter()
        .map(|p| open_output(entry, p))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter();

    let first = match writers.next() {
        Some(w) => w,
        None => return Ok(BoxMakeWriter::new(std::io::stdout)),
    };

    Ok(writers.fold(first, |acc, next| BoxMakeWriter::new(acc.and(next))))
}

fn open_output(entry: &str, path: &str) -> Result<BoxMakeWriter, ConfigError> {
    let logger_err = |reason: String| ConfigError::Logger {
        entry: entry.to_string(),
        reason,
    };

    match path {
        "stdout" => Ok(BoxMakeWriter::new(std::io::stdout)),
        "stderr" => Ok(BoxMakeWriter::new(std::io::stderr)),
        _ => {
            let path = to_abs_path(path).map_err(|e| logger_err(e.to_string()))?;
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .ok_or_else(|| logger_err(format!("{} has no file name", path.display())))?;
            let dir = path.parent().unwrap_or_else(|| Path::new("/"));

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file_name)
                .build(dir)
                .map_err(|e| logger_err(e.to_string()))?;

            Ok(BoxMakeWriter::new(appender))
        }
    }
}

/// Relative paths are resolved against the working directory.
pub(crate) fn to_abs_path(path: impl AsRef<Path>) -> std::io::Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(level: &str) -> LoggerSection {
        LoggerSection {
            level: level.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let logger = EntryLogger::from_section("ut", &LoggerSection::default()).unwrap();
        assert_eq!(logger.level(), LogLevel::Warn);
        assert_eq!(logger.slow_threshold(), DEFAULT_SLOW_THRESHOLD);
        assert!(!logger.has_dedicated_output());
        assert_eq!(logger.statement_level(), LevelFilter::Off);
        assert_eq!(logger.slow_statement_level(), LevelFilter::Warn);
    }

    #[test]
    fn test_level_mapping() {
        let info = EntryLogger::from_section("ut", &section("INFO")).unwrap();
        assert_eq!(info.statement_level(), LevelFilter::Info);
        assert_eq!(info.slow_statement_level(), LevelFilter::Warn);

        let silent = EntryLogger::from_section("ut", &section("silent")).unwrap();
        assert_eq!(silent.statement_level(), LevelFilter::Off);
        assert_eq!(silent.slow_statement_level(), LevelFilter::Off);
        assert!(!silent.should_report(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_invalid_level_and_encoding() {
        let err = EntryLogger::from_section("ut", &section("verbose")).unwrap_err();
        assert!(err.to_string().contains("logger.level"));

        let bad_encoding = LoggerSection {
            encoding: "xml".to_string(),
            ..Default::default()
        };
        assert!(EntryLogger::from_section("ut", &bad_encoding).is_err());
    }

    #[test]
    fn test_ignore_record_not_found() {
        let logger = EntryLogger::from_section(
            "ut",
            &LoggerSection {
                ignore_record_not_found_error: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(!logger.should_report(&sqlx::Error::RowNotFound));
        assert!(logger.should_report(&sqlx::Error::PoolTimedOut));
        assert!(EntryLogger::default().should_report(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_slow_threshold_override() {
        let logger = EntryLogger::from_section(
            "ut",
            &LoggerSection {
                slow_threshold_ms: 250,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(logger.slow_threshold(), Duration::from_millis(250));
    }

    #[test]
    fn test_json_output_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("entry.log");
        let logger = EntryLogger::from_section(
            "ut",
            &LoggerSection {
                encoding: "json".to_string(),
                output_paths: vec![path.to_string_lossy().into_owned(), "stdout".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert!(logger.has_dedicated_output());
    }

    #[test]
    fn test_query_errors_written_to_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.log");
        let logger = EntryLogger::from_section(
            "ut",
            &LoggerSection {
                entry: "audit".to_string(),
                ignore_record_not_found_error: true,
                output_paths: vec![path.to_string_lossy().into_owned()],
                ..Default::default()
            },
        )
        .unwrap();

        logger.report_query_error("orders", &sqlx::Error::RowNotFound);
        logger.report_query_error("orders", &sqlx::Error::PoolTimedOut);

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("Query failed"));
        assert!(written.contains("database=orders"));
        assert!(written.contains("logger=audit"));
        assert!(!written.contains("no rows"));
    }

    #[test]
    fn test_customizes_statements() {
        assert!(!EntryLogger::default().customizes_statements());
        assert!(EntryLogger::from_section("ut", &section("info")).unwrap().customizes_statements());
        let slow = LoggerSection {
            slow_threshold_ms: 100,
            ..Default::default()
        };
        assert!(EntryLogger::from_section("ut", &slow).unwrap().customizes_statements());
    }

    #[test]
    fn test_to_abs_path() {
        let abs = to_abs_path("ut-path").unwrap();
        assert!(abs.is_absolute());
        assert!(abs.ends_with("ut-path"));

        let already = to_abs_path("/var/log/db.log").unwrap();
        assert_eq!(already, PathBuf::from("/var/log/db.log"));
    }
}
