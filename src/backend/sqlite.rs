//! SQLite backend
//!
//! Each database is a file `<dbDir>/<name>.db`. Provisioning only creates
//! the directory; the file is created on open when `autoCreate` is set.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Connection, SqlitePool};

use super::{parse_bool, parse_usize, split_param, BackendAdapter, BackendKind};
use crate::entry::SubDatabase;
use crate::error::BackendError;
use crate::logging::{to_abs_path, EntryLogger};

const DEFAULT_PARAMS: &[&str] = &["cache=shared"];
/// Params understood by the connection URL itself.
const URL_PARAMS: &[&str] = &["mode", "cache", "immutable", "vfs"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqliteDbOptions {
    /// Relative paths resolve against the working directory. Empty means
    /// the working directory.
    pub db_dir: String,
    pub in_memory: bool,
}

#[derive(Debug, Clone)]
pub struct SqliteSpec {
    pub dir: PathBuf,
    pub file: PathBuf,
    pub url: String,
    pub in_memory: bool,
    pub options: SqliteConnectOptions,
    pub ignored: Vec<String>,
}

#[derive(Default)]
pub struct SqliteAdapter {
    logger: EntryLogger,
}

impl SqliteAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(mut self, logger: EntryLogger) -> Self {
        self.logger = logger;
        self
    }

    fn pool_options(db: &SubDatabase<SqliteDbOptions>) -> SqlitePoolOptions {
        let mut pool = SqlitePoolOptions::new();
        if let Some(max) = db.max_connections {
            pool = pool.max_connections(max);
        }
        if let Some(min) = db.min_connections {
            pool = pool.min_connections(min);
        }
        pool
    }
}

#[async_trait]
impl BackendAdapter for SqliteAdapter {
    type DbOptions = SqliteDbOptions;
    type Spec = SqliteSpec;
    type Handle = SqlitePool;

    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn address(&self) -> String {
        "local".to_string()
    }

    fn default_params(&self) -> &'static [&'static str] {
        DEFAULT_PARAMS
    }

    fn build_connection_spec(&self, db: &SubDatabase<SqliteDbOptions>) -> Result<SqliteSpec, BackendError> {
        let dir = if db.options.db_dir.is_empty() {
            std::env::current_dir()?
        } else {
            to_abs_path(&db.options.db_dir)?
        };
        let file = dir.join(format!("{}.db", db.name));

        let mut query: Vec<String> = Vec::new();
        let mut pragmas: Vec<(&str, &str, &String)> = Vec::new();
        for param in &db.params {
            let (key, value) = split_param(param)?;
            if URL_PARAMS.contains(&key) {
                query.push(format!("{}={}", key, value));
            } else {
                pragmas.push((key.trim_start_matches('_'), value, param));
            }
        }
        if db.options.in_memory && !query.iter().any(|q| q.starts_with("mode=")) {
            query.push("mode=memory".to_string());
        }

        let mut url = format!("sqlite://{}", file.display());
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }

        let mut options = SqliteConnectOptions::from_str(&url)?.create_if_missing(db.auto_create);
        let mut ignored = Vec::new();
        for (key, value, param) in pragmas {
            let invalid = |reason: String| BackendError::InvalidParam {
                param: param.clone(),
                reason,
            };
            options = match key {
                "journal_mode" => {
                    options.journal_mode(SqliteJournalMode::from_str(value).map_err(|e| invalid(e.to_string()))?)
                }
                "synchronous" => {
                    options.synchronous(SqliteSynchronous::from_str(value).map_err(|e| invalid(e.to_string()))?)
                }
                "busy_timeout" => options.busy_timeout(Duration::from_millis(parse_usize(param, value)? as u64)),
                "foreign_keys" => options.foreign_keys(parse_bool(param, value)?),
                _ => {
                    tracing::warn!("Ignoring unsupported SQLite param {} for database [{}]", param, db.name);
                    ignored.push(param.clone());
                    options
                }
            };
        }

        Ok(SqliteSpec {
            dir,
            file,
            url,
            in_memory: db.options.in_memory,
            options: self.logger.apply(options),
            ignored,
        })
    }

    async fn provision_if_missing(
        &self,
        _db: &SubDatabase<SqliteDbOptions>,
        spec: &SqliteSpec,
    ) -> Result<(), BackendError> {
        if !spec.in_memory {
            tokio::fs::create_dir_all(&spec.dir).await?;
        }
        Ok(())
    }

    async fn open(&self, db: &SubDatabase<SqliteDbOptions>, spec: SqliteSpec) -> Result<SqlitePool, BackendError> {
        Self::pool_options(db)
            .connect_with(spec.options)
            .await
            .map_err(|e| {
                self.logger.report_query_error(&db.name, &e);
                e.into()
            })
    }

    fn open_offline(
        &self,
        db: &SubDatabase<SqliteDbOptions>,
        spec: SqliteSpec,
    ) -> Result<Option<SqlitePool>, BackendError> {
        Ok(Some(Self::pool_options(db).connect_lazy_with(spec.options)))
    }

    async fn ping(&self, pool: &SqlitePool) -> Result<(), BackendError> {
        pool.acquire().await?.ping().await?;
        Ok(())
    }

    async fn close(&self, pool: SqlitePool) -> Result<(), BackendError> {
        pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db(dir: &str, params: &[&str]) -> SubDatabase<SqliteDbOptions> {
        SubDatabase::new("cache")
            .params(params.iter().copied())
            .options(SqliteDbOptions {
                db_dir: dir.to_string(),
                in_memory: false,
            })
    }

    #[test]
    fn test_file_location() {
        let adapter = SqliteAdapter::new();
        let spec = adapter
            .build_connection_spec(&db("/tmp/entries", &["cache=shared"]))
            .unwrap();

        assert_eq!(spec.file, PathBuf::from("/tmp/entries/cache.db"));
        assert_eq!(spec.url, "sqlite:///tmp/entries/cache.db?cache=shared");
        assert!(spec.ignored.is_empty());
    }

    #[test]
    fn test_relative_dir_resolves_against_cwd() {
        let spec = SqliteAdapter::new().build_connection_spec(&db("data", &[])).unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(spec.dir, cwd.join("data"));

        let spec = SqliteAdapter::new().build_connection_spec(&db("", &[])).unwrap();
        assert_eq!(spec.file, cwd.join("cache.db"));
    }

    #[test]
    fn test_in_memory_and_pragmas() {
        let mut database = db("/tmp", &["_journal_mode=WAL", "busy_timeout=500", "cache_size=10"]);
        database.options.in_memory = true;

        let spec = SqliteAdapter::new().build_connection_spec(&database).unwrap();
        assert!(spec.url.ends_with("?mode=memory"));
        assert_eq!(spec.ignored, vec!["cache_size=10"]);
    }

    #[test]
    fn test_invalid_pragma() {
        let result = SqliteAdapter::new().build_connection_spec(&db("/tmp", &["journal_mode=sideways"]));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_provision_open_ping_close() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").to_string_lossy().into_owned();
        let adapter = SqliteAdapter::new();
        let database = db(&dir, &[]).auto_create(true);

        let spec = adapter.build_connection_spec(&database).unwrap();
        let file = spec.file.clone();
        adapter.provision_if_missing(&database, &spec).await.unwrap();
        let pool = adapter.open(&database, spec).await.unwrap();

        adapter.ping(&pool).await.unwrap();
        assert!(file.exists());
        adapter.close(pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_without_auto_create_fails_for_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("entry.log");
        let logger = EntryLogger::from_section(
            "cache",
            &crate::config::LoggerSection {
                output_paths: vec![log.to_string_lossy().into_owned()],
                ..Default::default()
            },
        )
        .unwrap();
        let adapter = SqliteAdapter::new().with_logger(logger);
        let database = db(&tmp.path().join("data").to_string_lossy(), &[]);

        let spec = adapter.build_connection_spec(&database).unwrap();
        assert!(adapter.open(&database, spec).await.is_err());

        let written = std::fs::read_to_string(&log).unwrap();
        assert!(written.contains("Query failed"));
        assert!(written.contains("database=cache"));
    }
}
