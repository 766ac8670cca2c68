//! Connection plugins
//!
//! Hooks run right after a database handle opens. A failing plugin fails
//! the open and the handle is closed.

use async_trait::async_trait;
use sqlx::{Executor, MySqlPool, PgPool, SqlitePool};

use crate::error::BackendError;
use crate::logging::EntryLogger;

#[async_trait]
pub trait ConnectionPlugin<H>: Send + Sync
where
    H: Send + Sync,
{
    fn name(&self) -> &str;

    /// `logger` is the owning entry's logger, for reporting failures.
    async fn on_open(&self, database: &str, handle: &H, logger: &EntryLogger) -> Result<(), BackendError>;
}

/// Runs a fixed list of statements on every freshly opened sqlx pool,
/// e.g. schema setup for an embedded SQLite file.
#[derive(Debug, Clone)]
pub struct InitStatements {
    name: String,
    statements: Vec<String>,
}

impl InitStatements {
    pub fn new(name: impl Into<String>, statements: Vec<String>) -> Self {
        Self {
            name: name.into(),
            statements,
        }
    }
}

macro_rules! impl_init_statements {
    ($($pool:ty),+) => {
        $(
            #[async_trait]
            impl ConnectionPlugin<$pool> for InitStatements {
                fn name(&self) -> &str {
                    &self.name
                }

                async fn on_open(
                    &self,
                    database: &str,
                    pool: &$pool,
                    logger: &EntryLogger,
                ) -> Result<(), BackendError> {
                    for statement in &self.statements {
                        if let Err(e) = pool.execute(statement.as_str()).await {
                            logger.report_query_error(database, &e);
                            return Err(e.into());
                        }
                    }
                    tracing::debug!(
                        "Plugin {} ran {} statements on database [{}]",
                        self.name,
                        self.statements.len(),
                        database
                    );
                    Ok(())
                }
            }
        )+
    };
}

impl_init_statements!(MySqlPool, PgPool, SqlitePool);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggerSection;

    async fn memory_pool() -> SqlitePool {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_init_statements_run_in_order() {
        let pool = memory_pool().await;
        let plugin = InitStatements::new(
            "schema",
            vec![
                "CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)".to_string(),
                "INSERT INTO kv VALUES ('a', '1')".to_string(),
            ],
        );

        plugin.on_open("main", &pool, &EntryLogger::default()).await.unwrap();

        let (v,): (String,) = sqlx::query_as("SELECT v FROM kv WHERE k = 'a'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(v, "1");
    }

    #[tokio::test]
    async fn test_failing_statement_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.log");
        let logger = EntryLogger::from_section(
            "ut",
            &LoggerSection {
                output_paths: vec![path.to_string_lossy().into_owned()],
                ..Default::default()
            },
        )
        .unwrap();

        let pool = memory_pool().await;
        let plugin = InitStatements::new("schema", vec!["CREATE TABLE".to_string()]);

        let err = plugin.on_open("main", &pool, &logger).await.unwrap_err();
        assert!(matches!(err, BackendError::Sql(_)));

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("Query failed"));
        assert!(written.contains("database=main"));
    }
}
