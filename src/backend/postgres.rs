//! PostgreSQL backend

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgSslMode};
use sqlx::{Connection, Executor, PgPool};

use super::{parse_usize, quote_ident, split_host_port, split_param, BackendAdapter, BackendKind, Credentials};
use crate::entry::SubDatabase;
use crate::error::BackendError;
use crate::logging::EntryLogger;

pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_PASS: &str = "pass";
pub const DEFAULT_ADDR: &str = "localhost:5432";
const DEFAULT_PORT: u16 = 5432;
const DEFAULT_PARAMS: &[&str] = &["sslmode=disable", "TimeZone=UTC"];
const ADMIN_DATABASE: &str = "postgres";
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostgresDbOptions {
    /// Disable the prepared statement cache.
    pub prefer_simple_protocol: bool,
}

#[derive(Debug, Clone)]
pub struct PostgresSpec {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub ssl_mode: Option<PgSslMode>,
    pub application_name: Option<String>,
    pub statement_cache_capacity: Option<usize>,
    /// Server runtime parameters, e.g. `TimeZone`.
    pub runtime_params: Vec<(String, String)>,
}

pub struct PostgresAdapter {
    credentials: Credentials,
    logger: EntryLogger,
}

impl PostgresAdapter {
    pub fn new(user: &str, pass: &str, addr: &str) -> Self {
        Self {
            credentials: Credentials::with_defaults(user, pass, addr, (DEFAULT_USER, DEFAULT_PASS, DEFAULT_ADDR)),
            logger: EntryLogger::default(),
        }
    }

    pub fn with_logger(mut self, logger: EntryLogger) -> Self {
        self.logger = logger;
        self
    }

    fn connect_options(&self, spec: &PostgresSpec, database: &str) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&spec.host)
            .port(spec.port)
            .username(&self.credentials.user)
            .password(self.credentials.pass.expose())
            .database(database);

        if let Some(ssl_mode) = spec.ssl_mode {
            options = options.ssl_mode(ssl_mode);
        }
        if let Some(name) = &spec.application_name {
            options = options.application_name(name);
        }
        if let Some(capacity) = spec.statement_cache_capacity {
            options = options.statement_cache_capacity(capacity);
        }
        if !spec.runtime_params.is_empty() {
            options = options.options(spec.runtime_params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        self.logger.apply(options)
    }

    fn pool_options(db: &SubDatabase<PostgresDbOptions>) -> PgPoolOptions {
        let mut pool = PgPoolOptions::new().acquire_timeout(ACQUIRE_TIMEOUT);
        if let Some(max) = db.max_connections {
            pool = pool.max_connections(max);
        }
        if let Some(min) = db.min_connections {
            pool = pool.min_connections(min);
        }
        pool
    }
}

/// Returns whether the database had to be created.
async fn create_database(conn: &mut PgConnection, name: &str, owner: &str) -> Result<bool, sqlx::Error> {
    let exists = sqlx::query_scalar::<_, i32>("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    if exists {
        return Ok(false);
    }

    let ddl = format!(
        "CREATE DATABASE {} WITH OWNER {} ENCODING 'UTF8'",
        quote_ident(name, '"', '"'),
        quote_ident(owner, '"', '"')
    );
    conn.execute(ddl.as_str()).await?;
    Ok(true)
}

#[async_trait]
impl BackendAdapter for PostgresAdapter {
    type DbOptions = PostgresDbOptions;
    type Spec = PostgresSpec;
    type Handle = PgPool;

    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn address(&self) -> String {
        self.credentials.addr.clone()
    }

    fn user(&self) -> Option<&str> {
        Some(&self.credentials.user)
    }

    fn default_params(&self) -> &'static [&'static str] {
        DEFAULT_PARAMS
    }

    fn build_connection_spec(&self, db: &SubDatabase<PostgresDbOptions>) -> Result<PostgresSpec, BackendError> {
        let (host, port) = split_host_port(&self.credentials.addr, DEFAULT_PORT)?;
        let mut spec = PostgresSpec {
            host,
            port,
            database: db.name.clone(),
            ssl_mode: None,
            application_name: None,
            statement_cache_capacity: None,
            runtime_params: Vec::new(),
        };

        for param in &db.params {
            let (key, value) = split_param(param)?;
            match key {
                "sslmode" => {
                    spec.ssl_mode = Some(PgSslMode::from_str(value).map_err(|e| BackendError::InvalidParam {
                        param: param.clone(),
                        reason: e.to_string(),
                    })?)
                }
                "application_name" => spec.application_name = Some(value.to_string()),
                "statement_cache_capacity" => spec.statement_cache_capacity = Some(parse_usize(param, value)?),
                _ => spec.runtime_params.push((key.to_string(), value.to_string())),
            }
        }

        if db.options.prefer_simple_protocol {
            spec.statement_cache_capacity = Some(0);
        }

        Ok(spec)
    }

    async fn provision_if_missing(
        &self,
        db: &SubDatabase<PostgresDbOptions>,
        spec: &PostgresSpec,
    ) -> Result<(), BackendError> {
        let mut conn = PgConnection::connect_with(&self.connect_options(spec, ADMIN_DATABASE)).await?;
        let created = create_database(&mut conn, &db.name, &self.credentials.user).await;
        let closed = conn.close().await;

        match created {
            Ok(true) => tracing::info!("Created database [{}]", db.name),
            Ok(false) => {}
            Err(e) => {
                self.logger.report_query_error(&db.name, &e);
                return Err(e.into());
            }
        }
        closed?;
        Ok(())
    }

    async fn open(&self, db: &SubDatabase<PostgresDbOptions>, spec: PostgresSpec) -> Result<PgPool, BackendError> {
        let options = self.connect_options(&spec, &spec.database);
        Ok(Self::pool_options(db).connect_with(options).await?)
    }

    fn open_offline(
        &self,
        db: &SubDatabase<PostgresDbOptions>,
        spec: PostgresSpec,
    ) -> Result<Option<PgPool>, BackendError> {
        let options = self.connect_options(&spec, &spec.database);
        Ok(Some(Self::pool_options(db).connect_lazy_with(options)))
    }

    async fn ping(&self, pool: &PgPool) -> Result<(), BackendError> {
        pool.acquire().await?.ping().await?;
        Ok(())
    }

    async fn close(&self, pool: PgPool) -> Result<(), BackendError> {
        pool.close().await;
        Ok(())
    }
}
