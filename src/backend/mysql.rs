//! MySQL backend

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPoolOptions, MySqlSslMode};
use sqlx::{Connection, Executor, MySqlPool};

use super::{parse_usize, quote_ident, split_host_port, split_param, BackendAdapter, BackendKind, Credentials};
use crate::entry::{NoOptions, SubDatabase};
use crate::error::BackendError;
use crate::logging::EntryLogger;

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PASS: &str = "pass";
pub const DEFAULT_ADDR: &str = "localhost:3306";
const DEFAULT_PORT: u16 = 3306;
const DEFAULT_PARAMS: &[&str] = &["charset=utf8mb4", "collation=utf8mb4_general_ci"];
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// How to reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MySqlEndpoint {
    Tcp { host: String, port: u16 },
    Socket(String),
}

/// Everything needed to connect to one MySQL database, minus the password.
#[derive(Debug, Clone)]
pub struct MySqlSpec {
    pub endpoint: MySqlEndpoint,
    pub database: String,
    pub charset: Option<String>,
    pub collation: Option<String>,
    pub ssl_mode: Option<MySqlSslMode>,
    pub statement_cache_capacity: Option<usize>,
    /// Params the driver has no equivalent for.
    pub ignored: Vec<String>,
}

pub struct MySqlAdapter {
    credentials: Credentials,
    protocol: String,
    logger: EntryLogger,
}

impl MySqlAdapter {
    pub fn new(user: &str, pass: &str, addr: &str) -> Self {
        Self {
            credentials: Credentials::with_defaults(user, pass, addr, (DEFAULT_USER, DEFAULT_PASS, DEFAULT_ADDR)),
            protocol: "tcp".to_string(),
            logger: EntryLogger::default(),
        }
    }

    /// `tcp` (default) or `unix`, in which case the address is a socket path.
    pub fn with_protocol(mut self, protocol: &str) -> Self {
        if !protocol.is_empty() {
            self.protocol = protocol.to_ascii_lowercase();
        }
        self
    }

    pub fn with_logger(mut self, logger: EntryLogger) -> Self {
        self.logger = logger;
        self
    }

    fn connect_options(&self, spec: &MySqlSpec, database: Option<&str>) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .username(&self.credentials.user)
            .password(self.credentials.pass.expose());

        options = match &spec.endpoint {
            MySqlEndpoint::Tcp { host, port } => options.host(host).port(*port),
            MySqlEndpoint::Socket(path) => options.socket(path),
        };
        if let Some(database) = database {
            options = options.database(database);
        }
        if let Some(charset) = &spec.charset {
            options = options.charset(charset);
        }
        if let Some(collation) = &spec.collation {
            options = options.collation(collation);
        }
        if let Some(ssl_mode) = spec.ssl_mode {
            options = options.ssl_mode(ssl_mode);
        }
        if let Some(capacity) = spec.statement_cache_capacity {
            options = options.statement_cache_capacity(capacity);
        }

        self.logger.apply(options)
    }

    fn pool_options(db: &SubDatabase) -> MySqlPoolOptions {
        let mut pool = MySqlPoolOptions::new().acquire_timeout(ACQUIRE_TIMEOUT);
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
impl BackendAdapter for MySqlAdapter {
    type DbOptions = NoOptions;
    type Spec = MySqlSpec;
    type Handle = MySqlPool;

    fn kind(&self) -> BackendKind {
        BackendKind::MySql
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

    fn build_connection_spec(&self, db: &SubDatabase) -> Result<MySqlSpec, BackendError> {
        let endpoint = match self.protocol.as_str() {
            "tcp" => {
                let (host, port) = split_host_port(&self.credentials.addr, DEFAULT_PORT)?;
                MySqlEndpoint::Tcp { host, port }
            }
            "unix" => MySqlEndpoint::Socket(self.credentials.addr.clone()),
            other => {
                return Err(BackendError::InvalidAddress {
                    addr: self.credentials.addr.clone(),
                    reason: format!("unsupported protocol {}", other),
                })
            }
        };

        let mut spec = MySqlSpec {
            endpoint,
            database: db.name.clone(),
            charset: None,
            collation: None,
            ssl_mode: None,
            statement_cache_capacity: None,
            ignored: Vec::new(),
        };

        for param in &db.params {
            let (key, value) = split_param(param)?;
            match key {
                "charset" => spec.charset = Some(charset_name(param, value)?),
                "collation" => spec.collation = Some(charset_name(param, value)?),
                "ssl-mode" | "sslmode" | "tls" => {
                    spec.ssl_mode = Some(MySqlSslMode::from_str(value).map_err(|e| {
                        BackendError::InvalidParam {
                            param: param.clone(),
                            reason: e.to_string(),
                        }
                    })?)
                }
                "statement-cache-capacity" => {
                    spec.statement_cache_capacity = Some(parse_usize(param, value)?)
                }
                _ => {
                    tracing::warn!("Ignoring unsupported MySQL param {} for database [{}]", param, db.name);
                    spec.ignored.push(param.clone());
                }
            }
        }

        Ok(spec)
    }

    async fn provision_if_missing(&self, db: &SubDatabase, spec: &MySqlSpec) -> Result<(), BackendError> {
        let charset = spec.charset.as_deref().unwrap_or("utf8mb4");
        let ddl = format!(
            "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET {}",
            quote_ident(&db.name, '`', '`'),
            charset
        );

        let mut conn = MySqlConnection::connect_with(&self.connect_options(spec, None)).await?;
        let created = conn.execute(ddl.as_str()).await;
        let closed = conn.close().await;
        if let Err(e) = created {
            self.logger.report_query_error(&db.name, &e);
            return Err(e.into());
        }
        closed?;
        Ok(())
    }

    async fn open(&self, db: &SubDatabase, spec: MySqlSpec) -> Result<MySqlPool, BackendError> {
        let options = self.connect_options(&spec, Some(&spec.database));
        let pool = Self::pool_options(db).connect_with(options).await?;
        Ok(pool)
    }

    fn open_offline(&self, db: &SubDatabase, spec: MySqlSpec) -> Result<Option<MySqlPool>, BackendError> {
        let options = self.connect_options(&spec, Some(&spec.database));
        Ok(Some(Self::pool_options(db).connect_lazy_with(options)))
    }

    async fn ping(&self, pool: &MySqlPool) -> Result<(), BackendError> {
        pool.acquire().await?.ping().await?;
        Ok(())
    }

    async fn close(&self, pool: MySqlPool) -> Result<(), BackendError> {
        pool.close().await;
        Ok(())
    }
}

/// Charset and collation names end up in DDL unquoted.
fn charset_name(param: &str, value: &str) -> Result<String, BackendError> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BackendError::InvalidParam {
            param: param.to_string(),
            reason: "expected letters, digits or underscores".to_string(),
        });
    }
    Ok(value.to_string())
}
