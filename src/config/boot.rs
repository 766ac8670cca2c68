//! Boot YAML schema
//!
//! One list per backend. Every item shares the common section (name,
//! enabled, domain, health check, logger) and adds its backend section.

use serde::Deserialize;

use crate::backend::postgres::PostgresDbOptions;
use crate::backend::sqlite::SqliteDbOptions;
use crate::config::domain::{Scope, Scoped};
use crate::entry::NoOptions;
use crate::error::ConfigError;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    #[serde(alias = "mySql", alias = "mySQL")]
    pub mysql: Vec<RawEntry<SqlSection<NoOptions>>>,
    #[serde(alias = "postgreSQL", alias = "postgresql")]
    pub postgres: Vec<RawEntry<SqlSection<PostgresDbOptions>>>,
    pub sqlite: Vec<RawEntry<SqliteSection>>,
    #[serde(rename = "sqlServer", alias = "sqlserver")]
    pub sql_server: Vec<RawEntry<SqlSection<NoOptions>>>,
    #[serde(rename = "clickHouse", alias = "clickhouse")]
    pub click_house: Vec<RawEntry<SqlSection<NoOptions>>>,
    #[serde(alias = "mongodb")]
    pub mongo: Vec<RawEntry<MongoSection>>,
    pub redis: Vec<RawEntry<RedisSection>>,
}

impl BootConfig {
    pub fn from_slice(raw: &[u8]) -> Result<Self, ConfigError> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_slice(raw)?)
    }
}

/// One configuration item before domain selection.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEntry<B> {
    #[serde(flatten)]
    pub common: CommonSection,
    #[serde(flatten)]
    pub backend: B,
}

impl<B> Scoped for RawEntry<B> {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn enabled(&self) -> bool {
        self.common.enabled
    }

    fn scope(&self) -> Scope {
        Scope::from_config(&self.common.domain, &self.common.locale)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommonSection {
    pub name: String,
    pub enabled: bool,
    pub description: String,
    pub domain: String,
    /// Legacy `realm::region::az::domain` selector.
    pub locale: String,
    pub health_check: HealthCheckSection,
    pub logger: LoggerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckSection {
    pub enabled: bool,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerSection {
    pub entry: String,
    pub level: String,
    pub encoding: String,
    pub output_paths: Vec<String>,
    pub slow_threshold_ms: u64,
    pub ignore_record_not_found_error: bool,
}

/// Server credentials plus databases; shared by MySQL, Postgres,
/// SQL Server and ClickHouse.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlSection<O> {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default = "Vec::new")]
    pub database: Vec<DatabaseSection<O>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSection<O> {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// Unset means the backend default.
    #[serde(default)]
    pub auto_create: Option<bool>,
    #[serde(default)]
    pub max_open_conn: Option<u32>,
    #[serde(default)]
    pub max_idle_conn: Option<u32>,
    #[serde(flatten)]
    pub options: O,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqliteSection {
    #[serde(default = "Vec::new")]
    pub database: Vec<DatabaseSection<SqliteDbOptions>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MongoAuthSection {
    pub mechanism: String,
    pub source: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MongoSection {
    #[serde(rename = "simpleURI", alias = "simpleUri")]
    pub simple_uri: String,
    pub hosts: Vec<String>,
    pub app_name: Option<String>,
    pub auth: Option<MongoAuthSection>,
    pub connect_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub local_threshold_ms: Option<u64>,
    pub max_conn_idle_time_ms: Option<u64>,
    pub max_pool_size: Option<u32>,
    pub min_pool_size: Option<u32>,
    pub replica_set: Option<String>,
    pub retry_reads: Option<bool>,
    pub retry_writes: Option<bool>,
    pub server_selection_timeout_ms: Option<u64>,
    pub direct: Option<bool>,
    pub ping_timeout_ms: Option<u64>,
    pub database: Vec<DatabaseSection<NoOptions>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisSection {
    pub addrs: Vec<String>,
    pub master_name: String,
    pub sentinel_pass: String,
    pub db: i64,
    pub user: String,
    pub pass: String,
    pub max_retries: Option<usize>,
    pub dial_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_boot_config() {
        let raw = r#"
mysql:
  - name: user-db
    enabled: true
    domain: "*"
    addr: "localhost:3306"
    user: root
    pass: pass
    healthCheck:
      enabled: true
      intervalMs: 2000
    logger:
      level: info
      slowThresholdMs: 100
      ignoreRecordNotFoundError: true
    database:
      - name: user
        autoCreate: true
        maxOpenConn: 20
        params:
          - "charset=utf8mb4"
postgres:
  - name: pg
    enabled: true
    database:
      - name: orders
        preferSimpleProtocol: true
sqlite:
  - name: local
    enabled: true
    locale: "*::*::*::*"
    database:
      - name: cache
        dbDir: data
        inMemory: true
sqlServer:
  - name: mssql
    enabled: false
clickHouse:
  - name: ch
    enabled: true
    database:
      - name: events
        dryRun: true
mongo:
  - name: docs
    enabled: true
    simpleURI: "mongodb://localhost:27017"
    pingTimeoutMs: 500
    database:
      - name: users
redis:
  - name: cache
    enabled: true
    addrs: ["localhost:6379"]
    db: 2
"#;

        let boot = BootConfig::from_slice(raw.as_bytes()).unwrap();

        let mysql = &boot.mysql[0];
        assert_eq!(mysql.common.name, "user-db");
        assert!(mysql.common.health_check.enabled);
        assert_eq!(mysql.common.health_check.interval_ms, 2000);
        assert_eq!(mysql.common.logger.level, "info");
        assert!(mysql.common.logger.ignore_record_not_found_error);
        assert_eq!(mysql.backend.database[0].auto_create, Some(true));
        assert_eq!(mysql.backend.database[0].max_open_conn, Some(20));
        assert_eq!(mysql.backend.database[0].params, vec!["charset=utf8mb4"]);

        assert!(boot.postgres[0].backend.database[0].options.prefer_simple_protocol);
        assert_eq!(boot.postgres[0].backend.database[0].auto_create, None);

        let sqlite_db = &boot.sqlite[0].backend.database[0];
        assert_eq!(sqlite_db.options.db_dir, "data");
        assert!(sqlite_db.options.in_memory);
        assert_eq!(boot.sqlite[0].common.locale, "*::*::*::*");

        assert!(!boot.sql_server[0].common.enabled);
        assert!(boot.click_house[0].backend.database[0].dry_run);
        assert_eq!(boot.mongo[0].backend.simple_uri, "mongodb://localhost:27017");
        assert_eq!(boot.mongo[0].backend.ping_timeout_ms, Some(500));
        assert_eq!(boot.redis[0].backend.db, 2);
    }

    #[test]
    fn test_empty_document() {
        let boot = BootConfig::from_slice(b"  \n").unwrap();
        assert!(boot.mysql.is_empty());
        assert!(boot.redis.is_empty());
    }

    #[test]
    fn test_malformed_yaml_is_error() {
        assert!(BootConfig::from_slice(b"mysql: [ {name: ").is_err());
    }

    #[test]
    fn test_lowercase_aliases() {
        let boot = BootConfig::from_slice(b"sqlserver:\n  - name: a\n    enabled: true\n").unwrap();
        assert_eq!(boot.sql_server.len(), 1);
    }
}
