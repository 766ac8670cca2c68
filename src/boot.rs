//! Entry registration
//!
//! Boot YAML bytes → domain selection → constructed entries → registry.
//! Registration does no I/O; entries are opened by `bootstrap`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    BackendAdapter, BackendKind, ClickHouseAdapter, MongoAdapter, MySqlAdapter, PostgresAdapter, RedisAdapter,
    SqlServerAdapter, SqliteAdapter,
};
use crate::config::{
    select_by_domain, BootConfig, CommonSection, DatabaseSection, HealthCheckSection, RawEntry, RuntimeEnv,
};
use crate::entry::{
    ClickHouseEntry, DatastoreEntry, Entry, EntryBuilder, MongoEntry, MySqlEntry, PostgresEntry, RedisEntry,
    SqlServerEntry, SqliteEntry, SubDatabase,
};
use crate::error::ConfigError;
use crate::logging::EntryLogger;
use crate::registry::Registry;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_millis(5000);

pub type Registered<A> = BTreeMap<String, Arc<DatastoreEntry<A>>>;

/// Register every enabled entry of every backend that matches `env`.
pub fn register_entries(
    raw: &[u8],
    env: &RuntimeEnv,
    registry: &dyn Registry,
) -> Result<BTreeMap<String, Arc<dyn Entry>>, ConfigError> {
    let boot = BootConfig::from_slice(raw)?;

    // Build everything before touching the registry so a bad item leaves
    // it as it was.
    let mysql = mysql(boot.mysql, env)?;
    let postgres = postgres(boot.postgres, env)?;
    let sqlite = sqlite(boot.sqlite, env)?;
    let sql_server = sql_server(boot.sql_server, env)?;
    let click_house = click_house(boot.click_house, env)?;
    let mongo = mongo(boot.mongo, env)?;
    let redis = redis(boot.redis, env)?;

    let mut entries: BTreeMap<String, Arc<dyn Entry>> = BTreeMap::new();
    collect(&mut entries, publish(mysql, registry));
    collect(&mut entries, publish(postgres, registry));
    collect(&mut entries, publish(sqlite, registry));
    collect(&mut entries, publish(sql_server, registry));
    collect(&mut entries, publish(click_house, registry));
    collect(&mut entries, publish(mongo, registry));
    collect(&mut entries, publish(redis, registry));

    Ok(entries)
}

fn collect<A: BackendAdapter>(into: &mut BTreeMap<String, Arc<dyn Entry>>, from: Registered<A>) {
    for (name, entry) in from {
        if into.insert(name.clone(), entry).is_some() {
            tracing::warn!("Entry name {} is used by more than one backend, keeping the last", name);
        }
    }
}

/// Add built entries to the registry.
fn publish<A: BackendAdapter>(entries: Registered<A>, registry: &dyn Registry) -> Registered<A> {
    for (name, entry) in &entries {
        registry.add(entry.clone());
        tracing::info!("Registered {} {}", entry.entry_type(), name);
    }
    entries
}

pub fn register_mysql_entries(
    raw: &[u8],
    env: &RuntimeEnv,
    registry: &dyn Registry,
) -> Result<BTreeMap<String, Arc<MySqlEntry>>, ConfigError> {
    Ok(publish(mysql(BootConfig::from_slice(raw)?.mysql, env)?, registry))
}

pub fn register_postgres_entries(
    raw: &[u8],
    env: &RuntimeEnv,
    registry: &dyn Registry,
) -> Result<BTreeMap<String, Arc<PostgresEntry>>, ConfigError> {
    Ok(publish(postgres(BootConfig::from_slice(raw)?.postgres, env)?, registry))
}

pub fn register_sqlite_entries(
    raw: &[u8],
    env: &RuntimeEnv,
    registry: &dyn Registry,
) -> Result<BTreeMap<String, Arc<SqliteEntry>>, ConfigError> {
    Ok(publish(sqlite(BootConfig::from_slice(raw)?.sqlite, env)?, registry))
}

pub fn register_sql_server_entries(
    raw: &[u8],
    env: &RuntimeEnv,
    registry: &dyn Registry,
) -> Result<BTreeMap<String, Arc<SqlServerEntry>>, ConfigError> {
    Ok(publish(sql_server(BootConfig::from_slice(raw)?.sql_server, env)?, registry))
}

pub fn register_click_house_entries(
    raw: &[u8],
    env: &RuntimeEnv,
    registry: &dyn Registry,
) -> Result<BTreeMap<String, Arc<ClickHouseEntry>>, ConfigError> {
    Ok(publish(click_house(BootConfig::from_slice(raw)?.click_house, env)?, registry))
}

pub fn register_mongo_entries(
    raw: &[u8],
    env: &RuntimeEnv,
    registry: &dyn Registry,
) -> Result<BTreeMap<String, Arc<MongoEntry>>, ConfigError> {
    Ok(publish(mongo(BootConfig::from_slice(raw)?.mongo, env)?, registry))
}

pub fn register_redis_entries(
    raw: &[u8],
    env: &RuntimeEnv,
    registry: &dyn Registry,
) -> Result<BTreeMap<String, Arc<RedisEntry>>, ConfigError> {
    Ok(publish(redis(BootConfig::from_slice(raw)?.redis, env)?, registry))
}

fn mysql(
    items: Vec<RawEntry<crate::config::SqlSection<crate::entry::NoOptions>>>,
    env: &RuntimeEnv,
) -> Result<Registered<MySqlAdapter>, ConfigError> {
    register_with(items, env, |name, s, logger| {
        let adapter = MySqlAdapter::new(&s.user, &s.pass, &s.addr)
            .with_protocol(&s.protocol)
            .with_logger(logger);
        Ok(DatastoreEntry::builder(name, adapter).databases(sub_databases(s.database, false)))
    })
}

fn postgres(
    items: Vec<RawEntry<crate::config::SqlSection<crate::backend::postgres::PostgresDbOptions>>>,
    env: &RuntimeEnv,
) -> Result<Registered<PostgresAdapter>, ConfigError> {
    register_with(items, env, |name, s, logger| {
        let adapter = PostgresAdapter::new(&s.user, &s.pass, &s.addr).with_logger(logger);
        Ok(DatastoreEntry::builder(name, adapter).databases(sub_databases(s.database, false)))
    })
}

fn sqlite(
    items: Vec<RawEntry<crate::config::SqliteSection>>,
    env: &RuntimeEnv,
) -> Result<Registered<SqliteAdapter>, ConfigError> {
    register_with(items, env, |name, s, logger| {
        let adapter = SqliteAdapter::new().with_logger(logger);
        Ok(DatastoreEntry::builder(name, adapter).databases(sub_databases(s.database, true)))
    })
}

fn sql_server(
    items: Vec<RawEntry<crate::config::SqlSection<crate::entry::NoOptions>>>,
    env: &RuntimeEnv,
) -> Result<Registered<SqlServerAdapter>, ConfigError> {
    register_with(items, env, |name, s, logger| {
        statement_logging_ignored(name, BackendKind::SqlServer, &logger);
        let adapter = SqlServerAdapter::new(&s.user, &s.pass, &s.addr);
        Ok(DatastoreEntry::builder(name, adapter).databases(sub_databases(s.database, false)))
    })
}

fn click_house(
    items: Vec<RawEntry<crate::config::SqlSection<crate::entry::NoOptions>>>,
    env: &RuntimeEnv,
) -> Result<Registered<ClickHouseAdapter>, ConfigError> {
    register_with(items, env, |name, s, logger| {
        statement_logging_ignored(name, BackendKind::ClickHouse, &logger);
        let adapter = ClickHouseAdapter::new(&s.user, &s.pass, &s.addr).with_protocol(&s.protocol);
        Ok(DatastoreEntry::builder(name, adapter).databases(sub_databases(s.database, false)))
    })
}

fn mongo(
    items: Vec<RawEntry<crate::config::MongoSection>>,
    env: &RuntimeEnv,
) -> Result<Registered<MongoAdapter>, ConfigError> {
    register_with(items, env, |name, mut s, logger| {
        statement_logging_ignored(name, BackendKind::Mongo, &logger);
        let databases = sub_databases(std::mem::take(&mut s.database), false);
        Ok(DatastoreEntry::builder(name, MongoAdapter::new(s)).databases(databases))
    })
}

fn redis(
    items: Vec<RawEntry<crate::config::RedisSection>>,
    env: &RuntimeEnv,
) -> Result<Registered<RedisAdapter>, ConfigError> {
    register_with(items, env, |name, s, logger| {
        statement_logging_ignored(name, BackendKind::Redis, &logger);
        let adapter = RedisAdapter::new(s);
        let db = SubDatabase::new(adapter.database_name()).dry_run(adapter.dry_run());
        Ok(DatastoreEntry::builder(name, adapter).database(db))
    })
}

/// Select by domain, then build and describe each survivor. Nothing is
/// registered here.
fn register_with<B, A, F>(
    items: Vec<RawEntry<B>>,
    env: &RuntimeEnv,
    build: F,
) -> Result<Registered<A>, ConfigError>
where
    A: BackendAdapter,
    F: Fn(&str, B, EntryLogger) -> Result<EntryBuilder<A>, ConfigError>,
{
    let mut registered = BTreeMap::new();

    for (name, raw) in select_by_domain(items, env) {
        let RawEntry { common, backend } = raw;
        let logger = EntryLogger::from_section(&name, &common.logger)?;

        let mut builder = build(&name, backend, logger.clone())?
            .description(common.description.clone())
            .logger(logger);
        if let Some(period) = health_interval(&common) {
            builder = builder.health_check(period);
        }

        registered.insert(name, Arc::new(builder.build()));
    }

    Ok(registered)
}

/// Statement logging only exists for the sqlx backends. Returns whether
/// `level` or `slowThresholdMs` were set and are being ignored.
fn statement_logging_ignored(name: &str, kind: BackendKind, logger: &EntryLogger) -> bool {
    if !logger.customizes_statements() {
        return false;
    }
    tracing::warn!(
        "Entry {}: logger level and slowThresholdMs have no effect on {} entries",
        name,
        kind
    );
    true
}

fn health_interval(common: &CommonSection) -> Option<Duration> {
    let HealthCheckSection { enabled, interval_ms } = common.health_check;
    if !enabled {
        return None;
    }
    Some(if interval_ms > 0 {
        Duration::from_millis(interval_ms)
    } else {
        DEFAULT_HEALTH_INTERVAL
    })
}

fn sub_databases<O>(sections: Vec<DatabaseSection<O>>, default_auto_create: bool) -> Vec<SubDatabase<O>> {
    sections
        .into_iter()
        .map(|s| SubDatabase {
            name: s.name,
            dry_run: s.dry_run,
            auto_create: s.auto_create.unwrap_or(default_auto_create),
            params: s.params,
            max_connections: s.max_open_conn,
            min_connections: s.max_idle_conn,
            options: s.options,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LifecycleState;
    use crate::registry::{get_entry, InMemoryRegistry, Registry};

    const BOOT: &str = r#"
mysql:
  - name: db1
    enabled: true
    domain: "*"
    addr: "mysql-a:3306"
    database:
      - name: user
  - name: db1
    enabled: true
    domain: prod
    addr: "mysql-b:3306"
    database:
      - name: user
        params: ["charset=latin1"]
  - name: off
    enabled: false
sqlite:
  - name: local
    enabled: true
    healthCheck:
      enabled: true
    database:
      - name: cache
redis:
  - name: cache
    enabled: true
    domain: test
    db: 4
"#;

    #[tokio::test]
    async fn test_register_selects_by_domain() {
        let registry = InMemoryRegistry::new();
        let entries = register_entries(BOOT.as_bytes(), &RuntimeEnv::with_domain("prod"), &registry).unwrap();

        assert_eq!(entries.keys().collect::<Vec<_>>(), vec!["db1", "local"]);
        assert_eq!(registry.names(), vec!["db1", "local"]);

        let db1 = get_entry::<MySqlAdapter>(&registry, "db1").unwrap();
        assert_eq!(db1.adapter().address(), "mysql-b:3306");
        assert_eq!(db1.databases()[0].params, vec!["charset=latin1"]);
        assert_eq!(db1.state().await, LifecycleState::Constructed);
        assert!(db1.health_interval().is_none());
    }

    #[tokio::test]
    async fn test_register_defaults() {
        let registry = InMemoryRegistry::new();
        register_entries(BOOT.as_bytes(), &RuntimeEnv::with_domain("test"), &registry).unwrap();

        let db1 = get_entry::<MySqlAdapter>(&registry, "db1").unwrap();
        assert_eq!(db1.adapter().address(), "mysql-a:3306");
        assert_eq!(
            db1.databases()[0].params,
            vec!["charset=utf8mb4", "collation=utf8mb4_general_ci"]
        );
        assert!(!db1.databases()[0].auto_create);

        let local = get_entry::<SqliteAdapter>(&registry, "local").unwrap();
        assert!(local.databases()[0].auto_create);
        assert_eq!(local.health_interval(), Some(DEFAULT_HEALTH_INTERVAL));
        assert_eq!(
            local.description(),
            "SqliteEntry entry with name of local, addr:local, user:"
        );

        let cache = get_entry::<RedisAdapter>(&registry, "cache").unwrap();
        assert_eq!(cache.databases()[0].name, "db4");
    }

    #[test]
    fn test_typed_registration() {
        let registry = InMemoryRegistry::new();
        let entries = register_redis_entries(BOOT.as_bytes(), &RuntimeEnv::with_domain("test"), &registry).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(registry.names(), vec!["cache"]);
    }

    #[test]
    fn test_invalid_logger_fails_registration() {
        let raw = b"sqlite:\n  - name: local\n    enabled: true\n    logger:\n      level: loud\n";
        let registry = InMemoryRegistry::new();
        assert!(register_entries(raw, &RuntimeEnv::default(), &registry).is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        let registry = InMemoryRegistry::new();
        let Err(err) = register_entries(b"mysql: {", &RuntimeEnv::default(), &registry) else {
            panic!("malformed YAML must not register entries");
        };
        assert!(matches!(err, ConfigError::Yaml(_)));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_failed_registration_leaves_registry_empty() {
        let raw = br#"
sqlite:
  - name: a
    enabled: true
  - name: b
    enabled: true
    logger:
      level: loud
"#;
        let registry = InMemoryRegistry::new();
        assert!(register_entries(raw, &RuntimeEnv::default(), &registry).is_err());
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_later_backend_failure_keeps_earlier_backends_out() {
        let raw = br#"
mysql:
  - name: users
    enabled: true
sqlite:
  - name: local
    enabled: true
    logger:
      encoding: xml
"#;
        let registry = InMemoryRegistry::new();
        assert!(register_entries(raw, &RuntimeEnv::default(), &registry).is_err());
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_statement_logging_ignored_outside_sqlx() {
        let raw = br#"
redis:
  - name: cache
    enabled: true
    logger:
      level: info
      slowThresholdMs: 100
"#;
        let registry = InMemoryRegistry::new();
        register_entries(raw, &RuntimeEnv::default(), &registry).unwrap();
        assert_eq!(registry.names(), vec!["cache"]);

        let section = crate::config::LoggerSection {
            level: "info".to_string(),
            ..Default::default()
        };
        let logger = EntryLogger::from_section("cache", &section).unwrap();
        assert!(statement_logging_ignored("cache", BackendKind::Redis, &logger));
        assert!(!statement_logging_ignored("cache", BackendKind::Mongo, &EntryLogger::default()));
    }
}
