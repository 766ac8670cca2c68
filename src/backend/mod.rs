//! Backend adapters
//!
//! Each backend implements [`BackendAdapter`]: a pure connection-spec
//! builder plus the provision/open/ping/close calls the lifecycle
//! controller drives. Pooling and wire protocols belong to the drivers.

pub mod clickhouse;
pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod redis;
pub mod sqlite;
pub mod sqlserver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entry::SubDatabase;
use crate::error::BackendError;

pub use self::clickhouse::ClickHouseAdapter;
pub use self::mongo::MongoAdapter;
pub use self::mysql::MySqlAdapter;
pub use self::postgres::PostgresAdapter;
pub use self::redis::{RedisAdapter, RedisConnection};
pub use self::sqlite::SqliteAdapter;
pub use self::sqlserver::{SqlServerAdapter, SqlServerClient};

/// The seven supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    MySql,
    Postgres,
    Sqlite,
    SqlServer,
    ClickHouse,
    Mongo,
    Redis,
}

impl BackendKind {
    /// Type tag used when describing an entry, e.g. `MySqlEntry`.
    pub fn entry_type(&self) -> &'static str {
        match self {
            BackendKind::MySql => "MySqlEntry",
            BackendKind::Postgres => "PostgresEntry",
            BackendKind::Sqlite => "SqliteEntry",
            BackendKind::SqlServer => "SqlServerEntry",
            BackendKind::ClickHouse => "ClickHouseEntry",
            BackendKind::Mongo => "MongoEntry",
            BackendKind::Redis => "RedisEntry",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::MySql => "MySql",
            BackendKind::Postgres => "Postgres",
            BackendKind::Sqlite => "Sqlite",
            BackendKind::SqlServer => "SqlServer",
            BackendKind::ClickHouse => "ClickHouse",
            BackendKind::Mongo => "Mongo",
            BackendKind::Redis => "Redis",
        };
        f.write_str(s)
    }
}

/// Driver capability the lifecycle controller is written against.
#[async_trait]
pub trait BackendAdapter: Send + Sync + 'static {
    /// Backend-specific per-database options (e.g. SQLite `dbDir`).
    type DbOptions: Clone + Default + Send + Sync + 'static;
    /// Connection descriptor produced by [`build_connection_spec`](Self::build_connection_spec).
    type Spec: Send + Sync + 'static;
    /// Opened client or pool; clones share the underlying connection(s).
    type Handle: Clone + Send + Sync + 'static;

    fn kind(&self) -> BackendKind;

    /// Address shown in logs and descriptions.
    fn address(&self) -> String;

    /// Login user, when the backend has one.
    fn user(&self) -> Option<&str> {
        None
    }

    /// `user:****@addr`, safe to log.
    fn target(&self) -> String {
        match self.user() {
            Some(user) => format!("{}:****@{}", user, self.address()),
            None => self.address(),
        }
    }

    /// Params applied when a database declares none.
    fn default_params(&self) -> &'static [&'static str] {
        &[]
    }

    /// Pure translation of credentials, address and params. No I/O.
    fn build_connection_spec(
        &self,
        db: &SubDatabase<Self::DbOptions>,
    ) -> Result<Self::Spec, BackendError>;

    /// Idempotent create-if-missing. Any temporary admin connection must be
    /// closed before returning, on success and on failure.
    async fn provision_if_missing(
        &self,
        db: &SubDatabase<Self::DbOptions>,
        spec: &Self::Spec,
    ) -> Result<(), BackendError>;

    async fn open(
        &self,
        db: &SubDatabase<Self::DbOptions>,
        spec: Self::Spec,
    ) -> Result<Self::Handle, BackendError>;

    /// Handle for a dry-run database. Must not touch the network; backends
    /// whose clients connect eagerly return `None`.
    fn open_offline(
        &self,
        _db: &SubDatabase<Self::DbOptions>,
        _spec: Self::Spec,
    ) -> Result<Option<Self::Handle>, BackendError> {
        Ok(None)
    }

    async fn ping(&self, handle: &Self::Handle) -> Result<(), BackendError>;

    async fn close(&self, handle: Self::Handle) -> Result<(), BackendError>;

    /// Release resources shared by all databases of the entry.
    async fn shutdown(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Password that never prints.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("****")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("****")
    }
}

/// User, password and address of a server backend.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub pass: Secret,
    pub addr: String,
}

impl Credentials {
    /// Empty values fall back to the backend defaults.
    pub fn with_defaults(
        user: &str,
        pass: &str,
        addr: &str,
        defaults: (&str, &str, &str),
    ) -> Self {
        let pick = |value: &str, fallback: &str| {
            if value.is_empty() {
                fallback.to_string()
            } else {
                value.to_string()
            }
        };

        Self {
            user: pick(user, defaults.0),
            pass: Secret::new(pick(pass, defaults.1)),
            addr: pick(addr, defaults.2),
        }
    }
}

/// Split `host:port` (or `[v6]:port`). A bare host takes `default_port`.
pub(crate) fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16), BackendError> {
    let invalid = |reason: &str| BackendError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let addr = addr.trim();
    if addr.is_empty() {
        return Err(invalid("empty address"));
    }

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((
                host.to_string(),
                port.parse().map_err(|_| invalid("port is not a number"))?,
            )),
            None if tail.is_empty() => Ok((host.to_string(), default_port)),
            None => Err(invalid("expected host:port")),
        };
    }

    match addr.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Err(invalid("IPv6 hosts must be bracketed")),
        Some((host, _)) if host.is_empty() => Err(invalid("missing host")),
        Some((host, port)) => Ok((
            host.to_string(),
            port.parse().map_err(|_| invalid("port is not a number"))?,
        )),
        None => Ok((addr.to_string(), default_port)),
    }
}

/// Split a `key=value` param.
pub(crate) fn split_param(param: &str) -> Result<(&str, &str), BackendError> {
    param
        .split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| BackendError::InvalidParam {
            param: param.to_string(),
            reason: "expected key=value".to_string(),
        })
}

/// Quote an identifier, doubling any embedded closing quote.
pub(crate) fn quote_ident(name: &str, open: char, close: char) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push(open);
    for c in name.chars() {
        if c == close {
            quoted.push(close);
        }
        quoted.push(c);
    }
    quoted.push(close);
    quoted
}

pub(crate) fn parse_bool(param: &str, value: &str) -> Result<bool, BackendError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(BackendError::InvalidParam {
            param: param.to_string(),
            reason: format!("{} is not a boolean", value),
        }),
    }
}

pub(crate) fn parse_usize(param: &str, value: &str) -> Result<usize, BackendError> {
    value.parse().map_err(|_| BackendError::InvalidParam {
        param: param.to_string(),
        reason: format!("{} is not a number", value),
    })
}
