//! Error handling module

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendKind;
use crate::entry::LifecycleState;

/// Errors raised while decoding boot configuration or runner settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid boot YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to load settings: {0}")]
    Settings(#[from] ::config::ConfigError),

    #[error("Invalid value for {field} in entry {entry}: {reason}")]
    Invalid {
        entry: String,
        field: &'static str,
        reason: String,
    },

    #[error("Failed to initialize logger for entry {entry}: {reason}")]
    Logger { entry: String, reason: String },
}

/// Errors surfaced by a driver while talking to a backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    SqlServer(#[from] tiberius::error::Error),

    #[error(transparent)]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("invalid parameter {param}: {reason}")]
    InvalidParam { param: String, reason: String },

    #[error("plugin {plugin} failed: {reason}")]
    Plugin { plugin: String, reason: String },
}

/// Which step of the lifecycle produced an [`EntryError::Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Spec,
    Provision,
    Open,
    Close,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Spec => "build connection spec for",
            Stage::Provision => "create",
            Stage::Open => "connect to",
            Stage::Close => "close",
        };
        f.write_str(s)
    }
}

/// Entry-level errors. Carries enough context to diagnose a failure
/// without the password: `target` is always `user:****@addr`.
#[derive(Error, Debug)]
pub enum EntryError {
    #[error("{kind} entry {entry}: failed to {stage} database [{database}] at {target}: {source}")]
    Backend {
        entry: String,
        kind: BackendKind,
        database: String,
        target: String,
        stage: Stage,
        #[source]
        source: BackendError,
    },

    #[error("{kind} entry {entry}: cannot {action} from state {from}")]
    InvalidTransition {
        entry: String,
        kind: BackendKind,
        action: &'static str,
        from: LifecycleState,
    },
}

impl EntryError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EntryError::Backend { stage, .. } => Some(*stage),
            EntryError::InvalidTransition { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_hides_password() {
        let err = EntryError::Backend {
            entry: "user-db".to_string(),
            kind: BackendKind::MySql,
            database: "user".to_string(),
            target: "root:****@localhost:3306".to_string(),
            stage: Stage::Open,
            source: BackendError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused")),
        };

        let msg = err.to_string();
        assert!(msg.contains("user-db"));
        assert!(msg.contains("connect to database [user]"));
        assert!(msg.contains("root:****@localhost:3306"));
        assert_eq!(err.stage(), Some(Stage::Open));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = EntryError::InvalidTransition {
            entry: "cache".to_string(),
            kind: BackendKind::Redis,
            action: "bootstrap",
            from: LifecycleState::Bootstrapped,
        };

        assert_eq!(
            err.to_string(),
            "Redis entry cache: cannot bootstrap from state Bootstrapped"
        );
        assert!(err.stage().is_none());
    }
}
