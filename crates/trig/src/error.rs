use crate::auth::{Action, Role};
use crate::migrate::SafetyViolation;
use crate::registry::ValidationIssue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {}", describe_pg_error(.0))]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Migration version {version} not found or not applied")]
    MigrationNotFound { version: i64 },

    #[error("trigger '{name}' not found")]
    TriggerNotFound { name: String },

    #[error("migration {version} has already been applied")]
    AlreadyApplied { version: i64 },

    #[error(
        "migration {version} is older than the current version {current} and was never applied"
    )]
    OutOfOrder { version: i64, current: i64 },

    #[error("duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: i64,
        first: String,
        second: String,
    },

    #[error("migration {migration} has {} unsafe statement(s):\n{}", .violations.len(), format_lines(.violations))]
    Safety {
        migration: String,
        violations: Vec<SafetyViolation>,
    },

    #[error("validation failed:\n{}", format_lines(.issues))]
    Validation { issues: Vec<ValidationIssue> },

    #[error("Permission denied: {action} requires {required} role")]
    Permission { action: Action, required: Role },

    #[error("kill switch is active for {action}{}; confirm with '{expected}' to override", in_environment(.environment))]
    KillSwitch {
        action: Action,
        environment: Option<String>,
        expected: String,
    },

    #[error("{context}: {message}")]
    Execution {
        context: String,
        message: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error(
        "transaction {txid} was ended by a statement run inside it; later statements ran outside it"
    )]
    TransactionClosed { txid: i64 },

    #[error("invalid trigger definition: {0}")]
    Definition(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wrap a database failure with the identity of what was being run.
    pub fn execution(context: impl Into<String>, source: tokio_postgres::Error) -> Self {
        Error::Execution {
            context: context.into(),
            message: describe_pg_error(&source),
            source,
        }
    }

    /// True for unknown migration versions and unknown triggers.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::MigrationNotFound { .. } | Error::TriggerNotFound { .. }
        )
    }
}

/// Human-readable text for a Postgres error.
///
/// `tokio_postgres::Error`'s own Display only says "db error"; the useful
/// part lives in the server's `DbError`.
pub fn describe_pg_error(err: &tokio_postgres::Error) -> String {
    let Some(db) = err.as_db_error() else {
        return err.to_string();
    };
    let mut out = db.message().to_string();
    if let Some(detail) = db.detail() {
        out.push_str(&format!(" (detail: {})", detail));
    }
    if let Some(hint) = db.hint() {
        out.push_str(&format!(" (hint: {})", hint));
    }
    out
}

fn format_lines<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| format!("  - {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

fn in_environment(environment: &Option<String>) -> String {
    environment
        .as_deref()
        .map(|e| format!(" in {}", e))
        .unwrap_or_default()
}
