//! trig: lifecycle management for Postgres triggers and their functions.
//!
//! - [`TriggerDefinition`]: the declared shape of a trigger.
//! - [`Registry`]: declared definitions, stored with a checksum.
//! - [`drift`]: compares the registry against the live catalog.
//! - [`migrate`]: versioned, transactional up/down migrations.
//! - [`Sandbox`]: runs trigger SQL and always rolls it back.
//! - [`Gate`]: role checks plus a kill switch for destructive actions.
//!
//! Everything talks to the database through the [`Connection`] trait, which
//! is implemented for `tokio_postgres::Client` and `deadpool_postgres::Object`.

mod error;
pub use error::{Error, describe_pg_error};

mod traced;
pub use traced::{Connection, ConnectionExt, TracedConn};

pub mod tx;

mod auth;
pub use auth::{
    Action, Actor, AllowAll, Caller, Gate, KillSwitch, PermissionChecker, Role, RoleChecker,
};

mod definition;
pub use definition::{Event, Level, Timing, TriggerBuilder, TriggerDefinition};

mod checksum;
pub use checksum::{checksum, checksum_fields};

mod catalog;
pub use catalog::{Catalog, CatalogFunction, CatalogTrigger, decode_tgtype};

mod meta;

mod registry;
pub use registry::{Registry, RegistryEntry, Source, ValidationIssue};

pub mod drift;
pub use drift::{Detector, DriftEntry, DriftState, DriftSummary};

pub mod migrate;
pub use migrate::{Migration, MigrationBody, MigrationContext, MigrationRunner, MigrationSource};

mod sandbox;
pub use sandbox::{
    DryRun, FunctionReport, SampleRow, Sandbox, SqlPart, SqlPartKind, StatementCheck,
    SyntaxReport, TestReport, dry_run,
};

pub mod config;

/// Result type for trig operations.
pub type Result<T> = std::result::Result<T, Error>;
