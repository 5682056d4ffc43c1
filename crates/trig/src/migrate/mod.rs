//! Versioned trigger migrations.
//!
//! A migration is a version number, a name, and a [`MigrationBody`] that
//! emits SQL for `up` and `down`. The runner tracks applied versions in a
//! table with one row per migration; the current version is the highest
//! applied one.
//!
//! Each migration runs in its own transaction together with its version
//! marker, so a migration is either fully applied (statements and marker)
//! or not at all.

mod compare;
mod safety;
mod source;

pub use compare::{
    CatalogState, ComparisonResult, ExpectedAction, ObjectComparison, ObjectKind, compare, format,
    format_summary,
};
pub use safety::{SafetyRule, SafetyViolation, validate};
pub use source::{DirectorySource, MigrationSource, SqlMigration, parse_migration_name};

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use trig_config::{Config, DEFAULT_MIGRATIONS_TABLE, DEFAULT_REGISTRY_TABLE, DEFAULT_SCHEMA};
use trig_sql::quote_qualified;

use crate::meta::migrations_table_sql;
use crate::{Action, Caller, Connection, ConnectionExt, Error, Gate, Registry, Result, tx};

/// Collects the statements a migration wants to run.
#[derive(Debug, Default)]
pub struct MigrationContext {
    statements: Vec<String>,
}

impl MigrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw SQL statement.
    pub fn execute(&mut self, sql: impl Into<String>) {
        self.statements.push(sql.into());
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn into_statements(self) -> Vec<String> {
        self.statements
    }
}

/// The two directions of a migration.
pub trait MigrationBody: Send + Sync {
    fn up(&self, ctx: &mut MigrationContext);
    fn down(&self, ctx: &mut MigrationContext);
}

/// A migration descriptor.
#[derive(Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    body: Arc<dyn MigrationBody>,
}

impl Migration {
    pub fn new(version: i64, name: impl Into<String>, body: impl MigrationBody + 'static) -> Self {
        Self {
            version,
            name: name.into(),
            body: Arc::new(body),
        }
    }

    /// A migration from raw SQL scripts, split into statements.
    pub fn sql(version: i64, name: impl Into<String>, up: &str, down: &str) -> Self {
        Self::new(
            version,
            name,
            SqlMigration {
                up: trig_sql::split_statements(up),
                down: trig_sql::split_statements(down),
            },
        )
    }

    /// `<version>_<name>`, used in logs and errors.
    pub fn id(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }

    /// Statements for `up`, one per entry even when the body queued several
    /// in one string.
    pub fn up_statements(&self) -> Vec<String> {
        let mut ctx = MigrationContext::new();
        self.body.up(&mut ctx);
        split_all(ctx.statements())
    }

    /// Statements for `down`, split like [`Self::up_statements`].
    pub fn down_statements(&self) -> Vec<String> {
        let mut ctx = MigrationContext::new();
        self.body.down(&mut ctx);
        split_all(ctx.statements())
    }
}

fn split_all(statements: &[String]) -> Vec<String> {
    statements
        .iter()
        .flat_map(|s| trig_sql::split_statements(s))
        .collect()
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A version marker row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Applied,
    Pending,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationState::Applied => "applied",
            MigrationState::Pending => "pending",
        })
    }
}

/// One line of [`MigrationRunner::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Sort by version and reject duplicates.
pub fn sorted_migrations(mut migrations: Vec<Migration>) -> Result<Vec<Migration>> {
    migrations.sort_by_key(|m| m.version);
    for pair in migrations.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(Error::DuplicateVersion {
                version: pair[0].version,
                first: pair[0].id(),
                second: pair[1].id(),
            });
        }
    }
    Ok(migrations)
}

/// Migrations newer than `current`, up to and including `target`.
///
/// `migrations` must be sorted.
pub fn pending_migrations(
    migrations: &[Migration],
    current: i64,
    target: Option<i64>,
) -> Vec<Migration> {
    migrations
        .iter()
        .filter(|m| m.version > current)
        .filter(|m| target.is_none_or(|t| m.version <= t))
        .cloned()
        .collect()
}

/// Check an explicit apply target before anything runs.
pub fn check_apply_target(
    migrations: &[Migration],
    applied: &BTreeSet<i64>,
    current: i64,
    target: i64,
) -> Result<()> {
    if !migrations.iter().any(|m| m.version == target) {
        return Err(Error::MigrationNotFound { version: target });
    }
    if applied.contains(&target) {
        return Err(Error::AlreadyApplied { version: target });
    }
    if target <= current {
        return Err(Error::OutOfOrder {
            version: target,
            current,
        });
    }
    Ok(())
}

/// Migrations to roll back, newest first.
///
/// Without a target only the current migration goes. With one, every
/// applied version above it goes; the target itself must be 0 or an
/// applied, discovered version.
pub fn rollback_plan(
    migrations: &[Migration],
    applied: &BTreeSet<i64>,
    target: Option<i64>,
) -> Result<Vec<Migration>> {
    let versions: Vec<i64> = match target {
        None => applied.iter().next_back().copied().into_iter().collect(),
        Some(0) => applied.iter().rev().copied().collect(),
        Some(target) => {
            let known = migrations.iter().any(|m| m.version == target);
            if !known || !applied.contains(&target) {
                return Err(Error::MigrationNotFound { version: target });
            }
            applied
                .range((Bound::Excluded(target), Bound::Unbounded))
                .rev()
                .copied()
                .collect()
        }
    };

    versions
        .into_iter()
        .map(|version| {
            migrations
                .iter()
                .find(|m| m.version == version)
                .cloned()
                .ok_or(Error::MigrationNotFound { version })
        })
        .collect()
}

/// Refuse a migration direction with safety violations.
///
/// `allow_unsafe` lets violations through with a warning, except for rules
/// that are never overridable.
pub fn check_safety(id: &str, statements: &[String], allow_unsafe: bool) -> Result<()> {
    let violations = validate(statements);
    if violations.is_empty() {
        return Ok(());
    }
    if !allow_unsafe || violations.iter().any(|v| !v.rule.overridable()) {
        return Err(Error::Safety {
            migration: id.to_string(),
            violations,
        });
    }
    for violation in &violations {
        tracing::warn!(migration = %id, "unsafe statement allowed: {}", violation);
    }
    Ok(())
}

/// Applies and rolls back migrations from a [`MigrationSource`].
pub struct MigrationRunner<'a, C: Connection + ?Sized, S: MigrationSource> {
    conn: &'a C,
    gate: &'a Gate,
    source: S,
    schema: String,
    table: String,
    registry_table: String,
    allow_unsafe: bool,
}

impl<'a, C: Connection + ?Sized, S: MigrationSource> MigrationRunner<'a, C, S> {
    pub fn new(conn: &'a C, gate: &'a Gate, source: S) -> Self {
        Self {
            conn,
            gate,
            source,
            schema: DEFAULT_SCHEMA.to_string(),
            table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            registry_table: DEFAULT_REGISTRY_TABLE.to_string(),
            allow_unsafe: false,
        }
    }

    /// Take schema, table names and the unsafe override from config.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.schema = config.schema().to_string();
        self.table = config.migrations_table().to_string();
        self.registry_table = config.registry_table().to_string();
        self.allow_unsafe = config.allow_unsafe();
        self
    }

    /// Apply migrations even when the safety validator objects.
    pub fn allow_unsafe(mut self, allow: bool) -> Self {
        self.allow_unsafe = allow;
        self
    }

    pub async fn ensure_version_table(&self) -> Result<()> {
        self.conn
            .traced()
            .batch_execute(&migrations_table_sql(&self.table))
            .await?;
        Ok(())
    }

    /// All migrations from the source, ascending by version.
    pub fn discover(&self) -> Result<Vec<Migration>> {
        sorted_migrations(self.source.migrations()?)
    }

    /// Applied version markers, ascending.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>> {
        self.ensure_version_table().await?;
        let sql = format!(
            "SELECT version, applied_at FROM {} ORDER BY version",
            quote_qualified(&self.table)
        );
        let rows = self.conn.traced().query(&sql, &[]).await?;
        rows.iter()
            .map(|row| {
                Ok(AppliedMigration {
                    version: row.try_get(0)?,
                    applied_at: row.try_get(1)?,
                })
            })
            .collect()
    }

    async fn applied_versions(&self) -> Result<BTreeSet<i64>> {
        Ok(self.applied().await?.into_iter().map(|a| a.version).collect())
    }

    /// Highest applied version, or 0.
    pub async fn current_version(&self) -> Result<i64> {
        self.ensure_version_table().await?;
        let sql = format!(
            "SELECT COALESCE(MAX(version), 0)::int8 FROM {}",
            quote_qualified(&self.table)
        );
        let row = self.conn.traced().query_one(&sql, &[]).await?;
        Ok(row.try_get(0)?)
    }

    /// Discovered migrations above the current version, up to `target`.
    pub async fn pending(&self, target: Option<i64>) -> Result<Vec<Migration>> {
        let migrations = self.discover()?;
        let current = self.current_version().await?;
        Ok(pending_migrations(&migrations, current, target))
    }

    /// Apply pending migrations in order, up to `target` if given.
    ///
    /// Returns the migrations that were applied. A failure stops the batch;
    /// migrations applied before it stay applied.
    pub async fn apply(&self, caller: &Caller, target: Option<i64>) -> Result<Vec<Migration>> {
        self.gate.authorize(caller, Action::ApplyMigration)?;

        let migrations = self.discover()?;
        let applied = self.applied_versions().await?;
        let current = applied.iter().next_back().copied().unwrap_or(0);

        if let Some(target) = target {
            check_apply_target(&migrations, &applied, current, target)?;
        }

        let plan = pending_migrations(&migrations, current, target);
        if plan.is_empty() {
            tracing::info!(current, "no pending migrations");
        }

        let mut done = Vec::with_capacity(plan.len());
        for migration in plan {
            self.apply_one(&migration).await?;
            done.push(migration);
        }
        Ok(done)
    }

    async fn apply_one(&self, migration: &Migration) -> Result<()> {
        let id = migration.id();
        let statements = migration.up_statements();

        match compare(self.conn, &self.schema, &statements).await {
            Ok(result) => {
                tracing::info!(migration = %id, "{}", format_summary(&result));
                tracing::debug!("{}", format(&result, &id));
            }
            Err(err) => {
                tracing::warn!(migration = %id, error = %err, "pre-apply comparison failed");
            }
        }

        check_safety(&id, &statements, self.allow_unsafe)?;

        let marker = format!(
            "INSERT INTO {} (version) VALUES ($1)",
            quote_qualified(&self.table)
        );
        tx::transaction(self.conn, async |conn: &C| {
            for statement in &statements {
                conn.traced()
                    .batch_execute(statement)
                    .await
                    .map_err(|e| Error::execution(&id, e))?;
            }
            conn.traced()
                .execute(&marker, &[&migration.version])
                .await
                .map_err(|e| Error::execution(&id, e))?;
            Ok(())
        })
        .await?;

        tracing::info!(migration = %id, statements = statements.len(), "applied migration");
        Ok(())
    }

    /// Roll back the current migration, or everything above `target`.
    ///
    /// Returns the migrations that were rolled back, newest first.
    pub async fn rollback(&self, caller: &Caller, target: Option<i64>) -> Result<Vec<Migration>> {
        self.gate.authorize(caller, Action::RollbackMigration)?;

        let migrations = self.discover()?;
        let applied = self.applied_versions().await?;
        if applied.is_empty() && target.is_none_or(|t| t == 0) {
            tracing::info!("nothing to roll back");
            return Ok(Vec::new());
        }

        let plan = rollback_plan(&migrations, &applied, target)?;
        for migration in &plan {
            self.rollback_one(migration).await?;
        }
        Ok(plan)
    }

    async fn rollback_one(&self, migration: &Migration) -> Result<()> {
        let id = migration.id();
        let statements = migration.down_statements();
        check_safety(&id, &statements, self.allow_unsafe)?;
        let marker = format!(
            "DELETE FROM {} WHERE version = $1",
            quote_qualified(&self.table)
        );

        tx::transaction(self.conn, async |conn: &C| {
            for statement in &statements {
                conn.traced()
                    .batch_execute(statement)
                    .await
                    .map_err(|e| Error::execution(&id, e))?;
            }
            conn.traced()
                .execute(&marker, &[&migration.version])
                .await
                .map_err(|e| Error::execution(&id, e))?;
            Ok(())
        })
        .await?;

        tracing::info!(migration = %id, statements = statements.len(), "rolled back migration");
        Ok(())
    }

    /// Roll back the current migration and apply it again.
    pub async fn redo(&self, caller: &Caller) -> Result<Vec<Migration>> {
        self.gate.authorize(caller, Action::ApplyMigration)?;
        let rolled_back = self.rollback(caller, None).await?;
        for migration in &rolled_back {
            self.apply_one(migration).await?;
        }
        Ok(rolled_back)
    }

    /// Every discovered migration with its state, in version order.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        let migrations = self.discover()?;
        let applied = self.applied().await?;
        let current = applied.last().map(|a| a.version).unwrap_or(0);

        Ok(migrations
            .into_iter()
            .map(|m| {
                let applied_at = applied
                    .iter()
                    .find(|a| a.version == m.version)
                    .map(|a| a.applied_at);
                MigrationStatus {
                    version: m.version,
                    state: if m.version <= current {
                        MigrationState::Applied
                    } else {
                        MigrationState::Pending
                    },
                    name: m.name,
                    applied_at,
                }
            })
            .collect())
    }

    /// Remove registry entries for triggers that no longer exist.
    pub async fn cleanup_orphaned_registry_entries(&self, caller: &Caller) -> Result<Vec<String>> {
        self.gate.authorize(caller, Action::ApplyMigration)?;
        Registry::new(self.conn, self.gate)
            .with_table(self.registry_table.as_str())
            .in_schema(self.schema.as_str())
            .prune_orphans()
            .await
    }
}
