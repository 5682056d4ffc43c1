//! The trigger registry: declared definitions, keyed by trigger name.
//!
//! The registry is the only writer of its table. Every registration
//! recomputes the checksum, so a stored checksum always describes the stored
//! fields.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use trig_config::{DEFAULT_REGISTRY_TABLE, DEFAULT_SCHEMA};
use trig_sql::{quote_ident, quote_qualified};

use crate::drift::{Detector, DriftEntry, DriftState};
use crate::meta::registry_table_sql;
use crate::{
    Action, Caller, Catalog, Connection, ConnectionExt, Error, Gate, Result, TriggerDefinition,
    checksum, checksum_fields, tx,
};

const ENTRY_COLUMNS: &str = "id, trigger_name, table_name, version, enabled, source, environment, \
     definition, function_body, condition, checksum, created_at, updated_at";

/// Where a registry entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Declared with a [`TriggerDefinition`].
    Dsl,
    /// Written by a generator.
    Generated,
    /// Adopted from a trigger found in the database.
    Discovered,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Dsl => "dsl",
            Source::Generated => "generated",
            Source::Discovered => "discovered",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dsl" => Ok(Source::Dsl),
            "generated" => Ok(Source::Generated),
            "discovered" => Ok(Source::Discovered),
            other => Err(Error::Definition(format!(
                "unknown registry source '{}'",
                other
            ))),
        }
    }
}

/// A persisted registry row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub id: i64,
    pub trigger_name: String,
    pub table_name: String,
    pub version: i32,
    pub enabled: bool,
    pub source: Source,
    /// Stored as comma-delimited text.
    pub environments: Vec<String>,
    /// Canonical JSON of the definition.
    pub definition: Option<String>,
    pub function_body: Option<String>,
    pub condition: Option<String>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegistryEntry {
    /// Parse the stored definition, if there is one.
    pub fn definition(&self) -> Result<Option<TriggerDefinition>> {
        self.definition
            .as_deref()
            .map(TriggerDefinition::from_json)
            .transpose()
    }

    /// Checksum of the stored fields, computed fresh.
    pub fn computed_checksum(&self) -> String {
        checksum_fields(
            &self.trigger_name,
            &self.table_name,
            self.version,
            self.function_body.as_deref(),
            self.condition.as_deref(),
        )
    }

    fn from_row(row: &Row) -> Result<Self> {
        let source: String = row.try_get("source")?;
        let environment: Option<String> = row.try_get("environment")?;
        Ok(Self {
            id: row.try_get("id")?,
            trigger_name: row.try_get("trigger_name")?,
            table_name: row.try_get("table_name")?,
            version: row.try_get("version")?,
            enabled: row.try_get("enabled")?,
            source: source.parse()?,
            environments: split_environments(environment.as_deref()),
            definition: row.try_get("definition")?,
            function_body: row.try_get("function_body")?,
            condition: row.try_get("condition")?,
            checksum: row.try_get("checksum")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn split_environments(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

/// One problem found by [`Registry::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub trigger_name: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn new(trigger_name: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            trigger_name: trigger_name.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trigger_name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Create the registry table if it's missing.
pub(crate) async fn ensure_registry_table<C: Connection + ?Sized>(
    conn: &C,
    table: &str,
) -> Result<()> {
    conn.traced()
        .batch_execute(&registry_table_sql(table))
        .await?;
    Ok(())
}

pub(crate) async fn fetch_entries<C: Connection + ?Sized>(
    conn: &C,
    table: &str,
) -> Result<Vec<RegistryEntry>> {
    ensure_registry_table(conn, table).await?;
    let sql = format!(
        "SELECT {} FROM {} ORDER BY trigger_name",
        ENTRY_COLUMNS,
        quote_qualified(table)
    );
    let rows = conn.traced().query(&sql, &[]).await?;
    rows.iter().map(RegistryEntry::from_row).collect()
}

pub(crate) async fn fetch_entry<C: Connection + ?Sized>(
    conn: &C,
    table: &str,
    name: &str,
) -> Result<Option<RegistryEntry>> {
    ensure_registry_table(conn, table).await?;
    let sql = format!(
        "SELECT {} FROM {} WHERE trigger_name = $1",
        ENTRY_COLUMNS,
        quote_qualified(table)
    );
    let row = conn.traced().query_opt(&sql, &[&name]).await?;
    row.as_ref().map(RegistryEntry::from_row).transpose()
}

/// Registry operations over one connection.
pub struct Registry<'a, C: Connection + ?Sized> {
    conn: &'a C,
    gate: &'a Gate,
    table: String,
    schema: String,
}

impl<'a, C: Connection + ?Sized> Registry<'a, C> {
    pub fn new(conn: &'a C, gate: &'a Gate) -> Self {
        Self {
            conn,
            gate,
            table: DEFAULT_REGISTRY_TABLE.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }

    /// Use a different registry table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Look for live triggers in a different schema.
    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the registry table if it's missing. Reads and writes do this
    /// on their own; calling it up front just surfaces permission problems
    /// early.
    pub async fn ensure_table(&self) -> Result<()> {
        ensure_registry_table(self.conn, &self.table).await
    }

    /// Insert or update the entry for `def.name()`.
    pub async fn register(&self, caller: &Caller, def: &TriggerDefinition) -> Result<RegistryEntry> {
        self.gate.authorize(caller, Action::ApplyTrigger)?;
        self.ensure_table().await?;

        let json = def.to_json()?;
        let checksum = checksum(def);
        let environment = if def.environments().is_empty() {
            None
        } else {
            Some(def.environments().join(","))
        };

        let sql = format!(
            "INSERT INTO {table} (trigger_name, table_name, version, enabled, source, environment, \
             definition, function_body, condition, checksum) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (trigger_name) DO UPDATE SET \
             table_name = EXCLUDED.table_name, \
             version = EXCLUDED.version, \
             enabled = EXCLUDED.enabled, \
             source = EXCLUDED.source, \
             environment = EXCLUDED.environment, \
             definition = EXCLUDED.definition, \
             function_body = EXCLUDED.function_body, \
             condition = EXCLUDED.condition, \
             checksum = EXCLUDED.checksum, \
             updated_at = now() \
             RETURNING {columns}",
            table = quote_qualified(&self.table),
            columns = ENTRY_COLUMNS,
        );

        let row = self
            .conn
            .traced()
            .query_one(
                &sql,
                &[
                    &def.name(),
                    &def.table(),
                    &def.version(),
                    &def.enabled(),
                    &Source::Dsl.as_str(),
                    &environment,
                    &json,
                    &def.function_body(),
                    &def.condition(),
                    &checksum,
                ],
            )
            .await?;

        let entry = RegistryEntry::from_row(&row)?;
        tracing::info!(
            trigger = %entry.trigger_name,
            checksum = %entry.checksum,
            actor = %caller.actor,
            "registered trigger"
        );
        Ok(entry)
    }

    pub async fn list(&self) -> Result<Vec<RegistryEntry>> {
        fetch_entries(self.conn, &self.table).await
    }

    pub async fn enabled(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.list().await?.into_iter().filter(|e| e.enabled).collect())
    }

    pub async fn disabled(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.list().await?.into_iter().filter(|e| !e.enabled).collect())
    }

    pub async fn for_table(&self, table: &str) -> Result<Vec<RegistryEntry>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.table_name == table)
            .collect())
    }

    pub async fn get(&self, name: &str) -> Result<Option<RegistryEntry>> {
        fetch_entry(self.conn, &self.table, name).await
    }

    /// Like [`Self::get`], but a missing entry is an error.
    pub async fn find(&self, name: &str) -> Result<RegistryEntry> {
        self.get(name).await?.ok_or_else(|| Error::TriggerNotFound {
            name: name.to_string(),
        })
    }

    pub fn detector(&self) -> Detector<'a, C> {
        Detector::new(self.conn, self.schema.as_str(), self.table.as_str())
    }

    /// Drift report for one trigger, or the summary for all of them.
    pub async fn diff(&self, name: Option<&str>) -> Result<String> {
        let detector = self.detector();
        match name {
            Some(name) => detector.report(name).await,
            None => detector.summary().await,
        }
    }

    async fn in_state(&self, state: DriftState) -> Result<Vec<DriftEntry>> {
        Ok(self
            .detector()
            .detect_all()
            .await?
            .into_iter()
            .filter(|e| e.state == state)
            .collect())
    }

    pub async fn drifted(&self) -> Result<Vec<DriftEntry>> {
        self.in_state(DriftState::Drifted).await
    }

    pub async fn in_sync(&self) -> Result<Vec<DriftEntry>> {
        self.in_state(DriftState::InSync).await
    }

    pub async fn unknown_triggers(&self) -> Result<Vec<DriftEntry>> {
        self.in_state(DriftState::Unknown).await
    }

    pub async fn dropped(&self) -> Result<Vec<DriftEntry>> {
        self.in_state(DriftState::Dropped).await
    }

    /// Check every entry, collecting all problems into one error.
    pub async fn validate(&self) -> Result<()> {
        let entries = self.list().await?;
        let catalog = Catalog::new(self.conn, self.schema.as_str());
        let mut issues = Vec::new();
        let mut seen = HashSet::new();

        for entry in &entries {
            let name = entry.trigger_name.trim();
            if name.is_empty() {
                issues.push(ValidationIssue::new(None, "trigger_name is blank"));
            } else if !seen.insert(name.to_string()) {
                issues.push(ValidationIssue::new(Some(name), "duplicate trigger_name"));
            }
            let label = Some(name).filter(|n| !n.is_empty());

            if entry.table_name.trim().is_empty() {
                issues.push(ValidationIssue::new(label, "table_name is blank"));
            } else if !catalog.table_exists(&entry.table_name).await? {
                issues.push(ValidationIssue::new(
                    label,
                    format!("table '{}' does not exist", entry.table_name),
                ));
            }

            if let Err(err) = entry.definition() {
                issues.push(ValidationIssue::new(label, err.to_string()));
            }

            if entry.computed_checksum() != entry.checksum {
                issues.push(ValidationIssue::new(label, "checksum does not match stored fields"));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation { issues })
        }
    }

    /// Enable or disable a trigger, both live and in the registry.
    pub async fn set_enabled(
        &self,
        caller: &Caller,
        name: &str,
        enabled: bool,
    ) -> Result<RegistryEntry> {
        let action = if enabled {
            Action::EnableTrigger
        } else {
            Action::DisableTrigger
        };
        self.gate.authorize(caller, action)?;

        self.find(name).await?;
        let live = Catalog::new(self.conn, self.schema.as_str())
            .trigger(name)
            .await?;

        let update = format!(
            "UPDATE {} SET enabled = $2, updated_at = now() WHERE trigger_name = $1 RETURNING {}",
            quote_qualified(&self.table),
            ENTRY_COLUMNS
        );
        let alter = live.map(|live| {
            format!(
                "ALTER TABLE {}.{} {} TRIGGER {}",
                quote_ident(&self.schema),
                quote_ident(&live.table),
                if enabled { "ENABLE" } else { "DISABLE" },
                quote_ident(name)
            )
        });

        let entry = tx::transaction(self.conn, async |conn: &C| {
            if let Some(alter) = &alter {
                conn.traced().batch_execute(alter).await?;
            }
            let row = conn.traced().query_one(&update, &[&name, &enabled]).await?;
            RegistryEntry::from_row(&row)
        })
        .await?;

        tracing::info!(trigger = %name, enabled, actor = %caller.actor, "trigger toggled");
        Ok(entry)
    }

    /// Drop a trigger from the database and the registry.
    ///
    /// `reason` is required and logged.
    pub async fn drop_trigger(&self, caller: &Caller, name: &str, reason: &str) -> Result<()> {
        self.gate.authorize(caller, Action::DropTrigger)?;

        if reason.trim().is_empty() {
            return Err(Error::Validation {
                issues: vec![ValidationIssue::new(
                    Some(name),
                    "a reason is required to drop a trigger",
                )],
            });
        }

        let entry = self.get(name).await?;
        let live = Catalog::new(self.conn, self.schema.as_str())
            .trigger(name)
            .await?;
        let table = match (&live, &entry) {
            (Some(live), _) => format!("{}.{}", quote_ident(&self.schema), quote_ident(&live.table)),
            (None, Some(entry)) => quote_qualified(&entry.table_name),
            (None, None) => {
                return Err(Error::TriggerNotFound {
                    name: name.to_string(),
                });
            }
        };

        let drop = format!("DROP TRIGGER IF EXISTS {} ON {}", quote_ident(name), table);
        let delete = format!(
            "DELETE FROM {} WHERE trigger_name = $1",
            quote_qualified(&self.table)
        );

        tx::transaction(self.conn, async |conn: &C| {
            if live.is_some() {
                conn.traced().batch_execute(&drop).await?;
            }
            conn.traced().execute(&delete, &[&name]).await?;
            Ok(())
        })
        .await?;

        tracing::info!(trigger = %name, actor = %caller.actor, reason = %reason.trim(), "trigger dropped");
        Ok(())
    }

    /// Delete entries whose trigger no longer exists in the database.
    ///
    /// Returns the removed names. Only reachable through
    /// [`crate::MigrationRunner::cleanup_orphaned_registry_entries`], which
    /// does the authorization.
    pub(crate) async fn prune_orphans(&self) -> Result<Vec<String>> {
        let entries = self.list().await?;
        let live: HashSet<String> = Catalog::new(self.conn, self.schema.as_str())
            .triggers()
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();

        let orphans: Vec<String> = entries
            .into_iter()
            .map(|e| e.trigger_name)
            .filter(|name| !live.contains(name))
            .collect();
        if orphans.is_empty() {
            return Ok(orphans);
        }

        let sql = format!(
            "DELETE FROM {} WHERE trigger_name = ANY($1)",
            quote_qualified(&self.table)
        );
        self.conn.traced().execute(&sql, &[&orphans]).await?;
        tracing::info!(count = orphans.len(), names = ?orphans, "pruned orphaned registry entries");
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Actor, Event, Role, RoleChecker};
    use std::future::Future;
    use std::pin::Pin;
    use tokio_postgres::Statement;
    use tokio_postgres::types::ToSql;

    type BoxFut<'a, T> =
        Pin<Box<dyn Future<Output = std::result::Result<T, tokio_postgres::Error>> + Send + 'a>>;

    /// A connection that fails the test if anything reaches the database.
    struct Unreachable;

    fn unreachable_query<'a, T: 'a>(sql: &str) -> BoxFut<'a, T> {
        panic!("no query expected, got: {sql}")
    }

    impl Connection for Unreachable {
        fn execute<'a>(&'a self, sql: &'a str, _: &'a [&'a (dyn ToSql + Sync)]) -> BoxFut<'a, u64> {
            unreachable_query(sql)
        }

        fn query<'a>(&'a self, sql: &'a str, _: &'a [&'a (dyn ToSql + Sync)]) -> BoxFut<'a, Vec<Row>> {
            unreachable_query(sql)
        }

        fn query_opt<'a>(
            &'a self,
            sql: &'a str,
            _: &'a [&'a (dyn ToSql + Sync)],
        ) -> BoxFut<'a, Option<Row>> {
            unreachable_query(sql)
        }

        fn query_one<'a>(&'a self, sql: &'a str, _: &'a [&'a (dyn ToSql + Sync)]) -> BoxFut<'a, Row> {
            unreachable_query(sql)
        }

        fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFut<'a, ()> {
            unreachable_query(sql)
        }

        fn prepare<'a>(&'a self, sql: &'a str) -> BoxFut<'a, Statement> {
            unreachable_query(sql)
        }
    }

    #[tokio::test]
    async fn test_viewer_cannot_register() {
        let gate = Gate::new(RoleChecker);
        let registry = Registry::new(&Unreachable, &gate);
        let def = TriggerDefinition::builder("audit_users")
            .table("users")
            .on(Event::Insert)
            .function("log_user_change")
            .build()
            .unwrap();
        let viewer = Caller::new(Actor::new("user").id("guest").role(Role::Viewer));

        let err = registry.register(&viewer, &def).await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::Permission {
                    action: Action::ApplyTrigger,
                    required: Role::Operator
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn test_split_environments() {
        assert_eq!(
            split_environments(Some("production, staging,,")),
            vec!["production", "staging"]
        );
        assert!(split_environments(None).is_empty());
        assert!(split_environments(Some("")).is_empty());
    }

    #[test]
    fn test_source_names() {
        for source in [Source::Dsl, Source::Generated, Source::Discovered] {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert!("manual".parse::<Source>().is_err());
    }

    #[test]
    fn test_validation_issue_display() {
        let issue = ValidationIssue::new(Some("audit_users"), "table 'users' does not exist");
        assert_eq!(issue.to_string(), "audit_users: table 'users' does not exist");
        assert_eq!(
            ValidationIssue::new(None, "trigger_name is blank").to_string(),
            "trigger_name is blank"
        );
    }
}
