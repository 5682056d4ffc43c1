//! Trial execution of trigger SQL without side effects.
//!
//! Everything that touches the database here runs inside
//! [`tx::rolled_back`], so it ends in `ROLLBACK` whatever happens. Expected
//! failures (bad SQL, a failing trigger) are reported, not raised.
//!
//! Each step is exactly one statement, sent with the extended query
//! protocol, which refuses multi-statement strings on the server side too.
//! Transaction control is refused before it's sent.

use std::fmt;

use indexmap::IndexMap;
use trig_config::{DEFAULT_REGISTRY_TABLE, DEFAULT_SCHEMA};
use trig_sql::{Lit, is_transaction_control, quote_ident, quote_qualified, split_statements};

use crate::error::describe_pg_error;
use crate::registry::fetch_entry;
use crate::{Catalog, Connection, ConnectionExt, Error, Result, TriggerDefinition, tx};

const ROLLED_BACK: &str = "⚠ All changes rolled back (test mode)";

/// Column values for a synthetic `INSERT`. `None` inserts `NULL`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleRow {
    values: IndexMap<String, Option<String>>,
}

impl SampleRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(column.into(), Some(value.into()));
        self
    }

    pub fn null(mut self, column: impl Into<String>) -> Self {
        self.values.insert(column.into(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `INSERT` for this row, values quoted as literals.
    ///
    /// ```
    /// use trig::SampleRow;
    ///
    /// let row = SampleRow::new().set("email", "a@b.c").null("name");
    /// assert_eq!(
    ///     row.insert_sql("users"),
    ///     "INSERT INTO \"users\" (\"email\", \"name\") VALUES ('a@b.c', NULL)"
    /// );
    /// ```
    pub fn insert_sql(&self, table: &str) -> String {
        if self.values.is_empty() {
            return format!("INSERT INTO {} DEFAULT VALUES", quote_qualified(table));
        }
        let columns: Vec<String> = self.values.keys().map(|c| quote_ident(c)).collect();
        let values: Vec<String> = self
            .values
            .values()
            .map(|v| match v {
                Some(v) => Lit(v).to_string(),
                None => "NULL".to_string(),
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_qualified(table),
            columns.join(", "),
            values.join(", ")
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, Option<V>)> for SampleRow {
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        }
    }
}

/// Result of [`Sandbox::test_execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestReport {
    pub function_created: bool,
    pub trigger_created: bool,
    pub sample_inserted: bool,
    /// Progress messages, in order.
    pub output: Vec<String>,
    pub errors: Vec<String>,
    pub rolled_back: bool,
}

impl TestReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.rolled_back
    }

    fn failed(message: String) -> Self {
        Self {
            errors: vec![message],
            ..Default::default()
        }
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.output {
            writeln!(f, "{}", line)?;
        }
        for error in &self.errors {
            writeln!(f, "✗ {}", error)?;
        }
        Ok(())
    }
}

/// Which statement a piece of generated SQL is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlPartKind {
    Function,
    CreateTrigger,
    DropTrigger,
}

impl fmt::Display for SqlPartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SqlPartKind::Function => "CREATE FUNCTION",
            SqlPartKind::CreateTrigger => "CREATE TRIGGER",
            SqlPartKind::DropTrigger => "DROP TRIGGER",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlPart {
    pub kind: SqlPartKind,
    pub sql: String,
}

/// The SQL a definition would run. Nothing is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRun {
    pub parts: Vec<SqlPart>,
}

impl DryRun {
    pub fn part(&self, kind: SqlPartKind) -> Option<&SqlPart> {
        self.parts.iter().find(|p| p.kind == kind)
    }
}

impl fmt::Display for DryRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "-- {}", part.kind)?;
            writeln!(f, "{}", part.sql)?;
        }
        Ok(())
    }
}

/// Generate the SQL for a definition: function, create trigger, drop trigger.
pub fn dry_run(def: &TriggerDefinition) -> DryRun {
    let mut parts = Vec::with_capacity(3);
    if let Some(body) = def.function_body() {
        parts.push(SqlPart {
            kind: SqlPartKind::Function,
            sql: body.trim().to_string(),
        });
    }
    parts.push(SqlPart {
        kind: SqlPartKind::CreateTrigger,
        sql: def.create_trigger_sql(),
    });
    parts.push(SqlPart {
        kind: SqlPartKind::DropTrigger,
        sql: def.drop_trigger_sql(),
    });
    DryRun { parts }
}

/// Outcome of checking one statement in [`Sandbox::syntax_validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementCheck {
    pub kind: SqlPartKind,
    pub sql: String,
    pub error: Option<String>,
}

impl StatementCheck {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyntaxReport {
    pub checks: Vec<StatementCheck>,
    /// Failures outside any one statement, e.g. opening the transaction.
    pub errors: Vec<String>,
}

impl SyntaxReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty() && self.checks.iter().all(StatementCheck::passed)
    }
}

/// Result of [`Sandbox::function_test`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionReport {
    pub function_created: bool,
    /// The function was visible in `pg_proc` after creation.
    pub function_visible: bool,
    pub output: Vec<String>,
    pub errors: Vec<String>,
}

impl FunctionReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.function_visible
    }
}

/// Runs trigger SQL in transactions that are always rolled back.
pub struct Sandbox<'a, C: Connection + ?Sized> {
    conn: &'a C,
    schema: String,
    registry_table: String,
}

impl<'a, C: Connection + ?Sized> Sandbox<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self {
            conn,
            schema: DEFAULT_SCHEMA.to_string(),
            registry_table: DEFAULT_REGISTRY_TABLE.to_string(),
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_registry_table(mut self, table: impl Into<String>) -> Self {
        self.registry_table = table.into();
        self
    }

    /// Create the function, create the trigger, optionally insert a sample
    /// row, then roll everything back.
    pub async fn test_execute(
        &self,
        def: &TriggerDefinition,
        sample: Option<&SampleRow>,
    ) -> TestReport {
        let plan = dry_run(def);
        let result = tx::rolled_back(self.conn, async |conn: &C| {
            let mut report = TestReport::default();
            let mut aborted = false;

            match plan.part(SqlPartKind::Function) {
                Some(function) => match run_single(conn, &function.sql).await {
                    Ok(()) => {
                        report.function_created = true;
                        report.output.push("✓ Function created successfully".into());
                    }
                    Err(e) => {
                        report.errors.push(format!("Error creating function: {}", e));
                        aborted = true;
                    }
                },
                None => report.output.push(format!(
                    "- No inline function body; using existing function {}",
                    def.function()
                )),
            }

            if aborted {
                report
                    .output
                    .push("- Skipped CREATE TRIGGER (earlier step failed)".into());
            } else if let Some(create) = plan.part(SqlPartKind::CreateTrigger) {
                match run_single(conn, &create.sql).await {
                    Ok(()) => {
                        report.trigger_created = true;
                        report.output.push("✓ Trigger created successfully".into());
                    }
                    Err(e) => {
                        report.errors.push(format!("Error creating trigger: {}", e));
                        aborted = true;
                    }
                }
            }

            if let Some(sample) = sample {
                if aborted || !report.trigger_created {
                    report
                        .output
                        .push("- Skipped test insert (earlier step failed)".into());
                } else {
                    let sql = sample.insert_sql(def.table());
                    match run_single(conn, &sql).await {
                        Ok(()) => {
                            report.sample_inserted = true;
                            report
                                .output
                                .push("✓ Test insert executed successfully".into());
                        }
                        Err(e) => report
                            .errors
                            .push(format!("Error executing test insert: {}", e)),
                    }
                }
            }

            report
        })
        .await;

        match result {
            Ok(mut report) => {
                report.rolled_back = true;
                report.output.push(ROLLED_BACK.into());
                report
            }
            Err(e) => {
                tracing::warn!(trigger = %def.name(), error = %e, "sandbox transaction failed");
                TestReport::failed(format!("Sandbox transaction failed: {}", e))
            }
        }
    }

    /// The SQL a definition would run, without running it.
    pub fn dry_run(&self, def: &TriggerDefinition) -> DryRun {
        dry_run(def)
    }

    /// Check the function and trigger statements against the server, one
    /// savepoint per statement, and roll everything back.
    pub async fn syntax_validate(&self, def: &TriggerDefinition) -> SyntaxReport {
        let parts: Vec<SqlPart> = dry_run(def)
            .parts
            .into_iter()
            .filter(|p| p.kind != SqlPartKind::DropTrigger)
            .collect();

        let result = tx::rolled_back(self.conn, async |conn: &C| {
            let mut checks = Vec::with_capacity(parts.len());
            for part in &parts {
                let error = check_statement(conn, &part.sql).await.err();
                checks.push(StatementCheck {
                    kind: part.kind,
                    sql: part.sql.clone(),
                    error,
                });
            }
            checks
        })
        .await;

        match result {
            Ok(checks) => SyntaxReport {
                checks,
                errors: Vec::new(),
            },
            Err(e) => SyntaxReport {
                checks: Vec::new(),
                errors: vec![format!("Sandbox transaction failed: {}", e)],
            },
        }
    }

    /// Create only the function and confirm it shows up in the catalog.
    pub async fn function_test(&self, def: &TriggerDefinition) -> FunctionReport {
        let Some(body) = def.function_body() else {
            return FunctionReport {
                errors: vec![format!(
                    "No function body to test for trigger {}",
                    def.name()
                )],
                ..Default::default()
            };
        };

        let schema = self.schema.as_str();
        let result = tx::rolled_back(self.conn, async |conn: &C| {
            let mut report = FunctionReport::default();
            if let Err(e) = run_single(conn, body).await {
                report.errors.push(format!("Error creating function: {}", e));
                return report;
            }
            report.function_created = true;
            report.output.push("✓ Function created successfully".into());

            match Catalog::new(conn, schema).function(def.function()).await {
                Ok(Some(_)) => {
                    report.function_visible = true;
                    report.output.push(format!("✓ Function {} exists", def.function()));
                }
                Ok(None) => report.errors.push(format!(
                    "Function {} was not found after creation; does the body create a different name?",
                    def.function()
                )),
                Err(e) => report
                    .errors
                    .push(format!("Error looking up function: {}", e)),
            }
            report
        })
        .await;

        match result {
            Ok(mut report) => {
                report.output.push(ROLLED_BACK.into());
                report
            }
            Err(e) => FunctionReport {
                errors: vec![format!("Sandbox transaction failed: {}", e)],
                ..Default::default()
            },
        }
    }

    /// [`Self::test_execute`] for a registered trigger.
    ///
    /// An unknown name is an error; everything else lands in the report.
    pub async fn test_registered(&self, name: &str, sample: Option<&SampleRow>) -> Result<TestReport> {
        let entry = fetch_entry(self.conn, &self.registry_table, name)
            .await?
            .ok_or_else(|| Error::TriggerNotFound {
                name: name.to_string(),
            })?;

        match entry.definition() {
            Ok(Some(def)) => Ok(self.test_execute(&def, sample).await),
            Ok(None) => Ok(TestReport::failed(format!(
                "Registry entry {} has no stored definition",
                name
            ))),
            Err(e) => Ok(TestReport::failed(e.to_string())),
        }
    }
}

/// The one statement in `sql`, or why it can't run in the sandbox.
fn single_statement(sql: &str) -> std::result::Result<String, String> {
    let mut statements = split_statements(sql);
    match statements.len() {
        0 => Err("no statement to run".to_string()),
        1 => {
            let statement = statements.remove(0);
            if is_transaction_control(&statement) {
                Err(format!(
                    "transaction control is not allowed in the sandbox: {}",
                    statement
                ))
            } else {
                Ok(statement)
            }
        }
        n => Err(format!("expected one statement, found {}", n)),
    }
}

async fn run_single<C: Connection + ?Sized>(conn: &C, sql: &str) -> std::result::Result<(), String> {
    let statement = single_statement(sql)?;
    conn.traced()
        .execute(&statement, &[])
        .await
        .map(|_| ())
        .map_err(|e| describe_pg_error(&e))
}

/// Parse and run one statement inside its own savepoint. On failure the
/// savepoint is rolled back so the outer transaction stays usable.
async fn check_statement<C: Connection + ?Sized>(
    conn: &C,
    sql: &str,
) -> std::result::Result<(), String> {
    let statement = single_statement(sql)?;
    let savepoint = quote_ident("trig_syntax_check");
    conn.traced()
        .batch_execute(&format!("SAVEPOINT {}", savepoint))
        .await
        .map_err(|e| describe_pg_error(&e))?;

    let outcome = match conn.traced().prepare(&statement).await {
        Ok(_) => conn.traced().execute(&statement, &[]).await.map(|_| ()),
        Err(e) => Err(e),
    };

    let end = match outcome {
        Ok(()) => format!("RELEASE SAVEPOINT {}", savepoint),
        Err(_) => format!("ROLLBACK TO SAVEPOINT {}", savepoint),
    };
    conn.traced()
        .batch_execute(&end)
        .await
        .map_err(|e| describe_pg_error(&e))?;

    outcome.map_err(|e| describe_pg_error(&e))
}
