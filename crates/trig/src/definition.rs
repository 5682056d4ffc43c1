//! Trigger definitions: the declared shape of a trigger and its function.
//!
//! A [`TriggerDefinition`] is immutable once built. Build one with
//! [`TriggerDefinition::builder`]:
//!
//! ```
//! use trig::{Event, TriggerDefinition};
//!
//! let def = TriggerDefinition::builder("audit_users")
//!     .table("users")
//!     .after()
//!     .on(Event::Insert)
//!     .on(Event::Update)
//!     .function("log_user_change")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(
//!     def.create_trigger_sql(),
//!     "CREATE TRIGGER \"audit_users\" AFTER INSERT OR UPDATE ON \"users\" FOR EACH ROW EXECUTE FUNCTION \"log_user_change\"();"
//! );
//! ```

use std::borrow::Cow;

use facet::Facet;
use trig_sql::{fragment_problem, quote_ident, quote_qualified};

use crate::{Error, Result};

/// A row-level event that fires a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Facet)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum Event {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl Event {
    pub fn as_sql(self) -> &'static str {
        match self {
            Event::Insert => "INSERT",
            Event::Update => "UPDATE",
            Event::Delete => "DELETE",
            Event::Truncate => "TRUNCATE",
        }
    }
}

/// When the trigger fires relative to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Facet)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum Timing {
    #[default]
    Before,
    After,
    InsteadOf,
}

impl Timing {
    pub fn as_sql(self) -> &'static str {
        match self {
            Timing::Before => "BEFORE",
            Timing::After => "AFTER",
            Timing::InsteadOf => "INSTEAD OF",
        }
    }
}

/// `FOR EACH ROW` or `FOR EACH STATEMENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Facet)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum Level {
    #[default]
    Row,
    Statement,
}

impl Level {
    pub fn as_sql(self) -> &'static str {
        match self {
            Level::Row => "ROW",
            Level::Statement => "STATEMENT",
        }
    }
}

/// A declared trigger.
///
/// Events, environments and columns are kept deduplicated and sorted so two
/// definitions that mean the same thing serialize identically.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct TriggerDefinition {
    name: String,
    table: String,
    events: Vec<Event>,
    timing: Timing,
    level: Level,
    function: String,
    function_body: Option<String>,
    condition: Option<String>,
    version: i32,
    enabled: bool,
    environments: Vec<String>,
    columns: Vec<String>,
}

impl TriggerDefinition {
    pub fn builder(name: impl Into<String>) -> TriggerBuilder {
        TriggerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Name of the function the trigger executes.
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Full `CREATE [OR REPLACE] FUNCTION` statement, if declared inline.
    pub fn function_body(&self) -> Option<&str> {
        self.function_body.as_deref()
    }

    /// The function's source as the catalog stores it: the quoted body of
    /// [`Self::function_body`].
    pub fn function_source(&self) -> Option<Cow<'_, str>> {
        self.function_body
            .as_deref()
            .and_then(trig_sql::function_source)
    }

    /// The `WHEN` condition, without the surrounding `WHEN ( )`.
    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn environments(&self) -> &[String] {
        &self.environments
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Whether this trigger should exist in `environment`.
    ///
    /// A definition with no environments applies everywhere.
    pub fn applies_to(&self, environment: &str) -> bool {
        self.environments.is_empty() || self.environments.iter().any(|e| e == environment)
    }

    /// `CREATE TRIGGER` for this definition.
    pub fn create_trigger_sql(&self) -> String {
        let events = self
            .events
            .iter()
            .map(|event| match event {
                Event::Update if !self.columns.is_empty() => {
                    let cols: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
                    format!("UPDATE OF {}", cols.join(", "))
                }
                other => other.as_sql().to_string(),
            })
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut sql = format!(
            "CREATE TRIGGER {} {} {} ON {} FOR EACH {}",
            quote_ident(&self.name),
            self.timing.as_sql(),
            events,
            quote_qualified(&self.table),
            self.level.as_sql(),
        );
        if let Some(condition) = &self.condition {
            sql.push_str(&format!(" WHEN ({})", condition));
        }
        sql.push_str(&format!(
            " EXECUTE FUNCTION {}();",
            quote_qualified(&self.function)
        ));
        sql
    }

    /// `DROP TRIGGER IF EXISTS` for this definition.
    pub fn drop_trigger_sql(&self) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {} ON {};",
            quote_ident(&self.name),
            quote_qualified(&self.table)
        )
    }

    /// Canonical JSON form, as stored in the registry.
    pub fn to_json(&self) -> Result<String> {
        facet_json::to_string(self).map_err(|e| {
            Error::Definition(format!("failed to serialize '{}': {}", self.name, e))
        })
    }

    /// Parse the JSON form back, re-running builder validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: TriggerDefinition = facet_json::from_str(json)
            .map_err(|e| Error::Definition(format!("failed to parse definition: {}", e)))?;
        TriggerBuilder::from(raw).build()
    }
}

/// Builder for [`TriggerDefinition`].
#[derive(Debug, Clone)]
pub struct TriggerBuilder {
    name: String,
    table: Option<String>,
    events: Vec<Event>,
    timing: Timing,
    level: Level,
    function: Option<String>,
    function_body: Option<String>,
    condition: Option<String>,
    version: i32,
    enabled: bool,
    environments: Vec<String>,
    columns: Vec<String>,
}

impl TriggerBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            events: Vec::new(),
            timing: Timing::default(),
            level: Level::default(),
            function: None,
            function_body: None,
            condition: None,
            version: 1,
            enabled: true,
            environments: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn on(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn before(self) -> Self {
        self.timing(Timing::Before)
    }

    pub fn after(self) -> Self {
        self.timing(Timing::After)
    }

    pub fn instead_of(self) -> Self {
        self.timing(Timing::InsteadOf)
    }

    pub fn for_each_statement(mut self) -> Self {
        self.level = Level::Statement;
        self
    }

    pub fn function(mut self, name: impl Into<String>) -> Self {
        self.function = Some(name.into());
        self
    }

    /// Inline function definition: a complete `CREATE FUNCTION` statement.
    pub fn function_body(mut self, sql: impl Into<String>) -> Self {
        self.function_body = Some(sql.into());
        self
    }

    /// `WHEN` condition, e.g. `OLD.email IS DISTINCT FROM NEW.email`.
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environments.push(environment.into());
        self
    }

    /// Restrict an `UPDATE` trigger to changes of these columns.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<TriggerDefinition> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("name is required");
        }
        let table = self.table.filter(|t| !t.trim().is_empty());
        if table.is_none() {
            problems.push("table is required");
        }
        if self.events.is_empty() {
            problems.push("at least one event is required");
        }
        let function = self.function.filter(|f| !f.trim().is_empty());
        if function.is_none() {
            problems.push("function is required");
        }
        if !self.columns.is_empty() && !self.events.contains(&Event::Update) {
            problems.push("a column list requires the update event");
        }
        if self.events.contains(&Event::Truncate) && self.level == Level::Row {
            problems.push("truncate triggers must be statement-level");
        }
        // The condition is spliced into CREATE TRIGGER verbatim.
        if let Some(condition) = &self.condition
            && fragment_problem(condition).is_some()
        {
            problems.push("condition must be one expression with balanced parentheses");
        }

        let (Some(table), Some(function)) = (table, function) else {
            return Err(invalid(&self.name, &problems));
        };
        if !problems.is_empty() {
            return Err(invalid(&self.name, &problems));
        }

        let mut events = self.events;
        events.sort();
        events.dedup();

        let mut environments: Vec<String> = self
            .environments
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        environments.sort();
        environments.dedup();

        let mut columns = self.columns;
        columns.sort();
        columns.dedup();

        Ok(TriggerDefinition {
            name: self.name,
            table,
            events,
            timing: self.timing,
            level: self.level,
            function,
            function_body: self.function_body.filter(|b| !b.trim().is_empty()),
            condition: self
                .condition
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            version: self.version,
            enabled: self.enabled,
            environments,
            columns,
        })
    }
}

fn invalid(name: &str, problems: &[&str]) -> Error {
    let label = if name.trim().is_empty() {
        "<unnamed>"
    } else {
        name
    };
    Error::Definition(format!("{}: {}", label, problems.join("; ")))
}

impl From<TriggerDefinition> for TriggerBuilder {
    fn from(def: TriggerDefinition) -> Self {
        Self {
            name: def.name,
            table: Some(def.table),
            events: def.events,
            timing: def.timing,
            level: def.level,
            function: Some(def.function),
            function_body: def.function_body,
            condition: def.condition,
            version: def.version,
            enabled: def.enabled,
            environments: def.environments,
            columns: def.columns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit_users() -> TriggerDefinition {
        TriggerDefinition::builder("audit_users")
            .table("users")
            .after()
            .on(Event::Update)
            .on(Event::Insert)
            .on(Event::Update)
            .function("log_user_change")
            .function_body(
                "CREATE OR REPLACE FUNCTION log_user_change() RETURNS trigger AS $$\nBEGIN\n  RETURN NEW;\nEND;\n$$ LANGUAGE plpgsql;",
            )
            .environment("production")
            .environment("staging")
            .environment("production")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_canonicalizes_sets() {
        let def = audit_users();
        assert_eq!(def.events(), [Event::Insert, Event::Update]);
        assert_eq!(def.environments(), ["production", "staging"]);
        assert_eq!(def.version(), 1);
        assert!(def.enabled());
    }

    #[test]
    fn test_builder_requires_fields() {
        let err = TriggerDefinition::builder("t").build().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"invalid trigger definition: t: table is required; at least one event is required; function is required");
    }

    #[test]
    fn test_columns_require_update() {
        let err = TriggerDefinition::builder("t")
            .table("users")
            .on(Event::Insert)
            .function("f")
            .columns(["email"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("a column list requires the update event"));
    }

    #[test]
    fn test_truncate_must_be_statement_level() {
        let result = TriggerDefinition::builder("t")
            .table("users")
            .on(Event::Truncate)
            .function("f")
            .build();
        assert!(result.is_err());

        let ok = TriggerDefinition::builder("t")
            .table("users")
            .on(Event::Truncate)
            .for_each_statement()
            .function("f")
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_applies_to() {
        let def = audit_users();
        assert!(def.applies_to("production"));
        assert!(!def.applies_to("development"));

        let everywhere = TriggerDefinition::builder("t")
            .table("users")
            .on(Event::Insert)
            .function("f")
            .build()
            .unwrap();
        assert!(everywhere.applies_to("anything"));
    }

    #[test]
    fn test_create_trigger_sql() {
        let def = TriggerDefinition::builder("email_changed")
            .table("public.users")
            .before()
            .on(Event::Update)
            .columns(["email", "name"])
            .when("OLD.email IS DISTINCT FROM NEW.email")
            .function("audit.on_email_change")
            .build()
            .unwrap();
        insta::assert_snapshot!(def.create_trigger_sql(), @r#"CREATE TRIGGER "email_changed" BEFORE UPDATE OF "email", "name" ON "public"."users" FOR EACH ROW WHEN (OLD.email IS DISTINCT FROM NEW.email) EXECUTE FUNCTION "audit"."on_email_change"();"#);
        insta::assert_snapshot!(def.drop_trigger_sql(), @r#"DROP TRIGGER IF EXISTS "email_changed" ON "public"."users";"#);
    }

    #[test]
    fn test_function_source() {
        let def = audit_users();
        assert_eq!(
            def.function_source().as_deref(),
            Some("\nBEGIN\n  RETURN NEW;\nEND;\n")
        );
    }

    #[test]
    fn test_condition_cannot_break_out() {
        for condition in [
            "true) EXECUTE FUNCTION f(); COMMIT; CREATE TABLE leaked (x int); --",
            "NEW.x > 0; DROP TABLE users",
            "(NEW.x > 0",
        ] {
            let err = TriggerDefinition::builder("t")
                .table("users")
                .on(Event::Insert)
                .function("f")
                .when(condition)
                .build()
                .unwrap_err();
            assert!(
                err.to_string()
                    .contains("condition must be one expression with balanced parentheses"),
                "{condition}: {err}"
            );
        }

        let ok = TriggerDefinition::builder("t")
            .table("users")
            .on(Event::Update)
            .function("f")
            .when("(OLD.note IS DISTINCT FROM NEW.note) AND NEW.note <> ';'")
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let def = audit_users();
        let json = def.to_json().unwrap();
        assert_eq!(TriggerDefinition::from_json(&json).unwrap(), def);
    }
}
