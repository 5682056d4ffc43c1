//! Pre-apply comparison: what a migration expects vs. what the catalog has.
//!
//! Purely diagnostic. The runner logs the result before applying and never
//! blocks on it.

use std::fmt;

use trig_sql::{Ddl, classify, function_source, normalize_sql, split_statements};

use crate::{Catalog, Connection, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Function,
    Trigger,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Function => "function",
            ObjectKind::Trigger => "trigger",
        })
    }
}

/// What the migration is going to do to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedAction {
    Create,
    Replace,
    Drop,
}

impl fmt::Display for ExpectedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExpectedAction::Create => "create",
            ExpectedAction::Replace => "replace",
            ExpectedAction::Drop => "drop",
        })
    }
}

/// What the catalog has right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogState {
    Missing,
    /// Present, and equal to what the migration would create.
    Identical,
    /// Present, but different from what the migration would create.
    Different,
    /// Present; the migration drops it, so there is nothing to compare.
    Present,
}

impl fmt::Display for CatalogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CatalogState::Missing => "missing",
            CatalogState::Identical => "present, identical",
            CatalogState::Different => "present, different",
            CatalogState::Present => "present",
        })
    }
}

/// One function or trigger touched by a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectComparison {
    pub kind: ObjectKind,
    pub name: String,
    pub statement_index: usize,
    pub expected: ExpectedAction,
    pub actual: CatalogState,
}

impl ObjectComparison {
    /// Whether applying the statement would change the database.
    pub fn differs(&self) -> bool {
        match self.expected {
            ExpectedAction::Create | ExpectedAction::Replace => {
                self.actual != CatalogState::Identical
            }
            ExpectedAction::Drop => self.actual != CatalogState::Missing,
        }
    }
}

/// Everything a migration touches, in statement order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparisonResult {
    pub objects: Vec<ObjectComparison>,
}

impl ComparisonResult {
    pub fn has_differences(&self) -> bool {
        self.objects.iter().any(ObjectComparison::differs)
    }

    pub fn functions(&self) -> impl Iterator<Item = &ObjectComparison> {
        self.objects.iter().filter(|o| o.kind == ObjectKind::Function)
    }

    pub fn triggers(&self) -> impl Iterator<Item = &ObjectComparison> {
        self.objects.iter().filter(|o| o.kind == ObjectKind::Trigger)
    }
}

/// Compare the functions and triggers named in `statements` against the
/// catalog.
pub async fn compare<C, S>(conn: &C, schema: &str, statements: &[S]) -> Result<ComparisonResult>
where
    C: Connection + ?Sized,
    S: AsRef<str>,
{
    let catalog = Catalog::new(conn, schema);
    let mut objects = Vec::new();
    let statements: Vec<String> = statements
        .iter()
        .flat_map(|s| split_statements(s.as_ref()))
        .collect();

    for (index, statement) in statements.iter().enumerate() {
        let statement = statement.as_str();
        let (kind, name, expected) = match classify(statement) {
            Ddl::CreateFunction { name, or_replace } => {
                (ObjectKind::Function, name, create_or_replace(or_replace))
            }
            Ddl::DropFunction { name, .. } => (ObjectKind::Function, name, ExpectedAction::Drop),
            Ddl::CreateTrigger {
                name, or_replace, ..
            } => (ObjectKind::Trigger, name, create_or_replace(or_replace)),
            Ddl::DropTrigger { name, .. } => (ObjectKind::Trigger, name, ExpectedAction::Drop),
            _ => continue,
        };

        let actual = match kind {
            ObjectKind::Function => match catalog.function(&name).await? {
                None => CatalogState::Missing,
                Some(_) if expected == ExpectedAction::Drop => CatalogState::Present,
                Some(live) => {
                    let authored = function_source(statement).map(|src| normalize_sql(&src));
                    if authored.as_deref() == Some(normalize_sql(&live.source).as_str()) {
                        CatalogState::Identical
                    } else {
                        CatalogState::Different
                    }
                }
            },
            ObjectKind::Trigger => {
                let unqualified = trig_sql::unqualified(&name);
                match catalog.trigger(unqualified).await? {
                    None => CatalogState::Missing,
                    Some(_) if expected == ExpectedAction::Drop => CatalogState::Present,
                    Some(live) => {
                        if comparable_trigger_sql(statement, schema)
                            == comparable_trigger_sql(&live.definition, schema)
                        {
                            CatalogState::Identical
                        } else {
                            CatalogState::Different
                        }
                    }
                }
            }
        };

        objects.push(ObjectComparison {
            kind,
            name,
            statement_index: index,
            expected,
            actual,
        });
    }

    Ok(ComparisonResult { objects })
}

fn create_or_replace(or_replace: bool) -> ExpectedAction {
    if or_replace {
        ExpectedAction::Replace
    } else {
        ExpectedAction::Create
    }
}

/// Reduce a `CREATE TRIGGER` statement to a form where authored text and
/// `pg_get_triggerdef` output can be compared.
///
/// Rough by nature: drops `OR REPLACE`, identifier quotes and the schema
/// qualifier, and treats `EXECUTE PROCEDURE` as `EXECUTE FUNCTION`.
fn comparable_trigger_sql(sql: &str, schema: &str) -> String {
    normalize_sql(sql)
        .replace("create or replace trigger", "create trigger")
        .replace("execute procedure", "execute function")
        .replace('"', "")
        .replace(&format!(" {}.", schema.to_lowercase()), " ")
}

/// Multi-line report for one migration.
pub fn format(result: &ComparisonResult, migration_name: &str) -> String {
    if !result.has_differences() {
        return format!("Pre-apply comparison for {}: No differences", migration_name);
    }

    let mut out = format!("Pre-apply comparison for {}:\n", migration_name);
    for (label, objects) in [
        ("Functions", result.functions().collect::<Vec<_>>()),
        ("Triggers", result.triggers().collect::<Vec<_>>()),
    ] {
        if objects.is_empty() {
            continue;
        }
        out.push_str(&format!("  {}:\n", label));
        for object in objects {
            let marker = if object.differs() { "~" } else { "=" };
            out.push_str(&format!(
                "    {} {}: {} ({})\n",
                marker, object.name, object.expected, object.actual
            ));
        }
    }
    out
}

/// One-line summary.
pub fn format_summary(result: &ComparisonResult) -> String {
    if !result.has_differences() {
        return "No differences".to_string();
    }
    let functions = result.functions().filter(|o| o.differs()).count();
    let triggers = result.triggers().filter(|o| o.differs()).count();
    format!(
        "{} change(s): {} function(s), {} trigger(s)",
        functions + triggers,
        functions,
        triggers
    )
}
