//! Safety checks on migration statements.
//!
//! A migration that can be re-run, or run against a database that is a
//! little out of step, shouldn't fail halfway. These rules flag DDL that
//! isn't idempotent. Classification is heuristic (see [`trig_sql::classify`]).
//!
//! Input strings are split on top-level `;` first, so a string holding
//! several statements is checked statement by statement.

use std::collections::HashSet;
use std::fmt;

use trig_sql::{Ddl, classify, is_transaction_control, split_statements};

/// Which rule a statement broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafetyRule {
    /// `DROP FUNCTION/TRIGGER/TABLE` without `IF EXISTS`.
    DropWithoutIfExists,
    /// `CREATE FUNCTION` without `OR REPLACE`.
    CreateFunctionWithoutReplace,
    /// `CREATE TRIGGER` without `OR REPLACE` or a preceding `DROP TRIGGER IF EXISTS`.
    CreateTriggerWithoutGuard,
    /// `CREATE TABLE/INDEX` without `IF NOT EXISTS`.
    CreateWithoutIfNotExists,
    /// `BEGIN`, `COMMIT`, `ROLLBACK` and friends. The runner owns the
    /// transaction, so this one can't be overridden.
    TransactionControl,
}

impl SafetyRule {
    pub fn description(self) -> &'static str {
        match self {
            SafetyRule::DropWithoutIfExists => "drop without IF EXISTS",
            SafetyRule::CreateFunctionWithoutReplace => "function created without OR REPLACE",
            SafetyRule::CreateTriggerWithoutGuard => {
                "trigger created without OR REPLACE or a preceding DROP TRIGGER IF EXISTS"
            }
            SafetyRule::CreateWithoutIfNotExists => "create without IF NOT EXISTS",
            SafetyRule::TransactionControl => "transaction control inside a migration",
        }
    }

    /// Whether `allow_unsafe` may let a statement breaking this rule through.
    pub fn overridable(self) -> bool {
        self != SafetyRule::TransactionControl
    }
}

impl fmt::Display for SafetyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// One unsafe statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyViolation {
    /// Zero-based position within the migration's statements.
    pub statement_index: usize,
    pub statement: String,
    pub rule: SafetyRule,
    /// What the statement does, e.g. `DROP TRIGGER audit_users`.
    pub object: String,
    pub suggestion: String,
}

impl fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "statement {} ({}): {}; {}",
            self.statement_index + 1,
            self.object,
            self.rule,
            self.suggestion
        )
    }
}

/// Check every statement, returning all violations in statement order.
///
/// Indexes count statements after splitting.
pub fn validate<S: AsRef<str>>(statements: &[S]) -> Vec<SafetyViolation> {
    let mut violations = Vec::new();
    let mut guarded_triggers = HashSet::new();
    let statements = statements
        .iter()
        .flat_map(|s| split_statements(s.as_ref()));

    for (index, statement) in statements.enumerate() {
        let ddl = classify(&statement);

        let broken = match &ddl {
            _ if is_transaction_control(&statement) => Some((
                SafetyRule::TransactionControl,
                "remove it; each migration already runs in its own transaction",
            )),
            Ddl::DropFunction {
                if_exists: false, ..
            }
            | Ddl::DropTable {
                if_exists: false, ..
            } => Some((SafetyRule::DropWithoutIfExists, "add IF EXISTS")),
            Ddl::DropTrigger {
                name,
                if_exists,
                ..
            } => {
                if *if_exists {
                    guarded_triggers.insert(name.clone());
                    None
                } else {
                    Some((SafetyRule::DropWithoutIfExists, "add IF EXISTS"))
                }
            }
            Ddl::CreateFunction {
                or_replace: false, ..
            } => Some((
                SafetyRule::CreateFunctionWithoutReplace,
                "use CREATE OR REPLACE FUNCTION",
            )),
            Ddl::CreateTrigger {
                name,
                or_replace: false,
                ..
            } if !guarded_triggers.contains(name) => Some((
                SafetyRule::CreateTriggerWithoutGuard,
                "use CREATE OR REPLACE TRIGGER, or DROP TRIGGER IF EXISTS first",
            )),
            Ddl::CreateTable {
                if_not_exists: false,
                ..
            }
            | Ddl::CreateIndex {
                if_not_exists: false,
                ..
            } => Some((
                SafetyRule::CreateWithoutIfNotExists,
                "add IF NOT EXISTS",
            )),
            _ => None,
        };

        if let Some((rule, suggestion)) = broken {
            violations.push(SafetyViolation {
                statement_index: index,
                statement: statement.trim().to_string(),
                rule,
                object: if rule == SafetyRule::TransactionControl {
                    "transaction control".to_string()
                } else {
                    ddl.describe()
                },
                suggestion: suggestion.to_string(),
            });
        }
    }

    violations
}
