//! Drift detection: registry vs. live catalog.
//!
//! Every trigger name known to either side is classified exactly once:
//!
//! | registry | catalog | state      |
//! |----------|---------|------------|
//! | yes      | yes     | `in_sync` or `drifted` |
//! | no       | yes     | `unknown`  |
//! | yes      | no      | `dropped`  |
//!
//! Two triggers are compared field by field after normalization, never by
//! raw text, because the catalog reformats everything it stores.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use trig_sql::{function_source, normalize_condition, normalize_sql, unqualified, unquote_ident};

use crate::registry::{fetch_entries, fetch_entry};
use crate::{Catalog, CatalogTrigger, Connection, Error, Event, RegistryEntry, Result};

/// Classification of one trigger name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriftState {
    InSync,
    Drifted,
    Unknown,
    Dropped,
}

impl DriftState {
    pub const ALL: [DriftState; 4] = [
        DriftState::InSync,
        DriftState::Drifted,
        DriftState::Unknown,
        DriftState::Dropped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DriftState::InSync => "in_sync",
            DriftState::Drifted => "drifted",
            DriftState::Unknown => "unknown",
            DriftState::Dropped => "dropped",
        }
    }
}

impl fmt::Display for DriftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field that differs between the registry and the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
    pub field: &'static str,
    /// Normalized registry value.
    pub expected: String,
    /// Normalized catalog value.
    pub actual: String,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected `{}`, found `{}`",
            self.field, self.expected, self.actual
        )
    }
}

/// Drift result for one trigger name.
#[derive(Debug, Clone)]
pub struct DriftEntry {
    pub trigger_name: String,
    pub state: DriftState,
    pub registry: Option<RegistryEntry>,
    pub catalog: Option<CatalogTrigger>,
    pub differences: Vec<Difference>,
}

impl DriftEntry {
    /// Classify a trigger from whatever each side knows about it.
    ///
    /// Returns `None` when neither side has it.
    pub fn classify(
        trigger_name: impl Into<String>,
        registry: Option<RegistryEntry>,
        catalog: Option<CatalogTrigger>,
    ) -> Option<Self> {
        let (state, differences) = match (&registry, &catalog) {
            (None, None) => return None,
            (None, Some(_)) => (DriftState::Unknown, Vec::new()),
            (Some(_), None) => (DriftState::Dropped, Vec::new()),
            (Some(entry), Some(live)) => {
                let differences = compare(entry, live);
                let state = if differences.is_empty() {
                    DriftState::InSync
                } else {
                    DriftState::Drifted
                };
                (state, differences)
            }
        };
        Some(Self {
            trigger_name: trigger_name.into(),
            state,
            registry,
            catalog,
            differences,
        })
    }
}

/// Field-by-field comparison of a registry entry against a live trigger.
///
/// Uses the stored definition when it parses; entries without one are
/// compared on table, condition and function body only.
pub fn compare(entry: &RegistryEntry, live: &CatalogTrigger) -> Vec<Difference> {
    let mut diffs = Vec::new();
    let mut check = |field: &'static str, expected: String, actual: String| {
        if expected != actual {
            diffs.push(Difference {
                field,
                expected,
                actual,
            });
        }
    };

    check("table", ident(&entry.table_name), ident(&live.table));

    if let Ok(Some(def)) = entry.definition() {
        check(
            "timing",
            def.timing().as_sql().to_string(),
            live.timing.as_sql().to_string(),
        );
        check("events", events(def.events()), events(&live.events));
        check(
            "level",
            def.level().as_sql().to_string(),
            live.level.as_sql().to_string(),
        );
        check("function", ident(def.function()), ident(&live.function));
        check(
            "columns",
            columns(def.columns()),
            columns(&live.columns),
        );
    }

    check(
        "condition",
        entry
            .condition
            .as_deref()
            .map(normalize_condition)
            .unwrap_or_default(),
        live.condition
            .as_deref()
            .map(normalize_condition)
            .unwrap_or_default(),
    );

    // Entries without an inline body point at a function managed elsewhere.
    if let Some(expected) = entry.function_body.as_deref().and_then(function_source) {
        check(
            "function_body",
            normalize_sql(&expected),
            live.function_source
                .as_deref()
                .map(normalize_sql)
                .unwrap_or_default(),
        );
    }

    diffs
}

fn ident(name: &str) -> String {
    unquote_ident(unqualified(name))
}

fn events(events: &[Event]) -> String {
    let set: BTreeSet<Event> = events.iter().copied().collect();
    set.iter()
        .map(|e| e.as_sql())
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn columns(columns: &[String]) -> String {
    let set: BTreeSet<String> = columns.iter().map(|c| unquote_ident(c)).collect();
    set.into_iter().collect::<Vec<_>>().join(", ")
}

/// Counts per drift state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftSummary {
    pub in_sync: usize,
    pub drifted: usize,
    pub unknown: usize,
    pub dropped: usize,
}

impl DriftSummary {
    pub fn from_entries(entries: &[DriftEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            match entry.state {
                DriftState::InSync => summary.in_sync += 1,
                DriftState::Drifted => summary.drifted += 1,
                DriftState::Unknown => summary.unknown += 1,
                DriftState::Dropped => summary.dropped += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.in_sync + self.drifted + self.unknown + self.dropped
    }

    pub fn count(&self, state: DriftState) -> usize {
        match state {
            DriftState::InSync => self.in_sync,
            DriftState::Drifted => self.drifted,
            DriftState::Unknown => self.unknown,
            DriftState::Dropped => self.dropped,
        }
    }

    /// True when every trigger is in sync.
    pub fn is_clean(&self) -> bool {
        self.total() == self.in_sync
    }
}

/// Compares the registry against the catalog.
pub struct Detector<'a, C: Connection + ?Sized> {
    conn: &'a C,
    schema: String,
    registry_table: String,
}

impl<'a, C: Connection + ?Sized> Detector<'a, C> {
    pub fn new(conn: &'a C, schema: impl Into<String>, registry_table: impl Into<String>) -> Self {
        Self {
            conn,
            schema: schema.into(),
            registry_table: registry_table.into(),
        }
    }

    /// Classify one trigger. Errors with `TriggerNotFound` when neither the
    /// registry nor the catalog knows the name.
    pub async fn detect(&self, name: &str) -> Result<DriftEntry> {
        let entry = fetch_entry(self.conn, &self.registry_table, name).await?;
        let live = Catalog::new(self.conn, self.schema.as_str())
            .trigger(name)
            .await?;
        DriftEntry::classify(name, entry, live).ok_or_else(|| Error::TriggerNotFound {
            name: name.to_string(),
        })
    }

    /// Classify every trigger name on either side, sorted by name.
    pub async fn detect_all(&self) -> Result<Vec<DriftEntry>> {
        let entries = fetch_entries(self.conn, &self.registry_table).await?;
        let live = Catalog::new(self.conn, self.schema.as_str())
            .triggers()
            .await?;
        Ok(detect_all_from(entries, live))
    }

    /// Human-readable report for one trigger.
    pub async fn report(&self, name: &str) -> Result<String> {
        Ok(format_report(&self.detect(name).await?))
    }

    /// Human-readable summary of every trigger.
    pub async fn summary(&self) -> Result<String> {
        Ok(format_summary(&self.detect_all().await?))
    }
}

/// Pair up registry entries and live triggers by name and classify each.
pub fn detect_all_from(entries: Vec<RegistryEntry>, live: Vec<CatalogTrigger>) -> Vec<DriftEntry> {
    let mut by_name: BTreeMap<String, (Option<RegistryEntry>, Option<CatalogTrigger>)> =
        BTreeMap::new();
    for entry in entries {
        by_name.entry(entry.trigger_name.clone()).or_default().0 = Some(entry);
    }
    for trigger in live {
        // Same name on two tables: the first (by table name) wins.
        let slot = by_name.entry(trigger.name.clone()).or_default();
        if slot.1.is_none() {
            slot.1 = Some(trigger);
        }
    }

    by_name
        .into_iter()
        .filter_map(|(name, (entry, live))| DriftEntry::classify(name, entry, live))
        .collect()
}

/// Multi-line report for one drift entry.
pub fn format_report(entry: &DriftEntry) -> String {
    let mut out = String::new();
    out.push_str(&format!("Trigger: {}\n", entry.trigger_name));
    out.push_str(&format!("State: {}\n", entry.state));

    let table = entry
        .registry
        .as_ref()
        .map(|r| r.table_name.as_str())
        .or(entry.catalog.as_ref().map(|c| c.table.as_str()));
    if let Some(table) = table {
        out.push_str(&format!("Table: {}\n", table));
    }

    match entry.state {
        DriftState::InSync => out.push_str("Registry and database match.\n"),
        DriftState::Unknown => {
            out.push_str("Present in the database but not in the registry.\n")
        }
        DriftState::Dropped => {
            out.push_str("Present in the registry but missing from the database.\n")
        }
        DriftState::Drifted => {
            out.push_str("Differences:\n");
            for diff in &entry.differences {
                out.push_str(&format!("  - {}\n", diff));
            }
        }
    }
    out
}

/// Summary of a full drift run: counts, then the names in each non-clean
/// state.
pub fn format_summary(entries: &[DriftEntry]) -> String {
    let summary = DriftSummary::from_entries(entries);
    let mut out = format!("Drift summary: {} trigger(s)\n", summary.total());
    for state in DriftState::ALL {
        out.push_str(&format!("  {}: {}\n", state, summary.count(state)));
    }
    for state in [DriftState::Drifted, DriftState::Unknown, DriftState::Dropped] {
        let names: Vec<&str> = entries
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.trigger_name.as_str())
            .collect();
        if !names.is_empty() {
            out.push_str(&format!("{}: {}\n", state, names.join(", ")));
        }
    }
    out
}
