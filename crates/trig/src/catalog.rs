//! Read-only introspection of live triggers and functions.
//!
//! Everything here is a plain `SELECT` against `pg_catalog`; nothing is
//! cached, so each call sees the current state of the database.

use tokio_postgres::Row;
use trig_sql::{extract_when_clause, unqualified};

use crate::{Connection, ConnectionExt, Event, Level, Result, Timing};

const TRIGGER_TYPE_ROW: i32 = 1 << 0;
const TRIGGER_TYPE_BEFORE: i32 = 1 << 1;
const TRIGGER_TYPE_INSERT: i32 = 1 << 2;
const TRIGGER_TYPE_DELETE: i32 = 1 << 3;
const TRIGGER_TYPE_UPDATE: i32 = 1 << 4;
const TRIGGER_TYPE_TRUNCATE: i32 = 1 << 5;
const TRIGGER_TYPE_INSTEAD: i32 = 1 << 6;

const TRIGGERS_QUERY: &str = r#"
SELECT
    t.tgname::text AS name,
    c.relname::text AS table_name,
    p.proname::text AS function_name,
    t.tgtype::int4 AS tgtype,
    t.tgenabled::text AS tgenabled,
    pg_get_triggerdef(t.oid) AS definition,
    p.prosrc AS function_source,
    ARRAY(
        SELECT a.attname::text
        FROM pg_attribute a
        WHERE a.attrelid = t.tgrelid
          AND a.attnum = ANY(t.tgattr::int2[])
        ORDER BY a.attnum
    ) AS columns
FROM pg_trigger t
JOIN pg_class c ON c.oid = t.tgrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_proc p ON p.oid = t.tgfoid
WHERE NOT t.tgisinternal
  AND n.nspname = $1
"#;

/// A trigger as it exists in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogTrigger {
    pub name: String,
    pub table: String,
    pub function: String,
    pub timing: Timing,
    pub events: Vec<Event>,
    pub level: Level,
    /// Columns of an `UPDATE OF` clause, in table order.
    pub columns: Vec<String>,
    /// The `WHEN` condition, without the `WHEN ( )` wrapper.
    pub condition: Option<String>,
    pub enabled: bool,
    /// `pg_get_triggerdef` output.
    pub definition: String,
    /// `pg_proc.prosrc` of the trigger function.
    pub function_source: Option<String>,
}

/// A function as it exists in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFunction {
    pub name: String,
    pub source: String,
    /// `pg_get_functiondef` output.
    pub definition: String,
}

/// Catalog queries scoped to one schema.
pub struct Catalog<'a, C: Connection + ?Sized> {
    conn: &'a C,
    schema: String,
}

impl<'a, C: Connection + ?Sized> Catalog<'a, C> {
    pub fn new(conn: &'a C, schema: impl Into<String>) -> Self {
        Self {
            conn,
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Tables and views in the schema, sorted by name.
    pub async fn tables(&self) -> Result<Vec<String>> {
        let rows = self
            .conn
            .traced()
            .query(
                "SELECT c.relname::text FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relkind IN ('r', 'p', 'v') \
                 ORDER BY c.relname",
                &[&self.schema],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Whether a table (or view) exists. A schema-qualified name overrides
    /// the catalog's schema.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let (schema, name) = match table.rsplit_once('.') {
            Some((schema, name)) => (schema, name),
            None => (self.schema.as_str(), table),
        };
        let row = self
            .conn
            .traced()
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p', 'v'))",
                &[&schema, &name],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    /// All user-defined triggers in the schema, sorted by name.
    pub async fn triggers(&self) -> Result<Vec<CatalogTrigger>> {
        let sql = format!("{} ORDER BY t.tgname, c.relname", TRIGGERS_QUERY);
        let rows = self.conn.traced().query(&sql, &[&self.schema]).await?;
        rows.iter().map(trigger_from_row).collect()
    }

    /// Triggers attached to one table.
    pub async fn triggers_for_table(&self, table: &str) -> Result<Vec<CatalogTrigger>> {
        let sql = format!(
            "{} AND c.relname = $2 ORDER BY t.tgname",
            TRIGGERS_QUERY
        );
        let table = unqualified(table);
        let rows = self
            .conn
            .traced()
            .query(&sql, &[&self.schema, &table])
            .await?;
        rows.iter().map(trigger_from_row).collect()
    }

    /// A trigger by name, if it exists in the schema.
    pub async fn trigger(&self, name: &str) -> Result<Option<CatalogTrigger>> {
        let sql = format!("{} AND t.tgname = $2 ORDER BY c.relname LIMIT 1", TRIGGERS_QUERY);
        let row = self
            .conn
            .traced()
            .query_opt(&sql, &[&self.schema, &name])
            .await?;
        row.as_ref().map(trigger_from_row).transpose()
    }

    pub async fn trigger_exists(&self, name: &str) -> Result<bool> {
        Ok(self.trigger(name).await?.is_some())
    }

    /// A plain function by name. A schema-qualified name overrides the
    /// catalog's schema.
    pub async fn function(&self, name: &str) -> Result<Option<CatalogFunction>> {
        let (schema, name) = match name.rsplit_once('.') {
            Some((schema, name)) => (schema, name),
            None => (self.schema.as_str(), name),
        };
        let row = self
            .conn
            .traced()
            .query_opt(
                "SELECT p.proname::text, p.prosrc, pg_get_functiondef(p.oid) \
                 FROM pg_proc p \
                 JOIN pg_namespace n ON n.oid = p.pronamespace \
                 WHERE n.nspname = $1 AND p.proname = $2 AND p.prokind = 'f' \
                 ORDER BY p.oid \
                 LIMIT 1",
                &[&schema, &name],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CatalogFunction {
            name: row.try_get(0)?,
            source: row.try_get(1)?,
            definition: row.try_get(2)?,
        }))
    }

    pub async fn function_exists(&self, name: &str) -> Result<bool> {
        Ok(self.function(name).await?.is_some())
    }
}

fn trigger_from_row(row: &Row) -> Result<CatalogTrigger> {
    let tgtype: i32 = row.try_get("tgtype")?;
    let (timing, events, level) = decode_tgtype(tgtype);
    let tgenabled: String = row.try_get("tgenabled")?;
    let definition: String = row.try_get("definition")?;

    Ok(CatalogTrigger {
        name: row.try_get("name")?,
        table: row.try_get("table_name")?,
        function: row.try_get("function_name")?,
        timing,
        events,
        level,
        columns: row.try_get("columns")?,
        condition: extract_when_clause(&definition),
        // 'D' is disabled; 'O', 'R' and 'A' all fire in some replication role.
        enabled: tgenabled != "D",
        definition,
        function_source: row.try_get("function_source")?,
    })
}

/// Decode `pg_trigger.tgtype` into timing, events (canonical order) and level.
pub fn decode_tgtype(tgtype: i32) -> (Timing, Vec<Event>, Level) {
    let timing = if tgtype & TRIGGER_TYPE_INSTEAD != 0 {
        Timing::InsteadOf
    } else if tgtype & TRIGGER_TYPE_BEFORE != 0 {
        Timing::Before
    } else {
        Timing::After
    };

    let events = [
        (TRIGGER_TYPE_INSERT, Event::Insert),
        (TRIGGER_TYPE_UPDATE, Event::Update),
        (TRIGGER_TYPE_DELETE, Event::Delete),
        (TRIGGER_TYPE_TRUNCATE, Event::Truncate),
    ]
    .into_iter()
    .filter(|(bit, _)| tgtype & bit != 0)
    .map(|(_, event)| event)
    .collect();

    let level = if tgtype & TRIGGER_TYPE_ROW != 0 {
        Level::Row
    } else {
        Level::Statement
    };

    (timing, events, level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_after_insert_update_row() {
        // AFTER INSERT OR UPDATE FOR EACH ROW
        assert_eq!(
            decode_tgtype(1 | 4 | 16),
            (Timing::After, vec![Event::Insert, Event::Update], Level::Row)
        );
    }

    #[test]
    fn test_decode_before_delete_statement() {
        assert_eq!(
            decode_tgtype(2 | 8),
            (Timing::Before, vec![Event::Delete], Level::Statement)
        );
    }

    #[test]
    fn test_decode_instead_of() {
        let (timing, events, level) = decode_tgtype(1 | 64 | 4);
        assert_eq!(timing, Timing::InsteadOf);
        assert_eq!(events, vec![Event::Insert]);
        assert_eq!(level, Level::Row);
    }

    #[test]
    fn test_decode_truncate() {
        assert_eq!(
            decode_tgtype(32),
            (Timing::After, vec![Event::Truncate], Level::Statement)
        );
    }
}
