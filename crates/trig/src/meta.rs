//! DDL for the bookkeeping tables trig owns.
//!
//! Both statements are idempotent. Table names are configurable, so they are
//! quoted rather than hardcoded.

use trig_sql::{quote_ident, quote_qualified};

/// Version-tracking table: one row per applied migration.
///
/// The unique constraint on `version` is what keeps two concurrent runners
/// from applying the same migration.
pub fn migrations_table_sql(table: &str) -> String {
    let constraint = format!("{}_version_key", trig_sql::unqualified(table));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
         version BIGINT NOT NULL,\n    \
         applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n    \
         CONSTRAINT {} UNIQUE (version)\n)",
        quote_qualified(table),
        quote_ident(&constraint),
    )
}

/// Registry table: one row per declared trigger, keyed by name.
pub fn registry_table_sql(table: &str) -> String {
    let constraint = format!("{}_trigger_name_key", trig_sql::unqualified(table));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
         id BIGSERIAL PRIMARY KEY,\n    \
         trigger_name TEXT NOT NULL,\n    \
         table_name TEXT NOT NULL,\n    \
         version INTEGER NOT NULL DEFAULT 1,\n    \
         enabled BOOLEAN NOT NULL DEFAULT false,\n    \
         source TEXT NOT NULL,\n    \
         environment TEXT,\n    \
         definition TEXT,\n    \
         function_body TEXT,\n    \
         condition TEXT,\n    \
         checksum TEXT NOT NULL,\n    \
         created_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n    \
         updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n    \
         CONSTRAINT {} UNIQUE (trigger_name)\n)",
        quote_qualified(table),
        quote_ident(&constraint),
    )
}
