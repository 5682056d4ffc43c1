//! SQL text utilities.
//!
//! Nothing in here builds an AST. Triggers and functions arrive as raw SQL
//! text (authored by hand, or read back from the catalog), so this crate only
//! knows enough about the lexical structure of Postgres SQL to:
//!
//! - quote identifiers and literals,
//! - split a script into statements without tripping over `$$` bodies,
//! - normalize text so insignificant formatting doesn't look like drift,
//! - classify DDL statements well enough for safety checks.

mod lex;

mod classify;
pub use classify::*;

mod normalize;
pub use normalize::*;

mod split;
pub use split::*;

/// A PostgreSQL string literal wrapper.
///
/// Display writes the value escaped and quoted with single quotes.
///
/// # Example
/// ```
/// use trig_sql::Lit;
/// assert_eq!(format!("{}", Lit("foo")), "'foo'");
/// assert_eq!(format!("{}", Lit("it's")), "'it''s'");
/// ```
pub struct Lit<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> std::fmt::Display for Lit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'")?;
        for c in self.0.as_ref().chars() {
            if c == '\'' {
                write!(f, "''")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "'")
    }
}

/// A PostgreSQL identifier wrapper.
///
/// Display writes the value escaped and quoted with double quotes.
///
/// # Example
/// ```
/// use trig_sql::Ident;
/// assert_eq!(format!("{}", Ident("user")), "\"user\"");
/// assert_eq!(format!("{}", Ident("bla\"h")), "\"bla\"\"h\"");
/// ```
pub struct Ident<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> std::fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"")?;
        for c in self.0.as_ref().chars() {
            if c == '"' {
                write!(f, "\"\"")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "\"")
    }
}

/// Escape a string literal for SQL.
pub fn escape_string(s: &str) -> String {
    format!("{}", Lit(s))
}

/// Quote a PostgreSQL identifier.
///
/// Always quotes identifiers to avoid issues with reserved keywords like
/// `user`, `order`, `table`, `group`, etc. Doubles any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("{}", Ident(name))
}

/// Quote a possibly schema-qualified name, one segment at a time.
///
/// ```
/// assert_eq!(trig_sql::quote_qualified("audit.log_change"), "\"audit\".\"log_change\"");
/// assert_eq!(trig_sql::quote_qualified("users"), "\"users\"");
/// ```
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Strip surrounding double quotes from an identifier, undoing `""` escapes.
///
/// Unquoted identifiers are folded to lower case, the way Postgres does.
pub fn unquote_ident(name: &str) -> String {
    let name = name.trim();
    if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        name[1..name.len() - 1].replace("\"\"", "\"")
    } else {
        name.to_lowercase()
    }
}

/// Drop the schema qualifier from a name, if any: `public.users` → `users`.
pub fn unqualified(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}
