//! Splitting SQL scripts into statements.

use crate::lex::{TokenKind, tokenize};

/// Split a script into individual statements on top-level `;`.
///
/// Semicolons inside string literals, quoted identifiers, comments and
/// dollar-quoted function bodies don't count. Statements are returned
/// trimmed and without their terminator; statements made only of
/// whitespace and comments are dropped.
///
/// ```
/// let script = "
///     CREATE OR REPLACE FUNCTION f() RETURNS trigger AS $$
///     BEGIN RETURN NEW; END;
///     $$ LANGUAGE plpgsql;
///     -- attach it
///     DROP TRIGGER IF EXISTS t ON users;
/// ";
/// let stmts = trig_sql::split_statements(script);
/// assert_eq!(stmts.len(), 2);
/// assert!(stmts[0].ends_with("LANGUAGE plpgsql"));
/// assert_eq!(stmts[1], "-- attach it\n    DROP TRIGGER IF EXISTS t ON users");
/// ```
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_code = false;

    for token in tokenize(script) {
        match token.kind {
            TokenKind::Punct if token.text(script) == ";" => {
                if has_code {
                    statements.push(script[start..token.span.start].trim().to_string());
                }
                start = token.span.end;
                has_code = false;
            }
            TokenKind::Whitespace | TokenKind::Comment => {}
            _ => has_code = true,
        }
    }

    if has_code {
        statements.push(script[start..].trim().to_string());
    }

    statements
}

/// Why `expr` can't be spliced into a larger statement, if it can't.
///
/// A fragment such as a `WHEN` condition must keep its parentheses balanced
/// and can't contain a `;`. Otherwise it could close the clause it's placed
/// in, or start a statement of its own.
///
/// ```
/// assert_eq!(trig_sql::fragment_problem("(a) OR (b = ';')"), None);
/// assert!(trig_sql::fragment_problem("true) EXECUTE FUNCTION f(); COMMIT; --").is_some());
/// ```
pub fn fragment_problem(expr: &str) -> Option<&'static str> {
    let mut depth = 0usize;
    for token in tokenize(expr) {
        if token.kind != TokenKind::Punct {
            continue;
        }
        match token.text(expr) {
            ";" => return Some("contains a statement terminator"),
            "(" => depth += 1,
            ")" => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return Some("closes a parenthesis it never opened"),
            },
            _ => {}
        }
    }
    (depth > 0).then_some("leaves a parenthesis open")
}
