//! Normalization of SQL text for comparison.
//!
//! The catalog hands back SQL that differs from what was authored in ways
//! that don't matter: indentation, line breaks, keyword case, the choice of
//! dollar-quote tag, a trailing `;`. Comparing raw text would report all of
//! that as drift.

use std::borrow::Cow;

use crate::lex::{Token, TokenKind, tokenize};

/// Normalize a SQL statement or fragment for comparison.
///
/// - runs of whitespace collapse to a single space,
/// - unquoted words are lower-cased (Postgres folds unquoted identifiers too),
/// - dollar-quoted bodies are normalized recursively and re-tagged as `$$`,
/// - trailing statement terminators are stripped.
///
/// String literals, quoted identifiers and comments are kept verbatim.
///
/// ```
/// assert_eq!(
///     trig_sql::normalize_sql("BEGIN\n    RETURN   NEW;\nEND;;"),
///     "begin return new; end"
/// );
/// ```
pub fn normalize_sql(sql: &str) -> String {
    let out = normalize_fragment(sql);
    strip_terminators(&out).to_string()
}

/// Normalize a trigger `WHEN` condition.
///
/// Same as [`normalize_sql`], but redundant outer parentheses are removed as
/// well, since `pg_get_triggerdef` always wraps the condition.
pub fn normalize_condition(condition: &str) -> String {
    let normalized = normalize_sql(condition);
    strip_outer_parens(&normalized).trim().to_string()
}

fn normalize_fragment(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut pending_space = false;

    for token in tokenize(src) {
        if token.kind == TokenKind::Whitespace {
            pending_space = true;
            continue;
        }

        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;

        match token.kind {
            TokenKind::Word => out.push_str(&token.text(src).to_lowercase()),
            TokenKind::DollarQuoted => {
                let body = token.body.clone().map(|b| &src[b]).unwrap_or_default();
                out.push_str("$$");
                out.push_str(&normalize_fragment(body));
                out.push_str("$$");
            }
            _ => out.push_str(token.text(src)),
        }
    }

    out
}

fn strip_terminators(mut s: &str) -> &str {
    loop {
        s = s.trim_end();
        match s.strip_suffix(';') {
            Some(rest) => s = rest,
            None => return s.trim_start(),
        }
    }
}

/// Remove parentheses that wrap the whole expression, repeatedly.
///
/// ```
/// assert_eq!(trig_sql::strip_outer_parens("((a = b))"), "a = b");
/// assert_eq!(trig_sql::strip_outer_parens("(a) OR (b)"), "(a) OR (b)");
/// ```
pub fn strip_outer_parens(s: &str) -> &str {
    let mut s = s.trim();
    loop {
        let tokens: Vec<Token> = tokenize(s);
        let significant: Vec<&Token> = tokens.iter().filter(|t| !t.is_trivia()).collect();
        let (Some(first), Some(last)) = (significant.first(), significant.last()) else {
            return s;
        };
        if !first.is_punct(s, '(') || !last.is_punct(s, ')') {
            return s;
        }
        match matching_paren(s, &tokens, first.span.start) {
            Some(close) if close == last.span.start => {
                s = s[first.span.end..last.span.start].trim();
            }
            _ => return s,
        }
    }
}

/// Position of the `)` matching the `(` at byte offset `open`.
fn matching_paren(src: &str, tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for token in tokens.iter().filter(|t| t.span.start >= open) {
        if token.is_punct(src, '(') {
            depth += 1;
        } else if token.is_punct(src, ')') {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(token.span.start);
            }
        }
    }
    None
}

/// The source text of a `CREATE FUNCTION` statement: what `pg_proc.prosrc`
/// stores.
///
/// That's the first dollar-quoted string, or a string literal right after
/// `AS` with its escapes undone.
///
/// ```
/// let sql = "CREATE FUNCTION f() RETURNS trigger AS 'BEGIN RAISE NOTICE ''hi''; RETURN NEW; END;' LANGUAGE plpgsql";
/// assert_eq!(
///     trig_sql::function_source(sql).as_deref(),
///     Some("BEGIN RAISE NOTICE 'hi'; RETURN NEW; END;")
/// );
/// ```
pub fn function_source(sql: &str) -> Option<Cow<'_, str>> {
    let mut after_as = false;
    for token in tokenize(sql).into_iter().filter(|t| !t.is_trivia()) {
        match token.kind {
            TokenKind::DollarQuoted => {
                return token.body.map(|body| Cow::Borrowed(&sql[body]));
            }
            TokenKind::StringLit if after_as => return Some(unescape_literal(token.text(sql))),
            _ => {}
        }
        after_as = token.is_word(sql, "AS");
    }
    None
}

/// Contents of a quoted string literal, `'...'` or `E'...'`.
fn unescape_literal(lit: &str) -> Cow<'_, str> {
    let (escapes, quoted) = match lit.strip_prefix(['E', 'e']) {
        Some(rest) => (true, rest),
        None => (false, lit),
    };
    let inner = quoted.strip_prefix('\'').unwrap_or(quoted);
    let inner = inner.strip_suffix('\'').unwrap_or(inner);
    if !inner.contains('\'') && !(escapes && inner.contains('\\')) {
        return Cow::Borrowed(inner);
    }

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                out.push('\'');
                // `''` is one quote.
                chars.next();
            }
            '\\' if escapes => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => {}
            },
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Extract the condition of a `WHEN (...)` clause from a trigger definition,
/// without the outer parentheses.
///
/// ```
/// let def = "CREATE TRIGGER t AFTER UPDATE ON public.users FOR EACH ROW \
///            WHEN ((old.email IS DISTINCT FROM new.email)) EXECUTE FUNCTION f()";
/// assert_eq!(
///     trig_sql::extract_when_clause(def).as_deref(),
///     Some("(old.email IS DISTINCT FROM new.email)")
/// );
/// ```
pub fn extract_when_clause(trigger_def: &str) -> Option<String> {
    let tokens = tokenize(trigger_def);
    let mut depth = 0usize;

    for (idx, token) in tokens.iter().enumerate() {
        if token.is_punct(trigger_def, '(') {
            depth += 1;
        } else if token.is_punct(trigger_def, ')') {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && token.is_word(trigger_def, "WHEN") {
            let open = tokens[idx + 1..].iter().find(|t| !t.is_trivia())?;
            if !open.is_punct(trigger_def, '(') {
                return None;
            }
            let close = matching_paren(trigger_def, &tokens, open.span.start)?;
            return Some(trigger_def[open.span.end..close].trim().to_string());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_sql("INSERT  INTO\taudit_log\n(op)   VALUES (TG_OP)"),
            "insert into audit_log (op) values (tg_op)"
        );
    }

    #[test]
    fn test_keeps_literals_verbatim() {
        assert_eq!(
            normalize_sql("RAISE EXCEPTION 'Bad   Value' USING HINT = \"Col\""),
            "raise exception 'Bad   Value' using hint = \"Col\""
        );
    }

    #[test]
    fn test_dollar_tags_are_equivalent() {
        let authored = "AS $$\n  BEGIN\n    RETURN NEW;\n  END;\n$$";
        let catalog = "AS $function$ BEGIN RETURN NEW; END; $function$";
        assert_eq!(normalize_sql(authored), normalize_sql(catalog));
    }

    #[test]
    fn test_strips_trailing_terminators() {
        assert_eq!(normalize_sql("SELECT 1 ; ;\n"), "select 1");
        assert_eq!(normalize_sql(";"), "");
    }

    #[test]
    fn test_condition_outer_parens() {
        assert_eq!(
            normalize_condition("((NEW.email IS DISTINCT FROM OLD.email))"),
            "new.email is distinct from old.email"
        );
        assert_eq!(normalize_condition("NEW.x > 0"), "new.x > 0");
        assert_eq!(normalize_condition("(a) OR (b)"), "(a) or (b)");
    }

    #[test]
    fn test_when_clause_ignores_nested_when() {
        let def = "CREATE TRIGGER t BEFORE INSERT ON x FOR EACH ROW EXECUTE FUNCTION f()";
        assert_eq!(extract_when_clause(def), None);

        let def = "CREATE TRIGGER t BEFORE INSERT ON x FOR EACH ROW \
                   WHEN ((CASE WHEN new.a THEN true ELSE false END)) EXECUTE FUNCTION f()";
        assert_eq!(
            extract_when_clause(def).as_deref(),
            Some("(CASE WHEN new.a THEN true ELSE false END)")
        );
    }

    #[test]
    fn test_function_source_forms() {
        let dollar = "CREATE FUNCTION f() RETURNS trigger AS $fn$ BEGIN RETURN NEW; END; $fn$ LANGUAGE plpgsql";
        assert_eq!(
            function_source(dollar).as_deref(),
            Some(" BEGIN RETURN NEW; END; ")
        );

        let escaped = r"CREATE FUNCTION f() RETURNS trigger AS E'BEGIN\nRETURN NEW;\nEND;' LANGUAGE plpgsql";
        assert_eq!(
            function_source(escaped).as_deref(),
            Some("BEGIN\nRETURN NEW;\nEND;")
        );

        // A default value is not the body.
        let defaulted = "CREATE FUNCTION f(x text DEFAULT 'a') RETURNS text AS 'SELECT x' LANGUAGE sql";
        assert_eq!(function_source(defaulted).as_deref(), Some("SELECT x"));

        assert_eq!(function_source("CREATE FUNCTION f() RETURNS trigger LANGUAGE plpgsql"), None);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(sql in "[a-zA-Z0-9_ \t\n;(),.=']{0,64}") {
            let once = normalize_sql(&sql);
            prop_assert_eq!(normalize_sql(&once), once);
        }

        #[test]
        fn normalize_ignores_whitespace_runs(words in prop::collection::vec("[a-z]{1,8}", 1..8), gap in "[ \t\n]{1,4}") {
            let single = words.join(" ");
            let spaced = words.join(&gap);
            prop_assert_eq!(normalize_sql(&single), normalize_sql(&spaced));
        }
    }
}
