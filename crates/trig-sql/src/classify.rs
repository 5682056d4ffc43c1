//! Heuristic classification of DDL statements.
//!
//! This looks at the leading keywords of a statement and pulls out object
//! names. It's deliberately shallow: anything it doesn't recognize is
//! [`Ddl::Other`].

use crate::lex::{Token, TokenKind, tokenize};
use crate::unquote_ident;

/// What a statement does, as far as triggers and functions are concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ddl {
    CreateFunction {
        name: String,
        or_replace: bool,
    },
    DropFunction {
        name: String,
        if_exists: bool,
    },
    CreateTrigger {
        name: String,
        table: Option<String>,
        or_replace: bool,
    },
    DropTrigger {
        name: String,
        table: Option<String>,
        if_exists: bool,
    },
    CreateTable {
        name: String,
        if_not_exists: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    CreateIndex {
        name: Option<String>,
        if_not_exists: bool,
    },
    Other,
}

impl Ddl {
    /// Short description used in reports, e.g. `DROP TRIGGER audit_users`.
    pub fn describe(&self) -> String {
        match self {
            Ddl::CreateFunction { name, .. } => format!("CREATE FUNCTION {}", name),
            Ddl::DropFunction { name, .. } => format!("DROP FUNCTION {}", name),
            Ddl::CreateTrigger { name, .. } => format!("CREATE TRIGGER {}", name),
            Ddl::DropTrigger { name, .. } => format!("DROP TRIGGER {}", name),
            Ddl::CreateTable { name, .. } => format!("CREATE TABLE {}", name),
            Ddl::DropTable { name, .. } => format!("DROP TABLE {}", name),
            Ddl::CreateIndex { name, .. } => {
                format!("CREATE INDEX {}", name.as_deref().unwrap_or("(unnamed)"))
            }
            Ddl::Other => "other statement".to_string(),
        }
    }
}

/// Classify a single SQL statement.
///
/// ```
/// use trig_sql::{Ddl, classify};
///
/// assert_eq!(
///     classify("DROP TRIGGER IF EXISTS audit_users ON public.users"),
///     Ddl::DropTrigger {
///         name: "audit_users".into(),
///         table: Some("public.users".into()),
///         if_exists: true,
///     }
/// );
/// assert_eq!(classify("SELECT 1"), Ddl::Other);
/// ```
pub fn classify(sql: &str) -> Ddl {
    let tokens: Vec<Token> = tokenize(sql).into_iter().filter(|t| !t.is_trivia()).collect();
    let mut cur = Cursor {
        src: sql,
        tokens: &tokens,
        pos: 0,
    };

    if cur.eat("CREATE") {
        let or_replace = cur.eat_seq(&["OR", "REPLACE"]);
        if cur.eat("FUNCTION") {
            return match cur.name() {
                Some(name) => Ddl::CreateFunction { name, or_replace },
                None => Ddl::Other,
            };
        }
        cur.eat("CONSTRAINT");
        if cur.eat("TRIGGER") {
            let Some(name) = cur.name() else {
                return Ddl::Other;
            };
            let table = if cur.skip_to("ON") { cur.name() } else { None };
            return Ddl::CreateTrigger {
                name,
                table,
                or_replace,
            };
        }
        cur.eat("UNIQUE");
        if cur.eat("INDEX") {
            cur.eat("CONCURRENTLY");
            let if_not_exists = cur.eat_seq(&["IF", "NOT", "EXISTS"]);
            let name = if cur.peek_is("ON") { None } else { cur.name() };
            return Ddl::CreateIndex {
                name,
                if_not_exists,
            };
        }
        let _ = cur.eat("TEMP") || cur.eat("TEMPORARY") || cur.eat("UNLOGGED");
        if cur.eat("TABLE") {
            let if_not_exists = cur.eat_seq(&["IF", "NOT", "EXISTS"]);
            return match cur.name() {
                Some(name) => Ddl::CreateTable {
                    name,
                    if_not_exists,
                },
                None => Ddl::Other,
            };
        }
        return Ddl::Other;
    }

    if cur.eat("DROP") {
        if cur.eat("FUNCTION") {
            let if_exists = cur.eat_seq(&["IF", "EXISTS"]);
            return match cur.name() {
                Some(name) => Ddl::DropFunction { name, if_exists },
                None => Ddl::Other,
            };
        }
        if cur.eat("TRIGGER") {
            let if_exists = cur.eat_seq(&["IF", "EXISTS"]);
            let Some(name) = cur.name() else {
                return Ddl::Other;
            };
            let table = if cur.eat("ON") { cur.name() } else { None };
            return Ddl::DropTrigger {
                name,
                table,
                if_exists,
            };
        }
        if cur.eat("TABLE") {
            let if_exists = cur.eat_seq(&["IF", "EXISTS"]);
            return match cur.name() {
                Some(name) => Ddl::DropTable { name, if_exists },
                None => Ddl::Other,
            };
        }
    }

    Ddl::Other
}

/// Whether a statement begins, ends or otherwise steers a transaction.
///
/// ```
/// assert!(trig_sql::is_transaction_control("commit"));
/// assert!(trig_sql::is_transaction_control("-- done\nROLLBACK TO SAVEPOINT a"));
/// assert!(!trig_sql::is_transaction_control("CREATE TABLE commit_log (id int)"));
/// ```
pub fn is_transaction_control(sql: &str) -> bool {
    const KEYWORDS: [&str; 8] = [
        "BEGIN", "START", "COMMIT", "END", "ROLLBACK", "ABORT", "SAVEPOINT", "RELEASE",
    ];
    let tokens: Vec<Token> = tokenize(sql).into_iter().filter(|t| !t.is_trivia()).collect();
    let Some(first) = tokens.first() else {
        return false;
    };
    if first.is_word(sql, "PREPARE") {
        // Plain PREPARE makes a prepared statement; only PREPARE TRANSACTION counts.
        return tokens.get(1).is_some_and(|t| t.is_word(sql, "TRANSACTION"));
    }
    KEYWORDS.iter().any(|k| first.is_word(sql, k))
}

struct Cursor<'a> {
    src: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl Cursor<'_> {
    fn peek_is(&self, word: &str) -> bool {
        self.tokens
            .get(self.pos)
            .is_some_and(|t| t.is_word(self.src, word))
    }

    fn eat(&mut self, word: &str) -> bool {
        if self.peek_is(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume all of `words` in order, or nothing at all.
    fn eat_seq(&mut self, words: &[&str]) -> bool {
        let matches = words.iter().enumerate().all(|(i, w)| {
            self.tokens
                .get(self.pos + i)
                .is_some_and(|t| t.is_word(self.src, w))
        });
        if matches {
            self.pos += words.len();
        }
        matches
    }

    /// Advance past the next top-level occurrence of `word`.
    fn skip_to(&mut self, word: &str) -> bool {
        let mut depth = 0usize;
        while let Some(token) = self.tokens.get(self.pos) {
            self.pos += 1;
            if token.is_punct(self.src, '(') {
                depth += 1;
            } else if token.is_punct(self.src, ')') {
                depth = depth.saturating_sub(1);
            } else if depth == 0 && token.is_word(self.src, word) {
                return true;
            }
        }
        false
    }

    /// A possibly schema-qualified object name, unquoted.
    fn name(&mut self) -> Option<String> {
        let mut segments = Vec::new();
        loop {
            let token = self.tokens.get(self.pos)?;
            match token.kind {
                TokenKind::Word | TokenKind::QuotedIdent => {
                    segments.push(unquote_ident(token.text(self.src)));
                    self.pos += 1;
                }
                _ => return None,
            }
            match self.tokens.get(self.pos) {
                Some(t) if t.is_punct(self.src, '.') => self.pos += 1,
                _ => return Some(segments.join(".")),
            }
        }
    }
}
