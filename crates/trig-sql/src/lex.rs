//! A tiny lexer for Postgres SQL text.
//!
//! Just enough structure to never look inside string literals, quoted
//! identifiers, comments or dollar-quoted bodies by accident.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// Keyword, unquoted identifier or number.
    Word,
    /// `"quoted identifier"`
    QuotedIdent,
    /// `'string'` or `E'string'`
    StringLit,
    /// `$tag$ body $tag$`
    DollarQuoted,
    /// `-- line` or `/* block */`
    Comment,
    Whitespace,
    /// Any other single character.
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub span: Range<usize>,
    /// For dollar-quoted tokens, the span of the body between the delimiters.
    pub body: Option<Range<usize>>,
}

impl Token {
    pub fn text<'s>(&self, src: &'s str) -> &'s str {
        &src[self.span.clone()]
    }

    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    pub fn is_punct(&self, src: &str, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text(src).starts_with(c)
    }

    pub fn is_word(&self, src: &str, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text(src).eq_ignore_ascii_case(word)
    }
}

pub(crate) fn tokenize(src: &str) -> Vec<Token> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let b = bytes[pos];

        let (kind, end, body) = if b.is_ascii_whitespace() {
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            (TokenKind::Whitespace, pos, None)
        } else if b == b'-' && bytes.get(pos + 1) == Some(&b'-') {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            (TokenKind::Comment, pos, None)
        } else if b == b'/' && bytes.get(pos + 1) == Some(&b'*') {
            // Postgres block comments nest.
            let mut depth = 0usize;
            while pos < bytes.len() {
                if bytes[pos] == b'/' && bytes.get(pos + 1) == Some(&b'*') {
                    depth += 1;
                    pos += 2;
                } else if bytes[pos] == b'*' && bytes.get(pos + 1) == Some(&b'/') {
                    depth -= 1;
                    pos += 2;
                    if depth == 0 {
                        break;
                    }
                } else {
                    pos += 1;
                }
            }
            (TokenKind::Comment, pos, None)
        } else if b == b'\'' {
            pos = scan_quoted(bytes, pos, b'\'', false);
            (TokenKind::StringLit, pos, None)
        } else if (b == b'E' || b == b'e') && bytes.get(pos + 1) == Some(&b'\'') {
            pos = scan_quoted(bytes, pos + 1, b'\'', true);
            (TokenKind::StringLit, pos, None)
        } else if b == b'"' {
            pos = scan_quoted(bytes, pos, b'"', false);
            (TokenKind::QuotedIdent, pos, None)
        } else if b == b'$'
            && let Some(tag_end) = dollar_tag_end(bytes, pos)
        {
            let tag = &src[pos..=tag_end];
            let body_start = tag_end + 1;
            match src[body_start..].find(tag) {
                Some(rel) => {
                    let body_end = body_start + rel;
                    pos = body_end + tag.len();
                    (TokenKind::DollarQuoted, pos, Some(body_start..body_end))
                }
                None => {
                    pos = bytes.len();
                    (TokenKind::DollarQuoted, pos, Some(body_start..pos))
                }
            }
        } else if is_word_byte(b) {
            while pos < bytes.len() && (is_word_byte(bytes[pos]) || bytes[pos] == b'$') {
                pos += 1;
            }
            (TokenKind::Word, pos, None)
        } else {
            // Advance by a whole char so spans stay on UTF-8 boundaries.
            let len = src[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
            pos += len;
            (TokenKind::Punct, pos, None)
        };

        tokens.push(Token {
            kind,
            span: start..end,
            body,
        });
    }

    tokens
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// Scan a quoted token starting at `start` (which holds the quote byte).
/// Returns the position just past the closing quote, or the end of input.
fn scan_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut pos = start + 1;
    while pos < bytes.len() {
        let b = bytes[pos];
        if backslash_escapes && b == b'\\' {
            pos += 2;
            continue;
        }
        if b == quote {
            if bytes.get(pos + 1) == Some(&quote) {
                pos += 2;
                continue;
            }
            return pos + 1;
        }
        pos += 1;
    }
    bytes.len()
}

/// If a dollar-quote opening tag (`$$` or `$tag$`) starts at `start`, return
/// the index of its closing `$`.
fn dollar_tag_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut pos = start + 1;
    if let Some(&first) = bytes.get(pos)
        && first != b'$'
        && !(first.is_ascii_alphabetic() || first == b'_' || first >= 0x80)
    {
        // `$1` is a positional parameter, not a tag.
        return None;
    }
    while pos < bytes.len() {
        let b = bytes[pos];
        if b == b'$' {
            return Some(pos);
        }
        if !(b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80) {
            return None;
        }
        pos += 1;
    }
    None
}
