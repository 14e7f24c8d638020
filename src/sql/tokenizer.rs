//! Lexical scanner for SQL text.
//!
//! Produces only the tokens the clause rewriter needs: clause keywords, bare
//! words and placeholders, each tagged with its parenthesis depth. String
//! literals, quoted identifiers and comments are skipped as opaque spans.

/// Words classified as [`TokenKind::Keyword`].
pub const KEYWORDS: [&str; 12] = [
    "SELECT", "FROM", "WHERE", "ORDER", "BY", "LIMIT", "OFFSET", "GROUP", "HAVING", "UNION",
    "ALL", "WITH",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Identifier,
    /// `:name` or `?`
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Uppercased word text; `None` for placeholders.
    pub upper: Option<String>,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// Parenthesis nesting at `start`.
    pub depth: i32,
}

impl Token {
    /// Top-level keyword match.
    pub fn is_top_keyword(&self, upper: &str) -> bool {
        self.depth == 0 && self.kind == TokenKind::Keyword && self.upper.as_deref() == Some(upper)
    }

    /// Placeholder name without the leading colon, `None` for `?`.
    pub fn placeholder_name<'a>(&self, sql: &'a str) -> Option<&'a str> {
        if self.kind != TokenKind::Placeholder || self.end - self.start < 2 {
            return None;
        }
        sql.get(self.start + 1..self.end)
    }
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_word_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    Single,
    Double,
    Backtick,
    LineComment,
    BlockComment,
}

/// Tokenize SQL text. Never fails: unterminated strings and comments run to
/// the end of input.
pub fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut tokens = Vec::new();
    let mut mode = Mode::Code;
    let mut depth = 0i32;
    let mut i = 0;

    while i < len {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();

        match mode {
            Mode::LineComment => {
                if c == b'\n' {
                    mode = Mode::Code;
                }
                i += 1;
                continue;
            }
            Mode::BlockComment => {
                if c == b'*' && next == Some(b'/') {
                    mode = Mode::Code;
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }
            Mode::Single | Mode::Double => {
                let quote = if mode == Mode::Single { b'\'' } else { b'"' };
                if c == b'\\' {
                    // escaped character never closes the literal
                    i += 2;
                } else {
                    if c == quote {
                        mode = Mode::Code;
                    }
                    i += 1;
                }
                continue;
            }
            Mode::Backtick => {
                if c == b'`' {
                    mode = Mode::Code;
                }
                i += 1;
                continue;
            }
            Mode::Code => {}
        }

        match c {
            b'-' if next == Some(b'-') => {
                mode = Mode::LineComment;
                i += 2;
            }
            b'#' => {
                mode = Mode::LineComment;
                i += 1;
            }
            b'/' if next == Some(b'*') => {
                mode = Mode::BlockComment;
                i += 2;
            }
            b'\'' => {
                mode = Mode::Single;
                i += 1;
            }
            b'"' => {
                mode = Mode::Double;
                i += 1;
            }
            b'`' => {
                mode = Mode::Backtick;
                i += 1;
            }
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth -= 1;
                i += 1;
            }
            b':' if next.is_some_and(is_word_start) && (i == 0 || bytes[i - 1] != b':') => {
                let mut j = i + 2;
                while j < len && is_word_char(bytes[j]) {
                    j += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Placeholder,
                    upper: None,
                    start: i,
                    end: j,
                    depth,
                });
                i = j;
            }
            b'?' => {
                tokens.push(Token {
                    kind: TokenKind::Placeholder,
                    upper: None,
                    start: i,
                    end: i + 1,
                    depth,
                });
                i += 1;
            }
            c if is_word_start(c) => {
                let mut j = i + 1;
                while j < len && is_word_char(bytes[j]) {
                    j += 1;
                }
                let upper = sql[i..j].to_ascii_uppercase();
                let kind = if KEYWORDS.contains(&upper.as_str()) {
                    TokenKind::Keyword
                } else {
                    TokenKind::Identifier
                };
                tokens.push(Token {
                    kind,
                    upper: Some(upper),
                    start: i,
                    end: j,
                    depth,
                });
                i = j;
            }
            _ => i += 1,
        }
    }

    tokens
}
