//! Positional clause rewriting over the token stream.
//!
//! Every rewrite only looks at top-level tokens after the last top-level
//! `UNION`, so sub-selects and earlier union branches are never touched.

use super::tokenizer::{Token, TokenKind, tokenize};

/// Broad statement classification used to gate SELECT-only features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    /// Classify by the first word of the statement.
    pub fn detect(tokens: &[Token]) -> Self {
        let first = tokens
            .iter()
            .find(|t| t.kind != TokenKind::Placeholder)
            .and_then(|t| t.upper.as_deref());
        match first {
            Some("SELECT") | Some("WITH") => Self::Select,
            Some("INSERT") | Some("REPLACE") => Self::Insert,
            Some("UPDATE") => Self::Update,
            Some("DELETE") => Self::Delete,
            _ => Self::Other,
        }
    }

    pub fn is_select(self) -> bool {
        self == Self::Select
    }
}

/// One SQL string together with its current tokenization.
#[derive(Debug, Clone)]
pub struct SqlContext {
    sql: String,
    tokens: Vec<Token>,
}

impl SqlContext {
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let tokens = tokenize(&sql);
        Self { sql, tokens }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn into_sql(self) -> String {
        self.sql
    }

    pub fn kind(&self) -> StatementKind {
        StatementKind::detect(&self.tokens)
    }

    /// Replace (or insert) the final ORDER BY clause.
    pub fn replace_order_by(&mut self, clause: &str) -> &mut Self {
        let sql = replace_order_by_in(&self.sql, &self.tokens, clause);
        self.reset(sql)
    }

    /// Replace (or append, or remove when `clause` is empty) the final
    /// LIMIT/OFFSET clause.
    pub fn replace_pagination(&mut self, clause: &str) -> &mut Self {
        let sql = replace_pagination_in(&self.sql, &self.tokens, clause);
        self.reset(sql)
    }

    /// Whether a top-level keyword occurs anywhere in the statement.
    pub fn has_top_keyword(&self, upper: &str) -> bool {
        self.tokens.iter().any(|t| t.is_top_keyword(upper))
    }

    fn reset(&mut self, sql: String) -> &mut Self {
        self.tokens = tokenize(&sql);
        self.sql = sql;
        self
    }
}

/// Index of the first token belonging to the final UNION branch.
fn final_branch_start(tokens: &[Token]) -> usize {
    tokens
        .iter()
        .rposition(|t| t.is_top_keyword("UNION"))
        .map_or(0, |i| i + 1)
}

fn splice(before: &str, clause: &str, after: &str) -> String {
    let mut out = before.trim_end().to_string();
    for part in [clause.trim(), after] {
        if part.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(part);
    }
    out
}

/// Rewrite the ORDER BY clause of `sql`, where `tokens` is its tokenization.
pub fn replace_order_by_in(sql: &str, tokens: &[Token], clause: &str) -> String {
    let mut limit_start = None;

    for i in final_branch_start(tokens)..tokens.len() {
        let t = &tokens[i];
        if t.depth != 0 || t.kind != TokenKind::Keyword {
            continue;
        }

        if t.upper.as_deref() == Some("ORDER")
            && tokens.get(i + 1).is_some_and(|n| n.is_top_keyword("BY"))
        {
            let end = tokens[i + 2..]
                .iter()
                .find(|n| n.is_top_keyword("LIMIT"))
                .map_or(sql.len(), |n| n.start);
            return splice(&sql[..t.start], clause, &sql[end..]);
        }

        if t.upper.as_deref() == Some("LIMIT") && limit_start.is_none() {
            limit_start = Some(t.start);
        }
    }

    match limit_start {
        Some(start) => splice(&sql[..start], clause, &sql[start..]),
        None => splice(sql, clause, ""),
    }
}

/// Rewrite the LIMIT/OFFSET clause of `sql`, where `tokens` is its tokenization.
pub fn replace_pagination_in(sql: &str, tokens: &[Token], clause: &str) -> String {
    let limit = tokens[final_branch_start(tokens)..]
        .iter()
        .find(|t| t.is_top_keyword("LIMIT"));

    match limit {
        Some(t) => splice(&sql[..t.start], clause, ""),
        None if clause.trim().is_empty() => sql.trim().to_string(),
        None => splice(sql, clause, ""),
    }
}

/// The text after the FROM matching the first top-level SELECT, or the whole
/// statement when there is no such pair.
pub fn cut_selection_part<'a>(sql: &'a str, tokens: &[Token]) -> &'a str {
    let mut select_found = false;

    for t in tokens.iter().filter(|t| t.depth == 0 && t.kind == TokenKind::Keyword) {
        match t.upper.as_deref() {
            Some("SELECT") => select_found = true,
            Some("FROM") if select_found => return sql[t.end..].trim(),
            _ => {}
        }
    }

    sql
}
