//! SQL text handling: tokenizer, clause rewriter and template pre-pass.

pub mod context;
pub mod template;
pub mod tokenizer;

pub use context::{
    SqlContext, StatementKind, cut_selection_part, replace_order_by_in, replace_pagination_in,
};
pub use template::{FormattedSql, format_sql, substitute_sql};
pub use tokenizer::{Token, TokenKind, tokenize};
