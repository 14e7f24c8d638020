//! Template-marker pre-pass.
//!
//! Markers are plain text substituted before the statement is tokenized:
//!
//! | Marker         | Payload key  | Expansion                        |
//! |----------------|--------------|----------------------------------|
//! | `{columns}`    | `columns`    | `a , b` or `*`                   |
//! | `{conditions}` | `conditions` | `a = :a AND b = :b` or `TRUE`    |
//! | `{returning}`  | `returning`  | like `{columns}`                 |
//! | `{values}`     | `values`     | `:a , :b`                        |
//! | `{pagination}` | `limit`, `offset` | `LIMIT :limit OFFSET :offset` |
//!
//! Each list marker reads an optional `<key>Split` separator and removes its
//! payload keys from the binding once consumed.

use serde_json::Value;

use super::tokenizer::{TokenKind, tokenize};
use crate::binding::Binding;
use crate::error::{DbError, DbResult};

pub const COLUMNS_KEY: &str = "{columns}";
pub const CONDITIONS_KEY: &str = "{conditions}";
pub const RETURNING_KEY: &str = "{returning}";
pub const VALUES_KEY: &str = "{values}";
pub const PAGINATION_KEY: &str = "{pagination}";

pub const PAGINATION_CLAUSE: &str = "LIMIT :limit OFFSET :offset";

/// Output of [`format_sql`].
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedSql {
    pub sql: String,
    pub binding: Binding,
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'`' | b'$'))
}

/// Pull a list of identifiers out of the binding.
fn take_names(binding: &mut Binding, key: &str) -> DbResult<Vec<String>> {
    let names = match binding.remove(key) {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => vec![s],
        _ => Vec::new(),
    };

    if let Some(bad) = names.iter().find(|n| *n != "*" && !is_identifier(n)) {
        return Err(DbError::Template(format!(
            "'{}' is not a valid column name for {{{}}}",
            bad, key
        )));
    }
    Ok(names)
}

fn take_split(binding: &mut Binding, key: &str, default: &str) -> String {
    match binding.remove(&format!("{}Split", key)) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => default.to_string(),
    }
}

pub fn normalize_columns(columns: &[String], split: &str) -> String {
    if columns.is_empty() || columns[0] == "*" {
        return "*".to_string();
    }
    columns.join(&format!(" {} ", split))
}

pub fn normalize_conditions(conditions: &[String], split: &str) -> String {
    if conditions.is_empty() {
        return "TRUE".to_string();
    }
    conditions
        .iter()
        .map(|c| format!("{} = :{}", c, c))
        .collect::<Vec<_>>()
        .join(&format!(" {} ", split))
}

pub fn normalize_values(values: &[String], split: &str) -> String {
    values
        .iter()
        .map(|v| format!(":{}", v))
        .collect::<Vec<_>>()
        .join(&format!(" {} ", split))
}

/// Resolve `limit`/`offset` binding values, falling back to `default_limit` and 0.
pub fn normalize_pagination(
    limit: Option<&Value>,
    offset: Option<&Value>,
    default_limit: u64,
) -> (u64, u64) {
    let limit = limit.and_then(Value::as_u64).unwrap_or(default_limit);
    let offset = offset.and_then(Value::as_u64).unwrap_or(0);
    (limit, offset)
}

/// Expand template markers in `template`, consuming their payload keys from
/// `binding`.
pub fn format_sql(
    template: &str,
    mut binding: Binding,
    default_limit: u64,
) -> DbResult<FormattedSql> {
    if template.trim().is_empty() {
        return Err(DbError::Template("empty SQL template".to_string()));
    }

    let mut sql = template.to_string();

    if template.contains(COLUMNS_KEY) {
        let columns = take_names(&mut binding, "columns")?;
        let split = take_split(&mut binding, "columns", ",");
        sql = sql.replace(COLUMNS_KEY, &normalize_columns(&columns, &split));
    }

    if template.contains(CONDITIONS_KEY) {
        let conditions = take_names(&mut binding, "conditions")?;
        let split = take_split(&mut binding, "conditions", "AND");
        sql = sql.replace(CONDITIONS_KEY, &normalize_conditions(&conditions, &split));
    }

    if template.contains(RETURNING_KEY) {
        let returning = take_names(&mut binding, "returning")?;
        let split = take_split(&mut binding, "returning", ",");
        sql = sql.replace(RETURNING_KEY, &normalize_columns(&returning, &split));
    }

    if template.contains(VALUES_KEY) {
        let values = take_names(&mut binding, "values")?;
        let split = take_split(&mut binding, "values", ",");
        sql = sql.replace(VALUES_KEY, &normalize_values(&values, &split));
    }

    if template.contains(PAGINATION_KEY) {
        let (limit, offset) =
            normalize_pagination(binding.get("limit"), binding.get("offset"), default_limit);
        binding.insert("limit".to_string(), Value::from(limit));
        binding.insert("offset".to_string(), Value::from(offset));
        sql = sql.replace(PAGINATION_KEY, PAGINATION_CLAUSE);
    }

    Ok(FormattedSql { sql, binding })
}

fn literal(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(Value::Bool(true)) => "TRUE".to_string(),
        Some(Value::Bool(false)) => "FALSE".to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => format!("'{}'", s.replace('\'', "''")),
        Some(other) => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Inline bind values into `sql` for log output. Never execute the result.
pub fn substitute_sql(sql: &str, binding: &Binding) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;

    for token in tokenize(sql).iter().filter(|t| t.kind == TokenKind::Placeholder) {
        let Some(name) = token.placeholder_name(sql) else {
            continue;
        };
        out.push_str(&sql[cursor..token.start]);
        out.push_str(&literal(binding.get(name)));
        cursor = token.end;
    }

    out.push_str(&sql[cursor..]);
    out
}
