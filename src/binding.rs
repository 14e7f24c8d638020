//! Named-parameter bindings.

use serde::Serialize;
use serde_json::Value;

use crate::error::{DbError, DbResult};
use crate::sql::{Token, TokenKind};

/// Placeholder name → value.
pub type Binding = serde_json::Map<String, Value>;

/// Binding from a JSON object; anything else yields an empty binding.
pub fn from_json(value: Value) -> Binding {
    match value {
        Value::Object(map) => map,
        _ => Binding::new(),
    }
}

/// Binding from any serializable struct or map.
pub fn from_serialize<T: Serialize>(value: &T) -> DbResult<Binding> {
    Ok(from_json(serde_json::to_value(value)?))
}

/// Names of the `:name` placeholders in `tokens`, in statement order.
pub fn placeholder_names<'a>(
    sql: &'a str,
    tokens: &'a [Token],
) -> impl Iterator<Item = &'a str> + 'a {
    tokens.iter().filter_map(move |t| t.placeholder_name(sql))
}

fn scalar(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

/// Keep exactly the keys referenced by a live placeholder. Referenced but
/// missing keys become null; arrays and objects are sent as JSON text.
pub fn normalize(sql: &str, tokens: &[Token], binding: &Binding) -> Binding {
    let mut out = Binding::new();
    for name in placeholder_names(sql, tokens) {
        if out.contains_key(name) {
            continue;
        }
        let value = binding.get(name).map_or(Value::Null, scalar);
        out.insert(name.to_string(), value);
    }
    out
}

/// Rewrite `:name` placeholders to `?` and return the values in bind order,
/// for drivers without named placeholder support.
pub fn to_positional(
    sql: &str,
    tokens: &[Token],
    binding: &Binding,
) -> DbResult<(String, Vec<Value>)> {
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut cursor = 0;

    for token in tokens.iter().filter(|t| t.kind == TokenKind::Placeholder) {
        let Some(name) = token.placeholder_name(sql) else {
            return Err(DbError::Binding(format!(
                "positional placeholder at byte {} cannot be bound by name",
                token.start
            )));
        };
        out.push_str(&sql[cursor..token.start]);
        out.push('?');
        values.push(binding.get(name).map_or(Value::Null, scalar));
        cursor = token.end;
    }

    out.push_str(&sql[cursor..]);
    Ok((out, values))
}
