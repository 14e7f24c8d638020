//! Error types for sqlweave.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use thiserror::Error;

static DUPLICATE_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duplicate entry '(.+)' for key '(.+)'").expect("valid regex"));

/// Per-field detail attached to a constraint violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIssue {
    /// Column (or index) the violation was reported against.
    pub column: Option<String>,
    /// Offending value as reported by the driver.
    pub column_value: Option<String>,
    /// Constraint kind, e.g. `unique`.
    pub operator: String,
    /// Raw driver message.
    pub message: String,
}

/// The main error type for query building and execution.
#[derive(Debug, Error)]
pub enum DbError {
    /// No connection provider is configured, or it handed out no connection.
    #[error("No database connection available")]
    NoConnection,

    /// The driver rejected or failed the statement.
    #[error("Execution error: {message}")]
    Execution {
        message: String,
        code: Option<String>,
        number: Option<u32>,
    },

    /// A constraint violation the outer layer reports as validation failure.
    #[error("Constraint violation: {message}")]
    Constraint {
        message: String,
        code: String,
        fields: Vec<FieldIssue>,
    },

    /// The binding cannot be expressed for the driver.
    #[error("Binding error: {0}")]
    Binding(String),

    /// Cache store failure.
    #[error("Cache error: {0}")]
    Cache(String),

    /// A different accessor already finalized the result.
    #[error("Result already fetched as {first}, cannot fetch as {requested}")]
    AccessorMismatch {
        first: &'static str,
        requested: &'static str,
    },

    /// An accessor was called before `execute()`.
    #[error("Query has not been executed")]
    NotExecuted,

    /// Empty or unusable SQL template.
    #[error("Invalid SQL template: {0}")]
    Template(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cache payload or binding (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Create an execution error from a bare message.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            code: None,
            number: None,
        }
    }

    /// Unique-constraint violation built from the driver message.
    pub fn duplicate_entry(message: impl Into<String>) -> Self {
        let message = message.into();
        let captures = DUPLICATE_ENTRY.captures(&message);
        let group = |i: usize| {
            captures
                .as_ref()
                .and_then(|c| c.get(i))
                .map(|m| m.as_str().to_string())
        };

        let issue = FieldIssue {
            column: group(2),
            column_value: group(1),
            operator: "unique".to_string(),
            message: message.clone(),
        };

        Self::Constraint {
            message,
            code: "ER_DUP_ENTRY".to_string(),
            fields: vec![issue],
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            Self::NoConnection => "NO_CONNECTION",
            Self::Execution { code: Some(code), .. } => code,
            Self::Execution { .. } => "EXECUTION_ERROR",
            Self::Constraint { code, .. } => code,
            Self::Binding(_) => "BINDING_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
            Self::AccessorMismatch { .. } => "ACCESSOR_MISMATCH",
            Self::NotExecuted => "NOT_EXECUTED",
            Self::Template(_) => "TEMPLATE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status code an outer layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Constraint { .. } => 400,
            Self::NoConnection => 503,
            _ => 500,
        }
    }

    /// Field-level detail, empty unless this is a constraint violation.
    pub fn fields(&self) -> &[FieldIssue] {
        match self {
            Self::Constraint { fields, .. } => fields,
            _ => &[],
        }
    }
}

/// Result type alias for sqlweave operations.
pub type DbResult<T> = Result<T, DbError>;
