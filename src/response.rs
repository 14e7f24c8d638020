//! Response envelope handed to an outer HTTP layer.

use serde::Serialize;

use crate::error::{DbError, FieldIssue};

/// Body of a reply, discriminated by `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiResponse<T> {
    Success {
        data: T,
    },
    Error {
        message: String,
        /// Machine-readable error code.
        data: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        validation: Vec<FieldIssue>,
    },
}

/// HTTP status code plus body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply<T> {
    #[serde(skip)]
    pub code: u16,
    #[serde(flatten)]
    pub body: ApiResponse<T>,
}

impl<T> Reply<T> {
    pub fn ok(data: T) -> Self {
        Self::success(200, data)
    }

    pub fn created(data: T) -> Self {
        Self::success(201, data)
    }

    pub fn success(code: u16, data: T) -> Self {
        Self {
            code,
            body: ApiResponse::Success { data },
        }
    }

    pub fn error(code: u16, message: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self {
            code,
            body: ApiResponse::Error {
                message: message.into(),
                data: error_code.into(),
                validation: Vec::new(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.body, ApiResponse::Success { .. })
    }
}

impl<T> From<&DbError> for Reply<T> {
    fn from(err: &DbError) -> Self {
        match err {
            DbError::Constraint { code, fields, .. } => Self {
                code: 400,
                body: ApiResponse::Error {
                    message: "Validation Error".to_string(),
                    data: code.clone(),
                    validation: fields.clone(),
                },
            },
            other => Self::error(other.status_code(), "Server error", other.code()),
        }
    }
}

impl<T> From<DbError> for Reply<T> {
    fn from(err: DbError) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_shape() {
        let reply = Reply::ok(json!({"id": 1}));
        assert_eq!(reply.code, 200);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"status": "success", "data": {"id": 1}})
        );
    }

    #[test]
    fn test_duplicate_entry_becomes_validation_error() {
        let err = DbError::duplicate_entry("Duplicate entry 'a@b.c' for key 'users.email'");
        let reply: Reply<()> = Reply::from(&err);

        assert_eq!(reply.code, 400);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "status": "error",
                "message": "Validation Error",
                "data": "ER_DUP_ENTRY",
                "validation": [{
                    "column": "users.email",
                    "columnValue": "a@b.c",
                    "operator": "unique",
                    "message": "Duplicate entry 'a@b.c' for key 'users.email'"
                }]
            })
        );
    }

    #[test]
    fn test_other_errors_are_server_errors() {
        let reply: Reply<()> = DbError::NoConnection.into();
        assert_eq!(reply.code, 503);
        assert!(!reply.is_success());
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"status": "error", "message": "Server error", "data": "NO_CONNECTION"})
        );
    }
}
