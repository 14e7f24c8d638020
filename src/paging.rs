//! Pagination and sort normalization for list queries.
//!
//! Both normalizers are pure: configuration defaults are passed in, and
//! untrusted input is clamped or dropped rather than rejected.

use serde::{Deserialize, Serialize};

use crate::config::PaginationConfig;

/// Raw pagination parameters as they arrive from a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl PageRequest {
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self { limit, offset }
    }
}

/// Pagination envelope returned alongside list results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationSpec {
    pub limit: u64,
    pub offset: u64,
    pub total: u64,
    pub total_pages: u64,
    pub current_page: u64,
    pub can_load_more: bool,
}

impl PaginationSpec {
    /// Derive the page counters from an already-bounded limit and offset.
    pub fn new(limit: u64, offset: u64, total: u64) -> Self {
        let limit = limit.max(1);
        let total_pages = if total > 0 { total.div_ceil(limit) } else { 0 };
        let current_page = (offset / limit + 1).min(total_pages);

        Self {
            limit,
            offset,
            total,
            total_pages,
            current_page,
            can_load_more: current_page < total_pages,
        }
    }

    /// Same page, recomputed for a resolved total.
    pub fn with_total(self, total: u64) -> Self {
        Self::new(self.limit, self.offset, total)
    }
}

/// Bound a page request: explicit limit, else the configured default;
/// capped by `max_limit`, else the configured maximum.
pub fn create_pagination(
    request: &PageRequest,
    max_limit: Option<u64>,
    config: &PaginationConfig,
) -> PaginationSpec {
    let effective_max = max_limit
        .filter(|m| *m > 0)
        .unwrap_or(config.max_limit)
        .max(1);

    let requested = match request.limit {
        Some(limit) => limit.max(1) as u64,
        None => config.default_limit,
    };

    let offset = request.offset.unwrap_or(0).max(0) as u64;

    PaginationSpec::new(requested.clamp(1, effective_max), offset, 0)
}

/// Raw sort parameters as they arrive from a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortRequest {
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub sort_allowed_columns: Vec<String>,
}

impl SortRequest {
    pub fn new<S: Into<String>>(
        sort: impl Into<String>,
        allowed: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            sort: Some(sort.into()),
            sort_allowed_columns: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

/// Normalized sort echoed back with list results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub sort: Option<String>,
    pub sort_allowed_columns: Vec<String>,
    /// A non-blank sort was asked for, whether or not any of it survived.
    pub requested: bool,
}

impl SortSpec {
    /// A sort was asked for but no clause passed the allow-list.
    pub fn rejected(&self) -> bool {
        self.requested && self.sort.is_none()
    }
}

pub fn create_sort(request: &SortRequest) -> SortSpec {
    let requested = request.sort.as_deref().is_some_and(|s| !s.trim().is_empty());
    let sort = request
        .sort
        .as_deref()
        .and_then(|s| normalize_order_by(s, &request.sort_allowed_columns));

    SortSpec {
        sort,
        sort_allowed_columns: request.sort_allowed_columns.clone(),
        requested,
    }
}

/// Normalize `"col DIR, col"` against an allow-list.
///
/// Unknown columns are dropped, unknown directions become `ASC`. Returns
/// `None` when nothing valid remains.
pub fn normalize_order_by<S: AsRef<str>>(
    order_by: &str,
    allowed_columns: &[S],
) -> Option<String> {
    let clauses: Vec<String> = order_by
        .split(',')
        .filter_map(|part| {
            let mut words = part.split_whitespace();
            let column = words.next()?;
            if !allowed_columns.iter().any(|c| c.as_ref() == column) {
                return None;
            }
            let direction = match words.next().map(str::to_ascii_uppercase).as_deref() {
                Some("DESC") => "DESC",
                _ => "ASC",
            };
            Some(format!("{} {}", column, direction))
        })
        .collect();

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(", "))
    }
}
