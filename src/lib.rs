//! # sqlweave
//!
//! Paginated, sortable, cache-aware SQL query builder.
//!
//! SQL text is tokenized just enough to find its top-level clauses, so
//! `ORDER BY` and `LIMIT`/`OFFSET` can be rewritten positionally, a
//! `COUNT(*)` variant derived for pagination totals, and named `:params`
//! bound safely. SELECT results can be memoized in a cache whose keys mix in
//! per-table version stamps that writes replace.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use sqlweave::prelude::*;
//!
//! let db = Database::connect(Config::load(None)?).await?;
//!
//! let mut query = db
//!     .query("SELECT id, email FROM users WHERE active = :active", binding)
//!     .paginate(&PageRequest::new(Some(20), Some(0)))
//!     .sort(&SortRequest::new("email desc", ["id", "email"]))
//!     .cache(CacheSpec::new(["users"]));
//!
//! query.execute().await?;
//! let listing = query.get_all()?;
//! ```
//!
//! ## Rewrites
//!
//! | Input                                   | Operation              | Output                                         |
//! |-----------------------------------------|------------------------|------------------------------------------------|
//! | `SELECT * FROM t ORDER BY id LIMIT 5`   | `replace_order_by`     | `SELECT * FROM t ORDER BY name ASC LIMIT 5`    |
//! | `SELECT * FROM t`                       | `replace_pagination`   | `SELECT * FROM t LIMIT :limit OFFSET :offset`  |
//! | `SELECT a FROM t WHERE x = :x`          | `count_sql`            | `SELECT COUNT(*) AS total FROM t WHERE x = :x` |

pub mod binding;
pub mod cache;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod paging;
pub mod response;
pub mod sql;

pub mod prelude {
    pub use crate::binding::{Binding, from_json};
    pub use crate::cache::{CacheSpec, CacheStore, MemoryCache};
    pub use crate::config::Config;
    pub use crate::connection::{Connection, ConnectionProvider, MySqlProvider, QueryOutcome, Row};
    pub use crate::engine::{Database, Listing, Query};
    pub use crate::error::*;
    pub use crate::paging::{PageRequest, PaginationSpec, SortRequest, SortSpec};
    pub use crate::response::{ApiResponse, Reply};
    pub use crate::sql::{SqlContext, StatementKind};
}

/// Tokenize `sql` into the keyword, identifier and placeholder tokens the
/// rewriters work on.
///
/// # Example
///
/// ```
/// use sqlweave::tokenize;
///
/// let tokens = tokenize("SELECT * FROM users WHERE id = :id");
/// assert_eq!(tokens.len(), 6);
/// ```
pub fn tokenize(sql: &str) -> Vec<sql::Token> {
    sql::tokenize(sql)
}
