//! Query execution engine.
//!
//! A [`Database`] bundles the connection provider, the optional cache store
//! and configuration. Each [`Query`] owns its SQL context and binding, is
//! configured through chained calls, executed once, and then read through a
//! single accessor.
//!
//! ```rust,ignore
//! let db = Database::connect(Config::load(None)?).await?;
//!
//! let mut query = db
//!     .query("SELECT * FROM users ORDER BY id DESC", binding)
//!     .paginate(&page)
//!     .sort(&sort)
//!     .cache(CacheSpec::new(["users"]));
//! query.execute().await?;
//! let listing = query.get_all()?;
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::binding::{self, Binding};
use crate::cache::{self, CacheSpec, CacheStore, KeyMaterial, MemoryCache};
use crate::config::Config;
use crate::connection::{ConnectionProvider, MySqlProvider, QueryOutcome, Row};
use crate::error::{DbError, DbResult};
use crate::paging::{
    PageRequest, PaginationSpec, SortRequest, SortSpec, create_pagination, create_sort,
};
use crate::sql::template::PAGINATION_CLAUSE;
use crate::sql::{SqlContext, StatementKind, TokenKind, cut_selection_part, format_sql};

/// Handle to the database and cache collaborators.
#[derive(Clone)]
pub struct Database {
    provider: Option<Arc<dyn ConnectionProvider>>,
    cache: Option<Arc<dyn CacheStore>>,
    config: Arc<Config>,
}

impl Database {
    /// A handle with no collaborators attached.
    pub fn new(config: Config) -> Self {
        Self {
            provider: None,
            cache: None,
            config: Arc::new(config),
        }
    }

    /// Build collaborators from configuration: a MySQL pool when a database
    /// URL is set, an in-memory cache when caching is enabled.
    pub async fn connect(config: Config) -> DbResult<Self> {
        let mut db = Self::new(config.clone());

        match &config.database_url {
            Some(url) => {
                tracing::info!(
                    "Creating MySQL connection pool (max {} connections)",
                    config.pool_max_connections
                );
                let provider = MySqlProvider::connect(url, config.pool_max_connections).await?;
                db = db.with_provider(Arc::new(provider));
            }
            None => tracing::warn!(
                "No database_url configured; statements will fail with NO_CONNECTION"
            ),
        }

        if config.cache.enabled {
            tracing::info!(
                "Query cache: max_entries={}, ttl={}s",
                config.cache.max_entries,
                config.cache.ttl_secs
            );
            db = db.with_cache(Arc::new(MemoryCache::new(&config.cache)));
        }

        Ok(db)
    }

    pub fn with_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache_store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    /// Start a query from SQL with named `:placeholders`.
    pub fn query(&self, sql: impl Into<String>, binding: Binding) -> Query {
        Query::new(self.clone(), sql.into(), binding)
    }

    /// Start a query from a template with `{columns}`-style markers.
    pub fn template(&self, template: &str, binding: Binding) -> DbResult<Query> {
        let formatted = format_sql(template, binding, self.config.pagination.default_limit)?;
        Ok(Query::new(self.clone(), formatted.sql, formatted.binding))
    }
}

/// Result interpretation chosen by the first accessor call.
#[derive(Debug, Clone, PartialEq)]
enum Fetched {
    Row(Option<Row>),
    All(Vec<Row>),
    Column(Value),
    AffectedRows(u64),
    InsertId(Option<u64>),
}

impl Fetched {
    fn name(&self) -> &'static str {
        match self {
            Self::Row(_) => "fetch",
            Self::All(_) => "fetch_all",
            Self::Column(_) => "fetch_column",
            Self::AffectedRows(_) => "affected_rows",
            Self::InsertId(_) => "insert_id",
        }
    }

    fn mismatch(&self, requested: &'static str) -> DbError {
        DbError::AccessorMismatch {
            first: self.name(),
            requested,
        }
    }
}

/// Cached form of an executed SELECT.
#[derive(Debug, Serialize, Deserialize)]
struct CachedPayload {
    outcome: QueryOutcome,
    pagination: Option<PaginationSpec>,
    sort: Option<SortSpec>,
}

/// List envelope returned by [`Query::get_all`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing {
    pub data: Vec<Row>,
    pub filters: Binding,
    pub pagination: Option<PaginationSpec>,
    pub sort: Option<SortSpec>,
}

/// One logical statement: build, configure, execute, fetch.
pub struct Query {
    db: Database,
    ctx: SqlContext,
    kind: StatementKind,
    binding: Binding,
    filter: Binding,
    pagination: Option<PaginationSpec>,
    total_resolved: bool,
    sort: Option<SortSpec>,
    cache: Option<CacheSpec>,
    cache_key: Option<String>,
    outcome: Option<QueryOutcome>,
    fetched: Option<Fetched>,
    from_cache: bool,
}

impl Query {
    fn new(db: Database, sql: String, binding: Binding) -> Self {
        let ctx = SqlContext::new(sql);
        let kind = ctx.kind();

        Self {
            db,
            ctx,
            kind,
            binding,
            filter: Binding::new(),
            pagination: None,
            total_resolved: false,
            sort: None,
            cache: None,
            cache_key: None,
            outcome: None,
            fetched: None,
            from_cache: false,
        }
    }

    /// Paginate a SELECT with the configured maximum limit.
    pub fn paginate(self, request: &PageRequest) -> Self {
        self.paginate_capped(request, None)
    }

    /// Paginate a SELECT, capping the limit at `max_limit`. No-op otherwise.
    pub fn paginate_capped(mut self, request: &PageRequest, max_limit: Option<u64>) -> Self {
        if !self.kind.is_select() {
            return self;
        }

        let spec = create_pagination(request, max_limit, &self.db.config.pagination);
        self.ctx.replace_pagination(PAGINATION_CLAUSE);
        self.binding.insert("limit".to_string(), Value::from(spec.limit));
        self.binding.insert("offset".to_string(), Value::from(spec.offset));
        self.pagination = Some(spec);
        self.total_resolved = false;
        self
    }

    /// Sort a SELECT by allow-listed columns. No-op otherwise.
    pub fn sort(mut self, request: &SortRequest) -> Self {
        if !self.kind.is_select() {
            return self;
        }

        let spec = create_sort(request);
        if let Some(sort) = &spec.sort {
            self.ctx.replace_order_by(&format!("ORDER BY {}", sort));
        }
        self.sort = Some(spec);
        self
    }

    /// Record caller filters: merged into the binding, part of the cache key
    /// and echoed by [`Query::get_all`].
    pub fn filter(mut self, filters: Binding) -> Self {
        for (key, value) in filters {
            self.binding.insert(key.clone(), value.clone());
            self.filter.insert(key, value);
        }
        self
    }

    /// Memoize a SELECT, or invalidate `spec.tables` after a write.
    pub fn cache(mut self, spec: CacheSpec) -> Self {
        self.cache = Some(spec);
        self.cache_key = None;
        self
    }

    pub fn sql(&self) -> &str {
        self.ctx.sql()
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn pagination(&self) -> Option<&PaginationSpec> {
        self.pagination.as_ref()
    }

    pub fn sort_spec(&self) -> Option<&SortSpec> {
        self.sort.as_ref()
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    /// Whether the last `execute()` was answered from the cache.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Parameters actually sent to the driver.
    pub fn normalized_binding(&self) -> Binding {
        binding::normalize(self.ctx.sql(), self.ctx.tokens(), &self.binding)
    }

    /// The COUNT statement used to resolve the pagination total.
    pub fn count_sql(&self) -> String {
        let mut ctx = self.ctx.clone();
        ctx.replace_pagination("");

        if needs_wrapping(&ctx) {
            format!("SELECT COUNT(*) AS total FROM ({}) AS counted", ctx.sql())
        } else {
            format!(
                "SELECT COUNT(*) AS total FROM {}",
                cut_selection_part(ctx.sql(), ctx.tokens())
            )
        }
    }

    /// Run the statement (or answer it from the cache) and resolve the
    /// pagination total.
    pub async fn execute(&mut self) -> DbResult<()> {
        self.fetched = None;
        self.from_cache = false;
        self.cache_key = None;
        self.total_resolved = false;

        if self.restore_cached().await {
            return Ok(());
        }

        self.run().await?;

        if self.pagination.is_some() && !self.total_resolved {
            self.resolve_total().await?;
        }

        self.store_cached().await;
        Ok(())
    }

    async fn resolve_total(&mut self) -> DbResult<()> {
        let mut count = Query::new(self.db.clone(), self.count_sql(), self.binding.clone());
        count.filter = self.filter.clone();
        count.cache = self.cache.as_ref().map(|spec| CacheSpec {
            key: None,
            ..spec.clone()
        });

        if !count.restore_cached().await {
            count.run().await?;
            count.store_cached().await;
        }

        let total = value_to_u64(&count.fetch_column()?);
        self.pagination = self.pagination.map(|spec| spec.with_total(total));
        self.total_resolved = true;
        Ok(())
    }

    fn ready_cache(&self) -> Option<(Arc<dyn CacheStore>, CacheSpec)> {
        let spec = self.cache.clone()?;
        let store = self.db.cache.clone()?;
        if !store.is_ready() {
            tracing::debug!("Cache store not ready, bypassing");
            return None;
        }
        Some((store, spec))
    }

    /// Answer a SELECT from the cache. Store failures count as a miss.
    async fn restore_cached(&mut self) -> bool {
        if !self.kind.is_select() {
            return false;
        }
        let Some((store, spec)) = self.ready_cache() else {
            return false;
        };

        match self.lookup(store.as_ref(), &spec).await {
            Ok(Some(payload)) => {
                tracing::debug!(key = self.cache_key.as_deref(), "Cache hit");
                self.outcome = Some(payload.outcome);
                if payload.pagination.is_some() {
                    self.pagination = payload.pagination;
                    self.total_resolved = true;
                }
                if payload.sort.is_some() {
                    self.sort = payload.sort;
                }
                self.from_cache = true;
                true
            }
            Ok(None) => {
                tracing::debug!(key = self.cache_key.as_deref(), "Cache miss");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cache lookup failed, executing directly");
                false
            }
        }
    }

    /// Derive the key from the parameters actually sent, so keys a statement
    /// no longer references (a page's `limit` in its COUNT query) never split
    /// entries.
    async fn lookup(
        &mut self,
        store: &dyn CacheStore,
        spec: &CacheSpec,
    ) -> DbResult<Option<CachedPayload>> {
        let versions = cache::table_versions(store, &spec.tables).await?;
        let binding = self.normalized_binding();
        let page = self.pagination.map(|p| p.with_total(0));
        let key = cache::cache_key(
            spec.key.as_deref(),
            &KeyMaterial {
                sql: self.ctx.sql(),
                binding: &binding,
                filter: &self.filter,
                pagination: page.as_ref(),
                sort: self.sort.as_ref(),
                table_versions: &versions,
            },
        )?;
        self.cache_key = Some(key.clone());

        match store.get(&key).await? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn store_cached(&mut self) {
        if !self.kind.is_select() {
            return;
        }
        let (Some((store, spec)), Some(key), Some(outcome)) =
            (self.ready_cache(), self.cache_key.clone(), self.outcome.clone())
        else {
            return;
        };

        let payload = CachedPayload {
            outcome,
            pagination: self.pagination,
            sort: self.sort.clone(),
        };
        let ttl = spec.ttl.unwrap_or_else(|| self.db.config.cache.ttl());

        let result = match serde_json::to_string(&payload) {
            Ok(text) => store.set(&key, text, ttl).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached query result"),
            Err(e) => tracing::warn!(error = %e, "Failed to store query result in cache"),
        }
    }

    /// Execute against a pooled connection; bump table versions after writes.
    async fn run(&mut self) -> DbResult<()> {
        let provider = self.db.provider.clone().ok_or(DbError::NoConnection)?;
        let binding = self.normalized_binding();

        let mut conn = provider.acquire().await?.ok_or(DbError::NoConnection)?;
        let started = Instant::now();
        let result = conn.execute(self.ctx.sql(), &binding).await;
        conn.release();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = match result {
            Ok(outcome) => {
                tracing::info!(
                    sql = self.ctx.sql(),
                    binding = ?binding,
                    elapsed_ms,
                    rows = outcome.rows.len(),
                    affected_rows = outcome.affected_rows,
                    "database debug"
                );
                outcome
            }
            Err(e) => {
                tracing::warn!(
                    sql = self.ctx.sql(),
                    binding = ?binding,
                    elapsed_ms,
                    error = %e,
                    "database error"
                );
                return Err(e);
            }
        };

        self.outcome = Some(outcome);

        if !self.kind.is_select() {
            self.invalidate_tables().await;
        }
        Ok(())
    }

    async fn invalidate_tables(&self) {
        let Some(spec) = &self.cache else {
            return;
        };
        if spec.tables.is_empty() {
            return;
        }
        let Some((store, _)) = self.ready_cache() else {
            tracing::warn!(
                tables = ?spec.tables,
                "Cache store unavailable, table versions not bumped"
            );
            return;
        };

        let cache_config = &self.db.config.cache;
        let ttl = spec.ttl.unwrap_or_default().max(cache_config.version_ttl());

        for (table, error) in cache::bump_table_versions(store.as_ref(), &spec.tables, ttl).await {
            tracing::warn!(table = %table, error = %error, "Failed to bump table version");
        }
    }

    fn finalize(&mut self, interpret: impl FnOnce(&QueryOutcome) -> Fetched) -> DbResult<&Fetched> {
        if self.fetched.is_none() {
            let outcome = self.outcome.as_ref().ok_or(DbError::NotExecuted)?;
            self.fetched = Some(interpret(outcome));
        }
        self.fetched.as_ref().ok_or(DbError::NotExecuted)
    }

    /// First row, if any.
    pub fn fetch(&mut self) -> DbResult<Option<Row>> {
        match self.finalize(|o| Fetched::Row(o.rows.first().cloned()))? {
            Fetched::Row(row) => Ok(row.clone()),
            other => Err(other.mismatch("fetch")),
        }
    }

    /// All rows.
    pub fn fetch_all(&mut self) -> DbResult<Vec<Row>> {
        match self.finalize(|o| Fetched::All(o.rows.clone()))? {
            Fetched::All(rows) => Ok(rows.clone()),
            other => Err(other.mismatch("fetch_all")),
        }
    }

    /// First column of the first row; null when there is none.
    pub fn fetch_column(&mut self) -> DbResult<Value> {
        let interpret = |o: &QueryOutcome| {
            Fetched::Column(
                o.rows
                    .first()
                    .and_then(|row| row.values().next().cloned())
                    .unwrap_or(Value::Null),
            )
        };
        match self.finalize(interpret)? {
            Fetched::Column(value) => Ok(value.clone()),
            other => Err(other.mismatch("fetch_column")),
        }
    }

    /// Rows changed by a write, or rows returned by `RETURNING`.
    pub fn affected_rows(&mut self) -> DbResult<u64> {
        let interpret = |o: &QueryOutcome| {
            let affected = if o.affected_rows == 0 {
                o.rows.len() as u64
            } else {
                o.affected_rows
            };
            Fetched::AffectedRows(affected)
        };
        match self.finalize(interpret)? {
            Fetched::AffectedRows(n) => Ok(*n),
            other => Err(other.mismatch("affected_rows")),
        }
    }

    /// Auto-increment id generated by an INSERT.
    pub fn insert_id(&mut self) -> DbResult<Option<u64>> {
        match self.finalize(|o| Fetched::InsertId(o.insert_id))? {
            Fetched::InsertId(id) => Ok(*id),
            other => Err(other.mismatch("insert_id")),
        }
    }

    /// Rows plus the filter, pagination and sort that produced them.
    pub fn get_all(&mut self) -> DbResult<Listing> {
        let data = self.fetch_all()?;
        Ok(Listing {
            data,
            filters: self.filter.clone(),
            pagination: self.pagination,
            sort: self.sort.clone(),
        })
    }
}

/// Statements whose row count cannot be taken from the tail after FROM.
fn needs_wrapping(ctx: &SqlContext) -> bool {
    let distinct = ctx.tokens().windows(2).any(|w| {
        w[0].is_top_keyword("SELECT")
            && w[1].kind == TokenKind::Identifier
            && w[1].upper.as_deref() == Some("DISTINCT")
    });

    distinct
        || ["UNION", "GROUP", "HAVING", "WITH"]
            .iter()
            .any(|kw| ctx.has_top_keyword(kw))
}

fn value_to_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
