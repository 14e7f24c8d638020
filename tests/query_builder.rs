use futures::FutureExt;
use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use serde_json::json;
use sqlweave::cache::{INITIAL_VERSION, table_version_key, table_versions};
use sqlweave::config::CacheConfig;
use sqlweave::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = dyn Fn(&str) -> DbResult<QueryOutcome> + Send + Sync;

/// Records every statement and answers from a canned responder.
struct Recorder {
    calls: Mutex<Vec<(String, Binding)>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    available: bool,
    respond: Box<Responder>,
}

impl Recorder {
    fn new(
        respond: impl Fn(&str) -> DbResult<QueryOutcome> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            available: true,
            respond: Box::new(respond),
        })
    }

    fn calls(&self) -> Vec<(String, Binding)> {
        self.calls.lock().unwrap().clone()
    }

    fn executions(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn count_executions(&self) -> usize {
        self.calls()
            .iter()
            .filter(|(sql, _)| sql.starts_with("SELECT COUNT(*)"))
            .count()
    }
}

struct Provider(Arc<Recorder>);

impl ConnectionProvider for Provider {
    fn acquire(&self) -> BoxFuture<'_, DbResult<Option<Box<dyn Connection>>>> {
        let conn = self.0.available.then(|| {
            self.0.acquired.fetch_add(1, Ordering::SeqCst);
            Box::new(Conn(self.0.clone())) as Box<dyn Connection>
        });
        futures::future::ready(Ok(conn)).boxed()
    }
}

struct Conn(Arc<Recorder>);

impl Connection for Conn {
    fn execute<'a>(
        &'a mut self,
        sql: &'a str,
        binding: &'a Binding,
    ) -> BoxFuture<'a, DbResult<QueryOutcome>> {
        self.0.calls.lock().unwrap().push((sql.to_string(), binding.clone()));
        futures::future::ready((self.0.respond)(sql)).boxed()
    }

    fn release(self: Box<Self>) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn user(id: i64, email: &str) -> Row {
    from_json(json!({"id": id, "email": email}))
}

fn users_recorder() -> Arc<Recorder> {
    Recorder::new(|sql| {
        if sql.starts_with("SELECT COUNT(*)") {
            Ok(QueryOutcome::rows(vec![from_json(json!({"total": 42}))]))
        } else if sql.starts_with("SELECT") {
            Ok(QueryOutcome::rows(vec![
                user(1, "a@example.com"),
                user(2, "b@example.com"),
            ]))
        } else {
            Ok(QueryOutcome::write(1, Some(7)))
        }
    })
}

fn users_db() -> (Database, Arc<Recorder>, Arc<MemoryCache>) {
    let recorder = users_recorder();
    let cache = Arc::new(MemoryCache::new(&CacheConfig::default()));
    let db = Database::new(Config::default())
        .with_provider(Arc::new(Provider(recorder.clone())))
        .with_cache(cache.clone());
    (db, recorder, cache)
}

/// Store whose reads, writes, or writes to one key fail.
struct FlakyStore {
    inner: MemoryCache,
    reads_fail: bool,
    writes_fail: bool,
    reject_key: Option<String>,
}

impl FlakyStore {
    fn new(reads_fail: bool, writes_fail: bool, reject_key: Option<String>) -> Self {
        Self {
            inner: MemoryCache::new(&CacheConfig::default()),
            reads_fail,
            writes_fail,
            reject_key,
        }
    }

    fn unreachable() -> Self {
        Self::new(true, true, None)
    }

    fn read_only() -> Self {
        Self::new(false, true, None)
    }

    fn rejecting(key: String) -> Self {
        Self::new(false, false, Some(key))
    }
}

impl CacheStore for FlakyStore {
    fn is_ready(&self) -> bool {
        true
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, DbResult<Option<String>>> {
        if self.reads_fail {
            let err = DbError::Cache("connection refused".to_string());
            return futures::future::ready(Err(err)).boxed();
        }
        self.inner.get(key)
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, DbResult<()>> {
        if self.writes_fail || self.reject_key.as_deref() == Some(key) {
            let err = DbError::Cache("write refused".to_string());
            return futures::future::ready(Err(err)).boxed();
        }
        self.inner.set(key, value, ttl)
    }
}

fn db_with_store(store: Arc<FlakyStore>) -> (Database, Arc<Recorder>) {
    let recorder = users_recorder();
    let db = Database::new(Config::default())
        .with_provider(Arc::new(Provider(recorder.clone())))
        .with_cache(store);
    (db, recorder)
}

fn active() -> Binding {
    from_json(json!({"active": true}))
}

const LIST_USERS: &str = "SELECT id, email FROM users WHERE active = :active ORDER BY id DESC";

#[tokio::test]
async fn test_second_identical_select_is_served_from_cache() {
    let (db, recorder, _) = users_db();

    let mut first = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
    first.execute().await.unwrap();
    assert!(!first.from_cache());
    assert_eq!(recorder.executions(), 1);

    let mut second = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
    second.execute().await.unwrap();
    assert!(second.from_cache());
    assert_eq!(recorder.executions(), 1);
    assert_eq!(second.cache_key(), first.cache_key());
    assert_eq!(second.fetch_all().unwrap(), first.fetch_all().unwrap());
}

#[tokio::test]
async fn test_write_to_listed_table_invalidates_cached_select() {
    let (db, recorder, _) = users_db();

    let mut read = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
    read.execute().await.unwrap();
    let stale_key = read.cache_key().map(str::to_string);

    let mut write = db
        .query(
            "INSERT INTO users (email) VALUES (:email)",
            from_json(json!({"email": "c@example.com"})),
        )
        .cache(CacheSpec::new(["users"]));
    write.execute().await.unwrap();
    assert_eq!(write.insert_id().unwrap(), Some(7));

    let mut again = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
    again.execute().await.unwrap();
    assert!(!again.from_cache());
    assert_ne!(again.cache_key().map(str::to_string), stale_key);
    assert_eq!(recorder.executions(), 3);
}

#[tokio::test]
async fn test_write_to_other_table_keeps_cache() {
    let (db, recorder, _) = users_db();

    let mut read = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
    read.execute().await.unwrap();

    let mut write = db
        .query("DELETE FROM orders WHERE id = :id", from_json(json!({"id": 3})))
        .cache(CacheSpec::new(["orders"]));
    write.execute().await.unwrap();
    assert_eq!(write.affected_rows().unwrap(), 1);

    let mut again = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
    again.execute().await.unwrap();
    assert!(again.from_cache());
    assert_eq!(recorder.executions(), 2);
}

#[tokio::test]
async fn test_first_accessor_wins() {
    let (db, _, _) = users_db();

    let mut query = db.query(LIST_USERS, active());
    query.execute().await.unwrap();

    let rows = query.fetch_all().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(query.fetch_all().unwrap(), rows);

    assert!(matches!(
        query.fetch(),
        Err(DbError::AccessorMismatch {
            first: "fetch_all",
            requested: "fetch"
        })
    ));
}

#[tokio::test]
async fn test_fetch_and_fetch_column() {
    let (db, _, _) = users_db();

    let mut row = db.query(LIST_USERS, active());
    row.execute().await.unwrap();
    assert_eq!(row.fetch().unwrap(), Some(user(1, "a@example.com")));

    let mut column = db.query(LIST_USERS, active());
    column.execute().await.unwrap();
    assert_eq!(column.fetch_column().unwrap(), json!(1));
}

#[tokio::test]
async fn test_stale_binding_keys_are_not_sent() {
    let (db, recorder, _) = users_db();

    let binding = from_json(json!({"active": true, "limit": 10, "offset": 0, "unused": "x"}));
    let mut query = db.query(LIST_USERS, binding);
    query.execute().await.unwrap();

    let calls = recorder.calls();
    assert_eq!(calls[0].1, active());
}

#[tokio::test]
async fn test_missing_binding_key_is_sent_as_null() {
    let (db, recorder, _) = users_db();

    let mut query = db.query(LIST_USERS, Binding::new());
    query.execute().await.unwrap();

    assert_eq!(recorder.calls()[0].1, from_json(json!({"active": null})));
}

#[tokio::test]
async fn test_paginate_resolves_total() {
    let (db, recorder, _) = users_db();

    let mut query = db
        .query(LIST_USERS, active())
        .paginate(&PageRequest::new(Some(10), Some(20)));
    query.execute().await.unwrap();

    let calls = recorder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0].0,
        "SELECT id, email FROM users WHERE active = :active ORDER BY id DESC LIMIT :limit OFFSET :offset"
    );
    assert_eq!(
        calls[1].0,
        "SELECT COUNT(*) AS total FROM users WHERE active = :active ORDER BY id DESC"
    );
    assert_eq!(calls[1].1, active());

    let listing = query.get_all().unwrap();
    let page = listing.pagination.unwrap();
    assert_eq!(page.total, 42);
    assert_eq!(page.total_pages, 5);
    assert_eq!(page.current_page, 3);
    assert!(page.can_load_more);
}

#[tokio::test]
async fn test_paginated_cache_hit_skips_count() {
    let (db, recorder, _) = users_db();
    let page = PageRequest::new(Some(10), Some(0));

    let mut first = db
        .query(LIST_USERS, active())
        .paginate(&page)
        .cache(CacheSpec::new(["users"]));
    first.execute().await.unwrap();
    assert_eq!(recorder.executions(), 2);

    let mut second = db
        .query(LIST_USERS, active())
        .paginate(&page)
        .cache(CacheSpec::new(["users"]));
    second.execute().await.unwrap();
    assert!(second.from_cache());
    assert_eq!(recorder.executions(), 2);
    assert_eq!(second.pagination().map(|p| p.total), Some(42));
}

#[tokio::test]
async fn test_sort_and_filter_echoed_in_listing() {
    let (db, recorder, _) = users_db();

    let mut query = db
        .query("SELECT id, email FROM users WHERE role = :role", Binding::new())
        .filter(from_json(json!({"role": "admin"})))
        .sort(&SortRequest::new("email desc", ["id", "email"]));
    query.execute().await.unwrap();

    assert_eq!(
        recorder.calls()[0].0,
        "SELECT id, email FROM users WHERE role = :role ORDER BY email DESC"
    );

    let listing = query.get_all().unwrap();
    assert_eq!(listing.filters, from_json(json!({"role": "admin"})));
    assert_eq!(listing.sort.and_then(|s| s.sort).as_deref(), Some("email DESC"));
    assert!(listing.pagination.is_none());
}

#[tokio::test]
async fn test_unready_cache_executes_directly() {
    let (db, recorder, cache) = users_db();
    cache.set_ready(false);

    for _ in 0..2 {
        let mut query = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
        query.execute().await.unwrap();
        assert!(!query.from_cache());
    }
    assert_eq!(recorder.executions(), 2);
}

#[tokio::test]
async fn test_no_connection() {
    let mut recorder = Recorder::new(|_| Ok(QueryOutcome::default()));
    Arc::get_mut(&mut recorder).unwrap().available = false;
    let db = Database::new(Config::default()).with_provider(Arc::new(Provider(recorder.clone())));

    let mut query = db.query("SELECT 1", Binding::new());
    let err = query.execute().await.unwrap_err();
    assert!(matches!(err, DbError::NoConnection));
    assert_eq!(err.status_code(), 503);
}

#[tokio::test]
async fn test_connection_released_on_error() {
    let recorder = Recorder::new(|_| {
        Err(DbError::duplicate_entry(
            "Duplicate entry 'a@b.c' for key 'users.email'",
        ))
    });
    let db = Database::new(Config::default()).with_provider(Arc::new(Provider(recorder.clone())));

    let mut query = db.query(
        "INSERT INTO users (email) VALUES (:email)",
        from_json(json!({"email": "a@b.c"})),
    );
    let err = query.execute().await.unwrap_err();

    assert_eq!(recorder.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.released.load(Ordering::SeqCst), 1);

    let reply: Reply<()> = Reply::from(&err);
    assert_eq!(reply.code, 400);
    assert!(matches!(
        reply.body,
        ApiResponse::Error { ref data, ref validation, .. }
            if data == "ER_DUP_ENTRY" && validation.len() == 1
    ));
}

#[tokio::test]
async fn test_template_insert() {
    let (db, recorder, _) = users_db();

    let mut query = db
        .template(
            "INSERT INTO users ({columns}) VALUES ({values})",
            from_json(json!({
                "columns": ["email", "role"],
                "values": ["email", "role"],
                "email": "d@example.com",
                "role": "user"
            })),
        )
        .unwrap();
    query.execute().await.unwrap();

    let calls = recorder.calls();
    assert_eq!(calls[0].0, "INSERT INTO users (email , role) VALUES (:email , :role)");
    assert_eq!(calls[0].1, from_json(json!({"email": "d@example.com", "role": "user"})));
    assert_eq!(query.affected_rows().unwrap(), 1);
}

#[tokio::test]
async fn test_count_is_shared_across_pages() {
    let (db, recorder, _) = users_db();

    for offset in [0, 10] {
        let mut query = db
            .query(LIST_USERS, active())
            .paginate(&PageRequest::new(Some(10), Some(offset)))
            .cache(CacheSpec::new(["users"]));
        query.execute().await.unwrap();
        assert!(!query.from_cache());
        assert_eq!(query.pagination().map(|p| p.total), Some(42));
    }

    assert_eq!(recorder.count_executions(), 1);
    assert_eq!(recorder.executions(), 3);
}

#[tokio::test]
async fn test_unreferenced_binding_key_shares_cache_entry() {
    let (db, recorder, _) = users_db();

    let mut first = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
    first.execute().await.unwrap();

    let extra = from_json(json!({"active": true, "unused": 1}));
    let mut second = db.query(LIST_USERS, extra).cache(CacheSpec::new(["users"]));
    second.execute().await.unwrap();

    assert!(second.from_cache());
    assert_eq!(second.cache_key(), first.cache_key());
    assert_eq!(recorder.executions(), 1);
}

#[tokio::test]
async fn test_reexecuting_after_write_reads_fresh_rows() {
    let (db, recorder, _) = users_db();

    let mut read = db
        .query(LIST_USERS, active())
        .paginate(&PageRequest::new(Some(10), Some(0)))
        .cache(CacheSpec::new(["users"]));
    read.execute().await.unwrap();
    assert_eq!(recorder.executions(), 2);

    read.execute().await.unwrap();
    assert!(read.from_cache());
    assert_eq!(recorder.executions(), 2);

    let mut write = db
        .query("DELETE FROM users WHERE id = :id", from_json(json!({"id": 2})))
        .cache(CacheSpec::new(["users"]));
    write.execute().await.unwrap();

    read.execute().await.unwrap();
    assert!(!read.from_cache());
    assert_eq!(recorder.executions(), 5);
    assert_eq!(read.pagination().map(|p| p.total), Some(42));
}

#[tokio::test]
async fn test_unreachable_store_degrades_to_direct_execution() {
    let (db, recorder) = db_with_store(Arc::new(FlakyStore::unreachable()));

    let mut read = db
        .query(LIST_USERS, active())
        .paginate(&PageRequest::new(Some(10), Some(0)))
        .cache(CacheSpec::new(["users"]));
    read.execute().await.unwrap();
    assert!(!read.from_cache());
    assert_eq!(read.fetch_all().unwrap().len(), 2);
    assert_eq!(read.pagination().map(|p| p.total), Some(42));

    let mut write = db
        .query("DELETE FROM users WHERE id = :id", from_json(json!({"id": 2})))
        .cache(CacheSpec::new(["users"]));
    write.execute().await.unwrap();
    assert_eq!(write.affected_rows().unwrap(), 1);

    let mut again = db
        .query(LIST_USERS, active())
        .paginate(&PageRequest::new(Some(10), Some(0)))
        .cache(CacheSpec::new(["users"]));
    again.execute().await.unwrap();
    assert!(!again.from_cache());
    assert_eq!(recorder.executions(), 5);
}

#[tokio::test]
async fn test_failed_cache_write_still_returns_rows() {
    let (db, recorder) = db_with_store(Arc::new(FlakyStore::read_only()));

    for _ in 0..2 {
        let mut query = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
        query.execute().await.unwrap();
        assert!(!query.from_cache());
        assert!(query.cache_key().is_some());
        assert_eq!(query.fetch_all().unwrap().len(), 2);
    }
    assert_eq!(recorder.executions(), 2);

    let mut write = db
        .query("DELETE FROM users WHERE id = :id", from_json(json!({"id": 2})))
        .cache(CacheSpec::new(["users"]));
    write.execute().await.unwrap();
    assert_eq!(write.affected_rows().unwrap(), 1);
}

#[tokio::test]
async fn test_failed_version_bump_leaves_other_tables_bumped() {
    let store = Arc::new(FlakyStore::rejecting(table_version_key("orders")));
    let (db, _) = db_with_store(store.clone());
    let tables = vec!["users".to_string(), "orders".to_string()];

    let mut write = db
        .query(
            "UPDATE users u JOIN orders o ON o.user_id = u.id SET u.active = :active",
            active(),
        )
        .cache(CacheSpec::new(tables.clone()));
    write.execute().await.unwrap();
    assert_eq!(write.affected_rows().unwrap(), 1);

    let versions = table_versions(store.as_ref(), &tables).await.unwrap();
    assert_ne!(versions["users"], INITIAL_VERSION);
    assert_eq!(versions["orders"], INITIAL_VERSION);
}

#[tokio::test]
async fn test_cache_stats_visible_through_store() {
    let (db, _, _) = users_db();

    for _ in 0..2 {
        let mut query = db.query(LIST_USERS, active()).cache(CacheSpec::new(["users"]));
        query.execute().await.unwrap();
    }

    let stats = db.cache_store().and_then(|store| store.stats()).unwrap();
    assert_eq!(stats.entries, 1);
    assert!(stats.hits >= 1);
    assert!(stats.hit_rate() > 0.0);
}
