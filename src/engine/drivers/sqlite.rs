//! SQLite Adapter
//!
//! Implements the Adapter trait for SQLite using rusqlite. The database is a
//! file, so every call opens its own connection on the blocking pool instead
//! of keeping one shared handle around.
//!
//! Cancellation interrupts the connection of the running query. A progress
//! handler watches the same flag so a cancel that lands between two
//! statements of a batch still stops the next one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OptionalExtension};
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::filters::{DatabaseFilter, SchemaFilter};
use crate::engine::identifier::wrap_identifier;
use crate::engine::query::{CancelableQuery, ExecutionTracker, QueryState};
use crate::engine::registry::AdapterContext;
use crate::engine::statements::{split_statements, IdentifiedStatement, SqlDialect};
use crate::engine::traits::Adapter;
use crate::engine::types::{
    AdapterVersion, CancelSupport, EngineKind, Field, QueryId, QueryRowResult, Row as QRow,
    TableColumn, TableInfo, TableKey, Value,
};

/// SQLite VM instructions between two progress-handler checks
const PROGRESS_OPS: i32 = 1000;

/// SQLite adapter implementation
pub struct SqliteAdapter {
    ctx: AdapterContext,
    path: Option<PathBuf>,
    version: AdapterVersion,
}

impl SqliteAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            path: None,
            version: AdapterVersion::unknown(),
        }
    }

    fn database_path(&self) -> EngineResult<PathBuf> {
        self.ctx
            .config
            .database_or(&self.ctx.database)
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::invalid_config("SQLite requires a database file path"))
    }

    /// Runs `f` against a fresh connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> EngineResult<T> + Send + 'static,
    {
        let path = self.path.clone().ok_or(EngineError::NoConnection)?;
        tokio::task::spawn_blocking(move || {
            let conn = open(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| EngineError::internal(format!("SQLite task failed: {e}")))?
    }

    async fn list_names(&self, sql: &'static str, bind: Option<String>) -> EngineResult<Vec<String>> {
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(sql)?;
            let names = match bind {
                Some(value) => stmt
                    .query_map([value], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
                None => stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
            };
            Ok(names)
        })
        .await
    }

    async fn master_sql(&self, kind: &'static str, name: &str) -> EngineResult<Vec<String>> {
        let name = name.to_string();
        self.with_connection(move |conn| {
            let sql: Option<Option<String>> = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = ?1 AND name = ?2",
                    [kind, name.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(sql.flatten().into_iter().collect())
        })
        .await
    }
}

fn open(path: &Path) -> EngineResult<Connection> {
    Connection::open(path).map_err(|e| {
        EngineError::connection_failed(format!(
            "Failed to open database '{}': {}",
            path.display(),
            e
        ))
    })
}

fn convert_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    }
}

fn run_statement(conn: &Connection, statement: &IdentifiedStatement) -> EngineResult<QueryRowResult> {
    let mut stmt = conn.prepare(&statement.text)?;
    let mut result = QueryRowResult::empty(statement.kind);

    let column_count = stmt.column_count();
    if column_count == 0 {
        let changes = stmt.execute([])? as u64;
        result.row_count = Some(changes);
        result.affected_rows = Some(changes);
        return Ok(result);
    }

    result.fields = stmt.column_names().into_iter().map(Field::named).collect();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let values = (0..column_count)
            .map(|idx| row.get_ref(idx).map(convert_value))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        result.rows.push(QRow { values });
    }
    result.row_count = Some(result.rows.len() as u64);
    Ok(result)
}

/// Runs each statement of `text` in order, one result per statement.
fn run_batch(conn: &Connection, text: &str, canceled: Option<&AtomicBool>) -> EngineResult<Vec<QueryRowResult>> {
    let mut results = Vec::new();
    for statement in split_statements(SqlDialect::Sqlite, text) {
        if canceled.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(EngineError::CanceledByUser);
        }
        results.push(run_statement(conn, &statement)?);
    }
    Ok(results)
}

#[async_trait]
impl Adapter for SqliteAdapter {
    #[instrument(skip(self), fields(database = %self.ctx.database))]
    async fn connect(&mut self) -> EngineResult<()> {
        let path = self.database_path()?;
        self.path = Some(path.clone());

        let version = self
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))?)
            })
            .await;
        let version = match version {
            Ok(version) => version,
            Err(err) => {
                self.path = None;
                return Err(err);
            }
        };

        self.version = AdapterVersion::new("SQLite", version.clone(), format!("SQLite {}", version));
        tracing::info!(path = %path.display(), version = %version, "Connected");
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        Ok(())
    }

    fn version(&self) -> AdapterVersion {
        self.version.clone()
    }

    fn wrap_identifier(&self, name: &str) -> String {
        wrap_identifier(EngineKind::Sqlite, name)
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::Driver
    }

    /// Files attached to the connection, `main` first.
    async fn list_databases(&self, filter: &DatabaseFilter) -> EngineResult<Vec<String>> {
        let files = self
            .list_names("SELECT file FROM pragma_database_list WHERE file != '' ORDER BY seq", None)
            .await?;
        Ok(files.into_iter().filter(|f| filter.matches(f)).collect())
    }

    async fn list_tables(&self, _filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let names = self
            .list_names(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                None,
            )
            .await?;
        Ok(names.into_iter().map(|name| TableInfo::new(None, name)).collect())
    }

    async fn list_views(&self, _filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let names = self
            .list_names("SELECT name FROM sqlite_master WHERE type = 'view' ORDER BY name", None)
            .await?;
        Ok(names.into_iter().map(|name| TableInfo::new(None, name)).collect())
    }

    async fn list_table_columns(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableColumn>> {
        let table = table.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, type, \"notnull\", dflt_value FROM pragma_table_info(?1) ORDER BY cid",
            )?;
            let columns = stmt
                .query_map([table], |row| {
                    Ok(TableColumn {
                        column_name: row.get(0)?,
                        data_type: row.get(1)?,
                        nullable: row.get::<_, i64>(2)? == 0,
                        default_value: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(columns)
        })
        .await
    }

    async fn list_table_triggers(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.list_names(
            "SELECT name FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?1 ORDER BY name",
            Some(table.to_string()),
        )
        .await
    }

    async fn list_table_indexes(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.list_names(
            "SELECT name FROM pragma_index_list(?1) ORDER BY name",
            Some(table.to_string()),
        )
        .await
    }

    async fn get_table_references(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.list_names(
            "SELECT DISTINCT \"table\" FROM pragma_foreign_key_list(?1) ORDER BY 1",
            Some(table.to_string()),
        )
        .await
    }

    async fn get_table_keys(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        let table = table.to_string();
        self.with_connection(move |conn| {
            let mut keys = conn
                .prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")?
                .query_map([table.as_str()], |row| {
                    Ok(TableKey {
                        constraint_name: None,
                        column_name: row.get(0)?,
                        referenced_table: None,
                        key_type: "PRIMARY KEY".to_string(),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let foreign = conn
                .prepare("SELECT \"from\", \"table\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq")?
                .query_map([table.as_str()], |row| {
                    Ok(TableKey {
                        constraint_name: None,
                        column_name: row.get(0)?,
                        referenced_table: row.get(1)?,
                        key_type: "FOREIGN KEY".to_string(),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            keys.extend(foreign);
            Ok(keys)
        })
        .await
    }

    async fn get_table_create_script(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.master_sql("table", table).await
    }

    async fn get_view_create_script(&self, view: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.master_sql("view", view).await
    }

    async fn truncate_all_tables(&self, _schema: Option<&str>) -> EngineResult<()> {
        let tables = self.list_tables(&SchemaFilter::default()).await?;
        if tables.is_empty() {
            return Ok(());
        }

        let mut script = String::from("BEGIN;\n");
        for table in &tables {
            script.push_str(&format!("DELETE FROM {};\n", self.wrap_identifier(&table.name)));
        }
        script.push_str("COMMIT;");

        self.with_connection(move |conn| {
            // Parents may be emptied before their children.
            let enforce_fk: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
            conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
            let emptied = conn.execute_batch(&script);
            if enforce_fk {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            }
            emptied?;

            let has_sequence: bool = conn.query_row(
                "SELECT count(*) > 0 FROM sqlite_master WHERE name = 'sqlite_sequence'",
                [],
                |row| row.get(0),
            )?;
            if has_sequence {
                conn.execute("DELETE FROM sqlite_sequence", [])?;
            }
            Ok(())
        })
        .await?;

        tracing::info!(tables = tables.len(), "Truncated all tables");
        Ok(())
    }

    fn query(&self, text: &str) -> EngineResult<Arc<dyn CancelableQuery>> {
        let path = self.path.clone().ok_or(EngineError::NoConnection)?;
        Ok(Arc::new(SqliteQuery {
            path,
            text: text.to_string(),
            tracker: Arc::new(ExecutionTracker::new()),
        }))
    }

    async fn execute_query(&self, text: &str) -> EngineResult<Vec<QueryRowResult>> {
        let text = text.to_string();
        self.with_connection(move |conn| run_batch(conn, &text, None)).await
    }
}

/// Interrupt target recorded while a query runs
pub struct SqliteInterrupt {
    handle: InterruptHandle,
    requested: Arc<AtomicBool>,
}

impl SqliteInterrupt {
    fn interrupt(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.handle.interrupt();
    }
}

/// Cancellable query running on its own connection
pub struct SqliteQuery {
    path: PathBuf,
    text: String,
    tracker: Arc<ExecutionTracker<Arc<SqliteInterrupt>>>,
}

#[async_trait]
impl CancelableQuery for SqliteQuery {
    fn id(&self) -> QueryId {
        self.tracker.id()
    }

    fn state(&self) -> QueryState {
        self.tracker.state()
    }

    #[instrument(skip(self), fields(query_id = %self.tracker.id()))]
    async fn execute(&self) -> EngineResult<Vec<QueryRowResult>> {
        self.tracker.begin()?;

        let path = self.path.clone();
        let text = self.text.clone();
        let tracker = self.tracker.clone();
        let work = tokio::task::spawn_blocking(move || {
            let conn = open(&path)?;
            let requested = Arc::new(AtomicBool::new(false));
            let flag = requested.clone();
            conn.progress_handler(PROGRESS_OPS, Some(move || flag.load(Ordering::SeqCst)));
            tracker.record(Arc::new(SqliteInterrupt {
                handle: conn.get_interrupt_handle(),
                requested: requested.clone(),
            }));
            run_batch(&conn, &text, Some(&requested))
        });

        let result = self
            .tracker
            .race(async {
                work.await
                    .map_err(|e| EngineError::internal(format!("SQLite task failed: {e}")))?
            })
            .await;

        self.tracker.finish(result)
    }

    async fn cancel(&self) -> EngineResult<()> {
        self.tracker
            .cancel(|interrupt| async move {
                interrupt.interrupt();
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ClientSettings;
    use crate::engine::filters::FilterSpec;
    use crate::engine::statements::StatementKind;
    use crate::engine::types::ServerConfig;

    async fn connected(dir: &tempfile::TempDir) -> SqliteAdapter {
        let path = dir.path().join("test.db");
        let mut config = ServerConfig::new("sqlite");
        config.database = Some(path.display().to_string());

        let mut adapter = SqliteAdapter::new(AdapterContext {
            config,
            database: String::new(),
            settings: ClientSettings::default(),
        });
        adapter.connect().await.expect("connect");
        adapter
    }

    const SCHEMA: &str = "
        CREATE TABLE authors (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);
        CREATE TABLE books (
            id INTEGER PRIMARY KEY,
            author_id INTEGER REFERENCES authors(id),
            title TEXT DEFAULT 'untitled'
        );
        CREATE INDEX books_title ON books(title);
        CREATE VIEW book_titles AS SELECT title FROM books;
    ";

    #[tokio::test]
    async fn connect_reads_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;
        let version = adapter.version();
        assert_eq!(version.name, "SQLite");
        assert!(version.version.starts_with('3'));
    }

    #[tokio::test]
    async fn execute_query_reports_each_statement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;

        let results = adapter
            .execute_query(
                "CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1), (2); SELECT v FROM t ORDER BY v;",
            )
            .await
            .expect("batch runs");

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].command, StatementKind::CreateTable);
        assert_eq!(results[1].affected_rows, Some(2));
        assert_eq!(results[2].command, StatementKind::Select);
        assert_eq!(results[2].row_count, Some(2));
        assert_eq!(results[2].fields, vec![Field::named("v")]);
        assert_eq!(results[2].rows[1].values, vec![Value::Int(2)]);
    }

    #[tokio::test]
    async fn introspects_schema_objects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;
        adapter.execute_query(SCHEMA).await.expect("schema");

        let tables = adapter.list_tables(&SchemaFilter::default()).await.expect("tables");
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["authors", "books"]);

        let views = adapter.list_views(&SchemaFilter::default()).await.expect("views");
        assert_eq!(views[0].name, "book_titles");

        let columns = adapter.list_table_columns("books", None).await.expect("columns");
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[2].default_value.as_deref(), Some("'untitled'"));

        let indexes = adapter.list_table_indexes("books", None).await.expect("indexes");
        assert!(indexes.contains(&"books_title".to_string()));

        let references = adapter.get_table_references("books", None).await.expect("refs");
        assert_eq!(references, vec!["authors".to_string()]);

        let keys = adapter.get_table_keys("books", None).await.expect("keys");
        assert!(keys.iter().any(|k| k.key_type == "PRIMARY KEY" && k.column_name == "id"));
        assert!(keys
            .iter()
            .any(|k| k.key_type == "FOREIGN KEY" && k.referenced_table.as_deref() == Some("authors")));

        let script = adapter.get_table_create_script("authors", None).await.expect("script");
        assert!(script[0].starts_with("CREATE TABLE authors"));
    }

    #[tokio::test]
    async fn truncate_all_tables_empties_every_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;
        adapter.execute_query(SCHEMA).await.expect("schema");
        adapter
            .execute_query("INSERT INTO authors (name) VALUES ('a'); INSERT INTO books (id, author_id) VALUES (1, 1);")
            .await
            .expect("seed");

        adapter.truncate_all_tables(None).await.expect("truncate");

        let results = adapter
            .execute_query("SELECT count(*) FROM authors; SELECT count(*) FROM books")
            .await
            .expect("count");
        assert_eq!(results[0].rows[0].values, vec![Value::Int(0)]);
        assert_eq!(results[1].rows[0].values, vec![Value::Int(0)]);
    }

    #[tokio::test]
    async fn truncate_keeps_foreign_key_enforcement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;
        adapter.execute_query(SCHEMA).await.expect("schema");
        adapter
            .execute_query("INSERT INTO authors (name) VALUES ('a'); INSERT INTO books (id, author_id) VALUES (1, 1);")
            .await
            .expect("seed");

        adapter.truncate_all_tables(None).await.expect("truncate");

        let enforced = adapter
            .with_connection(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get::<_, bool>(0))?))
            .await
            .expect("pragma");
        let dangling = adapter
            .execute_query("INSERT INTO books (id, author_id) VALUES (2, 99)")
            .await;
        assert_eq!(enforced, dangling.is_err());
    }

    #[tokio::test]
    async fn trigger_body_runs_as_one_statement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;

        let results = adapter
            .execute_query(
                "CREATE TABLE a (v INTEGER); CREATE TABLE b (v INTEGER);
                 CREATE TRIGGER copy_a AFTER INSERT ON a BEGIN INSERT INTO b VALUES (NEW.v); END;
                 INSERT INTO a VALUES (7);
                 SELECT v FROM b;",
            )
            .await
            .expect("trigger batch runs");

        assert_eq!(results.len(), 5);
        assert_eq!(results[2].command, StatementKind::CreateTrigger);
        assert_eq!(results[4].rows[0].values, vec![Value::Int(7)]);
    }

    #[tokio::test]
    async fn wrapped_identifiers_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;

        let table = adapter.wrap_identifier("odd\"name");
        let column = adapter.wrap_identifier("col\"x");
        assert_eq!(table, "\"odd\"\"name\"");

        adapter
            .execute_query(&format!(
                "CREATE TABLE {table} ({column} INTEGER); INSERT INTO {table} VALUES (3);"
            ))
            .await
            .expect("create quoted table");
        let results = adapter
            .execute_query(&format!("SELECT {column} FROM {table}"))
            .await
            .expect("select quoted table");
        assert_eq!(results[0].fields, vec![Field::named("col\"x")]);
        assert_eq!(results[0].rows[0].values, vec![Value::Int(3)]);

        let tables = adapter.list_tables(&SchemaFilter::default()).await.expect("tables");
        assert_eq!(tables[0].name, "odd\"name");
    }

    #[tokio::test]
    async fn database_filter_keeps_only_existing_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;

        let all = adapter.list_databases(&DatabaseFilter::default()).await.expect("databases");
        assert_eq!(all.len(), 1);

        let filter = DatabaseFilter {
            database: Some(FilterSpec::only([all[0].as_str(), "/nowhere/ghost.db"])),
        };
        let databases = adapter.list_databases(&filter).await.expect("filtered");
        assert_eq!(databases, all);
    }

    #[tokio::test]
    async fn query_handle_executes_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;

        let query = adapter.query("SELECT 1 AS one").expect("handle");
        assert_eq!(query.state(), QueryState::Created);
        let results = query.execute().await.expect("runs");
        assert_eq!(results[0].rows[0].values, vec![Value::Int(1)]);
        assert_eq!(query.state(), QueryState::Completed);

        let err = query.execute().await.expect_err("second execute");
        assert!(matches!(err, EngineError::QueryAlreadyStarted));
    }

    #[tokio::test]
    async fn cancel_before_execute_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;

        let query = adapter.query("SELECT 1").expect("handle");
        let err = query.cancel().await.expect_err("nothing running");
        assert!(matches!(err, EngineError::NotCancelable));
    }

    #[tokio::test]
    async fn cancel_interrupts_running_query() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = connected(&dir).await;

        let query = adapter
            .query("WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c")
            .expect("handle");
        let runner = {
            let query = query.clone();
            tokio::spawn(async move { query.execute().await })
        };

        let mut canceled = false;
        for _ in 0..500 {
            match query.cancel().await {
                Ok(()) => {
                    canceled = true;
                    break;
                }
                Err(EngineError::NotCancelable) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(other) => panic!("unexpected cancel error: {other}"),
            }
        }
        assert!(canceled, "query never became cancelable");

        let err = runner
            .await
            .expect("join")
            .expect_err("query should be canceled");
        assert_eq!(err.discriminator(), Some("CANCELED_BY_USER"));
        assert_eq!(query.state(), QueryState::Canceled);
    }

    #[tokio::test]
    async fn operations_require_connect() {
        let adapter = SqliteAdapter::new(AdapterContext {
            config: ServerConfig::new("sqlite"),
            database: String::new(),
            settings: ClientSettings::default(),
        });
        let err = adapter.execute_query("SELECT 1").await.expect_err("not connected");
        assert!(matches!(err, EngineError::NoConnection));
    }
}
