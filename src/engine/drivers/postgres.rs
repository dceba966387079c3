//! PostgreSQL Adapter
//!
//! Implements the Adapter trait for PostgreSQL and Redshift using SQLx.
//!
//! ## Cancellation
//!
//! A cancellable query runs on a dedicated pool connection whose backend pid
//! is recorded before the statement is sent. `cancel()` issues
//! `pg_cancel_backend(pid)` from another pool connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Either, Row, TypeInfo};
use tracing::instrument;

use crate::engine::drivers::{parse_version_word, require_connection};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::filters::{and_clause, build_database_filter, build_schema_filter, DatabaseFilter, SchemaFilter};
use crate::engine::identifier::wrap_identifier;
use crate::engine::query::{CancelableQuery, ExecutionTracker, QueryState};
use crate::engine::registry::AdapterContext;
use crate::engine::statements::{split_statements, SqlDialect, StatementKind};
use crate::engine::traits::Adapter;
use crate::engine::types::{
    AdapterVersion, CancelSupport, EngineKind, Field, QueryId, QueryRowResult, RoutineInfo,
    Row as QRow, TableColumn, TableInfo, TableKey, Value,
};

/// PostgreSQL adapter implementation
pub struct PostgresAdapter {
    kind: EngineKind,
    ctx: AdapterContext,
    pool: Option<PgPool>,
    version: AdapterVersion,
}

impl PostgresAdapter {
    pub fn new(kind: EngineKind, ctx: AdapterContext) -> Self {
        Self {
            kind,
            ctx,
            pool: None,
            version: AdapterVersion::unknown(),
        }
    }

    fn pool(&self) -> EngineResult<&PgPool> {
        require_connection(self.pool.as_ref())
    }

    fn default_schema<'a>(&'a self, schema: Option<&'a str>) -> &'a str {
        schema
            .filter(|s| !s.is_empty())
            .or(self.ctx.config.schema.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("public")
    }

    /// Builds connect options from the server config
    fn build_connect_options(&self) -> EngineResult<PgConnectOptions> {
        let config = &self.ctx.config;
        let mut options = PgConnectOptions::new();

        if config.uses_socket() {
            if let Some(socket) = config.socket_path.as_deref() {
                options = options.socket(socket);
            }
        } else {
            let host = config
                .effective_host()
                .ok_or_else(|| EngineError::invalid_config("Missing host"))?;
            options = options.host(host);
        }

        let default_port = self.kind.default_port().unwrap_or(5432);
        options = options
            .port(config.effective_port().unwrap_or(default_port))
            .database(config.database_or(&self.ctx.database).unwrap_or("postgres"));

        if let Some(user) = config.user.as_deref() {
            options = options.username(user);
        }
        if let Some(password) = config.password.as_deref() {
            options = options.password(password);
        }

        options = match &config.ssl {
            Some(ssl) => {
                let mode = if ssl.reject_unauthorized {
                    PgSslMode::VerifyFull
                } else {
                    PgSslMode::Require
                };
                let options = options.ssl_mode(mode);
                match ssl.ca_path.as_deref() {
                    Some(ca) => options.ssl_root_cert(ca),
                    None => options,
                }
            }
            None => options.ssl_mode(PgSslMode::Prefer),
        };

        Ok(options)
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(pg_row: &PgRow) -> QRow {
        let values: Vec<Value> = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // Integers before bool so int columns are never read as booleans
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }

        Value::Null
    }

    fn get_field_info(row: &PgRow) -> Vec<Field> {
        row.columns()
            .iter()
            .map(|col| Field {
                name: col.name().to_string(),
                data_type: Some(col.type_info().name().to_string()),
            })
            .collect()
    }

    /// Runs a batch and reports one result per statement.
    async fn run_batch(conn: &mut PgConnection, text: &str) -> EngineResult<Vec<QueryRowResult>> {
        let statements = split_statements(SqlDialect::Postgres, text);
        let mut stream = sqlx::raw_sql(text).fetch_many(&mut *conn);

        let mut results = Vec::new();
        let mut rows = Vec::new();
        let mut fields = Vec::new();

        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => {
                    let command = statements
                        .get(results.len())
                        .map_or(StatementKind::Unknown, |s| s.kind);
                    let returned_rows = !fields.is_empty() || command.returns_rows();
                    results.push(QueryRowResult {
                        command,
                        row_count: returned_rows.then_some(rows.len() as u64),
                        affected_rows: (!returned_rows).then_some(done.rows_affected()),
                        rows: std::mem::take(&mut rows),
                        fields: std::mem::take(&mut fields),
                    });
                }
                Either::Right(row) => {
                    if fields.is_empty() {
                        fields = Self::get_field_info(&row);
                    }
                    rows.push(Self::convert_row(&row));
                }
            }
        }

        Ok(results)
    }

    async fn fetch_strings(&self, sql: &str, binds: &[&str]) -> EngineResult<Vec<String>> {
        let mut query = sqlx::query_scalar::<_, String>(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        Ok(query.fetch_all(self.pool()?).await?)
    }

    async fn list_relations(&self, sql: String) -> EngineResult<Vec<TableInfo>> {
        let rows: Vec<(String, String)> = sqlx::query_as(&sql).fetch_all(self.pool()?).await?;
        Ok(rows
            .into_iter()
            .map(|(schema, name)| TableInfo::new(Some(schema), name))
            .collect())
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    #[instrument(
        skip(self),
        fields(client = %self.kind, database = %self.ctx.database, host = ?self.ctx.config.effective_host())
    )]
    async fn connect(&mut self) -> EngineResult<()> {
        let options = self.build_connect_options()?;

        let pool = PgPoolOptions::new()
            .max_connections(self.ctx.settings.pool_max_connections)
            .acquire_timeout(self.ctx.settings.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| {
                if e.to_string().contains("password authentication failed") {
                    EngineError::auth_failed(e.to_string())
                } else {
                    EngineError::connection_failed(e.to_string())
                }
            })?;

        let version_string: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&pool)
            .await?;
        let name = if self.kind == EngineKind::Redshift {
            "Redshift"
        } else {
            "PostgreSQL"
        };
        self.version = AdapterVersion::new(
            name,
            parse_version_word(&version_string, 1),
            version_string,
        );
        self.pool = Some(pool);

        tracing::info!(version = %self.version.version, "Connected");
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        Ok(())
    }

    fn version(&self) -> AdapterVersion {
        self.version.clone()
    }

    fn wrap_identifier(&self, name: &str) -> String {
        wrap_identifier(self.kind, name)
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::Driver
    }

    async fn list_databases(&self, filter: &DatabaseFilter) -> EngineResult<Vec<String>> {
        let sql = format!(
            "SELECT datname::text FROM pg_database WHERE datistemplate = false{} ORDER BY datname",
            and_clause(build_database_filter(filter, "datname"))
        );
        self.fetch_strings(&sql, &[]).await
    }

    async fn list_schemas(&self, filter: &SchemaFilter) -> EngineResult<Vec<String>> {
        let sql = format!(
            "SELECT schema_name::text FROM information_schema.schemata WHERE 1 = 1{} ORDER BY schema_name",
            and_clause(build_schema_filter(filter, "schema_name"))
        );
        self.fetch_strings(&sql, &[]).await
    }

    async fn list_tables(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let sql = format!(
            r#"
            SELECT table_schema::text, table_name::text
            FROM information_schema.tables
            WHERE table_type = 'BASE TABLE'{}
            ORDER BY table_schema, table_name
            "#,
            and_clause(build_schema_filter(filter, "table_schema"))
        );
        self.list_relations(sql).await
    }

    async fn list_views(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let sql = format!(
            r#"
            SELECT table_schema::text, table_name::text
            FROM information_schema.views
            WHERE 1 = 1{}
            ORDER BY table_schema, table_name
            "#,
            and_clause(build_schema_filter(filter, "table_schema"))
        );
        self.list_relations(sql).await
    }

    async fn list_materialized_views(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        if self.kind == EngineKind::Redshift {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT schemaname::text, matviewname::text
            FROM pg_matviews
            WHERE 1 = 1{}
            ORDER BY schemaname, matviewname
            "#,
            and_clause(build_schema_filter(filter, "schemaname"))
        );
        self.list_relations(sql).await
    }

    async fn list_routines(&self, filter: &SchemaFilter) -> EngineResult<Vec<RoutineInfo>> {
        let sql = format!(
            r#"
            SELECT DISTINCT routine_schema::text, routine_name::text, routine_type::text
            FROM information_schema.routines
            WHERE routine_type IN ('FUNCTION', 'PROCEDURE'){}
            ORDER BY routine_name
            "#,
            and_clause(build_schema_filter(filter, "routine_schema"))
        );
        let rows: Vec<(String, String, String)> = sqlx::query_as(&sql).fetch_all(self.pool()?).await?;
        Ok(rows
            .into_iter()
            .map(|(schema, routine_name, routine_type)| RoutineInfo {
                schema: Some(schema),
                routine_name,
                routine_type,
            })
            .collect())
    }

    async fn list_table_columns(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableColumn>> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text, is_nullable::text, column_default::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(self.default_schema(schema))
        .bind(table)
        .fetch_all(self.pool()?)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(column_name, data_type, is_nullable, default_value)| TableColumn {
                column_name,
                data_type,
                nullable: is_nullable == "YES",
                default_value,
            })
            .collect())
    }

    async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT DISTINCT trigger_name::text
            FROM information_schema.triggers
            WHERE event_object_schema = $1 AND event_object_table = $2
            ORDER BY 1
            "#,
            &[self.default_schema(schema), table],
        )
        .await
    }

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT indexname::text
            FROM pg_indexes
            WHERE schemaname = $1 AND tablename = $2
            ORDER BY indexname
            "#,
            &[self.default_schema(schema), table],
        )
        .await
    }

    async fn get_table_references(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT DISTINCT ccu.table_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.constraint_schema = tc.constraint_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1
              AND tc.table_name = $2
            ORDER BY 1
            "#,
            &[self.default_schema(schema), table],
        )
        .await
    }

    async fn get_table_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        let rows: Vec<(String, String, Option<String>, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT
                tc.constraint_name::text,
                kcu.column_name::text,
                CASE WHEN tc.constraint_type = 'FOREIGN KEY' THEN ccu.table_name::text END,
                tc.constraint_type::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON kcu.constraint_name = tc.constraint_name
             AND kcu.table_schema = tc.table_schema
            LEFT JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.constraint_schema = tc.constraint_schema
            WHERE tc.table_schema = $1
              AND tc.table_name = $2
              AND tc.constraint_type IN ('PRIMARY KEY', 'FOREIGN KEY')
            "#,
        )
        .bind(self.default_schema(schema))
        .bind(table)
        .fetch_all(self.pool()?)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(constraint_name, column_name, referenced_table, key_type)| TableKey {
                constraint_name: Some(constraint_name),
                column_name,
                referenced_table,
                key_type,
            })
            .collect())
    }

    async fn get_table_create_script(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let schema = self.default_schema(schema);
        let columns: Vec<(String, String, bool, Option<String>)> = sqlx::query_as(
            r#"
            SELECT a.attname::text,
                   format_type(a.atttypid, a.atttypmod),
                   a.attnotnull,
                   pg_get_expr(d.adbin, d.adrelid)
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
            WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
            ORDER BY a.attnum
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(self.pool()?)
        .await?;

        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let mut definitions: Vec<String> = columns
            .iter()
            .map(|(name, data_type, not_null, default)| {
                let mut line = format!("  {} {}", self.wrap_identifier(name), data_type);
                if *not_null {
                    line.push_str(" NOT NULL");
                }
                if let Some(default) = default {
                    line.push_str(" DEFAULT ");
                    line.push_str(default);
                }
                line
            })
            .collect();

        let primary: Vec<String> = self
            .get_table_keys(table, Some(schema))
            .await?
            .into_iter()
            .filter(|key| key.key_type == "PRIMARY KEY")
            .map(|key| self.wrap_identifier(&key.column_name))
            .collect();
        if !primary.is_empty() {
            definitions.push(format!("  PRIMARY KEY ({})", primary.join(", ")));
        }

        Ok(vec![format!(
            "CREATE TABLE {} (\n{}\n);",
            self.qualified_name(table, Some(schema)),
            definitions.join(",\n")
        )])
    }

    async fn get_view_create_script(&self, view: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let qualified = self.qualified_name(view, Some(self.default_schema(schema)));
        let definition: Option<String> = sqlx::query_scalar("SELECT pg_get_viewdef($1::regclass, true)")
            .bind(&qualified)
            .fetch_optional(self.pool()?)
            .await?;

        Ok(definition
            .map(|def| format!("CREATE OR REPLACE VIEW {} AS\n{}", qualified, def))
            .into_iter()
            .collect())
    }

    async fn get_routine_create_script(
        &self,
        routine: &str,
        _routine_type: &str,
        schema: Option<&str>,
    ) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT pg_get_functiondef(p.oid)
            FROM pg_proc p
            JOIN pg_namespace n ON n.oid = p.pronamespace
            WHERE p.proname = $1 AND n.nspname = $2
            "#,
            &[routine, self.default_schema(schema)],
        )
        .await
    }

    async fn truncate_all_tables(&self, schema: Option<&str>) -> EngineResult<()> {
        let schema = self.default_schema(schema);
        let tables = self
            .fetch_strings(
                r#"
                SELECT table_name::text
                FROM information_schema.tables
                WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                "#,
                &[schema],
            )
            .await?;
        if tables.is_empty() {
            return Ok(());
        }

        let script: String = tables
            .iter()
            .map(|table| {
                format!(
                    "TRUNCATE TABLE {} RESTART IDENTITY CASCADE;",
                    self.qualified_name(table, Some(schema))
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut conn = self.pool()?.acquire().await?;
        Self::run_batch(&mut conn, &script).await?;
        tracing::info!(schema, tables = tables.len(), "Truncated all tables");
        Ok(())
    }

    fn query(&self, text: &str) -> EngineResult<Arc<dyn CancelableQuery>> {
        Ok(Arc::new(PostgresQuery {
            pool: self.pool()?.clone(),
            text: text.to_string(),
            tracker: ExecutionTracker::new(),
        }))
    }

    async fn execute_query(&self, text: &str) -> EngineResult<Vec<QueryRowResult>> {
        let mut conn = self.pool()?.acquire().await?;
        Self::run_batch(&mut conn, text).await
    }
}

/// Cancellable query bound to one backend
pub struct PostgresQuery {
    pool: PgPool,
    text: String,
    tracker: ExecutionTracker<i32>,
}

#[async_trait]
impl CancelableQuery for PostgresQuery {
    fn id(&self) -> QueryId {
        self.tracker.id()
    }

    fn state(&self) -> QueryState {
        self.tracker.state()
    }

    #[instrument(skip(self), fields(query_id = %self.tracker.id()))]
    async fn execute(&self) -> EngineResult<Vec<QueryRowResult>> {
        self.tracker.begin()?;

        let result = async {
            let mut conn = self.pool.acquire().await?;
            let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
                .fetch_one(&mut *conn)
                .await?;
            self.tracker.record(backend_pid);

            let outcome = self
                .tracker
                .race(PostgresAdapter::run_batch(&mut conn, &self.text))
                .await;
            if outcome.is_err() {
                // The protocol state is unknown after an interrupted stream.
                drop(conn.detach());
            }
            outcome
        }
        .await;

        self.tracker.finish(result)
    }

    async fn cancel(&self) -> EngineResult<()> {
        let pool = self.pool.clone();
        self.tracker
            .cancel(|pid| async move {
                let canceled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
                    .bind(pid)
                    .fetch_one(&pool)
                    .await?;
                if canceled {
                    Ok(())
                } else {
                    Err(EngineError::execution_error(format!(
                        "Failed canceling query with pid {}",
                        pid
                    )))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientSettings;
    use crate::engine::types::{ServerConfig, TlsOptions};

    fn adapter(config: ServerConfig, database: &str) -> PostgresAdapter {
        PostgresAdapter::new(
            EngineKind::Postgresql,
            AdapterContext {
                config,
                database: database.to_string(),
                settings: ClientSettings::default(),
            },
        )
    }

    #[test]
    fn connect_options_follow_tunnel_endpoint() {
        let mut config = ServerConfig::new("postgresql");
        config.host = Some("db.internal".into());
        config.port = Some(6543);
        config.local_host = Some("127.0.0.1".into());
        config.local_port = Some(40001);
        config.ssl = Some(TlsOptions::default());

        let options = adapter(config, "app")
            .build_connect_options()
            .expect("options build");
        assert_eq!(options.get_host(), "127.0.0.1");
        assert_eq!(options.get_port(), 40001);
        assert_eq!(options.get_database(), Some("app"));
    }

    #[test]
    fn wraps_and_qualifies_names() {
        let adapter = adapter(ServerConfig::new("postgresql"), "");
        assert_eq!(
            adapter.get_query_select_top("users", 10, Some("public")),
            "SELECT * FROM \"public\".\"users\" LIMIT 10"
        );
        assert_eq!(adapter.default_schema(None), "public");
        assert_eq!(adapter.version().name, "UNKNOWN");
    }

    #[test]
    fn query_requires_connection() {
        let adapter = adapter(ServerConfig::new("postgresql"), "");
        let err = adapter.query("SELECT 1").err().expect("no pool yet");
        assert!(matches!(err, EngineError::NoConnection));
    }
}
