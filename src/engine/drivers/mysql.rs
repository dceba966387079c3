//! MySQL Adapter
//!
//! Implements the Adapter trait for MySQL and MariaDB using SQLx.
//!
//! Cancellation follows the PostgreSQL adapter: the query runs on a dedicated
//! pool connection whose `CONNECTION_ID()` is recorded, and `cancel()` kills
//! that connection from another one.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column, Either, Row, TypeInfo};
use tracing::instrument;

use crate::engine::drivers::require_connection;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::filters::{and_clause, build_database_filter, DatabaseFilter, SchemaFilter};
use crate::engine::identifier::wrap_identifier;
use crate::engine::query::{CancelableQuery, ExecutionTracker, QueryState};
use crate::engine::registry::AdapterContext;
use crate::engine::statements::{split_statements, SqlDialect, StatementKind};
use crate::engine::traits::Adapter;
use crate::engine::types::{
    AdapterVersion, CancelSupport, EngineKind, Field, QueryId, QueryRowResult, RoutineInfo,
    Row as QRow, TableColumn, TableInfo, TableKey, Value,
};

/// MySQL adapter implementation
pub struct MySqlAdapter {
    kind: EngineKind,
    ctx: AdapterContext,
    pool: Option<MySqlPool>,
    version: AdapterVersion,
}

impl MySqlAdapter {
    pub fn new(kind: EngineKind, ctx: AdapterContext) -> Self {
        Self {
            kind,
            ctx,
            pool: None,
            version: AdapterVersion::unknown(),
        }
    }

    fn pool(&self) -> EngineResult<&MySqlPool> {
        require_connection(self.pool.as_ref())
    }

    /// Builds connect options from the server config
    fn build_connect_options(&self) -> EngineResult<MySqlConnectOptions> {
        let config = &self.ctx.config;
        let mut options = MySqlConnectOptions::new();

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

        options = options.port(config.effective_port().unwrap_or(3306));
        if let Some(database) = config.database_or(&self.ctx.database) {
            options = options.database(database);
        }
        if let Some(user) = config.user.as_deref() {
            options = options.username(user);
        }
        if let Some(password) = config.password.as_deref() {
            options = options.password(password);
        }

        options = match &config.ssl {
            Some(ssl) => {
                let mode = if ssl.reject_unauthorized {
                    MySqlSslMode::VerifyIdentity
                } else {
                    MySqlSslMode::Required
                };
                let options = options.ssl_mode(mode);
                match ssl.ca_path.as_deref() {
                    Some(ca) => options.ssl_ca(ca),
                    None => options,
                }
            }
            None => options.ssl_mode(MySqlSslMode::Preferred),
        };

        Ok(options)
    }

    /// Server name and numeric version from a `version()` string
    fn parse_version(version_string: &str) -> (&'static str, String) {
        let name = if version_string.contains("MariaDB") {
            "MariaDB"
        } else {
            "MySQL"
        };
        let version = version_string
            .split('-')
            .next()
            .unwrap_or(version_string)
            .trim()
            .to_string();
        (name, version)
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(mysql_row: &MySqlRow) -> QRow {
        let values: Vec<Value> = mysql_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(mysql_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Extracts a value from a MySqlRow at the given index
    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // u64 first for BIGINT UNSIGNED columns
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(unsigned_value).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
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
        if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
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

    fn get_field_info(row: &MySqlRow) -> Vec<Field> {
        row.columns()
            .iter()
            .map(|col| Field {
                name: col.name().to_string(),
                data_type: Some(col.type_info().name().to_string()),
            })
            .collect()
    }

    /// Runs a multi-statement batch and reports one result per statement.
    async fn run_batch(conn: &mut MySqlConnection, text: &str) -> EngineResult<Vec<QueryRowResult>> {
        let statements = split_statements(SqlDialect::MySql, text);
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

    /// Text column `idx` of the first row of a `SHOW CREATE ...` statement
    async fn show_create(&self, sql: &str, idx: usize) -> EngineResult<Vec<String>> {
        let row = sqlx::query(sql).fetch_optional(self.pool()?).await?;
        Ok(row
            .and_then(|row| {
                row.try_get::<String, _>(idx)
                    .or_else(|_| {
                        row.try_get::<Vec<u8>, _>(idx)
                            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    })
                    .ok()
            })
            .into_iter()
            .collect())
    }
}

#[async_trait]
impl Adapter for MySqlAdapter {
    #[instrument(
        skip(self),
        fields(client = %self.kind, database = %self.ctx.database, host = ?self.ctx.config.effective_host())
    )]
    async fn connect(&mut self) -> EngineResult<()> {
        let options = self.build_connect_options()?;

        let pool = MySqlPoolOptions::new()
            .max_connections(self.ctx.settings.pool_max_connections)
            .acquire_timeout(self.ctx.settings.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| {
                if e.to_string().contains("Access denied") {
                    EngineError::auth_failed(e.to_string())
                } else {
                    EngineError::connection_failed(e.to_string())
                }
            })?;

        let version_string: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&pool)
            .await?;
        let (name, version) = Self::parse_version(&version_string);
        self.version = AdapterVersion::new(name, version, version_string.clone());
        self.pool = Some(pool);

        tracing::info!(version = %self.version.version, server = name, "Connected");
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
            "SELECT CAST(schema_name AS CHAR) FROM information_schema.schemata WHERE 1 = 1{} ORDER BY schema_name",
            and_clause(build_database_filter(filter, "schema_name"))
        );
        self.fetch_strings(&sql, &[]).await
    }

    async fn list_tables(&self, _filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let names = self
            .fetch_strings(
                r#"
                SELECT CAST(table_name AS CHAR)
                FROM information_schema.tables
                WHERE table_schema = database() AND table_type NOT LIKE '%VIEW%'
                ORDER BY table_name
                "#,
                &[],
            )
            .await?;
        Ok(names.into_iter().map(|name| TableInfo::new(None, name)).collect())
    }

    async fn list_views(&self, _filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let names = self
            .fetch_strings(
                r#"
                SELECT CAST(table_name AS CHAR)
                FROM information_schema.views
                WHERE table_schema = database()
                ORDER BY table_name
                "#,
                &[],
            )
            .await?;
        Ok(names.into_iter().map(|name| TableInfo::new(None, name)).collect())
    }

    async fn list_routines(&self, _filter: &SchemaFilter) -> EngineResult<Vec<RoutineInfo>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT CAST(routine_name AS CHAR), CAST(routine_type AS CHAR)
            FROM information_schema.routines
            WHERE routine_schema = database()
            ORDER BY routine_name
            "#,
        )
        .fetch_all(self.pool()?)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(routine_name, routine_type)| RoutineInfo {
                schema: None,
                routine_name,
                routine_type,
            })
            .collect())
    }

    async fn list_table_columns(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableColumn>> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT CAST(column_name AS CHAR), CAST(column_type AS CHAR),
                   CAST(is_nullable AS CHAR), CAST(column_default AS CHAR)
            FROM information_schema.columns
            WHERE table_schema = database() AND table_name = ?
            ORDER BY ordinal_position
            "#,
        )
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

    async fn list_table_triggers(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT CAST(trigger_name AS CHAR)
            FROM information_schema.triggers
            WHERE event_object_schema = database() AND event_object_table = ?
            ORDER BY trigger_name
            "#,
            &[table],
        )
        .await
    }

    async fn list_table_indexes(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT DISTINCT CAST(index_name AS CHAR)
            FROM information_schema.statistics
            WHERE table_schema = database() AND table_name = ?
            ORDER BY 1
            "#,
            &[table],
        )
        .await
    }

    async fn get_table_references(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT DISTINCT CAST(referenced_table_name AS CHAR)
            FROM information_schema.key_column_usage
            WHERE table_schema = database()
              AND table_name = ?
              AND referenced_table_name IS NOT NULL
            ORDER BY 1
            "#,
            &[table],
        )
        .await
    }

    async fn get_table_keys(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        let rows: Vec<(String, String, Option<String>, String)> = sqlx::query_as(
            r#"
            SELECT CAST(kcu.constraint_name AS CHAR),
                   CAST(kcu.column_name AS CHAR),
                   CAST(kcu.referenced_table_name AS CHAR),
                   CAST(tc.constraint_type AS CHAR)
            FROM information_schema.key_column_usage kcu
            JOIN information_schema.table_constraints tc
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
             AND tc.table_name = kcu.table_name
            WHERE kcu.table_schema = database()
              AND kcu.table_name = ?
              AND tc.constraint_type IN ('PRIMARY KEY', 'FOREIGN KEY')
            ORDER BY kcu.ordinal_position
            "#,
        )
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

    async fn get_table_create_script(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        let sql = format!("SHOW CREATE TABLE {}", self.wrap_identifier(table));
        self.show_create(&sql, 1).await
    }

    async fn get_view_create_script(&self, view: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        let sql = format!("SHOW CREATE VIEW {}", self.wrap_identifier(view));
        self.show_create(&sql, 1).await
    }

    async fn get_routine_create_script(
        &self,
        routine: &str,
        routine_type: &str,
        _schema: Option<&str>,
    ) -> EngineResult<Vec<String>> {
        let kind = if routine_type.eq_ignore_ascii_case("PROCEDURE") {
            "PROCEDURE"
        } else {
            "FUNCTION"
        };
        let sql = format!("SHOW CREATE {} {}", kind, self.wrap_identifier(routine));
        self.show_create(&sql, 2).await
    }

    async fn truncate_all_tables(&self, _schema: Option<&str>) -> EngineResult<()> {
        let tables = self.list_tables(&SchemaFilter::default()).await?;
        if tables.is_empty() {
            return Ok(());
        }

        let mut script = String::from("SET FOREIGN_KEY_CHECKS = 0;\n");
        for table in &tables {
            script.push_str(&format!("TRUNCATE TABLE {};\n", self.wrap_identifier(&table.name)));
        }
        script.push_str("SET FOREIGN_KEY_CHECKS = 1;");

        let mut conn = self.pool()?.acquire().await?;
        Self::run_batch(&mut conn, &script).await?;
        tracing::info!(tables = tables.len(), "Truncated all tables");
        Ok(())
    }

    fn query(&self, text: &str) -> EngineResult<Arc<dyn CancelableQuery>> {
        Ok(Arc::new(MySqlQuery {
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

/// Cancellable query bound to one server thread
pub struct MySqlQuery {
    pool: MySqlPool,
    text: String,
    tracker: ExecutionTracker<u64>,
}

#[async_trait]
impl CancelableQuery for MySqlQuery {
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
            let connection_id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
                .fetch_one(&mut *conn)
                .await?;
            self.tracker.record(connection_id);

            let outcome = self
                .tracker
                .race(MySqlAdapter::run_batch(&mut conn, &self.text))
                .await;
            if outcome.is_err() {
                // A killed connection must not go back to the pool.
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
            .cancel(|connection_id| async move {
                sqlx::query(&format!("KILL {}", connection_id))
                    .execute(&pool)
                    .await?;
                Ok(())
            })
            .await
    }
}

/// BIGINT UNSIGNED values above `i64::MAX` are kept as text.
fn unsigned_value(value: u64) -> Value {
    i64::try_from(value).map_or_else(|_| Value::Text(value.to_string()), Value::Int)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientSettings;
    use crate::engine::types::ServerConfig;

    #[test]
    fn unsigned_bigint_beyond_i64_stays_exact() {
        assert_eq!(unsigned_value(42), Value::Int(42));
        assert_eq!(unsigned_value(i64::MAX as u64), Value::Int(i64::MAX));
        assert_eq!(unsigned_value(u64::MAX), Value::Text("18446744073709551615".into()));
    }

    fn adapter(kind: EngineKind) -> MySqlAdapter {
        let mut config = ServerConfig::new(kind.key());
        config.host = Some("localhost".into());
        MySqlAdapter::new(
            kind,
            AdapterContext {
                config,
                database: "shop".into(),
                settings: ClientSettings::default(),
            },
        )
    }

    #[test]
    fn detects_mariadb_banner() {
        let (name, version) = MySqlAdapter::parse_version("10.11.6-MariaDB-0+deb12u1");
        assert_eq!(name, "MariaDB");
        assert_eq!(version, "10.11.6");

        let (name, version) = MySqlAdapter::parse_version("8.0.36");
        assert_eq!(name, "MySQL");
        assert_eq!(version, "8.0.36");
    }

    #[test]
    fn quotes_with_backticks() {
        let adapter = adapter(EngineKind::Mysql);
        assert_eq!(
            adapter.get_query_select_top("order`s", 5, None),
            "SELECT * FROM `order``s` LIMIT 5"
        );
    }

    #[test]
    fn connect_options_use_session_database() {
        let options = adapter(EngineKind::Mariadb)
            .build_connect_options()
            .expect("options build");
        assert_eq!(options.get_database(), Some("shop"));
        assert_eq!(options.get_port(), 3306);
    }
}
