//! SQL Server Adapter
//!
//! Implements the Adapter trait for Microsoft SQL Server using Tiberius, with
//! bb8 for async connection pooling.
//!
//! ## SQL Server Specifics
//!
//! - Uses `[bracket]` identifier quoting and `SELECT TOP n` previews
//! - A batch without row-returning statements runs through `execute` and
//!   reports one aggregated result; otherwise every record set is a result
//! - Cancellation via `KILL <spid>` from another pooled connection

use std::sync::Arc;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use bb8_tiberius::ConnectionManager;
use futures::TryStreamExt;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, QueryItem, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::filters::{and_clause, build_database_filter, build_schema_filter, DatabaseFilter, SchemaFilter};
use crate::engine::identifier::wrap_identifier;
use crate::engine::query::{CancelableQuery, ExecutionTracker, QueryState};
use crate::engine::registry::AdapterContext;
use crate::engine::statements::{split_statements, IdentifiedStatement, SqlDialect, StatementKind};
use crate::engine::traits::Adapter;
use crate::engine::types::{
    AdapterVersion, CancelSupport, EngineKind, Field, QueryId, QueryRowResult, RoutineInfo,
    Row as QRow, TableColumn, TableInfo, TableKey, Value,
};

type MssqlPool = Pool<ConnectionManager>;
type MssqlClient = Client<Compat<TcpStream>>;

/// SQL Server adapter implementation
pub struct SqlServerAdapter {
    ctx: AdapterContext,
    pool: Option<MssqlPool>,
    version: AdapterVersion,
}

impl SqlServerAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            pool: None,
            version: AdapterVersion::unknown(),
        }
    }

    fn default_schema<'a>(&'a self, schema: Option<&'a str>) -> &'a str {
        schema
            .filter(|s| !s.is_empty())
            .or(self.ctx.config.schema.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("dbo")
    }

    /// Build a tiberius Config from the server config.
    fn build_config(&self) -> EngineResult<Config> {
        let config = &self.ctx.config;
        let host = config
            .effective_host()
            .ok_or_else(|| EngineError::invalid_config("Missing host"))?;

        if config.domain.as_deref().is_some_and(|d| !d.is_empty()) {
            return Err(EngineError::not_supported(
                "Windows domain authentication is not available for SQL Server",
            ));
        }

        let mut tib_config = Config::new();
        tib_config.host(host);
        tib_config.port(config.effective_port().unwrap_or(1433));
        tib_config.application_name("unidb");
        tib_config.authentication(AuthMethod::sql_server(
            config.user.as_deref().unwrap_or_default(),
            config.password.as_deref().unwrap_or_default(),
        ));
        if let Some(db) = config.database_or(&self.ctx.database) {
            tib_config.database(db);
        }

        match &config.ssl {
            Some(ssl) => {
                tib_config.encryption(EncryptionLevel::Required);
                match ssl.ca_path.as_deref() {
                    Some(ca) => tib_config.trust_cert_ca(ca),
                    None if !ssl.reject_unauthorized => tib_config.trust_cert(),
                    None => {}
                }
            }
            None => {
                tib_config.encryption(EncryptionLevel::NotSupported);
                tib_config.trust_cert();
            }
        }

        Ok(tib_config)
    }

    /// Create a raw tiberius Client (not pooled) used to validate the login.
    async fn connect_raw(tib_config: Config) -> EngineResult<MssqlClient> {
        let addr = tib_config.get_addr();
        let tcp = TcpStream::connect(&addr).await.map_err(|e| {
            EngineError::connection_failed(format!("Failed to connect to {} - {}", addr, e))
        })?;
        tcp.set_nodelay(true).ok();

        Client::connect(tib_config, tcp.compat_write())
            .await
            .map_err(|e| match e {
                tiberius::error::Error::Server(token) if token.code() == 18456 => {
                    EngineError::auth_failed(token.message().to_string())
                }
                other => EngineError::connection_failed(other.to_string()),
            })
    }

    async fn connection(&self) -> EngineResult<PooledConnection<'_, ConnectionManager>> {
        let pool = self.pool.as_ref().ok_or(EngineError::NoConnection)?;
        pool.get().await.map_err(|e| {
            EngineError::connection_failed(format!("Failed to acquire connection: {e}"))
        })
    }

    /// First result set of a parameterized query
    async fn fetch_rows(&self, sql: &str, binds: &[&str]) -> EngineResult<Vec<tiberius::Row>> {
        let params: Vec<&dyn ToSql> = binds.iter().map(|b| b as &dyn ToSql).collect();
        let mut conn = self.connection().await?;
        let stream = conn.query(sql, &params).await.map_err(classify_error)?;
        stream.into_first_result().await.map_err(classify_error)
    }

    async fn fetch_strings(&self, sql: &str, binds: &[&str]) -> EngineResult<Vec<String>> {
        Ok(self
            .fetch_rows(sql, binds)
            .await?
            .iter()
            .filter_map(|row| row_text(row, 0))
            .collect())
    }

    async fn list_relations(&self, sql: String) -> EngineResult<Vec<TableInfo>> {
        Ok(self
            .fetch_rows(&sql, &[])
            .await?
            .iter()
            .filter_map(|row| Some(TableInfo::new(row_text(row, 0), row_text(row, 1)?)))
            .collect())
    }

    /// Runs a batch on `client`.
    async fn run_batch(client: &mut MssqlClient, text: &str) -> EngineResult<Vec<QueryRowResult>> {
        let statements = split_statements(SqlDialect::MsSql, text);
        let first_command = statements.first().map_or(StatementKind::Unknown, |s| s.kind);

        if !may_return_rows(&statements) {
            let outcome = client.execute(text, &[]).await.map_err(classify_error)?;
            let mut result = QueryRowResult::empty(first_command);
            result.affected_rows = Some(outcome.total());
            return Ok(vec![result]);
        }

        let mut commands = statements
            .iter()
            .filter(|s| may_return_rows(std::slice::from_ref(*s)))
            .map(|s| s.kind);
        let mut stream = client.simple_query(text).await.map_err(classify_error)?;
        let mut results: Vec<QueryRowResult> = Vec::new();

        while let Some(item) = stream.try_next().await.map_err(classify_error)? {
            match item {
                QueryItem::Metadata(meta) => {
                    let mut result =
                        QueryRowResult::empty(commands.next().unwrap_or(StatementKind::Select));
                    result.fields = get_field_info(meta.columns());
                    result.row_count = Some(0);
                    results.push(result);
                }
                QueryItem::Row(row) => {
                    if let Some(current) = results.last_mut() {
                        current.rows.push(convert_row(&row));
                        current.row_count = Some(current.rows.len() as u64);
                    }
                }
            }
        }

        if results.is_empty() {
            results.push(QueryRowResult::empty(first_command));
        }
        Ok(results)
    }
}

/// Whether a batch has to be streamed to keep its result sets. Unclassified
/// statements (`EXEC`, `SET`, `DECLARE`, ...) may produce rows too.
fn may_return_rows(statements: &[IdentifiedStatement]) -> bool {
    statements
        .iter()
        .any(|s| s.kind.returns_rows() || s.kind == StatementKind::Unknown)
}

// ==================== Type Conversion ====================

fn row_text(row: &tiberius::Row, idx: usize) -> Option<String> {
    row.try_get::<&str, _>(idx).ok().flatten().map(str::to_string)
}

/// Convert a tiberius ColumnData to a Value.
fn convert_column_data(data: &ColumnData<'_>) -> Value {
    match data {
        ColumnData::Bit(Some(b)) => Value::Bool(*b),
        ColumnData::U8(Some(v)) => Value::Int(*v as i64),
        ColumnData::I16(Some(v)) => Value::Int(*v as i64),
        ColumnData::I32(Some(v)) => Value::Int(*v as i64),
        ColumnData::I64(Some(v)) => Value::Int(*v),
        ColumnData::F32(Some(v)) => Value::Float(*v as f64),
        ColumnData::F64(Some(v)) => Value::Float(*v),
        ColumnData::Numeric(Some(n)) => Value::Text(n.to_string()),
        ColumnData::String(Some(s)) => Value::Text(s.to_string()),
        ColumnData::Guid(Some(g)) => Value::Text(g.to_string()),
        ColumnData::Binary(Some(b)) => Value::Bytes(b.to_vec()),
        ColumnData::Xml(Some(xml)) => Value::Text(xml.to_string()),
        _ => Value::Null,
    }
}

/// Convert a tiberius Row, reading date/time cells through chrono.
fn convert_row(row: &tiberius::Row) -> QRow {
    let values: Vec<Value> = row
        .cells()
        .enumerate()
        .map(|(i, (_col, data))| match data {
            ColumnData::DateTime(Some(_))
            | ColumnData::SmallDateTime(Some(_))
            | ColumnData::DateTime2(Some(_)) => row
                .try_get::<chrono::NaiveDateTime, _>(i)
                .ok()
                .flatten()
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
            ColumnData::DateTimeOffset(Some(_)) => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                .ok()
                .flatten()
                .map(|dt| Value::Text(dt.to_rfc3339()))
                .unwrap_or(Value::Null),
            ColumnData::Date(Some(_)) => row
                .try_get::<chrono::NaiveDate, _>(i)
                .ok()
                .flatten()
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            ColumnData::Time(Some(_)) => row
                .try_get::<chrono::NaiveTime, _>(i)
                .ok()
                .flatten()
                .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
            _ => convert_column_data(data),
        })
        .collect();
    QRow { values }
}

fn get_field_info(columns: &[tiberius::Column]) -> Vec<Field> {
    columns
        .iter()
        .map(|col| Field {
            name: col.name().to_string(),
            data_type: Some(format!("{:?}", col.column_type())),
        })
        .collect()
}

/// Classify a SQL Server error into syntax or execution error.
fn classify_error(err: tiberius::error::Error) -> EngineError {
    match err {
        // 102: Incorrect syntax near ...
        tiberius::error::Error::Server(token) if token.code() == 102 => {
            EngineError::syntax_error(token.message().to_string())
        }
        tiberius::error::Error::Server(token) => {
            EngineError::execution_error_with_code(token.message().to_string(), token.code().to_string())
        }
        other => {
            let msg = other.to_string();
            if msg.to_lowercase().contains("syntax") {
                EngineError::syntax_error(msg)
            } else {
                EngineError::execution_error(msg)
            }
        }
    }
}

#[async_trait]
impl Adapter for SqlServerAdapter {
    #[instrument(
        skip(self),
        fields(database = %self.ctx.database, host = ?self.ctx.config.effective_host())
    )]
    async fn connect(&mut self) -> EngineResult<()> {
        let tib_config = self.build_config()?;

        let mut client = Self::connect_raw(tib_config.clone()).await?;
        let row = client
            .simple_query(
                "SELECT CAST(SERVERPROPERTY('productversion') AS NVARCHAR(128)), @@version",
            )
            .await
            .map_err(classify_error)?
            .into_row()
            .await
            .map_err(classify_error)?;
        let _ = client.close().await;

        let version = row.as_ref().and_then(|r| row_text(r, 0)).unwrap_or_else(|| "0.0.0".into());
        let banner = row.as_ref().and_then(|r| row_text(r, 1)).unwrap_or_default();

        let pool = Pool::builder()
            .max_size(self.ctx.settings.pool_max_connections.max(1))
            .connection_timeout(self.ctx.settings.acquire_timeout())
            .build(ConnectionManager::new(tib_config))
            .await
            .map_err(|e| {
                EngineError::connection_failed(format!("Failed to create connection pool: {e}"))
            })?;

        self.version = AdapterVersion::new("SQL Server", version, banner);
        self.pool = Some(pool);

        tracing::info!(version = %self.version.version, "Connected");
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        // bb8 closes idle connections once the last pool handle is dropped.
        Ok(())
    }

    fn version(&self) -> AdapterVersion {
        self.version.clone()
    }

    fn wrap_identifier(&self, name: &str) -> String {
        wrap_identifier(EngineKind::Sqlserver, name)
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::Driver
    }

    async fn list_databases(&self, filter: &DatabaseFilter) -> EngineResult<Vec<String>> {
        let sql = format!(
            "SELECT name FROM sys.databases WHERE 1 = 1{} ORDER BY name",
            and_clause(build_database_filter(filter, "name"))
        );
        self.fetch_strings(&sql, &[]).await
    }

    async fn list_schemas(&self, filter: &SchemaFilter) -> EngineResult<Vec<String>> {
        let sql = format!(
            "SELECT schema_name FROM INFORMATION_SCHEMA.SCHEMATA WHERE 1 = 1{} ORDER BY schema_name",
            and_clause(build_schema_filter(filter, "schema_name"))
        );
        self.fetch_strings(&sql, &[]).await
    }

    async fn list_tables(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        self.list_relations(format!(
            r#"
            SELECT table_schema, table_name
            FROM INFORMATION_SCHEMA.TABLES
            WHERE table_type NOT LIKE '%VIEW%'{}
            ORDER BY table_schema, table_name
            "#,
            and_clause(build_schema_filter(filter, "table_schema"))
        ))
        .await
    }

    async fn list_views(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        self.list_relations(format!(
            r#"
            SELECT table_schema, table_name
            FROM INFORMATION_SCHEMA.VIEWS
            WHERE 1 = 1{}
            ORDER BY table_schema, table_name
            "#,
            and_clause(build_schema_filter(filter, "table_schema"))
        ))
        .await
    }

    async fn list_routines(&self, filter: &SchemaFilter) -> EngineResult<Vec<RoutineInfo>> {
        let sql = format!(
            r#"
            SELECT routine_schema, routine_name, routine_type
            FROM INFORMATION_SCHEMA.ROUTINES
            WHERE 1 = 1{}
            ORDER BY routine_name
            "#,
            and_clause(build_schema_filter(filter, "routine_schema"))
        );
        Ok(self
            .fetch_rows(&sql, &[])
            .await?
            .iter()
            .filter_map(|row| {
                Some(RoutineInfo {
                    schema: row_text(row, 0),
                    routine_name: row_text(row, 1)?,
                    routine_type: row_text(row, 2).unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn list_table_columns(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableColumn>> {
        let rows = self
            .fetch_rows(
                r#"
                SELECT column_name,
                       CASE
                         WHEN character_maximum_length = -1 THEN data_type + '(max)'
                         WHEN character_maximum_length IS NOT NULL
                           THEN data_type + '(' + CAST(character_maximum_length AS VARCHAR(16)) + ')'
                         ELSE data_type
                       END,
                       is_nullable,
                       column_default
                FROM INFORMATION_SCHEMA.COLUMNS
                WHERE table_schema = @P1 AND table_name = @P2
                ORDER BY ordinal_position
                "#,
                &[self.default_schema(schema), table],
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(TableColumn {
                    column_name: row_text(row, 0)?,
                    data_type: row_text(row, 1).unwrap_or_default(),
                    nullable: row_text(row, 2).as_deref() == Some("YES"),
                    default_value: row_text(row, 3),
                })
            })
            .collect())
    }

    async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT tr.name
            FROM sys.triggers tr
            JOIN sys.tables t ON tr.parent_id = t.object_id
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.name = @P2
            ORDER BY tr.name
            "#,
            &[self.default_schema(schema), table],
        )
        .await
    }

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT i.name
            FROM sys.indexes i
            JOIN sys.tables t ON i.object_id = t.object_id
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.name = @P2 AND i.name IS NOT NULL
            ORDER BY i.name
            "#,
            &[self.default_schema(schema), table],
        )
        .await
    }

    async fn get_table_references(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.fetch_strings(
            r#"
            SELECT DISTINCT OBJECT_NAME(fk.referenced_object_id)
            FROM sys.foreign_keys fk
            JOIN sys.tables t ON fk.parent_object_id = t.object_id
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.name = @P2
            "#,
            &[self.default_schema(schema), table],
        )
        .await
    }

    async fn get_table_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        let rows = self
            .fetch_rows(
                r#"
                SELECT tc.constraint_name,
                       kcu.column_name,
                       CASE WHEN tc.constraint_type = 'FOREIGN KEY'
                            THEN OBJECT_NAME(fk.referenced_object_id) END,
                       tc.constraint_type
                FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                  ON kcu.constraint_name = tc.constraint_name
                 AND kcu.table_schema = tc.table_schema
                LEFT JOIN sys.foreign_keys fk
                  ON fk.name = tc.constraint_name
                WHERE tc.table_schema = @P1
                  AND tc.table_name = @P2
                  AND tc.constraint_type IN ('PRIMARY KEY', 'FOREIGN KEY')
                ORDER BY kcu.ordinal_position
                "#,
                &[self.default_schema(schema), table],
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(TableKey {
                    constraint_name: row_text(row, 0),
                    column_name: row_text(row, 1)?,
                    referenced_table: row_text(row, 2),
                    key_type: row_text(row, 3).unwrap_or_default(),
                })
            })
            .collect())
    }

    fn get_query_select_top(&self, table: &str, limit: u32, schema: Option<&str>) -> String {
        format!("SELECT TOP {} * FROM {}", limit, self.qualified_name(table, schema))
    }

    async fn get_table_create_script(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let schema = self.default_schema(schema);
        let columns = self.list_table_columns(table, Some(schema)).await?;
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let mut definitions: Vec<String> = columns
            .iter()
            .map(|col| {
                format!(
                    "  {} {}{}",
                    self.wrap_identifier(&col.column_name),
                    col.data_type,
                    if col.nullable { " NULL" } else { " NOT NULL" }
                )
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
            "CREATE TABLE {} (\n{}\n)",
            self.qualified_name(table, Some(schema)),
            definitions.join(",\n")
        )])
    }

    async fn get_view_create_script(&self, view: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let qualified = self.qualified_name(view, Some(self.default_schema(schema)));
        self.fetch_strings("SELECT OBJECT_DEFINITION(OBJECT_ID(@P1))", &[&qualified])
            .await
    }

    async fn get_routine_create_script(
        &self,
        routine: &str,
        _routine_type: &str,
        schema: Option<&str>,
    ) -> EngineResult<Vec<String>> {
        let qualified = self.qualified_name(routine, Some(self.default_schema(schema)));
        self.fetch_strings("SELECT OBJECT_DEFINITION(OBJECT_ID(@P1))", &[&qualified])
            .await
    }

    async fn truncate_all_tables(&self, schema: Option<&str>) -> EngineResult<()> {
        let schema = self.default_schema(schema);
        let tables = self
            .fetch_strings(
                r#"
                SELECT table_name
                FROM INFORMATION_SCHEMA.TABLES
                WHERE table_schema = @P1 AND table_type = 'BASE TABLE'
                "#,
                &[schema],
            )
            .await?;
        if tables.is_empty() {
            return Ok(());
        }

        let script: String = tables
            .iter()
            .map(|table| format!("TRUNCATE TABLE {};", self.qualified_name(table, Some(schema))))
            .collect::<Vec<_>>()
            .join("\n");

        let mut conn = self.connection().await?;
        conn.simple_query(script)
            .await
            .map_err(classify_error)?
            .into_results()
            .await
            .map_err(classify_error)?;
        tracing::info!(schema, tables = tables.len(), "Truncated all tables");
        Ok(())
    }

    fn query(&self, text: &str) -> EngineResult<Arc<dyn CancelableQuery>> {
        let pool = self.pool.as_ref().ok_or(EngineError::NoConnection)?;
        Ok(Arc::new(SqlServerQuery {
            pool: pool.clone(),
            text: text.to_string(),
            tracker: ExecutionTracker::new(),
        }))
    }

    async fn execute_query(&self, text: &str) -> EngineResult<Vec<QueryRowResult>> {
        let mut conn = self.connection().await?;
        Self::run_batch(&mut conn, text).await
    }
}

/// Cancellable query bound to one server process id
pub struct SqlServerQuery {
    pool: MssqlPool,
    text: String,
    tracker: ExecutionTracker<i16>,
}

#[async_trait]
impl CancelableQuery for SqlServerQuery {
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
            let mut conn = self.pool.get().await.map_err(|e| {
                EngineError::connection_failed(format!("Failed to acquire connection: {e}"))
            })?;
            let spid = conn
                .simple_query("SELECT @@SPID")
                .await
                .map_err(classify_error)?
                .into_row()
                .await
                .map_err(classify_error)?
                .and_then(|row| row.try_get::<i16, _>(0).ok().flatten())
                .ok_or_else(|| EngineError::internal("Server did not report a SPID"))?;
            self.tracker.record(spid);

            self.tracker
                .race(SqlServerAdapter::run_batch(&mut conn, &self.text))
                .await
        }
        .await;

        self.tracker.finish(result)
    }

    async fn cancel(&self) -> EngineResult<()> {
        let pool = self.pool.clone();
        self.tracker
            .cancel(|spid| async move {
                let mut conn = pool.get().await.map_err(|e| {
                    EngineError::connection_failed(format!("Failed to acquire connection: {e}"))
                })?;
                conn.simple_query(format!("KILL {}", spid))
                    .await
                    .map_err(classify_error)?
                    .into_results()
                    .await
                    .map_err(classify_error)?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientSettings;
    use crate::engine::types::ServerConfig;

    #[test]
    fn procedure_batches_are_streamed() {
        let streamed = |sql: &str| may_return_rows(&split_statements(SqlDialect::MsSql, sql));
        assert!(streamed("EXEC sp_who"));
        assert!(streamed("SET NOCOUNT ON; EXECUTE dbo.report @year = 2024"));
        assert!(streamed("INSERT INTO t VALUES (1); SELECT * FROM t"));
        assert!(!streamed("INSERT INTO t VALUES (1); UPDATE t SET v = 2"));
        assert!(!streamed("CREATE TABLE t (v INT)"));
    }

    fn adapter(config: ServerConfig) -> SqlServerAdapter {
        SqlServerAdapter::new(AdapterContext {
            config,
            database: "master".into(),
            settings: ClientSettings::default(),
        })
    }

    fn config() -> ServerConfig {
        let mut config = ServerConfig::new("sqlserver");
        config.host = Some("localhost".into());
        config.user = Some("sa".into());
        config.password = Some("Secret123!".into());
        config
    }

    #[test]
    fn select_top_uses_brackets() {
        let adapter = adapter(config());
        assert_eq!(
            adapter.get_query_select_top("my]table", 10, Some("dbo")),
            "SELECT TOP 10 * FROM [dbo].[my]]table]"
        );
    }

    #[test]
    fn build_config_targets_tunnel_endpoint() {
        let mut config = config();
        config.local_host = Some("127.0.0.1".into());
        config.local_port = Some(41433);

        let tib_config = adapter(config).build_config().expect("config builds");
        assert_eq!(tib_config.get_addr(), "127.0.0.1:41433");
    }

    #[test]
    fn domain_auth_is_rejected() {
        let mut config = config();
        config.domain = Some("CORP".into());

        let err = adapter(config).build_config().expect_err("domain unsupported");
        assert!(matches!(err, EngineError::NotSupported { .. }));
    }

    #[test]
    fn converts_plain_cells() {
        assert_eq!(convert_column_data(&ColumnData::I32(Some(7))), Value::Int(7));
        assert_eq!(convert_column_data(&ColumnData::Bit(Some(true))), Value::Bool(true));
        assert_eq!(convert_column_data(&ColumnData::I64(None)), Value::Null);
    }

    #[test]
    fn query_requires_connection() {
        let err = adapter(config()).query("SELECT 1").err().expect("no pool yet");
        assert!(matches!(err, EngineError::NoConnection));
    }
}
