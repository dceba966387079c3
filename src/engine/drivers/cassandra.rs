//! Cassandra Adapter
//!
//! Implements the Adapter trait for Apache Cassandra (and ScyllaDB) using the
//! scylla CQL driver. Keyspaces play the role of databases; there are no
//! schemas, routines or cancellable queries.

use std::time::Duration;

use async_trait::async_trait;
use scylla::frame::response::result::CqlValue;
use scylla::transport::errors::{DbError, NewSessionError, QueryError};
use scylla::{Session, SessionBuilder};
use tracing::instrument;

use crate::engine::drivers::require_connection;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::filters::{DatabaseFilter, SchemaFilter};
use crate::engine::identifier::wrap_identifier;
use crate::engine::registry::AdapterContext;
use crate::engine::statements::{identify, SqlDialect};
use crate::engine::traits::Adapter;
use crate::engine::types::{
    AdapterVersion, EngineKind, Field, QueryRowResult, Row as QRow, TableColumn, TableInfo,
    TableKey, Value,
};

/// Cassandra adapter implementation
pub struct CassandraAdapter {
    ctx: AdapterContext,
    session: Option<Session>,
    version: AdapterVersion,
}

impl CassandraAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            session: None,
            version: AdapterVersion::unknown(),
        }
    }

    fn session(&self) -> EngineResult<&Session> {
        require_connection(self.session.as_ref())
    }

    fn keyspace(&self) -> Option<String> {
        self.ctx
            .config
            .database_or(&self.ctx.database)
            .map(str::to_string)
    }

    fn contact_point(&self) -> EngineResult<String> {
        let host = self
            .ctx
            .config
            .effective_host()
            .ok_or_else(|| EngineError::invalid_config("Missing host"))?;
        let port = self.ctx.config.effective_port().unwrap_or(9042);
        Ok(format!("{}:{}", host, port))
    }

    async fn run(&self, cql: &str, values: Vec<String>) -> EngineResult<scylla::QueryResult> {
        self.session()?
            .query(cql, values)
            .await
            .map_err(classify_error)
    }

    /// Text cells of the given columns, one vector per row
    async fn fetch_text(&self, cql: &str, values: Vec<String>) -> EngineResult<Vec<Vec<Option<String>>>> {
        let result = self.run(cql, values).await?;
        Ok(result
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                row.columns
                    .into_iter()
                    .map(|cell| cell.and_then(CqlValue::into_string))
                    .collect()
            })
            .collect())
    }

    async fn fetch_strings(&self, cql: &str, values: Vec<String>) -> EngineResult<Vec<String>> {
        Ok(self
            .fetch_text(cql, values)
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    async fn list_table_columns_with_kind(&self, table: &str) -> EngineResult<Vec<(String, String)>> {
        let Some(keyspace) = self.keyspace() else {
            return Ok(Vec::new());
        };
        let rows = self
            .fetch_text(
                "SELECT column_name, kind FROM system_schema.columns WHERE keyspace_name = ? AND table_name = ?",
                vec![keyspace, table.to_string()],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let mut cells = row.into_iter();
                Some((cells.next().flatten()?, cells.next().flatten().unwrap_or_default()))
            })
            .collect())
    }
}

fn classify_error(err: QueryError) -> EngineError {
    match err {
        QueryError::DbError(DbError::SyntaxError, message) => EngineError::syntax_error(message),
        QueryError::DbError(code, message) => {
            EngineError::execution_error_with_code(message, format!("{:?}", code))
        }
        other => EngineError::execution_error(other.to_string()),
    }
}

fn classify_connect_error(err: NewSessionError) -> EngineError {
    match err {
        NewSessionError::DbError(DbError::AuthenticationError, message) => {
            EngineError::auth_failed(message)
        }
        other => EngineError::connection_failed(other.to_string()),
    }
}

fn convert_value(value: CqlValue) -> Value {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => Value::Text(s),
        CqlValue::Boolean(b) => Value::Bool(b),
        CqlValue::TinyInt(i) => Value::Int(i as i64),
        CqlValue::SmallInt(i) => Value::Int(i as i64),
        CqlValue::Int(i) => Value::Int(i as i64),
        CqlValue::BigInt(i) => Value::Int(i),
        CqlValue::Counter(c) => Value::Int(c.0),
        CqlValue::Float(f) => Value::Float(f as f64),
        CqlValue::Double(f) => Value::Float(f),
        CqlValue::Blob(bytes) => Value::Bytes(bytes),
        CqlValue::Uuid(uuid) => Value::Text(uuid.to_string()),
        CqlValue::Inet(addr) => Value::Text(addr.to_string()),
        CqlValue::Timestamp(ts) => chrono::DateTime::from_timestamp_millis(ts.0)
            .map(|dt| Value::Text(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
        CqlValue::List(items) | CqlValue::Set(items) => {
            Value::Array(items.into_iter().map(convert_value).collect())
        }
        CqlValue::Empty => Value::Null,
        other => Value::Text(format!("{:?}", other)),
    }
}

#[async_trait]
impl Adapter for CassandraAdapter {
    #[instrument(skip(self), fields(database = %self.ctx.database, host = ?self.ctx.config.effective_host()))]
    async fn connect(&mut self) -> EngineResult<()> {
        let mut builder = SessionBuilder::new()
            .known_node(self.contact_point()?)
            .connection_timeout(Duration::from_secs(self.ctx.settings.pool_acquire_timeout_secs.max(1)));

        if let Some(user) = self.ctx.config.user.as_deref() {
            builder = builder.user(user, self.ctx.config.password.as_deref().unwrap_or_default());
        }
        if let Some(keyspace) = self.keyspace() {
            builder = builder.use_keyspace(keyspace, true);
        }

        let session = builder.build().await.map_err(classify_connect_error)?;
        self.session = Some(session);

        let release = self
            .fetch_strings("SELECT release_version FROM system.local", Vec::new())
            .await?
            .into_iter()
            .next()
            .unwrap_or_else(|| "0.0.0".to_string());
        self.version = AdapterVersion::new("Cassandra", release.clone(), format!("Cassandra {}", release));

        tracing::info!(version = %release, "Connected");
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        // The scylla session closes its connections when dropped.
        Ok(())
    }

    fn version(&self) -> AdapterVersion {
        self.version.clone()
    }

    fn wrap_identifier(&self, name: &str) -> String {
        wrap_identifier(EngineKind::Cassandra, name)
    }

    /// Keyspaces, filtered client side.
    async fn list_databases(&self, filter: &DatabaseFilter) -> EngineResult<Vec<String>> {
        let mut keyspaces = self
            .fetch_strings("SELECT keyspace_name FROM system_schema.keyspaces", Vec::new())
            .await?;
        keyspaces.retain(|name| filter.matches(name));
        keyspaces.sort();
        Ok(keyspaces)
    }

    async fn list_tables(&self, _filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let Some(keyspace) = self.keyspace() else {
            return Ok(Vec::new());
        };
        let mut names = self
            .fetch_strings(
                "SELECT table_name FROM system_schema.tables WHERE keyspace_name = ?",
                vec![keyspace],
            )
            .await?;
        names.sort();
        Ok(names.into_iter().map(|name| TableInfo::new(None, name)).collect())
    }

    async fn list_views(&self, _filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let Some(keyspace) = self.keyspace() else {
            return Ok(Vec::new());
        };
        let mut names = self
            .fetch_strings(
                "SELECT view_name FROM system_schema.views WHERE keyspace_name = ?",
                vec![keyspace],
            )
            .await?;
        names.sort();
        Ok(names.into_iter().map(|name| TableInfo::new(None, name)).collect())
    }

    async fn list_table_columns(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableColumn>> {
        let Some(keyspace) = self.keyspace() else {
            return Ok(Vec::new());
        };
        let rows = self
            .fetch_text(
                "SELECT column_name, type, kind FROM system_schema.columns WHERE keyspace_name = ? AND table_name = ?",
                vec![keyspace, table.to_string()],
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let mut cells = row.into_iter();
                let column_name = cells.next().flatten()?;
                let data_type = cells.next().flatten().unwrap_or_default();
                let kind = cells.next().flatten().unwrap_or_default();
                Some(TableColumn {
                    column_name,
                    data_type,
                    nullable: kind == "regular" || kind == "static",
                    default_value: None,
                })
            })
            .collect())
    }

    async fn list_table_triggers(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        let Some(keyspace) = self.keyspace() else {
            return Ok(Vec::new());
        };
        self.fetch_strings(
            "SELECT trigger_name FROM system_schema.triggers WHERE keyspace_name = ? AND table_name = ?",
            vec![keyspace, table.to_string()],
        )
        .await
    }

    async fn list_table_indexes(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<String>> {
        let Some(keyspace) = self.keyspace() else {
            return Ok(Vec::new());
        };
        self.fetch_strings(
            "SELECT index_name FROM system_schema.indexes WHERE keyspace_name = ? AND table_name = ?",
            vec![keyspace, table.to_string()],
        )
        .await
    }

    /// Partition key columns, reported as the primary key
    async fn get_table_keys(&self, table: &str, _schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        Ok(self
            .list_table_columns_with_kind(table)
            .await?
            .into_iter()
            .filter(|(_, kind)| kind == "partition_key")
            .map(|(column_name, _)| TableKey {
                constraint_name: None,
                column_name,
                referenced_table: None,
                key_type: "PRIMARY KEY".to_string(),
            })
            .collect())
    }

    async fn truncate_all_tables(&self, _schema: Option<&str>) -> EngineResult<()> {
        let Some(keyspace) = self.keyspace() else {
            return Ok(());
        };
        let tables = self.list_tables(&SchemaFilter::default()).await?;
        for table in &tables {
            let cql = format!("TRUNCATE {}", self.qualified_name(&table.name, Some(&keyspace)));
            self.run(&cql, Vec::new()).await?;
        }
        tracing::info!(keyspace = %keyspace, tables = tables.len(), "Truncated all tables");
        Ok(())
    }

    /// Runs one CQL statement and reports a single result.
    async fn execute_query(&self, text: &str) -> EngineResult<Vec<QueryRowResult>> {
        let result = self.run(text, Vec::new()).await?;

        let mut output = QueryRowResult::empty(identify(SqlDialect::Generic, text));
        output.fields = result
            .col_specs
            .iter()
            .map(|spec| Field {
                name: spec.name.clone(),
                data_type: Some(format!("{:?}", spec.typ)),
            })
            .collect();
        if let Some(rows) = result.rows {
            output.rows = rows
                .into_iter()
                .map(|row| QRow {
                    values: row
                        .columns
                        .into_iter()
                        .map(|cell| cell.map(convert_value).unwrap_or(Value::Null))
                        .collect(),
                })
                .collect();
            output.row_count = Some(output.rows.len() as u64);
        }

        Ok(vec![output])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientSettings;
    use crate::engine::types::{CancelSupport, ServerConfig};

    fn adapter() -> CassandraAdapter {
        let mut config = ServerConfig::new("cassandra");
        config.host = Some("cassandra.local".into());
        config.database = Some("shop".into());
        CassandraAdapter::new(AdapterContext {
            config,
            database: String::new(),
            settings: ClientSettings::default(),
        })
    }

    #[test]
    fn contact_point_defaults_to_native_port() {
        let adapter = adapter();
        assert_eq!(adapter.contact_point().expect("host set"), "cassandra.local:9042");
        assert_eq!(adapter.keyspace().as_deref(), Some("shop"));
    }

    #[test]
    fn cancellation_is_unsupported() {
        let adapter = adapter();
        assert_eq!(adapter.cancel_support(), CancelSupport::None);
        let err = adapter.query("SELECT * FROM t").err().expect("no handle");
        assert!(matches!(err, EngineError::NotSupported { .. }));
    }

    #[test]
    fn converts_collections() {
        let value = convert_value(CqlValue::List(vec![CqlValue::Int(1), CqlValue::Text("a".into())]));
        assert_eq!(value, Value::Array(vec![Value::Int(1), Value::Text("a".into())]));
    }

    #[tokio::test]
    async fn execute_requires_connection() {
        let err = adapter().execute_query("SELECT now() FROM system.local").await.expect_err("not connected");
        assert!(matches!(err, EngineError::NoConnection));
    }
}
