//! Adapter trait definition
//!
//! This is the core abstraction that every database engine implements. It
//! provides a unified interface for connecting, introspecting schemas, running
//! queries and generating scripts across relational, embedded and wide-column
//! engines.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::filters::{DatabaseFilter, SchemaFilter};
use crate::engine::query::CancelableQuery;
use crate::engine::types::{
    AdapterVersion, CancelSupport, QueryRowResult, RoutineInfo, TableColumn, TableInfo, TableKey,
};

/// Core trait that all engine adapters implement
///
/// An adapter is created for one `DatabaseSession` and bound to one database.
/// Listing and script capabilities default to empty results so that engines
/// without a given concept still answer; callers must tolerate both.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Opens the pool (or validates the file/cluster) and fills `version()`.
    async fn connect(&mut self) -> EngineResult<()>;

    /// Releases every driver resource held by the adapter
    async fn disconnect(&self) -> EngineResult<()>;

    /// Server version, `UNKNOWN / 0.0.0` until `connect()` succeeded
    fn version(&self) -> AdapterVersion;

    /// Quotes an identifier for this engine
    fn wrap_identifier(&self, name: &str) -> String;

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::None
    }

    // ==================== Introspection ====================

    async fn list_databases(&self, filter: &DatabaseFilter) -> EngineResult<Vec<String>> {
        let _ = filter;
        Ok(Vec::new())
    }

    async fn list_schemas(&self, filter: &SchemaFilter) -> EngineResult<Vec<String>> {
        let _ = filter;
        Ok(Vec::new())
    }

    async fn list_tables(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let _ = filter;
        Ok(Vec::new())
    }

    async fn list_views(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let _ = filter;
        Ok(Vec::new())
    }

    async fn list_materialized_views(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        let _ = filter;
        Ok(Vec::new())
    }

    async fn list_routines(&self, filter: &SchemaFilter) -> EngineResult<Vec<RoutineInfo>> {
        let _ = filter;
        Ok(Vec::new())
    }

    async fn list_table_columns(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> EngineResult<Vec<TableColumn>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    /// Tables referenced by foreign keys of `table`
    async fn get_table_references(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    async fn get_table_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    // ==================== Scripts ====================

    /// `SELECT * ... LIMIT n` for a table preview
    fn get_query_select_top(&self, table: &str, limit: u32, schema: Option<&str>) -> String {
        format!(
            "SELECT * FROM {} LIMIT {}",
            self.qualified_name(table, schema),
            limit
        )
    }

    async fn get_table_create_script(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    async fn get_view_create_script(&self, view: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let _ = (view, schema);
        Ok(Vec::new())
    }

    async fn get_routine_create_script(
        &self,
        routine: &str,
        routine_type: &str,
        schema: Option<&str>,
    ) -> EngineResult<Vec<String>> {
        let _ = (routine, routine_type, schema);
        Ok(Vec::new())
    }

    /// Empties every table of `schema`. A no-op where unsupported.
    async fn truncate_all_tables(&self, schema: Option<&str>) -> EngineResult<()> {
        let _ = schema;
        Ok(())
    }

    // ==================== Queries ====================

    /// Returns a cancellable handle; nothing runs until `execute()`.
    fn query(&self, text: &str) -> EngineResult<Arc<dyn CancelableQuery>> {
        let _ = text;
        Err(EngineError::not_supported(
            "Query cancellation is not supported by this adapter",
        ))
    }

    /// Runs `text` to completion without a cancellation path.
    async fn execute_query(&self, text: &str) -> EngineResult<Vec<QueryRowResult>>;

    /// `schema.table` with both parts quoted, or just the quoted table.
    fn qualified_name(&self, table: &str, schema: Option<&str>) -> String {
        match schema.filter(|s| !s.is_empty()) {
            Some(schema) => format!(
                "{}.{}",
                self.wrap_identifier(schema),
                self.wrap_identifier(table)
            ),
            None => self.wrap_identifier(table),
        }
    }
}
