//! Database Session
//!
//! Connection lifecycle of one database of a [`ServerSession`]. A session is
//! `Idle` until `connect()` succeeds, `Connecting` while the adapter (and the
//! server's SSH tunnel, if any) comes up, and `Connected` afterwards. Every
//! other operation is delegated to the active adapter.
//!
//! [`ServerSession`]: crate::engine::server_session::ServerSession

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::instrument;

use crate::config::resolve_select_limit;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::filters::{DatabaseFilter, SchemaFilter};
use crate::engine::query::CancelableQuery;
use crate::engine::registry::AdapterContext;
use crate::engine::scripts;
use crate::engine::server_session::ServerShared;
use crate::engine::traits::Adapter;
use crate::engine::types::{
    AdapterVersion, CancelSupport, QueryRowResult, RoutineInfo, TableColumn, TableInfo, TableKey,
};

#[derive(Default)]
struct ConnState {
    connecting: bool,
    adapter: Option<Arc<dyn Adapter>>,
    /// Bumped by every connect and disconnect; a connect only publishes its
    /// adapter if nothing else happened in between.
    epoch: u64,
}

pub(crate) struct DatabaseInner {
    server: Weak<ServerShared>,
    database: String,
    state: Mutex<ConnState>,
}

/// Handle to one database of a server. Cheap to clone.
#[derive(Clone)]
pub struct DatabaseSession {
    inner: Arc<DatabaseInner>,
}

/// Clears `connecting` however `connect()` ends, including when the caller
/// drops the future.
struct ConnectingGuard<'a> {
    state: &'a Mutex<ConnState>,
    epoch: u64,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.epoch == self.epoch {
            state.connecting = false;
        }
    }
}

impl DatabaseSession {
    pub(crate) fn new(server: Weak<ServerShared>, database: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                server,
                database: database.into(),
                state: Mutex::new(ConnState::default()),
            }),
        }
    }

    /// Database this session is bound to; empty when none was selected.
    pub fn database_name(&self) -> &str {
        &self.inner.database
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.state.lock().connecting
    }

    pub fn is_connected(&self) -> bool {
        let state = self.inner.state.lock();
        state.adapter.is_some() && !state.connecting
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn server(&self) -> EngineResult<Arc<ServerShared>> {
        self.inner
            .server
            .upgrade()
            .ok_or_else(|| EngineError::connection_failed("Server session has ended"))
    }

    /// The active adapter, or `NoConnection`.
    fn adapter(&self) -> EngineResult<Arc<dyn Adapter>> {
        let state = self.inner.state.lock();
        match &state.adapter {
            Some(adapter) if !state.connecting => Ok(adapter.clone()),
            _ => Err(EngineError::NoConnection),
        }
    }

    // ==================== Lifecycle ====================

    #[instrument(skip(self), fields(database = %self.inner.database))]
    pub async fn connect(&self) -> EngineResult<()> {
        let (epoch, stale) = {
            let mut state = self.inner.state.lock();
            if state.connecting {
                return Err(EngineError::ConnectInProgress);
            }
            state.connecting = true;
            state.epoch += 1;
            (state.epoch, state.adapter.take())
        };
        let _guard = ConnectingGuard {
            state: &self.inner.state,
            epoch,
        };

        if let Some(stale) = stale {
            tokio::spawn(async move {
                if let Err(err) = stale.disconnect().await {
                    tracing::debug!(error = %err, "Stale adapter disconnect failed");
                }
            });
        }

        let adapter = match self.establish().await {
            Ok(adapter) => adapter,
            Err(err) => {
                tracing::warn!(error = %err, "Connect failed");
                self.disconnect().await;
                return Err(err);
            }
        };

        let published = {
            let mut state = self.inner.state.lock();
            if state.epoch == epoch {
                state.adapter = Some(adapter.clone());
                state.connecting = false;
                true
            } else {
                false
            }
        };

        if !published {
            tracing::info!("Disconnected while connecting, discarding adapter");
            if let Err(err) = adapter.disconnect().await {
                tracing::debug!(error = %err, "Late adapter disconnect failed");
            }
            return Err(EngineError::NoConnection);
        }

        let version = adapter.version();
        tracing::info!(engine = %version.name, version = %version.version, "Connected");
        Ok(())
    }

    /// Builds the adapter and brings it up together with the server tunnel.
    async fn establish(&self) -> EngineResult<Arc<dyn Adapter>> {
        let server = self.server()?;
        let tunnel = server.ensure_tunnel().await?;

        let ctx = AdapterContext {
            config: server.config_snapshot(),
            database: self.inner.database.clone(),
            settings: server.settings.clone(),
        };
        let mut adapter = server.registry.create(ctx)?;

        let result = match tunnel {
            Some(tunnel) => {
                let ready = tunnel.wait_ready();
                tokio::try_join!(adapter.connect(), ready).map(|_| ())
            }
            None => adapter.connect().await,
        };

        if let Err(err) = result {
            let _ = adapter.disconnect().await;
            return Err(err);
        }
        Ok(Arc::from(adapter))
    }

    /// Drops the adapter and leaves the server's registry. Safe to call in
    /// any state.
    #[instrument(skip(self), fields(database = %self.inner.database))]
    pub async fn disconnect(&self) {
        let adapter = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.connecting = false;
            state.adapter.take()
        };

        if let Some(adapter) = adapter {
            if let Err(err) = adapter.disconnect().await {
                tracing::warn!(error = %err, "Adapter disconnect failed");
            }
            tracing::info!("Disconnected");
        }

        if let Some(server) = self.inner.server.upgrade() {
            server.remove_database(self);
        }
    }

    // ==================== Introspection ====================

    pub fn get_version(&self) -> EngineResult<AdapterVersion> {
        Ok(self.adapter()?.version())
    }

    pub fn wrap_identifier(&self, name: &str) -> EngineResult<String> {
        Ok(self.adapter()?.wrap_identifier(name))
    }

    pub fn cancel_support(&self) -> EngineResult<CancelSupport> {
        Ok(self.adapter()?.cancel_support())
    }

    pub async fn list_databases(&self, filter: &DatabaseFilter) -> EngineResult<Vec<String>> {
        self.adapter()?.list_databases(filter).await
    }

    pub async fn list_schemas(&self, filter: &SchemaFilter) -> EngineResult<Vec<String>> {
        self.adapter()?.list_schemas(filter).await
    }

    pub async fn list_tables(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        self.adapter()?.list_tables(filter).await
    }

    pub async fn list_views(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        self.adapter()?.list_views(filter).await
    }

    pub async fn list_materialized_views(&self, filter: &SchemaFilter) -> EngineResult<Vec<TableInfo>> {
        self.adapter()?.list_materialized_views(filter).await
    }

    pub async fn list_routines(&self, filter: &SchemaFilter) -> EngineResult<Vec<RoutineInfo>> {
        self.adapter()?.list_routines(filter).await
    }

    pub async fn list_table_columns(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> EngineResult<Vec<TableColumn>> {
        self.adapter()?.list_table_columns(table, schema).await
    }

    pub async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.adapter()?.list_table_triggers(table, schema).await
    }

    pub async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.adapter()?.list_table_indexes(table, schema).await
    }

    pub async fn get_table_references(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.adapter()?.get_table_references(table, schema).await
    }

    pub async fn get_table_keys(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<TableKey>> {
        self.adapter()?.get_table_keys(table, schema).await
    }

    // ==================== Scripts ====================

    /// Preview query for `table`. `limit` wins over the process-wide
    /// override, which wins over the configured `select_limit`.
    pub fn get_query_select_top(
        &self,
        table: &str,
        schema: Option<&str>,
        limit: Option<u32>,
    ) -> EngineResult<String> {
        let adapter = self.adapter()?;
        let server = self.server()?;
        let limit = resolve_select_limit(limit, &server.settings);
        Ok(adapter.get_query_select_top(table, limit, schema))
    }

    pub async fn get_table_create_script(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.adapter()?.get_table_create_script(table, schema).await
    }

    pub async fn get_view_create_script(&self, view: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        self.adapter()?.get_view_create_script(view, schema).await
    }

    pub async fn get_routine_create_script(
        &self,
        routine: &str,
        routine_type: &str,
        schema: Option<&str>,
    ) -> EngineResult<Vec<String>> {
        self.adapter()?
            .get_routine_create_script(routine, routine_type, schema)
            .await
    }

    pub async fn get_table_select_script(&self, table: &str, schema: Option<&str>) -> EngineResult<String> {
        let adapter = self.adapter()?;
        let columns = adapter.list_table_columns(table, schema).await?;
        Ok(scripts::select_script(
            |name| adapter.wrap_identifier(name),
            table,
            schema,
            &columns,
        ))
    }

    pub async fn get_table_insert_script(&self, table: &str, schema: Option<&str>) -> EngineResult<String> {
        let adapter = self.adapter()?;
        let columns = adapter.list_table_columns(table, schema).await?;
        Ok(scripts::insert_script(
            |name| adapter.wrap_identifier(name),
            table,
            schema,
            &columns,
        ))
    }

    pub async fn get_table_update_script(&self, table: &str, schema: Option<&str>) -> EngineResult<String> {
        let adapter = self.adapter()?;
        let columns = adapter.list_table_columns(table, schema).await?;
        Ok(scripts::update_script(
            |name| adapter.wrap_identifier(name),
            table,
            schema,
            &columns,
        ))
    }

    pub fn get_table_delete_script(&self, table: &str, schema: Option<&str>) -> EngineResult<String> {
        let adapter = self.adapter()?;
        Ok(scripts::delete_script(
            |name| adapter.wrap_identifier(name),
            table,
            schema,
        ))
    }

    #[instrument(skip(self), fields(database = %self.inner.database))]
    pub async fn truncate_all_tables(&self, schema: Option<&str>) -> EngineResult<()> {
        self.adapter()?.truncate_all_tables(schema).await
    }

    // ==================== Queries ====================

    /// Cancellable handle for `text`; nothing runs until `execute()`.
    pub fn query(&self, text: &str) -> EngineResult<Arc<dyn CancelableQuery>> {
        self.adapter()?.query(text)
    }

    #[instrument(skip(self, text), fields(database = %self.inner.database, len = text.len()))]
    pub async fn execute_query(&self, text: &str) -> EngineResult<Vec<QueryRowResult>> {
        self.adapter()?.execute_query(text).await
    }
}
