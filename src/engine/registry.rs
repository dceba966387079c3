//! Adapter Registry
//!
//! Central registry for every engine adapter, keyed by the `client`
//! identifier of `ServerConfig`. Built-in engines are pre-registered by
//! [`AdapterRegistry::with_builtin_adapters`]; third-party adapters can be
//! added with [`AdapterRegistry::register`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::config::ClientSettings;
use crate::engine::drivers::{
    cassandra::CassandraAdapter, mysql::MySqlAdapter, postgres::PostgresAdapter,
    sqlite::SqliteAdapter, sqlserver::SqlServerAdapter,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::Adapter;
use crate::engine::types::{EngineKind, ServerConfig};

/// Everything an adapter needs to be built for one database
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// Snapshot of the server config, tunnel endpoint included
    pub config: ServerConfig,
    /// Database the session is bound to; empty when none was selected
    pub database: String,
    pub settings: ClientSettings,
}

pub type AdapterConstructor =
    Arc<dyn Fn(AdapterContext) -> EngineResult<Box<dyn Adapter>> + Send + Sync>;

#[derive(Clone)]
struct AdapterEntry {
    name: String,
    constructor: AdapterConstructor,
}

/// Registry that holds all available adapters
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, AdapterEntry>,
}

impl AdapterRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in engine
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        for kind in EngineKind::ALL {
            registry.register(kind.key(), kind.name(), move |ctx| builtin_adapter(kind, ctx));
        }
        registry
    }

    /// Shared instance of [`AdapterRegistry::with_builtin_adapters`]
    pub fn builtin() -> Arc<AdapterRegistry> {
        static BUILTIN: OnceLock<Arc<AdapterRegistry>> = OnceLock::new();
        BUILTIN
            .get_or_init(|| Arc::new(Self::with_builtin_adapters()))
            .clone()
    }

    /// Registers an adapter constructor under `key`, replacing any previous one.
    pub fn register<F>(&mut self, key: impl Into<String>, name: impl Into<String>, constructor: F)
    where
        F: Fn(AdapterContext) -> EngineResult<Box<dyn Adapter>> + Send + Sync + 'static,
    {
        let key = key.into().to_ascii_lowercase();
        tracing::debug!(client = %key, "Registering adapter");
        self.adapters.insert(
            key,
            AdapterEntry {
                name: name.into(),
                constructor: Arc::new(constructor),
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.adapters.contains_key(&key.to_ascii_lowercase())
    }

    /// Display name of a registered adapter
    pub fn name(&self, key: &str) -> Option<&str> {
        self.adapters
            .get(&key.to_ascii_lowercase())
            .map(|entry| entry.name.as_str())
    }

    /// Builds a fresh, unconnected adapter for `ctx.config.client`.
    pub fn create(&self, ctx: AdapterContext) -> EngineResult<Box<dyn Adapter>> {
        let entry = self
            .adapters
            .get(&ctx.config.client.to_ascii_lowercase())
            .ok_or_else(|| EngineError::driver_not_found(ctx.config.client.clone()))?;
        (entry.constructor)(ctx)
    }

    /// Lists all registered client keys, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.adapters.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

fn builtin_adapter(kind: EngineKind, ctx: AdapterContext) -> EngineResult<Box<dyn Adapter>> {
    Ok(match kind {
        EngineKind::Postgresql | EngineKind::Redshift => Box::new(PostgresAdapter::new(kind, ctx)),
        EngineKind::Mysql | EngineKind::Mariadb => Box::new(MySqlAdapter::new(kind, ctx)),
        EngineKind::Sqlserver => Box::new(SqlServerAdapter::new(ctx)),
        EngineKind::Sqlite => Box::new(SqliteAdapter::new(ctx)),
        EngineKind::Cassandra => Box::new(CassandraAdapter::new(ctx)),
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::engine::types::{AdapterVersion, QueryRowResult};

    struct NullAdapter;

    #[async_trait]
    impl Adapter for NullAdapter {
        async fn connect(&mut self) -> EngineResult<()> {
            Ok(())
        }

        async fn disconnect(&self) -> EngineResult<()> {
            Ok(())
        }

        fn version(&self) -> AdapterVersion {
            AdapterVersion::unknown()
        }

        fn wrap_identifier(&self, name: &str) -> String {
            name.to_string()
        }

        async fn execute_query(&self, _text: &str) -> EngineResult<Vec<QueryRowResult>> {
            Ok(Vec::new())
        }
    }

    fn context(client: &str) -> AdapterContext {
        AdapterContext {
            config: ServerConfig::new(client),
            database: String::new(),
            settings: ClientSettings::default(),
        }
    }

    #[test]
    fn builtin_registry_knows_every_engine() {
        let registry = AdapterRegistry::with_builtin_adapters();
        assert_eq!(registry.len(), EngineKind::ALL.len());
        assert!(registry.contains("PostgreSQL"));
        assert_eq!(registry.name("sqlserver"), Some("Microsoft SQL Server"));
        assert!(registry.list().contains(&"cassandra"));
    }

    #[test]
    fn unknown_client_is_rejected() {
        let registry = AdapterRegistry::with_builtin_adapters();
        let err = registry.create(context("oracle")).err().expect("no adapter");
        assert!(matches!(err, EngineError::DriverNotFound { .. }));
    }

    #[test]
    fn registers_third_party_adapter() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.is_empty());

        registry.register("nulldb", "Null DB", |_ctx| Ok(Box::new(NullAdapter)));
        let adapter = registry.create(context("nulldb")).expect("adapter builds");
        assert_eq!(adapter.wrap_identifier("x"), "x");
        assert_eq!(adapter.get_query_select_top("t", 5, Some("s")), "SELECT * FROM s.t LIMIT 5");
    }
}
