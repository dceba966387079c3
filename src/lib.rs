// unidb - Unified database client layer
// Core library

pub mod config;
pub mod engine;
pub mod observability;

pub use config::{clear_select_limit, select_limit, set_select_limit, ClientSettings};
pub use engine::{
    create_server, create_server_with, Adapter, AdapterRegistry, CancelableQuery, DatabaseSession,
    EngineError, EngineResult, ServerConfig, ServerSession,
};
