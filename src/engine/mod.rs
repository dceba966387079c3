// Data Engine Module
// Unified session, adapter and query layer over every supported engine

pub mod cancel;
pub mod database_session;
pub mod drivers;
pub mod error;
pub mod filters;
pub mod identifier;
pub mod query;
pub mod registry;
pub mod scripts;
pub mod server_session;
pub mod ssh_tunnel;
pub mod statements;
pub mod traits;
pub mod types;

pub use cancel::CancelableWait;
pub use database_session::DatabaseSession;
pub use error::{EngineError, EngineResult, ErrorKind, CANCELED_BY_USER};
pub use filters::{DatabaseFilter, FilterSpec, SchemaFilter};
pub use query::{CancelableQuery, QueryState};
pub use registry::{AdapterContext, AdapterRegistry};
pub use server_session::{create_server, create_server_with, ServerSession};
pub use ssh_tunnel::{SshTunnel, TunnelStatus};
pub use statements::StatementKind;
pub use traits::Adapter;
pub use types::*;
