//! Server Session
//!
//! One configured server: the databases opened on it and, when SSH is
//! configured, the single tunnel they all share. This is the owner of every
//! [`DatabaseSession`] handed out for the server.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::instrument;

use crate::config::ClientSettings;
use crate::engine::database_session::DatabaseSession;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::AdapterRegistry;
use crate::engine::ssh_tunnel::SshTunnel;
use crate::engine::types::ServerConfig;

pub(crate) struct ServerShared {
    config: RwLock<ServerConfig>,
    pub(crate) settings: ClientSettings,
    pub(crate) registry: Arc<AdapterRegistry>,
    databases: Mutex<HashMap<String, DatabaseSession>>,
    tunnel: tokio::sync::Mutex<Option<Arc<SshTunnel>>>,
}

impl ServerShared {
    pub(crate) fn config_snapshot(&self) -> ServerConfig {
        self.config.read().clone()
    }

    /// The server's tunnel, opened on first use. `None` without SSH config.
    ///
    /// Opening the tunnel rewrites `local_host`/`local_port` of the config so
    /// every later adapter dials the local end.
    pub(crate) async fn ensure_tunnel(&self) -> EngineResult<Option<Arc<SshTunnel>>> {
        let (ssh, dst_host, dst_port) = {
            let config = self.config.read();
            let Some(ssh) = config.ssh.clone() else {
                return Ok(None);
            };
            let dst_host = config
                .host
                .clone()
                .filter(|host| !host.is_empty())
                .ok_or_else(|| EngineError::invalid_config("SSH tunnels require a destination host"))?;
            let dst_port = config
                .port
                .or_else(|| config.engine().and_then(|kind| kind.default_port()))
                .ok_or_else(|| EngineError::invalid_config("SSH tunnels require a destination port"))?;
            (ssh, dst_host, dst_port)
        };

        let mut slot = self.tunnel.lock().await;
        if let Some(tunnel) = slot.as_ref().filter(|tunnel| !tunnel.is_closed()) {
            return Ok(Some(tunnel.clone()));
        }

        let tunnel = Arc::new(SshTunnel::open(&ssh, &dst_host, dst_port).await?);
        {
            let mut config = self.config.write();
            config.local_host = Some(tunnel.local_host());
            config.local_port = Some(tunnel.local_port());
        }
        tracing::info!(
            dst_host = %dst_host,
            dst_port,
            local_port = tunnel.local_port(),
            "SSH tunnel ready for server"
        );

        *slot = Some(tunnel.clone());
        Ok(Some(tunnel))
    }

    /// Forgets `session` if it is still the registered handle for its name.
    pub(crate) fn remove_database(&self, session: &DatabaseSession) {
        let mut databases = self.databases.lock();
        let registered = databases
            .get(session.database_name())
            .is_some_and(|current| current.ptr_eq(session));
        if registered {
            databases.remove(session.database_name());
        }
    }
}

/// Handle to a configured server. Cheap to clone.
#[derive(Clone)]
pub struct ServerSession {
    shared: Arc<ServerShared>,
}

impl ServerSession {
    /// Session for `database`, created on first use. An empty name means no
    /// database was selected and the engine default applies.
    pub fn create_connection(&self, database: &str) -> DatabaseSession {
        let mut databases = self.shared.databases.lock();
        if let Some(existing) = databases.get(database) {
            return existing.clone();
        }

        tracing::debug!(database, "Creating database session");
        let session = DatabaseSession::new(Arc::downgrade(&self.shared), database);
        databases.insert(database.to_string(), session.clone());
        session
    }

    /// Existing session for `database`, if any.
    pub fn db(&self, database: &str) -> Option<DatabaseSession> {
        self.shared.databases.lock().get(database).cloned()
    }

    /// Current configuration, tunnel endpoint included.
    pub fn config(&self) -> ServerConfig {
        self.shared.config_snapshot()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.shared.settings
    }

    /// Local `(host, port)` of the SSH tunnel once it is open.
    pub fn tunnel_endpoint(&self) -> Option<(String, u16)> {
        let config = self.shared.config.read();
        match (&config.local_host, config.local_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }

    /// Disconnects every database and closes the tunnel.
    #[instrument(skip(self))]
    pub async fn end(&self) {
        let databases: Vec<DatabaseSession> = self
            .shared
            .databases
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in databases {
            session.disconnect().await;
        }

        let tunnel = self.shared.tunnel.lock().await.take();
        if let Some(tunnel) = tunnel {
            tunnel.close().await;
            let mut config = self.shared.config.write();
            config.local_host = None;
            config.local_port = None;
        }

        tracing::info!("Server session ended");
    }
}

/// Server session for `config`, with settings from the user config file and
/// the built-in engines.
pub fn create_server(config: ServerConfig) -> EngineResult<ServerSession> {
    create_server_with(config, ClientSettings::load(), AdapterRegistry::builtin())
}

#[instrument(skip_all, fields(client = %config.client))]
pub fn create_server_with(
    config: ServerConfig,
    settings: ClientSettings,
    registry: Arc<AdapterRegistry>,
) -> EngineResult<ServerSession> {
    if !registry.contains(&config.client) {
        return Err(EngineError::driver_not_found(config.client.clone()));
    }
    config.validate()?;

    tracing::debug!(ssh = config.ssh.is_some(), "Creating server session");
    Ok(ServerSession {
        shared: Arc::new(ServerShared {
            config: RwLock::new(config),
            settings,
            registry,
            databases: Mutex::new(HashMap::new()),
            tunnel: tokio::sync::Mutex::new(None),
        }),
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::engine::registry::AdapterContext;
    use crate::engine::traits::Adapter;
    use crate::engine::types::{AdapterVersion, QueryRowResult, SshAuth, SshTunnelConfig};

    /// Dials whatever endpoint its config points at and holds the socket.
    struct DialingAdapter {
        ctx: AdapterContext,
        stream: Option<TcpStream>,
    }

    #[async_trait]
    impl Adapter for DialingAdapter {
        async fn connect(&mut self) -> EngineResult<()> {
            let host = self.ctx.config.effective_host().unwrap_or("127.0.0.1").to_string();
            let port = self.ctx.config.effective_port().unwrap_or(0);
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string()))?;
            self.stream = Some(stream);
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

    fn registry() -> Arc<AdapterRegistry> {
        let mut registry = AdapterRegistry::new();
        registry.register("dialing", "Dialing", |ctx| {
            Ok(Box::new(DialingAdapter { ctx, stream: None }))
        });
        Arc::new(registry)
    }

    /// A "server" that accepts TCP connections and immediately drops them.
    async fn dropping_ssh_host() -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake ssh host");
        let port = listener.local_addr().expect("local addr").port();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        (port, handle)
    }

    fn config(host: &str, port: u16) -> ServerConfig {
        let mut config = ServerConfig::new("dialing");
        config.host = Some(host.into());
        config.port = Some(port);
        config
    }

    #[test]
    fn unknown_client_is_rejected() {
        let err = create_server_with(
            ServerConfig::new("oracle"),
            ClientSettings::default(),
            AdapterRegistry::builtin(),
        )
        .err()
        .expect("unknown client");
        assert!(matches!(err, EngineError::DriverNotFound { .. }));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = create_server_with(ServerConfig::new("dialing"), ClientSettings::default(), registry())
            .err()
            .expect("missing host");
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn create_connection_is_idempotent() {
        let server = create_server_with(config("localhost", 5432), ClientSettings::default(), registry())
            .expect("server");

        let first = server.create_connection("shop");
        let second = server.create_connection("shop");
        assert!(first.ptr_eq(&second));
        assert!(server.db("shop").is_some_and(|db| db.ptr_eq(&first)));
        assert!(server.db("other").is_none());

        let default_db = server.create_connection("");
        assert!(!default_db.ptr_eq(&first));
    }

    #[tokio::test]
    async fn end_disconnects_every_database() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = create_server_with(config("127.0.0.1", port), ClientSettings::default(), registry())
            .expect("server");

        let shop = server.create_connection("shop");
        let crm = server.create_connection("crm");
        shop.connect().await.expect("connect shop");
        crm.connect().await.expect("connect crm");

        server.end().await;
        assert!(!shop.is_connected());
        assert!(!crm.is_connected());
        assert!(server.db("shop").is_none());
        assert!(server.tunnel_endpoint().is_none());
    }

    #[tokio::test]
    async fn tunnel_is_shared_and_reports_forward_failures() {
        let (ssh_port, ssh_host) = dropping_ssh_host().await;
        let mut config = config("db.internal", 5432);
        config.ssh = Some(SshTunnelConfig {
            host: "127.0.0.1".into(),
            port: ssh_port,
            username: "tunnel".into(),
            auth: SshAuth::Password {
                password: "secret".into(),
            },
        });
        let server = create_server_with(config, ClientSettings::default(), registry()).expect("server");

        let shop = server.create_connection("shop");
        let err = shop.connect().await.unwrap_err();
        assert!(matches!(err, EngineError::SshError { .. }), "got {err:?}");

        let (local_host, local_port) = server.tunnel_endpoint().expect("tunnel endpoint");
        assert_eq!(local_host, "127.0.0.1");
        assert_eq!(server.config().local_port, Some(local_port));
        // The destination itself is untouched.
        assert_eq!(server.config().host.as_deref(), Some("db.internal"));

        let crm = server.create_connection("crm");
        let err = crm.connect().await.unwrap_err();
        assert!(matches!(err, EngineError::SshError { .. }));
        assert_eq!(server.tunnel_endpoint().map(|(_, port)| port), Some(local_port));

        server.end().await;
        assert!(server.tunnel_endpoint().is_none());
        ssh_host.abort();
    }
}
