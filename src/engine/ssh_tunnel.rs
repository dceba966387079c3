//! SSH Tunnel
//!
//! Local port forwarding over SSH for engines reachable only through a bastion.
//! The tunnel listens on an ephemeral port of `127.0.0.1` and, for every
//! inbound connection, opens a dedicated SSH session and a `direct-tcpip`
//! channel to the database host.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{SshAuth, SshTunnelConfig};

/// Health of the forwarding path, as seen by the last forward attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Pending,
    Ready,
    Failed(String),
}

/// SSH client handler for russh.
struct TunnelClientHandler;

#[async_trait]
impl client::Handler for TunnelClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // No known_hosts store; every host key is accepted.
        Ok(true)
    }
}

/// Authentication material, resolved when the tunnel opens
enum Credentials {
    Password(String),
    Key(Arc<KeyPair>),
    Agent,
}

struct ForwardTarget {
    ssh_host: String,
    ssh_port: u16,
    username: String,
    credentials: Credentials,
    dst_host: String,
    dst_port: u16,
}

/// Represents an active SSH tunnel
pub struct SshTunnel {
    local_addr: SocketAddr,
    status: watch::Receiver<TunnelStatus>,
    cancel: CancellationToken,
    forwards: TaskTracker,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl SshTunnel {
    /// Opens the local listener and starts accepting connections.
    ///
    /// Key material is read here so a bad key path fails before any database
    /// traffic is attempted. The SSH session itself is only negotiated when
    /// the first connection arrives; watch [`SshTunnel::wait_ready`] for the
    /// outcome.
    #[instrument(
        skip(config),
        fields(ssh_host = %config.host, ssh_port = config.port)
    )]
    pub async fn open(config: &SshTunnelConfig, dst_host: &str, dst_port: u16) -> EngineResult<Self> {
        let credentials = load_credentials(&config.auth).await?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| EngineError::ssh(format!("Failed to bind local port: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| EngineError::ssh(format!("Failed to get local address: {}", e)))?;

        let target = Arc::new(ForwardTarget {
            ssh_host: config.host.clone(),
            ssh_port: config.port,
            username: config.username.clone(),
            credentials,
            dst_host: dst_host.to_string(),
            dst_port,
        });

        let (status_tx, status) = watch::channel(TunnelStatus::Pending);
        let cancel = CancellationToken::new();
        let forwards = TaskTracker::new();

        let accept_loop = tokio::spawn(run_accept_loop(
            listener,
            target,
            Arc::new(status_tx),
            cancel.clone(),
            forwards.clone(),
        ));

        tracing::info!(local_port = local_addr.port(), "SSH tunnel listening");

        Ok(Self {
            local_addr,
            status,
            cancel,
            forwards,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }

    /// Returns the local port to connect to
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the local host to use for database connections
    pub fn local_host(&self) -> String {
        self.local_addr.ip().to_string()
    }

    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    /// Resolves immediately once a forward has succeeded; otherwise waits for
    /// the next forward to either succeed or fail.
    ///
    /// The snapshot is taken when this is called, not when the future is
    /// first polled.
    pub fn wait_ready(&self) -> impl std::future::Future<Output = EngineResult<()>> + Send + 'static {
        let mut status = self.status.clone();
        let already_ready = *status.borrow_and_update() == TunnelStatus::Ready;

        async move {
            if already_ready {
                return Ok(());
            }
            loop {
                status
                    .changed()
                    .await
                    .map_err(|_| EngineError::ssh("SSH tunnel was closed"))?;
                match &*status.borrow_and_update() {
                    TunnelStatus::Ready => return Ok(()),
                    TunnelStatus::Failed(message) => return Err(EngineError::ssh(message.clone())),
                    TunnelStatus::Pending => continue,
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops accepting, drops every forwarded connection and releases the port.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.forwards.close();

        let accept_loop = self.accept_loop.lock().take();
        if let Some(handle) = accept_loop {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "SSH tunnel accept loop ended abnormally");
            }
        }
        self.forwards.wait().await;

        tracing::info!(local_port = self.local_port(), "SSH tunnel closed");
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn load_credentials(auth: &SshAuth) -> EngineResult<Credentials> {
    match auth {
        SshAuth::Password { password } => Ok(Credentials::Password(password.clone())),
        SshAuth::Agent => Ok(Credentials::Agent),
        SshAuth::Key {
            private_key_path,
            passphrase,
        } => {
            let path = expand_home(private_key_path);
            let key_data = tokio::fs::read_to_string(&path).await.map_err(|e| {
                EngineError::ssh(format!("Failed to read SSH key file {}: {}", path, e))
            })?;
            let key = russh_keys::decode_secret_key(&key_data, passphrase.as_deref())
                .map_err(|e| EngineError::ssh(format!("Failed to decode SSH key: {}", e)))?;
            Ok(Credentials::Key(Arc::new(key)))
        }
    }
}

/// Expands a leading `~` against the home directory.
fn expand_home(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => format!("{}{}", home.display(), rest),
        None => path.to_string(),
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    target: Arc<ForwardTarget>,
    status: Arc<watch::Sender<TunnelStatus>>,
    cancel: CancellationToken,
    forwards: TaskTracker,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    tracing::debug!(%peer, "New tunnel connection");
                    let target = target.clone();
                    let status = status.clone();
                    let cancel = cancel.clone();
                    forwards.spawn(async move {
                        tokio::select! {
                            result = forward_connection(inbound, &target, &status) => {
                                if let Err(err) = result {
                                    tracing::warn!(error = %err, "Tunnel forwarding error");
                                    status.send_replace(TunnelStatus::Failed(err.to_string()));
                                }
                            }
                            _ = cancel.cancelled() => {}
                        }
                    });
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to accept tunnel connection");
                    status.send_replace(TunnelStatus::Failed(format!(
                        "Failed to accept tunnel connection: {}",
                        err
                    )));
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
}

async fn forward_connection(
    mut inbound: TcpStream,
    target: &ForwardTarget,
    status: &watch::Sender<TunnelStatus>,
) -> EngineResult<()> {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(
        config,
        (target.ssh_host.as_str(), target.ssh_port),
        TunnelClientHandler,
    )
    .await
    .map_err(|e| EngineError::ssh(format!("Failed to connect to SSH server: {}", e)))?;

    let authenticated = authenticate(&mut session, &target.username, &target.credentials).await?;
    if !authenticated {
        return Err(EngineError::ssh(format!(
            "SSH authentication failed for {}@{}",
            target.username, target.ssh_host
        )));
    }

    let originator_port = inbound.local_addr().map(|addr| addr.port()).unwrap_or(0);
    let channel = session
        .channel_open_direct_tcpip(
            target.dst_host.as_str(),
            u32::from(target.dst_port),
            "127.0.0.1",
            u32::from(originator_port),
        )
        .await
        .map_err(|e| EngineError::ssh(format!("Failed to open SSH channel: {}", e)))?;

    status.send_replace(TunnelStatus::Ready);

    let mut remote = channel.into_stream();
    match tokio::io::copy_bidirectional(&mut inbound, &mut remote).await {
        Ok((sent, received)) => tracing::debug!(sent, received, "Tunnel connection finished"),
        Err(err) => tracing::debug!(error = %err, "Tunnel connection interrupted"),
    }

    let _ = session
        .disconnect(russh::Disconnect::ByApplication, "", "English")
        .await;
    Ok(())
}

async fn authenticate(
    session: &mut client::Handle<TunnelClientHandler>,
    username: &str,
    credentials: &Credentials,
) -> EngineResult<bool> {
    match credentials {
        Credentials::Password(password) => session
            .authenticate_password(username, password)
            .await
            .map_err(|e| EngineError::ssh(format!("SSH password authentication failed: {}", e))),
        Credentials::Key(key) => session
            .authenticate_publickey(username, key.clone())
            .await
            .map_err(|e| EngineError::ssh(format!("SSH key authentication failed: {}", e))),
        Credentials::Agent => authenticate_with_agent(session, username).await,
    }
}

#[cfg(unix)]
async fn authenticate_with_agent(
    session: &mut client::Handle<TunnelClientHandler>,
    username: &str,
) -> EngineResult<bool> {
    use russh_keys::agent::client::AgentClient;
    use tokio::net::UnixStream;

    let socket_path = std::env::var("SSH_AUTH_SOCK")
        .map_err(|_| EngineError::ssh("SSH agent not available (SSH_AUTH_SOCK not set)"))?;
    let stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|e| EngineError::ssh(format!("Failed to connect to SSH agent: {}", e)))?;

    let mut agent = AgentClient::connect(stream);
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| EngineError::ssh(format!("Failed to list SSH agent identities: {}", e)))?;

    for identity in identities {
        let (returned_agent, result) = session
            .authenticate_future(username, identity, agent)
            .await;
        agent = returned_agent;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => continue,
            Err(err) => {
                tracing::debug!(error = %err, "SSH agent identity rejected");
                continue;
            }
        }
    }

    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _session: &mut client::Handle<TunnelClientHandler>,
    _username: &str,
) -> EngineResult<bool> {
    Err(EngineError::not_supported(
        "SSH agent authentication is only available on unix platforms",
    ))
}
