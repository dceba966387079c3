//! Universal data types for the unidb engine layer
//!
//! These types provide a normalized representation of server configuration,
//! schema objects and query results across SQL and wide-column engines.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::statements::StatementKind;

/// Unique identifier for a cancellable query handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Built-in engines and their static metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Postgresql,
    Redshift,
    Mysql,
    Mariadb,
    Sqlserver,
    Sqlite,
    Cassandra,
}

impl EngineKind {
    pub const ALL: [EngineKind; 7] = [
        EngineKind::Postgresql,
        EngineKind::Redshift,
        EngineKind::Mysql,
        EngineKind::Mariadb,
        EngineKind::Sqlserver,
        EngineKind::Sqlite,
        EngineKind::Cassandra,
    ];

    /// Identifier used in `ServerConfig::client`
    pub fn key(self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Redshift => "redshift",
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Sqlserver => "sqlserver",
            Self::Sqlite => "sqlite",
            Self::Cassandra => "cassandra",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Postgresql => "PostgreSQL",
            Self::Redshift => "Redshift",
            Self::Mysql => "MySQL",
            Self::Mariadb => "MariaDB",
            Self::Sqlserver => "Microsoft SQL Server",
            Self::Sqlite => "SQLite",
            Self::Cassandra => "Cassandra",
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Postgresql => Some(5432),
            Self::Redshift => Some(5439),
            Self::Mysql | Self::Mariadb => Some(3306),
            Self::Sqlserver => Some(1433),
            Self::Sqlite => None,
            Self::Cassandra => Some(9042),
        }
    }

    /// Features a UI should hide for this engine
    pub fn disabled_features(self) -> &'static [&'static str] {
        match self {
            Self::Postgresql | Self::Redshift => &["server:domain"],
            Self::Mysql | Self::Mariadb => &["server:schema", "server:domain"],
            Self::Sqlserver => &[],
            Self::Sqlite => &[
                "server:ssl",
                "server:host",
                "server:port",
                "server:socketPath",
                "server:user",
                "server:password",
                "server:schema",
                "server:domain",
                "server:ssh",
                "scriptCreateTable:addReferences",
            ],
            Self::Cassandra => &[
                "server:ssl",
                "server:socketPath",
                "server:schema",
                "server:domain",
                "scriptCreateTable",
                "cancelQuery",
            ],
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.key().eq_ignore_ascii_case(key))
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Server connection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Engine identifier, resolved through the adapter registry
    pub client: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub socket_path: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Default database (the file path for SQLite)
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    /// Windows domain for SQL Server NTLM authentication
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub ssh: Option<SshTunnelConfig>,
    #[serde(default)]
    pub ssl: Option<TlsOptions>,

    /// Local endpoint of the SSH tunnel, assigned once it is established.
    #[serde(skip)]
    pub local_host: Option<String>,
    #[serde(skip)]
    pub local_port: Option<u16>,
}

impl ServerConfig {
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            ..Self::default()
        }
    }

    pub fn engine(&self) -> Option<EngineKind> {
        EngineKind::from_key(&self.client)
    }

    /// Host the adapter should dial: the tunnel endpoint when one exists.
    pub fn effective_host(&self) -> Option<&str> {
        self.local_host
            .as_deref()
            .or(self.host.as_deref())
            .filter(|host| !host.is_empty())
    }

    pub fn effective_port(&self) -> Option<u16> {
        self.local_port.or(self.port)
    }

    /// True when the adapter must go through a unix socket instead of TCP
    pub fn uses_socket(&self) -> bool {
        self.local_host.is_none()
            && self.host.as_deref().map_or(true, str::is_empty)
            && self.socket_path.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Database to open: the session's name, else the configured default.
    pub fn database_or<'a>(&'a self, session_database: &'a str) -> Option<&'a str> {
        if session_database.is_empty() {
            self.database.as_deref().filter(|db| !db.is_empty())
        } else {
            Some(session_database)
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.client.trim().is_empty() {
            return Err(EngineError::invalid_config("Missing database client"));
        }

        let is_file_engine = self.engine() == Some(EngineKind::Sqlite);
        if is_file_engine {
            if self.database.as_deref().map_or(true, str::is_empty) {
                return Err(EngineError::invalid_config(
                    "SQLite requires a database file path",
                ));
            }
            if self.ssh.is_some() {
                return Err(EngineError::invalid_config(
                    "SSH tunnels are not available for SQLite",
                ));
            }
        } else {
            let has_host = self.host.as_deref().is_some_and(|h| !h.is_empty());
            let has_socket = self.socket_path.as_deref().is_some_and(|s| !s.is_empty());
            if !has_host && !has_socket {
                return Err(EngineError::invalid_config(
                    "A host or a socket path is required",
                ));
            }
            if has_host && has_socket {
                return Err(EngineError::invalid_config(
                    "Use either a host or a socket path, not both",
                ));
            }
        }

        if let Some(ssh) = &self.ssh {
            ssh.validate()?;
            if self.host.as_deref().map_or(true, str::is_empty) {
                return Err(EngineError::invalid_config(
                    "SSH tunnels require a destination host",
                ));
            }
        }

        Ok(())
    }
}

fn default_ssh_port() -> u16 {
    22
}

/// SSH tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

impl SshTunnelConfig {
    fn validate(&self) -> EngineResult<()> {
        if self.host.trim().is_empty() {
            return Err(EngineError::invalid_config("SSH host is required"));
        }
        if self.username.trim().is_empty() {
            return Err(EngineError::invalid_config("SSH user is required"));
        }
        if let SshAuth::Key {
            private_key_path, ..
        } = &self.auth
        {
            if private_key_path.trim().is_empty() {
                return Err(EngineError::invalid_config(
                    "SSH private key path is required",
                ));
            }
        }
        Ok(())
    }
}

/// SSH authentication method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SshAuth {
    Password { password: String },
    Key { private_key_path: String, passphrase: Option<String> },
    Agent,
}

/// TLS settings for engines that support encrypted transports
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Verify the server certificate chain
    #[serde(default)]
    pub reject_unauthorized: bool,
    /// PEM file with the CA bundle to trust
    #[serde(default)]
    pub ca_path: Option<String>,
}

/// Query cancellation support level for an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSupport {
    None,
    Driver,
}

/// Server version, populated by `Adapter::connect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterVersion {
    pub name: String,
    pub version: String,
    pub string: String,
}

impl AdapterVersion {
    pub fn unknown() -> Self {
        Self {
            name: "UNKNOWN".to_string(),
            version: "0.0.0".to_string(),
            string: "UNKNOWN 0.0.0".to_string(),
        }
    }

    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        string: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            string: string.into(),
        }
    }
}

impl Default for AdapterVersion {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Table or view name with its owning schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: Option<String>,
    pub name: String,
}

impl TableInfo {
    pub fn new(schema: Option<String>, name: impl Into<String>) -> Self {
        Self {
            schema,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineInfo {
    pub schema: Option<String>,
    pub routine_name: String,
    /// `FUNCTION` or `PROCEDURE`
    pub routine_type: String,
}

/// Column metadata for table introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub column_name: String,
    /// Data type (database-specific)
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
}

impl TableColumn {
    pub fn new(column_name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            data_type: data_type.into(),
            nullable: true,
            default_value: None,
        }
    }
}

/// Primary/foreign key membership of a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableKey {
    pub constraint_name: Option<String>,
    pub column_name: String,
    pub referenced_table: Option<String>,
    /// `PRIMARY KEY` or `FOREIGN KEY`
    pub key_type: String,
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Result column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: Option<String>,
}

impl Field {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
        }
    }
}

/// A single row of data (indexed by field order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// One result of `execute_query` / `query().execute()`
///
/// Whether `row_count` is set for non-row statements, and whether a batch
/// reports one result per statement, depends on the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRowResult {
    pub command: StatementKind,
    pub rows: Vec<Row>,
    pub fields: Vec<Field>,
    pub row_count: Option<u64>,
    pub affected_rows: Option<u64>,
}

impl QueryRowResult {
    pub fn empty(command: StatementKind) -> Self {
        Self {
            command,
            rows: Vec::new(),
            fields: Vec::new(),
            row_count: None,
            affected_rows: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_auth_deserializes_from_externally_tagged_enum() {
        let json = r#"{"Key":{"private_key_path":"/tmp/id_ed25519","passphrase":"p"}}"#;
        let auth: SshAuth = serde_json::from_str(json).expect("should parse");

        match auth {
            SshAuth::Key {
                private_key_path,
                passphrase,
            } => {
                assert_eq!(private_key_path, "/tmp/id_ed25519");
                assert_eq!(passphrase.as_deref(), Some("p"));
            }
            other => panic!("unexpected auth variant: {other:?}"),
        }
    }

    #[test]
    fn tunnel_endpoint_overrides_host() {
        let mut config = ServerConfig::new("postgresql");
        config.host = Some("db".into());
        config.port = Some(5432);
        assert_eq!(config.effective_host(), Some("db"));

        config.local_host = Some("127.0.0.1".into());
        config.local_port = Some(40000);
        assert_eq!(config.effective_host(), Some("127.0.0.1"));
        assert_eq!(config.effective_port(), Some(40000));
    }

    #[test]
    fn socket_path_is_used_without_host() {
        let mut config = ServerConfig::new("mysql");
        config.socket_path = Some("/var/run/mysqld.sock".into());
        assert!(config.uses_socket());
        config.validate().expect("socket-only config is valid");
    }

    #[test]
    fn validate_rejects_missing_endpoint() {
        let err = ServerConfig::new("postgresql")
            .validate()
            .expect_err("host is required");
        assert!(matches!(err, EngineError::InvalidConfig { .. }));

        let err = ServerConfig::new("sqlite")
            .validate()
            .expect_err("file is required");
        assert!(err.to_string().contains("SQLite"));
    }

    #[test]
    fn session_database_falls_back_to_default() {
        let mut config = ServerConfig::new("postgresql");
        config.database = Some("app".into());
        assert_eq!(config.database_or(""), Some("app"));
        assert_eq!(config.database_or("other"), Some("other"));
    }

    #[test]
    fn engine_keys_round_trip() {
        for kind in EngineKind::ALL {
            assert_eq!(EngineKind::from_key(kind.key()), Some(kind));
        }
        assert_eq!(EngineKind::from_key("oracle"), None);
        assert!(EngineKind::Cassandra
            .disabled_features()
            .contains(&"cancelQuery"));
    }

    #[test]
    fn unknown_version_sentinel() {
        let version = AdapterVersion::default();
        assert_eq!(version.name, "UNKNOWN");
        assert_eq!(version.version, "0.0.0");
    }
}
