//! Client settings.
//!
//! Defaults are persisted to a per-user config file. Environment variables
//! override any stored values so managed deployments can pin them.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// Row limit used by `get_query_select_top` when nothing else is configured
pub const DEFAULT_SELECT_LIMIT: u32 = 1000;

const DEFAULT_POOL_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Process-wide select limit; 0 means unset.
static SELECT_LIMIT_OVERRIDE: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub select_limit: Option<u32>,
    pub pool_max_connections: u32,
    pub pool_acquire_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            select_limit: None,
            pool_max_connections: DEFAULT_POOL_MAX_CONNECTIONS,
            pool_acquire_timeout_secs: DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS,
        }
    }
}

fn env_u64_opt(key: &str) -> Option<u64> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Ignoring non-numeric environment override");
            None
        }
    }
}

pub fn config_dir() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_default();
    path.push(".unidb");
    path
}

fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

fn load_from_file(path: &PathBuf) -> Option<ClientSettings> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(settings) => Some(settings),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Invalid settings file, using defaults");
            None
        }
    }
}

impl ClientSettings {
    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_u64_opt("UNIDB_SELECT_LIMIT") {
            self.select_limit = u32::try_from(value).ok().filter(|limit| *limit > 0);
        }
        if let Some(value) = env_u64_opt("UNIDB_POOL_MAX_CONNECTIONS") {
            if let Ok(max) = u32::try_from(value) {
                self.pool_max_connections = max.max(1);
            }
        }
        if let Some(value) = env_u64_opt("UNIDB_POOL_ACQUIRE_TIMEOUT_SECS") {
            self.pool_acquire_timeout_secs = value;
        }
    }

    pub fn load() -> Self {
        let path = config_path();
        let mut settings = load_from_file(&path).unwrap_or_default();
        settings.apply_env_overrides();
        settings
    }

    pub fn save_to_file(&self) -> EngineResult<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::internal(format!("Failed to create config directory: {}", e))
            })?;
        }

        let payload = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::internal(format!("Save failed: {}", e)))?;
        fs::write(&path, payload)
            .map_err(|e| EngineError::internal(format!("Save failed: {}", e)))?;
        Ok(())
    }

    pub fn acquire_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pool_acquire_timeout_secs)
    }
}

/// Overrides the select limit for every session of this process.
pub fn set_select_limit(limit: u32) {
    SELECT_LIMIT_OVERRIDE.store(limit, Ordering::SeqCst);
}

pub fn clear_select_limit() {
    SELECT_LIMIT_OVERRIDE.store(0, Ordering::SeqCst);
}

/// Current process-wide override, if any
pub fn select_limit() -> Option<u32> {
    match SELECT_LIMIT_OVERRIDE.load(Ordering::SeqCst) {
        0 => None,
        limit => Some(limit),
    }
}

/// Call-site limit, then the process override, then settings, then 1000.
pub fn resolve_select_limit(requested: Option<u32>, settings: &ClientSettings) -> u32 {
    requested
        .filter(|limit| *limit > 0)
        .or_else(select_limit)
        .or(settings.select_limit.filter(|limit| *limit > 0))
        .unwrap_or(DEFAULT_SELECT_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test owns the global override so parallel tests cannot interleave.
    #[test]
    fn select_limit_resolution_order() {
        let mut settings = ClientSettings::default();
        clear_select_limit();

        assert_eq!(resolve_select_limit(None, &settings), DEFAULT_SELECT_LIMIT);

        settings.select_limit = Some(250);
        assert_eq!(resolve_select_limit(None, &settings), 250);

        set_select_limit(50);
        assert_eq!(select_limit(), Some(50));
        assert_eq!(resolve_select_limit(None, &settings), 50);
        assert_eq!(resolve_select_limit(Some(7), &settings), 7);

        clear_select_limit();
        assert_eq!(select_limit(), None);
        assert_eq!(resolve_select_limit(None, &settings), 250);
    }

    #[test]
    fn partial_settings_file_keeps_defaults() {
        let settings: ClientSettings =
            serde_json::from_str(r#"{"select_limit": 20}"#).expect("should parse");
        assert_eq!(settings.select_limit, Some(20));
        assert_eq!(settings.pool_max_connections, 5);
        assert_eq!(settings.pool_acquire_timeout_secs, 30);
    }
}
