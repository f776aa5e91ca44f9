use crate::constants::{limits, network, retry};
use crate::errors::HostError;
use crate::utils::paths::expand_home_path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    Local,
    #[default]
    Ssh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Key,
    Password,
}

fn default_port() -> u16 {
    network::SSH_DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    network::TIMEOUT_SSH_READY_MS
}

fn default_keepalive_ms() -> u64 {
    network::KEEPALIVE_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub host_type: HostType,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub auth_method: Option<AuthMethod>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub jump_host: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    #[serde(default = "default_keepalive_ms")]
    pub keep_alive_interval: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

impl HostConfig {
    pub fn local(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            host_type: HostType::Local,
            host: String::new(),
            port: default_port(),
            username: String::new(),
            auth_method: None,
            private_key_path: None,
            password: None,
            passphrase: None,
            jump_host: None,
            timeout: default_timeout_ms(),
            keep_alive_interval: default_keepalive_ms(),
            enabled: true,
            host_key_fingerprint: None,
        }
    }

    pub fn ssh(id: &str, host: &str, username: &str) -> Self {
        Self {
            host_type: HostType::Ssh,
            host: host.to_string(),
            username: username.to_string(),
            auth_method: Some(AuthMethod::Password),
            password: Some(String::new()),
            ..Self::local(id)
        }
    }

    pub fn is_local(&self) -> bool {
        self.host_type == HostType::Local
    }

    /// Explicit `authMethod`, else `key` when a key path is configured.
    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method.unwrap_or(if self.private_key_path.is_some() {
            AuthMethod::Key
        } else {
            AuthMethod::Password
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.max(1))
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn load_private_key(&self) -> Result<String, HostError> {
        let raw = self.private_key_path.as_deref().ok_or_else(|| {
            HostError::config(format!("Host '{}' has no privateKeyPath", self.id))
        })?;
        let path = expand_home_path(raw);
        std::fs::read_to_string(&path).map_err(|err| {
            HostError::auth(format!(
                "Failed to read private key {} for host '{}': {}",
                path.display(),
                self.id,
                err
            ))
            .with_hint("Check that the key file exists and is readable (chmod 600).")
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.timeout == 0 {
            return Err("timeout must be greater than zero".to_string());
        }
        if self.is_local() {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err("ssh host requires 'host'".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("ssh host requires 'username'".to_string());
        }
        if self.port == 0 {
            return Err("port must be between 1 and 65535".to_string());
        }
        match self.auth_method() {
            AuthMethod::Key if self.private_key_path.is_none() => {
                Err("authMethod=key requires 'privateKeyPath'".to_string())
            }
            AuthMethod::Password if self.password.is_none() => {
                Err("authMethod=password requires 'password'".to_string())
            }
            _ => Ok(()),
        }
    }
}

fn default_max_concurrent() -> usize {
    limits::MAX_CONCURRENT_CONNECTIONS
}

fn default_pool_size() -> usize {
    limits::CONNECTION_POOL_SIZE
}

fn default_retry_attempts() -> usize {
    retry::ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    retry::DELAY_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_connections: usize,
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay: u64,
    #[serde(default)]
    pub use_pool: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            max_concurrent_connections: default_max_concurrent(),
            connection_pool_size: default_pool_size(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay_ms(),
            use_pool: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostsDocument {
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
    #[serde(default)]
    pub default_host: Option<String>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read host configuration {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse host configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },
    #[error("globalSettings.{field} must be at least 1")]
    InvalidSetting { field: &'static str },
    #[error("defaultHost '{0}' is not configured")]
    UnknownDefault(String),
}

impl From<RegistryError> for HostError {
    fn from(err: RegistryError) -> Self {
        HostError::config(err.to_string())
    }
}

/// Immutable view of the host configuration document.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    hosts: BTreeMap<String, Arc<HostConfig>>,
    default_host: Option<String>,
    settings: GlobalSettings,
}

impl HostRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, RegistryError> {
        let document: HostsDocument = serde_json::from_str(raw)?;
        Self::from_document(document)
    }

    pub fn from_document(document: HostsDocument) -> Result<Self, RegistryError> {
        let settings = document.global_settings;
        for (field, value) in [
            ("maxConcurrentConnections", settings.max_concurrent_connections),
            ("connectionPoolSize", settings.connection_pool_size),
            ("retryAttempts", settings.retry_attempts),
        ] {
            if value == 0 {
                return Err(RegistryError::InvalidSetting { field });
            }
        }

        let mut hosts = BTreeMap::new();
        for (key, mut config) in document.hosts {
            if config.id.is_empty() {
                config.id = key.clone();
            } else if config.id != key {
                return Err(RegistryError::InvalidHost {
                    host: key,
                    reason: format!("id '{}' does not match its key", config.id),
                });
            }
            if config.name.is_empty() {
                config.name = key.clone();
            }
            config
                .validate()
                .map_err(|reason| RegistryError::InvalidHost {
                    host: key.clone(),
                    reason,
                })?;
            hosts.insert(key, Arc::new(config));
        }

        for config in hosts.values() {
            if let Some(jump) = config.jump_host.as_deref() {
                if jump == config.id {
                    return Err(RegistryError::InvalidHost {
                        host: config.id.clone(),
                        reason: "jumpHost must not reference the host itself".to_string(),
                    });
                }
                if !hosts.contains_key(jump) {
                    return Err(RegistryError::InvalidHost {
                        host: config.id.clone(),
                        reason: format!("jumpHost '{}' is not configured", jump),
                    });
                }
            }
        }

        if let Some(default_host) = document.default_host.as_deref() {
            if !hosts.contains_key(default_host) {
                return Err(RegistryError::UnknownDefault(default_host.to_string()));
            }
        }

        Ok(Self {
            hosts,
            default_host: document.default_host,
            settings,
        })
    }

    /// Returns the host if it exists and is enabled.
    pub fn get(&self, host_id: &str) -> Result<Arc<HostConfig>, HostError> {
        let config = self.lookup(host_id).ok_or_else(|| {
            HostError::config(format!("Unknown host: {}", host_id))
                .with_details(serde_json::json!({ "known_hosts": self.host_ids() }))
        })?;
        if !config.enabled {
            return Err(HostError::config(format!("Host '{}' is disabled", host_id)));
        }
        Ok(config)
    }

    pub fn lookup(&self, host_id: &str) -> Option<Arc<HostConfig>> {
        self.hosts.get(host_id).cloned()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Arc<HostConfig>> {
        self.hosts.values()
    }

    pub fn enabled_hosts(&self) -> impl Iterator<Item = &Arc<HostConfig>> {
        self.hosts.values().filter(|host| host.enabled)
    }

    pub fn host_ids(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }

    pub fn default_host(&self) -> Option<&str> {
        self.default_host.as_deref()
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }
}
