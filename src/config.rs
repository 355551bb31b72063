//! Configuration management for the backup agent.
//!
//! Loaded once from a TOML file at startup and passed by reference into
//! every component. There is no process-wide mutable configuration state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub dispatcher: DispatcherConfig,
    pub keyring: KeyringConfig,
    pub transport: TransportConfig,
    #[serde(default)]
    pub mysql: MysqlConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Host identity the dispatcher knows this agent by.
    pub server_id: Uuid,

    /// Human-readable name reported to the dispatcher.
    #[serde(default = "default_name")]
    pub name: String,

    /// Seconds between job polls.
    #[serde(default = "default_check_period")]
    pub check_period: u64,

    /// Lock file gating backup pipeline execution, one per host.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Full URL of the dispatcher API endpoint.
    pub url: String,

    /// Armored public key of the dispatcher, provisioned at install time.
    pub public_key_path: PathBuf,

    /// Key uid the dispatcher key is imported under.
    #[serde(default = "default_dispatcher_uid")]
    pub key_uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyringConfig {
    /// GPG home directory holding the agent keypair and the dispatcher key.
    #[serde(default = "default_keyring_homedir")]
    pub homedir: PathBuf,

    /// Domain used to form the agent's key uid: `<server_id>@<domain>`.
    #[serde(default = "default_key_domain")]
    pub key_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// SSH private key used to reach the remote storage endpoint.
    #[serde(default = "default_ssh_key")]
    pub ssh_private_key: PathBuf,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MysqlConfig {
    /// Admin credentials used when the dispatcher config does not supply any.
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "dbbackup-agent".to_string())
}

fn default_check_period() -> u64 {
    300
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/run/dbbackup-agent.backup.lock")
}

fn default_dispatcher_uid() -> String {
    "dispatcher@backup.local".to_string()
}

fn default_keyring_homedir() -> PathBuf {
    PathBuf::from("/var/lib/dbbackup-agent/keyring")
}

fn default_key_domain() -> String {
    "backup.local".to_string()
}

fn default_ssh_key() -> PathBuf {
    PathBuf::from("/var/lib/dbbackup-agent/id_rsa")
}

fn default_ssh_port() -> u16 {
    22
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Key uid of the agent's own keypair.
    pub fn identity_uid(&self) -> String {
        format!("{}@{}", self.agent.server_id, self.keyring.key_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [agent]
        server_id = "479a41b3-d22d-41a8-b7d3-4e40302622f6"

        [dispatcher]
        url = "https://dispatcher.example.com/api"
        public_key_path = "/etc/dbbackup-agent/dispatcher.asc"

        [keyring]

        [transport]
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.agent.check_period, 300);
        assert_eq!(config.transport.ssh_port, 22);
        assert_eq!(config.log.level, "info");
        assert!(config.mysql.user.is_none());
        assert_eq!(
            config.identity_uid(),
            "479a41b3-d22d-41a8-b7d3-4e40302622f6@backup.local"
        );
    }

    #[test]
    fn test_from_file_missing() {
        assert!(Config::from_file(Path::new("/nonexistent.toml")).is_err());
    }
}
