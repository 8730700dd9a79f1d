// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wirefleet_types::{ServerAccess, VpnServer, WireGuardSettings};

use crate::backend::BackendSettings;
use crate::scheduler::ScheduleSettings;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wirefleet/wirefleet.toml";
const DEFAULT_STATE_PATH: &str = "/var/lib/wirefleet/state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetToml {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

fn default_state_path() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_PATH)
}

impl Default for FleetToml {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            scheduler: SchedulerSection::default(),
            backend: BackendSection::default(),
            servers: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub health_interval_secs: u64,
    pub usage_interval_secs: u64,
    pub expiration_interval_secs: u64,
    pub limit_interval_secs: u64,
    pub server_timeout_secs: u64,
    pub persist_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            health_interval_secs: 300,
            usage_interval_secs: 300,
            expiration_interval_secs: 86_400,
            limit_interval_secs: 600,
            server_timeout_secs: 60,
            persist_interval_secs: 60,
        }
    }
}

impl SchedulerSection {
    pub fn settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            health_interval: Duration::from_secs(self.health_interval_secs),
            usage_interval: Duration::from_secs(self.usage_interval_secs),
            expiration_interval: Duration::from_secs(self.expiration_interval_secs),
            limit_interval: Duration::from_secs(self.limit_interval_secs),
            server_timeout: Duration::from_secs(self.server_timeout_secs),
        }
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub command_timeout_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            http_timeout_secs: 15,
        }
    }
}

impl BackendSection {
    pub fn settings(&self) -> BackendSettings {
        BackendSettings {
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

/// Static inventory entry. Servers are matched to stored records by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub access: ServerAccess,
    #[serde(default)]
    pub wireguard: Option<WireGuardSettings>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ServerEntry {
    /// Build the server record, keeping identity, health and any
    /// bootstrapped public key from a previously stored record.
    pub fn to_server(&self, existing: Option<&VpnServer>) -> VpnServer {
        let stored = existing.and_then(|s| s.wireguard.clone());
        let stored_key = stored.as_ref().and_then(|wg| wg.public_key.clone());
        let mut wireguard = self.wireguard.clone().or(stored);
        if let Some(wg) = wireguard.as_mut() {
            if wg.public_key.is_none() {
                wg.public_key = stored_key;
            }
        }

        VpnServer {
            id: existing.map(|s| s.id).unwrap_or_else(Uuid::new_v4),
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            access: self.access.clone(),
            wireguard,
            is_active: self.active,
            is_healthy: existing.is_some_and(|s| s.is_healthy),
            last_health_check: existing.and_then(|s| s.last_health_check),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate server name: {0}")]
    DuplicateServer(String),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub async fn load(path: &Path) -> Result<FleetToml, ConfigError> {
    debug!(path = %path.display(), "loading config");

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: FleetToml = toml::from_str(&contents)?;
            validate(&config)?;
            info!(
                path = %path.display(),
                server_count = config.servers.len(),
                "loaded config"
            );
            for entry in &config.servers {
                debug!(
                    server = %entry.name,
                    host = %entry.host,
                    method = %entry.access.method(),
                    "registered server"
                );
            }
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(FleetToml::default())
        }
        Err(e) => Err(ConfigError::Read(e)),
    }
}

pub fn validate(config: &FleetToml) -> Result<(), ConfigError> {
    let s = &config.scheduler;
    for (field, secs) in [
        ("scheduler.health_interval_secs", s.health_interval_secs),
        ("scheduler.usage_interval_secs", s.usage_interval_secs),
        ("scheduler.expiration_interval_secs", s.expiration_interval_secs),
        ("scheduler.limit_interval_secs", s.limit_interval_secs),
        ("scheduler.server_timeout_secs", s.server_timeout_secs),
        ("scheduler.persist_interval_secs", s.persist_interval_secs),
        ("backend.command_timeout_secs", config.backend.command_timeout_secs),
        ("backend.http_timeout_secs", config.backend.http_timeout_secs),
    ] {
        if secs == 0 {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero".into(),
            });
        }
    }

    let mut seen = HashSet::new();
    for entry in &config.servers {
        if !seen.insert(entry.name.as_str()) {
            warn!(server = %entry.name, "server name listed twice");
            return Err(ConfigError::DuplicateServer(entry.name.clone()));
        }
        if matches!(entry.access, ServerAccess::Ssh { auth: None, .. }) {
            // accepted; the executor reports it when a session is opened
            warn!(server = %entry.name, "ssh server has no credentials configured");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use wirefleet_types::SshAuth;

    const SAMPLE: &str = r#"
state_path = "/tmp/fleet.json"

[scheduler]
health_interval_secs = 120

[backend]
http_timeout_secs = 5

[[servers]]
name = "edge-1"
host = "203.0.113.10"
port = 22
access = { method = "ssh", username = "root", auth = { type = "password", password = "hunter2" } }

[servers.wireguard]
interface = "wg1"

[[servers]]
name = "outline-1"
host = "203.0.113.20"
port = 8443
access = { method = "api", admin_access_key = "AbCdEf" }
"#;

    #[test]
    fn parse_sample() {
        let config: FleetToml = toml::from_str(SAMPLE).unwrap();
        validate(&config).unwrap();

        assert_eq!(config.state_path, PathBuf::from("/tmp/fleet.json"));
        assert_eq!(config.scheduler.health_interval_secs, 120);
        assert_eq!(config.scheduler.limit_interval_secs, 600);
        assert_eq!(config.backend.http_timeout_secs, 5);
        assert_eq!(config.backend.command_timeout_secs, 30);

        let edge = &config.servers[0];
        assert!(matches!(
            &edge.access,
            ServerAccess::Ssh { username, auth: Some(SshAuth::Password { .. }) } if username == "root"
        ));
        let wg = edge.wireguard.as_ref().unwrap();
        assert_eq!(wg.interface, "wg1");
        assert_eq!(wg.subnet, "10.0.0.0/24");
        assert!(config.servers[1].active);
    }

    #[test]
    fn parse_empty_file() {
        let parsed: FleetToml = toml::from_str("").unwrap();
        assert_eq!(parsed, FleetToml::default());
    }

    #[test]
    fn round_trip_toml() {
        let config: FleetToml = toml::from_str(SAMPLE).unwrap();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: FleetToml = toml::from_str(&serialized).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut config: FleetToml = toml::from_str(SAMPLE).unwrap();
        let mut dup = config.servers[0].clone();
        dup.host = "198.51.100.1".into();
        config.servers.push(dup);
        assert!(matches!(validate(&config), Err(ConfigError::DuplicateServer(n)) if n == "edge-1"));
    }

    #[test_case("health_interval_secs"; "health")]
    #[test_case("server_timeout_secs"; "server timeout")]
    fn zero_interval_rejected(field: &str) {
        let text = format!("[scheduler]\n{field} = 0\n");
        let config: FleetToml = toml::from_str(&text).unwrap();
        assert!(matches!(validate(&config), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn ssh_without_credentials_is_accepted() {
        let text = r#"
[[servers]]
name = "bare"
host = "h"
port = 22
access = { method = "ssh", username = "root" }
"#;
        let config: FleetToml = toml::from_str(text).unwrap();
        validate(&config).unwrap();
    }

    #[test]
    fn entry_keeps_stored_identity_and_key() {
        let config: FleetToml = toml::from_str(SAMPLE).unwrap();
        let entry = &config.servers[0];

        let fresh = entry.to_server(None);
        assert!(fresh.is_active);
        assert!(!fresh.is_healthy);

        let mut stored = fresh.clone();
        stored.is_healthy = true;
        stored.wireguard.as_mut().unwrap().public_key = Some("pub".into());

        let merged = entry.to_server(Some(&stored));
        assert_eq!(merged.id, stored.id);
        assert!(merged.is_healthy);
        assert_eq!(merged.wireguard.unwrap().public_key.as_deref(), Some("pub"));
    }

    #[tokio::test]
    async fn load_missing_and_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirefleet.toml");

        let missing = load(&path).await.unwrap();
        assert!(missing.servers.is_empty());

        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let expected: FleetToml = toml::from_str(SAMPLE).unwrap();
        assert_eq!(load(&path).await.unwrap(), expected);
    }
}
