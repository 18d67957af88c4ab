use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::orchestrator::InstanceAddress;
use crate::pool::PoolConfig;
use crate::ratelimit::RateLimitConfig;
use crate::rotation::RotationConfig;
use crate::ssh::SshConfig;
use crate::tunnel::TunnelConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the managed key pair and its rotation backups.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorKind {
    #[default]
    Docker,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub kind: OrchestratorKind,
    /// SSH port agents listen on inside their containers.
    pub ssh_port: u16,
    /// Address table for the static orchestrator.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub instances: HashMap<String, InstanceAddress>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            kind: OrchestratorKind::Docker,
            ssh_port: 22,
            instances: HashMap::new(),
        }
    }
}

fn default_data_dir() -> String {
    dirs::config_dir()
        .map(|dir| dir.join("agentlink").display().to_string())
        .unwrap_or_else(|| "~/.config/agentlink".to_string())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ssh: SshConfig::default(),
            pool: PoolConfig::default(),
            tunnel: TunnelConfig::default(),
            rate_limit: RateLimitConfig::default(),
            rotation: RotationConfig::default(),
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| LinkError::Config("Cannot determine config directory".to_string()))?;
        Ok(dir.join("agentlink"))
    }

    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("AGENTLINK_CONFIG") {
            return Ok(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }
        Ok(Self::config_dir()?.join("config.yaml"))
    }

    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        let mut config = Self::load_from(&path)?;

        if let Ok(dir) = std::env::var("AGENTLINK_DATA_DIR") {
            config.data_dir = dir;
        }

        if let Ok(user) = std::env::var("AGENTLINK_SSH_USER") {
            config.ssh.user = user;
        }

        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content)
            .map_err(|e| LinkError::Config(format!("Invalid config: {}", e)))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)
            .map_err(|e| LinkError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        Ok(())
    }

    /// Data directory with `~` expanded.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).as_ref())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.trim().is_empty() {
            return Err(LinkError::Config("data_dir must not be empty".to_string()));
        }

        if self.ssh.user.trim().is_empty() {
            return Err(LinkError::Config("ssh.user must not be empty".to_string()));
        }

        if self.orchestrator.ssh_port == 0 {
            return Err(LinkError::Config(
                "orchestrator.ssh_port must be between 1 and 65535".to_string(),
            ));
        }

        self.pool.reconnect.validate("pool.reconnect")?;
        self.tunnel.reconcile.validate("tunnel.reconcile")?;
        self.rate_limit.validate()?;

        if self.pool.keepalive_interval.is_zero() || self.tunnel.health_interval.is_zero() {
            return Err(LinkError::Config(
                "Health check intervals must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(millis) = s.strip_suffix("ms") {
        millis.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else if let Some(minutes) = s.strip_suffix('m') {
        minutes.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(seconds) = s.strip_suffix('s') {
        seconds.parse::<u64>().ok().map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() != 0 {
        return format!("{}ms", d.as_millis());
    }

    let secs = d.as_secs();
    match secs {
        0 => "0s".to_string(),
        s if s % 3600 == 0 => format!("{}h", s / 3600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

/// Serde helpers writing durations as human strings (`30s`, `5m`, `1h`).
pub mod duration_str {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid duration '{}'", raw)))
    }

    pub mod option {
        use std::time::Duration;

        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw {
                None => Ok(None),
                Some(s) if s.trim().is_empty() => Ok(None),
                Some(s) => super::super::parse_duration(&s)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid duration '{}'", s))),
            }
        }
    }

    pub mod list {
        use std::time::Duration;

        use serde::{de::Error, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut seq = serializer.serialize_seq(Some(durations.len()))?;
            for d in durations {
                seq.serialize_element(&super::super::format_duration(*d))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Vec::<String>::deserialize(deserializer)?
                .into_iter()
                .map(|s| {
                    super::super::parse_duration(&s)
                        .ok_or_else(|| D::Error::custom(format!("invalid duration '{}'", s)))
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::HostKeyPolicy;

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.ssh.user, "agent");
    }

    #[test]
    fn test_load_from_unreadable_path_names_it() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load_from(dir.path()).err().unwrap();
        assert!(matches!(err, LinkError::Other(_)));
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_load_from_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "pool: [not, a, map]").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_parse_duration_hours() {
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("24H"), Some(Duration::from_secs(86400)));
    }

    #[test]
    fn test_parse_duration_minutes() {
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("60s"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("7200"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("  5s  "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_eq!(parse_duration("invalid"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("2x"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.ssh.user, "agent");
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::TrustOnFirstUse);
        assert_eq!(config.pool.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.pool.health_check_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.reconnect.max_attempts, 10);
        assert_eq!(config.tunnel.health_interval, Duration::from_secs(60));
        assert_eq!(config.rate_limit.max_attempts, 10);
        assert_eq!(config.orchestrator.kind, OrchestratorKind::Docker);
        assert!(config.rotation.interval.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();

        assert!(yaml.contains("keepalive_interval: 30s"));
        assert!(yaml.contains("health_interval: 1m"));
        assert!(yaml.contains("kind: docker"));
        // empty static table is omitted
        assert!(!yaml.contains("instances"));
    }

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
data_dir: /var/lib/agentlink
ssh:
  user: bot
  host_key_policy: strict
pool:
  keepalive_interval: 10s
  max_connections: 64
  reconnect:
    base: 500ms
    factor: 3.0
    cap: 20s
    max_attempts: 4
rate_limit:
  block_durations: [10s, 2m]
rotation:
  interval: 30d
orchestrator:
  kind: static
  instances:
    bot-1:
      host: 10.0.0.5
      port: 22
"#;

        // "30d" is not a supported unit
        assert!(serde_yaml::from_str::<AppConfig>(yaml).is_err());

        let yaml = yaml.replace("30d", "720h");
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.data_dir, "/var/lib/agentlink");
        assert_eq!(config.ssh.user, "bot");
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.pool.keepalive_interval, Duration::from_secs(10));
        assert_eq!(config.pool.max_connections, 64);
        assert_eq!(config.pool.reconnect.base, Duration::from_millis(500));
        assert_eq!(config.pool.reconnect.max_attempts, 4);
        // untouched fields keep their defaults
        assert_eq!(config.pool.health_check_timeout, Duration::from_secs(5));
        assert_eq!(
            config.rate_limit.block_durations,
            vec![Duration::from_secs(10), Duration::from_secs(120)]
        );
        assert_eq!(config.rotation.interval, Some(Duration::from_secs(720 * 3600)));
        assert_eq!(config.orchestrator.kind, OrchestratorKind::Static);
        assert_eq!(
            config.orchestrator.instances["bot-1"],
            InstanceAddress::new("10.0.0.5", 22)
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.ssh.user = String::new();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.orchestrator.ssh_port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pool.reconnect.factor = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool.reconnect"));
    }

    #[test]
    fn test_data_path_expands_tilde() {
        let config = AppConfig {
            data_dir: "~/agentlink-data".to_string(),
            ..Default::default()
        };
        assert!(!config.data_path().to_string_lossy().starts_with('~'));
    }
}
