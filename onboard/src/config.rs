//! Configuration stored in `$ONBOARD_HOME/config.json`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DiscoveryFilter, FlowSettings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory, set ONBOARD_HOME")]
    NoHome,
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Get ONBOARD_HOME, defaulting to `~/.onboard`
pub fn onboard_home() -> Result<PathBuf, ConfigError> {
    match std::env::var("ONBOARD_HOME") {
        Ok(home) => Ok(PathBuf::from(home)),
        Err(_) => dirs::home_dir().map(|h| h.join(".onboard")).ok_or(ConfigError::NoHome),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegistryConfig {
    Memory,
    Firebase {
        database_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Default owner identity when none is given on the command line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub scan_prefix: String,
    pub scan_secs: u64,
    pub pairing_timeout_secs: u64,
    pub proof_of_possession: String,
    pub handoff_url: String,
    pub handoff_timeout_secs: u64,
    pub network_join_grace_secs: u64,
    pub registry: RegistryConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            owner: None,
            scan_prefix: String::new(),
            scan_secs: 5,
            pairing_timeout_secs: 15,
            proof_of_possession: "abcd1234".to_string(),
            handoff_url: onboard_proto::DEFAULT_HANDOFF_URL.to_string(),
            handoff_timeout_secs: 5,
            network_join_grace_secs: 0,
            registry: RegistryConfig::Memory,
        }
    }
}

impl ProvisionConfig {
    /// Load `config.json` from `home`, writing the defaults if it is missing
    pub fn load_or_create(home: &Path) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(home)?;
        let path = home.join("config.json");

        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&data)?);
        }

        let config = Self::default();
        config.save(home)?;
        tracing::info!(path = %path.display(), "wrote default config");
        Ok(config)
    }

    pub fn save(&self, home: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(home.join("config.json"), data)?;
        Ok(())
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_secs(self.handoff_timeout_secs)
    }

    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            filter: DiscoveryFilter {
                prefix: self.scan_prefix.clone(),
                duration: Duration::from_secs(self.scan_secs),
                ..DiscoveryFilter::default()
            },
            proof_of_possession: self.proof_of_possession.clone(),
            pairing_timeout: Duration::from_secs(self.pairing_timeout_secs),
            handoff_url: self.handoff_url.clone(),
            network_join_grace: Duration::from_secs(self.network_join_grace_secs),
        }
    }

    /// Copy safe to print: secrets replaced
    pub fn masked(&self) -> Self {
        let mut c = self.clone();
        c.proof_of_possession = "********".to_string();
        if let RegistryConfig::Firebase { auth_token: Some(token), .. } = &mut c.registry {
            *token = "********".to_string();
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisionConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(config, ProvisionConfig::default());
        assert!(dir.path().join("config.json").exists());

        let again = ProvisionConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"handoff_timeout_secs": 2, "registry": {"kind": "firebase", "database_url": "https://db.example.com"}}"#,
        )
        .unwrap();

        let config = ProvisionConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(config.handoff_timeout(), Duration::from_secs(2));
        assert_eq!(config.proof_of_possession, "abcd1234");
        assert_eq!(
            config.registry,
            RegistryConfig::Firebase {
                database_url: "https://db.example.com".into(),
                auth_token: None
            }
        );
    }

    #[test]
    fn masked_hides_secrets() {
        let config = ProvisionConfig {
            registry: RegistryConfig::Firebase {
                database_url: "https://db.example.com".into(),
                auth_token: Some("secret".into()),
            },
            ..ProvisionConfig::default()
        };
        let printed = serde_json::to_string(&config.masked()).unwrap();
        assert!(!printed.contains("secret"));
        assert!(!printed.contains("abcd1234"));
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{").unwrap();
        assert!(matches!(ProvisionConfig::load_or_create(dir.path()), Err(ConfigError::Parse(_))));
    }
}
