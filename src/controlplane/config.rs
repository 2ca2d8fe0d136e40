//! Orchestrator Configuration
//!
//! Loaded from an optional YAML file; CLI flags override individual fields.

use crate::error::{Error, Result};
use crate::model::StorageClassConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Platform front end driving the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendContext {
    /// Publications are recorded and fenced
    #[default]
    Csi,
    /// No publication records are kept
    Docker,
}

impl std::fmt::Display for FrontendContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrontendContext::Csi => write!(f, "csi"),
            FrontendContext::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for FrontendContext {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "csi" => Ok(FrontendContext::Csi),
            "docker" => Ok(FrontendContext::Docker),
            other => Err(Error::Configuration(format!("unknown frontend context {}", other))),
        }
    }
}

/// Configuration for the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    pub frontend: FrontendContext,
    /// Wait after the first successful publish before enabling publish enforcement
    pub publication_sync_grace_secs: u64,
    /// Age after which a volume still being created is abandoned
    pub volume_creating_timeout_secs: u64,
    /// How often the transaction monitor looks for abandoned creates
    pub transaction_monitor_period_secs: u64,
    /// Upper bound on requested volume sizes
    pub max_volume_size_bytes: Option<u64>,
    /// Backend configs applied after bootstrap when not already present
    pub backends: Vec<serde_json::Value>,
    /// Storage classes applied after bootstrap when not already present
    pub storage_classes: Vec<StorageClassConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            frontend: FrontendContext::Csi,
            publication_sync_grace_secs: 120,
            volume_creating_timeout_secs: 600,
            transaction_monitor_period_secs: 60,
            max_volume_size_bytes: None,
            backends: Vec::new(),
            storage_classes: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transaction_monitor_period_secs == 0 {
            return Err(Error::Configuration(
                "transactionMonitorPeriodSecs must be greater than zero".into(),
            ));
        }
        if self.max_volume_size_bytes == Some(0) {
            return Err(Error::Configuration("maxVolumeSizeBytes must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn publication_sync_grace(&self) -> Duration {
        Duration::from_secs(self.publication_sync_grace_secs)
    }

    pub fn volume_creating_timeout(&self) -> Duration {
        Duration::from_secs(self.volume_creating_timeout_secs)
    }

    pub fn transaction_monitor_period(&self) -> Duration {
        Duration::from_secs(self.transaction_monitor_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.frontend, FrontendContext::Csi);
        assert_eq!(config.publication_sync_grace(), Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
frontend: docker
publicationSyncGraceSecs: 5
maxVolumeSizeBytes: 1099511627776
backends:
  - storageDriverName: fake
    backendName: fast-a
storageClasses:
  - name: fast
    attributes:
      IOPS: "2000"
"#
        )
        .unwrap();

        let config = OrchestratorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.frontend, FrontendContext::Docker);
        assert_eq!(config.publication_sync_grace_secs, 5);
        assert_eq!(config.volume_creating_timeout_secs, 600);
        assert_eq!(config.max_volume_size_bytes, Some(1 << 40));
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.storage_classes[0].name, "fast");
    }

    #[test]
    fn test_invalid_config() {
        assert!(OrchestratorConfig::from_yaml("transactionMonitorPeriodSecs: 0").is_err());
        assert!(OrchestratorConfig::from_yaml("frontend: kubelet").is_err());
        assert!("swarm".parse::<FrontendContext>().is_err());
    }
}
