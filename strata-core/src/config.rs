//! Configuration management.

use crate::error::{Result, StrataError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How externally accessible services are published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngressType {
    /// Services are reachable on a node port only.
    #[default]
    NodePort,
    /// External services additionally get a TLS ingress under `domain`.
    LoadBalancer,
}

/// Limits applied to accounts created without explicit limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultLimits {
    /// millicores
    pub cpu_max: u32,
    pub cpu_default: u32,
    /// MiB
    pub memory_max: u32,
    pub memory_default: u32,
    /// GiB
    pub storage_default: u32,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            cpu_max: 2000,
            cpu_default: 1000,
            memory_max: 8196,
            memory_default: 100,
            storage_default: 10,
        }
    }
}

/// Persistent configuration for the strata daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: String,
    /// Root of the per-account host volume directories
    pub vol_dir: String,
    /// Directory of catalog specs seeded into the system catalog at startup
    pub specs_dir: Option<String>,
    pub ingress: IngressType,
    pub domain: Option<String>,
    /// Platform TLS secret copied into each account namespace
    pub tls_secret: String,
    pub tls_secret_namespace: String,
    pub limits: DefaultLimits,
    /// Ceiling for status polling when no change notification arrives
    pub poll_interval_ms: u64,
    /// Container path the account home directory is mounted at
    pub home_mount_path: String,
    pub metrics_port: u16,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: paths::db_path().to_string_lossy().to_string(),
            vol_dir: paths::volumes_dir().to_string_lossy().to_string(),
            specs_dir: None,
            ingress: IngressType::NodePort,
            domain: None,
            tls_secret: "strata-tls-secret".to_string(),
            tls_secret_namespace: "default".to_string(),
            limits: DefaultLimits::default(),
            poll_interval_ms: 3000,
            home_mount_path: "/home".to_string(),
            metrics_port: 9464,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    ///
    /// `STRATA_CONFIG` wins over the per-user config directory.
    pub fn config_path() -> PathBuf {
        std::env::var("STRATA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| paths::config_dir().join("config.json"))
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Self::config_path())?;
        if let Ok(db_path) = std::env::var("STRATA_DB_PATH") {
            config.db_path = db_path;
        }
        if let Ok(vol_dir) = std::env::var("STRATA_VOL_DIR") {
            config.vol_dir = vol_dir;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, falling back to defaults when absent.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| StrataError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| StrataError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Save configuration to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StrataError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            StrataError::InvalidConfig { reason: format!("Failed to serialize config: {}", e) }
        })?;
        std::fs::write(path, content)
            .map_err(|e| StrataError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Reject combinations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ingress == IngressType::LoadBalancer
            && self.domain.as_deref().map_or(true, str::is_empty)
        {
            return Err(StrataError::InvalidConfig {
                reason: "Domain must be specified for ingress type LoadBalancer".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(StrataError::InvalidConfig {
                reason: "poll_interval_ms must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// True when external services get an ingress.
    pub fn uses_ingress(&self) -> bool {
        self.ingress == IngressType::LoadBalancer
    }

    /// Public host name for a stack service behind the ingress.
    pub fn ingress_host(&self, stack_service_id: &str) -> Option<String> {
        match (&self.ingress, &self.domain) {
            (IngressType::LoadBalancer, Some(domain)) => {
                Some(format!("{}.{}", stack_service_id, domain))
            }
            _ => None,
        }
    }

    /// Host directory holding an account's volumes.
    pub fn account_volume_dir(&self, account: &str) -> PathBuf {
        Path::new(&self.vol_dir).join(account)
    }

    /// Name of the per-namespace copy of the TLS secret.
    pub fn account_tls_secret(account: &str) -> String {
        format!("{}-tls-secret", account)
    }
}
