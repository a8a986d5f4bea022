//! Static configuration
//!
//! ```toml
//! [pool]
//! backing = "temp-file"
//! temp_dir = "/var/tmp"
//!
//! [sync]
//! parallel = true
//!
//! [[drivers]]
//! suffix = "sar"
//! driver = "sar"
//! ```

use crate::buffer_pool::PoolBacking;
use crate::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Buffer pool settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub backing: PoolBacking,
    pub temp_dir: Option<PathBuf>,
    /// Maximum simultaneously leased buffers (unlimited if unset)
    pub max_active: Option<usize>,
}

/// Sync coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Flush independent mounts of the same depth on scoped threads
    pub parallel: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig { parallel: true }
    }
}

/// Maps a file name suffix to a driver id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverMapping {
    pub suffix: String,
    pub driver: String,
}

impl DriverMapping {
    pub fn new(suffix: impl Into<String>, driver: impl Into<String>) -> Self {
        DriverMapping {
            suffix: suffix.into(),
            driver: driver.into(),
        }
    }
}

fn default_drivers() -> Vec<DriverMapping> {
    vec![
        DriverMapping::new("sar", "sar"),
        DriverMapping::new("osar", "sar-mimetype"),
    ]
}

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_drivers")]
    pub drivers: Vec<DriverMapping>,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            pool: PoolConfig::default(),
            sync: SyncConfig::default(),
            drivers: default_drivers(),
        }
    }
}

impl FsConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: FsConfig = toml::from_str(s).map_err(|e| FsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FsError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| FsError::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        for mapping in &self.drivers {
            let suffix = mapping.suffix.trim_start_matches('.');
            if suffix.is_empty() || suffix.contains('/') {
                return Err(FsError::Config(format!(
                    "invalid driver suffix {:?}",
                    mapping.suffix
                )));
            }
        }
        if self.pool.max_active == Some(0) {
            return Err(FsError::Config("pool.max_active must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FsConfig::default();
        assert_eq!(config.pool.backing, PoolBacking::Memory);
        assert!(config.sync.parallel);
        assert_eq!(config.drivers.len(), 2);
        assert_eq!(FsConfig::from_toml_str("").unwrap(), config);
    }

    #[test]
    fn test_parse_full() {
        let config = FsConfig::from_toml_str(
            r#"
            [pool]
            backing = "temp-file"
            temp_dir = "/tmp/nestar"
            max_active = 8

            [sync]
            parallel = false

            [[drivers]]
            suffix = "pak"
            driver = "sar-zstd"
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.backing, PoolBacking::TempFile);
        assert_eq!(config.pool.temp_dir, Some(PathBuf::from("/tmp/nestar")));
        assert_eq!(config.pool.max_active, Some(8));
        assert!(!config.sync.parallel);
        assert_eq!(config.drivers, vec![DriverMapping::new("pak", "sar-zstd")]);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = FsConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(FsConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            FsConfig::from_toml_str("[pool]\nbacking = \"disk\""),
            Err(FsError::Config(_))
        ));
        assert!(matches!(
            FsConfig::from_toml_str("[[drivers]]\nsuffix = \"\"\ndriver = \"sar\""),
            Err(FsError::Config(_))
        ));
        assert!(FsConfig::from_toml_str("[pool]\nmax_active = 0").is_err());
    }
}
