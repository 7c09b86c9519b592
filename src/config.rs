use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs::{read_to_string, write},
    path::PathBuf,
    time::Duration,
};

use crate::{error::ArborError, tree::OrphanPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false, readers always build from persistence.
    pub enabled: bool,
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            default_ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    pub orphan_policy: OrphanPolicy,
    /// Localized property keys of tree nodes that feed cached payloads.
    pub localized_keys: BTreeSet<String>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            orphan_policy: OrphanPolicy::default(),
            localized_keys: BTreeSet::from(["Name".to_string(), "BadgeText".to_string()]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Hard cap on ancestor walks. The tree's entity count is used when unset.
    pub max_depth_override: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArborConfig {
    pub cache: CacheConfig,
    pub tree: TreeConfig,
    pub paths: PathsConfig,
}

impl ArborConfig {
    pub fn from_toml(content: &str) -> Result<Self, ArborError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ArborError> {
        Ok(toml::to_string(self)?)
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<ArborConfig, ArborError>;
    fn set_config(&self, config: &ArborConfig) -> Result<(), ArborError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<ArborConfig, ArborError> {
        tracing::debug!("Attempting to read config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(ArborConfig::default());
        }
        let content = read_to_string(&self.path)?;
        ArborConfig::from_toml(&content)
    }

    fn set_config(&self, config: &ArborConfig) -> Result<(), ArborError> {
        tracing::debug!("Attempting to write config to: {:?}", &self.path);
        write(&self.path, config.to_toml()?)?;
        Ok(())
    }
}
