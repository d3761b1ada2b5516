use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};

/// Default capacity of the eviction ring.
pub const EVICTION_CACHE_SIZE: usize = 1024;

/// Default bound on symbolic link resolution depth.
pub const MAX_LINK_HOPS: usize = 40;

const MIN_EVICTION_CACHE_SIZE: usize = 2;

/// Tunables for a [`Vfs`](crate::Vfs) instance.
///
/// All fields have defaults so a `VfsConfig::default()` is always valid and a
/// partial TOML document deserializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfsConfig {
    /// Capacity of the ring of recently-unreferenced nodes awaiting deletion.
    #[serde(default = "default_eviction_cache_size")]
    pub eviction_cache_size: usize,

    /// Bound on symbolic link hops during traversal.
    #[serde(default = "default_max_link_hops")]
    pub max_link_hops: usize,
}

impl Default for VfsConfig {
    fn default() -> Self {
        VfsConfig {
            eviction_cache_size: default_eviction_cache_size(),
            max_link_hops: default_max_link_hops(),
        }
    }
}

fn default_eviction_cache_size() -> usize {
    EVICTION_CACHE_SIZE
}

fn default_max_link_hops() -> usize {
    MAX_LINK_HOPS
}

impl VfsConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: VfsConfig = toml::from_str(text)
            .map_err(|e| VfsError::Config(format!("Failed to parse config: {}", e)))?;
        validate_config(&config)?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VfsError::Config(format!("Failed to serialize config: {}", e)))
    }
}

pub fn validate_config(config: &VfsConfig) -> Result<()> {
    if config.eviction_cache_size < MIN_EVICTION_CACHE_SIZE {
        return Err(VfsError::Config(format!(
            "eviction_cache_size ({}) is below the minimum of {}",
            config.eviction_cache_size, MIN_EVICTION_CACHE_SIZE
        )));
    }

    if config.max_link_hops == 0 {
        tracing::warn!("max_link_hops is 0; every link resolution will fail");
    }

    Ok(())
}
