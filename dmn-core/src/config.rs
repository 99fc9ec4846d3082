//! Configuration management for the masternode registry

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{Amount, BlockHeight, COIN};
use crate::{DmnError, Result};

/// Complete registry configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmnConfig {
    /// Activation deployment parameters
    #[serde(default)]
    pub activation: ActivationConfig,
    /// Registry consensus parameters
    #[serde(default)]
    pub registry: RegistryConfig,
    /// On-disk layout
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Signalling deployment that gates special transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Blocks per signalling window
    pub window_size: u32,
    /// Signalling blocks required within one window to lock in
    pub threshold: u32,
    /// First height at which signalling counts
    pub start_height: BlockHeight,
    /// Height after which the deployment fails if not locked in
    pub timeout_height: BlockHeight,
    /// Header version bit miners set to signal support
    pub signal_bit: u8,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            window_size: 144,
            threshold: 108,
            start_height: 0,
            timeout_height: BlockHeight::MAX,
            signal_bit: 3,
        }
    }
}

/// Consensus parameters of the registry itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Exact value a collateral output must hold
    pub collateral_amount: Amount,
    /// Lowest accepted non-zero protocol version
    pub min_protocol_version: u32,
    /// Highest accepted protocol version
    pub max_protocol_version: u32,
    /// Blocks an entry must wait after registration before it can be paid
    pub payment_confirmations: u32,
    /// Share of the block reward owed to the masternode, in percent
    pub masternode_reward_percent: u8,
    /// Deepest reorganization the registry can undo
    pub max_reorg_depth: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            collateral_amount: 1000 * COIN,
            min_protocol_version: 70208,
            max_protocol_version: 70299,
            payment_confirmations: 1,
            masternode_reward_percent: 50,
            max_reorg_depth: 576,
        }
    }
}

/// Where registry state lives on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Tip state file, relative to `data_dir`
    pub snapshot_file: String,
    /// Undo record directory, relative to `data_dir`
    pub undo_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|dir| dir.join("dmn"))
            .unwrap_or_else(|| PathBuf::from(".dmn"));
        Self {
            data_dir,
            snapshot_file: "tip.bin".to_string(),
            undo_dir: "undo".to_string(),
        }
    }
}

impl StorageConfig {
    /// Absolute path of the tip state file
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }

    /// Absolute path of the undo directory
    pub fn undo_path(&self) -> PathBuf {
        self.data_dir.join(&self.undo_dir)
    }
}

impl DmnConfig {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DmnError::Configuration(format!("Failed to read config file: {}", e)))?;

        let config: DmnConfig = if path.extension() == Some(std::ffi::OsStr::new("json")) {
            serde_json::from_str(&content)
                .map_err(|e| DmnError::Configuration(format!("Failed to parse JSON config: {}", e)))?
        } else {
            toml::from_str(&content)
                .map_err(|e| DmnError::Configuration(format!("Failed to parse TOML config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = if path.extension() == Some(std::ffi::OsStr::new("json")) {
            serde_json::to_string_pretty(self)
                .map_err(|e| DmnError::Configuration(format!("Failed to serialize JSON: {}", e)))?
        } else {
            toml::to_string_pretty(self)
                .map_err(|e| DmnError::Configuration(format!("Failed to serialize TOML: {}", e)))?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path, content)
            .map_err(|e| DmnError::Configuration(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let activation = &self.activation;
        if activation.window_size == 0 {
            return Err(DmnError::Configuration(
                "Activation window size must be greater than 0".to_string(),
            ));
        }

        if activation.threshold == 0 || activation.threshold > activation.window_size {
            return Err(DmnError::Configuration(format!(
                "Activation threshold must be between 1 and the window size ({})",
                activation.window_size
            )));
        }

        if activation.signal_bit >= 29 {
            return Err(DmnError::Configuration(
                "Activation signal bit must be below 29".to_string(),
            ));
        }

        let registry = &self.registry;
        if registry.masternode_reward_percent > 100 {
            return Err(DmnError::Configuration(
                "Masternode reward percent cannot exceed 100".to_string(),
            ));
        }

        if registry.min_protocol_version > registry.max_protocol_version {
            return Err(DmnError::Configuration(
                "Minimum protocol version exceeds maximum".to_string(),
            ));
        }

        if registry.max_reorg_depth == 0 {
            return Err(DmnError::Configuration(
                "Maximum reorganization depth must be greater than 0".to_string(),
            ));
        }

        if registry.collateral_amount == 0 {
            return Err(DmnError::Configuration(
                "Collateral amount must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get default config file paths
    pub fn get_default_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".dmn").join("config.toml"));
            paths.push(home.join(".dmn").join("config.json"));
        }

        paths.push(PathBuf::from("/etc/dmn/config.toml"));
        paths.push(PathBuf::from("/etc/dmn/config.json"));

        paths
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<Self> {
        for path in Self::get_default_config_paths() {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        // No config file found
        Ok(Self::default())
    }
}
