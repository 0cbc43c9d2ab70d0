//! TOML configuration for a Reef node.
//!
//! Every section is optional; missing keys keep their defaults.

use std::path::{Path, PathBuf};

use reef_coord::CoordinatorConfig;
use reef_types::{PlacementConfig, QueryConfig, QuorumConfig, RebalanceConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReefConfig {
    pub placement: PlacementConfig,
    pub rebalance: RebalanceConfig,
    pub quorum: QuorumConfig,
    pub query: QueryConfig,
    pub storage: StorageSection,
    pub log: LogSection,
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Byte budget of each node's in-memory payload store.
    pub max_bytes_per_node: u64,
    /// Directory of the fjall metadata database. Without one the registry
    /// and repair queue live in memory only.
    pub meta_dir: Option<PathBuf>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            max_bytes_per_node: 256 * 1024 * 1024,
            meta_dir: None,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ReefConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Reject settings no cluster could honour.
    ///
    /// `R + W <= replication_factor` is allowed but logged, since reads may
    /// then miss the latest write.
    pub fn validate(&self) -> Result<(), EngineError> {
        let rf = self.placement.replication_factor;
        let QuorumConfig {
            read_quorum,
            write_quorum,
        } = self.quorum;

        if rf == 0 {
            return Err(EngineError::InvalidConfig(
                "replication_factor must be at least 1".into(),
            ));
        }
        if self.placement.virtual_nodes_per_node == 0 {
            return Err(EngineError::InvalidConfig(
                "virtual_nodes_per_node must be at least 1".into(),
            ));
        }
        if read_quorum == 0 || read_quorum > rf {
            return Err(EngineError::InvalidConfig(format!(
                "read_quorum {read_quorum} must be in 1..={rf}"
            )));
        }
        if write_quorum == 0 || write_quorum > rf {
            return Err(EngineError::InvalidConfig(format!(
                "write_quorum {write_quorum} must be in 1..={rf}"
            )));
        }
        if !(0.0..=1.0).contains(&self.query.alpha) {
            return Err(EngineError::InvalidConfig(format!(
                "alpha {} must be within [0, 1]",
                self.query.alpha
            )));
        }
        if !(0.0..1.0).contains(&self.query.merge_reserve) {
            return Err(EngineError::InvalidConfig(format!(
                "merge_reserve {} must be within [0, 1)",
                self.query.merge_reserve
            )));
        }
        if self.query.fan_out_limit == 0 {
            return Err(EngineError::InvalidConfig(
                "fan_out_limit must be at least 1".into(),
            ));
        }
        if self.rebalance.shard_size == 0 {
            return Err(EngineError::InvalidConfig(
                "shard_size must be at least 1".into(),
            ));
        }
        if self.rebalance.merge_factor >= self.rebalance.split_factor {
            return Err(EngineError::InvalidConfig(format!(
                "merge_factor {} must be below split_factor {}",
                self.rebalance.merge_factor, self.rebalance.split_factor
            )));
        }

        if read_quorum + write_quorum <= rf {
            warn!(
                read_quorum,
                write_quorum,
                replication_factor = rf,
                "R + W <= replication factor, reads may miss recent writes"
            );
        }
        Ok(())
    }

    /// Settings for the [`ShardCoordinator`](reef_coord::ShardCoordinator).
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            placement: self.placement.clone(),
            rebalance: self.rebalance.clone(),
            quorum: self.quorum.clone(),
        }
    }
}
