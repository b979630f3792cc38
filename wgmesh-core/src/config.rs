//! Configuration for the mesh address control plane.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::{MeshError, MeshResult};

/// Retry settings for optimistic-concurrency conflicts against the node
/// object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts before the conflict error is surfaced.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// CIDR block mesh addresses are drawn from.
    pub subnet: Ipv4Net,
    /// Addresses inside the subnet that must never be handed out.
    #[serde(default)]
    pub reserved: BTreeSet<Ipv4Addr>,
    /// Retry budget for persisting assignments to node objects.
    #[serde(default)]
    pub persist_retry: RetryConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            subnet: "10.6.0.0/16".parse().expect("Invalid default mesh subnet"),
            reserved: BTreeSet::new(),
            persist_retry: RetryConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file(path: &Path) -> MeshResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: MeshConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> MeshResult<()> {
        for ip in &self.reserved {
            if !self.subnet.contains(ip) {
                return Err(MeshError::InvalidConfiguration {
                    message: format!("Reserved address {} is not within subnet {}", ip, self.subnet),
                });
            }
        }

        if self.persist_retry.max_attempts == 0 {
            return Err(MeshError::InvalidConfiguration {
                message: "Persist retry must allow at least one attempt".to_string(),
            });
        }

        Ok(())
    }
}
