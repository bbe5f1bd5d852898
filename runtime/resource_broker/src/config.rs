//! Broker configuration
//!
//! Read from TOML at root-task start-up:
//!
//! ```toml
//! [registry]
//! max_objects = 4096
//!
//! [spaces]
//! max_spaces = 64
//! max_resources_per_space = 4096
//!
//! [domains]
//! max_domains = 256
//!
//! [cleanup]
//! policy = "cascade_dependents"
//! ```
//!
//! Every section and key is optional. Unknown keys are rejected so that a
//! typo does not silently fall back to a default.

use serde::Deserialize;
use thiserror::Error;

use crate::badge::{MAX_DOMAIN_ID, MAX_OBJECT_ID, MAX_SPACE_ID};
use crate::ledger::CleanupPolicy;
use crate::{DomainId, ObjectId, SpaceId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Default highest object id of a component registry
    pub max_objects: ObjectId,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_objects: 4096 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpaceConfig {
    pub max_spaces: SpaceId,
    pub max_resources_per_space: u32,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            max_spaces: 64,
            max_resources_per_space: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DomainConfig {
    pub max_domains: DomainId,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self { max_domains: 256 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupConfig {
    pub policy: CleanupPolicy,
}

/// Root-task configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub registry: RegistryConfig,
    pub spaces: SpaceConfig,
    pub domains: DomainConfig,
    pub cleanup: CleanupConfig,
}

impl BrokerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every limit against the badge field it ends up in
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("registry.max_objects", self.registry.max_objects, MAX_OBJECT_ID)?;
        check_range("spaces.max_spaces", self.spaces.max_spaces, MAX_SPACE_ID)?;
        check_range("domains.max_domains", self.domains.max_domains, MAX_DOMAIN_ID)?;
        if self.spaces.max_resources_per_space == 0 {
            return Err(ConfigError::Invalid {
                field: "spaces.max_resources_per_space",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: u32, max: u32) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{} is outside 1..={}", value, max),
        });
    }
    Ok(())
}
