//! Resource types and identities
//!
//! Resource types are registered dynamically by name. The core types the
//! framework itself relies on are pre-registered with fixed codes; resource
//! servers register their own names on first use.

use core::fmt;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{ObjectId, ResourceError, Result, SpaceId};

/// Numeric resource type code (8 bits, matches the badge field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceType(pub u8);

impl ResourceType {
    pub const RESOURCE_SPACE: Self = Self(0);
    pub const DOMAIN: Self = Self(1);
    pub const MEMORY_OBJECT: Self = Self(2);
    pub const ADDRESS_SPACE: Self = Self(3);
    pub const CPU: Self = Self(4);
    pub const ENDPOINT: Self = Self(5);

    pub const fn code(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const CORE_TYPES: &[(&str, ResourceType)] = &[
    ("resource_space", ResourceType::RESOURCE_SPACE),
    ("domain", ResourceType::DOMAIN),
    ("memory_object", ResourceType::MEMORY_OBJECT),
    ("address_space", ResourceType::ADDRESS_SPACE),
    ("cpu", ResourceType::CPU),
    ("endpoint", ResourceType::ENDPOINT),
];

/// Identity of one resource: (type, space, object)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub rtype: ResourceType,
    pub space: SpaceId,
    pub object: ObjectId,
}

impl ResourceKey {
    pub const fn new(rtype: ResourceType, space: SpaceId, object: ObjectId) -> Self {
        Self {
            rtype,
            space,
            object,
        }
    }

    /// Key of the space record a space is represented by in the space-of-spaces
    pub const fn space_record(space: SpaceId) -> Self {
        Self::new(ResourceType::RESOURCE_SPACE, crate::SPACE_OF_SPACES, space)
    }

    pub const fn is_space_record(&self) -> bool {
        self.rtype.0 == ResourceType::RESOURCE_SPACE.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.rtype, self.space, self.object)
    }
}

/// Bijective name ↔ code mapping of resource types
#[derive(Debug, Clone)]
pub struct ResourceTypeTable {
    by_name: HashMap<String, ResourceType>,
    by_code: BTreeMap<u8, String>,
}

impl ResourceTypeTable {
    /// Create a table with the core types pre-registered
    pub fn new() -> Self {
        let mut table = Self {
            by_name: HashMap::new(),
            by_code: BTreeMap::new(),
        };
        for (name, rtype) in CORE_TYPES {
            table.by_name.insert((*name).to_string(), *rtype);
            table.by_code.insert(rtype.code(), (*name).to_string());
        }
        table
    }

    /// Register a type name, returning its code
    ///
    /// Registering a known name returns the code it already has.
    ///
    /// # Errors
    /// Returns `TypeTableFull` once all 256 codes are taken
    pub fn register(&mut self, name: &str) -> Result<ResourceType> {
        if let Some(rtype) = self.by_name.get(name) {
            return Ok(*rtype);
        }

        let code = (0..=u8::MAX)
            .find(|code| !self.by_code.contains_key(code))
            .ok_or(ResourceError::TypeTableFull)?;
        let rtype = ResourceType(code);

        self.by_name.insert(name.to_string(), rtype);
        self.by_code.insert(code, name.to_string());
        log::debug!("registered resource type '{}' as {}", name, code);
        Ok(rtype)
    }

    pub fn lookup(&self, name: &str) -> Option<ResourceType> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, rtype: ResourceType) -> Option<&str> {
        self.by_code.get(&rtype.code()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl Default for ResourceTypeTable {
    fn default() -> Self {
        Self::new()
    }
}
