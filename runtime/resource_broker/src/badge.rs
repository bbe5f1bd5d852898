//! Badge Codec - capability tags for resource handles
//!
//! A badge is the immutable word attached to a capability when the root task
//! mints a handle for a domain. When a request arrives on a badged endpoint,
//! the receiving manager decodes the badge to find the target object and to
//! check what the holder may do with it.
//!
//! # Layout
//! ```text
//!  63      56 55     48 47     40 39              20 19               0
//! ┌──────────┬─────────┬─────────┬──────────────────┬──────────────────┐
//! │   type   │  perms  │  space  │   owning domain  │     object id    │
//! └──────────┴─────────┴─────────┴──────────────────┴──────────────────┘
//! ```
//!
//! Values that do not fit their field are rejected, never truncated.

use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::types::{ResourceKey, ResourceType};
use crate::{DomainId, ObjectId, ResourceError, Result, SpaceId, NULL_OBJECT};

pub const OBJECT_BITS: u32 = 20;
pub const DOMAIN_BITS: u32 = 20;
pub const SPACE_BITS: u32 = 8;
pub const PERM_BITS: u32 = 8;
pub const TYPE_BITS: u32 = 8;

const OBJECT_SHIFT: u32 = 0;
const DOMAIN_SHIFT: u32 = OBJECT_SHIFT + OBJECT_BITS;
const SPACE_SHIFT: u32 = DOMAIN_SHIFT + DOMAIN_BITS;
const PERM_SHIFT: u32 = SPACE_SHIFT + SPACE_BITS;
const TYPE_SHIFT: u32 = PERM_SHIFT + PERM_BITS;

const_assert!(OBJECT_BITS + DOMAIN_BITS + SPACE_BITS + PERM_BITS + TYPE_BITS <= u64::BITS);

/// Largest object id a badge can carry
pub const MAX_OBJECT_ID: ObjectId = (1 << OBJECT_BITS) - 1;

/// Largest domain id a badge can carry
pub const MAX_DOMAIN_ID: DomainId = (1 << DOMAIN_BITS) - 1;

/// Largest space id a badge can carry
pub const MAX_SPACE_ID: SpaceId = (1 << SPACE_BITS) - 1;

const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

bitflags! {
    /// Operations a badge holder may perform on the resource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perms: u8 {
        /// Query the object / use read-only server operations
        const READ = 1 << 0;
        /// Mutate the object; on a null-object endpoint, allocate
        const WRITE = 1 << 1;
        /// Share the handle (take extra references)
        const GRANT = 1 << 2;
        /// Revoke other domains' handles
        const REVOKE = 1 << 3;
    }
}

/// Capability badge: {type, perms, space, owning domain, object}
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Badge(u64);

fn check_width(field: &'static str, value: u64, bits: u32) -> Result<u64> {
    if value > mask(bits) {
        return Err(ResourceError::BadgeOverflow { field, value, bits });
    }
    Ok(value)
}

impl Badge {
    /// Pack the five fields into one word
    ///
    /// # Errors
    /// Returns `BadgeOverflow` naming the first field that does not fit
    pub fn encode(
        rtype: ResourceType,
        perms: Perms,
        space: SpaceId,
        domain: DomainId,
        object: ObjectId,
    ) -> Result<Self> {
        let space = check_width("space id", u64::from(space), SPACE_BITS)?;
        let domain = check_width("domain id", u64::from(domain), DOMAIN_BITS)?;
        let object = check_width("object id", u64::from(object), OBJECT_BITS)?;

        Ok(Self(
            (u64::from(rtype.code()) << TYPE_SHIFT)
                | (u64::from(perms.bits()) << PERM_SHIFT)
                | (space << SPACE_SHIFT)
                | (domain << DOMAIN_SHIFT)
                | (object << OBJECT_SHIFT),
        ))
    }

    /// Badge for a key held by `domain`
    pub fn for_key(key: ResourceKey, perms: Perms, domain: DomainId) -> Result<Self> {
        Self::encode(key.rtype, perms, key.space, domain, key.object)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn resource_type(self) -> ResourceType {
        ResourceType(((self.0 >> TYPE_SHIFT) & mask(TYPE_BITS)) as u8)
    }

    pub const fn perms(self) -> Perms {
        Perms::from_bits_retain(((self.0 >> PERM_SHIFT) & mask(PERM_BITS)) as u8)
    }

    pub const fn space_id(self) -> SpaceId {
        ((self.0 >> SPACE_SHIFT) & mask(SPACE_BITS)) as SpaceId
    }

    pub const fn domain_id(self) -> DomainId {
        ((self.0 >> DOMAIN_SHIFT) & mask(DOMAIN_BITS)) as DomainId
    }

    pub const fn object_id(self) -> ObjectId {
        ((self.0 >> OBJECT_SHIFT) & mask(OBJECT_BITS)) as ObjectId
    }

    /// Endpoint badges carry the null object id
    pub const fn is_null_object(self) -> bool {
        self.object_id() == NULL_OBJECT
    }

    pub const fn key(self) -> ResourceKey {
        ResourceKey::new(self.resource_type(), self.space_id(), self.object_id())
    }

    /// Same badge, naming a different object
    pub fn with_object(self, object: ObjectId) -> Result<Self> {
        Self::encode(
            self.resource_type(),
            self.perms(),
            self.space_id(),
            self.domain_id(),
            object,
        )
    }

    /// Check that the badge grants every permission in `required`
    pub fn require(self, required: Perms) -> Result<()> {
        let granted = self.perms();
        if granted.contains(required) {
            Ok(())
        } else {
            Err(ResourceError::PermissionDenied { required, granted })
        }
    }
}

impl fmt::Debug for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Badge")
            .field("type", &self.resource_type().code())
            .field("perms", &self.perms())
            .field("space", &self.space_id())
            .field("domain", &self.domain_id())
            .field("object", &self.object_id())
            .finish()
    }
}
