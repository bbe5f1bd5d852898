//! Domain Ownership Ledger
//!
//! The root task keeps, per domain, the set of resources the domain holds a
//! handle to. Every allocation, give and revoke passes through here, so that
//! on domain termination the coordinator knows exactly which references to
//! release, once each.
//!
//! # Idempotence
//! Operations against a domain that has already been torn down are no-ops:
//! cleanup may race with late allocations or gives, and neither may wedge the
//! root task.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::badge::{Badge, Perms, MAX_DOMAIN_ID};
use crate::types::{ResourceKey, ResourceType};
use crate::{DomainId, ResourceError, Result, COORDINATOR_DOMAIN};

/// What happens to dependents when a domain terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Release only the domain's own handles and destroy the spaces it managed
    #[default]
    LeaveDangling,
    /// Additionally destroy every space that maps to a destroyed space,
    /// recursively
    CascadeDependents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Live,
    Terminated,
}

/// One execution/protection domain and the handles it holds
#[derive(Debug, Clone)]
pub struct Domain {
    id: DomainId,
    name: Option<String>,
    state: DomainState,
    holds: BTreeSet<ResourceKey>,
}

impl Domain {
    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> DomainState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == DomainState::Live
    }

    pub fn holds(&self) -> &BTreeSet<ResourceKey> {
        &self.holds
    }

    /// Does the domain hold anything of this type?
    pub fn holds_type(&self, rtype: ResourceType) -> bool {
        self.holds.iter().any(|key| key.rtype == rtype)
    }
}

/// Result of a successful give
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GiveOutcome {
    pub badge: Badge,
    /// False when the domain already held the resource
    pub newly_held: bool,
}

/// Observer of allocation events
///
/// Resource components report every object they allocate through this trait;
/// the coordinator's ledger is the implementation.
pub trait HoldRecorder {
    /// Record that `domain` holds `key`
    ///
    /// Returns `Ok(false)` when the domain has already been torn down.
    fn record_hold(&mut self, domain: DomainId, key: ResourceKey) -> Result<bool>;
}

/// Should an allocation by `domain` of a `rtype` resource enter the ledger?
///
/// The coordinator's own space records are exempt: recording them would make
/// the space-of-spaces hold a handle to itself.
pub fn should_record(domain: DomainId, rtype: ResourceType) -> bool {
    !(domain == COORDINATOR_DOMAIN && rtype == ResourceType::RESOURCE_SPACE)
}

/// Per-domain record of held resources
#[derive(Debug)]
pub struct DomainLedger {
    domains: BTreeMap<DomainId, Domain>,
    next_id: DomainId,
    max_domains: DomainId,
}

impl DomainLedger {
    /// Create a ledger that already knows the coordinator domain
    ///
    /// # Arguments
    /// * `max_domains` - Highest domain id to hand out (capped by the badge field)
    pub fn new(max_domains: DomainId) -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(
            COORDINATOR_DOMAIN,
            Domain {
                id: COORDINATOR_DOMAIN,
                name: Some("root-task".to_string()),
                state: DomainState::Live,
                holds: BTreeSet::new(),
            },
        );

        Self {
            domains,
            next_id: COORDINATOR_DOMAIN + 1,
            max_domains: max_domains.clamp(1, MAX_DOMAIN_ID),
        }
    }

    /// Start tracking a new domain
    ///
    /// # Errors
    /// Returns `BadgeOverflow` once the domain id space is used up; ids are
    /// never reused because stale badges would otherwise alias the new domain
    pub fn create_domain(&mut self, name: Option<&str>) -> Result<DomainId> {
        let id = self.next_id;
        if id > self.max_domains {
            return Err(ResourceError::BadgeOverflow {
                field: "domain id",
                value: u64::from(id),
                bits: crate::badge::DOMAIN_BITS,
            });
        }
        self.next_id += 1;

        self.domains.insert(
            id,
            Domain {
                id,
                name: name.map(str::to_string),
                state: DomainState::Live,
                holds: BTreeSet::new(),
            },
        );
        log::info!("domain {} ({}) created", id, name.unwrap_or("unnamed"));
        Ok(id)
    }

    pub fn domain(&self, id: DomainId) -> Option<&Domain> {
        self.domains.get(&id)
    }

    pub fn is_live(&self, id: DomainId) -> bool {
        self.domains.get(&id).is_some_and(Domain::is_live)
    }

    fn live_mut(&mut self, id: DomainId) -> Result<Option<&mut Domain>> {
        let domain = self
            .domains
            .get_mut(&id)
            .ok_or(ResourceError::DomainNotFound(id))?;
        Ok(domain.is_live().then_some(domain))
    }

    /// Record `key` for `domain` and mint the domain's badge for it
    ///
    /// # Returns
    /// `None` if the domain has already been torn down
    ///
    /// # Errors
    /// `DomainNotFound` for a domain that never existed
    pub fn give(
        &mut self,
        domain: DomainId,
        key: ResourceKey,
        perms: Perms,
    ) -> Result<Option<GiveOutcome>> {
        let badge = Badge::for_key(key, perms, domain)?;
        let Some(entry) = self.live_mut(domain)? else {
            log::debug!("give of {} to torn-down domain {} ignored", key, domain);
            return Ok(None);
        };

        let newly_held = entry.holds.insert(key);
        Ok(Some(GiveOutcome { badge, newly_held }))
    }

    pub fn holds(&self, domain: DomainId, key: &ResourceKey) -> bool {
        self.domains
            .get(&domain)
            .is_some_and(|d| d.holds.contains(key))
    }

    /// Forget one domain's hold on `key`; false if it did not hold it
    pub fn take(&mut self, domain: DomainId, key: &ResourceKey) -> bool {
        self.domains
            .get_mut(&domain)
            .is_some_and(|d| d.holds.remove(key))
    }

    /// Every domain currently holding `key`
    pub fn holders(&self, key: &ResourceKey) -> Vec<DomainId> {
        self.domains
            .values()
            .filter(|d| d.holds.contains(key))
            .map(|d| d.id)
            .collect()
    }

    /// Remove `key` from every domain, returning who held it
    pub fn revoke_everywhere(&mut self, key: &ResourceKey) -> Vec<DomainId> {
        self.domains
            .values_mut()
            .filter_map(|d| d.holds.remove(key).then_some(d.id))
            .collect()
    }

    /// Mark a domain terminated and hand back everything it held
    ///
    /// # Returns
    /// `None` if the domain was already torn down
    pub fn begin_teardown(&mut self, domain: DomainId) -> Result<Option<BTreeSet<ResourceKey>>> {
        let Some(entry) = self.live_mut(domain)? else {
            return Ok(None);
        };
        entry.state = DomainState::Terminated;
        Ok(Some(std::mem::take(&mut entry.holds)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Domain> + '_ {
        self.domains.values()
    }

    pub fn live_domains(&self) -> impl Iterator<Item = &Domain> + '_ {
        self.domains.values().filter(|d| d.is_live())
    }
}

impl HoldRecorder for DomainLedger {
    fn record_hold(&mut self, domain: DomainId, key: ResourceKey) -> Result<bool> {
        match self.live_mut(domain)? {
            Some(entry) => {
                entry.holds.insert(key);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
