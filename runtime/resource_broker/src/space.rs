//! Resource Spaces - namespaces of resources
//!
//! A resource space groups the resources one manager serves under one id.
//! Spaces are themselves resources: the coordinator keeps them in its
//! space-of-spaces, so space `n` is the resource `(resource_space, 0, n)`.
//!
//! Spaces may be *mapped* onto other spaces: `map_space(a, b)` records that
//! resources of `a` are backed by resources of `b` (files backed by blocks,
//! blocks backed by memory). The relation must stay acyclic.
//!
//! # Destruction
//! Destroying a space is two-phase. [`SpaceDirectory::begin_destroy`] marks
//! the space deleting, after which no resource can be created in it and no
//! space can map onto it; the coordinator then sweeps holders and the
//! manager's objects and calls [`SpaceDirectory::finish_destroy`].

use std::collections::{BTreeSet, VecDeque};

use crate::badge::MAX_SPACE_ID;
use crate::registry::Registry;
use crate::types::ResourceType;
use crate::{DomainId, ObjectId, ResourceError, Result, SpaceId};

/// One namespace
#[derive(Debug, Clone)]
pub struct ResourceSpace {
    id: SpaceId,
    rtype: ResourceType,
    manager: DomainId,
    maps_to: BTreeSet<SpaceId>,
    resources: BTreeSet<ObjectId>,
    deleting: bool,
}

impl ResourceSpace {
    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.rtype
    }

    /// Domain running the space's manager
    pub fn manager(&self) -> DomainId {
        self.manager
    }

    /// Spaces backing this one
    pub fn maps_to(&self) -> &BTreeSet<SpaceId> {
        &self.maps_to
    }

    pub fn resources(&self) -> &BTreeSet<ObjectId> {
        &self.resources
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting
    }
}

/// The coordinator's space-of-spaces
pub struct SpaceDirectory {
    spaces: Registry<ResourceSpace>,
    max_resources_per_space: u32,
}

impl SpaceDirectory {
    /// # Arguments
    /// * `max_spaces` - Highest space id (capped by the badge field)
    /// * `max_resources_per_space` - Ids a single space may register
    pub fn new(max_spaces: SpaceId, max_resources_per_space: u32) -> Self {
        Self {
            spaces: Registry::new(max_spaces.min(MAX_SPACE_ID)),
            max_resources_per_space,
        }
    }

    /// Register a new space managed by `manager`
    pub fn connect(&mut self, rtype: ResourceType, manager: DomainId) -> Result<SpaceId> {
        let id = self.spaces.next_free_id()?;
        self.spaces.insert(
            id,
            ResourceSpace {
                id,
                rtype,
                manager,
                maps_to: BTreeSet::new(),
                resources: BTreeSet::new(),
                deleting: false,
            },
        )?;
        log::info!("space {} of type {} connected, managed by domain {}", id, rtype, manager);
        Ok(id)
    }

    pub fn get(&self, id: SpaceId) -> Option<&ResourceSpace> {
        self.spaces.get_by_id(id).map(|node| node.payload())
    }

    /// Like `get`, as an error when missing
    pub fn space(&self, id: SpaceId) -> Result<&ResourceSpace> {
        self.get(id).ok_or(ResourceError::SpaceNotFound(id))
    }

    fn space_mut(&mut self, id: SpaceId) -> Result<&mut ResourceSpace> {
        self.spaces
            .get_by_id_mut(id)
            .map(|node| node.payload_mut())
            .ok_or(ResourceError::SpaceNotFound(id))
    }

    pub fn contains(&self, id: SpaceId) -> bool {
        self.spaces.contains(id)
    }

    /// Register `object` in `space`
    ///
    /// # Returns
    /// False if the id was already registered
    ///
    /// # Errors
    /// - `PolicyViolation` while the space is being destroyed
    /// - `SpaceFull` once the per-space limit is reached
    pub fn create_resource(&mut self, space: SpaceId, object: ObjectId) -> Result<bool> {
        let limit = self.max_resources_per_space;
        let entry = self.space_mut(space)?;
        if entry.deleting {
            return Err(ResourceError::PolicyViolation(format!(
                "space {} is being destroyed",
                space
            )));
        }
        if entry.resources.contains(&object) {
            return Ok(false);
        }
        if entry.resources.len() >= limit as usize {
            return Err(ResourceError::SpaceFull { space, limit });
        }
        Ok(entry.resources.insert(object))
    }

    /// Could one more resource be created in `space` right now?
    pub fn check_admission(&self, space: SpaceId) -> Result<()> {
        let entry = self.space(space)?;
        if entry.deleting {
            return Err(ResourceError::PolicyViolation(format!(
                "space {} is being destroyed",
                space
            )));
        }
        if entry.resources.len() >= self.max_resources_per_space as usize {
            return Err(ResourceError::SpaceFull {
                space,
                limit: self.max_resources_per_space,
            });
        }
        Ok(())
    }

    /// Forget `object`; false if it was not registered
    pub fn remove_resource(&mut self, space: SpaceId, object: ObjectId) -> Result<bool> {
        Ok(self.space_mut(space)?.resources.remove(&object))
    }

    /// Record that `from` is backed by `to`
    ///
    /// # Returns
    /// False if the relation already existed
    ///
    /// # Errors
    /// `PolicyViolation` for self-maps, cycles and spaces being destroyed
    pub fn map_space(&mut self, from: SpaceId, to: SpaceId) -> Result<bool> {
        let target = self.space(to)?;
        if target.deleting {
            return Err(ResourceError::PolicyViolation(format!(
                "space {} is being destroyed",
                to
            )));
        }
        if self.space(from)?.deleting {
            return Err(ResourceError::PolicyViolation(format!(
                "space {} is being destroyed",
                from
            )));
        }
        if from == to {
            return Err(ResourceError::PolicyViolation(format!(
                "space {} cannot map onto itself",
                from
            )));
        }
        if self.reachable(to, from) {
            return Err(ResourceError::PolicyViolation(format!(
                "mapping space {} onto {} would close a cycle",
                from, to
            )));
        }

        let added = self.space_mut(from)?.maps_to.insert(to);
        if added {
            log::debug!("space {} mapped onto space {}", from, to);
        }
        Ok(added)
    }

    /// Is there a chain of map relations leading from `from` to `to`?
    pub fn reachable(&self, from: SpaceId, to: SpaceId) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(space) = self.get(id) {
                queue.extend(space.maps_to.iter().copied());
            }
        }
        false
    }

    /// Is `from` directly mapped onto `to`?
    pub fn maps(&self, from: SpaceId, to: SpaceId) -> bool {
        self.get(from).is_some_and(|space| space.maps_to.contains(&to))
    }

    /// Spaces mapped directly onto `space`
    pub fn dependents_of(&self, space: SpaceId) -> Vec<SpaceId> {
        self.spaces
            .iter()
            .filter(|node| node.payload().maps_to.contains(&space))
            .map(|node| node.id())
            .collect()
    }

    /// Mark `space` deleting and return the ids registered in it
    ///
    /// # Errors
    /// `PolicyViolation` if destruction is already under way; nothing is
    /// changed in that case
    pub fn begin_destroy(&mut self, space: SpaceId) -> Result<BTreeSet<ObjectId>> {
        let entry = self.space_mut(space)?;
        if entry.deleting {
            return Err(ResourceError::PolicyViolation(format!(
                "space {} is already being destroyed",
                space
            )));
        }
        entry.deleting = true;
        log::info!("destroying space {} ({} resources)", space, entry.resources.len());
        Ok(entry.resources.clone())
    }

    /// Drop the record of `space` and every map relation pointing to it
    pub fn finish_destroy(&mut self, space: SpaceId) -> Result<ResourceSpace> {
        let removed = self.spaces.delete(space)?;
        for id in self.spaces.ids() {
            if let Some(node) = self.spaces.get_by_id_mut(id) {
                node.payload_mut().maps_to.remove(&space);
            }
        }
        log::info!("space {} destroyed", space);
        Ok(removed)
    }

    /// Spaces whose manager runs in `domain`
    pub fn spaces_managed_by(&self, domain: DomainId) -> Vec<SpaceId> {
        self.spaces
            .iter()
            .filter(|node| node.payload().manager == domain)
            .map(|node| node.id())
            .collect()
    }

    /// Spaces in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &ResourceSpace> + '_ {
        self.spaces.iter().map(|node| node.payload())
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}
