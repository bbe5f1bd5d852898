//! Resource Registry - refcounted, id-indexed store of live objects
//!
//! Each resource manager owns exactly one registry. Nodes are created with a
//! reference count of one, gain a reference every time the handle is shared
//! and are freed exactly when the count drops back to zero, after the
//! registry's `on_delete` hook has seen them.
//!
//! Ids run from 1 to the configured maximum; 0 is the null object id and is
//! never handed out. Fresh ids come from a rotating counter that wraps back to
//! 1, skipping ids that are still live.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use crate::badge::Badge;
use crate::{ObjectId, ResourceError, Result, NULL_OBJECT};

/// Hook run on a node's payload right before the node is freed
pub type DeleteHook<T> = Box<dyn FnMut(ObjectId, &mut T)>;

/// One live object
#[derive(Debug)]
pub struct RegistryNode<T> {
    id: ObjectId,
    refcount: u32,
    payload: T,
}

impl<T> RegistryNode<T> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }
}

/// Outcome of dropping one reference
#[derive(Debug, PartialEq, Eq)]
pub enum Release<T> {
    /// The node is still referenced
    Retained(u32),
    /// The count reached zero; the node is gone and this is its payload
    Freed(T),
}

/// Generic refcounted registry
pub struct Registry<T> {
    nodes: HashMap<ObjectId, RegistryNode<T>>,
    /// Next candidate for `next_free_id`
    next_id: ObjectId,
    max_id: ObjectId,
    on_delete: Option<DeleteHook<T>>,
}

impl<T> Registry<T> {
    /// Create an empty registry handing out ids in `1..=max_id`
    ///
    /// A `max_id` of zero is raised to one.
    pub fn new(max_id: ObjectId) -> Self {
        Self {
            nodes: HashMap::new(),
            next_id: 1,
            max_id: max_id.max(1),
            on_delete: None,
        }
    }

    /// Install the destructor hook
    pub fn with_on_delete(mut self, hook: impl FnMut(ObjectId, &mut T) + 'static) -> Self {
        self.on_delete = Some(Box::new(hook));
        self
    }

    pub fn max_id(&self) -> ObjectId {
        self.max_id
    }

    /// Insert a node whose id is already chosen
    ///
    /// # Errors
    /// - `Protocol` if the id is the null id or above the maximum
    /// - `DuplicateId` if the id is live
    pub fn insert(&mut self, id: ObjectId, payload: T) -> Result<&mut RegistryNode<T>> {
        if id == NULL_OBJECT || id > self.max_id {
            return Err(ResourceError::Protocol(format!(
                "object id {} outside 1..={}",
                id, self.max_id
            )));
        }
        if self.nodes.contains_key(&id) {
            return Err(ResourceError::DuplicateId(id));
        }

        Ok(self.nodes.entry(id).or_insert(RegistryNode {
            id,
            refcount: 1,
            payload,
        }))
    }

    /// Find the next free id, advancing the rotating counter past it
    ///
    /// # Errors
    /// Returns `RegistryExhausted` when every id is live
    pub fn next_free_id(&mut self) -> Result<ObjectId> {
        for _ in 0..self.max_id {
            let candidate = self.next_id;
            self.next_id = if candidate >= self.max_id { 1 } else { candidate + 1 };

            if !self.nodes.contains_key(&candidate) {
                return Ok(candidate);
            }
        }

        Err(ResourceError::RegistryExhausted { max: self.max_id })
    }

    /// Insert a node under a freshly chosen id
    pub fn insert_new_id(&mut self, payload: T) -> Result<ObjectId> {
        let id = self.next_free_id()?;
        self.insert(id, payload)?;
        Ok(id)
    }

    pub fn get_by_id(&self, id: ObjectId) -> Option<&RegistryNode<T>> {
        self.nodes.get(&id)
    }

    pub fn get_by_id_mut(&mut self, id: ObjectId) -> Option<&mut RegistryNode<T>> {
        self.nodes.get_mut(&id)
    }

    /// Resolve the object a badge names
    pub fn get_by_badge(&self, badge: Badge) -> Option<&RegistryNode<T>> {
        self.get_by_id(badge.object_id())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Take one more reference, returning the new count
    pub fn inc(&mut self, id: ObjectId) -> Result<u32> {
        let node = self.nodes.get_mut(&id).ok_or(ResourceError::UnknownId(id))?;
        node.refcount += 1;
        Ok(node.refcount)
    }

    /// Drop one reference; at zero the hook runs and the node is freed
    pub fn dec(&mut self, id: ObjectId) -> Result<Release<T>> {
        let node = self.nodes.get_mut(&id).ok_or(ResourceError::UnknownId(id))?;
        node.refcount -= 1;
        if node.refcount > 0 {
            return Ok(Release::Retained(node.refcount));
        }

        Ok(Release::Freed(self.remove(id)?))
    }

    /// Remove a node regardless of its refcount
    pub fn delete(&mut self, id: ObjectId) -> Result<T> {
        self.remove(id)
    }

    fn remove(&mut self, id: ObjectId) -> Result<T> {
        let mut node = self.nodes.remove(&id).ok_or(ResourceError::UnknownId(id))?;
        if let Some(hook) = self.on_delete.as_mut() {
            hook(id, &mut node.payload);
        }
        Ok(node.payload)
    }

    /// Hold a reference for the lifetime of the returned guard
    pub fn pin(&mut self, id: ObjectId) -> Result<Pinned<'_, T>> {
        self.inc(id)?;
        Ok(Pinned { registry: self, id })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Live ids in ascending order
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Live nodes in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &RegistryNode<T>> + '_ {
        let mut nodes: Vec<&RegistryNode<T>> = self.nodes.values().collect();
        nodes.sort_unstable_by_key(|node| node.id);
        nodes.into_iter()
    }
}

/// Scoped reference on a registry node
///
/// Creating the guard takes a reference; dropping it releases that reference
/// again, freeing the node if the guard turned out to be the last holder.
pub struct Pinned<'a, T> {
    registry: &'a mut Registry<T>,
    id: ObjectId,
}

impl<T> Pinned<'_, T> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn refcount(&self) -> u32 {
        self.registry.nodes[&self.id].refcount
    }
}

impl<T> Deref for Pinned<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.registry.nodes[&self.id].payload
    }
}

impl<T> DerefMut for Pinned<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        let id = self.id;
        match self.registry.nodes.get_mut(&id) {
            Some(node) => &mut node.payload,
            None => unreachable!("pinned node {} vanished", id),
        }
    }
}

impl<T> Drop for Pinned<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.registry.dec(self.id) {
            log::error!("releasing pinned object {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    fn tracked(max_id: ObjectId) -> (Registry<&'static str>, Rc<RefCell<Vec<ObjectId>>>) {
        let deleted = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&deleted);
        let registry = Registry::new(max_id).with_on_delete(move |id, _| sink.borrow_mut().push(id));
        (registry, deleted)
    }

    #[test]
    fn test_insert_rejects_duplicates_and_null() {
        let mut registry = Registry::new(8);
        registry.insert(3, "a").unwrap();
        assert_eq!(registry.insert(3, "b").unwrap_err(), ResourceError::DuplicateId(3));
        assert!(matches!(registry.insert(0, "c"), Err(ResourceError::Protocol(_))));
        assert!(matches!(registry.insert(9, "d"), Err(ResourceError::Protocol(_))));
        assert_eq!(*registry.get_by_id(3).unwrap().payload(), "a");
    }

    #[test]
    fn test_dec_frees_at_zero() {
        let (mut registry, deleted) = tracked(8);
        let id = registry.insert_new_id("obj").unwrap();
        assert_eq!(registry.inc(id).unwrap(), 2);

        assert_eq!(registry.dec(id).unwrap(), Release::Retained(1));
        assert!(deleted.borrow().is_empty());

        assert_eq!(registry.dec(id).unwrap(), Release::Freed("obj"));
        assert_eq!(*deleted.borrow(), vec![id]);
        assert!(registry.get_by_id(id).is_none());
        assert!(registry.dec(id).is_err());
    }

    #[test]
    fn test_delete_ignores_refcount() {
        let (mut registry, deleted) = tracked(8);
        let id = registry.insert_new_id("obj").unwrap();
        registry.inc(id).unwrap();
        registry.inc(id).unwrap();

        assert_eq!(registry.delete(id).unwrap(), "obj");
        assert_eq!(*deleted.borrow(), vec![id]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_counter_wraps_and_skips_live_ids() {
        let mut registry = Registry::new(3);
        assert_eq!(registry.insert_new_id("a").unwrap(), 1);
        assert_eq!(registry.insert_new_id("b").unwrap(), 2);
        assert_eq!(registry.insert_new_id("c").unwrap(), 3);
        assert_eq!(
            registry.insert_new_id("d").unwrap_err(),
            ResourceError::RegistryExhausted { max: 3 }
        );

        registry.delete(2).unwrap();
        // counter wrapped to 1, which is live, so 2 is next
        assert_eq!(registry.insert_new_id("e").unwrap(), 2);
    }

    #[test]
    fn test_pinned_releases_on_drop() {
        let (mut registry, deleted) = tracked(4);
        let id = registry.insert_new_id("obj").unwrap();
        {
            let pinned = registry.pin(id).unwrap();
            assert_eq!(pinned.refcount(), 2);
            assert_eq!(*pinned, "obj");
        }
        assert_eq!(registry.get_by_id(id).unwrap().refcount(), 1);
        assert!(deleted.borrow().is_empty());
    }

    #[test]
    fn test_pinned_frees_when_last() {
        let (mut registry, deleted) = tracked(4);
        let id = registry.insert_new_id("obj").unwrap();
        {
            let _pinned = registry.pin(id).unwrap();
        }
        registry.dec(id).unwrap();
        assert_eq!(*deleted.borrow(), vec![id]);
    }

    #[test]
    fn test_get_by_badge() {
        use crate::badge::Perms;
        use crate::types::ResourceType;

        let mut registry = Registry::new(16);
        registry.insert(5, "five").unwrap();
        let badge = Badge::encode(ResourceType::CPU, Perms::READ, 1, 2, 5).unwrap();
        assert_eq!(*registry.get_by_badge(badge).unwrap().payload(), "five");
    }

    #[test]
    fn test_iteration_is_ordered() {
        let mut registry = Registry::new(64);
        for id in [40, 3, 17, 9] {
            registry.insert(id, id).unwrap();
        }
        assert_eq!(registry.ids(), vec![3, 9, 17, 40]);
        let payloads: Vec<u32> = registry.iter().map(|node| *node.payload()).collect();
        assert_eq!(payloads, vec![3, 9, 17, 40]);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Alloc,
        Inc(usize),
        Dec(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Alloc),
            any::<usize>().prop_map(Step::Inc),
            any::<usize>().prop_map(Step::Dec),
        ]
    }

    proptest! {
        #[test]
        fn live_nodes_match_positive_refcounts(steps in proptest::collection::vec(step(), 1..200)) {
            let (mut registry, deleted) = tracked(16);
            let mut model: BTreeMap<ObjectId, u32> = BTreeMap::new();

            for step in steps {
                match step {
                    Step::Alloc => {
                        if let Ok(id) = registry.insert_new_id("x") {
                            prop_assert!(!model.contains_key(&id));
                            model.insert(id, 1);
                        } else {
                            prop_assert_eq!(model.len(), 16);
                        }
                    }
                    Step::Inc(pick) | Step::Dec(pick) if model.is_empty() => {
                        let _ = pick;
                    }
                    Step::Inc(pick) => {
                        let id = *model.keys().nth(pick % model.len()).unwrap();
                        registry.inc(id).unwrap();
                        *model.get_mut(&id).unwrap() += 1;
                    }
                    Step::Dec(pick) => {
                        let id = *model.keys().nth(pick % model.len()).unwrap();
                        let before = deleted.borrow().iter().filter(|d| **d == id).count();
                        registry.dec(id).unwrap();
                        let count = model.get_mut(&id).unwrap();
                        *count -= 1;
                        let after = deleted.borrow().iter().filter(|d| **d == id).count();
                        if *count == 0 {
                            model.remove(&id);
                            prop_assert_eq!(after, before + 1);
                        } else {
                            prop_assert_eq!(after, before);
                        }
                    }
                }

                prop_assert_eq!(registry.ids(), model.keys().copied().collect::<Vec<_>>());
                for (id, count) in &model {
                    prop_assert_eq!(registry.get_by_id(*id).unwrap().refcount(), *count);
                }
            }
        }
    }
}
