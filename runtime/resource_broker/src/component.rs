//! Resource Component - generic resource-manager server
//!
//! A resource server is a [`ResourceComponent`] parameterised by a
//! [`ResourceOps`] implementation. The component owns the object registry and
//! does everything generic: badge decoding, permission checks, reference
//! counting, allocation bookkeeping and the extraction control protocol. The
//! ops supply what is specific to the resource: how an object is constructed,
//! what its server operations do and which other resources back it.
//!
//! # Request Handling
//! Requests on a null-object endpoint badge may only allocate. Requests on an
//! object badge address that object. Every synchronous request gets exactly
//! one reply, failures included; `DomainExit` is one-way and never answered.
//!
//! # Example
//! ```ignore
//! let config = ComponentConfig::new("memory", ResourceType::MEMORY_OBJECT);
//! let server = ResourceComponent::new(config, MemoryOps::default());
//! let binding = coordinator.connect(ResourceType::MEMORY_OBJECT, manager, Box::new(server))?;
//! ```

use resource_ipc::{
    ExtractAction, ExtractReply, ExtractRequest, Opcode, ReplyMessage, RequestMessage, Status,
};

use crate::badge::{Badge, Perms, MAX_OBJECT_ID};
use crate::graph::{EdgeKind, ModelState};
use crate::ledger::{should_record, HoldRecorder};
use crate::registry::{Registry, RegistryNode, Release};
use crate::types::{ResourceKey, ResourceType};
use crate::{DomainId, ObjectId, ResourceError, Result, SpaceId, NULL_OBJECT};

/// How the id of a new object is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocId {
    /// Next free id of the registry's rotating counter
    Auto,
    /// Caller-chosen id; fails if it is live
    Fixed(ObjectId),
}

impl AllocId {
    /// Decode the id argument of an allocation request (0 = auto)
    pub fn from_wire(raw: u64) -> Result<Self> {
        match raw {
            0 => Ok(AllocId::Auto),
            raw => ObjectId::try_from(raw)
                .map(AllocId::Fixed)
                .map_err(|_| ResourceError::Protocol(format!("object id {:#x} out of range", raw))),
        }
    }
}

/// Resource-specific behaviour of a component
pub trait ResourceOps {
    type Object;

    /// Construct a new object
    fn new_obj(&mut self, id: ObjectId, ctor_arg: u64) -> Result<Self::Object>;

    /// Materialize an object whose backing state already exists
    ///
    /// Used for resources reconstructed at boot; must not allocate backing
    /// state of its own.
    fn forge_obj(&mut self, id: ObjectId, ctor_arg: u64) -> Result<Self::Object>;

    /// Execute server operation `op` on `obj`
    fn dispatch(
        &mut self,
        sender: Badge,
        obj: &mut Self::Object,
        op: u16,
        args: &[u64],
    ) -> Result<Vec<u64>>;

    /// Permissions a badge needs to invoke `op`
    fn required_perms(&self, _op: u16) -> Perms {
        Perms::READ
    }

    /// Destructor, called once right before the object is freed
    fn on_delete(&mut self, _id: ObjectId, _obj: &mut Self::Object) {}

    /// Resources in other spaces that back `obj`
    fn backing(&self, _obj: &Self::Object) -> Vec<ResourceKey> {
        Vec::new()
    }

    /// Another domain terminated
    fn on_domain_exit(&mut self, _domain: DomainId) {}
}

/// Static description of a component
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    pub name: String,
    pub rtype: ResourceType,
    /// Highest object id the registry hands out
    pub max_objects: ObjectId,
    /// Permissions of the badge minted for the allocating domain
    pub owner_perms: Perms,
}

impl ComponentConfig {
    pub fn new(name: &str, rtype: ResourceType) -> Self {
        Self {
            name: name.to_string(),
            rtype,
            max_objects: MAX_OBJECT_ID,
            owner_perms: Perms::all(),
        }
    }

    pub fn with_max_objects(mut self, max_objects: ObjectId) -> Self {
        self.max_objects = max_objects;
        self
    }
}

/// Generic resource server
pub struct ResourceComponent<O: ResourceOps> {
    config: ComponentConfig,
    space: Option<SpaceId>,
    registry: Registry<O::Object>,
    ops: O,
}

impl<O: ResourceOps> ResourceComponent<O> {
    pub fn new(config: ComponentConfig, ops: O) -> Self {
        let registry = Registry::new(config.max_objects.min(MAX_OBJECT_ID));
        Self {
            config,
            space: None,
            registry,
            ops,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn resource_type(&self) -> ResourceType {
        self.config.rtype
    }

    pub fn space(&self) -> Option<SpaceId> {
        self.space
    }

    /// Attach the component to the space it serves
    pub fn bind(&mut self, space: SpaceId) {
        log::debug!("component '{}' serves space {}", self.config.name, space);
        self.space = Some(space);
    }

    pub fn registry(&self) -> &Registry<O::Object> {
        &self.registry
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    fn bound_space(&self) -> Result<SpaceId> {
        self.space.ok_or_else(|| {
            ResourceError::PolicyViolation(format!(
                "component '{}' is not bound to a space",
                self.config.name
            ))
        })
    }

    fn key(&self, space: SpaceId, object: ObjectId) -> ResourceKey {
        ResourceKey::new(self.config.rtype, space, object)
    }

    fn not_found(&self, object: ObjectId) -> ResourceError {
        ResourceError::ObjectNotFound {
            space: self.space.unwrap_or_default(),
            object,
        }
    }

    /// Allocate an object on behalf of `domain`
    ///
    /// The object is constructed (or forged), inserted with refcount one and
    /// recorded as held by `domain`. If recording fails the object is
    /// destroyed again before the error is returned.
    ///
    /// # Panics
    /// When `AllocId::Auto` finds every id live. A manager that can no longer
    /// name new objects cannot make progress.
    pub fn allocate(
        &mut self,
        ledger: &mut dyn HoldRecorder,
        domain: DomainId,
        id: AllocId,
        forge: bool,
        ctor_arg: u64,
    ) -> Result<(&RegistryNode<O::Object>, Badge)> {
        let space = self.bound_space()?;
        let id = match id {
            AllocId::Fixed(id) => {
                if id == NULL_OBJECT || id > self.registry.max_id() {
                    return Err(ResourceError::Protocol(format!(
                        "object id {} outside 1..={}",
                        id,
                        self.registry.max_id()
                    )));
                }
                if self.registry.contains(id) {
                    return Err(ResourceError::DuplicateId(id));
                }
                id
            }
            AllocId::Auto => match self.registry.next_free_id() {
                Ok(id) => id,
                Err(ResourceError::RegistryExhausted { max }) => {
                    log::error!("component '{}': all {} object ids live", self.config.name, max);
                    panic!("object ids of component '{}' exhausted", self.config.name);
                }
                Err(e) => return Err(e),
            },
        };

        let key = self.key(space, id);
        let badge = Badge::for_key(key, self.config.owner_perms, domain)?;

        let object = if forge {
            self.ops.forge_obj(id, ctor_arg)?
        } else {
            self.ops.new_obj(id, ctor_arg)?
        };
        self.registry.insert(id, object)?;

        if should_record(domain, key.rtype) {
            let recorded = match ledger.record_hold(domain, key) {
                Ok(recorded) => recorded,
                Err(e) => {
                    self.discard(id);
                    return Err(e);
                }
            };
            if !recorded {
                self.discard(id);
                return Err(ResourceError::PolicyViolation(format!(
                    "domain {} is being torn down",
                    domain
                )));
            }
        }

        log::debug!(
            "component '{}' allocated {} for domain {}{}",
            self.config.name,
            key,
            domain,
            if forge { " (forged)" } else { "" }
        );
        let node = self.registry.get_by_id(id).ok_or(ResourceError::UnknownId(id))?;
        Ok((node, badge))
    }

    fn discard(&mut self, id: ObjectId) {
        if let Ok(mut object) = self.registry.delete(id) {
            self.ops.on_delete(id, &mut object);
        }
    }

    /// Take one more reference on `object`
    pub fn inc_ref(&mut self, object: ObjectId) -> Result<u32> {
        if !self.registry.contains(object) {
            return Err(self.not_found(object));
        }
        self.registry.inc(object)
    }

    /// Drop one reference; returns the remaining count (0 = freed)
    pub fn dec_ref(&mut self, object: ObjectId) -> Result<u32> {
        if !self.registry.contains(object) {
            return Err(self.not_found(object));
        }
        match self.registry.dec(object)? {
            Release::Retained(count) => Ok(count),
            Release::Freed(mut payload) => {
                self.ops.on_delete(object, &mut payload);
                log::debug!("component '{}' freed object {}", self.config.name, object);
                Ok(0)
            }
        }
    }

    /// Free `object` regardless of outstanding references
    pub fn force_delete(&mut self, object: ObjectId) -> Result<()> {
        if !self.registry.contains(object) {
            return Err(self.not_found(object));
        }
        let mut payload = self.registry.delete(object)?;
        self.ops.on_delete(object, &mut payload);
        Ok(())
    }

    /// Serve one encoded request arriving on a badged endpoint
    ///
    /// # Returns
    /// The encoded reply, or `None` for one-way requests
    pub fn handle(
        &mut self,
        ledger: &mut dyn HoldRecorder,
        sender: Badge,
        request: &[u8],
    ) -> Option<Vec<u8>> {
        let request = match RequestMessage::decode(request) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("component '{}': undecodable request: {}", self.config.name, e);
                return Some(encode_reply(&ReplyMessage::error(Status::ProtocolError)));
            }
        };

        let result = self.serve(ledger, sender, &request);
        if request.opcode.is_one_way() {
            if let Err(e) = result {
                log::warn!("component '{}': {:?} failed: {}", self.config.name, request.opcode, e);
            }
            return None;
        }

        let reply = match result {
            Ok(values) => ReplyMessage::ok(values),
            Err(e) => {
                log::debug!("component '{}': {:?} from {:?}: {}", self.config.name, request.opcode, sender, e);
                ReplyMessage::error(e.status())
            }
        };
        Some(encode_reply(&reply))
    }

    fn serve(
        &mut self,
        ledger: &mut dyn HoldRecorder,
        sender: Badge,
        request: &RequestMessage,
    ) -> Result<Vec<u64>> {
        let space = self.bound_space()?;
        if sender.space_id() != space || sender.resource_type() != self.config.rtype {
            return Err(ResourceError::Protocol(format!(
                "badge for {}/{} presented to space {}",
                sender.resource_type(),
                sender.space_id(),
                space
            )));
        }

        if request.opcode == Opcode::DomainExit {
            let domain = DomainId::try_from(request.arg(0)?)
                .map_err(|_| ResourceError::Protocol("domain id out of range".into()))?;
            self.ops.on_domain_exit(domain);
            return Ok(Vec::new());
        }

        if sender.is_null_object() {
            if request.opcode != Opcode::Alloc {
                return Err(ResourceError::Protocol(format!(
                    "{:?} needs an object badge",
                    request.opcode
                )));
            }
            sender.require(Perms::WRITE)?;
            let id = AllocId::from_wire(request.arg(0)?)?;
            let ctor_arg = request.arg(1)?;
            let (node, badge) = self.allocate(ledger, sender.domain_id(), id, false, ctor_arg)?;
            return Ok(vec![u64::from(node.id()), badge.raw()]);
        }

        let object = sender.object_id();
        if self.registry.get_by_badge(sender).is_none() {
            return Err(self.not_found(object));
        }

        match request.opcode {
            Opcode::IncRef => {
                sender.require(Perms::GRANT)?;
                Ok(vec![u64::from(self.inc_ref(object)?)])
            }
            Opcode::DecRef => Ok(vec![u64::from(self.dec_ref(object)?)]),
            Opcode::Invoke(op) => {
                sender.require(self.ops.required_perms(op))?;
                let mut pinned = self.registry.pin(object)?;
                self.ops.dispatch(sender, &mut pinned, op, &request.args)
            }
            Opcode::Alloc | Opcode::DomainExit => Err(ResourceError::Protocol(format!(
                "{:?} on an object badge",
                request.opcode
            ))),
        }
    }

    /// Subgraph of `objects` and what backs them
    ///
    /// # Returns
    /// `None` when none of the objects has a backing relation
    pub fn extract_subgraph(&self, objects: &[ObjectId]) -> Result<Option<ModelState>> {
        let space = self.bound_space()?;
        let mut model = ModelState::new();
        let mut relations = 0usize;

        for &object in objects {
            let Some(node) = self.registry.get_by_id(object) else {
                continue;
            };
            let from = model.add_resource_node(self.key(space, object));
            for backing in self.ops.backing(node.payload()) {
                let to = model.add_resource_node(backing);
                if model.add_edge(EdgeKind::Map, &from, &to) {
                    relations += 1;
                }
            }
        }

        Ok((relations > 0).then_some(model))
    }

    /// Serve one encoded request of the extraction control protocol
    pub fn control(&mut self, request: &[u8]) -> Vec<u8> {
        let reply = match ExtractRequest::decode(request) {
            Ok(request) => self.serve_control(&request),
            Err(e) => {
                log::warn!("component '{}': undecodable control request: {}", self.config.name, e);
                ExtractReply::Failed(Status::ProtocolError)
            }
        };

        reply.encode().unwrap_or_else(|e| {
            log::error!("component '{}': control reply: {}", self.config.name, e);
            ExtractReply::Failed(Status::ProtocolError)
                .encode()
                .unwrap_or_default()
        })
    }

    fn serve_control(&mut self, request: &ExtractRequest) -> ExtractReply {
        let ids = &request.object_ids;
        match request.action {
            ExtractAction::Extract => match self.extract_subgraph(ids) {
                Ok(Some(model)) => match model.to_bytes() {
                    Ok(bytes) => ExtractReply::Subgraph(bytes),
                    Err(e) => ExtractReply::Failed(e.status()),
                },
                Ok(None) => ExtractReply::NoData,
                Err(e) => ExtractReply::Failed(e.status()),
            },
            ExtractAction::Free => ack(ids, |id| self.dec_ref(id).map(drop)),
            ExtractAction::Destroy => ack(ids, |id| self.force_delete(id)),
            ExtractAction::Retain => ack(ids, |id| self.inc_ref(id).map(drop)),
        }
    }
}

fn ack(ids: &[ObjectId], mut apply: impl FnMut(ObjectId) -> Result<()>) -> ExtractReply {
    let affected = ids
        .iter()
        .filter(|&&id| match apply(id) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("control action on object {}: {}", id, e);
                false
            }
        })
        .count();
    ExtractReply::Ack {
        affected: affected as u32,
    }
}

fn encode_reply(reply: &ReplyMessage) -> Vec<u8> {
    reply.encode().unwrap_or_else(|e| {
        log::error!("reply does not encode: {}", e);
        ReplyMessage::error(Status::ProtocolError)
            .encode()
            .unwrap_or_default()
    })
}

/// Type-erased view of a resource component, as the coordinator drives it
pub trait Manager {
    fn name(&self) -> &str;

    fn resource_type(&self) -> ResourceType;

    fn space(&self) -> Option<SpaceId>;

    fn bind(&mut self, space: SpaceId);

    /// Serve one encoded request, see [`ResourceComponent::handle`]
    fn handle(
        &mut self,
        ledger: &mut dyn HoldRecorder,
        sender: Badge,
        request: &[u8],
    ) -> Option<Vec<u8>>;

    /// Serve one encoded extraction control request
    fn control(&mut self, request: &[u8]) -> Vec<u8>;

    /// Allocate on behalf of `domain` without a request, returning its badge
    fn allocate_for(
        &mut self,
        ledger: &mut dyn HoldRecorder,
        domain: DomainId,
        id: AllocId,
        forge: bool,
        ctor_arg: u64,
    ) -> Result<Badge>;

    /// Drop one reference without going through a badged request
    fn force_release(&mut self, object: ObjectId) -> Result<u32>;

    fn force_delete(&mut self, object: ObjectId) -> Result<()>;

    fn live_objects(&self) -> Vec<ObjectId>;

    fn refcount(&self, object: ObjectId) -> Option<u32>;
}

impl<O: ResourceOps> Manager for ResourceComponent<O> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn resource_type(&self) -> ResourceType {
        self.config.rtype
    }

    fn space(&self) -> Option<SpaceId> {
        self.space
    }

    fn bind(&mut self, space: SpaceId) {
        ResourceComponent::bind(self, space)
    }

    fn handle(
        &mut self,
        ledger: &mut dyn HoldRecorder,
        sender: Badge,
        request: &[u8],
    ) -> Option<Vec<u8>> {
        ResourceComponent::handle(self, ledger, sender, request)
    }

    fn control(&mut self, request: &[u8]) -> Vec<u8> {
        ResourceComponent::control(self, request)
    }

    fn allocate_for(
        &mut self,
        ledger: &mut dyn HoldRecorder,
        domain: DomainId,
        id: AllocId,
        forge: bool,
        ctor_arg: u64,
    ) -> Result<Badge> {
        self.allocate(ledger, domain, id, forge, ctor_arg)
            .map(|(_, badge)| badge)
    }

    fn force_release(&mut self, object: ObjectId) -> Result<u32> {
        self.dec_ref(object)
    }

    fn force_delete(&mut self, object: ObjectId) -> Result<()> {
        ResourceComponent::force_delete(self, object)
    }

    fn live_objects(&self) -> Vec<ObjectId> {
        self.registry.ids()
    }

    fn refcount(&self, object: ObjectId) -> Option<u32> {
        self.registry.get_by_id(object).map(RegistryNode::refcount)
    }
}
