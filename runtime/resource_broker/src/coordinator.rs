//! Coordinator - the root task's resource authority
//!
//! The coordinator owns everything that crosses manager boundaries: the
//! resource type table, the domain ledger, the space directory, the table of
//! running managers and the calls currently blocked on them.
//!
//! # Call Path
//! ```text
//! call(sender, badge, request)
//!   ├─ badge minted for sender? space exists, not deleting?
//!   ├─ manager alive?  ── no ──▶ PeerDead
//!   ├─ Manager::handle(ledger, badge, bytes)
//!   └─ directory / ledger follow-up (new ids, released holds)
//! ```
//!
//! # Domain Termination
//! [`Coordinator::terminate_domain`] releases every handle the domain held,
//! exactly one decrement each, through the owning manager or, if that manager
//! has crashed, directly against its registry. It then destroys the spaces
//! the domain managed (and, under `cascade_dependents`, every space mapped
//! onto them), answers calls blocked on those managers with `PeerDead` and
//! tells the remaining managers that the domain is gone.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use resource_ipc::{
    ExtractAction, ExtractReply, ExtractRequest, IpcError, Opcode, ReplyMessage, RequestMessage,
    Status,
};

use crate::badge::{Badge, Perms};
use crate::component::{AllocId, ComponentConfig, Manager};
use crate::config::BrokerConfig;
use crate::graph::{combine_model_states, space_node_id, EdgeKind, GraphNode, ModelState};
use crate::ledger::{CleanupPolicy, DomainLedger};
use crate::space::SpaceDirectory;
use crate::types::{ResourceKey, ResourceType, ResourceTypeTable};
use crate::{
    DomainId, ObjectId, ResourceError, Result, SpaceId, COORDINATOR_DOMAIN, NULL_OBJECT,
};

/// Handle on a submitted call whose reply is collected later
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallTicket(u64);

/// Result of connecting a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceBinding {
    pub space: SpaceId,
    /// Null-object endpoint badge minted for the managing domain
    pub endpoint: Badge,
}

/// What one domain termination did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Decrements that took effect, per owning space
    pub decrements: BTreeMap<SpaceId, usize>,
    pub destroyed_spaces: Vec<SpaceId>,
    /// Blocked calls answered with `PeerDead`
    pub unblocked_calls: usize,
}

impl CleanupReport {
    pub fn total_decrements(&self) -> usize {
        self.decrements.values().sum()
    }
}

struct ManagerSlot {
    domain: DomainId,
    server: Box<dyn Manager>,
    alive: bool,
}

struct PendingCall {
    sender: DomainId,
    badge: Badge,
    request: RequestMessage,
}

/// The root task
pub struct Coordinator {
    config: BrokerConfig,
    types: ResourceTypeTable,
    ledger: DomainLedger,
    directory: SpaceDirectory,
    managers: BTreeMap<SpaceId, ManagerSlot>,
    pending: BTreeMap<CallTicket, PendingCall>,
    replies: BTreeMap<CallTicket, ReplyMessage>,
    next_ticket: u64,
    /// (requester, manager domain, type) first-contact observations
    requests: BTreeSet<(DomainId, DomainId, ResourceType)>,
}

impl Coordinator {
    pub fn new(config: BrokerConfig) -> Self {
        log::info!(
            "coordinator up: {} spaces, {} domains, cleanup policy {:?}",
            config.spaces.max_spaces,
            config.domains.max_domains,
            config.cleanup.policy
        );
        Self {
            types: ResourceTypeTable::new(),
            ledger: DomainLedger::new(config.domains.max_domains),
            directory: SpaceDirectory::new(
                config.spaces.max_spaces,
                config.spaces.max_resources_per_space,
            ),
            managers: BTreeMap::new(),
            pending: BTreeMap::new(),
            replies: BTreeMap::new(),
            next_ticket: 1,
            requests: BTreeSet::new(),
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn types(&self) -> &ResourceTypeTable {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut ResourceTypeTable {
        &mut self.types
    }

    pub fn ledger(&self) -> &DomainLedger {
        &self.ledger
    }

    pub fn directory(&self) -> &SpaceDirectory {
        &self.directory
    }

    /// Component configuration with the configured registry size
    pub fn component_config(&self, name: &str, rtype: ResourceType) -> ComponentConfig {
        ComponentConfig::new(name, rtype).with_max_objects(self.config.registry.max_objects)
    }

    pub fn spawn_domain(&mut self, name: &str) -> Result<DomainId> {
        self.ledger.create_domain(Some(name))
    }

    pub fn manager(&self, space: SpaceId) -> Option<&dyn Manager> {
        self.managers.get(&space).map(|slot| slot.server.as_ref())
    }

    pub fn is_manager_alive(&self, space: SpaceId) -> bool {
        self.managers.get(&space).is_some_and(|slot| slot.alive)
    }

    fn check_caller(&self, domain: DomainId) -> Result<()> {
        match self.ledger.domain(domain) {
            None => Err(ResourceError::DomainNotFound(domain)),
            Some(d) if !d.is_live() => Err(ResourceError::PolicyViolation(format!(
                "domain {} has terminated",
                domain
            ))),
            Some(_) => Ok(()),
        }
    }

    fn live_slot(&mut self, space: SpaceId) -> Result<&mut ManagerSlot> {
        let slot = self
            .managers
            .get_mut(&space)
            .ok_or(ResourceError::SpaceNotFound(space))?;
        if !slot.alive {
            return Err(ResourceError::ManagerDead(slot.domain));
        }
        Ok(slot)
    }

    /// Register a namespace served by `server`, running in `manager`
    ///
    /// The managing domain receives the space record as a held resource
    /// unless it is the coordinator itself.
    pub fn connect(
        &mut self,
        rtype: ResourceType,
        manager: DomainId,
        mut server: Box<dyn Manager>,
    ) -> Result<SpaceBinding> {
        self.check_caller(manager)?;
        if server.resource_type() != rtype {
            return Err(ResourceError::Protocol(format!(
                "manager '{}' serves type {}, not {}",
                server.name(),
                server.resource_type(),
                rtype
            )));
        }

        let space = self.directory.connect(rtype, manager)?;
        let endpoint = match Badge::encode(rtype, Perms::all(), space, manager, NULL_OBJECT) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.directory.finish_destroy(space)?;
                return Err(e);
            }
        };
        if manager != COORDINATOR_DOMAIN {
            self.ledger
                .give(manager, ResourceKey::space_record(space), Perms::all())?;
        }

        server.bind(space);
        log::info!(
            "manager '{}' (domain {}) serves space {}",
            server.name(),
            manager,
            space
        );
        self.managers.insert(
            space,
            ManagerSlot {
                domain: manager,
                server,
                alive: true,
            },
        );
        Ok(SpaceBinding { space, endpoint })
    }

    /// Mint an allocation endpoint on `space` for `domain`
    pub fn endpoint_for(&self, domain: DomainId, space: SpaceId, perms: Perms) -> Result<Badge> {
        self.check_caller(domain)?;
        let rtype = self.directory.space(space)?.resource_type();
        Badge::encode(rtype, perms, space, domain, NULL_OBJECT)
    }

    /// Synchronous call from `sender` on `badge`
    ///
    /// # Returns
    /// The manager's reply; failures reported by the manager arrive as a
    /// reply with a non-zero status, failures detected here as `Err`
    pub fn call(
        &mut self,
        sender: DomainId,
        badge: Badge,
        request: RequestMessage,
    ) -> Result<ReplyMessage> {
        self.check_caller(sender)?;
        if badge.domain_id() != sender {
            return Err(ResourceError::PolicyViolation(format!(
                "badge minted for domain {} presented by domain {}",
                badge.domain_id(),
                sender
            )));
        }
        if request.opcode.is_one_way() {
            return Err(ResourceError::Protocol(format!(
                "{:?} is one-way",
                request.opcode
            )));
        }

        let space = badge.space_id();
        let entry = self.directory.space(space)?;
        let (rtype, manager) = (entry.resource_type(), entry.manager());
        if badge.resource_type() != rtype {
            return Err(ResourceError::Protocol(format!(
                "badge of type {} presented to space {} of type {}",
                badge.resource_type(),
                space,
                rtype
            )));
        }

        match request.opcode {
            Opcode::IncRef => {
                return Err(ResourceError::PolicyViolation(format!(
                    "domain {} asked for an extra reference on {}; handles are shared with give",
                    sender,
                    badge.key()
                )));
            }
            Opcode::DecRef if !self.ledger.holds(sender, &badge.key()) => {
                return Err(ResourceError::PolicyViolation(format!(
                    "domain {} does not hold {}",
                    sender,
                    badge.key()
                )));
            }
            _ => {}
        }

        let allocating = request.opcode == Opcode::Alloc && badge.is_null_object();
        if allocating {
            self.directory.check_admission(space)?;
            let first_contact = !self
                .ledger
                .domain(sender)
                .is_some_and(|d| d.holds_type(rtype));
            if sender != manager && first_contact && self.requests.insert((sender, manager, rtype)) {
                log::debug!("domain {} requests type {} from domain {}", sender, rtype, manager);
            }
        }

        let reply = self.dispatch(space, badge, &request)?;
        if reply.is_ok() {
            if allocating {
                let object = reply.value(0)? as ObjectId;
                if let Err(e) = self.directory.create_resource(space, object) {
                    log::warn!("space {}: new object {} not registered: {}", space, object, e);
                }
            } else if request.opcode == Opcode::DecRef {
                self.ledger.take(sender, &badge.key());
                if reply.value(0)? == 0 {
                    self.directory.remove_resource(space, badge.object_id())?;
                }
            }
        }
        Ok(reply)
    }

    fn dispatch(
        &mut self,
        space: SpaceId,
        badge: Badge,
        request: &RequestMessage,
    ) -> Result<ReplyMessage> {
        let bytes = request.encode()?;
        self.live_slot(space)?;
        let slot = self
            .managers
            .get_mut(&space)
            .ok_or(ResourceError::SpaceNotFound(space))?;
        let reply = slot
            .server
            .handle(&mut self.ledger, badge, &bytes)
            .ok_or_else(|| ResourceError::Protocol("manager sent no reply".into()))?;
        Ok(ReplyMessage::decode(&reply)?)
    }

    /// Queue a call; its reply is produced by [`Coordinator::service`]
    pub fn submit(
        &mut self,
        sender: DomainId,
        badge: Badge,
        request: RequestMessage,
    ) -> Result<CallTicket> {
        self.check_caller(sender)?;
        let ticket = CallTicket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.insert(
            ticket,
            PendingCall {
                sender,
                badge,
                request,
            },
        );
        Ok(ticket)
    }

    /// Let the manager of `space` serve every call queued for it
    ///
    /// # Returns
    /// Number of calls answered
    pub fn service(&mut self, space: SpaceId) -> usize {
        let tickets = self.pending_for(space);
        for ticket in &tickets {
            let Some(call) = self.pending.remove(ticket) else {
                continue;
            };
            let reply = self
                .call(call.sender, call.badge, call.request)
                .unwrap_or_else(|e| ReplyMessage::error(e.status()));
            self.replies.insert(*ticket, reply);
        }
        tickets.len()
    }

    /// Collect the reply of a submitted call, once
    pub fn take_reply(&mut self, ticket: CallTicket) -> Option<ReplyMessage> {
        self.replies.remove(&ticket)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn pending_for(&self, space: SpaceId) -> Vec<CallTicket> {
        self.pending
            .iter()
            .filter(|(_, call)| call.badge.space_id() == space)
            .map(|(ticket, _)| *ticket)
            .collect()
    }

    /// Answer every call blocked on `space` with `status`
    fn answer_pending(&mut self, space: SpaceId, status: Status) -> usize {
        let tickets = self.pending_for(space);
        for ticket in &tickets {
            self.pending.remove(ticket);
            self.replies.insert(*ticket, ReplyMessage::error(status));
        }
        tickets.len()
    }

    /// Deliver a one-way request to the manager of `space`
    pub fn notify(&mut self, space: SpaceId, request: RequestMessage) -> Result<()> {
        if !request.opcode.is_one_way() {
            return Err(ResourceError::Protocol(format!(
                "{:?} expects a reply",
                request.opcode
            )));
        }
        let rtype = self.directory.space(space)?.resource_type();
        let badge = Badge::encode(rtype, Perms::READ, space, COORDINATOR_DOMAIN, NULL_OBJECT)?;
        let bytes = request.encode()?;

        self.live_slot(space)?;
        if let Some(slot) = self.managers.get_mut(&space) {
            if slot.server.handle(&mut self.ledger, badge, &bytes).is_some() {
                log::warn!("manager of space {} answered a one-way request", space);
            }
        }
        Ok(())
    }

    fn control(
        &mut self,
        space: SpaceId,
        action: ExtractAction,
        objects: Vec<ObjectId>,
    ) -> Result<ExtractReply> {
        let request = ExtractRequest::new(action, objects).encode()?;
        let slot = self.live_slot(space)?;
        Ok(ExtractReply::decode(&slot.server.control(&request))?)
    }

    /// Materialize an object whose backing state survived a reboot
    pub fn forge_resource(
        &mut self,
        space: SpaceId,
        owner: DomainId,
        object: ObjectId,
        ctor_arg: u64,
    ) -> Result<Badge> {
        self.directory.check_admission(space)?;
        self.live_slot(space)?;
        let slot = self
            .managers
            .get_mut(&space)
            .ok_or(ResourceError::SpaceNotFound(space))?;
        let badge = slot.server.allocate_for(
            &mut self.ledger,
            owner,
            AllocId::Fixed(object),
            true,
            ctor_arg,
        )?;
        self.directory.create_resource(space, object)?;
        Ok(badge)
    }

    /// Give `domain` a handle on `key`
    ///
    /// A domain that did not hold the resource yet takes a new reference on
    /// it.
    ///
    /// # Returns
    /// `None` when `domain` has already been torn down
    pub fn give(&mut self, domain: DomainId, key: ResourceKey, perms: Perms) -> Result<Option<Badge>> {
        let entry = self.directory.space(key.space)?;
        if entry.resource_type() != key.rtype || !entry.resources().contains(&key.object) {
            return Err(ResourceError::ObjectNotFound {
                space: key.space,
                object: key.object,
            });
        }
        self.live_slot(key.space)?;

        let Some(outcome) = self.ledger.give(domain, key, perms)? else {
            return Ok(None);
        };
        if outcome.newly_held {
            let retained = self
                .control(key.space, ExtractAction::Retain, vec![key.object])
                .and_then(acknowledged);
            match retained {
                Ok(1) => {}
                Ok(_) => {
                    self.ledger.take(domain, &key);
                    return Err(ResourceError::ObjectNotFound {
                        space: key.space,
                        object: key.object,
                    });
                }
                Err(e) => {
                    self.ledger.take(domain, &key);
                    return Err(e);
                }
            }
        }
        log::debug!("gave {} to domain {}", key, domain);
        Ok(Some(outcome.badge))
    }

    /// Register a logical id in `space`
    pub fn create_resource(&mut self, space: SpaceId, object: ObjectId) -> Result<bool> {
        self.directory.create_resource(space, object)
    }

    /// Delete a resource outright: revoke it everywhere and destroy the object
    ///
    /// # Returns
    /// The domains that held it
    pub fn delete_resource(&mut self, space: SpaceId, object: ObjectId) -> Result<Vec<DomainId>> {
        let rtype = self.directory.space(space)?.resource_type();
        let key = ResourceKey::new(rtype, space, object);

        let holders = self.ledger.revoke_everywhere(&key);
        self.directory.remove_resource(space, object)?;
        self.destroy_objects(space, vec![object])?;
        log::debug!("deleted {} (held by {:?})", key, holders);
        Ok(holders)
    }

    /// Withdraw `target`'s handle on one resource
    ///
    /// # Returns
    /// False if `target` did not hold it
    pub fn revoke_resource(
        &mut self,
        space: SpaceId,
        object: ObjectId,
        target: DomainId,
    ) -> Result<bool> {
        let rtype = self.directory.space(space)?.resource_type();
        let key = ResourceKey::new(rtype, space, object);
        if !self.ledger.take(target, &key) {
            return Ok(false);
        }
        self.release(space, &[object])?;
        log::debug!("revoked {} from domain {}", key, target);
        Ok(true)
    }

    pub fn map_space(&mut self, from: SpaceId, to: SpaceId) -> Result<bool> {
        self.directory.map_space(from, to)
    }

    /// Drop one reference on each object, via the manager or directly
    ///
    /// # Returns
    /// Number of references actually released
    fn release(&mut self, space: SpaceId, objects: &[ObjectId]) -> Result<usize> {
        let slot = self
            .managers
            .get_mut(&space)
            .ok_or(ResourceError::SpaceNotFound(space))?;
        let released = if slot.alive {
            let reply = self.control(space, ExtractAction::Free, objects.to_vec())?;
            acknowledged(reply)? as usize
        } else {
            log::debug!("manager of space {} is down, releasing directly", space);
            objects
                .iter()
                .filter(|&&object| slot.server.force_release(object).is_ok())
                .count()
        };

        let freed: Vec<ObjectId> = match self.managers.get(&space) {
            Some(slot) => objects
                .iter()
                .copied()
                .filter(|&object| slot.server.refcount(object).is_none())
                .collect(),
            None => Vec::new(),
        };
        for object in freed {
            self.directory.remove_resource(space, object)?;
        }
        Ok(released)
    }

    fn destroy_objects(&mut self, space: SpaceId, objects: Vec<ObjectId>) -> Result<usize> {
        let slot = self
            .managers
            .get_mut(&space)
            .ok_or(ResourceError::SpaceNotFound(space))?;
        if slot.alive {
            let reply = self.control(space, ExtractAction::Destroy, objects)?;
            Ok(acknowledged(reply)? as usize)
        } else {
            Ok(objects
                .into_iter()
                .filter(|&object| slot.server.force_delete(object).is_ok())
                .count())
        }
    }

    /// Tear a space down
    ///
    /// # Errors
    /// `PolicyViolation` if the space is already being destroyed
    pub fn destroy_space(&mut self, space: SpaceId) -> Result<()> {
        self.teardown_space(space).map(drop)
    }

    /// Returns the number of calls unblocked
    fn teardown_space(&mut self, space: SpaceId) -> Result<usize> {
        let mut objects = self.directory.begin_destroy(space)?;
        let rtype = self.directory.space(space)?.resource_type();
        if let Some(slot) = self.managers.get(&space) {
            objects.extend(slot.server.live_objects());
        }

        for &object in &objects {
            self.ledger
                .revoke_everywhere(&ResourceKey::new(rtype, space, object));
        }
        if self.managers.contains_key(&space) {
            match self.destroy_objects(space, objects.into_iter().collect()) {
                Ok(count) => log::debug!("space {}: {} objects destroyed", space, count),
                Err(e) => log::warn!("space {}: destroying objects: {}", space, e),
            }
        }

        self.ledger
            .revoke_everywhere(&ResourceKey::space_record(space));
        let unblocked = self.answer_pending(space, Status::PeerDead);
        self.managers.remove(&space);
        self.directory.finish_destroy(space)?;
        Ok(unblocked)
    }

    /// Liveness monitor signal: every manager running in `domain` died
    ///
    /// # Returns
    /// Number of blocked calls answered with `PeerDead`
    pub fn crash_manager(&mut self, domain: DomainId) -> usize {
        let spaces: Vec<SpaceId> = self
            .managers
            .iter_mut()
            .filter(|(_, slot)| slot.domain == domain && slot.alive)
            .map(|(space, slot)| {
                slot.alive = false;
                *space
            })
            .collect();
        if !spaces.is_empty() {
            log::warn!("managers of domain {} crashed (spaces {:?})", domain, spaces);
        }
        spaces
            .into_iter()
            .map(|space| self.answer_pending(space, Status::PeerDead))
            .sum()
    }

    /// Release everything `domain` held and tear down what it managed
    ///
    /// Terminating a domain twice is a no-op.
    pub fn terminate_domain(&mut self, domain: DomainId) -> Result<CleanupReport> {
        if domain == COORDINATOR_DOMAIN {
            return Err(ResourceError::PolicyViolation(
                "the coordinator cannot be terminated".into(),
            ));
        }
        let Some(held) = self.ledger.begin_teardown(domain)? else {
            log::debug!("domain {} already torn down", domain);
            return Ok(CleanupReport::default());
        };

        let mut report = CleanupReport::default();
        self.pending.retain(|_, call| call.sender != domain);

        let mut by_space: BTreeMap<SpaceId, Vec<ObjectId>> = BTreeMap::new();
        for key in held.iter().filter(|key| !key.is_space_record()) {
            by_space.entry(key.space).or_default().push(key.object);
        }
        for (space, objects) in by_space {
            match self.release(space, &objects) {
                Ok(released) => {
                    if released != objects.len() {
                        log::warn!(
                            "space {}: {} of {} releases took effect",
                            space,
                            released,
                            objects.len()
                        );
                    }
                    report.decrements.insert(space, released);
                }
                Err(e) => log::warn!("domain {}: releasing in space {}: {}", domain, space, e),
            }
        }

        let cascade = self.config.cleanup.policy == CleanupPolicy::CascadeDependents;
        let mut doomed: VecDeque<SpaceId> = self.directory.spaces_managed_by(domain).into();
        let mut visited = BTreeSet::new();
        while let Some(space) = doomed.pop_front() {
            if !visited.insert(space) {
                continue;
            }
            if cascade {
                doomed.extend(self.directory.dependents_of(space));
            }
            match self.teardown_space(space) {
                Ok(unblocked) => {
                    report.unblocked_calls += unblocked;
                    report.destroyed_spaces.push(space);
                }
                Err(e) => log::warn!("domain {}: destroying space {}: {}", domain, space, e),
            }
        }

        self.requests
            .retain(|&(from, to, _)| from != domain && to != domain);

        let survivors: Vec<SpaceId> = self
            .managers
            .iter()
            .filter(|(_, slot)| slot.alive)
            .map(|(space, _)| *space)
            .collect();
        for space in survivors {
            if let Err(e) = self.notify(space, RequestMessage::domain_exit(u64::from(domain))) {
                log::warn!("space {}: exit notice for domain {}: {}", space, domain, e);
            }
        }

        log::info!(
            "domain {} terminated: {} handles released, spaces {:?} destroyed",
            domain,
            report.total_decrements(),
            report.destroyed_spaces
        );
        Ok(report)
    }

    /// Ask the manager of `space` for its dependency subgraph
    pub fn extract_space(&mut self, space: SpaceId) -> Result<Option<ModelState>> {
        let mut objects: BTreeSet<ObjectId> = self.directory.space(space)?.resources().clone();
        objects.extend(self.live_slot(space)?.server.live_objects());

        match self.control(space, ExtractAction::Extract, objects.into_iter().collect())? {
            ExtractReply::Subgraph(bytes) => Ok(Some(ModelState::from_bytes(&bytes)?)),
            ExtractReply::NoData => Ok(None),
            ExtractReply::Failed(status) => Err(IpcError::Remote(status).into()),
            ExtractReply::Ack { .. } => Err(ResourceError::Protocol(
                "manager acknowledged an extract request".into(),
            )),
        }
    }

    /// Keep only what a manager may legitimately report about `space`
    fn admit(&self, space: SpaceId, subgraph: &ModelState) -> ModelState {
        let mut admitted = ModelState::new();
        for node in subgraph.nodes() {
            if let GraphNode::Resource { key } = node {
                if key.space == space {
                    admitted.add_resource_node(*key);
                }
            }
        }

        for edge in subgraph.edges() {
            if edge.kind != EdgeKind::Map {
                continue;
            }
            let (Some(GraphNode::Resource { key: from }), Some(GraphNode::Resource { key: to })) =
                (subgraph.node(&edge.from), subgraph.node(&edge.to))
            else {
                continue;
            };
            let registered = self
                .directory
                .get(to.space)
                .is_some_and(|target| target.resources().contains(&to.object));
            if from.space != space || !self.directory.maps(space, to.space) || !registered {
                log::warn!(
                    "space {}: dropping unjustified MAP edge {} -> {}",
                    space,
                    edge.from,
                    edge.to
                );
                continue;
            }
            let from = admitted.add_resource_node(*from);
            let to = admitted.add_resource_node(*to);
            admitted.add_edge(EdgeKind::Map, &from, &to);
        }
        admitted
    }

    fn domain_node(&self, model: &mut ModelState, domain: DomainId) -> String {
        let name = self.ledger.domain(domain).and_then(|d| d.name());
        model.add_domain_node(domain, name)
    }

    /// The coordinator's own view: holds, space membership and requests
    fn local_model(&self) -> ModelState {
        let mut model = ModelState::new();

        for space in self.directory.iter() {
            let node = model.add_space_node(space.id(), space.resource_type(), space.manager());
            let manager = self.domain_node(&mut model, space.manager());
            model.add_edge(EdgeKind::Hold, &manager, &node);
            for &object in space.resources() {
                let resource = model.add_resource_node(ResourceKey::new(
                    space.resource_type(),
                    space.id(),
                    object,
                ));
                model.add_edge(EdgeKind::Subset, &resource, &node);
            }
        }

        for domain in self.ledger.live_domains() {
            if domain.holds().is_empty() {
                continue;
            }
            let holder = self.domain_node(&mut model, domain.id());
            for key in domain.holds() {
                let held = if key.is_space_record() {
                    space_node_id(key.object)
                } else {
                    model.add_resource_node(*key)
                };
                model.add_edge(EdgeKind::Hold, &holder, &held);
            }
        }

        for &(from, to, _) in &self.requests {
            let from = self.domain_node(&mut model, from);
            let to = self.domain_node(&mut model, to);
            model.add_edge(EdgeKind::Request, &from, &to);
        }
        model
    }

    /// Run one extraction session over every live manager
    pub fn extract_model(&mut self) -> ModelState {
        let mut model = self.local_model();
        let spaces: Vec<SpaceId> = self
            .managers
            .iter()
            .filter(|(_, slot)| slot.alive)
            .map(|(space, _)| *space)
            .collect();

        for space in spaces {
            match self.extract_space(space) {
                Ok(Some(subgraph)) => {
                    let admitted = self.admit(space, &subgraph);
                    model = combine_model_states(&model, &admitted);
                }
                Ok(None) => log::debug!("space {}: nothing to report", space),
                Err(e) => log::warn!("space {}: extraction failed: {}", space, e),
            }
        }
        log::info!(
            "extracted {} nodes, {} edges",
            model.node_count(),
            model.edge_count()
        );
        model
    }

    /// Extract and render the dependency graph for audit tooling
    pub fn export(&mut self) -> Result<String> {
        let model = self.extract_model();
        model.export(Some(&self.types))
    }
}

fn acknowledged(reply: ExtractReply) -> Result<u32> {
    match reply {
        ExtractReply::Ack { affected } => Ok(affected),
        ExtractReply::Failed(status) => Err(IpcError::Remote(status).into()),
        other => Err(ResourceError::Protocol(format!(
            "unexpected control reply {:?}",
            other
        ))),
    }
}
