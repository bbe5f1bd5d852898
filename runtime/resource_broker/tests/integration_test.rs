//! Integration tests for the complete resource broker
//!
//! These tests drive the coordinator the way the root task does:
//! - Managers connected as resource spaces
//! - Client domains allocating over badged endpoints
//! - Domain termination and manager crashes
//! - Distributed dependency-graph extraction

use resource_broker::*;
use resource_ipc::{RequestMessage, Status};

const OP_SIZE: u16 = 0;
const OP_BIND: u16 = 1;

/// A region of some backing store, optionally backed by another resource
struct Region {
    size: u64,
    backed_by: Vec<ResourceKey>,
}

struct RegionOps;

impl ResourceOps for RegionOps {
    type Object = Region;

    fn new_obj(&mut self, _id: ObjectId, size: u64) -> Result<Region> {
        Ok(Region {
            size,
            backed_by: Vec::new(),
        })
    }

    fn forge_obj(&mut self, id: ObjectId, size: u64) -> Result<Region> {
        self.new_obj(id, size)
    }

    fn dispatch(
        &mut self,
        _sender: Badge,
        region: &mut Region,
        op: u16,
        args: &[u64],
    ) -> Result<Vec<u64>> {
        match op {
            OP_SIZE => Ok(vec![region.size]),
            OP_BIND => {
                let backing = args
                    .first()
                    .map(|raw| Badge::from_raw(*raw).key())
                    .ok_or_else(|| ResourceError::Protocol("bind needs a badge".into()))?;
                region.backed_by.push(backing);
                Ok(Vec::new())
            }
            _ => Err(ResourceError::Protocol(format!("unknown op {}", op))),
        }
    }

    fn required_perms(&self, op: u16) -> Perms {
        match op {
            OP_SIZE => Perms::READ,
            _ => Perms::WRITE,
        }
    }

    fn backing(&self, region: &Region) -> Vec<ResourceKey> {
        region.backed_by.clone()
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn connect_regions(
    coordinator: &mut Coordinator,
    name: &str,
    rtype: ResourceType,
    manager: DomainId,
) -> SpaceId {
    let config = coordinator.component_config(name, rtype);
    let server = Box::new(ResourceComponent::new(config, RegionOps));
    coordinator
        .connect(rtype, manager, server)
        .expect("Failed to connect manager")
        .space
}

fn alloc(coordinator: &mut Coordinator, domain: DomainId, space: SpaceId, size: u64) -> Badge {
    let endpoint = coordinator
        .endpoint_for(domain, space, Perms::all())
        .expect("Failed to mint endpoint");
    let values = coordinator
        .call(domain, endpoint, RequestMessage::alloc(0, size))
        .expect("Call failed")
        .into_result()
        .expect("Allocation refused");
    Badge::from_raw(values[1])
}

fn refcount(coordinator: &Coordinator, badge: Badge) -> Option<u32> {
    coordinator
        .manager(badge.space_id())
        .and_then(|manager| manager.refcount(badge.object_id()))
}

/// Allocation, invocation and release through the coordinator
#[test]
fn test_allocation_through_coordinator() {
    init_logging();
    let mut coordinator = Coordinator::new(BrokerConfig::default());
    let memory = coordinator.spawn_domain("memory").unwrap();
    let client = coordinator.spawn_domain("client").unwrap();
    let space = connect_regions(&mut coordinator, "memory", ResourceType::MEMORY_OBJECT, memory);

    // 1. Allocate over the endpoint
    let region = alloc(&mut coordinator, client, space, 4096);
    assert_eq!(region.domain_id(), client);
    assert_eq!(region.space_id(), space);
    assert!(coordinator.ledger().holds(client, &region.key()));

    // 2. Invoke a server operation on the object badge
    let reply = coordinator
        .call(client, region, RequestMessage::invoke(OP_SIZE, vec![]))
        .unwrap();
    assert_eq!(reply.into_result().unwrap(), vec![4096]);

    // 3. A read-only handle cannot bind
    let reader = coordinator
        .give(memory, region.key(), Perms::READ)
        .unwrap()
        .unwrap();
    let reply = coordinator
        .call(memory, reader, RequestMessage::invoke(OP_BIND, vec![region.raw()]))
        .unwrap();
    assert_eq!(reply.status().unwrap(), Status::PermissionDenied);

    // 4. Releasing both handles frees the object
    coordinator.call(client, region, RequestMessage::dec_ref()).unwrap();
    assert_eq!(refcount(&coordinator, region), Some(1));
    coordinator.call(memory, reader, RequestMessage::dec_ref()).unwrap();
    assert_eq!(refcount(&coordinator, region), None);
    assert!(coordinator.directory().space(space).unwrap().resources().is_empty());
}

/// N held resources across M spaces: exactly one decrement each
#[test]
fn test_cleanup_releases_each_handle_once() {
    init_logging();
    let mut coordinator = Coordinator::new(BrokerConfig::default());
    let manager = coordinator.spawn_domain("regions").unwrap();
    let owner = coordinator.spawn_domain("owner").unwrap();
    let victim = coordinator.spawn_domain("victim").unwrap();
    let block = coordinator.types_mut().register("block").unwrap();
    let a = connect_regions(&mut coordinator, "memory", ResourceType::MEMORY_OBJECT, manager);
    let b = connect_regions(&mut coordinator, "blocks", block, manager);

    // Shared with the owner: must survive with one reference left
    let shared = vec![
        alloc(&mut coordinator, owner, a, 1),
        alloc(&mut coordinator, owner, a, 2),
        alloc(&mut coordinator, owner, b, 3),
    ];
    for badge in &shared {
        coordinator.give(victim, badge.key(), Perms::READ).unwrap();
        assert_eq!(refcount(&coordinator, *badge), Some(2));
    }

    // Private to the victim: must be freed
    let private = vec![
        alloc(&mut coordinator, victim, a, 4),
        alloc(&mut coordinator, victim, b, 5),
    ];

    let report = coordinator.terminate_domain(victim).unwrap();
    assert_eq!(report.decrements.get(&a), Some(&3));
    assert_eq!(report.decrements.get(&b), Some(&2));
    assert_eq!(report.total_decrements(), 5);
    assert!(report.destroyed_spaces.is_empty());

    for badge in &shared {
        assert_eq!(refcount(&coordinator, *badge), Some(1));
    }
    for badge in &private {
        assert_eq!(refcount(&coordinator, *badge), None);
    }
    assert!(coordinator.ledger().domain(victim).unwrap().holds().is_empty());

    // Terminating again changes nothing
    assert_eq!(coordinator.terminate_domain(victim).unwrap(), CleanupReport::default());
    for badge in &shared {
        assert_eq!(refcount(&coordinator, *badge), Some(1));
    }
}

/// A crashed manager unblocks its callers and is released against directly
#[test]
fn test_crashed_manager_cleanup() {
    init_logging();
    let mut coordinator = Coordinator::new(BrokerConfig::default());
    let manager = coordinator.spawn_domain("flaky").unwrap();
    let first = coordinator.spawn_domain("first").unwrap();
    let second = coordinator.spawn_domain("second").unwrap();
    let space = connect_regions(&mut coordinator, "flaky", ResourceType::MEMORY_OBJECT, manager);

    let region = alloc(&mut coordinator, first, space, 64);
    coordinator.give(second, region.key(), Perms::READ).unwrap();
    assert_eq!(refcount(&coordinator, region), Some(2));

    // 1. A call is blocked on the manager when it dies
    let ticket = coordinator
        .submit(first, region, RequestMessage::invoke(OP_SIZE, vec![]))
        .unwrap();
    assert_eq!(coordinator.crash_manager(manager), 1);
    assert!(!coordinator.is_manager_alive(space));

    let reply = coordinator.take_reply(ticket).unwrap();
    assert_eq!(reply.status().unwrap(), Status::PeerDead);

    // 2. New calls fail fast
    let err = coordinator
        .call(first, region, RequestMessage::invoke(OP_SIZE, vec![]))
        .unwrap_err();
    assert_eq!(err, ResourceError::ManagerDead(manager));
    assert_eq!(err.status(), Status::PeerDead);

    // 3. Cleanup decrements directly against the registry
    let report = coordinator.terminate_domain(second).unwrap();
    assert_eq!(report.decrements.get(&space), Some(&1));
    assert_eq!(refcount(&coordinator, region), Some(1));

    // 4. Terminating the manager destroys its space and revokes the handle
    let report = coordinator.terminate_domain(manager).unwrap();
    assert_eq!(report.destroyed_spaces, vec![space]);
    assert!(!coordinator.directory().contains(space));
    assert!(coordinator.manager(space).is_none());
    assert!(!coordinator.ledger().holds(first, &region.key()));
}

/// Destroyed spaces refuse further work
#[test]
fn test_destroyed_space_rejects_requests() {
    init_logging();
    let mut coordinator = Coordinator::new(BrokerConfig::default());
    let manager = coordinator.spawn_domain("regions").unwrap();
    let client = coordinator.spawn_domain("client").unwrap();
    let space = connect_regions(&mut coordinator, "regions", ResourceType::MEMORY_OBJECT, manager);
    let endpoint = coordinator.endpoint_for(client, space, Perms::all()).unwrap();
    let region = alloc(&mut coordinator, client, space, 8);

    let blocked = coordinator
        .submit(client, endpoint, RequestMessage::alloc(0, 8))
        .unwrap();
    coordinator.destroy_space(space).unwrap();

    assert_eq!(
        coordinator.take_reply(blocked).unwrap().status().unwrap(),
        Status::PeerDead
    );
    assert!(!coordinator.ledger().holds(client, &region.key()));
    assert!(!coordinator
        .ledger()
        .holds(manager, &ResourceKey::space_record(space)));

    // a second destroy fails and has nothing left to touch
    assert_eq!(
        coordinator.destroy_space(space),
        Err(ResourceError::SpaceNotFound(space))
    );
    assert_eq!(
        coordinator.call(client, endpoint, RequestMessage::alloc(0, 8)),
        Err(ResourceError::SpaceNotFound(space))
    );
}

/// Per-space limits from the configuration
#[test]
fn test_space_limit_from_config() {
    init_logging();
    let config = BrokerConfig::from_toml_str(
        r#"
        [spaces]
        max_resources_per_space = 2
        "#,
    )
    .unwrap();
    let mut coordinator = Coordinator::new(config);
    let manager = coordinator.spawn_domain("regions").unwrap();
    let client = coordinator.spawn_domain("client").unwrap();
    let space = connect_regions(&mut coordinator, "regions", ResourceType::MEMORY_OBJECT, manager);

    alloc(&mut coordinator, client, space, 1);
    alloc(&mut coordinator, client, space, 2);

    let endpoint = coordinator.endpoint_for(client, space, Perms::all()).unwrap();
    let err = coordinator
        .call(client, endpoint, RequestMessage::alloc(0, 3))
        .unwrap_err();
    assert_eq!(err, ResourceError::SpaceFull { space, limit: 2 });
    assert_eq!(coordinator.manager(space).unwrap().live_objects().len(), 2);
}

/// D1 creates R1 in S1, S1 maps to S2, D1 requests R2 from S2
#[test]
fn test_end_to_end_extraction() {
    init_logging();
    let mut coordinator = Coordinator::new(BrokerConfig::default());
    let fs = coordinator.spawn_domain("fs").unwrap();
    let memory = coordinator.spawn_domain("memory").unwrap();
    let file = coordinator.types_mut().register("file").unwrap();

    let s1 = connect_regions(&mut coordinator, "files", file, fs);
    let s2 = connect_regions(&mut coordinator, "memory", ResourceType::MEMORY_OBJECT, memory);
    coordinator.map_space(s1, s2).unwrap();

    // 1. Allocate R1 locally and R2 from the memory server
    let r1 = alloc(&mut coordinator, fs, s1, 4096);
    let r2 = alloc(&mut coordinator, fs, s2, 4096);

    // 2. Back R1 by R2
    let reply = coordinator
        .call(fs, r1, RequestMessage::invoke(OP_BIND, vec![r2.raw()]))
        .unwrap();
    assert!(reply.is_ok());

    // 3. The file server reports {R1, R2} and the MAP edge
    let r1_id = graph::resource_node_id(&r1.key());
    let r2_id = graph::resource_node_id(&r2.key());
    let subgraph = coordinator.extract_space(s1).unwrap().unwrap();
    assert_eq!(subgraph.node_count(), 2);
    assert!(subgraph.node(&r1_id).is_some());
    assert!(subgraph.node(&r2_id).is_some());
    assert!(subgraph.has_edge(EdgeKind::Map, &r1_id, &r2_id));

    // the memory server has no relations to report
    assert_eq!(coordinator.extract_space(s2).unwrap(), None);

    // 4. Merged with the coordinator's view: one connected graph
    let model = coordinator.extract_model();
    assert!(model.is_connected());
    assert_eq!(model.node_count(), 6);
    assert!(model.has_edge(EdgeKind::Map, &r1_id, &r2_id));
    assert!(model.has_edge(
        EdgeKind::Request,
        &graph::domain_node_id(fs),
        &graph::domain_node_id(memory)
    ));
    assert!(model.has_edge(EdgeKind::Subset, &r2_id, &graph::space_node_id(s2)));
    assert_eq!(
        model.node(&graph::domain_node_id(fs)),
        Some(&GraphNode::Domain {
            id: fs,
            name: Some("fs".to_string())
        })
    );

    // merging the subgraph again adds nothing
    assert_eq!(combine_model_states(&model, &subgraph), model);
}

/// MAP edges without a space mapping behind them are not admitted
#[test]
fn test_unjustified_map_edge_dropped() {
    init_logging();
    let mut coordinator = Coordinator::new(BrokerConfig::default());
    let fs = coordinator.spawn_domain("fs").unwrap();
    let memory = coordinator.spawn_domain("memory").unwrap();
    let file = coordinator.types_mut().register("file").unwrap();
    let s1 = connect_regions(&mut coordinator, "files", file, fs);
    let s2 = connect_regions(&mut coordinator, "memory", ResourceType::MEMORY_OBJECT, memory);

    let r1 = alloc(&mut coordinator, fs, s1, 1);
    let r2 = alloc(&mut coordinator, fs, s2, 1);
    coordinator
        .call(fs, r1, RequestMessage::invoke(OP_BIND, vec![r2.raw()]))
        .unwrap();

    let model = coordinator.extract_model();
    assert!(!model.has_edge(
        EdgeKind::Map,
        &graph::resource_node_id(&r1.key()),
        &graph::resource_node_id(&r2.key())
    ));
    assert_eq!(model.edges().filter(|e| e.kind == EdgeKind::Map).count(), 0);
}

/// MAP edges must land on a resource registered in the target space
#[test]
fn test_map_edge_to_unregistered_resource_dropped() {
    init_logging();
    let mut coordinator = Coordinator::new(BrokerConfig::default());
    let fs = coordinator.spawn_domain("fs").unwrap();
    let memory = coordinator.spawn_domain("memory").unwrap();
    let file = coordinator.types_mut().register("file").unwrap();
    let s1 = connect_regions(&mut coordinator, "files", file, fs);
    let s2 = connect_regions(&mut coordinator, "memory", ResourceType::MEMORY_OBJECT, memory);
    coordinator.map_space(s1, s2).unwrap();

    let r1 = alloc(&mut coordinator, fs, s1, 1);
    let invented = Badge::encode(ResourceType::MEMORY_OBJECT, Perms::READ, s2, fs, 99).unwrap();
    coordinator
        .call(fs, r1, RequestMessage::invoke(OP_BIND, vec![invented.raw()]))
        .unwrap();

    // the file server still reports the edge, the merged model does not
    let subgraph = coordinator.extract_space(s1).unwrap().unwrap();
    assert_eq!(subgraph.edge_count(), 1);

    let model = coordinator.extract_model();
    assert!(model.node(&graph::resource_node_id(&invented.key())).is_none());
    assert_eq!(model.edges().filter(|e| e.kind == EdgeKind::Map).count(), 0);
}

/// Handles are released only by domains that hold them
#[test]
fn test_release_is_bounded_by_the_ledger() {
    init_logging();
    let mut coordinator = Coordinator::new(BrokerConfig::default());
    let memory = coordinator.spawn_domain("memory").unwrap();
    let owner = coordinator.spawn_domain("owner").unwrap();
    let reader = coordinator.spawn_domain("reader").unwrap();
    let space = connect_regions(&mut coordinator, "memory", ResourceType::MEMORY_OBJECT, memory);

    let region = alloc(&mut coordinator, owner, space, 16);
    let shared = coordinator
        .give(reader, region.key(), Perms::READ)
        .unwrap()
        .unwrap();

    // 1. Extra references cannot be taken behind the ledger
    let err = coordinator
        .call(owner, region, RequestMessage::inc_ref())
        .unwrap_err();
    assert_eq!(err.status(), Status::PolicyViolation);

    // 2. One release per held handle
    coordinator.call(owner, region, RequestMessage::dec_ref()).unwrap();
    let err = coordinator
        .call(owner, region, RequestMessage::dec_ref())
        .unwrap_err();
    assert_eq!(err.status(), Status::PolicyViolation);
    assert_eq!(refcount(&coordinator, region), Some(1));

    // 3. The remaining holder still works and its cleanup frees the object
    let reply = coordinator
        .call(reader, shared, RequestMessage::invoke(OP_SIZE, vec![]))
        .unwrap();
    assert_eq!(reply.into_result().unwrap(), vec![16]);
    let report = coordinator.terminate_domain(reader).unwrap();
    assert_eq!(report.decrements.get(&space), Some(&1));
    assert_eq!(refcount(&coordinator, region), None);
}

/// Export is deterministic and names types
#[test]
fn test_export_rows() {
    init_logging();
    let mut coordinator = Coordinator::new(BrokerConfig::default());
    let fs = coordinator.spawn_domain("fs").unwrap();
    let memory = coordinator.spawn_domain("memory").unwrap();
    let file = coordinator.types_mut().register("file").unwrap();
    let s1 = connect_regions(&mut coordinator, "files", file, fs);
    let s2 = connect_regions(&mut coordinator, "memory", ResourceType::MEMORY_OBJECT, memory);
    coordinator.map_space(s1, s2).unwrap();

    let r1 = alloc(&mut coordinator, fs, s1, 1);
    let r2 = alloc(&mut coordinator, fs, s2, 1);
    coordinator
        .call(fs, r1, RequestMessage::invoke(OP_BIND, vec![r2.raw()]))
        .unwrap();

    let first = coordinator.export().unwrap();
    let second = coordinator.export().unwrap();
    assert_eq!(first, second);

    let lines: Vec<&str> = first.lines().collect();
    assert_eq!(lines[0], graph::EXPORT_HEADER);
    assert!(lines.contains(&",,,DOMAIN,PD_1,fs,,"));
    assert!(lines.contains(&format!(",,,SPACE,SPACE_{},,file,{}", s1, s1).as_str()));
    let map_row = format!(
        "{},{},MAP,,,,,",
        graph::resource_node_id(&r1.key()),
        graph::resource_node_id(&r2.key())
    );
    assert!(lines.contains(&map_row.as_str()));
}
