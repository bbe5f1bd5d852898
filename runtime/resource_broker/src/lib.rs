//! Resource Broker - Generic resource-manager framework for the root task
//!
//! # Purpose
//! Every manageable object in the system (memory objects, address spaces,
//! execution contexts, block devices, files, key-value stores) is a
//! *resource* served by a resource manager. This crate is the substrate those
//! managers share: the badge codec, the refcounted registry, the generic
//! resource component, resource spaces (namespaces), the per-domain ownership
//! ledger with its cleanup policy, and the dependency-graph exporter.
//!
//! # Integration Points
//! - Depends on: Resource IPC (request/reply and extraction messages)
//! - Provides to: every resource server (they supply a [`ResourceOps`] impl)
//! - IPC endpoints: one badged endpoint per (space, client domain)
//! - Capabilities required: root task authority over the badge table
//!
//! # Architecture
//! The [`Coordinator`] is the root task. It owns the type table, the
//! [`DomainLedger`], the [`SpaceDirectory`] and one [`Manager`] per resource
//! space. Managers are single-threaded: the coordinator hands each of them
//! exactly one request at a time and routes every allocate/give/revoke event
//! through the ledger so that domain termination can release what the domain
//! held.
//!
//! ```text
//! client domain ──call(badge, request)──▶ Coordinator ──handle──▶ ResourceComponent<O>
//!                                             │                        │
//!                                   DomainLedger, SpaceDirectory   Registry<O::Object>
//! ```
//!
//! # Target
//! Unlike the kernel-facing runtime crates this one links `std`. The
//! registry sits on `std::collections::HashMap`, and the `toml` and `csv`
//! layers behind configuration and audit export need `std` as well.
//!
//! # Testing Strategy
//! - Unit tests: badge layout, registry refcounting, spaces, ledger, graph merge
//! - Property tests: badge round trip, id uniqueness across counter wrap
//! - Integration tests: allocation through the coordinator, cleanup after
//!   manager crashes, distributed extraction

pub mod badge;
pub mod component;
pub mod config;
pub mod coordinator;
pub mod graph;
pub mod ledger;
pub mod registry;
pub mod space;
pub mod types;

pub use badge::{Badge, Perms};
pub use component::{AllocId, ComponentConfig, Manager, ResourceComponent, ResourceOps};
pub use config::{BrokerConfig, ConfigError};
pub use coordinator::{CallTicket, CleanupReport, Coordinator, SpaceBinding};
pub use graph::{combine_model_states, EdgeKind, GraphEdge, GraphNode, ModelState};
pub use ledger::{CleanupPolicy, Domain, DomainLedger, DomainState, GiveOutcome, HoldRecorder};
pub use registry::{Pinned, Registry, RegistryNode, Release};
pub use space::{ResourceSpace, SpaceDirectory};
pub use types::{ResourceKey, ResourceType, ResourceTypeTable};

use resource_ipc::{IpcError, Status};
use thiserror::Error;

/// Execution/protection domain identifier
pub type DomainId = u32;

/// Resource space identifier
pub type SpaceId = u32;

/// Object identifier, unique within one registry
pub type ObjectId = u32;

/// The root task's own domain
pub const COORDINATOR_DOMAIN: DomainId = 0;

/// Space id of the coordinator's space-of-spaces
pub const SPACE_OF_SPACES: SpaceId = 0;

/// Object id carried by endpoint badges that do not name an object
pub const NULL_OBJECT: ObjectId = 0;

/// Error types for resource operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Object {object} not found in space {space}")]
    ObjectNotFound { space: SpaceId, object: ObjectId },

    #[error("No live node with id {0}")]
    UnknownId(ObjectId),

    #[error("Space {0} not found")]
    SpaceNotFound(SpaceId),

    #[error("Domain {0} not found")]
    DomainNotFound(DomainId),

    #[error("Registry exhausted: every id in 1..={max} is live")]
    RegistryExhausted { max: ObjectId },

    #[error("Space {space} reached its limit of {limit} resources")]
    SpaceFull { space: SpaceId, limit: u32 },

    #[error("Resource type table is full")]
    TypeTableFull,

    #[error("{field} value {value:#x} does not fit the {bits}-bit badge field")]
    BadgeOverflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },

    #[error("Id {0} is already in use")]
    DuplicateId(ObjectId),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Permission denied: operation needs {required:?}, badge grants {granted:?}")]
    PermissionDenied { required: Perms, granted: Perms },

    #[error("Resource manager of domain {0} is not running")]
    ManagerDead(DomainId),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Export failed: {0}")]
    Export(String),
}

/// Error classes of the taxonomy, one per wire status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Protocol,
    NotFound,
    Exhaustion,
    PolicyViolation,
    PermissionDenied,
    PeerDead,
}

impl ResourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResourceError::Protocol(_) | ResourceError::Export(_) => ErrorKind::Protocol,
            ResourceError::ObjectNotFound { .. }
            | ResourceError::UnknownId(_)
            | ResourceError::SpaceNotFound(_)
            | ResourceError::DomainNotFound(_) => ErrorKind::NotFound,
            ResourceError::RegistryExhausted { .. }
            | ResourceError::SpaceFull { .. }
            | ResourceError::TypeTableFull
            | ResourceError::BadgeOverflow { .. } => ErrorKind::Exhaustion,
            ResourceError::DuplicateId(_) | ResourceError::PolicyViolation(_) => {
                ErrorKind::PolicyViolation
            }
            ResourceError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            ResourceError::ManagerDead(_) => ErrorKind::PeerDead,
            ResourceError::Ipc(IpcError::Remote(status)) => match status {
                Status::NotFound => ErrorKind::NotFound,
                Status::Exhausted => ErrorKind::Exhaustion,
                Status::PolicyViolation => ErrorKind::PolicyViolation,
                Status::PermissionDenied => ErrorKind::PermissionDenied,
                Status::PeerDead => ErrorKind::PeerDead,
                Status::Ok | Status::ProtocolError => ErrorKind::Protocol,
            },
            ResourceError::Ipc(_) => ErrorKind::Protocol,
        }
    }

    /// Status code reported on the wire for this error
    pub fn status(&self) -> Status {
        match self.kind() {
            ErrorKind::Protocol => Status::ProtocolError,
            ErrorKind::NotFound => Status::NotFound,
            ErrorKind::Exhaustion => Status::Exhausted,
            ErrorKind::PolicyViolation => Status::PolicyViolation,
            ErrorKind::PermissionDenied => Status::PermissionDenied,
            ErrorKind::PeerDead => Status::PeerDead,
        }
    }
}

pub type Result<T> = core::result::Result<T, ResourceError>;
