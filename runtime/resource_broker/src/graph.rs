//! Dependency Graph Exporter
//!
//! Builds a node/edge model of who holds what and what is backed by what:
//!
//! - **HOLD**: domain → resource (or domain → space for space records)
//! - **SUBSET**: resource → the space it lives in
//! - **MAP**: resource → the resource backing it
//! - **REQUEST**: domain → domain it asked for a type it did not hold yet
//!
//! Nodes are keyed by deterministic string ids derived from the entity's
//! identity, so adding the same entity twice is a no-op and models produced
//! independently by different managers merge without duplicates.
//!
//! # Export Format
//! [`ModelState::export`] writes flat comma-separated rows: a header, then
//! one row per node and one row per edge, all in sorted order so that two
//! extraction runs can be diffed line by line.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{ResourceKey, ResourceType, ResourceTypeTable};
use crate::{DomainId, ResourceError, Result, SpaceId};

/// Header row of the export format
pub const EXPORT_HEADER: &str =
    "edge_from,edge_to,edge_type,entity_type,entity_id,domain_name,resource_type,space_id";

pub fn domain_node_id(id: DomainId) -> String {
    format!("PD_{}", id)
}

pub fn resource_node_id(key: &ResourceKey) -> String {
    format!("RES_{}_{}_{}", key.rtype.code(), key.space, key.object)
}

pub fn space_node_id(id: SpaceId) -> String {
    format!("SPACE_{}", id)
}

/// A graph node: one of the three entity kinds
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GraphNode {
    Domain {
        id: DomainId,
        name: Option<String>,
    },
    Resource {
        key: ResourceKey,
    },
    Space {
        id: SpaceId,
        rtype: ResourceType,
        manager: DomainId,
    },
}

impl GraphNode {
    /// Deterministic id of this node
    pub fn node_id(&self) -> String {
        match self {
            GraphNode::Domain { id, .. } => domain_node_id(*id),
            GraphNode::Resource { key } => resource_node_id(key),
            GraphNode::Space { id, .. } => space_node_id(*id),
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            GraphNode::Domain { .. } => "DOMAIN",
            GraphNode::Resource { .. } => "RESOURCE",
            GraphNode::Space { .. } => "SPACE",
        }
    }

    /// Combine two descriptions of the same node
    ///
    /// Symmetric: a known domain name wins over an unknown one, otherwise the
    /// smaller description is kept.
    fn merge(&self, other: &GraphNode) -> GraphNode {
        match (self, other) {
            (GraphNode::Domain { id, name: a }, GraphNode::Domain { name: b, .. }) => {
                let name = match (a, b) {
                    (Some(a), Some(b)) => Some(a.min(b).clone()),
                    (Some(n), None) | (None, Some(n)) => Some(n.clone()),
                    (None, None) => None,
                };
                GraphNode::Domain { id: *id, name }
            }
            _ => self.min(other).clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeKind {
    Hold,
    Subset,
    Map,
    Request,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Hold => "HOLD",
            EdgeKind::Subset => "SUBSET",
            EdgeKind::Map => "MAP",
            EdgeKind::Request => "REQUEST",
        }
    }
}

/// Directed, typed edge between two node ids
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphEdge {
    pub kind: EdgeKind,
    pub from: String,
    pub to: String,
}

/// A (sub)graph produced during one extraction session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelState {
    nodes: BTreeMap<String, GraphNode>,
    edges: BTreeSet<GraphEdge>,
}

impl ModelState {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_node(&mut self, node: GraphNode) -> String {
        let id = node.node_id();
        let merged = match self.nodes.get(&id) {
            Some(existing) => existing.merge(&node),
            None => node,
        };
        self.nodes.insert(id.clone(), merged);
        id
    }

    pub fn add_domain_node(&mut self, id: DomainId, name: Option<&str>) -> String {
        self.add_node(GraphNode::Domain {
            id,
            name: name.map(str::to_string),
        })
    }

    pub fn add_resource_node(&mut self, key: ResourceKey) -> String {
        self.add_node(GraphNode::Resource { key })
    }

    pub fn add_space_node(&mut self, id: SpaceId, rtype: ResourceType, manager: DomainId) -> String {
        self.add_node(GraphNode::Space { id, rtype, manager })
    }

    /// Add an edge between two existing nodes
    ///
    /// Returns false if the edge was already present or an endpoint is
    /// unknown.
    pub fn add_edge(&mut self, kind: EdgeKind, from: &str, to: &str) -> bool {
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
            log::debug!("{} edge {} -> {} has a dangling endpoint", kind.as_str(), from, to);
            return false;
        }
        self.edges.insert(GraphEdge {
            kind,
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    pub fn remove_edge(&mut self, edge: &GraphEdge) -> bool {
        self.edges.remove(edge)
    }

    pub fn has_edge(&self, kind: EdgeKind, from: &str, to: &str) -> bool {
        self.edges.contains(&GraphEdge {
            kind,
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> + '_ {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> + '_ {
        self.edges.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Is the graph one weakly connected component?
    pub fn is_connected(&self) -> bool {
        let Some(start) = self.nodes.keys().next() else {
            return true;
        };

        let mut adjacent: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in &self.edges {
            adjacent.entry(&edge.from).or_default().push(&edge.to);
            adjacent.entry(&edge.to).or_default().push(&edge.from);
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([start.as_str()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for next in adjacent.get(id).into_iter().flatten() {
                if !seen.contains(next) {
                    queue.push_back(next);
                }
            }
        }
        seen.len() == self.nodes.len()
    }

    /// Serialize for the extraction protocol
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(resource_ipc::encode(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(resource_ipc::decode(bytes)?)
    }

    /// Flat, row-oriented dump for audit tooling
    ///
    /// # Arguments
    /// * `types` - Used to print type names instead of codes when given
    pub fn export(&self, types: Option<&ResourceTypeTable>) -> Result<String> {
        let type_name = |rtype: ResourceType| -> String {
            types
                .and_then(|t| t.name_of(rtype))
                .map(str::to_string)
                .unwrap_or_else(|| rtype.code().to_string())
        };

        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(EXPORT_HEADER.split(','))
            .map_err(|e| ResourceError::Export(format!("header: {}", e)))?;

        for (id, node) in &self.nodes {
            let (domain_name, rtype, space) = match node {
                GraphNode::Domain { name, .. } => {
                    (name.clone().unwrap_or_default(), String::new(), String::new())
                }
                GraphNode::Resource { key } => {
                    (String::new(), type_name(key.rtype), key.space.to_string())
                }
                GraphNode::Space { id, rtype, .. } => {
                    (String::new(), type_name(*rtype), id.to_string())
                }
            };
            writer
                .write_record([
                    "",
                    "",
                    "",
                    node.entity_type(),
                    id.as_str(),
                    domain_name.as_str(),
                    rtype.as_str(),
                    space.as_str(),
                ])
                .map_err(|e| ResourceError::Export(format!("node {}: {}", id, e)))?;
        }

        for edge in &self.edges {
            writer
                .write_record([
                    edge.from.as_str(),
                    edge.to.as_str(),
                    edge.kind.as_str(),
                    "",
                    "",
                    "",
                    "",
                    "",
                ])
                .map_err(|e| {
                    ResourceError::Export(format!("edge {} -> {}: {}", edge.from, edge.to, e))
                })?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| ResourceError::Export(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| ResourceError::Export(e.to_string()))
    }
}

/// Merge two models into one
///
/// The result does not depend on argument order, and merging a model with
/// itself returns it unchanged.
pub fn combine_model_states(a: &ModelState, b: &ModelState) -> ModelState {
    let mut merged = a.clone();
    for node in b.nodes.values() {
        merged.add_node(node.clone());
    }
    merged.edges.extend(b.edges.iter().cloned());
    merged
}
