use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Kind of an address recorded on a node object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressKind {
    /// Address used for encrypted overlay tunnel traffic.
    Mesh,
    /// Cluster-internal address of the node.
    Internal,
    /// Externally routable address of the node.
    External,
}

/// A typed address entry on a node object.
///
/// The value is kept textual; entries whose value does not parse for the
/// expected address family are treated as absent rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub kind: AddressKind,
    pub address: String,
}

impl NodeAddress {
    /// Mesh address entry for `ip`.
    pub fn mesh(ip: Ipv4Addr) -> Self {
        Self {
            kind: AddressKind::Mesh,
            address: ip.to_string(),
        }
    }
}

/// Cluster-wide node object, referenced by unique name.
///
/// Mutated via read-modify-write; `resource_version` is the
/// optimistic-concurrency token bumped by the store on every update. The
/// manager treats the object as the single source of truth for whether a node
/// already holds a mesh address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeObject {
    pub name: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
}

impl NodeObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_version: 0,
            addresses: Vec::new(),
        }
    }

    /// The node's recorded mesh address: the first mesh-kind entry whose
    /// value is a syntactically valid IPv4 address.
    pub fn mesh_ipv4(&self) -> Option<Ipv4Addr> {
        self.addresses
            .iter()
            .filter(|addr| addr.kind == AddressKind::Mesh)
            .find_map(|addr| addr.address.parse().ok())
    }
}
