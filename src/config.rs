//! Cluster topology configuration.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::error::NetSortError;

/// Node identifier, the index of a node in the cluster.
pub type NodeId = usize;

/// Address of a single cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeDescriptor {
    #[serde(rename = "serverId")]
    pub id: NodeId,
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: String,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, host: impl Into<String>, port: impl Into<String>) -> Self {
        NodeDescriptor {
            id,
            host: host.into(),
            port: port.into(),
        }
    }

    /// Returns `host:port` suitable for binding or dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({}:{})", self.id, self.host, self.port)
    }
}

/// Ports are strings in the config format but plain integers are accepted as well.
fn deserialize_port<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u16),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(port) => port,
        Port::Number(port) => port.to_string(),
    })
}

#[derive(Deserialize)]
struct RawClusterConfig {
    servers: Vec<NodeDescriptor>,
}

/// Validated cluster topology. Nodes are ordered by id and ids are exactly `0..N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    nodes: Vec<NodeDescriptor>,
}

impl ClusterConfig {
    /// Creates a cluster from node descriptors given in any order.
    pub fn new(mut nodes: Vec<NodeDescriptor>) -> Result<Self, NetSortError> {
        if nodes.is_empty() {
            return Err(NetSortError::InvalidConfig("no servers listed".into()));
        }

        nodes.sort_by_key(|node| node.id);
        for (expected, node) in nodes.iter().enumerate() {
            if node.id != expected {
                return Err(NetSortError::InvalidConfig(format!(
                    "server ids must be unique and cover 0..{}, found {} at position {}",
                    nodes.len(),
                    node.id,
                    expected
                )));
            }
        }

        if !nodes.len().is_power_of_two() {
            return Err(NetSortError::InvalidNodeCount(nodes.len()));
        }

        return Ok(ClusterConfig { nodes });
    }

    /// Loads a cluster from a YAML file.
    pub fn load(path: &Path) -> Result<Self, NetSortError> {
        let content = fs::read_to_string(path).map_err(NetSortError::ConfigRead)?;
        Self::from_yaml(&content)
    }

    /// Parses a cluster from a YAML document of the form `servers: [{serverId, host, port}, ...]`.
    pub fn from_yaml(content: &str) -> Result<Self, NetSortError> {
        let raw: RawClusterConfig = serde_yaml::from_str(content).map_err(NetSortError::ConfigParse)?;
        Self::new(raw.servers)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeDescriptor, NetSortError> {
        self.nodes.get(id).ok_or(NetSortError::UnknownNode(id))
    }

    /// Returns all nodes except `id`.
    pub fn peers_of(&self, id: NodeId) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.iter().filter(move |node| node.id != id)
    }
}
