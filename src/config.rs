use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::types::NodeId;

/// One storage node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    /// Failure domain (rack, zone). Nodes sharing a domain fail together.
    #[serde(default)]
    pub domain: String,
    /// Storage protocol address; unused by in-process clusters
    #[serde(default)]
    pub addr: Option<String>,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            domain: domain.into(),
            addr: None,
        }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }
}

/// Storage set and replication settings shared by every log.
///
/// ```json
/// {
///   "replication": 3,
///   "nodes": [
///     { "id": "a", "domain": "rack1", "addr": "127.0.0.1:7001" },
///     { "id": "b", "domain": "rack2", "addr": "127.0.0.1:7002" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeDescriptor>,
    pub replication: usize,
}

impl ClusterConfig {
    pub fn new(nodes: Vec<NodeDescriptor>, replication: usize) -> Result<Self, ConfigError> {
        let config = Self { nodes, replication };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let config: ClusterConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        info!(
            "Loaded cluster config from {:?}: {} nodes, r={}",
            path,
            config.nodes.len(),
            config.replication
        );
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replication == 0 {
            return Err(ConfigError::Invalid("replication must be at least 1".into()));
        }
        if self.nodes.len() < self.replication {
            return Err(ConfigError::Invalid(format!(
                "{} nodes cannot hold {} copies",
                self.nodes.len(),
                self.replication
            )));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(ConfigError::Invalid(format!("duplicate node {}", node.id)));
            }
        }
        Ok(())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    pub fn domain_of(&self, node: &NodeId) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| &n.id == node)
            .map(|n| n.domain.as_str())
    }

    /// Addresses of nodes that have one.
    pub fn node_map(&self) -> HashMap<NodeId, String> {
        self.nodes
            .iter()
            .filter_map(|n| n.addr.clone().map(|addr| (n.id.clone(), addr)))
            .collect()
    }

    pub fn find(&self, node: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| &n.id == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_config_from_json() {
        let config = ClusterConfig::from_json(
            r#"{
                "replication": 2,
                "nodes": [
                    { "id": "a", "domain": "r1", "addr": "127.0.0.1:7001" },
                    { "id": "b", "domain": "r2" },
                    { "id": "c" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.replication, 2);
        assert_eq!(config.domain_of(&NodeId::new("b")), Some("r2"));
        assert_eq!(config.domain_of(&NodeId::new("c")), Some(""));
        assert_eq!(config.node_map().len(), 1);
    }

    #[test]
    fn test_cluster_config_validation() {
        let nodes = vec![NodeDescriptor::new("a", "r1"), NodeDescriptor::new("b", "r2")];
        assert!(matches!(
            ClusterConfig::new(nodes.clone(), 3),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClusterConfig::new(nodes.clone(), 0),
            Err(ConfigError::Invalid(_))
        ));
        let dup = vec![NodeDescriptor::new("a", "r1"), NodeDescriptor::new("a", "r2")];
        assert!(matches!(
            ClusterConfig::new(dup, 1),
            Err(ConfigError::Invalid(_))
        ));
        assert!(ClusterConfig::new(nodes, 2).is_ok());
        assert!(matches!(
            ClusterConfig::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}
