use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{ClusterConfig, NodeDescriptor};
use crate::error::ConfigError;
use crate::node::{StorageNode, StorageNodeOptions};
use crate::permission::{AllowAll, PermissionChecker, Principal};
use crate::storage::{LocalLogStore, LocalLogStoreOptions};
use crate::types::{LogId, Lsn, NodeId, Record};

use super::{MockNetworkHub, MockNetworkHubConfig, MockTransport};

/// Storage nodes wired to one `MockNetworkHub`, each with its own store
/// under `dir/<node id>`.
pub struct MockCluster {
    pub hub: MockNetworkHub,
    pub config: ClusterConfig,
    nodes: Vec<Arc<StorageNode>>,
}

impl MockCluster {
    /// `nodes` is a list of (id, failure domain).
    pub fn start(
        dir: &Path,
        nodes: &[(&str, &str)],
        replication: usize,
        hub_config: MockNetworkHubConfig,
    ) -> Result<Self, ConfigError> {
        Self::start_with_checker(dir, nodes, replication, hub_config, Arc::new(AllowAll))
    }

    pub fn start_with_checker(
        dir: &Path,
        nodes: &[(&str, &str)],
        replication: usize,
        hub_config: MockNetworkHubConfig,
        checker: Arc<dyn PermissionChecker>,
    ) -> Result<Self, ConfigError> {
        let config = ClusterConfig::new(
            nodes
                .iter()
                .map(|(id, domain)| NodeDescriptor::new(*id, *domain))
                .collect(),
            replication,
        )?;

        let hub = MockNetworkHub::new(hub_config);
        let mut started = Vec::with_capacity(nodes.len());
        for descriptor in &config.nodes {
            let options = LocalLogStoreOptions {
                sync_on_write: false,
                ..LocalLogStoreOptions::with_dir(dir.join(descriptor.id.as_str()))
            };
            let node = StorageNode::start(
                descriptor.id.clone(),
                LocalLogStore::open(options),
                checker.clone(),
                StorageNodeOptions::default(),
            );
            hub.register_node(node.clone());
            started.push(node);
        }
        info!(
            "MockCluster: {} nodes up, r={}",
            started.len(),
            config.replication
        );

        Ok(Self {
            hub,
            config,
            nodes: started,
        })
    }

    pub fn node(&self, id: &NodeId) -> Option<&Arc<StorageNode>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn transport(&self, principal: Principal) -> MockTransport {
        self.hub.transport(principal)
    }

    pub fn isolate(&self, id: &str) {
        self.hub.isolate(&NodeId::new(id));
    }

    pub fn restore(&self, id: &str) {
        self.hub.restore(&NodeId::new(id));
    }

    /// Nodes whose local store holds `lsn`, read directly.
    pub fn holders(&self, log: LogId, lsn: Lsn) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.store().read(log, lsn).is_ok())
            .map(|n| n.id().clone())
            .collect()
    }

    /// Copy of `lsn` on the given node, bypassing the network.
    pub fn local_record(&self, id: &str, log: LogId, lsn: Lsn) -> Option<Record> {
        self.node(&NodeId::new(id))?.store().read(log, lsn).ok()
    }
}
