use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::error::RpcError;
use crate::message::{StorageRequest, StorageResponse};
use crate::node::StorageNode;
use crate::permission::Principal;
use crate::traits::{RpcResult, StorageTransport};
use crate::types::NodeId;

// --- 模拟网络配置 ---

/// 单个存储节点的网络行为
#[derive(Debug, Clone)]
pub struct MockNodeConfig {
    /// 基础延迟 (毫秒)
    pub base_latency_ms: u64,
    /// 额外随机延迟的最大值 (毫秒)
    pub jitter_max_ms: u64,
    /// 请求丢失的概率 (0.0 - 1.0)，丢失的请求在超时后返回 Timeout
    pub drop_rate: f64,
    /// 请求直接失败的概率 (0.0 - 1.0)
    pub failure_rate: f64,
}

impl Default for MockNodeConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 0,
            jitter_max_ms: 2,
            drop_rate: 0.0,
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockNetworkHubConfig {
    /// Upper bound for one call, including latency and node-side work
    pub request_timeout_ms: u64,
    /// Fixed seed for drop/failure/jitter decisions
    pub seed: Option<u64>,
}

impl Default for MockNetworkHubConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 200,
            seed: None,
        }
    }
}

// --- 模拟网络核心 ---

/// In-process network between transports and storage nodes.
#[derive(Clone)]
pub struct MockNetworkHub {
    inner: Arc<MockNetworkHubInner>,
}

struct MockNetworkHubInner {
    nodes: RwLock<HashMap<NodeId, Arc<StorageNode>>>,
    node_config: RwLock<HashMap<NodeId, Arc<MockNodeConfig>>>,
    isolated: RwLock<HashSet<NodeId>>,
    hub_config: MockNetworkHubConfig,
    rng: Mutex<StdRng>,
    /// (node, request name) -> requests that reached the node
    delivered: Mutex<HashMap<(NodeId, &'static str), usize>>,
}

impl MockNetworkHubInner {
    fn config_for(&self, node_id: &NodeId) -> Arc<MockNodeConfig> {
        self.node_config
            .read()
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// One sampled fate of a request.
enum Fate {
    Deliver(Duration),
    Drop,
    Fail,
}

impl MockNetworkHub {
    pub fn new(config: MockNetworkHubConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            inner: Arc::new(MockNetworkHubInner {
                nodes: RwLock::new(HashMap::new()),
                node_config: RwLock::new(HashMap::new()),
                isolated: RwLock::new(HashSet::new()),
                hub_config: config,
                rng: Mutex::new(rng),
                delivered: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn register_node(&self, node: Arc<StorageNode>) {
        info!("MockNetwork: registering node {}", node.id());
        self.inner.nodes.write().insert(node.id().clone(), node);
    }

    pub fn unregister_node(&self, node_id: &NodeId) -> Option<Arc<StorageNode>> {
        self.inner.nodes.write().remove(node_id)
    }

    pub fn node(&self, node_id: &NodeId) -> Option<Arc<StorageNode>> {
        self.inner.nodes.read().get(node_id).cloned()
    }

    pub fn update_config(&self, node_id: NodeId, config: MockNodeConfig) {
        self.inner
            .node_config
            .write()
            .insert(node_id, Arc::new(config));
    }

    /// Requests to an isolated node fail as unreachable without touching it.
    pub fn isolate(&self, node_id: &NodeId) {
        info!("MockNetwork: isolating node {}", node_id);
        self.inner.isolated.write().insert(node_id.clone());
    }

    pub fn restore(&self, node_id: &NodeId) {
        info!("MockNetwork: restoring node {}", node_id);
        self.inner.isolated.write().remove(node_id);
    }

    pub fn is_isolated(&self, node_id: &NodeId) -> bool {
        self.inner.isolated.read().contains(node_id)
    }

    /// Transport whose requests carry `principal`.
    pub fn transport(&self, principal: Principal) -> MockTransport {
        MockTransport {
            principal,
            hub_inner: Arc::clone(&self.inner),
        }
    }

    /// Number of `request_name` requests (e.g. "STORE") delivered to `node_id`.
    pub fn delivered(&self, node_id: &NodeId, request_name: &str) -> usize {
        self.inner
            .delivered
            .lock()
            .iter()
            .filter(|((node, name), _)| node == node_id && *name == request_name)
            .map(|(_, count)| *count)
            .sum()
    }
}

// --- 代表单个调用方的网络接口 ---

pub struct MockTransport {
    principal: Principal,
    hub_inner: Arc<MockNetworkHubInner>,
}

impl MockTransport {
    fn sample_fate(&self, target: &NodeId) -> Fate {
        let config = self.hub_inner.config_for(target);
        let mut rng = self.hub_inner.rng.lock();
        if rng.random::<f64>() < config.drop_rate {
            return Fate::Drop;
        }
        if rng.random::<f64>() < config.failure_rate {
            return Fate::Fail;
        }
        let latency_ms = config.base_latency_ms + rng.random_range(0..=config.jitter_max_ms);
        Fate::Deliver(Duration::from_millis(latency_ms))
    }

    async fn deliver(
        &self,
        node: Arc<StorageNode>,
        latency: Duration,
        request: StorageRequest,
    ) -> RpcResult<StorageResponse> {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        // 延迟期间可能被隔离
        if self.hub_inner.isolated.read().contains(node.id()) {
            return Err(RpcError::Network(format!("{} unreachable", node.id())));
        }
        *self
            .hub_inner
            .delivered
            .lock()
            .entry((node.id().clone(), request.name()))
            .or_insert(0) += 1;
        Ok(node.handle(&self.principal, request).await)
    }
}

#[async_trait]
impl StorageTransport for MockTransport {
    async fn call(&self, target: &NodeId, request: StorageRequest) -> RpcResult<StorageResponse> {
        let node = self
            .hub_inner
            .nodes
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| RpcError::NodeNotFound(target.clone()))?;

        if self.hub_inner.isolated.read().contains(target) {
            trace!("MockNetwork: {} is isolated, {} fails", target, request.name());
            return Err(RpcError::Network(format!("{} unreachable", target)));
        }

        let timeout = Duration::from_millis(self.hub_inner.hub_config.request_timeout_ms);
        let deadline = Instant::now() + timeout;
        match self.sample_fate(target) {
            Fate::Drop => {
                debug!(
                    "MockNetwork: dropping {} from {} to {}",
                    request.name(),
                    self.principal,
                    target
                );
                tokio::time::sleep_until(deadline).await;
                Err(RpcError::Timeout)
            }
            Fate::Fail => Err(RpcError::Network(format!(
                "injected failure sending {} to {}",
                request.name(),
                target
            ))),
            Fate::Deliver(latency) => {
                tokio::time::timeout_at(deadline, self.deliver(node, latency, request))
                    .await
                    .map_err(|_| RpcError::Timeout)?
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::node::StorageNodeOptions;
    use crate::permission::AllowAll;
    use crate::storage::{LocalLogStore, LocalLogStoreOptions};
    use crate::types::{Epoch, Esn, LogId};

    fn start_node(dir: &TempDir, name: &str) -> Arc<StorageNode> {
        let options = LocalLogStoreOptions {
            sync_on_write: false,
            ..LocalLogStoreOptions::with_dir(dir.path().join(name))
        };
        StorageNode::start(
            NodeId::new(name),
            LocalLogStore::open(options),
            Arc::new(AllowAll),
            StorageNodeOptions::default(),
        )
    }

    fn get_tail() -> StorageRequest {
        StorageRequest::GetTail {
            log: LogId(1),
            epoch: Epoch(1),
        }
    }

    #[tokio::test]
    async fn test_mock_network_delivers_and_counts() {
        let dir = TempDir::new().unwrap();
        let hub = MockNetworkHub::new(MockNetworkHubConfig::default());
        hub.register_node(start_node(&dir, "a"));
        let transport = hub.transport(Principal::ClusterNode(NodeId::new("seq")));

        let response = transport.call(&NodeId::new("a"), get_tail()).await.unwrap();
        assert_eq!(response, StorageResponse::Tail(Esn::INVALID));
        assert_eq!(hub.delivered(&NodeId::new("a"), "GET_TAIL"), 1);
        assert_eq!(hub.delivered(&NodeId::new("a"), "STORE"), 0);
    }

    #[tokio::test]
    async fn test_nonexistent_target_node() {
        let hub = MockNetworkHub::new(MockNetworkHubConfig::default());
        let transport = hub.transport(Principal::Unauthenticated);
        let result = transport.call(&NodeId::new("ghost"), get_tail()).await;
        assert!(matches!(result, Err(RpcError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_isolate_and_restore() {
        let dir = TempDir::new().unwrap();
        let hub = MockNetworkHub::new(MockNetworkHubConfig::default());
        hub.register_node(start_node(&dir, "a"));
        let transport = hub.transport(Principal::ClusterNode(NodeId::new("seq")));
        let a = NodeId::new("a");

        hub.isolate(&a);
        assert!(matches!(
            transport.call(&a, get_tail()).await,
            Err(RpcError::Network(_))
        ));
        assert_eq!(hub.delivered(&a, "GET_TAIL"), 0);

        hub.restore(&a);
        assert!(transport.call(&a, get_tail()).await.is_ok());
    }

    #[tokio::test]
    async fn test_message_drop_simulation() {
        let dir = TempDir::new().unwrap();
        let hub = MockNetworkHub::new(MockNetworkHubConfig {
            request_timeout_ms: 20,
            seed: Some(7),
        });
        hub.register_node(start_node(&dir, "a"));
        let a = NodeId::new("a");
        hub.update_config(
            a.clone(),
            MockNodeConfig {
                drop_rate: 1.0,
                ..Default::default()
            },
        );
        let transport = hub.transport(Principal::ClusterNode(NodeId::new("seq")));

        let start = Instant::now();
        let result = transport.call(&a, get_tail()).await;
        assert!(matches!(result, Err(RpcError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_latency_simulation() {
        let dir = TempDir::new().unwrap();
        let hub = MockNetworkHub::new(MockNetworkHubConfig::default());
        hub.register_node(start_node(&dir, "a"));
        let a = NodeId::new("a");
        hub.update_config(
            a.clone(),
            MockNodeConfig {
                base_latency_ms: 30,
                jitter_max_ms: 0,
                ..Default::default()
            },
        );
        let transport = hub.transport(Principal::ClusterNode(NodeId::new("seq")));

        let start = Instant::now();
        transport.call(&a, get_tail()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
