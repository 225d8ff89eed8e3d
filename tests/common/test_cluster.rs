// test_cluster.rs
use std::sync::Arc;
use std::time::Duration;

use replog::appender::AppenderOptions;
use replog::copyset::SelectorOptions;
use replog::epoch_store::MemoryEpochStore;
use replog::mock::{MockCluster, MockNetworkHubConfig};
use replog::permission::{PermissionChecker, Principal};
use replog::recovery::RecoveryOptions;
use replog::retry::RetryPolicy;
use replog::types::{LogId, Lsn, NodeId};
use replog::{DriverOptions, LogDriver, LogReader, ReaderOptions};
use tempfile::TempDir;
use tracing::info;

/// 五个存储节点 a-e，r = 3
pub const FIVE_NODES: &[(&str, &str)] = &[
    ("a", "rack1"),
    ("b", "rack2"),
    ("c", "rack3"),
    ("d", "rack3"),
    ("e", "rack1"),
];

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        deadline: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    }
}

pub fn patient_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: u32::MAX,
        deadline: Duration::from_secs(30),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

pub struct TestCluster {
    // 保持临时目录存活
    _dir: TempDir,
    pub storage: MockCluster,
    pub authority: Arc<MemoryEpochStore>,
}

impl TestCluster {
    pub fn new(nodes: &[(&str, &str)], replication: usize) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = TempDir::new().unwrap();
        let storage =
            MockCluster::start(dir.path(), nodes, replication, MockNetworkHubConfig::default())
                .unwrap();
        info!("TestCluster ready in {:?}", dir.path());
        Self {
            _dir: dir,
            storage,
            authority: Arc::new(MemoryEpochStore::new()),
        }
    }

    pub fn with_checker(
        nodes: &[(&str, &str)],
        replication: usize,
        checker: Arc<dyn PermissionChecker>,
    ) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = TempDir::new().unwrap();
        let storage = MockCluster::start_with_checker(
            dir.path(),
            nodes,
            replication,
            MockNetworkHubConfig::default(),
            checker,
        )
        .unwrap();
        Self {
            _dir: dir,
            storage,
            authority: Arc::new(MemoryEpochStore::new()),
        }
    }

    pub fn driver_options(&self, retry: RetryPolicy) -> DriverOptions {
        DriverOptions {
            window: 64,
            appender: AppenderOptions::default(),
            recovery: RecoveryOptions {
                request_timeout: Duration::from_millis(300),
                retry,
                ..Default::default()
            },
            selector: SelectorOptions {
                seed: Some(42),
                ..Default::default()
            },
        }
    }

    /// A sequencer process named `name`.
    pub fn driver(&self, name: &str) -> LogDriver {
        self.driver_with(
            Principal::ClusterNode(NodeId::new(name)),
            self.driver_options(fast_retry()),
        )
    }

    pub fn driver_with(&self, principal: Principal, options: DriverOptions) -> LogDriver {
        LogDriver::new(
            &self.storage.config,
            Arc::new(self.storage.transport(principal)),
            self.authority.clone(),
            options,
        )
        .unwrap()
    }

    pub fn reader(&self) -> LogReader {
        LogReader::new(
            &self.storage.config,
            Arc::new(
                self.storage
                    .transport(Principal::ClusterNode(NodeId::new("reader"))),
            ),
            self.authority.clone(),
            ReaderOptions::default(),
        )
    }

    pub fn holder_names(&self, log: LogId, lsn: Lsn) -> Vec<String> {
        let mut names: Vec<String> = self
            .storage
            .holders(log, lsn)
            .into_iter()
            .map(|n| n.as_str().to_string())
            .collect();
        names.sort();
        names
    }
}
