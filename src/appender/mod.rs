//! Replication state machine for a single record.
//!
//! An appender sends its record to every node of the copyset at once and
//! commits as soon as `r` distinct nodes acknowledge. A node that times out
//! or fails is graylisted and swapped for a replacement from the selector;
//! the updated copyset travels with the copies sent afterwards.

mod arena;

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub use arena::{AppenderArena, AppenderHandle};

use crate::cancel::Cancellation;
use crate::copyset::CopysetSelector;
use crate::error::{FailReason, RpcError, report};
use crate::message::{StorageRequest, StorageResponse, StoreFlags};
use crate::traits::{RpcResult, StorageTransport};
use crate::types::{Copyset, Lsn, NodeId, Record};

#[derive(Debug, Clone)]
pub struct AppenderOptions {
    /// Deadline for one node's acknowledgment
    pub store_timeout: Duration,
    /// Deadline for the whole append
    pub append_timeout: Duration,
    /// Copyset members that may be swapped out before giving up
    pub max_replacements: usize,
}

impl Default for AppenderOptions {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(300),
            append_timeout: Duration::from_secs(3),
            max_replacements: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppenderState {
    Assigned,
    Sending,
    WaitingAcks,
    Retrying,
    Committed,
    Failed(FailReason),
}

impl AppenderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppenderState::Committed | AppenderState::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Committed(Lsn),
    Failed(FailReason),
}

type StateObserver = Box<dyn Fn(AppenderState) + Send + Sync>;

pub struct Appender {
    record: Record,
    replication: usize,
    state: AppenderState,
    acked: BTreeSet<NodeId>,
    /// Nodes that failed this append; never picked again
    failed: Vec<NodeId>,
    replacements: usize,
    observer: Option<StateObserver>,
}

fn store_copy(
    transport: &dyn StorageTransport,
    node: NodeId,
    record: Record,
    timeout: Duration,
) -> impl Future<Output = (NodeId, RpcResult<StorageResponse>)> + Send + '_ {
    async move {
        let request = StorageRequest::Store {
            record,
            flags: StoreFlags::default(),
        };
        let result = match tokio::time::timeout(timeout, transport.call(&node, request)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        };
        (node, result)
    }
}

enum Wake {
    Cancelled,
    Deadline,
    Reply(Option<(NodeId, RpcResult<StorageResponse>)>),
}

impl Appender {
    pub fn new(record: Record, replication: usize) -> Self {
        Self {
            record,
            replication,
            state: AppenderState::Assigned,
            acked: BTreeSet::new(),
            failed: Vec::new(),
            replacements: 0,
            observer: None,
        }
    }

    /// Called with every state the appender enters.
    pub fn with_observer(mut self, observer: impl Fn(AppenderState) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn lsn(&self) -> Lsn {
        self.record.lsn
    }

    pub fn state(&self) -> AppenderState {
        self.state
    }

    pub fn copyset(&self) -> &Copyset {
        &self.record.copyset
    }

    pub fn acked(&self) -> &BTreeSet<NodeId> {
        &self.acked
    }

    fn transition(&mut self, next: AppenderState) {
        trace!(
            "{}: appender {} {:?} -> {:?}",
            self.record.log, self.record.lsn, self.state, next
        );
        self.state = next;
        if let Some(observer) = &self.observer {
            observer(next);
        }
    }

    fn fail(&mut self, reason: FailReason) -> AppendOutcome {
        debug!(
            "{}: append {} failed: {} ({} acks)",
            self.record.log,
            self.record.lsn,
            reason,
            self.acked.len()
        );
        self.transition(AppenderState::Failed(reason));
        AppendOutcome::Failed(reason)
    }

    /// Swap `failed` out of the copyset.
    fn replace(
        &mut self,
        failed: &NodeId,
        selector: &CopysetSelector,
        options: &AppenderOptions,
    ) -> Result<NodeId, FailReason> {
        self.failed.push(failed.clone());
        if self.replacements >= options.max_replacements {
            warn!(
                "{}: append {} used all {} replacements",
                self.record.log, self.record.lsn, options.max_replacements
            );
            return Err(FailReason::InsufficientNodes);
        }
        self.transition(AppenderState::Retrying);
        let node = selector
            .replacement(self.record.log, &self.record.copyset, &self.failed)
            .map_err(|e| {
                warn!("{}: no replacement for {}: {}", self.record.log, failed, e);
                FailReason::InsufficientNodes
            })?;
        self.record.copyset.replace(failed, node.clone());
        self.replacements += 1;
        debug!(
            "{}: append {} replaced {} with {}, copyset now {}",
            self.record.log, self.record.lsn, failed, node, self.record.copyset
        );
        Ok(node)
    }

    /// Drive the append to a terminal state.
    pub async fn run(
        &mut self,
        transport: &dyn StorageTransport,
        selector: &CopysetSelector,
        options: &AppenderOptions,
        cancel: &mut Cancellation,
    ) -> AppendOutcome {
        if cancel.is_cancelled() {
            return self.fail(FailReason::Cancelled);
        }
        let deadline = Instant::now() + options.append_timeout;

        self.transition(AppenderState::Sending);
        let mut inflight = FuturesUnordered::new();
        for node in self.record.copyset.nodes() {
            inflight.push(store_copy(
                transport,
                node.clone(),
                self.record.clone(),
                options.store_timeout,
            ));
        }
        self.transition(AppenderState::WaitingAcks);

        // 替换节点用尽后记录原因，等在途请求全部结束再失败
        let mut shortfall: Option<FailReason> = None;
        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                reply = inflight.next() => Wake::Reply(reply),
            };
            let (node, result) = match wake {
                Wake::Cancelled => return self.fail(FailReason::Cancelled),
                Wake::Deadline => return self.fail(FailReason::Timeout),
                Wake::Reply(None) => {
                    return self.fail(shortfall.unwrap_or(FailReason::Timeout));
                }
                Wake::Reply(Some(reply)) => reply,
            };

            match result {
                Ok(StorageResponse::Ok | StorageResponse::AlreadyExists) => {
                    selector.report_success(&node);
                    self.acked.insert(node);
                    if self.acked.len() >= self.replication {
                        self.transition(AppenderState::Committed);
                        return AppendOutcome::Committed(self.record.lsn);
                    }
                }
                Ok(StorageResponse::Rejected { sealed }) => {
                    debug!(
                        "{}: {} rejected {}, sealed through {}",
                        self.record.log, node, self.record.lsn, sealed
                    );
                    return self.fail(FailReason::EpochSealed);
                }
                Ok(StorageResponse::Conflict { recovered_in }) => {
                    // 该位置已被恢复流程写过，本 epoch 已经结束
                    debug!(
                        "{}: {} holds a copy of {} recovered in {}",
                        self.record.log, node, self.record.lsn, recovered_in
                    );
                    return self.fail(FailReason::EpochSealed);
                }
                Ok(StorageResponse::Denied(reason)) => {
                    warn!(
                        "{}: {} denied append {}: {}",
                        self.record.log, node, self.record.lsn, reason
                    );
                    return self.fail(FailReason::PermissionDenied);
                }
                other => {
                    match other {
                        Err(e) => report(&e, "store", Some(&node)),
                        Ok(reply) => warn!(
                            "{}: {} answered store of {} with {:?}",
                            self.record.log, node, self.record.lsn, reply
                        ),
                    }
                    selector.report_failure(&node);
                    match self.replace(&node, selector, options) {
                        Ok(substitute) => {
                            inflight.push(store_copy(
                                transport,
                                substitute,
                                self.record.clone(),
                                options.store_timeout,
                            ));
                            self.transition(AppenderState::WaitingAcks);
                        }
                        Err(reason) => shortfall = Some(reason),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio::sync::watch;

    use super::*;
    use crate::copyset::SelectorOptions;
    use crate::mock::{MockCluster, MockNetworkHubConfig, MockNodeConfig};
    use crate::permission::{Action, Principal, StaticPermissionChecker};
    use crate::types::{Epoch, LogId};

    const LOG: LogId = LogId(9);

    fn cluster(dir: &TempDir) -> MockCluster {
        MockCluster::start(
            dir.path(),
            &[
                ("a", "rack1"),
                ("b", "rack1"),
                ("c", "rack2"),
                ("d", "rack2"),
                ("e", "rack3"),
            ],
            3,
            MockNetworkHubConfig::default(),
        )
        .unwrap()
    }

    fn selector(cluster: &MockCluster) -> CopysetSelector {
        CopysetSelector::new(
            &cluster.config,
            SelectorOptions {
                seed: Some(11),
                ..Default::default()
            },
        )
    }

    fn record(esn: u64, nodes: &[&str]) -> Record {
        Record::data(
            LOG,
            Lsn::new(1, esn),
            format!("r{}", esn).into_bytes(),
            Copyset::new(nodes.iter().map(|n| NodeId::new(*n)).collect()),
        )
    }

    fn principal() -> Principal {
        Principal::ClusterNode(NodeId::new("seq"))
    }

    #[tokio::test]
    async fn test_commits_on_r_acks() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir);
        let transport = cluster.transport(principal());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut appender =
            Appender::new(record(1, &["a", "b", "c"]), 3).with_observer(move |s| sink.lock().push(s));

        let outcome = appender
            .run(
                &transport,
                &selector(&cluster),
                &AppenderOptions::default(),
                &mut Cancellation::new(),
            )
            .await;
        assert_eq!(outcome, AppendOutcome::Committed(Lsn::new(1, 1)));
        assert_eq!(appender.acked().len(), 3);
        assert_eq!(cluster.holders(LOG, Lsn::new(1, 1)).len(), 3);
        assert_eq!(
            *seen.lock(),
            vec![
                AppenderState::Sending,
                AppenderState::WaitingAcks,
                AppenderState::Committed
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_member_is_replaced() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir);
        let transport = cluster.transport(principal());
        let selector = selector(&cluster);
        cluster.isolate("c");

        let mut appender = Appender::new(record(2, &["a", "b", "c"]), 3);
        let outcome = appender
            .run(
                &transport,
                &selector,
                &AppenderOptions::default(),
                &mut Cancellation::new(),
            )
            .await;
        assert_eq!(outcome, AppendOutcome::Committed(Lsn::new(1, 2)));
        assert!(!appender.copyset().contains(&NodeId::new("c")));
        assert!(selector.is_graylisted(&NodeId::new("c")));

        let holders = cluster.holders(LOG, Lsn::new(1, 2));
        assert_eq!(holders.len(), 3);
        assert!(!holders.contains(&NodeId::new("c")));
        // 替换节点上的副本携带更新后的 copyset
        let substitute = appender
            .copyset()
            .nodes()
            .iter()
            .find(|n| n.as_str() != "a" && n.as_str() != "b")
            .unwrap()
            .clone();
        let copy = cluster
            .local_record(substitute.as_str(), LOG, Lsn::new(1, 2))
            .unwrap();
        assert_eq!(&copy.copyset, appender.copyset());
    }

    #[tokio::test]
    async fn test_sealed_epoch_fails_append() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir);
        cluster
            .node(&NodeId::new("b"))
            .unwrap()
            .store()
            .seal(LOG, Epoch(1))
            .unwrap();

        let mut appender = Appender::new(record(1, &["a", "b", "c"]), 3);
        let outcome = appender
            .run(
                &cluster.transport(principal()),
                &selector(&cluster),
                &AppenderOptions::default(),
                &mut Cancellation::new(),
            )
            .await;
        assert_eq!(outcome, AppendOutcome::Failed(FailReason::EpochSealed));
        assert_eq!(
            appender.state(),
            AppenderState::Failed(FailReason::EpochSealed)
        );
    }

    #[tokio::test]
    async fn test_insufficient_nodes() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir);
        for node in ["c", "d", "e"] {
            cluster.isolate(node);
        }

        let mut appender = Appender::new(record(1, &["a", "b", "c"]), 3);
        let outcome = appender
            .run(
                &cluster.transport(principal()),
                &selector(&cluster),
                &AppenderOptions::default(),
                &mut Cancellation::new(),
            )
            .await;
        assert_eq!(outcome, AppendOutcome::Failed(FailReason::InsufficientNodes));
        assert_eq!(appender.acked().len(), 2);
    }

    #[tokio::test]
    async fn test_append_deadline() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir);
        for node in ["a", "b", "c", "d", "e"] {
            cluster.hub.update_config(
                NodeId::new(node),
                MockNodeConfig {
                    base_latency_ms: 150,
                    jitter_max_ms: 0,
                    ..Default::default()
                },
            );
        }
        let options = AppenderOptions {
            append_timeout: Duration::from_millis(40),
            ..Default::default()
        };

        let mut appender = Appender::new(record(1, &["a", "b", "c"]), 3);
        let outcome = appender
            .run(
                &cluster.transport(principal()),
                &selector(&cluster),
                &options,
                &mut Cancellation::new(),
            )
            .await;
        assert_eq!(outcome, AppendOutcome::Failed(FailReason::Timeout));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir);
        for node in ["a", "b", "c"] {
            cluster.hub.update_config(
                NodeId::new(node),
                MockNodeConfig {
                    base_latency_ms: 150,
                    jitter_max_ms: 0,
                    ..Default::default()
                },
            );
        }
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let mut appender = Appender::new(record(1, &["a", "b", "c"]), 3);
        let outcome = appender
            .run(
                &cluster.transport(principal()),
                &selector(&cluster),
                &AppenderOptions::default(),
                &mut Cancellation::new().with(rx),
            )
            .await;
        assert_eq!(outcome, AppendOutcome::Failed(FailReason::Cancelled));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let dir = TempDir::new().unwrap();
        let checker = StaticPermissionChecker::new().grant("reader", &[Action::Read]);
        let cluster = MockCluster::start_with_checker(
            dir.path(),
            &[("a", "r1"), ("b", "r2"), ("c", "r3")],
            2,
            MockNetworkHubConfig::default(),
            Arc::new(checker),
        )
        .unwrap();

        let mut appender = Appender::new(record(1, &["a", "b"]), 2);
        let outcome = appender
            .run(
                &cluster.transport(Principal::Authenticated("reader".into())),
                &selector(&cluster),
                &AppenderOptions::default(),
                &mut Cancellation::new(),
            )
            .await;
        assert_eq!(
            outcome,
            AppendOutcome::Failed(FailReason::PermissionDenied)
        );
        assert!(cluster.holders(LOG, Lsn::new(1, 1)).is_empty());
    }
}
