// recovery_test.rs
pub mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use replog::appender::{AppendOutcome, Appender, AppenderOptions};
use replog::cancel::Cancellation;
use replog::copyset::{CopysetSelector, SelectorOptions};
use replog::epoch_store::MemoryEpochStore;
use replog::error::{
    ClientError, EpochStoreError, FailReason, RecoveryError, RecoveryPhase, SequencerError,
};
use replog::permission::Principal;
use replog::recovery::{EpochRecovery, RecoveryOptions};
use replog::sequencer::{Assignment, Sequencer, SequencerState};
use replog::traits::{EpochAuthority, EpochStoreResult, StorageTransport};
use replog::types::{Copyset, Epoch, Esn, LogId, Lsn, NodeId, Record};

use crate::common::test_cluster::{FIVE_NODES, TestCluster, fast_retry, patient_retry};

const LOG: LogId = LogId(7);

/// A sequencer with its own appenders, for tests that need to pick copysets
/// or leave positions unwritten.
struct Writer {
    sequencer: Sequencer,
    transport: Arc<dyn StorageTransport>,
    selector: CopysetSelector,
    replication: usize,
    _shutdown: watch::Sender<bool>,
}

impl Writer {
    fn new(cluster: &TestCluster, name: &str) -> Self {
        let transport: Arc<dyn StorageTransport> = Arc::new(
            cluster
                .storage
                .transport(Principal::ClusterNode(NodeId::new(name))),
        );
        let recovery = EpochRecovery::new(
            &cluster.storage.config,
            transport.clone(),
            RecoveryOptions {
                request_timeout: Duration::from_millis(300),
                retry: fast_retry(),
                ..Default::default()
            },
        )
        .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            sequencer: Sequencer::new(
                LOG,
                cluster.authority.clone(),
                Arc::new(recovery),
                shutdown_rx,
            ),
            transport,
            selector: CopysetSelector::new(
                &cluster.storage.config,
                SelectorOptions {
                    seed: Some(3),
                    ..Default::default()
                },
            ),
            replication: cluster.storage.config.replication,
            _shutdown: shutdown_tx,
        }
    }

    async fn activate(&self) -> Epoch {
        self.sequencer.activate().await.unwrap()
    }

    async fn write(
        &self,
        assignment: Assignment,
        copyset: Copyset,
        payload: &[u8],
    ) -> AppendOutcome {
        let record = Record::data(LOG, assignment.lsn, payload.to_vec(), copyset);
        let mut cancel = Cancellation::new().with(assignment.cancel);
        Appender::new(record, self.replication)
            .run(
                self.transport.as_ref(),
                &self.selector,
                &AppenderOptions::default(),
                &mut cancel,
            )
            .await
    }

    async fn append_to(&self, nodes: &[&str], payload: &[u8]) -> AppendOutcome {
        let assignment = self.sequencer.assign().unwrap();
        let copyset = Copyset::new(nodes.iter().map(|n| NodeId::new(*n)).collect());
        self.write(assignment, copyset, payload).await
    }

    async fn append(&self, payload: &[u8]) -> AppendOutcome {
        let assignment = self.sequencer.assign().unwrap();
        let copyset = self.selector.select(LOG, self.replication).unwrap();
        self.write(assignment, copyset, payload).await
    }
}

fn names(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_failover_keeps_records_committed_before_crash() {
    let cluster = TestCluster::new(FIVE_NODES, 3);
    let first = Writer::new(&cluster, "seq-1");
    assert_eq!(first.activate().await, Epoch(1));

    let lsn1 = Lsn::new(1, 1);
    assert_eq!(
        first.append_to(&["a", "b", "c"], b"one").await,
        AppendOutcome::Committed(lsn1)
    );
    assert_eq!(cluster.holder_names(LOG, lsn1), names(&["a", "b", "c"]));

    // c 不可达，d 是唯一来自新故障域的替换节点
    cluster.storage.isolate("c");
    let lsn2 = Lsn::new(1, 2);
    assert_eq!(
        first.append_to(&["a", "b", "c"], b"two").await,
        AppendOutcome::Committed(lsn2)
    );
    assert_eq!(cluster.holder_names(LOG, lsn2), names(&["a", "b", "d"]));
    let copy = cluster.storage.local_record("d", LOG, lsn2).unwrap();
    assert!(copy.copyset.contains(&NodeId::new("d")));
    assert!(!copy.copyset.contains(&NodeId::new("c")));

    cluster.storage.restore("c");
    let second = Writer::new(&cluster, "seq-2");
    assert_eq!(second.activate().await, Epoch(2));
    assert_eq!(cluster.authority.metadata(LOG).tail_of(Epoch(1)), Some(Esn(2)));
    assert_eq!(cluster.authority.metadata(LOG).last_clean_epoch, Epoch(1));

    // 已提交的记录没有被改写
    assert_eq!(cluster.holder_names(LOG, lsn1), names(&["a", "b", "c"]));
    assert_eq!(cluster.holder_names(LOG, lsn2), names(&["a", "b", "d"]));

    let records = cluster
        .reader()
        .read_range(LOG, Lsn::new(1, 1), Lsn::new(1, u64::MAX))
        .await
        .unwrap();
    let payloads: Vec<&[u8]> = records.iter().map(|r| r.payload.as_slice()).collect();
    assert_eq!(payloads, vec![b"one".as_slice(), b"two".as_slice()]);

    // 旧 sequencer 的追加被 seal 拒绝
    assert_eq!(
        first.append(b"stale").await,
        AppendOutcome::Failed(FailReason::EpochSealed)
    );
}

#[tokio::test]
async fn test_recovery_replicates_partial_append() {
    let cluster = TestCluster::new(FIVE_NODES, 3);
    let first = Writer::new(&cluster, "seq-1");
    first.activate().await;
    for i in 1..=4 {
        assert_eq!(
            first.append(format!("r{}", i).as_bytes()).await,
            AppendOutcome::Committed(Lsn::new(1, i))
        );
    }

    for node in ["c", "d", "e"] {
        cluster.storage.isolate(node);
    }
    let lsn5 = Lsn::new(1, 5);
    assert_eq!(
        first.append_to(&["a", "b", "c"], b"r5").await,
        AppendOutcome::Failed(FailReason::InsufficientNodes)
    );
    assert_eq!(cluster.holder_names(LOG, lsn5), names(&["a", "b"]));
    for node in ["c", "d", "e"] {
        cluster.storage.restore(node);
    }

    let second = Writer::new(&cluster, "seq-2");
    second.activate().await;
    assert_eq!(cluster.authority.metadata(LOG).tail_of(Epoch(1)), Some(Esn(5)));
    assert!(cluster.storage.holders(LOG, lsn5).len() >= 3);

    let record = cluster.reader().read(LOG, lsn5).await.unwrap();
    assert_eq!(record.payload, b"r5".to_vec());
    assert!(!record.is_bridge());
}

#[tokio::test]
async fn test_hole_is_bridged_and_read_past() {
    let cluster = TestCluster::new(FIVE_NODES, 3);
    let first = Writer::new(&cluster, "seq-1");
    first.activate().await;
    for esn in 1..=10u64 {
        let assignment = first.sequencer.assign().unwrap();
        assert_eq!(assignment.lsn, Lsn::new(1, esn));
        if esn == 6 {
            // 分配后崩溃，位置 6 从未写入
            continue;
        }
        let copyset = first.selector.select(LOG, 3).unwrap();
        assert_eq!(
            first.write(assignment, copyset, b"data").await,
            AppendOutcome::Committed(Lsn::new(1, esn))
        );
    }

    let reader = cluster.reader();
    // 未恢复的 epoch 只读到空洞之前
    let before = reader.read_range(LOG, Lsn::MIN, Lsn::MAX).await.unwrap();
    assert_eq!(before.len(), 5);

    let second = Writer::new(&cluster, "seq-2");
    second.activate().await;
    assert_eq!(cluster.authority.metadata(LOG).tail_of(Epoch(1)), Some(Esn(10)));

    let after = reader
        .read_range(LOG, Lsn::new(1, 1), Lsn::new(1, 10))
        .await
        .unwrap();
    assert_eq!(after.len(), 10);
    for (i, record) in after.iter().enumerate() {
        assert_eq!(record.lsn, Lsn::new(1, i as u64 + 1));
        assert_eq!(record.is_bridge(), record.lsn.esn == Esn(6));
    }
    assert!(cluster.storage.holders(LOG, Lsn::new(1, 6)).len() >= 3);
}

#[tokio::test]
async fn test_stray_copy_does_not_change_recovered_read() {
    let cluster = TestCluster::new(FIVE_NODES, 3);
    let first = Writer::new(&cluster, "seq-1");
    first.activate().await;

    // 1 号位置只写到了 a 就崩溃
    let stray = first.sequencer.assign().unwrap();
    cluster
        .storage
        .node(&NodeId::new("a"))
        .unwrap()
        .store()
        .store(
            LOG,
            stray.lsn,
            b"stray".to_vec(),
            Copyset::new(vec![NodeId::new("a")]),
        )
        .unwrap();
    assert_eq!(
        first.append_to(&["c", "d", "e"], b"two").await,
        AppendOutcome::Committed(Lsn::new(1, 2))
    );

    // 恢复期间 a、b 不可达，1 号位置按空洞处理
    cluster.storage.isolate("a");
    cluster.storage.isolate("b");
    let second = Writer::new(&cluster, "seq-2");
    assert_eq!(second.activate().await, Epoch(2));
    assert_eq!(cluster.authority.metadata(LOG).tail_of(Epoch(1)), Some(Esn(2)));
    cluster.storage.restore("a");
    cluster.storage.restore("b");

    let reader = cluster.reader();
    let lsn1 = Lsn::new(1, 1);
    let expected = reader.read(LOG, lsn1).await.unwrap();
    assert!(expected.is_bridge());
    assert_eq!(expected.recovered_in, Epoch(2));

    for unreachable in [["a", "b"], ["c", "d"], ["d", "e"]] {
        for node in unreachable {
            cluster.storage.isolate(node);
        }
        let records = reader
            .read_range(LOG, lsn1, Lsn::new(1, 2))
            .await
            .unwrap();
        assert!(records[0].is_bridge(), "with {:?} unreachable", unreachable);
        assert_eq!(records[0].recovered_in, expected.recovered_in);
        assert_eq!(records[1].payload, b"two".to_vec());
        for node in unreachable {
            cluster.storage.restore(node);
        }
    }
}

#[tokio::test]
async fn test_recovering_an_epoch_twice_changes_nothing() {
    let cluster = TestCluster::new(FIVE_NODES, 3);
    let first = Writer::new(&cluster, "seq-1");
    first.activate().await;
    assert!(matches!(
        first.append_to(&["a", "b", "c"], b"x").await,
        AppendOutcome::Committed(_)
    ));
    assert!(matches!(
        first.append_to(&["b", "c", "d"], b"y").await,
        AppendOutcome::Committed(_)
    ));

    let transport: Arc<dyn StorageTransport> = Arc::new(
        cluster
            .storage
            .transport(Principal::ClusterNode(NodeId::new("recovery"))),
    );
    let recovery = EpochRecovery::new(
        &cluster.storage.config,
        transport,
        RecoveryOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    )
    .unwrap();

    let mut cancel = Cancellation::new();
    let once = recovery.recover(LOG, Epoch(1), &mut cancel).await.unwrap();
    let twice = recovery.recover(LOG, Epoch(1), &mut cancel).await.unwrap();
    assert_eq!(once.tail, Esn(2));
    assert_eq!(once.committed, 2);
    assert_eq!(once.bridged, 0);
    assert_eq!(once, twice);
    assert_eq!(cluster.holder_names(LOG, Lsn::new(1, 1)), names(&["a", "b", "c"]));
    assert_eq!(cluster.holder_names(LOG, Lsn::new(1, 2)), names(&["b", "c", "d"]));
}

#[tokio::test]
async fn test_old_driver_steps_down_after_seal() {
    let cluster = TestCluster::new(FIVE_NODES, 3);
    let old = cluster.driver("seq-1");
    old.activate(LOG).await.unwrap();
    for _ in 0..5 {
        old.append(LOG, b"before".to_vec()).await.unwrap();
    }

    let new = cluster.driver("seq-2");
    assert_eq!(new.activate(LOG).await.unwrap(), Epoch(2));
    assert_eq!(
        new.append(LOG, b"after".to_vec()).await.unwrap(),
        Lsn::new(2, 1)
    );

    assert!(matches!(
        old.append(LOG, b"stale".to_vec()).await,
        Err(ClientError::Failed(FailReason::EpochSealed))
    ));
    assert_eq!(old.sequencer_state(LOG), Some(SequencerState::Inactive));
    assert!(matches!(
        old.append(LOG, b"stale".to_vec()).await,
        Err(ClientError::NotActive(_))
    ));

    let records = cluster.reader().read_range(LOG, Lsn::MIN, Lsn::MAX).await.unwrap();
    assert_eq!(records.len(), 6);
    assert_eq!(records.last().map(|r| r.lsn), Some(Lsn::new(2, 1)));
}

#[tokio::test]
async fn test_appends_wait_for_recovery_to_finish() {
    let cluster = TestCluster::new(FIVE_NODES, 3);
    let old = cluster.driver("seq-1");
    old.activate(LOG).await.unwrap();
    old.append(LOG, b"one".to_vec()).await.unwrap();

    for node in ["c", "d", "e"] {
        cluster.storage.isolate(node);
    }
    let new = Arc::new(cluster.driver_with(
        Principal::ClusterNode(NodeId::new("seq-2")),
        cluster.driver_options(patient_retry()),
    ));
    let activating = {
        let new = new.clone();
        tokio::spawn(async move { new.activate(LOG).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        new.sequencer_state(LOG),
        Some(SequencerState::Recovering { epoch: Epoch(2) })
    );
    assert!(matches!(
        new.append(LOG, b"too early".to_vec()).await,
        Err(ClientError::NotActive(_))
    ));

    for node in ["c", "d", "e"] {
        cluster.storage.restore(node);
    }
    assert_eq!(activating.await.unwrap().unwrap(), Epoch(2));
    assert_eq!(
        new.append(LOG, b"two".to_vec()).await.unwrap(),
        Lsn::new(2, 1)
    );
}

#[tokio::test]
async fn test_activation_fails_without_seal_quorum() {
    let cluster = TestCluster::new(FIVE_NODES, 3);
    let old = cluster.driver("seq-1");
    old.activate(LOG).await.unwrap();
    old.append(LOG, b"one".to_vec()).await.unwrap();

    for node in ["c", "d", "e"] {
        cluster.storage.isolate(node);
    }
    let new = cluster.driver("seq-2");
    match new.activate(LOG).await {
        Err(ClientError::Sequencer(SequencerError::Recovery(
            RecoveryError::QuorumUnavailable {
                phase: RecoveryPhase::Seal,
                reachable: 2,
                required: 3,
                ..
            },
        ))) => {}
        other => panic!("unexpected activation result: {:?}", other),
    }
    assert_eq!(
        new.sequencer_state(LOG),
        Some(SequencerState::Recovering { epoch: Epoch(2) })
    );
    assert_eq!(cluster.authority.metadata(LOG).last_clean_epoch, Epoch(0));

    // 节点恢复后再次激活，继续同一个 epoch
    for node in ["c", "d", "e"] {
        cluster.storage.restore(node);
    }
    assert_eq!(new.activate(LOG).await.unwrap(), Epoch(2));
    assert_eq!(cluster.authority.metadata(LOG).last_clean_epoch, Epoch(1));
}

/// Authority that lets another sequencer claim the next epoch first.
struct RacingAuthority {
    inner: Arc<MemoryEpochStore>,
}

#[async_trait]
impl EpochAuthority for RacingAuthority {
    async fn get_last_epoch(&self, log: LogId) -> EpochStoreResult<Epoch> {
        self.inner.get_last_epoch(log).await
    }

    async fn try_advance_epoch(&self, log: LogId, new_epoch: Epoch) -> EpochStoreResult<()> {
        self.inner.try_advance_epoch(log, new_epoch).await?;
        self.inner.try_advance_epoch(log, new_epoch).await
    }

    async fn get_last_clean_epoch(&self, log: LogId) -> EpochStoreResult<Epoch> {
        self.inner.get_last_clean_epoch(log).await
    }

    async fn set_last_clean_epoch(
        &self,
        log: LogId,
        epoch: Epoch,
        tail: Esn,
    ) -> EpochStoreResult<()> {
        self.inner.set_last_clean_epoch(log, epoch, tail).await
    }

    async fn get_epoch_tail(&self, log: LogId, epoch: Epoch) -> EpochStoreResult<Option<Esn>> {
        self.inner.get_epoch_tail(log, epoch).await
    }
}

#[tokio::test]
async fn test_losing_epoch_race_is_a_conflict() {
    let cluster = TestCluster::new(FIVE_NODES, 3);
    let authority = Arc::new(RacingAuthority {
        inner: cluster.authority.clone(),
    });
    let driver = replog::LogDriver::new(
        &cluster.storage.config,
        Arc::new(
            cluster
                .storage
                .transport(Principal::ClusterNode(NodeId::new("loser"))),
        ),
        authority,
        cluster.driver_options(fast_retry()),
    )
    .unwrap();

    match driver.activate(LOG).await {
        Err(ClientError::Sequencer(SequencerError::Conflict {
            source: EpochStoreError::Conflict { current, requested, .. },
            ..
        })) => {
            assert_eq!(current, Epoch(1));
            assert_eq!(requested, Epoch(1));
        }
        other => panic!("unexpected activation result: {:?}", other),
    }
    assert_eq!(driver.sequencer_state(LOG), Some(SequencerState::Inactive));
    assert!(matches!(
        driver.append(LOG, b"x".to_vec()).await,
        Err(ClientError::NotActive(_))
    ));
}
