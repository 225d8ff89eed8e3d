//! Epoch recovery.
//!
//! Fixes the final content of an epoch whose sequencer may have died with
//! appends in flight:
//!
//! 1. seal the epoch on enough nodes that no further append can commit in it
//! 2. collect a digest of what the answering nodes hold
//! 3. bring every position up to the highest one seen to `r` copies, writing
//!    bridge records into holes
//! 4. seal again so every reachable node carries the marker
//!
//! Every copy written in step 3 carries the recovering sequencer's epoch in
//! `Record::recovered_in`, and each position ends with `r` copies so tagged.
//! Nodes let a higher tag replace a differing copy, and readers prefer the
//! highest tag, so a stray copy missed by the digest cannot shadow the fixed
//! version.
//!
//! Running it twice over the same epoch converges on the same result.

mod digest;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

pub use digest::{DigestEntry, RecoveryDigest};

use crate::cancel::Cancellation;
use crate::config::ClusterConfig;
use crate::error::{RecoveryError, RecoveryPhase, RpcError, report};
use crate::message::{StorageRequest, StorageResponse, StoreFlags};
use crate::retry::{RetryBudget, RetryPolicy};
use crate::traits::{RecoveryResult, RpcResult, StorageTransport};
use crate::types::{Copyset, Epoch, Esn, LogId, Lsn, NodeId, Record};

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Nodes that must acknowledge the seal; defaults to N - r + 1
    pub seal_quorum: Option<usize>,
    /// Nodes that must answer the digest; defaults to N - r + 1
    pub read_quorum: Option<usize>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            seal_quorum: None,
            read_quorum: None,
            request_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of recovering one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredEpoch {
    pub epoch: Epoch,
    /// Highest position of the epoch; everything up to it is now committed
    pub tail: Esn,
    /// Positions already at `r` copies before repair
    pub committed: usize,
    /// Positions copied up to `r`
    pub replicated: usize,
    /// Holes filled with bridge records
    pub bridged: usize,
}

pub struct EpochRecovery {
    storage_set: Vec<NodeId>,
    replication: usize,
    transport: Arc<dyn StorageTransport>,
    options: RecoveryOptions,
}

impl EpochRecovery {
    pub fn new(
        config: &ClusterConfig,
        transport: Arc<dyn StorageTransport>,
        options: RecoveryOptions,
    ) -> RecoveryResult<Self> {
        let nodes = config.nodes.len();
        if config.replication == 0 || nodes < config.replication {
            return Err(RecoveryError::StorageSetTooSmall {
                nodes,
                replication: config.replication,
            });
        }
        let safe = nodes - config.replication + 1;
        for (name, quorum) in [
            ("seal", options.seal_quorum),
            ("read", options.read_quorum),
        ] {
            if let Some(q) = quorum.filter(|q| *q < safe) {
                warn!(
                    "{} quorum {} is below {} for {} nodes at r={}",
                    name, q, safe, nodes, config.replication
                );
            }
        }
        Ok(Self {
            storage_set: config.node_ids(),
            replication: config.replication,
            transport,
            options,
        })
    }

    /// At least `r` nodes, at most the whole storage set. Below N - r + 1 a
    /// committed record can be missed by the digest.
    fn quorum(&self, configured: Option<usize>) -> usize {
        let n = self.storage_set.len();
        let r = self.replication;
        configured.unwrap_or(n - r + 1).clamp(r, n)
    }

    pub fn seal_quorum(&self) -> usize {
        self.quorum(self.options.seal_quorum)
    }

    pub fn read_quorum(&self) -> usize {
        self.quorum(self.options.read_quorum)
    }

    /// Recover `epoch` on behalf of the sequencer of the following epoch.
    pub async fn recover(
        &self,
        log: LogId,
        epoch: Epoch,
        cancel: &mut Cancellation,
    ) -> RecoveryResult<RecoveredEpoch> {
        self.recover_as(log, epoch, epoch.next(), cancel).await
    }

    /// Recover `epoch`, tagging every copy written with `by`, the epoch of
    /// the sequencer running the recovery.
    pub async fn recover_as(
        &self,
        log: LogId,
        epoch: Epoch,
        by: Epoch,
        cancel: &mut Cancellation,
    ) -> RecoveryResult<RecoveredEpoch> {
        info!("{}: recovering {} as {}", log, epoch, by);

        let sealed = self.seal_phase(log, epoch, cancel).await?;
        debug!("{}: {} sealed on {} nodes", log, epoch, sealed);

        let digest = self.digest_phase(log, epoch, cancel).await?;
        debug!(
            "{}: digest of {} has {} positions from {} nodes, tail {}",
            log,
            epoch,
            digest.len(),
            digest.answered().len(),
            digest.tail()
        );

        let recovered = self.repair_phase(log, epoch, by, &digest, cancel).await?;

        // 再次 seal，未参与首轮的节点也带上标记
        let resealed = cancelled_or(cancel, self.seal_all(log, epoch)).await?;
        debug!("{}: {} re-sealed on {} nodes", log, epoch, resealed);

        info!(
            "{}: recovered {} tail {} ({} committed, {} replicated, {} bridged)",
            log,
            epoch,
            recovered.tail,
            recovered.committed,
            recovered.replicated,
            recovered.bridged
        );
        Ok(recovered)
    }

    async fn call(&self, node: &NodeId, request: StorageRequest) -> RpcResult<StorageResponse> {
        match tokio::time::timeout(
            self.options.request_timeout,
            self.transport.call(node, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Seal on every node of the storage set; returns how many acknowledged.
    async fn seal_all(&self, log: LogId, epoch: Epoch) -> usize {
        let calls = self.storage_set.iter().map(|node| async move {
            (node, self.call(node, StorageRequest::Seal { log, epoch }).await)
        });
        join_all(calls)
            .await
            .into_iter()
            .filter(|(node, result)| match result {
                Ok(StorageResponse::Ok) => true,
                Ok(other) => {
                    warn!("{}: unexpected seal reply from {}: {:?}", log, node, other);
                    false
                }
                Err(e) => {
                    report(e, "seal", Some(*node));
                    false
                }
            })
            .count()
    }

    async fn seal_phase(
        &self,
        log: LogId,
        epoch: Epoch,
        cancel: &mut Cancellation,
    ) -> RecoveryResult<usize> {
        let required = self.seal_quorum();
        let mut budget = RetryBudget::new(self.options.retry.clone());
        loop {
            budget.record_attempt();
            let sealed = cancelled_or(cancel, self.seal_all(log, epoch)).await?;
            if sealed >= required {
                return Ok(sealed);
            }
            warn!(
                "{}: {} sealed on {}/{} nodes, attempt {}",
                log,
                epoch,
                sealed,
                required,
                budget.attempts()
            );
            if !cancelled_or(cancel, budget.backoff()).await? {
                return Err(RecoveryError::QuorumUnavailable {
                    phase: RecoveryPhase::Seal,
                    attempts: budget.attempts(),
                    reachable: sealed,
                    required,
                });
            }
        }
    }

    /// Everything `node` holds for `epoch`.
    async fn fetch_epoch(&self, node: &NodeId, log: LogId, epoch: Epoch) -> RpcResult<Vec<Record>> {
        let tail = match self.call(node, StorageRequest::GetTail { log, epoch }).await? {
            StorageResponse::Tail(tail) => tail,
            other => {
                return Err(RpcError::Protocol(format!(
                    "unexpected GET_TAIL reply {:?}",
                    other
                )));
            }
        };
        if tail == Esn::INVALID {
            return Ok(Vec::new());
        }

        let request = StorageRequest::GetRange {
            log,
            epoch,
            from: Esn::MIN,
            to: tail,
        };
        match self.call(node, request).await? {
            StorageResponse::Records(records) => Ok(records),
            StorageResponse::NotFound => {
                warn!("{}: {} trimmed {} before recovery", log, node, epoch);
                Ok(Vec::new())
            }
            other => Err(RpcError::Protocol(format!(
                "unexpected GET_RANGE reply {:?}",
                other
            ))),
        }
    }

    async fn collect_digest(&self, log: LogId, epoch: Epoch) -> RecoveryDigest {
        let calls = self.storage_set.iter().map(|node| async move {
            (node, self.fetch_epoch(node, log, epoch).await)
        });
        let mut digest = RecoveryDigest::new();
        for (node, result) in join_all(calls).await {
            match result {
                Ok(records) => digest.add(node, records),
                Err(e) => report(&e, "digest", Some(node)),
            }
        }
        digest
    }

    async fn digest_phase(
        &self,
        log: LogId,
        epoch: Epoch,
        cancel: &mut Cancellation,
    ) -> RecoveryResult<RecoveryDigest> {
        let required = self.read_quorum();
        let mut budget = RetryBudget::new(self.options.retry.clone());
        loop {
            budget.record_attempt();
            let digest = cancelled_or(cancel, self.collect_digest(log, epoch)).await?;
            let answered = digest.answered().len();
            if answered >= required {
                return Ok(digest);
            }
            warn!(
                "{}: digest of {} answered by {}/{} nodes, attempt {}",
                log,
                epoch,
                answered,
                required,
                budget.attempts()
            );
            if !cancelled_or(cancel, budget.backoff()).await? {
                return Err(RecoveryError::QuorumUnavailable {
                    phase: RecoveryPhase::Digest,
                    attempts: budget.attempts(),
                    reachable: answered,
                    required,
                });
            }
        }
    }

    async fn repair_phase(
        &self,
        log: LogId,
        epoch: Epoch,
        by: Epoch,
        digest: &RecoveryDigest,
        cancel: &mut Cancellation,
    ) -> RecoveryResult<RecoveredEpoch> {
        let tail = digest.tail();
        let mut recovered = RecoveredEpoch {
            epoch,
            tail,
            committed: 0,
            replicated: 0,
            bridged: 0,
        };

        // 已应答的节点优先，其余节点按存储集顺序兜底
        let candidates: Vec<NodeId> = digest
            .answered()
            .iter()
            .cloned()
            .chain(
                self.storage_set
                    .iter()
                    .filter(|n| !digest.answered().contains(*n))
                    .cloned(),
            )
            .collect();

        for n in Esn::MIN.0..=tail.0 {
            let lsn = Lsn {
                epoch,
                esn: Esn(n),
            };
            let (record, holders, stamped): (Record, BTreeSet<NodeId>, BTreeSet<NodeId>) =
                match digest.resolve(lsn.esn) {
                    Some(entry) => {
                        if entry.holders.len() >= self.replication {
                            recovered.committed += 1;
                        } else {
                            debug!(
                                "{}: {} has {} copies, replicating",
                                log,
                                lsn,
                                entry.holders.len()
                            );
                            recovered.replicated += 1;
                        }
                        (
                            entry.record.clone(),
                            entry.holders.keys().cloned().collect(),
                            entry.stamped(by),
                        )
                    }
                    None => {
                        debug!("{}: hole at {}, writing bridge", log, lsn);
                        recovered.bridged += 1;
                        (
                            Record::bridge(log, lsn, Copyset::default()),
                            BTreeSet::new(),
                            BTreeSet::new(),
                        )
                    }
                };
            if stamped.len() >= self.replication {
                continue;
            }

            // 先给已持有该版本的节点打标记，再补足副本
            let order: Vec<NodeId> = holders
                .iter()
                .cloned()
                .chain(candidates.iter().filter(|n| !holders.contains(*n)).cloned())
                .collect();
            self.replicate(&record.recovered_by(by), stamped, &order, cancel)
                .await?;
        }
        Ok(recovered)
    }

    /// Store `record` with the recovery flag until `r` distinct nodes hold it
    /// under its recovery tag.
    async fn replicate(
        &self,
        record: &Record,
        mut holders: BTreeSet<NodeId>,
        candidates: &[NodeId],
        cancel: &mut Cancellation,
    ) -> RecoveryResult<()> {
        let required = self.replication;
        let mut budget = RetryBudget::new(self.options.retry.clone());
        loop {
            budget.record_attempt();
            let mut remaining = candidates
                .iter()
                .filter(|n| !holders.contains(*n))
                .cloned()
                .collect::<Vec<_>>()
                .into_iter();
            while holders.len() < required {
                let batch: Vec<NodeId> = remaining
                    .by_ref()
                    .take(required - holders.len())
                    .collect();
                if batch.is_empty() {
                    break;
                }

                let mut copy = record.clone();
                copy.copyset = Copyset::new(holders.iter().chain(batch.iter()).cloned().collect());
                let stored = cancelled_or(cancel, self.store_on(&copy, &batch)).await?;
                holders.extend(stored);
            }
            if holders.len() >= required {
                return Ok(());
            }

            warn!(
                "{}: {} on {}/{} nodes, attempt {}",
                record.log,
                record.lsn,
                holders.len(),
                required,
                budget.attempts()
            );
            if !cancelled_or(cancel, budget.backoff()).await? {
                return Err(RecoveryError::RepairIncomplete {
                    log: record.log,
                    epoch: record.lsn.epoch,
                    esn: record.lsn.esn,
                    copies: holders.len(),
                    required,
                });
            }
        }
    }

    /// Nodes of `targets` that now hold `record`. A node that answers
    /// `Conflict` keeps a different copy and is not counted.
    async fn store_on(&self, record: &Record, targets: &[NodeId]) -> Vec<NodeId> {
        let calls = targets.iter().map(|node| {
            let request = StorageRequest::Store {
                record: record.clone(),
                flags: StoreFlags { recovery: true },
            };
            async move { (node, self.call(node, request).await) }
        });
        join_all(calls)
            .await
            .into_iter()
            .filter_map(|(node, result)| match result {
                Ok(StorageResponse::Ok | StorageResponse::AlreadyExists) => Some(node.clone()),
                Ok(other) => {
                    warn!(
                        "{}: recovery store of {} on {} answered {:?}",
                        record.log, record.lsn, node, other
                    );
                    None
                }
                Err(e) => {
                    report(&e, "recovery store", Some(node));
                    None
                }
            })
            .collect()
    }
}

async fn cancelled_or<T>(
    cancel: &mut Cancellation,
    work: impl Future<Output = T>,
) -> RecoveryResult<T> {
    if cancel.is_cancelled() {
        return Err(RecoveryError::Cancelled);
    }
    tokio::select! {
        out = work => Ok(out),
        _ = cancel.cancelled() => Err(RecoveryError::Cancelled),
    }
}
