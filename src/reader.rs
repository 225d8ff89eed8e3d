use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, warn};

use crate::config::ClusterConfig;
use crate::error::{ReadError, RpcError, report};
use crate::message::{StorageRequest, StorageResponse};
use crate::traits::{EpochAuthority, ReadResult, StorageTransport};
use crate::types::{Epoch, Esn, LogId, Lsn, NodeId, Record};

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub request_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
        }
    }
}

/// One version of a position: the copy with the highest recovery tag among
/// identical copies, and the nodes holding that content.
struct Version {
    record: Record,
    holders: BTreeSet<NodeId>,
}

/// Copies of one epoch's records gathered from the storage set.
struct EpochCopies {
    versions: BTreeMap<Esn, Vec<Version>>,
    answered: usize,
    trimmed: bool,
}

impl EpochCopies {
    fn add(&mut self, node: &NodeId, record: Record) {
        let versions = self.versions.entry(record.lsn.esn).or_default();
        match versions.iter_mut().find(|v| v.record.same_content(&record)) {
            Some(version) => {
                version.holders.insert(node.clone());
                if record.recovered_in > version.record.recovered_in {
                    version.record = record;
                }
            }
            None => versions.push(Version {
                record,
                holders: BTreeSet::from([node.clone()]),
            }),
        }
    }

    /// Versions at `esn` carrying the highest recovery tag seen there.
    fn latest(&mut self, esn: Esn) -> Vec<Version> {
        let mut versions = self.versions.remove(&esn).unwrap_or_default();
        let top = versions.iter().map(|v| v.record.recovered_in).max();
        versions.retain(|v| Some(v.record.recovered_in) == top);
        versions
    }
}

/// Reads the committed prefix of a log from the storage nodes.
///
/// Recovered epochs are read up to the tail fixed by recovery, and only once a
/// read quorum has answered. At each position the copy written by the latest
/// recovery wins, so copies the recovery never saw cannot change what is
/// returned. A position below the tail with no copy on a read quorum is a
/// gap. The open epoch is read only as far as positions already hold `r`
/// copies.
pub struct LogReader {
    storage_set: Vec<NodeId>,
    replication: usize,
    transport: Arc<dyn StorageTransport>,
    authority: Arc<dyn EpochAuthority>,
    options: ReaderOptions,
}

impl LogReader {
    pub fn new(
        config: &ClusterConfig,
        transport: Arc<dyn StorageTransport>,
        authority: Arc<dyn EpochAuthority>,
        options: ReaderOptions,
    ) -> Self {
        Self {
            storage_set: config.node_ids(),
            replication: config.replication,
            transport,
            authority,
            options,
        }
    }

    /// Nodes that must answer before a recovered epoch is read. Any `r`
    /// nodes holding the recovered version intersect them.
    fn read_quorum(&self) -> usize {
        self.storage_set.len() + 1 - self.replication
    }

    pub async fn read(&self, log: LogId, lsn: Lsn) -> ReadResult<Record> {
        self.read_range(log, lsn, lsn)
            .await?
            .into_iter()
            .find(|r| r.lsn == lsn)
            .ok_or(ReadError::NotFound(lsn))
    }

    /// Committed records in `[from, to]`, in LSN order. Bridge records are
    /// returned as they are; callers that only want data skip them.
    pub async fn read_range(&self, log: LogId, from: Lsn, to: Lsn) -> ReadResult<Vec<Record>> {
        let last = self.authority.get_last_epoch(log).await?;
        let first_epoch = from.epoch.max(Epoch(1));
        let last_epoch = to.epoch.min(last);

        let mut out = Vec::new();
        for e in first_epoch.0..=last_epoch.0 {
            let epoch = Epoch(e);
            let start = if epoch == from.epoch {
                from.esn.max(Esn::MIN)
            } else {
                Esn::MIN
            };
            let bound = if epoch == to.epoch { to.esn } else { Esn::MAX };

            match self.authority.get_epoch_tail(log, epoch).await? {
                Some(tail) => {
                    let end = tail.min(bound);
                    if start > end {
                        continue;
                    }
                    let copies = self.fetch(log, epoch, start, end).await?;
                    self.take_recovered(log, epoch, start, end, copies, &mut out)?;
                }
                None => {
                    // 未恢复的 epoch：只读取已达到 r 副本的连续前缀
                    let copies = self.fetch(log, epoch, start, bound).await?;
                    let complete = self.take_committed(start, bound, copies, &mut out);
                    if !complete {
                        debug!("{}: read stops inside open {}", log, epoch);
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    fn take_recovered(
        &self,
        log: LogId,
        epoch: Epoch,
        start: Esn,
        end: Esn,
        mut copies: EpochCopies,
        out: &mut Vec<Record>,
    ) -> ReadResult<()> {
        let quorum = copies.answered >= self.read_quorum();
        for n in start.0..=end.0 {
            let lsn = Lsn { epoch, esn: Esn(n) };
            let mut latest = copies.latest(lsn.esn);
            if !quorum && !(latest.is_empty() && copies.trimmed) {
                return Err(ReadError::QuorumUnavailable {
                    reachable: copies.answered,
                    required: self.read_quorum(),
                });
            }
            match latest.len() {
                1 => out.push(latest.remove(0).record),
                0 if copies.trimmed => return Err(ReadError::NotFound(lsn)),
                0 => {
                    error!("{}: no copy of committed {} on {} nodes", log, lsn, copies.answered);
                    return Err(ReadError::Gap { log, lsn });
                }
                _ => {
                    error!(
                        "{}: {} different copies of {} recovered in {}",
                        log,
                        latest.len(),
                        lsn,
                        latest[0].record.recovered_in
                    );
                    return Err(ReadError::Conflict { log, lsn });
                }
            }
        }
        Ok(())
    }

    /// Returns `false` if it stopped before `bound`.
    fn take_committed(
        &self,
        start: Esn,
        bound: Esn,
        mut copies: EpochCopies,
        out: &mut Vec<Record>,
    ) -> bool {
        let mut esn = start;
        loop {
            let committed = copies
                .latest(esn)
                .into_iter()
                .find(|v| v.holders.len() >= self.replication);
            match committed {
                Some(version) => out.push(version.record),
                None => return false,
            }
            if esn >= bound {
                return true;
            }
            esn = esn.next();
        }
    }

    async fn fetch(&self, log: LogId, epoch: Epoch, from: Esn, to: Esn) -> ReadResult<EpochCopies> {
        let calls = self.storage_set.iter().map(|node| async move {
            let request = StorageRequest::GetRange {
                log,
                epoch,
                from,
                to,
            };
            let result = match tokio::time::timeout(
                self.options.request_timeout,
                self.transport.call(node, request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RpcError::Timeout),
            };
            (node, result)
        });

        let mut copies = EpochCopies {
            versions: BTreeMap::new(),
            answered: 0,
            trimmed: false,
        };
        for (node, result) in join_all(calls).await {
            match result {
                Ok(StorageResponse::Records(records)) => {
                    copies.answered += 1;
                    for record in records {
                        copies.add(node, record);
                    }
                }
                Ok(StorageResponse::NotFound) => {
                    copies.answered += 1;
                    copies.trimmed = true;
                }
                Ok(StorageResponse::Denied(reason)) => return Err(ReadError::Denied(reason)),
                Ok(other) => warn!("{}: {} answered read with {:?}", log, node, other),
                Err(e) => report(&e, "read", Some(node)),
            }
        }
        Ok(copies)
    }
}
