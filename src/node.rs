use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::{
    error::{StoreError, report},
    message::{StorageRequest, StorageResponse},
    permission::{DispatchOptions, Disposition, PermissionChecker, Principal, authorize},
    storage::{LocalLogStore, StoreHealth, StoreStatus},
    types::{LogId, Lsn, NodeId},
};

#[derive(Debug, Clone)]
pub struct StorageNodeOptions {
    /// Number of shard workers; every LogId maps to exactly one.
    pub shards: usize,
    /// Max ops a worker drains from its queue per wakeup
    pub batch_size: usize,
    pub dispatch: DispatchOptions,
}

impl Default for StorageNodeOptions {
    fn default() -> Self {
        Self {
            shards: 4,
            batch_size: 32,
            dispatch: DispatchOptions::default(),
        }
    }
}

pub struct NodeOpRequest {
    pub request: StorageRequest,
    pub response_tx: oneshot::Sender<StorageResponse>,
}

/// A storage node: one local log store behind the storage protocol.
///
/// Requests are authorized first, then routed to the shard worker owning the
/// request's LogId, so operations on one log execute in arrival order while
/// other logs proceed on other shards.
pub struct StorageNode {
    id: NodeId,
    store: LocalLogStore,
    checker: Arc<dyn PermissionChecker>,
    options: StorageNodeOptions,
    shards: Vec<mpsc::UnboundedSender<NodeOpRequest>>,
}

impl StorageNode {
    /// Create the node and spawn its shard workers on the current runtime.
    pub fn start(
        id: NodeId,
        store: LocalLogStore,
        checker: Arc<dyn PermissionChecker>,
        options: StorageNodeOptions,
    ) -> Arc<Self> {
        let shard_count = options.shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            Self::spawn_worker(id.clone(), shard, store.clone(), options.batch_size.max(1), rx);
            shards.push(tx);
        }

        Arc::new(Self {
            id,
            store,
            checker,
            options,
            shards,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn store(&self) -> &LocalLogStore {
        &self.store
    }

    fn shard_for(&self, log: LogId) -> usize {
        let mut hasher = DefaultHasher::new();
        log.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Authorize and execute one request on behalf of `principal`.
    pub async fn handle(&self, principal: &Principal, request: StorageRequest) -> StorageResponse {
        let log = request.log();
        match authorize(
            self.checker.as_ref(),
            &self.options.dispatch,
            principal,
            request.action(),
            log,
        ) {
            Disposition::Normal => {}
            Disposition::Denied(reason) => {
                debug!(
                    "{}: denied {} for {} from {}",
                    self.id,
                    request.name(),
                    log,
                    principal
                );
                return StorageResponse::Denied(reason);
            }
            Disposition::Retry(reason) => return StorageResponse::Failed(reason),
        }

        let shard = self.shard_for(log);
        let (tx, rx) = oneshot::channel();
        let op = NodeOpRequest {
            request,
            response_tx: tx,
        };
        if let Err(e) = self.shards[shard].send(op) {
            warn!("{}: shard {} worker is gone: {}", self.id, shard, e);
            return StorageResponse::Failed(StoreError::ChannelClosed.to_string());
        }

        rx.await.unwrap_or_else(|e| {
            warn!("{}: shard {} dropped response: {}", self.id, shard, e);
            StorageResponse::Failed(StoreError::ChannelClosed.to_string())
        })
    }

    fn spawn_worker(
        id: NodeId,
        shard: usize,
        store: LocalLogStore,
        batch_size: usize,
        mut receiver: mpsc::UnboundedReceiver<NodeOpRequest>,
    ) {
        tokio::spawn(async move {
            loop {
                let mut buf = Vec::with_capacity(batch_size);
                let size = receiver.recv_many(&mut buf, batch_size).await;
                if size == 0 {
                    debug!("{}: shard {} receiver closed", id, shard);
                    break;
                }

                // 文件 IO 放到阻塞线程池，批内按顺序执行
                let store = store.clone();
                let id_clone = id.clone();
                let handled = tokio::task::spawn_blocking(move || {
                    for op in buf {
                        let response = execute(&id_clone, &store, op.request);
                        let _ = op.response_tx.send(response);
                    }
                })
                .await;
                if let Err(e) = handled {
                    warn!("{}: shard {} batch panicked: {}", id, shard, e);
                }
            }
        });
    }
}

fn store_failure(id: &NodeId, operation: &str, err: StoreError) -> StorageResponse {
    report(&err, operation, Some(id));
    StorageResponse::Failed(err.to_string())
}

fn execute(id: &NodeId, store: &LocalLogStore, request: StorageRequest) -> StorageResponse {
    trace!("{}: executing {}", id, request.name());
    match request {
        StorageRequest::Store { record, flags } => {
            let lsn = record.lsn;
            match store.store_record(record, flags) {
                Ok(StoreStatus::Stored) => StorageResponse::Ok,
                Ok(StoreStatus::AlreadyExists) => StorageResponse::AlreadyExists,
                Ok(StoreStatus::Conflict { recovered_in }) => {
                    StorageResponse::Conflict { recovered_in }
                }
                Err(StoreError::Sealed { sealed }) => {
                    debug!("{}: store {} rejected, sealed through {}", id, lsn, sealed);
                    StorageResponse::Rejected { sealed }
                }
                Err(e) => store_failure(id, "store", e),
            }
        }
        StorageRequest::Seal { log, epoch } => match store.seal(log, epoch) {
            Ok(()) => StorageResponse::Ok,
            Err(e) => store_failure(id, "seal", e),
        },
        StorageRequest::GetTail { log, epoch } => {
            if let StoreHealth::Degraded(reason) = store.health() {
                return StorageResponse::Failed(StoreError::Degraded(reason).to_string());
            }
            StorageResponse::Tail(store.get_tail(log, epoch))
        }
        StorageRequest::GetRange {
            log,
            epoch,
            from,
            to,
        } => {
            let from = Lsn { epoch, esn: from };
            let to = Lsn { epoch, esn: to };
            let iter = match store.read_range(log, from, to) {
                Ok(iter) => iter,
                Err(StoreError::NotFound(_)) => return StorageResponse::NotFound,
                Err(e) => return store_failure(id, "get_range", e),
            };
            match iter.collect::<Result<Vec<_>, _>>() {
                Ok(records) => StorageResponse::Records(records),
                Err(StoreError::NotFound(_)) => StorageResponse::NotFound,
                Err(e) => store_failure(id, "get_range", e),
            }
        }
        StorageRequest::Trim { log, below } => match store.trim(log, below) {
            Ok(()) => StorageResponse::Ok,
            Err(e) => store_failure(id, "trim", e),
        },
    }
}
