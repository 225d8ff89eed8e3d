use async_trait::async_trait;

use crate::error::*;
use crate::message::{StorageRequest, StorageResponse};
use crate::types::{Epoch, Esn, LogId, NodeId};

// 结果类型别名
pub type RpcResult<T> = Result<T, RpcError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type EpochStoreResult<T> = Result<T, EpochStoreError>;
pub type SequencerResult<T> = Result<T, SequencerError>;
pub type RecoveryResult<T> = Result<T, RecoveryError>;
pub type ClientResult<T> = Result<T, ClientError>;
pub type ReadResult<T> = Result<T, ReadError>;

/// Sends storage-protocol requests to storage nodes.
///
/// One transport instance speaks for one sender principal. Implementations
/// may return early with `RpcError::Timeout` but callers wrap every call in
/// their own deadline as well.
#[async_trait]
pub trait StorageTransport: Send + Sync {
    async fn call(&self, target: &NodeId, request: StorageRequest) -> RpcResult<StorageResponse>;
}

/// The external authority that records which epoch owns each log.
///
/// `try_advance_epoch` must be atomic: it fails with
/// `EpochStoreError::Conflict` unless `new_epoch` is greater than the
/// currently recorded epoch.
#[async_trait]
pub trait EpochAuthority: Send + Sync {
    async fn get_last_epoch(&self, log: LogId) -> EpochStoreResult<Epoch>;

    async fn try_advance_epoch(&self, log: LogId, new_epoch: Epoch) -> EpochStoreResult<()>;

    // 最近一个已完成恢复的 epoch（last clean epoch）
    async fn get_last_clean_epoch(&self, log: LogId) -> EpochStoreResult<Epoch>;

    async fn set_last_clean_epoch(
        &self,
        log: LogId,
        epoch: Epoch,
        tail: Esn,
    ) -> EpochStoreResult<()>;

    /// Fixed tail of an epoch recorded by recovery, if it has been recovered.
    async fn get_epoch_tail(&self, log: LogId, epoch: Epoch) -> EpochStoreResult<Option<Esn>>;
}
