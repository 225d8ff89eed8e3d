use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::{Epoch, Esn, LogId, Lsn, NodeId};

/// 顶层错误类型
#[derive(Debug, Error)]
pub enum ReplogError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Epoch store error: {0}")]
    EpochStore(#[from] EpochStoreError),

    #[error("Sequencer error: {0}")]
    Sequencer(#[from] SequencerError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Copyset selection error: {0}")]
    Select(#[from] SelectError),
}

/// RPC通信相关错误
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("Target node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC timeout")]
    Timeout,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// 本地存储相关错误
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(Arc<anyhow::Error>),

    #[error("Epoch sealed on this node (sealed through {sealed})")]
    Sealed { sealed: Epoch },

    #[error("Record {0} not found")]
    NotFound(Lsn),

    #[error("Position {lsn} is below trim point {trim_point}")]
    Trimmed { lsn: Lsn, trim_point: Lsn },

    #[error("Store degraded: {0}")]
    Degraded(String),

    #[error("Corrupted data at offset {0}")]
    DataCorruption(u64),

    #[error("Store worker channel closed")]
    ChannelClosed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(Arc::new(e.into()))
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Io(Arc::new(e))
    }
}

/// Epoch 元数据存储错误
#[derive(Debug, Clone, Error)]
pub enum EpochStoreError {
    #[error("Epoch conflict on {log}: current {current}, requested {requested}")]
    Conflict {
        log: LogId,
        current: Epoch,
        requested: Epoch,
    },

    #[error("Stale clean epoch for {log}: recorded {recorded}, got {requested}")]
    Stale {
        log: LogId,
        recorded: Epoch,
        requested: Epoch,
    },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid sequencer transition from {from} on {event}")]
pub struct TransitionError {
    pub from: String,
    pub event: String,
}

/// Sequencer 相关错误
#[derive(Debug, Clone, Error)]
pub enum SequencerError {
    #[error("Sequencer for {log} is not active ({state})")]
    NotActive { log: LogId, state: String },

    #[error("Another sequencer owns {log}: {source}")]
    Conflict {
        log: LogId,
        #[source]
        source: EpochStoreError,
    },

    #[error("Epoch store error: {0}")]
    EpochStore(#[from] EpochStoreError),

    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Seal,
    Digest,
    Repair,
}

impl std::fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryPhase::Seal => write!(f, "seal"),
            RecoveryPhase::Digest => write!(f, "digest"),
            RecoveryPhase::Repair => write!(f, "repair"),
        }
    }
}

/// Epoch 恢复相关错误
#[derive(Debug, Clone, Error)]
pub enum RecoveryError {
    #[error(
        "Quorum unavailable during {phase} after {attempts} attempts ({reachable} reachable, {required} required)"
    )]
    QuorumUnavailable {
        phase: RecoveryPhase,
        attempts: u32,
        reachable: usize,
        required: usize,
    },

    #[error("Storage set of {nodes} nodes cannot hold {replication} copies")]
    StorageSetTooSmall { nodes: usize, replication: usize },

    #[error("Could not bring {esn} of {log} {epoch} to {required} copies (have {copies})")]
    RepairIncomplete {
        log: LogId,
        epoch: Epoch,
        esn: Esn,
        copies: usize,
        required: usize,
    },

    #[error("Recovery cancelled")]
    Cancelled,

    #[error("Epoch store error: {0}")]
    EpochStore(#[from] EpochStoreError),
}

/// 副本节点选择错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("Insufficient nodes: {available} eligible, {required} required")]
    InsufficientNodes { available: usize, required: usize },
}

/// Appender 失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    Timeout,
    EpochSealed,
    InsufficientNodes,
    Cancelled,
    PermissionDenied,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailReason::Timeout => write!(f, "timeout"),
            FailReason::EpochSealed => write!(f, "epoch sealed"),
            FailReason::InsufficientNodes => write!(f, "insufficient nodes"),
            FailReason::Cancelled => write!(f, "cancelled"),
            FailReason::PermissionDenied => write!(f, "permission denied"),
        }
    }
}

/// 客户端相关错误
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("No active sequencer for {0}")]
    NotActive(LogId),

    #[error("Outstanding append window full for {log} ({window} in flight)")]
    WindowFull { log: LogId, window: usize },

    #[error("Append failed: {0}")]
    Failed(FailReason),

    #[error("Sequencer error: {0}")]
    Sequencer(#[from] SequencerError),

    #[error("Shutting down")]
    ShuttingDown,
}

/// 读取相关错误
#[derive(Debug, Clone, Error)]
pub enum ReadError {
    #[error("Gap in {log} at {lsn}")]
    Gap { log: LogId, lsn: Lsn },

    #[error("Record {0} not found")]
    NotFound(Lsn),

    #[error("Only {reachable} of {required} nodes answered")]
    QuorumUnavailable { reachable: usize, required: usize },

    /// Different copies at `lsn` carry the same recovery tag
    #[error("Conflicting copies of {lsn} in {log}")]
    Conflict { log: LogId, lsn: Lsn },

    #[error("Read denied: {0}")]
    Denied(String),

    #[error("Epoch store error: {0}")]
    EpochStore(#[from] EpochStoreError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// === 统一错误处理机制 ===
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Fatal,       // 数据完整性问题，需要运维介入
    Recoverable, // 可以重试或降级处理的错误
    Ignorable,   // 仅需记录日志的错误
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for RpcError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            RpcError::NodeNotFound(_) => ErrorSeverity::Recoverable,
            RpcError::Network(_) => ErrorSeverity::Recoverable,
            RpcError::Timeout => ErrorSeverity::Recoverable,
            RpcError::Codec(_) => ErrorSeverity::Fatal,
            RpcError::Protocol(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for StoreError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StoreError::Io(_) => ErrorSeverity::Recoverable,
            StoreError::Sealed { .. } => ErrorSeverity::Ignorable,
            StoreError::NotFound(_) => ErrorSeverity::Fatal,
            StoreError::Trimmed { .. } => ErrorSeverity::Ignorable,
            StoreError::Degraded(_) => ErrorSeverity::Recoverable,
            StoreError::DataCorruption(_) => ErrorSeverity::Fatal,
            StoreError::ChannelClosed => ErrorSeverity::Recoverable,
            StoreError::InvalidArgument(_) => ErrorSeverity::Ignorable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for RecoveryError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            RecoveryError::QuorumUnavailable { .. } => ErrorSeverity::Recoverable,
            RecoveryError::StorageSetTooSmall { .. } => ErrorSeverity::Fatal,
            RecoveryError::RepairIncomplete { .. } => ErrorSeverity::Recoverable,
            RecoveryError::Cancelled => ErrorSeverity::Ignorable,
            RecoveryError::EpochStore(_) => ErrorSeverity::Recoverable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for ClientError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ClientError::NotActive(_) => ErrorSeverity::Ignorable,
            ClientError::WindowFull { .. } => ErrorSeverity::Ignorable,
            ClientError::Failed(FailReason::EpochSealed) => ErrorSeverity::Ignorable,
            ClientError::Failed(_) => ErrorSeverity::Recoverable,
            ClientError::Sequencer(_) => ErrorSeverity::Recoverable,
            ClientError::ShuttingDown => ErrorSeverity::Ignorable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for ReadError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ReadError::Gap { .. } => ErrorSeverity::Fatal,
            ReadError::NotFound(_) => ErrorSeverity::Fatal,
            ReadError::QuorumUnavailable { .. } => ErrorSeverity::Recoverable,
            ReadError::Conflict { .. } => ErrorSeverity::Fatal,
            ReadError::Denied(_) => ErrorSeverity::Ignorable,
            ReadError::EpochStore(_) => ErrorSeverity::Recoverable,
            ReadError::Rpc(e) => e.severity(),
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

/// 按严重程度统一记录错误
pub fn report<E: ErrorHandler>(err: &E, operation: &str, target: Option<&NodeId>) {
    let ctx = match target {
        Some(t) => format!("{} on {}", operation, t),
        None => operation.to_string(),
    };
    match err.severity() {
        ErrorSeverity::Fatal => error!("[FATAL] {} failed: {}", ctx, err.context()),
        ErrorSeverity::Recoverable => {
            warn!("[RECOVERABLE] {} failed: {}", ctx, err.context())
        }
        ErrorSeverity::Ignorable => info!("[IGNORABLE] {} failed: {}", ctx, err.context()),
    }
}
