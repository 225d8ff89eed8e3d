use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RpcError;
use crate::permission::{Action, Principal};
use crate::types::{Epoch, Esn, LogId, Lsn, Record, RequestId};

// === 存储节点协议 ===

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct StoreFlags {
    /// 恢复流程写入：允许写入已 seal 的 epoch
    pub recovery: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum StorageRequest {
    Store { record: Record, flags: StoreFlags },
    Seal { log: LogId, epoch: Epoch },
    GetTail { log: LogId, epoch: Epoch },
    /// Inclusive on both ends.
    GetRange {
        log: LogId,
        epoch: Epoch,
        from: Esn,
        to: Esn,
    },
    Trim { log: LogId, below: Lsn },
}

impl StorageRequest {
    pub fn log(&self) -> LogId {
        match self {
            StorageRequest::Store { record, .. } => record.log,
            StorageRequest::Seal { log, .. }
            | StorageRequest::GetTail { log, .. }
            | StorageRequest::GetRange { log, .. }
            | StorageRequest::Trim { log, .. } => *log,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            StorageRequest::Store { flags, .. } if flags.recovery => Action::ServerInternal,
            StorageRequest::Store { .. } => Action::Append,
            StorageRequest::Seal { .. } => Action::ServerInternal,
            StorageRequest::GetTail { .. } | StorageRequest::GetRange { .. } => Action::Read,
            StorageRequest::Trim { .. } => Action::Trim,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageRequest::Store { .. } => "STORE",
            StorageRequest::Seal { .. } => "SEAL",
            StorageRequest::GetTail { .. } => "GET_TAIL",
            StorageRequest::GetRange { .. } => "GET_RANGE",
            StorageRequest::Trim { .. } => "TRIM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum StorageResponse {
    Ok,
    AlreadyExists,
    /// 节点已 seal 到该 epoch
    Rejected { sealed: Epoch },
    /// 该位置已有不同的副本，且本次写入不能覆盖
    Conflict { recovered_in: Epoch },
    NotFound,
    Tail(Esn),
    Records(Vec<Record>),
    Denied(String),
    /// Node-side failure (degraded store, IO error); callers treat it as transient.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub principal: Principal,
    pub request: StorageRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    pub response: StorageResponse,
}

pub fn encode_frame<T: Encode>(value: &T) -> Result<Vec<u8>, RpcError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
        warn!("Failed to encode frame: {}", e);
        RpcError::Codec(e.to_string())
    })
}

pub fn decode_frame<T: Decode<()>>(data: &[u8]) -> Result<T, RpcError> {
    let (value, read) =
        bincode::decode_from_slice::<T, _>(data, bincode::config::standard()).map_err(|e| {
            warn!("Failed to decode frame: {}", e);
            RpcError::Codec(e.to_string())
        })?;
    if read != data.len() {
        return Err(RpcError::Protocol(format!(
            "{} trailing bytes after frame",
            data.len() - read
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Copyset, NodeId};

    #[test]
    fn recovery_store_is_server_internal() {
        let record = Record::bridge(LogId(3), Lsn::new(2, 7), Copyset::default());
        let normal = StorageRequest::Store {
            record: record.clone(),
            flags: StoreFlags::default(),
        };
        let recovery = StorageRequest::Store {
            record,
            flags: StoreFlags { recovery: true },
        };
        assert_eq!(normal.action(), Action::Append);
        assert_eq!(recovery.action(), Action::ServerInternal);
        assert_eq!(recovery.log(), LogId(3));
    }

    #[test]
    fn envelope_survives_frame_codec() {
        let envelope = RequestEnvelope {
            request_id: RequestId::from(9),
            principal: Principal::ClusterNode(NodeId::new("seq-1")),
            request: StorageRequest::GetRange {
                log: LogId(1),
                epoch: Epoch(4),
                from: Esn(1),
                to: Esn(10),
            },
        };
        let buf = encode_frame(&envelope).unwrap();
        let decoded: RequestEnvelope = decode_frame(&buf).unwrap();
        assert_eq!(decoded, envelope);

        let mut truncated = buf.clone();
        truncated.pop();
        assert!(decode_frame::<RequestEnvelope>(&truncated).is_err());
    }
}
