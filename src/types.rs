use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

// 类型定义
pub type Payload = Vec<u8>;

/// 日志流标识
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct LogId(pub u64);

impl Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log:{}", self.0)
    }
}

/// 存储节点标识
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Sequencing generation of a log. Epoch 0 means no sequencer ever ran.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const INVALID: Epoch = Epoch(0);
    pub const MAX: Epoch = Epoch(u64::MAX);

    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Position within an epoch, starting at 1.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub struct Esn(pub u64);

impl Esn {
    pub const INVALID: Esn = Esn(0);
    pub const MIN: Esn = Esn(1);
    pub const MAX: Esn = Esn(u64::MAX);

    pub fn next(self) -> Esn {
        Esn(self.0 + 1)
    }
}

impl Display for Esn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// (epoch, esn); field order gives the total order of a log.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub struct Lsn {
    pub epoch: Epoch,
    pub esn: Esn,
}

impl Lsn {
    pub const MIN: Lsn = Lsn {
        epoch: Epoch(0),
        esn: Esn(0),
    };
    pub const MAX: Lsn = Lsn {
        epoch: Epoch::MAX,
        esn: Esn::MAX,
    };

    pub fn new(epoch: u64, esn: u64) -> Self {
        Self {
            epoch: Epoch(epoch),
            esn: Esn(esn),
        }
    }

    pub fn first_in(epoch: Epoch) -> Self {
        Self {
            epoch,
            esn: Esn::MIN,
        }
    }

    pub fn last_in(epoch: Epoch) -> Self {
        Self {
            epoch,
            esn: Esn::MAX,
        }
    }

    /// Next position in the total order, `None` past `Lsn::MAX`.
    pub fn successor(self) -> Option<Lsn> {
        if self.esn < Esn::MAX {
            Some(Lsn {
                epoch: self.epoch,
                esn: self.esn.next(),
            })
        } else if self.epoch < Epoch::MAX {
            Some(Lsn {
                epoch: self.epoch.next(),
                esn: Esn::INVALID,
            })
        } else {
            None
        }
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.epoch, self.esn)
    }
}

/// 副本所在节点集合（有序、无重复）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Copyset(Vec<NodeId>);

impl Copyset {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        let mut dedup: Vec<NodeId> = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !dedup.contains(&node) {
                dedup.push(node);
            }
        }
        Self(dedup)
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    /// Swaps `old` for `new` in place, keeping the position.
    pub fn replace(&mut self, old: &NodeId, new: NodeId) -> bool {
        if self.0.contains(&new) {
            return false;
        }
        match self.0.iter().position(|n| n == old) {
            Some(pos) => {
                self.0[pos] = new;
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, node: NodeId) {
        if !self.0.contains(&node) {
            self.0.push(node);
        }
    }
}

impl Display for Copyset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, node) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", node)?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum RecordKind {
    Data,
    /// 恢复时写入的空记录，用于填补空洞
    Bridge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Record {
    pub log: LogId,
    pub lsn: Lsn,
    pub kind: RecordKind,
    pub payload: Payload,
    pub copyset: Copyset,
    /// Epoch of the sequencer whose recovery wrote this copy; `Epoch(0)` for
    /// copies written by an appender. A higher value replaces a differing
    /// copy at the same position.
    pub recovered_in: Epoch,
}

impl Record {
    pub fn data(log: LogId, lsn: Lsn, payload: Payload, copyset: Copyset) -> Self {
        Self {
            log,
            lsn,
            kind: RecordKind::Data,
            payload,
            copyset,
            recovered_in: Epoch::INVALID,
        }
    }

    pub fn bridge(log: LogId, lsn: Lsn, copyset: Copyset) -> Self {
        Self {
            log,
            lsn,
            kind: RecordKind::Bridge,
            payload: Vec::new(),
            copyset,
            recovered_in: Epoch::INVALID,
        }
    }

    pub fn recovered_by(mut self, epoch: Epoch) -> Self {
        self.recovered_in = epoch;
        self
    }

    pub fn is_bridge(&self) -> bool {
        self.kind == RecordKind::Bridge
    }

    /// Same kind and payload; copyset and recovery tag are not compared.
    pub fn same_content(&self, other: &Record) -> bool {
        self.kind == other.kind && self.payload == other.payload
    }
}

/// 请求ID类型（用于过滤超时响应）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        Self(rand::random::<u64>())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<RequestId> for u64 {
    fn from(val: RequestId) -> Self {
        val.0
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
