use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, anyhow};
use bincode::{Decode, Encode};
use tracing::warn;

use crate::types::{Epoch, Esn, LogId, Lsn, Record, RecordKind};

/// Location of a record body inside the segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub offset: u64,
    pub size: u64,
    pub kind: RecordKind,
}

/// Seal marker persisted in the segment: every epoch `<= epoch` is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SealRecord {
    pub log: LogId,
    pub epoch: Epoch,
}

/// Retention boundary: every record below `below` is gone.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TrimRecord {
    pub log: LogId,
    pub below: Lsn,
}

pub(crate) fn encode_body<T: Encode>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

pub(crate) fn decode_body<T: Decode<()>>(data: &[u8]) -> Result<T> {
    let (value, _) = bincode::decode_from_slice::<T, _>(data, bincode::config::standard())
        .map_err(|e| {
            warn!("Failed to decode entry body: {}", e);
            e
        })?;
    Ok(value)
}

/// Per-log index information
#[derive(Debug, Clone, Default)]
pub struct LogIndex {
    pub entries: BTreeMap<Lsn, EntryMeta>,
    /// Highest sealed epoch, `Epoch::INVALID` if never sealed.
    pub sealed: Epoch,
    pub trim_point: Lsn,
}

impl LogIndex {
    pub fn is_sealed(&self, epoch: Epoch) -> bool {
        self.sealed != Epoch::INVALID && epoch <= self.sealed
    }

    pub fn is_trimmed(&self, lsn: Lsn) -> bool {
        lsn < self.trim_point
    }

    /// Highest esn physically present in `epoch`.
    pub fn tail(&self, epoch: Epoch) -> Esn {
        self.entries
            .range(Lsn::first_in(epoch)..=Lsn::last_in(epoch))
            .next_back()
            .map(|(lsn, _)| lsn.esn)
            .unwrap_or(Esn::INVALID)
    }

    pub fn esns(&self, epoch: Epoch) -> Vec<Esn> {
        self.entries
            .range(Lsn::first_in(epoch)..=Lsn::last_in(epoch))
            .map(|(lsn, _)| lsn.esn)
            .collect()
    }

    pub fn seal(&mut self, epoch: Epoch) {
        if epoch > self.sealed {
            self.sealed = epoch;
        }
    }

    pub fn trim(&mut self, below: Lsn) {
        if below <= self.trim_point {
            return;
        }
        self.entries = self.entries.split_off(&below);
        self.trim_point = below;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    pub logs: HashMap<LogId, LogIndex>,
}

impl Index {
    pub fn get(&self, log: &LogId) -> Option<&LogIndex> {
        self.logs.get(log)
    }

    pub fn log_mut(&mut self, log: LogId) -> &mut LogIndex {
        self.logs.entry(log).or_default()
    }

    pub fn apply_record(&mut self, record: &Record, meta: EntryMeta) {
        let index = self.log_mut(record.log);
        if index.is_trimmed(record.lsn) {
            return;
        }
        // 同一位置的后写副本覆盖先前的副本
        index.entries.insert(record.lsn, meta);
    }

    pub fn apply_seal(&mut self, seal: &SealRecord) {
        self.log_mut(seal.log).seal(seal.epoch);
    }

    pub fn apply_trim(&mut self, trim: &TrimRecord) {
        self.log_mut(trim.log).trim(trim.below);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Record,
    Seal,
    Trim,
}

impl EntryType {
    fn code(self) -> u32 {
        match self {
            EntryType::Record => 1,
            EntryType::Seal => 2,
            EntryType::Trim => 3,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(EntryType::Record),
            2 => Ok(EntryType::Seal),
            3 => Ok(EntryType::Trim),
            _ => Err(anyhow!("Invalid entry type {}", code)),
        }
    }
}

pub const ENTRY_MAGIC_NUM: u32 = 0x_5245_504C;
pub const ENTRY_HEADER_SIZE: u32 = 16; // 4 + 4 + 4 + 4 = 16 bytes

// |  size (u32) | entry_type (u32) | magic (u32) | crc (u32) |  body ... |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    /// Body size, header excluded.
    pub size: u32,
    pub entry_type: EntryType,
    pub magic_num: u32,
    pub crc: u32,
}

impl EntryHeader {
    pub fn new(size: u32, entry_type: EntryType, crc: u32) -> Self {
        Self {
            size,
            entry_type,
            magic_num: ENTRY_MAGIC_NUM,
            crc,
        }
    }

    pub fn for_body(entry_type: EntryType, body: &[u8]) -> Self {
        Self::new(body.len() as u32, entry_type, crc32fast::hash(body))
    }

    pub fn serialize(&self) -> [u8; ENTRY_HEADER_SIZE as usize] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.entry_type.code().to_le_bytes());
        buf[8..12].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_HEADER_SIZE as usize {
            return Err(anyhow!("Invalid header length {}", data.len()));
        }

        let read_u32 = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(bytes)
        };

        let magic_num = read_u32(8);
        if magic_num != ENTRY_MAGIC_NUM {
            return Err(anyhow!("Invalid magic number {:#x}", magic_num));
        }

        Ok(Self {
            size: read_u32(0),
            entry_type: EntryType::from_code(read_u32(4))?,
            magic_num,
            crc: read_u32(12),
        })
    }

    pub fn verify(&self, body: &[u8]) -> bool {
        crc32fast::hash(body) == self.crc
    }
}
