use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Result, anyhow};
use tracing::{debug, info, warn};

use crate::types::Record;

use super::entry::{
    ENTRY_HEADER_SIZE, EntryHeader, EntryMeta, EntryType, Index, SealRecord, TrimRecord,
    decode_body, encode_body,
};

// LogSegment file format:
// | EntryHeader [ record | seal | trim ] | EntryHeader [ ... ] | ...
// Entries are only ever appended; replay rebuilds the index from scratch.

pub struct LogSegment {
    pub(crate) path: PathBuf,
    pub(crate) file: Arc<File>,
    /// End of the last complete entry; the next append goes here.
    pub(crate) len: u64,
    sync_on_write: bool,
}

impl LogSegment {
    /// Open (or create) the segment at `path` and replay it.
    pub fn open(path: &Path, sync_on_write: bool) -> Result<(Self, Index)> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                warn!("Failed to open log segment {:?}: {}", path, e);
                e
            })?;

        let mut segment = Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
            len: 0,
            sync_on_write,
        };
        let index = segment.replay_segment()?;
        Ok((segment, index))
    }

    pub fn file(&self) -> Arc<File> {
        self.file.clone()
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync log segment file data: {}", e);
            e.into()
        })
    }

    fn append_entry(&mut self, entry_type: EntryType, body: &[u8]) -> Result<u64> {
        let header = EntryHeader::for_body(entry_type, body);

        let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE as usize + body.len());
        buf.extend_from_slice(&header.serialize());
        buf.extend_from_slice(body);

        self.file.write_all_at(&buf, self.len).map_err(|e| {
            warn!("Failed to write {:?} entry to {:?}: {}", entry_type, self.path, e);
            e
        })?;
        if self.sync_on_write {
            self.sync_data()?;
        }

        let body_offset = self.len + ENTRY_HEADER_SIZE as u64;
        self.len += buf.len() as u64;
        Ok(body_offset)
    }

    pub fn write_record(&mut self, record: &Record) -> Result<EntryMeta> {
        let body = encode_body(record)?;
        let offset = self.append_entry(EntryType::Record, &body)?;
        Ok(EntryMeta {
            offset,
            size: body.len() as u64,
            kind: record.kind,
        })
    }

    pub fn write_seal(&mut self, seal: &SealRecord) -> Result<()> {
        let body = encode_body(seal)?;
        self.append_entry(EntryType::Seal, &body)?;
        Ok(())
    }

    pub fn write_trim(&mut self, trim: &TrimRecord) -> Result<()> {
        let body = encode_body(trim)?;
        self.append_entry(EntryType::Trim, &body)?;
        Ok(())
    }

    /// Replay the segment to rebuild the index.
    ///
    /// Stops at the first incomplete header, bad magic or CRC mismatch and
    /// truncates the file there, so a torn write from a crash is dropped
    /// instead of poisoning later appends.
    pub fn replay_segment(&mut self) -> Result<Index> {
        let mut index = Index::default();
        let file_size = self.file.metadata()?.len();

        let mut offset: u64 = 0;
        let mut header_buf = [0u8; ENTRY_HEADER_SIZE as usize];
        let mut replayed = 0usize;

        while offset < file_size {
            if offset + ENTRY_HEADER_SIZE as u64 > file_size {
                warn!("Incomplete header at offset {}, stopping replay", offset);
                break;
            }
            self.file.read_exact_at(&mut header_buf, offset)?;

            let header = match EntryHeader::deserialize(&header_buf) {
                Ok(h) => h,
                Err(e) => {
                    warn!("Failed to deserialize header at offset {}: {}", offset, e);
                    break;
                }
            };

            let body_offset = offset + ENTRY_HEADER_SIZE as u64;
            let body_size = header.size as u64;
            if body_offset + body_size > file_size {
                warn!("Incomplete entry body at offset {}, stopping replay", offset);
                break;
            }

            let mut body = vec![0u8; body_size as usize];
            self.file.read_exact_at(&mut body, body_offset)?;
            if !header.verify(&body) {
                warn!("CRC mismatch at offset {}, stopping replay", offset);
                break;
            }

            match header.entry_type {
                EntryType::Record => match decode_body::<Record>(&body) {
                    Ok(record) => index.apply_record(
                        &record,
                        EntryMeta {
                            offset: body_offset,
                            size: body_size,
                            kind: record.kind,
                        },
                    ),
                    Err(e) => {
                        warn!("Skipping undecodable record at offset {}: {}", offset, e)
                    }
                },
                EntryType::Seal => match decode_body::<SealRecord>(&body) {
                    Ok(seal) => index.apply_seal(&seal),
                    Err(e) => warn!("Skipping undecodable seal at offset {}: {}", offset, e),
                },
                EntryType::Trim => match decode_body::<TrimRecord>(&body) {
                    Ok(trim) => index.apply_trim(&trim),
                    Err(e) => warn!("Skipping undecodable trim at offset {}: {}", offset, e),
                },
            }

            replayed += 1;
            offset = body_offset + body_size;
        }

        if offset < file_size {
            info!(
                "Truncating {:?} from {} to {} bytes after torn tail",
                self.path, file_size, offset
            );
            self.file.set_len(offset)?;
            self.sync_data()?;
        }

        debug!("Replayed {} entries from {:?}", replayed, self.path);
        self.len = offset;
        Ok(index)
    }
}

/// Read one record body through a shared file handle.
pub fn read_record(file: &File, meta: &EntryMeta) -> Result<Record> {
    let mut buf = vec![0u8; meta.size as usize];
    file.read_exact_at(&mut buf, meta.offset).map_err(|e| {
        warn!("Failed to read record at offset {}: {}", meta.offset, e);
        anyhow!(e)
    })?;
    decode_body::<Record>(&buf)
}
