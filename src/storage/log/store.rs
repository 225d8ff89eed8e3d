use std::{
    collections::VecDeque,
    fs::File,
    path::PathBuf,
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    error::StoreError,
    message::StoreFlags,
    traits::StoreResult,
    types::{Copyset, Epoch, Esn, LogId, Lsn, Payload, Record},
};

use super::{
    entry::{EntryMeta, Index, SealRecord, TrimRecord},
    segment::{LogSegment, read_record},
};

#[derive(Clone, Debug)]
pub struct LocalLogStoreOptions {
    /// Directory holding the segment file
    pub dir: PathBuf,
    pub file_name: String,
    /// Whether to fsync after each write
    pub sync_on_write: bool,
    /// Records fetched per index lookup by `RecordIter`
    pub read_batch_size: usize,
}

impl Default for LocalLogStoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/store"),
            file_name: "segment.log".to_string(),
            sync_on_write: true,
            read_batch_size: 64,
        }
    }
}

impl LocalLogStoreOptions {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn segment_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreHealth {
    Healthy,
    Degraded(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Stored,
    /// An identical copy is already there
    AlreadyExists,
    /// A different copy is there and the write may not replace it
    Conflict { recovered_in: Epoch },
}

pub(crate) struct StoreInner {
    options: LocalLogStoreOptions,
    // None while degraded; every mutation goes through this lock
    segment: Mutex<Option<LogSegment>>,
    index: RwLock<Index>,
    health: RwLock<StoreHealth>,
}

/// Durable, ordered record storage for one storage node.
#[derive(Clone)]
pub struct LocalLogStore {
    inner: Arc<StoreInner>,
}

impl LocalLogStore {
    /// Opens the store. Failure does not return an error: the store comes up
    /// degraded and `health()` says why.
    pub fn open(options: LocalLogStoreOptions) -> Self {
        let store = Self {
            inner: Arc::new(StoreInner {
                options,
                segment: Mutex::new(None),
                index: RwLock::new(Index::default()),
                health: RwLock::new(StoreHealth::Degraded("not opened".to_string())),
            }),
        };
        store.reopen();
        store
    }

    /// Re-acquire the segment handle (e.g. after external rotation) and
    /// rebuild the index from it.
    pub fn reopen(&self) {
        let options = &self.inner.options;
        let mut segment = self.inner.segment.lock();
        // 先释放旧句柄
        segment.take();

        let opened = std::fs::create_dir_all(&options.dir)
            .map_err(anyhow::Error::from)
            .and_then(|_| LogSegment::open(&options.segment_path(), options.sync_on_write));

        match opened {
            Ok((new_segment, index)) => {
                info!(
                    "Opened local log store {:?} ({} logs, {} bytes)",
                    new_segment.path,
                    index.logs.len(),
                    new_segment.len
                );
                *self.inner.index.write() = index;
                *segment = Some(new_segment);
                *self.inner.health.write() = StoreHealth::Healthy;
            }
            Err(e) => {
                error!(
                    "Could not open local log store {:?}: {}",
                    options.segment_path(),
                    e
                );
                *self.inner.health.write() = StoreHealth::Degraded(e.to_string());
            }
        }
    }

    pub fn health(&self) -> StoreHealth {
        self.inner.health.read().clone()
    }

    pub fn options(&self) -> &LocalLogStoreOptions {
        &self.inner.options
    }

    fn degrade(&self, segment: &mut Option<LogSegment>, reason: String) {
        error!("Local log store degraded: {}", reason);
        segment.take();
        *self.inner.health.write() = StoreHealth::Degraded(reason);
    }

    fn current_degraded(&self) -> StoreError {
        match &*self.inner.health.read() {
            StoreHealth::Degraded(reason) => StoreError::Degraded(reason.clone()),
            StoreHealth::Healthy => StoreError::Degraded("segment unavailable".to_string()),
        }
    }

    pub fn store(
        &self,
        log: LogId,
        lsn: Lsn,
        payload: Payload,
        copyset: Copyset,
    ) -> StoreResult<StoreStatus> {
        self.store_record(Record::data(log, lsn, payload, copyset), StoreFlags::default())
    }

    /// Write a record. A recovery write carrying a higher `recovered_in`
    /// replaces whatever copy is at (log, lsn). Otherwise an identical copy
    /// yields `AlreadyExists` and a different one `Conflict`.
    /// Sealed epochs reject writes unless `flags.recovery`.
    pub fn store_record(&self, record: Record, flags: StoreFlags) -> StoreResult<StoreStatus> {
        if record.lsn.epoch == Epoch::INVALID || record.lsn.esn == Esn::INVALID {
            return Err(StoreError::InvalidArgument(format!(
                "invalid lsn {}",
                record.lsn
            )));
        }

        let mut segment = self.inner.segment.lock();
        if segment.is_none() {
            return Err(self.current_degraded());
        }

        let existing = {
            let index = self.inner.index.read();
            if let Some(log_index) = index.get(&record.log) {
                if log_index.is_trimmed(record.lsn) {
                    return Err(StoreError::Trimmed {
                        lsn: record.lsn,
                        trim_point: log_index.trim_point,
                    });
                }
                if !flags.recovery && log_index.is_sealed(record.lsn.epoch) {
                    debug!(
                        "Rejecting store of {} {}: sealed through {}",
                        record.log, record.lsn, log_index.sealed
                    );
                    return Err(StoreError::Sealed {
                        sealed: log_index.sealed,
                    });
                }
                log_index.entries.get(&record.lsn).copied()
            } else {
                None
            }
        };

        if let Some(meta) = existing {
            let file = match segment.as_ref() {
                Some(seg) => seg.file(),
                None => return Err(self.current_degraded()),
            };
            let current = read_record(&file, &meta)?;
            let replaces = flags.recovery && record.recovered_in > current.recovered_in;
            if !replaces && current.same_content(&record) {
                return Ok(StoreStatus::AlreadyExists);
            }
            if !replaces {
                warn!(
                    "Refusing to overwrite {} {} (recovered in {}) with a different copy (recovered in {})",
                    record.log, record.lsn, current.recovered_in, record.recovered_in
                );
                return Ok(StoreStatus::Conflict {
                    recovered_in: current.recovered_in,
                });
            }
            info!(
                "Replacing {} {} recovered in {} with the copy recovered in {}",
                record.log, record.lsn, current.recovered_in, record.recovered_in
            );
        }

        let written = match segment.as_mut() {
            Some(seg) => seg.write_record(&record),
            None => return Err(self.current_degraded()),
        };
        let meta: EntryMeta = match written {
            Ok(meta) => meta,
            Err(e) => {
                let err = StoreError::from(e);
                self.degrade(&mut segment, err.to_string());
                return Err(err);
            }
        };

        self.inner.index.write().apply_record(&record, meta);
        Ok(StoreStatus::Stored)
    }

    /// Persist a seal marker covering every epoch `<= epoch`. Idempotent.
    pub fn seal(&self, log: LogId, epoch: Epoch) -> StoreResult<()> {
        let mut segment = self.inner.segment.lock();
        if segment.is_none() {
            return Err(self.current_degraded());
        }

        let already = self
            .inner
            .index
            .read()
            .get(&log)
            .is_some_and(|idx| idx.is_sealed(epoch));
        if already {
            return Ok(());
        }

        let seal = SealRecord { log, epoch };
        let written = match segment.as_mut() {
            Some(seg) => seg.write_seal(&seal),
            None => return Err(self.current_degraded()),
        };
        if let Err(e) = written {
            let err = StoreError::from(e);
            self.degrade(&mut segment, err.to_string());
            return Err(err);
        }

        info!("Sealed {} through {}", log, epoch);
        self.inner.index.write().apply_seal(&seal);
        Ok(())
    }

    /// Drop every record below `below`.
    pub fn trim(&self, log: LogId, below: Lsn) -> StoreResult<()> {
        let mut segment = self.inner.segment.lock();
        if segment.is_none() {
            return Err(self.current_degraded());
        }

        let current = self
            .inner
            .index
            .read()
            .get(&log)
            .map(|idx| idx.trim_point)
            .unwrap_or(Lsn::MIN);
        if below <= current {
            return Ok(());
        }

        let trim = TrimRecord { log, below };
        let written = match segment.as_mut() {
            Some(seg) => seg.write_trim(&trim),
            None => return Err(self.current_degraded()),
        };
        if let Err(e) = written {
            let err = StoreError::from(e);
            self.degrade(&mut segment, err.to_string());
            return Err(err);
        }

        self.inner.index.write().apply_trim(&trim);
        Ok(())
    }

    pub fn get_tail(&self, log: LogId, epoch: Epoch) -> Esn {
        self.inner
            .index
            .read()
            .get(&log)
            .map(|idx| idx.tail(epoch))
            .unwrap_or(Esn::INVALID)
    }

    pub fn esns(&self, log: LogId, epoch: Epoch) -> Vec<Esn> {
        self.inner
            .index
            .read()
            .get(&log)
            .map(|idx| idx.esns(epoch))
            .unwrap_or_default()
    }

    pub fn sealed_epoch(&self, log: LogId) -> Epoch {
        self.inner
            .index
            .read()
            .get(&log)
            .map(|idx| idx.sealed)
            .unwrap_or(Epoch::INVALID)
    }

    pub fn trim_point(&self, log: LogId) -> Lsn {
        self.inner
            .index
            .read()
            .get(&log)
            .map(|idx| idx.trim_point)
            .unwrap_or(Lsn::MIN)
    }

    pub fn read(&self, log: LogId, lsn: Lsn) -> StoreResult<Record> {
        let mut iter = self.read_range(log, lsn, lsn)?;
        match iter.next() {
            Some(result) => result,
            None => Err(StoreError::NotFound(lsn)),
        }
    }

    /// Forward iterator over `[from, to]` in LSN order.
    pub fn read_range(&self, log: LogId, from: Lsn, to: Lsn) -> StoreResult<RecordIter> {
        let trim_point = self.trim_point(log);
        if from < trim_point {
            return Err(StoreError::NotFound(from));
        }
        Ok(RecordIter {
            store: self.clone(),
            log,
            cursor: Some(from),
            to,
            buffer: VecDeque::new(),
            batch_size: self.inner.options.read_batch_size.max(1),
        })
    }

    fn current_file(&self) -> StoreResult<Arc<File>> {
        match self.inner.segment.lock().as_ref() {
            Some(seg) => Ok(seg.file()),
            None => Err(self.current_degraded()),
        }
    }
}

/// Restartable forward iterator over a log's stored records.
///
/// Holds no lock between calls: each refill looks the next batch up in the
/// index, so records stored behind the cursor are picked up and a `seek`
/// restarts from any position.
pub struct RecordIter {
    store: LocalLogStore,
    log: LogId,
    cursor: Option<Lsn>,
    to: Lsn,
    buffer: VecDeque<Record>,
    batch_size: usize,
}

impl RecordIter {
    pub fn seek(&mut self, lsn: Lsn) {
        self.buffer.clear();
        self.cursor = Some(lsn);
    }

    /// Next position the iterator will look at.
    pub fn position(&self) -> Option<Lsn> {
        self.buffer.front().map(|r| r.lsn).or(self.cursor)
    }

    fn refill(&mut self) -> StoreResult<()> {
        let from = match self.cursor {
            Some(from) if from <= self.to => from,
            _ => return Ok(()),
        };

        let metas: Vec<(Lsn, EntryMeta)> = {
            let index = self.store.inner.index.read();
            let Some(log_index) = index.get(&self.log) else {
                self.cursor = None;
                return Ok(());
            };
            if log_index.is_trimmed(from) {
                self.cursor = None;
                return Err(StoreError::NotFound(from));
            }
            log_index
                .entries
                .range(from..=self.to)
                .take(self.batch_size)
                .map(|(lsn, meta)| (*lsn, *meta))
                .collect()
        };

        if metas.is_empty() {
            self.cursor = None;
            return Ok(());
        }

        let file = self.store.current_file()?;
        for (lsn, meta) in &metas {
            let record = read_record(&file, meta).map_err(|e| {
                warn!("Failed to read {} {}: {}", self.log, lsn, e);
                StoreError::from(e)
            })?;
            self.buffer.push_back(record);
        }

        let last = metas[metas.len() - 1].0;
        self.cursor = last.successor();
        Ok(())
    }
}

impl Iterator for RecordIter {
    type Item = StoreResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(e) = self.refill() {
                self.cursor = None;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
