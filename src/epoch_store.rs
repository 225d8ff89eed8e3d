//! Epoch authority implementations.
//!
//! Both stores keep one `LogMetadata` per log and apply the same update
//! rules; they differ only in where the metadata lives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EpochStoreError;
use crate::traits::{EpochAuthority, EpochStoreResult};
use crate::types::{Epoch, Esn, LogId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochTail {
    pub epoch: Epoch,
    pub tail: Esn,
}

/// Per-log record kept by the epoch authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Highest epoch ever handed to a sequencer
    pub epoch: Epoch,
    /// Every epoch up to this one has been recovered
    pub last_clean_epoch: Epoch,
    /// Fixed tails of recovered epochs, ascending by epoch
    pub tails: Vec<EpochTail>,
    /// Bumped on every successful update
    pub version: u64,
    pub last_changed_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl LogMetadata {
    fn touch(&mut self) {
        self.version += 1;
        self.last_changed_ms = now_ms();
    }

    pub fn advance_epoch(&mut self, log: LogId, new_epoch: Epoch) -> EpochStoreResult<()> {
        if new_epoch <= self.epoch {
            return Err(EpochStoreError::Conflict {
                log,
                current: self.epoch,
                requested: new_epoch,
            });
        }
        self.epoch = new_epoch;
        self.touch();
        Ok(())
    }

    /// Record `epoch` as recovered with the given fixed tail.
    ///
    /// Re-recording the current last clean epoch with the same tail is a
    /// no-op; anything older, or a different tail, is stale.
    pub fn set_last_clean(&mut self, log: LogId, epoch: Epoch, tail: Esn) -> EpochStoreResult<()> {
        if epoch <= self.last_clean_epoch {
            if epoch == self.last_clean_epoch && self.tail_of(epoch) == Some(tail) {
                return Ok(());
            }
            return Err(EpochStoreError::Stale {
                log,
                recorded: self.last_clean_epoch,
                requested: epoch,
            });
        }
        self.last_clean_epoch = epoch;
        self.tails.push(EpochTail { epoch, tail });
        self.touch();
        Ok(())
    }

    pub fn tail_of(&self, epoch: Epoch) -> Option<Esn> {
        self.tails
            .iter()
            .rev()
            .find(|t| t.epoch == epoch)
            .map(|t| t.tail)
    }
}

/// In-memory epoch authority shared by everything in one process.
#[derive(Debug, Default)]
pub struct MemoryEpochStore {
    logs: Mutex<HashMap<LogId, LogMetadata>>,
}

impl MemoryEpochStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self, log: LogId) -> LogMetadata {
        self.logs.lock().get(&log).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl EpochAuthority for MemoryEpochStore {
    async fn get_last_epoch(&self, log: LogId) -> EpochStoreResult<Epoch> {
        Ok(self.metadata(log).epoch)
    }

    async fn try_advance_epoch(&self, log: LogId, new_epoch: Epoch) -> EpochStoreResult<()> {
        self.logs
            .lock()
            .entry(log)
            .or_default()
            .advance_epoch(log, new_epoch)
    }

    async fn get_last_clean_epoch(&self, log: LogId) -> EpochStoreResult<Epoch> {
        Ok(self.metadata(log).last_clean_epoch)
    }

    async fn set_last_clean_epoch(
        &self,
        log: LogId,
        epoch: Epoch,
        tail: Esn,
    ) -> EpochStoreResult<()> {
        self.logs
            .lock()
            .entry(log)
            .or_default()
            .set_last_clean(log, epoch, tail)
    }

    async fn get_epoch_tail(&self, log: LogId, epoch: Epoch) -> EpochStoreResult<Option<Esn>> {
        Ok(self.metadata(log).tail_of(epoch))
    }
}

/// Epoch authority backed by one JSON file per log under `dir`.
///
/// Updates are read-modify-write under a store-wide lock and land through a
/// temp file plus rename, so a reader never sees a half-written file.
pub struct FileEpochStore {
    dir: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileEpochStore {
    pub fn open(dir: impl Into<PathBuf>) -> EpochStoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            warn!("Failed to create epoch store dir {:?}: {}", dir, e);
            EpochStoreError::Io(e.to_string())
        })?;
        info!("Opened file epoch store at {:?}", dir);
        Ok(Self {
            dir,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, log: LogId) -> PathBuf {
        self.dir.join(format!("log_{}.json", log.0))
    }

    async fn load(&self, log: LogId) -> EpochStoreResult<LogMetadata> {
        let path = self.path_for(log);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                warn!("Corrupt epoch metadata {:?}: {}", path, e);
                EpochStoreError::Serialization(e.to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LogMetadata::default()),
            Err(e) => Err(EpochStoreError::Io(e.to_string())),
        }
    }

    async fn save(&self, log: LogId, metadata: &LogMetadata) -> EpochStoreResult<()> {
        let path = self.path_for(log);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(metadata)
            .map_err(|e| EpochStoreError::Serialization(e.to_string()))?;

        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::File::open(&tmp).await?.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };
        write.await.map_err(|e: std::io::Error| {
            warn!("Failed to write epoch metadata {:?}: {}", path, e);
            EpochStoreError::Io(e.to_string())
        })?;
        debug!("{}: epoch metadata version {} written", log, metadata.version);
        Ok(())
    }

    async fn update<F>(&self, log: LogId, apply: F) -> EpochStoreResult<()>
    where
        F: FnOnce(&mut LogMetadata) -> EpochStoreResult<()> + Send,
    {
        let _guard = self.lock.lock().await;
        let mut metadata = self.load(log).await?;
        apply(&mut metadata)?;
        self.save(log, &metadata).await
    }

    pub async fn metadata(&self, log: LogId) -> EpochStoreResult<LogMetadata> {
        let _guard = self.lock.lock().await;
        self.load(log).await
    }
}

#[async_trait]
impl EpochAuthority for FileEpochStore {
    async fn get_last_epoch(&self, log: LogId) -> EpochStoreResult<Epoch> {
        Ok(self.metadata(log).await?.epoch)
    }

    async fn try_advance_epoch(&self, log: LogId, new_epoch: Epoch) -> EpochStoreResult<()> {
        self.update(log, |m| m.advance_epoch(log, new_epoch)).await
    }

    async fn get_last_clean_epoch(&self, log: LogId) -> EpochStoreResult<Epoch> {
        Ok(self.metadata(log).await?.last_clean_epoch)
    }

    async fn set_last_clean_epoch(
        &self,
        log: LogId,
        epoch: Epoch,
        tail: Esn,
    ) -> EpochStoreResult<()> {
        self.update(log, |m| m.set_last_clean(log, epoch, tail))
            .await
    }

    async fn get_epoch_tail(&self, log: LogId, epoch: Epoch) -> EpochStoreResult<Option<Esn>> {
        Ok(self.metadata(log).await?.tail_of(epoch))
    }
}
