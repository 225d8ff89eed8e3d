use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::appender::{
    AppendOutcome, Appender, AppenderArena, AppenderHandle, AppenderOptions, AppenderState,
};
use crate::cancel::Cancellation;
use crate::config::ClusterConfig;
use crate::copyset::{CopysetSelector, SelectorOptions};
use crate::error::{ClientError, FailReason, SequencerError};
use crate::recovery::{EpochRecovery, RecoveryOptions};
use crate::sequencer::{Sequencer, SequencerState};
use crate::traits::{ClientResult, EpochAuthority, RecoveryResult, StorageTransport};
use crate::types::{Epoch, LogId, Lsn, Payload, Record};

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Max appends in flight per log
    pub window: usize,
    pub appender: AppenderOptions,
    pub recovery: RecoveryOptions,
    pub selector: SelectorOptions,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            window: 128,
            appender: AppenderOptions::default(),
            recovery: RecoveryOptions::default(),
            selector: SelectorOptions::default(),
        }
    }
}

/// Bookkeeping for one append in flight.
#[derive(Debug, Clone)]
pub struct InFlightAppend {
    pub lsn: Lsn,
    pub state: AppenderState,
    pub started: Instant,
}

struct LogContext {
    sequencer: Arc<Sequencer>,
    window: Arc<Semaphore>,
    in_flight: Arc<Mutex<AppenderArena<InFlightAppend>>>,
}

/// Frees an append's in-flight slot once the append finishes or its future
/// is dropped.
struct InFlightSlot {
    arena: Arc<Mutex<AppenderArena<InFlightAppend>>>,
    handle: Option<AppenderHandle>,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.arena.lock().remove(handle);
        }
    }
}

/// Sequencing side of the system: runs a sequencer per log and the appenders
/// replicating its records.
pub struct LogDriver {
    replication: usize,
    transport: Arc<dyn StorageTransport>,
    authority: Arc<dyn EpochAuthority>,
    selector: Arc<CopysetSelector>,
    recovery: Arc<EpochRecovery>,
    options: DriverOptions,
    logs: RwLock<HashMap<LogId, Arc<LogContext>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl LogDriver {
    pub fn new(
        config: &ClusterConfig,
        transport: Arc<dyn StorageTransport>,
        authority: Arc<dyn EpochAuthority>,
        options: DriverOptions,
    ) -> RecoveryResult<Self> {
        let recovery = EpochRecovery::new(config, transport.clone(), options.recovery.clone())?;
        let selector = CopysetSelector::new(config, options.selector.clone());
        let (shutdown_tx, _) = watch::channel(false);
        info!(
            "Log driver over {} nodes, r={}, window {}",
            config.nodes.len(),
            config.replication,
            options.window
        );
        Ok(Self {
            replication: config.replication,
            transport,
            authority,
            selector: Arc::new(selector),
            recovery: Arc::new(recovery),
            options,
            logs: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    pub fn selector(&self) -> &CopysetSelector {
        &self.selector
    }

    fn context(&self, log: LogId) -> Option<Arc<LogContext>> {
        self.logs.read().get(&log).cloned()
    }

    fn context_or_create(&self, log: LogId) -> Arc<LogContext> {
        self.logs
            .write()
            .entry(log)
            .or_insert_with(|| {
                let window = self.options.window.max(1);
                Arc::new(LogContext {
                    sequencer: Arc::new(Sequencer::new(
                        log,
                        self.authority.clone(),
                        self.recovery.clone(),
                        self.shutdown_tx.subscribe(),
                    )),
                    window: Arc::new(Semaphore::new(window)),
                    in_flight: Arc::new(Mutex::new(AppenderArena::with_capacity(window))),
                })
            })
            .clone()
    }

    /// Become the sequencer of `log`. Returns the epoch it now owns.
    pub async fn activate(&self, log: LogId) -> ClientResult<Epoch> {
        if *self.shutdown_tx.borrow() {
            return Err(ClientError::ShuttingDown);
        }
        let context = self.context_or_create(log);
        Ok(context.sequencer.activate().await?)
    }

    pub fn sequencer_state(&self, log: LogId) -> Option<SequencerState> {
        self.context(log).map(|c| c.sequencer.state())
    }

    pub fn in_flight(&self, log: LogId) -> Vec<InFlightAppend> {
        self.context(log)
            .map(|c| c.in_flight.lock().iter().map(|(_, a)| a.clone()).collect())
            .unwrap_or_default()
    }

    /// Append `payload` to `log`. Resolves once `r` storage nodes hold it.
    pub async fn append(&self, log: LogId, payload: Payload) -> ClientResult<Lsn> {
        if *self.shutdown_tx.borrow() {
            return Err(ClientError::ShuttingDown);
        }
        let context = self.context(log).ok_or(ClientError::NotActive(log))?;
        let _permit = context
            .window
            .clone()
            .try_acquire_owned()
            .map_err(|_| ClientError::WindowFull {
                log,
                window: self.options.window.max(1),
            })?;

        let assignment = context.sequencer.assign().map_err(|e| match e {
            SequencerError::NotActive { .. } => ClientError::NotActive(log),
            other => ClientError::Sequencer(other),
        })?;
        let lsn = assignment.lsn;

        // LSN 已分配；选点失败时该位置留给恢复填补
        let copyset = self.selector.select(log, self.replication).map_err(|e| {
            warn!("{}: no copyset for {}: {}", log, lsn, e);
            ClientError::Failed(FailReason::InsufficientNodes)
        })?;

        let handle = context.in_flight.lock().insert(InFlightAppend {
            lsn,
            state: AppenderState::Assigned,
            started: Instant::now(),
        });
        let slot = InFlightSlot {
            arena: context.in_flight.clone(),
            handle,
        };
        let mut appender = Appender::new(Record::data(log, lsn, payload, copyset), self.replication);
        if let Some(handle) = handle {
            let in_flight = context.in_flight.clone();
            appender = appender.with_observer(move |state| {
                if let Some(entry) = in_flight.lock().get_mut(handle) {
                    entry.state = state;
                }
            });
        }

        let mut cancel = Cancellation::new()
            .with(assignment.cancel)
            .with(self.shutdown_tx.subscribe());
        let outcome = appender
            .run(
                self.transport.as_ref(),
                &self.selector,
                &self.options.appender,
                &mut cancel,
            )
            .await;
        drop(slot);

        match outcome {
            AppendOutcome::Committed(lsn) => Ok(lsn),
            AppendOutcome::Failed(FailReason::EpochSealed) => {
                match context.sequencer.on_epoch_sealed(lsn.epoch).await {
                    Ok(true) => info!("{}: stepped down after {} was sealed", log, lsn.epoch),
                    Ok(false) => {}
                    Err(e) => warn!("{}: could not check epoch ownership: {}", log, e),
                }
                Err(ClientError::Failed(FailReason::EpochSealed))
            }
            AppendOutcome::Failed(reason) => Err(ClientError::Failed(reason)),
        }
    }

    /// Stop sequencing `log`, cancelling its outstanding appends.
    pub fn deactivate(&self, log: LogId) {
        if let Some(context) = self.context(log) {
            context.sequencer.deactivate();
        }
    }

    /// Cancel every outstanding append and recovery; later calls fail with
    /// `ShuttingDown`.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        debug!("Log driver shutting down");
        for context in self.logs.read().values() {
            context.sequencer.deactivate();
        }
    }
}
