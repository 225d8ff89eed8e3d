//! Per-log sequencer: owns one epoch at a time and hands out its LSNs.
//!
//! ```text
//! INACTIVE --activate--> RECOVERING(e) --recovered--> ACTIVE(e)
//!     ^                      |    ^                      |
//!     |                  failed  retry               begin_seal
//!     +-- superseded / deactivated --------------        v
//!                                                   SEALING(e) --activate--> RECOVERING(e')
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::error::{EpochStoreError, SequencerError, TransitionError};
use crate::recovery::EpochRecovery;
use crate::traits::{EpochAuthority, SequencerResult};
use crate::types::{Epoch, Esn, LogId, Lsn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Inactive,
    Recovering { epoch: Epoch },
    Active { epoch: Epoch, next_esn: Esn },
    /// No new LSNs; outstanding appenders may still finish.
    Sealing { epoch: Epoch },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerEvent {
    Activate { epoch: Epoch },
    RecoveryComplete { epoch: Epoch },
    RecoveryFailed { epoch: Epoch },
    BeginSeal,
    /// The epoch authority holds a newer epoch.
    Superseded { epoch: Epoch },
    Deactivated,
}

impl SequencerState {
    pub fn epoch(&self) -> Option<Epoch> {
        match *self {
            SequencerState::Inactive => None,
            SequencerState::Recovering { epoch }
            | SequencerState::Active { epoch, .. }
            | SequencerState::Sealing { epoch } => Some(epoch),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SequencerState::Active { .. })
    }

    fn name(&self) -> String {
        match self {
            SequencerState::Inactive => "INACTIVE".to_string(),
            SequencerState::Recovering { epoch } => format!("RECOVERING({})", epoch),
            SequencerState::Active { epoch, next_esn } => {
                format!("ACTIVE({}, next {})", epoch, next_esn)
            }
            SequencerState::Sealing { epoch } => format!("SEALING({})", epoch),
        }
    }

    /// Pure transition function. Anything not listed is an error.
    pub fn on_event(self, event: SequencerEvent) -> Result<SequencerState, TransitionError> {
        use SequencerEvent as E;
        use SequencerState as S;

        let next = match (self, event) {
            (S::Inactive, E::Activate { epoch }) => Some(S::Recovering { epoch }),
            // 恢复失败后重新激活，继续同一个 epoch
            (S::Recovering { epoch: current }, E::Activate { epoch }) if epoch >= current => {
                Some(S::Recovering { epoch })
            }
            (S::Sealing { epoch: current }, E::Activate { epoch })
            | (S::Active { epoch: current, .. }, E::Activate { epoch })
                if epoch > current =>
            {
                Some(S::Recovering { epoch })
            }
            (S::Recovering { epoch: current }, E::RecoveryComplete { epoch }) if epoch == current => {
                Some(S::Active {
                    epoch,
                    next_esn: Esn::MIN,
                })
            }
            (S::Recovering { epoch: current }, E::RecoveryFailed { epoch }) if epoch == current => {
                Some(self)
            }
            (S::Active { epoch, .. }, E::BeginSeal) => Some(S::Sealing { epoch }),
            (S::Sealing { .. }, E::BeginSeal) => Some(self),
            (state, E::Superseded { epoch }) => match state.epoch() {
                Some(current) if epoch > current => Some(S::Inactive),
                None => Some(S::Inactive),
                Some(_) => None,
            },
            (_, E::Deactivated) => Some(S::Inactive),
            _ => None,
        };

        next.ok_or_else(|| TransitionError {
            from: self.name(),
            event: format!("{:?}", event),
        })
    }
}

struct SequencerInner {
    state: SequencerState,
    /// Fired when the current epoch's appenders must stop
    cancel: Option<watch::Sender<bool>>,
}

/// One LSN handed out by an active sequencer.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub lsn: Lsn,
    /// Turns `true` when the epoch is superseded or the sequencer deactivated
    pub cancel: watch::Receiver<bool>,
}

pub struct Sequencer {
    log: LogId,
    authority: Arc<dyn EpochAuthority>,
    recovery: Arc<EpochRecovery>,
    shutdown: watch::Receiver<bool>,
    inner: Mutex<SequencerInner>,
    /// Serializes activation; never held while handing out LSNs
    activation: tokio::sync::Mutex<()>,
}

impl Sequencer {
    pub fn new(
        log: LogId,
        authority: Arc<dyn EpochAuthority>,
        recovery: Arc<EpochRecovery>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            log,
            authority,
            recovery,
            shutdown,
            inner: Mutex::new(SequencerInner {
                state: SequencerState::Inactive,
                cancel: None,
            }),
            activation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn log(&self) -> LogId {
        self.log
    }

    pub fn state(&self) -> SequencerState {
        self.inner.lock().state
    }

    fn apply(&self, event: SequencerEvent) -> SequencerResult<SequencerState> {
        let mut inner = self.inner.lock();
        let next = inner.state.on_event(event)?;
        if next != inner.state {
            debug!(
                "{}: sequencer {} -> {} on {:?}",
                self.log,
                inner.state.name(),
                next.name(),
                event
            );
        }
        if !next.is_active() && !matches!(next, SequencerState::Sealing { .. }) {
            if let Some(cancel) = inner.cancel.take() {
                cancel.send_replace(true);
            }
        }
        if let SequencerState::Active { .. } = next {
            if !inner.state.is_active() {
                inner.cancel = Some(watch::channel(false).0);
            }
        }
        inner.state = next;
        Ok(next)
    }

    /// Take ownership of the log under a new epoch, recovering every epoch
    /// since the last clean one first. Calling it while recovering resumes
    /// the same epoch; while active it returns the current epoch.
    pub async fn activate(&self) -> SequencerResult<Epoch> {
        let _guard = self.activation.lock().await;

        let epoch = match self.state() {
            SequencerState::Active { epoch, .. } => return Ok(epoch),
            SequencerState::Recovering { epoch } => {
                info!("{}: resuming recovery before {}", self.log, epoch);
                epoch
            }
            SequencerState::Inactive | SequencerState::Sealing { .. } => {
                let last = self.authority.get_last_epoch(self.log).await?;
                let epoch = last.next();
                self.authority
                    .try_advance_epoch(self.log, epoch)
                    .await
                    .map_err(|e| match e {
                        EpochStoreError::Conflict { .. } => SequencerError::Conflict {
                            log: self.log,
                            source: e,
                        },
                        other => SequencerError::EpochStore(other),
                    })?;
                self.apply(SequencerEvent::Activate { epoch })?;
                info!("{}: claimed {}", self.log, epoch);
                epoch
            }
        };

        if let Err(e) = self.recover_before(epoch).await {
            warn!("{}: recovery before {} failed: {}", self.log, epoch, e);
            self.apply(SequencerEvent::RecoveryFailed { epoch })?;
            return Err(e);
        }

        // 恢复期间可能已被新的 sequencer 取代
        let latest = self.authority.get_last_epoch(self.log).await?;
        if latest > epoch {
            self.apply(SequencerEvent::Superseded { epoch: latest })?;
            return Err(SequencerError::Conflict {
                log: self.log,
                source: EpochStoreError::Conflict {
                    log: self.log,
                    current: latest,
                    requested: epoch,
                },
            });
        }

        self.apply(SequencerEvent::RecoveryComplete { epoch })?;
        info!("{}: sequencer active in {}", self.log, epoch);
        Ok(epoch)
    }

    /// Recover every epoch in (last clean epoch, `epoch`) and record each.
    async fn recover_before(&self, epoch: Epoch) -> SequencerResult<()> {
        let clean = self.authority.get_last_clean_epoch(self.log).await?;
        let mut cancel = Cancellation::new().with(self.shutdown.clone());
        for e in (clean.0 + 1)..epoch.0 {
            let recovered = self
                .recovery
                .recover_as(self.log, Epoch(e), epoch, &mut cancel)
                .await?;
            self.authority
                .set_last_clean_epoch(self.log, Epoch(e), recovered.tail)
                .await?;
        }
        Ok(())
    }

    /// Assign the next LSN. Fails with `NotActive` unless active.
    pub fn assign(&self) -> SequencerResult<Assignment> {
        let mut inner = self.inner.lock();
        let SequencerState::Active { epoch, next_esn } = inner.state else {
            return Err(SequencerError::NotActive {
                log: self.log,
                state: inner.state.name(),
            });
        };
        let Some(cancel) = inner.cancel.as_ref().map(|tx| tx.subscribe()) else {
            return Err(SequencerError::NotActive {
                log: self.log,
                state: inner.state.name(),
            });
        };
        if next_esn == Esn::MAX {
            // epoch 用尽，停止分配，等待下一次激活
            warn!("{}: {} exhausted", self.log, epoch);
            inner.state = SequencerState::Sealing { epoch };
            return Err(SequencerError::NotActive {
                log: self.log,
                state: inner.state.name(),
            });
        }
        inner.state = SequencerState::Active {
            epoch,
            next_esn: next_esn.next(),
        };
        Ok(Assignment {
            lsn: Lsn {
                epoch,
                esn: next_esn,
            },
            cancel,
        })
    }

    pub fn next_lsn(&self) -> SequencerResult<Lsn> {
        self.assign().map(|a| a.lsn)
    }

    /// Called when a storage node rejected a store because `epoch` is sealed.
    /// Returns `true` if this sequencer stepped down.
    pub async fn on_epoch_sealed(&self, epoch: Epoch) -> SequencerResult<bool> {
        let latest = self.authority.get_last_epoch(self.log).await?;
        let current = self.state().epoch();
        if current != Some(epoch) || latest <= epoch {
            return Ok(false);
        }
        info!(
            "{}: {} superseded by {}, stepping down",
            self.log, epoch, latest
        );
        self.apply(SequencerEvent::Superseded { epoch: latest })?;
        Ok(true)
    }

    /// Stop handing out LSNs; in-flight appends may still complete.
    pub fn begin_seal(&self) -> SequencerResult<()> {
        self.apply(SequencerEvent::BeginSeal).map(|_| ())
    }

    /// Give the log up, cancelling outstanding appenders.
    pub fn deactivate(&self) {
        if let Ok(state) = self.apply(SequencerEvent::Deactivated) {
            debug!("{}: deactivated ({})", self.log, state.name());
        }
    }
}
