use futures::future::{pending, select_all};
use tokio::sync::watch;

/// Fires once any of its watch channels turns `true`.
///
/// A channel whose sender is dropped without firing stops counting; with no
/// live channel left `cancelled()` never resolves.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    receivers: Vec<watch::Receiver<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, receiver: watch::Receiver<bool>) -> Self {
        self.receivers.push(receiver);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.receivers.iter().any(|rx| *rx.borrow())
    }

    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            if self.receivers.is_empty() {
                pending::<()>().await;
            }
            let changes = self
                .receivers
                .iter_mut()
                .map(|rx| Box::pin(rx.changed()));
            let (result, index, _) = select_all(changes).await;
            if result.is_err() {
                self.receivers.swap_remove(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn test_fires_on_any_channel() {
        let (a_tx, a_rx) = watch::channel(false);
        let (b_tx, b_rx) = watch::channel(false);
        let mut cancel = Cancellation::new().with(a_rx).with(b_rx);
        assert!(!cancel.is_cancelled());

        drop(a_tx);
        assert!(
            timeout(Duration::from_millis(20), cancel.cancelled())
                .await
                .is_err()
        );

        b_tx.send(true).unwrap();
        timeout(Duration::from_millis(100), cancel.cancelled())
            .await
            .unwrap();
        assert!(cancel.is_cancelled());
    }
}
