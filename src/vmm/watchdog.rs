//! Wall-clock watchdog for a running guest

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A one-shot timer that runs an action unless cancelled first.
///
/// Dropping the watchdog without calling [`Watchdog::cancel`] also disarms
/// it, since the cancel sender is dropped with it.
pub struct Watchdog {
    cancel_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    /// Arm a watchdog that runs `on_expire` after `timeout`.
    pub fn arm<F, Fut>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(?timeout, "watchdog expired");
                    on_expire().await;
                }
                _ = cancel_rx => {
                    debug!("watchdog disarmed");
                }
            }
        });

        Self {
            cancel_tx: Some(cancel_tx),
            handle,
        }
    }

    /// Disarm the watchdog. Has no effect once it has fired.
    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Whether the watchdog task has completed, either way
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
