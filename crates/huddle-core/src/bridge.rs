//! Bus bridge: feeds every line received on the global bus into a cluster
//! node's coordinator queue, which re-delivers it to the attached sessions.

use crate::cluster::ClusterHandle;
use crate::presence::{Bus, StoreError, Subscription};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Consecutive read failures tolerated before the bridge gives up.
    pub max_retries: u32,
    /// Backoff unit; the n-th consecutive retry waits `n * backoff`.
    pub backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The bus kept failing.
    #[error("bus read failed {attempts} times in a row: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// The task that reads the bus subscription.
pub struct Bridge {
    bus: Arc<dyn Bus>,
    handle: ClusterHandle,
    config: BridgeConfig,
}

impl Bridge {
    /// Create a bridge delivering into `handle`.
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>, handle: ClusterHandle, config: BridgeConfig) -> Self {
        Self {
            bus,
            handle,
            config,
        }
    }

    /// Forward lines until the token is cancelled, the bus is closed, or the
    /// coordinator stops.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Exhausted`] once reads fail more than
    /// `max_retries` times in a row.
    pub async fn run(
        self,
        mut subscription: Box<dyn Subscription>,
        token: CancellationToken,
    ) -> Result<(), BridgeError> {
        let mut failures = 0u32;

        loop {
            let received = tokio::select! {
                biased;
                () = token.cancelled() => {
                    debug!("Bridge cancelled");
                    return Ok(());
                }
                received = subscription.recv() => received,
            };

            match received {
                Ok(Some(line)) => {
                    failures = 0;
                    if self.handle.deliver(line).await.is_err() {
                        debug!("Coordinator stopped, bridge exiting");
                        return Ok(());
                    }
                }
                Ok(None) => {
                    info!("Bus closed, bridge exiting");
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, error = %e, "Bus read failed");
                    match self.resubscribe(&token, &mut failures, e).await? {
                        Some(fresh) => subscription = fresh,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Back off and subscribe again. `None` means the token was cancelled.
    async fn resubscribe(
        &self,
        token: &CancellationToken,
        failures: &mut u32,
        mut last_error: StoreError,
    ) -> Result<Option<Box<dyn Subscription>>, BridgeError> {
        loop {
            if *failures > self.config.max_retries {
                error!(attempts = *failures, error = %last_error, "Giving up on bus");
                return Err(BridgeError::Exhausted {
                    attempts: *failures,
                    source: last_error,
                });
            }

            tokio::select! {
                () = token.cancelled() => return Ok(None),
                () = tokio::time::sleep(self.config.backoff * *failures) => {}
            }

            match self.bus.subscribe().await {
                Ok(subscription) => {
                    info!(attempt = *failures, "Resubscribed to bus");
                    return Ok(Some(subscription));
                }
                Err(e) => {
                    *failures += 1;
                    warn!(attempt = *failures, error = %e, "Bus resubscribe failed");
                    last_error = e;
                }
            }
        }
    }
}
