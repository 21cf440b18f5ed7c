//! Background loop that pushes queued changes until the device reflects them.
//!
//! The remote accepts a command without acknowledging it and silently drops
//! commands sent too close together. So each attempt reads fresh telemetry,
//! confirms whatever already matches, and re-sends everything still pending
//! as one merged OPER block. A key that stays unconfirmed for
//! `max_attempts` fetches is handed to the [`ExhaustionPolicy`]; keys merged
//! later keep their own budget.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::StateCache;
use super::queue::ChangeQueue;
use crate::electra::DeviceId;
use crate::electra::gateway::RemoteDeviceGateway;
use crate::error::Result;

/// What happens to a pending key once it has used all its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Drop them and fail their waiters right away.
    #[default]
    Drop,
    /// Keep them, unsent, until the next enqueue; their waiters run into their timeout.
    Retain,
}

impl FromStr for ExhaustionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "retain" => Ok(Self::Retain),
            other => Err(format!("unknown exhaustion policy '{other}' (expected drop|retain)")),
        }
    }
}

/// Observable outcome of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    Confirmed { keys: Vec<String> },
    Exhausted { keys: Vec<String>, attempts: u32 },
    AttemptFailed { attempt: u32, error: String },
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub max_attempts: u32,
    pub interval: Duration,
    pub on_exhausted: ExhaustionPolicy,
}

enum Step {
    Settled,
    Sent,
}

enum Flow {
    Idle,
    Cancelled,
}

pub(crate) struct ReconciliationLoop {
    pub device_id: DeviceId,
    pub gateway: Arc<dyn RemoteDeviceGateway>,
    pub cache: Arc<StateCache>,
    pub queue: Arc<ChangeQueue>,
    pub settings: ReconcileSettings,
    pub events: broadcast::Sender<ReconcileEvent>,
    pub cancel: CancellationToken,
}

impl ReconciliationLoop {
    /// Idle until woken, run one episode, repeat until cancelled.
    pub async fn run(self) {
        info!("Reconciliation loop started for device {}", self.device_id);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.queue.woken() => {}
            }

            if !self.queue.has_active() {
                debug!("Woke with no pending changes");
                continue;
            }

            if let Flow::Cancelled = self.episode().await {
                break;
            }
        }

        self.queue.stop();
        info!("Reconciliation loop stopped for device {}", self.device_id);
    }

    /// Attempt until no key needs pushing. Every key leaves after at most
    /// `max_attempts` fetches of its own, so the episode ends once no new
    /// changes arrive.
    async fn episode(&self) -> Flow {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Flow::Cancelled,
                outcome = self.attempt(attempt) => outcome,
            };

            match outcome {
                Ok(Step::Settled) => return Flow::Idle,
                Ok(Step::Sent) => {}
                Err(e) => {
                    warn!(attempt, "Reconciliation attempt failed: {}", e);
                    self.emit(ReconcileEvent::AttemptFailed {
                        attempt,
                        error: e.to_string(),
                    });
                    if !self.queue.has_active() {
                        return Flow::Idle;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Flow::Cancelled,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
    }

    /// Fetch, confirm, retire exhausted keys, and re-send the rest.
    async fn attempt(&self, attempt: u32) -> Result<Step> {
        let max = self.settings.max_attempts;
        let snapshot = match self.cache.force_refresh().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.exhausted(self.queue.charge_failure(max));
                return Err(e);
            }
        };
        let reconciled = self.queue.confirm(&snapshot.oper, max);

        if !reconciled.confirmed.is_empty() {
            info!("Confirmed {}", reconciled.confirmed.join(", "));
            self.emit(ReconcileEvent::Confirmed {
                keys: reconciled.confirmed,
            });
        }
        self.exhausted(reconciled.exhausted);

        if reconciled.to_send.is_empty() {
            info!(attempt, "Nothing left to send");
            return Ok(Step::Settled);
        }

        let outstanding = reconciled.to_send.len();
        let mut oper = snapshot.oper.clone();
        oper.extend(reconciled.to_send);

        info!(attempt, "Sending {} pending change(s)", outstanding);
        self.gateway.send_command(self.device_id, &oper).await?;
        Ok(Step::Sent)
    }

    /// Apply the exhaustion policy to keys that used all their attempts.
    fn exhausted(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        let attempts = self.settings.max_attempts;
        match self.settings.on_exhausted {
            ExhaustionPolicy::Drop => self.queue.abandon(&keys, attempts),
            ExhaustionPolicy::Retain => self.queue.park(&keys),
        }

        warn!(
            "Device {} did not apply {} after {} attempts ({:?})",
            self.device_id,
            keys.join(", "),
            attempts,
            self.settings.on_exhausted,
        );
        self.emit(ReconcileEvent::Exhausted { keys, attempts });
    }

    fn emit(&self, event: ReconcileEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
