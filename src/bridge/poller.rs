use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::StateUpdate;
use crate::device::{DeviceHandle, ReconcileEvent};

/// Publishes device state on a fixed interval and after every confirmed
/// change, and forwards exhausted reconciliation episodes as events.
pub struct StatePoller {
    ac: DeviceHandle,
    topic_name: String,
}

impl StatePoller {
    pub fn new(ac: DeviceHandle, topic_name: String) -> Self {
        Self { ac, topic_name }
    }

    pub async fn run(&self, tx: mpsc::Sender<StateUpdate>, poll_interval: Duration) {
        let mut events = self.ac.subscribe();
        let mut poll_timer = tokio::time::interval(poll_interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {}
                event = events.recv() => match event {
                    Ok(ReconcileEvent::Confirmed { keys }) => {
                        debug!("Publishing state after confirmation of {}", keys.join(", "));
                    }
                    Ok(ReconcileEvent::Exhausted { keys, attempts }) => {
                        warn!("Device not responding: {} unconfirmed after {} attempts", keys.join(", "), attempts);
                        let payload = json!({ "keys": keys, "attempts": attempts }).to_string();
                        let update = StateUpdate::event(&self.topic_name, "reconcile_exhausted", payload);
                        if tx.send(update).await.is_err() {
                            warn!("State update channel closed");
                            return;
                        }
                    }
                    Ok(ReconcileEvent::AttemptFailed { attempt, error }) => {
                        debug!("Reconcile attempt {} failed: {}", attempt, error);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Missed {} reconcile events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Device handle closed, stopping state poller");
                        return;
                    }
                },
            }

            for update in self.collect().await {
                if tx.send(update).await.is_err() {
                    warn!("State update channel closed");
                    return;
                }
            }
        }
    }

    /// Read every published field. A field that cannot be read is skipped.
    async fn collect(&self) -> Vec<StateUpdate> {
        let ac = &self.ac;
        let fields = [
            ("power", ac.is_on().await.map(|on| if on { "ON" } else { "OFF" }.to_string())),
            ("mode", ac.get_mode().await.map(|m| m.to_string())),
            ("target_temperature", ac.get_target_temperature().await.map(|t| t.to_string())),
            ("current_temperature", ac.get_current_temperature().await.map(|t| t.to_string())),
            ("fan_speed", ac.get_fan_speed().await.map(|f| f.to_string())),
        ];

        fields
            .into_iter()
            .filter_map(|(field, value)| match value {
                Ok(value) => Some(StateUpdate::state(&self.topic_name, field, value)),
                Err(e) if e.is_gateway() => {
                    warn!("Could not read {}: {}", field, e);
                    None
                }
                Err(e) => {
                    debug!("Device does not report {}: {}", field, e);
                    None
                }
            })
            .collect()
    }
}
