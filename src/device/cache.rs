use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::electra::gateway::RemoteDeviceGateway;
use crate::electra::{AcMode, DeviceId, DeviceSnapshot};
use crate::error::Result;

/// Short-lived copy of the last telemetry read.
///
/// The slot lock is held for the duration of an upstream fetch, so readers
/// that find the snapshot stale at the same time queue behind the first one
/// and get its result instead of issuing their own request. A failed fetch
/// leaves the slot untouched, and the next waiter tries again.
pub struct StateCache {
    gateway: Arc<dyn RemoteDeviceGateway>,
    device_id: DeviceId,
    ttl: Duration,
    slot: Mutex<Option<Arc<DeviceSnapshot>>>,
    last_on_mode: StdMutex<Option<AcMode>>,
}

impl StateCache {
    pub fn new(gateway: Arc<dyn RemoteDeviceGateway>, device_id: DeviceId, ttl: Duration) -> Self {
        Self {
            gateway,
            device_id,
            ttl,
            slot: Mutex::new(None),
            last_on_mode: StdMutex::new(None),
        }
    }

    /// Cached snapshot while it is younger than the TTL, otherwise a fresh one.
    pub async fn get(&self) -> Result<Arc<DeviceSnapshot>> {
        let mut slot = self.slot.lock().await;
        if let Some(snapshot) = slot.as_ref() {
            if Instant::now() < snapshot.fetched_at + self.ttl {
                return Ok(Arc::clone(snapshot));
            }
            debug!("Cached state for device {} expired", self.device_id);
        }
        self.fetch_into(&mut slot).await
    }

    /// Always fetch, ignoring the TTL.
    pub async fn force_refresh(&self) -> Result<Arc<DeviceSnapshot>> {
        let mut slot = self.slot.lock().await;
        self.fetch_into(&mut slot).await
    }

    /// Last non-idle mode seen in any snapshot, COOL if none was seen yet.
    pub fn last_on_mode(&self) -> AcMode {
        self.last_on_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(AcMode::Cool)
    }

    async fn fetch_into(&self, slot: &mut Option<Arc<DeviceSnapshot>>) -> Result<Arc<DeviceSnapshot>> {
        let snapshot = Arc::new(self.gateway.fetch_telemetry(self.device_id).await?);
        debug!("Fetched state for device {}: {:?}", self.device_id, snapshot.oper);

        if let Some(mode) = snapshot.mode().filter(|m| m.is_remembered_on_mode()) {
            *self
                .last_on_mode
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(mode);
        }

        *slot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
