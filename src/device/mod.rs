pub mod cache;
pub mod queue;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::electra::gateway::RemoteDeviceGateway;
use crate::electra::{
    AC_MODE, AcMode, DeviceInfo, DeviceSnapshot, FANSPD, FanSpeed, MAX_TARGET_TEMPERATURE,
    MIN_TARGET_TEMPERATURE, Oper, SPT,
};
use crate::error::{Error, Result};

use self::cache::StateCache;
use self::queue::{ChangeQueue, ChangeTicket, delta};
use self::reconcile::{ReconcileSettings, ReconciliationLoop};

pub use self::reconcile::{ExhaustionPolicy, ReconcileEvent};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub state_ttl: Duration,
    pub sync_interval: Duration,
    pub max_attempts: u32,
    pub change_timeout: Duration,
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(5),
            sync_interval: Duration::from_secs(3),
            max_attempts: 6,
            change_timeout: Duration::from_secs(30),
            on_exhausted: ExhaustionPolicy::Drop,
        }
    }
}

struct Inner {
    info: DeviceInfo,
    cache: Arc<StateCache>,
    queue: Arc<ChangeQueue>,
    events: broadcast::Sender<ReconcileEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One air conditioner. Cheap to clone; all clones share a single
/// reconciliation loop, which stops on [`DeviceHandle::shutdown`] or when the
/// last clone is dropped.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device_id", &self.inner.info.id)
            .field("name", &self.inner.info.name)
            .finish_non_exhaustive()
    }
}

impl DeviceHandle {
    /// Build the handle and spawn its reconciliation loop.
    pub fn spawn(
        gateway: Arc<dyn RemoteDeviceGateway>,
        info: DeviceInfo,
        options: DeviceOptions,
    ) -> Self {
        let cache = Arc::new(StateCache::new(gateway.clone(), info.id, options.state_ttl));
        let queue = Arc::new(ChangeQueue::new(options.change_timeout));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let worker = ReconciliationLoop {
            device_id: info.id,
            gateway,
            cache: cache.clone(),
            queue: queue.clone(),
            settings: ReconcileSettings {
                max_attempts: options.max_attempts,
                interval: options.sync_interval,
                on_exhausted: options.on_exhausted,
            },
            events: events.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            inner: Arc::new(Inner {
                info,
                cache,
                queue,
                events,
                cancel,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.inner.events.subscribe()
    }

    /// Changes queued but not yet observed upstream.
    pub fn pending_changes(&self) -> Oper {
        self.inner.queue.pending()
    }

    /// Stop the reconciliation loop and wait for it to exit. Waiting callers
    /// fail with [`Error::Stopped`].
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Reconciliation loop ended abnormally: {}", e);
            }
        }
    }

    /// Queue a raw OPER delta. The loop starts working on it right away;
    /// await the ticket to learn whether it was applied.
    pub fn enqueue(&self, delta: Oper) -> Result<ChangeTicket> {
        self.inner.queue.enqueue(delta)
    }

    pub async fn snapshot(&self) -> Result<Arc<DeviceSnapshot>> {
        self.inner.cache.get().await
    }

    pub async fn is_on(&self) -> Result<bool> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.oper.get(AC_MODE).and_then(|m| m.as_str()) != Some(AcMode::Stby.as_str()))
    }

    pub async fn get_mode(&self) -> Result<AcMode> {
        self.snapshot()
            .await?
            .mode()
            .ok_or_else(|| Error::malformed("OPER has no recognised AC_MODE"))
    }

    pub async fn set_mode(&self, mode: AcMode) -> Result<()> {
        info!("Setting mode to {}", mode);
        self.apply(AC_MODE, json!(mode.as_str())).await
    }

    /// Restore the last active mode seen on the device (COOL if none).
    pub async fn turn_on(&self) -> Result<()> {
        self.set_mode(self.inner.cache.last_on_mode()).await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.set_mode(AcMode::Stby).await
    }

    pub async fn get_target_temperature(&self) -> Result<i32> {
        self.snapshot()
            .await?
            .target_temperature()
            .ok_or_else(|| Error::malformed("OPER has no numeric SPT"))
    }

    pub async fn set_target_temperature(&self, celsius: i32) -> Result<()> {
        if !(MIN_TARGET_TEMPERATURE..=MAX_TARGET_TEMPERATURE).contains(&celsius) {
            return Err(Error::validation(format!(
                "target temperature {celsius} outside {MIN_TARGET_TEMPERATURE}..={MAX_TARGET_TEMPERATURE}"
            )));
        }
        info!("Setting target temperature to {}", celsius);
        self.apply(SPT, json!(celsius.to_string())).await
    }

    /// Room temperature from the diagnostic block. Read-only.
    pub async fn get_current_temperature(&self) -> Result<f64> {
        self.snapshot()
            .await?
            .current_temperature()
            .ok_or_else(|| Error::malformed("DIAG_L2 has no I_CALC_AT"))
    }

    pub async fn get_fan_speed(&self) -> Result<FanSpeed> {
        self.snapshot()
            .await?
            .fan_speed()
            .ok_or_else(|| Error::malformed("OPER has no recognised FANSPD"))
    }

    pub async fn set_fan_speed(&self, speed: FanSpeed) -> Result<()> {
        info!("Setting fan speed to {}", speed);
        self.apply(FANSPD, json!(speed.as_str())).await
    }

    async fn apply(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let ticket = self.enqueue(delta(key, value))?;
        debug!("Waiting for device to apply {}", ticket.keys().collect::<Vec<_>>().join(", "));
        ticket.wait().await
    }
}
