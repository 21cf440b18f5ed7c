//! In-memory gateway for engine tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::electra::gateway::RemoteDeviceGateway;
use crate::electra::session::Session;
use crate::electra::{Diag, DeviceId, DeviceSnapshot, Oper};
use crate::error::{Error, Result};

struct FakeState {
    oper: Oper,
    diag: Diag,
    applies_commands: bool,
    latency: Duration,
    fail_fetches: usize,
    fetches: usize,
    sent: Vec<Oper>,
}

/// Simulated device: commands overwrite OPER (when enabled), fetches return
/// it as-is, and every call is counted.
pub(crate) struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new(oper: Value) -> Arc<Self> {
        let Value::Object(oper) = oper else {
            panic!("oper must be a JSON object");
        };
        let Value::Object(diag) = json!({"I_CALC_AT": 24}) else {
            unreachable!();
        };
        Arc::new(Self {
            state: Mutex::new(FakeState {
                oper,
                diag,
                applies_commands: true,
                latency: Duration::ZERO,
                fail_fetches: 0,
                fetches: 0,
                sent: Vec::new(),
            }),
        })
    }

    /// Whether sent commands take effect (false behaves like a device that
    /// is offline).
    pub fn set_applies_commands(&self, applies: bool) {
        self.state.lock().unwrap().applies_commands = applies;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.state.lock().unwrap().fail_fetches = count;
    }

    /// Change the device out of band, as the remote control would.
    pub fn set(&self, key: &str, value: Value) {
        self.state.lock().unwrap().oper.insert(key.to_string(), value);
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub fn sent(&self) -> Vec<Oper> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl RemoteDeviceGateway for FakeGateway {
    async fn fetch_telemetry(&self, _device_id: DeviceId) -> Result<DeviceSnapshot> {
        let latency = self.state.lock().unwrap().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(Error::Gateway {
                cmd: "GET_LAST_TELEMETRY",
                status: 1,
            });
        }
        Ok(DeviceSnapshot::new(state.oper.clone(), state.diag.clone()))
    }

    async fn send_command(&self, _device_id: DeviceId, oper: &Oper) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(oper.clone());
        if state.applies_commands {
            state.oper = oper.clone();
        }
        Ok(())
    }

    async fn renew_session(&self) -> Result<Session> {
        Err(Error::Session {
            message: "fake gateway has no session".into(),
        })
    }
}
