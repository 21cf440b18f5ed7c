use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::api::{MobileApi, Request, SESSION_REQUEST_ID};
use super::gateway::RemoteDeviceGateway;
use super::session::{Credentials, Session, SessionManager};
use super::{DeviceId, DeviceInfo, DeviceSnapshot, Oper};
use crate::device::{DeviceHandle, DeviceOptions};
use crate::error::{Error, Result};

/// HTTP client for the Electra cloud mobile API.
pub struct ElectraClient {
    sessions: SessionManager,
    devices: Mutex<Option<Vec<DeviceInfo>>>,
}

impl ElectraClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        Ok(Self::with_api(MobileApi::new(base_url)?, credentials))
    }

    pub fn with_api(api: MobileApi, credentials: Credentials) -> Self {
        Self {
            sessions: SessionManager::new(api, credentials),
            devices: Mutex::new(None),
        }
    }

    /// Devices on the account. Fetched once, then served from memory.
    pub async fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut cached = self.devices.lock().await;
        if let Some(devices) = cached.as_ref() {
            return Ok(devices.clone());
        }

        let envelope = self
            .sessions
            .call(Request::new(SESSION_REQUEST_ID, "GET_DEVICES"))
            .await?;
        let raw = envelope
            .data
            .and_then(|mut data| data.get_mut("devices").map(Value::take))
            .ok_or_else(|| Error::malformed("GET_DEVICES response without devices"))?;
        let devices: Vec<DeviceInfo> = serde_json::from_value(raw)
            .map_err(|e| Error::malformed(format!("device list: {e}")))?;

        debug!("Account has {} device(s)", devices.len());
        *cached = Some(devices.clone());
        Ok(devices)
    }

    /// Look up `device_id` and start its reconciliation loop.
    pub async fn select_device(
        self: &Arc<Self>,
        device_id: DeviceId,
        options: DeviceOptions,
    ) -> Result<DeviceHandle> {
        let info = self
            .devices()
            .await?
            .into_iter()
            .find(|d| d.id == device_id)
            .ok_or(Error::DeviceNotFound {
                device_id: device_id.0,
            })?;

        info!(
            "Selected device {} ({}) sn={} mac={} model={} provider={}",
            info.display_name(),
            info.id,
            info.sn.as_deref().unwrap_or("unknown"),
            info.mac.as_deref().unwrap_or("unknown"),
            info.model.as_deref().unwrap_or("unknown"),
            info.provider_name.as_deref().unwrap_or("unknown"),
        );

        let gateway: Arc<dyn RemoteDeviceGateway> = self.clone();
        Ok(DeviceHandle::spawn(gateway, info, options))
    }
}

#[async_trait]
impl RemoteDeviceGateway for ElectraClient {
    async fn fetch_telemetry(&self, device_id: DeviceId) -> Result<DeviceSnapshot> {
        let request = Request::new(SESSION_REQUEST_ID, "GET_LAST_TELEMETRY").with_data(json!({
            "commandName": "OPER,DIAG_L2",
            "id": device_id,
        }));
        let envelope = self.sessions.call(request).await?;
        parse_telemetry(envelope.data.as_ref())
    }

    async fn send_command(&self, device_id: DeviceId, oper: &Oper) -> Result<()> {
        // Only the OPER block is sent, wrapped and JSON-encoded as a string.
        let command_json = json!({ "OPER": oper }).to_string();
        let request = Request::new(SESSION_REQUEST_ID, "SEND_COMMAND").with_data(json!({
            "id": device_id,
            "commandJson": command_json,
        }));
        self.sessions.call(request).await?;
        Ok(())
    }

    async fn renew_session(&self) -> Result<Session> {
        self.sessions.renew().await
    }
}

fn parse_telemetry(data: Option<&Value>) -> Result<DeviceSnapshot> {
    let command_json = data
        .and_then(|d| d.get("commandJson"))
        .ok_or_else(|| Error::malformed("telemetry without commandJson"))?;
    let oper = decode_block(command_json, "OPER")?;
    let diag = decode_block(command_json, "DIAG_L2")?;
    Ok(DeviceSnapshot::new(oper, diag))
}

/// Each block arrives as a string holding `{"<name>": {...}}`.
fn decode_block(command_json: &Value, name: &str) -> Result<serde_json::Map<String, Value>> {
    let raw = command_json
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::malformed(format!("telemetry without {name}")))?;
    let mut wrapper: Value =
        serde_json::from_str(raw).map_err(|e| Error::malformed(format!("{name}: {e}")))?;

    match wrapper.get_mut(name).map(Value::take) {
        Some(Value::Object(block)) => Ok(block),
        _ => Err(Error::malformed(format!("{name} is not an object"))),
    }
}
