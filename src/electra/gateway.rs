use async_trait::async_trait;

use super::session::Session;
use super::{DeviceId, DeviceSnapshot, Oper};
use crate::error::Result;

/// What the device engine needs from the remote API.
///
/// Implementations own session handling: a rejected call is retried once
/// with a renewed session before an error is returned.
#[async_trait]
pub trait RemoteDeviceGateway: Send + Sync {
    /// Read the latest OPER and DIAG_L2 blocks.
    async fn fetch_telemetry(&self, device_id: DeviceId) -> Result<DeviceSnapshot>;

    /// Push a full OPER block as a single command.
    async fn send_command(&self, device_id: DeviceId, oper: &Oper) -> Result<()>;

    async fn renew_session(&self) -> Result<Session>;
}
