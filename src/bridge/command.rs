use tracing::{info, warn};

use crate::device::DeviceHandle;
use crate::electra::{AcMode, FanSpeed};
use crate::error::{Error, Result};

/// A command received on `{prefix}/{device}/command/{field}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcCommand {
    Mode(AcMode),
    Power(bool),
    TargetTemperature(i32),
    FanSpeed(FanSpeed),
}

/// Parse a command payload for `field`. Nothing here touches the network.
pub fn build_command(field: &str, raw_value: &str) -> Result<AcCommand> {
    let value = raw_value.trim();
    match field {
        "mode" => Ok(AcCommand::Mode(value.parse()?)),
        "power" => match value.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Ok(AcCommand::Power(true)),
            "off" | "false" | "0" => Ok(AcCommand::Power(false)),
            _ => Err(Error::validation(format!("invalid power value '{value}'"))),
        },
        "target_temperature" => {
            let celsius = value
                .parse::<i32>()
                .ok()
                .or_else(|| {
                    value
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0 && f.is_finite())
                        .map(|f| f as i32)
                })
                .ok_or_else(|| Error::validation(format!("invalid temperature '{value}'")))?;
            Ok(AcCommand::TargetTemperature(celsius))
        }
        "fan_speed" => Ok(AcCommand::FanSpeed(value.parse()?)),
        other => Err(Error::validation(format!("unknown command field '{other}'"))),
    }
}

/// Apply `command` and wait for the device to confirm it. The outcome is
/// only logged; state topics carry what the device actually did.
pub async fn execute(ac: &DeviceHandle, command: AcCommand) {
    let result = match command {
        AcCommand::Mode(mode) => ac.set_mode(mode).await,
        AcCommand::Power(true) => ac.turn_on().await,
        AcCommand::Power(false) => ac.turn_off().await,
        AcCommand::TargetTemperature(celsius) => ac.set_target_temperature(celsius).await,
        AcCommand::FanSpeed(speed) => ac.set_fan_speed(speed).await,
    };

    match result {
        Ok(()) => info!("Command {:?} confirmed by device", command),
        Err(e) => warn!("Command {:?} failed: {}", command, e),
    }
}
