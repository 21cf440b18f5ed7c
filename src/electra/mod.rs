pub mod api;
pub mod client;
pub mod gateway;
pub mod session;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Error;

/// OPER attribute keys the engine reads and writes.
pub const AC_MODE: &str = "AC_MODE";
pub const SPT: &str = "SPT";
pub const FANSPD: &str = "FANSPD";

/// DIAG_L2 key holding the computed room temperature.
pub const I_CALC_AT: &str = "I_CALC_AT";

pub const MIN_TARGET_TEMPERATURE: i32 = 16;
pub const MAX_TARGET_TEMPERATURE: i32 = 30;

/// Mutable operational block, key → string or number.
pub type Oper = serde_json::Map<String, Value>;

/// Read-only diagnostic block (sensor readings).
pub type Diag = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device metadata as listed by `GET_DEVICES`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: DeviceId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sn: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default, rename = "fmVersion")]
    pub firmware_version: Option<String>,
}

impl DeviceInfo {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// One telemetry read. Never patched in place; the next fetch replaces it.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub oper: Oper,
    pub diag: Diag,
    pub fetched_at: Instant,
}

impl DeviceSnapshot {
    pub fn new(oper: Oper, diag: Diag) -> Self {
        Self {
            oper,
            diag,
            fetched_at: Instant::now(),
        }
    }

    pub fn mode(&self) -> Option<AcMode> {
        self.oper.get(AC_MODE)?.as_str()?.parse().ok()
    }

    pub fn target_temperature(&self) -> Option<i32> {
        match self.oper.get(SPT)? {
            Value::String(s) => s.trim().parse().ok(),
            Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
            _ => None,
        }
    }

    pub fn fan_speed(&self) -> Option<FanSpeed> {
        self.oper.get(FANSPD)?.as_str()?.parse().ok()
    }

    pub fn current_temperature(&self) -> Option<f64> {
        match self.diag.get(I_CALC_AT)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Operating modes accepted by `AC_MODE`. `Stby` is the idle sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcMode {
    Cool,
    Heat,
    Stby,
    Dry,
    Fan,
    Auto,
}

impl AcMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cool => "COOL",
            Self::Heat => "HEAT",
            Self::Stby => "STBY",
            Self::Dry => "DRY",
            Self::Fan => "FAN",
            Self::Auto => "AUTO",
        }
    }

    /// Modes remembered as the target for a bare "turn on".
    pub fn is_remembered_on_mode(self) -> bool {
        matches!(self, Self::Cool | Self::Heat | Self::Fan | Self::Dry)
    }
}

impl fmt::Display for AcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Cool,
            Self::Heat,
            Self::Stby,
            Self::Dry,
            Self::Fan,
            Self::Auto,
        ]
        .into_iter()
        .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
        .ok_or_else(|| Error::validation(format!("unsupported AC mode '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FanSpeed {
    Auto,
    Low,
    Med,
    High,
}

impl FanSpeed {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Low => "LOW",
            Self::Med => "MED",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for FanSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanSpeed {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Auto, Self::Low, Self::Med, Self::High]
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::validation(format!("unsupported fan speed '{s}'")))
    }
}
