use std::env;
use std::time::Duration;

use secrecy::SecretString;

use crate::device::{DeviceOptions, ExhaustionPolicy};
use crate::electra::api::DEFAULT_BASE_URL;
use crate::electra::session::Credentials;
use crate::electra::{DeviceId, DeviceInfo};

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub electra: ElectraConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct ElectraConfig {
    pub base_url: String,
    pub token: SecretString,
    pub imei: String,
    pub device_id: DeviceId,
    pub state_ttl_ms: u64,
    pub sync_interval_secs: u64,
    pub max_attempts: u32,
    pub change_timeout_secs: u64,
    pub on_exhausted: ExhaustionPolicy,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub poll_interval_secs: u64,
    /// Overrides the device name reported by the API for topic naming.
    pub device_name: Option<String>,
}

/// Reads variables from the process environment, or from a map in tests.
struct Source<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn required(&self, key: &str) -> Result<String, String> {
        self.optional(key)
            .ok_or_else(|| format!("{key} environment variable is required"))
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn or_default<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.optional(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_source(|key| env::var(key).ok())
    }

    fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let src = Source(lookup);

        let device_id = src.required("ELECTRA_DEVICE_ID")?;
        let device_id = device_id
            .trim()
            .parse()
            .map(DeviceId)
            .map_err(|e| format!("ELECTRA_DEVICE_ID must be a number: {e}"))?;
        let on_exhausted = match src.optional("ELECTRA_ON_EXHAUSTED") {
            Some(v) => v.parse()?,
            None => ExhaustionPolicy::default(),
        };
        let defaults = DeviceOptions::default();

        let config = Self {
            mqtt: MqttConfig {
                broker_host: src.required("MQTT_BROKER_HOST")?,
                broker_port: src.or_default("MQTT_BROKER_PORT", 1883),
                username: src.optional("MQTT_USERNAME"),
                password: src.optional("MQTT_PASSWORD"),
                topic_prefix: src.or_default("MQTT_TOPIC_PREFIX", "electra".to_string()),
                client_id: src.or_default("MQTT_CLIENT_ID", "electra-to-mqtt".to_string()),
            },
            electra: ElectraConfig {
                base_url: src.or_default("ELECTRA_BASE_URL", DEFAULT_BASE_URL.to_string()),
                token: SecretString::from(src.required("ELECTRA_TOKEN")?),
                imei: src.required("ELECTRA_IMEI")?,
                device_id,
                state_ttl_ms: src.or_default(
                    "ELECTRA_STATE_TTL_MS",
                    u64::try_from(defaults.state_ttl.as_millis()).unwrap_or(5000),
                ),
                sync_interval_secs: src
                    .or_default("ELECTRA_SYNC_INTERVAL_SECS", defaults.sync_interval.as_secs()),
                max_attempts: src.or_default("ELECTRA_MAX_ATTEMPTS", defaults.max_attempts),
                change_timeout_secs: src
                    .or_default("ELECTRA_CHANGE_TIMEOUT_SECS", defaults.change_timeout.as_secs()),
                on_exhausted,
            },
            bridge: BridgeConfig {
                poll_interval_secs: src.or_default("ELECTRA_POLL_INTERVAL_SECS", 30),
                device_name: src.optional("DEVICE_NAME"),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.electra.state_ttl_ms == 0 {
            return Err("ELECTRA_STATE_TTL_MS must be > 0".into());
        }
        if self.electra.max_attempts == 0 {
            return Err("ELECTRA_MAX_ATTEMPTS must be > 0".into());
        }
        if self.electra.change_timeout_secs == 0 {
            return Err("ELECTRA_CHANGE_TIMEOUT_SECS must be > 0".into());
        }
        if self.bridge.poll_interval_secs == 0 {
            return Err("ELECTRA_POLL_INTERVAL_SECS must be > 0".into());
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            token: self.electra.token.clone(),
            imei: self.electra.imei.clone(),
        }
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            state_ttl: Duration::from_millis(self.electra.state_ttl_ms),
            sync_interval: Duration::from_secs(self.electra.sync_interval_secs),
            max_attempts: self.electra.max_attempts,
            change_timeout: Duration::from_secs(self.electra.change_timeout_secs),
            on_exhausted: self.electra.on_exhausted,
        }
    }

    /// Topic segment for the device: `DEVICE_NAME` if set, else the API name.
    pub fn topic_name(&self, info: &DeviceInfo) -> String {
        let name = self
            .bridge
            .device_name
            .clone()
            .unwrap_or_else(|| info.display_name());
        let sanitized = sanitize_topic_name(&name);
        if sanitized.is_empty() {
            info.id.to_string()
        } else {
            sanitized
        }
    }

    pub fn device_status_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/bridge_status", self.mqtt.topic_prefix, topic_name)
    }

    pub fn device_command_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/command/#", self.mqtt.topic_prefix, topic_name)
    }
}

/// Convert a device name into a safe MQTT topic segment.
/// "Living Room AC" → "living_room_ac"
fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}
