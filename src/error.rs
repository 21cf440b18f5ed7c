use thiserror::Error;

/// Every failure the Electra gateway and the device engine can surface.
#[derive(Debug, Error)]
pub enum Error {
    /// Token exchange did not yield a usable session id.
    #[error("Session renewal failed: {message}")]
    Session { message: String },

    /// The remote answered with a non-zero status, even after one retry
    /// with a renewed session.
    #[error("Remote rejected {cmd} (status {status})")]
    Gateway { cmd: &'static str, status: i64 },

    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response envelope was valid but its payload was not.
    #[error("Malformed response: {message}")]
    Deserialization { message: String },

    #[error("Device {device_id} not found on this account")]
    DeviceNotFound { device_id: u64 },

    /// Caller supplied an out-of-domain value. Raised before any I/O.
    #[error("Invalid value: {message}")]
    Validation { message: String },

    /// A queued key was not observed upstream within its wait bound.
    #[error("Change to {key} not confirmed within {after_secs}s")]
    Timeout { key: String, after_secs: u64 },

    /// The reconciliation loop gave up on this key.
    #[error("Device did not apply {key} after {attempts} attempts")]
    ReconciliationExhausted { key: String, attempts: u32 },

    /// The device handle has been shut down.
    #[error("Device handle stopped")]
    Stopped,
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    /// Transport or remote-status failure talking to the API.
    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            Self::Gateway { .. } | Self::Transport(_) | Self::Deserialization { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_class_covers_transport_and_payload_failures() {
        assert!(Error::Gateway { cmd: "GET_DEVICES", status: 3 }.is_gateway());
        assert!(Error::malformed("no OPER").is_gateway());
        assert!(!Error::validation("bad mode").is_gateway());
        assert!(!Error::Stopped.is_gateway());
    }

    #[test]
    fn timeout_message_names_the_key() {
        let err = Error::Timeout {
            key: "SPT".into(),
            after_secs: 30,
        };
        assert_eq!(err.to_string(), "Change to SPT not confirmed within 30s");
    }
}
