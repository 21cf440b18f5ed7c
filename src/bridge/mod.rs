pub mod command;
pub mod poller;

/// A message for the broker, relative to the device's topic root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub topic_name: String,
    /// e.g. `state/mode` or `event/reconcile_exhausted`
    pub path: String,
    pub value: String,
    pub retain: bool,
}

impl StateUpdate {
    pub fn state(topic_name: &str, field: &str, value: String) -> Self {
        Self {
            topic_name: topic_name.to_string(),
            path: format!("state/{field}"),
            value,
            retain: true,
        }
    }

    pub fn event(topic_name: &str, name: &str, value: String) -> Self {
        Self {
            topic_name: topic_name.to_string(),
            path: format!("event/{name}"),
            value,
            retain: false,
        }
    }
}
