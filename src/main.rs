mod bridge;
mod config;
mod device;
mod electra;
mod error;
mod mqtt;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bridge::command;
use crate::bridge::poller::StatePoller;
use crate::electra::client::ElectraClient;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting electra-to-mqtt bridge (mqtt={}:{}, device={})",
        config.mqtt.broker_host, config.mqtt.broker_port, config.electra.device_id,
    );

    let client = match ElectraClient::new(&config.electra.base_url, config.credentials()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to create Electra client: {}", e);
            std::process::exit(1);
        }
    };

    let ac = match client
        .select_device(config.electra.device_id, config.device_options())
        .await
    {
        Ok(ac) => ac,
        Err(e) => {
            error!("Failed to select device {}: {}", config.electra.device_id, e);
            std::process::exit(1);
        }
    };

    let topic_name = config.topic_name(ac.info());
    info!(
        "  Device: {} ({}) fw={} -> {}/{}",
        ac.info().display_name(),
        ac.info().id,
        ac.info().firmware_version.as_deref().unwrap_or("unknown"),
        config.mqtt.topic_prefix,
        topic_name,
    );

    // Channels
    let (mqtt_cmd_tx, mut mqtt_cmd_rx) = mpsc::channel::<mqtt::client::MqttMessage>(100);
    let (update_tx, update_rx) = mpsc::channel::<bridge::StateUpdate>(200);

    // MQTT event loop (handles both MQTT I/O and state publishing)
    let mqtt_client = mqtt::client::MqttClient::new(&config, &topic_name);
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(mqtt_cmd_tx, update_rx).await;
    });

    let poller = StatePoller::new(ac.clone(), topic_name.clone());
    let poll_interval = Duration::from_secs(config.bridge.poll_interval_secs);
    let poller_handle = tokio::spawn(async move {
        poller.run(update_tx, poll_interval).await;
    });

    let topic_prefix = config.mqtt.topic_prefix.clone();

    // Main loop: dispatch MQTT commands to the device + handle shutdown
    loop {
        tokio::select! {
            Some(msg) = mqtt_cmd_rx.recv() => {
                // Parse topic: {prefix}/{topic_name}/command/{field}
                match parse_command_topic(&msg.topic, &topic_prefix) {
                    Some((name, field)) if name == topic_name => {
                        match command::build_command(field, &msg.payload) {
                            Ok(cmd) => {
                                // Awaiting confirmation can take several poll rounds.
                                let ac = ac.clone();
                                tokio::spawn(async move {
                                    command::execute(&ac, cmd).await;
                                });
                            }
                            Err(e) => warn!("Rejected command {}={}: {}", field, msg.payload, e),
                        }
                    }
                    Some((name, _)) => warn!("Unknown device in command topic: {}", name),
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = async {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            } => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    let unconfirmed = ac.pending_changes();
    if !unconfirmed.is_empty() {
        warn!("Discarding {} unconfirmed change(s): {:?}", unconfirmed.len(), unconfirmed);
    }
    ac.shutdown().await;
    poller_handle.abort();
    mqtt_handle.abort();
    info!("electra-to-mqtt bridge stopped");
}

/// Parse a command topic into (topic_name, field).
/// Expected format: {prefix}/{topic_name}/command/{field}
fn parse_command_topic<'a>(topic: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    // rest = "{topic_name}/command/{field}"
    let (topic_name, rest) = rest.split_once('/')?;
    let field = rest.strip_prefix("command/")?;
    if topic_name.is_empty() || field.is_empty() {
        return None;
    }
    Some((topic_name, field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_topics() {
        assert_eq!(
            parse_command_topic("electra/bedroom/command/mode", "electra"),
            Some(("bedroom", "mode"))
        );
        assert_eq!(parse_command_topic("electra/bedroom/state/mode", "electra"), None);
        assert_eq!(parse_command_topic("other/bedroom/command/mode", "electra"), None);
        assert_eq!(parse_command_topic("electra//command/mode", "electra"), None);
        assert_eq!(parse_command_topic("electra/bedroom/command/", "electra"), None);
    }
}
