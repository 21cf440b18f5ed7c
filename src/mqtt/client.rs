use std::collections::HashMap;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bridge::StateUpdate;
use crate::config::Config;

pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    topic_prefix: String,
    status_topic: String,
    command_topic: String,
}

impl MqttClient {
    pub fn new(config: &Config, topic_name: &str) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        // LWT: the broker marks the bridge offline if we drop off.
        let status_topic = config.device_status_topic(topic_name);
        let lwt = rumqttc::LastWill::new(
            status_topic.clone(),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            topic_prefix: config.mqtt.topic_prefix.clone(),
            status_topic,
            command_topic: config.device_command_topic(topic_name),
        }
    }

    /// Run the MQTT event loop. Subscribes to the command topic on every
    /// connect, forwards incoming publishes through `command_tx`, and
    /// publishes updates received from `update_rx`.
    pub async fn run(
        mut self,
        command_tx: mpsc::Sender<MqttMessage>,
        mut update_rx: mpsc::Receiver<StateUpdate>,
    ) {
        let mut last_values: HashMap<String, String> = HashMap::new();

        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            // Broker may have lost retained state while we were away.
                            last_values.clear();

                            if let Err(e) = self
                                .client
                                .publish(&self.status_topic, QoS::AtLeastOnce, true, "online")
                                .await
                            {
                                error!("Failed to publish online status: {}", e);
                            }
                            if let Err(e) = self
                                .client
                                .subscribe(&self.command_topic, QoS::AtLeastOnce)
                                .await
                            {
                                error!("Failed to subscribe to {}: {}", self.command_topic, e);
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let payload = String::from_utf8_lossy(&publish.payload).to_string();
                            let msg = MqttMessage {
                                topic: publish.topic.clone(),
                                payload,
                            };
                            if command_tx.send(msg).await.is_err() {
                                warn!("Command channel closed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(update) = update_rx.recv() => {
                    let topic = format!("{}/{}/{}", self.topic_prefix, update.topic_name, update.path);
                    if update.retain && last_values.get(&topic) == Some(&update.value) {
                        continue;
                    }
                    debug!("Publishing {}: {}", topic, update.value);
                    if let Err(e) = self
                        .client
                        .publish(&topic, QoS::AtMostOnce, update.retain, update.value.as_bytes())
                        .await
                    {
                        warn!("Failed to publish {}: {}", topic, e);
                        continue;
                    }
                    if update.retain {
                        last_values.insert(topic, update.value);
                    }
                }
            }
        }
    }
}
