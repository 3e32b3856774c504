use std::time::Duration;

use rumqttc::{AsyncClient, Incoming, MqttOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, Instrument};

use super::SinkError;
use crate::{config::ConfigMqtt, detection::AlertEvent};

/// Publishes alerts to an MQTT broker.
pub struct MqttSink {
    client: AsyncClient,
    topics: MqttTopics,
    qos: MqttQoS,
}

impl MqttSink {
    /// Starts the connection in the background. Alerts published before the broker answers are
    /// queued by the client.
    pub fn connect(config: &ConfigMqtt) -> MqttSink {
        let topics = MqttTopics::new(config.base_topic.clone());

        let mut mqttoptions =
            MqttOptions::new("pi-detector", config.address.clone(), config.port);
        mqttoptions
            .set_keep_alive(Duration::from_secs(5))
            .set_pending_throttle(Duration::from_millis(10));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }
        mqttoptions.set_last_will(MqttMessage::availability(&topics, false).into());

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Launch the event loop as a task
        let online_client = client.clone();
        let online = MqttMessage::availability(&topics, true);
        tokio::task::spawn(
            async move {
                loop {
                    match eventloop.poll().await {
                        Ok(rumqttc::Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker.");
                            // Publishing from inside the poll loop could block it, hand it off
                            let client = online_client.clone();
                            let online = online.clone();
                            tokio::spawn(async move {
                                if let Err(e) = publish(&client, online).await {
                                    error!("Unable to publish availability: {}", e);
                                }
                            });
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT Connection error encountered: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            .instrument(info_span!("MQTT")),
        );

        MqttSink {
            client,
            topics,
            qos: config.qos,
        }
    }

    pub async fn announce(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let message = MqttMessage::alert(&self.topics, self.qos, event)?;
        debug!(topic=%message.topic, "Publishing alert");
        publish(&self.client, message).await
    }

    /// Mark the detector offline and close the connection.
    pub async fn shutdown(&self) {
        let _ = publish(&self.client, MqttMessage::availability(&self.topics, false)).await;
        let _ = self.client.disconnect().await;
    }
}

async fn publish(client: &AsyncClient, message: MqttMessage) -> Result<(), SinkError> {
    client
        .publish(
            message.topic,
            message.qos.into(),
            message.retain,
            message.payload.into_bytes(),
        )
        .await?;
    Ok(())
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct MqttTopics {
    pub base: String,
}

impl MqttTopics {
    pub fn new(base: String) -> Self {
        Self { base }
    }

    pub fn get_availability(&self) -> String {
        format!("{}/availability", self.base)
    }

    pub fn get_alert(&self, class: &str) -> String {
        format!("{}/alerts/{}", self.base, class_slug(class))
    }
}

impl Default for MqttTopics {
    fn default() -> Self {
        Self {
            base: "pi_detector".into(),
        }
    }
}

/// Only lowercase alphanumerics and `_` survive, spaces become `_`
pub fn class_slug(class: &str) -> String {
    class
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '_')
        .map(|c| {
            if c == ' ' {
                '_'
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub qos: MqttQoS,
    pub retain: bool,
    pub payload: String,
}

impl MqttMessage {
    pub fn new(topic: String, qos: MqttQoS, retain: bool, payload: impl Into<String>) -> Self {
        Self {
            topic,
            qos,
            retain,
            payload: payload.into(),
        }
    }

    pub fn availability(topics: &MqttTopics, online: bool) -> Self {
        MqttMessage::new(
            topics.get_availability(),
            MqttQoS::AtLeastOnce,
            true,
            match online {
                true => "online",
                false => "offline",
            },
        )
    }

    pub fn alert(
        topics: &MqttTopics,
        qos: MqttQoS,
        event: &AlertEvent,
    ) -> Result<Self, SinkError> {
        Ok(MqttMessage::new(
            topics.get_alert(&event.class),
            qos,
            false,
            serde_json::to_string(event)?,
        ))
    }
}

impl From<MqttMessage> for rumqttc::LastWill {
    fn from(m: MqttMessage) -> Self {
        rumqttc::LastWill::new(m.topic, m.payload.into_bytes(), m.qos.into(), m.retain)
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[allow(clippy::enum_variant_names)]
pub enum MqttQoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<MqttQoS> for rumqttc::QoS {
    fn from(q: MqttQoS) -> Self {
        use rumqttc::QoS;
        match q {
            MqttQoS::AtMostOnce => QoS::AtMostOnce,
            MqttQoS::AtLeastOnce => QoS::AtLeastOnce,
            MqttQoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}
