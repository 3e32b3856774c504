mod console;
mod mqtt;
mod speech;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use console::ConsoleSink;
pub use mqtt::{MqttQoS, MqttSink};
pub use speech::SpeechSink;

use crate::{config::ConfigAnnounce, detection::AlertEvent};

/// Somewhere an alert can be surfaced.
pub enum Sink {
    Console(ConsoleSink),
    Speech(SpeechSink),
    Mqtt(MqttSink),
}

impl Sink {
    pub fn name(&self) -> &'static str {
        match self {
            Sink::Console(_) => "console",
            Sink::Speech(_) => "speech",
            Sink::Mqtt(_) => "mqtt",
        }
    }

    pub async fn announce(&self, event: &AlertEvent) -> Result<(), SinkError> {
        match self {
            Sink::Console(sink) => {
                sink.announce(event);
                Ok(())
            }
            Sink::Speech(sink) => sink.announce(event).await,
            Sink::Mqtt(sink) => sink.announce(event).await,
        }
    }

    async fn shutdown(&self) {
        if let Sink::Mqtt(sink) = self {
            sink.shutdown().await;
        }
    }
}

/// Build the configured sinks. Must be called from within the runtime.
pub fn build_sinks(config: &ConfigAnnounce) -> Vec<Sink> {
    let mut sinks = Vec::new();
    if config.console {
        sinks.push(Sink::Console(ConsoleSink));
    }
    if let Some(argv) = &config.speech_command {
        sinks.push(Sink::Speech(SpeechSink::new(argv.clone())));
    }
    if let Some(mqtt) = &config.mqtt {
        sinks.push(Sink::Mqtt(MqttSink::connect(mqtt)));
    }
    sinks
}

/// Hands every alert to every sink until the sending side closes. A failing sink is logged and
/// skipped, it never stops the others. Returns the number of alerts received.
pub async fn run_announcer(mut alerts: mpsc::Receiver<AlertEvent>, sinks: Vec<Sink>) -> usize {
    if sinks.is_empty() {
        warn!("No announcement sinks configured, alerts will only be logged");
    }
    let mut received = 0;
    while let Some(event) = alerts.recv().await {
        received += 1;
        for sink in &sinks {
            if let Err(e) = sink.announce(&event).await {
                warn!(sink = sink.name(), "Announcement failed: {}", e);
            }
        }
    }
    debug!("Alert stream closed");
    for sink in &sinks {
        sink.shutdown().await;
    }
    info!(alerts = received, "Announcer stopped");
    received
}

quick_error! {
    #[derive(Debug)]
    pub enum SinkError {
        Speech(error: String) {
            display("Speech output failed: {}", error)
        }
        Publish(error: String) {
            display("Unable to publish alert: {}", error)
            from(e: rumqttc::ClientError) -> (e.to_string())
            from(e: serde_json::Error) -> (e.to_string())
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use tokio::sync::mpsc;

    use super::{build_sinks, run_announcer, Sink, SpeechSink};
    use crate::{config::ConfigAnnounce, detection::AlertEvent};

    fn event(class: &str) -> AlertEvent {
        AlertEvent {
            class: class.into(),
            confidence: 0.9,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_delivery() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(event("person")).await.unwrap();
        tx.send(event("dog")).await.unwrap();
        drop(tx);

        let sinks = vec![
            Sink::Speech(SpeechSink::new(vec!["false".into()])),
            Sink::Speech(SpeechSink::new(vec!["true".into()])),
        ];
        assert_eq!(run_announcer(rx, sinks).await, 2);
    }

    #[tokio::test]
    async fn test_build_sinks() {
        let sinks = build_sinks(&ConfigAnnounce {
            console: true,
            speech_command: Some(vec!["espeak".into()]),
            mqtt: None,
        });
        let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["console", "speech"]);

        let sinks = build_sinks(&ConfigAnnounce {
            console: false,
            speech_command: None,
            mqtt: None,
        });
        assert!(sinks.is_empty());
    }
}
