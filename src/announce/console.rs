use tracing::info;

use crate::detection::AlertEvent;

/// Prints alerts to stdout.
#[derive(Debug, Default, Clone)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn render(event: &AlertEvent) -> String {
        format!(
            "Detected: {} ({:.2}%)",
            event.class,
            event.confidence * 100.0
        )
    }

    pub fn announce(&self, event: &AlertEvent) {
        info!(class=%event.class, at=%event.timestamp, "Announcing");
        println!("{}", Self::render(event));
    }
}
