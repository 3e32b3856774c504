use std::process::Stdio;

use tokio::process::Command;

use super::SinkError;
use crate::detection::AlertEvent;

/// Speaks alerts through an external text-to-speech program, e.g. `espeak`.
///
/// The phrase is passed as the last argument.
#[derive(Debug, Clone)]
pub struct SpeechSink {
    argv: Vec<String>,
}

impl SpeechSink {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub fn phrase(event: &AlertEvent) -> String {
        format!("Detected {}", event.class)
    }

    pub async fn announce(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| SinkError::Speech("No speech program configured".into()))?;
        let status = Command::new(program)
            .args(args)
            .arg(Self::phrase(event))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| SinkError::Speech(format!("Unable to run {}: {}", program, e)))?;
        if !status.success() {
            return Err(SinkError::Speech(format!(
                "{} exited with {}",
                program, status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::SpeechSink;
    use crate::{announce::SinkError, detection::AlertEvent};

    fn event() -> AlertEvent {
        AlertEvent {
            class: "cat".into(),
            confidence: 0.9,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_phrase() {
        assert_eq!(SpeechSink::phrase(&event()), "Detected cat");
    }

    #[tokio::test]
    async fn test_runs_program() {
        let sink = SpeechSink::new(vec![
            "sh".into(),
            "-c".into(),
            "test \"$0\" = 'Detected cat'".into(),
        ]);
        sink.announce(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let sink = SpeechSink::new(vec!["false".into()]);
        assert!(matches!(
            sink.announce(&event()).await,
            Err(SinkError::Speech(_))
        ));

        let sink = SpeechSink::new(vec!["pi-detector-no-such-voice".into()]);
        assert!(sink.announce(&event()).await.is_err());
    }
}
