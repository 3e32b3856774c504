use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    nms::non_max_suppression, Detection, Detector, DetectorError, RawCandidate, Vocabulary,
    DEFAULT_ANNOUNCE_CLASSES,
};
use crate::{camera::Frame, config::ConfigDetection};

#[derive(Debug, PartialEq, Clone)]
pub struct PipelineConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Inference runs on every Nth frame
    pub sample_interval_frames: u64,
    /// Minimum time between two alerts for the same class
    pub cooldown: Duration,
    pub announceable_classes: HashSet<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.4,
            sample_interval_frames: 30,
            cooldown: Duration::from_secs(5),
            announceable_classes: DEFAULT_ANNOUNCE_CLASSES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl From<&ConfigDetection> for PipelineConfig {
    fn from(cfg: &ConfigDetection) -> Self {
        Self {
            confidence_threshold: cfg.confidence_threshold,
            iou_threshold: cfg.iou_threshold,
            sample_interval_frames: cfg.sample_interval_frames.max(1),
            cooldown: Duration::from_millis(
                (cfg.cooldown_duration_seconds * 1000.0).round() as u64,
            ),
            announceable_classes: cfg.announceable_classes.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, PartialEq, Deserialize, Serialize, Clone)]
pub struct AlertEvent {
    pub class: String,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// When each class was last announced, on the monotonic clock so a stepped wall clock cannot
/// silence a class. Entries are only ever added or moved forward.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct AnnouncementState {
    last_announced_at: HashMap<String, Instant>,
}

impl AnnouncementState {
    #[cfg(test)]
    pub fn last_announced(&self, class: &str) -> Option<Instant> {
        self.last_announced_at.get(class).copied()
    }

    pub fn len(&self) -> usize {
        self.last_announced_at.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.last_announced_at.is_empty()
    }

    /// Record an announcement for `class` at `now` unless it is still cooling down. The cooldown
    /// has to be exceeded, a repeat exactly one cooldown later is still suppressed.
    fn try_announce(&mut self, class: &str, now: Instant, cooldown: Duration) -> bool {
        let eligible = match self.last_announced_at.get(class) {
            Some(last) => now.saturating_duration_since(*last) > cooldown,
            None => true,
        };
        if eligible {
            self.last_announced_at.insert(class.to_string(), now);
        }
        eligible
    }
}

/// What happened to a single frame.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct FrameReport {
    pub frame_number: u64,
    /// Whether inference ran on this frame
    pub sampled: bool,
    pub detections: Vec<Detection>,
    pub alerts: Vec<AlertEvent>,
}

/// Turns frames into a debounced stream of alerts.
pub struct DetectionAlertPipeline<D> {
    detector: D,
    vocabulary: Vocabulary,
    config: PipelineConfig,
    frame_counter: u64,
    announcements: AnnouncementState,
}

impl<D: Detector> DetectionAlertPipeline<D> {
    pub fn new(detector: D, vocabulary: Vocabulary, config: PipelineConfig) -> Self {
        Self {
            detector,
            vocabulary,
            config,
            frame_counter: 0,
            announcements: AnnouncementState::default(),
        }
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn announcements(&self) -> &AnnouncementState {
        &self.announcements
    }

    /// Frames are numbered from 1 and inference runs when the number is a multiple of the sample
    /// interval. A detector failure leaves the counter and announcement state untouched.
    ///
    /// `now` drives the cooldown; alerts are stamped with the frame's capture time.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        now: Instant,
    ) -> Result<FrameReport, PipelineError> {
        let frame_number = self.frame_counter + 1;
        if frame_number % self.config.sample_interval_frames != 0 {
            self.frame_counter = frame_number;
            return Ok(FrameReport {
                frame_number,
                ..Default::default()
            });
        }

        let candidates = self.detector.infer(frame)?;
        let detections = self.filter(candidates)?;
        self.frame_counter = frame_number;

        let mut alerts = Vec::new();
        for det in &detections {
            if !self.config.announceable_classes.contains(&det.class_label) {
                continue;
            }
            if self
                .announcements
                .try_announce(&det.class_label, now, self.config.cooldown)
            {
                info!(class=%det.class_label, confidence=det.confidence, "Detected");
                alerts.push(AlertEvent {
                    class: det.class_label.clone(),
                    confidence: det.confidence,
                    timestamp: frame.captured_at,
                });
            } else {
                debug!(class=%det.class_label, "Repeat detection suppressed");
            }
        }

        Ok(FrameReport {
            frame_number,
            sampled: true,
            detections,
            alerts,
        })
    }

    /// Best class per candidate, confidence threshold, then non-max suppression.
    fn filter(&self, candidates: Vec<RawCandidate>) -> Result<Vec<Detection>, DetectorError> {
        let mut detections = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.scores.len() != self.vocabulary.len() {
                return Err(DetectorError::ProtocolInvalid(format!(
                    "Expected {} class scores, got {}",
                    self.vocabulary.len(),
                    candidate.scores.len()
                )));
            }
            let best = candidate
                .scores
                .iter()
                .copied()
                .enumerate()
                .fold(None, |best: Option<(usize, f32)>, (idx, score)| match best {
                    Some((_, top)) if top >= score || score.is_nan() => best,
                    _ if score.is_nan() => best,
                    _ => Some((idx, score)),
                });
            let (class_id, confidence) = match best {
                Some(best) => best,
                None => continue,
            };
            if confidence <= self.config.confidence_threshold {
                continue;
            }
            // Index is in range, the score count matches the vocabulary
            let class_label = self.vocabulary.label(class_id).unwrap_or_default().to_string();
            detections.push(Detection {
                class_id,
                class_label,
                confidence,
                bounding_box: candidate.bounding_box,
            });
        }
        Ok(non_max_suppression(detections, self.config.iou_threshold))
    }
}

quick_error! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum PipelineError {
        Detector(error: DetectorError) {
            from()
            display("Frame skipped: {}", error)
            source(error)
        }
    }
}
