mod bounding_box;
mod detector;
mod nms;
mod pipeline;
mod vocabulary;

use serde::{Deserialize, Serialize};

pub use bounding_box::BoundingBox;
pub use detector::{Detector, DetectorError, ProcessDetector, RawCandidate};
pub use pipeline::{AlertEvent, DetectionAlertPipeline, PipelineConfig};
pub use vocabulary::{Vocabulary, COCO_CLASSES, DEFAULT_ANNOUNCE_CLASSES};

#[cfg(test)]
pub(crate) use pipeline::test as fakes;

/// A detection that survived thresholding and suppression.
#[derive(Debug, PartialEq, Deserialize, Serialize, Clone)]
pub struct Detection {
    pub class_id: usize,
    pub class_label: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}
