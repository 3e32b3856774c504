use std::cmp::Ordering;

use super::Detection;

/// Greedy non-max suppression across all classes.
///
/// Highest confidence first; a detection is dropped when it overlaps an already kept one by more
/// than `iou_threshold`. Equal confidences keep the detector's output order.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    // `sort_by` is stable, which gives the tie breaking
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let duplicate = kept
            .iter()
            .any(|k| k.bounding_box.iou(&candidate.bounding_box) > iou_threshold);
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod test {
    use super::non_max_suppression;
    use crate::detection::{BoundingBox, Detection};

    fn det(label: &str, confidence: f32, x: f32) -> Detection {
        Detection {
            class_id: 0,
            class_label: label.into(),
            confidence,
            bounding_box: BoundingBox::new(x, 0.0, 10.0, 10.0),
        }
    }

    fn labels(dets: &[Detection]) -> Vec<&str> {
        dets.iter().map(|d| d.class_label.as_str()).collect()
    }

    #[test]
    fn test_keeps_highest_of_overlap() {
        // IoU of x=0 and x=2: 80 / 120
        let kept = non_max_suppression(vec![det("low", 0.6, 2.0), det("high", 0.8, 0.0)], 0.4);
        assert_eq!(labels(&kept), vec!["high"]);
    }

    #[test]
    fn test_keeps_disjoint_in_confidence_order() {
        let kept = non_max_suppression(
            vec![
                det("a", 0.55, 0.0),
                det("b", 0.9, 50.0),
                det("c", 0.7, 100.0),
            ],
            0.4,
        );
        assert_eq!(labels(&kept), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_overlap_at_threshold_is_kept() {
        // IoU of x=0 and x=5 is exactly 1/3
        let kept = non_max_suppression(vec![det("a", 0.9, 0.0), det("b", 0.8, 5.0)], 1.0 / 3.0);
        assert_eq!(kept.len(), 2);
        let kept = non_max_suppression(vec![det("a", 0.9, 0.0), det("b", 0.8, 5.0)], 0.3);
        assert_eq!(labels(&kept), vec!["a"]);
    }

    #[test]
    fn test_ties_keep_detector_order() {
        let kept = non_max_suppression(
            vec![
                det("first", 0.7, 0.0),
                det("second", 0.7, 1.0),
                det("third", 0.7, 200.0),
            ],
            0.4,
        );
        assert_eq!(labels(&kept), vec!["first", "third"]);
    }

    #[test]
    fn test_suppressed_box_does_not_suppress_others() {
        // b overlaps a and c, but a and c do not overlap each other
        let kept = non_max_suppression(
            vec![det("a", 0.9, 0.0), det("b", 0.8, 4.0), det("c", 0.7, 8.0)],
            0.4,
        );
        assert_eq!(labels(&kept), vec!["a", "c"]);
    }

    #[test]
    fn test_empty() {
        assert!(non_max_suppression(vec![], 0.4).is_empty());
    }
}
