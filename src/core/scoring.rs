use crate::config::ScoreWeights;
use crate::core::detection::Detection;
use serde::{Deserialize, Serialize};

/// Normalized sub-scores of one face, each in 0..1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub size: f64,
    pub expression: f64,
    pub centering: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameScore {
    pub timestamp: f64,
    pub score: f64,
    /// The scoring subject; `None` when the frame scored 0 for lack of a face.
    pub detection: Option<Detection>,
}

impl FrameScore {
    pub fn empty(timestamp: f64) -> Self {
        Self {
            timestamp,
            score: 0.0,
            detection: None,
        }
    }
}

/// Pure per-frame scoring function.
#[derive(Debug, Clone)]
pub struct FaceScorer {
    weights: ScoreWeights,
    size_gain: f64,
}

impl FaceScorer {
    pub fn new(weights: ScoreWeights, size_gain: f64) -> Self {
        Self {
            weights: weights.normalized(),
            size_gain: if size_gain.is_finite() && size_gain > 0.0 {
                size_gain
            } else {
                1.0
            },
        }
    }

    /// Index of the scoring subject: the largest box, ties going to the box
    /// whose centre is horizontally closest to the frame centre, then to the
    /// earliest index.
    pub fn dominant_index(detections: &[Detection]) -> Option<usize> {
        let mut best: Option<(usize, f32, f32)> = None;
        for (i, d) in detections.iter().enumerate() {
            let area = d.bbox.area();
            let offset = (d.bbox.center().0 - 0.5).abs();
            best = match best {
                None => Some((i, area, offset)),
                Some((_, best_area, best_offset))
                    if area > best_area || (area == best_area && offset < best_offset) =>
                {
                    Some((i, area, offset))
                }
                keep => keep,
            };
        }
        best.map(|(i, _, _)| i)
    }

    pub fn breakdown(&self, detection: &Detection) -> ScoreBreakdown {
        let size = (detection.bbox.area() as f64 * self.size_gain).clamp(0.0, 1.0);

        let (cx, cy) = detection.bbox.center();
        let distance = ((cx as f64 - 0.5).powi(2) + (cy as f64 - 0.5).powi(2)).sqrt();
        let max_distance = 0.5f64.sqrt();
        let centering = (1.0 - distance / max_distance).clamp(0.0, 1.0);

        ScoreBreakdown {
            size,
            expression: (detection.expression as f64).clamp(0.0, 1.0),
            centering,
            confidence: (detection.confidence as f64).clamp(0.0, 1.0),
        }
    }

    pub fn composite(&self, breakdown: &ScoreBreakdown) -> f64 {
        let w = &self.weights;
        let score = breakdown.size * w.size
            + breakdown.expression * w.expression
            + breakdown.centering * w.centering
            + breakdown.confidence * w.confidence;
        score.clamp(0.0, 1.0)
    }

    /// Score one sampled frame. No detections scores exactly 0.
    pub fn score(&self, timestamp: f64, detections: &[Detection]) -> FrameScore {
        match Self::dominant_index(detections) {
            Some(i) => {
                let subject = &detections[i];
                FrameScore {
                    timestamp,
                    score: self.composite(&self.breakdown(subject)),
                    detection: Some(subject.clone()),
                }
            }
            None => FrameScore::empty(timestamp),
        }
    }
}

impl Default for FaceScorer {
    fn default() -> Self {
        Self::new(ScoreWeights::default(), 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detection::BoundingBox;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, expression: f32) -> Detection {
        Detection {
            bbox: BoundingBox { x1, y1, x2, y2 },
            confidence,
            landmarks: None,
            expression,
            timestamp: 0.0,
        }
    }

    #[test]
    fn test_empty_frame_scores_zero() {
        let s = FaceScorer::default().score(2.0, &[]);
        assert_eq!(s.score, 0.0);
        assert!(s.detection.is_none());
        assert_eq!(s.timestamp, 2.0);
    }

    #[test]
    fn test_perfect_face_scores_one() {
        let s = FaceScorer::default().score(0.0, &[det(0.2, 0.2, 0.8, 0.8, 1.0, 1.0)]);
        assert!((s.score - 1.0).abs() < 1e-6, "{}", s.score);
    }

    #[test]
    fn test_default_weighting() {
        // Area 0.01 -> size 0.1; centred -> centering 1.
        let d = det(0.45, 0.45, 0.55, 0.55, 0.5, 0.2);
        let s = FaceScorer::default().score(0.0, &[d]);
        let expected = 0.1 * 0.35 + 0.2 * 0.35 + 1.0 * 0.20 + 0.5 * 0.10;
        assert!((s.score - expected).abs() < 1e-6, "{} vs {}", s.score, expected);
    }

    #[test]
    fn test_largest_face_wins() {
        let small_happy = det(0.4, 0.4, 0.5, 0.5, 1.0, 1.0);
        let large = det(0.0, 0.0, 0.3, 0.3, 0.5, 0.0);
        let s = FaceScorer::default().score(0.0, &[small_happy, large.clone()]);
        assert_eq!(s.detection, Some(large));
    }

    #[test]
    fn test_equal_area_tie_breaks_on_horizontal_offset() {
        let left = det(0.0, 0.4, 0.2, 0.6, 0.9, 0.0);
        let centre = det(0.4, 0.0, 0.6, 0.2, 0.9, 0.0);
        assert_eq!(FaceScorer::dominant_index(&[left.clone(), centre.clone()]), Some(1));
        assert_eq!(FaceScorer::dominant_index(&[centre, left]), Some(0));
    }

    #[test]
    fn test_score_always_in_unit_range() {
        let weight_sets = [
            ScoreWeights::default(),
            ScoreWeights { size: 5.0, expression: 0.0, centering: 0.0, confidence: 0.0 },
            ScoreWeights { size: 1.0, expression: 1.0, centering: 1.0, confidence: 1.0 },
            ScoreWeights { size: -3.0, expression: 2.0, centering: 0.0, confidence: 9.0 },
        ];
        let faces = [
            det(0.0, 0.0, 1.0, 1.0, 1.0, 1.0),
            det(0.9, 0.9, 1.0, 1.0, 0.0, 0.0),
            det(0.0, 0.0, 0.01, 0.01, 0.3, 0.7),
        ];
        for w in weight_sets {
            let scorer = FaceScorer::new(w, 10.0);
            for f in &faces {
                let s = scorer.score(0.0, std::slice::from_ref(f)).score;
                assert!((0.0..=1.0).contains(&s), "{:?} {:?} -> {}", w, f, s);
            }
        }
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let scorer = FaceScorer::default();
        let faces = vec![det(0.1, 0.1, 0.4, 0.5, 0.8, 0.3), det(0.5, 0.5, 0.7, 0.9, 0.6, 0.9)];
        let a = scorer.score(1.0, &faces);
        let b = scorer.score(1.0, &faces);
        assert_eq!(a, b);
    }
}
