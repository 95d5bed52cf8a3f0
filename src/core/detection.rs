//! Face detection boundary.
//!
//! The detector and embedder are external collaborators. Whatever they return
//! is validated here and converted into the strict [`Detection`] and
//! [`Embedding`] values the rest of the pipeline works with.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// The analyzer cannot run at all. Fatal for the scan.
    #[error("Face analyzer unavailable: {0}")]
    Unavailable(String),

    /// A single frame could not be analyzed. Treated as "no detection".
    #[error("Face analysis failed: {0}")]
    Failed(String),
}

/// Face as reported by the detector, in pixel coordinates of the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five points (eyes, nose tip, mouth corners), optionally followed by
    /// the upper and lower lip midpoints.
    #[serde(default)]
    pub landmarks: Option<Vec<[f32; 2]>>,
    /// Expression score supplied directly by the detector, if it has one.
    #[serde(default)]
    pub expression: Option<f32>,
}

/// Detector and embedder collaborator.
pub trait FaceAnalyzer: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<RawFace>, AnalyzerError>;

    fn embed(&self, frame: &RgbImage, face: &RawFace) -> Result<Vec<f32>, AnalyzerError>;
}

/// Axis-aligned box in normalized 0..1 frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Facial landmarks in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
    pub mouth_left: Point,
    pub mouth_right: Point,
    pub upper_lip: Option<Point>,
    pub lower_lip: Option<Point>,
}

impl Landmarks {
    fn from_points(points: &[[f32; 2]]) -> Option<Self> {
        if points.iter().flatten().any(|v| !v.is_finite()) {
            return None;
        }
        let p = |i: usize| Point {
            x: points[i][0],
            y: points[i][1],
        };
        match points.len() {
            5 => Some(Self {
                left_eye: p(0),
                right_eye: p(1),
                nose: p(2),
                mouth_left: p(3),
                mouth_right: p(4),
                upper_lip: None,
                lower_lip: None,
            }),
            7 => Some(Self {
                left_eye: p(0),
                right_eye: p(1),
                nose: p(2),
                mouth_left: p(3),
                mouth_right: p(4),
                upper_lip: Some(p(5)),
                lower_lip: Some(p(6)),
            }),
            _ => None,
        }
    }

    /// Expressiveness in 0..1 from mouth geometry.
    ///
    /// Mouth width is measured against the eye distance (smiles widen the
    /// mouth). With lip midpoints, mouth opening and the lift of the mouth
    /// corners above the lip centre are blended in.
    pub fn expression_score(&self) -> f32 {
        let eye_distance = self.left_eye.distance(&self.right_eye);
        let mouth_width = self.mouth_left.distance(&self.mouth_right);
        if eye_distance <= f32::EPSILON || mouth_width <= f32::EPSILON {
            return 0.0;
        }

        let width_score = ((mouth_width / eye_distance - 0.75) / 0.5).clamp(0.0, 1.0);

        match (self.upper_lip, self.lower_lip) {
            (Some(upper), Some(lower)) => {
                let open_score = (upper.distance(&lower) / mouth_width / 0.5).clamp(0.0, 1.0);
                let lip_centre_y = (upper.y + lower.y) / 2.0;
                let corners_y = (self.mouth_left.y + self.mouth_right.y) / 2.0;
                // Image y grows downwards, so raised corners give a positive lift.
                let curve_score = ((lip_centre_y - corners_y) / mouth_width / 0.15).clamp(0.0, 1.0);
                0.4 * width_score + 0.3 * open_score + 0.3 * curve_score
            }
            _ => width_score,
        }
    }
}

/// One validated face in one sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
    pub expression: f32,
    pub timestamp: f64,
}

impl Detection {
    /// Validate a detector result against the frame it came from.
    ///
    /// Boxes are clipped to the frame; boxes that end up empty, non-finite
    /// values and confidences outside 0..1 are rejected.
    pub fn from_raw(raw: &RawFace, frame_width: u32, frame_height: u32, timestamp: f64) -> Option<Self> {
        if frame_width == 0 || frame_height == 0 {
            return None;
        }
        let values = [raw.x, raw.y, raw.width, raw.height, raw.confidence];
        if values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        if !(0.0..=1.0).contains(&raw.confidence) {
            return None;
        }

        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let bbox = BoundingBox {
            x1: (raw.x / fw).clamp(0.0, 1.0),
            y1: (raw.y / fh).clamp(0.0, 1.0),
            x2: ((raw.x + raw.width) / fw).clamp(0.0, 1.0),
            y2: ((raw.y + raw.height) / fh).clamp(0.0, 1.0),
        };
        if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
            return None;
        }

        let landmarks = raw.landmarks.as_deref().and_then(Landmarks::from_points);
        let expression = match raw.expression {
            Some(e) if e.is_finite() => e.clamp(0.0, 1.0),
            _ => landmarks.as_ref().map_or(0.0, Landmarks::expression_score),
        };

        Some(Self {
            bbox,
            confidence: raw.confidence,
            landmarks,
            expression,
            timestamp,
        })
    }
}

/// Identity vector for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Reject empty, non-finite and zero-norm vectors.
    pub fn from_raw(values: Vec<f32>) -> Option<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return None;
        }
        Some(Self(values))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn normalized(&self) -> Vec<f32> {
        let norm: f32 = self.0.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return self.0.clone();
        }
        self.0.iter().map(|v| v / norm).collect()
    }
}

/// What the analyzer produced for one frame.
#[derive(Debug, Default)]
pub struct FrameAnalysis {
    pub faces: Vec<(Detection, Option<Embedding>)>,
    /// The detector errored, so `faces` is empty for lack of an answer.
    pub detect_failed: bool,
    pub embed_failures: usize,
}

impl FrameAnalysis {
    /// True when every analyzer call for this frame succeeded.
    pub fn is_complete(&self) -> bool {
        !self.detect_failed && self.embed_failures == 0
    }
}

/// Run the analyzer over one frame.
///
/// Per-frame detector failures yield an empty result; per-face embedder
/// failures keep the face without an embedding. Both are counted in the
/// returned [`FrameAnalysis`]. Only [`AnalyzerError::Unavailable`] is
/// returned as an error.
pub fn analyze_frame(analyzer: &dyn FaceAnalyzer, frame: &RgbImage, timestamp: f64) -> Result<FrameAnalysis, AnalyzerError> {
    let raw_faces = match analyzer.detect(frame) {
        Ok(faces) => faces,
        Err(AnalyzerError::Unavailable(msg)) => return Err(AnalyzerError::Unavailable(msg)),
        Err(e) => {
            debug!(timestamp, error = %e, "detector failed on frame");
            return Ok(FrameAnalysis {
                detect_failed: true,
                ..FrameAnalysis::default()
            });
        }
    };

    let mut analysis = FrameAnalysis {
        faces: Vec::with_capacity(raw_faces.len()),
        ..FrameAnalysis::default()
    };
    for raw in &raw_faces {
        let Some(detection) = Detection::from_raw(raw, frame.width(), frame.height(), timestamp) else {
            debug!(timestamp, ?raw, "rejected invalid detection");
            continue;
        };
        let embedding = match analyzer.embed(frame, raw) {
            Ok(values) => Embedding::from_raw(values),
            Err(AnalyzerError::Unavailable(msg)) => return Err(AnalyzerError::Unavailable(msg)),
            Err(e) => {
                debug!(timestamp, error = %e, "embedder failed on face");
                analysis.embed_failures += 1;
                None
            }
        };
        analysis.faces.push((detection, embedding));
    }
    Ok(analysis)
}
