use crate::core::scoring::FrameScore;
use crate::core::video::VideoHandle;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;

/// Window sums within this margin count as ties.
const SUM_EPSILON: f64 = 1e-9;

/// Timestamps closer than this are the same instant. Sample times are
/// `k * interval` and drift by a few ulps from the exact window bounds.
const TIME_EPSILON: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum SelectError {
    #[error("No face found in {path}")]
    NoFaceFound { path: String },

    #[error("Video has no playable duration: {path}")]
    EmptyVideo { path: String },
}

/// The time range taken from one source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipWindow {
    pub video: PathBuf,
    pub start: f64,
    pub end: f64,
    pub peak: FrameScore,
}

impl ClipWindow {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone)]
pub struct ClipSelector {
    duration: f64,
}

impl ClipSelector {
    pub fn new(duration: f64) -> Self {
        Self { duration }
    }

    /// Pick the window of the configured length with the highest total
    /// score. Samples are counted when `start <= t < start + duration`; the
    /// earliest window wins ties. Videos shorter than the window contribute
    /// their full length.
    pub fn select(&self, video: &VideoHandle, scores: &[FrameScore]) -> Result<ClipWindow, SelectError> {
        let path = video.path.display().to_string();
        if !scores.iter().any(|s| s.score > 0.0) {
            return Err(SelectError::NoFaceFound { path });
        }

        let scores: Cow<'_, [FrameScore]> = if scores.is_sorted_by(|a, b| a.timestamp <= b.timestamp) {
            Cow::Borrowed(scores)
        } else {
            let mut sorted = scores.to_vec();
            sorted.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
            Cow::Owned(sorted)
        };

        let last_sample = scores.last().map_or(0.0, |s| s.timestamp);
        let video_duration = video.info.duration.max(last_sample);
        if !(video_duration > 0.0) {
            return Err(SelectError::EmptyVideo { path });
        }

        if video_duration <= self.duration {
            return Ok(ClipWindow {
                video: video.path.clone(),
                start: 0.0,
                end: video_duration,
                peak: peak_of(&scores),
            });
        }

        let latest_start = video_duration - self.duration;
        let n = scores.len();
        let mut prefix = Vec::with_capacity(n + 1);
        prefix.push(0.0);
        for s in scores.iter() {
            let last = prefix[prefix.len() - 1];
            prefix.push(last + s.score.max(0.0));
        }

        // (start, sum, lo, hi)
        let mut best: Option<(f64, f64, usize, usize)> = None;
        let mut previous_start: Option<f64> = None;
        let (mut lo, mut hi) = (0usize, 0usize);

        for sample in scores.iter() {
            let start = sample.timestamp.clamp(0.0, latest_start);
            if previous_start == Some(start) {
                continue;
            }
            previous_start = Some(start);

            while lo < n && scores[lo].timestamp < start - TIME_EPSILON {
                lo += 1;
            }
            hi = hi.max(lo);
            while hi < n && scores[hi].timestamp < start + self.duration - TIME_EPSILON {
                hi += 1;
            }

            let sum = prefix[hi] - prefix[lo];
            if best.is_none_or(|(_, best_sum, _, _)| sum > best_sum + SUM_EPSILON) {
                best = Some((start, sum, lo, hi));
            }
        }

        let (start, _, lo, hi) = best.ok_or(SelectError::NoFaceFound { path })?;
        Ok(ClipWindow {
            video: video.path.clone(),
            start,
            end: start + self.duration,
            peak: peak_of(&scores[lo..hi]),
        })
    }
}

fn peak_of(scores: &[FrameScore]) -> FrameScore {
    let mut peak: Option<&FrameScore> = None;
    for s in scores {
        if peak.is_none_or(|p| s.score > p.score) {
            peak = Some(s);
        }
    }
    peak.cloned().unwrap_or_else(|| FrameScore::empty(0.0))
}
