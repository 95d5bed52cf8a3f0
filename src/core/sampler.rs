use crate::core::video::{VideoHandle, VideoInfo};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Cannot open {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Frame read failed in {path} at {timestamp:.2}s: {reason}")]
    Read {
        path: String,
        timestamp: f64,
        reason: String,
    },
}

pub type FrameStream<'a> = Box<dyn Iterator<Item = Result<RgbImage, DecodeError>> + Send + 'a>;

/// Video decode collaborator.
pub trait FrameSource: Send + Sync {
    fn probe(&self, path: &Path) -> Result<VideoInfo, DecodeError>;

    /// Frames at t = 0, interval, 2*interval, ... in order.
    fn open<'a>(&'a self, video: &VideoHandle, interval: f64) -> Result<FrameStream<'a>, DecodeError>;

    fn frame_at(&self, video: &VideoHandle, timestamp: f64) -> Result<RgbImage, DecodeError>;
}

#[derive(Debug)]
pub struct SampledFrame {
    pub timestamp: f64,
    pub image: RgbImage,
}

/// Fixed-stride sampler over one video. Each call to [`FrameSampler::frames`]
/// starts again from the beginning.
pub struct FrameSampler<'a> {
    source: &'a dyn FrameSource,
    video: &'a VideoHandle,
    interval: f64,
}

impl<'a> FrameSampler<'a> {
    pub fn new(source: &'a dyn FrameSource, video: &'a VideoHandle, interval: f64) -> Self {
        Self {
            source,
            video,
            interval,
        }
    }

    pub fn timestamps(&self) -> Vec<f64> {
        sample_timestamps(self.video.info.duration, self.interval)
    }

    pub fn frames(&self) -> Result<SampledFrames<'a>, DecodeError> {
        let stream = self.source.open(self.video, self.interval)?;
        Ok(SampledFrames {
            stream,
            timestamps: self.timestamps().into_iter(),
            path: self.video.path.display().to_string(),
            done: false,
        })
    }
}

/// Lazy, finite sequence of sampled frames. Ends after the first read error,
/// which is yielded once; frames yielded before it stay valid.
pub struct SampledFrames<'a> {
    stream: FrameStream<'a>,
    timestamps: std::vec::IntoIter<f64>,
    path: String,
    done: bool,
}

impl Iterator for SampledFrames<'_> {
    type Item = Result<SampledFrame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let timestamp = self.timestamps.next()?;
        match self.stream.next() {
            Some(Ok(image)) => Some(Ok(SampledFrame { timestamp, image })),
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                // A stream shorter than the probed duration is a truncated file.
                Some(Err(DecodeError::Read {
                    path: self.path.clone(),
                    timestamp,
                    reason: "stream ended early".to_string(),
                }))
            }
        }
    }
}

/// Sample instants `k * interval` strictly before `duration`.
pub fn sample_timestamps(duration: f64, interval: f64) -> Vec<f64> {
    if !(duration > 0.0) || !(interval > 0.0) {
        return Vec::new();
    }
    let count = (duration / interval).ceil() as usize;
    (0..count)
        .map(|k| k as f64 * interval)
        .filter(|t| *t < duration)
        .collect()
}
