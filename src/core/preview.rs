use crate::core::detection::BoundingBox;
use crate::core::identity::PersonCluster;
use crate::core::sampler::{DecodeError, FrameSource};
use crate::core::video::VideoHandle;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Representative video not found for person_{id}")]
    MissingVideo { id: u32 },

    #[error("Face box is empty after cropping")]
    EmptyCrop,
}

/// Writes one square face thumbnail per person.
pub struct PreviewRenderer {
    size: u32,
    quality: u8,
}

impl PreviewRenderer {
    pub fn new(size: u32) -> Self {
        Self {
            size: size.max(1),
            quality: 85,
        }
    }

    pub fn preview_path(dir: &Path, cluster: &PersonCluster) -> PathBuf {
        dir.join(cluster.preview_name())
    }

    /// Render every cluster into `dir`, replacing previews left by an
    /// earlier clustering. A preview that cannot be produced is logged and
    /// skipped; the identity pass does not depend on it.
    pub fn render_all(
        &self,
        source: &dyn FrameSource,
        videos: &[VideoHandle],
        clusters: &[PersonCluster],
        dir: &Path,
    ) -> Result<Vec<PathBuf>, PreviewError> {
        fs::create_dir_all(dir)?;
        remove_previews(dir)?;
        let mut written = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            match self.render(source, videos, cluster, dir) {
                Ok(path) => written.push(path),
                Err(e) => warn!(person = cluster.id, error = %e, "could not write preview"),
            }
        }
        Ok(written)
    }

    pub fn render(
        &self,
        source: &dyn FrameSource,
        videos: &[VideoHandle],
        cluster: &PersonCluster,
        dir: &Path,
    ) -> Result<PathBuf, PreviewError> {
        let video = videos
            .iter()
            .find(|v| v.path == cluster.representative.video)
            .ok_or(PreviewError::MissingVideo { id: cluster.id })?;
        let detection = &cluster.representative_detection;
        let frame = source.frame_at(video, detection.timestamp)?;

        let thumbnail = self.crop_face(&frame, &detection.bbox)?;
        let path = Self::preview_path(dir, cluster);
        self.save(&thumbnail, &path)?;
        debug!(person = cluster.id, path = %path.display(), "wrote preview");
        Ok(path)
    }

    /// Square crop centred on the face, padded by a quarter of its larger
    /// side, resized to the preview size.
    pub fn crop_face(&self, frame: &RgbImage, bbox: &BoundingBox) -> Result<RgbImage, PreviewError> {
        let (fw, fh) = (frame.width() as f32, frame.height() as f32);
        let (cx, cy) = bbox.center();
        let side = (bbox.width() * fw).max(bbox.height() * fh) * 1.25;
        let side = side.min(fw).min(fh);

        let x = (cx * fw - side / 2.0).clamp(0.0, fw - side);
        let y = (cy * fh - side / 2.0).clamp(0.0, fh - side);
        let side = side.floor() as u32;
        if side == 0 {
            return Err(PreviewError::EmptyCrop);
        }

        let crop = imageops::crop_imm(frame, x as u32, y as u32, side, side).to_image();
        Ok(imageops::resize(&crop, self.size, self.size, FilterType::Lanczos3))
    }

    fn save(&self, img: &RgbImage, path: &Path) -> Result<(), PreviewError> {
        let mut output = fs::File::create(path)?;
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, self.quality);
        img.write_with_encoder(encoder)?;
        Ok(())
    }
}

fn is_preview_name(name: &str) -> bool {
    name.strip_prefix("person_")
        .and_then(|rest| rest.strip_suffix(".jpg"))
        .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}

/// Delete every `person_<id>.jpg` in `dir`, leaving other files alone.
fn remove_previews(dir: &Path) -> Result<(), PreviewError> {
    let stale: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name().to_str().is_some_and(is_preview_name))
        .map(|e| e.into_path())
        .collect();
    for path in stale {
        fs::remove_file(&path)?;
        debug!(path = %path.display(), "removed old preview");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detection::Detection;
    use crate::core::identity::FaceRef;
    use crate::core::sampler::FrameStream;
    use crate::core::video::{Fingerprint, VideoInfo};
    use image::{GenericImageView, Rgb};

    fn frame(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 0]))
    }

    #[test]
    fn test_crop_is_square_at_preview_size() {
        let renderer = PreviewRenderer::new(150);
        let bbox = BoundingBox { x1: 0.4, y1: 0.3, x2: 0.6, y2: 0.7 };
        let thumb = renderer.crop_face(&frame(640, 360), &bbox).unwrap();
        assert_eq!(thumb.dimensions(), (150, 150));
    }

    #[test]
    fn test_crop_near_edge_stays_inside_frame() {
        let renderer = PreviewRenderer::new(64);
        let bbox = BoundingBox { x1: 0.9, y1: 0.9, x2: 1.0, y2: 1.0 };
        let thumb = renderer.crop_face(&frame(200, 100), &bbox).unwrap();
        assert_eq!(thumb.dimensions(), (64, 64));
    }

    #[test]
    fn test_saved_preview_is_jpeg() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let renderer = PreviewRenderer::new(32);
        let path = temp_dir.path().join("person_0.jpg");
        renderer.save(&frame(32, 32), &path).unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!(img.dimensions(), (32, 32));
    }

    struct StillSource;

    impl FrameSource for StillSource {
        fn probe(&self, path: &Path) -> Result<VideoInfo, DecodeError> {
            Err(DecodeError::Open {
                path: path.display().to_string(),
                reason: "still image".to_string(),
            })
        }

        fn open<'a>(&'a self, video: &VideoHandle, _interval: f64) -> Result<FrameStream<'a>, DecodeError> {
            Err(DecodeError::Open {
                path: video.path.display().to_string(),
                reason: "still image".to_string(),
            })
        }

        fn frame_at(&self, _video: &VideoHandle, _timestamp: f64) -> Result<RgbImage, DecodeError> {
            Ok(frame(100, 100))
        }
    }

    fn person(id: u32, video: &Path) -> PersonCluster {
        let face_ref = FaceRef {
            video: video.to_path_buf(),
            frame: 0,
            face: 0,
        };
        PersonCluster {
            id,
            members: vec![face_ref.clone()],
            representative: face_ref,
            representative_detection: Detection {
                bbox: BoundingBox { x1: 0.3, y1: 0.3, x2: 0.6, y2: 0.6 },
                confidence: 0.9,
                landmarks: None,
                expression: 0.0,
                timestamp: 0.0,
            },
            videos: vec![video.to_path_buf()],
            centroid: vec![1.0, 0.0],
        }
    }

    #[test]
    fn test_render_all_replaces_old_previews() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dir = temp_dir.path().join("face_previews");
        fs::create_dir_all(&dir).unwrap();
        for name in ["person_0.jpg", "person_3.jpg", "notes.txt", "person_x.jpg"] {
            fs::write(dir.join(name), b"old").unwrap();
        }

        let video = VideoHandle::new(
            PathBuf::from("a.mp4"),
            Fingerprint {
                size: 0,
                modified_secs: 0,
                modified_nanos: 0,
                digest: String::new(),
            },
            VideoInfo {
                duration: 1.0,
                width: 100,
                height: 100,
                frame_rate: 30.0,
                has_audio: false,
            },
        );
        let written = PreviewRenderer::new(16)
            .render_all(&StillSource, &[video], &[person(0, Path::new("a.mp4"))], &dir)
            .unwrap();
        assert_eq!(written, vec![dir.join("person_0.jpg")]);

        let mut names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["notes.txt", "person_0.jpg", "person_x.jpg"]);
        assert_eq!(image::open(dir.join("person_0.jpg")).unwrap().dimensions(), (16, 16));
    }

    #[test]
    fn test_preview_names() {
        assert!(is_preview_name("person_0.jpg"));
        assert!(is_preview_name("person_12.jpg"));
        assert!(!is_preview_name("person_.jpg"));
        assert!(!is_preview_name("person_1.png"));
        assert!(!is_preview_name("cover.jpg"));
    }
}
