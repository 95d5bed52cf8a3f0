use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid setting {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Relative weights of the four frame sub-scores.
///
/// Weights are normalized before use, so only their ratios matter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub size: f64,
    pub expression: f64,
    pub centering: f64,
    pub confidence: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            size: 0.35,
            expression: 0.35,
            centering: 0.20,
            confidence: 0.10,
        }
    }
}

impl ScoreWeights {
    /// Clamp negatives to zero and rescale so the weights sum to 1.
    /// An all-zero configuration falls back to the defaults.
    pub fn normalized(&self) -> Self {
        let clamp = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let raw = Self {
            size: clamp(self.size),
            expression: clamp(self.expression),
            centering: clamp(self.centering),
            confidence: clamp(self.confidence),
        };
        let total = raw.size + raw.expression + raw.centering + raw.confidence;
        if total <= 0.0 {
            return Self::default().normalized();
        }
        Self {
            size: raw.size / total,
            expression: raw.expression / total,
            centering: raw.centering / total,
            confidence: raw.confidence / total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Euclidean distance between L2-normalized embeddings.
    #[default]
    Euclidean,
    /// 1 - cosine similarity.
    Cosine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Neighbourhood radius for density clustering.
    pub radius: f32,
    /// Minimum neighbourhood size (including the point itself) for a core point.
    pub min_neighbors: usize,
    /// Maximum distance from a selected person's centroid for an unclustered
    /// face to still count as that person.
    pub match_threshold: f32,
    pub metric: DistanceMetric,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            radius: 0.5,
            min_neighbors: 2,
            match_threshold: 0.5,
            metric: DistanceMetric::Euclidean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub width: u32,
    pub height: u32,
    /// Frame rate as an ffmpeg rational, e.g. `30000/1001`.
    pub frame_rate: String,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            width: 540,
            height: 960,
            frame_rate: "30000/1001".to_string(),
            video_bitrate: "4500k".to_string(),
            audio_bitrate: "192k".to_string(),
            audio_sample_rate: 48_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TitleSettings {
    pub duration: f64,
    pub font_size: u32,
    pub text_color: String,
    pub font_path: Option<PathBuf>,
}

impl Default for TitleSettings {
    fn default() -> Self {
        Self {
            duration: 3.0,
            font_size: 48,
            text_color: "#FFFFFF".to_string(),
            font_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub volume: f64,
    pub fade_out: f64,
    /// Folder searched for a background track when none is given explicitly.
    pub bgm_dir: Option<PathBuf>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            volume: 0.3,
            fade_out: 2.0,
            bgm_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds of footage taken from each video.
    pub clip_duration: f64,
    /// Seconds between sampled frames.
    pub sample_interval: f64,
    pub weights: ScoreWeights,
    /// Face-area to frame-area ratio is multiplied by this and capped at 1.
    pub size_gain: f64,
    pub cluster: ClusterSettings,
    pub output: OutputSettings,
    pub title: TitleSettings,
    pub audio: AudioSettings,
    pub preview_size: u32,
    pub preview_dir: String,
    pub cache_dir: String,
    /// Worker threads for scanning and extraction; 0 means available parallelism.
    pub workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            clip_duration: 1.0,
            sample_interval: 0.2,
            weights: ScoreWeights::default(),
            size_gain: 10.0,
            cluster: ClusterSettings::default(),
            output: OutputSettings::default(),
            title: TitleSettings::default(),
            audio: AudioSettings::default(),
            preview_size: 150,
            preview_dir: "face_previews".to_string(),
            cache_dir: ".facereel".to_string(),
            workers: 0,
        }
    }
}

impl Settings {
    /// Load from `path`, or from the per-user default location when `path` is
    /// `None`. A missing default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("facereel").join("config.json"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.clip_duration > 0.0) {
            return Err(ConfigError::Invalid {
                field: "clip_duration",
                message: format!("must be positive, got {}", self.clip_duration),
            });
        }
        if !(self.sample_interval > 0.0) {
            return Err(ConfigError::Invalid {
                field: "sample_interval",
                message: format!("must be positive, got {}", self.sample_interval),
            });
        }
        if self.cluster.min_neighbors == 0 {
            return Err(ConfigError::Invalid {
                field: "cluster.min_neighbors",
                message: "must be at least 1".to_string(),
            });
        }
        if !(self.cluster.radius > 0.0) {
            return Err(ConfigError::Invalid {
                field: "cluster.radius",
                message: format!("must be positive, got {}", self.cluster.radius),
            });
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_weights_normalize_to_one() {
        let configs = [
            ScoreWeights::default(),
            ScoreWeights { size: 2.0, expression: 1.0, centering: 1.0, confidence: 0.0 },
            ScoreWeights { size: -1.0, expression: 3.0, centering: 0.5, confidence: 0.5 },
            ScoreWeights { size: 0.0, expression: 0.0, centering: 0.0, confidence: 0.0 },
            ScoreWeights { size: f64::NAN, expression: 1.0, centering: 1.0, confidence: 1.0 },
        ];
        for w in configs {
            let n = w.normalized();
            let sum = n.size + n.expression + n.centering + n.confidence;
            assert!((sum - 1.0).abs() < 1e-9, "{:?} -> {}", w, sum);
            assert!(n.size >= 0.0 && n.expression >= 0.0);
            assert!(n.centering >= 0.0 && n.confidence >= 0.0);
        }
    }

    #[test]
    fn test_default_weights_preserved() {
        let n = ScoreWeights::default().normalized();
        assert!((n.size - 0.35).abs() < 1e-9);
        assert!((n.expression - 0.35).abs() < 1e-9);
        assert!((n.centering - 0.20).abs() < 1e-9);
        assert!((n.confidence - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{"clip_duration": 2.5, "cluster": {"radius": 0.4}}"#).unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.clip_duration, 2.5);
        assert_eq!(settings.cluster.radius, 0.4);
        assert_eq!(settings.cluster.min_neighbors, 2);
        assert_eq!(settings.output.width, 540);
    }

    #[test]
    fn test_load_rejects_malformed_and_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let bad = temp_dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(Settings::load(Some(&bad)), Err(ConfigError::Parse { .. })));

        let invalid = temp_dir.path().join("invalid.json");
        fs::write(&invalid, r#"{"clip_duration": 0}"#).unwrap();
        assert!(matches!(
            Settings::load(Some(&invalid)),
            Err(ConfigError::Invalid { field: "clip_duration", .. })
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.json");
        assert!(matches!(Settings::load(Some(&missing)), Err(ConfigError::Io { .. })));
    }
}
