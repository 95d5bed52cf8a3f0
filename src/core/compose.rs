//! Description of the final highlight video handed to the composer.

use crate::config::{AudioSettings, OutputSettings, TitleSettings};
use crate::core::selector::ClipWindow;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub const AUDIO_FORMATS: [&str; 5] = ["mp3", "aac", "wav", "m4a", "flac"];

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("Nothing to compose")]
    NoClips,

    #[error("Composer tool unavailable: {0}")]
    Unavailable(String),

    #[error("{step} failed for {path}: {reason}")]
    Step {
        step: &'static str,
        path: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TitleSpec {
    /// May contain `\n` for multiple lines.
    pub text: String,
    pub duration: f64,
    pub font_size: u32,
    pub text_color: String,
    pub font_path: Option<PathBuf>,
}

impl TitleSpec {
    pub fn new(text: impl Into<String>, settings: &TitleSettings) -> Self {
        Self {
            text: text.into(),
            duration: settings.duration,
            font_size: settings.font_size,
            text_color: settings.text_color.clone(),
            font_path: settings.font_path.clone(),
        }
    }

    /// Lines to draw, accepting a literal backslash-n as a break.
    pub fn lines(&self) -> Vec<String> {
        self.text
            .replace("\\n", "\n")
            .split('\n')
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioSpec {
    pub path: PathBuf,
    pub volume: f64,
    pub fade_out: f64,
}

impl AudioSpec {
    pub fn new(path: PathBuf, settings: &AudioSettings) -> Self {
        Self {
            path,
            volume: settings.volume,
            fade_out: settings.fade_out,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposeRequest {
    /// Clips in presentation order.
    pub clips: Vec<ClipWindow>,
    pub title: Option<TitleSpec>,
    pub audio: Option<AudioSpec>,
    pub format: OutputSettings,
    pub output: PathBuf,
}

impl ComposeRequest {
    pub fn total_duration(&self) -> f64 {
        self.clips.iter().map(ClipWindow::duration).sum()
    }
}

/// Turns an ordered clip list into one output file. Must not leave a
/// partial file at `request.output` on failure.
pub trait Composer: Send + Sync {
    fn compose(&self, request: &ComposeRequest) -> Result<PathBuf, ComposeError>;
}

/// `YYYYMMDD_highlight_video.mp4`
pub fn output_file_name(date: NaiveDate) -> String {
    format!("{}_highlight_video.mp4", date.format("%Y%m%d"))
}

pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| AUDIO_FORMATS.contains(&ext.as_str()))
}

/// First supported audio file directly inside `dir`, by file name.
pub fn find_background_music(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    let mut tracks: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_audio_file(e.path()))
        .map(|e| e.into_path())
        .collect();
    tracks.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    tracks.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scoring::FrameScore;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_output_file_name() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(output_file_name(date), "20240307_highlight_video.mp4");
    }

    #[test]
    fn test_find_background_music_picks_first_by_name() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["b.wav", "notes.txt", "a.MP3", "c.flac"] {
            fs::write(temp_dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(temp_dir.path().join("0.mp3")).unwrap();

        let found = find_background_music(temp_dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "a.MP3");
    }

    #[test]
    fn test_find_background_music_empty_or_missing() {
        let temp_dir = TempDir::new().unwrap();
        assert!(find_background_music(temp_dir.path()).is_none());
        assert!(find_background_music(&temp_dir.path().join("nope")).is_none());
    }

    #[test]
    fn test_title_lines() {
        let title = TitleSpec::new("Summer\\nTrip", &TitleSettings::default());
        assert_eq!(title.lines(), vec!["Summer", "Trip"]);
        assert_eq!(title.duration, 3.0);
    }

    #[test]
    fn test_total_duration() {
        let clip = |start: f64, end: f64| ClipWindow {
            video: PathBuf::from("a.mp4"),
            start,
            end,
            peak: FrameScore::empty(start),
        };
        let request = ComposeRequest {
            clips: vec![clip(0.0, 1.0), clip(2.0, 2.5)],
            title: None,
            audio: None,
            format: OutputSettings::default(),
            output: PathBuf::from("out.mp4"),
        };
        assert!((request.total_duration() - 1.5).abs() < 1e-9);
    }
}
