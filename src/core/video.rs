use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use walkdir::WalkDir;

pub const SUPPORTED_FORMATS: [&str; 3] = ["mp4", "mov", "avi"];

/// Bytes hashed from each end of a file when fingerprinting.
const SAMPLE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl VideoError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        VideoError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// File identity signature used as the scan cache key.
///
/// Size and modification time catch ordinary edits; the digest over the
/// first and last 64 KiB catches a same-size replacement with a preserved
/// mtime without reading whole videos.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified_secs: i64,
    pub modified_nanos: u32,
    pub digest: String,
}

impl Fingerprint {
    pub fn compute(path: &Path) -> Result<Self, VideoError> {
        let metadata = fs::metadata(path).map_err(|e| VideoError::io(path, e))?;
        if !metadata.is_file() {
            return Err(VideoError::InvalidPath {
                path: path.display().to_string(),
            });
        }
        let size = metadata.len();
        let (modified_secs, modified_nanos) = match metadata.modified() {
            Ok(t) => match t.duration_since(UNIX_EPOCH) {
                Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
                Err(e) => {
                    let d = e.duration();
                    (-(d.as_secs() as i64), d.subsec_nanos())
                }
            },
            Err(_) => (0, 0),
        };

        let file = File::open(path).map_err(|e| VideoError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; SAMPLE_BYTES.min(size) as usize];
        reader
            .read_exact(&mut buffer)
            .map_err(|e| VideoError::io(path, e))?;
        hasher.update(&buffer);

        if size > SAMPLE_BYTES * 2 {
            reader
                .seek(SeekFrom::End(-(SAMPLE_BYTES as i64)))
                .map_err(|e| VideoError::io(path, e))?;
            reader
                .read_exact(&mut buffer)
                .map_err(|e| VideoError::io(path, e))?;
            hasher.update(&buffer);
        } else if size > SAMPLE_BYTES {
            let mut rest = Vec::new();
            reader
                .read_to_end(&mut rest)
                .map_err(|e| VideoError::io(path, e))?;
            hasher.update(&rest);
        }

        Ok(Self {
            size,
            modified_secs,
            modified_nanos,
            digest: hasher.finalize().to_hex().to_string(),
        })
    }

    /// Stable hex key derived from every fingerprint component.
    pub fn key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.modified_secs.to_le_bytes());
        hasher.update(&self.modified_nanos.to_le_bytes());
        hasher.update(self.digest.as_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }
}

/// Container-level properties reported by the decode collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub has_audio: bool,
}

/// One input file. Immutable once scanned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoHandle {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub info: VideoInfo,
}

impl VideoHandle {
    pub fn new(path: PathBuf, fingerprint: Fingerprint, info: VideoInfo) -> Self {
        Self {
            path,
            fingerprint,
            info,
        }
    }
}

pub fn is_supported_format(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| SUPPORTED_FORMATS.contains(&ext.as_str()))
}

/// List the supported videos directly inside `dir`, sorted by file name.
pub fn discover_videos(dir: &Path) -> Result<Vec<PathBuf>, VideoError> {
    if !dir.is_dir() {
        return Err(VideoError::InvalidPath {
            path: dir.display().to_string(),
        });
    }

    let mut videos: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_supported_format(e.path()))
        .map(|e| e.into_path())
        .collect();

    videos.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(videos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.mp4");
        fs::write(&path, b"video bytes").unwrap();

        let fp1 = Fingerprint::compute(&path).unwrap();
        let fp2 = Fingerprint::compute(&path).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.key(), fp2.key());
        assert_eq!(fp1.size, 11);
        assert_eq!(fp1.key().len(), 32);
    }

    #[test]
    fn test_fingerprint_detects_mtime_change() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.mp4");
        fs::write(&path, b"video bytes").unwrap();
        let before = Fingerprint::compute(&path).unwrap();

        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(3600))
            .unwrap();
        drop(file);

        let after = Fingerprint::compute(&path).unwrap();
        assert_ne!(before, after);
        assert_ne!(before.key(), after.key());
    }

    #[test]
    fn test_fingerprint_large_file_samples_both_ends() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("big.mov");
        let mut content = vec![7u8; (SAMPLE_BYTES * 3) as usize];
        fs::write(&path, &content).unwrap();
        let original = Fingerprint::compute(&path).unwrap();

        let last = content.len() - 1;
        content[last] = 8;
        fs::write(&path, &content).unwrap();
        let edited = Fingerprint::compute(&path).unwrap();

        assert_ne!(original.digest, edited.digest);
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["c.MOV", "a.mp4", "b.avi", "notes.txt", "d.mkv"] {
            fs::write(temp_dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(temp_dir.path().join("nested")).unwrap();
        fs::write(temp_dir.path().join("nested").join("e.mp4"), b"x").unwrap();

        let videos = discover_videos(temp_dir.path()).unwrap();
        let names: Vec<String> = videos
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.mp4", "b.avi", "c.MOV"]);
    }

    #[test]
    fn test_discover_rejects_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");
        assert!(matches!(
            discover_videos(&missing),
            Err(VideoError::InvalidPath { .. })
        ));
    }
}
