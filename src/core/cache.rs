//! Persistent per-video scan results.
//!
//! Records are content addressed by the video's [`Fingerprint`]. The backing
//! store is injectable: [`FsBackend`] for real runs, [`MemoryBackend`] for
//! tests. Nothing read back from the store is trusted: unreadable or
//! mismatching records are reported as misses, never as errors.

use crate::core::detection::{Detection, Embedding};
use crate::core::video::{Fingerprint, VideoHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

pub const RECORD_VERSION: u32 = 1;

/// Name under which the orchestrator persists its suspended session.
pub const SESSION_NAME: &str = "session";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Cache backend poisoned")]
    Poisoned,
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub detection: Detection,
    pub embedding: Option<Embedding>,
    /// Person id from the latest clustering pass.
    pub person: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub timestamp: f64,
    pub faces: Vec<FaceRecord>,
}

impl FrameRecord {
    pub fn detections(&self) -> Vec<Detection> {
        self.faces.iter().map(|f| f.detection.clone()).collect()
    }
}

/// Persisted scan of one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub version: u32,
    pub video: VideoHandle,
    pub sample_interval: f64,
    pub frames: Vec<FrameRecord>,
    /// False when decoding stopped early; the frames present are still valid.
    pub complete: bool,
    pub scanned_at: DateTime<Utc>,
}

impl ScanRecord {
    pub fn new(video: VideoHandle, sample_interval: f64, frames: Vec<FrameRecord>, complete: bool) -> Self {
        Self {
            version: RECORD_VERSION,
            video,
            sample_interval,
            frames,
            complete,
            scanned_at: Utc::now(),
        }
    }

    pub fn face_count(&self) -> usize {
        self.frames.iter().map(|f| f.faces.len()).sum()
    }

    pub fn has_faces(&self) -> bool {
        self.frames.iter().any(|f| !f.faces.is_empty())
    }
}

/// Outcome of a cache lookup. Everything other than `Hit` means "rescan".
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(ScanRecord),
    Miss,
    /// A record exists but belongs to a different fingerprint or settings.
    Stale,
    Corrupt(String),
}

pub trait CacheBackend: Send + Sync {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Replace `name` atomically.
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError>;

    fn list(&self) -> Result<Vec<String>, CacheError>;

    fn clear(&self) -> Result<(), CacheError>;
}

/// One JSON file per entry under a directory, replaced by write-then-rename.
pub struct FsBackend {
    dir: PathBuf,
}

impl FsBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

impl CacheBackend for FsBackend {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        let path = self.entry_path(name);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        tmp.write_all(bytes).map_err(|e| CacheError::io(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| CacheError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| CacheError::io(&path, e.error))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, CacheError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(&self.dir, e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(&self.dir, e)),
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(name).cloned())
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn clear(&self) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub videos: usize,
    pub faces: usize,
    pub last_scan: Option<DateTime<Utc>>,
}

pub struct ScanCache {
    backend: Box<dyn CacheBackend>,
}

impl ScanCache {
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    pub fn on_disk(dir: impl Into<PathBuf>) -> Self {
        Self::new(Box::new(FsBackend::new(dir)))
    }

    /// Return the record for `fingerprint` only if the stored fingerprint and
    /// sampling interval both match exactly.
    pub fn load(&self, fingerprint: &Fingerprint, sample_interval: f64) -> Lookup {
        let bytes = match self.backend.read(&fingerprint.key()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                warn!(error = %e, "scan cache read failed");
                return Lookup::Corrupt(e.to_string());
            }
        };
        let record: ScanRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %fingerprint.key(), error = %e, "scan cache record is corrupt");
                return Lookup::Corrupt(e.to_string());
            }
        };
        if record.version != RECORD_VERSION
            || &record.video.fingerprint != fingerprint
            || record.sample_interval != sample_interval
        {
            debug!(key = %fingerprint.key(), "scan cache record is stale");
            return Lookup::Stale;
        }
        Lookup::Hit(record)
    }

    pub fn store(&self, record: &ScanRecord) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(record)?;
        self.backend.write(&record.video.fingerprint.key(), &bytes)
    }

    pub fn invalidate_all(&self) -> Result<(), CacheError> {
        self.backend.clear()
    }

    pub fn read_named(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.backend.read(name)
    }

    pub fn write_named(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
        self.backend.write(name, bytes)
    }

    /// Count readable records. Unreadable entries are skipped.
    pub fn summary(&self) -> CacheSummary {
        let names = self.backend.list().unwrap_or_default();
        let mut summary = CacheSummary::default();
        for name in names.iter().filter(|n| n.as_str() != SESSION_NAME) {
            let Ok(Some(bytes)) = self.backend.read(name) else {
                continue;
            };
            let Ok(record) = serde_json::from_slice::<ScanRecord>(&bytes) else {
                continue;
            };
            summary.videos += 1;
            summary.faces += record.face_count();
            summary.last_scan = summary.last_scan.max(Some(record.scanned_at));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detection::BoundingBox;
    use crate::core::video::VideoInfo;
    use tempfile::TempDir;

    fn fingerprint(size: u64, modified_secs: i64) -> Fingerprint {
        Fingerprint {
            size,
            modified_secs,
            modified_nanos: 0,
            digest: "abc".to_string(),
        }
    }

    fn record(fp: Fingerprint) -> ScanRecord {
        let video = VideoHandle::new(
            PathBuf::from("/videos/a.mp4"),
            fp,
            VideoInfo {
                duration: 3.0,
                width: 640,
                height: 480,
                frame_rate: 30.0,
                has_audio: true,
            },
        );
        let face = FaceRecord {
            detection: Detection {
                bbox: BoundingBox { x1: 0.1, y1: 0.2, x2: 0.4, y2: 0.6 },
                confidence: 0.87,
                landmarks: None,
                expression: 0.25,
                timestamp: 0.2,
            },
            embedding: Some(Embedding(vec![0.1, -0.3, 0.5])),
            person: Some(0),
        };
        ScanRecord::new(
            video,
            0.2,
            vec![
                FrameRecord { timestamp: 0.0, faces: vec![] },
                FrameRecord { timestamp: 0.2, faces: vec![face] },
            ],
            true,
        )
    }

    fn check_round_trip(cache: &ScanCache) {
        let fp = fingerprint(100, 1_700_000_000);
        let rec = record(fp.clone());
        cache.store(&rec).unwrap();
        assert_eq!(cache.load(&fp, 0.2), Lookup::Hit(rec));
    }

    #[test]
    fn test_round_trip_memory() {
        check_round_trip(&ScanCache::in_memory());
    }

    #[test]
    fn test_round_trip_disk() {
        let temp_dir = TempDir::new().unwrap();
        check_round_trip(&ScanCache::on_disk(temp_dir.path().join("cache")));
    }

    #[test]
    fn test_fingerprint_drift_is_miss() {
        let cache = ScanCache::in_memory();
        let fp = fingerprint(100, 1_700_000_000);
        cache.store(&record(fp.clone())).unwrap();

        assert_eq!(cache.load(&fingerprint(101, 1_700_000_000), 0.2), Lookup::Miss);
        assert_eq!(cache.load(&fingerprint(100, 1_700_000_001), 0.2), Lookup::Miss);
    }

    #[test]
    fn test_mismatched_content_under_key_is_stale() {
        let cache = ScanCache::in_memory();
        let fp = fingerprint(100, 5);
        let other = record(fingerprint(200, 5));
        cache
            .write_named(&fp.key(), &serde_json::to_vec(&other).unwrap())
            .unwrap();
        assert_eq!(cache.load(&fp, 0.2), Lookup::Stale);

        cache.store(&record(fp.clone())).unwrap();
        assert_eq!(cache.load(&fp, 0.5), Lookup::Stale);
    }

    #[test]
    fn test_corrupt_record_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("cache");
        let cache = ScanCache::on_disk(&dir);
        let fp = fingerprint(100, 5);
        cache.store(&record(fp.clone())).unwrap();

        fs::write(dir.join(format!("{}.json", fp.key())), b"{ truncated").unwrap();
        assert!(matches!(cache.load(&fp, 0.2), Lookup::Corrupt(_)));
    }

    #[test]
    fn test_deleted_directory_is_miss() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("cache");
        let cache = ScanCache::on_disk(&dir);
        let fp = fingerprint(100, 5);
        cache.store(&record(fp.clone())).unwrap();

        fs::remove_dir_all(&dir).unwrap();
        assert_eq!(cache.load(&fp, 0.2), Lookup::Miss);
        assert_eq!(cache.summary(), CacheSummary::default());

        cache.store(&record(fp.clone())).unwrap();
        assert!(matches!(cache.load(&fp, 0.2), Lookup::Hit(_)));
    }

    #[test]
    fn test_store_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("cache");
        let cache = ScanCache::on_disk(&dir);
        cache.store(&record(fingerprint(1, 1))).unwrap();
        cache.store(&record(fingerprint(1, 1))).unwrap();

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_invalidate_all_and_summary() {
        let cache = ScanCache::in_memory();
        cache.store(&record(fingerprint(1, 1))).unwrap();
        cache.store(&record(fingerprint(2, 1))).unwrap();
        cache.write_named(SESSION_NAME, b"{}").unwrap();

        let summary = cache.summary();
        assert_eq!(summary.videos, 2);
        assert_eq!(summary.faces, 2);
        assert!(summary.last_scan.is_some());

        cache.invalidate_all().unwrap();
        assert_eq!(cache.load(&fingerprint(1, 1), 0.2), Lookup::Miss);
        assert_eq!(cache.summary().videos, 0);
    }
}
