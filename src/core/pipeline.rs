//! Scan, select, extract and compose orchestration.
//!
//! [`Pipeline`] is an explicit state machine:
//!
//! ```text
//! Idle -> Scanning -> [AwaitingSelection] -> Extracting -> Composing -> Done
//! ```
//!
//! with `Failed` reachable from every state. Identity mode pauses in
//! `AwaitingSelection`; the paused state can be captured as a [`ScanSession`],
//! persisted, and resumed later by a different process.

use crate::config::Settings;
use crate::core::cache::{CacheError, CacheSummary, FaceRecord, FrameRecord, Lookup, ScanCache, ScanRecord, SESSION_NAME};
use crate::core::compose::{AudioSpec, ComposeError, ComposeRequest, Composer, TitleSpec};
use crate::core::detection::{analyze_frame, FaceAnalyzer, FrameAnalysis};
use crate::core::identity::{Clustering, EmbeddedFace, FaceIdentifier, FaceRef, IdentityError, IdentityFilter, Selection};
use crate::core::preview::PreviewRenderer;
use crate::core::sampler::{DecodeError, FrameSampler, FrameSource};
use crate::core::scoring::{FaceScorer, FrameScore};
use crate::core::selector::{ClipSelector, ClipWindow, SelectError};
use crate::core::video::{Fingerprint, VideoHandle};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Scan,
    Cluster,
    Select,
    Extract,
    Compose,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Scan => "scan",
            Stage::Cluster => "cluster",
            Stage::Select => "select",
            Stage::Extract => "extract",
            Stage::Compose => "compose",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Scanning,
    AwaitingSelection,
    Extracting,
    Composing,
    Done,
    Failed { stage: Stage, reason: String },
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Scanning => "scanning",
            PipelineState::AwaitingSelection => "awaiting-selection",
            PipelineState::Extracting => "extracting",
            PipelineState::Composing => "composing",
            PipelineState::Done => "done",
            PipelineState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("No face found in {path}")]
    NoFaceFound { path: String },

    #[error("Video has no playable duration: {path}")]
    EmptyVideo { path: String },

    #[error("Cached scan of {path} is corrupt: {reason}")]
    CacheCorrupt { path: String, reason: String },

    #[error("Unknown person id(s) {ids:?}; valid ids are {valid:?}")]
    UnknownPersonId { ids: Vec<u32>, valid: Vec<u32> },

    #[error("Invalid person selection '{0}'")]
    InvalidSelection(String),

    #[error("Composition failed: {0}")]
    ComposeFailure(#[from] ComposeError),

    #[error("No face embeddings were collected; nothing to cluster")]
    EmptyEmbeddingPool,

    #[error("Faces were found but none recurred often enough to form a person")]
    NoPersonsFound,

    #[error("No input videos")]
    NoInputVideos,

    #[error("No video produced a clip")]
    NoClips,

    #[error("Face analyzer unavailable: {0}")]
    AnalyzerUnavailable(String),

    #[error("Cannot {action} while {state}")]
    InvalidState { action: &'static str, state: &'static str },

    #[error("Saved session is out of date for: {paths:?}")]
    StaleSession { paths: Vec<PathBuf> },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl From<IdentityError> for PipelineError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::EmptyEmbeddingPool => PipelineError::EmptyEmbeddingPool,
            IdentityError::UnknownPersonId { ids, valid } => PipelineError::UnknownPersonId { ids, valid },
            IdentityError::InvalidSelection(s) => PipelineError::InvalidSelection(s),
        }
    }
}

impl From<SelectError> for PipelineError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoFaceFound { path } => PipelineError::NoFaceFound { path },
            SelectError::EmptyVideo { path } => PipelineError::EmptyVideo { path },
        }
    }
}

/// A video that was left out, with enough context to retry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFailure {
    pub path: PathBuf,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub video: String,
    pub completed: usize,
    pub total: usize,
    pub cached: bool,
    pub failed: bool,
}

pub type ProgressCallback = Box<dyn Fn(ScanProgress) + Send + Sync>;

#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub frames: &'a dyn FrameSource,
    pub analyzer: &'a dyn FaceAnalyzer,
    pub composer: &'a dyn Composer,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Ignore and clear every cached record.
    pub rescan: bool,
    /// Cluster faces and pause for a person selection.
    pub identity: bool,
    /// Where person previews are written in identity mode.
    pub preview_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSummary {
    pub videos: usize,
    pub cache_hits: usize,
    pub failures: usize,
    pub faces: usize,
    pub persons: Option<usize>,
}

/// Everything needed to resume a run paused for person selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSession {
    pub created_at: DateTime<Utc>,
    pub records: Vec<ScanRecord>,
    pub clustering: Clustering,
    pub failures: Vec<VideoFailure>,
}

impl ScanSession {
    /// True when the session was built from exactly these inputs.
    pub fn covers(&self, inputs: &[PathBuf]) -> bool {
        let known: HashSet<&Path> = self
            .records
            .iter()
            .map(|r| r.video.path.as_path())
            .chain(self.failures.iter().map(|f| f.path.as_path()))
            .collect();
        let wanted: HashSet<&Path> = inputs.iter().map(PathBuf::as_path).collect();
        known == wanted
    }

    /// Scanned videos whose file changed since the session was saved.
    pub fn stale_videos(&self) -> Vec<PathBuf> {
        self.records
            .iter()
            .filter(|r| {
                Fingerprint::compute(&r.video.path)
                    .map(|fp| fp != r.video.fingerprint)
                    .unwrap_or(true)
            })
            .map(|r| r.video.path.clone())
            .collect()
    }

    pub fn save(&self, cache: &ScanCache) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(self)?;
        cache.write_named(SESSION_NAME, &bytes)
    }

    /// Unreadable sessions are treated as absent.
    pub fn load(cache: &ScanCache) -> Option<Self> {
        let bytes = match cache.read_named(SESSION_NAME) {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(error = %e, "could not read saved session");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "saved session is corrupt");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub videos: usize,
    pub cache_hits: usize,
    pub persons: Option<usize>,
    pub selected: Option<BTreeSet<u32>>,
    pub clips: Vec<ClipWindow>,
    /// Videos where no selected person appeared and plain scoring was used.
    pub fallbacks: Vec<PathBuf>,
    pub failures: Vec<VideoFailure>,
    pub output: Option<PathBuf>,
}

/// A full non-interactive run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub inputs: Vec<PathBuf>,
    pub scan: ScanOptions,
    /// Used in identity mode; `None` selects everyone.
    pub selection: Option<Selection>,
    pub title: Option<TitleSpec>,
    pub audio: Option<AudioSpec>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheInfo {
    pub summary: CacheSummary,
    pub persons: Option<usize>,
    pub session_created: Option<DateTime<Utc>>,
}

pub fn cache_info(cache: &ScanCache) -> CacheInfo {
    let session = ScanSession::load(cache);
    CacheInfo {
        summary: cache.summary(),
        persons: session.as_ref().map(|s| s.clustering.clusters.len()),
        session_created: session.map(|s| s.created_at),
    }
}

/// Drop every cached record, the saved session and the previews.
pub fn clear_cache(cache: &ScanCache, preview_dir: &Path) -> Result<(), PipelineError> {
    cache.invalidate_all()?;
    match fs::remove_dir_all(preview_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

enum ScanOutcome {
    Cached(ScanRecord),
    /// Freshly analyzed; the flag is false when analyzer errors kept it out
    /// of the cache.
    Scanned(ScanRecord, bool),
    Failed(VideoFailure),
    Fatal(String),
    Skipped,
}

struct Extracted {
    window: ClipWindow,
    fallback: bool,
}

pub struct Pipeline<'a> {
    settings: Settings,
    frames: &'a dyn FrameSource,
    analyzer: &'a dyn FaceAnalyzer,
    composer: &'a dyn Composer,
    cache: ScanCache,
    progress: Option<ProgressCallback>,
    state: PipelineState,
    records: Vec<ScanRecord>,
    clustering: Option<Clustering>,
    filter: Option<IdentityFilter>,
    clips: Option<Vec<ClipWindow>>,
    fallbacks: Vec<PathBuf>,
    failures: Vec<VideoFailure>,
    /// Scanned videos whose records must not be written to the cache.
    uncacheable: HashSet<PathBuf>,
    cache_hits: usize,
    output: Option<PathBuf>,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: Settings, collaborators: Collaborators<'a>, cache: ScanCache) -> Self {
        Self {
            settings,
            frames: collaborators.frames,
            analyzer: collaborators.analyzer,
            composer: collaborators.composer,
            cache,
            progress: None,
            state: PipelineState::Idle,
            records: Vec::new(),
            clustering: None,
            filter: None,
            clips: None,
            fallbacks: Vec::new(),
            failures: Vec::new(),
            uncacheable: HashSet::new(),
            cache_hits: 0,
            output: None,
        }
    }

    /// Rebuild a pipeline paused in `AwaitingSelection` from a saved session.
    pub fn resume(
        settings: Settings,
        collaborators: Collaborators<'a>,
        cache: ScanCache,
        session: ScanSession,
    ) -> Result<Self, PipelineError> {
        let stale = session.stale_videos();
        if !stale.is_empty() {
            return Err(PipelineError::StaleSession { paths: stale });
        }
        let mut pipeline = Self::new(settings, collaborators, cache);
        info!(
            videos = session.records.len(),
            persons = session.clustering.clusters.len(),
            "resuming saved session"
        );
        pipeline.records = session.records;
        pipeline.clustering = Some(session.clustering);
        pipeline.failures = session.failures;
        pipeline.state = PipelineState::AwaitingSelection;
        Ok(pipeline)
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn cache(&self) -> &ScanCache {
        &self.cache
    }

    pub fn records(&self) -> &[ScanRecord] {
        &self.records
    }

    pub fn clustering(&self) -> Option<&Clustering> {
        self.clustering.as_ref()
    }

    pub fn failures(&self) -> &[VideoFailure] {
        &self.failures
    }

    /// Capture the paused state so selection can happen elsewhere.
    pub fn suspend(&self) -> Result<ScanSession, PipelineError> {
        self.expect_state(&PipelineState::AwaitingSelection, "suspend")?;
        let clustering = self.clustering.clone().ok_or(PipelineError::EmptyEmbeddingPool)?;
        Ok(ScanSession {
            created_at: Utc::now(),
            records: self.records.clone(),
            clustering,
            failures: self.failures.clone(),
        })
    }

    /// Scan every input, reusing cached records whose fingerprint still
    /// matches. In identity mode this also clusters faces, writes previews and
    /// leaves the pipeline in `AwaitingSelection`; otherwise in `Extracting`.
    pub fn scan(&mut self, inputs: &[PathBuf], options: &ScanOptions) -> Result<ScanSummary, PipelineError> {
        self.expect_state(&PipelineState::Idle, "scan")?;
        self.state = PipelineState::Scanning;
        info!(
            videos = inputs.len(),
            rescan = options.rescan,
            identity = options.identity,
            "scanning videos"
        );

        if inputs.is_empty() {
            return Err(self.fail(Stage::Scan, PipelineError::NoInputVideos));
        }
        if options.rescan {
            if let Err(e) = self.cache.invalidate_all() {
                warn!(error = %e, "could not clear scan cache");
            }
        }

        let pool = match self.worker_pool() {
            Ok(pool) => pool,
            Err(e) => return Err(self.fail(Stage::Scan, e)),
        };
        let abort = AtomicBool::new(false);
        let completed = AtomicUsize::new(0);
        let this = &*self;
        let outcomes: Vec<ScanOutcome> = pool.install(|| {
            inputs
                .par_iter()
                .map(|path| {
                    let outcome = this.scan_video(path, options.rescan, &abort);
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    this.report_progress(path, done, inputs.len(), &outcome);
                    outcome
                })
                .collect()
        });
        drop(pool);

        let mut records = Vec::with_capacity(outcomes.len());
        let mut fatal: Option<String> = None;
        for outcome in outcomes {
            match outcome {
                ScanOutcome::Cached(record) => {
                    self.cache_hits += 1;
                    records.push(record);
                }
                ScanOutcome::Scanned(record, cacheable) => {
                    if !cacheable {
                        self.uncacheable.insert(record.video.path.clone());
                    }
                    records.push(record);
                }
                ScanOutcome::Failed(failure) => {
                    warn!(video = %failure.path.display(), stage = %failure.stage, reason = %failure.reason, "skipping video");
                    self.failures.push(failure);
                }
                ScanOutcome::Fatal(reason) => {
                    fatal.get_or_insert(reason);
                }
                ScanOutcome::Skipped => {}
            }
        }
        if let Some(reason) = fatal {
            return Err(self.fail(Stage::Scan, PipelineError::AnalyzerUnavailable(reason)));
        }

        let mut summary = ScanSummary {
            videos: records.len(),
            cache_hits: self.cache_hits,
            failures: self.failures.len(),
            faces: records.iter().map(ScanRecord::face_count).sum(),
            persons: None,
        };
        info!(
            videos = summary.videos,
            cached = summary.cache_hits,
            failed = summary.failures,
            faces = summary.faces,
            "scan finished"
        );

        if options.identity {
            match self.identify(&mut records, options.preview_dir.as_deref()) {
                Ok(clustering) => {
                    summary.persons = Some(clustering.clusters.len());
                    self.clustering = Some(clustering);
                    self.records = records;
                    self.state = PipelineState::AwaitingSelection;
                }
                Err(e) => {
                    self.records = records;
                    return Err(self.fail(Stage::Cluster, e));
                }
            }
        } else {
            self.records = records;
            self.state = PipelineState::Extracting;
        }
        Ok(summary)
    }

    /// Resolve the operator's choice of people. Unknown ids fail the run
    /// before any extraction or compose work starts.
    pub fn select(&mut self, selection: &Selection) -> Result<BTreeSet<u32>, PipelineError> {
        self.expect_state(&PipelineState::AwaitingSelection, "select")?;
        let resolved = match self.clustering.as_ref() {
            Some(clustering) => selection
                .resolve(clustering)
                .map(|ids| IdentityFilter::new(clustering, ids, &self.settings.cluster)),
            None => Err(IdentityError::EmptyEmbeddingPool),
        };
        match resolved {
            Ok(filter) => {
                let ids = filter.selected().clone();
                info!(persons = ?ids, "persons selected");
                self.filter = Some(filter);
                self.state = PipelineState::Extracting;
                Ok(ids)
            }
            Err(e) => Err(self.fail(Stage::Select, e.into())),
        }
    }

    /// Pick one window per scanned video. Videos without a usable window
    /// are recorded as failures and left out.
    pub fn extract(&mut self) -> Result<Vec<ClipWindow>, PipelineError> {
        self.expect_state(&PipelineState::Extracting, "extract")?;
        if self.clips.is_some() {
            return Err(PipelineError::InvalidState {
                action: "extract twice",
                state: self.state.name(),
            });
        }

        let pool = match self.worker_pool() {
            Ok(pool) => pool,
            Err(e) => return Err(self.fail(Stage::Extract, e)),
        };
        let this = &*self;
        let outcomes: Vec<Result<Extracted, VideoFailure>> =
            pool.install(|| this.records.par_iter().map(|r| this.extract_video(r)).collect());
        drop(pool);

        let mut clips = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(extracted) => {
                    if extracted.fallback {
                        self.fallbacks.push(extracted.window.video.clone());
                    }
                    clips.push(extracted.window);
                }
                Err(failure) => {
                    info!(video = %failure.path.display(), reason = %failure.reason, "no clip for video");
                    self.failures.push(failure);
                }
            }
        }
        info!(clips = clips.len(), fallbacks = self.fallbacks.len(), "extraction finished");
        self.clips = Some(clips.clone());
        Ok(clips)
    }

    /// Hand the extracted windows to the composer. Produces one complete
    /// output or none.
    pub fn compose(
        &mut self,
        title: Option<TitleSpec>,
        audio: Option<AudioSpec>,
        output: PathBuf,
    ) -> Result<PathBuf, PipelineError> {
        self.expect_state(&PipelineState::Extracting, "compose")?;
        let Some(clips) = self.clips.clone() else {
            return Err(PipelineError::InvalidState {
                action: "compose before extract",
                state: self.state.name(),
            });
        };
        self.state = PipelineState::Composing;
        if clips.is_empty() {
            return Err(self.fail(Stage::Compose, PipelineError::NoClips));
        }

        let request = ComposeRequest {
            clips,
            title,
            audio,
            format: self.settings.output.clone(),
            output,
        };
        info!(
            clips = request.clips.len(),
            seconds = request.total_duration(),
            output = %request.output.display(),
            "composing highlight video"
        );
        match self.composer.compose(&request) {
            Ok(path) => {
                self.output = Some(path.clone());
                self.state = PipelineState::Done;
                Ok(path)
            }
            Err(e) => Err(self.fail(Stage::Compose, e.into())),
        }
    }

    /// Drive every phase without pausing.
    pub fn run(&mut self, request: RunRequest) -> Result<RunReport, PipelineError> {
        self.scan(&request.inputs, &request.scan)?;
        if self.state == PipelineState::AwaitingSelection {
            self.select(&request.selection.unwrap_or(Selection::All))?;
        }
        self.extract()?;
        self.compose(request.title, request.audio, request.output)?;
        Ok(self.report())
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            videos: self.records.len(),
            cache_hits: self.cache_hits,
            persons: self.clustering.as_ref().map(|c| c.clusters.len()),
            selected: self.filter.as_ref().map(|f| f.selected().clone()),
            clips: self.clips.clone().unwrap_or_default(),
            fallbacks: self.fallbacks.clone(),
            failures: self.failures.clone(),
            output: self.output.clone(),
        }
    }

    /// Workers live only for the duration of one parallel phase, so a
    /// pipeline paused for selection holds no threads.
    fn worker_pool(&self) -> Result<rayon::ThreadPool, PipelineError> {
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.worker_count())
            .thread_name(|i| format!("facereel-worker-{}", i))
            .build()?)
    }

    fn expect_state(&self, expected: &PipelineState, action: &'static str) -> Result<(), PipelineError> {
        if &self.state == expected {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                action,
                state: self.state.name(),
            })
        }
    }

    fn fail(&mut self, stage: Stage, err: PipelineError) -> PipelineError {
        error!(stage = %stage, error = %err, "pipeline failed");
        self.state = PipelineState::Failed {
            stage,
            reason: err.to_string(),
        };
        err
    }

    fn report_progress(&self, path: &Path, completed: usize, total: usize, outcome: &ScanOutcome) {
        if let Some(callback) = &self.progress {
            callback(ScanProgress {
                video: path.file_name().unwrap_or_default().to_string_lossy().into_owned(),
                completed,
                total,
                cached: matches!(outcome, ScanOutcome::Cached(_)),
                failed: matches!(outcome, ScanOutcome::Failed(_) | ScanOutcome::Fatal(_)),
            });
        }
    }

    fn scan_video(&self, path: &Path, rescan: bool, abort: &AtomicBool) -> ScanOutcome {
        if abort.load(Ordering::Relaxed) {
            return ScanOutcome::Skipped;
        }
        let failure = |reason: String| {
            ScanOutcome::Failed(VideoFailure {
                path: path.to_path_buf(),
                stage: Stage::Scan,
                reason,
            })
        };

        let fingerprint = match Fingerprint::compute(path) {
            Ok(fp) => fp,
            Err(e) => return failure(e.to_string()),
        };
        let interval = self.settings.sample_interval;

        if !rescan {
            match self.cache.load(&fingerprint, interval) {
                Lookup::Hit(mut record) => {
                    debug!(video = %path.display(), "scan cache hit");
                    record.video.path = path.to_path_buf();
                    return ScanOutcome::Cached(record);
                }
                Lookup::Corrupt(reason) => {
                    let err = PipelineError::CacheCorrupt {
                        path: path.display().to_string(),
                        reason,
                    };
                    warn!(error = %err, "rescanning video");
                }
                Lookup::Stale | Lookup::Miss => {}
            }
        }

        let info = match self.frames.probe(path) {
            Ok(info) => info,
            Err(e) => return failure(e.to_string()),
        };
        let video = VideoHandle::new(path.to_path_buf(), fingerprint, info);
        let sampler = FrameSampler::new(self.frames, &video, interval);
        let sampled = match sampler.frames() {
            Ok(frames) => frames,
            Err(e) => return failure(e.to_string()),
        };

        let mut frames = Vec::new();
        let mut complete = true;
        let (mut detect_failures, mut analyzer_clean) = (0usize, true);
        for frame in sampled {
            match frame {
                Ok(frame) => match analyze_frame(self.analyzer, &frame.image, frame.timestamp) {
                    Ok(analysis) => {
                        analyzer_clean &= analysis.is_complete();
                        detect_failures += usize::from(analysis.detect_failed);
                        frames.push(frame_record(frame.timestamp, analysis));
                    }
                    Err(e) => {
                        abort.store(true, Ordering::Relaxed);
                        return ScanOutcome::Fatal(e.to_string());
                    }
                },
                Err(e) => {
                    warn!(video = %path.display(), kept = frames.len(), error = %e, "decoding stopped early");
                    complete = false;
                }
            }
        }
        if frames.is_empty() && !complete {
            return failure(format!("no frame of {} could be decoded", path.display()));
        }
        if !frames.is_empty() && detect_failures == frames.len() {
            return failure(format!("face detection failed on all {} frames", frames.len()));
        }

        let record = ScanRecord::new(video, interval, frames, complete);
        if analyzer_clean {
            if let Err(e) = self.cache.store(&record) {
                warn!(video = %path.display(), error = %e, "could not cache scan");
            }
        } else {
            warn!(
                video = %path.display(),
                failed_frames = detect_failures,
                "analyzer errors during scan; result not cached"
            );
        }
        debug!(video = %path.display(), frames = record.frames.len(), faces = record.face_count(), "scanned video");
        ScanOutcome::Scanned(record, analyzer_clean)
    }

    fn identify(&self, records: &mut [ScanRecord], preview_dir: Option<&Path>) -> Result<Clustering, PipelineError> {
        let clustering = {
            let faces: Vec<EmbeddedFace<'_>> = records
                .iter()
                .flat_map(|record| {
                    record.frames.iter().enumerate().flat_map(move |(fi, frame)| {
                        frame.faces.iter().enumerate().filter_map(move |(xi, face)| {
                            face.embedding.as_ref().map(|embedding| EmbeddedFace {
                                face_ref: FaceRef {
                                    video: record.video.path.clone(),
                                    frame: fi,
                                    face: xi,
                                },
                                detection: &face.detection,
                                embedding,
                            })
                        })
                    })
                })
                .collect();
            FaceIdentifier::new(self.settings.cluster.clone()).cluster(faces)?
        };
        if clustering.clusters.is_empty() {
            return Err(PipelineError::NoPersonsFound);
        }

        for record in records.iter_mut() {
            let video = record.video.path.clone();
            for (fi, frame) in record.frames.iter_mut().enumerate() {
                for (xi, face) in frame.faces.iter_mut().enumerate() {
                    let face_ref = FaceRef {
                        video: video.clone(),
                        frame: fi,
                        face: xi,
                    };
                    face.person = clustering.assignments.get(&face_ref).copied();
                }
            }
            if self.uncacheable.contains(&video) {
                continue;
            }
            if let Err(e) = self.cache.store(record) {
                warn!(video = %video.display(), error = %e, "could not cache person assignments");
            }
        }

        for cluster in &clustering.clusters {
            info!(
                person = cluster.id,
                faces = cluster.face_count(),
                videos = cluster.videos.len(),
                "person found"
            );
        }

        if let Some(dir) = preview_dir {
            let videos: Vec<VideoHandle> = records.iter().map(|r| r.video.clone()).collect();
            let renderer = PreviewRenderer::new(self.settings.preview_size);
            match renderer.render_all(self.frames, &videos, &clustering.clusters, dir) {
                Ok(written) => debug!(count = written.len(), dir = %dir.display(), "previews written"),
                Err(e) => warn!(error = %e, "could not write previews"),
            }
        }
        Ok(clustering)
    }

    fn extract_video(&self, record: &ScanRecord) -> Result<Extracted, VideoFailure> {
        let scorer = FaceScorer::new(self.settings.weights, self.settings.size_gain);
        let selector = ClipSelector::new(self.settings.clip_duration);

        let scores: Vec<FrameScore> = record
            .frames
            .iter()
            .map(|f| scorer.score(f.timestamp, &f.detections()))
            .collect();

        let mut fallback = false;
        let scores = match &self.filter {
            Some(filter) => {
                let restricted = restrict_to_selected(filter, record, &scores);
                if restricted.iter().any(|s| s.score > 0.0) {
                    restricted
                } else {
                    fallback = record.has_faces();
                    if fallback {
                        debug!(video = %record.video.path.display(), "no selected person; using plain scoring");
                    }
                    scores
                }
            }
            None => scores,
        };

        selector
            .select(&record.video, &scores)
            .map(|window| Extracted { window, fallback })
            .map_err(|e| VideoFailure {
                path: record.video.path.clone(),
                stage: Stage::Extract,
                reason: PipelineError::from(e).to_string(),
            })
    }
}

fn frame_record(timestamp: f64, analysis: FrameAnalysis) -> FrameRecord {
    FrameRecord {
        timestamp,
        faces: analysis
            .faces
            .into_iter()
            .map(|(detection, embedding)| FaceRecord {
                detection,
                embedding,
                person: None,
            })
            .collect(),
    }
}

/// Zero every frame whose dominant face is not one of the selected people.
fn restrict_to_selected(filter: &IdentityFilter, record: &ScanRecord, scores: &[FrameScore]) -> Vec<FrameScore> {
    record
        .frames
        .iter()
        .zip(scores)
        .map(|(frame, score)| {
            let detections = frame.detections();
            let keep = FaceScorer::dominant_index(&detections)
                .map(|i| &frame.faces[i])
                .is_some_and(|face| filter.matches(face.person, face.embedding.as_ref()));
            if keep {
                score.clone()
            } else {
                FrameScore::empty(score.timestamp)
            }
        })
        .collect()
}
