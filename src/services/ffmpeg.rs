//! Decode and compose collaborators backed by the `ffmpeg` and `ffprobe`
//! executables.

use crate::config::OutputSettings;
use crate::core::compose::{AudioSpec, ComposeError, ComposeRequest, Composer, TitleSpec};
use crate::core::sampler::{DecodeError, FrameSource, FrameStream};
use crate::core::selector::ClipWindow;
use crate::core::video::{VideoHandle, VideoInfo};
use image::RgbImage;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info};

/// Longest side of frames handed to the face analyzer.
const ANALYSIS_MAX_SIDE: u32 = 960;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<HashMap<String, serde_json::Value>>,
}

impl ProbeStream {
    fn rotation(&self) -> i64 {
        let from_tags = self.tags.get("rotate").and_then(|r| r.parse::<i64>().ok());
        let from_side_data = self
            .side_data_list
            .iter()
            .find_map(|d| d.get("rotation").and_then(serde_json::Value::as_i64));
        from_tags.or(from_side_data).unwrap_or(0).rem_euclid(360)
    }
}

/// Parse an ffmpeg rational such as `30000/1001`.
pub fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Interpret `ffprobe -print_format json -show_format -show_streams` output.
/// Width and height are reported as displayed, after rotation.
fn parse_probe(json: &str) -> Result<VideoInfo, String> {
    let probe: ProbeOutput = serde_json::from_str(json).map_err(|e| format!("unreadable ffprobe output: {}", e))?;
    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| "no video stream".to_string())?;

    let (mut width, mut height) = (video.width.unwrap_or(0), video.height.unwrap_or(0));
    if width == 0 || height == 0 {
        return Err("video stream has no dimensions".to_string());
    }
    if matches!(video.rotation(), 90 | 270) {
        std::mem::swap(&mut width, &mut height);
    }

    let duration = probe
        .format
        .duration
        .as_deref()
        .or(video.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| "unknown duration".to_string())?;

    let frame_rate = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(30.0);

    Ok(VideoInfo {
        duration,
        width,
        height,
        frame_rate,
        has_audio: probe.streams.iter().any(|s| s.codec_type == "audio"),
    })
}

/// Even-sized frame dimensions no larger than `max_side`, keeping aspect.
fn analysis_size(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height).max(1);
    let scale = (max_side as f64 / longest as f64).min(1.0);
    let even = |v: f64| ((v.round() as u32) / 2 * 2).max(2);
    (even(width as f64 * scale), even(height as f64 * scale))
}

fn probe_with(ffprobe: &Path, path: &Path) -> Result<VideoInfo, DecodeError> {
    let open_error = |reason: String| DecodeError::Open {
        path: path.display().to_string(),
        reason,
    };
    let output = Command::new(ffprobe)
        .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| open_error(format!("cannot run {}: {}", ffprobe.display(), e)))?;
    if !output.status.success() {
        return Err(open_error(last_line(&output.stderr)));
    }
    parse_probe(&String::from_utf8_lossy(&output.stdout)).map_err(open_error)
}

fn last_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("exited with an error")
        .trim()
        .to_string()
}

pub struct FfmpegFrameSource {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    max_side: u32,
}

impl FfmpegFrameSource {
    pub fn new() -> Self {
        Self::with_binaries(PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"))
    }

    pub fn with_binaries(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            max_side: ANALYSIS_MAX_SIDE,
        }
    }
}

impl Default for FfmpegFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for FfmpegFrameSource {
    fn probe(&self, path: &Path) -> Result<VideoInfo, DecodeError> {
        probe_with(&self.ffprobe, path)
    }

    fn open<'a>(&'a self, video: &VideoHandle, interval: f64) -> Result<FrameStream<'a>, DecodeError> {
        let path = video.path.display().to_string();
        let (width, height) = analysis_size(video.info.width, video.info.height, self.max_side);
        let filter = format!("fps={:.6},scale={}:{}", 1.0 / interval, width, height);

        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(&video.path)
            .args(["-vf", &filter, "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DecodeError::Open {
                path: path.clone(),
                reason: format!("cannot run {}: {}", self.ffmpeg.display(), e),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| DecodeError::Open {
            path: path.clone(),
            reason: "no stdout from ffmpeg".to_string(),
        })?;

        debug!(video = %path, width, height, interval, "decoding frames");
        Ok(Box::new(RawFrames {
            child,
            stdout,
            width,
            height,
            path,
            interval,
            index: 0,
            finished: false,
        }))
    }

    fn frame_at(&self, video: &VideoHandle, timestamp: f64) -> Result<RgbImage, DecodeError> {
        let read_error = |reason: String| DecodeError::Read {
            path: video.path.display().to_string(),
            timestamp,
            reason,
        };
        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-ss", &format!("{:.3}", timestamp), "-i"])
            .arg(&video.path)
            .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| read_error(format!("cannot run {}: {}", self.ffmpeg.display(), e)))?;
        if !output.status.success() || output.stdout.is_empty() {
            return Err(read_error(last_line(&output.stderr)));
        }
        image::load_from_memory(&output.stdout)
            .map(|img| img.to_rgb8())
            .map_err(|e| read_error(e.to_string()))
    }
}

/// Fixed-size RGB frames read from an ffmpeg rawvideo pipe.
struct RawFrames {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    path: String,
    interval: f64,
    index: usize,
    finished: bool,
}

impl RawFrames {
    fn read_error(&self, reason: String) -> DecodeError {
        DecodeError::Read {
            path: self.path.clone(),
            timestamp: self.index as f64 * self.interval,
            reason,
        }
    }
}

impl Iterator for RawFrames {
    type Item = Result<RgbImage, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut buffer = vec![0u8; self.width as usize * self.height as usize * 3];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.stdout.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(self.read_error(e.to_string())));
                }
            }
        }

        if filled == 0 {
            self.finished = true;
            return match self.child.wait() {
                Ok(status) if status.success() => None,
                Ok(status) => Some(Err(self.read_error(format!("ffmpeg exited with {}", status)))),
                Err(e) => Some(Err(self.read_error(e.to_string()))),
            };
        }
        if filled < buffer.len() {
            self.finished = true;
            return Some(Err(self.read_error("truncated frame".to_string())));
        }

        self.index += 1;
        RgbImage::from_raw(self.width, self.height, buffer)
            .map(Ok)
            .or_else(|| Some(Err(self.read_error("frame size mismatch".to_string()))))
    }
}

impl Drop for RawFrames {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

pub struct FfmpegComposer {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    preset: String,
}

impl FfmpegComposer {
    pub fn new() -> Self {
        Self::with_binaries(PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"))
    }

    pub fn with_binaries(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            preset: "medium".to_string(),
        }
    }

    fn run(&self, step: &'static str, path: &Path, command: &mut Command) -> Result<(), ComposeError> {
        debug!(step, ?command, "running ffmpeg");
        let output = command.stdin(Stdio::null()).output().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ComposeError::Unavailable(format!("{}: {}", self.ffmpeg.display(), e))
            } else {
                ComposeError::Io(e)
            }
        })?;
        if !output.status.success() {
            return Err(ComposeError::Step {
                step,
                path: path.display().to_string(),
                reason: last_line(&output.stderr),
            });
        }
        Ok(())
    }

    fn ffmpeg(&self) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command.args(["-y", "-v", "error", "-nostdin"]);
        command
    }

    fn encode_args(&self, format: &OutputSettings) -> Vec<String> {
        vec![
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            self.preset.clone(),
            "-b:v".into(),
            format.video_bitrate.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]
    }

    fn audio_args(format: &OutputSettings) -> Vec<String> {
        vec![
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            format.audio_bitrate.clone(),
            "-ar".into(),
            format.audio_sample_rate.to_string(),
            "-ac".into(),
            "2".into(),
        ]
    }

    /// Cut one window and normalize it to the output geometry. Clips without
    /// sound get a silent track so every part concatenates cleanly.
    fn cut_clip(&self, clip: &ClipWindow, format: &OutputSettings, out: &Path) -> Result<(), ComposeError> {
        let has_audio = probe_with(&self.ffprobe, &clip.video)
            .map(|info| info.has_audio)
            .unwrap_or(false);
        let duration = format!("{:.3}", clip.duration());
        let (w, h) = (format.width, format.height);
        let filter = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black,fps={},setsar=1",
            format.frame_rate
        );

        let mut command = self.ffmpeg();
        command
            .args(["-ss", &format!("{:.3}", clip.start), "-t", &duration, "-i"])
            .arg(&clip.video);
        if !has_audio {
            command.args([
                "-f",
                "lavfi",
                "-t",
                &duration,
                "-i",
                &format!("anullsrc=channel_layout=stereo:sample_rate={}", format.audio_sample_rate),
            ]);
        }
        command
            .args(["-vf", &filter, "-map", "0:v:0", "-map", if has_audio { "0:a:0" } else { "1:a:0" }])
            .args(self.encode_args(format))
            .args(Self::audio_args(format))
            .arg("-shortest")
            .arg(out);
        self.run("cut", &clip.video, &mut command)
    }

    fn concat(&self, parts: &[PathBuf], work_dir: &Path, out: &Path) -> Result<(), ComposeError> {
        let list = work_dir.join("concat.txt");
        fs::write(&list, concat_list(parts))?;
        let mut command = self.ffmpeg();
        command
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&list)
            .args(["-c", "copy"])
            .arg(out);
        self.run("concat", out, &mut command)
    }

    fn overlay_title(&self, title: &TitleSpec, format: &OutputSettings, input: &Path, out: &Path) -> Result<(), ComposeError> {
        let mut command = self.ffmpeg();
        command
            .arg("-i")
            .arg(input)
            .args(["-vf", &title_filter(title)])
            .args(self.encode_args(format))
            .args(["-c:a", "copy"])
            .arg(out);
        self.run("title", input, &mut command)
    }

    fn mix_audio(
        &self,
        audio: &AudioSpec,
        total: f64,
        format: &OutputSettings,
        input: &Path,
        out: &Path,
    ) -> Result<(), ComposeError> {
        let mut command = self.ffmpeg();
        command
            .arg("-i")
            .arg(input)
            .args(["-stream_loop", "-1", "-i"])
            .arg(&audio.path)
            .args(["-filter_complex", &audio_filter(audio, total, format.audio_sample_rate)])
            .args(["-map", "0:v", "-map", "[aout]", "-c:v", "copy"])
            .args(Self::audio_args(format))
            .arg(out);
        self.run("audio", &audio.path, &mut command)
    }
}

impl Default for FfmpegComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl Composer for FfmpegComposer {
    fn compose(&self, request: &ComposeRequest) -> Result<PathBuf, ComposeError> {
        if request.clips.is_empty() {
            return Err(ComposeError::NoClips);
        }
        let parent = match request.output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        // Same filesystem as the output so the final rename is atomic.
        let work = tempfile::Builder::new().prefix(".facereel-compose").tempdir_in(&parent)?;
        let format = &request.format;

        let mut parts = Vec::with_capacity(request.clips.len());
        for (i, clip) in request.clips.iter().enumerate() {
            let part = work.path().join(format!("clip_{:03}.mp4", i));
            self.cut_clip(clip, format, &part)?;
            parts.push(part);
        }

        let mut current = work.path().join("joined.mp4");
        self.concat(&parts, work.path(), &current)?;

        if let Some(title) = request.title.as_ref().filter(|t| !t.text.trim().is_empty()) {
            let titled = work.path().join("titled.mp4");
            self.overlay_title(title, format, &current, &titled)?;
            current = titled;
        }

        if let Some(audio) = &request.audio {
            let mixed = work.path().join("mixed.mp4");
            self.mix_audio(audio, request.total_duration(), format, &current, &mixed)?;
            current = mixed;
        }

        fs::rename(&current, &request.output)?;
        info!(output = %request.output.display(), clips = parts.len(), "highlight video written");
        Ok(request.output.clone())
    }
}

fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| format!("file '{}'\n", p.display().to_string().replace('\'', "'\\''")))
        .collect()
}

/// Escape text for use as a drawtext option value.
fn escape_drawtext(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '\'' | ':' | '%' | ',' | ';' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn title_filter(title: &TitleSpec) -> String {
    let lines = title.lines();
    let line_height = title.font_size as f64 * 1.5;
    let total_height = lines.len() as f64 * line_height;
    let color = title.text_color.trim_start_matches('#');
    let font = title
        .font_path
        .as_ref()
        .map(|p| format!(":fontfile={}", escape_drawtext(&p.display().to_string().replace('\\', "/"))))
        .unwrap_or_default();

    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            format!(
                "drawtext=text={}{}:fontsize={}:fontcolor=0x{}:x=(w-text_w)/2:y=(h-{})/2+{}:enable=lt(t\\,{}):shadowcolor=black:shadowx=2:shadowy=2",
                escape_drawtext(line),
                font,
                title.font_size,
                color,
                total_height,
                i as f64 * line_height,
                title.duration
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn audio_filter(audio: &AudioSpec, total: f64, sample_rate: u32) -> String {
    let fade = if audio.fade_out > 0.0 && total > audio.fade_out {
        format!(",afade=t=out:st={:.3}:d={:.3}", total - audio.fade_out, audio.fade_out)
    } else {
        String::new()
    };
    format!(
        "[1:a]asetpts=PTS-STARTPTS{},volume={}[bgm];[0:a][bgm]amix=inputs=2:duration=first:dropout_transition=0,aresample={}[aout]",
        fade, audio.volume, sample_rate
    )
}
