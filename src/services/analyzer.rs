//! Face detector and embedder running as an external process.
//!
//! The process is spoken to over stdin/stdout, one JSON object per line:
//!
//! ```text
//! > {"op":"detect","image":"/tmp/frame.png"}
//! < {"faces":[{"x":10,"y":20,"width":64,"height":80,"confidence":0.98,"landmarks":[[..],..]}]}
//! > {"op":"embed","image":"/tmp/face.png"}
//! < {"embedding":[0.01,-0.2,...]}
//! ```
//!
//! A reply carrying `"error"` fails that one request. Several processes are
//! kept so frames from different videos can be analyzed in parallel.

use crate::core::detection::{AnalyzerError, FaceAnalyzer, RawFace};
use image::{imageops, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request<'a> {
    Detect { image: &'a Path },
    Embed { image: &'a Path },
}

#[derive(Debug, Default, Deserialize)]
struct Response {
    #[serde(default)]
    faces: Vec<RawFace>,
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    error: Option<String>,
}

struct Worker {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl Worker {
    fn call(&mut self, request: &Request<'_>) -> Result<Response, AnalyzerError> {
        let line = serde_json::to_string(request).map_err(|e| AnalyzerError::Failed(e.to_string()))?;
        writeln!(self.stdin, "{}", line)
            .and_then(|_| self.stdin.flush())
            .map_err(|e| AnalyzerError::Failed(format!("write to analyzer: {}", e)))?;

        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .map_err(|e| AnalyzerError::Failed(format!("read from analyzer: {}", e)))?;
        if read == 0 {
            return Err(AnalyzerError::Failed("analyzer closed its output".to_string()));
        }
        let response: Response =
            serde_json::from_str(reply.trim()).map_err(|e| AnalyzerError::Failed(format!("bad analyzer reply: {}", e)))?;
        match response.error {
            Some(message) => Err(AnalyzerError::Failed(message)),
            None => Ok(response),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct CommandAnalyzer {
    program: PathBuf,
    args: Vec<String>,
    idle: Mutex<Vec<Worker>>,
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Parse a shell-like command line (whitespace separated, no quoting).
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts.map(str::to_string).collect()))
    }

    fn spawn(&self) -> Result<Worker, AnalyzerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::PermissionDenied {
                    AnalyzerError::Unavailable(format!("{}: {}", self.program.display(), e))
                } else {
                    AnalyzerError::Failed(e.to_string())
                }
            })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => {
                debug!(program = %self.program.display(), "started analyzer process");
                Ok(Worker {
                    child,
                    stdin: BufWriter::new(stdin),
                    stdout: BufReader::new(stdout),
                })
            }
            _ => Err(AnalyzerError::Unavailable("analyzer pipes unavailable".to_string())),
        }
    }

    /// Run one request on an idle worker, starting one if none is free.
    /// A worker that fails is discarded rather than reused.
    fn call(&self, request: &Request<'_>) -> Result<Response, AnalyzerError> {
        let idle = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let mut worker = match idle {
            Some(worker) => worker,
            None => self.spawn()?,
        };
        let result = worker.call(request);
        match &result {
            Ok(_) => {
                if let Ok(mut idle) = self.idle.lock() {
                    idle.push(worker);
                }
            }
            Err(e) => warn!(error = %e, "discarding analyzer process"),
        }
        result
    }

    fn with_png<T>(image: &RgbImage, f: impl FnOnce(&Path) -> Result<T, AnalyzerError>) -> Result<T, AnalyzerError> {
        let file = tempfile::Builder::new()
            .prefix("facereel-frame")
            .suffix(".png")
            .tempfile()
            .map_err(|e| AnalyzerError::Failed(e.to_string()))?;
        image
            .save_with_format(file.path(), ImageFormat::Png)
            .map_err(|e| AnalyzerError::Failed(e.to_string()))?;
        f(file.path())
    }
}

impl FaceAnalyzer for CommandAnalyzer {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<RawFace>, AnalyzerError> {
        Self::with_png(frame, |image| self.call(&Request::Detect { image }).map(|r| r.faces))
    }

    fn embed(&self, frame: &RgbImage, face: &RawFace) -> Result<Vec<f32>, AnalyzerError> {
        let crop = crop_face(frame, face).ok_or_else(|| AnalyzerError::Failed("face outside frame".to_string()))?;
        Self::with_png(&crop, |image| self.call(&Request::Embed { image }).map(|r| r.embedding))
    }
}

fn crop_face(frame: &RgbImage, face: &RawFace) -> Option<RgbImage> {
    let (fw, fh) = (frame.width() as f32, frame.height() as f32);
    let x1 = face.x.max(0.0).min(fw);
    let y1 = face.y.max(0.0).min(fh);
    let x2 = (face.x + face.width).max(0.0).min(fw);
    let y2 = (face.y + face.height).max(0.0).min(fh);
    let (w, h) = ((x2 - x1) as u32, (y2 - y1) as u32);
    if w == 0 || h == 0 {
        return None;
    }
    Some(imageops::crop_imm(frame, x1 as u32, y1 as u32, w, h).to_image())
}
