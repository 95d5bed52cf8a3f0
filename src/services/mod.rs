pub mod analyzer;
pub mod ffmpeg;

pub use analyzer::CommandAnalyzer;
pub use ffmpeg::{FfmpegComposer, FfmpegFrameSource};
