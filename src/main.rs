use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use dialoguer::MultiSelect;
use facereel::config::Settings;
use facereel::core::cache::ScanCache;
use facereel::core::compose::{AudioSpec, TitleSpec, find_background_music, output_file_name};
use facereel::core::identity::{Clustering, Selection};
use facereel::core::pipeline::{
    Collaborators, Pipeline, PipelineError, PipelineState, ProgressCallback, RunReport, ScanOptions, ScanSession,
    cache_info, clear_cache,
};
use facereel::core::video::discover_videos;
use facereel::services::{CommandAnalyzer, FfmpegComposer, FfmpegFrameSource};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "facereel", version, about = "Build a highlight video from the best face moments of each clip")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan videos, group faces into people and write previews
    Scan {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Scan, select and compose the highlight video
    Make {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        make: MakeArgs,
    },

    /// Inspect or clear the scan cache
    Cache {
        #[command(subcommand)]
        command: CacheCmd,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Folder containing the source videos
    #[arg(short, long, value_name = "DIR")]
    input: PathBuf,
    /// Output folder (default: the input folder)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Settings file (default: <config dir>/facereel/config.json)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Ignore cached scans and analyze every video again
    #[arg(long)]
    rescan: bool,
    /// Face analyzer command line
    #[arg(long, value_name = "CMD", default_value = "facereel-analyzer")]
    analyzer: String,
    /// Seconds between sampled frames
    #[arg(long, value_name = "SECONDS")]
    sample_interval: Option<f64>,
    /// Worker threads (default: available parallelism)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct MakeArgs {
    /// Background music file
    #[arg(short, long, value_name = "FILE")]
    audio: Option<PathBuf>,
    /// Folder searched for background music when --audio is not given
    #[arg(long, value_name = "DIR")]
    bgm_dir: Option<PathBuf>,
    /// Title text shown at the start (`\n` for a line break)
    #[arg(short, long)]
    title: Option<String>,
    /// Seconds the title stays on screen
    #[arg(long, value_name = "SECONDS")]
    title_duration: Option<f64>,
    #[arg(long, value_name = "PX")]
    title_font_size: Option<u32>,
    /// Title colour such as #FFFFFF
    #[arg(long, value_name = "COLOR")]
    title_text_color: Option<String>,
    #[arg(long, value_name = "FILE")]
    font: Option<PathBuf>,
    /// Seconds taken from each video
    #[arg(short = 'd', long, value_name = "SECONDS")]
    clip_duration: Option<f64>,
    /// Only use moments featuring selected people
    #[arg(long)]
    select_faces: bool,
    /// People to feature, e.g. `0,2` or `all` (implies --select-faces)
    #[arg(long, value_name = "IDS")]
    face_ids: Option<String>,
}

#[derive(Subcommand, Debug)]
enum CacheCmd {
    /// Show what is cached for an output folder
    Info {
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Delete cached scans, the saved session and previews
    Clear {
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { common } => scan(common),
        Commands::Make { common, make } => make_video(common, make),
        Commands::Cache { command } => match command {
            CacheCmd::Info { output, config } => {
                let settings = Settings::load(config.as_deref())?;
                let cache = ScanCache::on_disk(output.join(&settings.cache_dir));
                let info = cache_info(&cache);
                if info.summary.videos == 0 && info.persons.is_none() {
                    println!("No cached scans in {}", output.display());
                    return Ok(());
                }
                println!("🗂️  Scan cache for {}:", output.display());
                println!("   videos: {}", info.summary.videos);
                println!("   faces:  {}", info.summary.faces);
                if let Some(persons) = info.persons {
                    println!("   people: {}", persons);
                }
                if let Some(when) = info.summary.last_scan {
                    println!("   last scan: {}", when.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
                }
                Ok(())
            }
            CacheCmd::Clear { output, config } => {
                let settings = Settings::load(config.as_deref())?;
                let cache = ScanCache::on_disk(output.join(&settings.cache_dir));
                clear_cache(&cache, &output.join(&settings.preview_dir))?;
                println!("🧹 Cleared scan cache and previews in {}", output.display());
                Ok(())
            }
        },
    }
}

/// Everything a command needs once arguments are resolved.
struct Workspace {
    settings: Settings,
    inputs: Vec<PathBuf>,
    output_dir: PathBuf,
    preview_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Workspace {
    fn prepare(common: &CommonArgs, make: Option<&MakeArgs>) -> Result<Self> {
        let mut settings = Settings::load(common.config.as_deref())?;
        if let Some(v) = common.sample_interval {
            settings.sample_interval = v;
        }
        if let Some(v) = common.workers {
            settings.workers = v;
        }
        if let Some(make) = make {
            if let Some(v) = make.clip_duration {
                settings.clip_duration = v;
            }
            if let Some(v) = make.title_duration {
                settings.title.duration = v;
            }
            if let Some(v) = make.title_font_size {
                settings.title.font_size = v;
            }
            if let Some(v) = &make.title_text_color {
                settings.title.text_color = v.clone();
            }
            if let Some(v) = &make.font {
                settings.title.font_path = Some(v.clone());
            }
            if let Some(v) = &make.bgm_dir {
                settings.audio.bgm_dir = Some(v.clone());
            }
        }
        settings.validate()?;

        let inputs = discover_videos(&common.input)
            .with_context(|| format!("Failed to list videos in {}", common.input.display()))?;
        if inputs.is_empty() {
            anyhow::bail!("No .mp4, .mov or .avi files in {}", common.input.display());
        }

        let output_dir = common.output.clone().unwrap_or_else(|| common.input.clone());
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

        Ok(Self {
            preview_dir: output_dir.join(&settings.preview_dir),
            cache_dir: output_dir.join(&settings.cache_dir),
            settings,
            inputs,
            output_dir,
        })
    }

    fn cache(&self) -> ScanCache {
        ScanCache::on_disk(&self.cache_dir)
    }

    fn scan_options(&self, rescan: bool, identity: bool) -> ScanOptions {
        ScanOptions {
            rescan,
            identity,
            preview_dir: identity.then(|| self.preview_dir.clone()),
        }
    }
}

fn progress_bar(total: usize) -> Result<(ProgressBar, ProgressCallback)> {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(ProgressStyle::with_template("{spinner:.green} [{bar:30}] {pos}/{len} {msg}")?);
    let handle = bar.clone();
    let callback: ProgressCallback = Box::new(move |p| {
        let note = if p.failed {
            " (failed)"
        } else if p.cached {
            " (cached)"
        } else {
            ""
        };
        handle.set_message(format!("{}{}", p.video, note));
        handle.inc(1);
    });
    Ok((bar, callback))
}

fn scan(common: CommonArgs) -> Result<()> {
    let ws = Workspace::prepare(&common, None)?;
    let analyzer = CommandAnalyzer::from_command_line(&common.analyzer).context("Empty --analyzer command")?;
    let (frames, composer) = (FfmpegFrameSource::new(), FfmpegComposer::new());
    let collaborators = Collaborators {
        frames: &frames,
        analyzer: &analyzer,
        composer: &composer,
    };

    println!("▶ Scanning {} video(s) in {}", ws.inputs.len(), common.input.display());
    let started = Instant::now();
    let (bar, callback) = progress_bar(ws.inputs.len())?;
    let mut pipeline = Pipeline::new(ws.settings.clone(), collaborators, ws.cache()).with_progress(callback);
    let summary = pipeline.scan(&ws.inputs, &ws.scan_options(common.rescan, true));
    bar.finish_and_clear();
    let summary = summary?;

    let session = pipeline.suspend()?;
    session.save(pipeline.cache()).context("Failed to save scan session")?;

    println!(
        "✅ Scanned {} video(s) ({} cached, {} failed) in {:.2?}",
        summary.videos,
        summary.cache_hits,
        summary.failures,
        started.elapsed()
    );
    print_people(&session.clustering, &ws.preview_dir);
    print_failures(pipeline.failures());
    println!("\nRun `facereel make --face-ids <IDS>` to build the video.");
    Ok(())
}

fn make_video(common: CommonArgs, make: MakeArgs) -> Result<()> {
    let ws = Workspace::prepare(&common, Some(&make))?;
    let identity = make.select_faces || make.face_ids.is_some();
    let selection = make
        .face_ids
        .as_deref()
        .map(str::parse::<Selection>)
        .transpose()
        .context("Invalid --face-ids")?;

    let analyzer = CommandAnalyzer::from_command_line(&common.analyzer).context("Empty --analyzer command")?;
    let (frames, composer) = (FfmpegFrameSource::new(), FfmpegComposer::new());
    let collaborators = Collaborators {
        frames: &frames,
        analyzer: &analyzer,
        composer: &composer,
    };

    let info = cache_info(&ws.cache());
    if !common.rescan && info.summary.videos > 0 {
        println!("🗂️  Reusing cached scans of {} video(s)", info.summary.videos);
    }

    let started = Instant::now();
    let mut pipeline = match resume_session(&ws, collaborators, identity && !common.rescan)? {
        Some(pipeline) => {
            println!("▶ Resuming saved scan of {} video(s)", pipeline.records().len());
            pipeline
        }
        None => {
            println!("▶ Scanning {} video(s) in {}", ws.inputs.len(), common.input.display());
            let (bar, callback) = progress_bar(ws.inputs.len())?;
            let mut pipeline = Pipeline::new(ws.settings.clone(), collaborators, ws.cache()).with_progress(callback);
            let summary = pipeline.scan(&ws.inputs, &ws.scan_options(common.rescan, identity));
            bar.finish_and_clear();
            let summary = summary?;
            println!(
                "✅ Scanned {} video(s) ({} cached, {} failed)",
                summary.videos, summary.cache_hits, summary.failures
            );
            if identity {
                pipeline.suspend()?.save(pipeline.cache()).context("Failed to save scan session")?;
            }
            pipeline
        }
    };

    if pipeline.state() == &PipelineState::AwaitingSelection {
        let clustering = pipeline.clustering().cloned().unwrap_or_default();
        let selection = match selection {
            Some(selection) => selection,
            None => prompt_selection(&clustering, &ws.preview_dir)?,
        };
        let ids = pipeline.select(&selection)?;
        println!("👤 Featuring {}", format_ids(&ids));
    }

    let clips = pipeline.extract()?;
    println!("🎬 Selected {} clip(s)", clips.len());

    let title = make
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(|t| TitleSpec::new(t, &ws.settings.title));
    let audio = resolve_audio(&make, &ws.settings).map(|path| {
        println!("🎵 Background music: {}", path.display());
        AudioSpec::new(path, &ws.settings.audio)
    });
    let output = ws.output_dir.join(output_file_name(Local::now().date_naive()));

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Composing highlight video…");
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));
    let composed = pipeline.compose(title, audio, output);
    spinner.finish_and_clear();
    composed?;

    print_report(&pipeline.report());
    println!("⏱ Finished in {:.2?}", started.elapsed());
    Ok(())
}

/// Pick up the session saved by `facereel scan` when it still matches the
/// inputs on disk.
fn resume_session<'a>(ws: &Workspace, collaborators: Collaborators<'a>, allowed: bool) -> Result<Option<Pipeline<'a>>> {
    if !allowed {
        return Ok(None);
    }
    let Some(session) = ScanSession::load(&ws.cache()) else {
        return Ok(None);
    };
    if !session.covers(&ws.inputs) {
        return Ok(None);
    }
    match Pipeline::resume(ws.settings.clone(), collaborators, ws.cache(), session) {
        Ok(pipeline) => Ok(Some(pipeline)),
        Err(PipelineError::StaleSession { paths }) => {
            warn!(changed = paths.len(), "saved session is out of date; rescanning");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn resolve_audio(make: &MakeArgs, settings: &Settings) -> Option<PathBuf> {
    if let Some(path) = &make.audio {
        if path.is_file() {
            return Some(path.clone());
        }
        eprintln!("⚠️  Audio file {} not found; continuing without it", path.display());
    }
    settings.audio.bgm_dir.as_deref().and_then(find_background_music)
}

fn prompt_selection(clustering: &Clustering, preview_dir: &Path) -> Result<Selection> {
    print_people(clustering, preview_dir);
    let items: Vec<String> = clustering
        .clusters
        .iter()
        .map(|c| format!("person_{}: {} faces in {} videos", c.id, c.face_count(), c.videos.len()))
        .collect();
    let chosen = MultiSelect::new()
        .with_prompt("Select people to feature (space toggles, enter confirms, none selects all)")
        .items(&items)
        .interact()?;
    if chosen.is_empty() {
        return Ok(Selection::All);
    }
    Ok(Selection::Ids(chosen.into_iter().map(|i| clustering.clusters[i].id).collect()))
}

fn print_people(clustering: &Clustering, preview_dir: &Path) {
    println!("👥 Found {} person(s); previews in {}", clustering.clusters.len(), preview_dir.display());
    for c in &clustering.clusters {
        println!(
            "   person_{}: {} faces in {} video(s)",
            c.id,
            c.face_count(),
            c.videos.len()
        );
    }
}

fn print_failures(failures: &[facereel::core::pipeline::VideoFailure]) {
    if failures.is_empty() {
        return;
    }
    println!("⚠️  Skipped {} video(s):", failures.len());
    for f in failures {
        println!("   {} [{}] {}", f.path.display(), f.stage, f.reason);
    }
}

fn print_report(report: &RunReport) {
    println!("\n✨ Highlight video:");
    for clip in &report.clips {
        let name = clip.video.file_name().unwrap_or_default().to_string_lossy();
        println!("   {} {:.2}s → {:.2}s", name, clip.start, clip.end);
    }
    if !report.fallbacks.is_empty() {
        println!("   ({} video(s) had none of the selected people and used any face)", report.fallbacks.len());
    }
    print_failures(&report.failures);
    if let Some(output) = &report.output {
        println!("\n✅ Wrote {}", output.display());
    }
}

fn format_ids(ids: &std::collections::BTreeSet<u32>) -> String {
    ids.iter()
        .map(|id| format!("person_{}", id))
        .collect::<Vec<_>>()
        .join(", ")
}
