//! slidesync CLI entrypoint.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{debug, error, info};
use thiserror::Error;

use crate::config::{LogLevel, SlideSyncConfig};
use crate::features::DetectorParams;
use crate::io::encoder::{EncoderError, FfmpegEncoder};
use crate::io::footage::{FfmpegFootage, FootageError, FootageSource};
use crate::io::slides::{load_deck, SlideError};
use crate::loops::{GenLoop, LoopState, ProcessLoop, SyncError, SyncLoop};

/// slidesync command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "slidesync",
    version,
    about = "Synchronize presentation footage with its slide deck"
)]
struct CliArgs {
    /// Input recording of the presentation.
    #[arg(long, value_name = "FILE")]
    footage: PathBuf,
    /// Directory containing the rasterized slide images.
    #[arg(long, value_name = "DIR")]
    slides: PathBuf,
    /// Output synchronization file.
    #[arg(long, value_name = "FILE")]
    sync: PathBuf,
    /// Output synchronized video file.
    #[arg(long, value_name = "FILE")]
    output: PathBuf,
    /// Path to TOML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Log verbosity level.
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Footage(#[from] FootageError),
    #[error(transparent)]
    Slides(#[from] SlideError),
    #[error("failed to create intermediates directory {path}: {source}")]
    IntermediatesCreate {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("failed to write sync file {path}: {source}")]
    SyncWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::ConfigRead { .. }
            | CliError::ConfigParse { .. }
            | CliError::Footage(_)
            | CliError::Slides(_) => ExitCode::from(1),
            CliError::IntermediatesCreate { .. }
            | CliError::Sync(_)
            | CliError::SyncWrite { .. }
            | CliError::Encoder(_) => ExitCode::from(2),
        }
    }

    fn suggestion(&self) -> &'static str {
        match self {
            CliError::ConfigRead { .. } => "Verify the config path and file permissions.",
            CliError::ConfigParse { .. } => "Fix TOML syntax and ensure fields match the schema.",
            CliError::Footage(_) => "Provide a readable, rewindable video file for --footage.",
            CliError::Slides(_) => {
                "Point --slides at a directory of uniformly sized slide images."
            }
            CliError::IntermediatesCreate { .. } => {
                "Check write permissions next to the footage file."
            }
            CliError::Sync(SyncError::InitialAlignmentFailed) => {
                "Ensure the footage opens on the first slide of the deck."
            }
            CliError::Sync(_) => "Run with --log-level debug for per-frame diagnostics.",
            CliError::SyncWrite { .. } | CliError::Encoder(_) => {
                "Ensure the output locations are writable and have free space."
            }
        }
    }
}

pub fn run() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("slidesync: {err}");
            return err.exit_code();
        }
    };

    init_logger(&resolve_log_level(&cli, &config));

    match execute(&cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("slidesync: {err} ({})", err.suggestion());
            err.exit_code()
        }
    }
}

fn execute(cli: &CliArgs, config: &SlideSyncConfig) -> Result<(), CliError> {
    let intermediates = intermediates_dir(&cli.footage);
    fs::create_dir_all(&intermediates).map_err(|source| CliError::IntermediatesCreate {
        path: intermediates.clone(),
        source,
    })?;

    info!("reading footage '{}'", cli.footage.display());
    let mut footage = FfmpegFootage::open(&cli.footage)?;
    info!(
        "footage: {}x{} @ {:.2} fps, {} frames",
        footage.width(),
        footage.height(),
        footage.fps(),
        footage.frame_count()
    );

    info!("reading slides from '{}'", cli.slides.display());
    let slides = load_deck(&cli.slides, footage.width(), footage.height())?;
    info!(
        "deck: {} slides at {}x{}",
        slides.len(),
        slides[0].width,
        slides[0].height
    );

    let detector_params = DetectorParams {
        threshold: config.detector.fast_threshold,
        max_features: config.detector.max_features,
        ..DetectorParams::default()
    };

    let cache_path = intermediates.join("raw.sync");
    debug!("instruction cache at '{}'", cache_path.display());

    let mut tracker = SyncLoop::new(&mut footage, &slides, cache_path, detector_params)
        .on_finished(|| info!("synchronization loop finished"));
    loop {
        if tracker.tick()? == LoopState::Idle {
            break;
        }
    }
    let instructions = tracker.into_instructions();

    fs::write(&cli.sync, instructions.serialize()).map_err(|source| CliError::SyncWrite {
        path: cli.sync.clone(),
        source,
    })?;
    info!(
        "wrote {} instructions to '{}'",
        instructions.len(),
        cli.sync.display()
    );

    let framerate = instructions.framerate();
    let encoder = FfmpegEncoder::open(
        &cli.output,
        slides[0].width,
        slides[0].height,
        framerate,
    )?;

    let mut generator = GenLoop::new(&slides, &instructions, Box::new(encoder))?
        .on_finished(|| info!("generation loop finished"));
    loop {
        if generator.tick()? == LoopState::Idle {
            break;
        }
    }
    info!("wrote synchronized video to '{}'", cli.output.display());

    Ok(())
}

/// Intermediate results live next to the footage in `<footage>.d`.
fn intermediates_dir(footage: &Path) -> PathBuf {
    let mut name = OsString::from(footage.as_os_str());
    name.push(".d");
    PathBuf::from(name)
}

fn load_config(cli: &CliArgs) -> Result<SlideSyncConfig, CliError> {
    let Some(path) = &cli.config else {
        return Ok(SlideSyncConfig::default());
    };
    let content = fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| CliError::ConfigParse {
        path: path.clone(),
        source,
    })
}

/// Verbosity wins in order: `--log-level`, then `RUST_LOG`, then the config
/// file, then `info`.
fn resolve_log_level(cli: &CliArgs, config: &SlideSyncConfig) -> String {
    let environment = std::env::var("RUST_LOG")
        .ok()
        .filter(|filters| !filters.trim().is_empty());

    cli.log_level
        .map(|level| level.as_str().to_string())
        .or(environment)
        .or_else(|| config.log_level.map(|level| level.as_str().to_string()))
        .unwrap_or_else(|| "info".to_string())
}

fn init_logger(filters: &str) {
    // An elapsed-seconds prefix; the per-frame tracker trace reads better
    // against a stopwatch than against wall-clock timestamps.
    let started = std::time::Instant::now();

    let installed = env_logger::Builder::new()
        .target(env_logger::Target::Stderr)
        .filter_level(log::LevelFilter::Info)
        .parse_filters(filters)
        .format(move |buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{:8.3}s {:>5}] {}",
                started.elapsed().as_secs_f64(),
                record.level(),
                record.args()
            )
        })
        .try_init();

    if installed.is_err() {
        eprintln!("slidesync: logger was already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intermediates_dir_appends_suffix() {
        assert_eq!(
            intermediates_dir(Path::new("/tmp/talk.mp4")),
            PathBuf::from("/tmp/talk.mp4.d")
        );
        assert_eq!(
            intermediates_dir(Path::new("talk")),
            PathBuf::from("talk.d")
        );
    }
}
