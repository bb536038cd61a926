#![forbid(unsafe_code)]

//! One pipeline run: search for Creative-Commons shorts, download up to the
//! run cap, keep the vertical ones, republish them and record the source ids.
//!
//! Meant to be launched by `relay_scheduler` or any external timer. Exits
//! non-zero only on fatal problems (credentials, search, state files);
//! per-video failures are logged and skipped.

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use clap::Parser;
use shorts_relay::{
    auth::{HttpRefresher, access_token},
    config::{PipelineConfig, RuntimeOverrides, RuntimePaths, resolve_runtime_paths},
    logging::init_logging,
    pipeline::RunController,
    probe::{Ffprobe, PortraitValidator},
    retrieve::{FallbackRetriever, sweep_stale_artifacts},
    security::{RunLock, ensure_not_root},
    store::PublishedStore,
    youtube::{YouTubeClient, build_agent},
};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "relay_run", version, about = "Run the shorts relay pipeline once")]
struct RunArgs {
    /// Directory holding tokens, cookies, the published-id file and downloads
    #[arg(long)]
    state_root: Option<PathBuf>,

    /// Pipeline config (default: <state-root>/relay.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// `.env` file consulted for RELAY_STATE_ROOT
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// yt-dlp executable
    #[arg(long, default_value = "yt-dlp")]
    yt_dlp: PathBuf,

    /// ffprobe executable
    #[arg(long, default_value = "ffprobe")]
    ffprobe: PathBuf,

    /// Enable debug logging for this crate
    #[arg(short, long)]
    verbose: bool,
}

impl RunArgs {
    fn runtime_paths(&self) -> Result<RuntimePaths> {
        resolve_runtime_paths(RuntimeOverrides {
            state_root: self.state_root.clone(),
            env_path: self.env_file.clone(),
        })
    }
}

fn main() -> Result<()> {
    let args = RunArgs::parse();
    init_logging(args.verbose);
    ensure_not_root("relay_run")?;

    let paths = args.runtime_paths()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| paths.default_config_file());
    let config = PipelineConfig::load(&config_path)?;

    ensure_program_available(&args.yt_dlp)?;
    ensure_program_available(&args.ffprobe)?;

    paths.prepare()?;
    let _lock = RunLock::acquire(&paths.lock)?;

    println!();
    println!("=== Starting upload process at {} ===", Local::now().format("%Y-%m-%d %H:%M:%S"));
    info!(state_root = %paths.state_root.display(), "run started");

    sweep_stale_artifacts(&paths.downloads)?;

    let agent = build_agent();
    let token = access_token(
        &paths.token,
        &paths.state_root,
        &HttpRefresher::new(agent.clone()),
        Utc::now(),
    )
    .context("acquiring YouTube credentials")?;
    let client = YouTubeClient::new(agent, token);

    let store = PublishedStore::new(&paths.published);
    let retriever = FallbackRetriever::yt_dlp_chain(
        &args.yt_dlp,
        &paths.cookies,
        &config.browsers,
        config.retrieval_timeout(),
    );
    let validator = PortraitValidator::new(Ffprobe::new(&args.ffprobe), config.portrait_threshold);

    let controller = RunController::new(
        &config,
        &store,
        &paths.downloads,
        &client,
        &retriever,
        &validator,
        &client,
    );
    let result = controller.run()?;

    info!(
        successes = result.successes,
        quota_halted = result.quota_halted,
        stop = ?result.stop_reason,
        "run finished"
    );
    for publication in &result.published {
        println!(
            "  {} -> https://www.youtube.com/watch?v={}",
            publication.source_id, publication.published_id
        );
    }
    println!("=== Upload process completed. {} ===", result.summary());
    println!();
    Ok(())
}

/// Runs `<program> -version`/`--version` to fail loudly when a required
/// tool is missing.
fn ensure_program_available(program: &Path) -> Result<()> {
    let flag = match program.file_stem().and_then(|stem| stem.to_str()) {
        // ffmpeg tools only understand the single-dash form.
        Some(stem) if stem.starts_with("ff") => "-version",
        _ => "--version",
    };
    let status = Command::new(program)
        .arg(flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{} is installed but returned a failure status", program.display()),
        Err(err) => bail!("{} is not installed or not in PATH: {}", program.display(), err),
    }
}
