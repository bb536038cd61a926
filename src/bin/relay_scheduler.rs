#![forbid(unsafe_code)]

//! Long-running helper that launches `relay_run` at fixed local times of day
//! (09:00 and 21:00 unless `schedule` in relay.toml says otherwise). Acts
//! like a twice-daily cron entry for hosts without one.

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDateTime, NaiveTime};
use clap::Parser;
use shorts_relay::{
    config::{PipelineConfig, RuntimeOverrides, resolve_runtime_paths},
    logging::init_logging,
    security::ensure_not_root,
};
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
#[cfg(test)]
use std::sync::Mutex;
use std::thread;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "relay_scheduler",
    version,
    about = "Launch relay_run at the configured times of day"
)]
struct SchedulerArgs {
    /// Forwarded to relay_run
    #[arg(long)]
    state_root: Option<PathBuf>,

    /// Forwarded to relay_run; also read here for `schedule`
    #[arg(long)]
    config: Option<PathBuf>,

    /// Forwarded to relay_run
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Run once immediately before waiting for the first slot
    #[arg(long)]
    now: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl SchedulerArgs {
    /// Arguments handed to every `relay_run` launch.
    fn forwarded(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(root) = &self.state_root {
            args.push("--state-root".to_string());
            args.push(root.to_string_lossy().into_owned());
        }
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.to_string_lossy().into_owned());
        }
        if let Some(env_file) = &self.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.to_string_lossy().into_owned());
        }
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args
    }
}

fn main() -> Result<()> {
    let args = SchedulerArgs::parse();
    init_logging(args.verbose);
    ensure_not_root("relay_scheduler")?;

    let paths = resolve_runtime_paths(RuntimeOverrides {
        state_root: args.state_root.clone(),
        env_path: args.env_file.clone(),
    })?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| paths.default_config_file());
    let times = PipelineConfig::load(&config_path)?.schedule_times()?;
    if times.is_empty() {
        bail!("no schedule times configured in {}", config_path.display());
    }

    let runner = find_relay_run_executable()?;
    let forwarded = args.forwarded();
    let labels: Vec<String> = times.iter().map(|time| time.format("%H:%M").to_string()).collect();
    info!(times = %labels.join(", "), "scheduler started");

    if args.now {
        launch(&runner, &forwarded);
    }

    loop {
        let now = Local::now().naive_local();
        let next = next_slot(now, &times);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next = %next.format("%Y-%m-%d %H:%M"), "waiting for next run");
        thread::sleep(wait);
        launch(&runner, &forwarded);
    }
}

/// First configured time strictly after `now`, rolling over to tomorrow.
/// `times` must be sorted and non-empty.
fn next_slot(now: NaiveDateTime, times: &[NaiveTime]) -> NaiveDateTime {
    let today = now.date();
    if let Some(time) = times.iter().find(|time| today.and_time(**time) > now) {
        return today.and_time(*time);
    }
    let tomorrow = today.succ_opt().unwrap_or(today);
    tomorrow.and_time(times[0])
}

/// Launch failures and non-zero exits are logged; the scheduler keeps going.
fn launch(runner: &Path, forwarded: &[String]) {
    info!("launching {}", runner.display());
    match Command::new(runner).args(forwarded).status() {
        Ok(status) if status.success() => info!("run completed"),
        Ok(status) => warn!("relay_run exited with {status}"),
        Err(err) => warn!("failed to launch {}: {err}", runner.display()),
    }
}

#[cfg(test)]
static RELAY_RUN_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);

/// `RELAY_RUN_BIN`, then Cargo's test env var, then the binary sitting next
/// to this one.
fn find_relay_run_executable() -> Result<PathBuf> {
    #[cfg(test)]
    {
        if let Some(path) = RELAY_RUN_STUB.lock().unwrap().clone()
            && path.exists()
        {
            return Ok(path);
        }
    }

    for key in ["RELAY_RUN_BIN", "CARGO_BIN_EXE_relay_run"] {
        if let Ok(value) = env::var(key) {
            let candidate = PathBuf::from(value.trim());
            if !value.trim().is_empty() && candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    let mut sibling = env::current_exe().context("locating relay_scheduler executable")?;
    sibling.set_file_name("relay_run");
    if sibling.exists() {
        return Ok(sibling);
    }

    bail!("relay_run binary not found. Build it with `cargo build --bin relay_run`.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs::File;
    use tempfile::tempdir;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn twice_daily() -> Vec<NaiveTime> {
        vec![
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
        ]
    }

    #[test]
    fn next_slot_picks_later_time_today() {
        assert_eq!(next_slot(at(10, 8, 30), &twice_daily()), at(10, 9, 0));
        assert_eq!(next_slot(at(10, 12, 0), &twice_daily()), at(10, 21, 0));
    }

    #[test]
    fn next_slot_exact_time_moves_on() {
        assert_eq!(next_slot(at(10, 9, 0), &twice_daily()), at(10, 21, 0));
    }

    #[test]
    fn next_slot_rolls_over_midnight_and_month_end() {
        assert_eq!(next_slot(at(10, 22, 15), &twice_daily()), at(11, 9, 0));
        let march_31 = at(31, 23, 0);
        let expected = NaiveDate::from_ymd_opt(2025, 4, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        assert_eq!(next_slot(march_31, &twice_daily()), expected);
    }

    #[test]
    fn forwarded_args_mirror_the_scheduler_flags() {
        let args = SchedulerArgs::try_parse_from([
            "relay_scheduler",
            "--state-root",
            "/srv/relay",
            "--now",
            "--verbose",
        ])
        .unwrap();
        assert!(args.now);
        assert_eq!(args.forwarded(), vec!["--state-root", "/srv/relay", "--verbose"]);
    }

    #[test]
    fn find_relay_run_uses_stub_path() -> Result<()> {
        let temp = tempdir()?;
        let fake = temp.path().join("relay_run");
        File::create(&fake)?;
        *RELAY_RUN_STUB.lock().unwrap() = Some(fake.clone());
        let path = find_relay_run_executable()?;
        assert_eq!(path, fake);
        Ok(())
    }
}
